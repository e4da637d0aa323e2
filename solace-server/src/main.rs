//! Main entry point for the Solace gateway CLI.

use std::{io, path::PathBuf};

use anyhow::anyhow;
use chrono::Duration;
use clap::{CommandFactory, Parser, Subcommand};
use dotenv::dotenv;

use shared::config::server::Config;

/// Solace gateway CLI
#[derive(Parser)]
#[command(name = "solace")]
#[command(about = "Streaming chat gateway for the Solace wellness companion", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway server
    Serve {
        /// Port to bind; overrides configuration when given
        #[arg(long, short)]
        port: Option<u16>,

        /// Path to a configuration file (YAML or JSON)
        #[arg(long, short)]
        config: Option<PathBuf>,
    },

    /// Mint a signed development token for a user
    Token {
        /// Subject the token is issued for
        username: String,

        /// Token lifetime; defaults to the configured TTL
        #[arg(long)]
        ttl_minutes: Option<i64>,

        /// Path to a configuration file (YAML or JSON)
        #[arg(long, short)]
        config: Option<PathBuf>,
    },

    /// Generate shell completion scripts for the CLI
    Completion {
        /// Shell to generate for (bash, zsh, fish, powershell)
        #[arg(long, short)]
        shell: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { port, config } => {
            let config = Config::load_config(config, port)?;
            server::run(config).await?;
        }
        Commands::Token {
            username,
            ttl_minutes,
            config,
        } => {
            let config = Config::load_config(config, None)?;
            let ttl = Duration::minutes(ttl_minutes.unwrap_or(config.auth.token_ttl_minutes));
            let token = server::auth::token::issue(&config.auth.shared_secret, &username, ttl)?;
            println!("{token}");
        }
        Commands::Completion { shell } => {
            let shell = shell
                .parse::<clap_complete::Shell>()
                .map_err(|_| anyhow!("invalid shell type '{shell}'"))?;
            clap_complete::generate(shell, &mut Cli::command(), "solace", &mut io::stdout());
        }
    }

    Ok(())
}
