//! Bearer-credential validation for gateway sessions.
//!
//! Credentials are compact signed tokens minted by the auth service that
//! shares `auth.shared_secret` with this gateway:
//! `base64url(claims_json) . base64url(hmac_sha256(claims_segment))`.
//! Validation checks the signature, then expiry, then resolves the subject
//! against the user store. Callers must surface every failure mode as the
//! same generic denial; the distinction below exists for logs only.

use std::fmt;

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use sqlx::PgPool;
use thiserror::Error;
use tracing::instrument;
use uuid::Uuid;

use shared::models::user::User;

type HmacSha256 = Hmac<Sha256>;

/// Why a credential was rejected. Never sent to the client verbatim.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("malformed token")]
    Malformed,
    #[error("invalid token signature")]
    BadSignature,
    #[error("token expired")]
    Expired,
    #[error("unknown subject")]
    UnknownSubject,
    #[error("account deactivated")]
    Inactive,
    #[error("verifier unavailable")]
    Verifier,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, Serialize, Deserialize)]
struct TokenClaims {
    sub: String,
    exp: i64,
}

/// Mints a signed token for `subject`, valid for `ttl`. Used by the `token`
/// CLI subcommand and by tests; production tokens come from the auth service.
///
/// # Errors
/// Fails only when the signer cannot be constructed from the secret.
pub fn issue(secret: &str, subject: &str, ttl: Duration) -> Result<String, AuthError> {
    let claims = TokenClaims {
        sub: subject.to_string(),
        exp: (Utc::now() + ttl).timestamp(),
    };
    let payload = serde_json::to_vec(&claims).map_err(|_| AuthError::Malformed)?;
    let segment = URL_SAFE_NO_PAD.encode(payload);

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| AuthError::Verifier)?;
    mac.update(segment.as_bytes());
    let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());

    Ok(format!("{segment}.{signature}"))
}

/// Checks signature and expiry without touching the user store.
fn verify_claims(secret: &str, token: &str, now: DateTime<Utc>) -> Result<TokenClaims, AuthError> {
    let (segment, signature) = token.split_once('.').ok_or(AuthError::Malformed)?;
    let signature = URL_SAFE_NO_PAD
        .decode(signature)
        .map_err(|_| AuthError::Malformed)?;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| AuthError::Verifier)?;
    mac.update(segment.as_bytes());
    mac.verify_slice(&signature)
        .map_err(|_| AuthError::BadSignature)?;

    let payload = URL_SAFE_NO_PAD
        .decode(segment)
        .map_err(|_| AuthError::Malformed)?;
    let claims: TokenClaims =
        serde_json::from_slice(&payload).map_err(|_| AuthError::Malformed)?;

    if claims.exp < now.timestamp() {
        return Err(AuthError::Expired);
    }
    Ok(claims)
}

/// Resolves bearer credentials to user identities.
#[derive(Clone)]
pub struct TokenValidator {
    secret: String,
    pool: PgPool,
}

impl fmt::Debug for TokenValidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenValidator").finish()
    }
}

impl TokenValidator {
    pub fn new(secret: impl Into<String>, pool: PgPool) -> Self {
        Self {
            secret: secret.into(),
            pool,
        }
    }

    /// Validates `token` and resolves its subject against the user store.
    ///
    /// # Errors
    /// Returns the specific failure mode for logging; callers collapse all of
    /// them into one generic denial.
    #[instrument(name = "auth.validate", skip(self, token), err)]
    pub async fn validate(&self, token: &str) -> Result<User, AuthError> {
        let claims = verify_claims(&self.secret, token, Utc::now())?;

        #[derive(sqlx::FromRow)]
        struct UserRow {
            id: Uuid,
            username: String,
            is_active: bool,
        }

        let row = sqlx::query_as::<_, UserRow>(
            "SELECT id, username, is_active FROM users WHERE username = $1",
        )
        .bind(&claims.sub)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(AuthError::UnknownSubject)?;

        if !row.is_active {
            return Err(AuthError::Inactive);
        }

        Ok(User {
            id: row.id,
            username: row.username,
            is_active: row.is_active,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "test-secret";

    #[test]
    fn issued_token_verifies() {
        let token = issue(SECRET, "ada", Duration::minutes(5)).unwrap();
        let claims = verify_claims(SECRET, &token, Utc::now()).unwrap();
        assert_eq!(claims.sub, "ada");
    }

    #[test]
    fn expired_token_is_rejected() {
        let token = issue(SECRET, "ada", Duration::minutes(-1)).unwrap();
        assert!(matches!(
            verify_claims(SECRET, &token, Utc::now()),
            Err(AuthError::Expired)
        ));
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let token = issue(SECRET, "ada", Duration::minutes(5)).unwrap();
        assert!(matches!(
            verify_claims("another-secret", &token, Utc::now()),
            Err(AuthError::BadSignature)
        ));
    }

    #[test]
    fn tampered_payload_is_rejected() {
        let token = issue(SECRET, "ada", Duration::minutes(5)).unwrap();
        let (_, signature) = token.split_once('.').unwrap();
        let forged_claims = TokenClaims {
            sub: "mallory".into(),
            exp: (Utc::now() + Duration::minutes(5)).timestamp(),
        };
        let forged_segment =
            URL_SAFE_NO_PAD.encode(serde_json::to_vec(&forged_claims).unwrap());
        let forged = format!("{forged_segment}.{signature}");

        assert!(matches!(
            verify_claims(SECRET, &forged, Utc::now()),
            Err(AuthError::BadSignature)
        ));
    }

    #[test]
    fn garbage_is_malformed() {
        for garbage in ["", "abc", "a.b.c", "not base64.%%%"] {
            assert!(matches!(
                verify_claims(SECRET, garbage, Utc::now()),
                Err(AuthError::Malformed | AuthError::BadSignature)
            ));
        }
    }
}
