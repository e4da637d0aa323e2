use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

/// Resolved user principal backing an authenticated session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct User {
    /// Stable user identifier.
    pub id: Uuid,
    /// Login name; also the token subject.
    pub username: String,
    /// Deactivated accounts are denied at authentication time.
    pub is_active: bool,
}

/// Wellness-profile context used to personalize the automatic greeting.
///
/// All fields are optional; an empty profile produces the base greeting
/// prompt unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserProfile {
    pub current_mood: Option<String>,
    pub primary_concerns: Option<String>,
    pub coping_strategies: Option<String>,
}

impl UserProfile {
    /// True when no field carries any context worth injecting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.current_mood.is_none()
            && self.primary_concerns.is_none()
            && self.coping_strategies.is_none()
    }
}
