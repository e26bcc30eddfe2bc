//! User-related models

use serde::{Deserialize, Serialize};

/// Relay-wide user identifier.
pub type UserId = String;

/// Public profile shown on call screens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub id: UserId,
    pub display_name: String,
    #[serde(rename = "photoURL")]
    pub photo_url: Option<String>,
}

impl UserProfile {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            photo_url: None,
        }
    }

    /// Placeholder used when no profile document exists for a user.
    pub fn unknown(id: &str) -> Self {
        Self::new(id, id)
    }
}
