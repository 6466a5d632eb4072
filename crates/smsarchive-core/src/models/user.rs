use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Account profile as returned by `GET /api/auth/me`.
///
/// Fetched, never edited locally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    #[serde(default)]
    pub id: String,
    pub username: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl UserProfile {
    /// "member since" date for display, if the server sent one
    pub fn member_since(&self) -> Option<String> {
        self.created_at
            .map(|created| created.format("%Y-%m-%d").to_string())
    }
}
