//! Hub configuration

use serde::{Deserialize, Serialize};

/// Tunables for a [`Hub`](crate::Hub)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Presence channel every signed-in traveler joins
    pub presence_channel: String,
    /// Radius used by nearby lookups when the caller has no preference
    pub nearby_radius_meters: f64,
    /// Maximum number of favorites returned by a favorites-nearby lookup
    pub favorites_limit: usize,
    /// Where the federated sign-in flow returns to
    pub oauth_redirect: String,
    /// Which caches write to the key-value store
    pub persist: PersistConfig,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            presence_channel: "presence:global".to_string(),
            nearby_radius_meters: 5000.0,
            favorites_limit: 50,
            oauth_redirect: "travelerhub://auth/callback".to_string(),
            persist: PersistConfig::default(),
        }
    }
}

/// Per-cache persistence switches. All on by default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistConfig {
    pub chat: bool,
    pub posts: bool,
    pub interests: bool,
    pub viewers: bool,
}

impl Default for PersistConfig {
    fn default() -> Self {
        Self {
            chat: true,
            posts: true,
            interests: true,
            viewers: true,
        }
    }
}
