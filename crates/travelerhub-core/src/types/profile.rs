//! Traveler profiles
//!
//! One profile exists per identity, created once at registration. The
//! profile id equals the owning identity's [`UserId`].

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use super::{Coordinates, UserId};

/// Display theme preference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
    Light,
    Dark,
    #[default]
    Auto,
}

/// Distance units preference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Units {
    #[default]
    Metric,
    Imperial,
}

/// How the identity registered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthProvider {
    Email,
    Google,
}

impl std::fmt::Display for AuthProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthProvider::Email => write!(f, "email"),
            AuthProvider::Google => write!(f, "google"),
        }
    }
}

/// The full profile row, visible only to its owner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub id: UserId,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(flatten)]
    pub public: PublicFields,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Fields shared between [`Profile`] and [`PublicProfile`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublicFields {
    #[serde(default)]
    pub nickname: Option<String>,
    #[serde(default)]
    pub avatar_urls: Vec<String>,
    #[serde(default)]
    pub last_location: Option<Coordinates>,
    #[serde(default)]
    pub last_online: Option<DateTime<Utc>>,
    #[serde(default)]
    pub settings_show_age: bool,
    #[serde(default)]
    pub settings_theme: Theme,
    #[serde(default)]
    pub settings_show_distance: bool,
    #[serde(default)]
    pub settings_units: Units,
    pub provider: AuthProvider,
    #[serde(default)]
    pub email_verified: bool,
    #[serde(default)]
    pub tags: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub birth_date: Option<NaiveDate>,
    #[serde(default)]
    pub bio: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// A profile as other travelers see it (no email, no deletion marker)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublicProfile {
    pub id: UserId,
    #[serde(flatten)]
    pub public: PublicFields,
}

/// A ranked result of the nearby / favorites-nearby procedures
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NearbyProfile {
    #[serde(flatten)]
    pub profile: PublicProfile,
    #[serde(default)]
    pub distance_meters: Option<f64>,
}

/// Registration input; identity-derived columns are attached on create
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewProfile {
    pub nickname: String,
    pub birth_date: NaiveDate,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bio: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_location: Option<Coordinates>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<serde_json::Map<String, serde_json::Value>>,
    pub provider: AuthProvider,
}
