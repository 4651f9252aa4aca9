//! Posts, favorites and profile views

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Coordinates, PostId, UserId};

/// What a post is for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PostKind {
    /// An expiring picture-and-words card from the road
    Postcard,
    /// A request for company on a trip
    Travelmate,
}

/// An expiring post owned by one identity.
///
/// Expired posts are filtered out by the backend query, never client-side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Post {
    pub id: PostId,
    pub user_id: UserId,
    #[serde(rename = "type")]
    pub kind: PostKind,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub photo_url: Option<String>,
    #[serde(default)]
    pub location: Option<Coordinates>,
    #[serde(default)]
    pub tags: Option<serde_json::Map<String, serde_json::Value>>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Partial post supplied by the caller; the owner is attached on create
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewPost {
    #[serde(rename = "type")]
    pub kind: PostKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub photo_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<Coordinates>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<serde_json::Map<String, serde_json::Value>>,
    pub expires_at: DateTime<Utc>,
}

impl NewPost {
    /// A postcard that stays visible for `ttl`
    pub fn postcard(description: impl Into<String>, ttl: chrono::Duration) -> Self {
        Self {
            kind: PostKind::Postcard,
            description: Some(description.into()),
            photo_url: None,
            location: None,
            tags: None,
            expires_at: Utc::now() + ttl,
        }
    }
}

/// Directed favorite edge: `profile_id` is interested in `target_profile_id`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interest {
    pub profile_id: UserId,
    pub target_profile_id: UserId,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewInterest {
    pub target_profile_id: UserId,
}

/// Directed, expiring record that `viewer_id` looked at `profile_id`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Viewer {
    pub id: String,
    pub profile_id: UserId,
    pub viewer_id: UserId,
    pub viewed_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewViewer {
    pub profile_id: UserId,
}
