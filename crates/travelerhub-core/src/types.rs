//! Core types for TravelerHub
//!
//! Records mirror the rows of the hosted backend. Cross-references between
//! records are always by id; no record is shared by reference.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod chat;
pub mod profile;
pub mod social;

pub use chat::{Conversation, Message, NewMessage};
pub use profile::{
    AuthProvider, NearbyProfile, NewProfile, Profile, PublicFields, PublicProfile, Theme, Units,
};
pub use social::{Interest, NewInterest, NewPost, NewViewer, Post, PostKind, Viewer};

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            /// Borrow the raw identifier
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

string_id!(
    /// Identifier of an authenticated identity (also the id of its profile)
    UserId
);
string_id!(
    /// Identifier of a two-party conversation
    ConversationId
);
string_id!(
    /// Identifier of a single direct message
    MessageId
);
string_id!(
    /// Identifier of a post (postcard or travelmate request)
    PostId
);

/// The authenticated user record, as issued by the identity provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub email_confirmed_at: Option<DateTime<Utc>>,
}

/// An authenticated session: opaque token plus the identity it belongs to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub access_token: String,
    pub expires_at: DateTime<Utc>,
    pub user: User,
}

impl Session {
    /// Whether the token has passed its expiry at `now`
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// A point on the globe in decimal degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinates {
    /// Mean Earth radius used for distance estimates
    const EARTH_RADIUS_METERS: f64 = 6_371_000.0;

    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Great-circle distance to `other` in meters (haversine)
    pub fn distance_meters(&self, other: &Coordinates) -> f64 {
        let (lat1, lat2) = (self.latitude.to_radians(), other.latitude.to_radians());
        let dlat = (other.latitude - self.latitude).to_radians();
        let dlng = (other.longitude - self.longitude).to_radians();
        let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlng / 2.0).sin().powi(2);
        2.0 * Self::EARTH_RADIUS_METERS * a.sqrt().asin()
    }
}
