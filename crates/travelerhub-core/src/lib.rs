//! TravelerHub Core Library
//!
//! Realtime-synchronized client cache for a travelers' social app.
//!
//! ## Overview
//!
//! TravelerHub keeps local, observable collections (messages, posts,
//! favorites, profile views) consistent with a hosted relational backend.
//! Each collection is filled by an identity-scoped query and then patched
//! by row-level change events from a realtime channel. A presence tracker
//! keeps the set of online travelers, and a session holder owns the
//! authenticated identity.
//!
//! ## Core Principles
//!
//! - **Backend-scoped**: every query is filtered by the backend; no
//!   authorization happens on the client
//! - **Idempotent merges**: every collection is unique by key, so replayed
//!   or duplicated events never duplicate rows
//! - **Deterministic teardown**: realtime channels are scoped handles that
//!   close when reset or dropped
//!
//! ## Quick Start
//!
//! ```ignore
//! use travelerhub_core::{Backend, Hub, HubConfig, MemoryBackend};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = MemoryBackend::new();
//!     server.register("ana@example.com", "secret")?;
//!
//!     let hub = Hub::new(Backend::from_client(server.connect()), None, HubConfig::default());
//!     hub.start().await;
//!     hub.sign_in("ana@example.com", "secret").await?;
//!
//!     hub.subscribe_all().await;
//!     hub.fetch_all().await;
//!     for post in hub.posts().items() {
//!         println!("{}: {:?}", post.user_id, post.description);
//!     }
//!
//!     hub.sign_out().await;
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod cache;
pub mod config;
pub mod error;
pub mod hub;
pub mod realtime;
pub mod session;
pub mod storage;
pub mod types;

// Re-exports
pub use backend::{
    AuthEvent, AuthEventKind, Backend, ChangeEvent, ChangeKind, ChannelSpec, DataStore,
    IdentityProvider, MemoryBackend, MemoryClient, Query, RealtimeTransport,
};
pub use cache::{
    CacheEntity, ChatCache, Collection, CreatePolicy, InterestCache, MergePosition, PostCache,
    ProfileCache, SyncedCache, SyncedEntity, ViewerCache,
};
pub use config::{HubConfig, PersistConfig};
pub use error::{HubError, HubResult};
pub use hub::Hub;
pub use realtime::{ChannelSlot, PresenceTracker, Subscription};
pub use session::{SessionHolder, SessionState};
pub use storage::{KeyValueStore, MemoryStore, RedbStore};
pub use types::*;
