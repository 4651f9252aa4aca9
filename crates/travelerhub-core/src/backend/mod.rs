//! Ports to the hosted backend.
//!
//! The sync layer never talks to the network directly. It consumes three
//! collaborators, each a trait object so the production SDK binding and
//! the in-process [`MemoryBackend`] are interchangeable:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  IdentityProvider   sessions, sign-in/out, auth-state stream    │
//! │  DataStore          filtered select, insert, delete, RPC        │
//! │  RealtimeTransport  change channels and presence channels       │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! All queries are identity-scoped by the backend; the client performs no
//! authorization logic.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::error::HubResult;
use crate::types::{AuthProvider, Session};

mod events;
pub mod memory;
mod query;

pub use events::{
    AuthEvent, AuthEventKind, ChangeEvent, ChangeFeed, ChangeKind, ChannelFilter, ChannelId,
    ChannelSpec, ChannelStatus, EventMask, PresenceEvent, PresenceFeed,
};
pub use memory::{MemoryBackend, MemoryClient};
pub use query::{compare_values, Filter, Order, Query};

/// External identity provider / session store
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Current session, if any
    async fn get_session(&self) -> HubResult<Option<Session>>;

    /// Exchange email and password for a session
    async fn sign_in_with_password(&self, email: &str, password: &str) -> HubResult<Session>;

    /// Run the federated redirect flow.
    ///
    /// Returns `None` when the flow finished without producing a session.
    async fn sign_in_with_oauth(
        &self,
        provider: AuthProvider,
        redirect_to: &str,
    ) -> HubResult<Option<Session>>;

    /// Exchange the refresh token for a new session
    async fn refresh_session(&self) -> HubResult<Option<Session>>;

    /// Revoke the current session
    async fn sign_out(&self) -> HubResult<()>;

    /// Stream of auth-state changes (sign-in, sign-out, token refresh)
    fn auth_events(&self) -> broadcast::Receiver<AuthEvent>;
}

/// Relational data store with row-level filtering and remote procedures
#[async_trait]
pub trait DataStore: Send + Sync {
    async fn select(&self, query: &Query) -> HubResult<Vec<Value>>;

    /// Insert rows into `table`, returning them as stored
    async fn insert(&self, table: &str, rows: Vec<Value>) -> HubResult<Vec<Value>>;

    /// Delete matching rows, returning what was removed
    async fn delete(&self, query: &Query) -> HubResult<Vec<Value>>;

    /// Call a named remote procedure
    async fn rpc(&self, name: &str, params: Value) -> HubResult<Vec<Value>>;
}

/// Realtime change-feed and presence transport
#[async_trait]
pub trait RealtimeTransport: Send + Sync {
    async fn subscribe(&self, spec: ChannelSpec) -> HubResult<ChangeFeed>;

    /// Join a presence channel under `key`; the feed first reports its status
    async fn join_presence(&self, channel: &str, key: &str) -> HubResult<PresenceFeed>;

    /// Announce this connection on a joined presence channel
    async fn track(&self, channel: ChannelId, payload: Value) -> HubResult<()>;

    /// Close a change or presence channel. Closing twice is a no-op.
    fn remove_channel(&self, channel: ChannelId);
}

/// The bundle of collaborators the hub is built from
#[derive(Clone)]
pub struct Backend {
    pub identity: Arc<dyn IdentityProvider>,
    pub data: Arc<dyn DataStore>,
    pub realtime: Arc<dyn RealtimeTransport>,
}

impl Backend {
    pub fn new(
        identity: Arc<dyn IdentityProvider>,
        data: Arc<dyn DataStore>,
        realtime: Arc<dyn RealtimeTransport>,
    ) -> Self {
        Self {
            identity,
            data,
            realtime,
        }
    }

    /// Use one client object for all three ports
    pub fn from_client<C>(client: Arc<C>) -> Self
    where
        C: IdentityProvider + DataStore + RealtimeTransport + 'static,
    {
        Self {
            identity: client.clone(),
            data: client.clone(),
            realtime: client,
        }
    }
}
