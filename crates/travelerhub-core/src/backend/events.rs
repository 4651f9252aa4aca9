//! Event types delivered by the hosted backend.
//!
//! ## Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  ChangeEvent: row-level change on a subscribed table            │
//! │  ├── Insert: `new` holds the inserted row                       │
//! │  ├── Update: `new` holds the row after, `old` the key columns   │
//! │  └── Delete: `old` holds the removed row (or its key columns)   │
//! │                                                                 │
//! │  PresenceEvent: membership of a presence channel                │
//! │  ├── Status: channel lifecycle (Subscribed, Closed, Error)      │
//! │  ├── Sync: full set of online keys                              │
//! │  ├── Join: one key came online                                  │
//! │  └── Leave: one key went offline                                │
//! │                                                                 │
//! │  AuthEvent: identity lifecycle (sign-in, sign-out, refresh)     │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::fmt;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::types::Session;

/// Kind of row change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeKind::Insert => write!(f, "INSERT"),
            ChangeKind::Update => write!(f, "UPDATE"),
            ChangeKind::Delete => write!(f, "DELETE"),
        }
    }
}

/// Which change kinds a channel listens for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventMask {
    pub insert: bool,
    pub update: bool,
    pub delete: bool,
}

impl EventMask {
    pub const ALL: EventMask = EventMask {
        insert: true,
        update: true,
        delete: true,
    };
    pub const INSERT_ONLY: EventMask = EventMask {
        insert: true,
        update: false,
        delete: false,
    };
    pub const INSERT_DELETE: EventMask = EventMask {
        insert: true,
        update: false,
        delete: true,
    };

    pub fn contains(&self, kind: ChangeKind) -> bool {
        match kind {
            ChangeKind::Insert => self.insert,
            ChangeKind::Update => self.update,
            ChangeKind::Delete => self.delete,
        }
    }
}

/// Row filter of a change channel, `column=eq.value` on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelFilter {
    pub column: String,
    pub value: String,
}

impl ChannelFilter {
    pub fn eq(column: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            value: value.into(),
        }
    }

    /// Whether a row snapshot satisfies the filter
    pub fn matches(&self, row: &Value) -> bool {
        match row.get(&self.column) {
            Some(Value::String(s)) => s == &self.value,
            Some(Value::Number(n)) => n.to_string() == self.value,
            Some(Value::Bool(b)) => b.to_string() == self.value,
            _ => false,
        }
    }
}

impl fmt::Display for ChannelFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}=eq.{}", self.column, self.value)
    }
}

/// What to subscribe to
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelSpec {
    /// Channel name, e.g. `public:messages`
    pub name: String,
    pub table: String,
    pub filter: Option<ChannelFilter>,
    pub events: EventMask,
}

impl ChannelSpec {
    /// Channel over `table` named the way the backend SDK names them
    pub fn table(table: impl Into<String>, events: EventMask) -> Self {
        let table = table.into();
        Self {
            name: format!("public:{}", table),
            table,
            filter: None,
            events,
        }
    }

    pub fn with_filter(mut self, filter: ChannelFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Whether an event on `table` with the given row snapshots is delivered
    pub fn accepts(&self, event: &ChangeEvent) -> bool {
        if event.table != self.table || !self.events.contains(event.kind) {
            return false;
        }
        match &self.filter {
            None => true,
            Some(filter) => event.record().map(|r| filter.matches(r)).unwrap_or(false),
        }
    }
}

/// A single row change
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub table: String,
    pub new: Option<Value>,
    pub old: Option<Value>,
    pub commit_timestamp: DateTime<Utc>,
}

impl ChangeEvent {
    /// The most informative row snapshot: `new` for inserts/updates, `old` for deletes
    pub fn record(&self) -> Option<&Value> {
        match self.kind {
            ChangeKind::Delete => self.old.as_ref(),
            _ => self.new.as_ref().or(self.old.as_ref()),
        }
    }
}

/// Transport-assigned id of an open channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(pub u64);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chan_{}", self.0)
    }
}

/// An open change channel
#[derive(Debug)]
pub struct ChangeFeed {
    pub id: ChannelId,
    pub events: mpsc::UnboundedReceiver<ChangeEvent>,
}

/// Lifecycle status of a channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelStatus {
    Subscribed,
    Closed,
    Error(String),
}

/// Membership changes on a presence channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceEvent {
    Status(ChannelStatus),
    Sync(Vec<String>),
    Join(String),
    Leave(String),
}

/// An open presence channel
#[derive(Debug)]
pub struct PresenceFeed {
    pub id: ChannelId,
    pub events: mpsc::UnboundedReceiver<PresenceEvent>,
}

/// Identity lifecycle transitions reported by the identity provider
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthEventKind {
    SignedIn,
    SignedOut,
    TokenRefreshed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AuthEvent {
    pub kind: AuthEventKind,
    pub session: Option<Session>,
}
