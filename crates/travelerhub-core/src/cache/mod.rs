//! Remote-backed, realtime-synchronized entity caches.
//!
//! Every cache holds an ordered collection that is filled by a full fetch
//! and then kept current by change events from one realtime channel:
//!
//! ```text
//! ┌──────────────┐  fetch (select)   ┌─────────────┐
//! │  DataStore   │ ────────────────▶ │             │ ──▶ items()
//! └──────────────┘                   │ Collection  │
//! ┌──────────────┐  insert/update/   │  (unique    │ ──▶ KeyValueStore
//! │  Realtime    │  delete events    │   by key)   │     (optional)
//! │  channel     │ ────────────────▶ │             │
//! └──────────────┘                   └─────────────┘
//! ```
//!
//! [`SyncedCache`] is the generic version, instantiated for posts,
//! favorites and profile views. [`ChatCache`] partitions messages by
//! conversation and [`ProfileCache`] holds profile lookups that have no
//! realtime feed.

use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::backend::{ChannelFilter, EventMask, Query};
use crate::storage::KeyValueStore;
use crate::types::UserId;

mod chat;
mod collection;
mod entities;
mod profiles;
mod synced;

pub use chat::ChatCache;
pub use collection::{Collection, FetchTicket, MergePosition};
pub use entities::{InterestCache, PostCache, ViewerCache};
pub use profiles::ProfileCache;
pub use synced::SyncedCache;

/// What `create` does after a successful insert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreatePolicy {
    /// Run a full fetch; the fetch epoch absorbs the racing insert event
    Refetch,
    /// Do nothing; the realtime insert event merges the row
    AwaitEvent,
}

/// A row type that can live in a [`Collection`]
pub trait CacheEntity: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    type Key: Eq + Hash + Clone + Debug + Send + Sync + 'static;

    /// Backing table
    const TABLE: &'static str;

    fn key(&self) -> Self::Key;

    /// Key of a raw row; delete events may carry only the key columns
    fn key_of_row(row: &Value) -> Option<Self::Key>;
}

/// An entity with a single identity-scoped feed, served by [`SyncedCache`]
pub trait SyncedEntity: CacheEntity {
    /// Name of the persisted snapshot
    const STORAGE_KEY: &'static str;
    /// Column set to the caller's id on create
    const OWNER_COLUMN: &'static str;
    const MERGE_POSITION: MergePosition;
    const EVENTS: EventMask;
    const CREATE_POLICY: CreatePolicy;

    /// The query whose result is the cache content
    fn fetch_query(me: &UserId, now: DateTime<Utc>) -> Query;

    /// Row filter of the realtime channel, if any
    fn channel_filter(_me: &UserId) -> Option<ChannelFilter> {
        None
    }
}

/// Decode rows, skipping (and logging) any that don't fit `E`
pub(crate) fn decode_rows<E: DeserializeOwned>(table: &str, rows: Vec<Value>) -> Vec<E> {
    rows.into_iter()
        .filter_map(|row| match serde_json::from_value(row) {
            Ok(entity) => Some(entity),
            Err(e) => {
                warn!(table, error = %e, "Skipping undecodable row");
                None
            }
        })
        .collect()
}

/// A cache's slot in the local key-value store
#[derive(Clone)]
pub(crate) struct Persisted {
    store: Arc<dyn KeyValueStore>,
    key: &'static str,
    /// Held from snapshot to write, so writes land in snapshot order
    io: Arc<Mutex<()>>,
}

impl Persisted {
    pub(crate) fn new(store: Arc<dyn KeyValueStore>, key: &'static str) -> Self {
        Self {
            store,
            key,
            io: Arc::new(Mutex::new(())),
        }
    }

    pub(crate) fn load<T: DeserializeOwned>(&self) -> Option<T> {
        let raw = match self.store.get(self.key) {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                warn!(key = self.key, error = %e, "Failed to read persisted cache");
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(key = self.key, error = %e, "Ignoring unreadable persisted cache");
                None
            }
        }
    }

    /// Take a snapshot and write it.
    ///
    /// `snapshot` runs under the write lock: a later save always carries
    /// state at least as new as an earlier one. It must not wait on a lock
    /// held by a caller of `save_with`.
    pub(crate) fn save_with<T: Serialize>(&self, snapshot: impl FnOnce() -> T) {
        let _io = self.io.lock();
        let value = snapshot();
        let result = serde_json::to_string(&value)
            .map_err(crate::error::HubError::from)
            .and_then(|raw| self.store.set(self.key, &raw));
        match result {
            Ok(()) => debug!(key = self.key, "Persisted cache"),
            Err(e) => warn!(key = self.key, error = %e, "Failed to persist cache"),
        }
    }

    pub(crate) fn clear(&self) {
        let _io = self.io.lock();
        if let Err(e) = self.store.remove(self.key) {
            warn!(key = self.key, error = %e, "Failed to clear persisted cache");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[test]
    fn test_concurrent_saves_keep_newest_snapshot() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let persisted = Persisted::new(store.clone(), "posts-storage");
        let version = Arc::new(AtomicU64::new(0));

        let writers: Vec<_> = (0..8)
            .map(|_| {
                let persisted = persisted.clone();
                let version = version.clone();
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        version.fetch_add(1, Ordering::SeqCst);
                        persisted.save_with(|| version.load(Ordering::SeqCst));
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }

        assert_eq!(persisted.load::<u64>(), Some(400));
    }

    #[test]
    fn test_clear_removes_snapshot() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let persisted = Persisted::new(store.clone(), "viewers-storage");

        persisted.save_with(|| vec![1, 2, 3]);
        assert_eq!(persisted.load::<Vec<u32>>(), Some(vec![1, 2, 3]));

        persisted.clear();
        assert!(store.get("viewers-storage").unwrap().is_none());
    }
}
