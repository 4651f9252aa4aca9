//! Generic identity-scoped cache over one table.

use std::sync::{Arc, Weak};

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::{decode_rows, Collection, CreatePolicy, Persisted, SyncedEntity};
use crate::backend::{Backend, ChangeEvent, ChangeKind, ChannelSpec, DataStore, RealtimeTransport};
use crate::realtime::ChannelSlot;
use crate::session::SessionHolder;
use crate::storage::KeyValueStore;

struct CacheState<E: SyncedEntity> {
    items: Collection<E>,
    loading: bool,
}

pub(super) struct CacheInner<E: SyncedEntity> {
    pub(super) session: SessionHolder,
    pub(super) data: Arc<dyn DataStore>,
    realtime: Arc<dyn RealtimeTransport>,
    state: RwLock<CacheState<E>>,
    channel: ChannelSlot,
    persisted: Option<Persisted>,
    revision: watch::Sender<u64>,
}

/// Collection of `E` kept in step with the backend.
///
/// Cloning is cheap; clones share state.
pub struct SyncedCache<E: SyncedEntity> {
    pub(super) inner: Arc<CacheInner<E>>,
}

impl<E: SyncedEntity> Clone for SyncedCache<E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<E: SyncedEntity> SyncedCache<E> {
    pub fn new(
        session: SessionHolder,
        backend: &Backend,
        store: Option<Arc<dyn KeyValueStore>>,
    ) -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            inner: Arc::new(CacheInner {
                session,
                data: backend.data.clone(),
                realtime: backend.realtime.clone(),
                state: RwLock::new(CacheState {
                    items: Collection::new(),
                    loading: false,
                }),
                channel: ChannelSlot::new(),
                persisted: store.map(|s| Persisted::new(s, E::STORAGE_KEY)),
                revision,
            }),
        }
    }

    /// Restore the last persisted snapshot, if any
    pub fn hydrate(&self) -> usize {
        let Some(persisted) = &self.inner.persisted else {
            return 0;
        };
        let Some(items) = persisted.load::<Vec<E>>() else {
            return 0;
        };
        let count = {
            let mut state = self.inner.state.write();
            state.items.replace(items);
            state.items.len()
        };
        debug!(table = E::TABLE, count, "Hydrated cache");
        self.inner.changed();
        count
    }

    /// Replace the collection with the backend's current rows.
    ///
    /// With no identity this only clears the loading flag. Query errors are
    /// logged and leave the collection unchanged.
    pub async fn fetch(&self) {
        let Some(me) = self.inner.session.user_id() else {
            debug!(table = E::TABLE, "No identity, skipping fetch");
            self.inner.state.write().loading = false;
            return;
        };

        let ticket = {
            let mut state = self.inner.state.write();
            state.loading = true;
            state.items.begin_fetch()
        };

        let query = E::fetch_query(&me, Utc::now());
        match self.inner.data.select(&query).await {
            Ok(rows) => {
                let snapshot = decode_rows::<E>(E::TABLE, rows);
                let adopted = {
                    let mut state = self.inner.state.write();
                    let adopted = state.items.finish_fetch(ticket, snapshot);
                    if adopted {
                        state.loading = false;
                    }
                    adopted
                };
                if adopted {
                    debug!(table = E::TABLE, count = self.len(), "Fetched");
                    self.inner.persist();
                    self.inner.changed();
                } else {
                    debug!(table = E::TABLE, "Discarding stale fetch result");
                }
            }
            Err(e) => {
                warn!(table = E::TABLE, error = %e, "Fetch failed");
                let mut state = self.inner.state.write();
                if state.items.abandon_fetch(ticket) {
                    state.loading = false;
                }
            }
        }
    }

    /// Insert a row owned by the current identity.
    ///
    /// Returns the stored row, or `None` when there is no identity or the
    /// insert failed (both are logged).
    pub async fn create<D: Serialize>(&self, draft: &D) -> Option<E> {
        let Some(me) = self.inner.session.user_id() else {
            warn!(table = E::TABLE, "Create attempted without identity");
            return None;
        };

        let mut row = match serde_json::to_value(draft) {
            Ok(Value::Object(row)) => row,
            Ok(_) => {
                error!(table = E::TABLE, "Draft is not an object");
                return None;
            }
            Err(e) => {
                error!(table = E::TABLE, error = %e, "Failed to encode draft");
                return None;
            }
        };
        row.insert(E::OWNER_COLUMN.to_string(), Value::String(me.to_string()));

        let created = match self.inner.data.insert(E::TABLE, vec![Value::Object(row)]).await {
            Ok(rows) => decode_rows::<E>(E::TABLE, rows).into_iter().next(),
            Err(e) => {
                error!(table = E::TABLE, error = %e, "Insert failed");
                return None;
            }
        };
        info!(table = E::TABLE, user_id = %me, "Created row");

        match E::CREATE_POLICY {
            CreatePolicy::Refetch => self.fetch().await,
            CreatePolicy::AwaitEvent => {}
        }
        created
    }

    /// Idempotent upsert by key
    pub fn add_or_merge(&self, entity: E) {
        self.inner.add_or_merge(entity);
    }

    /// Remove every entity matching `predicate`
    pub fn remove(&self, predicate: impl Fn(&E) -> bool) -> usize {
        let removed = self.inner.state.write().items.remove_where(predicate);
        if removed > 0 {
            self.inner.persist();
            self.inner.changed();
        }
        removed
    }

    pub fn remove_key(&self, key: &E::Key) -> Option<E> {
        self.inner.remove_key(key)
    }

    /// Open the realtime channel. Repeated calls are no-ops.
    ///
    /// Returns whether a channel was opened.
    pub async fn subscribe(&self) -> bool {
        let Some(me) = self.inner.session.user_id() else {
            debug!(table = E::TABLE, "No identity, not subscribing");
            return false;
        };

        let mut spec = ChannelSpec::table(E::TABLE, E::EVENTS);
        if let Some(filter) = E::channel_filter(&me) {
            spec = spec.with_filter(filter);
        }

        let weak: Weak<CacheInner<E>> = Arc::downgrade(&self.inner);
        let handler = move |event: ChangeEvent| {
            if let Some(inner) = weak.upgrade() {
                inner.apply_event(event);
            }
        };

        match self
            .inner
            .channel
            .open_once(self.inner.realtime.clone(), spec, handler)
            .await
        {
            Ok(opened) => opened,
            Err(e) => {
                warn!(table = E::TABLE, error = %e, "Subscribe failed");
                false
            }
        }
    }

    /// Close the realtime channel. Returns whether one was open.
    pub async fn unsubscribe(&self) -> bool {
        self.inner.channel.close().await
    }

    /// Close the channel, empty the collection and forget the persisted copy
    pub async fn reset(&self) {
        self.inner.channel.close().await;
        {
            let mut state = self.inner.state.write();
            state.items.clear();
            state.loading = false;
        }
        if let Some(persisted) = &self.inner.persisted {
            persisted.clear();
        }
        debug!(table = E::TABLE, "Reset");
        self.inner.changed();
    }

    pub fn items(&self) -> Vec<E> {
        self.inner.state.read().items.items().to_vec()
    }

    pub fn get(&self, key: &E::Key) -> Option<E> {
        self.inner.state.read().items.get(key).cloned()
    }

    pub fn contains_key(&self, key: &E::Key) -> bool {
        self.inner.state.read().items.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.inner.state.read().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_loading(&self) -> bool {
        self.inner.state.read().loading
    }

    pub async fn is_subscribed(&self) -> bool {
        self.inner.channel.is_open().await
    }

    /// Revision counter bumped on every change to the collection
    pub fn watch(&self) -> watch::Receiver<u64> {
        self.inner.revision.subscribe()
    }
}

impl<E: SyncedEntity> CacheInner<E> {
    fn apply_event(&self, event: ChangeEvent) {
        match event.kind {
            ChangeKind::Insert => match decode_one::<E>(event.new) {
                Some(entity) => self.add_or_merge(entity),
                None => warn!(table = E::TABLE, "Insert event without a usable row"),
            },
            ChangeKind::Update => match decode_one::<E>(event.new) {
                Some(entity) => {
                    let replaced = self.state.write().items.replace_existing(entity);
                    if replaced {
                        self.persist();
                        self.changed();
                    }
                }
                None => warn!(table = E::TABLE, "Update event without a usable row"),
            },
            ChangeKind::Delete => match event.old.as_ref().and_then(E::key_of_row) {
                Some(key) => {
                    self.remove_key(&key);
                }
                None => warn!(table = E::TABLE, "Delete event without a key"),
            },
        }
    }

    fn add_or_merge(&self, entity: E) {
        self.state.write().items.upsert(entity, E::MERGE_POSITION);
        self.persist();
        self.changed();
    }

    fn remove_key(&self, key: &E::Key) -> Option<E> {
        let removed = self.state.write().items.remove_key(key);
        if removed.is_some() {
            self.persist();
            self.changed();
        }
        removed
    }

    fn persist(&self) {
        if let Some(persisted) = &self.persisted {
            persisted.save_with(|| self.state.read().items.items().to_vec());
        }
    }

    fn changed(&self) {
        self.revision.send_modify(|r| *r += 1);
    }
}

fn decode_one<E: SyncedEntity>(row: Option<Value>) -> Option<E> {
    decode_rows::<E>(E::TABLE, row.into_iter().collect())
        .into_iter()
        .next()
}
