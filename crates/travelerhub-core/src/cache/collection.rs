//! Ordered, key-unique collection with fetch/event reconciliation.
//!
//! A full fetch replaces the collection wholesale while realtime events
//! patch it incrementally. Both can be in flight at once, so a collection
//! tracks fetch epochs:
//!
//! ```text
//! begin_fetch()  ──▶ ticket N, start buffering applied changes
//!   upsert / remove (events)  ──▶ applied now AND buffered
//! finish_fetch(N, snapshot)
//!   ├── N is stale (newer fetch or clear since) ──▶ snapshot dropped
//!   └── N is current ──▶ replace with snapshot, replay buffer in order
//! ```
//!
//! Replaying is safe because every change is idempotent by key.

use std::sync::atomic::{AtomicU64, Ordering};

use super::CacheEntity;

/// Process-wide epoch source so tickets never repeat across collections
static NEXT_EPOCH: AtomicU64 = AtomicU64::new(1);

fn next_epoch() -> u64 {
    NEXT_EPOCH.fetch_add(1, Ordering::Relaxed)
}

/// Where a newly seen entity goes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergePosition {
    /// Oldest first (chronological lists)
    Append,
    /// Newest first (feeds)
    Prepend,
}

/// Proof of an in-flight fetch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchTicket(u64);

#[derive(Debug, Clone)]
enum Change<E: CacheEntity> {
    Upsert(E, MergePosition),
    ReplaceExisting(E),
    Remove(E::Key),
}

/// Ordered entities, unique by [`CacheEntity::key`]
#[derive(Debug, Clone)]
pub struct Collection<E: CacheEntity> {
    items: Vec<E>,
    epoch: u64,
    pending: Option<Vec<Change<E>>>,
}

impl<E: CacheEntity> Default for Collection<E> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            epoch: next_epoch(),
            pending: None,
        }
    }
}

impl<E: CacheEntity> Collection<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a list, keeping the first position and last value of duplicates
    pub fn from_items(items: Vec<E>) -> Self {
        let mut collection = Self::new();
        collection.replace(items);
        collection
    }

    pub fn items(&self) -> &[E] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, key: &E::Key) -> Option<&E> {
        self.items.iter().find(|e| &e.key() == key)
    }

    pub fn contains_key(&self, key: &E::Key) -> bool {
        self.get(key).is_some()
    }

    /// Insert or replace by key.
    ///
    /// An existing entity is replaced in place; a new one goes to `position`.
    /// Returns `true` if the key was new.
    pub fn upsert(&mut self, entity: E, position: MergePosition) -> bool {
        self.record(Change::Upsert(entity.clone(), position));
        self.upsert_raw(entity, position)
    }

    /// Replace an entity only if its key is already present
    pub fn replace_existing(&mut self, entity: E) -> bool {
        self.record(Change::ReplaceExisting(entity.clone()));
        self.replace_existing_raw(entity)
    }

    pub fn remove_key(&mut self, key: &E::Key) -> Option<E> {
        self.record(Change::Remove(key.clone()));
        self.remove_key_raw(key)
    }

    /// Remove every entity matching `predicate`, returning how many went
    pub fn remove_where(&mut self, predicate: impl Fn(&E) -> bool) -> usize {
        let doomed: Vec<E::Key> = self
            .items
            .iter()
            .filter(|e| predicate(e))
            .map(|e| e.key())
            .collect();
        for key in &doomed {
            self.remove_key(key);
        }
        doomed.len()
    }

    /// Replace the whole collection, preserving the given order
    pub fn replace(&mut self, items: Vec<E>) {
        self.items.clear();
        for entity in items {
            self.upsert_raw(entity, MergePosition::Append);
        }
    }

    /// Empty the collection and invalidate any in-flight fetch
    pub fn clear(&mut self) {
        self.items.clear();
        self.epoch = next_epoch();
        self.pending = None;
    }

    /// Start a fetch; changes applied from now on are buffered for replay
    pub fn begin_fetch(&mut self) -> FetchTicket {
        self.epoch = next_epoch();
        self.pending = Some(Vec::new());
        FetchTicket(self.epoch)
    }

    /// Whether `ticket` still belongs to the newest fetch
    pub fn is_current(&self, ticket: FetchTicket) -> bool {
        ticket.0 == self.epoch && self.pending.is_some()
    }

    /// Adopt a fetched snapshot unless the fetch went stale.
    ///
    /// Returns `false` (leaving the collection untouched) for stale tickets.
    pub fn finish_fetch(&mut self, ticket: FetchTicket, snapshot: Vec<E>) -> bool {
        if !self.is_current(ticket) {
            return false;
        }
        let pending = self.pending.take().unwrap_or_default();
        self.replace(snapshot);
        for change in pending {
            match change {
                Change::Upsert(entity, position) => {
                    self.upsert_raw(entity, position);
                }
                Change::ReplaceExisting(entity) => {
                    self.replace_existing_raw(entity);
                }
                Change::Remove(key) => {
                    self.remove_key_raw(&key);
                }
            }
        }
        true
    }

    /// Give up on a failed fetch. Returns whether it was the current one.
    pub fn abandon_fetch(&mut self, ticket: FetchTicket) -> bool {
        if !self.is_current(ticket) {
            return false;
        }
        self.pending = None;
        true
    }

    pub fn into_items(self) -> Vec<E> {
        self.items
    }

    fn record(&mut self, change: Change<E>) {
        if let Some(pending) = self.pending.as_mut() {
            pending.push(change);
        }
    }

    fn upsert_raw(&mut self, entity: E, position: MergePosition) -> bool {
        let key = entity.key();
        match self.items.iter_mut().find(|e| e.key() == key) {
            Some(slot) => {
                *slot = entity;
                false
            }
            None => {
                match position {
                    MergePosition::Append => self.items.push(entity),
                    MergePosition::Prepend => self.items.insert(0, entity),
                }
                true
            }
        }
    }

    fn replace_existing_raw(&mut self, entity: E) -> bool {
        let key = entity.key();
        match self.items.iter_mut().find(|e| e.key() == key) {
            Some(slot) => {
                *slot = entity;
                true
            }
            None => false,
        }
    }

    fn remove_key_raw(&mut self, key: &E::Key) -> Option<E> {
        let index = self.items.iter().position(|e| &e.key() == key)?;
        Some(self.items.remove(index))
    }
}
