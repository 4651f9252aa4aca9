//! In-process stand-in for the hosted backend.
//!
//! [`MemoryBackend`] holds the shared server state (tables, accounts, open
//! channels). Each app instance talks to it through its own
//! [`MemoryClient`], which carries that instance's auth session and
//! implements all three backend ports.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  MemoryBackend (shared)                                         │
//! │  ├── tables: HashMap<table, Vec<row>>                           │
//! │  ├── accounts: HashMap<email, Account>                          │
//! │  ├── channels: HashMap<ChannelId, ChangeSubscriber>             │
//! │  │   └── every write publishes to matching channels             │
//! │  └── presence: HashMap<channel name, members>                   │
//! │                                                                 │
//! │  MemoryClient (one per app instance)                            │
//! │  ├── session: Option<Session>                                   │
//! │  └── auth_tx: broadcast::Sender<AuthEvent>                      │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Server-side behavior reproduced here: id/timestamp defaults on insert,
//! implicit conversation creation on the first message, the
//! `my_conversations` view, participant-only visibility of messages and
//! conversations, and the two ranking procedures.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Map, Value};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info};
use ulid::Ulid;

use super::{
    AuthEvent, AuthEventKind, ChangeEvent, ChangeFeed, ChangeKind, ChannelId, ChannelSpec,
    ChannelStatus, DataStore, IdentityProvider, PresenceEvent, PresenceFeed, Query,
    RealtimeTransport,
};
use crate::error::{HubError, HubResult};
use crate::types::{AuthProvider, Coordinates, Session, User, UserId};

/// Lifetime of an issued access token
const SESSION_TTL_MINUTES: i64 = 60;

/// Lifetime of a profile-view record
const VIEWER_TTL_HOURS: i64 = 24;

/// Capacity of each client's auth event channel
const AUTH_CHANNEL_CAPACITY: usize = 32;

/// Default radius of `nearby_profiles` when the caller omits it
const DEFAULT_NEARBY_RADIUS_METERS: f64 = 5000.0;

struct Account {
    user: User,
    password: Option<String>,
    providers: Vec<AuthProvider>,
}

struct ChangeSubscriber {
    spec: ChannelSpec,
    viewer: Option<UserId>,
    tx: mpsc::UnboundedSender<ChangeEvent>,
}

struct PresenceMember {
    room: String,
    key: String,
    tracked: bool,
    tx: mpsc::UnboundedSender<PresenceEvent>,
}

#[derive(Default)]
struct Database {
    tables: HashMap<String, Vec<Value>>,
    accounts: HashMap<String, Account>,
}

struct ServerState {
    db: Mutex<Database>,
    channels: Mutex<HashMap<ChannelId, ChangeSubscriber>>,
    presence: Mutex<HashMap<ChannelId, PresenceMember>>,
    next_channel: AtomicU64,
}

/// Shared in-process backend
#[derive(Clone)]
pub struct MemoryBackend {
    state: Arc<ServerState>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            state: Arc::new(ServerState {
                db: Mutex::new(Database::default()),
                channels: Mutex::new(HashMap::new()),
                presence: Mutex::new(HashMap::new()),
                next_channel: AtomicU64::new(1),
            }),
        }
    }

    /// Open a new client connection with no session
    pub fn connect(&self) -> Arc<MemoryClient> {
        let (auth_tx, _) = broadcast::channel(AUTH_CHANNEL_CAPACITY);
        Arc::new(MemoryClient {
            server: self.clone(),
            session: RwLock::new(None),
            oauth_email: RwLock::new(None),
            auth_tx,
        })
    }

    /// Create an email/password account
    pub fn register(&self, email: &str, password: &str) -> HubResult<User> {
        self.create_account(email, Some(password.to_string()), AuthProvider::Email)
    }

    /// Create (or link) an account reachable through a federated provider
    pub fn register_oauth(&self, provider: AuthProvider, email: &str) -> HubResult<User> {
        let mut db = self.state.db.lock();
        if let Some(account) = db.accounts.get_mut(email) {
            if !account.providers.contains(&provider) {
                account.providers.push(provider);
            }
            return Ok(account.user.clone());
        }
        drop(db);
        self.create_account(email, None, provider)
    }

    fn create_account(
        &self,
        email: &str,
        password: Option<String>,
        provider: AuthProvider,
    ) -> HubResult<User> {
        let mut db = self.state.db.lock();
        if db.accounts.contains_key(email) {
            return Err(HubError::Auth(format!("User already registered: {}", email)));
        }
        let user = User {
            id: UserId(new_row_id()),
            email: Some(email.to_string()),
            email_confirmed_at: Some(Utc::now()),
        };
        db.accounts.insert(
            email.to_string(),
            Account {
                user: user.clone(),
                password,
                providers: vec![provider],
            },
        );
        info!(user_id = %user.id, "Registered account");
        Ok(user)
    }

    /// Snapshot of a table's rows in storage order
    pub fn rows(&self, table: &str) -> Vec<Value> {
        self.state
            .db
            .lock()
            .tables
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    /// Insert rows as the service role: no session, no ownership checks
    pub fn seed(&self, table: &str, rows: Vec<Value>) -> HubResult<Vec<Value>> {
        self.insert_rows(None, table, rows)
    }

    /// Update matching rows as the service role, publishing update events
    pub fn update_where(&self, query: &Query, patch: Value) -> HubResult<Vec<Value>> {
        let patch = match patch {
            Value::Object(map) => map,
            _ => return Err(HubError::Write("patch must be an object".to_string())),
        };
        let mut events = Vec::new();
        let mut updated = Vec::new();
        {
            let mut db = self.state.db.lock();
            let rows = db.tables.entry(query.table.clone()).or_default();
            for row in rows.iter_mut().filter(|r| query.matches(r)) {
                let old = row.clone();
                if let Value::Object(obj) = row {
                    for (k, v) in &patch {
                        obj.insert(k.clone(), v.clone());
                    }
                }
                events.push(change(ChangeKind::Update, &query.table, Some(row.clone()), Some(old)));
                updated.push(row.clone());
            }
        }
        self.publish(events);
        Ok(updated)
    }

    /// Delete matching rows as the service role, publishing delete events
    pub fn delete_where(&self, query: &Query) -> HubResult<Vec<Value>> {
        self.delete_rows(None, query)
    }

    /// Number of open change channels
    pub fn open_channel_count(&self) -> usize {
        self.state.channels.lock().len()
    }

    /// Number of open change channels on `table`
    pub fn channels_on(&self, table: &str) -> usize {
        self.state
            .channels
            .lock()
            .values()
            .filter(|c| c.spec.table == table)
            .count()
    }

    /// Keys currently tracked on a presence channel
    pub fn presence_keys(&self, channel: &str) -> Vec<String> {
        tracked_keys(&self.state.presence.lock(), channel)
    }

    fn next_channel_id(&self) -> ChannelId {
        ChannelId(self.state.next_channel.fetch_add(1, Ordering::SeqCst))
    }

    fn select_rows(&self, caller: Option<&UserId>, query: &Query) -> HubResult<Vec<Value>> {
        let db = self.state.db.lock();
        let view_rows: Vec<Value> = if query.table == "my_conversations" {
            let me = caller.ok_or(HubError::NotAuthenticated)?;
            db.tables
                .get("conversations")
                .map(|rows| {
                    rows.iter()
                        .filter(|r| is_participant(r, "user_a", "user_b", me))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default()
        } else {
            let table = query.table.as_str();
            db.tables
                .get(table)
                .map(|rows| {
                    rows.iter()
                        .filter(|r| row_visible(table, r, caller))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default()
        };
        Ok(query.apply(&view_rows))
    }

    fn insert_rows(
        &self,
        caller: Option<&UserId>,
        table: &str,
        rows: Vec<Value>,
    ) -> HubResult<Vec<Value>> {
        let now = Utc::now();
        let mut events = Vec::new();
        let mut inserted = Vec::new();
        {
            let mut db = self.state.db.lock();
            for row in rows {
                let mut obj = match row {
                    Value::Object(obj) => obj,
                    other => {
                        return Err(HubError::Write(format!("row is not an object: {}", other)))
                    }
                };
                apply_defaults(table, &mut obj, now);
                check_row(&db, caller, table, &obj)?;

                if table == "messages" {
                    events.extend(attach_conversation(&mut db, &mut obj, now)?);
                }

                let row = Value::Object(obj);
                db.tables.entry(table.to_string()).or_default().push(row.clone());
                events.push(change(ChangeKind::Insert, table, Some(row.clone()), None));
                inserted.push(row);
            }
        }
        debug!(table, count = inserted.len(), "Inserted rows");
        self.publish(events);
        Ok(inserted)
    }

    fn delete_rows(&self, caller: Option<&UserId>, query: &Query) -> HubResult<Vec<Value>> {
        let mut removed = Vec::new();
        {
            let mut db = self.state.db.lock();
            let table = query.table.as_str();
            if let Some(rows) = db.tables.get_mut(table) {
                rows.retain(|r| {
                    let hit = query.matches(r) && (caller.is_none() || row_visible(table, r, caller));
                    if hit {
                        removed.push(r.clone());
                    }
                    !hit
                });
            }
        }
        let events = removed
            .iter()
            .map(|r| change(ChangeKind::Delete, &query.table, None, Some(r.clone())))
            .collect();
        self.publish(events);
        Ok(removed)
    }

    fn publish(&self, events: Vec<ChangeEvent>) {
        if events.is_empty() {
            return;
        }
        let mut channels = self.state.channels.lock();
        channels.retain(|id, sub| {
            for event in &events {
                let visible = event
                    .record()
                    .map(|r| row_visible(&event.table, r, sub.viewer.as_ref()))
                    .unwrap_or(false);
                if sub.spec.accepts(event) && visible && sub.tx.send(event.clone()).is_err() {
                    debug!(channel = %id, "Dropping channel with closed receiver");
                    return false;
                }
            }
            true
        });
    }

    fn call_rpc(&self, caller: Option<&UserId>, name: &str, params: &Value) -> HubResult<Vec<Value>> {
        let db = self.state.db.lock();
        let profiles = db.tables.get("profiles").cloned().unwrap_or_default();
        match name {
            "nearby_profiles" => {
                let origin = coordinates_param(params, "user_lat", "user_lng").ok_or_else(|| {
                    HubError::Query("nearby_profiles requires user_lat and user_lng".to_string())
                })?;
                let radius = params
                    .get("radius_meters")
                    .and_then(Value::as_f64)
                    .unwrap_or(DEFAULT_NEARBY_RADIUS_METERS);
                let mut ranked: Vec<(f64, Value)> = profiles
                    .iter()
                    .filter(|p| p.get("deleted_at").map(Value::is_null).unwrap_or(true))
                    .filter(|p| caller.map(|me| p["id"] != me.as_str()).unwrap_or(true))
                    .filter_map(|p| {
                        let loc = row_location(p)?;
                        let d = origin.distance_meters(&loc);
                        (d <= radius).then(|| (d, public_row(p, Some(d))))
                    })
                    .collect();
                ranked.sort_by(|a, b| a.0.total_cmp(&b.0));
                Ok(ranked.into_iter().map(|(_, row)| row).collect())
            }
            "get_favorites_nearby" => {
                let profile_id = params
                    .get("p_profile_id")
                    .and_then(Value::as_str)
                    .ok_or_else(|| HubError::Query("p_profile_id is required".to_string()))?;
                let origin = coordinates_param(params, "p_lat", "p_lng");
                let limit = params
                    .get("p_limit")
                    .and_then(Value::as_u64)
                    .map(|l| l as usize)
                    .unwrap_or(usize::MAX);
                let targets: Vec<&str> = db
                    .tables
                    .get("profile_interests")
                    .map(|rows| {
                        rows.iter()
                            .filter(|r| r["profile_id"] == profile_id)
                            .filter_map(|r| r["target_profile_id"].as_str())
                            .collect()
                    })
                    .unwrap_or_default();
                let mut ranked: Vec<(Option<f64>, Value)> = profiles
                    .iter()
                    .filter(|p| p["id"].as_str().map(|id| targets.contains(&id)).unwrap_or(false))
                    .map(|p| {
                        let d = origin
                            .as_ref()
                            .and_then(|o| row_location(p).map(|loc| o.distance_meters(&loc)));
                        (d, public_row(p, d))
                    })
                    .collect();
                ranked.sort_by(|a, b| match (a.0, b.0) {
                    (Some(x), Some(y)) => x.total_cmp(&y),
                    (Some(_), None) => std::cmp::Ordering::Less,
                    (None, Some(_)) => std::cmp::Ordering::Greater,
                    (None, None) => std::cmp::Ordering::Equal,
                });
                ranked.truncate(limit);
                Ok(ranked.into_iter().map(|(_, row)| row).collect())
            }
            other => Err(HubError::Query(format!(
                "Could not find the function public.{}",
                other
            ))),
        }
    }

    fn join_room(&self, room: &str, key: &str) -> PresenceFeed {
        let id = self.next_channel_id();
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(PresenceEvent::Status(ChannelStatus::Subscribed));
        self.state.presence.lock().insert(
            id,
            PresenceMember {
                room: room.to_string(),
                key: key.to_string(),
                tracked: false,
                tx,
            },
        );
        debug!(channel = %id, room, key, "Joined presence channel");
        PresenceFeed { id, events: rx }
    }

    fn track_member(&self, id: ChannelId) -> HubResult<()> {
        let mut presence = self.state.presence.lock();
        let (room, key) = match presence.get_mut(&id) {
            Some(member) => {
                member.tracked = true;
                (member.room.clone(), member.key.clone())
            }
            None => return Err(HubError::Channel(format!("{} is not a presence channel", id))),
        };
        let keys = tracked_keys(&presence, &room);
        for member in presence.values().filter(|m| m.room == room) {
            let _ = member.tx.send(PresenceEvent::Join(key.clone()));
            let _ = member.tx.send(PresenceEvent::Sync(keys.clone()));
        }
        Ok(())
    }

    fn close_channel(&self, id: ChannelId) {
        if self.state.channels.lock().remove(&id).is_some() {
            debug!(channel = %id, "Closed change channel");
            return;
        }
        let mut presence = self.state.presence.lock();
        if let Some(member) = presence.remove(&id) {
            debug!(channel = %id, key = %member.key, "Left presence channel");
            if !member.tracked {
                return;
            }
            let keys = tracked_keys(&presence, &member.room);
            let still_online = keys.contains(&member.key);
            for other in presence.values().filter(|m| m.room == member.room) {
                if !still_online {
                    let _ = other.tx.send(PresenceEvent::Leave(member.key.clone()));
                }
                let _ = other.tx.send(PresenceEvent::Sync(keys.clone()));
            }
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// One app instance's connection to a [`MemoryBackend`]
pub struct MemoryClient {
    server: MemoryBackend,
    session: RwLock<Option<Session>>,
    oauth_email: RwLock<Option<String>>,
    auth_tx: broadcast::Sender<AuthEvent>,
}

impl MemoryClient {
    /// The server this client is connected to
    pub fn server(&self) -> &MemoryBackend {
        &self.server
    }

    /// Choose the account the next federated sign-in will complete as.
    ///
    /// With no account chosen the flow ends without a session, as when the
    /// user dismisses the browser.
    pub fn complete_oauth_as(&self, email: Option<&str>) {
        *self.oauth_email.write() = email.map(str::to_string);
    }

    /// Drop the session as if it was revoked on another device
    pub fn expire_session(&self) {
        if self.session.write().take().is_some() {
            let _ = self.auth_tx.send(AuthEvent {
                kind: AuthEventKind::SignedOut,
                session: None,
            });
        }
    }

    fn caller(&self) -> Option<UserId> {
        self.session.read().as_ref().map(|s| s.user.id.clone())
    }

    fn issue_session(&self, user: User, kind: AuthEventKind) -> Session {
        let session = Session {
            access_token: Ulid::new().to_string(),
            expires_at: Utc::now() + Duration::minutes(SESSION_TTL_MINUTES),
            user,
        };
        *self.session.write() = Some(session.clone());
        let _ = self.auth_tx.send(AuthEvent {
            kind,
            session: Some(session.clone()),
        });
        session
    }
}

#[async_trait]
impl IdentityProvider for MemoryClient {
    async fn get_session(&self) -> HubResult<Option<Session>> {
        let now = Utc::now();
        Ok(self
            .session
            .read()
            .as_ref()
            .filter(|s| !s.is_expired_at(now))
            .cloned())
    }

    async fn sign_in_with_password(&self, email: &str, password: &str) -> HubResult<Session> {
        let user = {
            let db = self.server.state.db.lock();
            match db.accounts.get(email) {
                Some(account) if account.password.as_deref() == Some(password) => {
                    account.user.clone()
                }
                _ => return Err(HubError::Auth("Invalid login credentials".to_string())),
            }
        };
        Ok(self.issue_session(user, AuthEventKind::SignedIn))
    }

    async fn sign_in_with_oauth(
        &self,
        provider: AuthProvider,
        redirect_to: &str,
    ) -> HubResult<Option<Session>> {
        debug!(%provider, redirect_to, "Starting federated sign-in");
        let email = match self.oauth_email.read().clone() {
            Some(email) => email,
            None => return Ok(None),
        };
        let user = {
            let db = self.server.state.db.lock();
            match db.accounts.get(&email) {
                Some(account) if account.providers.contains(&provider) => account.user.clone(),
                _ => {
                    return Err(HubError::Auth(format!(
                        "No {} identity linked to {}",
                        provider, email
                    )))
                }
            }
        };
        Ok(Some(self.issue_session(user, AuthEventKind::SignedIn)))
    }

    async fn refresh_session(&self) -> HubResult<Option<Session>> {
        let user = match self.session.read().as_ref() {
            Some(session) => session.user.clone(),
            None => return Ok(None),
        };
        Ok(Some(self.issue_session(user, AuthEventKind::TokenRefreshed)))
    }

    async fn sign_out(&self) -> HubResult<()> {
        self.session.write().take();
        let _ = self.auth_tx.send(AuthEvent {
            kind: AuthEventKind::SignedOut,
            session: None,
        });
        Ok(())
    }

    fn auth_events(&self) -> broadcast::Receiver<AuthEvent> {
        self.auth_tx.subscribe()
    }
}

#[async_trait]
impl DataStore for MemoryClient {
    async fn select(&self, query: &Query) -> HubResult<Vec<Value>> {
        self.server.select_rows(self.caller().as_ref(), query)
    }

    async fn insert(&self, table: &str, rows: Vec<Value>) -> HubResult<Vec<Value>> {
        let caller = self.caller().ok_or(HubError::NotAuthenticated)?;
        self.server.insert_rows(Some(&caller), table, rows)
    }

    async fn delete(&self, query: &Query) -> HubResult<Vec<Value>> {
        let caller = self.caller().ok_or(HubError::NotAuthenticated)?;
        self.server.delete_rows(Some(&caller), query)
    }

    async fn rpc(&self, name: &str, params: Value) -> HubResult<Vec<Value>> {
        self.server.call_rpc(self.caller().as_ref(), name, &params)
    }
}

#[async_trait]
impl RealtimeTransport for MemoryClient {
    async fn subscribe(&self, spec: ChannelSpec) -> HubResult<ChangeFeed> {
        let id = self.server.next_channel_id();
        let (tx, rx) = mpsc::unbounded_channel();
        debug!(channel = %id, name = %spec.name, "Opened change channel");
        self.server.state.channels.lock().insert(
            id,
            ChangeSubscriber {
                spec,
                viewer: self.caller(),
                tx,
            },
        );
        Ok(ChangeFeed { id, events: rx })
    }

    async fn join_presence(&self, channel: &str, key: &str) -> HubResult<PresenceFeed> {
        Ok(self.server.join_room(channel, key))
    }

    async fn track(&self, channel: ChannelId, _payload: Value) -> HubResult<()> {
        self.server.track_member(channel)
    }

    fn remove_channel(&self, channel: ChannelId) {
        self.server.close_channel(channel);
    }
}

fn new_row_id() -> String {
    Ulid::new().to_string().to_lowercase()
}

fn change(kind: ChangeKind, table: &str, new: Option<Value>, old: Option<Value>) -> ChangeEvent {
    ChangeEvent {
        kind,
        table: table.to_string(),
        new,
        old,
        commit_timestamp: Utc::now(),
    }
}

fn timestamp(at: DateTime<Utc>) -> Value {
    Value::String(at.to_rfc3339())
}

fn apply_defaults(table: &str, row: &mut Map<String, Value>, now: DateTime<Utc>) {
    row.entry("id").or_insert_with(|| Value::String(new_row_id()));
    row.entry("created_at").or_insert_with(|| timestamp(now));
    if table == "profile_viewers" {
        row.entry("viewed_at").or_insert_with(|| timestamp(now));
        row.entry("expires_at")
            .or_insert_with(|| timestamp(now + Duration::hours(VIEWER_TTL_HOURS)));
    }
}

/// Constraint and row-level-security checks for a pending insert
fn check_row(
    db: &Database,
    caller: Option<&UserId>,
    table: &str,
    row: &Map<String, Value>,
) -> HubResult<()> {
    let existing = db.tables.get(table).map(Vec::as_slice).unwrap_or(&[]);
    if existing.iter().any(|r| r.get("id") == row.get("id")) {
        return Err(HubError::Write(format!(
            "duplicate key value violates unique constraint \"{}_pkey\"",
            table
        )));
    }

    let owner_column = match table {
        "messages" => Some("sender_id"),
        "posts" => Some("user_id"),
        "profiles" => Some("id"),
        "profile_interests" => Some("profile_id"),
        "profile_viewers" => Some("viewer_id"),
        _ => None,
    };
    if let (Some(me), Some(column)) = (caller, owner_column) {
        if row.get(column).and_then(Value::as_str) != Some(me.as_str()) {
            return Err(HubError::Write(format!(
                "new row violates row-level security policy for table \"{}\"",
                table
            )));
        }
    }

    if table == "profile_interests"
        && existing.iter().any(|r| {
            r.get("profile_id") == row.get("profile_id")
                && r.get("target_profile_id") == row.get("target_profile_id")
        })
    {
        return Err(HubError::Write(
            "duplicate key value violates unique constraint \"profile_interests_pkey\"".to_string(),
        ));
    }
    Ok(())
}

/// Link a message to its conversation, creating the conversation on first contact
fn attach_conversation(
    db: &mut Database,
    message: &mut Map<String, Value>,
    now: DateTime<Utc>,
) -> HubResult<Vec<ChangeEvent>> {
    let sender = message.get("sender_id").cloned().unwrap_or(Value::Null);
    let receiver = message.get("receiver_id").cloned().unwrap_or(Value::Null);
    if !sender.is_string() || !receiver.is_string() {
        return Err(HubError::Write(
            "messages require sender_id and receiver_id".to_string(),
        ));
    }

    let mut events = Vec::new();
    let conversations = db.tables.entry("conversations".to_string()).or_default();
    let requested = message.get("conversation_id").cloned().filter(Value::is_string);
    let position = conversations.iter().position(|c| match &requested {
        Some(id) => c.get("id") == Some(id),
        None => {
            (c["user_a"] == sender && c["user_b"] == receiver)
                || (c["user_a"] == receiver && c["user_b"] == sender)
        }
    });
    let position = match position {
        Some(i) => i,
        None => {
            let row = json!({
                "id": requested.unwrap_or_else(|| Value::String(new_row_id())),
                "user_a": sender,
                "user_b": receiver,
                "last_message_id": null,
                "last_message_at": null,
                "created_at": timestamp(now),
            });
            events.push(change(ChangeKind::Insert, "conversations", Some(row.clone()), None));
            conversations.push(row);
            conversations.len() - 1
        }
    };

    let convo = &mut conversations[position];
    let old = convo.clone();
    convo["last_message_id"] = message.get("id").cloned().unwrap_or(Value::Null);
    convo["last_message_at"] = message.get("created_at").cloned().unwrap_or(Value::Null);
    message.insert("conversation_id".to_string(), convo["id"].clone());
    events.push(change(
        ChangeKind::Update,
        "conversations",
        Some(convo.clone()),
        Some(old),
    ));
    Ok(events)
}

fn is_participant(row: &Value, a: &str, b: &str, user: &UserId) -> bool {
    row[a] == user.as_str() || row[b] == user.as_str()
}

fn row_visible(table: &str, row: &Value, viewer: Option<&UserId>) -> bool {
    match table {
        "messages" => viewer
            .map(|me| is_participant(row, "sender_id", "receiver_id", me))
            .unwrap_or(false),
        "conversations" => viewer
            .map(|me| is_participant(row, "user_a", "user_b", me))
            .unwrap_or(false),
        _ => true,
    }
}

fn tracked_keys(presence: &HashMap<ChannelId, PresenceMember>, room: &str) -> Vec<String> {
    presence
        .values()
        .filter(|m| m.room == room && m.tracked)
        .map(|m| m.key.clone())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

fn coordinates_param(params: &Value, lat: &str, lng: &str) -> Option<Coordinates> {
    Some(Coordinates::new(
        params.get(lat)?.as_f64()?,
        params.get(lng)?.as_f64()?,
    ))
}

fn row_location(profile: &Value) -> Option<Coordinates> {
    serde_json::from_value(profile.get("last_location")?.clone()).ok()
}

fn public_row(profile: &Value, distance: Option<f64>) -> Value {
    let mut row = profile.clone();
    if let Value::Object(obj) = &mut row {
        obj.remove("email");
        obj.remove("deleted_at");
        obj.insert(
            "distance_meters".to_string(),
            distance.map(Value::from).unwrap_or(Value::Null),
        );
    }
    row
}
