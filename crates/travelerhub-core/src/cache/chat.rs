//! Direct-message cache: the conversation list plus messages partitioned
//! by conversation.
//!
//! Sending relies on the realtime path: the inserted message shows up when
//! its insert event arrives on the `messages` channel, never eagerly, so a
//! sent message cannot be merged twice.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use ulid::Ulid;

use super::{decode_rows, CacheEntity, Collection, MergePosition, Persisted};
use crate::backend::{
    Backend, ChangeEvent, ChangeKind, ChannelSpec, DataStore, EventMask, Query, RealtimeTransport,
};
use crate::realtime::ChannelSlot;
use crate::session::SessionHolder;
use crate::storage::KeyValueStore;
use crate::types::{Conversation, ConversationId, Message, MessageId, NewMessage, UserId};

const STORAGE_KEY: &str = "chat-storage";
const CONVERSATIONS_VIEW: &str = "my_conversations";

impl CacheEntity for Conversation {
    type Key = ConversationId;
    const TABLE: &'static str = "conversations";

    fn key(&self) -> ConversationId {
        self.id.clone()
    }

    fn key_of_row(row: &Value) -> Option<ConversationId> {
        row.get("id")?.as_str().map(ConversationId::from)
    }
}

impl CacheEntity for Message {
    type Key = MessageId;
    const TABLE: &'static str = "messages";

    fn key(&self) -> MessageId {
        self.id.clone()
    }

    fn key_of_row(row: &Value) -> Option<MessageId> {
        row.get("id")?.as_str().map(MessageId::from)
    }
}

#[derive(Default)]
struct ChatState {
    conversations: Collection<Conversation>,
    messages: HashMap<ConversationId, Collection<Message>>,
    loading: bool,
}

/// Persisted form of the chat cache
#[derive(Default, Serialize, Deserialize)]
struct ChatSnapshot {
    conversations: Vec<Conversation>,
    messages: BTreeMap<ConversationId, Vec<Message>>,
}

struct ChatInner {
    session: SessionHolder,
    data: Arc<dyn DataStore>,
    realtime: Arc<dyn RealtimeTransport>,
    state: RwLock<ChatState>,
    channel: ChannelSlot,
    persisted: Option<Persisted>,
    revision: watch::Sender<u64>,
}

/// Conversations and their messages for the current identity
#[derive(Clone)]
pub struct ChatCache {
    inner: Arc<ChatInner>,
}

impl ChatCache {
    pub fn new(
        session: SessionHolder,
        backend: &Backend,
        store: Option<Arc<dyn KeyValueStore>>,
    ) -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            inner: Arc::new(ChatInner {
                session,
                data: backend.data.clone(),
                realtime: backend.realtime.clone(),
                state: RwLock::new(ChatState::default()),
                channel: ChannelSlot::new(),
                persisted: store.map(|s| Persisted::new(s, STORAGE_KEY)),
                revision,
            }),
        }
    }

    /// Restore conversations and messages from the last persisted snapshot.
    ///
    /// Returns the number of messages restored.
    pub fn hydrate(&self) -> usize {
        let Some(snapshot) = self
            .inner
            .persisted
            .as_ref()
            .and_then(|p| p.load::<ChatSnapshot>())
        else {
            return 0;
        };

        let count = {
            let mut state = self.inner.state.write();
            state.conversations.replace(snapshot.conversations);
            state.messages = snapshot
                .messages
                .into_iter()
                .map(|(id, messages)| (id, Collection::from_items(messages)))
                .collect();
            state.messages.values().map(Collection::len).sum()
        };
        debug!(count, "Hydrated chat cache");
        self.inner.changed();
        count
    }

    /// Replace the conversation list with the backend's view
    pub async fn fetch_conversations(&self) {
        let Some(me) = self.inner.session.user_id() else {
            debug!("No identity, skipping conversation fetch");
            self.inner.state.write().loading = false;
            return;
        };

        let ticket = {
            let mut state = self.inner.state.write();
            state.loading = true;
            state.conversations.begin_fetch()
        };

        let query = Query::from(CONVERSATIONS_VIEW).order("last_message_at", false);
        match self.inner.data.select(&query).await {
            Ok(rows) => {
                let snapshot = decode_rows::<Conversation>(CONVERSATIONS_VIEW, rows);
                let adopted = {
                    let mut state = self.inner.state.write();
                    let adopted = state.conversations.finish_fetch(ticket, snapshot);
                    if adopted {
                        state.loading = false;
                    }
                    adopted
                };
                if adopted {
                    debug!(user_id = %me, count = self.conversations().len(), "Fetched conversations");
                    self.inner.persist();
                    self.inner.changed();
                }
            }
            Err(e) => {
                warn!(error = %e, "Conversation fetch failed");
                let mut state = self.inner.state.write();
                if state.conversations.abandon_fetch(ticket) {
                    state.loading = false;
                }
            }
        }
    }

    /// Replace one conversation's messages, oldest first
    pub async fn fetch_messages(&self, conversation: &ConversationId) {
        if self.inner.session.user_id().is_none() {
            debug!(%conversation, "No identity, skipping message fetch");
            return;
        }

        let ticket = self
            .inner
            .state
            .write()
            .messages
            .entry(conversation.clone())
            .or_default()
            .begin_fetch();

        let query = Query::from(Message::TABLE)
            .eq("conversation_id", conversation.as_str())
            .order("created_at", true);
        match self.inner.data.select(&query).await {
            Ok(rows) => {
                let snapshot = decode_rows::<Message>(Message::TABLE, rows);
                let adopted = self
                    .inner
                    .state
                    .write()
                    .messages
                    .get_mut(conversation)
                    .map(|partition| partition.finish_fetch(ticket, snapshot))
                    .unwrap_or(false);
                if adopted {
                    debug!(%conversation, count = self.messages(conversation).len(), "Fetched messages");
                    self.inner.persist();
                    self.inner.changed();
                } else {
                    debug!(%conversation, "Discarding stale message fetch");
                }
            }
            Err(e) => {
                warn!(%conversation, error = %e, "Message fetch failed");
                if let Some(partition) = self.inner.state.write().messages.get_mut(conversation) {
                    partition.abandon_fetch(ticket);
                }
            }
        }
    }

    /// Send a message to `receiver` in `conversation`.
    ///
    /// Returns the stored row. It enters the cache through the realtime
    /// insert event, so the cache must be subscribed to see it.
    pub async fn send_message(
        &self,
        conversation: &ConversationId,
        receiver: &UserId,
        content: &str,
    ) -> Option<Message> {
        let Some(me) = self.inner.session.user_id() else {
            warn!("Send attempted without identity");
            return None;
        };

        let draft = NewMessage {
            conversation_id: conversation.clone(),
            sender_id: me,
            receiver_id: receiver.clone(),
            content: content.to_string(),
        };
        let row = match serde_json::to_value(&draft) {
            Ok(row) => row,
            Err(e) => {
                error!(error = %e, "Failed to encode message");
                return None;
            }
        };

        match self.inner.data.insert(Message::TABLE, vec![row]).await {
            Ok(rows) => {
                info!(%conversation, "Message sent");
                decode_rows::<Message>(Message::TABLE, rows).into_iter().next()
            }
            Err(e) => {
                error!(%conversation, error = %e, "Send failed");
                None
            }
        }
    }

    /// Id of my conversation with `other`, or a fresh one for a first message
    pub fn conversation_id_for(&self, other: &UserId) -> ConversationId {
        let me = self.inner.session.user_id();
        let existing = me.and_then(|me| {
            self.inner
                .state
                .read()
                .conversations
                .items()
                .iter()
                .find(|c| c.includes(&me) && c.includes(other))
                .map(|c| c.id.clone())
        });
        existing.unwrap_or_else(|| ConversationId::from(Ulid::new().to_string().to_lowercase()))
    }

    /// Idempotent upsert of a message into its conversation.
    ///
    /// A message for a conversation not in the list triggers a background
    /// conversation fetch.
    pub fn add_message(&self, message: Message) {
        let conversation = message.conversation_id.clone();
        let known = {
            let mut state = self.inner.state.write();
            let known = match state.conversations.get(&conversation) {
                Some(convo) => {
                    let newer = convo
                        .last_message_at
                        .map(|at| message.created_at >= at)
                        .unwrap_or(true);
                    if newer {
                        let mut convo = convo.clone();
                        convo.last_message_id = Some(message.id.clone());
                        convo.last_message_at = Some(message.created_at);
                        state.conversations.replace_existing(convo);
                    }
                    true
                }
                None => false,
            };
            state
                .messages
                .entry(conversation.clone())
                .or_default()
                .upsert(message, MergePosition::Append);
            known
        };
        self.inner.persist();
        self.inner.changed();

        if !known {
            debug!(%conversation, "Message for unknown conversation, refreshing list");
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    let cache = self.clone();
                    handle.spawn(async move { cache.fetch_conversations().await });
                }
                Err(_) => warn!(%conversation, "No runtime for conversation refresh"),
            }
        }
    }

    pub fn remove_message(&self, conversation: &ConversationId, id: &MessageId) -> bool {
        let removed = self
            .inner
            .state
            .write()
            .messages
            .get_mut(conversation)
            .and_then(|partition| partition.remove_key(id))
            .is_some();
        if removed {
            self.inner.persist();
            self.inner.changed();
        }
        removed
    }

    /// Open the `messages` channel. Repeated calls are no-ops.
    pub async fn subscribe(&self) -> bool {
        if self.inner.session.user_id().is_none() {
            debug!("No identity, not subscribing to messages");
            return false;
        }

        let weak: Weak<ChatInner> = Arc::downgrade(&self.inner);
        let handler = move |event: ChangeEvent| {
            if let Some(inner) = weak.upgrade() {
                ChatCache { inner }.apply_event(event);
            }
        };

        let spec = ChannelSpec::table(Message::TABLE, EventMask::ALL);
        match self
            .inner
            .channel
            .open_once(self.inner.realtime.clone(), spec, handler)
            .await
        {
            Ok(opened) => opened,
            Err(e) => {
                warn!(error = %e, "Message subscribe failed");
                false
            }
        }
    }

    pub async fn unsubscribe(&self) -> bool {
        self.inner.channel.close().await
    }

    /// Close the channel, drop every conversation and message, forget the
    /// persisted copy
    pub async fn reset(&self) {
        self.inner.channel.close().await;
        {
            let mut state = self.inner.state.write();
            state.conversations.clear();
            state.messages.clear();
            state.loading = false;
        }
        if let Some(persisted) = &self.inner.persisted {
            persisted.clear();
        }
        debug!("Chat cache reset");
        self.inner.changed();
    }

    pub fn conversations(&self) -> Vec<Conversation> {
        self.inner.state.read().conversations.items().to_vec()
    }

    /// Messages of one conversation, oldest first
    pub fn messages(&self, conversation: &ConversationId) -> Vec<Message> {
        self.inner
            .state
            .read()
            .messages
            .get(conversation)
            .map(|p| p.items().to_vec())
            .unwrap_or_default()
    }

    pub fn is_loading(&self) -> bool {
        self.inner.state.read().loading
    }

    pub async fn is_subscribed(&self) -> bool {
        self.inner.channel.is_open().await
    }

    pub fn watch(&self) -> watch::Receiver<u64> {
        self.inner.revision.subscribe()
    }

    fn apply_event(&self, event: ChangeEvent) {
        match event.kind {
            ChangeKind::Insert => match decode_message(event.new) {
                Some(message) => self.add_message(message),
                None => warn!("Message insert without a usable row"),
            },
            ChangeKind::Update => match decode_message(event.new) {
                Some(message) => {
                    let replaced = self
                        .inner
                        .state
                        .write()
                        .messages
                        .get_mut(&message.conversation_id)
                        .map(|partition| partition.replace_existing(message))
                        .unwrap_or(false);
                    if replaced {
                        self.inner.persist();
                        self.inner.changed();
                    }
                }
                None => warn!("Message update without a usable row"),
            },
            ChangeKind::Delete => {
                let Some(old) = event.old else { return };
                let Some(id) = Message::key_of_row(&old) else {
                    warn!("Message delete without an id");
                    return;
                };
                match old.get("conversation_id").and_then(Value::as_str) {
                    Some(conversation) => {
                        self.remove_message(&ConversationId::from(conversation), &id);
                    }
                    None => self.remove_everywhere(&id),
                }
            }
        }
    }

    fn remove_everywhere(&self, id: &MessageId) {
        let removed = self
            .inner
            .state
            .write()
            .messages
            .values_mut()
            .any(|partition| partition.remove_key(id).is_some());
        if removed {
            self.inner.persist();
            self.inner.changed();
        }
    }
}

impl ChatInner {
    fn persist(&self) {
        let Some(persisted) = &self.persisted else {
            return;
        };
        persisted.save_with(|| {
            let state = self.state.read();
            ChatSnapshot {
                conversations: state.conversations.items().to_vec(),
                messages: state
                    .messages
                    .iter()
                    .map(|(id, p)| (id.clone(), p.items().to_vec()))
                    .collect(),
            }
        });
    }

    fn changed(&self) {
        self.revision.send_modify(|r| *r += 1);
    }
}

fn decode_message(row: Option<Value>) -> Option<Message> {
    decode_rows::<Message>(Message::TABLE, row.into_iter().collect())
        .into_iter()
        .next()
}
