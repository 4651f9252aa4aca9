//! Presence tracking: which peers currently hold an open connection.
//!
//! The tracker joins a broadcast presence channel under the current
//! identity, announces itself once the channel reports `Subscribed`, and
//! keeps a set of online peer ids in step with sync/join/leave events.

use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::Subscription;
use crate::backend::{ChannelId, ChannelStatus, PresenceEvent, RealtimeTransport};
use crate::error::HubResult;
use crate::types::UserId;

struct PresenceInner {
    transport: Arc<dyn RealtimeTransport>,
    channel: String,
    online: RwLock<BTreeSet<String>>,
    active: Mutex<Option<Subscription>>,
}

/// Maintains the set of online peer identifiers
#[derive(Clone)]
pub struct PresenceTracker {
    inner: Arc<PresenceInner>,
}

impl PresenceTracker {
    pub fn new(transport: Arc<dyn RealtimeTransport>, channel: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(PresenceInner {
                transport,
                channel: channel.into(),
                online: RwLock::new(BTreeSet::new()),
                active: Mutex::new(None),
            }),
        }
    }

    /// Start broadcasting presence for `user_id`.
    ///
    /// Returns `false` without doing anything when tracking is already active.
    pub async fn start(&self, user_id: &UserId) -> HubResult<bool> {
        let mut active = self.inner.active.lock().await;
        if active.is_some() {
            debug!(channel = %self.inner.channel, "Presence already active");
            return Ok(false);
        }

        let feed = self
            .inner
            .transport
            .join_presence(&self.inner.channel, user_id.as_str())
            .await?;
        let id = feed.id;
        let mut events = feed.events;

        let weak = Arc::downgrade(&self.inner);
        let key = user_id.to_string();
        let task = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(inner) = weak.upgrade() else { break };
                if !inner.apply(id, &key, event).await {
                    break;
                }
            }
        });

        info!(channel = %self.inner.channel, %user_id, "Presence started");
        *active = Some(Subscription::from_parts(
            id,
            self.inner.channel.clone(),
            self.inner.transport.clone(),
            task,
        ));
        Ok(true)
    }

    /// Leave the presence channel and forget every online peer.
    ///
    /// Returns whether tracking was active.
    pub async fn stop(&self) -> bool {
        let subscription = self.inner.active.lock().await.take();
        let was_active = match subscription {
            Some(subscription) => {
                subscription.close().await;
                info!(channel = %self.inner.channel, "Presence stopped");
                true
            }
            None => false,
        };
        self.inner.online.write().clear();
        was_active
    }

    pub async fn is_active(&self) -> bool {
        self.inner.active.lock().await.is_some()
    }

    /// Online peer ids in ascending order
    pub fn online_ids(&self) -> Vec<String> {
        self.inner.online.read().iter().cloned().collect()
    }

    pub fn is_online(&self, user_id: &UserId) -> bool {
        self.inner.online.read().contains(user_id.as_str())
    }

    pub fn channel(&self) -> &str {
        &self.inner.channel
    }
}

impl PresenceInner {
    /// Returns `false` once the channel is gone and no further events matter
    async fn apply(&self, id: ChannelId, key: &str, event: PresenceEvent) -> bool {
        match event {
            PresenceEvent::Status(ChannelStatus::Subscribed) => {
                // Only announce once the channel is confirmed ready
                if let Err(e) = self.transport.track(id, json!({ "user_id": key })).await {
                    warn!(channel = %self.channel, error = %e, "Failed to track presence");
                }
            }
            PresenceEvent::Status(status) => {
                warn!(channel = %self.channel, ?status, "Presence channel lost");
                self.online.write().clear();
                return false;
            }
            PresenceEvent::Sync(keys) => {
                *self.online.write() = keys.into_iter().collect();
            }
            PresenceEvent::Join(peer) => {
                self.online.write().insert(peer);
            }
            PresenceEvent::Leave(peer) => {
                self.online.write().remove(&peer);
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ChangeFeed, ChannelSpec, MemoryBackend, PresenceFeed};
    use crate::error::HubError;
    use async_trait::async_trait;
    use serde_json::Value;
    use std::time::Duration;
    use tokio::sync::mpsc;

    /// Transport whose presence feed is driven by the test
    #[derive(Default)]
    struct ScriptedTransport {
        feed: parking_lot::Mutex<Option<mpsc::UnboundedSender<PresenceEvent>>>,
        tracked: parking_lot::Mutex<Vec<ChannelId>>,
    }

    impl ScriptedTransport {
        fn push(&self, event: PresenceEvent) {
            if let Some(feed) = self.feed.lock().as_ref() {
                let _ = feed.send(event);
            }
        }

        fn tracked(&self) -> usize {
            self.tracked.lock().len()
        }
    }

    #[async_trait]
    impl RealtimeTransport for ScriptedTransport {
        async fn subscribe(&self, _spec: ChannelSpec) -> HubResult<ChangeFeed> {
            Err(HubError::Channel("no change feeds here".to_string()))
        }

        async fn join_presence(&self, _channel: &str, _key: &str) -> HubResult<PresenceFeed> {
            let (tx, events) = mpsc::unbounded_channel();
            *self.feed.lock() = Some(tx);
            Ok(PresenceFeed {
                id: ChannelId(7),
                events,
            })
        }

        async fn track(&self, channel: ChannelId, _payload: Value) -> HubResult<()> {
            self.tracked.lock().push(channel);
            Ok(())
        }

        fn remove_channel(&self, _channel: ChannelId) {}
    }

    async fn wait_for(mut cond: impl FnMut() -> bool) {
        for _ in 0..100 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_two_peers_see_each_other() {
        let server = MemoryBackend::new();
        let ana = PresenceTracker::new(server.connect(), "presence:global");
        let bo = PresenceTracker::new(server.connect(), "presence:global");

        assert!(ana.start(&UserId::from("ana")).await.unwrap());
        assert!(bo.start(&UserId::from("bo")).await.unwrap());

        wait_for(|| ana.online_ids() == vec!["ana".to_string(), "bo".to_string()]).await;
        wait_for(|| bo.is_online(&UserId::from("ana"))).await;

        assert!(bo.stop().await);
        assert!(bo.online_ids().is_empty());
        wait_for(|| !ana.is_online(&UserId::from("bo"))).await;
        assert_eq!(server.presence_keys("presence:global"), vec!["ana".to_string()]);
    }

    #[tokio::test]
    async fn test_start_twice_is_noop() {
        let server = MemoryBackend::new();
        let tracker = PresenceTracker::new(server.connect(), "presence:global");

        assert!(tracker.start(&UserId::from("ana")).await.unwrap());
        assert!(!tracker.start(&UserId::from("ana")).await.unwrap());
        assert!(tracker.is_active().await);

        assert!(tracker.stop().await);
        assert!(!tracker.stop().await);
        assert!(!tracker.is_active().await);
    }

    #[tokio::test]
    async fn test_tracks_only_after_subscribed() {
        let transport = Arc::new(ScriptedTransport::default());
        let tracker = PresenceTracker::new(transport.clone(), "presence:global");
        assert!(tracker.start(&UserId::from("ana")).await.unwrap());

        transport.push(PresenceEvent::Sync(vec!["bo".to_string()]));
        wait_for(|| tracker.is_online(&UserId::from("bo"))).await;
        assert_eq!(transport.tracked(), 0);

        transport.push(PresenceEvent::Status(ChannelStatus::Subscribed));
        wait_for(|| transport.tracked() == 1).await;
        assert_eq!(transport.tracked.lock()[0], ChannelId(7));
    }

    #[tokio::test]
    async fn test_never_tracks_after_channel_failure() {
        for failure in [ChannelStatus::Error("timed out".to_string()), ChannelStatus::Closed] {
            let transport = Arc::new(ScriptedTransport::default());
            let tracker = PresenceTracker::new(transport.clone(), "presence:global");
            assert!(tracker.start(&UserId::from("ana")).await.unwrap());

            transport.push(PresenceEvent::Join("bo".to_string()));
            wait_for(|| tracker.is_online(&UserId::from("bo"))).await;

            transport.push(PresenceEvent::Status(failure));
            wait_for(|| tracker.online_ids().is_empty()).await;
            transport.push(PresenceEvent::Status(ChannelStatus::Subscribed));
            tokio::time::sleep(Duration::from_millis(30)).await;

            assert_eq!(transport.tracked(), 0);
            assert!(tracker.stop().await);
        }
    }
}
