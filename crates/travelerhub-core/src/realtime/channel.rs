//! Scoped change-feed subscriptions.

use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::backend::{ChangeEvent, ChannelId, ChannelSpec, RealtimeTransport};
use crate::error::HubResult;

/// Handle to one open transport channel and the task dispatching its events.
///
/// Teardown always closes the transport channel before the handle goes
/// away: [`Subscription::close`] and `Drop` both abort the dispatch
/// task and call `remove_channel` exactly once.
pub struct Subscription {
    id: ChannelId,
    name: String,
    transport: Arc<dyn RealtimeTransport>,
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    /// Open a change channel and route every delivered event to `handler`.
    ///
    /// Events are handled one at a time in transport delivery order.
    pub async fn open<H>(
        transport: Arc<dyn RealtimeTransport>,
        spec: ChannelSpec,
        handler: H,
    ) -> HubResult<Self>
    where
        H: Fn(ChangeEvent) + Send + Sync + 'static,
    {
        let name = spec.name.clone();
        let feed = transport.subscribe(spec).await?;
        let id = feed.id;
        let mut events = feed.events;

        let task_name = name.clone();
        let task = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                trace!(channel = %task_name, kind = %event.kind, "Dispatching change event");
                handler(event);
            }
            debug!(channel = %task_name, "Change feed ended");
        });

        debug!(channel = %name, %id, "Subscribed");
        Ok(Self::from_parts(id, name, transport, task))
    }

    /// Wrap an already open channel and its dispatch task
    pub(crate) fn from_parts(
        id: ChannelId,
        name: String,
        transport: Arc<dyn RealtimeTransport>,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
            id,
            name,
            transport,
            task: Some(task),
        }
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Close the channel and wait until the dispatch task has stopped.
    ///
    /// No handler call is in progress or pending once this returns.
    pub async fn close(mut self) {
        if let Some(task) = self.teardown() {
            let _ = task.await;
        }
    }

    fn teardown(&mut self) -> Option<JoinHandle<()>> {
        let task = self.task.take()?;
        task.abort();
        self.transport.remove_channel(self.id);
        debug!(channel = %self.name, id = %self.id, "Unsubscribed");
        Some(task)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

/// Holder guaranteeing at most one open [`Subscription`] per owner.
///
/// The lock is held across the transport round-trip, so concurrent
/// `open_once` calls result in exactly one channel.
#[derive(Default)]
pub struct ChannelSlot {
    current: Mutex<Option<Subscription>>,
}

impl ChannelSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a channel unless one is already open.
    ///
    /// Returns `true` if a channel was opened, `false` if already subscribed.
    pub async fn open_once<H>(
        &self,
        transport: Arc<dyn RealtimeTransport>,
        spec: ChannelSpec,
        handler: H,
    ) -> HubResult<bool>
    where
        H: Fn(ChangeEvent) + Send + Sync + 'static,
    {
        let mut current = self.current.lock().await;
        if current.is_some() {
            debug!(channel = %spec.name, "Already subscribed");
            return Ok(false);
        }
        *current = Some(Subscription::open(transport, spec, handler).await?);
        Ok(true)
    }

    /// Close the open channel, if any. Returns whether one was open.
    pub async fn close(&self) -> bool {
        let subscription = self.current.lock().await.take();
        match subscription {
            Some(subscription) => {
                subscription.close().await;
                true
            }
            None => false,
        }
    }

    pub async fn is_open(&self) -> bool {
        self.current.lock().await.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{EventMask, MemoryBackend};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_open_once_is_idempotent() {
        let server = MemoryBackend::new();
        let client = server.connect();
        let slot = Arc::new(ChannelSlot::new());

        let spec = ChannelSpec::table("posts", EventMask::ALL);
        let (a, b) = tokio::join!(
            slot.open_once(client.clone(), spec.clone(), |_| {}),
            slot.open_once(client.clone(), spec.clone(), |_| {}),
        );
        assert_ne!(a.unwrap(), b.unwrap());
        assert_eq!(server.channels_on("posts"), 1);
        assert!(slot.is_open().await);

        assert!(slot.close().await);
        assert!(!slot.close().await);
        assert_eq!(server.open_channel_count(), 0);
    }

    #[tokio::test]
    async fn test_drop_closes_transport_channel() {
        let server = MemoryBackend::new();
        let client = server.connect();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();

        let sub = Subscription::open(
            client.clone(),
            ChannelSpec::table("posts", EventMask::ALL),
            move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            },
        )
        .await
        .unwrap();
        assert_eq!(server.open_channel_count(), 1);

        server
            .seed("posts", vec![json!({"user_id": "u1", "type": "postcard"})])
            .unwrap();
        for _ in 0..50 {
            if seen.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        drop(sub);
        assert_eq!(server.open_channel_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_close_waits_for_running_handler() {
        let server = MemoryBackend::new();
        let client = server.connect();
        let started = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicUsize::new(0));
        let (s, f) = (started.clone(), finished.clone());

        let sub = Subscription::open(
            client.clone(),
            ChannelSpec::table("posts", EventMask::ALL),
            move |_| {
                s.fetch_add(1, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(50));
                f.fetch_add(1, Ordering::SeqCst);
            },
        )
        .await
        .unwrap();

        server
            .seed("posts", vec![json!({"user_id": "u1", "type": "postcard"})])
            .unwrap();
        for _ in 0..100 {
            if started.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert_eq!(started.load(Ordering::SeqCst), 1);

        sub.close().await;
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert_eq!(server.open_channel_count(), 0);
    }
}
