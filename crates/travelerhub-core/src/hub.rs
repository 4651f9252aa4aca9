//! The root aggregator: one object owning the session and every cache.
//!
//! ```text
//! Hub
//! ├── SessionHolder ◀── auth listener task (SignedIn / SignedOut)
//! ├── ProfileCache
//! ├── ChatCache       ─┐
//! ├── PostCache        │ realtime channels,
//! ├── InterestCache    │ persisted to the
//! ├── ViewerCache     ─┘ key-value store
//! └── PresenceTracker
//! ```
//!
//! Build it once at startup and hand clones to whatever needs it. Signing
//! out resets every cache through [`Hub::reset_all`].

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backend::{AuthEventKind, Backend};
use crate::cache::{ChatCache, InterestCache, PostCache, ProfileCache, ViewerCache};
use crate::config::HubConfig;
use crate::error::HubResult;
use crate::realtime::PresenceTracker;
use crate::session::SessionHolder;
use crate::storage::KeyValueStore;
use crate::types::{AuthProvider, User};

struct HubInner {
    config: HubConfig,
    session: SessionHolder,
    profiles: ProfileCache,
    chat: ChatCache,
    posts: PostCache,
    interests: InterestCache,
    viewers: ViewerCache,
    presence: PresenceTracker,
    listener: Mutex<Option<JoinHandle<()>>>,
}

/// Session, caches and presence for one app instance
#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

impl Hub {
    /// Wire every component to `backend`.
    ///
    /// Caches enabled in `config.persist` write to `store` when one is given.
    pub fn new(backend: Backend, store: Option<Arc<dyn KeyValueStore>>, config: HubConfig) -> Self {
        let session = SessionHolder::new(backend.identity.clone());
        let store_if = |enabled: bool| store.clone().filter(|_| enabled);

        let inner = HubInner {
            profiles: ProfileCache::new(session.clone(), &backend, config.favorites_limit),
            chat: ChatCache::new(session.clone(), &backend, store_if(config.persist.chat)),
            posts: PostCache::new(session.clone(), &backend, store_if(config.persist.posts)),
            interests: InterestCache::new(
                session.clone(),
                &backend,
                store_if(config.persist.interests),
            ),
            viewers: ViewerCache::new(session.clone(), &backend, store_if(config.persist.viewers)),
            presence: PresenceTracker::new(backend.realtime.clone(), &config.presence_channel),
            session,
            config,
            listener: Mutex::new(None),
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Initialize the session, restore persisted caches and start listening
    /// for auth-state changes.
    ///
    /// Returns the signed-in user, if any. Calling it again re-reads the
    /// session but never spawns a second listener.
    pub async fn start(&self) -> Option<User> {
        let events = self.inner.session.auth_events();
        let user = self.inner.session.initialize().await;

        let restored = self.inner.chat.hydrate()
            + self.inner.posts.hydrate()
            + self.inner.interests.hydrate()
            + self.inner.viewers.hydrate();
        debug!(restored, "Hydrated persisted caches");

        if user.is_some() {
            self.inner.profiles.fetch_my_profile().await;
        }

        let mut listener = self.inner.listener.lock();
        if listener.is_none() {
            let weak = Arc::downgrade(&self.inner);
            *listener = Some(tokio::spawn(listen_for_auth(weak, events)));
        }
        info!(signed_in = user.is_some(), "Hub started");
        user
    }

    /// Sign in with email and password, then load my profile.
    ///
    /// Rejected credentials are returned verbatim.
    pub async fn sign_in(&self, email: &str, password: &str) -> HubResult<Option<User>> {
        let user = self.inner.session.sign_in(email, password).await?;
        if user.is_some() {
            self.inner.profiles.fetch_my_profile().await;
        }
        Ok(user)
    }

    /// Sign in through a federated provider, returning to the configured redirect
    pub async fn sign_in_with_oauth(&self, provider: AuthProvider) -> HubResult<Option<User>> {
        let user = self
            .inner
            .session
            .sign_in_with_oauth(provider, &self.inner.config.oauth_redirect)
            .await?;
        if user.is_some() {
            self.inner.profiles.fetch_my_profile().await;
        }
        Ok(user)
    }

    /// Revoke the session, then reset every cache
    pub async fn sign_out(&self) {
        self.inner.session.sign_out().await;
        self.reset_all().await;
    }

    /// Empty every cache, close their channels and stop presence
    pub async fn reset_all(&self) {
        self.inner.reset_all().await;
    }

    /// Open every realtime channel and go online.
    ///
    /// Returns whether presence tracking started. Does nothing when signed out.
    pub async fn subscribe_all(&self) -> bool {
        let Some(me) = self.inner.session.user_id() else {
            debug!("No identity, not subscribing");
            return false;
        };
        self.inner.chat.subscribe().await;
        self.inner.posts.subscribe().await;
        self.inner.interests.subscribe().await;
        self.inner.viewers.subscribe().await;
        match self.inner.presence.start(&me).await {
            Ok(started) => started,
            Err(e) => {
                warn!(error = %e, "Presence failed to start");
                false
            }
        }
    }

    /// Refresh every identity-scoped cache from the backend
    pub async fn fetch_all(&self) {
        tokio::join!(
            self.inner.chat.fetch_conversations(),
            self.inner.posts.fetch(),
            self.inner.interests.fetch(),
            self.inner.viewers.fetch(),
        );
    }

    /// Stop the auth listener and close every channel, keeping cached data
    pub async fn shutdown(&self) {
        if let Some(listener) = self.inner.listener.lock().take() {
            listener.abort();
        }
        self.inner.chat.unsubscribe().await;
        self.inner.posts.unsubscribe().await;
        self.inner.interests.unsubscribe().await;
        self.inner.viewers.unsubscribe().await;
        self.inner.presence.stop().await;
        info!("Hub shut down");
    }

    pub fn config(&self) -> &HubConfig {
        &self.inner.config
    }

    pub fn session(&self) -> &SessionHolder {
        &self.inner.session
    }

    pub fn profiles(&self) -> &ProfileCache {
        &self.inner.profiles
    }

    pub fn chat(&self) -> &ChatCache {
        &self.inner.chat
    }

    pub fn posts(&self) -> &PostCache {
        &self.inner.posts
    }

    pub fn interests(&self) -> &InterestCache {
        &self.inner.interests
    }

    pub fn viewers(&self) -> &ViewerCache {
        &self.inner.viewers
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.inner.presence
    }
}

impl HubInner {
    async fn reset_all(&self) {
        self.profiles.reset();
        self.chat.reset().await;
        self.interests.reset().await;
        self.posts.reset().await;
        self.viewers.reset().await;
        self.presence.stop().await;
        info!("All caches reset");
    }
}

async fn listen_for_auth(
    hub: Weak<HubInner>,
    mut events: tokio::sync::broadcast::Receiver<crate::backend::AuthEvent>,
) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Auth listener lagged");
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        let Some(hub) = hub.upgrade() else { break };

        debug!(kind = ?event.kind, "Auth state changed");
        if !hub.session.reconcile(&event).await {
            continue;
        }
        match event.kind {
            AuthEventKind::SignedIn | AuthEventKind::TokenRefreshed => {
                hub.profiles.fetch_my_profile().await;
            }
            AuthEventKind::SignedOut => hub.reset_all().await,
        }
    }
    debug!("Auth listener stopped");
}
