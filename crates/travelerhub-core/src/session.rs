//! Session holder: the current authenticated identity and its lifecycle.
//!
//! ```text
//! Uninitialized ──initialize──▶ Anonymous ◀──sign_out / SignedOut──┐
//!       │                           │                              │
//!       └──initialize (session)──▶ Authenticated ◀─ sign_in ───────┘
//!                                   └── TokenRefreshed: replaced in place
//! ```
//!
//! The holder is the only owner of the session. Caches ask it for the
//! current identity before every remote call.

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::backend::{AuthEvent, AuthEventKind, IdentityProvider};
use crate::error::HubResult;
use crate::types::{AuthProvider, Session, User, UserId};

/// Lifecycle state of the session holder
#[derive(Debug, Clone, PartialEq)]
pub enum SessionState {
    /// The current session has not been queried yet
    Uninitialized,
    Anonymous,
    Authenticated(Session),
}

#[derive(Default)]
struct Snapshot {
    session: Option<Session>,
    initialized: bool,
}

struct SessionInner {
    provider: Arc<dyn IdentityProvider>,
    snapshot: RwLock<Snapshot>,
}

/// Tracks the authenticated identity for the whole app
#[derive(Clone)]
pub struct SessionHolder {
    inner: Arc<SessionInner>,
}

impl SessionHolder {
    pub fn new(provider: Arc<dyn IdentityProvider>) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                provider,
                snapshot: RwLock::new(Snapshot::default()),
            }),
        }
    }

    /// Query the provider for the current session.
    ///
    /// Marks the holder initialized regardless of the outcome; a failed
    /// lookup counts as "no session".
    pub async fn initialize(&self) -> Option<User> {
        let session = match self.inner.provider.get_session().await {
            Ok(session) => session,
            Err(e) => {
                warn!(error = %e, "Session lookup failed, treating as anonymous");
                None
            }
        };
        let user = session.as_ref().map(|s| s.user.clone());
        {
            let mut snapshot = self.inner.snapshot.write();
            snapshot.session = session;
            snapshot.initialized = true;
        }
        debug!(user_id = ?user.as_ref().map(|u| &u.id), "Session fetched");
        user
    }

    /// Update identity and session in place from an external auth-state change
    pub fn apply_auth_event(&self, event: &AuthEvent) {
        let session = match event.kind {
            AuthEventKind::SignedOut => None,
            AuthEventKind::SignedIn | AuthEventKind::TokenRefreshed => event.session.clone(),
        };
        debug!(kind = ?event.kind, "Applying auth event");
        self.inner.snapshot.write().session = session;
    }

    /// Apply `event` only if it still describes the provider's session.
    ///
    /// Events are delivered asynchronously, so a `SignedOut` can arrive after
    /// the user already signed back in. Returns whether the event was applied.
    pub async fn reconcile(&self, event: &AuthEvent) -> bool {
        let current = match self.inner.provider.get_session().await {
            Ok(current) => current,
            Err(e) => {
                warn!(error = %e, "Session lookup failed, applying auth event as sent");
                self.apply_auth_event(event);
                return true;
            }
        };

        let token = |s: &Option<Session>| s.as_ref().map(|s| s.access_token.clone());
        let stale = match event.kind {
            AuthEventKind::SignedOut => current.is_some(),
            AuthEventKind::SignedIn | AuthEventKind::TokenRefreshed => {
                current.is_none() || token(&current) != token(&event.session)
            }
        };
        if stale {
            debug!(kind = ?event.kind, "Ignoring stale auth event");
            return false;
        }
        self.apply_auth_event(event);
        true
    }

    /// Subscribe to the provider's auth-state changes
    pub fn auth_events(&self) -> broadcast::Receiver<AuthEvent> {
        self.inner.provider.auth_events()
    }

    /// Exchange credentials for a session.
    ///
    /// Provider errors are returned verbatim; there is no retry.
    pub async fn sign_in(&self, email: &str, password: &str) -> HubResult<Option<User>> {
        self.inner
            .provider
            .sign_in_with_password(email, password)
            .await?;
        info!("Signed in with password");
        Ok(self.initialize().await)
    }

    /// Run the federated redirect flow and adopt its session, if any
    pub async fn sign_in_with_oauth(
        &self,
        provider: AuthProvider,
        redirect_to: &str,
    ) -> HubResult<Option<User>> {
        let session = self
            .inner
            .provider
            .sign_in_with_oauth(provider, redirect_to)
            .await?;
        match session {
            Some(session) => {
                info!(%provider, user_id = %session.user.id, "Signed in via federated provider");
                let user = session.user.clone();
                let mut snapshot = self.inner.snapshot.write();
                snapshot.session = Some(session);
                snapshot.initialized = true;
                Ok(Some(user))
            }
            None => Ok(self.initialize().await),
        }
    }

    /// Refresh the access token, keeping the same identity
    pub async fn refresh(&self) -> HubResult<Option<User>> {
        let session = self.inner.provider.refresh_session().await?;
        let user = session.as_ref().map(|s| s.user.clone());
        self.inner.snapshot.write().session = session;
        Ok(user)
    }

    /// Revoke the remote session and forget the local one.
    ///
    /// A failed revocation is logged; the local session is dropped anyway.
    pub async fn sign_out(&self) {
        if let Err(e) = self.inner.provider.sign_out().await {
            warn!(error = %e, "Remote sign-out failed");
        }
        self.inner.snapshot.write().session = None;
        info!("Signed out");
    }

    pub fn state(&self) -> SessionState {
        let snapshot = self.inner.snapshot.read();
        match (&snapshot.session, snapshot.initialized) {
            (Some(session), _) => SessionState::Authenticated(session.clone()),
            (None, true) => SessionState::Anonymous,
            (None, false) => SessionState::Uninitialized,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.snapshot.read().initialized
    }

    pub fn session(&self) -> Option<Session> {
        self.inner.snapshot.read().session.clone()
    }

    pub fn current_user(&self) -> Option<User> {
        self.inner
            .snapshot
            .read()
            .session
            .as_ref()
            .map(|s| s.user.clone())
    }

    pub fn user_id(&self) -> Option<UserId> {
        self.current_user().map(|u| u.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::error::HubError;

    #[tokio::test]
    async fn test_initialize_without_session() {
        let server = MemoryBackend::new();
        let holder = SessionHolder::new(server.connect());

        assert_eq!(holder.state(), SessionState::Uninitialized);
        assert!(holder.initialize().await.is_none());
        assert_eq!(holder.state(), SessionState::Anonymous);
        assert!(holder.is_initialized());
    }

    #[tokio::test]
    async fn test_sign_in_and_out() {
        let server = MemoryBackend::new();
        let user = server.register("ana@example.com", "secret").unwrap();
        let holder = SessionHolder::new(server.connect());

        let signed_in = holder.sign_in("ana@example.com", "secret").await.unwrap();
        assert_eq!(signed_in.map(|u| u.id), Some(user.id.clone()));
        assert!(matches!(holder.state(), SessionState::Authenticated(_)));
        assert_eq!(holder.user_id(), Some(user.id));

        holder.sign_out().await;
        assert_eq!(holder.state(), SessionState::Anonymous);
    }

    #[tokio::test]
    async fn test_rejected_credentials_propagate() {
        let server = MemoryBackend::new();
        server.register("ana@example.com", "secret").unwrap();
        let holder = SessionHolder::new(server.connect());

        let err = holder.sign_in("ana@example.com", "nope").await.unwrap_err();
        assert!(matches!(err, HubError::Auth(msg) if msg == "Invalid login credentials"));
        assert!(holder.current_user().is_none());
    }

    #[tokio::test]
    async fn test_refresh_replaces_token_in_place() {
        let server = MemoryBackend::new();
        server.register("ana@example.com", "secret").unwrap();
        let holder = SessionHolder::new(server.connect());
        holder.sign_in("ana@example.com", "secret").await.unwrap();
        let before = holder.session().unwrap();

        holder.refresh().await.unwrap();
        let after = holder.session().unwrap();
        assert_eq!(before.user.id, after.user.id);
        assert_ne!(before.access_token, after.access_token);
    }

    #[tokio::test]
    async fn test_external_sign_out_event() {
        let server = MemoryBackend::new();
        server.register("ana@example.com", "secret").unwrap();
        let client = server.connect();
        let holder = SessionHolder::new(client.clone());
        let mut events = holder.auth_events();
        holder.sign_in("ana@example.com", "secret").await.unwrap();

        client.expire_session();
        // SignedIn first, then the external SignedOut
        let _ = events.recv().await.unwrap();
        let event = events.recv().await.unwrap();
        assert_eq!(event.kind, AuthEventKind::SignedOut);

        holder.apply_auth_event(&event);
        assert!(holder.current_user().is_none());
    }

    #[tokio::test]
    async fn test_reconcile_skips_superseded_events() {
        let server = MemoryBackend::new();
        server.register("ana@example.com", "secret").unwrap();
        let holder = SessionHolder::new(server.connect());
        let mut events = holder.auth_events();

        holder.sign_in("ana@example.com", "secret").await.unwrap();
        holder.sign_out().await;
        holder.sign_in("ana@example.com", "secret").await.unwrap();
        let live = holder.session().unwrap();

        let first_sign_in = events.recv().await.unwrap();
        let sign_out = events.recv().await.unwrap();
        let second_sign_in = events.recv().await.unwrap();
        assert_eq!(sign_out.kind, AuthEventKind::SignedOut);

        assert!(!holder.reconcile(&first_sign_in).await);
        assert!(!holder.reconcile(&sign_out).await);
        assert_eq!(holder.session(), Some(live.clone()));

        assert!(holder.reconcile(&second_sign_in).await);
        assert_eq!(holder.session(), Some(live));
    }

    #[tokio::test]
    async fn test_reconcile_applies_current_sign_out() {
        let server = MemoryBackend::new();
        server.register("ana@example.com", "secret").unwrap();
        let client = server.connect();
        let holder = SessionHolder::new(client.clone());
        let mut events = holder.auth_events();
        holder.sign_in("ana@example.com", "secret").await.unwrap();

        client.expire_session();
        let _ = events.recv().await.unwrap();
        let event = events.recv().await.unwrap();

        assert!(holder.reconcile(&event).await);
        assert!(holder.current_user().is_none());
    }

    #[tokio::test]
    async fn test_oauth_dismissed_stays_anonymous() {
        let server = MemoryBackend::new();
        let holder = SessionHolder::new(server.connect());
        let user = holder
            .sign_in_with_oauth(AuthProvider::Google, "travelerhub://auth/callback")
            .await
            .unwrap();
        assert!(user.is_none());
        assert_eq!(holder.state(), SessionState::Anonymous);
    }
}
