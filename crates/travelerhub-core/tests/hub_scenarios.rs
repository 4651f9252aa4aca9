//! End-to-end scenarios driving a full Hub against the in-process backend
//!
//! ## Test Scenarios
//!
//! 1. **Message echo**: a sent message and its insert event yield one entry
//! 2. **Concurrent subscribe**: two racing subscribes open one channel
//! 3. **Favorites**: add, fetch, then a backend delete removes it live
//! 4. **Anonymous fetch**: no identity leaves caches empty and idle
//! 5. **Sign-out**: every cache is emptied and every channel closed
//! 6. **Re-sign-in**: a late sign-out event leaves the new session alone
//! 7. **Restart**: persisted caches come back from a redb file

use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use tempfile::TempDir;
use tokio::time::sleep;
use travelerhub_core::{
    AuthProvider, Backend, ConversationId, Coordinates, Hub, HubConfig, KeyValueStore,
    MemoryBackend, MemoryClient, NewPost, NewProfile, Query, RedbStore, SessionState, UserId,
};

// ============================================================================
// Test Utilities
// ============================================================================

struct Traveler {
    hub: Hub,
    client: Arc<MemoryClient>,
    id: UserId,
}

async fn traveler(server: &MemoryBackend, email: &str) -> Traveler {
    traveler_with_store(server, email, None).await
}

async fn traveler_with_store(
    server: &MemoryBackend,
    email: &str,
    store: Option<Arc<dyn KeyValueStore>>,
) -> Traveler {
    server.register(email, "secret").unwrap();
    let client = server.connect();
    let hub = Hub::new(Backend::from_client(client.clone()), store, HubConfig::default());
    hub.start().await;
    let user = hub.sign_in(email, "secret").await.unwrap().unwrap();
    Traveler {
        hub,
        client,
        id: user.id,
    }
}

fn profile(nickname: &str, lat: f64, lng: f64) -> NewProfile {
    NewProfile {
        nickname: nickname.to_string(),
        birth_date: NaiveDate::from_ymd_opt(1990, 1, 1).unwrap(),
        bio: Some("Slow travel".to_string()),
        last_location: Some(Coordinates::new(lat, lng)),
        tags: None,
        provider: AuthProvider::Email,
    }
}

/// Poll `cond` until it holds, failing the test after one second
async fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
    for _ in 0..100 {
        if cond() {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn test_sent_message_and_its_event_yield_one_entry() {
    let server = MemoryBackend::new();
    let ana = traveler(&server, "ana@example.com").await;
    let bo = traveler(&server, "bo@example.com").await;
    ana.hub.subscribe_all().await;

    let c1 = ConversationId::from("c1");
    let sent = ana
        .hub
        .chat()
        .send_message(&c1, &bo.id, "hi")
        .await
        .unwrap();
    wait_for("message event", || !ana.hub.chat().messages(&c1).is_empty()).await;
    sleep(Duration::from_millis(30)).await;

    let messages = ana.hub.chat().messages(&c1);
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].id, sent.id);
    assert_eq!(messages[0].sender_id, ana.id);
    assert_eq!(messages[0].receiver_id, bo.id);
}

#[tokio::test]
async fn test_concurrent_subscribe_opens_one_channel() {
    let server = MemoryBackend::new();
    let ana = traveler(&server, "ana@example.com").await;
    let posts = ana.hub.posts();

    let (first, second) = tokio::join!(posts.subscribe(), posts.subscribe());
    assert!(first ^ second);
    assert_eq!(server.channels_on("posts"), 1);

    assert!(posts.unsubscribe().await);
    assert!(!posts.unsubscribe().await);
    assert_eq!(server.channels_on("posts"), 0);
}

#[tokio::test]
async fn test_favorite_added_fetched_then_removed_by_event() {
    let server = MemoryBackend::new();
    let ana = traveler(&server, "ana@example.com").await;
    let bo = traveler(&server, "bo@example.com").await;
    ana.hub
        .profiles()
        .create_profile(&profile("ana", 41.1579, -8.6291))
        .await
        .unwrap();
    bo.hub
        .profiles()
        .create_profile(&profile("bo", 41.1496, -8.6110))
        .await
        .unwrap();
    ana.hub.subscribe_all().await;

    ana.hub.interests().add_favorite(&bo.id).await.unwrap();
    ana.hub.profiles().fetch_favorites(-8.6291, 41.1579).await;
    let favorites = ana.hub.profiles().favorites();
    assert_eq!(favorites.len(), 1);
    assert_eq!(favorites[0].profile.id, bo.id);
    assert!(ana.hub.interests().is_favorite(&bo.id));

    server
        .delete_where(
            &Query::from("profile_interests")
                .eq("profile_id", ana.id.as_str())
                .eq("target_profile_id", bo.id.as_str()),
        )
        .unwrap();
    wait_for("favorite removal", || !ana.hub.interests().is_favorite(&bo.id)).await;
}

#[tokio::test]
async fn test_fetch_without_identity_is_a_quiet_noop() {
    let server = MemoryBackend::new();
    server
        .seed(
            "posts",
            vec![serde_json::json!({
                "user_id": "someone",
                "type": "travelmate",
                "expires_at": (chrono::Utc::now() + chrono::Duration::hours(2)).to_rfc3339(),
            })],
        )
        .unwrap();

    let hub = Hub::new(
        Backend::from_client(server.connect()),
        None,
        HubConfig::default(),
    );
    assert!(hub.start().await.is_none());
    assert_eq!(hub.session().state(), SessionState::Anonymous);

    hub.fetch_all().await;
    assert!(hub.posts().is_empty());
    assert!(!hub.posts().is_loading());
    assert!(hub.chat().conversations().is_empty());
    assert!(!hub.chat().is_loading());
    assert!(!hub.subscribe_all().await);
    assert_eq!(server.open_channel_count(), 0);
}

#[tokio::test]
async fn test_create_then_fetch_holds_post_once() {
    let server = MemoryBackend::new();
    let ana = traveler(&server, "ana@example.com").await;
    ana.hub.subscribe_all().await;

    let post = ana
        .hub
        .posts()
        .create_post(&NewPost::postcard("Douro valley", chrono::Duration::hours(6)))
        .await
        .unwrap();
    ana.hub.posts().fetch().await;
    sleep(Duration::from_millis(30)).await;

    let matching = ana
        .hub
        .posts()
        .items()
        .into_iter()
        .filter(|p| p.id == post.id)
        .count();
    assert_eq!(matching, 1);
}

#[tokio::test]
async fn test_sign_out_resets_everything() {
    let server = MemoryBackend::new();
    let ana = traveler(&server, "ana@example.com").await;
    let bo = traveler(&server, "bo@example.com").await;
    ana.hub
        .profiles()
        .create_profile(&profile("ana", 38.7223, -9.1393))
        .await
        .unwrap();
    assert!(ana.hub.subscribe_all().await);
    bo.hub.subscribe_all().await;

    let c1 = ana.hub.chat().conversation_id_for(&bo.id);
    ana.hub.chat().send_message(&c1, &bo.id, "bye").await.unwrap();
    ana.hub
        .posts()
        .create_post(&NewPost::postcard("Last stop", chrono::Duration::hours(1)))
        .await
        .unwrap();
    ana.hub.interests().add_favorite(&bo.id).await.unwrap();
    wait_for("message", || !ana.hub.chat().messages(&c1).is_empty()).await;
    wait_for("both online", || ana.hub.presence().online_ids().len() == 2).await;

    ana.hub.sign_out().await;

    assert!(ana.hub.session().current_user().is_none());
    assert!(ana.hub.profiles().my_profile().is_none());
    assert!(ana.hub.chat().messages(&c1).is_empty());
    assert!(ana.hub.chat().conversations().is_empty());
    assert!(ana.hub.posts().is_empty());
    assert!(ana.hub.interests().is_empty());
    assert!(ana.hub.viewers().is_empty());
    assert!(!ana.hub.presence().is_active().await);
    assert!(ana.hub.presence().online_ids().is_empty());
    assert!(!ana.hub.posts().is_subscribed().await);
    assert!(!ana.hub.chat().is_subscribed().await);

    // Only bo's channels are left
    wait_for("ana offline for bo", || {
        !bo.hub.presence().is_online(&ana.id)
    })
    .await;
    assert_eq!(server.channels_on("messages"), 1);
}

#[tokio::test]
async fn test_external_sign_out_resets_through_listener() {
    let server = MemoryBackend::new();
    let ana = traveler(&server, "ana@example.com").await;
    ana.hub.subscribe_all().await;
    ana.hub
        .posts()
        .create_post(&NewPost::postcard("Évora", chrono::Duration::hours(1)))
        .await
        .unwrap();
    // Let the listener drain the SignedIn event first
    sleep(Duration::from_millis(30)).await;

    ana.client.expire_session();
    wait_for("listener reset", || ana.hub.posts().is_empty()).await;
    wait_for("session cleared", || ana.hub.session().current_user().is_none()).await;
    assert_eq!(server.channels_on("posts"), 0);
}

#[tokio::test]
async fn test_signing_back_in_survives_delayed_sign_out_event() {
    let server = MemoryBackend::new();
    let ana = traveler(&server, "ana@example.com").await;
    ana.hub.subscribe_all().await;

    ana.hub.sign_out().await;
    ana.hub.sign_in("ana@example.com", "secret").await.unwrap();
    assert!(ana.hub.subscribe_all().await);
    ana.hub
        .posts()
        .create_post(&NewPost::postcard("Back in Lisbon", chrono::Duration::hours(2)))
        .await
        .unwrap();

    // The listener now sees SignedIn, SignedOut, SignedIn from the old sessions
    sleep(Duration::from_millis(50)).await;

    assert_eq!(ana.hub.session().user_id(), Some(ana.id.clone()));
    assert!(ana.hub.posts().is_subscribed().await);
    assert!(ana.hub.chat().is_subscribed().await);
    assert!(ana.hub.presence().is_active().await);
    assert_eq!(ana.hub.posts().len(), 1);
    assert_eq!(server.channels_on("posts"), 1);
}

#[tokio::test]
async fn test_token_refresh_reloads_my_profile() {
    let server = MemoryBackend::new();
    let ana = traveler(&server, "ana@example.com").await;
    ana.hub
        .profiles()
        .create_profile(&profile("ana", 37.0194, -7.9304))
        .await
        .unwrap();
    sleep(Duration::from_millis(30)).await;

    ana.hub.profiles().reset();
    assert!(ana.hub.profiles().my_profile().is_none());

    ana.hub.session().refresh().await.unwrap();
    wait_for("profile reload", || ana.hub.profiles().my_profile().is_some()).await;
    assert_eq!(ana.hub.profiles().my_profile().unwrap().id, ana.id);
}

#[tokio::test]
async fn test_caches_survive_restart() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("cache.redb");
    let server = MemoryBackend::new();
    let bo = traveler(&server, "bo@example.com").await;

    let store: Arc<dyn KeyValueStore> = Arc::new(RedbStore::open(&path).unwrap());

    let c1;
    {
        let ana = traveler_with_store(&server, "ana@example.com", Some(store.clone())).await;
        ana.hub.subscribe_all().await;

        c1 = ana.hub.chat().conversation_id_for(&bo.id);
        ana.hub.chat().send_message(&c1, &bo.id, "remember me").await.unwrap();
        ana.hub
            .posts()
            .create_post(&NewPost::postcard("Coimbra", chrono::Duration::hours(3)))
            .await
            .unwrap();
        wait_for("message", || !ana.hub.chat().messages(&c1).is_empty()).await;
        ana.hub.shutdown().await;
    }

    // A fresh hub on the same file: nothing fetched, everything hydrated
    let hub = Hub::new(
        Backend::from_client(server.connect()),
        Some(store.clone()),
        HubConfig::default(),
    );
    assert!(hub.start().await.is_none());
    assert_eq!(hub.chat().messages(&c1).len(), 1);
    assert_eq!(hub.chat().messages(&c1)[0].content, "remember me");
    assert_eq!(hub.posts().len(), 1);

    hub.reset_all().await;
    assert!(store.get("posts-storage").unwrap().is_none());
    assert!(store.get("chat-storage").unwrap().is_none());
}

#[tokio::test]
async fn test_oauth_sign_in_loads_profile() {
    let server = MemoryBackend::new();
    server
        .register_oauth(AuthProvider::Google, "cy@example.com")
        .unwrap();
    let client = server.connect();
    let hub = Hub::new(
        Backend::from_client(client.clone()),
        None,
        HubConfig::default(),
    );
    hub.start().await;

    // Dismissed browser: no session, no error
    assert!(hub
        .sign_in_with_oauth(AuthProvider::Google)
        .await
        .unwrap()
        .is_none());

    client.complete_oauth_as(Some("cy@example.com"));
    let user = hub
        .sign_in_with_oauth(AuthProvider::Google)
        .await
        .unwrap()
        .unwrap();
    let mut draft = profile("cy", 40.4168, -3.7038);
    draft.provider = AuthProvider::Google;
    hub.profiles().create_profile(&draft).await.unwrap();

    let mine = hub.profiles().my_profile().unwrap();
    assert_eq!(mine.id, user.id);
    assert_eq!(mine.public.provider, AuthProvider::Google);
}

#[tokio::test]
async fn test_rejected_credentials_surface_to_caller() {
    let server = MemoryBackend::new();
    server.register("ana@example.com", "secret").unwrap();
    let hub = Hub::new(
        Backend::from_client(server.connect()),
        None,
        HubConfig::default(),
    );
    hub.start().await;

    let err = hub.sign_in("ana@example.com", "wrong").await.unwrap_err();
    assert!(err.to_string().contains("Invalid login credentials"));
    assert_eq!(hub.session().state(), SessionState::Anonymous);
}
