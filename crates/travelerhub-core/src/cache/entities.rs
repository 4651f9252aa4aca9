//! Posts, favorites and profile views as [`SyncedCache`] instantiations.
//!
//! | cache    | table               | content                    | new rows | events        | create  |
//! |----------|---------------------|----------------------------|----------|---------------|---------|
//! | posts    | `posts`             | every non-expired post     | first    | all           | refetch |
//! | interest | `profile_interests` | my outgoing favorites      | last     | insert/delete | refetch |
//! | viewers  | `profile_viewers`   | who viewed me, newest first| first    | insert        | refetch |

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{info, warn};

use super::{CacheEntity, CreatePolicy, MergePosition, SyncedCache, SyncedEntity};
use crate::backend::{ChannelFilter, EventMask, Query};
use crate::types::{Interest, NewInterest, NewPost, NewViewer, Post, PostId, UserId, Viewer};

pub type PostCache = SyncedCache<Post>;
pub type InterestCache = SyncedCache<Interest>;
pub type ViewerCache = SyncedCache<Viewer>;

fn str_column<'a>(row: &'a Value, column: &str) -> Option<&'a str> {
    row.get(column)?.as_str()
}

impl CacheEntity for Post {
    type Key = PostId;
    const TABLE: &'static str = "posts";

    fn key(&self) -> PostId {
        self.id.clone()
    }

    fn key_of_row(row: &Value) -> Option<PostId> {
        str_column(row, "id").map(PostId::from)
    }
}

impl SyncedEntity for Post {
    const STORAGE_KEY: &'static str = "posts-storage";
    const OWNER_COLUMN: &'static str = "user_id";
    const MERGE_POSITION: MergePosition = MergePosition::Prepend;
    const EVENTS: EventMask = EventMask::ALL;
    const CREATE_POLICY: CreatePolicy = CreatePolicy::Refetch;

    fn fetch_query(_me: &UserId, now: DateTime<Utc>) -> Query {
        Query::from(Self::TABLE)
            .gt("expires_at", now.to_rfc3339())
            .order("created_at", false)
    }
}

impl CacheEntity for Interest {
    type Key = UserId;
    const TABLE: &'static str = "profile_interests";

    /// One edge per target, so the target identifies it
    fn key(&self) -> UserId {
        self.target_profile_id.clone()
    }

    fn key_of_row(row: &Value) -> Option<UserId> {
        str_column(row, "target_profile_id").map(UserId::from)
    }
}

impl SyncedEntity for Interest {
    const STORAGE_KEY: &'static str = "interests-storage";
    const OWNER_COLUMN: &'static str = "profile_id";
    const MERGE_POSITION: MergePosition = MergePosition::Append;
    const EVENTS: EventMask = EventMask::INSERT_DELETE;
    const CREATE_POLICY: CreatePolicy = CreatePolicy::Refetch;

    fn fetch_query(me: &UserId, _now: DateTime<Utc>) -> Query {
        Query::from(Self::TABLE)
            .eq("profile_id", me.as_str())
            .order("created_at", true)
    }

    fn channel_filter(me: &UserId) -> Option<ChannelFilter> {
        Some(ChannelFilter::eq("profile_id", me.as_str()))
    }
}

impl CacheEntity for Viewer {
    type Key = String;
    const TABLE: &'static str = "profile_viewers";

    fn key(&self) -> String {
        self.id.clone()
    }

    fn key_of_row(row: &Value) -> Option<String> {
        str_column(row, "id").map(str::to_string)
    }
}

impl SyncedEntity for Viewer {
    const STORAGE_KEY: &'static str = "viewers-storage";
    const OWNER_COLUMN: &'static str = "viewer_id";
    const MERGE_POSITION: MergePosition = MergePosition::Prepend;
    const EVENTS: EventMask = EventMask::INSERT_ONLY;
    const CREATE_POLICY: CreatePolicy = CreatePolicy::Refetch;

    fn fetch_query(me: &UserId, now: DateTime<Utc>) -> Query {
        Query::from(Self::TABLE)
            .eq("profile_id", me.as_str())
            .gt("expires_at", now.to_rfc3339())
            .order("viewed_at", false)
    }

    fn channel_filter(me: &UserId) -> Option<ChannelFilter> {
        Some(ChannelFilter::eq("profile_id", me.as_str()))
    }
}

impl SyncedCache<Post> {
    pub async fn create_post(&self, draft: &NewPost) -> Option<Post> {
        self.create(draft).await
    }

    /// Posts owned by `user`, in feed order
    pub fn posts_by(&self, user: &UserId) -> Vec<Post> {
        self.items()
            .into_iter()
            .filter(|p| &p.user_id == user)
            .collect()
    }
}

impl SyncedCache<Interest> {
    /// Mark `target` as a favorite of the current identity
    pub async fn add_favorite(&self, target: &UserId) -> Option<Interest> {
        self.create(&NewInterest {
            target_profile_id: target.clone(),
        })
        .await
    }

    /// Drop `target` from my favorites. Returns whether a row was deleted.
    pub async fn remove_favorite(&self, target: &UserId) -> bool {
        let Some(me) = self.inner.session.user_id() else {
            warn!(table = Interest::TABLE, "Remove attempted without identity");
            return false;
        };
        let query = Query::from(Interest::TABLE)
            .eq("profile_id", me.as_str())
            .eq("target_profile_id", target.as_str());
        match self.inner.data.delete(&query).await {
            Ok(rows) if rows.is_empty() => false,
            Ok(_) => {
                info!(user_id = %me, target = %target, "Removed favorite");
                self.fetch().await;
                true
            }
            Err(e) => {
                warn!(table = Interest::TABLE, error = %e, "Delete failed");
                false
            }
        }
    }

    pub fn is_favorite(&self, target: &UserId) -> bool {
        self.contains_key(target)
    }
}

impl SyncedCache<Viewer> {
    /// Record that the current identity viewed `profile_id`
    pub async fn add_viewer(&self, profile_id: &UserId) -> Option<Viewer> {
        self.create(&NewViewer {
            profile_id: profile_id.clone(),
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Backend, MemoryBackend};
    use crate::session::SessionHolder;
    use crate::storage::{KeyValueStore, MemoryStore};
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    async fn signed_in(server: &MemoryBackend, email: &str) -> (Backend, SessionHolder, UserId) {
        let user = server.register(email, "secret").unwrap();
        let backend = Backend::from_client(server.connect());
        let session = SessionHolder::new(backend.identity.clone());
        session.sign_in(email, "secret").await.unwrap();
        (backend, session, user.id)
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
    async fn test_fetch_skips_expired_posts() {
        let server = MemoryBackend::new();
        let (backend, session, me) = signed_in(&server, "ana@example.com").await;
        let now = Utc::now();
        server
            .seed(
                "posts",
                vec![
                    json!({"user_id": me.as_str(), "type": "postcard",
                           "expires_at": (now + chrono::Duration::hours(1)).to_rfc3339()}),
                    json!({"user_id": me.as_str(), "type": "postcard",
                           "expires_at": (now - chrono::Duration::hours(1)).to_rfc3339()}),
                ],
            )
            .unwrap();

        let posts = PostCache::new(session, &backend, None);
        posts.fetch().await;
        assert_eq!(posts.len(), 1);
        assert!(!posts.is_loading());
    }

    #[tokio::test]
    async fn test_create_post_then_fetch_has_it_once() {
        let server = MemoryBackend::new();
        let (backend, session, me) = signed_in(&server, "ana@example.com").await;
        let posts = PostCache::new(session, &backend, None);
        posts.subscribe().await;

        let created = posts
            .create_post(&NewPost::postcard("Lisbon", chrono::Duration::hours(24)))
            .await
            .unwrap();
        assert_eq!(created.user_id, me);
        posts.fetch().await;

        // The insert event lands after the refetch; still one copy
        tokio::time::sleep(Duration::from_millis(50)).await;
        let ids: Vec<_> = posts.items().into_iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![created.id]);
    }

    #[tokio::test]
    async fn test_post_update_event_replaces_known_post() {
        let server = MemoryBackend::new();
        let (backend, session, _) = signed_in(&server, "ana@example.com").await;
        let posts = PostCache::new(session, &backend, None);
        let created = posts
            .create_post(&NewPost::postcard("before", chrono::Duration::hours(24)))
            .await
            .unwrap();
        posts.subscribe().await;

        server
            .update_where(
                &Query::from("posts").eq("id", created.id.as_str()),
                json!({"description": "after"}),
            )
            .unwrap();
        wait_for(|| {
            posts.get(&created.id).and_then(|p| p.description) == Some("after".to_string())
        })
        .await;
        assert_eq!(posts.len(), 1);
    }

    #[tokio::test]
    async fn test_favorites_follow_insert_and_delete_events() {
        let server = MemoryBackend::new();
        let (backend, session, me) = signed_in(&server, "ana@example.com").await;
        let bo = UserId::from("bo");
        let interests = InterestCache::new(session, &backend, None);
        assert!(interests.subscribe().await);

        interests.add_favorite(&bo).await.unwrap();
        assert!(interests.is_favorite(&bo));

        server
            .delete_where(
                &Query::from("profile_interests")
                    .eq("profile_id", me.as_str())
                    .eq("target_profile_id", "bo"),
            )
            .unwrap();
        wait_for(|| !interests.is_favorite(&bo)).await;
    }

    #[tokio::test]
    async fn test_remove_favorite() {
        let server = MemoryBackend::new();
        let (backend, session, _) = signed_in(&server, "ana@example.com").await;
        let interests = InterestCache::new(session, &backend, None);
        let bo = UserId::from("bo");

        interests.add_favorite(&bo).await.unwrap();
        assert!(interests.remove_favorite(&bo).await);
        assert!(!interests.is_favorite(&bo));
        assert!(!interests.remove_favorite(&bo).await);
    }

    #[tokio::test]
    async fn test_viewers_only_shows_views_of_me() {
        let server = MemoryBackend::new();
        let (ana_backend, ana_session, ana) = signed_in(&server, "ana@example.com").await;
        let (bo_backend, bo_session, _) = signed_in(&server, "bo@example.com").await;

        let ana_viewers = ViewerCache::new(ana_session, &ana_backend, None);
        let bo_viewers = ViewerCache::new(bo_session, &bo_backend, None);
        assert!(ana_viewers.subscribe().await);

        bo_viewers.add_viewer(&ana).await.unwrap();
        assert!(bo_viewers.is_empty());
        wait_for(|| ana_viewers.len() == 1).await;
    }

    #[tokio::test]
    async fn test_reset_clears_items_channel_and_storage() {
        let server = MemoryBackend::new();
        let (backend, session, _) = signed_in(&server, "ana@example.com").await;
        let store = Arc::new(MemoryStore::new());
        let posts = PostCache::new(session, &backend, Some(store.clone()));
        posts.subscribe().await;
        posts
            .create_post(&NewPost::postcard("Porto", chrono::Duration::hours(24)))
            .await
            .unwrap();
        assert!(store.get("posts-storage").unwrap().is_some());

        posts.reset().await;
        assert!(posts.is_empty());
        assert!(!posts.is_loading());
        assert!(!posts.is_subscribed().await);
        assert_eq!(server.open_channel_count(), 0);
        assert!(store.get("posts-storage").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_hydrate_restores_persisted_items() {
        let server = MemoryBackend::new();
        let (backend, session, _) = signed_in(&server, "ana@example.com").await;
        let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());

        let first = PostCache::new(session.clone(), &backend, Some(store.clone()));
        first
            .create_post(&NewPost::postcard("Faro", chrono::Duration::hours(24)))
            .await
            .unwrap();

        let second = PostCache::new(session, &backend, Some(store));
        assert_eq!(second.hydrate(), 1);
        assert_eq!(second.items(), first.items());
    }
}
