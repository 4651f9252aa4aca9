//! Profile lookups: my own profile, travelers nearby, favorites nearby and
//! the profiles of recent viewers. None of these have a realtime feed; they
//! are refreshed on demand.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde_json::{json, Value};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::{decode_rows, CacheEntity, SyncedEntity};
use crate::backend::{Backend, DataStore, Query};
use crate::error::{HubError, HubResult};
use crate::session::SessionHolder;
use crate::types::{NearbyProfile, NewProfile, Profile, PublicProfile, UserId, Viewer};

const PROFILES: &str = "profiles";

#[derive(Default)]
struct ProfileState {
    mine: Option<Profile>,
    nearby: Vec<NearbyProfile>,
    favorites: Vec<NearbyProfile>,
    viewers: Vec<PublicProfile>,
    loading: bool,
}

struct ProfileInner {
    session: SessionHolder,
    data: Arc<dyn DataStore>,
    favorites_limit: usize,
    state: RwLock<ProfileState>,
    revision: watch::Sender<u64>,
}

/// On-demand profile lookups for the current identity
#[derive(Clone)]
pub struct ProfileCache {
    inner: Arc<ProfileInner>,
}

impl ProfileCache {
    pub fn new(session: SessionHolder, backend: &Backend, favorites_limit: usize) -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            inner: Arc::new(ProfileInner {
                session,
                data: backend.data.clone(),
                favorites_limit,
                state: RwLock::new(ProfileState::default()),
                revision,
            }),
        }
    }

    /// Load the current identity's own profile
    pub async fn fetch_my_profile(&self) -> Option<Profile> {
        let me = self.inner.session.user_id()?;
        self.set_loading(true);

        let query = Query::from(PROFILES).eq("id", me.as_str()).limit(1);
        let result = self.inner.data.select(&query).await;
        let profile = match result {
            Ok(rows) => decode_rows::<Profile>(PROFILES, rows).into_iter().next(),
            Err(e) => {
                warn!(user_id = %me, error = %e, "Profile fetch failed");
                self.set_loading(false);
                return self.my_profile();
            }
        };

        {
            let mut state = self.inner.state.write();
            state.mine = profile.clone();
            state.loading = false;
        }
        debug!(user_id = %me, found = profile.is_some(), "Fetched my profile");
        self.inner.changed();
        profile
    }

    /// Travelers within `radius_meters` of a point, nearest first
    pub async fn fetch_nearby_profiles(&self, lng: f64, lat: f64, radius_meters: f64) {
        if self.inner.session.user_id().is_none() {
            debug!("No identity, skipping nearby fetch");
            return;
        }
        let params = json!({
            "user_lng": lng,
            "user_lat": lat,
            "radius_meters": radius_meters,
        });
        if let Some(rows) = self.call("nearby_profiles", params).await {
            let nearby = decode_rows::<NearbyProfile>(PROFILES, rows);
            debug!(count = nearby.len(), radius_meters, "Fetched nearby profiles");
            self.inner.state.write().nearby = nearby;
            self.inner.changed();
        }
    }

    /// My favorites ranked by distance from a point.
    ///
    /// Needs my profile to be loaded first.
    pub async fn fetch_favorites(&self, lng: f64, lat: f64) {
        let Some(mine) = self.my_profile() else {
            warn!("My profile is not loaded, skipping favorites fetch");
            return;
        };
        let params = json!({
            "p_profile_id": mine.id.as_str(),
            "p_lng": lng,
            "p_lat": lat,
            "p_limit": self.inner.favorites_limit,
        });
        if let Some(rows) = self.call("get_favorites_nearby", params).await {
            let favorites = decode_rows::<NearbyProfile>(PROFILES, rows);
            debug!(count = favorites.len(), "Fetched favorites");
            self.inner.state.write().favorites = favorites;
            self.inner.changed();
        }
    }

    /// Public profiles of everyone who viewed me recently, newest view first
    pub async fn fetch_profile_viewers(&self) {
        let Some(me) = self.inner.session.user_id() else {
            debug!("No identity, skipping viewer profiles fetch");
            return;
        };
        self.set_loading(true);

        let views = match self
            .inner
            .data
            .select(&Viewer::fetch_query(&me, Utc::now()))
            .await
        {
            Ok(rows) => decode_rows::<Viewer>(Viewer::TABLE, rows),
            Err(e) => {
                warn!(user_id = %me, error = %e, "Viewer fetch failed");
                self.set_loading(false);
                return;
            }
        };

        let mut seen = BTreeSet::new();
        let mut profiles = Vec::new();
        for view in views {
            if !seen.insert(view.viewer_id.clone()) {
                continue;
            }
            match self.public_profile(&view.viewer_id).await {
                Ok(Some(profile)) => profiles.push(profile),
                Ok(None) => {}
                Err(e) => warn!(viewer_id = %view.viewer_id, error = %e, "Viewer profile fetch failed"),
            }
        }

        {
            let mut state = self.inner.state.write();
            state.viewers = profiles;
            state.loading = false;
        }
        self.inner.changed();
    }

    /// Create the current identity's profile, then load it.
    ///
    /// Unlike the other operations, failures are returned to the caller.
    pub async fn create_profile(&self, draft: &NewProfile) -> HubResult<()> {
        let user = self
            .inner
            .session
            .current_user()
            .ok_or(HubError::NotAuthenticated)?;

        let mut row = match serde_json::to_value(draft)? {
            Value::Object(row) => row,
            _ => return Err(HubError::Serialization("profile draft is not an object".into())),
        };
        row.insert("id".into(), Value::String(user.id.to_string()));
        row.insert("email".into(), json!(user.email));
        row.insert("email_verified".into(), json!(user.email_confirmed_at.is_some()));

        self.inner.data.insert(PROFILES, vec![Value::Object(row)]).await?;
        info!(user_id = %user.id, "Created profile");

        self.fetch_my_profile().await;
        Ok(())
    }

    pub fn reset(&self) {
        *self.inner.state.write() = ProfileState::default();
        debug!("Profile cache reset");
        self.inner.changed();
    }

    pub fn my_profile(&self) -> Option<Profile> {
        self.inner.state.read().mine.clone()
    }

    pub fn nearby(&self) -> Vec<NearbyProfile> {
        self.inner.state.read().nearby.clone()
    }

    pub fn favorites(&self) -> Vec<NearbyProfile> {
        self.inner.state.read().favorites.clone()
    }

    pub fn viewers(&self) -> Vec<PublicProfile> {
        self.inner.state.read().viewers.clone()
    }

    pub fn is_loading(&self) -> bool {
        self.inner.state.read().loading
    }

    pub fn watch(&self) -> watch::Receiver<u64> {
        self.inner.revision.subscribe()
    }

    async fn call(&self, name: &str, params: Value) -> Option<Vec<Value>> {
        self.set_loading(true);
        let result = self.inner.data.rpc(name, params).await;
        self.set_loading(false);
        match result {
            Ok(rows) => Some(rows),
            Err(e) => {
                warn!(rpc = name, error = %e, "Remote procedure failed");
                None
            }
        }
    }

    async fn public_profile(&self, id: &UserId) -> HubResult<Option<PublicProfile>> {
        let query = Query::from(PROFILES).eq("id", id.as_str()).limit(1);
        let rows = self.inner.data.select(&query).await?;
        Ok(decode_rows::<PublicProfile>(PROFILES, rows).into_iter().next())
    }

    fn set_loading(&self, loading: bool) {
        self.inner.state.write().loading = loading;
    }
}

impl ProfileInner {
    fn changed(&self) {
        self.revision.send_modify(|r| *r += 1);
    }
}
