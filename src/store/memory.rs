//! Snapshot-backed store.
//!
//! [`MemoryStore`] keeps rooms, memberships, rule rows and room state in
//! memory. It is loaded from a JSON [`StoreSnapshot`] and kept current by
//! [`MemoryStore::persist_event`].
//!
//! # Snapshot Format
//!
//! ```json
//! {
//!   "members": { "!room:test": ["@alice:test", "@bob:test"] },
//!   "push_rules": {
//!     "@alice:test": [{
//!       "rule_id": "global/content/hello",
//!       "priority_class": 4,
//!       "conditions": "[{\"kind\": \"event_match\", \"key\": \"content.body\", \"pattern\": \"hello\"}]",
//!       "actions": "[\"notify\"]"
//!     }]
//!   },
//!   "guests": [],
//!   "room_state": { "!room:test": [] }
//! }
//! ```

use super::{PushStore, StateMap, StoreError, VisibilityFilter};
use crate::event::{RoomEvent, MEMBER_EVENT_TYPE};
use crate::rules::RawRule;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::fs;
use std::path::Path;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Everything a [`MemoryStore`] holds.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct StoreSnapshot {
    /// Joined members per room
    #[serde(default)]
    pub members: HashMap<String, BTreeSet<String>>,

    /// Stored rule rows per user
    #[serde(default)]
    pub push_rules: HashMap<String, Vec<RawRule>>,

    /// Guest accounts
    #[serde(default)]
    pub guests: BTreeSet<String>,

    /// Current state events per room
    #[serde(default)]
    pub room_state: HashMap<String, Vec<RoomEvent>>,

    /// State recorded at each persisted event
    #[serde(default)]
    pub event_state: HashMap<String, Vec<RoomEvent>>,
}

/// Events whose state is kept by default.
pub const DEFAULT_STATE_HISTORY: usize = 1024;

/// In-memory [`PushStore`].
///
/// State is recorded for at most `state_history` events; once full, the
/// oldest recorded event is forgotten and its state lookups come back empty.
#[derive(Debug)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
    state_history: usize,
}

#[derive(Debug, Default)]
struct Inner {
    snapshot: StoreSnapshot,
    /// Event ids in `snapshot.event_state`, oldest first
    recorded: VecDeque<String>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(StoreSnapshot::default())
    }
}

impl MemoryStore {
    pub fn new(snapshot: StoreSnapshot) -> Self {
        let mut recorded: VecDeque<String> = snapshot.event_state.keys().cloned().collect();
        recorded.make_contiguous().sort();

        let mut store = Self {
            inner: RwLock::new(Inner { snapshot, recorded }),
            state_history: DEFAULT_STATE_HISTORY,
        };
        store.trim_history();
        store
    }

    /// Keep state for at most `events` events (at least one).
    pub fn with_state_history(mut self, events: usize) -> Self {
        self.state_history = events.max(1);
        self.trim_history();
        self
    }

    fn trim_history(&mut self) {
        let limit = self.state_history;
        self.inner.get_mut().evict_beyond(limit);
    }

    /// Number of events whose state is currently recorded.
    pub async fn recorded_events(&self) -> usize {
        self.inner.read().await.recorded.len()
    }

    /// Load a JSON snapshot from disk.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|e| StoreError::Snapshot(format!("{}: {}", path.display(), e)))?;
        let snapshot: StoreSnapshot = serde_json::from_str(&content)
            .map_err(|e| StoreError::Snapshot(format!("{}: {}", path.display(), e)))?;

        info!(
            path = %path.display(),
            rooms = snapshot.members.len(),
            users_with_rules = snapshot.push_rules.len(),
            "Loaded store snapshot"
        );

        Ok(Self::new(snapshot))
    }

    /// Store rule rows for a user, replacing any previous ones.
    pub async fn set_push_rules(&self, user_id: &str, rules: Vec<RawRule>) {
        self.inner
            .write()
            .await
            .snapshot
            .push_rules
            .insert(user_id.to_string(), rules);
    }

    /// Append an event to its room.
    ///
    /// Membership events update the member list, state events replace their
    /// slot in room state, and the resulting state is recorded against the
    /// event id.
    pub async fn persist_event(&self, event: &RoomEvent) {
        let mut guard = self.inner.write().await;
        let Inner { snapshot: inner, recorded } = &mut *guard;

        let member_key = event
            .state_key
            .as_ref()
            .filter(|_| event.event_type == MEMBER_EVENT_TYPE);
        if let Some(user_id) = member_key {
            let membership = event
                .content
                .get("membership")
                .and_then(|m| m.as_str())
                .unwrap_or_default();
            let members = inner.members.entry(event.room_id.clone()).or_default();
            if membership == "join" {
                members.insert(user_id.clone());
            } else {
                members.remove(user_id);
            }
        }

        let state = inner.room_state.entry(event.room_id.clone()).or_default();
        if let Some(slot) = event.state_slot() {
            match state.iter().position(|ev| ev.state_slot().as_ref() == Some(&slot)) {
                Some(idx) => state[idx] = event.clone(),
                None => state.push(event.clone()),
            }
        }
        let snapshot = state.clone();

        debug!(
            event_id = %event.event_id,
            room_id = %event.room_id,
            state_events = snapshot.len(),
            "Persisted event"
        );

        if inner
            .event_state
            .insert(event.event_id.clone(), snapshot)
            .is_none()
        {
            recorded.push_back(event.event_id.clone());
        }
        guard.evict_beyond(self.state_history);
    }
}

impl Inner {
    fn evict_beyond(&mut self, limit: usize) {
        while self.recorded.len() > limit {
            if let Some(event_id) = self.recorded.pop_front() {
                self.snapshot.event_state.remove(&event_id);
            }
        }
    }
}

#[async_trait]
impl PushStore for MemoryStore {
    async fn bulk_get_push_rules(
        &self,
        user_ids: &[String],
    ) -> Result<HashMap<String, Vec<RawRule>>, StoreError> {
        let guard = self.inner.read().await;
        let inner = &guard.snapshot;
        Ok(user_ids
            .iter()
            .filter_map(|uid| inner.push_rules.get(uid).map(|rows| (uid.clone(), rows.clone())))
            .collect())
    }

    async fn get_users_in_room(&self, room_id: &str) -> Result<HashSet<String>, StoreError> {
        let guard = self.inner.read().await;
        let inner = &guard.snapshot;
        Ok(inner
            .members
            .get(room_id)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn are_guests(&self, user_ids: &[String]) -> Result<HashMap<String, bool>, StoreError> {
        let guard = self.inner.read().await;
        let inner = &guard.snapshot;
        Ok(user_ids
            .iter()
            .map(|uid| (uid.clone(), inner.guests.contains(uid)))
            .collect())
    }

    async fn get_state_for_event(&self, event_id: &str) -> Result<StateMap, StoreError> {
        let guard = self.inner.read().await;
        let inner = &guard.snapshot;
        Ok(inner
            .event_state
            .get(event_id)
            .map(|events| {
                events
                    .iter()
                    .filter_map(|ev| ev.state_slot().map(|slot| (slot, ev.clone())))
                    .collect()
            })
            .unwrap_or_default())
    }
}

/// Visibility filter that lets every user see every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

#[async_trait]
impl VisibilityFilter for AllowAll {
    async fn filter_events_for_clients(
        &self,
        users: &[(String, bool)],
        events: &[RoomEvent],
    ) -> Result<HashMap<String, Vec<RoomEvent>>, StoreError> {
        Ok(users
            .iter()
            .map(|(uid, _)| (uid.clone(), events.to_vec()))
            .collect())
    }
}
