//! Storage and visibility collaborators.
//!
//! The evaluator never talks to a database directly. It goes through the
//! [`PushStore`] and [`VisibilityFilter`] traits, which a homeserver backs
//! with its own storage layer.
//!
//! ## Built-in Implementations
//!
//! - [`MemoryStore`]: a snapshot-backed store used by the HTTP service and tests
//! - [`AllowAll`]: a visibility filter that hides nothing
//!
//! ## Implementing a Store
//!
//! ```rust,ignore
//! use synapse_push::store::{PushStore, StoreError, StateMap};
//! use async_trait::async_trait;
//!
//! struct PostgresStore { /* pool */ }
//!
//! #[async_trait]
//! impl PushStore for PostgresStore {
//!     async fn bulk_get_push_rules(&self, user_ids: &[String])
//!         -> Result<HashMap<String, Vec<RawRule>>, StoreError> {
//!         // one query for every user
//!     }
//!     // ...
//! }
//! ```

pub mod memory;

use crate::event::RoomEvent;
use crate::rules::RawRule;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use thiserror::Error;

pub use memory::{AllowAll, MemoryStore, StoreSnapshot, DEFAULT_STATE_HISTORY};

/// Room state keyed by `(event type, state key)`.
pub type StateMap = HashMap<(String, String), RoomEvent>;

/// Errors raised by storage or visibility backends.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The backend could not be reached or the query failed
    #[error("storage backend error: {0}")]
    Backend(String),

    /// A snapshot could not be read or parsed
    #[error("failed to load snapshot: {0}")]
    Snapshot(String),
}

/// Batched reads the evaluator needs from storage.
#[async_trait]
pub trait PushStore: Send + Sync {
    /// Stored rule rows for every requested user, in one round trip.
    ///
    /// Users without rows may be missing from the map.
    async fn bulk_get_push_rules(
        &self,
        user_ids: &[String],
    ) -> Result<HashMap<String, Vec<RawRule>>, StoreError>;

    /// Current members of a room.
    async fn get_users_in_room(&self, room_id: &str) -> Result<HashSet<String>, StoreError>;

    /// Whether each requested user is a guest account.
    async fn are_guests(&self, user_ids: &[String]) -> Result<HashMap<String, bool>, StoreError>;

    /// Room state at the given event.
    async fn get_state_for_event(&self, event_id: &str) -> Result<StateMap, StoreError>;
}

/// Decides which users may see which events.
#[async_trait]
pub trait VisibilityFilter: Send + Sync {
    /// For each `(user id, is guest)` pair, the subset of `events` that user
    /// is allowed to see. Users that can see nothing may be omitted.
    async fn filter_events_for_clients(
        &self,
        users: &[(String, bool)],
        events: &[RoomEvent],
    ) -> Result<HashMap<String, Vec<RoomEvent>>, StoreError>;
}
