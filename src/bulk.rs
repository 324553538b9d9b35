//! Bulk push rule evaluation - who in a room gets notified, and how.
//!
//! The [`BulkPushRuleEvaluator`] runs every member's rules for one event. It
//! is faster than evaluating each user separately because:
//!
//! 1. all rule sets are fetched in one batched read when the evaluator is
//!    built ([`evaluator_for_room_id`]), and reused across events;
//! 2. condition results tagged with a cache identifier are computed once per
//!    event and shared across every rule and every user.
//!
//! # Evaluation
//!
//! ```text
//! Event ($ev in !room)
//!     │
//!     ▼
//! ┌──────────────────────────────────────────────┐
//! │  1. are_guests(all users)          (batched) │
//! │  2. visibility filter              (batched) │
//! │  3. display names from state at $ev          │
//! │  4. per user, in priority order:             │
//! │       skip disabled rules                    │
//! │       AND conditions (shared cache)          │
//! │       first match wins, drop dont_notify     │
//! └──────────────────────────────────────────────┘
//!     │
//!     ▼
//! { "@alice:hs": [notify, {set_tweak: sound}], ... }
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use synapse_push::{evaluator_for_room_id, BaseRules};
//! use synapse_push::store::{AllowAll, MemoryStore};
//! use std::sync::Arc;
//!
//! let store = Arc::new(MemoryStore::from_file("room_snapshot.json")?);
//! let evaluator = evaluator_for_room_id("!room:hs", store, &BaseRules::builtin()).await?;
//!
//! let actions = evaluator.action_for_event_by_user(&event, &AllowAll).await?;
//! ```

use crate::conditions::{conditions_match, BuiltinConditions, ConditionCache, ConditionError, EvaluatorFactory};
use crate::event::RoomEvent;
use crate::rules::{load_rules_for_users, Action, BaseRules, LoadError, RuleSetByUser};
use crate::store::{PushStore, StoreError, VisibilityFilter};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

/// Actions per user for one event. Users absent from the map are not notified.
pub type ActionsByUser = HashMap<String, Vec<Action>>;

/// Errors that abort an evaluation. Collaborator errors pass through as-is.
#[derive(Error, Debug)]
pub enum EvaluationError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Condition(#[from] ConditionError),
}

/// Build an evaluator for everyone currently in `room_id`.
pub async fn evaluator_for_room_id(
    room_id: &str,
    store: Arc<dyn PushStore>,
    base_rules: &BaseRules,
) -> Result<BulkPushRuleEvaluator, EvaluationError> {
    let users = store.get_users_in_room(room_id).await?;

    let mut user_ids: Vec<String> = users.iter().cloned().collect();
    user_ids.sort();
    let rules_by_user = load_rules_for_users(store.as_ref(), &user_ids, base_rules).await?;

    debug!(
        room_id = %room_id,
        users = users.len(),
        "Built bulk push rule evaluator"
    );

    Ok(BulkPushRuleEvaluator::new(room_id, rules_by_user, users, store))
}

/// Runs push rules for all users in a room.
///
/// # Thread Safety
///
/// The evaluator holds no per-event state; wrap it in `Arc` to evaluate
/// several events concurrently. Each evaluation owns its own condition cache.
pub struct BulkPushRuleEvaluator {
    room_id: String,
    rules_by_user: RuleSetByUser,
    users_in_room: HashSet<String>,
    store: Arc<dyn PushStore>,
    conditions: Arc<dyn EvaluatorFactory>,
}

impl BulkPushRuleEvaluator {
    /// Create an evaluator using the built-in condition predicates.
    pub fn new(
        room_id: impl Into<String>,
        rules_by_user: RuleSetByUser,
        users_in_room: HashSet<String>,
        store: Arc<dyn PushStore>,
    ) -> Self {
        Self {
            room_id: room_id.into(),
            rules_by_user,
            users_in_room,
            store,
            conditions: Arc::new(BuiltinConditions),
        }
    }

    /// Use a different condition evaluator.
    pub fn with_conditions(mut self, conditions: Arc<dyn EvaluatorFactory>) -> Self {
        self.conditions = conditions;
        self
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn rules_by_user(&self) -> &RuleSetByUser {
        &self.rules_by_user
    }

    pub fn users_in_room(&self) -> &HashSet<String> {
        &self.users_in_room
    }

    /// Decide, for every user with a rule set, which actions `event` triggers.
    ///
    /// # Errors
    ///
    /// Any storage, visibility or condition failure aborts the whole
    /// evaluation; no partial result is returned.
    pub async fn action_for_event_by_user(
        &self,
        event: &RoomEvent,
        filter: &dyn VisibilityFilter,
    ) -> Result<ActionsByUser, EvaluationError> {
        debug!(
            room_id = %self.room_id,
            event_id = %event.event_id,
            event_type = %event.event_type,
            users = self.rules_by_user.len(),
            "Evaluating push rules"
        );

        let user_ids: Vec<String> = self.rules_by_user.keys().cloned().collect();
        let guests = self.store.are_guests(&user_ids).await?;
        let viewers: Vec<(String, bool)> = user_ids
            .into_iter()
            .map(|uid| {
                let is_guest = guests.get(&uid).copied().unwrap_or(false);
                (uid, is_guest)
            })
            .collect();

        let visible = filter
            .filter_events_for_clients(&viewers, std::slice::from_ref(event))
            .await?;

        let display_names = self.display_names_at(event).await?;

        let evaluator = self.conditions.for_event(event, self.users_in_room.len());
        let mut cache = ConditionCache::new();
        let mut actions_by_user = ActionsByUser::new();
        let mut hidden = 0usize;

        for (user_id, rules) in &self.rules_by_user {
            if visible.get(user_id).map_or(true, |events| events.is_empty()) {
                hidden += 1;
                continue;
            }

            let display_name = display_names.get(user_id).map(String::as_str);

            for rule in rules.iter().filter(|rule| rule.is_enabled()) {
                let matched = conditions_match(
                    evaluator.as_ref(),
                    &rule.conditions,
                    user_id,
                    display_name,
                    &mut cache,
                )
                .await?;

                if !matched {
                    continue;
                }

                let actions = rule.notify_actions();
                debug!(
                    user_id = %user_id,
                    rule_id = %rule.rule_id,
                    notify = !actions.is_empty(),
                    "Rule matched"
                );
                if !actions.is_empty() {
                    actions_by_user.insert(user_id.clone(), actions);
                }
                break;
            }
        }

        info!(
            room_id = %self.room_id,
            event_id = %event.event_id,
            notified = actions_by_user.len(),
            hidden,
            cached_conditions = cache.len(),
            cache_hits = cache.hits(),
            "Push rules evaluated"
        );

        Ok(actions_by_user)
    }

    /// Display names of room members in the state at `event`.
    async fn display_names_at(&self, event: &RoomEvent) -> Result<HashMap<String, String>, StoreError> {
        let state = self.store.get_state_for_event(&event.event_id).await?;

        Ok(state
            .into_values()
            .filter_map(|ev| {
                let name = ev.display_name()?.to_string();
                Some((ev.state_key?, name))
            })
            .collect())
    }
}
