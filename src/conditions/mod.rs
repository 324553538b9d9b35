//! Condition evaluation.
//!
//! A [`ConditionEvaluator`] answers whether one condition matches one event
//! for one user. The bulk evaluator asks an [`EvaluatorFactory`] for a fresh
//! evaluator per event and runs every rule's conditions through
//! [`conditions_match`], which shares results between rules and users via a
//! [`ConditionCache`].
//!
//! ## Built-in Evaluator
//!
//! - [`EventConditionEvaluator`]: `event_match`, `contains_display_name`,
//!   `room_member_count` and `device`, built by [`BuiltinConditions`]

pub mod builtin;

use crate::event::RoomEvent;
use crate::rules::Condition;
use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;
use tracing::trace;

pub use builtin::{BuiltinConditions, EventConditionEvaluator};

/// Errors that can occur while evaluating a condition.
#[derive(Error, Debug)]
pub enum ConditionError {
    /// Generic evaluator failure
    #[error("condition evaluation failed: {0}")]
    Failed(String),
}

/// Decides whether a single condition matches, for one event.
#[async_trait]
pub trait ConditionEvaluator: Send + Sync {
    /// Evaluate `condition` for `user_id`.
    ///
    /// # Arguments
    ///
    /// * `display_name` - the user's display name in the room, if any
    /// * `profile_tag` - device profile being evaluated for, if any
    async fn matches(
        &self,
        condition: &Condition,
        user_id: &str,
        display_name: Option<&str>,
        profile_tag: Option<&str>,
    ) -> Result<bool, ConditionError>;
}

/// Builds a [`ConditionEvaluator`] bound to one event.
pub trait EvaluatorFactory: Send + Sync {
    fn for_event(&self, event: &RoomEvent, room_member_count: usize) -> Box<dyn ConditionEvaluator>;
}

/// Condition results of one event evaluation, keyed by cache identifier.
///
/// Lives for exactly one event; never reuse it for another.
#[derive(Debug, Default)]
pub struct ConditionCache {
    results: HashMap<String, bool>,
    hits: usize,
}

impl ConditionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a result, counting the hit.
    pub fn get(&mut self, cache_id: &str) -> Option<bool> {
        let result = self.results.get(cache_id).copied();
        if result.is_some() {
            self.hits += 1;
        }
        result
    }

    pub fn insert(&mut self, cache_id: &str, result: bool) {
        self.results.insert(cache_id.to_string(), result);
    }

    /// Number of distinct identifiers stored.
    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Number of lookups answered from the cache.
    pub fn hits(&self) -> usize {
        self.hits
    }
}

/// Check that every condition matches, in order, stopping at the first that
/// does not.
///
/// Conditions with a cache identifier are answered from `cache` when
/// possible; otherwise the evaluator is called and the result stored.
/// Conditions without one always go to the evaluator.
pub async fn conditions_match(
    evaluator: &dyn ConditionEvaluator,
    conditions: &[Condition],
    user_id: &str,
    display_name: Option<&str>,
    cache: &mut ConditionCache,
) -> Result<bool, ConditionError> {
    for condition in conditions {
        let cache_id = condition.cache_id();

        let matched = match cache_id.and_then(|id| cache.get(id)) {
            Some(cached) => cached,
            None => {
                let result = evaluator
                    .matches(condition, user_id, display_name, None)
                    .await?;
                if let Some(id) = cache_id {
                    cache.insert(id, result);
                }
                result
            }
        };

        trace!(
            user_id = %user_id,
            cache_id = ?cache_id,
            matched,
            "Condition evaluated"
        );

        if !matched {
            return Ok(false);
        }
    }

    Ok(true)
}
