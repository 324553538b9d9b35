//! Batched rule loading.

use super::{BaseRules, RuleDecodeError, RuleSetByUser};
use crate::store::{PushStore, StoreError};
use thiserror::Error;
use tracing::{debug, error};

/// Errors that can occur while loading rule sets.
#[derive(Error, Debug)]
pub enum LoadError {
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A stored row for this user could not be decoded
    #[error("failed to decode push rules for {user_id}: {source}")]
    Decode {
        user_id: String,
        #[source]
        source: RuleDecodeError,
    },
}

/// Fetch, decode and merge the rule sets of `user_ids` in one storage read.
///
/// Every requested user gets an entry; users without stored rows get the
/// defaults alone. A single malformed row fails the whole load.
pub async fn load_rules_for_users(
    store: &dyn PushStore,
    user_ids: &[String],
    base_rules: &BaseRules,
) -> Result<RuleSetByUser, LoadError> {
    let mut stored = store.bulk_get_push_rules(user_ids).await?;

    let mut rules_by_user = RuleSetByUser::with_capacity(user_ids.len());
    for user_id in user_ids {
        let rows = stored.remove(user_id).unwrap_or_default();

        let custom = rows
            .iter()
            .map(|row| row.decode())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|source| {
                error!(user_id = %user_id, error = %source, "Malformed push rule");
                LoadError::Decode {
                    user_id: user_id.clone(),
                    source,
                }
            })?;

        debug!(user_id = %user_id, custom_rules = custom.len(), "Loaded push rules");

        rules_by_user.insert(user_id.clone(), base_rules.merge(custom));
    }

    Ok(rules_by_user)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::{Action, Condition, PriorityClass, RawRule, Rule};
    use crate::store::{MemoryStore, StateMap};
    use async_trait::async_trait;
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn hello_rule() -> RawRule {
        let rule = Rule::new(
            "global/content/hello",
            vec![Condition::event_match("content.body", "hello").cached_as("c1")],
            vec![Action::notify()],
        );
        RawRule::encode(&rule, PriorityClass::Content, 0).unwrap()
    }

    fn users(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    /// Counts batched reads.
    #[derive(Default)]
    struct CountingStore {
        inner: MemoryStore,
        bulk_reads: AtomicUsize,
    }

    #[async_trait]
    impl PushStore for CountingStore {
        async fn bulk_get_push_rules(
            &self,
            user_ids: &[String],
        ) -> Result<HashMap<String, Vec<RawRule>>, StoreError> {
            self.bulk_reads.fetch_add(1, Ordering::SeqCst);
            self.inner.bulk_get_push_rules(user_ids).await
        }

        async fn get_users_in_room(&self, room_id: &str) -> Result<HashSet<String>, StoreError> {
            self.inner.get_users_in_room(room_id).await
        }

        async fn are_guests(&self, user_ids: &[String]) -> Result<HashMap<String, bool>, StoreError> {
            self.inner.are_guests(user_ids).await
        }

        async fn get_state_for_event(&self, event_id: &str) -> Result<StateMap, StoreError> {
            self.inner.get_state_for_event(event_id).await
        }
    }

    #[tokio::test]
    async fn test_users_without_rules_get_defaults() {
        let store = MemoryStore::default();
        let base = BaseRules::builtin();

        let rules = load_rules_for_users(&store, &users(&["@a:test", "@b:test"]), &base)
            .await
            .unwrap();

        assert_eq!(rules.len(), 2);
        assert_eq!(rules["@a:test"], base.defaults());
        assert_eq!(rules["@b:test"], base.defaults());
    }

    #[tokio::test]
    async fn test_custom_rules_merged_in_one_read() {
        let store = CountingStore::default();
        store.inner.set_push_rules("@a:test", vec![hello_rule()]).await;
        let base = BaseRules::builtin();

        let rules = load_rules_for_users(&store, &users(&["@a:test", "@b:test", "@c:test"]), &base)
            .await
            .unwrap();

        assert_eq!(store.bulk_reads.load(Ordering::SeqCst), 1);
        assert_eq!(rules["@a:test"].len(), base.len() + 1);
        assert!(rules["@a:test"].iter().any(|r| r.rule_id == "global/content/hello"));
        assert_eq!(rules["@b:test"].len(), base.len());
    }

    #[tokio::test]
    async fn test_malformed_row_fails_load() {
        let store = MemoryStore::default();
        let mut bad = hello_rule();
        bad.actions = "[\"notify\"".to_string();
        store.set_push_rules("@a:test", vec![hello_rule(), bad]).await;

        let result = load_rules_for_users(&store, &users(&["@a:test"]), &BaseRules::builtin()).await;

        match result {
            Err(LoadError::Decode { user_id, source }) => {
                assert_eq!(user_id, "@a:test");
                assert!(matches!(source, RuleDecodeError::Malformed { field: "actions", .. }));
            }
            other => panic!("expected decode error, got {:?}", other.map(|r| r.len())),
        }
    }
}
