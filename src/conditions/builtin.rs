//! Built-in condition predicates.
//!
//! # Condition Kinds
//!
//! ```text
//! Kind                  | Matches when
//! ----------------------|----------------------------------------------
//! event_match           | the dotted event field matches the glob
//! contains_display_name | content.body mentions the user's display name
//! room_member_count     | the member count satisfies `is` (e.g. ">=10")
//! device                | the profile tag equals `profile_tag`
//! (unknown)             | never
//! ```
//!
//! Globs support `*` (any run of characters) and `?` (one character) and are
//! case-insensitive. On `content.body` a glob only needs to match a whole
//! word; on every other key it must match the entire value.

use super::{ConditionError, ConditionEvaluator, EvaluatorFactory};
use crate::event::RoomEvent;
use crate::rules::{Condition, ConditionKind, PatternType};
use async_trait::async_trait;
use regex::Regex;
use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};
use tracing::warn;

/// Factory for [`EventConditionEvaluator`].
#[derive(Debug, Clone, Copy, Default)]
pub struct BuiltinConditions;

impl EvaluatorFactory for BuiltinConditions {
    fn for_event(&self, event: &RoomEvent, room_member_count: usize) -> Box<dyn ConditionEvaluator> {
        Box::new(EventConditionEvaluator::new(event.clone(), room_member_count))
    }
}

/// Evaluates conditions against one event.
///
/// Compiled patterns are kept for the lifetime of the evaluator, so a glob
/// shared by many users is compiled once per event.
#[derive(Debug)]
pub struct EventConditionEvaluator {
    event: RoomEvent,
    room_member_count: usize,
    patterns: Mutex<HashMap<String, Option<Regex>>>,
}

impl EventConditionEvaluator {
    pub fn new(event: RoomEvent, room_member_count: usize) -> Self {
        Self {
            event,
            room_member_count,
            patterns: Mutex::new(HashMap::new()),
        }
    }

    fn event_match(
        &self,
        key: &str,
        pattern: Option<&str>,
        pattern_type: Option<PatternType>,
        user_id: &str,
    ) -> bool {
        let pattern = match (pattern, pattern_type) {
            (Some(pattern), _) => pattern,
            (None, Some(PatternType::UserId)) => user_id,
            (None, Some(PatternType::UserLocalpart)) => localpart(user_id),
            (None, None) => return false,
        };

        let Some(value) = self.event.field(key) else {
            return false;
        };

        self.is_match(&glob_to_regex(pattern, key == "content.body"), pattern, user_id, value)
    }

    fn contains_display_name(&self, display_name: Option<&str>, user_id: &str) -> bool {
        let Some(name) = display_name.filter(|n| !n.is_empty()) else {
            return false;
        };
        let Some(body) = self.event.field("content.body") else {
            return false;
        };

        self.is_match(&word_pattern(&regex::escape(name)), name, user_id, body)
    }

    /// Match `value` against a regex source, compiling it at most once.
    ///
    /// A source that does not compile (in practice, a glob too long for the
    /// regex size limit) never matches.
    fn is_match(&self, source: &str, pattern: &str, user_id: &str, value: &str) -> bool {
        let mut patterns = match self.patterns.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let regex = patterns.entry(source.to_string()).or_insert_with(|| {
            Regex::new(source)
                .map_err(|e| {
                    warn!(
                        user_id = %user_id,
                        pattern_len = pattern.len(),
                        error = %e,
                        "Push rule pattern does not compile, treating as no match"
                    );
                })
                .ok()
        });

        regex.as_ref().map_or(false, |re| re.is_match(value))
    }

    fn room_member_count(&self, is: Option<&str>) -> bool {
        let Some((op, target)) = is.and_then(parse_member_count) else {
            return false;
        };
        let count = self.room_member_count;

        match op {
            "" | "==" => count == target,
            "<" => count < target,
            ">" => count > target,
            "<=" => count <= target,
            ">=" => count >= target,
            _ => false,
        }
    }
}

#[async_trait]
impl ConditionEvaluator for EventConditionEvaluator {
    async fn matches(
        &self,
        condition: &Condition,
        user_id: &str,
        display_name: Option<&str>,
        profile_tag: Option<&str>,
    ) -> Result<bool, ConditionError> {
        let matched = match &condition.kind {
            ConditionKind::EventMatch {
                key,
                pattern,
                pattern_type,
            } => self.event_match(key, pattern.as_deref(), *pattern_type, user_id),
            ConditionKind::ContainsDisplayName => self.contains_display_name(display_name, user_id),
            ConditionKind::RoomMemberCount { is } => self.room_member_count(is.as_deref()),
            ConditionKind::Device {
                profile_tag: wanted,
            } => wanted.is_some() && wanted.as_deref() == profile_tag,
            ConditionKind::Unknown => false,
        };
        Ok(matched)
    }
}

/// `@alice:example.org` -> `alice`
fn localpart(user_id: &str) -> &str {
    let without_sigil = user_id.strip_prefix('@').unwrap_or(user_id);
    without_sigil.split(':').next().unwrap_or(without_sigil)
}

/// Translate a glob into a case-insensitive regex source.
///
/// With `word_boundary` the glob may match any whole word of the value,
/// otherwise it must cover the entire value.
fn glob_to_regex(glob: &str, word_boundary: bool) -> String {
    let mut body = String::with_capacity(glob.len() * 2);
    let mut buf = [0u8; 4];
    for ch in glob.chars() {
        match ch {
            '*' => body.push_str(".*?"),
            '?' => body.push('.'),
            c => body.push_str(&regex::escape(c.encode_utf8(&mut buf))),
        }
    }

    if word_boundary {
        word_pattern(&body)
    } else {
        format!("(?is)^{}$", body)
    }
}

fn word_pattern(body: &str) -> String {
    format!(r"(?is)(^|\W){}(\W|$)", body)
}

/// Split `">=10"` into `(">=", 10)`.
fn parse_member_count(is: &str) -> Option<(&str, usize)> {
    static MEMBER_COUNT: OnceLock<Regex> = OnceLock::new();
    let re = MEMBER_COUNT.get_or_init(|| {
        Regex::new(r"^([=<>]*)([0-9]+)$").expect("member count pattern is valid")
    });

    let caps = re.captures(is)?;
    let op = caps.get(1).map_or("", |m| m.as_str());
    let target = caps.get(2)?.as_str().parse().ok()?;
    Some((op, target))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn message(body: &str) -> RoomEvent {
        RoomEvent::new(
            "$1",
            "!room:test",
            "@sender:test",
            "m.room.message",
            json!({"msgtype": "m.text", "body": body}),
        )
    }

    async fn check(evaluator: &EventConditionEvaluator, condition: Condition, user: &str, name: Option<&str>) -> bool {
        evaluator.matches(&condition, user, name, None).await.unwrap()
    }

    #[test]
    fn test_localpart() {
        assert_eq!(localpart("@alice:example.org"), "alice");
        assert_eq!(localpart("bob"), "bob");
    }

    #[test]
    fn test_glob_full_value() {
        let re = Regex::new(&glob_to_regex("m.room.*", false)).unwrap();
        assert!(re.is_match("m.room.message"));
        assert!(re.is_match("M.ROOM.TOPIC"));
        assert!(!re.is_match("xm.room.message"));

        let re = Regex::new(&glob_to_regex("m.room.?ember", false)).unwrap();
        assert!(re.is_match("m.room.member"));
        assert!(!re.is_match("m.roomXmember"));
    }

    #[test]
    fn test_glob_word_boundary() {
        let re = Regex::new(&glob_to_regex("hello", true)).unwrap();
        assert!(re.is_match("hello"));
        assert!(re.is_match("oh, Hello there"));
        assert!(!re.is_match("othello"));

        let re = Regex::new(&glob_to_regex("cake*", true)).unwrap();
        assert!(re.is_match("I like cakes"));
    }

    #[test]
    fn test_parse_member_count() {
        assert_eq!(parse_member_count("2"), Some(("", 2)));
        assert_eq!(parse_member_count(">=10"), Some((">=", 10)));
        assert_eq!(parse_member_count("lots"), None);
        assert_eq!(parse_member_count(""), None);
    }

    #[tokio::test]
    async fn test_event_match_literal() {
        let evaluator = EventConditionEvaluator::new(message("say hello world"), 3);

        assert!(check(&evaluator, Condition::event_match("content.body", "hello"), "@u:test", None).await);
        assert!(check(&evaluator, Condition::event_match("type", "m.room.message"), "@u:test", None).await);
        assert!(!check(&evaluator, Condition::event_match("type", "m.room"), "@u:test", None).await);
        assert!(!check(&evaluator, Condition::event_match("content.missing", "*"), "@u:test", None).await);
    }

    #[tokio::test]
    async fn test_event_match_pattern_type() {
        let evaluator = EventConditionEvaluator::new(message("ping alice please"), 3);
        let by_localpart = Condition::new(ConditionKind::EventMatch {
            key: "content.body".to_string(),
            pattern: None,
            pattern_type: Some(PatternType::UserLocalpart),
        });

        assert!(check(&evaluator, by_localpart.clone(), "@alice:test", None).await);
        assert!(!check(&evaluator, by_localpart, "@bob:test", None).await);

        let invite = RoomEvent::new(
            "$i",
            "!room:test",
            "@sender:test",
            "m.room.member",
            json!({"membership": "invite"}),
        )
        .with_state_key("@bob:test");
        let evaluator = EventConditionEvaluator::new(invite, 3);
        let for_me = Condition::new(ConditionKind::EventMatch {
            key: "state_key".to_string(),
            pattern: None,
            pattern_type: Some(PatternType::UserId),
        });
        assert!(check(&evaluator, for_me.clone(), "@bob:test", None).await);
        assert!(!check(&evaluator, for_me, "@alice:test", None).await);
    }

    #[tokio::test]
    async fn test_contains_display_name() {
        let evaluator = EventConditionEvaluator::new(message("hey Bob (the builder)!"), 3);
        let cond = || Condition::new(ConditionKind::ContainsDisplayName);

        assert!(check(&evaluator, cond(), "@bob:test", Some("bob")).await);
        assert!(check(&evaluator, cond(), "@bob:test", Some("Bob (the builder)")).await);
        assert!(!check(&evaluator, cond(), "@bob:test", Some("Bobby")).await);
        assert!(!check(&evaluator, cond(), "@bob:test", None).await);
        assert!(!check(&evaluator, cond(), "@bob:test", Some("")).await);
    }

    #[tokio::test]
    async fn test_room_member_count() {
        let evaluator = EventConditionEvaluator::new(message("hi"), 2);
        let count = |is: &str| {
            Condition::new(ConditionKind::RoomMemberCount {
                is: Some(is.to_string()),
            })
        };

        assert!(check(&evaluator, count("2"), "@u:test", None).await);
        assert!(check(&evaluator, count("==2"), "@u:test", None).await);
        assert!(check(&evaluator, count("<3"), "@u:test", None).await);
        assert!(check(&evaluator, count(">=2"), "@u:test", None).await);
        assert!(!check(&evaluator, count(">2"), "@u:test", None).await);
        assert!(!check(&evaluator, count("two"), "@u:test", None).await);
        assert!(
            !check(
                &evaluator,
                Condition::new(ConditionKind::RoomMemberCount { is: None }),
                "@u:test",
                None
            )
            .await
        );
    }

    #[tokio::test]
    async fn test_device_and_unknown() {
        let evaluator = EventConditionEvaluator::new(message("hi"), 2);
        let device = Condition::new(ConditionKind::Device {
            profile_tag: Some("phone".to_string()),
        });

        assert!(evaluator.matches(&device, "@u:test", None, Some("phone")).await.unwrap());
        assert!(!evaluator.matches(&device, "@u:test", None, Some("tablet")).await.unwrap());
        assert!(!evaluator.matches(&device, "@u:test", None, None).await.unwrap());

        let unknown = Condition::new(ConditionKind::Unknown);
        assert!(!evaluator.matches(&unknown, "@u:test", None, None).await.unwrap());
    }

    #[tokio::test]
    async fn test_oversized_glob_never_matches() {
        let evaluator = EventConditionEvaluator::new(message("hello"), 2);
        let huge = Condition::event_match("content.body", "?".repeat(20_000));

        assert!(!evaluator.matches(&huge, "@u:test", None, None).await.unwrap());
        // asked again, the failed compile is remembered and other patterns still work
        assert!(!evaluator.matches(&huge, "@u:test", None, None).await.unwrap());
        assert!(check(&evaluator, Condition::event_match("content.body", "hello"), "@u:test", None).await);
    }

    #[tokio::test]
    async fn test_patterns_compiled_once_per_event() {
        let evaluator = EventConditionEvaluator::new(message("hey Bob"), 3);
        let cond = Condition::new(ConditionKind::ContainsDisplayName);
        let by_localpart = Condition::new(ConditionKind::EventMatch {
            key: "content.body".to_string(),
            pattern: None,
            pattern_type: Some(PatternType::UserLocalpart),
        });

        for _ in 0..3 {
            assert!(check(&evaluator, cond.clone(), "@bob:test", Some("Bob")).await);
            assert!(check(&evaluator, by_localpart.clone(), "@bob:test", None).await);
        }
        assert!(!check(&evaluator, by_localpart, "@alice:test", None).await);

        // "Bob" display name, "bob" localpart, "alice" localpart
        assert_eq!(evaluator.patterns.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_factory_binds_event() {
        let evaluator = BuiltinConditions.for_event(&message("hello"), 2);
        let cond = Condition::event_match("content.body", "hello");
        assert!(evaluator.matches(&cond, "@u:test", None, None).await.unwrap());
    }
}
