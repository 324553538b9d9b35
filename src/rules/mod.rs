//! Push rule data model.
//!
//! A [`Rule`] is an ordered list of [`Condition`]s (all must match) and an
//! ordered list of [`Action`]s. Rules are stored as [`RawRule`] rows whose
//! conditions and actions are JSON text; [`RawRule::decode`] turns a row into
//! a structured rule tagged with its [`PriorityClass`].
//!
//! ## Submodules
//!
//! - [`base`]: the built-in default rules and the merge policy
//! - [`loader`]: batched fetch + decode + merge for a set of users

pub mod base;
pub mod loader;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;

pub use base::{BaseRule, BaseRules, Placement};
pub use loader::{load_rules_for_users, LoadError};

/// The sentinel action that suppresses a notification.
pub const DONT_NOTIFY: &str = "dont_notify";

/// Each user's fully merged, priority-ordered rules.
pub type RuleSetByUser = HashMap<String, Vec<Rule>>;

/// Errors raised while decoding a stored rule row.
#[derive(Error, Debug)]
pub enum RuleDecodeError {
    #[error("rule '{rule_id}' has malformed {field}: {source}")]
    Malformed {
        rule_id: String,
        field: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("rule '{rule_id}' has unknown priority class {class}")]
    UnknownPriorityClass { rule_id: String, class: u8 },
}

/// Priority classes, highest first when merged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorityClass {
    Underride = 1,
    Sender = 2,
    Room = 3,
    Content = 4,
    Override = 5,
}

impl PriorityClass {
    /// All classes in merge order (override first).
    pub const MERGE_ORDER: [PriorityClass; 5] = [
        PriorityClass::Override,
        PriorityClass::Content,
        PriorityClass::Room,
        PriorityClass::Sender,
        PriorityClass::Underride,
    ];

    /// Map the integer stored in the rules table.
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(PriorityClass::Underride),
            2 => Some(PriorityClass::Sender),
            3 => Some(PriorityClass::Room),
            4 => Some(PriorityClass::Content),
            5 => Some(PriorityClass::Override),
            _ => None,
        }
    }
}

/// Where `event_match` takes its pattern from when no literal is given.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternType {
    /// The full user id of the user being evaluated
    UserId,
    /// The localpart of the user id (`alice` for `@alice:example.org`)
    UserLocalpart,
}

/// The predicate part of a condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConditionKind {
    /// Glob match on a dotted event field
    EventMatch {
        key: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pattern: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pattern_type: Option<PatternType>,
    },

    /// The body mentions the user's display name
    ContainsDisplayName,

    /// Room size comparison, e.g. `"2"`, `">10"`, `"<=5"`
    RoomMemberCount {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        is: Option<String>,
    },

    /// Matches a specific device profile
    Device {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        profile_tag: Option<String>,
    },

    /// Any kind this server does not know; never matches
    #[serde(other)]
    Unknown,
}

/// One condition of a rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    cache_id: Option<String>,

    #[serde(flatten)]
    pub kind: ConditionKind,
}

impl Condition {
    pub fn new(kind: ConditionKind) -> Self {
        Self {
            cache_id: None,
            kind,
        }
    }

    /// An `event_match` condition on `key` with a literal glob.
    pub fn event_match(key: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self::new(ConditionKind::EventMatch {
            key: key.into(),
            pattern: Some(pattern.into()),
            pattern_type: None,
        })
    }

    /// Tag this condition with a cache identifier.
    pub fn cached_as(mut self, id: impl Into<String>) -> Self {
        self.cache_id = Some(id.into());
        self
    }

    /// Identifier under which this condition's result may be shared.
    ///
    /// Every condition carrying the same identifier is assumed to evaluate
    /// identically for a given event, whichever rule or user it belongs to.
    /// Rule authors must only reuse an identifier for conditions that do not
    /// depend on the user. An empty identifier counts as none.
    pub fn cache_id(&self) -> Option<&str> {
        self.cache_id.as_deref().filter(|id| !id.is_empty())
    }
}

/// A notification action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Action {
    /// A bare action such as `notify`, `dont_notify` or `coalesce`
    Named(String),

    /// A tweak such as `{"set_tweak": "sound", "value": "default"}`
    Tweak {
        set_tweak: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<Value>,
    },
}

impl Action {
    pub fn named(name: impl Into<String>) -> Self {
        Action::Named(name.into())
    }

    pub fn notify() -> Self {
        Action::named("notify")
    }

    pub fn dont_notify() -> Self {
        Action::named(DONT_NOTIFY)
    }

    pub fn sound(value: impl Into<String>) -> Self {
        Action::Tweak {
            set_tweak: "sound".to_string(),
            value: Some(Value::String(value.into())),
        }
    }

    /// `highlight` tweak; `true` is written without a value.
    pub fn highlight(on: bool) -> Self {
        Action::Tweak {
            set_tweak: "highlight".to_string(),
            value: if on { None } else { Some(Value::Bool(false)) },
        }
    }

    pub fn is_dont_notify(&self) -> bool {
        matches!(self, Action::Named(name) if name == DONT_NOTIFY)
    }
}

/// A fully decoded push rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub rule_id: String,

    /// Absent means enabled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,

    #[serde(default)]
    pub conditions: Vec<Condition>,

    #[serde(default)]
    pub actions: Vec<Action>,

    /// True for built-in rules
    #[serde(default)]
    pub default: bool,
}

impl Rule {
    pub fn new(rule_id: impl Into<String>, conditions: Vec<Condition>, actions: Vec<Action>) -> Self {
        Self {
            rule_id: rule_id.into(),
            enabled: None,
            conditions,
            actions,
            default: false,
        }
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = Some(false);
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }

    /// The rule's actions with every `dont_notify` removed.
    pub fn notify_actions(&self) -> Vec<Action> {
        self.actions
            .iter()
            .filter(|action| !action.is_dont_notify())
            .cloned()
            .collect()
    }
}

/// A rule row as stored: conditions and actions are JSON text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRule {
    pub rule_id: String,
    pub priority_class: u8,
    #[serde(default)]
    pub priority: i32,
    pub conditions: String,
    pub actions: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
}

/// A user's own rule, decoded, with its ordering keys.
#[derive(Debug, Clone, PartialEq)]
pub struct CustomRule {
    pub class: PriorityClass,
    pub priority: i32,
    pub rule: Rule,
}

impl RawRule {
    /// Encode a structured rule into a storage row.
    pub fn encode(rule: &Rule, class: PriorityClass, priority: i32) -> Result<Self, serde_json::Error> {
        Ok(Self {
            rule_id: rule.rule_id.clone(),
            priority_class: class as u8,
            priority,
            conditions: serde_json::to_string(&rule.conditions)?,
            actions: serde_json::to_string(&rule.actions)?,
            enabled: rule.enabled,
        })
    }

    /// Decode the JSON columns. Any malformed column fails the whole row.
    pub fn decode(&self) -> Result<CustomRule, RuleDecodeError> {
        let class = PriorityClass::from_raw(self.priority_class).ok_or_else(|| {
            RuleDecodeError::UnknownPriorityClass {
                rule_id: self.rule_id.clone(),
                class: self.priority_class,
            }
        })?;

        let conditions = serde_json::from_str(&self.conditions).map_err(|source| {
            RuleDecodeError::Malformed {
                rule_id: self.rule_id.clone(),
                field: "conditions",
                source,
            }
        })?;

        let actions = serde_json::from_str(&self.actions).map_err(|source| {
            RuleDecodeError::Malformed {
                rule_id: self.rule_id.clone(),
                field: "actions",
                source,
            }
        })?;

        Ok(CustomRule {
            class,
            priority: self.priority,
            rule: Rule {
                rule_id: self.rule_id.clone(),
                enabled: self.enabled,
                conditions,
                actions,
                default: false,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(conditions: &str, actions: &str) -> RawRule {
        RawRule {
            rule_id: "global/content/hello".to_string(),
            priority_class: 4,
            priority: 0,
            conditions: conditions.to_string(),
            actions: actions.to_string(),
            enabled: None,
        }
    }

    #[test]
    fn test_condition_deserialize() {
        let cond: Condition = serde_json::from_value(json!({
            "_id": "c1",
            "kind": "event_match",
            "key": "content.body",
            "pattern": "hello"
        }))
        .unwrap();

        assert_eq!(cond.cache_id(), Some("c1"));
        assert_eq!(
            cond.kind,
            ConditionKind::EventMatch {
                key: "content.body".to_string(),
                pattern: Some("hello".to_string()),
                pattern_type: None,
            }
        );
    }

    #[test]
    fn test_condition_kinds() {
        let conds: Vec<Condition> = serde_json::from_value(json!([
            {"kind": "contains_display_name"},
            {"kind": "room_member_count", "is": "2", "_id": "member_count"},
            {"kind": "event_match", "key": "state_key", "pattern_type": "user_id"},
            {"kind": "device", "profile_tag": "phone"},
            {"kind": "something_new", "whatever": 1}
        ]))
        .unwrap();

        assert_eq!(conds[0].kind, ConditionKind::ContainsDisplayName);
        assert_eq!(conds[0].cache_id(), None);
        assert_eq!(
            conds[1].kind,
            ConditionKind::RoomMemberCount {
                is: Some("2".to_string())
            }
        );
        assert_eq!(conds[1].cache_id(), Some("member_count"));
        assert!(matches!(
            conds[2].kind,
            ConditionKind::EventMatch {
                pattern_type: Some(PatternType::UserId),
                ..
            }
        ));
        assert!(matches!(conds[3].kind, ConditionKind::Device { .. }));
        assert_eq!(conds[4].kind, ConditionKind::Unknown);
    }

    #[test]
    fn test_empty_cache_id_is_none() {
        let cond: Condition =
            serde_json::from_value(json!({"_id": "", "kind": "contains_display_name"})).unwrap();
        assert_eq!(cond.cache_id(), None);
    }

    #[test]
    fn test_actions_deserialize() {
        let actions: Vec<Action> = serde_json::from_value(json!([
            "notify",
            {"set_tweak": "sound", "value": "default"},
            {"set_tweak": "highlight"},
            "dont_notify"
        ]))
        .unwrap();

        assert_eq!(actions[0], Action::notify());
        assert_eq!(actions[1], Action::sound("default"));
        assert_eq!(actions[2], Action::highlight(true));
        assert!(actions[3].is_dont_notify());
        assert!(!actions[0].is_dont_notify());
    }

    #[test]
    fn test_notify_actions_drops_every_dont_notify() {
        let rule = Rule::new(
            "r",
            vec![],
            vec![
                Action::notify(),
                Action::dont_notify(),
                Action::named("sound"),
                Action::dont_notify(),
            ],
        );
        assert_eq!(rule.notify_actions(), vec![Action::notify(), Action::named("sound")]);

        let silent = Rule::new("s", vec![], vec![Action::dont_notify()]);
        assert!(silent.notify_actions().is_empty());
    }

    #[test]
    fn test_enabled_defaults_to_true() {
        let rule = Rule::new("r", vec![], vec![]);
        assert!(rule.is_enabled());
        assert!(!rule.disabled().is_enabled());
    }

    #[test]
    fn test_decode_row() {
        let row = raw(
            r#"[{"_id": "c1", "kind": "event_match", "key": "content.body", "pattern": "hello"}]"#,
            r#"["notify"]"#,
        );

        let decoded = row.decode().unwrap();
        assert_eq!(decoded.class, PriorityClass::Content);
        assert_eq!(decoded.rule.rule_id, "global/content/hello");
        assert_eq!(decoded.rule.conditions.len(), 1);
        assert_eq!(decoded.rule.actions, vec![Action::notify()]);
        assert!(!decoded.rule.default);
    }

    #[test]
    fn test_decode_malformed_conditions() {
        let row = raw("[{not json", r#"["notify"]"#);
        let err = row.decode().unwrap_err();
        assert!(matches!(
            err,
            RuleDecodeError::Malformed {
                field: "conditions",
                ..
            }
        ));
    }

    #[test]
    fn test_decode_malformed_actions() {
        let row = raw("[]", "notify");
        let err = row.decode().unwrap_err();
        assert!(err.to_string().contains("actions"));
    }

    #[test]
    fn test_decode_unknown_priority_class() {
        let mut row = raw("[]", "[]");
        row.priority_class = 9;
        assert!(matches!(
            row.decode(),
            Err(RuleDecodeError::UnknownPriorityClass { class: 9, .. })
        ));
    }

    #[test]
    fn test_encode_then_decode_keeps_cache_ids() {
        let rule = Rule::new(
            "global/room/!r",
            vec![Condition::event_match("room_id", "!r").cached_as("room")],
            vec![Action::dont_notify()],
        );
        let row = RawRule::encode(&rule, PriorityClass::Room, 3).unwrap();
        assert!(row.conditions.contains("\"_id\":\"room\""));

        let decoded = row.decode().unwrap();
        assert_eq!(decoded.rule, rule);
        assert_eq!(decoded.priority, 3);
    }
}
