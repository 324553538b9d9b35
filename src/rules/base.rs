//! Built-in default rules and the merge policy.
//!
//! Every user's effective rule set is their own rules interleaved with a
//! fixed table of server defaults. The table is plain data: each
//! [`BaseRule`] names the [`PriorityClass`] it belongs to and whether it sits
//! before or after the user's own rules of that class ([`Placement`]).
//!
//! ```text
//! override:  prepend defaults | user override rules  | append defaults
//! content:   prepend defaults | user content rules   | append defaults
//! room:      ...
//! sender:    ...
//! underride: prepend defaults | user underride rules | append defaults
//! ```
//!
//! Because matching is first-match-wins, this order is the only thing that
//! decides between two rules that both match.

use super::{Action, Condition, ConditionKind, CustomRule, PatternType, PriorityClass, Rule};
use std::collections::HashSet;
use tracing::{debug, warn};

/// Position of a default rule relative to the user's rules of its class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    Prepend,
    Append,
}

/// One entry of the default rule table.
#[derive(Debug, Clone, PartialEq)]
pub struct BaseRule {
    pub class: PriorityClass,
    pub placement: Placement,
    pub rule: Rule,
}

impl BaseRule {
    fn new(class: PriorityClass, placement: Placement, mut rule: Rule) -> Self {
        rule.default = true;
        Self {
            class,
            placement,
            rule,
        }
    }
}

/// The default rule table.
#[derive(Debug, Clone, PartialEq)]
pub struct BaseRules {
    rules: Vec<BaseRule>,
}

impl BaseRules {
    /// Build a table from explicit entries (table order is kept within a
    /// class and placement).
    pub fn new(rules: Vec<BaseRule>) -> Self {
        Self { rules }
    }

    /// A table with no defaults at all.
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    /// The server's built-in defaults.
    pub fn builtin() -> Self {
        use Placement::{Append, Prepend};
        use PriorityClass::{Content, Override, Underride};

        let is_member = || Condition::event_match("type", "m.room.member").cached_as("_member");
        let is_message = || Condition::event_match("type", "m.room.message").cached_as("_message");

        Self::new(vec![
            BaseRule::new(
                Override,
                Prepend,
                Rule::new("global/override/.m.rule.master", vec![], vec![Action::dont_notify()])
                    .disabled(),
            ),
            BaseRule::new(
                Override,
                Append,
                Rule::new(
                    "global/override/.m.rule.suppress_notices",
                    vec![Condition::event_match("content.msgtype", "m.notice")
                        .cached_as("_suppress_notices")],
                    vec![Action::dont_notify()],
                ),
            ),
            BaseRule::new(
                Override,
                Append,
                Rule::new(
                    "global/override/.m.rule.invite_for_me",
                    vec![
                        is_member(),
                        Condition::event_match("content.membership", "invite")
                            .cached_as("_invite_member"),
                        // depends on the user: never cached
                        Condition::new(ConditionKind::EventMatch {
                            key: "state_key".to_string(),
                            pattern: None,
                            pattern_type: Some(PatternType::UserId),
                        }),
                    ],
                    vec![
                        Action::notify(),
                        Action::sound("default"),
                        Action::highlight(false),
                    ],
                ),
            ),
            BaseRule::new(
                Override,
                Append,
                Rule::new(
                    "global/override/.m.rule.member_event",
                    vec![is_member()],
                    vec![Action::dont_notify()],
                ),
            ),
            BaseRule::new(
                Override,
                Append,
                Rule::new(
                    "global/override/.m.rule.contains_display_name",
                    vec![Condition::new(ConditionKind::ContainsDisplayName)],
                    vec![
                        Action::notify(),
                        Action::sound("default"),
                        Action::highlight(true),
                    ],
                ),
            ),
            BaseRule::new(
                Content,
                Append,
                Rule::new(
                    "global/content/.m.rule.contains_user_name",
                    vec![Condition::new(ConditionKind::EventMatch {
                        key: "content.body".to_string(),
                        pattern: None,
                        pattern_type: Some(PatternType::UserLocalpart),
                    })],
                    vec![
                        Action::notify(),
                        Action::sound("default"),
                        Action::highlight(true),
                    ],
                ),
            ),
            BaseRule::new(
                Underride,
                Append,
                Rule::new(
                    "global/underride/.m.rule.call",
                    vec![Condition::event_match("type", "m.call.invite").cached_as("_call")],
                    vec![
                        Action::notify(),
                        Action::sound("ring"),
                        Action::highlight(false),
                    ],
                ),
            ),
            BaseRule::new(
                Underride,
                Append,
                Rule::new(
                    "global/underride/.m.rule.room_one_to_one",
                    vec![
                        Condition::new(ConditionKind::RoomMemberCount {
                            is: Some("2".to_string()),
                        })
                        .cached_as("member_count"),
                        is_message(),
                    ],
                    vec![
                        Action::notify(),
                        Action::sound("default"),
                        Action::highlight(false),
                    ],
                ),
            ),
            BaseRule::new(
                Underride,
                Append,
                Rule::new(
                    "global/underride/.m.rule.message",
                    vec![is_message()],
                    vec![Action::notify(), Action::highlight(false)],
                ),
            ),
            BaseRule::new(
                Underride,
                Append,
                Rule::new(
                    "global/underride/.m.rule.encrypted",
                    vec![Condition::event_match("type", "m.room.encrypted").cached_as("_encrypted")],
                    vec![Action::notify(), Action::highlight(false)],
                ),
            ),
        ])
    }

    /// Remove the listed rule ids from the table.
    pub fn without<'a>(mut self, rule_ids: impl IntoIterator<Item = &'a str>) -> Self {
        let drop: HashSet<&str> = rule_ids.into_iter().collect();
        self.rules.retain(|base| !drop.contains(base.rule.rule_id.as_str()));
        self
    }

    pub fn contains(&self, rule_id: &str) -> bool {
        self.rules.iter().any(|base| base.rule.rule_id == rule_id)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// The default rules alone, in merged order.
    pub fn defaults(&self) -> Vec<Rule> {
        self.merge(Vec::new())
    }

    /// Merge a user's own rules with the defaults into one ordered sequence.
    ///
    /// Custom rules are sorted by class then priority, both descending; ties
    /// keep their input order. A custom rule that reuses a default's id
    /// replaces that default. Of several custom rules sharing an id, only the
    /// first in sorted order is kept.
    pub fn merge(&self, mut custom: Vec<CustomRule>) -> Vec<Rule> {
        custom.sort_by(|a, b| b.class.cmp(&a.class).then(b.priority.cmp(&a.priority)));

        let mut seen = HashSet::with_capacity(custom.len());
        custom.retain(|c| {
            let first = seen.insert(c.rule.rule_id.clone());
            if !first {
                warn!(rule_id = %c.rule.rule_id, "Dropping duplicate push rule");
            }
            first
        });

        let overridden: HashSet<&str> = custom.iter().map(|c| c.rule.rule_id.as_str()).collect();

        let mut merged = Vec::with_capacity(self.rules.len() + custom.len());
        let mut custom_rules = custom.iter().peekable();

        for class in PriorityClass::MERGE_ORDER {
            merged.extend(self.defaults_for(class, Placement::Prepend, &overridden));
            while let Some(next) = custom_rules.next_if(|c| c.class == class) {
                merged.push(next.rule.clone());
            }
            merged.extend(self.defaults_for(class, Placement::Append, &overridden));
        }

        debug!(
            custom = custom.len(),
            total = merged.len(),
            "Merged rules with defaults"
        );

        merged
    }
}

impl BaseRules {
    fn defaults_for<'a>(
        &'a self,
        class: PriorityClass,
        placement: Placement,
        overridden: &'a HashSet<&'a str>,
    ) -> impl Iterator<Item = Rule> + 'a {
        self.rules
            .iter()
            .filter(move |base| base.class == class && base.placement == placement)
            .filter(move |base| !overridden.contains(base.rule.rule_id.as_str()))
            .map(|base| base.rule.clone())
    }
}

impl Default for BaseRules {
    fn default() -> Self {
        Self::builtin()
    }
}
