//! # Synapse Push
//!
//! Bulk push rule evaluation: for an event posted into a room, decide which
//! members get notified and with which actions.
//!
//! ## Architecture
//!
//! ```text
//! room id -> members -> batched rule fetch + merge with defaults
//!         -> (per event) guests + visibility + display names
//!         -> per-user first-match rule scan with a shared condition cache
//!         -> { user id: [actions] }
//! ```
//!
//! ## Modules
//!
//! - [`event`]: Room event type
//! - [`rules`]: Rule model, default rules, batched loader
//! - [`conditions`]: Condition evaluator trait, cache and built-in predicates
//! - [`store`]: Storage and visibility collaborator traits
//! - [`bulk`]: The bulk evaluator
//! - [`config`]: TOML configuration

pub mod bulk;
pub mod conditions;
pub mod config;
pub mod event;
pub mod rules;
pub mod store;

// Re-export commonly used types at crate root
pub use bulk::{evaluator_for_room_id, ActionsByUser, BulkPushRuleEvaluator, EvaluationError};
pub use event::RoomEvent;
pub use rules::{Action, BaseRules, Condition, Rule};

/// Default path of the configuration file
pub const DEFAULT_CONFIG_PATH: &str = "config/push.toml";
