//! Configuration module for Synapse Push.
//!
//! Loads configuration from TOML files with environment variable substitution.
//!
//! # Example
//!
//! ```toml
//! [server]
//! port = 3000
//! api_key = "${PUSH_API_KEY}"
//!
//! [store]
//! snapshot = "config/room_snapshot.json"
//! state_history = 1024
//!
//! [rules]
//! disabled_base_rules = ["global/underride/.m.rule.encrypted"]
//! ```

use crate::rules::BaseRules;
use crate::store::DEFAULT_STATE_HISTORY;
use regex::Regex;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;
use std::sync::OnceLock;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read push config: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("push config is not valid TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("invalid push config: {0}")]
    ValidationError(String),
}

/// Root configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
pub struct PushConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub rules: RulesConfig,
}

/// Server configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub api_key: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            api_key: None,
        }
    }
}

fn default_port() -> u16 {
    3000
}

/// Where the in-memory store is seeded from
#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    #[serde(default = "default_snapshot")]
    pub snapshot: String,

    /// Number of recent events whose room state is kept
    #[serde(default = "default_state_history")]
    pub state_history: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            snapshot: default_snapshot(),
            state_history: default_state_history(),
        }
    }
}

fn default_state_history() -> usize {
    DEFAULT_STATE_HISTORY
}

fn default_snapshot() -> String {
    "config/room_snapshot.json".to_string()
}

/// Default rule table adjustments
#[derive(Debug, Deserialize, Clone, Default)]
pub struct RulesConfig {
    /// Ids of built-in rules to leave out of every rule set
    #[serde(default)]
    pub disabled_base_rules: Vec<String>,
}

impl PushConfig {
    /// The default rule table with disabled rules removed.
    pub fn base_rules(&self) -> BaseRules {
        BaseRules::builtin().without(self.rules.disabled_base_rules.iter().map(String::as_str))
    }

    /// Load configuration from the default path or PUSH_CONFIG env var.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path =
            env::var("PUSH_CONFIG").unwrap_or_else(|_| crate::DEFAULT_CONFIG_PATH.to_string());

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            info!(
                path = %path.display(),
                "No push config file, running with built-in defaults"
            );
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path)?;
        let config: PushConfig = toml::from_str(&substitute_env_vars(&raw))?;
        config.validate()?;

        info!(
            path = %path.display(),
            port = config.server.port,
            snapshot = %config.store.snapshot,
            state_history = config.store.state_history,
            disabled_base_rules = config.rules.disabled_base_rules.len(),
            "Push config loaded"
        );

        Ok(config)
    }

    /// Validate the configuration
    fn validate(&self) -> Result<(), ConfigError> {
        if self.store.snapshot.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "store.snapshot must not be empty".to_string(),
            ));
        }

        if self.store.state_history == 0 {
            return Err(ConfigError::ValidationError(
                "store.state_history must be at least 1".to_string(),
            ));
        }

        let builtin = BaseRules::builtin();
        for rule_id in &self.rules.disabled_base_rules {
            if !builtin.contains(rule_id) {
                return Err(ConfigError::ValidationError(format!(
                    "Unknown base rule '{}' in rules.disabled_base_rules",
                    rule_id
                )));
            }
        }

        if self
            .server
            .api_key
            .as_deref()
            .is_some_and(|key| key.contains("${"))
        {
            warn!("server.api_key has an unresolved placeholder, is its variable exported?");
        }

        Ok(())
    }
}

/// Replace `${VAR}` placeholders with environment values. Unset variables
/// are left as written.
fn substitute_env_vars(raw: &str) -> String {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    let placeholder = PLACEHOLDER.get_or_init(|| {
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("placeholder pattern is valid")
    });

    placeholder
        .replace_all(raw, |caps: &regex::Captures| {
            let var = &caps[1];
            env::var(var).unwrap_or_else(|_| {
                debug!(var = %var, "Push config references an unset variable");
                caps[0].to_string()
            })
        })
        .into_owned()
}
