//! Session and session-factory configuration.

use serde::{Deserialize, Serialize};
use unitflow_core::{ConfigError, Error, Result};

/// When pending changes are written to the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlushMode {
    /// Flush before commit and before queries whose tables have pending changes.
    #[default]
    Auto,
    /// Flush only before commit.
    Commit,
    /// Flush only when `flush` is called.
    Manual,
}

/// Configuration for Session behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub flush_mode: FlushMode,
    /// Whether to auto-begin a transaction on first flush.
    pub auto_begin: bool,
    /// Load entities read-only: they are never dirty-checked.
    pub default_read_only: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            flush_mode: FlushMode::Auto,
            auto_begin: true,
            default_read_only: false,
        }
    }
}

impl SessionConfig {
    pub fn flush_mode(mut self, mode: FlushMode) -> Self {
        self.flush_mode = mode;
        self
    }

    pub fn auto_begin(mut self, enabled: bool) -> Self {
        self.auto_begin = enabled;
        self
    }

    pub fn read_only(mut self, enabled: bool) -> Self {
        self.default_read_only = enabled;
        self
    }
}

/// Options shared by every session opened from one factory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionFactoryOptions {
    /// Statements with identical SQL grouped per round trip; `1` disables batching.
    pub jdbc_batch_size: usize,
    /// Batch-fetch size for entities and collections that do not declare one.
    pub default_batch_fetch_size: usize,
    pub query_cache_enabled: bool,
    pub query_cache_max_entries: usize,
    pub plan_cache_size: usize,
    /// Reject operations JPA forbids, such as removing detached instances.
    pub jpa_compliance: bool,
    /// Execute updates sorted by entity name and identifier.
    pub order_updates: bool,
    /// Reset the identifier of deleted instances.
    pub identifier_rollback: bool,
    pub default_flush_mode: FlushMode,
}

impl Default for SessionFactoryOptions {
    fn default() -> Self {
        Self {
            jdbc_batch_size: 1,
            default_batch_fetch_size: 1,
            query_cache_enabled: false,
            query_cache_max_entries: 1000,
            plan_cache_size: 1024,
            jpa_compliance: false,
            order_updates: false,
            identifier_rollback: false,
            default_flush_mode: FlushMode::Auto,
        }
    }
}

impl SessionFactoryOptions {
    /// Parse options from JSON; missing keys keep their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| {
            Error::Config(ConfigError {
                message: format!("invalid session factory options: {}", e),
                source: Some(Box::new(e)),
            })
        })
    }

    pub fn batch_size(mut self, size: usize) -> Self {
        self.jdbc_batch_size = size.max(1);
        self
    }

    pub fn batch_fetch_size(mut self, size: usize) -> Self {
        self.default_batch_fetch_size = size.max(1);
        self
    }

    pub fn query_cache(mut self, enabled: bool) -> Self {
        self.query_cache_enabled = enabled;
        self
    }

    pub fn jpa_compliance(mut self, enabled: bool) -> Self {
        self.jpa_compliance = enabled;
        self
    }

    pub fn order_updates(mut self, enabled: bool) -> Self {
        self.order_updates = enabled;
        self
    }

    pub fn identifier_rollback(mut self, enabled: bool) -> Self {
        self.identifier_rollback = enabled;
        self
    }

    pub fn flush_mode(mut self, mode: FlushMode) -> Self {
        self.default_flush_mode = mode;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_parse_with_defaults() {
        let options = SessionFactoryOptions::from_json(
            r#"{"jdbc_batch_size": 25, "query_cache_enabled": true, "default_flush_mode": "commit"}"#,
        )
        .unwrap();
        assert_eq!(options.jdbc_batch_size, 25);
        assert!(options.query_cache_enabled);
        assert_eq!(options.default_flush_mode, FlushMode::Commit);
        assert_eq!(options.plan_cache_size, 1024);
        assert!(!options.jpa_compliance);
    }

    #[test]
    fn malformed_options_are_config_errors() {
        let err = SessionFactoryOptions::from_json(r#"{"jdbc_batch_size": "many"}"#).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn session_config_defaults() {
        let config: SessionConfig = serde_json::from_str(r#"{"flush_mode": "manual"}"#).unwrap();
        assert_eq!(config.flush_mode, FlushMode::Manual);
        assert!(config.auto_begin);
        assert!(!config.default_read_only);
    }
}
