//! Replication configuration attached to a changefeed at creation.

use serde::{Deserialize, Serialize};

use crate::model::Ts;

/// Table filter configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Allowlist of `schema.table` glob patterns. Empty means allow all.
    #[serde(default)]
    pub rules: Vec<String>,
    #[serde(rename = "case-sensitive", default)]
    pub case_sensitive: bool,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            rules: vec!["*.*".to_string()],
            case_sensitive: false,
        }
    }
}

/// Bidirectional-replication cycle suppression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CyclicConfig {
    #[serde(default)]
    pub enable: bool,
    /// Whether DDL is forwarded while cyclic mode is on.
    #[serde(rename = "sync-ddl", default = "default_true")]
    pub sync_ddl: bool,
}

/// Sink tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SinkConfig {
    #[serde(rename = "worker-count", default = "default_worker_count")]
    pub worker_count: usize,
    /// Upper bound on a single message-bus message.
    #[serde(rename = "max-message-bytes", default = "default_max_message_bytes")]
    pub max_message_bytes: usize,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            max_message_bytes: default_max_message_bytes(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_worker_count() -> usize {
    4
}

fn default_max_message_bytes() -> usize {
    4 * 1024 * 1024
}

/// Full replication configuration for one changefeed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ReplicaConfig {
    #[serde(default)]
    pub filter: FilterConfig,
    /// Transactions whose commit-ts appears here are dropped entirely.
    #[serde(rename = "ignore-txn-commit-ts", default)]
    pub ignore_txn_commit_ts: Vec<Ts>,
    #[serde(default)]
    pub cyclic: CyclicConfig,
    #[serde(default)]
    pub sink: SinkConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ReplicaConfig::default();
        assert_eq!(config.filter.rules, vec!["*.*"]);
        assert!(!config.filter.case_sensitive);
        assert!(!config.cyclic.enable);
        assert_eq!(config.sink.worker_count, 4);
        assert_eq!(config.sink.max_message_bytes, 4 * 1024 * 1024);
    }

    #[test]
    fn test_parse_partial_json() {
        let config: ReplicaConfig = serde_json::from_str(
            r#"{
                "filter": {"rules": ["test.*"], "case-sensitive": true},
                "ignore-txn-commit-ts": [2000],
                "cyclic": {"enable": true}
            }"#,
        )
        .unwrap();
        assert_eq!(config.filter.rules, vec!["test.*"]);
        assert!(config.filter.case_sensitive);
        assert_eq!(config.ignore_txn_commit_ts, vec![Ts::new(2000)]);
        assert!(config.cyclic.enable);
        // sync-ddl defaults on even when cyclic is only partially given.
        assert!(config.cyclic.sync_ddl);
        assert_eq!(config.sink.worker_count, 4);
    }
}
