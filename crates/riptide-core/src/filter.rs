//! Table and transaction filtering.
//!
//! A changefeed carries an allowlist of `schema.table` glob patterns plus a
//! list of commit timestamps to drop. System schemas are always filtered
//! out regardless of the rules.

use regex::Regex;

use crate::config::ReplicaConfig;
use crate::error::{CoreError, Result};
use crate::model::{Ts, Txn};

/// Schemas that are never replicated, matched case-insensitively.
const SYS_SCHEMAS: [&str; 4] = [
    "INFORMATION_SCHEMA",
    "PERFORMANCE_SCHEMA",
    "MYSQL",
    "METRIC_SCHEMA",
];

/// Compiled filter for one changefeed.
pub struct TableFilter {
    patterns: Vec<Regex>,
    case_sensitive: bool,
    ignore_txn_commit_ts: Vec<Ts>,
}

impl TableFilter {
    pub fn new(config: &ReplicaConfig) -> Result<Self> {
        let patterns = config
            .filter
            .rules
            .iter()
            .map(|rule| glob_to_regex(rule, config.filter.case_sensitive))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            patterns,
            case_sensitive: config.filter.case_sensitive,
            ignore_txn_commit_ts: config.ignore_txn_commit_ts.clone(),
        })
    }

    /// True when the schema is one of the always-excluded system schemas.
    pub fn is_sys_schema(schema: &str) -> bool {
        SYS_SCHEMAS
            .iter()
            .any(|s| s.eq_ignore_ascii_case(schema))
    }

    /// Whether events for `schema.table` should be dropped. Pass an empty
    /// table name to test a whole schema.
    pub fn should_ignore_table(&self, schema: &str, table: &str) -> bool {
        if Self::is_sys_schema(schema) {
            return true;
        }
        if self.patterns.is_empty() {
            return false;
        }
        let name = if self.case_sensitive {
            format!("{schema}.{table}")
        } else {
            format!("{schema}.{table}").to_lowercase()
        };
        !self.patterns.iter().any(|p| p.is_match(&name))
    }

    /// Whether a whole transaction should be dropped by commit-ts.
    pub fn should_ignore_txn(&self, commit_ts: Ts) -> bool {
        self.ignore_txn_commit_ts.contains(&commit_ts)
    }

    /// Remove DMLs/DDL the changefeed does not want. Returns true when the
    /// transaction still carries something to emit.
    pub fn filter_txn(&self, txn: &mut Txn) -> bool {
        if self.should_ignore_txn(txn.commit_ts) {
            txn.dmls.clear();
            txn.ddl = None;
            return false;
        }
        if let Some(ddl) = &txn.ddl {
            if self.should_ignore_table(&ddl.schema, &ddl.table) {
                txn.ddl = None;
            }
        }
        txn.dmls
            .retain(|dml| !self.should_ignore_table(&dml.schema, &dml.table));
        !txn.is_empty()
    }
}

/// Compile a `schema.table` glob (`*` and `?`) into an anchored regex.
fn glob_to_regex(pattern: &str, case_sensitive: bool) -> Result<Regex> {
    let pattern = if case_sensitive {
        pattern.to_string()
    } else {
        pattern.to_lowercase()
    };
    let escaped = regex::escape(&pattern);
    let regex_pattern = escaped.replace(r"\*", ".*").replace(r"\?", ".");
    Regex::new(&format!("^{regex_pattern}$"))
        .map_err(|e| CoreError::InvalidFilterRule(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FilterConfig;
    use crate::model::{RowChangedEvent, RowKind};
    use std::collections::BTreeMap;

    fn filter(rules: &[&str], case_sensitive: bool) -> TableFilter {
        let config = ReplicaConfig {
            filter: FilterConfig {
                rules: rules.iter().map(|s| s.to_string()).collect(),
                case_sensitive,
            },
            ..Default::default()
        };
        TableFilter::new(&config).unwrap()
    }

    fn row(schema: &str, table: &str, ts: u64) -> RowChangedEvent {
        RowChangedEvent {
            schema: schema.into(),
            table: table.into(),
            kind: RowKind::Insert,
            commit_ts: Ts::new(ts),
            columns: BTreeMap::new(),
        }
    }

    #[test]
    fn test_sys_schemas_always_ignored() {
        let f = filter(&["*.*"], false);
        assert!(f.should_ignore_table("mysql", "user"));
        assert!(f.should_ignore_table("MySQL", "user"));
        assert!(f.should_ignore_table("information_schema", "tables"));
        assert!(!f.should_ignore_table("test", "t"));
    }

    #[test]
    fn test_allowlist_globs() {
        let f = filter(&["test.*", "app.orders_?"], false);
        assert!(!f.should_ignore_table("test", "anything"));
        assert!(!f.should_ignore_table("app", "orders_1"));
        assert!(f.should_ignore_table("app", "orders_10"));
        assert!(f.should_ignore_table("other", "t"));
    }

    #[test]
    fn test_case_sensitivity() {
        let insensitive = filter(&["Test.T"], false);
        assert!(!insensitive.should_ignore_table("test", "t"));

        let sensitive = filter(&["Test.T"], true);
        assert!(sensitive.should_ignore_table("test", "t"));
        assert!(!sensitive.should_ignore_table("Test", "T"));
    }

    #[test]
    fn test_ignore_txn_commit_ts() {
        let config = ReplicaConfig {
            ignore_txn_commit_ts: vec![Ts::new(2000)],
            ..Default::default()
        };
        let f = TableFilter::new(&config).unwrap();
        assert!(f.should_ignore_txn(Ts::new(2000)));
        assert!(!f.should_ignore_txn(Ts::new(2001)));

        let mut txn = Txn {
            commit_ts: Ts::new(2000),
            dmls: vec![row("test", "t", 2000)],
            ddl: None,
        };
        assert!(!f.filter_txn(&mut txn));
        assert!(txn.is_empty());
    }

    #[test]
    fn test_filter_txn_drops_unwanted_dmls() {
        let f = filter(&["test.*"], false);
        let mut txn = Txn {
            commit_ts: Ts::new(10),
            dmls: vec![row("test", "t", 10), row("mysql", "user", 10)],
            ddl: None,
        };
        assert!(f.filter_txn(&mut txn));
        assert_eq!(txn.dmls.len(), 1);
        assert_eq!(txn.dmls[0].schema, "test");
    }
}
