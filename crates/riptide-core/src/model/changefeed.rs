//! Changefeed configuration and persisted status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::config::ReplicaConfig;

use super::Ts;

/// Identifier of a changefeed (a named replication job).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChangeFeedId(pub String);

impl ChangeFeedId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for ChangeFeedId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ChangeFeedId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Admin command attached to a changefeed by an operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AdminJobType {
    #[default]
    None,
    Stop,
    Resume,
    Remove,
    Finish,
}

/// Lifecycle state of a changefeed, persisted in [`ChangeFeedStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChangeFeedState {
    #[default]
    Normal,
    Stopped,
    Finished,
    Failed,
}

/// Immutable definition of a changefeed, written once by its creator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeFeedInfo {
    #[serde(rename = "sink-uri")]
    pub sink_uri: String,
    #[serde(default)]
    pub opts: HashMap<String, String>,
    #[serde(rename = "create-time")]
    pub create_time: DateTime<Utc>,
    /// Replicate events with `commit_ts > start_ts`. Zero means "derive
    /// from create-time".
    #[serde(rename = "start-ts", default)]
    pub start_ts: Ts,
    /// The changefeed finishes once it has synced through this ts. Zero
    /// means unbounded.
    #[serde(rename = "target-ts", default)]
    pub target_ts: Ts,
    #[serde(rename = "admin-job-type", default)]
    pub admin_job_type: AdminJobType,
    #[serde(default)]
    pub config: ReplicaConfig,
}

impl ChangeFeedInfo {
    pub fn new(sink_uri: impl Into<String>) -> Self {
        Self {
            sink_uri: sink_uri.into(),
            opts: HashMap::new(),
            create_time: Utc::now(),
            start_ts: Ts::ZERO,
            target_ts: Ts::ZERO,
            admin_job_type: AdminJobType::None,
            config: ReplicaConfig::default(),
        }
    }

    /// The effective start-ts: explicit, or encoded from create-time.
    pub fn get_start_ts(&self) -> Ts {
        if !self.start_ts.is_zero() {
            return self.start_ts;
        }
        Ts::from_unix_ms(self.create_time.timestamp_millis())
    }

    /// The effective target-ts: explicit, or unbounded.
    pub fn get_target_ts(&self) -> Ts {
        if !self.target_ts.is_zero() {
            return self.target_ts;
        }
        Ts::MAX
    }
}

/// Mutable changefeed progress, written only by the current owner.
///
/// Both timestamps are non-decreasing across successful writes, and
/// `start_ts <= checkpoint_ts <= resolved_ts <= target_ts` holds at all
/// times.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ChangeFeedStatus {
    #[serde(rename = "resolved-ts", default)]
    pub resolved_ts: Ts,
    #[serde(rename = "checkpoint-ts", default)]
    pub checkpoint_ts: Ts,
    #[serde(rename = "admin-job-type", default)]
    pub admin_job_type: AdminJobType,
    #[serde(default)]
    pub state: ChangeFeedState,
    /// Human-readable reason when `state` is `Failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ChangeFeedStatus {
    /// Apply a candidate advance, keeping both fields monotonic.
    /// Returns true when anything changed.
    pub fn advance(&mut self, resolved_ts: Ts, checkpoint_ts: Ts) -> bool {
        let mut changed = false;
        if resolved_ts > self.resolved_ts {
            self.resolved_ts = resolved_ts;
            changed = true;
        }
        if checkpoint_ts > self.checkpoint_ts {
            self.checkpoint_ts = checkpoint_ts;
            changed = true;
        }
        debug_assert!(self.checkpoint_ts <= self.resolved_ts || self.resolved_ts.is_zero());
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_ts_defaults_from_create_time() {
        let info = ChangeFeedInfo::new("blackhole://");
        assert!(info.start_ts.is_zero());
        let derived = info.get_start_ts();
        assert_eq!(derived.physical(), info.create_time.timestamp_millis());
    }

    #[test]
    fn test_target_ts_defaults_to_max() {
        let mut info = ChangeFeedInfo::new("blackhole://");
        assert_eq!(info.get_target_ts(), Ts::MAX);
        info.target_ts = Ts::new(1234);
        assert_eq!(info.get_target_ts(), Ts::new(1234));
    }

    #[test]
    fn test_status_advance_is_monotonic() {
        let mut status = ChangeFeedStatus::default();
        assert!(status.advance(Ts::new(100), Ts::new(90)));
        assert!(!status.advance(Ts::new(50), Ts::new(40)));
        assert_eq!(status.resolved_ts, Ts::new(100));
        assert_eq!(status.checkpoint_ts, Ts::new(90));
        assert!(status.advance(Ts::new(110), Ts::new(90)));
        assert_eq!(status.resolved_ts, Ts::new(110));
    }

    #[test]
    fn test_info_json_keys() {
        let info = ChangeFeedInfo::new("mysql://root@downstream:4000/");
        let json = serde_json::to_string(&info).unwrap();
        for key in ["sink-uri", "create-time", "start-ts", "target-ts"] {
            assert!(json.contains(key), "missing {key} in {json}");
        }
    }
}
