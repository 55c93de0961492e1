//! Metadata-store key layout.
//!
//! All coordination state lives under a configured prefix:
//!
//! ```text
//! <prefix>/changefeed/info/<id>             ChangeFeedInfo (JSON)
//! <prefix>/changefeed/status/<id>           ChangeFeedStatus (JSON)
//! <prefix>/capture/<capture-id>             CaptureInfo (JSON, leased)
//! <prefix>/task/status/<cf>/<capture>       TaskStatus (JSON, CAS)
//! <prefix>/task/position/<cf>/<capture>     TaskPosition (JSON, CAS)
//! <prefix>/task/workload/<cf>/<capture>     TaskWorkload (JSON)
//! <prefix>/owner                            owner election (leased lock)
//! ```

use riptide_core::model::{CaptureId, ChangeFeedId};

/// Key builder rooted at a cluster prefix.
#[derive(Debug, Clone)]
pub struct KeySpace {
    prefix: String,
}

impl KeySpace {
    pub fn new(prefix: impl Into<String>) -> Self {
        let mut prefix = prefix.into();
        while prefix.ends_with('/') {
            prefix.pop();
        }
        Self { prefix }
    }

    pub fn changefeed_info(&self, id: &ChangeFeedId) -> String {
        format!("{}/changefeed/info/{}", self.prefix, id)
    }

    pub fn changefeed_info_prefix(&self) -> String {
        format!("{}/changefeed/info/", self.prefix)
    }

    pub fn changefeed_status(&self, id: &ChangeFeedId) -> String {
        format!("{}/changefeed/status/{}", self.prefix, id)
    }

    pub fn capture(&self, id: &CaptureId) -> String {
        format!("{}/capture/{}", self.prefix, id)
    }

    pub fn capture_prefix(&self) -> String {
        format!("{}/capture/", self.prefix)
    }

    pub fn task_status(&self, cf: &ChangeFeedId, capture: &CaptureId) -> String {
        format!("{}/task/status/{}/{}", self.prefix, cf, capture)
    }

    pub fn task_status_prefix(&self, cf: &ChangeFeedId) -> String {
        format!("{}/task/status/{}/", self.prefix, cf)
    }

    pub fn task_position(&self, cf: &ChangeFeedId, capture: &CaptureId) -> String {
        format!("{}/task/position/{}/{}", self.prefix, cf, capture)
    }

    pub fn task_position_prefix(&self, cf: &ChangeFeedId) -> String {
        format!("{}/task/position/{}/", self.prefix, cf)
    }

    pub fn task_workload(&self, cf: &ChangeFeedId, capture: &CaptureId) -> String {
        format!("{}/task/workload/{}/{}", self.prefix, cf, capture)
    }

    pub fn task_workload_prefix(&self, cf: &ChangeFeedId) -> String {
        format!("{}/task/workload/{}/", self.prefix, cf)
    }

    pub fn owner(&self) -> String {
        format!("{}/owner", self.prefix)
    }

    /// The trailing id segment of a single-id key, e.g. the capture id of a
    /// `/capture/<id>` key.
    pub fn last_segment(key: &str) -> &str {
        key.rsplit('/').next().unwrap_or(key)
    }
}

impl Default for KeySpace {
    fn default() -> Self {
        Self::new("/riptide")
    }
}
