//! Per-region resolved-ts tracking.

use std::collections::{BTreeSet, HashMap};

use riptide_core::model::{RegionId, Ts};
use tracing::warn;

/// Tracks the resolved-ts of every region covering a span.
///
/// The span's resolved-ts is the minimum over all tracked regions. Regions
/// are indexed both by id and by an ordered (ts, id) set so updates are
/// logarithmic and the minimum is read off the front.
#[derive(Debug, Default)]
pub struct ResolvedTsTracker {
    regions: HashMap<RegionId, Ts>,
    ordered: BTreeSet<(Ts, RegionId)>,
}

impl ResolvedTsTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a region's resolved-ts. Regressions are ignored: a region's
    /// resolved-ts never moves backwards. Returns true when the entry
    /// changed.
    pub fn update(&mut self, region: RegionId, ts: Ts) -> bool {
        match self.regions.get(&region).copied() {
            Some(current) if ts <= current => {
                if ts < current {
                    warn!(%region, %ts, %current, "ignoring resolved-ts regression");
                }
                false
            }
            Some(current) => {
                self.ordered.remove(&(current, region));
                self.ordered.insert((ts, region));
                self.regions.insert(region, ts);
                true
            }
            None => {
                self.ordered.insert((ts, region));
                self.regions.insert(region, ts);
                true
            }
        }
    }

    /// The span-wide resolved-ts: the minimum over tracked regions.
    pub fn min(&self) -> Option<Ts> {
        self.ordered.iter().next().map(|(ts, _)| *ts)
    }

    pub fn get(&self, region: RegionId) -> Option<Ts> {
        self.regions.get(&region).copied()
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// A region split: children inherit the parent's resolved-ts until
    /// their own streams report, then the parent entry is dropped.
    pub fn split(&mut self, parent: RegionId, children: &[RegionId]) {
        let Some(parent_ts) = self.regions.get(&parent).copied() else {
            for child in children {
                self.update(*child, Ts::ZERO);
            }
            return;
        };
        for child in children {
            self.update(*child, parent_ts);
        }
        self.remove(parent);
    }

    /// A region went away and `replacement` serves its range. The
    /// replacement starts at the gone region's last value, so the span
    /// minimum never regresses below what the gone region had promised.
    pub fn replace(&mut self, gone: RegionId, replacement: RegionId) {
        let Some(last) = self.regions.get(&gone).copied() else {
            return;
        };
        self.update(replacement, last);
        self.remove(gone);
    }

    fn remove(&mut self, region: RegionId) {
        if let Some(ts) = self.regions.remove(&region) {
            self.ordered.remove(&(ts, region));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_min_over_regions() {
        let mut tracker = ResolvedTsTracker::new();
        assert_eq!(tracker.min(), None);
        tracker.update(RegionId(1), Ts::new(100));
        tracker.update(RegionId(2), Ts::new(80));
        tracker.update(RegionId(3), Ts::new(120));
        assert_eq!(tracker.min(), Some(Ts::new(80)));

        tracker.update(RegionId(2), Ts::new(130));
        assert_eq!(tracker.min(), Some(Ts::new(100)));
    }

    #[test]
    fn test_regression_ignored() {
        let mut tracker = ResolvedTsTracker::new();
        tracker.update(RegionId(1), Ts::new(100));
        assert!(!tracker.update(RegionId(1), Ts::new(50)));
        assert_eq!(tracker.min(), Some(Ts::new(100)));
    }

    #[test]
    fn test_split_inherits_parent() {
        let mut tracker = ResolvedTsTracker::new();
        tracker.update(RegionId(1), Ts::new(100));
        tracker.update(RegionId(9), Ts::new(300));
        tracker.split(RegionId(1), &[RegionId(2), RegionId(3)]);

        assert_eq!(tracker.get(RegionId(1)), None);
        assert_eq!(tracker.get(RegionId(2)), Some(Ts::new(100)));
        assert_eq!(tracker.get(RegionId(3)), Some(Ts::new(100)));
        // Minimum is unchanged by the split.
        assert_eq!(tracker.min(), Some(Ts::new(100)));
    }

    #[test]
    fn test_replace_keeps_floor() {
        let mut tracker = ResolvedTsTracker::new();
        tracker.update(RegionId(1), Ts::new(100));
        tracker.update(RegionId(2), Ts::new(200));
        tracker.replace(RegionId(1), RegionId(7));

        // The replacement inherits the gone region's last value, so the
        // span minimum holds at 100 until region 7 reports beyond it.
        assert_eq!(tracker.min(), Some(Ts::new(100)));
        assert_eq!(tracker.get(RegionId(1)), None);

        tracker.update(RegionId(7), Ts::new(250));
        assert_eq!(tracker.min(), Some(Ts::new(200)));
    }

    #[test]
    fn test_min_is_exact_over_current_regions() {
        // Invariant: span resolved-ts equals the min of current per-region
        // values, under an arbitrary interleaving.
        let mut tracker = ResolvedTsTracker::new();
        let updates = [
            (RegionId(1), 10),
            (RegionId(2), 25),
            (RegionId(3), 15),
            (RegionId(1), 30),
            (RegionId(3), 22),
            (RegionId(2), 26),
        ];
        for (region, ts) in updates {
            tracker.update(region, Ts::new(ts));
            let expected = tracker
                .regions
                .values()
                .copied()
                .min()
                .expect("nonempty tracker");
            assert_eq!(tracker.min(), Some(expected));
        }
    }
}
