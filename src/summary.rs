use serde::{Deserialize, Serialize};

use crate::gtfs_rt::FeedMessage;

/// Per-snapshot counts, taken from raw presence checks on the decoded feed.
///
/// These say how many entities *claimed* to carry each kind of payload, not
/// how many were storable, and are never consulted by reconciliation.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotSummary {
    pub processed_count: usize,
    pub trips_count: usize,
    pub vehicles_count: usize,
    pub alerts_count: usize,
}

impl SnapshotSummary {
    pub fn from_feed(feed: &FeedMessage) -> Self {
        let mut s = SnapshotSummary {
            processed_count: feed.entity.len(),
            ..Default::default()
        };

        for e in &feed.entity {
            if e.trip_update.is_some() {
                s.trips_count += 1;
            }

            if e.vehicle.is_some() {
                s.vehicles_count += 1;
            }

            if e.alert.is_some() {
                s.alerts_count += 1;
            }
        }

        s
    }
}
