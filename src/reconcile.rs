//! Merges a normalized snapshot into durable per-trip state.
//!
//! One snapshot is applied inside one store transaction, in this order:
//! feed-update record, trip updates, vehicle positions, alerts. Any storage
//! failure rolls the whole snapshot back.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::error::PersistenceError;
use crate::model::{StopTimeUpdate, TripDescriptor};
use crate::normalize::Snapshot;
use crate::store::{FeedUpdateRecord, NewFeedUpdate, Store, StoreTx, TripRecord, VehicleSighting};

/// What an empty stop-time list in a trip update means.
///
/// Protobuf cannot tell an omitted repeated field from an empty one, and
/// producers use both to mean different things.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
pub enum StopTimePolicy {
    /// An empty list is "no stop-time data": existing predictions stay.
    #[default]
    LeaveUntouched,
    /// An empty list is "zero predictions": existing predictions are removed.
    Clear,
}

impl StopTimePolicy {
    fn replaces(self, updates: &[StopTimeUpdate]) -> bool {
        match self {
            StopTimePolicy::LeaveUntouched => !updates.is_empty(),
            StopTimePolicy::Clear => true,
        }
    }
}

impl FromStr for StopTimePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "leave-untouched" | "leave_untouched" => Ok(StopTimePolicy::LeaveUntouched),
            "clear" => Ok(StopTimePolicy::Clear),
            other => Err(format!("unknown stop time policy '{other}'")),
        }
    }
}

#[derive(Debug, Default)]
struct Tally {
    trips_created: usize,
    stop_time_sets_replaced: usize,
    vehicles_upserted: usize,
    vehicles_skipped: usize,
    alerts_inserted: usize,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Reconciler {
    policy: StopTimePolicy,
}

impl Reconciler {
    pub fn new(policy: StopTimePolicy) -> Self {
        Self { policy }
    }

    /// Applies `snapshot` to `store` atomically.
    ///
    /// `ingested_at` stamps new alerts and stands in for missing vehicle and
    /// header timestamps.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError`] if any storage call fails; nothing from
    /// the snapshot is committed in that case.
    #[tracing::instrument(
        skip(self, store, snapshot),
        fields(entities = snapshot.entities.len(), policy = ?self.policy)
    )]
    pub async fn reconcile<S: Store + ?Sized>(
        &self,
        store: &S,
        snapshot: &Snapshot,
        line_group: Option<&str>,
        ingested_at: DateTime<Utc>,
    ) -> Result<FeedUpdateRecord, PersistenceError> {
        let mut tx = store.begin().await?;

        match self
            .apply(tx.as_mut(), snapshot, line_group, ingested_at)
            .await
        {
            Ok(record) => {
                tx.commit().await?;
                Ok(record)
            }
            Err(e) => {
                error!(error = %e, "Reconciliation failed, rolling back snapshot");
                if let Err(rollback) = tx.rollback().await {
                    warn!(error = %rollback, "Rollback failed");
                }
                Err(e)
            }
        }
    }

    async fn apply(
        &self,
        tx: &mut dyn StoreTx,
        snapshot: &Snapshot,
        line_group: Option<&str>,
        ingested_at: DateTime<Utc>,
    ) -> Result<FeedUpdateRecord, PersistenceError> {
        let mut tally = Tally::default();

        let feed_update = tx
            .insert_feed_update(&NewFeedUpdate {
                line_group: line_group.map(str::to_string),
                timestamp: snapshot.header.timestamp.unwrap_or(ingested_at),
                version: snapshot.header.version.clone(),
                summary: snapshot.summary,
            })
            .await?;

        // Trip updates go first so vehicle positions find their trips.
        for (entity_id, update) in snapshot.trip_updates() {
            let trip = find_or_create_trip(tx, &update.trip, &mut tally).await?;

            if self.policy.replaces(&update.stop_time_updates) {
                tx.replace_stop_time_updates(trip.id, &update.stop_time_updates)
                    .await?;
                tally.stop_time_sets_replaced += 1;
            } else {
                debug!(entity_id, trip_id = %trip.trip_id, "No stop-time data, keeping predictions");
            }
        }

        for (entity_id, vehicle) in snapshot.vehicle_positions() {
            let Some(reference) = &vehicle.trip else {
                warn!(entity_id, "Skipping vehicle position without trip reference");
                tally.vehicles_skipped += 1;
                continue;
            };

            // A known trip is found by id alone; creating one needs the route.
            let trip = match tx.find_trip(&reference.trip_id).await? {
                Some(trip) => trip,
                None => match reference.descriptor() {
                    Some(descriptor) => find_or_create_trip(tx, &descriptor, &mut tally).await?,
                    None => {
                        warn!(
                            entity_id,
                            trip_id = %reference.trip_id,
                            "Skipping vehicle position for unknown trip without route"
                        );
                        tally.vehicles_skipped += 1;
                        continue;
                    }
                },
            };
            let sighting = VehicleSighting {
                position: vehicle.position,
                current_stop_sequence: vehicle.current_stop_sequence,
                current_stop_id: vehicle.stop_id.clone(),
                current_status: vehicle.current_status,
                timestamp: vehicle.timestamp.unwrap_or(ingested_at),
            };
            tx.upsert_vehicle_position(trip.id, &sighting).await?;
            tally.vehicles_upserted += 1;
        }

        for (_, alert) in snapshot.alerts() {
            tx.insert_alert(alert, ingested_at).await?;
            tally.alerts_inserted += 1;
        }

        info!(
            feed_update = feed_update.id,
            trips_created = tally.trips_created,
            stop_time_sets_replaced = tally.stop_time_sets_replaced,
            vehicles_upserted = tally.vehicles_upserted,
            vehicles_skipped = tally.vehicles_skipped,
            alerts_inserted = tally.alerts_inserted,
            "Snapshot reconciled"
        );

        Ok(feed_update)
    }
}

/// Descriptive fields are only taken from the first sighting of a trip.
async fn find_or_create_trip(
    tx: &mut dyn StoreTx,
    descriptor: &TripDescriptor,
    tally: &mut Tally,
) -> Result<TripRecord, PersistenceError> {
    if let Some(trip) = tx.find_trip(&descriptor.trip_id).await? {
        return Ok(trip);
    }

    let trip = tx.create_trip(descriptor).await?;
    tally.trips_created += 1;
    Ok(trip)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::StopTimeScheduleRelationship;

    #[test]
    fn test_policy_parsing() {
        assert_eq!("clear".parse::<StopTimePolicy>(), Ok(StopTimePolicy::Clear));
        assert_eq!(
            "Leave-Untouched".parse::<StopTimePolicy>(),
            Ok(StopTimePolicy::LeaveUntouched)
        );
        assert!("sometimes".parse::<StopTimePolicy>().is_err());
    }

    #[test]
    fn test_policy_replaces() {
        let one = [StopTimeUpdate {
            stop_id: "101N".to_string(),
            arrival: None,
            departure: None,
            schedule_relationship: StopTimeScheduleRelationship::Skipped,
        }];

        assert!(StopTimePolicy::LeaveUntouched.replaces(&one));
        assert!(!StopTimePolicy::LeaveUntouched.replaces(&[]));
        assert!(StopTimePolicy::Clear.replaces(&[]));
    }
}
