use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::{
    AlertRecord, FeedUpdateRecord, NewFeedUpdate, Result, StopTimeUpdateRecord, Store, StoreTx,
    TripRecord, VehiclePositionRecord, VehicleSighting,
};
use crate::model::{Alert, StopTimeUpdate, TripDescriptor};

#[derive(Debug, Default, Clone)]
struct Tables {
    next_id: i64,
    trips: BTreeMap<i64, TripRecord>,
    trip_ids: HashMap<String, i64>,
    /// Keyed by trip row id, in snapshot order.
    stop_time_updates: HashMap<i64, Vec<StopTimeUpdateRecord>>,
    /// Keyed by trip row id, so there is never more than one per trip.
    vehicle_positions: BTreeMap<i64, VehiclePositionRecord>,
    alerts: Vec<AlertRecord>,
    feed_updates: Vec<FeedUpdateRecord>,
}

impl Tables {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn trip(&self, trip_id: &str) -> Option<&TripRecord> {
        self.trip_ids.get(trip_id).and_then(|id| self.trips.get(id))
    }
}

/// An in-process [`Store`].
///
/// A transaction works on a private copy of the tables while holding the
/// store lock, and publishes the copy on commit. Readers wait for the
/// writer, so isolation is serializable.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

struct MemoryTx {
    guard: OwnedMutexGuard<Tables>,
    working: Tables,
}

#[async_trait]
impl StoreTx for MemoryTx {
    async fn find_trip(&mut self, trip_id: &str) -> Result<Option<TripRecord>> {
        Ok(self.working.trip(trip_id).cloned())
    }

    async fn create_trip(&mut self, trip: &TripDescriptor) -> Result<TripRecord> {
        if let Some(existing) = self.working.trip(&trip.trip_id) {
            return Ok(existing.clone());
        }

        let id = self.working.next_id();
        let record = TripRecord {
            id,
            trip_id: trip.trip_id.clone(),
            route_id: trip.route_id.clone(),
            start_time: trip.start_time.clone(),
            start_date: trip.start_date.clone(),
            schedule_relationship: trip.schedule_relationship,
        };
        self.working.trip_ids.insert(trip.trip_id.clone(), id);
        self.working.trips.insert(id, record.clone());
        Ok(record)
    }

    async fn replace_stop_time_updates(
        &mut self,
        trip: i64,
        updates: &[StopTimeUpdate],
    ) -> Result<()> {
        let mut rows = Vec::with_capacity(updates.len());
        for update in updates {
            let id = self.working.next_id();
            rows.push(StopTimeUpdateRecord::from_update(id, trip, update));
        }
        self.working.stop_time_updates.insert(trip, rows);
        Ok(())
    }

    async fn upsert_vehicle_position(
        &mut self,
        trip: i64,
        sighting: &VehicleSighting,
    ) -> Result<()> {
        let id = match self.working.vehicle_positions.get(&trip) {
            Some(existing) => existing.id,
            None => self.working.next_id(),
        };
        self.working
            .vehicle_positions
            .insert(trip, VehiclePositionRecord::from_sighting(id, trip, sighting));
        Ok(())
    }

    async fn insert_alert(&mut self, alert: &Alert, created_at: DateTime<Utc>) -> Result<i64> {
        let id = self.working.next_id();
        self.working
            .alerts
            .push(AlertRecord::from_alert(id, alert, created_at));
        Ok(id)
    }

    async fn insert_feed_update(&mut self, feed: &NewFeedUpdate) -> Result<FeedUpdateRecord> {
        let id = self.working.next_id();
        let record = FeedUpdateRecord::from_new(id, feed);
        self.working.feed_updates.push(record.clone());
        Ok(record)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let MemoryTx { mut guard, working } = *self;
        *guard = working;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn StoreTx>> {
        let guard = self.tables.clone().lock_owned().await;
        let working = guard.clone();
        Ok(Box::new(MemoryTx { guard, working }))
    }

    async fn trip(&self, trip_id: &str) -> Result<Option<TripRecord>> {
        Ok(self.tables.lock().await.trip(trip_id).cloned())
    }

    async fn trips(&self) -> Result<Vec<TripRecord>> {
        Ok(self.tables.lock().await.trips.values().cloned().collect())
    }

    async fn stop_time_updates(&self, trip_id: &str) -> Result<Vec<StopTimeUpdateRecord>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .trip(trip_id)
            .and_then(|trip| tables.stop_time_updates.get(&trip.id))
            .cloned()
            .unwrap_or_default())
    }

    async fn vehicle_position(&self, trip_id: &str) -> Result<Option<VehiclePositionRecord>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .trip(trip_id)
            .and_then(|trip| tables.vehicle_positions.get(&trip.id))
            .cloned())
    }

    async fn vehicle_positions(&self) -> Result<Vec<VehiclePositionRecord>> {
        Ok(self
            .tables
            .lock()
            .await
            .vehicle_positions
            .values()
            .cloned()
            .collect())
    }

    async fn alerts(&self) -> Result<Vec<AlertRecord>> {
        Ok(self.tables.lock().await.alerts.clone())
    }

    async fn active_alerts(&self) -> Result<Vec<AlertRecord>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .alerts
            .iter()
            .rev()
            .filter(|a| a.active)
            .cloned()
            .collect())
    }

    async fn feed_updates(&self) -> Result<Vec<FeedUpdateRecord>> {
        Ok(self.tables.lock().await.feed_updates.clone())
    }

    async fn active_trips(&self, now: DateTime<Utc>) -> Result<Vec<TripRecord>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .trips
            .values()
            .filter(|trip| {
                tables.stop_time_updates.get(&trip.id).is_some_and(|rows| {
                    rows.iter()
                        .any(|row| row.arrival_time.is_some_and(|t| t >= now))
                })
            })
            .cloned()
            .collect())
    }

    async fn recent_vehicle_positions(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<VehiclePositionRecord>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .vehicle_positions
            .values()
            .filter(|v| v.timestamp >= since)
            .cloned()
            .collect())
    }
}
