//! Durable state for reconciled feeds.
//!
//! [`Store`] opens transactions and answers read queries. [`StoreTx`] holds
//! the write primitives one reconciliation pass needs; dropping it without
//! calling [`StoreTx::commit`] discards every change made through it.
//! [`MemoryStore`] keeps everything in process, [`SqliteStore`] persists to
//! SQLite through `sqlx`.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PersistenceError;
use crate::model::{
    Alert, AlertEffect, InformedEntity, Position, StopTimeScheduleRelationship,
    StopTimeUpdate, TripDescriptor, TripScheduleRelationship, VehicleStopStatus,
};
use crate::summary::SnapshotSummary;

pub type Result<T> = std::result::Result<T, PersistenceError>;

/// Vehicle positions older than this are not considered current.
pub const DEFAULT_VEHICLE_FRESHNESS: std::time::Duration = std::time::Duration::from_secs(5 * 60);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TripRecord {
    pub id: i64,
    pub trip_id: String,
    pub route_id: String,
    pub start_time: Option<String>,
    pub start_date: Option<String>,
    pub schedule_relationship: TripScheduleRelationship,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopTimeUpdateRecord {
    pub id: i64,
    pub trip: i64,
    pub stop_id: String,
    pub arrival_time: Option<DateTime<Utc>>,
    pub arrival_delay: Option<i32>,
    pub departure_time: Option<DateTime<Utc>>,
    pub departure_delay: Option<i32>,
    pub schedule_relationship: StopTimeScheduleRelationship,
}

impl StopTimeUpdateRecord {
    pub(crate) fn from_update(id: i64, trip: i64, update: &StopTimeUpdate) -> Self {
        Self {
            id,
            trip,
            stop_id: update.stop_id.clone(),
            arrival_time: update.arrival.and_then(|ev| ev.time),
            arrival_delay: update.arrival.and_then(|ev| ev.delay),
            departure_time: update.departure.and_then(|ev| ev.time),
            departure_delay: update.departure.and_then(|ev| ev.delay),
            schedule_relationship: update.schedule_relationship,
        }
    }
}

/// The values written on every vehicle sighting.
#[derive(Debug, Clone, PartialEq)]
pub struct VehicleSighting {
    pub position: Option<Position>,
    pub current_stop_sequence: Option<u32>,
    pub current_stop_id: Option<String>,
    pub current_status: VehicleStopStatus,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehiclePositionRecord {
    pub id: i64,
    pub trip: i64,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub bearing: Option<f32>,
    pub speed: Option<f32>,
    pub current_stop_sequence: Option<u32>,
    pub current_stop_id: Option<String>,
    pub current_status: VehicleStopStatus,
    pub timestamp: DateTime<Utc>,
}

impl VehiclePositionRecord {
    pub(crate) fn from_sighting(id: i64, trip: i64, sighting: &VehicleSighting) -> Self {
        Self {
            id,
            trip,
            latitude: sighting.position.map(|p| p.latitude),
            longitude: sighting.position.map(|p| p.longitude),
            bearing: sighting.position.and_then(|p| p.bearing),
            speed: sighting.position.and_then(|p| p.speed),
            current_stop_sequence: sighting.current_stop_sequence,
            current_stop_id: sighting.current_stop_id.clone(),
            current_status: sighting.current_status,
            timestamp: sighting.timestamp,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRecord {
    pub id: i64,
    pub effect: AlertEffect,
    pub header_text: Option<String>,
    pub description_text: Option<String>,
    pub active: bool,
    pub informed_entities: Vec<InformedEntity>,
    pub created_at: DateTime<Utc>,
}

impl AlertRecord {
    pub(crate) fn from_alert(id: i64, alert: &Alert, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            effect: alert.effect,
            header_text: alert.header_text.clone(),
            description_text: alert.description_text.clone(),
            active: true,
            informed_entities: alert.informed_entities.clone(),
            created_at,
        }
    }
}

/// A feed update about to be recorded.
#[derive(Debug, Clone, PartialEq)]
pub struct NewFeedUpdate {
    pub line_group: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub version: String,
    pub summary: SnapshotSummary,
}

/// One row per successful ingestion run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedUpdateRecord {
    pub id: i64,
    pub line_group: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub version: String,
    pub processed_count: usize,
    pub trips_count: usize,
    pub vehicles_count: usize,
    pub alerts_count: usize,
}

impl FeedUpdateRecord {
    pub(crate) fn from_new(id: i64, feed: &NewFeedUpdate) -> Self {
        Self {
            id,
            line_group: feed.line_group.clone(),
            timestamp: feed.timestamp,
            version: feed.version.clone(),
            processed_count: feed.summary.processed_count,
            trips_count: feed.summary.trips_count,
            vehicles_count: feed.summary.vehicles_count,
            alerts_count: feed.summary.alerts_count,
        }
    }
}

/// Write access scoped to one transaction.
#[async_trait]
pub trait StoreTx: Send {
    async fn find_trip(&mut self, trip_id: &str) -> Result<Option<TripRecord>>;

    /// Creates a trip row. If a row with the same `trip_id` already exists
    /// (for example inserted by a concurrent run) that row is returned as-is.
    async fn create_trip(&mut self, trip: &TripDescriptor) -> Result<TripRecord>;

    /// Deletes every stop-time update of `trip` and inserts `updates` in order.
    async fn replace_stop_time_updates(
        &mut self,
        trip: i64,
        updates: &[StopTimeUpdate],
    ) -> Result<()>;

    /// Creates the vehicle row of `trip`, or overwrites every field of it.
    async fn upsert_vehicle_position(&mut self, trip: i64, sighting: &VehicleSighting)
    -> Result<()>;

    async fn insert_alert(&mut self, alert: &Alert, created_at: DateTime<Utc>) -> Result<i64>;

    async fn insert_feed_update(&mut self, feed: &NewFeedUpdate) -> Result<FeedUpdateRecord>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn StoreTx>>;

    async fn trip(&self, trip_id: &str) -> Result<Option<TripRecord>>;

    async fn trips(&self) -> Result<Vec<TripRecord>>;

    /// Stop-time updates of a trip in snapshot order.
    async fn stop_time_updates(&self, trip_id: &str) -> Result<Vec<StopTimeUpdateRecord>>;

    async fn vehicle_position(&self, trip_id: &str) -> Result<Option<VehiclePositionRecord>>;

    async fn vehicle_positions(&self) -> Result<Vec<VehiclePositionRecord>>;

    async fn alerts(&self) -> Result<Vec<AlertRecord>>;

    /// Alerts not yet retired, newest first.
    async fn active_alerts(&self) -> Result<Vec<AlertRecord>>;

    async fn feed_updates(&self) -> Result<Vec<FeedUpdateRecord>>;

    /// Trips with at least one predicted arrival at or after `now`.
    async fn active_trips(&self, now: DateTime<Utc>) -> Result<Vec<TripRecord>>;

    /// Vehicle positions observed at or after `since`.
    async fn recent_vehicle_positions(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<VehiclePositionRecord>>;
}
