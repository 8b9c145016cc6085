use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use tracing::{debug, info};

use super::{
    AlertRecord, FeedUpdateRecord, NewFeedUpdate, Result, StopTimeUpdateRecord, Store, StoreTx,
    TripRecord, VehiclePositionRecord, VehicleSighting,
};
use crate::error::PersistenceError;
use crate::model::{
    Alert, AlertEffect, StopTimeScheduleRelationship, StopTimeUpdate, TripDescriptor,
    TripScheduleRelationship, VehicleStopStatus,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS trips (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    trip_id TEXT NOT NULL UNIQUE,
    route_id TEXT NOT NULL,
    start_time TEXT,
    start_date TEXT,
    schedule_relationship INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS ix_trips_route_id ON trips (route_id);

CREATE TABLE IF NOT EXISTS stop_time_updates (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    trip INTEGER NOT NULL REFERENCES trips (id) ON DELETE CASCADE,
    stop_id TEXT NOT NULL,
    arrival_time TEXT,
    arrival_delay INTEGER,
    departure_time TEXT,
    departure_delay INTEGER,
    schedule_relationship INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS ix_stop_time_updates_trip ON stop_time_updates (trip);
CREATE INDEX IF NOT EXISTS ix_stop_time_updates_stop_id ON stop_time_updates (stop_id);

CREATE TABLE IF NOT EXISTS vehicle_positions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    trip INTEGER NOT NULL UNIQUE REFERENCES trips (id),
    latitude REAL,
    longitude REAL,
    bearing REAL,
    speed REAL,
    current_stop_sequence INTEGER,
    current_stop_id TEXT,
    current_status INTEGER NOT NULL,
    timestamp TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS alerts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    effect INTEGER NOT NULL,
    header_text TEXT,
    description_text TEXT,
    active INTEGER NOT NULL DEFAULT 1,
    informed_entities TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS ix_alerts_active ON alerts (active);

CREATE TABLE IF NOT EXISTS feed_updates (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    line_group TEXT,
    timestamp TEXT NOT NULL,
    version TEXT NOT NULL,
    processed_count INTEGER NOT NULL,
    trips_count INTEGER NOT NULL,
    vehicles_count INTEGER NOT NULL,
    alerts_count INTEGER NOT NULL
);
"#;

const TRIP_COLUMNS: &str =
    "trips.id, trips.trip_id, trips.route_id, trips.start_time, trips.start_date, trips.schedule_relationship";

const VEHICLE_COLUMNS: &str = "vehicle_positions.id, vehicle_positions.trip, latitude, longitude, bearing, speed, \
     current_stop_sequence, current_stop_id, current_status, timestamp";

/// A [`Store`] backed by SQLite.
///
/// `trips.trip_id` is unique, so concurrent runs that create the same trip
/// converge on one row.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Opens (creating if missing) the database at `url` and applies the schema.
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        info!(url, "SQLite store ready");
        Ok(store)
    }

    /// A private in-memory database, mostly useful in tests.
    ///
    /// Each SQLite in-memory connection is its own database, so the pool is
    /// pinned to a single connection that never expires.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        debug!("Schema applied");
        Ok(())
    }
}

struct SqliteTx {
    tx: Transaction<'static, Sqlite>,
}

#[async_trait]
impl StoreTx for SqliteTx {
    async fn find_trip(&mut self, trip_id: &str) -> Result<Option<TripRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {TRIP_COLUMNS} FROM trips WHERE trip_id = ?"
        ))
        .bind(trip_id)
        .fetch_optional(&mut *self.tx)
        .await?;

        row.as_ref().map(trip_from_row).transpose()
    }

    async fn create_trip(&mut self, trip: &TripDescriptor) -> Result<TripRecord> {
        sqlx::query(
            "INSERT INTO trips (trip_id, route_id, start_time, start_date, schedule_relationship) \
             VALUES (?, ?, ?, ?, ?) ON CONFLICT (trip_id) DO NOTHING",
        )
        .bind(&trip.trip_id)
        .bind(&trip.route_id)
        .bind(&trip.start_time)
        .bind(&trip.start_date)
        .bind(trip.schedule_relationship.to_wire())
        .execute(&mut *self.tx)
        .await?;

        self.find_trip(&trip.trip_id).await?.ok_or_else(|| {
            PersistenceError::Integrity(format!("trip '{}' vanished after insert", trip.trip_id))
        })
    }

    async fn replace_stop_time_updates(
        &mut self,
        trip: i64,
        updates: &[StopTimeUpdate],
    ) -> Result<()> {
        sqlx::query("DELETE FROM stop_time_updates WHERE trip = ?")
            .bind(trip)
            .execute(&mut *self.tx)
            .await?;

        for update in updates {
            let row = StopTimeUpdateRecord::from_update(0, trip, update);
            sqlx::query(
                "INSERT INTO stop_time_updates \
                 (trip, stop_id, arrival_time, arrival_delay, departure_time, departure_delay, schedule_relationship) \
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(trip)
            .bind(&row.stop_id)
            .bind(row.arrival_time)
            .bind(row.arrival_delay)
            .bind(row.departure_time)
            .bind(row.departure_delay)
            .bind(row.schedule_relationship.to_wire())
            .execute(&mut *self.tx)
            .await?;
        }

        Ok(())
    }

    async fn upsert_vehicle_position(
        &mut self,
        trip: i64,
        sighting: &VehicleSighting,
    ) -> Result<()> {
        let row = VehiclePositionRecord::from_sighting(0, trip, sighting);
        sqlx::query(
            "INSERT INTO vehicle_positions \
             (trip, latitude, longitude, bearing, speed, current_stop_sequence, current_stop_id, current_status, timestamp) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT (trip) DO UPDATE SET \
             latitude = excluded.latitude, \
             longitude = excluded.longitude, \
             bearing = excluded.bearing, \
             speed = excluded.speed, \
             current_stop_sequence = excluded.current_stop_sequence, \
             current_stop_id = excluded.current_stop_id, \
             current_status = excluded.current_status, \
             timestamp = excluded.timestamp",
        )
        .bind(trip)
        .bind(row.latitude)
        .bind(row.longitude)
        .bind(row.bearing)
        .bind(row.speed)
        .bind(row.current_stop_sequence)
        .bind(&row.current_stop_id)
        .bind(row.current_status.to_wire())
        .bind(row.timestamp)
        .execute(&mut *self.tx)
        .await?;

        Ok(())
    }

    async fn insert_alert(&mut self, alert: &Alert, created_at: DateTime<Utc>) -> Result<i64> {
        let informed = serde_json::to_string(&alert.informed_entities)?;
        let result = sqlx::query(
            "INSERT INTO alerts (effect, header_text, description_text, active, informed_entities, created_at) \
             VALUES (?, ?, ?, 1, ?, ?)",
        )
        .bind(alert.effect.to_wire())
        .bind(&alert.header_text)
        .bind(&alert.description_text)
        .bind(informed)
        .bind(created_at)
        .execute(&mut *self.tx)
        .await?;

        Ok(result.last_insert_rowid())
    }

    async fn insert_feed_update(&mut self, feed: &NewFeedUpdate) -> Result<FeedUpdateRecord> {
        let result = sqlx::query(
            "INSERT INTO feed_updates \
             (line_group, timestamp, version, processed_count, trips_count, vehicles_count, alerts_count) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&feed.line_group)
        .bind(feed.timestamp)
        .bind(&feed.version)
        .bind(count_to_db(feed.summary.processed_count))
        .bind(count_to_db(feed.summary.trips_count))
        .bind(count_to_db(feed.summary.vehicles_count))
        .bind(count_to_db(feed.summary.alerts_count))
        .execute(&mut *self.tx)
        .await?;

        Ok(FeedUpdateRecord::from_new(result.last_insert_rowid(), feed))
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn begin(&self) -> Result<Box<dyn StoreTx>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(SqliteTx { tx }))
    }

    async fn trip(&self, trip_id: &str) -> Result<Option<TripRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {TRIP_COLUMNS} FROM trips WHERE trip_id = ?"
        ))
        .bind(trip_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(trip_from_row).transpose()
    }

    async fn trips(&self) -> Result<Vec<TripRecord>> {
        let rows = sqlx::query(&format!("SELECT {TRIP_COLUMNS} FROM trips ORDER BY id"))
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(trip_from_row).collect()
    }

    async fn stop_time_updates(&self, trip_id: &str) -> Result<Vec<StopTimeUpdateRecord>> {
        let rows = sqlx::query(
            "SELECT s.id, s.trip, s.stop_id, s.arrival_time, s.arrival_delay, s.departure_time, \
             s.departure_delay, s.schedule_relationship \
             FROM stop_time_updates s JOIN trips t ON t.id = s.trip \
             WHERE t.trip_id = ? ORDER BY s.id",
        )
        .bind(trip_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(stop_time_update_from_row).collect()
    }

    async fn vehicle_position(&self, trip_id: &str) -> Result<Option<VehiclePositionRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {VEHICLE_COLUMNS} FROM vehicle_positions \
             JOIN trips ON trips.id = vehicle_positions.trip WHERE trips.trip_id = ?"
        ))
        .bind(trip_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(vehicle_from_row).transpose()
    }

    async fn vehicle_positions(&self) -> Result<Vec<VehiclePositionRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {VEHICLE_COLUMNS} FROM vehicle_positions ORDER BY vehicle_positions.trip"
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(vehicle_from_row).collect()
    }

    async fn alerts(&self) -> Result<Vec<AlertRecord>> {
        let rows = sqlx::query("SELECT * FROM alerts ORDER BY id")
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(alert_from_row).collect()
    }

    async fn active_alerts(&self) -> Result<Vec<AlertRecord>> {
        let rows = sqlx::query("SELECT * FROM alerts WHERE active = 1 ORDER BY id DESC")
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(alert_from_row).collect()
    }

    async fn feed_updates(&self) -> Result<Vec<FeedUpdateRecord>> {
        let rows = sqlx::query("SELECT * FROM feed_updates ORDER BY id")
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(feed_update_from_row).collect()
    }

    async fn active_trips(&self, now: DateTime<Utc>) -> Result<Vec<TripRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT DISTINCT {TRIP_COLUMNS} FROM trips \
             JOIN stop_time_updates s ON s.trip = trips.id \
             WHERE julianday(s.arrival_time) >= julianday(?) ORDER BY trips.id"
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(trip_from_row).collect()
    }

    async fn recent_vehicle_positions(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<VehiclePositionRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {VEHICLE_COLUMNS} FROM vehicle_positions \
             WHERE julianday(timestamp) >= julianday(?) ORDER BY vehicle_positions.trip"
        ))
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(vehicle_from_row).collect()
    }
}

fn count_to_db(count: usize) -> i64 {
    i64::try_from(count).unwrap_or(i64::MAX)
}

fn count_from_db(row: &SqliteRow, column: &str) -> Result<usize> {
    let value: i64 = row.try_get(column)?;
    usize::try_from(value)
        .map_err(|_| PersistenceError::Integrity(format!("negative {column}: {value}")))
}

fn trip_from_row(row: &SqliteRow) -> Result<TripRecord> {
    Ok(TripRecord {
        id: row.try_get("id")?,
        trip_id: row.try_get("trip_id")?,
        route_id: row.try_get("route_id")?,
        start_time: row.try_get("start_time")?,
        start_date: row.try_get("start_date")?,
        schedule_relationship: TripScheduleRelationship::from_wire(
            row.try_get("schedule_relationship")?,
        ),
    })
}

fn stop_time_update_from_row(row: &SqliteRow) -> Result<StopTimeUpdateRecord> {
    Ok(StopTimeUpdateRecord {
        id: row.try_get("id")?,
        trip: row.try_get("trip")?,
        stop_id: row.try_get("stop_id")?,
        arrival_time: row.try_get("arrival_time")?,
        arrival_delay: row.try_get("arrival_delay")?,
        departure_time: row.try_get("departure_time")?,
        departure_delay: row.try_get("departure_delay")?,
        schedule_relationship: StopTimeScheduleRelationship::from_wire(
            row.try_get("schedule_relationship")?,
        ),
    })
}

fn vehicle_from_row(row: &SqliteRow) -> Result<VehiclePositionRecord> {
    Ok(VehiclePositionRecord {
        id: row.try_get("id")?,
        trip: row.try_get("trip")?,
        latitude: row.try_get("latitude")?,
        longitude: row.try_get("longitude")?,
        bearing: row.try_get("bearing")?,
        speed: row.try_get("speed")?,
        current_stop_sequence: row.try_get("current_stop_sequence")?,
        current_stop_id: row.try_get("current_stop_id")?,
        current_status: VehicleStopStatus::from_wire(row.try_get("current_status")?),
        timestamp: row.try_get("timestamp")?,
    })
}

fn alert_from_row(row: &SqliteRow) -> Result<AlertRecord> {
    let informed: String = row.try_get("informed_entities")?;
    Ok(AlertRecord {
        id: row.try_get("id")?,
        effect: AlertEffect::from_wire(row.try_get("effect")?),
        header_text: row.try_get("header_text")?,
        description_text: row.try_get("description_text")?,
        active: row.try_get("active")?,
        informed_entities: serde_json::from_str(&informed)?,
        created_at: row.try_get("created_at")?,
    })
}

fn feed_update_from_row(row: &SqliteRow) -> Result<FeedUpdateRecord> {
    Ok(FeedUpdateRecord {
        id: row.try_get("id")?,
        line_group: row.try_get("line_group")?,
        timestamp: row.try_get("timestamp")?,
        version: row.try_get("version")?,
        processed_count: count_from_db(row, "processed_count")?,
        trips_count: count_from_db(row, "trips_count")?,
        vehicles_count: count_from_db(row, "vehicles_count")?,
        alerts_count: count_from_db(row, "alerts_count")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{InformedEntity, Position, TripRef};

    fn descriptor(trip_id: &str, route_id: &str) -> TripDescriptor {
        TripDescriptor {
            trip_id: trip_id.to_string(),
            route_id: route_id.to_string(),
            start_time: Some("08:00:00".to_string()),
            start_date: Some("20231114".to_string()),
            schedule_relationship: TripScheduleRelationship::Added,
        }
    }

    #[tokio::test]
    async fn test_trip_round_trips_through_sqlite() {
        let store = SqliteStore::in_memory().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        let created = tx.create_trip(&descriptor("A1", "A")).await.unwrap();
        let again = tx.create_trip(&descriptor("A1", "C")).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(created, again);
        let stored = store.trip("A1").await.unwrap().unwrap();
        assert_eq!(stored.route_id, "A");
        assert_eq!(stored.schedule_relationship, TripScheduleRelationship::Added);
        assert_eq!(store.trips().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_rollback_discards_rows() {
        let store = SqliteStore::in_memory().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        tx.create_trip(&descriptor("A1", "A")).await.unwrap();
        tx.rollback().await.unwrap();

        assert!(store.trip("A1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_vehicle_upsert_keeps_one_row() {
        let store = SqliteStore::in_memory().await.unwrap();
        let observed = DateTime::from_timestamp(1700000000, 0).unwrap();

        let mut tx = store.begin().await.unwrap();
        let trip = tx.create_trip(&descriptor("A1", "A")).await.unwrap();
        for bearing in [Some(90.0), None] {
            tx.upsert_vehicle_position(
                trip.id,
                &VehicleSighting {
                    position: Some(Position {
                        latitude: 40.5,
                        longitude: -73.5,
                        bearing,
                        speed: None,
                    }),
                    current_stop_sequence: Some(4),
                    current_stop_id: Some("A27N".to_string()),
                    current_status: VehicleStopStatus::StoppedAt,
                    timestamp: observed,
                },
            )
            .await
            .unwrap();
        }
        tx.commit().await.unwrap();

        let vehicles = store.vehicle_positions().await.unwrap();
        assert_eq!(vehicles.len(), 1);
        assert_eq!(vehicles[0].bearing, None);
        assert_eq!(vehicles[0].current_stop_sequence, Some(4));
        assert_eq!(vehicles[0].timestamp, observed);
        assert_eq!(store.recent_vehicle_positions(observed).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_alert_informed_entities_are_preserved() {
        let store = SqliteStore::in_memory().await.unwrap();
        let alert = Alert {
            effect: AlertEffect::Detour,
            header_text: Some("Detour".to_string()),
            description_text: None,
            informed_entities: vec![InformedEntity {
                trip: Some(TripRef {
                    trip_id: "A1".to_string(),
                    route_id: "A".to_string(),
                }),
                stop_id: None,
            }],
        };

        let mut tx = store.begin().await.unwrap();
        tx.insert_alert(&alert, Utc::now()).await.unwrap();
        tx.commit().await.unwrap();

        let alerts = store.active_alerts().await.unwrap();
        assert_eq!(alerts.len(), 1);
        assert!(alerts[0].active);
        assert_eq!(alerts[0].effect, AlertEffect::Detour);
        assert_eq!(alerts[0].informed_entities, alert.informed_entities);
    }
}
