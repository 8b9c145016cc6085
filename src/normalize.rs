//! Conversion of decoded feed entities into the canonical domain model.
//!
//! Normalization never fails as a whole: a part of an entity that cannot be
//! interpreted is logged and dropped while the rest of the snapshot survives.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{DecodeError, EntityError};
use crate::gtfs_rt;
use crate::model::{
    Alert, AlertEffect, InformedEntity, NormalizedEntity, Position, StopTimeEvent,
    StopTimeScheduleRelationship, StopTimeUpdate, TripDescriptor, TripRef,
    TripScheduleRelationship, TripUpdate, VehiclePosition, VehicleStopStatus, VehicleTrip,
};
use crate::parser::parse_feed;
use crate::summary::SnapshotSummary;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotHeader {
    pub timestamp: Option<DateTime<Utc>>,
    pub version: String,
}

/// One decoded and normalized feed payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub header: SnapshotHeader,
    pub entities: Vec<NormalizedEntity>,
    pub summary: SnapshotSummary,
}

impl Snapshot {
    /// Decodes and normalizes a payload without touching storage.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let feed = parse_feed(bytes)?;
        Ok(normalize_feed(&feed))
    }

    pub fn trip_updates(&self) -> impl Iterator<Item = (&str, &TripUpdate)> {
        self.entities
            .iter()
            .filter_map(|e| e.trip_update.as_ref().map(|t| (e.id.as_str(), t)))
    }

    pub fn vehicle_positions(&self) -> impl Iterator<Item = (&str, &VehiclePosition)> {
        self.entities
            .iter()
            .filter_map(|e| e.vehicle.as_ref().map(|v| (e.id.as_str(), v)))
    }

    pub fn alerts(&self) -> impl Iterator<Item = (&str, &Alert)> {
        self.entities
            .iter()
            .filter_map(|e| e.alert.as_ref().map(|a| (e.id.as_str(), a)))
    }

    /// Projects the snapshot onto one kind of entity, or all of them.
    pub fn view(&self, kind: FeedKind) -> SnapshotView<'_> {
        match kind {
            FeedKind::All => SnapshotView::All {
                header: &self.header,
                vehicle_positions: keyed(self.vehicle_positions()),
                alerts: keyed(self.alerts()),
                trip_updates: keyed(self.trip_updates()),
            },
            FeedKind::VehiclePositions => {
                SnapshotView::VehiclePositions(keyed(self.vehicle_positions()))
            }
            FeedKind::Alerts => SnapshotView::Alerts(keyed(self.alerts())),
            FeedKind::TripUpdates => SnapshotView::TripUpdates(keyed(self.trip_updates())),
        }
    }
}

/// Which entities a snapshot view includes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum FeedKind {
    #[default]
    All,
    VehiclePositions,
    Alerts,
    TripUpdates,
}

/// An entity payload together with the id of the entity that carried it.
#[derive(Debug, Serialize)]
pub struct Keyed<'a, T> {
    pub id: &'a str,
    #[serde(flatten)]
    pub item: &'a T,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum SnapshotView<'a> {
    All {
        header: &'a SnapshotHeader,
        vehicle_positions: Vec<Keyed<'a, VehiclePosition>>,
        alerts: Vec<Keyed<'a, Alert>>,
        trip_updates: Vec<Keyed<'a, TripUpdate>>,
    },
    VehiclePositions(Vec<Keyed<'a, VehiclePosition>>),
    Alerts(Vec<Keyed<'a, Alert>>),
    TripUpdates(Vec<Keyed<'a, TripUpdate>>),
}

fn keyed<'a, T: 'a>(items: impl Iterator<Item = (&'a str, &'a T)>) -> Vec<Keyed<'a, T>> {
    items.map(|(id, item)| Keyed { id, item }).collect()
}

/// Normalizes every entity of a decoded feed.
pub fn normalize_feed(feed: &gtfs_rt::FeedMessage) -> Snapshot {
    let header = SnapshotHeader {
        timestamp: feed.header.timestamp.and_then(|ts| match unix_u64(ts) {
            Ok(dt) => Some(dt),
            Err(e) => {
                warn!(error = %e, "Ignoring feed header timestamp");
                None
            }
        }),
        version: feed.header.gtfs_realtime_version.clone(),
    };

    let entities: Vec<_> = feed.entity.iter().filter_map(normalize_entity).collect();

    debug!(
        raw = feed.entity.len(),
        normalized = entities.len(),
        "Feed normalized"
    );

    Snapshot {
        header,
        entities,
        summary: SnapshotSummary::from_feed(feed),
    }
}

/// Normalizes one entity. Returns `None` when no part of it is usable.
pub fn normalize_entity(entity: &gtfs_rt::FeedEntity) -> Option<NormalizedEntity> {
    let trip_update = entity
        .trip_update
        .as_ref()
        .and_then(|tu| match normalize_trip_update(&entity.id, tu) {
            Ok(update) => Some(update),
            Err(e) => {
                warn!(entity_id = %entity.id, error = %e, "Dropping trip update");
                None
            }
        });
    let vehicle = entity
        .vehicle
        .as_ref()
        .map(|v| normalize_vehicle(&entity.id, v));
    let alert = entity.alert.as_ref().map(normalize_alert);

    if trip_update.is_none() && vehicle.is_none() && alert.is_none() {
        return None;
    }

    Some(NormalizedEntity {
        id: entity.id.clone(),
        trip_update,
        vehicle,
        alert,
    })
}

fn normalize_trip_update(
    entity_id: &str,
    raw: &gtfs_rt::TripUpdate,
) -> Result<TripUpdate, EntityError> {
    let trip = trip_descriptor(&raw.trip).ok_or_else(|| EntityError::MissingTripReference {
        entity_id: entity_id.to_string(),
    })?;

    let stop_time_updates = raw
        .stop_time_update
        .iter()
        .map(|stu| StopTimeUpdate {
            stop_id: stu.stop_id.clone().unwrap_or_default(),
            arrival: stu.arrival.as_ref().map(|ev| stop_time_event(entity_id, ev)),
            departure: stu.departure.as_ref().map(|ev| stop_time_event(entity_id, ev)),
            schedule_relationship: stu
                .schedule_relationship
                .map(StopTimeScheduleRelationship::from_wire)
                .unwrap_or_default(),
        })
        .collect();

    Ok(TripUpdate {
        trip,
        stop_time_updates,
    })
}

fn stop_time_event(
    entity_id: &str,
    raw: &gtfs_rt::trip_update::StopTimeEvent,
) -> StopTimeEvent {
    let time = raw.time.and_then(|t| match unix_i64(t) {
        Ok(dt) => Some(dt),
        Err(e) => {
            warn!(entity_id, error = %e, "Dropping stop time");
            None
        }
    });

    StopTimeEvent {
        time,
        delay: raw.delay,
    }
}

fn normalize_vehicle(entity_id: &str, raw: &gtfs_rt::VehiclePosition) -> VehiclePosition {
    let trip = raw.trip.as_ref().and_then(|t| {
        let trip = vehicle_trip(t);
        if trip.is_none() {
            warn!(entity_id, "Vehicle position has a trip reference without trip_id");
        }
        trip
    });

    let timestamp = raw.timestamp.and_then(|ts| match unix_u64(ts) {
        Ok(dt) => Some(dt),
        Err(e) => {
            warn!(entity_id, error = %e, "Dropping vehicle timestamp");
            None
        }
    });

    VehiclePosition {
        trip,
        position: raw.position.as_ref().map(|p| Position {
            latitude: f64::from(p.latitude),
            longitude: f64::from(p.longitude),
            bearing: p.bearing,
            speed: p.speed,
        }),
        current_stop_sequence: raw.current_stop_sequence,
        stop_id: raw.stop_id.clone(),
        current_status: raw
            .current_status
            .map(VehicleStopStatus::from_wire)
            .unwrap_or_default(),
        timestamp,
    }
}

fn normalize_alert(raw: &gtfs_rt::Alert) -> Alert {
    let informed_entities: Vec<_> = raw
        .informed_entity
        .iter()
        .map(|sel| InformedEntity {
            trip: sel.trip.as_ref().map(|t| TripRef {
                trip_id: t.trip_id.clone().unwrap_or_default(),
                route_id: t.route_id.clone().unwrap_or_default(),
            }),
            stop_id: sel.stop_id.clone(),
        })
        .collect();

    let untargeted = informed_entities.iter().filter(|e| e.is_empty()).count();
    if untargeted > 0 {
        debug!(untargeted, "Alert has informed entities naming no trip or stop");
    }

    Alert {
        effect: raw.effect.map(AlertEffect::from_wire).unwrap_or_default(),
        header_text: first_translation(raw.header_text.as_ref()),
        description_text: first_translation(raw.description_text.as_ref()),
        informed_entities,
    }
}

/// Locale selection is not supported: the first translation wins.
fn first_translation(text: Option<&gtfs_rt::TranslatedString>) -> Option<String> {
    text.and_then(|t| t.translation.first())
        .map(|translation| translation.text.clone())
}

/// Requires both `trip_id` and `route_id`.
fn trip_descriptor(raw: &gtfs_rt::TripDescriptor) -> Option<TripDescriptor> {
    vehicle_trip(raw)?.descriptor()
}

/// Requires only `trip_id`.
fn vehicle_trip(raw: &gtfs_rt::TripDescriptor) -> Option<VehicleTrip> {
    let trip_id = raw.trip_id.as_deref().filter(|id| !id.is_empty())?;

    Some(VehicleTrip {
        trip_id: trip_id.to_string(),
        route_id: raw.route_id.clone().filter(|id| !id.is_empty()),
        start_time: raw.start_time.clone(),
        start_date: raw.start_date.clone(),
        schedule_relationship: raw
            .schedule_relationship
            .map(TripScheduleRelationship::from_wire)
            .unwrap_or_default(),
    })
}

fn unix_i64(secs: i64) -> Result<DateTime<Utc>, EntityError> {
    DateTime::from_timestamp(secs, 0).ok_or(EntityError::InvalidTimestamp(i128::from(secs)))
}

fn unix_u64(secs: u64) -> Result<DateTime<Utc>, EntityError> {
    let secs = i64::try_from(secs).map_err(|_| EntityError::InvalidTimestamp(i128::from(secs)))?;
    unix_i64(secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gtfs_rt::{
        EntitySelector, FeedEntity, FeedHeader, FeedMessage, TranslatedString,
        translated_string::Translation, trip_update,
    };

    fn raw_trip(trip_id: &str, route_id: &str) -> gtfs_rt::TripDescriptor {
        gtfs_rt::TripDescriptor {
            trip_id: Some(trip_id.to_string()),
            route_id: Some(route_id.to_string()),
            start_time: Some("08:00:00".to_string()),
            start_date: Some("20231114".to_string()),
            ..Default::default()
        }
    }

    fn entity(id: &str) -> FeedEntity {
        FeedEntity {
            id: id.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_trip_update_without_trip_reference_is_dropped() {
        let raw = FeedEntity {
            trip_update: Some(gtfs_rt::TripUpdate::default()),
            ..entity("t1")
        };

        assert_eq!(normalize_entity(&raw), None);
    }

    #[test]
    fn test_trip_update_without_route_is_dropped() {
        let raw = FeedEntity {
            trip_update: Some(gtfs_rt::TripUpdate {
                trip: gtfs_rt::TripDescriptor {
                    trip_id: Some("A1".to_string()),
                    ..Default::default()
                },
                ..Default::default()
            }),
            ..entity("t1")
        };

        assert_eq!(normalize_entity(&raw), None);
    }

    #[test]
    fn test_stop_time_without_events_is_kept() {
        let raw = FeedEntity {
            trip_update: Some(gtfs_rt::TripUpdate {
                trip: raw_trip("A1", "A"),
                stop_time_update: vec![
                    trip_update::StopTimeUpdate {
                        stop_id: Some("101N".to_string()),
                        schedule_relationship: Some(1),
                        ..Default::default()
                    },
                    trip_update::StopTimeUpdate {
                        stop_id: Some("102N".to_string()),
                        arrival: Some(trip_update::StopTimeEvent {
                            time: Some(1700000100),
                            delay: Some(30),
                            ..Default::default()
                        }),
                        ..Default::default()
                    },
                ],
                ..Default::default()
            }),
            ..entity("t1")
        };

        let normalized = normalize_entity(&raw).unwrap();
        let update = normalized.trip_update.unwrap();

        assert_eq!(update.trip.trip_id, "A1");
        assert_eq!(update.trip.start_date.as_deref(), Some("20231114"));
        assert_eq!(update.stop_time_updates.len(), 2);

        let skipped = &update.stop_time_updates[0];
        assert_eq!(skipped.schedule_relationship, StopTimeScheduleRelationship::Skipped);
        assert!(skipped.arrival.is_none() && skipped.departure.is_none());

        let predicted = &update.stop_time_updates[1];
        let arrival = predicted.arrival.unwrap();
        assert_eq!(arrival.time.unwrap().timestamp(), 1700000100);
        assert_eq!(arrival.delay, Some(30));
        assert_eq!(predicted.schedule_relationship, StopTimeScheduleRelationship::Scheduled);
    }

    #[test]
    fn test_out_of_range_stop_time_drops_only_the_time() {
        let raw = FeedEntity {
            trip_update: Some(gtfs_rt::TripUpdate {
                trip: raw_trip("A1", "A"),
                stop_time_update: vec![trip_update::StopTimeUpdate {
                    stop_id: Some("101N".to_string()),
                    departure: Some(trip_update::StopTimeEvent {
                        time: Some(i64::MAX),
                        delay: Some(-15),
                        ..Default::default()
                    }),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            ..entity("t1")
        };

        let update = normalize_entity(&raw).unwrap().trip_update.unwrap();
        let departure = update.stop_time_updates[0].departure.unwrap();

        assert_eq!(departure.time, None);
        assert_eq!(departure.delay, Some(-15));
    }

    #[test]
    fn test_vehicle_zero_bearing_is_not_absent() {
        let raw = FeedEntity {
            vehicle: Some(gtfs_rt::VehiclePosition {
                trip: Some(raw_trip("A1", "A")),
                position: Some(gtfs_rt::Position {
                    latitude: 40.75,
                    longitude: -73.99,
                    bearing: Some(0.0),
                    speed: None,
                    odometer: None,
                }),
                current_status: Some(1),
                ..Default::default()
            }),
            ..entity("v1")
        };

        let vehicle = normalize_entity(&raw).unwrap().vehicle.unwrap();
        let position = vehicle.position.unwrap();

        assert_eq!(position.bearing, Some(0.0));
        assert_eq!(position.speed, None);
        assert_eq!(vehicle.current_status, VehicleStopStatus::StoppedAt);
        assert_eq!(vehicle.timestamp, None);
    }

    #[test]
    fn test_vehicle_trip_without_route_is_kept() {
        let raw = FeedEntity {
            vehicle: Some(gtfs_rt::VehiclePosition {
                trip: Some(gtfs_rt::TripDescriptor {
                    trip_id: Some("A1".to_string()),
                    route_id: Some(String::new()),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..entity("v1")
        };

        let trip = normalize_entity(&raw).unwrap().vehicle.unwrap().trip.unwrap();

        assert_eq!(trip.trip_id, "A1");
        assert_eq!(trip.route_id, None);
        assert_eq!(trip.descriptor(), None);
    }

    #[test]
    fn test_vehicle_trip_without_trip_id_is_dropped() {
        let raw = FeedEntity {
            vehicle: Some(gtfs_rt::VehiclePosition {
                trip: Some(gtfs_rt::TripDescriptor {
                    route_id: Some("A".to_string()),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..entity("v1")
        };

        assert_eq!(normalize_entity(&raw).unwrap().vehicle.unwrap().trip, None);
    }

    #[test]
    fn test_invalid_timestamp_keeps_rejected_value() {
        assert_eq!(
            unix_u64(u64::MAX),
            Err(EntityError::InvalidTimestamp(i128::from(u64::MAX)))
        );
        assert_eq!(unix_i64(i64::MAX), Err(EntityError::InvalidTimestamp(i128::from(i64::MAX))));
        assert_eq!(unix_u64(1_700_000_000).unwrap().timestamp(), 1_700_000_000);
    }

    #[test]
    fn test_vehicle_defaults_and_unknown_status() {
        let raw = FeedEntity {
            vehicle: Some(gtfs_rt::VehiclePosition::default()),
            ..entity("v1")
        };
        let vehicle = normalize_entity(&raw).unwrap().vehicle.unwrap();
        assert_eq!(vehicle.trip, None);
        assert_eq!(vehicle.current_status, VehicleStopStatus::InTransitTo);

        let raw = FeedEntity {
            vehicle: Some(gtfs_rt::VehiclePosition {
                current_status: Some(42),
                ..Default::default()
            }),
            ..entity("v2")
        };
        let vehicle = normalize_entity(&raw).unwrap().vehicle.unwrap();
        assert_eq!(vehicle.current_status, VehicleStopStatus::Unrecognized(42));
    }

    #[test]
    fn test_alert_first_translation_wins() {
        let raw = FeedEntity {
            alert: Some(gtfs_rt::Alert {
                effect: Some(3),
                header_text: Some(TranslatedString {
                    translation: vec![
                        Translation {
                            text: "Delays on the A".to_string(),
                            language: Some("en".to_string()),
                        },
                        Translation {
                            text: "Retrasos en el A".to_string(),
                            language: Some("es".to_string()),
                        },
                    ],
                }),
                informed_entity: vec![
                    EntitySelector {
                        trip: Some(raw_trip("A1", "A")),
                        ..Default::default()
                    },
                    EntitySelector {
                        stop_id: Some("A27".to_string()),
                        ..Default::default()
                    },
                    EntitySelector::default(),
                ],
                ..Default::default()
            }),
            ..entity("alert:1")
        };

        let alert = normalize_entity(&raw).unwrap().alert.unwrap();

        assert_eq!(alert.effect, AlertEffect::SignificantDelays);
        assert_eq!(alert.header_text.as_deref(), Some("Delays on the A"));
        assert_eq!(alert.description_text, None);
        assert_eq!(alert.informed_entities.len(), 3);
        assert_eq!(
            alert.informed_entities[0].trip,
            Some(TripRef {
                trip_id: "A1".to_string(),
                route_id: "A".to_string()
            })
        );
        assert_eq!(alert.informed_entities[1].stop_id.as_deref(), Some("A27"));
        assert!(alert.informed_entities[2].is_empty());
    }

    #[test]
    fn test_alert_missing_effect_uses_schema_default() {
        let raw = FeedEntity {
            alert: Some(gtfs_rt::Alert::default()),
            ..entity("alert:2")
        };
        let alert = normalize_entity(&raw).unwrap().alert.unwrap();
        assert_eq!(alert.effect, AlertEffect::UnknownEffect);
    }

    #[test]
    fn test_bad_entity_does_not_abort_snapshot() {
        let feed = FeedMessage {
            header: FeedHeader {
                gtfs_realtime_version: "2.0".to_string(),
                timestamp: Some(1700000000),
                incrementality: None,
                feed_version: None,
            },
            entity: vec![
                FeedEntity {
                    trip_update: Some(gtfs_rt::TripUpdate::default()),
                    ..entity("broken")
                },
                FeedEntity {
                    trip_update: Some(gtfs_rt::TripUpdate {
                        trip: raw_trip("A1", "A"),
                        ..Default::default()
                    }),
                    ..entity("ok")
                },
            ],
        };

        let snapshot = normalize_feed(&feed);

        assert_eq!(snapshot.entities.len(), 1);
        assert_eq!(snapshot.entities[0].id, "ok");
        assert_eq!(snapshot.summary.processed_count, 2);
        assert_eq!(snapshot.summary.trips_count, 2);
        assert_eq!(snapshot.header.timestamp.unwrap().timestamp(), 1700000000);
    }

    #[test]
    fn test_views_project_by_kind() {
        let feed = FeedMessage {
            header: FeedHeader {
                gtfs_realtime_version: "2.0".to_string(),
                ..Default::default()
            },
            entity: vec![
                FeedEntity {
                    vehicle: Some(gtfs_rt::VehiclePosition::default()),
                    ..entity("v1")
                },
                FeedEntity {
                    alert: Some(gtfs_rt::Alert::default()),
                    ..entity("a1")
                },
            ],
        };
        let snapshot = normalize_feed(&feed);

        let alerts = serde_json::to_value(snapshot.view(FeedKind::Alerts)).unwrap();
        assert_eq!(alerts.as_array().unwrap().len(), 1);
        assert_eq!(alerts[0]["id"], "a1");
        assert_eq!(alerts[0]["effect"], "unknown_effect");

        let all = serde_json::to_value(snapshot.view(FeedKind::All)).unwrap();
        assert_eq!(all["header"]["version"], "2.0");
        assert_eq!(all["vehicle_positions"].as_array().unwrap().len(), 1);
        assert!(all["trip_updates"].as_array().unwrap().is_empty());
    }
}
