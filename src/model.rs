//! Canonical domain types produced by the normalizer.
//!
//! Every enumeration read from the wire is a closed enum with an
//! `Unrecognized` member carrying the raw value, so an out-of-range integer
//! never fails normalization.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How a trip relates to the published schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TripScheduleRelationship {
    #[default]
    Scheduled,
    Added,
    Unscheduled,
    Canceled,
    Unrecognized(i32),
}

impl TripScheduleRelationship {
    pub fn from_wire(value: i32) -> Self {
        match value {
            0 => Self::Scheduled,
            1 => Self::Added,
            2 => Self::Unscheduled,
            3 => Self::Canceled,
            other => Self::Unrecognized(other),
        }
    }

    pub fn to_wire(self) -> i32 {
        match self {
            Self::Scheduled => 0,
            Self::Added => 1,
            Self::Unscheduled => 2,
            Self::Canceled => 3,
            Self::Unrecognized(other) => other,
        }
    }
}

/// How a single stop-time prediction relates to the schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopTimeScheduleRelationship {
    #[default]
    Scheduled,
    Skipped,
    NoData,
    Unrecognized(i32),
}

impl StopTimeScheduleRelationship {
    pub fn from_wire(value: i32) -> Self {
        match value {
            0 => Self::Scheduled,
            1 => Self::Skipped,
            2 => Self::NoData,
            other => Self::Unrecognized(other),
        }
    }

    pub fn to_wire(self) -> i32 {
        match self {
            Self::Scheduled => 0,
            Self::Skipped => 1,
            Self::NoData => 2,
            Self::Unrecognized(other) => other,
        }
    }
}

/// Where a vehicle is relative to its current stop.
///
/// The wire default is `InTransitTo`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VehicleStopStatus {
    IncomingAt,
    StoppedAt,
    #[default]
    InTransitTo,
    Unrecognized(i32),
}

impl VehicleStopStatus {
    pub fn from_wire(value: i32) -> Self {
        match value {
            0 => Self::IncomingAt,
            1 => Self::StoppedAt,
            2 => Self::InTransitTo,
            other => Self::Unrecognized(other),
        }
    }

    pub fn to_wire(self) -> i32 {
        match self {
            Self::IncomingAt => 0,
            Self::StoppedAt => 1,
            Self::InTransitTo => 2,
            Self::Unrecognized(other) => other,
        }
    }
}

/// Effect of a service alert. The wire default is `UnknownEffect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertEffect {
    NoService,
    ReducedService,
    SignificantDelays,
    Detour,
    AdditionalService,
    ModifiedService,
    OtherEffect,
    #[default]
    UnknownEffect,
    StopMoved,
    Unrecognized(i32),
}

impl AlertEffect {
    pub fn from_wire(value: i32) -> Self {
        match value {
            1 => Self::NoService,
            2 => Self::ReducedService,
            3 => Self::SignificantDelays,
            4 => Self::Detour,
            5 => Self::AdditionalService,
            6 => Self::ModifiedService,
            7 => Self::OtherEffect,
            8 => Self::UnknownEffect,
            9 => Self::StopMoved,
            other => Self::Unrecognized(other),
        }
    }

    pub fn to_wire(self) -> i32 {
        match self {
            Self::NoService => 1,
            Self::ReducedService => 2,
            Self::SignificantDelays => 3,
            Self::Detour => 4,
            Self::AdditionalService => 5,
            Self::ModifiedService => 6,
            Self::OtherEffect => 7,
            Self::UnknownEffect => 8,
            Self::StopMoved => 9,
            Self::Unrecognized(other) => other,
        }
    }
}

/// The trip fields shared by trip updates and the persisted trip row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TripDescriptor {
    pub trip_id: String,
    pub route_id: String,
    pub start_time: Option<String>,
    pub start_date: Option<String>,
    pub schedule_relationship: TripScheduleRelationship,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StopTimeEvent {
    pub time: Option<DateTime<Utc>>,
    pub delay: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopTimeUpdate {
    pub stop_id: String,
    pub arrival: Option<StopTimeEvent>,
    pub departure: Option<StopTimeEvent>,
    pub schedule_relationship: StopTimeScheduleRelationship,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TripUpdate {
    pub trip: TripDescriptor,
    pub stop_time_updates: Vec<StopTimeUpdate>,
}

/// A reported location. Bearing and speed are `None` when the feed omits
/// them; `Some(0.0)` is a real reading.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub latitude: f64,
    pub longitude: f64,
    pub bearing: Option<f32>,
    pub speed: Option<f32>,
}

/// The trip a vehicle says it serves.
///
/// `trip_id` alone finds a known trip; creating a new one also needs the
/// route.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehicleTrip {
    pub trip_id: String,
    pub route_id: Option<String>,
    pub start_time: Option<String>,
    pub start_date: Option<String>,
    pub schedule_relationship: TripScheduleRelationship,
}

impl VehicleTrip {
    /// The full descriptor, if the route is known.
    pub fn descriptor(&self) -> Option<TripDescriptor> {
        let route_id = self.route_id.clone()?;
        Some(TripDescriptor {
            trip_id: self.trip_id.clone(),
            route_id,
            start_time: self.start_time.clone(),
            start_date: self.start_date.clone(),
            schedule_relationship: self.schedule_relationship,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehiclePosition {
    /// `None` when the feed did not say which trip the vehicle serves. Such
    /// positions are shown in snapshots but cannot be reconciled.
    pub trip: Option<VehicleTrip>,
    pub position: Option<Position>,
    pub current_stop_sequence: Option<u32>,
    pub stop_id: Option<String>,
    pub current_status: VehicleStopStatus,
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TripRef {
    pub trip_id: String,
    pub route_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct InformedEntity {
    pub trip: Option<TripRef>,
    pub stop_id: Option<String>,
}

impl InformedEntity {
    /// True when the entry names neither a trip nor a stop.
    pub fn is_empty(&self) -> bool {
        self.trip.is_none() && self.stop_id.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub effect: AlertEffect,
    pub header_text: Option<String>,
    pub description_text: Option<String>,
    pub informed_entities: Vec<InformedEntity>,
}

/// One feed entity after normalization. At least one part is present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedEntity {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trip_update: Option<TripUpdate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vehicle: Option<VehiclePosition>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alert: Option<Alert>,
}
