//! Error taxonomy for the ingestion pipeline.
//!
//! Transport and decode failures abort a run, entity errors are recovered
//! inside the normalizer, and persistence errors roll back one snapshot.

use std::time::Duration;

use thiserror::Error;

/// The feed could not be retrieved. Retryable.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid feed url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("feed responded with status {0}")]
    Status(reqwest::StatusCode),
    #[error("failed to read feed file '{path}': {source}")]
    File {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// The payload is not a GTFS-realtime `FeedMessage`.
#[derive(Debug, Error)]
#[error("malformed feed payload: {0}")]
pub struct DecodeError(#[from] pub prost::DecodeError);

/// A single entity or sub-field could not be normalized.
#[derive(Debug, Error, PartialEq)]
pub enum EntityError {
    #[error("trip update in entity '{entity_id}' has no trip_id or route_id")]
    MissingTripReference { entity_id: String },
    #[error("timestamp {0} is out of range")]
    InvalidTimestamp(i128),
}

/// A storage operation failed; the snapshot was rolled back.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("failed to encode column: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("reconciliation timed out after {0:?}")]
    Timeout(Duration),
    #[error("reconciliation task failed: {0}")]
    Worker(String),
    #[error("{0}")]
    Integrity(String),
}

/// Failure of one ingestion run.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("unknown line group '{0}'")]
    UnknownLineGroup(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

impl IngestError {
    /// Whether retrying the same run later may succeed without an upstream fix.
    pub fn is_retryable(&self) -> bool {
        matches!(self, IngestError::Transport(_) | IngestError::Persistence(_))
    }

    /// Message suitable for end users; never carries entity-level detail.
    pub fn public_message(&self) -> String {
        match self {
            IngestError::UnknownLineGroup(group) => format!("Invalid line group: {group}"),
            IngestError::Transport(_) => "Unable to fetch subway feed".to_string(),
            IngestError::Decode(_) => "Subway feed is currently unavailable".to_string(),
            IngestError::Persistence(_) => "Failed to store subway feed".to_string(),
        }
    }
}
