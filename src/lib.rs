pub mod config;
pub mod error;
pub mod fetch;
pub mod ingest;
pub mod model;
pub mod normalize;
pub mod output;
pub mod parser;
pub mod reconcile;
pub mod store;
pub mod summary;

pub mod gtfs_rt {
    include!(concat!(env!("OUT_DIR"), "/transit_realtime.rs"));
}

pub use error::{DecodeError, EntityError, IngestError, PersistenceError, TransportError};
pub use ingest::{Ingestor, ServiceStatus};
pub use normalize::{FeedKind, Snapshot, normalize_entity, normalize_feed};
pub use reconcile::{Reconciler, StopTimePolicy};
pub use summary::SnapshotSummary;
