//! Protobuf parser for GTFS Realtime feeds.

use prost::Message;

use crate::error::DecodeError;
use crate::gtfs_rt::FeedMessage;

/// Decodes a protobuf-encoded GTFS-RT [`FeedMessage`] from raw bytes.
///
/// Each call decodes into a fresh message; nothing is shared between calls,
/// so concurrent fetches can parse in parallel.
///
/// # Errors
///
/// Returns [`DecodeError`] if the bytes are truncated, corrupted, or not a
/// `FeedMessage`.
pub fn parse_feed(bytes: &[u8]) -> Result<FeedMessage, DecodeError> {
    Ok(FeedMessage::decode(bytes)?)
}
