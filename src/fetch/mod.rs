mod basic;
mod client;

pub use basic::BasicClient;
pub use client::HttpClient;

use bytes::Bytes;
use reqwest::header::{ACCEPT, HeaderValue};
use tracing::debug;

use crate::error::TransportError;

const PROTOBUF_MEDIA_TYPE: &str = "application/x-google-protobuf";

/// GETs `url` and returns the body. Any non-success status is a
/// [`TransportError`].
pub async fn fetch_bytes<C: HttpClient + ?Sized>(
    client: &C,
    url: &str,
) -> Result<Bytes, TransportError> {
    let parsed = reqwest::Url::parse(url).map_err(|e| TransportError::InvalidUrl {
        url: url.to_string(),
        reason: format!("{e}"),
    })?;
    let mut req = reqwest::Request::new(reqwest::Method::GET, parsed);
    req.headers_mut()
        .insert(ACCEPT, HeaderValue::from_static(PROTOBUF_MEDIA_TYPE));

    let resp = client.execute(req).await?;
    let status = resp.status();
    if !status.is_success() {
        return Err(TransportError::Status(status));
    }

    let bytes = resp.bytes().await?;
    debug!(url, bytes = bytes.len(), "Feed bytes received");
    Ok(bytes)
}

/// Loads feed data from a local file path or fetches it over HTTP.
pub async fn load_source<C: HttpClient + ?Sized>(
    client: &C,
    source: &str,
) -> Result<Bytes, TransportError> {
    if source.starts_with("http://") || source.starts_with("https://") {
        fetch_bytes(client, source).await
    } else {
        let data = tokio::fs::read(source)
            .await
            .map_err(|e| TransportError::File {
                path: source.to_string(),
                source: e,
            })?;
        Ok(Bytes::from(data))
    }
}
