#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use prost::Message;
use subway_feed::gtfs_rt::{
    self, FeedEntity, FeedHeader, FeedMessage, TranslatedString, translated_string::Translation,
    trip_update,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

pub const FEED_TIMESTAMP: u64 = 1_700_000_000;

pub fn feed(entities: Vec<FeedEntity>) -> FeedMessage {
    FeedMessage {
        header: FeedHeader {
            gtfs_realtime_version: "2.0".to_string(),
            timestamp: Some(FEED_TIMESTAMP),
            ..Default::default()
        },
        entity: entities,
    }
}

pub fn encode(feed: &FeedMessage) -> Vec<u8> {
    feed.encode_to_vec()
}

pub fn trip(trip_id: &str, route_id: &str) -> gtfs_rt::TripDescriptor {
    gtfs_rt::TripDescriptor {
        trip_id: Some(trip_id.to_string()),
        route_id: Some(route_id.to_string()),
        start_date: Some("20231114".to_string()),
        ..Default::default()
    }
}

pub fn arrival(stop_id: &str, time: i64) -> trip_update::StopTimeUpdate {
    trip_update::StopTimeUpdate {
        stop_id: Some(stop_id.to_string()),
        arrival: Some(trip_update::StopTimeEvent {
            time: Some(time),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn trip_update_entity(
    id: &str,
    trip_id: &str,
    route_id: &str,
    stops: Vec<trip_update::StopTimeUpdate>,
) -> FeedEntity {
    FeedEntity {
        id: id.to_string(),
        trip_update: Some(gtfs_rt::TripUpdate {
            trip: trip(trip_id, route_id),
            stop_time_update: stops,
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn vehicle_entity(
    id: &str,
    trip_id: &str,
    route_id: &str,
    latitude: f32,
    longitude: f32,
    timestamp: u64,
) -> FeedEntity {
    FeedEntity {
        id: id.to_string(),
        vehicle: Some(gtfs_rt::VehiclePosition {
            trip: Some(trip(trip_id, route_id)),
            position: Some(gtfs_rt::Position {
                latitude,
                longitude,
                ..Default::default()
            }),
            stop_id: Some("101N".to_string()),
            current_status: Some(1),
            timestamp: Some(timestamp),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Alert with effect `effect` and no informed entities.
pub fn alert_entity(id: &str, effect: i32, header: &str) -> FeedEntity {
    FeedEntity {
        id: id.to_string(),
        alert: Some(gtfs_rt::Alert {
            effect: Some(effect),
            header_text: Some(TranslatedString {
                translation: vec![Translation {
                    text: header.to_string(),
                    language: Some("en".to_string()),
                }],
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Serves fixed payloads over HTTP on a local port.
///
/// Paths without a payload answer 404.
pub struct FeedServer {
    pub base_url: String,
}

impl FeedServer {
    pub async fn start(payloads: HashMap<String, Vec<u8>>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let payloads = Arc::new(payloads);

        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                let payloads = payloads.clone();
                tokio::spawn(async move {
                    let mut request = Vec::new();
                    let mut buf = [0u8; 1024];
                    while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                        match socket.read(&mut buf).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => request.extend_from_slice(&buf[..n]),
                        }
                    }

                    let head = String::from_utf8_lossy(&request);
                    let path = head.split_whitespace().nth(1).unwrap_or("/").to_string();

                    let (status, body) = match payloads.get(&path) {
                        Some(body) => ("200 OK", body.clone()),
                        None => ("404 Not Found", Vec::new()),
                    };
                    let response_head = format!(
                        "HTTP/1.1 {status}\r\nContent-Type: application/x-google-protobuf\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                        body.len()
                    );
                    let _ = socket.write_all(response_head.as_bytes()).await;
                    let _ = socket.write_all(&body).await;
                    let _ = socket.shutdown().await;
                });
            }
        });

        Self {
            base_url: format!("http://{addr}"),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }
}
