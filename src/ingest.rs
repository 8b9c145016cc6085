//! The fetch → decode → normalize → reconcile pipeline, per line group.
//!
//! Runs for the same line group are serialized; different line groups run
//! in parallel. Reconciliation happens in its own task, so a caller that
//! stops waiting does not interrupt a transaction half way.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::OwnedMutexGuard;
use tracing::{Instrument, debug, error, info, warn};

use crate::config::LineGroups;
use crate::error::{IngestError, PersistenceError};
use crate::fetch::{HttpClient, fetch_bytes};
use crate::normalize::Snapshot;
use crate::reconcile::Reconciler;
use crate::store::{FeedUpdateRecord, Store};

/// Health of one line group's feed, derived from its most recent fetch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceStatus {
    pub line_group: String,
    pub operational: bool,
    pub message: String,
    /// Header timestamp of the last feed that decoded.
    pub last_update: Option<DateTime<Utc>>,
    pub checked_at: DateTime<Utc>,
}

pub struct Ingestor<C, S> {
    client: C,
    store: Arc<S>,
    line_groups: LineGroups,
    reconciler: Reconciler,
    reconcile_timeout: Duration,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    statuses: RwLock<HashMap<String, ServiceStatus>>,
}

impl<C, S> Ingestor<C, S>
where
    C: HttpClient + 'static,
    S: Store + 'static,
{
    pub fn new(client: C, store: Arc<S>, line_groups: LineGroups, reconciler: Reconciler) -> Self {
        Self {
            client,
            store,
            line_groups,
            reconciler,
            reconcile_timeout: Duration::from_secs(30),
            locks: Mutex::new(HashMap::new()),
            statuses: RwLock::new(HashMap::new()),
        }
    }

    /// Bounds every reconciliation transaction by `timeout`.
    pub fn with_reconcile_timeout(mut self, timeout: Duration) -> Self {
        self.reconcile_timeout = timeout;
        self
    }

    pub fn line_groups(&self) -> &LineGroups {
        &self.line_groups
    }

    /// Fetches, decodes and normalizes the current feed of `line_group`
    /// without touching storage.
    #[tracing::instrument(skip(self))]
    pub async fn snapshot(&self, line_group: &str) -> Result<Snapshot, IngestError> {
        let url = self.url(line_group)?;
        self.fetch_snapshot(line_group, url).await
    }

    /// Runs the full pipeline for `line_group` and returns the recorded
    /// feed update.
    #[tracing::instrument(skip(self))]
    pub async fn ingest(&self, line_group: &str) -> Result<FeedUpdateRecord, IngestError> {
        let url = self.url(line_group)?;
        let guard = self.group_lock(line_group).lock_owned().await;

        let snapshot = self.fetch_snapshot(line_group, url).await?;
        self.spawn_reconcile(guard, line_group, snapshot).await
    }

    /// Ingests every configured line group, at most `concurrency` at a time.
    pub async fn ingest_all(
        self: &Arc<Self>,
        concurrency: usize,
    ) -> Vec<(String, Result<FeedUpdateRecord, IngestError>)> {
        let semaphore = Arc::new(tokio::sync::Semaphore::new(concurrency.max(1)));
        let mut tasks = vec![];

        for line_group in self.line_groups.names() {
            let sem = semaphore.clone();
            let this = self.clone();
            let line_group = line_group.to_string();

            let span = tracing::info_span!("process_line_group", line_group = %line_group);

            let task = tokio::spawn(
                async move {
                    let _permit = sem.acquire().await;
                    let result = this.ingest(&line_group).await;
                    match &result {
                        Ok(record) => info!(feed_update = record.id, "Line group ingested"),
                        Err(e) => error!(error = %e, retryable = e.is_retryable(), "Line group ingestion failed"),
                    }
                    (line_group, result)
                }
                .instrument(span),
            );

            tasks.push(task);
        }

        let mut results = Vec::with_capacity(tasks.len());
        for task in tasks {
            match task.await {
                Ok(outcome) => results.push(outcome),
                Err(e) => error!(error = %e, "Ingestion task panicked"),
            }
        }
        results
    }

    /// Probes the feed of `line_group` and reports whether it is usable.
    pub async fn check_status(&self, line_group: &str) -> Result<ServiceStatus, IngestError> {
        let url = self.url(line_group)?;
        // The outcome is recorded either way; only the status is returned.
        let _ = self.fetch_snapshot(line_group, url).await;
        self.last_status(line_group)
            .ok_or_else(|| IngestError::UnknownLineGroup(line_group.to_string()))
    }

    /// The status recorded by the most recent fetch, if any.
    pub fn last_status(&self, line_group: &str) -> Option<ServiceStatus> {
        self.statuses
            .read()
            .ok()
            .and_then(|statuses| statuses.get(line_group).cloned())
    }

    fn url(&self, line_group: &str) -> Result<String, IngestError> {
        self.line_groups
            .url(line_group)
            .map(str::to_string)
            .ok_or_else(|| IngestError::UnknownLineGroup(line_group.to_string()))
    }

    fn group_lock(&self, line_group: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.entry(line_group.to_string()).or_default().clone()
    }

    async fn fetch_snapshot(&self, line_group: &str, url: String) -> Result<Snapshot, IngestError> {
        let fetch_start = std::time::Instant::now();
        let result = match fetch_bytes(&self.client, &url).await {
            Ok(bytes) => {
                let elapsed = fetch_start.elapsed();
                if elapsed.as_secs() > 15 {
                    warn!(elapsed_secs = elapsed.as_secs(), "Feed fetch was slow");
                }
                Snapshot::decode(&bytes).map_err(IngestError::from)
            }
            Err(e) => Err(IngestError::from(e)),
        };

        match &result {
            Ok(snapshot) => {
                debug!(
                    entities = snapshot.entities.len(),
                    version = %snapshot.header.version,
                    "Feed decoded"
                );
                self.record_status(line_group, None, snapshot.header.timestamp);
            }
            Err(e) => {
                error!(error = %e, "Feed unavailable");
                self.record_status(line_group, Some(e), None);
            }
        }

        result
    }

    fn record_status(
        &self,
        line_group: &str,
        error: Option<&IngestError>,
        last_update: Option<DateTime<Utc>>,
    ) {
        let mut statuses = self
            .statuses
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let previous = statuses.get(line_group).and_then(|s| s.last_update);

        let status = match error {
            None => ServiceStatus {
                line_group: line_group.to_string(),
                operational: true,
                message: "Subway feed service is running normally".to_string(),
                last_update: last_update.or(previous),
                checked_at: Utc::now(),
            },
            Some(e) => ServiceStatus {
                line_group: line_group.to_string(),
                operational: false,
                message: e.public_message(),
                last_update: previous,
                checked_at: Utc::now(),
            },
        };
        statuses.insert(line_group.to_string(), status);
    }

    async fn spawn_reconcile(
        &self,
        guard: OwnedMutexGuard<()>,
        line_group: &str,
        snapshot: Snapshot,
    ) -> Result<FeedUpdateRecord, IngestError> {
        let store = self.store.clone();
        let reconciler = self.reconciler;
        let timeout = self.reconcile_timeout;
        let line_group = line_group.to_string();

        let handle = tokio::spawn(
            async move {
                // Held until the transaction has committed or rolled back.
                let _guard = guard;
                let run = reconciler.reconcile(store.as_ref(), &snapshot, Some(&line_group), Utc::now());
                match tokio::time::timeout(timeout, run).await {
                    Ok(result) => result,
                    Err(_) => Err(PersistenceError::Timeout(timeout)),
                }
            }
            .in_current_span(),
        );

        let record = handle
            .await
            .map_err(|e| PersistenceError::Worker(e.to_string()))??;
        Ok(record)
    }
}
