//! Tombstone Reaper.
//!
//! Permanently removes soft-deleted records once their retention period has
//! elapsed. Each collection is purged remote first; the local copies are
//! dropped only after the remote delete succeeded. A collection whose delete
//! fails keeps its tombstones for the next run. Expired records are claimed
//! in the store for the duration of the delete, so they cannot be restored
//! halfway through.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;

use crate::gateway::RemoteGateway;
use crate::models::{Collection, Severity};
use crate::notify::SharedSink;
use crate::store::StoreHandle;

pub const DEFAULT_RETENTION_DAYS: i64 = 30;

/// Outcome of one reaper run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReapReport {
    /// Records removed from both the remote and the local store.
    pub purged: usize,
    /// Collections whose remote delete failed.
    pub failed: Vec<Collection>,
}

#[derive(Clone)]
pub struct TombstoneReaper {
    store: StoreHandle,
    gateway: Arc<dyn RemoteGateway>,
    sink: SharedSink,
    retention: Duration,
}

impl TombstoneReaper {
    pub fn new(store: StoreHandle, gateway: Arc<dyn RemoteGateway>, sink: SharedSink) -> Self {
        Self {
            store,
            gateway,
            sink,
            retention: Duration::days(DEFAULT_RETENTION_DAYS),
        }
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    pub async fn run(&self) -> ReapReport {
        self.run_at(Utc::now()).await
    }

    /// Purge everything whose retention elapsed as of `now`.
    ///
    /// Emits at most one notification, and only when something was removed.
    /// Failures are logged, never notified.
    pub async fn run_at(&self, now: DateTime<Utc>) -> ReapReport {
        let mut report = ReapReport::default();

        let retention = self.retention;
        for collection in Collection::ALL {
            let claimed = self.store.claim_purge(collection, |store| {
                Ok(store
                    .get(collection)
                    .iter()
                    .filter(|r| r.is_purgeable(now, retention) && !store.is_purging(collection, &r.id))
                    .map(|r| r.id.clone())
                    .collect())
            });
            let claim = match claimed {
                Ok(claim) if claim.is_empty() => continue,
                Ok(claim) => claim,
                Err(e) => {
                    tracing::info!(collection = %collection, reason = %e, "reaper: collection skipped");
                    continue;
                }
            };

            if let Err(err) = self.gateway.delete_by_ids(collection, claim.ids()).await {
                tracing::warn!(
                    collection = %collection,
                    count = claim.ids().len(),
                    error = %err,
                    "reaper: remote delete failed, tombstones kept"
                );
                report.failed.push(collection);
                continue;
            }

            match claim.finish(|r| r.is_purgeable(now, retention)) {
                Ok(count) => {
                    tracing::debug!(collection = %collection, count, "reaper: purged expired tombstones");
                    report.purged += count;
                }
                Err(e) => {
                    tracing::warn!(collection = %collection, error = %e, "reaper: local removal failed");
                }
            }
        }

        if report.purged > 0 {
            tracing::info!(purged = report.purged, "reaper run complete");
            self.sink.notify(
                &format!("Cleaned up {} items from the recycle bin", report.purged),
                Severity::Info,
            );
        }
        report
    }

    /// Run the reaper every `interval` in the background.
    ///
    /// The first tick is skipped; the startup pass belongs to the bootstrap.
    pub fn spawn_periodic(self, interval: StdDuration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let report = self.run().await;
                tracing::debug!(purged = report.purged, failed = report.failed.len(), "periodic reap finished");
            }
        })
    }
}
