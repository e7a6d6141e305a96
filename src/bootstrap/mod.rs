//! Bootstrap Loader.
//!
//! Fetches every collection and the configuration record concurrently and
//! loads them into the Entity Store. A batch that failed transiently is
//! retried as a whole under a [`RetryPolicy`]. Policy denials and schema
//! mismatches need an operator and are not retried. Once the layer gives up
//! it runs offline on the defaults the store was built with.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::errors::{GatewayError, RemoteErrorKind};
use crate::gateway::RemoteGateway;
use crate::models::{Collection, Datastore, Record, Severity};
use crate::notify::SharedSink;
use crate::reaper::TombstoneReaper;
use crate::store::StoreHandle;

/// Bounded, fixed-delay retry for the bootstrap batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts after the first one.
    pub max_retries: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub const fn new(max_retries: u32, delay: Duration) -> Self {
        Self { max_retries, delay }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(2, Duration::from_millis(2000))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    Online,
    Offline,
}

/// Persistent banner for failures only an operator can fix.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Diagnostic {
    pub kind: RemoteErrorKind,
    pub title: String,
    pub message: String,
    /// Raw remote error text.
    pub detail: String,
}

impl Diagnostic {
    /// Banner for `err`, or `None` when a retry might fix it.
    pub fn for_error(err: &GatewayError) -> Option<Self> {
        let kind = err.kind();
        let (title, message) = match kind {
            RemoteErrorKind::PolicyDenied => (
                "Access denied by database security policy",
                "The remote store refused to return school data. An administrator \
                 must grant this application read and write access.",
            ),
            RemoteErrorKind::SchemaMismatch => (
                "Database schema mismatch",
                "The remote store is missing a table or column this application \
                 needs. The database is misconfigured and must be migrated.",
            ),
            RemoteErrorKind::Transient => return None,
        };
        Some(Self {
            kind,
            title: title.to_string(),
            message: message.to_string(),
            detail: err.message.clone(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub mode: SyncMode,
    pub banner: Option<Diagnostic>,
    /// Batch attempts made by the last bootstrap.
    pub attempts: u32,
    pub loaded_at: Option<DateTime<Utc>>,
}

impl Default for SyncStatus {
    fn default() -> Self {
        Self {
            mode: SyncMode::Offline,
            banner: None,
            attempts: 0,
            loaded_at: None,
        }
    }
}

/// Shared, readable sync status.
#[derive(Debug, Clone, Default)]
pub struct StatusHandle {
    inner: Arc<RwLock<SyncStatus>>,
}

impl StatusHandle {
    pub fn get(&self) -> SyncStatus {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn set(&self, status: SyncStatus) {
        *self.inner.write().unwrap_or_else(|e| e.into_inner()) = status;
    }
}

pub struct BootstrapLoader {
    store: StoreHandle,
    gateway: Arc<dyn RemoteGateway>,
    sink: SharedSink,
    reaper: TombstoneReaper,
    policy: RetryPolicy,
    status: StatusHandle,
}

impl BootstrapLoader {
    pub fn new(
        store: StoreHandle,
        gateway: Arc<dyn RemoteGateway>,
        sink: SharedSink,
        reaper: TombstoneReaper,
    ) -> Self {
        Self {
            store,
            gateway,
            sink,
            reaper,
            policy: RetryPolicy::default(),
            status: StatusHandle::default(),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_status(mut self, status: StatusHandle) -> Self {
        self.status = status;
        self
    }

    pub fn status(&self) -> &StatusHandle {
        &self.status
    }

    /// Load the working copy, retrying the whole batch on failure.
    ///
    /// Never fails: exhaustion leaves the store on its defaults, publishes
    /// an offline status and emits one info notice.
    pub async fn run(&self) -> SyncStatus {
        let mut attempts = 0;
        let last_error = loop {
            attempts += 1;
            match self.fetch_batch().await {
                Ok(datastore) => {
                    let loaded = self.store.write().load(datastore);
                    match loaded {
                        Ok(()) => break None,
                        Err(e) => {
                            tracing::error!(error = %e, "bootstrap: remote data rejected by the entity store");
                            break Some(GatewayError::new(e.to_string()));
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!(
                        attempt = attempts,
                        max_attempts = self.policy.max_attempts(),
                        kind = ?err.kind(),
                        error = %err,
                        "bootstrap fetch failed"
                    );
                    if err.kind() != RemoteErrorKind::Transient
                        || attempts >= self.policy.max_attempts()
                    {
                        break Some(err);
                    }
                    tokio::time::sleep(self.policy.delay).await;
                }
            }
        };

        match last_error {
            None => {
                tracing::info!(attempts, revision = self.store.read().revision(), "bootstrap complete");
                let status = SyncStatus {
                    mode: SyncMode::Online,
                    banner: None,
                    attempts,
                    loaded_at: Some(Utc::now()),
                };
                self.status.set(status.clone());
                self.reaper.run().await;
                status
            }
            Some(err) => {
                let status = SyncStatus {
                    mode: SyncMode::Offline,
                    banner: Diagnostic::for_error(&err),
                    attempts,
                    loaded_at: None,
                };
                tracing::warn!(attempts, banner = status.banner.is_some(), "bootstrap gave up; running offline");
                self.sink.notify(
                    "Could not reach the school database. Working offline; changes will not be saved until the connection is restored.",
                    Severity::Info,
                );
                self.status.set(status.clone());
                status
            }
        }
    }

    /// One concurrent fetch of every collection plus the configuration.
    async fn fetch_batch(&self) -> Result<Datastore, GatewayError> {
        let (students, employees, fees, expenses, config) = tokio::try_join!(
            self.fetch(Collection::Students),
            self.fetch(Collection::Employees),
            self.fetch(Collection::Fees),
            self.fetch(Collection::Expenses),
            self.gateway.fetch_config(),
        )?;

        let mut datastore = self.store.read().snapshot();
        datastore.students = students;
        datastore.employees = employees;
        datastore.fees = fees;
        datastore.expenses = expenses;
        if let Some(config) = config {
            datastore.config = config;
        } else {
            tracing::info!(
                session = %datastore.config.current_session,
                "no configuration record found remotely; keeping defaults"
            );
        }
        Ok(datastore)
    }

    async fn fetch(&self, collection: Collection) -> Result<Vec<Record>, GatewayError> {
        let records = self.gateway.fetch_all(collection).await?;
        tracing::debug!(collection = %collection, count = records.len(), "fetched");
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{GatewayOp, MemoryGateway};
    use crate::models::SchoolConfig;
    use crate::notify::NotificationLog;
    use crate::store::EntityStore;
    use chrono::Duration as ChronoDuration;
    use serde_json::Map;

    const FAST: RetryPolicy = RetryPolicy::new(2, Duration::from_millis(5));

    struct Fixture {
        loader: BootstrapLoader,
        store: StoreHandle,
        gateway: MemoryGateway,
        log: NotificationLog,
    }

    fn fixture() -> Fixture {
        let store = StoreHandle::new(EntityStore::new(SchoolConfig::with_session("2024-2025")));
        let gateway = MemoryGateway::new();
        let log = NotificationLog::default();
        let shared: Arc<dyn RemoteGateway> = Arc::new(gateway.clone());
        let reaper = TombstoneReaper::new(store.clone(), shared.clone(), Arc::new(log.clone()));
        let loader = BootstrapLoader::new(store.clone(), shared, Arc::new(log.clone()), reaper)
            .with_policy(FAST);
        Fixture {
            loader,
            store,
            gateway,
            log,
        }
    }

    fn record(id: &str) -> Record {
        Record::new(id, Some("2024-2025".into()), Map::new())
    }

    #[tokio::test]
    async fn test_loads_all_collections_and_config() {
        let f = fixture();
        f.gateway.seed(Collection::Students, vec![record("ST01"), record("ST02")]);
        f.gateway.seed(Collection::Expenses, vec![record("EXP1")]);
        f.gateway.seed_config(SchoolConfig::with_session("2025-2026"));

        let status = f.loader.run().await;

        assert_eq!(status.mode, SyncMode::Online);
        assert_eq!(status.attempts, 1);
        assert!(status.banner.is_none());
        let store = f.store.read();
        assert_eq!(store.ids(Collection::Students), vec!["ST01", "ST02"]);
        assert_eq!(store.get(Collection::Expenses).len(), 1);
        assert_eq!(store.config().current_session, "2025-2026");
        assert_eq!(f.loader.status().get(), status);
    }

    #[tokio::test]
    async fn test_missing_config_keeps_default() {
        let f = fixture();
        f.loader.run().await;
        assert_eq!(f.store.read().config().current_session, "2024-2025");
    }

    #[tokio::test]
    async fn test_transient_failure_recovers_on_retry() {
        let f = fixture();
        f.gateway.seed(Collection::Fees, vec![record("FEE1")]);
        f.gateway.fail_times(GatewayOp::FetchAll, 2, "Failed to fetch");

        let status = f.loader.run().await;

        assert_eq!(status.mode, SyncMode::Online);
        assert!(status.attempts >= 2);
        assert_eq!(f.store.read().get(Collection::Fees).len(), 1);
        assert!(f.log.is_empty());
    }

    #[tokio::test]
    async fn test_exhaustion_goes_offline_with_notice() {
        let f = fixture();
        f.gateway.seed(Collection::Students, vec![record("ST01")]);
        f.gateway
            .fail_always(GatewayOp::FetchAll, Collection::Fees, "Failed to fetch");

        let status = f.loader.run().await;

        assert_eq!(status.mode, SyncMode::Offline);
        assert_eq!(status.attempts, 3);
        assert!(status.banner.is_none());
        assert!(f.store.read().get(Collection::Students).is_empty());
        assert_eq!(f.store.read().config().current_session, "2024-2025");

        let entries = f.log.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].severity, Severity::Info);
    }

    #[tokio::test]
    async fn test_policy_denial_raises_banner() {
        let f = fixture();
        f.gateway.fail_always(
            GatewayOp::FetchAll,
            Collection::Students,
            "permission denied for table students",
        );

        let status = f.loader.run().await;

        assert_eq!(status.mode, SyncMode::Offline);
        assert_eq!(status.attempts, 1);
        let banner = status.banner.unwrap();
        assert_eq!(banner.kind, RemoteErrorKind::PolicyDenied);
        assert!(banner.detail.contains("permission denied"));

        let student_fetches = f
            .gateway
            .calls()
            .into_iter()
            .filter(|call| *call == (GatewayOp::FetchAll, Some(Collection::Students)))
            .count();
        assert_eq!(student_fetches, 1);
    }

    #[tokio::test]
    async fn test_schema_mismatch_raises_banner() {
        let f = fixture();
        f.gateway.fail_always(
            GatewayOp::FetchAll,
            Collection::Employees,
            "no such column: is_deleted",
        );

        let status = f.loader.run().await;

        assert_eq!(status.attempts, 1);
        assert_eq!(
            status.banner.map(|b| b.kind),
            Some(RemoteErrorKind::SchemaMismatch)
        );
    }

    #[tokio::test]
    async fn test_reaper_runs_after_successful_load() {
        let f = fixture();
        let mut old = record("EXP1");
        old.is_deleted = true;
        old.deleted_at = Some(Utc::now() - ChronoDuration::days(40));
        f.gateway.seed(Collection::Expenses, vec![old, record("EXP2")]);

        f.loader.run().await;

        assert_eq!(f.store.read().ids(Collection::Expenses), vec!["EXP2"]);
        assert_eq!(f.gateway.records(Collection::Expenses).len(), 1);
        assert_eq!(f.gateway.call_count(GatewayOp::DeleteByIds), 1);
        let entries = f.log.entries();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].message.contains("Cleaned up 1 items"));
    }

    #[tokio::test]
    async fn test_duplicate_remote_ids_leave_store_untouched() {
        let f = fixture();
        f.gateway
            .seed(Collection::Students, vec![record("ST01"), record("ST01")]);

        let status = f.loader.run().await;

        assert_eq!(status.mode, SyncMode::Offline);
        assert!(f.store.read().get(Collection::Students).is_empty());
    }
}
