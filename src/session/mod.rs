//! Session Partitioner.
//!
//! Supplies the active session to the coordinator at create time and the
//! "current records" predicate to read paths. Stateless beyond the session
//! value it was built from; it owns no storage.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::models::{Collection, Record, SchoolConfig};
use crate::store::EntityStore;

/// Read accessor for session configuration. The sync layer never writes it.
pub trait SessionSource {
    /// The active session, or `None` when none is configured.
    fn current_session(&self) -> Option<String>;

    fn known_sessions(&self) -> Vec<String>;
}

impl SessionSource for SchoolConfig {
    fn current_session(&self) -> Option<String> {
        let session = self.current_session.trim();
        (!session.is_empty()).then(|| session.to_string())
    }

    fn known_sessions(&self) -> Vec<String> {
        self.sessions.clone()
    }
}

impl SessionSource for EntityStore {
    fn current_session(&self) -> Option<String> {
        self.config().current_session()
    }

    fn known_sessions(&self) -> Vec<String> {
        self.config().known_sessions()
    }
}

/// Active-session filter derived from a [`SessionSource`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionPartitioner {
    active: Option<String>,
}

impl SessionPartitioner {
    pub fn new(active: Option<String>) -> Self {
        Self { active }
    }

    pub fn from_source<S: SessionSource + ?Sized>(source: &S) -> Self {
        Self::new(source.current_session())
    }

    pub fn active_session(&self) -> Option<&str> {
        self.active.as_deref()
    }

    /// Session to stamp on a record created now.
    pub fn stamp(&self) -> Option<String> {
        self.active.clone()
    }

    /// Whether `record` belongs to the current view of `collection`.
    ///
    /// Soft-deleted records never do. Session-less records count only where
    /// the collection allows them. With no active session configured nothing
    /// is filtered by session.
    pub fn is_active(&self, collection: Collection, record: &Record) -> bool {
        if record.is_deleted {
            return false;
        }
        match (&self.active, &record.session) {
            (None, _) => true,
            (Some(active), Some(session)) => active == session,
            (Some(_), None) => collection.allows_sessionless(),
        }
    }

    pub fn active_view(&self, collection: Collection, records: &[Record]) -> Vec<Record> {
        records
            .iter()
            .filter(|r| self.is_active(collection, r))
            .cloned()
            .collect()
    }
}

/// A soft-deleted record as listed in the recycle bin.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecycleBinEntry {
    pub collection: Collection,
    pub record: Record,
    /// Whole days left before the reaper purges it; `None` for legacy
    /// records deleted without a timestamp.
    pub days_remaining: Option<i64>,
}

/// Every soft-deleted record of `collection`, across all sessions.
pub fn recycle_bin(
    collection: Collection,
    records: &[Record],
    now: DateTime<Utc>,
    retention: Duration,
) -> Vec<RecycleBinEntry> {
    records
        .iter()
        .filter(|r| r.is_deleted)
        .map(|r| RecycleBinEntry {
            collection,
            record: r.clone(),
            days_remaining: r.days_until_purge(now, retention),
        })
        .collect()
}
