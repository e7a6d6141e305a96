//! Record model shared by every lifecycle-managed collection.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Keys owned by the sync layer. Callers may not set them through field updates.
pub const RESERVED_FIELDS: [&str; 4] = ["id", "session", "isDeleted", "deletedAt"];

/// The four record collections that follow the soft-delete lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Collection {
    Students,
    Employees,
    Fees,
    Expenses,
}

impl Collection {
    pub const ALL: [Collection; 4] = [
        Collection::Students,
        Collection::Employees,
        Collection::Fees,
        Collection::Expenses,
    ];

    /// Remote table name. Also the key used in backup documents.
    pub fn table_name(&self) -> &'static str {
        match self {
            Collection::Students => "students",
            Collection::Employees => "employees",
            Collection::Fees => "fees",
            Collection::Expenses => "expenses",
        }
    }

    /// Whether a record with no session counts as active in every session.
    ///
    /// Roster records were kept before sessions existed, so students and
    /// employees without a session stay visible. Ledger collections always
    /// require a session match.
    pub fn allows_sessionless(&self) -> bool {
        matches!(self, Collection::Students | Collection::Employees)
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table_name())
    }
}

impl FromStr for Collection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "students" => Ok(Collection::Students),
            "employees" => Ok(Collection::Employees),
            "fees" => Ok(Collection::Fees),
            "expenses" => Ok(Collection::Expenses),
            other => Err(format!("Unknown collection: {}", other)),
        }
    }
}

/// A student, employee, fee or expense record.
///
/// Domain fields (name, amount, date, category, ...) are opaque to the sync
/// layer and travel in `fields`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,
    #[serde(default)]
    pub is_deleted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Record {
    /// Create a live record.
    pub fn new(id: impl Into<String>, session: Option<String>, fields: Map<String, Value>) -> Self {
        Self {
            id: id.into(),
            session,
            is_deleted: false,
            deleted_at: None,
            fields,
        }
    }

    /// `deletedAt` is present exactly when `isDeleted` is set.
    pub fn deletion_consistent(&self) -> bool {
        self.is_deleted == self.deleted_at.is_some()
    }

    /// True once the record has sat in the recycle bin for at least `retention`.
    ///
    /// The boundary is inclusive: a record deleted exactly `retention` ago is
    /// eligible. Records flagged deleted without a timestamp are never eligible.
    pub fn is_purgeable(&self, now: DateTime<Utc>, retention: Duration) -> bool {
        match (self.is_deleted, self.deleted_at) {
            (true, Some(deleted_at)) => now - deleted_at >= retention,
            _ => false,
        }
    }

    /// Days left before purge, rounded up and clamped at zero. `None` for
    /// live records.
    pub fn days_until_purge(&self, now: DateTime<Utc>, retention: Duration) -> Option<i64> {
        let deleted_at = self.deleted_at.filter(|_| self.is_deleted)?;
        let remaining = retention - (now - deleted_at);
        if remaining <= Duration::zero() {
            return Some(0);
        }
        let days = remaining.num_days();
        Some(if remaining > Duration::days(days) { days + 1 } else { days })
    }
}

pub fn is_reserved(key: &str) -> bool {
    RESERVED_FIELDS.contains(&key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn deleted_days_ago(days: i64, now: DateTime<Utc>) -> Record {
        let mut record = Record::new("ST01", Some("2024-2025".into()), Map::new());
        record.is_deleted = true;
        record.deleted_at = Some(now - Duration::days(days));
        record
    }

    #[test]
    fn test_purge_boundary_is_inclusive() {
        let now = Utc::now();
        let retention = Duration::days(30);

        assert!(deleted_days_ago(30, now).is_purgeable(now, retention));
        assert!(deleted_days_ago(31, now).is_purgeable(now, retention));
        assert!(!deleted_days_ago(29, now).is_purgeable(now, retention));
    }

    #[test]
    fn test_deleted_without_timestamp_is_never_purgeable() {
        let mut record = Record::new("ST01", None, Map::new());
        record.is_deleted = true;

        assert!(!record.deletion_consistent());
        assert!(!record.is_purgeable(Utc::now(), Duration::days(0)));
    }

    #[test]
    fn test_days_until_purge() {
        let now = Utc::now();
        let retention = Duration::days(30);

        assert_eq!(deleted_days_ago(10, now).days_until_purge(now, retention), Some(20));
        assert_eq!(deleted_days_ago(45, now).days_until_purge(now, retention), Some(0));

        let mut fresh = deleted_days_ago(0, now);
        fresh.deleted_at = Some(now - Duration::hours(1));
        assert_eq!(fresh.days_until_purge(now, retention), Some(30));
        assert_eq!(
            Record::new("ST02", None, Map::new()).days_until_purge(now, retention),
            None
        );
    }

    #[test]
    fn test_flattened_serialization() {
        let value = json!({
            "id": "ST01",
            "session": "2024-2025",
            "isDeleted": false,
            "name": "Asha",
            "class": "5B"
        });

        let record: Record = serde_json::from_value(value).unwrap();
        assert_eq!(record.id, "ST01");
        assert_eq!(record.fields["name"], "Asha");
        assert!(record.deleted_at.is_none());

        let back = serde_json::to_value(&record).unwrap();
        assert_eq!(back["class"], "5B");
        assert!(back.get("deletedAt").is_none());
    }

    #[test]
    fn test_reserved_fields() {
        assert!(is_reserved("deletedAt"));
        assert!(is_reserved("id"));
        assert!(!is_reserved("amount"));
    }

    #[test]
    fn test_collection_parse() {
        assert_eq!("fees".parse::<Collection>().unwrap(), Collection::Fees);
        assert!("config".parse::<Collection>().is_err());
        assert!(Collection::Students.allows_sessionless());
        assert!(!Collection::Expenses.allows_sessionless());
    }
}
