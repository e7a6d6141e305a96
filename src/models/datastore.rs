//! Full snapshot of the working copy, doubling as the backup document format.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{Collection, Record, SchoolConfig};
use crate::errors::SyncError;

pub const SCHEMA_VERSION: i32 = 1;

/// Section that must be present in every backup besides the four collections.
const CONFIG_SECTION: &str = "config";

fn default_schema_version() -> i32 {
    SCHEMA_VERSION
}

/// The root datastore containing every collection plus configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Datastore {
    #[serde(default = "default_schema_version")]
    pub schema_version: i32,
    #[serde(default = "Utc::now")]
    pub generated_at: DateTime<Utc>,
    #[serde(default)]
    pub revision_id: u64,
    pub students: Vec<Record>,
    pub employees: Vec<Record>,
    pub fees: Vec<Record>,
    pub expenses: Vec<Record>,
    pub config: SchoolConfig,
}

impl Datastore {
    pub fn records(&self, collection: Collection) -> &Vec<Record> {
        match collection {
            Collection::Students => &self.students,
            Collection::Employees => &self.employees,
            Collection::Fees => &self.fees,
            Collection::Expenses => &self.expenses,
        }
    }

    /// Serialize as a pretty-printed backup document.
    pub fn to_backup_json(&self) -> Result<String, SyncError> {
        serde_json::to_string_pretty(self)
            .map_err(|e| SyncError::InvalidImport(format!("Failed to serialize backup: {}", e)))
    }

    /// Parse and validate a backup document.
    ///
    /// The document must carry all four collections and the config section,
    /// and ids must be unique within each collection. Legacy records flagged
    /// deleted without a timestamp are accepted as-is; a live record carrying
    /// `deletedAt` is rejected.
    pub fn from_backup_json(text: &str) -> Result<Self, SyncError> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| SyncError::InvalidImport(format!("Backup is not valid JSON: {}", e)))?;

        let object = value
            .as_object()
            .ok_or_else(|| SyncError::InvalidImport("Backup is not a JSON object".to_string()))?;

        for collection in Collection::ALL {
            let section = collection.table_name();
            match object.get(section) {
                Some(Value::Array(_)) => {}
                Some(_) => {
                    return Err(SyncError::InvalidImport(format!(
                        "Backup section '{}' must be a list",
                        section
                    )))
                }
                None => {
                    return Err(SyncError::InvalidImport(format!(
                        "Backup is missing the '{}' section",
                        section
                    )))
                }
            }
        }
        if !matches!(object.get(CONFIG_SECTION), Some(Value::Object(_))) {
            return Err(SyncError::InvalidImport(format!(
                "Backup is missing the '{}' section",
                CONFIG_SECTION
            )));
        }

        let datastore: Datastore = serde_json::from_value(value)
            .map_err(|e| SyncError::InvalidImport(format!("Malformed backup: {}", e)))?;

        for collection in Collection::ALL {
            let mut seen = HashSet::new();
            for record in datastore.records(collection) {
                if !seen.insert(record.id.as_str()) {
                    return Err(SyncError::InvalidImport(format!(
                        "Duplicate id {} in '{}'",
                        record.id, collection
                    )));
                }
                if !record.is_deleted && record.deleted_at.is_some() {
                    return Err(SyncError::InvalidImport(format!(
                        "Record {} in '{}' has deletedAt but is not deleted",
                        record.id, collection
                    )));
                }
            }
        }

        Ok(datastore)
    }
}

/// Revision information for change detection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevisionInfo {
    pub revision_id: u64,
    pub generated_at: DateTime<Utc>,
}
