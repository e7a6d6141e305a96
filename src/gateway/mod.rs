//! Remote Persistence Gateway.
//!
//! Translates collection-level operations into calls against a remote,
//! table-oriented store. Gateways report success or the store's raw error
//! text; they never interpret what a failure means for the caller.

mod memory;
mod sqlite;

pub use memory::*;
pub use sqlite::*;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::errors::GatewayError;
use crate::models::{Collection, Record, SchoolConfig};

/// Remote table-oriented store.
///
/// `update_fields` accepts the record's wire keys: `session`, `isDeleted` and
/// `deletedAt` address bookkeeping columns, everything else is a domain
/// field. A `null` domain value removes that field.
#[async_trait]
pub trait RemoteGateway: Send + Sync {
    async fn fetch_all(&self, collection: Collection) -> Result<Vec<Record>, GatewayError>;

    async fn insert(&self, collection: Collection, record: &Record) -> Result<(), GatewayError>;

    /// Insert or replace by id.
    async fn upsert(&self, collection: Collection, record: &Record) -> Result<(), GatewayError>;

    async fn update_fields(
        &self,
        collection: Collection,
        id: &str,
        fields: &Map<String, Value>,
    ) -> Result<(), GatewayError>;

    async fn delete_by_ids(&self, collection: Collection, ids: &[String])
        -> Result<(), GatewayError>;

    /// The singular configuration record, if one has been stored.
    async fn fetch_config(&self) -> Result<Option<SchoolConfig>, GatewayError>;

    async fn upsert_config(&self, config: &SchoolConfig) -> Result<(), GatewayError>;
}

/// A wire-level field update, split into bookkeeping columns and domain
/// fields.
///
/// Shared by gateway implementations so both interpret `update_fields`
/// identically.
#[derive(Debug, Default)]
pub(crate) struct WirePatch {
    pub session: Option<Option<String>>,
    pub is_deleted: Option<bool>,
    pub deleted_at: Option<Option<DateTime<Utc>>>,
    pub set: Map<String, Value>,
    pub unset: Vec<String>,
}

impl WirePatch {
    pub(crate) fn parse(fields: &Map<String, Value>) -> Result<Self, GatewayError> {
        let mut patch = WirePatch::default();
        for (key, value) in fields {
            match key.as_str() {
                "id" => {
                    return Err(GatewayError::new("column \"id\" cannot be updated"));
                }
                "session" => {
                    patch.session = Some(value.as_str().map(str::to_string));
                }
                "isDeleted" => {
                    patch.is_deleted = Some(value.as_bool().unwrap_or(false));
                }
                "deletedAt" => {
                    patch.deleted_at = Some(match value {
                        Value::Null => None,
                        other => Some(serde_json::from_value(other.clone())?),
                    });
                }
                _ if value.is_null() => patch.unset.push(key.clone()),
                _ => {
                    patch.set.insert(key.clone(), value.clone());
                }
            }
        }
        Ok(patch)
    }

    pub(crate) fn apply(self, record: &mut Record) {
        if let Some(session) = self.session {
            record.session = session;
        }
        if let Some(is_deleted) = self.is_deleted {
            record.is_deleted = is_deleted;
        }
        if let Some(deleted_at) = self.deleted_at {
            record.deleted_at = deleted_at;
        }
        for key in &self.unset {
            record.fields.remove(key);
        }
        record.fields.extend(self.set);
    }
}

/// Apply a wire-level field update to a record in place.
pub(crate) fn apply_wire_fields(
    record: &mut Record,
    fields: &Map<String, Value>,
) -> Result<(), GatewayError> {
    WirePatch::parse(fields)?.apply(record);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_patch_splits_bookkeeping_from_fields() {
        let fields = json!({
            "isDeleted": true,
            "deletedAt": "2024-09-01T00:00:00Z",
            "amount": 500,
            "note": null
        });
        let patch = WirePatch::parse(fields.as_object().unwrap()).unwrap();

        assert_eq!(patch.is_deleted, Some(true));
        assert!(matches!(patch.deleted_at, Some(Some(_))));
        assert_eq!(patch.session, None);
        assert_eq!(patch.set.get("amount"), Some(&json!(500)));
        assert_eq!(patch.unset, vec!["note".to_string()]);
    }

    #[test]
    fn test_wire_patch_rejects_id() {
        let fields = json!({ "id": "X" });
        assert!(WirePatch::parse(fields.as_object().unwrap()).is_err());
    }
}
