//! Entity Store: the authoritative in-memory working copy.
//!
//! Pure data plus invariant checks. Nothing here touches remote storage.
//! The store is shared through [`StoreHandle`]; every lock is taken for the
//! duration of a single synchronous step and never held across an await.
//!
//! Work that spans an await and must not interleave with ordinary edits
//! registers itself here: a [`PurgeClaim`] fences the records being
//! permanently deleted, an [`ImportClaim`] fences the whole store while a
//! backup is pushed.

use std::collections::HashSet;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::errors::SyncError;
use crate::models::{
    is_reserved, Collection, Datastore, Record, RevisionInfo, SchoolConfig, SCHEMA_VERSION,
};

/// An in-memory change to one collection.
#[derive(Debug, Clone)]
pub enum Mutation {
    /// Append a new record. Its id must not exist yet, soft-deleted or not.
    Insert(Record),
    /// Set and remove domain fields on one record.
    Patch {
        id: String,
        set: Map<String, Value>,
        unset: Vec<String>,
    },
    /// `Some(at)` soft-deletes the record at `at`; `None` restores it.
    SetDeleted {
        id: String,
        deleted_at: Option<DateTime<Utc>>,
    },
    /// Put back deletion bookkeeping captured before an operation, legacy
    /// timestamp-less deletions included.
    RevertDeletion {
        id: String,
        is_deleted: bool,
        deleted_at: Option<DateTime<Utc>>,
    },
    /// Drop records entirely. Unknown ids are ignored.
    Remove(Vec<String>),
}

/// Authoritative local snapshot of every collection plus configuration.
#[derive(Debug, Clone)]
pub struct EntityStore {
    students: Vec<Record>,
    employees: Vec<Record>,
    fees: Vec<Record>,
    expenses: Vec<Record>,
    config: SchoolConfig,
    revision: u64,
    generated_at: DateTime<Utc>,
    purging: HashSet<(Collection, String)>,
    importing: bool,
}

impl EntityStore {
    pub fn new(config: SchoolConfig) -> Self {
        Self {
            students: Vec::new(),
            employees: Vec::new(),
            fees: Vec::new(),
            expenses: Vec::new(),
            config,
            revision: 0,
            generated_at: Utc::now(),
            purging: HashSet::new(),
            importing: false,
        }
    }

    fn records(&self, collection: Collection) -> &Vec<Record> {
        match collection {
            Collection::Students => &self.students,
            Collection::Employees => &self.employees,
            Collection::Fees => &self.fees,
            Collection::Expenses => &self.expenses,
        }
    }

    fn records_mut(&mut self, collection: Collection) -> &mut Vec<Record> {
        match collection {
            Collection::Students => &mut self.students,
            Collection::Employees => &mut self.employees,
            Collection::Fees => &mut self.fees,
            Collection::Expenses => &mut self.expenses,
        }
    }

    fn bump(&mut self) {
        self.revision += 1;
        self.generated_at = Utc::now();
    }

    /// Snapshot of a collection in insertion order, soft-deleted records included.
    pub fn get(&self, collection: Collection) -> Vec<Record> {
        self.records(collection).clone()
    }

    pub fn find(&self, collection: Collection, id: &str) -> Option<Record> {
        self.records(collection).iter().find(|r| r.id == id).cloned()
    }

    pub fn ids(&self, collection: Collection) -> Vec<String> {
        self.records(collection).iter().map(|r| r.id.clone()).collect()
    }

    pub fn config(&self) -> &SchoolConfig {
        &self.config
    }

    pub fn set_config(&mut self, config: SchoolConfig) {
        self.config = config;
        self.bump();
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn revision_info(&self) -> RevisionInfo {
        RevisionInfo {
            revision_id: self.revision,
            generated_at: self.generated_at,
        }
    }

    pub fn is_purging(&self, collection: Collection, id: &str) -> bool {
        self.purging.contains(&(collection, id.to_string()))
    }

    pub fn is_importing(&self) -> bool {
        self.importing
    }

    /// Refuse any user edit while a backup import is in flight.
    pub fn ensure_idle(&self) -> Result<(), SyncError> {
        if self.importing {
            return Err(SyncError::InvalidState(
                "A backup import is in progress".to_string(),
            ));
        }
        Ok(())
    }

    /// Refuse an edit of one record while an import runs or while the record
    /// is being permanently deleted.
    pub fn ensure_writable(&self, collection: Collection, id: &str) -> Result<(), SyncError> {
        self.ensure_idle()?;
        if self.is_purging(collection, id) {
            return Err(SyncError::InvalidState(format!(
                "Record {} in {} is being permanently deleted",
                id, collection
            )));
        }
        Ok(())
    }

    /// Apply a mutation and return the collection's new snapshot.
    ///
    /// A rejected mutation leaves the store untouched.
    pub fn apply(
        &mut self,
        collection: Collection,
        mutation: Mutation,
    ) -> Result<Vec<Record>, SyncError> {
        let records = self.records_mut(collection);
        match mutation {
            Mutation::Insert(record) => {
                if records.iter().any(|r| r.id == record.id) {
                    return Err(SyncError::DuplicateId {
                        collection: collection.to_string(),
                        id: record.id,
                    });
                }
                if !record.deletion_consistent() {
                    return Err(SyncError::InvalidState(format!(
                        "Record {} has inconsistent deletion state",
                        record.id
                    )));
                }
                records.push(record);
            }
            Mutation::Patch { id, set, unset } => {
                if let Some(key) = set.keys().chain(unset.iter()).find(|k| is_reserved(k)) {
                    return Err(SyncError::ReservedField(key.clone()));
                }
                let record = find_mut(records, collection, &id)?;
                for key in &unset {
                    record.fields.remove(key);
                }
                record.fields.extend(set);
            }
            Mutation::SetDeleted { id, deleted_at } => {
                let record = find_mut(records, collection, &id)?;
                record.is_deleted = deleted_at.is_some();
                record.deleted_at = deleted_at;
            }
            Mutation::RevertDeletion {
                id,
                is_deleted,
                deleted_at,
            } => {
                let record = find_mut(records, collection, &id)?;
                record.is_deleted = is_deleted;
                record.deleted_at = deleted_at;
            }
            Mutation::Remove(ids) => {
                let ids: HashSet<String> = ids.into_iter().collect();
                records.retain(|r| !ids.contains(&r.id));
            }
        }

        let snapshot = records.clone();
        self.bump();
        Ok(snapshot)
    }

    /// Wholesale replacement of one collection.
    ///
    /// Ids must be unique. Legacy records flagged deleted without a timestamp
    /// are kept as they are. A live record carrying a stray `deletedAt` has
    /// the timestamp dropped.
    pub fn replace(&mut self, collection: Collection, mut records: Vec<Record>) -> Result<(), SyncError> {
        let mut seen = HashSet::new();
        for record in &records {
            if !seen.insert(record.id.as_str()) {
                return Err(SyncError::DuplicateId {
                    collection: collection.to_string(),
                    id: record.id.clone(),
                });
            }
        }
        for record in records.iter_mut() {
            if record.deletion_consistent() {
                continue;
            }
            if record.is_deleted {
                tracing::warn!(
                    collection = %collection,
                    id = %record.id,
                    "Record is deleted without a timestamp; it will never be purged"
                );
            } else {
                tracing::warn!(
                    collection = %collection,
                    id = %record.id,
                    "Live record carries deletedAt; timestamp dropped"
                );
                record.deleted_at = None;
            }
        }

        *self.records_mut(collection) = records;
        self.bump();
        Ok(())
    }

    /// Full snapshot, suitable for backup export.
    pub fn snapshot(&self) -> Datastore {
        Datastore {
            schema_version: SCHEMA_VERSION,
            generated_at: self.generated_at,
            revision_id: self.revision,
            students: self.students.clone(),
            employees: self.employees.clone(),
            fees: self.fees.clone(),
            expenses: self.expenses.clone(),
            config: self.config.clone(),
        }
    }

    /// Replace every collection and the configuration from a validated document.
    ///
    /// All-or-nothing: the document is checked before anything is replaced.
    pub fn load(&mut self, datastore: Datastore) -> Result<(), SyncError> {
        let mut staged = self.clone();
        for collection in Collection::ALL {
            staged.replace(collection, datastore.records(collection).clone())?;
        }
        staged.config = datastore.config;
        staged.bump();
        *self = staged;
        Ok(())
    }
}

impl Default for EntityStore {
    fn default() -> Self {
        Self::new(SchoolConfig::default())
    }
}

fn find_mut<'a>(
    records: &'a mut [Record],
    collection: Collection,
    id: &str,
) -> Result<&'a mut Record, SyncError> {
    records
        .iter_mut()
        .find(|r| r.id == id)
        .ok_or_else(|| SyncError::NotFound {
            collection: collection.to_string(),
            id: id.to_string(),
        })
}

/// Shared handle to the single working copy.
#[derive(Debug, Clone, Default)]
pub struct StoreHandle {
    inner: Arc<RwLock<EntityStore>>,
}

impl StoreHandle {
    pub fn new(store: EntityStore) -> Self {
        Self {
            inner: Arc::new(RwLock::new(store)),
        }
    }

    /// Read access. A poisoned lock still yields the last written state.
    pub fn read(&self) -> RwLockReadGuard<'_, EntityStore> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Write access. Callers must drop the guard before awaiting.
    pub fn write(&self) -> RwLockWriteGuard<'_, EntityStore> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Claim records of `collection` for permanent deletion.
    ///
    /// `select` runs under the write lock and picks the ids; they stay
    /// fenced by [`EntityStore::ensure_writable`] until the claim is
    /// finished or dropped. Fails while a backup import is in flight.
    pub fn claim_purge<F>(&self, collection: Collection, select: F) -> Result<PurgeClaim, SyncError>
    where
        F: FnOnce(&EntityStore) -> Result<Vec<String>, SyncError>,
    {
        let ids = {
            let mut store = self.write();
            store.ensure_idle()?;
            let ids = select(&store)?;
            for id in &ids {
                store.purging.insert((collection, id.clone()));
            }
            ids
        };
        Ok(PurgeClaim {
            store: self.clone(),
            collection,
            ids,
        })
    }

    /// Fence every user edit until the returned claim is dropped.
    ///
    /// Fails if another import is running or any purge is still in flight.
    pub fn claim_import(&self) -> Result<ImportClaim, SyncError> {
        {
            let mut store = self.write();
            store.ensure_idle()?;
            if !store.purging.is_empty() {
                return Err(SyncError::InvalidState(
                    "A permanent deletion is in progress".to_string(),
                ));
            }
            store.importing = true;
        }
        Ok(ImportClaim {
            store: self.clone(),
        })
    }
}

/// Records fenced for permanent deletion. Dropping the claim releases them
/// without touching the store.
#[derive(Debug)]
pub struct PurgeClaim {
    store: StoreHandle,
    collection: Collection,
    ids: Vec<String>,
}

impl PurgeClaim {
    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Release the claim and drop the claimed records that still satisfy
    /// `keep`. Returns how many were removed.
    pub fn finish<F>(mut self, keep: F) -> Result<usize, SyncError>
    where
        F: Fn(&Record) -> bool,
    {
        let ids = std::mem::take(&mut self.ids);
        let mut store = self.store.write();
        for id in &ids {
            store.purging.remove(&(self.collection, id.clone()));
        }
        let doomed: Vec<String> = store
            .records(self.collection)
            .iter()
            .filter(|r| ids.contains(&r.id) && keep(*r))
            .map(|r| r.id.clone())
            .collect();
        if doomed.len() < ids.len() {
            tracing::warn!(
                collection = %self.collection,
                claimed = ids.len(),
                removed = doomed.len(),
                "some claimed records changed during purge and were kept"
            );
        }
        if doomed.is_empty() {
            return Ok(0);
        }
        let removed = doomed.len();
        store.apply(self.collection, Mutation::Remove(doomed))?;
        Ok(removed)
    }
}

impl Drop for PurgeClaim {
    fn drop(&mut self) {
        if self.ids.is_empty() {
            return;
        }
        let mut store = self.store.write();
        for id in &self.ids {
            store.purging.remove(&(self.collection, id.clone()));
        }
    }
}

/// Held for the duration of a backup import.
#[derive(Debug)]
pub struct ImportClaim {
    store: StoreHandle,
}

impl Drop for ImportClaim {
    fn drop(&mut self) {
        self.store.write().importing = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn fields(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    fn student(id: &str) -> Record {
        Record::new(id, Some("2024-2025".into()), fields(json!({ "name": id })))
    }

    #[test]
    fn test_insert_preserves_order_and_bumps_revision() {
        let mut store = EntityStore::default();
        let before = store.revision();

        store.apply(Collection::Students, Mutation::Insert(student("ST01"))).unwrap();
        let snapshot = store
            .apply(Collection::Students, Mutation::Insert(student("ST02")))
            .unwrap();

        let ids: Vec<_> = snapshot.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["ST01", "ST02"]);
        assert_eq!(store.revision(), before + 2);
    }

    #[test]
    fn test_duplicate_insert_rejected_including_soft_deleted() {
        let mut store = EntityStore::default();
        store.apply(Collection::Students, Mutation::Insert(student("ST01"))).unwrap();
        store
            .apply(
                Collection::Students,
                Mutation::SetDeleted {
                    id: "ST01".into(),
                    deleted_at: Some(Utc::now()),
                },
            )
            .unwrap();
        let revision = store.revision();

        let err = store
            .apply(Collection::Students, Mutation::Insert(student("ST01")))
            .unwrap_err();
        assert!(matches!(err, SyncError::DuplicateId { .. }));
        assert_eq!(store.get(Collection::Students).len(), 1);
        assert_eq!(store.revision(), revision);
    }

    #[test]
    fn test_set_deleted_keeps_invariant() {
        let mut store = EntityStore::default();
        store.apply(Collection::Fees, Mutation::Insert(student("F1"))).unwrap();

        let at = Utc::now() - Duration::days(3);
        store
            .apply(
                Collection::Fees,
                Mutation::SetDeleted {
                    id: "F1".into(),
                    deleted_at: Some(at),
                },
            )
            .unwrap();
        let record = store.find(Collection::Fees, "F1").unwrap();
        assert!(record.is_deleted);
        assert_eq!(record.deleted_at, Some(at));

        store
            .apply(
                Collection::Fees,
                Mutation::SetDeleted {
                    id: "F1".into(),
                    deleted_at: None,
                },
            )
            .unwrap();
        let record = store.find(Collection::Fees, "F1").unwrap();
        assert!(!record.is_deleted);
        assert!(record.deleted_at.is_none());
    }

    #[test]
    fn test_patch_rejects_reserved_fields() {
        let mut store = EntityStore::default();
        store.apply(Collection::Students, Mutation::Insert(student("ST01"))).unwrap();

        let err = store
            .apply(
                Collection::Students,
                Mutation::Patch {
                    id: "ST01".into(),
                    set: fields(json!({ "session": "2025-2026" })),
                    unset: vec![],
                },
            )
            .unwrap_err();
        assert_eq!(err, SyncError::ReservedField("session".into()));
        assert_eq!(
            store.find(Collection::Students, "ST01").unwrap().session.as_deref(),
            Some("2024-2025")
        );
    }

    #[test]
    fn test_patch_sets_and_unsets() {
        let mut store = EntityStore::default();
        store.apply(Collection::Students, Mutation::Insert(student("ST01"))).unwrap();

        store
            .apply(
                Collection::Students,
                Mutation::Patch {
                    id: "ST01".into(),
                    set: fields(json!({ "class": "6A" })),
                    unset: vec!["name".into()],
                },
            )
            .unwrap();

        let record = store.find(Collection::Students, "ST01").unwrap();
        assert_eq!(record.fields.get("class"), Some(&json!("6A")));
        assert!(record.fields.get("name").is_none());
    }

    #[test]
    fn test_patch_missing_record() {
        let mut store = EntityStore::default();
        let err = store
            .apply(
                Collection::Expenses,
                Mutation::Patch {
                    id: "E404".into(),
                    set: Map::new(),
                    unset: vec![],
                },
            )
            .unwrap_err();
        assert!(matches!(err, SyncError::NotFound { .. }));
    }

    #[test]
    fn test_replace_rejects_duplicates() {
        let mut store = EntityStore::default();
        let err = store
            .replace(Collection::Students, vec![student("ST01"), student("ST01")])
            .unwrap_err();
        assert!(matches!(err, SyncError::DuplicateId { .. }));
        assert!(store.get(Collection::Students).is_empty());
    }

    #[test]
    fn test_load_is_all_or_nothing() {
        let mut store = EntityStore::default();
        store.apply(Collection::Fees, Mutation::Insert(student("F1"))).unwrap();
        let before = store.snapshot();

        let mut doc = before.clone();
        doc.students = vec![student("ST01")];
        doc.expenses = vec![student("E1"), student("E1")];

        assert!(store.load(doc).is_err());
        assert_eq!(store.snapshot(), before);
    }

    #[test]
    fn test_replace_drops_stray_deleted_at_on_live_records() {
        let mut store = EntityStore::default();
        let mut stray = student("ST01");
        stray.deleted_at = Some(Utc::now());
        let mut legacy = student("ST02");
        legacy.is_deleted = true;

        store.replace(Collection::Students, vec![stray, legacy]).unwrap();

        let stray = store.find(Collection::Students, "ST01").unwrap();
        assert!(!stray.is_deleted);
        assert!(stray.deleted_at.is_none());
        let legacy = store.find(Collection::Students, "ST02").unwrap();
        assert!(legacy.is_deleted && legacy.deleted_at.is_none());
    }

    fn tombstone(id: &str) -> Record {
        let mut record = student(id);
        record.is_deleted = true;
        record.deleted_at = Some(Utc::now() - Duration::days(31));
        record
    }

    #[test]
    fn test_purge_claim_fences_records_until_finished() {
        let handle = StoreHandle::default();
        handle
            .write()
            .replace(Collection::Students, vec![tombstone("ST01"), tombstone("ST02")])
            .unwrap();

        let claim = handle
            .claim_purge(Collection::Students, |_| Ok(vec!["ST01".to_string()]))
            .unwrap();
        assert_eq!(claim.ids(), ["ST01".to_string()]);
        assert!(handle.read().ensure_writable(Collection::Students, "ST01").is_err());
        assert!(handle.read().ensure_writable(Collection::Students, "ST02").is_ok());
        assert!(handle.read().ensure_writable(Collection::Fees, "ST01").is_ok());

        let removed = claim.finish(|r| r.is_deleted).unwrap();
        assert_eq!(removed, 1);
        assert!(!handle.read().is_purging(Collection::Students, "ST01"));
        assert_eq!(handle.read().ids(Collection::Students), vec!["ST02"]);
    }

    #[test]
    fn test_purge_claim_keeps_records_that_no_longer_qualify() {
        let handle = StoreHandle::default();
        handle
            .write()
            .replace(Collection::Students, vec![tombstone("ST01")])
            .unwrap();

        let claim = handle
            .claim_purge(Collection::Students, |_| Ok(vec!["ST01".to_string()]))
            .unwrap();
        handle
            .write()
            .apply(
                Collection::Students,
                Mutation::SetDeleted {
                    id: "ST01".into(),
                    deleted_at: None,
                },
            )
            .unwrap();
        let revision = handle.read().revision();

        assert_eq!(claim.finish(|r| r.is_deleted).unwrap(), 0);
        assert_eq!(handle.read().ids(Collection::Students), vec!["ST01"]);
        assert_eq!(handle.read().revision(), revision);
    }

    #[test]
    fn test_dropped_purge_claim_releases_records() {
        let handle = StoreHandle::default();
        let claim = handle
            .claim_purge(Collection::Fees, |_| Ok(vec!["F1".to_string()]))
            .unwrap();
        assert!(handle.read().is_purging(Collection::Fees, "F1"));

        drop(claim);
        assert!(!handle.read().is_purging(Collection::Fees, "F1"));
    }

    #[test]
    fn test_import_claim_is_exclusive() {
        let handle = StoreHandle::default();
        let claim = handle.claim_import().unwrap();

        assert!(handle.read().is_importing());
        assert!(handle.claim_import().is_err());
        assert!(handle.read().ensure_idle().is_err());
        assert!(handle
            .claim_purge(Collection::Fees, |_| Ok(Vec::new()))
            .is_err());

        drop(claim);
        assert!(handle.read().ensure_idle().is_ok());
    }

    #[test]
    fn test_import_refused_while_purge_in_flight() {
        let handle = StoreHandle::default();
        let _claim = handle
            .claim_purge(Collection::Fees, |_| Ok(vec!["F1".to_string()]))
            .unwrap();

        assert!(matches!(
            handle.claim_import(),
            Err(SyncError::InvalidState(_))
        ));
    }
}
