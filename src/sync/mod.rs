//! Sync Coordinator.
//!
//! Every mutating operation runs the same three steps:
//!
//! 1. **Optimistic apply**: the Entity Store is changed synchronously, so
//!    readers see the result before any network round trip completes.
//! 2. **Remote dispatch**: the matching gateway call is awaited.
//! 3. **Reconciliation**: success confirms the change; failure rolls back
//!    exactly what this operation changed and emits a classified error.
//!
//! Purges are the exception: remote first, local only once the remote delete
//! succeeded, so a failed delete never loses the local copy. Records being
//! purged are claimed in the store, and edits to them are refused until the
//! purge settles. A backup import likewise refuses every other edit while it
//! pushes to the remote store.
//!
//! Store locks are scoped to the synchronous steps and never held across an
//! await. Rollbacks compare against the values this operation wrote, so a
//! later operation's effect on the same record is never clobbered.

pub mod ids;

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::errors::{GatewayError, RemoteErrorKind, SyncError};
use crate::gateway::RemoteGateway;
use crate::models::{is_reserved, Collection, Datastore, Record, SchoolConfig, Severity};
use crate::notify::SharedSink;
use crate::session::SessionPartitioner;
use crate::store::{Mutation, StoreHandle};

/// Field name to value, `None` meaning the field is absent.
type FieldValues = BTreeMap<String, Option<Value>>;

/// What a single record of a collection is called in notifications.
fn noun(collection: Collection) -> &'static str {
    match collection {
        Collection::Students => "student",
        Collection::Employees => "employee",
        Collection::Fees => "fee record",
        Collection::Expenses => "expense",
    }
}

fn plural(count: usize, collection: Collection) -> String {
    if count == 1 {
        format!("1 {}", noun(collection))
    } else {
        format!("{} {}s", count, noun(collection))
    }
}

/// Orchestrates optimistic mutation, remote confirmation and rollback.
#[derive(Clone)]
pub struct SyncCoordinator {
    store: StoreHandle,
    gateway: Arc<dyn RemoteGateway>,
    sink: SharedSink,
}

impl SyncCoordinator {
    pub fn new(store: StoreHandle, gateway: Arc<dyn RemoteGateway>, sink: SharedSink) -> Self {
        Self {
            store,
            gateway,
            sink,
        }
    }

    pub fn store(&self) -> &StoreHandle {
        &self.store
    }

    pub fn gateway(&self) -> Arc<dyn RemoteGateway> {
        self.gateway.clone()
    }

    /// Partitioner for the session active right now.
    pub fn partitioner(&self) -> SessionPartitioner {
        SessionPartitioner::from_source(&*self.store.read())
    }

    /// Live records of `collection` in the active session.
    pub fn active_view(&self, collection: Collection) -> Vec<Record> {
        let store = self.store.read();
        SessionPartitioner::from_source(&*store).active_view(collection, &store.get(collection))
    }

    /// Create a record with a fresh id, stamped with the active session.
    pub async fn create(
        &self,
        collection: Collection,
        fields: Map<String, Value>,
    ) -> Result<Record, SyncError> {
        reject_reserved(&fields)?;

        let record = {
            let mut store = self.store.write();
            store.ensure_idle()?;
            let id = ids::next_id(collection, &store.ids(collection), Utc::now());
            let session = SessionPartitioner::from_source(&*store).stamp();
            let record = Record::new(id, session, fields);
            store.apply(collection, Mutation::Insert(record.clone()))?;
            record
        };
        tracing::debug!(collection = %collection, id = %record.id, "optimistic create applied");

        match self.gateway.insert(collection, &record).await {
            Ok(()) => {
                self.sink.notify(
                    &format!("Saved {} {}", noun(collection), record.id),
                    Severity::Success,
                );
                Ok(record)
            }
            Err(err) => {
                self.rollback(collection, Mutation::Remove(vec![record.id.clone()]));
                Err(self.report_failure(&format!("save {} {}", noun(collection), record.id), err))
            }
        }
    }

    /// Update domain fields in place. A `null` value removes the field.
    pub async fn update(
        &self,
        collection: Collection,
        id: &str,
        fields: Map<String, Value>,
    ) -> Result<Record, SyncError> {
        reject_reserved(&fields)?;
        if fields.is_empty() {
            return Err(SyncError::InvalidState("No fields to update".to_string()));
        }

        let (updated, applied, inverse) = {
            let mut store = self.store.write();
            store.ensure_writable(collection, id)?;
            let current = store
                .find(collection, id)
                .ok_or_else(|| not_found(collection, id))?;

            let (patch, applied) = patch_for(id, &fields);
            let inverse = inverse_patch(&current, &fields);
            store.apply(collection, patch)?;
            let updated = store
                .find(collection, id)
                .ok_or_else(|| not_found(collection, id))?;
            (updated, applied, inverse)
        };
        tracing::debug!(collection = %collection, id = %id, "optimistic update applied");

        match self.gateway.update_fields(collection, id, &fields).await {
            Ok(()) => {
                self.sink.notify(
                    &format!("Updated {} {}", noun(collection), id),
                    Severity::Success,
                );
                Ok(updated)
            }
            Err(err) => {
                self.rollback_fields(collection, id, &applied, inverse);
                Err(self.report_failure(&format!("update {} {}", noun(collection), id), err))
            }
        }
    }

    /// Move a record to the recycle bin.
    pub async fn soft_delete(&self, collection: Collection, id: &str) -> Result<Record, SyncError> {
        let deleted_at = Utc::now();
        let updated = {
            let mut store = self.store.write();
            store.ensure_writable(collection, id)?;
            let current = store
                .find(collection, id)
                .ok_or_else(|| not_found(collection, id))?;
            if current.is_deleted {
                return Err(SyncError::InvalidState(format!(
                    "{} {} is already in the recycle bin",
                    noun(collection),
                    id
                )));
            }
            store.apply(
                collection,
                Mutation::SetDeleted {
                    id: id.to_string(),
                    deleted_at: Some(deleted_at),
                },
            )?;
            Record {
                is_deleted: true,
                deleted_at: Some(deleted_at),
                ..current
            }
        };

        let mut wire = Map::new();
        wire.insert("isDeleted".into(), Value::Bool(true));
        wire.insert("deletedAt".into(), timestamp_value(deleted_at));

        match self.gateway.update_fields(collection, id, &wire).await {
            Ok(()) => {
                self.sink.notify(
                    &format!("Moved {} {} to the recycle bin", noun(collection), id),
                    Severity::Success,
                );
                Ok(updated)
            }
            Err(err) => {
                self.rollback_deletion(collection, id, (true, Some(deleted_at)), (false, None));
                Err(self.report_failure(&format!("delete {} {}", noun(collection), id), err))
            }
        }
    }

    /// Bring a record back from the recycle bin.
    pub async fn restore(&self, collection: Collection, id: &str) -> Result<Record, SyncError> {
        let (previous, updated) = {
            let mut store = self.store.write();
            store.ensure_writable(collection, id)?;
            let current = store
                .find(collection, id)
                .ok_or_else(|| not_found(collection, id))?;
            if !current.is_deleted {
                return Err(SyncError::InvalidState(format!(
                    "{} {} is not in the recycle bin",
                    noun(collection),
                    id
                )));
            }
            store.apply(
                collection,
                Mutation::SetDeleted {
                    id: id.to_string(),
                    deleted_at: None,
                },
            )?;
            let previous = (current.is_deleted, current.deleted_at);
            let updated = Record {
                is_deleted: false,
                deleted_at: None,
                ..current
            };
            (previous, updated)
        };

        let mut wire = Map::new();
        wire.insert("isDeleted".into(), Value::Bool(false));
        wire.insert("deletedAt".into(), Value::Null);

        match self.gateway.update_fields(collection, id, &wire).await {
            Ok(()) => {
                self.sink.notify(
                    &format!("Restored {} {}", noun(collection), id),
                    Severity::Success,
                );
                Ok(updated)
            }
            Err(err) => {
                self.rollback_deletion(collection, id, (false, None), previous);
                Err(self.report_failure(&format!("restore {} {}", noun(collection), id), err))
            }
        }
    }

    /// Permanently delete records that are already in the recycle bin.
    ///
    /// Remote first; the local copies are dropped only after the remote
    /// delete succeeded. Repeated ids count once. Returns the number of
    /// records purged.
    pub async fn purge(&self, collection: Collection, ids: &[String]) -> Result<usize, SyncError> {
        let mut seen = HashSet::new();
        let ids: Vec<String> = ids
            .iter()
            .filter(|id| seen.insert(*id))
            .cloned()
            .collect();
        if ids.is_empty() {
            return Ok(0);
        }

        let claim = self.store.claim_purge(collection, |store| {
            for id in &ids {
                let record = store
                    .find(collection, id)
                    .ok_or_else(|| not_found(collection, id))?;
                if store.is_purging(collection, id) {
                    return Err(SyncError::InvalidState(format!(
                        "{} {} is already being permanently deleted",
                        noun(collection),
                        id
                    )));
                }
                if !record.is_deleted {
                    return Err(SyncError::InvalidState(format!(
                        "{} {} must be moved to the recycle bin before it can be purged",
                        noun(collection),
                        id
                    )));
                }
            }
            Ok(ids.clone())
        })?;

        match self.gateway.delete_by_ids(collection, claim.ids()).await {
            Ok(()) => {
                let purged = claim.finish(|r| r.is_deleted)?;
                self.sink.notify(
                    &format!("Permanently deleted {}", plural(purged, collection)),
                    Severity::Success,
                );
                Ok(purged)
            }
            Err(err) => {
                drop(claim);
                Err(self.report_failure(
                    &format!("permanently delete {}", plural(ids.len(), collection)),
                    err,
                ))
            }
        }
    }

    /// Save the configuration record. This is how an administrative session
    /// switch reaches storage; the layer itself never changes the session.
    pub async fn update_config(&self, config: SchoolConfig) -> Result<SchoolConfig, SyncError> {
        let previous = {
            let mut store = self.store.write();
            store.ensure_idle()?;
            let previous = store.config().clone();
            store.set_config(config.clone());
            previous
        };

        match self.gateway.upsert_config(&config).await {
            Ok(()) => {
                self.sink.notify("Settings saved", Severity::Success);
                Ok(config)
            }
            Err(err) => {
                {
                    let mut store = self.store.write();
                    if *store.config() == config {
                        store.set_config(previous);
                    }
                }
                Err(self.report_failure("save settings", err))
            }
        }
    }

    /// Erase every record in every collection, remote first.
    ///
    /// Collections whose remote delete fails are left untouched locally.
    /// Configuration is kept.
    pub async fn factory_reset(&self) -> Result<usize, SyncError> {
        self.store.read().ensure_idle()?;
        let mut erased = 0;
        let mut failures: Vec<(Collection, GatewayError)> = Vec::new();

        for collection in Collection::ALL {
            let ids = self.store.read().ids(collection);
            if ids.is_empty() {
                continue;
            }
            match self.gateway.delete_by_ids(collection, &ids).await {
                Ok(()) => {
                    erased += ids.len();
                    self.store.write().apply(collection, Mutation::Remove(ids))?;
                }
                Err(err) => {
                    tracing::warn!(collection = %collection, error = %err, "factory reset: remote delete failed");
                    failures.push((collection, err));
                }
            }
        }

        match failures.into_iter().next() {
            None => {
                tracing::info!(erased, "factory reset complete");
                self.sink.notify(
                    &format!("Factory reset complete: erased {} records", erased),
                    Severity::Success,
                );
                Ok(erased)
            }
            Some((collection, err)) => {
                Err(self.report_failure(&format!("erase {}", collection), err))
            }
        }
    }

    /// The full working copy as a backup document.
    pub fn export_backup(&self) -> Result<String, SyncError> {
        self.store.read().snapshot().to_backup_json()
    }

    /// Replace the working copy and the remote store with a backup document.
    ///
    /// An invalid document is rejected synchronously with the store left
    /// untouched and no notification. Other edits are refused until the push
    /// settles, so if it fails the previous working copy is put back whole.
    pub async fn import_backup(&self, text: &str) -> Result<usize, SyncError> {
        let datastore = Datastore::from_backup_json(text)?;
        let _exclusive = self.store.claim_import()?;
        let previous = {
            let mut store = self.store.write();
            let previous = store.snapshot();
            store.load(datastore.clone())?;
            previous
        };
        let total: usize = Collection::ALL
            .iter()
            .map(|c| datastore.records(*c).len())
            .sum();

        match self.push_datastore(&datastore).await {
            Ok(()) => {
                tracing::info!(records = total, "backup imported");
                self.sink.notify(
                    &format!("Backup imported: {} records", total),
                    Severity::Success,
                );
                Ok(total)
            }
            Err(err) => {
                if let Err(e) = self.store.write().load(previous) {
                    tracing::error!(error = %e, "failed to restore working copy after import");
                }
                Err(self.report_failure("import the backup", err))
            }
        }
    }

    /// Make the remote store hold exactly `datastore`.
    async fn push_datastore(&self, datastore: &Datastore) -> Result<(), GatewayError> {
        for collection in Collection::ALL {
            let records = datastore.records(collection);
            let keep: HashSet<&str> = records.iter().map(|r| r.id.as_str()).collect();

            let stale: Vec<String> = self
                .gateway
                .fetch_all(collection)
                .await?
                .into_iter()
                .filter(|r| !keep.contains(r.id.as_str()))
                .map(|r| r.id)
                .collect();
            if !stale.is_empty() {
                self.gateway.delete_by_ids(collection, &stale).await?;
            }
            for record in records {
                self.gateway.upsert(collection, record).await?;
            }
        }
        self.gateway.upsert_config(&datastore.config).await
    }

    fn rollback(&self, collection: Collection, mutation: Mutation) {
        if let Err(e) = self.store.write().apply(collection, mutation) {
            tracing::warn!(collection = %collection, error = %e, "rollback skipped");
        }
    }

    /// Undo a field update, but only for fields that still hold the values
    /// this operation wrote.
    fn rollback_fields(
        &self,
        collection: Collection,
        id: &str,
        applied: &FieldValues,
        inverse: FieldValues,
    ) {
        let mut store = self.store.write();
        let Some(current) = store.find(collection, id) else {
            return;
        };

        let mut set = Map::new();
        let mut unset = Vec::new();
        for (key, previous) in inverse {
            let still_ours = applied
                .get(&key)
                .is_some_and(|written| current.fields.get(&key) == written.as_ref());
            if !still_ours {
                tracing::debug!(collection = %collection, id = %id, field = %key, "field superseded, not rolled back");
                continue;
            }
            match previous {
                Some(value) => {
                    set.insert(key, value);
                }
                None => unset.push(key),
            }
        }

        if let Err(e) = store.apply(
            collection,
            Mutation::Patch {
                id: id.to_string(),
                set,
                unset,
            },
        ) {
            tracing::warn!(collection = %collection, id = %id, error = %e, "rollback skipped");
        }
    }

    /// Put deletion bookkeeping back to `restore_to` if the record still
    /// carries the `expected` state this operation wrote.
    fn rollback_deletion(
        &self,
        collection: Collection,
        id: &str,
        expected: (bool, Option<DateTime<Utc>>),
        restore_to: (bool, Option<DateTime<Utc>>),
    ) {
        let mut store = self.store.write();
        let Some(current) = store.find(collection, id) else {
            return;
        };
        if (current.is_deleted, current.deleted_at) != expected {
            tracing::debug!(collection = %collection, id = %id, "deletion state superseded, not rolled back");
            return;
        }
        if let Err(e) = store.apply(
            collection,
            Mutation::RevertDeletion {
                id: id.to_string(),
                is_deleted: restore_to.0,
                deleted_at: restore_to.1,
            },
        ) {
            tracing::warn!(collection = %collection, id = %id, error = %e, "rollback skipped");
        }
    }

    /// Emit the classified error notification for a failed remote call.
    fn report_failure(&self, action: &str, err: GatewayError) -> SyncError {
        let kind = err.kind();
        tracing::warn!(action = %action, kind = ?kind, error = %err, "remote operation failed; local change rolled back");
        self.sink.notify(&failure_message(action, kind, &err.message), Severity::Error);
        SyncError::from(err)
    }
}

/// User-facing text for a failed remote call.
pub(crate) fn failure_message(action: &str, kind: RemoteErrorKind, raw: &str) -> String {
    match kind {
        RemoteErrorKind::PolicyDenied => format!(
            "Could not {}: the database security policy denied the change. \
             An administrator must grant access. ({})",
            action, raw
        ),
        RemoteErrorKind::SchemaMismatch => format!(
            "Could not {}: the database is missing a required column. \
             The store is misconfigured. ({})",
            action, raw
        ),
        RemoteErrorKind::Transient => format!(
            "Could not {}. Check your connection and try again. ({})",
            action, raw
        ),
    }
}

fn reject_reserved(fields: &Map<String, Value>) -> Result<(), SyncError> {
    match fields.keys().find(|k| is_reserved(k)) {
        Some(key) => Err(SyncError::ReservedField(key.clone())),
        None => Ok(()),
    }
}

fn not_found(collection: Collection, id: &str) -> SyncError {
    SyncError::NotFound {
        collection: collection.to_string(),
        id: id.to_string(),
    }
}

fn timestamp_value(at: DateTime<Utc>) -> Value {
    Value::String(at.to_rfc3339())
}

/// Store patch for a field update, plus what each field now holds
/// (`None` = removed).
fn patch_for(id: &str, fields: &Map<String, Value>) -> (Mutation, FieldValues) {
    let mut set = Map::new();
    let mut unset = Vec::new();
    let mut applied = FieldValues::new();
    for (key, value) in fields {
        if value.is_null() {
            unset.push(key.clone());
            applied.insert(key.clone(), None);
        } else {
            set.insert(key.clone(), value.clone());
            applied.insert(key.clone(), Some(value.clone()));
        }
    }
    let patch = Mutation::Patch {
        id: id.to_string(),
        set,
        unset,
    };
    (patch, applied)
}

/// Previous value of every field an update touches (`None` = was absent).
fn inverse_patch(current: &Record, fields: &Map<String, Value>) -> FieldValues {
    fields
        .keys()
        .map(|key| (key.clone(), current.fields.get(key).cloned()))
        .collect()
}
