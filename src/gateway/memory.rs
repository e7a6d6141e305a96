//! In-process remote store with scripted failures.
//!
//! Used by tests and by hosts that want to run the sync layer without a
//! database. Failures are scripted per operation; a hold gate can park every
//! call until released, which lets callers observe optimistic state while a
//! remote round trip is still in flight.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::Semaphore;

use super::{apply_wire_fields, RemoteGateway};
use crate::errors::GatewayError;
use crate::models::{Collection, Record, SchoolConfig};

/// Gateway operation, used to script failures and inspect the call log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GatewayOp {
    FetchAll,
    Insert,
    Upsert,
    UpdateFields,
    DeleteByIds,
    FetchConfig,
    UpsertConfig,
}

#[derive(Debug, Clone)]
struct ScriptedFailure {
    op: GatewayOp,
    collection: Option<Collection>,
    message: String,
    /// `None` fails forever.
    remaining: Option<usize>,
}

#[derive(Debug, Default)]
struct MemoryState {
    tables: HashMap<Collection, Vec<Record>>,
    config: Option<SchoolConfig>,
    failures: VecDeque<ScriptedFailure>,
    calls: Vec<(GatewayOp, Option<Collection>)>,
    gate: Option<Arc<Semaphore>>,
}

/// Remote gateway holding its tables in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryGateway {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Seed a table directly, bypassing failure scripting.
    pub fn seed(&self, collection: Collection, records: Vec<Record>) {
        self.lock().tables.insert(collection, records);
    }

    pub fn seed_config(&self, config: SchoolConfig) {
        self.lock().config = Some(config);
    }

    /// Current remote contents of a table.
    pub fn records(&self, collection: Collection) -> Vec<Record> {
        self.lock()
            .tables
            .get(&collection)
            .cloned()
            .unwrap_or_default()
    }

    pub fn config(&self) -> Option<SchoolConfig> {
        self.lock().config.clone()
    }

    /// Fail the next `times` calls of `op` (on any collection) with `message`.
    pub fn fail_times(&self, op: GatewayOp, times: usize, message: impl Into<String>) {
        self.lock().failures.push_back(ScriptedFailure {
            op,
            collection: None,
            message: message.into(),
            remaining: Some(times),
        });
    }

    pub fn fail_next(&self, op: GatewayOp, message: impl Into<String>) {
        self.fail_times(op, 1, message);
    }

    /// Fail every call of `op` on `collection` until [`clear_failures`](Self::clear_failures).
    pub fn fail_always(&self, op: GatewayOp, collection: Collection, message: impl Into<String>) {
        self.lock().failures.push_back(ScriptedFailure {
            op,
            collection: Some(collection),
            message: message.into(),
            remaining: None,
        });
    }

    pub fn clear_failures(&self) {
        self.lock().failures.clear();
    }

    /// Every call made so far, in order.
    pub fn calls(&self) -> Vec<(GatewayOp, Option<Collection>)> {
        self.lock().calls.clone()
    }

    pub fn call_count(&self, op: GatewayOp) -> usize {
        self.lock().calls.iter().filter(|(o, _)| *o == op).count()
    }

    /// Park every subsequent call until [`release`](Self::release) is called.
    pub fn hold(&self) {
        self.lock().gate = Some(Arc::new(Semaphore::new(0)));
    }

    /// Let parked and future calls through.
    pub fn release(&self) {
        if let Some(gate) = self.lock().gate.take() {
            gate.close();
        }
    }

    /// Record the call, wait on the gate if held, then consume any scripted failure.
    async fn enter(&self, op: GatewayOp, collection: Option<Collection>) -> Result<(), GatewayError> {
        let gate = {
            let mut state = self.lock();
            state.calls.push((op, collection));
            state.gate.clone()
        };

        if let Some(gate) = gate {
            // A closed semaphore means the hold was released.
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }

        let mut state = self.lock();
        let position = state.failures.iter().position(|f| {
            f.op == op && (f.collection.is_none() || f.collection == collection)
        });
        let Some(position) = position else {
            return Ok(());
        };

        let exhausted = match state.failures[position].remaining.as_mut() {
            Some(remaining) => {
                *remaining -= 1;
                *remaining == 0
            }
            None => false,
        };
        let message = state.failures[position].message.clone();
        if exhausted {
            state.failures.remove(position);
        }
        Err(GatewayError::new(message))
    }
}

#[async_trait]
impl RemoteGateway for MemoryGateway {
    async fn fetch_all(&self, collection: Collection) -> Result<Vec<Record>, GatewayError> {
        self.enter(GatewayOp::FetchAll, Some(collection)).await?;
        Ok(self.records(collection))
    }

    async fn insert(&self, collection: Collection, record: &Record) -> Result<(), GatewayError> {
        self.enter(GatewayOp::Insert, Some(collection)).await?;
        let mut state = self.lock();
        let table = state.tables.entry(collection).or_default();
        if table.iter().any(|r| r.id == record.id) {
            return Err(GatewayError::new(format!(
                "duplicate key value violates unique constraint \"{}_pkey\"",
                collection
            )));
        }
        table.push(record.clone());
        Ok(())
    }

    async fn upsert(&self, collection: Collection, record: &Record) -> Result<(), GatewayError> {
        self.enter(GatewayOp::Upsert, Some(collection)).await?;
        let mut state = self.lock();
        let table = state.tables.entry(collection).or_default();
        match table.iter_mut().find(|r| r.id == record.id) {
            Some(existing) => *existing = record.clone(),
            None => table.push(record.clone()),
        }
        Ok(())
    }

    async fn update_fields(
        &self,
        collection: Collection,
        id: &str,
        fields: &Map<String, Value>,
    ) -> Result<(), GatewayError> {
        self.enter(GatewayOp::UpdateFields, Some(collection)).await?;
        let mut state = self.lock();
        let table = state.tables.entry(collection).or_default();
        if let Some(record) = table.iter_mut().find(|r| r.id == id) {
            apply_wire_fields(record, fields)?;
        }
        Ok(())
    }

    async fn delete_by_ids(
        &self,
        collection: Collection,
        ids: &[String],
    ) -> Result<(), GatewayError> {
        self.enter(GatewayOp::DeleteByIds, Some(collection)).await?;
        let mut state = self.lock();
        let table = state.tables.entry(collection).or_default();
        table.retain(|r| !ids.contains(&r.id));
        Ok(())
    }

    async fn fetch_config(&self) -> Result<Option<SchoolConfig>, GatewayError> {
        self.enter(GatewayOp::FetchConfig, None).await?;
        Ok(self.config())
    }

    async fn upsert_config(&self, config: &SchoolConfig) -> Result<(), GatewayError> {
        self.enter(GatewayOp::UpsertConfig, None).await?;
        self.lock().config = Some(config.clone());
        Ok(())
    }
}
