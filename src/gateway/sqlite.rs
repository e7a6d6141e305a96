//! SQLite-backed remote table store.
//!
//! One table per collection with the bookkeeping columns broken out and the
//! domain fields kept as a JSON payload.

use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite};

use super::{RemoteGateway, WirePatch};
use crate::errors::GatewayError;
use crate::models::{Collection, Record, SchoolConfig, CONFIG_ROW_ID};

/// Open the store's connection pool and run migrations.
pub async fn init_database(db_path: &Path) -> Result<SqlitePool, sqlx::Error> {
    // Ensure the parent directory exists
    if let Some(parent) = db_path.parent() {
        tokio::fs::create_dir_all(parent).await.ok();
    }

    let db_url = format!("sqlite:{}?mode=rwc", db_path.display());

    let options = SqliteConnectOptions::from_str(&db_url)?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
        .busy_timeout(std::time::Duration::from_secs(30));

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    run_migrations(&pool).await?;

    Ok(pool)
}

/// Create collection tables if they don't exist.
async fn run_migrations(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    for collection in Collection::ALL {
        let table = collection.table_name();
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                id TEXT PRIMARY KEY,
                session TEXT,
                is_deleted INTEGER NOT NULL DEFAULT 0,
                deleted_at TEXT,
                payload TEXT NOT NULL DEFAULT '{{}}',
                updated_at TEXT NOT NULL
            );
            "#
        ))
        .execute(pool)
        .await?;
    }

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS config (
            id TEXT PRIMARY KEY,
            payload TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Remote gateway over a SQLite database.
#[derive(Clone)]
pub struct SqliteGateway {
    pool: SqlitePool,
}

impl SqliteGateway {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (and migrate) the database at `db_path`.
    pub async fn open(db_path: &Path) -> Result<Self, GatewayError> {
        Ok(Self::new(init_database(db_path).await?))
    }

    async fn write(
        &self,
        collection: Collection,
        record: &Record,
        on_conflict: &str,
    ) -> Result<(), GatewayError> {
        let payload = serde_json::to_string(&record.fields)?;
        let now = Utc::now().to_rfc3339();

        sqlx::query(&format!(
            "INSERT INTO {} (id, session, is_deleted, deleted_at, payload, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?) {}",
            collection.table_name(),
            on_conflict
        ))
        .bind(&record.id)
        .bind(&record.session)
        .bind(record.is_deleted as i32)
        .bind(record.deleted_at.map(|at| at.to_rfc3339()))
        .bind(&payload)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl RemoteGateway for SqliteGateway {
    async fn fetch_all(&self, collection: Collection) -> Result<Vec<Record>, GatewayError> {
        let rows = sqlx::query(&format!(
            "SELECT id, session, is_deleted, deleted_at, payload FROM {} ORDER BY rowid",
            collection.table_name()
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(record_from_row).collect()
    }

    async fn insert(&self, collection: Collection, record: &Record) -> Result<(), GatewayError> {
        self.write(collection, record, "").await
    }

    async fn upsert(&self, collection: Collection, record: &Record) -> Result<(), GatewayError> {
        self.write(
            collection,
            record,
            "ON CONFLICT(id) DO UPDATE SET session = excluded.session, \
             is_deleted = excluded.is_deleted, deleted_at = excluded.deleted_at, \
             payload = excluded.payload, updated_at = excluded.updated_at",
        )
        .await
    }

    /// One UPDATE statement: bookkeeping columns are written directly and the
    /// payload is patched in place with `json_set`/`json_remove`, so
    /// concurrent updates touching different fields of a row all survive.
    async fn update_fields(
        &self,
        collection: Collection,
        id: &str,
        fields: &Map<String, Value>,
    ) -> Result<(), GatewayError> {
        let patch = WirePatch::parse(fields)?;

        let mut query: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("UPDATE {} SET updated_at = ", collection.table_name()));
        query.push_bind(Utc::now().to_rfc3339());
        if let Some(session) = patch.session {
            query.push(", session = ").push_bind(session);
        }
        if let Some(is_deleted) = patch.is_deleted {
            query.push(", is_deleted = ").push_bind(is_deleted as i32);
        }
        if let Some(deleted_at) = patch.deleted_at {
            query
                .push(", deleted_at = ")
                .push_bind(deleted_at.map(|at| at.to_rfc3339()));
        }
        if !patch.set.is_empty() || !patch.unset.is_empty() {
            query.push(", payload = ");
            if !patch.unset.is_empty() {
                query.push("json_remove(");
            }
            if patch.set.is_empty() {
                query.push("payload");
            } else {
                query.push("json_set(payload");
                for (key, value) in &patch.set {
                    query
                        .push(", ")
                        .push_bind(json_path(key)?)
                        .push(", json(")
                        .push_bind(serde_json::to_string(value)?)
                        .push(")");
                }
                query.push(")");
            }
            if !patch.unset.is_empty() {
                for key in &patch.unset {
                    query.push(", ").push_bind(json_path(key)?);
                }
                query.push(")");
            }
        }
        query.push(" WHERE id = ").push_bind(id.to_string());

        let result = query.build().execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            // Matches no rows, like an UPDATE with an unmatched filter.
            tracing::debug!(collection = %collection, id = %id, "update matched no rows");
        }
        Ok(())
    }

    async fn delete_by_ids(
        &self,
        collection: Collection,
        ids: &[String],
    ) -> Result<(), GatewayError> {
        let mut tx = self.pool.begin().await?;
        let sql = format!("DELETE FROM {} WHERE id = ?", collection.table_name());
        for id in ids {
            sqlx::query(&sql).bind(id).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn fetch_config(&self) -> Result<Option<SchoolConfig>, GatewayError> {
        let row = sqlx::query("SELECT payload FROM config WHERE id = ?")
            .bind(CONFIG_ROW_ID)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let payload: String = row.try_get("payload")?;
                Ok(Some(serde_json::from_str(&payload)?))
            }
            None => Ok(None),
        }
    }

    async fn upsert_config(&self, config: &SchoolConfig) -> Result<(), GatewayError> {
        let payload = serde_json::to_string(config)?;
        let now = Utc::now().to_rfc3339();

        sqlx::query(
            "INSERT INTO config (id, payload, updated_at) VALUES (?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET payload = excluded.payload, updated_at = excluded.updated_at",
        )
        .bind(CONFIG_ROW_ID)
        .bind(&payload)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

// Helper functions for row conversion

/// JSON path addressing one top-level payload key.
fn json_path(key: &str) -> Result<String, GatewayError> {
    if key.contains('"') || key.contains('\\') {
        return Err(GatewayError::new(format!("Unsupported field name: {}", key)));
    }
    Ok(format!("$.\"{}\"", key))
}

fn record_from_row(row: &SqliteRow) -> Result<Record, GatewayError> {
    let is_deleted: i32 = row.try_get("is_deleted")?;
    let deleted_at: Option<String> = row.try_get("deleted_at")?;
    let payload: String = row.try_get("payload")?;

    let deleted_at = deleted_at
        .map(|s| DateTime::parse_from_rfc3339(&s).map(|at| at.with_timezone(&Utc)))
        .transpose()
        .map_err(|e| GatewayError::new(format!("Malformed deleted_at value: {}", e)))?;
    let fields: Map<String, Value> = serde_json::from_str(&payload)?;

    Ok(Record {
        id: row.try_get("id")?,
        session: row.try_get("session")?,
        is_deleted: is_deleted != 0,
        deleted_at,
        fields,
    })
}
