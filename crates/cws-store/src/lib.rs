//! Destination store for CWS: idempotent batch upsert into the canonical
//! tables plus the integration / sync-log / watermark bookkeeping stores.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cws_core::{
    Integration, RunStatus, SyncError, SyncLogEntry, SyncWatermark, WatermarkStatus,
};
use cws_warehouse::BackoffPolicy;
use serde::Serialize;
use serde_json::{json, Map, Value};
use sqlx::{PgPool, Row};
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

pub const CRATE_NAME: &str = "cws-store";

pub const ORDERS_TABLE: &str = "canonical_orders";
pub const ORDER_ITEMS_TABLE: &str = "canonical_order_items";
pub const SETTLEMENTS_TABLE: &str = "canonical_settlements";
pub const PRODUCTS_TABLE: &str = "canonical_products";
pub const CUSTOMERS_TABLE: &str = "canonical_customers";

pub const ORDERS_KEY: &[&str] = &["tenant_id", "integration_id", "external_order_id"];
pub const ORDER_ITEMS_KEY: &[&str] = &["tenant_id", "external_order_id", "item_id"];
pub const SETTLEMENTS_KEY: &[&str] = &["tenant_id", "integration_id", "external_settlement_id"];
pub const PRODUCTS_KEY: &[&str] = &["tenant_id", "integration_id", "external_product_id"];
pub const CUSTOMERS_KEY: &[&str] = &["tenant_id", "external_customer_id"];

/// Flatten a canonical record into a column map for the generic upsert.
pub fn record_row<T: Serialize>(record: &T) -> Map<String, Value> {
    match serde_json::to_value(record) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    }
}

/// Merge-on-conflict writer. Implementations must be replay-idempotent:
/// upserting an identical batch any number of times converges to the same
/// stored state.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn upsert_batch(
        &self,
        table: &str,
        conflict_cols: &[&str],
        rows: &[Map<String, Value>],
    ) -> Result<u64, SyncError>;
}

#[derive(Debug, Clone)]
pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', ""))
}

#[async_trait]
impl RecordStore for PgRecordStore {
    /// One statement per batch: the rows travel as a single jsonb array and
    /// `jsonb_populate_recordset` coerces each field to the table's column
    /// types, so timestamps and numerics bind without per-column type plumbing.
    async fn upsert_batch(
        &self,
        table: &str,
        conflict_cols: &[&str],
        rows: &[Map<String, Value>],
    ) -> Result<u64, SyncError> {
        let Some(first) = rows.first() else {
            return Ok(0);
        };

        let columns: Vec<&str> = first.keys().map(String::as_str).collect();
        for key in conflict_cols {
            if !columns.contains(key) {
                return Err(SyncError::Load {
                    table: table.to_string(),
                    message: format!("conflict column {key} missing from record shape"),
                });
            }
        }

        let quoted_table = quote_ident(table);
        let column_list = columns
            .iter()
            .map(|col| quote_ident(col))
            .collect::<Vec<_>>()
            .join(", ");
        let key_list = conflict_cols
            .iter()
            .map(|col| quote_ident(col))
            .collect::<Vec<_>>()
            .join(", ");
        let updates: Vec<String> = columns
            .iter()
            .filter(|col| !conflict_cols.contains(col))
            .map(|col| format!("{0} = EXCLUDED.{0}", quote_ident(col)))
            .collect();
        let conflict_action = if updates.is_empty() {
            "DO NOTHING".to_string()
        } else {
            format!("DO UPDATE SET {}", updates.join(", "))
        };

        let sql = format!(
            "INSERT INTO {quoted_table} ({column_list}) \
             SELECT {column_list} FROM jsonb_populate_recordset(NULL::{quoted_table}, $1) \
             ON CONFLICT ({key_list}) {conflict_action}"
        );

        let payload = Value::Array(rows.iter().cloned().map(Value::Object).collect());
        let result = sqlx::query(&sql)
            .bind(payload)
            .execute(&self.pool)
            .await
            .map_err(|err| SyncError::Load {
                table: table.to_string(),
                message: err.to_string(),
            })?;
        Ok(result.rows_affected())
    }
}

/// In-memory record store keyed by the conflict columns. Backs the tests and
/// mirrors the idempotence contract of the Postgres implementation.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<BTreeMap<String, BTreeMap<String, Map<String, Value>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn natural_key(conflict_cols: &[&str], row: &Map<String, Value>) -> String {
        conflict_cols
            .iter()
            .map(|col| row.get(*col).map(Value::to_string).unwrap_or_default())
            .collect::<Vec<_>>()
            .join("\u{1f}")
    }

    pub async fn rows_in(&self, table: &str) -> Vec<Map<String, Value>> {
        let tables = self.tables.lock().await;
        tables
            .get(table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn len(&self, table: &str) -> usize {
        let tables = self.tables.lock().await;
        tables.get(table).map(BTreeMap::len).unwrap_or(0)
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn upsert_batch(
        &self,
        table: &str,
        conflict_cols: &[&str],
        rows: &[Map<String, Value>],
    ) -> Result<u64, SyncError> {
        let mut tables = self.tables.lock().await;
        let stored = tables.entry(table.to_string()).or_default();
        for row in rows {
            stored.insert(Self::natural_key(conflict_cols, row), row.clone());
        }
        Ok(rows.len() as u64)
    }
}

/// Aggregated result of one load call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadOutcome {
    pub succeeded: u64,
    pub failed: u64,
}

/// Partitions records into fixed-size batches and upserts each with bounded
/// retry. An exhausted batch is counted failed and the loader moves on; a
/// single bad batch never aborts the run.
pub struct BatchLoader {
    store: std::sync::Arc<dyn RecordStore>,
    batch_size: usize,
    backoff: BackoffPolicy,
}

impl BatchLoader {
    pub const DEFAULT_BATCH_SIZE: usize = 100;

    pub fn new(store: std::sync::Arc<dyn RecordStore>) -> Self {
        Self {
            store,
            batch_size: Self::DEFAULT_BATCH_SIZE,
            backoff: BackoffPolicy::default(),
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub async fn load(
        &self,
        table: &str,
        conflict_cols: &[&str],
        rows: Vec<Map<String, Value>>,
    ) -> LoadOutcome {
        let mut outcome = LoadOutcome::default();
        for batch in rows.chunks(self.batch_size) {
            match self.upsert_with_retry(table, conflict_cols, batch).await {
                Ok(()) => outcome.succeeded += batch.len() as u64,
                Err(err) => {
                    warn!(table, batch_len = batch.len(), %err, "batch exhausted retries");
                    outcome.failed += batch.len() as u64;
                }
            }
        }
        outcome
    }

    async fn upsert_with_retry(
        &self,
        table: &str,
        conflict_cols: &[&str],
        batch: &[Map<String, Value>],
    ) -> Result<(), SyncError> {
        let mut last_err = None;
        for attempt in 0..=self.backoff.max_retries {
            match self.store.upsert_batch(table, conflict_cols, batch).await {
                Ok(_) => return Ok(()),
                Err(err) => {
                    if attempt < self.backoff.max_retries {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                    }
                    last_err = Some(err);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| SyncError::Load {
            table: table.to_string(),
            message: "retries exhausted".to_string(),
        }))
    }
}

fn run_status_str(status: RunStatus) -> &'static str {
    match status {
        RunStatus::Running => "running",
        RunStatus::Completed => "completed",
        RunStatus::Partial => "partial",
        RunStatus::Failed => "failed",
    }
}

fn watermark_status_str(status: WatermarkStatus) -> &'static str {
    match status {
        WatermarkStatus::Syncing => "syncing",
        WatermarkStatus::Completed => "completed",
        WatermarkStatus::Failed => "failed",
    }
}

/// Run-level bookkeeping: integration resolution, audit log, watermarks.
#[async_trait]
pub trait SyncStateStore: Send + Sync {
    async fn ensure_integration(
        &self,
        tenant_id: &str,
        integration_id: Option<Uuid>,
        connector_type: &str,
    ) -> Result<Integration, SyncError>;

    async fn open_sync_log(&self, entry: &SyncLogEntry) -> Result<(), SyncError>;

    async fn finalize_sync_log(
        &self,
        id: Uuid,
        status: RunStatus,
        completed_at: DateTime<Utc>,
        records_fetched: i64,
        records_created: i64,
        records_failed: i64,
        sync_metadata: Value,
    ) -> Result<(), SyncError>;

    async fn record_watermark(&self, watermark: &SyncWatermark) -> Result<(), SyncError>;

    async fn touch_integration(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), SyncError>;
}

fn state_err(err: sqlx::Error) -> SyncError {
    SyncError::State(err.to_string())
}

#[derive(Debug, Clone)]
pub struct PgStateStore {
    pool: PgPool,
}

impl PgStateStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn migrator() -> sqlx::migrate::Migrator {
        sqlx::migrate!("./migrations")
    }

    fn integration_from_row(row: &sqlx::postgres::PgRow) -> Result<Integration, SyncError> {
        Ok(Integration {
            id: row.try_get("id").map_err(state_err)?,
            tenant_id: row.try_get("tenant_id").map_err(state_err)?,
            connector_type: row.try_get("connector_type").map_err(state_err)?,
            status: row.try_get("status").map_err(state_err)?,
            settings: row.try_get("settings").map_err(state_err)?,
            last_sync_at: row.try_get("last_sync_at").map_err(state_err)?,
        })
    }
}

const INTEGRATION_COLUMNS: &str =
    "id, tenant_id, connector_type, status, settings, last_sync_at";

#[async_trait]
impl SyncStateStore for PgStateStore {
    async fn ensure_integration(
        &self,
        tenant_id: &str,
        integration_id: Option<Uuid>,
        connector_type: &str,
    ) -> Result<Integration, SyncError> {
        if let Some(id) = integration_id {
            let sql =
                format!("SELECT {INTEGRATION_COLUMNS} FROM integrations WHERE id = $1 AND tenant_id = $2");
            if let Some(row) = sqlx::query(&sql)
                .bind(id)
                .bind(tenant_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(state_err)?
            {
                return Self::integration_from_row(&row);
            }
        }

        let sql = format!(
            "SELECT {INTEGRATION_COLUMNS} FROM integrations \
             WHERE tenant_id = $1 AND connector_type = $2"
        );
        if let Some(row) = sqlx::query(&sql)
            .bind(tenant_id)
            .bind(connector_type)
            .fetch_optional(&self.pool)
            .await
            .map_err(state_err)?
        {
            return Self::integration_from_row(&row);
        }

        let integration = Integration {
            id: integration_id.unwrap_or_else(Uuid::new_v4),
            tenant_id: tenant_id.to_string(),
            connector_type: connector_type.to_string(),
            status: "active".to_string(),
            settings: json!({}),
            last_sync_at: None,
        };
        sqlx::query(
            "INSERT INTO integrations (id, tenant_id, connector_type, status, settings) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (tenant_id, connector_type) DO NOTHING",
        )
        .bind(integration.id)
        .bind(&integration.tenant_id)
        .bind(&integration.connector_type)
        .bind(&integration.status)
        .bind(&integration.settings)
        .execute(&self.pool)
        .await
        .map_err(state_err)?;
        Ok(integration)
    }

    async fn open_sync_log(&self, entry: &SyncLogEntry) -> Result<(), SyncError> {
        sqlx::query(
            "INSERT INTO sync_logs \
             (id, tenant_id, status, started_at, records_fetched, records_created, \
              records_failed, sync_metadata) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(entry.id)
        .bind(&entry.tenant_id)
        .bind(run_status_str(entry.status))
        .bind(entry.started_at)
        .bind(entry.records_fetched)
        .bind(entry.records_created)
        .bind(entry.records_failed)
        .bind(&entry.sync_metadata)
        .execute(&self.pool)
        .await
        .map_err(state_err)?;
        Ok(())
    }

    async fn finalize_sync_log(
        &self,
        id: Uuid,
        status: RunStatus,
        completed_at: DateTime<Utc>,
        records_fetched: i64,
        records_created: i64,
        records_failed: i64,
        sync_metadata: Value,
    ) -> Result<(), SyncError> {
        // Only a running entry may be finalized; a finalized log is immutable.
        sqlx::query(
            "UPDATE sync_logs \
             SET status = $2, completed_at = $3, records_fetched = $4, \
                 records_created = $5, records_failed = $6, sync_metadata = $7 \
             WHERE id = $1 AND status = 'running'",
        )
        .bind(id)
        .bind(run_status_str(status))
        .bind(completed_at)
        .bind(records_fetched)
        .bind(records_created)
        .bind(records_failed)
        .bind(sync_metadata)
        .execute(&self.pool)
        .await
        .map_err(state_err)?;
        Ok(())
    }

    async fn record_watermark(&self, watermark: &SyncWatermark) -> Result<(), SyncError> {
        // Monotonic: only a completed attempt advances last_sync_at and the
        // running total; a failed attempt records status + message only.
        sqlx::query(
            "INSERT INTO sync_watermarks \
             (tenant_id, data_model, sync_status, last_sync_at, total_records_synced, error_message) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             ON CONFLICT (tenant_id, data_model) DO UPDATE SET \
                 sync_status = EXCLUDED.sync_status, \
                 error_message = EXCLUDED.error_message, \
                 last_sync_at = CASE WHEN EXCLUDED.sync_status = 'completed' \
                     THEN EXCLUDED.last_sync_at ELSE sync_watermarks.last_sync_at END, \
                 total_records_synced = CASE WHEN EXCLUDED.sync_status = 'completed' \
                     THEN sync_watermarks.total_records_synced + EXCLUDED.total_records_synced \
                     ELSE sync_watermarks.total_records_synced END",
        )
        .bind(&watermark.tenant_id)
        .bind(&watermark.data_model)
        .bind(watermark_status_str(watermark.sync_status))
        .bind(watermark.last_sync_at)
        .bind(watermark.total_records_synced)
        .bind(&watermark.error_message)
        .execute(&self.pool)
        .await
        .map_err(state_err)?;
        Ok(())
    }

    async fn touch_integration(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), SyncError> {
        sqlx::query("UPDATE integrations SET last_sync_at = $2 WHERE id = $1")
            .bind(id)
            .bind(at)
            .execute(&self.pool)
            .await
            .map_err(state_err)?;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    integrations: Vec<Integration>,
    logs: HashMap<Uuid, SyncLogEntry>,
    watermarks: BTreeMap<(String, String), SyncWatermark>,
}

/// In-memory state store mirroring the Postgres semantics, including
/// watermark monotonicity and finalize-once logs.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    inner: Mutex<MemoryState>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn sync_log(&self, id: Uuid) -> Option<SyncLogEntry> {
        self.inner.lock().await.logs.get(&id).cloned()
    }

    pub async fn latest_log(&self) -> Option<SyncLogEntry> {
        let inner = self.inner.lock().await;
        inner
            .logs
            .values()
            .max_by_key(|entry| entry.started_at)
            .cloned()
    }

    pub async fn watermark(&self, tenant_id: &str, data_model: &str) -> Option<SyncWatermark> {
        let inner = self.inner.lock().await;
        inner
            .watermarks
            .get(&(tenant_id.to_string(), data_model.to_string()))
            .cloned()
    }

    pub async fn integration(&self, tenant_id: &str) -> Option<Integration> {
        let inner = self.inner.lock().await;
        inner
            .integrations
            .iter()
            .find(|integration| integration.tenant_id == tenant_id)
            .cloned()
    }
}

#[async_trait]
impl SyncStateStore for MemoryStateStore {
    async fn ensure_integration(
        &self,
        tenant_id: &str,
        integration_id: Option<Uuid>,
        connector_type: &str,
    ) -> Result<Integration, SyncError> {
        let mut inner = self.inner.lock().await;
        if let Some(existing) = inner.integrations.iter().find(|integration| {
            integration.tenant_id == tenant_id
                && (Some(integration.id) == integration_id
                    || integration.connector_type == connector_type)
        }) {
            return Ok(existing.clone());
        }
        let integration = Integration {
            id: integration_id.unwrap_or_else(Uuid::new_v4),
            tenant_id: tenant_id.to_string(),
            connector_type: connector_type.to_string(),
            status: "active".to_string(),
            settings: json!({}),
            last_sync_at: None,
        };
        inner.integrations.push(integration.clone());
        Ok(integration)
    }

    async fn open_sync_log(&self, entry: &SyncLogEntry) -> Result<(), SyncError> {
        let mut inner = self.inner.lock().await;
        inner.logs.insert(entry.id, entry.clone());
        Ok(())
    }

    async fn finalize_sync_log(
        &self,
        id: Uuid,
        status: RunStatus,
        completed_at: DateTime<Utc>,
        records_fetched: i64,
        records_created: i64,
        records_failed: i64,
        sync_metadata: Value,
    ) -> Result<(), SyncError> {
        let mut inner = self.inner.lock().await;
        if let Some(entry) = inner.logs.get_mut(&id) {
            if entry.status != RunStatus::Running {
                return Ok(());
            }
            entry.status = status;
            entry.completed_at = Some(completed_at);
            entry.records_fetched = records_fetched;
            entry.records_created = records_created;
            entry.records_failed = records_failed;
            entry.sync_metadata = sync_metadata;
        }
        Ok(())
    }

    async fn record_watermark(&self, watermark: &SyncWatermark) -> Result<(), SyncError> {
        let mut inner = self.inner.lock().await;
        let key = (watermark.tenant_id.clone(), watermark.data_model.clone());
        match inner.watermarks.get_mut(&key) {
            Some(existing) => {
                existing.sync_status = watermark.sync_status;
                existing.error_message = watermark.error_message.clone();
                if watermark.sync_status == WatermarkStatus::Completed {
                    existing.last_sync_at = watermark.last_sync_at;
                    existing.total_records_synced += watermark.total_records_synced;
                }
            }
            None => {
                inner.watermarks.insert(key, watermark.clone());
            }
        }
        Ok(())
    }

    async fn touch_integration(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), SyncError> {
        let mut inner = self.inner.lock().await;
        if let Some(integration) = inner
            .integrations
            .iter_mut()
            .find(|integration| integration.id == id)
        {
            integration.last_sync_at = Some(at);
        }
        Ok(())
    }
}
