//! PostgreSQL backend for the raw catalog.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use csync_core::{CollectionMethod, RawRecord};
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{Postgres, QueryBuilder, Row};
use tracing::debug;

use crate::store::{ensure_catalog_key, validate_identifier, CatalogStore, RowFilter, StoreError};

const COLUMNS: &str = "supplier_id, supplier_product_id, payload, content_hash, \
     collection_method, collection_source, is_processed, metadata, collected_at";
const COLUMN_COUNT: usize = 9;
// Postgres caps bind parameters per statement at u16::MAX.
const MAX_ROWS_PER_STATEMENT: usize = u16::MAX as usize / COLUMN_COUNT;

#[derive(Debug, Clone)]
pub struct PgCatalogStore {
    pool: PgPool,
}

impl PgCatalogStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    async fn write_rows(
        &self,
        table: &str,
        rows: &[RawRecord],
        on_conflict: Option<&str>,
    ) -> Result<usize, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;
        let mut written = 0usize;
        for part in rows.chunks(MAX_ROWS_PER_STATEMENT) {
            let mut qb: QueryBuilder<Postgres> =
                QueryBuilder::new(format!("INSERT INTO {table} ({COLUMNS}) "));
            qb.push_values(part, |mut b, row| {
                b.push_bind(&row.supplier_id)
                    .push_bind(&row.supplier_product_id)
                    .push_bind(Json(&row.payload))
                    .push_bind(&row.content_hash)
                    .push_bind(row.collection_method.as_str())
                    .push_bind(&row.collection_source)
                    .push_bind(row.is_processed)
                    .push_bind(Json(&row.metadata))
                    .push_bind(row.collected_at);
            });
            if let Some(clause) = on_conflict {
                qb.push(clause);
            }
            let result = qb.build().execute(&mut *tx).await.map_err(map_db_error)?;
            written += result.rows_affected() as usize;
        }
        tx.commit().await?;
        debug!(table, rows = written, "rows written");
        Ok(written)
    }
}

fn map_db_error(err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            StoreError::UniqueViolation(db.message().to_string())
        }
        _ => StoreError::Database(err),
    }
}

fn push_filter<'a>(qb: &mut QueryBuilder<'a, Postgres>, filter: &'a RowFilter) {
    qb.push(" WHERE TRUE");
    if let Some(supplier_id) = &filter.supplier_id {
        qb.push(" AND supplier_id = ").push_bind(supplier_id);
    }
    if let Some(product_id) = &filter.supplier_product_id {
        qb.push(" AND supplier_product_id = ").push_bind(product_id);
    }
    if let Some(processed) = filter.is_processed {
        qb.push(" AND is_processed = ").push_bind(processed);
    }
}

fn decode_row(row: &PgRow) -> Result<RawRecord, StoreError> {
    let method: String = row.try_get("collection_method")?;
    let collection_method = CollectionMethod::parse(&method)
        .ok_or_else(|| StoreError::Decode(format!("unknown collection_method `{method}`")))?;
    let Json(payload): Json<JsonValue> = row.try_get("payload")?;
    let Json(metadata): Json<JsonValue> = row.try_get("metadata")?;
    let collected_at: DateTime<Utc> = row.try_get("collected_at")?;
    Ok(RawRecord {
        supplier_id: row.try_get("supplier_id")?,
        supplier_product_id: row.try_get("supplier_product_id")?,
        payload,
        content_hash: row.try_get("content_hash")?,
        collection_method,
        collection_source: row.try_get("collection_source")?,
        is_processed: row.try_get("is_processed")?,
        metadata,
        collected_at,
    })
}

#[async_trait]
impl CatalogStore for PgCatalogStore {
    async fn select(
        &self,
        table: &str,
        filter: &RowFilter,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<RawRecord>, StoreError> {
        validate_identifier(table)?;
        let mut qb: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("SELECT {COLUMNS} FROM {table}"));
        push_filter(&mut qb, filter);
        qb.push(" ORDER BY supplier_id, supplier_product_id LIMIT ")
            .push_bind(limit as i64)
            .push(" OFFSET ")
            .push_bind(offset as i64);
        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(decode_row).collect()
    }

    async fn bulk_insert(&self, table: &str, rows: &[RawRecord]) -> Result<usize, StoreError> {
        validate_identifier(table)?;
        self.write_rows(table, rows, None).await
    }

    async fn bulk_upsert(
        &self,
        table: &str,
        rows: &[RawRecord],
        conflict_keys: &[&str],
    ) -> Result<usize, StoreError> {
        validate_identifier(table)?;
        ensure_catalog_key(conflict_keys)?;
        let clause = format!(
            " ON CONFLICT ({}) DO UPDATE SET \
             payload = EXCLUDED.payload, \
             content_hash = EXCLUDED.content_hash, \
             collection_method = EXCLUDED.collection_method, \
             collection_source = EXCLUDED.collection_source, \
             is_processed = EXCLUDED.is_processed, \
             metadata = EXCLUDED.metadata, \
             collected_at = EXCLUDED.collected_at, \
             updated_at = now()",
            conflict_keys.join(", ")
        );
        self.write_rows(table, rows, Some(&clause)).await
    }

    async fn update(
        &self,
        table: &str,
        row: &RawRecord,
        filter: &RowFilter,
    ) -> Result<usize, StoreError> {
        validate_identifier(table)?;
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(format!("UPDATE {table} SET "));
        let mut set = qb.separated(", ");
        set.push("payload = ").push_bind_unseparated(Json(&row.payload));
        set.push("content_hash = ").push_bind_unseparated(&row.content_hash);
        set.push("collection_method = ")
            .push_bind_unseparated(row.collection_method.as_str());
        set.push("collection_source = ")
            .push_bind_unseparated(&row.collection_source);
        set.push("is_processed = ").push_bind_unseparated(row.is_processed);
        set.push("metadata = ").push_bind_unseparated(Json(&row.metadata));
        set.push("collected_at = ").push_bind_unseparated(row.collected_at);
        set.push("updated_at = now()");
        push_filter(&mut qb, filter);
        let result = qb.build().execute(&self.pool).await.map_err(map_db_error)?;
        Ok(result.rows_affected() as usize)
    }
}
