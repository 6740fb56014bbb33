use async_trait::async_trait;
use csync_core::RawRecord;
use thiserror::Error;

/// Conflict target for the raw catalog's unique key.
pub const RAW_CATALOG_KEY: [&str; 2] = ["supplier_id", "supplier_product_id"];

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unique constraint violated: {0}")]
    UniqueViolation(String),
    #[error("invalid identifier `{0}`")]
    InvalidIdentifier(String),
    #[error("unsupported conflict target {0:?}")]
    UnsupportedConflictTarget(Vec<String>),
    #[error("corrupt row: {0}")]
    Decode(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

/// Equality filter over the raw catalog columns. Unset fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RowFilter {
    pub supplier_id: Option<String>,
    pub supplier_product_id: Option<String>,
    pub is_processed: Option<bool>,
}

impl RowFilter {
    pub fn supplier(supplier_id: &str) -> Self {
        Self {
            supplier_id: Some(supplier_id.to_string()),
            ..Self::default()
        }
    }

    pub fn key(supplier_id: &str, supplier_product_id: &str) -> Self {
        Self {
            supplier_id: Some(supplier_id.to_string()),
            supplier_product_id: Some(supplier_product_id.to_string()),
            is_processed: None,
        }
    }

    pub fn matches(&self, record: &RawRecord) -> bool {
        self.supplier_id
            .as_deref()
            .map_or(true, |v| v == record.supplier_id)
            && self
                .supplier_product_id
                .as_deref()
                .map_or(true, |v| v == record.supplier_product_id)
            && self.is_processed.map_or(true, |v| v == record.is_processed)
    }
}

/// Generic persistence contract for collected catalog rows.
///
/// `bulk_insert` is all-or-nothing per call: a single key collision fails the
/// whole batch. `bulk_upsert` overwrites rows that collide on
/// `conflict_keys`. `select` returns rows in a stable order so that
/// `limit`/`offset` paging visits every row exactly once.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn select(
        &self,
        table: &str,
        filter: &RowFilter,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<RawRecord>, StoreError>;

    async fn insert(&self, table: &str, row: &RawRecord) -> Result<(), StoreError> {
        self.bulk_insert(table, std::slice::from_ref(row)).await.map(|_| ())
    }

    async fn bulk_insert(&self, table: &str, rows: &[RawRecord]) -> Result<usize, StoreError>;

    async fn bulk_upsert(
        &self,
        table: &str,
        rows: &[RawRecord],
        conflict_keys: &[&str],
    ) -> Result<usize, StoreError>;

    async fn update(
        &self,
        table: &str,
        row: &RawRecord,
        filter: &RowFilter,
    ) -> Result<usize, StoreError>;
}

pub(crate) fn validate_identifier(ident: &str) -> Result<(), StoreError> {
    let mut chars = ident.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_lowercase() || c == '_');
    if valid_start && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_') {
        Ok(())
    } else {
        Err(StoreError::InvalidIdentifier(ident.to_string()))
    }
}

pub(crate) fn ensure_catalog_key(conflict_keys: &[&str]) -> Result<(), StoreError> {
    let mut sorted: Vec<&str> = conflict_keys.to_vec();
    sorted.sort_unstable();
    let mut expected = RAW_CATALOG_KEY.to_vec();
    expected.sort_unstable();
    if sorted == expected {
        Ok(())
    } else {
        Err(StoreError::UnsupportedConflictTarget(
            conflict_keys.iter().map(|k| k.to_string()).collect(),
        ))
    }
}
