use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use csync_core::RawRecord;
use tokio::sync::Mutex;

use crate::store::{ensure_catalog_key, validate_identifier, CatalogStore, RowFilter, StoreError};

type Key = (String, String);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOp {
    Insert,
    Upsert,
    Update,
}

/// One write call as seen by the store, for assertions in tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteCall {
    pub op: WriteOp,
    pub table: String,
    pub supplier_product_ids: Vec<String>,
    pub succeeded: bool,
}

#[derive(Debug, Default)]
struct State {
    tables: HashMap<String, BTreeMap<Key, RawRecord>>,
    writes: Vec<WriteCall>,
}

/// Store backed by ordered maps; used by tests and `memory://` dry runs.
#[derive(Debug, Default)]
pub struct InMemoryCatalogStore {
    state: Mutex<State>,
}

fn key_of(record: &RawRecord) -> Key {
    (record.supplier_id.clone(), record.supplier_product_id.clone())
}

fn ids_of(rows: &[RawRecord]) -> Vec<String> {
    rows.iter().map(|r| r.supplier_product_id.clone()).collect()
}

impl InMemoryCatalogStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds rows without recording a write call.
    pub async fn seed(&self, table: &str, rows: impl IntoIterator<Item = RawRecord>) {
        let mut state = self.state.lock().await;
        let entries = state.tables.entry(table.to_string()).or_default();
        for row in rows {
            entries.insert(key_of(&row), row);
        }
    }

    pub async fn len(&self, table: &str) -> usize {
        self.state
            .lock()
            .await
            .tables
            .get(table)
            .map_or(0, BTreeMap::len)
    }

    pub async fn get(&self, table: &str, supplier_id: &str, product_id: &str) -> Option<RawRecord> {
        let state = self.state.lock().await;
        state
            .tables
            .get(table)?
            .get(&(supplier_id.to_string(), product_id.to_string()))
            .cloned()
    }

    pub async fn writes(&self) -> Vec<WriteCall> {
        self.state.lock().await.writes.clone()
    }
}

#[async_trait]
impl CatalogStore for InMemoryCatalogStore {
    async fn select(
        &self,
        table: &str,
        filter: &RowFilter,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<RawRecord>, StoreError> {
        validate_identifier(table)?;
        let state = self.state.lock().await;
        let Some(rows) = state.tables.get(table) else {
            return Ok(Vec::new());
        };
        Ok(rows
            .values()
            .filter(|r| filter.matches(r))
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn bulk_insert(&self, table: &str, rows: &[RawRecord]) -> Result<usize, StoreError> {
        validate_identifier(table)?;
        let mut state = self.state.lock().await;
        let existing = state.tables.entry(table.to_string()).or_default();

        let mut seen: HashSet<Key> = HashSet::with_capacity(rows.len());
        let conflict = rows.iter().find_map(|row| {
            let key = key_of(row);
            if existing.contains_key(&key) || !seen.insert(key.clone()) {
                Some(format!("{}/{}", key.0, key.1))
            } else {
                None
            }
        });

        if let Some(conflict) = conflict {
            state.writes.push(WriteCall {
                op: WriteOp::Insert,
                table: table.to_string(),
                supplier_product_ids: ids_of(rows),
                succeeded: false,
            });
            return Err(StoreError::UniqueViolation(conflict));
        }

        for row in rows {
            existing.insert(key_of(row), row.clone());
        }
        state.writes.push(WriteCall {
            op: WriteOp::Insert,
            table: table.to_string(),
            supplier_product_ids: ids_of(rows),
            succeeded: true,
        });
        Ok(rows.len())
    }

    async fn bulk_upsert(
        &self,
        table: &str,
        rows: &[RawRecord],
        conflict_keys: &[&str],
    ) -> Result<usize, StoreError> {
        validate_identifier(table)?;
        ensure_catalog_key(conflict_keys)?;
        let mut state = self.state.lock().await;
        let existing = state.tables.entry(table.to_string()).or_default();
        for row in rows {
            existing.insert(key_of(row), row.clone());
        }
        state.writes.push(WriteCall {
            op: WriteOp::Upsert,
            table: table.to_string(),
            supplier_product_ids: ids_of(rows),
            succeeded: true,
        });
        Ok(rows.len())
    }

    async fn update(
        &self,
        table: &str,
        row: &RawRecord,
        filter: &RowFilter,
    ) -> Result<usize, StoreError> {
        validate_identifier(table)?;
        let mut state = self.state.lock().await;
        let existing = state.tables.entry(table.to_string()).or_default();
        let mut touched = 0;
        for stored in existing.values_mut().filter(|r| filter.matches(r)) {
            let supplier_id = stored.supplier_id.clone();
            let product_id = stored.supplier_product_id.clone();
            *stored = RawRecord {
                supplier_id,
                supplier_product_id: product_id,
                ..row.clone()
            };
            touched += 1;
        }
        state.writes.push(WriteCall {
            op: WriteOp::Update,
            table: table.to_string(),
            supplier_product_ids: vec![row.supplier_product_id.clone()],
            succeeded: true,
        });
        Ok(touched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use csync_core::{CollectionMethod, RAW_CATALOG_TABLE};
    use serde_json::json;

    fn record(id: &str, hash: &str) -> RawRecord {
        RawRecord {
            supplier_id: "sup".into(),
            supplier_product_id: id.into(),
            payload: json!({"id": id}),
            content_hash: hash.into(),
            collection_method: CollectionMethod::Api,
            collection_source: "test".into(),
            is_processed: false,
            metadata: json!({}),
            collected_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn bulk_insert_is_all_or_nothing() {
        let store = InMemoryCatalogStore::new();
        store.seed(RAW_CATALOG_TABLE, [record("b", "h0")]).await;

        let err = store
            .bulk_insert(RAW_CATALOG_TABLE, &[record("a", "h1"), record("b", "h2")])
            .await
            .unwrap_err();

        assert!(matches!(err, StoreError::UniqueViolation(ref k) if k == "sup/b"));
        assert_eq!(store.len(RAW_CATALOG_TABLE).await, 1);
        assert!(store.get(RAW_CATALOG_TABLE, "sup", "a").await.is_none());
    }

    #[tokio::test]
    async fn duplicate_keys_inside_one_insert_are_rejected() {
        let store = InMemoryCatalogStore::new();
        let err = store
            .bulk_insert(RAW_CATALOG_TABLE, &[record("a", "h1"), record("a", "h2")])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::UniqueViolation(_)));
        assert_eq!(store.len(RAW_CATALOG_TABLE).await, 0);
    }

    #[tokio::test]
    async fn upsert_overwrites_colliding_rows() {
        let store = InMemoryCatalogStore::new();
        store.seed(RAW_CATALOG_TABLE, [record("a", "old")]).await;

        let written = store
            .bulk_upsert(
                RAW_CATALOG_TABLE,
                &[record("a", "new"), record("c", "h3")],
                &["supplier_id", "supplier_product_id"],
            )
            .await
            .unwrap();

        assert_eq!(written, 2);
        let row = store.get(RAW_CATALOG_TABLE, "sup", "a").await.unwrap();
        assert_eq!(row.content_hash, "new");
    }

    #[tokio::test]
    async fn select_pages_in_key_order() {
        let store = InMemoryCatalogStore::new();
        store
            .seed(
                RAW_CATALOG_TABLE,
                ["c", "a", "d", "b"].map(|id| record(id, "h")),
            )
            .await;

        let filter = RowFilter::supplier("sup");
        let first = store.select(RAW_CATALOG_TABLE, &filter, 2, 0).await.unwrap();
        let second = store.select(RAW_CATALOG_TABLE, &filter, 2, 2).await.unwrap();
        let ids: Vec<_> = first
            .iter()
            .chain(second.iter())
            .map(|r| r.supplier_product_id.as_str())
            .collect();
        assert_eq!(ids, ["a", "b", "c", "d"]);

        let other = store
            .select(RAW_CATALOG_TABLE, &RowFilter::supplier("nobody"), 10, 0)
            .await
            .unwrap();
        assert!(other.is_empty());
    }

    #[tokio::test]
    async fn update_keeps_the_key_and_replaces_content() {
        let store = InMemoryCatalogStore::new();
        store.seed(RAW_CATALOG_TABLE, [record("a", "old")]).await;

        let touched = store
            .update(RAW_CATALOG_TABLE, &record("a", "fresh"), &RowFilter::key("sup", "a"))
            .await
            .unwrap();

        assert_eq!(touched, 1);
        assert_eq!(
            store.get(RAW_CATALOG_TABLE, "sup", "a").await.unwrap().content_hash,
            "fresh"
        );
        assert_eq!(store.writes().await.last().map(|w| w.op), Some(WriteOp::Update));
    }
}
