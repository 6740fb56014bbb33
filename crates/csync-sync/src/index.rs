use std::collections::HashMap;

use csync_storage::{CatalogStore, RowFilter, StoreError};
use tracing::debug;

pub const SNAPSHOT_PAGE_SIZE: usize = 10_000;

/// `supplier_product_id -> content_hash` for everything one supplier already
/// has in the store. Built once before classification starts.
#[derive(Debug, Clone, Default)]
pub struct ExistingIndex {
    supplier_id: String,
    digests: HashMap<String, String>,
}

impl ExistingIndex {
    pub fn empty(supplier_id: &str) -> Self {
        Self {
            supplier_id: supplier_id.to_string(),
            digests: HashMap::new(),
        }
    }

    pub async fn load(
        store: &dyn CatalogStore,
        table: &str,
        supplier_id: &str,
    ) -> Result<Self, StoreError> {
        Self::load_with_page_size(store, table, supplier_id, SNAPSHOT_PAGE_SIZE).await
    }

    pub async fn load_with_page_size(
        store: &dyn CatalogStore,
        table: &str,
        supplier_id: &str,
        page_size: usize,
    ) -> Result<Self, StoreError> {
        let page_size = page_size.max(1);
        let filter = RowFilter::supplier(supplier_id);
        let mut index = Self::empty(supplier_id);
        let mut offset = 0;
        loop {
            let rows = store.select(table, &filter, page_size, offset).await?;
            let fetched = rows.len();
            for row in rows {
                index.digests.insert(row.supplier_product_id, row.content_hash);
            }
            debug!(supplier_id, offset, fetched, "index snapshot page");
            if fetched < page_size {
                break;
            }
            offset += fetched;
        }
        Ok(index)
    }

    pub fn supplier_id(&self) -> &str {
        &self.supplier_id
    }

    pub fn get(&self, supplier_product_id: &str) -> Option<&str> {
        self.digests.get(supplier_product_id).map(String::as_str)
    }

    pub fn record(&mut self, supplier_product_id: String, content_hash: String) {
        self.digests.insert(supplier_product_id, content_hash);
    }

    pub fn len(&self) -> usize {
        self.digests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.digests.is_empty()
    }
}
