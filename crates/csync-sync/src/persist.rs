use std::collections::HashSet;
use std::sync::Arc;

use csync_core::RawRecord;
use csync_storage::{CatalogStore, RAW_CATALOG_KEY};
use tracing::{debug, error, warn};

pub const DEFAULT_CHUNK_SIZE: usize = 5000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistMode {
    Insert,
    Upsert,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushOutcome {
    pub chunks: usize,
    pub written: usize,
    /// Chunks that failed their first attempt and were retried as upserts.
    pub fallbacks: usize,
    pub failed_chunks: usize,
    pub failed_records: usize,
    pub failed_keys: HashSet<String>,
}

impl FlushOutcome {
    pub fn merge(&mut self, other: FlushOutcome) {
        self.chunks += other.chunks;
        self.written += other.written;
        self.fallbacks += other.fallbacks;
        self.failed_chunks += other.failed_chunks;
        self.failed_records += other.failed_records;
        self.failed_keys.extend(other.failed_keys);
    }
}

/// Writes classified records in fixed-size chunks. A chunk that fails gets
/// one upsert retry; a chunk that fails that too is counted and skipped.
/// Store failures never propagate out of `flush`.
#[derive(Clone)]
pub struct BatchPersister {
    store: Arc<dyn CatalogStore>,
    table: String,
}

impl BatchPersister {
    pub fn new(store: Arc<dyn CatalogStore>, table: &str) -> Self {
        Self {
            store,
            table: table.to_string(),
        }
    }

    pub async fn flush(&self, records: &[RawRecord], mode: PersistMode, chunk_size: usize) -> FlushOutcome {
        let mut outcome = FlushOutcome::default();
        for (idx, chunk) in records.chunks(chunk_size.max(1)).enumerate() {
            outcome.chunks += 1;
            let first = match mode {
                PersistMode::Insert => self.store.bulk_insert(&self.table, chunk).await,
                PersistMode::Upsert => {
                    self.store
                        .bulk_upsert(&self.table, chunk, &RAW_CATALOG_KEY)
                        .await
                }
            };
            let err = match first {
                Ok(written) => {
                    debug!(chunk = idx, rows = written, ?mode, "chunk persisted");
                    outcome.written += written;
                    continue;
                }
                Err(err) => err,
            };

            warn!(chunk = idx, rows = chunk.len(), ?mode, error = %err, "chunk failed; retrying as upsert");
            outcome.fallbacks += 1;
            match self
                .store
                .bulk_upsert(&self.table, chunk, &RAW_CATALOG_KEY)
                .await
            {
                Ok(written) => outcome.written += written,
                Err(retry_err) => {
                    error!(chunk = idx, rows = chunk.len(), error = %retry_err, "chunk dropped after upsert retry");
                    outcome.failed_chunks += 1;
                    outcome.failed_records += chunk.len();
                    outcome
                        .failed_keys
                        .extend(chunk.iter().map(|r| r.supplier_product_id.clone()));
                }
            }
        }
        outcome
    }
}
