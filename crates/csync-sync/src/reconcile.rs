use std::collections::HashMap;

use csync_core::{ChangeDetector, CollectionMethod, NormalizedItem, RawRecord};

use crate::index::ExistingIndex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    New,
    Update,
    Unchanged,
}

/// Classified records of one page. Unchanged items are only counted; they
/// never reach the store.
#[derive(Debug, Clone, Default)]
pub struct PageClassification {
    pub new: Vec<RawRecord>,
    pub updated: Vec<RawRecord>,
    pub unchanged: usize,
    pub duplicates: usize,
}

impl PageClassification {
    pub fn total(&self) -> usize {
        self.new.len() + self.updated.len() + self.unchanged + self.duplicates
    }
}

#[derive(Debug, Clone)]
pub struct ReconciliationEngine {
    supplier_id: String,
    collection_method: CollectionMethod,
    collection_source: String,
}

impl ReconciliationEngine {
    pub fn new(supplier_id: &str, collection_method: CollectionMethod, collection_source: &str) -> Self {
        Self {
            supplier_id: supplier_id.to_string(),
            collection_method,
            collection_source: collection_source.to_string(),
        }
    }

    pub fn classify(index: &ExistingIndex, supplier_product_id: &str, digest: &str) -> Classification {
        match index.get(supplier_product_id) {
            None => Classification::New,
            Some(existing) if existing == digest => Classification::Unchanged,
            Some(_) => Classification::Update,
        }
    }

    /// Classifies one page against the index. Repeated keys inside the page
    /// keep the last arrival and count the rest as duplicates.
    pub fn classify_page(&self, index: &ExistingIndex, items: Vec<NormalizedItem>) -> PageClassification {
        let mut out = PageClassification::default();

        let mut slots: Vec<Option<NormalizedItem>> = Vec::with_capacity(items.len());
        let mut positions: HashMap<String, usize> = HashMap::with_capacity(items.len());
        for item in items {
            if let Some(previous) = positions.insert(item.supplier_product_id.clone(), slots.len()) {
                slots[previous] = None;
                out.duplicates += 1;
            }
            slots.push(Some(item));
        }

        for item in slots.into_iter().flatten() {
            let digest = ChangeDetector::hash(&item.payload);
            match Self::classify(index, &item.supplier_product_id, &digest) {
                Classification::Unchanged => out.unchanged += 1,
                Classification::New => out.new.push(self.record(item, digest)),
                Classification::Update => out.updated.push(self.record(item, digest)),
            }
        }
        out
    }

    fn record(&self, item: NormalizedItem, digest: String) -> RawRecord {
        RawRecord::from_item(
            &self.supplier_id,
            item,
            digest,
            self.collection_method,
            &self.collection_source,
        )
    }
}
