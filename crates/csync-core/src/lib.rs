//! Core catalog model shared by every csync crate.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use uuid::Uuid;

pub mod change;

pub use change::ChangeDetector;

pub const CRATE_NAME: &str = "csync-core";

/// Destination table for everything this pipeline collects.
pub const RAW_CATALOG_TABLE: &str = "raw_catalog";

/// How a record reached us.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectionMethod {
    Api,
    Excel,
    WebCrawling,
}

impl CollectionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            CollectionMethod::Api => "api",
            CollectionMethod::Excel => "excel",
            CollectionMethod::WebCrawling => "web_crawling",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "api" => Some(CollectionMethod::Api),
            "excel" => Some(CollectionMethod::Excel),
            "web_crawling" => Some(CollectionMethod::WebCrawling),
            _ => None,
        }
    }
}

impl fmt::Display for CollectionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Handoff contract from adapters into the sync pipeline.
///
/// `payload` carries only supplier content; collection-time facts such as the
/// account name or fetch timestamp belong in `metadata` so they never move
/// the content hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedItem {
    pub supplier_product_id: String,
    pub payload: Map<String, JsonValue>,
    #[serde(default)]
    pub metadata: Map<String, JsonValue>,
    pub collected_at: DateTime<Utc>,
}

impl NormalizedItem {
    pub fn new(supplier_product_id: impl Into<String>, payload: Map<String, JsonValue>) -> Self {
        Self {
            supplier_product_id: supplier_product_id.into(),
            payload,
            metadata: Map::new(),
            collected_at: Utc::now(),
        }
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<JsonValue>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    pub fn with_metadata_map(mut self, metadata: Map<String, JsonValue>) -> Self {
        self.metadata.extend(metadata);
        self
    }

    pub fn content_hash(&self) -> String {
        ChangeDetector::hash(&self.payload)
    }
}

/// Persisted row of the `raw_catalog` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub supplier_id: String,
    pub supplier_product_id: String,
    pub payload: JsonValue,
    pub content_hash: String,
    pub collection_method: CollectionMethod,
    pub collection_source: String,
    pub is_processed: bool,
    pub metadata: JsonValue,
    pub collected_at: DateTime<Utc>,
}

impl RawRecord {
    /// Builds the row for a freshly fetched item whose digest is already known.
    pub fn from_item(
        supplier_id: &str,
        item: NormalizedItem,
        content_hash: String,
        collection_method: CollectionMethod,
        collection_source: &str,
    ) -> Self {
        Self {
            supplier_id: supplier_id.to_string(),
            supplier_product_id: item.supplier_product_id,
            payload: JsonValue::Object(item.payload),
            content_hash,
            collection_method,
            collection_source: collection_source.to_string(),
            is_processed: false,
            metadata: JsonValue::Object(item.metadata),
            collected_at: item.collected_at,
        }
    }

    pub fn key(&self) -> (&str, &str) {
        (&self.supplier_id, &self.supplier_product_id)
    }
}

/// Secrets handed out by the credential provider for one supplier account.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Credentials {
    ApiKey { key: String, version: String },
    Signed { id: String, secret: String },
    Login { username: String, password: String },
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::ApiKey { version, .. } => f
                .debug_struct("ApiKey")
                .field("key", &"<redacted>")
                .field("version", version)
                .finish(),
            Credentials::Signed { id, .. } => f
                .debug_struct("Signed")
                .field("id", id)
                .field("secret", &"<redacted>")
                .finish(),
            Credentials::Login { username, .. } => f
                .debug_struct("Login")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Error,
}

/// Why a supplier run stopped fetching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Exhausted,
    TargetReached,
    SafetyLimit,
    Cancelled,
    Aborted,
}

/// Outcome of one supplier run; emitted as JSON by the CLI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub supplier_id: String,
    pub status: RunStatus,
    pub stop_reason: StopReason,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub pages: usize,
    pub total_fetched: usize,
    pub skipped_upstream: usize,
    pub duplicates: usize,
    pub new: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub failed_chunks: usize,
    pub failed_records: usize,
    pub error: Option<String>,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Success
    }

    /// Every fetched item lands in exactly one bucket.
    pub fn is_balanced(&self) -> bool {
        self.new + self.updated + self.unchanged + self.duplicates == self.total_fetched
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn credentials_debug_hides_secrets() {
        let creds = Credentials::Signed {
            id: "shop-7".into(),
            secret: "hunter2".into(),
        };
        let rendered = format!("{creds:?}");
        assert!(rendered.contains("shop-7"));
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn raw_record_keeps_metadata_out_of_payload() {
        let mut payload = Map::new();
        payload.insert("name".into(), json!("Desk lamp"));
        let item = NormalizedItem::new("A-1", payload).with_metadata("account_name", "main");
        let hash = item.content_hash();
        let record = RawRecord::from_item("sup-1", item, hash.clone(), CollectionMethod::Api, "test");

        assert_eq!(record.key(), ("sup-1", "A-1"));
        assert_eq!(record.content_hash, hash);
        assert_eq!(record.payload, json!({"name": "Desk lamp"}));
        assert_eq!(record.metadata, json!({"account_name": "main"}));
        assert!(!record.is_processed);
    }

    #[test]
    fn collection_method_round_trips_through_str() {
        for method in [
            CollectionMethod::Api,
            CollectionMethod::Excel,
            CollectionMethod::WebCrawling,
        ] {
            assert_eq!(CollectionMethod::parse(method.as_str()), Some(method));
        }
        assert_eq!(CollectionMethod::parse("fax"), None);
    }
}
