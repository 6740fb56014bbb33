//! Supplier adapter contracts + the three protocol adapters.

use std::fmt;

use async_trait::async_trait;
use csync_core::{CollectionMethod, Credentials, NormalizedItem};
use csync_storage::{FetchError, HttpFetcher, RetryDisposition};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;
use uuid::Uuid;

pub mod credentials;
pub mod cursor;
pub mod document;
pub mod offset;

pub use credentials::{CredentialProvider, EnvCredentialProvider, StaticCredentialProvider};
pub use cursor::CursorQueryAdapter;
pub use document::{DocumentAdapter, DocumentFilter};
pub use offset::{Market, OffsetQueryAdapter, QueryFilters};

pub const CRATE_NAME: &str = "csync-adapters";

/// Wire protocol family a supplier speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    /// Token exchange + GraphQL bulk query returning one edge list.
    GraphqlCursor,
    /// Filtered, page-numbered JSON query walked per market.
    OffsetQuery,
    /// Form POST returning the whole catalog as one XML document.
    XmlDocument,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Protocol::GraphqlCursor => "graphql_cursor",
            Protocol::OffsetQuery => "offset_query",
            Protocol::XmlDocument => "xml_document",
        };
        f.write_str(name)
    }
}

/// Position in a supplier's catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Cursor {
    Start,
    /// 1-based page inside the `segment`-th market.
    Page { segment: usize, page: u32 },
    Token(String),
}

/// Per-run adapter state. The bearer token lives here rather than in any
/// process-wide cache so concurrent runs never share credentials.
#[derive(Debug, Clone)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub supplier_id: String,
    pub account: String,
    pub credentials: Credentials,
    pub bearer_token: Option<String>,
}

impl AdapterContext {
    pub fn new(supplier_id: &str, account: &str, credentials: Credentials) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            supplier_id: supplier_id.to_string(),
            account: account.to_string(),
            credentials,
            bearer_token: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchedPage {
    pub items: Vec<NormalizedItem>,
    pub next: Option<Cursor>,
    pub has_more: bool,
    /// Records the supplier returned that never reach reconciliation: marked
    /// unavailable upstream, or outside a configured filter.
    pub skipped_upstream: usize,
    /// This page closed its segment (market or category). An empty page with
    /// this set hands over to the next segment and is not a stall.
    pub segment_exhausted: bool,
}

impl FetchedPage {
    pub fn last(items: Vec<NormalizedItem>, skipped_upstream: usize) -> Self {
        Self {
            items,
            next: None,
            has_more: false,
            skipped_upstream,
            segment_exhausted: true,
        }
    }

    /// Empty page that moves the cursor on to the next segment.
    pub fn handover(next: Cursor) -> Self {
        Self {
            items: Vec::new(),
            next: Some(next),
            has_more: true,
            skipped_upstream: 0,
            segment_exhausted: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("transport: {0}")]
    Transport(#[from] FetchError),
    #[error("upstream rejected request: {0}")]
    UpstreamRejected(String),
    #[error("invalid query: {0}")]
    InvalidQuery(String),
    #[error("supplier advertised more data but returned an empty page at {0:?}")]
    StallDetected(Cursor),
    #[error("could not decode supplier response: {0}")]
    Decode(String),
    #[error("credentials: {0}")]
    Credentials(String),
}

impl AdapterError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            AdapterError::Transport(err) => err.disposition(),
            _ => RetryDisposition::NonRetryable,
        }
    }
}

/// Decoded supplier response, before normalization.
#[derive(Debug, Clone)]
pub enum SupplierResponse {
    Cursor(cursor::ItemConnection),
    Offset(offset::ItemListPage),
    Document(document::CatalogDocument),
}

/// Normalized records of one response plus the count filtered out upstream.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizedBatch {
    pub items: Vec<NormalizedItem>,
    pub skipped_upstream: usize,
}

impl SupplierResponse {
    pub fn normalize(self, account: &str) -> NormalizedBatch {
        match self {
            SupplierResponse::Cursor(conn) => cursor::normalize(conn, account),
            SupplierResponse::Offset(page) => offset::normalize(page, account),
            SupplierResponse::Document(doc) => document::normalize(doc, account),
        }
    }
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn supplier_code(&self) -> &str;
    fn protocol(&self) -> Protocol;

    fn collection_method(&self) -> CollectionMethod {
        CollectionMethod::Api
    }

    /// Endpoint label stored with each record.
    fn collection_source(&self) -> String;

    /// Exchanges credentials for whatever per-run session state the protocol
    /// needs. Called once before the first fetch.
    async fn authenticate(
        &self,
        _http: &HttpFetcher,
        _ctx: &mut AdapterContext,
    ) -> Result<(), AdapterError> {
        Ok(())
    }

    async fn fetch(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        cursor: &Cursor,
    ) -> Result<FetchedPage, AdapterError>;
}

/// Everything needed to build an adapter for one configured supplier.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AdapterSettings {
    pub code: String,
    pub protocol: Option<Protocol>,
    pub base_url: Option<String>,
    pub auth_url: Option<String>,
    pub page_size: Option<usize>,
    #[serde(default)]
    pub markets: Vec<Market>,
    #[serde(default)]
    pub filters: QueryFilters,
    #[serde(default)]
    pub include_runout: bool,
    #[serde(default)]
    pub document: DocumentFilter,
}

pub fn build_adapter(settings: &AdapterSettings) -> Result<Box<dyn SourceAdapter>, AdapterError> {
    let protocol = settings
        .protocol
        .ok_or_else(|| AdapterError::InvalidQuery(format!("{}: protocol missing", settings.code)))?;
    let adapter: Box<dyn SourceAdapter> = match protocol {
        Protocol::GraphqlCursor => {
            let mut adapter = CursorQueryAdapter::new(&settings.code);
            if let Some(url) = &settings.base_url {
                adapter = adapter.with_graphql_url(url);
            }
            if let Some(url) = &settings.auth_url {
                adapter = adapter.with_auth_url(url);
            }
            if let Some(size) = settings.page_size {
                adapter = adapter.with_batch_size(size);
            }
            Box::new(adapter.with_price_range(settings.filters.min_price, settings.filters.max_price))
        }
        Protocol::OffsetQuery => {
            let markets = if settings.markets.is_empty() {
                vec![Market::Dome]
            } else {
                settings.markets.clone()
            };
            let mut adapter = OffsetQueryAdapter::new(
                &settings.code,
                markets,
                settings.filters.clone(),
                settings.page_size.unwrap_or(offset::MAX_PAGE_SIZE),
            )?;
            if let Some(url) = &settings.base_url {
                adapter = adapter.with_base_url(url);
            }
            Box::new(adapter)
        }
        Protocol::XmlDocument => {
            let mut adapter = DocumentAdapter::new(&settings.code);
            if let Some(url) = &settings.base_url {
                adapter = adapter.with_base_url(url);
            }
            Box::new(
                adapter
                    .include_runout(settings.include_runout)
                    .with_document_filter(settings.document.clone()),
            )
        }
    };
    Ok(adapter)
}

// Shared JSON helpers.

pub(crate) fn json_str<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    cur.as_str()
}

/// Reads an integer that suppliers variously send as a number or a string.
pub(crate) fn json_u64(value: &JsonValue, path: &[&str]) -> Option<u64> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    match cur {
        JsonValue::Number(n) => n.as_u64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Scalar identifier as a string, whether it arrived as text or a number.
pub(crate) fn id_string(value: Option<&JsonValue>) -> Option<String> {
    match value? {
        JsonValue::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

pub(crate) fn collection_metadata(account: &str, collection_type: &str) -> Map<String, JsonValue> {
    let mut metadata = Map::new();
    metadata.insert("account_name".into(), JsonValue::String(account.to_string()));
    metadata.insert(
        "collection_type".into(),
        JsonValue::String(collection_type.to_string()),
    );
    metadata
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offset_settings_without_filter_are_refused() {
        let settings = AdapterSettings {
            code: "domeggook".into(),
            protocol: Some(Protocol::OffsetQuery),
            ..AdapterSettings::default()
        };
        let err = build_adapter(&settings).err().unwrap();
        assert!(matches!(err, AdapterError::InvalidQuery(_)));
        assert_eq!(err.disposition(), RetryDisposition::NonRetryable);
    }

    #[test]
    fn builder_picks_adapter_by_protocol() {
        for (protocol, expected) in [
            (Protocol::GraphqlCursor, "graphql_cursor"),
            (Protocol::XmlDocument, "xml_document"),
        ] {
            let settings = AdapterSettings {
                code: "acme".into(),
                protocol: Some(protocol),
                ..AdapterSettings::default()
            };
            let adapter = build_adapter(&settings).unwrap();
            assert_eq!(adapter.protocol(), protocol);
            assert_eq!(adapter.protocol().to_string(), expected);
            assert_eq!(adapter.supplier_code(), "acme");
        }
    }

    #[test]
    fn loosely_typed_numbers_are_read() {
        let value = serde_json::json!({"header": {"numberOfItems": "482", "currentPage": 2}});
        assert_eq!(json_u64(&value, &["header", "numberOfItems"]), Some(482));
        assert_eq!(json_u64(&value, &["header", "currentPage"]), Some(2));
        assert_eq!(json_u64(&value, &["header", "missing"]), None);
        assert_eq!(id_string(Some(&serde_json::json!(1234))).as_deref(), Some("1234"));
        assert_eq!(id_string(Some(&serde_json::json!("  "))), None);
    }
}
