//! Bulk GraphQL supplier: token exchange, then an `allItems` query that
//! returns the whole edge list. When the supplier still reports
//! `hasNextPage`, the run continues from `endCursor`.

use async_trait::async_trait;
use csync_core::{Credentials, NormalizedItem};
use csync_storage::HttpFetcher;
use serde::Deserialize;
use serde_json::{json, Map, Value as JsonValue};
use tracing::{debug, info, warn};

use crate::{
    collection_metadata, id_string, json_str, AdapterContext, AdapterError, Cursor, FetchedPage,
    NormalizedBatch, Protocol, SourceAdapter, SupplierResponse,
};

pub const DEFAULT_AUTH_URL: &str = "https://auth.ownerclan.com/auth";
pub const DEFAULT_GRAPHQL_URL: &str = "https://api.ownerclan.com/v1/graphql";

const AVAILABLE: &str = "available";

const ALL_ITEMS_QUERY: &str = r#"query AllItems($first: Int, $after: String) {
  allItems(first: $first, after: $after) {
    pageInfo { hasNextPage endCursor }
    edges {
      node {
        key name model
        category { key name }
        price status boxQuantity createdAt updatedAt
        options { key price quantity optionAttributes { name value } }
        images(size: large)
      }
    }
  }
}"#;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageInfo {
    #[serde(default)]
    pub has_next_page: bool,
    pub end_cursor: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Edge {
    pub node: Map<String, JsonValue>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemConnection {
    #[serde(default)]
    pub page_info: PageInfo,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

#[derive(Debug, Deserialize)]
struct GraphQlError {
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AllItemsData {
    all_items: Option<ItemConnection>,
}

#[derive(Debug, Deserialize)]
struct GraphQlEnvelope {
    data: Option<AllItemsData>,
    #[serde(default)]
    errors: Vec<GraphQlError>,
}

#[derive(Debug, Clone)]
pub struct CursorQueryAdapter {
    code: String,
    auth_url: String,
    graphql_url: String,
    /// `None` asks for the whole list in one request.
    batch_size: Option<usize>,
    min_price: Option<u64>,
    max_price: Option<u64>,
}

impl CursorQueryAdapter {
    pub fn new(code: &str) -> Self {
        Self {
            code: code.to_string(),
            auth_url: DEFAULT_AUTH_URL.to_string(),
            graphql_url: DEFAULT_GRAPHQL_URL.to_string(),
            batch_size: None,
            min_price: None,
            max_price: None,
        }
    }

    pub fn with_auth_url(mut self, url: &str) -> Self {
        self.auth_url = url.to_string();
        self
    }

    pub fn with_graphql_url(mut self, url: &str) -> Self {
        self.graphql_url = url.to_string();
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = Some(size.max(1));
        self
    }

    /// Keeps only items whose first option is priced inside the bounds.
    /// Items without options always pass.
    pub fn with_price_range(mut self, min: Option<u64>, max: Option<u64>) -> Self {
        self.min_price = min;
        self.max_price = max;
        self
    }

    fn within_price_range(&self, item: &NormalizedItem) -> bool {
        let Some(price) = first_option_price(&item.payload) else {
            return true;
        };
        self.min_price.map_or(true, |min| price >= min as f64)
            && self.max_price.map_or(true, |max| price <= max as f64)
    }

    /// Drops out-of-range items, counting them as skipped.
    pub fn apply_price_range(&self, mut batch: NormalizedBatch) -> NormalizedBatch {
        if self.min_price.is_none() && self.max_price.is_none() {
            return batch;
        }
        let before = batch.items.len();
        batch.items.retain(|item| self.within_price_range(item));
        batch.skipped_upstream += before - batch.items.len();
        batch
    }
}

fn first_option_price(node: &Map<String, JsonValue>) -> Option<f64> {
    let price = node.get("options")?.as_array()?.first()?.get("price")?;
    match price {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().replace(',', "").parse().ok(),
        _ => None,
    }
}

/// Accepts either a bare JWT body or a JSON object with a `token` field.
pub fn parse_token(body: &[u8]) -> Result<String, AdapterError> {
    let text = String::from_utf8_lossy(body);
    let trimmed = text.trim().trim_matches('"');
    if trimmed.starts_with("eyJ") {
        return Ok(trimmed.to_string());
    }
    if let Ok(value) = serde_json::from_str::<JsonValue>(trimmed) {
        if let Some(token) = json_str(&value, &["token"]).or_else(|| json_str(&value, &["access_token"])) {
            return Ok(token.to_string());
        }
    }
    let snippet: String = trimmed.chars().take(120).collect();
    Err(AdapterError::UpstreamRejected(format!(
        "auth response carried no token: {snippet}"
    )))
}

pub fn decode_response(body: &[u8]) -> Result<ItemConnection, AdapterError> {
    let envelope: GraphQlEnvelope =
        serde_json::from_slice(body).map_err(|e| AdapterError::Decode(e.to_string()))?;
    if !envelope.errors.is_empty() {
        let messages: Vec<&str> = envelope.errors.iter().map(|e| e.message.as_str()).collect();
        return Err(AdapterError::UpstreamRejected(messages.join("; ")));
    }
    envelope
        .data
        .and_then(|d| d.all_items)
        .ok_or_else(|| AdapterError::Decode("response has no data.allItems".into()))
}

/// Where to continue after `page_info`, or `None` once the list is complete.
/// A repeated or missing end cursor cannot make progress and is refused.
pub fn next_cursor(page_info: &PageInfo, after: Option<&str>) -> Result<Option<Cursor>, AdapterError> {
    if !page_info.has_next_page {
        return Ok(None);
    }
    match page_info.end_cursor.as_deref().map(str::trim) {
        None | Some("") => Err(AdapterError::Decode("hasNextPage without endCursor".into())),
        Some(end) if Some(end) == after => Err(AdapterError::StallDetected(Cursor::Token(end.to_string()))),
        Some(end) => Ok(Some(Cursor::Token(end.to_string()))),
    }
}

pub fn normalize(conn: ItemConnection, account: &str) -> NormalizedBatch {
    let mut batch = NormalizedBatch::default();
    for edge in conn.edges {
        let node = edge.node;
        let Some(key) = id_string(node.get("key")) else {
            warn!("edge without key dropped");
            batch.skipped_upstream += 1;
            continue;
        };
        if node.get("status").and_then(JsonValue::as_str) != Some(AVAILABLE) {
            batch.skipped_upstream += 1;
            continue;
        }
        batch.items.push(
            NormalizedItem::new(key, node)
                .with_metadata_map(collection_metadata(account, "graphql_all_items")),
        );
    }
    batch
}

#[async_trait]
impl SourceAdapter for CursorQueryAdapter {
    fn supplier_code(&self) -> &str {
        &self.code
    }

    fn protocol(&self) -> Protocol {
        Protocol::GraphqlCursor
    }

    fn collection_source(&self) -> String {
        self.graphql_url.clone()
    }

    async fn authenticate(
        &self,
        http: &HttpFetcher,
        ctx: &mut AdapterContext,
    ) -> Result<(), AdapterError> {
        let Credentials::Login { username, password } = &ctx.credentials else {
            return Err(AdapterError::Credentials(format!(
                "{} requires a username/password login",
                self.code
            )));
        };
        let body = json!({
            "service": "ownerclan",
            "userType": "seller",
            "username": username,
            "password": password,
        });
        let request = http.client().post(&self.auth_url).json(&body);
        let resp = http.execute(ctx.run_id, &ctx.supplier_id, request).await?;
        ctx.bearer_token = Some(parse_token(&resp.body)?);
        info!(supplier = %self.code, "bearer token obtained");
        Ok(())
    }

    async fn fetch(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        cursor: &Cursor,
    ) -> Result<FetchedPage, AdapterError> {
        let token = ctx
            .bearer_token
            .as_deref()
            .ok_or_else(|| AdapterError::Credentials("fetch before authenticate".into()))?;
        let after = match cursor {
            Cursor::Token(end) => Some(end.clone()),
            Cursor::Start => None,
            Cursor::Page { .. } => {
                return Err(AdapterError::InvalidQuery("cursor protocol has no page numbers".into()));
            }
        };
        let body = json!({
            "query": ALL_ITEMS_QUERY,
            "variables": {"first": self.batch_size, "after": after},
        });
        let request = http.client().post(&self.graphql_url).bearer_auth(token).json(&body);
        let resp = http.execute(ctx.run_id, &ctx.supplier_id, request).await?;

        let conn = decode_response(&resp.body)?;
        let next = next_cursor(&conn.page_info, after.as_deref())?;
        debug!(edges = conn.edges.len(), ?next, "allItems response");

        let batch = SupplierResponse::Cursor(conn).normalize(&ctx.account);
        let batch = self.apply_price_range(batch);
        Ok(match next {
            Some(next) => FetchedPage {
                items: batch.items,
                next: Some(next),
                has_more: true,
                skipped_upstream: batch.skipped_upstream,
                segment_exhausted: false,
            },
            None => FetchedPage::last(batch.items, batch.skipped_upstream),
        })
    }
}
