//! Offset-paginated supplier (`getItemList`), walked segment by segment:
//! each market in turn, and inside a market each configured category.

use async_trait::async_trait;
use csync_core::{Credentials, NormalizedItem};
use csync_storage::HttpFetcher;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value as JsonValue};
use tracing::debug;

use crate::{
    collection_metadata, id_string, json_str, json_u64, AdapterContext, AdapterError, Cursor,
    FetchedPage, NormalizedBatch, Protocol, SourceAdapter, SupplierResponse,
};

pub const DEFAULT_BASE_URL: &str = "https://domeggook.com/ssl/api/";
pub const MAX_PAGE_SIZE: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Market {
    Dome,
    Supply,
}

impl Market {
    pub fn as_str(&self) -> &'static str {
        match self {
            Market::Dome => "dome",
            Market::Supply => "supply",
        }
    }
}

/// Search filters. The endpoint refuses unfiltered listing, so at least one
/// of keyword, category or seller id must be set. Several categories are
/// swept one after another inside each market.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryFilters {
    pub keyword: Option<String>,
    #[serde(default, deserialize_with = "one_or_many")]
    pub category: Vec<String>,
    pub seller_id: Option<String>,
    pub min_price: Option<u64>,
    pub max_price: Option<u64>,
    pub min_quantity: Option<u64>,
    pub max_quantity: Option<u64>,
}

/// Accepts `category: "01"` as well as `category: ["01", "02"]`.
fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match Option::<OneOrMany>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(OneOrMany::One(value)) => vec![value],
        Some(OneOrMany::Many(values)) => values,
    })
}

fn present(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

impl QueryFilters {
    pub fn has_required(&self) -> bool {
        present(&self.keyword).is_some()
            || !self.categories().is_empty()
            || present(&self.seller_id).is_some()
    }

    /// Non-blank category codes in configured order, without repeats.
    pub fn categories(&self) -> Vec<&str> {
        let mut out: Vec<&str> = Vec::new();
        for category in self.category.iter().map(|c| c.trim()) {
            if !category.is_empty() && !out.contains(&category) {
                out.push(category);
            }
        }
        out
    }

    fn query_pairs(&self, category: Option<&str>) -> Vec<(&'static str, String)> {
        let mut pairs = Vec::new();
        if let Some(v) = category {
            pairs.push(("ca", v.to_string()));
        }
        if let Some(v) = present(&self.seller_id) {
            pairs.push(("id", v.to_string()));
        }
        if let Some(v) = present(&self.keyword) {
            pairs.push(("kw", v.to_string()));
        }
        for (name, bound) in [
            ("mnp", self.min_price),
            ("mxp", self.max_price),
            ("mnq", self.min_quantity),
            ("mxq", self.max_quantity),
        ] {
            if let Some(bound) = bound {
                pairs.push((name, bound.to_string()));
            }
        }
        pairs
    }
}

/// One decoded `getItemList` page.
#[derive(Debug, Clone)]
pub struct ItemListPage {
    pub market: Market,
    /// Category this page was requested for, when sweeping categories.
    pub category: Option<String>,
    pub page: u32,
    pub total_items: Option<u64>,
    pub total_pages: Option<u64>,
    pub items: Vec<Map<String, JsonValue>>,
}

pub fn decode_response(body: &[u8], market: Market, page: u32) -> Result<ItemListPage, AdapterError> {
    let value: JsonValue =
        serde_json::from_slice(body).map_err(|e| AdapterError::Decode(e.to_string()))?;

    if let Some(errors) = value.get("errors") {
        let message = json_str(errors, &["message"])
            .map(ToString::to_string)
            .unwrap_or_else(|| errors.to_string());
        return Err(AdapterError::UpstreamRejected(message));
    }

    let root = value
        .get("domeggook")
        .ok_or_else(|| AdapterError::Decode("missing `domeggook` root".into()))?;

    // A single hit arrives as a bare object instead of a one-element array.
    let items = match root.get("list").and_then(|list| list.get("item")) {
        None | Some(JsonValue::Null) => Vec::new(),
        Some(JsonValue::Object(item)) => vec![item.clone()],
        Some(JsonValue::Array(items)) => items
            .iter()
            .filter_map(|item| item.as_object().cloned())
            .collect(),
        Some(other) => {
            return Err(AdapterError::Decode(format!("unexpected list.item shape: {other}")));
        }
    };

    Ok(ItemListPage {
        market,
        category: None,
        page,
        total_items: json_u64(root, &["header", "numberOfItems"])
            .or_else(|| json_u64(root, &["header", "tcount"])),
        total_pages: json_u64(root, &["header", "numberOfPages"]),
        items,
    })
}

pub fn normalize(page: ItemListPage, account: &str) -> NormalizedBatch {
    let market = page.market.as_str();
    let mut batch = NormalizedBatch::default();
    for item in page.items {
        let Some(no) = id_string(item.get("no")) else {
            batch.skipped_upstream += 1;
            continue;
        };
        let mut metadata = collection_metadata(account, "item_list");
        metadata.insert("market".into(), JsonValue::String(market.to_string()));
        if let Some(category) = &page.category {
            metadata.insert("category".into(), JsonValue::String(category.clone()));
        }
        batch.items.push(
            NormalizedItem::new(format!("{market}:{no}"), item).with_metadata_map(metadata),
        );
    }
    batch
}

/// One market, optionally narrowed to one category.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub market: Market,
    pub category: Option<String>,
}

#[derive(Debug, Clone)]
pub struct OffsetQueryAdapter {
    code: String,
    base_url: String,
    page_size: usize,
    segments: Vec<Segment>,
    filters: QueryFilters,
}

impl OffsetQueryAdapter {
    pub fn new(
        code: &str,
        markets: Vec<Market>,
        filters: QueryFilters,
        page_size: usize,
    ) -> Result<Self, AdapterError> {
        if !filters.has_required() {
            return Err(AdapterError::InvalidQuery(format!(
                "{code}: one of keyword, category or seller_id is required"
            )));
        }
        if markets.is_empty() {
            return Err(AdapterError::InvalidQuery(format!("{code}: no markets configured")));
        }

        let categories = filters.categories();
        let segments: Vec<Segment> = markets
            .iter()
            .flat_map(|&market| {
                let per_market: Vec<Option<String>> = if categories.is_empty() {
                    vec![None]
                } else {
                    categories.iter().map(|c| Some(c.to_string())).collect()
                };
                per_market
                    .into_iter()
                    .map(move |category| Segment { market, category })
            })
            .collect();

        Ok(Self {
            code: code.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            page_size: page_size.clamp(1, MAX_PAGE_SIZE),
            segments,
            filters,
        })
    }

    pub fn with_base_url(mut self, url: &str) -> Self {
        self.base_url = url.to_string();
        self
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Markets crossed with categories, in the order they are walked.
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    fn query(&self, key: &str, version: &str, segment: &Segment, page: u32) -> Vec<(&'static str, String)> {
        let mut pairs = vec![
            ("ver", version.to_string()),
            ("mode", "getItemList".to_string()),
            ("aid", key.to_string()),
            ("market", segment.market.as_str().to_string()),
            ("om", "json".to_string()),
            ("sz", self.page_size.to_string()),
            ("pg", page.to_string()),
            ("so", "rd".to_string()),
        ];
        pairs.extend(self.filters.query_pairs(segment.category.as_deref()));
        pairs
    }

    fn has_more_in_segment(&self, page: &ItemListPage) -> bool {
        if let Some(total_pages) = page.total_pages {
            return u64::from(page.page) < total_pages;
        }
        if let Some(total_items) = page.total_items {
            return u64::from(page.page) * (self.page_size as u64) < total_items;
        }
        page.items.len() >= self.page_size
    }
}

#[async_trait]
impl SourceAdapter for OffsetQueryAdapter {
    fn supplier_code(&self) -> &str {
        &self.code
    }

    fn protocol(&self) -> Protocol {
        Protocol::OffsetQuery
    }

    fn collection_source(&self) -> String {
        format!("{}?mode=getItemList", self.base_url)
    }

    /// Sends exactly one request. An empty segment comes back as a handover
    /// page so the caller paces the next segment's request like any other.
    async fn fetch(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        cursor: &Cursor,
    ) -> Result<FetchedPage, AdapterError> {
        if !self.filters.has_required() {
            return Err(AdapterError::InvalidQuery("search filter missing".into()));
        }
        let Credentials::ApiKey { key, version } = &ctx.credentials else {
            return Err(AdapterError::Credentials(format!("{} requires an API key", self.code)));
        };
        let (index, page_no) = match cursor {
            Cursor::Start => (0, 1),
            Cursor::Page { segment, page } => (*segment, (*page).max(1)),
            Cursor::Token(_) => {
                return Err(AdapterError::InvalidQuery("offset protocol has no cursor tokens".into()));
            }
        };
        let segment = self
            .segments
            .get(index)
            .ok_or_else(|| AdapterError::InvalidQuery(format!("no segment {index}")))?;

        let request = http
            .client()
            .get(&self.base_url)
            .query(&self.query(key, version, segment, page_no));
        let resp = http.execute(ctx.run_id, &ctx.supplier_id, request).await?;
        let mut page = decode_response(&resp.body, segment.market, page_no)?;
        page.category = segment.category.clone();

        let more_here = self.has_more_in_segment(&page);
        let next_segment = (index + 1 < self.segments.len()).then(|| Cursor::Page {
            segment: index + 1,
            page: 1,
        });
        debug!(
            market = segment.market.as_str(),
            category = segment.category.as_deref().unwrap_or(""),
            page = page_no,
            items = page.items.len(),
            total = ?page.total_items,
            "item list page"
        );

        if page.items.is_empty() {
            if more_here {
                return Err(AdapterError::StallDetected(Cursor::Page {
                    segment: index,
                    page: page_no,
                }));
            }
            return Ok(match next_segment {
                Some(next) => FetchedPage::handover(next),
                None => FetchedPage::last(Vec::new(), 0),
            });
        }

        let next = if more_here {
            Some(Cursor::Page {
                segment: index,
                page: page_no + 1,
            })
        } else {
            next_segment
        };
        let batch = SupplierResponse::Offset(page).normalize(&ctx.account);
        Ok(FetchedPage {
            items: batch.items,
            has_more: next.is_some(),
            next,
            skipped_upstream: batch.skipped_upstream,
            segment_exhausted: !more_here,
        })
    }
}
