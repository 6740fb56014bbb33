//! Full-document supplier: one form POST returns the whole catalog as an
//! EUC-KR XML dump of `product` elements.

use async_trait::async_trait;
use csync_core::{Credentials, NormalizedItem};
use csync_storage::HttpFetcher;
use encoding_rs::{Encoding, EUC_KR};
use roxmltree::{Document, Node, ParsingOptions};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{info, warn};

use crate::{
    collection_metadata, AdapterContext, AdapterError, Cursor, FetchedPage, NormalizedBatch,
    Protocol, SourceAdapter, SupplierResponse,
};

pub const DEFAULT_BASE_URL: &str = "https://www.zentrade.co.kr/shop/proc/product_api.php";

const OPTION_ROW_SEPARATOR: &str = "↑=↑";
const OPTION_FIELD_SEPARATOR: &str = "^|^";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProductOption {
    pub name: String,
    pub price: f64,
    pub consumer_price: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProductEntry {
    pub code: String,
    pub category: Option<String>,
    pub category_code: Option<String>,
    pub name: Option<String>,
    pub brand: Option<String>,
    pub model: Option<String>,
    pub buy_price: Option<f64>,
    pub consumer_price: Option<f64>,
    pub tax_mode: Option<String>,
    pub images: Vec<String>,
    pub option_title: Option<String>,
    pub options: Vec<ProductOption>,
    pub content: Option<String>,
    pub keywords: Option<String>,
    pub runout: bool,
    pub open_date: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct CatalogDocument {
    pub products: Vec<ProductEntry>,
    /// `product` elements without a `code` attribute.
    pub uncoded: usize,
}

/// Optional narrowing of the catalog request. Dates are passed through as
/// the supplier expects them (`YYYY-MM-DD`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentFilter {
    pub goods_no: Option<String>,
    pub open_date_from: Option<String>,
    pub open_date_to: Option<String>,
}

fn charset_label(content_type: &str) -> Option<&str> {
    content_type.split(';').skip(1).find_map(|param| {
        let (name, value) = param.split_once('=')?;
        name.trim()
            .eq_ignore_ascii_case("charset")
            .then(|| value.trim().trim_matches(|c| c == '"' || c == '\''))
    })
}

/// Reads `encoding=` out of the XML declaration, either quote style.
fn declared_encoding(body: &[u8]) -> Option<String> {
    let head = String::from_utf8_lossy(&body[..body.len().min(256)]).to_ascii_lowercase();
    let decl = &head[..head.find("?>")?];
    if !decl.trim_start().starts_with("<?xml") {
        return None;
    }
    let rest = decl[decl.find("encoding")? + "encoding".len()..].trim_start();
    let rest = rest.strip_prefix('=')?.trim_start();
    let quote = rest.chars().next().filter(|c| *c == '"' || *c == '\'')?;
    let value = &rest[1..];
    Some(value[..value.find(quote)?].trim().to_string())
}

/// Picks the body encoding from a BOM, the response charset, then the XML
/// declaration. Anything unlabelled or unknown is EUC-KR.
fn detect_encoding(body: &[u8], content_type: Option<&str>) -> &'static Encoding {
    if let Some((encoding, _)) = Encoding::for_bom(body) {
        return encoding;
    }
    content_type
        .and_then(charset_label)
        .and_then(|label| Encoding::for_label(label.as_bytes()))
        .or_else(|| declared_encoding(body).and_then(|label| Encoding::for_label(label.as_bytes())))
        .unwrap_or(EUC_KR)
}

pub fn decode_text(body: &[u8], content_type: Option<&str>) -> String {
    let encoding = detect_encoding(body, content_type);
    let (text, used, had_errors) = encoding.decode(body);
    if had_errors {
        warn!(encoding = used.name(), "catalog document contained undecodable bytes");
    }
    text.into_owned()
}

/// Splits the option sub-format: rows by `↑=↑`, fields by `^|^` as
/// name, price, consumer price and an optional image. Rows with fewer than
/// three fields are dropped.
pub fn parse_options(raw: &str) -> Vec<ProductOption> {
    raw.split(OPTION_ROW_SEPARATOR)
        .filter(|row| row.contains(OPTION_FIELD_SEPARATOR))
        .filter_map(|row| {
            let parts: Vec<&str> = row.split(OPTION_FIELD_SEPARATOR).collect();
            if parts.len() < 3 {
                return None;
            }
            Some(ProductOption {
                name: parts[0].trim().to_string(),
                price: parse_amount(parts[1]).unwrap_or(0.0),
                consumer_price: parse_amount(parts[2]).unwrap_or(0.0),
                image: parts.get(3).and_then(|s| non_empty(s)),
            })
        })
        .collect()
}

fn parse_amount(raw: &str) -> Option<f64> {
    let cleaned: String = raw.chars().filter(|c| *c != ',' && !c.is_whitespace()).collect();
    if cleaned.is_empty() {
        None
    } else {
        cleaned.parse().ok()
    }
}

fn non_empty(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn child<'a, 'input>(node: Node<'a, 'input>, name: &str) -> Option<Node<'a, 'input>> {
    node.children().find(|n| n.has_tag_name(name))
}

fn text_of(node: Option<Node<'_, '_>>) -> Option<String> {
    let node = node?;
    let text: String = node
        .descendants()
        .filter(|n| n.is_text())
        .filter_map(|n| n.text())
        .collect();
    non_empty(&text)
}

fn attr_of(node: Option<Node<'_, '_>>, name: &str) -> Option<String> {
    node?.attribute(name).and_then(non_empty)
}

fn product_entry(product: Node<'_, '_>, code: String) -> ProductEntry {
    let category = child(product, "dome_category");
    let baseinfo = child(product, "baseinfo");
    let price = child(product, "price");
    let listimg = child(product, "listimg");
    let option = child(product, "option");
    let status = child(product, "status");

    let images = (1..=5)
        .filter_map(|i| attr_of(listimg, &format!("url{i}")))
        .collect();

    ProductEntry {
        code,
        category: text_of(category),
        category_code: attr_of(category, "dome_catecode"),
        name: text_of(child(product, "prdtname")),
        brand: attr_of(baseinfo, "brand"),
        model: attr_of(baseinfo, "model"),
        buy_price: attr_of(price, "buyprice").as_deref().and_then(parse_amount),
        consumer_price: attr_of(price, "consumerprice").as_deref().and_then(parse_amount),
        tax_mode: attr_of(price, "taxmode"),
        images,
        option_title: attr_of(option, "opt1nm"),
        options: text_of(option).map(|raw| parse_options(&raw)).unwrap_or_default(),
        content: text_of(child(product, "content")),
        keywords: text_of(child(product, "keyword")),
        runout: attr_of(status, "runout").is_some_and(|v| v != "0"),
        open_date: attr_of(status, "opendate"),
    }
}

pub fn decode_document(body: &[u8]) -> Result<CatalogDocument, AdapterError> {
    decode_document_as(body, None)
}

pub fn decode_document_as(
    body: &[u8],
    content_type: Option<&str>,
) -> Result<CatalogDocument, AdapterError> {
    let text = decode_text(body, content_type);
    let mut options = ParsingOptions::default();
    options.allow_dtd = true;
    let doc = Document::parse_with_options(&text, options)
        .map_err(|e| AdapterError::Decode(format!("catalog XML: {e}")))?;

    let root = doc.root_element();
    if root.has_tag_name("error") {
        let message = text_of(Some(root)).unwrap_or_else(|| "unspecified error".into());
        return Err(AdapterError::UpstreamRejected(message));
    }

    let mut catalog = CatalogDocument::default();
    for product in doc.descendants().filter(|n| n.has_tag_name("product")) {
        match product.attribute("code").and_then(non_empty) {
            Some(code) => catalog.products.push(product_entry(product, code)),
            None => catalog.uncoded += 1,
        }
    }

    if catalog.products.is_empty() {
        if let Some(error) = doc.descendants().find(|n| n.has_tag_name("error")) {
            let message = text_of(Some(error)).unwrap_or_else(|| "unspecified error".into());
            return Err(AdapterError::UpstreamRejected(message));
        }
    }
    Ok(catalog)
}

pub fn normalize(doc: CatalogDocument, account: &str) -> NormalizedBatch {
    let mut batch = NormalizedBatch {
        items: Vec::with_capacity(doc.products.len()),
        skipped_upstream: doc.uncoded,
    };
    for product in doc.products {
        let code = product.code.clone();
        let payload = match serde_json::to_value(&product) {
            Ok(JsonValue::Object(map)) => map,
            Ok(_) | Err(_) => {
                warn!(code = %code, "product did not serialize to an object");
                batch.skipped_upstream += 1;
                continue;
            }
        };
        batch.items.push(
            NormalizedItem::new(code, payload)
                .with_metadata_map(collection_metadata(account, "product_xml")),
        );
    }
    batch
}

#[derive(Debug, Clone)]
pub struct DocumentAdapter {
    code: String,
    base_url: String,
    include_runout: bool,
    filter: DocumentFilter,
}

impl DocumentAdapter {
    pub fn new(code: &str) -> Self {
        Self {
            code: code.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            include_runout: false,
            filter: DocumentFilter::default(),
        }
    }

    pub fn with_base_url(mut self, url: &str) -> Self {
        self.base_url = url.to_string();
        self
    }

    /// Also request sold-out products (`runout` flag set in the payload).
    pub fn include_runout(mut self, include: bool) -> Self {
        self.include_runout = include;
        self
    }

    pub fn with_document_filter(mut self, filter: DocumentFilter) -> Self {
        self.filter = filter;
        self
    }

    fn form(&self, id: &str, secret: &str) -> Vec<(&'static str, String)> {
        let mut form = vec![("id", id.to_string()), ("m_skey", secret.to_string())];
        if !self.include_runout {
            form.push(("runout", "0".to_string()));
        }
        let optional = [
            ("goodsno", &self.filter.goods_no),
            ("opendate_s", &self.filter.open_date_from),
            ("opendate_e", &self.filter.open_date_to),
        ];
        for (name, value) in optional {
            if let Some(value) = value.as_deref().and_then(non_empty) {
                form.push((name, value));
            }
        }
        form
    }
}

#[async_trait]
impl SourceAdapter for DocumentAdapter {
    fn supplier_code(&self) -> &str {
        &self.code
    }

    fn protocol(&self) -> Protocol {
        Protocol::XmlDocument
    }

    fn collection_source(&self) -> String {
        self.base_url.clone()
    }

    async fn fetch(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        cursor: &Cursor,
    ) -> Result<FetchedPage, AdapterError> {
        if *cursor != Cursor::Start {
            return Err(AdapterError::InvalidQuery(format!(
                "{} serves a single document; got {cursor:?}",
                self.code
            )));
        }
        let Credentials::Signed { id, secret } = &ctx.credentials else {
            return Err(AdapterError::Credentials(format!(
                "{} requires a signed id/secret pair",
                self.code
            )));
        };
        let request = http.client().post(&self.base_url).form(&self.form(id, secret));
        let resp = http.execute(ctx.run_id, &ctx.supplier_id, request).await?;
        let doc = decode_document_as(&resp.body, resp.content_type.as_deref())?;
        info!(
            supplier = %self.code,
            products = doc.products.len(),
            bytes = resp.body.len(),
            "catalog document decoded"
        );

        let batch = SupplierResponse::Document(doc).normalize(&ctx.account);
        Ok(FetchedPage::last(batch.items, batch.skipped_upstream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::fixture_bytes;
    use csync_storage::HttpClientConfig;
    use wiremock::matchers::{body_string_contains, method, path};

    const UTF8_SINGLE_QUOTED: &str =
        "<?xml version='1.0' encoding='UTF-8'?><zentrade><product code=\"U1\"><prdtname>무선 마우스</prdtname></product></zentrade>";

    #[test]
    fn single_quoted_utf8_declaration_is_honoured() {
        let doc = decode_document(UTF8_SINGLE_QUOTED.as_bytes()).unwrap();
        assert_eq!(doc.products[0].name.as_deref(), Some("무선 마우스"));
    }

    #[test]
    fn response_charset_overrides_the_fallback() {
        let body = "<zentrade><product code=\"U2\"><prdtname>키보드</prdtname></product></zentrade>";
        let doc = decode_document_as(body.as_bytes(), Some("text/xml; charset=\"utf-8\"")).unwrap();
        assert_eq!(doc.products[0].name.as_deref(), Some("키보드"));

        assert_eq!(declared_encoding(b"<?xml version=\"1.0\"?><a/>"), None);
        assert_eq!(charset_label("text/xml"), None);
    }

    #[test]
    fn unlabelled_body_falls_back_to_euc_kr() {
        let xml = "<zentrade><product code=\"E1\"><prdtname>텀블러</prdtname></product></zentrade>";
        let (bytes, _, _) = EUC_KR.encode(xml);
        let doc = decode_document(&bytes).unwrap();
        assert_eq!(doc.products[0].name.as_deref(), Some("텀블러"));
    }
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn option_rows_decode_and_short_rows_drop() {
        let options = parse_options("Red^|^1000^|^1500^|^red.jpg↑=↑Blue^|^1,200^|^1700↑=↑junk");
        assert_eq!(
            options,
            vec![
                ProductOption {
                    name: "Red".into(),
                    price: 1000.0,
                    consumer_price: 1500.0,
                    image: Some("red.jpg".into()),
                },
                ProductOption {
                    name: "Blue".into(),
                    price: 1200.0,
                    consumer_price: 1700.0,
                    image: None,
                },
            ]
        );
        assert!(parse_options("a^|^b").is_empty());
    }

    #[test]
    fn euc_kr_fixture_decodes_every_product() {
        let doc = decode_document(&fixture_bytes("zentrade_catalog.xml")).unwrap();
        assert_eq!(doc.products.len(), 2);
        assert_eq!(doc.uncoded, 1);

        let tumbler = &doc.products[0];
        assert_eq!(tumbler.code, "ZT10231");
        assert_eq!(tumbler.name.as_deref(), Some("스테인리스 진공 텀블러 500ml"));
        assert_eq!(tumbler.category.as_deref(), Some("주방용품 > 텀블러"));
        assert_eq!(tumbler.category_code.as_deref(), Some("001002003"));
        assert_eq!(tumbler.brand.as_deref(), Some("젠쿡"));
        assert_eq!(tumbler.buy_price, Some(7800.0));
        assert_eq!(tumbler.images.len(), 2);
        assert_eq!(tumbler.option_title.as_deref(), Some("색상"));
        assert_eq!(tumbler.options.len(), 3);
        assert_eq!(tumbler.options[2].name, "화이트");
        assert_eq!(tumbler.options[2].price, 0.0);
        assert!(!tumbler.runout);

        let board = &doc.products[1];
        assert_eq!(board.brand, None);
        assert!(board.options.is_empty());
        assert!(board.runout);
    }

    #[test]
    fn error_root_is_an_upstream_rejection() {
        let body = br#"<?xml version="1.0" encoding="utf-8"?><error>invalid m_skey</error>"#;
        let err = decode_document(body).unwrap_err();
        assert!(matches!(err, AdapterError::UpstreamRejected(ref m) if m == "invalid m_skey"));
    }

    #[test]
    fn malformed_xml_is_a_decode_error() {
        let err = decode_document(b"<zentrade><product code=\"1\">").unwrap_err();
        assert!(matches!(err, AdapterError::Decode(_)));
    }

    #[tokio::test]
    async fn posts_signed_form_and_returns_single_page() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/shop/proc/product_api.php"))
            .and(body_string_contains("id=shop-7"))
            .and(body_string_contains("m_skey=s3cret"))
            .and(body_string_contains("runout=0"))
            .respond_with(
                ResponseTemplate::new(200).set_body_bytes(fixture_bytes("zentrade_catalog.xml")),
            )
            .expect(1)
            .mount(&server)
            .await;

        let adapter = DocumentAdapter::new("zentrade")
            .with_base_url(&format!("{}/shop/proc/product_api.php", server.uri()));
        let http = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let ctx = AdapterContext::new(
            "sup-zen",
            "main",
            Credentials::Signed {
                id: "shop-7".into(),
                secret: "s3cret".into(),
            },
        );

        let page = adapter.fetch(&http, &ctx, &Cursor::Start).await.unwrap();
        assert!(!page.has_more);
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.skipped_upstream, 1);
        assert_eq!(page.items[0].payload["code"], "ZT10231");
        assert_eq!(page.items[0].metadata["collection_type"], "product_xml");
    }

    #[tokio::test]
    async fn document_filter_adds_optional_form_fields() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_string_contains("goodsno=ZT10231"))
            .and(body_string_contains("opendate_s=2024-01-01"))
            .and(body_string_contains("opendate_e=2024-06-30"))
            .respond_with(
                ResponseTemplate::new(200).set_body_bytes(fixture_bytes("zentrade_catalog.xml")),
            )
            .expect(1)
            .mount(&server)
            .await;

        let adapter = DocumentAdapter::new("zentrade")
            .with_base_url(&server.uri())
            .include_runout(true)
            .with_document_filter(DocumentFilter {
                goods_no: Some("ZT10231".into()),
                open_date_from: Some("2024-01-01".into()),
                open_date_to: Some("2024-06-30".into()),
            });
        let form = adapter.form("shop-7", "s3cret");
        assert!(!form.iter().any(|(name, _)| *name == "runout"));

        let http = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let ctx = AdapterContext::new(
            "sup-zen",
            "main",
            Credentials::Signed {
                id: "shop-7".into(),
                secret: "s3cret".into(),
            },
        );
        let page = adapter.fetch(&http, &ctx, &Cursor::Start).await.unwrap();
        assert_eq!(page.items.len(), 2);
    }

    #[test]
    fn blank_filter_values_are_not_sent() {
        let adapter = DocumentAdapter::new("zentrade").with_document_filter(DocumentFilter {
            goods_no: Some("  ".into()),
            ..DocumentFilter::default()
        });
        let names: Vec<_> = adapter.form("a", "b").into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, ["id", "m_skey", "runout"]);
    }
}
