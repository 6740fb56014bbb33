use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use csync_adapters::{AdapterContext, AdapterError, Cursor, FetchedPage, Protocol, SourceAdapter};
use csync_core::{Credentials, NormalizedItem, RawRecord, RunReport, RunStatus, StopReason, RAW_CATALOG_TABLE};
use csync_storage::{
    BackoffPolicy, CatalogStore, FetchError, HttpClientConfig, HttpFetcher, InMemoryCatalogStore, RowFilter,
    StoreError, WriteOp,
};
use csync_sync::{DriverLimits, PaginationDriver, SyncSession};
use serde_json::{json, Map};
use tokio_util::sync::CancellationToken;

type Script = dyn Fn(usize) -> Result<FetchedPage, AdapterError> + Send + Sync;

/// Adapter whose responses come from a closure over the call number.
struct ScriptedAdapter {
    script: Box<Script>,
    calls: AtomicUsize,
}

impl ScriptedAdapter {
    fn new(script: impl Fn(usize) -> Result<FetchedPage, AdapterError> + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            script: Box::new(script),
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceAdapter for ScriptedAdapter {
    fn supplier_code(&self) -> &str {
        "scripted"
    }

    fn protocol(&self) -> Protocol {
        Protocol::OffsetQuery
    }

    fn collection_source(&self) -> String {
        "scripted://items".into()
    }

    async fn fetch(
        &self,
        _http: &HttpFetcher,
        _ctx: &AdapterContext,
        _cursor: &Cursor,
    ) -> Result<FetchedPage, AdapterError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        (self.script)(call)
    }
}

fn item(id: &str, price: u64) -> NormalizedItem {
    let mut payload = Map::new();
    payload.insert("name".into(), json!(format!("item {id}")));
    payload.insert("price".into(), json!(price));
    NormalizedItem::new(id, payload)
}

fn page(call: usize, ids: impl IntoIterator<Item = String>, has_more: bool) -> FetchedPage {
    FetchedPage {
        items: ids.into_iter().map(|id| item(&id, 1000)).collect(),
        next: has_more.then(|| Cursor::Page {
            segment: 0,
            page: call as u32 + 2,
        }),
        has_more,
        skipped_upstream: 0,
        segment_exhausted: false,
    }
}

/// 200, 200 then a final 80.
fn three_pages(call: usize) -> Result<FetchedPage, AdapterError> {
    let (start, len, more) = match call {
        0 => (0, 200, true),
        1 => (200, 200, true),
        _ => (400, 80, false),
    };
    Ok(page(call, (start..start + len).map(|n| format!("P{n:05}")), more))
}

fn unavailable() -> AdapterError {
    AdapterError::Transport(FetchError::HttpStatus {
        status: 503,
        url: "http://supplier.test/items".into(),
        snippet: "maintenance".into(),
    })
}

fn fast_backoff(max_retries: usize) -> BackoffPolicy {
    BackoffPolicy {
        max_retries,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        jitter: Duration::ZERO,
    }
}

fn http() -> Arc<HttpFetcher> {
    Arc::new(HttpFetcher::new(HttpClientConfig::default()).unwrap())
}

fn session() -> SyncSession {
    SyncSession::new(
        "sup-test",
        "main",
        Credentials::ApiKey {
            key: "k".into(),
            version: "4.1".into(),
        },
    )
}

fn driver(adapter: Arc<ScriptedAdapter>, store: Arc<dyn CatalogStore>) -> PaginationDriver {
    PaginationDriver::new(adapter, http(), store).with_backoff(fast_backoff(2))
}

fn assert_clean(report: &RunReport) {
    assert_eq!(report.status, RunStatus::Success, "{report:?}");
    assert!(report.error.is_none());
    assert!(report.is_balanced(), "{report:?}");
}

#[tokio::test]
async fn walks_pages_until_exhausted() {
    let adapter = ScriptedAdapter::new(three_pages);
    let store = Arc::new(InMemoryCatalogStore::new());

    let report = driver(adapter.clone(), store.clone()).run(session()).await;

    assert_clean(&report);
    assert_eq!(report.stop_reason, StopReason::Exhausted);
    assert_eq!(adapter.calls(), 3);
    assert_eq!(report.pages, 3);
    assert_eq!(report.total_fetched, 480);
    assert_eq!(report.new, 480);
    assert_eq!(store.len(RAW_CATALOG_TABLE).await, 480);

    let stored = store.get(RAW_CATALOG_TABLE, "sup-test", "P00479").await.unwrap();
    assert_eq!(stored.collection_source, "scripted://items");
    assert_eq!(stored.content_hash.len(), 64);
}

#[tokio::test]
async fn second_run_over_same_data_writes_nothing() {
    let store = Arc::new(InMemoryCatalogStore::new());
    let first = driver(ScriptedAdapter::new(three_pages), store.clone()).run(session()).await;
    assert_eq!(first.new, 480);
    let writes_after_first = store.writes().await.len();

    let second = driver(ScriptedAdapter::new(three_pages), store.clone()).run(session()).await;

    assert_clean(&second);
    assert_eq!(second.new, 0);
    assert_eq!(second.updated, 0);
    assert_eq!(second.unchanged, 480);
    assert_eq!(store.writes().await.len(), writes_after_first);
}

#[tokio::test]
async fn changed_payload_is_upserted() {
    let store = Arc::new(InMemoryCatalogStore::new());
    driver(ScriptedAdapter::new(three_pages), store.clone()).run(session()).await;

    let repriced = ScriptedAdapter::new(|_| {
        Ok(FetchedPage::last(vec![item("P00001", 1200), item("P00002", 1000)], 0))
    });
    let report = driver(repriced, store.clone()).run(session()).await;

    assert_clean(&report);
    assert_eq!(report.updated, 1);
    assert_eq!(report.unchanged, 1);
    let stored = store.get(RAW_CATALOG_TABLE, "sup-test", "P00001").await.unwrap();
    assert_eq!(stored.payload["price"], json!(1200));
    let last = store.writes().await.last().cloned().unwrap();
    assert_eq!(last.op, WriteOp::Upsert);
    assert_eq!(last.supplier_product_ids, ["P00001"]);
}

#[tokio::test]
async fn endless_supplier_stops_at_safety_limit() {
    let adapter = ScriptedAdapter::new(|call| Ok(page(call, [format!("E{call}")], true)));
    let store = Arc::new(InMemoryCatalogStore::new());

    let report = driver(adapter.clone(), store)
        .with_limits(DriverLimits {
            max_pages: 5,
            ..DriverLimits::default()
        })
        .run(session())
        .await;

    assert_clean(&report);
    assert_eq!(report.stop_reason, StopReason::SafetyLimit);
    assert_eq!(report.pages, 5);
    assert_eq!(adapter.calls(), 5);
}

#[tokio::test]
async fn empty_page_that_claims_more_is_a_stall() {
    let adapter = ScriptedAdapter::new(|call| match call {
        0 => Ok(page(call, ["S1".to_string()], true)),
        _ => Ok(page(call, Vec::new(), true)),
    });
    let store = Arc::new(InMemoryCatalogStore::new());

    let report = driver(adapter.clone(), store.clone()).run(session()).await;

    assert_eq!(report.status, RunStatus::Error);
    assert_eq!(report.stop_reason, StopReason::Aborted);
    assert!(report.error.as_deref().unwrap().contains("empty page"));
    assert_eq!(adapter.calls(), 2);
    // the first page was persisted before the stall
    assert_eq!(store.len(RAW_CATALOG_TABLE).await, 1);
}

#[tokio::test]
async fn empty_page_made_of_skipped_items_is_not_a_stall() {
    let adapter = ScriptedAdapter::new(|call| match call {
        0 => Ok(FetchedPage {
            items: Vec::new(),
            next: Some(Cursor::Page { segment: 0, page: 2 }),
            has_more: true,
            skipped_upstream: 3,
            segment_exhausted: false,
        }),
        _ => Ok(FetchedPage::last(vec![item("A", 1)], 0)),
    });

    let report = driver(adapter, Arc::new(InMemoryCatalogStore::new())).run(session()).await;

    assert_clean(&report);
    assert_eq!(report.skipped_upstream, 3);
    assert_eq!(report.new, 1);
}

#[tokio::test]
async fn handover_to_next_segment_is_not_a_stall() {
    let adapter = ScriptedAdapter::new(|call| match call {
        0 => Ok(FetchedPage::handover(Cursor::Page { segment: 1, page: 1 })),
        _ => Ok(FetchedPage::last(vec![item("A", 1)], 0)),
    });

    let report = driver(adapter.clone(), Arc::new(InMemoryCatalogStore::new()))
        .run(session())
        .await;

    assert_clean(&report);
    assert_eq!(report.stop_reason, StopReason::Exhausted);
    assert_eq!(adapter.calls(), 2);
    assert_eq!(report.new, 1);
}

#[tokio::test(start_paused = true)]
async fn request_delay_spaces_page_fetches() {
    let adapter = ScriptedAdapter::new(three_pages);
    let started = tokio::time::Instant::now();

    let report = driver(adapter.clone(), Arc::new(InMemoryCatalogStore::new()))
        .with_request_delay(Duration::from_millis(500))
        .run(session())
        .await;

    assert_clean(&report);
    assert_eq!(adapter.calls(), 3);
    assert!(
        started.elapsed() >= Duration::from_millis(1000),
        "three fetches 500ms apart took {:?}",
        started.elapsed()
    );
}

#[tokio::test]
async fn transient_failure_is_retried() {
    let adapter = ScriptedAdapter::new(|call| match call {
        0 => Err(unavailable()),
        _ => Ok(FetchedPage::last(vec![item("A", 1), item("B", 2)], 0)),
    });

    let report = driver(adapter.clone(), Arc::new(InMemoryCatalogStore::new()))
        .run(session())
        .await;

    assert_clean(&report);
    assert_eq!(adapter.calls(), 2);
    assert_eq!(report.pages, 1);
    assert_eq!(report.new, 2);
}

#[tokio::test]
async fn exhausted_retries_abort_the_run() {
    let adapter = ScriptedAdapter::new(|_| Err(unavailable()));

    let report = driver(adapter.clone(), Arc::new(InMemoryCatalogStore::new()))
        .run(session())
        .await;

    assert_eq!(report.status, RunStatus::Error);
    assert_eq!(report.stop_reason, StopReason::Aborted);
    assert_eq!(adapter.calls(), 3);
    assert_eq!(report.pages, 0);
    assert!(report.error.as_deref().unwrap().contains("503"));
}

#[tokio::test]
async fn rejected_request_is_not_retried() {
    let adapter = ScriptedAdapter::new(|_| Err(AdapterError::UpstreamRejected("bad key".into())));

    let report = driver(adapter.clone(), Arc::new(InMemoryCatalogStore::new()))
        .run(session())
        .await;

    assert_eq!(report.status, RunStatus::Error);
    assert_eq!(adapter.calls(), 1);
}

#[tokio::test]
async fn cancellation_is_honoured_between_pages() {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    let adapter = ScriptedAdapter::new(move |call| {
        trigger.cancel();
        three_pages(call)
    });
    let store = Arc::new(InMemoryCatalogStore::new());

    let report = driver(adapter.clone(), store.clone())
        .with_cancellation(cancel)
        .run(session())
        .await;

    assert_clean(&report);
    assert_eq!(report.stop_reason, StopReason::Cancelled);
    assert_eq!(adapter.calls(), 1);
    assert_eq!(store.len(RAW_CATALOG_TABLE).await, 200);
}

#[tokio::test]
async fn target_stops_after_the_crossing_page() {
    let adapter = ScriptedAdapter::new(three_pages);

    let report = driver(adapter.clone(), Arc::new(InMemoryCatalogStore::new()))
        .with_limits(DriverLimits {
            target: Some(300),
            ..DriverLimits::default()
        })
        .run(session())
        .await;

    assert_clean(&report);
    assert_eq!(report.stop_reason, StopReason::TargetReached);
    assert_eq!(report.pages, 2);
    assert_eq!(report.total_fetched, 400);
}

#[tokio::test]
async fn repeated_keys_in_a_page_keep_counts_balanced() {
    let adapter = ScriptedAdapter::new(|_| {
        Ok(FetchedPage::last(
            vec![item("A", 1), item("B", 1), item("A", 2)],
            0,
        ))
    });
    let store = Arc::new(InMemoryCatalogStore::new());

    let report = driver(adapter, store.clone()).run(session()).await;

    assert_clean(&report);
    assert_eq!(report.duplicates, 1);
    assert_eq!(report.new, 2);
    let a = store.get(RAW_CATALOG_TABLE, "sup-test", "A").await.unwrap();
    assert_eq!(a.payload["price"], json!(2));
}

/// Serves an empty snapshot so every incoming key looks new, while the
/// underlying table already holds rows.
struct StaleIndexStore {
    inner: InMemoryCatalogStore,
}

#[async_trait]
impl CatalogStore for StaleIndexStore {
    async fn select(
        &self,
        _table: &str,
        _filter: &RowFilter,
        _limit: usize,
        _offset: usize,
    ) -> Result<Vec<RawRecord>, StoreError> {
        Ok(Vec::new())
    }

    async fn bulk_insert(&self, table: &str, rows: &[RawRecord]) -> Result<usize, StoreError> {
        self.inner.bulk_insert(table, rows).await
    }

    async fn bulk_upsert(
        &self,
        table: &str,
        rows: &[RawRecord],
        conflict_keys: &[&str],
    ) -> Result<usize, StoreError> {
        self.inner.bulk_upsert(table, rows, conflict_keys).await
    }

    async fn update(&self, table: &str, row: &RawRecord, filter: &RowFilter) -> Result<usize, StoreError> {
        self.inner.update(table, row, filter).await
    }
}

#[tokio::test]
async fn insert_conflicts_from_a_stale_index_fall_back_to_upsert() {
    let ids = || (0..5000).map(|n| format!("C{n:05}"));
    let store = Arc::new(StaleIndexStore {
        inner: InMemoryCatalogStore::new(),
    });
    driver(
        ScriptedAdapter::new(move |call| Ok(page(call, ids(), false))),
        store.clone(),
    )
    .run(session())
    .await;
    let writes_before = store.inner.writes().await.len();

    let report = driver(
        ScriptedAdapter::new(move |call| Ok(page(call, ids(), false))),
        store.clone(),
    )
    .run(session())
    .await;

    assert_clean(&report);
    assert_eq!(report.new, 5000);
    assert_eq!(report.failed_chunks, 0);
    assert_eq!(store.inner.len(RAW_CATALOG_TABLE).await, 5000);
    let ops: Vec<_> = store.inner.writes().await[writes_before..]
        .iter()
        .map(|w| (w.op, w.succeeded))
        .collect();
    assert_eq!(ops, [(WriteOp::Insert, false), (WriteOp::Upsert, true)]);
}
