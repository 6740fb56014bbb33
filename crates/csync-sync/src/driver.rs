//! Per-supplier fetch → classify → persist loop.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use csync_adapters::{AdapterContext, AdapterError, Cursor, FetchedPage, SourceAdapter};
use csync_core::{Credentials, RunReport, RunStatus, StopReason, RAW_CATALOG_TABLE};
use csync_storage::{BackoffPolicy, CatalogStore, HttpFetcher, RateLimiter, RetryDisposition};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Instrument};

use crate::index::ExistingIndex;
use crate::persist::{BatchPersister, PersistMode, DEFAULT_CHUNK_SIZE};
use crate::reconcile::ReconciliationEngine;

pub const DEFAULT_MAX_PAGES: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    Init,
    Fetching,
    Classifying,
    Persisting,
    Done,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverLimits {
    /// Stop once this many items have been fetched. The page that crosses
    /// the target is still processed in full.
    pub target: Option<usize>,
    pub max_pages: usize,
    pub chunk_size: usize,
}

impl Default for DriverLimits {
    fn default() -> Self {
        Self {
            target: None,
            max_pages: DEFAULT_MAX_PAGES,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionCounters {
    pub pages: usize,
    pub fetched: usize,
    pub skipped_upstream: usize,
    pub duplicates: usize,
    pub new: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub failed_chunks: usize,
    pub failed_records: usize,
}

/// State of one supplier run: who we are fetching for, where we are and
/// what has happened so far.
#[derive(Debug, Clone)]
pub struct SyncSession {
    pub ctx: AdapterContext,
    pub cursor: Cursor,
    pub state: DriverState,
    pub counters: SessionCounters,
    pub started_at: DateTime<Utc>,
}

impl SyncSession {
    pub fn new(supplier_id: &str, account: &str, credentials: Credentials) -> Self {
        Self {
            ctx: AdapterContext::new(supplier_id, account, credentials),
            cursor: Cursor::Start,
            state: DriverState::Init,
            counters: SessionCounters::default(),
            started_at: Utc::now(),
        }
    }

    pub fn supplier_id(&self) -> &str {
        &self.ctx.supplier_id
    }

    fn report(&self, stop_reason: StopReason, error: Option<String>) -> RunReport {
        let finished_at = Utc::now();
        let status = match self.state {
            DriverState::Aborted => RunStatus::Error,
            _ => RunStatus::Success,
        };
        RunReport {
            run_id: self.ctx.run_id,
            supplier_id: self.ctx.supplier_id.clone(),
            status,
            stop_reason,
            started_at: self.started_at,
            finished_at,
            duration_ms: (finished_at - self.started_at).num_milliseconds().max(0) as u64,
            pages: self.counters.pages,
            total_fetched: self.counters.fetched,
            skipped_upstream: self.counters.skipped_upstream,
            duplicates: self.counters.duplicates,
            new: self.counters.new,
            updated: self.counters.updated,
            unchanged: self.counters.unchanged,
            failed_chunks: self.counters.failed_chunks,
            failed_records: self.counters.failed_records,
            error,
        }
    }
}

pub struct PaginationDriver {
    adapter: Arc<dyn SourceAdapter>,
    http: Arc<HttpFetcher>,
    store: Arc<dyn CatalogStore>,
    table: String,
    limiter: RateLimiter,
    backoff: BackoffPolicy,
    limits: DriverLimits,
    cancel: CancellationToken,
}

impl PaginationDriver {
    pub fn new(
        adapter: Arc<dyn SourceAdapter>,
        http: Arc<HttpFetcher>,
        store: Arc<dyn CatalogStore>,
    ) -> Self {
        Self {
            adapter,
            http,
            store,
            table: RAW_CATALOG_TABLE.to_string(),
            limiter: RateLimiter::unlimited(),
            backoff: BackoffPolicy::default(),
            limits: DriverLimits::default(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_request_delay(mut self, delay: Duration) -> Self {
        self.limiter = RateLimiter::new(delay);
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_limits(mut self, limits: DriverLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_table(mut self, table: &str) -> Self {
        self.table = table.to_string();
        self
    }

    /// Runs the session to completion. Failures end up in the report rather
    /// than an `Err`; already persisted chunks stay persisted.
    pub async fn run(&self, mut session: SyncSession) -> RunReport {
        let span = tracing::info_span!(
            "supplier_sync",
            supplier_id = %session.ctx.supplier_id,
            run_id = %session.ctx.run_id,
            supplier = self.adapter.supplier_code(),
        );
        async move {
            let (stop_reason, error) = self.drive(&mut session).await;
            let report = session.report(stop_reason, error);
            if report.is_success() {
                info!(
                    stop_reason = ?report.stop_reason,
                    pages = report.pages,
                    fetched = report.total_fetched,
                    new = report.new,
                    updated = report.updated,
                    unchanged = report.unchanged,
                    failed_chunks = report.failed_chunks,
                    duration_ms = report.duration_ms,
                    "supplier run finished"
                );
            } else {
                error!(
                    pages = report.pages,
                    fetched = report.total_fetched,
                    error = report.error.as_deref().unwrap_or_default(),
                    "supplier run aborted"
                );
            }
            report
        }
        .instrument(span)
        .await
    }

    async fn drive(&self, session: &mut SyncSession) -> (StopReason, Option<String>) {
        session.state = DriverState::Init;
        let mut index = match ExistingIndex::load(self.store.as_ref(), &self.table, session.supplier_id()).await {
            Ok(index) => index,
            Err(err) => {
                session.state = DriverState::Aborted;
                return (StopReason::Aborted, Some(format!("loading existing index: {err}")));
            }
        };
        info!(existing = index.len(), "existing index loaded");

        if let Err(err) = self.authenticate(session).await {
            session.state = DriverState::Aborted;
            return (StopReason::Aborted, Some(format!("authenticating: {err}")));
        }

        let engine = ReconciliationEngine::new(
            session.supplier_id(),
            self.adapter.collection_method(),
            &self.adapter.collection_source(),
        );
        let persister = BatchPersister::new(Arc::clone(&self.store), &self.table);

        loop {
            if self.cancel.is_cancelled() {
                info!(pages = session.counters.pages, "cancelled between pages");
                session.state = DriverState::Done;
                return (StopReason::Cancelled, None);
            }
            if let Some(target) = self.limits.target {
                if session.counters.fetched >= target {
                    session.state = DriverState::Done;
                    return (StopReason::TargetReached, None);
                }
            }
            if session.counters.pages >= self.limits.max_pages {
                warn!(max_pages = self.limits.max_pages, "page safety limit reached");
                session.state = DriverState::Done;
                return (StopReason::SafetyLimit, None);
            }

            session.state = DriverState::Fetching;
            let page = match self.fetch_page(session).await {
                Ok(page) => page,
                Err(err) => {
                    session.state = DriverState::Aborted;
                    return (StopReason::Aborted, Some(err.to_string()));
                }
            };
            session.counters.pages += 1;
            session.counters.skipped_upstream += page.skipped_upstream;

            if page.items.is_empty()
                && page.skipped_upstream == 0
                && page.has_more
                && !page.segment_exhausted
            {
                let err = AdapterError::StallDetected(session.cursor.clone());
                session.state = DriverState::Aborted;
                return (StopReason::Aborted, Some(err.to_string()));
            }

            let FetchedPage {
                items,
                next,
                has_more,
                ..
            } = page;
            session.counters.fetched += items.len();

            session.state = DriverState::Classifying;
            let classified = engine.classify_page(&index, items);
            session.counters.new += classified.new.len();
            session.counters.updated += classified.updated.len();
            session.counters.unchanged += classified.unchanged;
            session.counters.duplicates += classified.duplicates;

            session.state = DriverState::Persisting;
            let chunk_size = self.limits.chunk_size;
            let mut outcome = persister
                .flush(&classified.new, PersistMode::Insert, chunk_size)
                .await;
            outcome.merge(
                persister
                    .flush(&classified.updated, PersistMode::Upsert, chunk_size)
                    .await,
            );
            session.counters.failed_chunks += outcome.failed_chunks;
            session.counters.failed_records += outcome.failed_records;

            // Keys that failed to persist stay out of the index so a repeat on
            // a later page gets another chance.
            for record in classified.new.into_iter().chain(classified.updated) {
                if !outcome.failed_keys.contains(&record.supplier_product_id) {
                    index.record(record.supplier_product_id, record.content_hash);
                }
            }

            info!(
                page = session.counters.pages,
                fetched = session.counters.fetched,
                written = outcome.written,
                unchanged = classified.unchanged,
                failed_chunks = outcome.failed_chunks,
                "page reconciled"
            );

            if !has_more {
                session.state = DriverState::Done;
                return (StopReason::Exhausted, None);
            }
            match next {
                Some(cursor) => session.cursor = cursor,
                None => {
                    session.state = DriverState::Aborted;
                    return (
                        StopReason::Aborted,
                        Some("adapter reported more data without a next cursor".into()),
                    );
                }
            }
        }
    }

    async fn authenticate(&self, session: &mut SyncSession) -> Result<(), AdapterError> {
        let mut attempt = 0;
        loop {
            self.limiter.wait().await;
            match self.adapter.authenticate(&self.http, &mut session.ctx).await {
                Ok(()) => return Ok(()),
                Err(err) => self.back_off_or_fail(err, &mut attempt, "authenticate").await?,
            }
        }
    }

    async fn fetch_page(&self, session: &SyncSession) -> Result<FetchedPage, AdapterError> {
        let mut attempt = 0;
        loop {
            self.limiter.wait().await;
            match self.adapter.fetch(&self.http, &session.ctx, &session.cursor).await {
                Ok(page) => return Ok(page),
                Err(err) => self.back_off_or_fail(err, &mut attempt, "fetch").await?,
            }
        }
    }

    async fn back_off_or_fail(
        &self,
        err: AdapterError,
        attempt: &mut usize,
        action: &str,
    ) -> Result<(), AdapterError> {
        if err.disposition() != RetryDisposition::Retryable || !self.backoff.allows_retry(*attempt) {
            return Err(err);
        }
        let delay = self.backoff.jittered_delay_for_attempt(*attempt);
        warn!(
            action,
            attempt = *attempt + 1,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "transient failure; backing off"
        );
        tokio::time::sleep(delay).await;
        *attempt += 1;
        Ok(())
    }
}
