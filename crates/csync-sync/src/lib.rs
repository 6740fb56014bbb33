//! Supplier catalog sync orchestration.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use csync_adapters::{
    build_adapter, offset, AdapterSettings, DocumentFilter, Market, Protocol, QueryFilters,
};
use csync_core::{RunReport, RunStatus, StopReason, RAW_CATALOG_TABLE};
use csync_storage::{
    BackoffPolicy, CatalogStore, HttpClientConfig, HttpFetcher, InMemoryCatalogStore,
    PgCatalogStore,
};
use serde::Deserialize;
use thiserror::Error;
use tokio::fs;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

pub mod driver;
pub mod index;
pub mod persist;
pub mod reconcile;

pub use csync_adapters::{CredentialProvider, EnvCredentialProvider, StaticCredentialProvider};
pub use driver::{DriverLimits, DriverState, PaginationDriver, SessionCounters, SyncSession};
pub use index::ExistingIndex;
pub use persist::{BatchPersister, FlushOutcome, PersistMode};
pub use reconcile::{Classification, PageClassification, ReconciliationEngine};

pub const CRATE_NAME: &str = "csync-sync";

pub const MEMORY_DATABASE_URL: &str = "memory://";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Yaml {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("supplier `{supplier}`: {reason}")]
    Invalid { supplier: String, reason: String },
}

fn default_true() -> bool {
    true
}

fn default_account() -> String {
    "main".to_string()
}

fn default_request_delay_ms() -> u64 {
    1000
}

fn default_chunk_size() -> usize {
    persist::DEFAULT_CHUNK_SIZE
}

fn default_max_pages() -> usize {
    driver::DEFAULT_MAX_PAGES
}

fn default_max_retries() -> usize {
    3
}

#[derive(Debug, Clone, Deserialize)]
pub struct SupplierRegistry {
    pub suppliers: Vec<SupplierConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SupplierConfig {
    pub supplier_id: String,
    pub code: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub protocol: Protocol,
    #[serde(default = "default_account")]
    pub account: String,
    #[serde(default = "default_request_delay_ms")]
    pub request_delay_ms: u64,
    #[serde(default)]
    pub page_size: Option<usize>,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default)]
    pub target: Option<usize>,
    #[serde(default = "default_max_pages")]
    pub max_page_safety_limit: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    #[serde(default)]
    pub markets: Vec<Market>,
    #[serde(default)]
    pub filters: QueryFilters,
    #[serde(default)]
    pub include_runout: bool,
    #[serde(default)]
    pub document: DocumentFilter,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub auth_url: Option<String>,
}

impl SupplierConfig {
    pub fn adapter_settings(&self) -> AdapterSettings {
        AdapterSettings {
            code: self.code.clone(),
            protocol: Some(self.protocol),
            base_url: self.base_url.clone(),
            auth_url: self.auth_url.clone(),
            page_size: self.page_size,
            markets: self.markets.clone(),
            filters: self.filters.clone(),
            include_runout: self.include_runout,
            document: self.document.clone(),
        }
    }

    pub fn limits(&self) -> DriverLimits {
        DriverLimits {
            target: self.target,
            max_pages: self.max_page_safety_limit,
            chunk_size: self.chunk_size,
        }
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            max_retries: self.max_retries,
            ..BackoffPolicy::default()
        }
    }

    fn invalid(&self, reason: impl Into<String>) -> ConfigError {
        ConfigError::Invalid {
            supplier: self.supplier_id.clone(),
            reason: reason.into(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.supplier_id.trim().is_empty() {
            return Err(self.invalid("supplier_id is empty"));
        }
        if self.code.trim().is_empty() {
            return Err(self.invalid("code is empty"));
        }
        if self.chunk_size == 0 {
            return Err(self.invalid("chunk_size must be positive"));
        }
        if self.max_page_safety_limit == 0 {
            return Err(self.invalid("max_page_safety_limit must be positive"));
        }
        if self.page_size == Some(0) {
            return Err(self.invalid("page_size must be positive"));
        }
        if self.protocol == Protocol::OffsetQuery {
            if !self.filters.has_required() {
                return Err(self.invalid("offset_query needs one of keyword, category or seller_id"));
            }
            if self.page_size.is_some_and(|size| size > offset::MAX_PAGE_SIZE) {
                return Err(self.invalid(format!("page_size exceeds {}", offset::MAX_PAGE_SIZE)));
            }
        }
        Ok(())
    }
}

impl SupplierRegistry {
    pub fn from_yaml(text: &str, origin: &str) -> Result<Self, ConfigError> {
        let registry: Self = serde_yaml::from_str(text).map_err(|source| ConfigError::Yaml {
            path: origin.to_string(),
            source,
        })?;
        registry.validate()?;
        Ok(registry)
    }

    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Io {
                path: path.display().to_string(),
                source,
            })?;
        Self::from_yaml(&text, &path.display().to_string())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for supplier in &self.suppliers {
            supplier.validate()?;
            if !seen.insert(supplier.supplier_id.as_str()) {
                return Err(supplier.invalid("duplicate supplier_id"));
            }
        }
        Ok(())
    }

    /// Enabled suppliers, narrowed to `only` (codes or ids) when non-empty.
    pub fn selected<'a>(&'a self, only: &'a [String]) -> impl Iterator<Item = &'a SupplierConfig> + 'a {
        self.suppliers.iter().filter(move |s| {
            s.enabled && (only.is_empty() || only.iter().any(|o| *o == s.code || *o == s.supplier_id))
        })
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub suppliers_file: PathBuf,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub db_max_connections: u32,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| MEMORY_DATABASE_URL.to_string()),
            suppliers_file: std::env::var("CSYNC_SUPPLIERS_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("suppliers.yaml")),
            scheduler_enabled: std::env::var("CSYNC_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: std::env::var("CSYNC_SYNC_CRON")
                .unwrap_or_else(|_| "0 0 3 * * *".to_string()),
            user_agent: std::env::var("CSYNC_USER_AGENT")
                .unwrap_or_else(|_| "csync/0.1".to_string()),
            http_timeout_secs: std::env::var("CSYNC_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(60),
            db_max_connections: std::env::var("CSYNC_DB_MAX_CONNECTIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8),
        }
    }
}

/// `memory://` selects the in-process store; anything else is a Postgres URL.
pub async fn open_store(database_url: &str, max_connections: u32) -> Result<Arc<dyn CatalogStore>> {
    if database_url.starts_with(MEMORY_DATABASE_URL) {
        warn!("using in-memory catalog store; nothing will outlive this process");
        return Ok(Arc::new(InMemoryCatalogStore::new()));
    }
    let store = PgCatalogStore::connect(database_url, max_connections)
        .await
        .context("connecting to catalog database")?;
    Ok(Arc::new(store))
}

pub async fn migrate(database_url: &str) -> Result<()> {
    if database_url.starts_with(MEMORY_DATABASE_URL) {
        info!("in-memory store needs no migrations");
        return Ok(());
    }
    let store = PgCatalogStore::connect(database_url, 1)
        .await
        .context("connecting to catalog database")?;
    store.migrate().await.context("running migrations")?;
    Ok(())
}

fn failed_report(supplier_id: &str, error: String) -> RunReport {
    let now = Utc::now();
    RunReport {
        run_id: Uuid::new_v4(),
        supplier_id: supplier_id.to_string(),
        status: RunStatus::Error,
        stop_reason: StopReason::Aborted,
        started_at: now,
        finished_at: now,
        duration_ms: 0,
        pages: 0,
        total_fetched: 0,
        skipped_upstream: 0,
        duplicates: 0,
        new: 0,
        updated: 0,
        unchanged: 0,
        failed_chunks: 0,
        failed_records: 0,
        error: Some(error),
    }
}

pub struct SyncPipeline {
    config: SyncConfig,
    http: Arc<HttpFetcher>,
    store: Arc<dyn CatalogStore>,
    credentials: Arc<dyn CredentialProvider>,
    cancel: CancellationToken,
    pass_lock: Mutex<()>,
}

/// Waits for every spawned supplier run in spawn order. A task that died
/// (panic or abort) still yields an error report for its supplier.
async fn collect_runs(runs: Vec<(String, JoinHandle<RunReport>)>, reports: &mut Vec<RunReport>) {
    for (supplier_id, handle) in runs {
        match handle.await {
            Ok(report) => reports.push(report),
            Err(err) => {
                error!(supplier = %supplier_id, error = %err, "supplier run task failed");
                reports.push(failed_report(&supplier_id, format!("supplier task failed: {err}")));
            }
        }
    }
}

impl SyncPipeline {
    pub fn new(
        config: SyncConfig,
        store: Arc<dyn CatalogStore>,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?;
        Ok(Self {
            config,
            http: Arc::new(http),
            store,
            credentials,
            cancel: CancellationToken::new(),
            pass_lock: Mutex::new(()),
        })
    }

    pub async fn from_env() -> Result<Self> {
        let config = SyncConfig::from_env();
        let store = open_store(&config.database_url, config.db_max_connections).await?;
        Self::new(config, store, Arc::new(EnvCredentialProvider::default()))
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<dyn CatalogStore> {
        Arc::clone(&self.store)
    }

    /// Token observed by every run between pages.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn load_registry(&self) -> Result<SupplierRegistry> {
        SupplierRegistry::load(&self.config.suppliers_file)
            .await
            .with_context(|| format!("loading {}", self.config.suppliers_file.display()))
    }

    /// Runs every selected supplier concurrently and returns one report per
    /// supplier, ordered by supplier id.
    pub async fn run_once(&self, only: &[String]) -> Result<Vec<RunReport>> {
        let registry = self.load_registry().await?;
        self.run_registry(&registry, only).await
    }

    /// Like [`run_once`](Self::run_once), but returns `None` without running
    /// when another pass on this pipeline has not finished yet.
    pub async fn run_exclusive(&self, only: &[String]) -> Result<Option<Vec<RunReport>>> {
        let Ok(_pass) = self.pass_lock.try_lock() else {
            warn!("previous sync pass still running; skipping this one");
            return Ok(None);
        };
        self.run_once(only).await.map(Some)
    }

    pub async fn run_registry(&self, registry: &SupplierRegistry, only: &[String]) -> Result<Vec<RunReport>> {
        let mut reports = Vec::new();
        let mut runs = Vec::new();

        for supplier in registry.selected(only) {
            let adapter = match build_adapter(&supplier.adapter_settings()) {
                Ok(adapter) => adapter,
                Err(err) => {
                    reports.push(failed_report(&supplier.supplier_id, format!("building adapter: {err}")));
                    continue;
                }
            };
            let credentials = match self.credentials.get_credentials(&supplier.code, &supplier.account) {
                Ok(credentials) => credentials,
                Err(err) => {
                    reports.push(failed_report(&supplier.supplier_id, err.to_string()));
                    continue;
                }
            };

            let driver = PaginationDriver::new(Arc::from(adapter), Arc::clone(&self.http), Arc::clone(&self.store))
                .with_request_delay(Duration::from_millis(supplier.request_delay_ms))
                .with_backoff(supplier.backoff())
                .with_limits(supplier.limits())
                .with_cancellation(self.cancel.clone())
                .with_table(RAW_CATALOG_TABLE);
            let session = SyncSession::new(&supplier.supplier_id, &supplier.account, credentials);
            let handle = tokio::spawn(async move { driver.run(session).await });
            runs.push((supplier.supplier_id.clone(), handle));
        }

        collect_runs(runs, &mut reports).await;
        reports.sort_by(|a, b| a.supplier_id.cmp(&b.supplier_id));

        let failed = reports.iter().filter(|r| !r.is_success()).count();
        info!(suppliers = reports.len(), failed, "sync pass finished");
        Ok(reports)
    }

    pub async fn maybe_build_scheduler(self: &Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let pipeline = Arc::clone(self);
        let cron = self.config.sync_cron.clone();
        let job = Job::new_async(cron.as_str(), move |_uuid, _lock| {
            let pipeline = Arc::clone(&pipeline);
            Box::pin(async move {
                match pipeline.run_exclusive(&[]).await {
                    Ok(Some(reports)) => {
                        let failed = reports.iter().filter(|r| !r.is_success()).count();
                        info!(suppliers = reports.len(), failed, "scheduled sync finished");
                    }
                    Ok(None) => {}
                    Err(err) => error!(error = %err, "scheduled sync failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }
}

pub async fn write_reports(path: &Path, reports: &[RunReport]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let json = serde_json::to_vec_pretty(reports).context("serializing run reports")?;
    fs::write(path, json)
        .await
        .with_context(|| format!("writing {}", path.display()))
}
