//! Cycle orchestration: fetch, extract, reconcile, detect staleness, report.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use hlt_adapters::{ListingSource, OfferListSource};
use hlt_core::{derive_key, Listing, Record, UpsertOutcome};
use hlt_storage::{
    BackoffPolicy, FileStore, HttpClientConfig, HttpFetcher, PageArchive, PgStore, RecordStore,
};
use serde::{Deserialize, Serialize};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "hlt-sync";

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub display_name: String,
    pub enabled: bool,
    pub listing_url: String,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CycleConfig {
    /// Postgres store when set; JSON file store at `store_path` otherwise.
    pub database_url: Option<String>,
    pub store_path: PathBuf,
    pub archive_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub sources_path: PathBuf,
    pub scheduler_enabled: bool,
    pub cycle_cron: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    /// Retries per listing against an unavailable store.
    pub store_retry_limit: usize,
    /// Listings allowed to exhaust their retries before the cycle aborts.
    pub store_failure_budget: usize,
    /// Upper bound on result pages walked per source.
    pub max_pages: u32,
}

impl CycleConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL").ok(),
            store_path: std::env::var("HLT_STORE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data/records.json")),
            archive_dir: std::env::var("HLT_ARCHIVE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./archive")),
            reports_dir: std::env::var("HLT_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./reports")),
            sources_path: std::env::var("HLT_SOURCES_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./sources.yaml")),
            scheduler_enabled: std::env::var("HLT_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            cycle_cron: std::env::var("HLT_CYCLE_CRON")
                .unwrap_or_else(|_| "0 0 * * * *".to_string()),
            user_agent: std::env::var("HLT_USER_AGENT")
                .unwrap_or_else(|_| "hlt-bot/0.1".to_string()),
            http_timeout_secs: std::env::var("HLT_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            store_retry_limit: std::env::var("HLT_STORE_RETRY_LIMIT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(3),
            store_failure_budget: std::env::var("HLT_STORE_FAILURE_BUDGET")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(10),
            max_pages: std::env::var("HLT_MAX_PAGES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(50),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sources_scanned: usize,
    pub pages_fetched: usize,
    pub listings_observed: usize,
    pub unchanged: usize,
    pub skipped_malformed: usize,
    pub skipped_store_failures: usize,
    /// False when total fetch failure made the cycle skip staleness marking.
    pub staleness_checked: bool,
    pub created: Vec<Listing>,
    pub changed: Vec<Listing>,
    pub expired: Vec<Record>,
}

impl CycleSummary {
    pub fn has_changes(&self) -> bool {
        !(self.created.is_empty() && self.changed.is_empty() && self.expired.is_empty())
    }
}

/// Receives the finished cycle summary. Implementations must treat a
/// summary without changes as a no-op.
pub trait Notifier: Send + Sync {
    fn notify(&self, summary: &CycleSummary) -> Result<()>;
}

#[derive(Default)]
pub struct NoopNotifier;

impl Notifier for NoopNotifier {
    fn notify(&self, _summary: &CycleSummary) -> Result<()> {
        Ok(())
    }
}

/// Renders a per-run markdown brief and a JSON delta document under
/// `reports/<run_id>/`.
pub struct ReportNotifier {
    reports_dir: PathBuf,
}

impl ReportNotifier {
    pub fn new(reports_dir: impl Into<PathBuf>) -> Self {
        Self {
            reports_dir: reports_dir.into(),
        }
    }
}

impl Notifier for ReportNotifier {
    fn notify(&self, summary: &CycleSummary) -> Result<()> {
        if !summary.has_changes() {
            return Ok(());
        }

        let run_dir = self.reports_dir.join(summary.run_id.to_string());
        std::fs::create_dir_all(&run_dir)
            .with_context(|| format!("creating {}", run_dir.display()))?;

        let mut brief = format!(
            "# HLT Cycle Brief\n\n- Run ID: `{}`\n- Started: {}\n- Finished: {}\n- Sources scanned: {}\n- Pages fetched: {}\n- Listings observed: {}\n",
            summary.run_id,
            summary.started_at,
            summary.finished_at,
            summary.sources_scanned,
            summary.pages_fetched,
            summary.listings_observed,
        );

        brief.push_str(&format!("\n## New offers ({})\n", summary.created.len()));
        for listing in &summary.created {
            brief.push_str(&format!(
                "- {} ({} zł, {} m²): {}\n",
                listing.title, listing.price, listing.area, listing.reference
            ));
        }

        brief.push_str(&format!("\n## Price changes ({})\n", summary.changed.len()));
        for listing in &summary.changed {
            brief.push_str(&format!(
                "- {} now {} zł: {}\n",
                listing.title, listing.price, listing.reference
            ));
        }

        brief.push_str(&format!("\n## Gone offers ({})\n", summary.expired.len()));
        for record in &summary.expired {
            brief.push_str(&format!(
                "- {} (last price {} zł): {}\n",
                record.title, record.price, record.reference
            ));
        }

        std::fs::write(run_dir.join("cycle_brief.md"), brief).context("writing cycle_brief.md")?;

        let delta = serde_json::to_vec_pretty(summary).context("serializing cycle delta")?;
        std::fs::write(run_dir.join("cycle_delta.json"), delta)
            .context("writing cycle_delta.json")?;

        Ok(())
    }
}

#[derive(Default)]
struct CycleAccumulator {
    observed: HashSet<i64>,
    created: Vec<Listing>,
    changed: Vec<Listing>,
    unchanged: usize,
    pages_fetched: usize,
    listings_observed: usize,
    skipped_malformed: usize,
    skipped_store_failures: usize,
}

/// Drives one full ingestion cycle: every enabled source, every result page,
/// every listing through identity derivation and the store's upsert, then a
/// single staleness pass and the summary hand-off.
///
/// Holds no state between cycles beyond what the store persists.
pub struct CycleRunner {
    config: CycleConfig,
    store: Arc<dyn RecordStore>,
    fetcher: HttpFetcher,
    archive: PageArchive,
    notifier: Box<dyn Notifier>,
    store_backoff: BackoffPolicy,
}

impl CycleRunner {
    pub async fn from_config(config: CycleConfig) -> Result<Self> {
        let store: Arc<dyn RecordStore> = match &config.database_url {
            Some(url) => Arc::new(PgStore::connect(url).await?),
            None => Arc::new(FileStore::open(&config.store_path).await?),
        };
        let fetcher = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?;
        let archive = PageArchive::new(config.archive_dir.clone());
        let notifier = Box::new(ReportNotifier::new(config.reports_dir.clone()));
        Ok(Self {
            config,
            store,
            fetcher,
            archive,
            notifier,
            store_backoff: BackoffPolicy::default(),
        })
    }

    pub fn with_notifier(mut self, notifier: Box<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn config(&self) -> &CycleConfig {
        &self.config
    }

    pub async fn run_cycle(&self) -> Result<CycleSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let registry = self.load_source_registry().await?;
        let enabled: Vec<_> = registry.sources.into_iter().filter(|s| s.enabled).collect();
        info!(%run_id, sources = enabled.len(), "cycle started");

        let mut acc = CycleAccumulator::default();
        for source in &enabled {
            self.scan_source(run_id, source, &mut acc).await?;
        }

        let (expired, staleness_checked) = self.detect_outdated(&acc.observed, Utc::now()).await;

        let finished_at = Utc::now();
        let summary = CycleSummary {
            run_id,
            started_at,
            finished_at,
            sources_scanned: enabled.len(),
            pages_fetched: acc.pages_fetched,
            listings_observed: acc.listings_observed,
            unchanged: acc.unchanged,
            skipped_malformed: acc.skipped_malformed,
            skipped_store_failures: acc.skipped_store_failures,
            staleness_checked,
            created: acc.created,
            changed: acc.changed,
            expired,
        };

        if let Err(err) = self.notifier.notify(&summary) {
            error!(%err, "cycle notification failed");
        }

        info!(
            %run_id,
            created = summary.created.len(),
            changed = summary.changed.len(),
            expired = summary.expired.len(),
            unchanged = summary.unchanged,
            "cycle finished"
        );
        Ok(summary)
    }

    async fn load_source_registry(&self) -> Result<SourceRegistry> {
        let path = &self.config.sources_path;
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    /// Walks one source's result pages until the source signals the end:
    /// a redirect/error status, an empty page, or a network failure.
    async fn scan_source(
        &self,
        run_id: Uuid,
        source: &SourceConfig,
        acc: &mut CycleAccumulator,
    ) -> Result<()> {
        let adapter = OfferListSource::new(&source.source_id, &source.listing_url);

        for page in 1..=self.config.max_pages {
            let url = adapter.page_url(page);
            let response = match self.fetcher.fetch(run_id, &source.source_id, &url).await {
                Ok(response) => response,
                Err(err) => {
                    warn!(source_id = %source.source_id, %url, %err, "fetch failed; source abandoned for this cycle");
                    break;
                }
            };
            if response.status.as_u16() >= 300 {
                debug!(source_id = %source.source_id, status = %response.status, page, "pagination ended");
                break;
            }
            acc.pages_fetched += 1;

            if let Err(err) = self
                .archive
                .archive(Utc::now(), &source.source_id, &response.body)
                .await
            {
                warn!(source_id = %source.source_id, %err, "page snapshot not archived");
            }

            let body = String::from_utf8_lossy(&response.body);
            let listings = match adapter.extract(&body) {
                Ok(listings) => listings,
                Err(err) => {
                    warn!(source_id = %source.source_id, %err, "extraction failed; source abandoned for this cycle");
                    break;
                }
            };
            if listings.is_empty() {
                debug!(source_id = %source.source_id, page, "empty result page; pagination ended");
                break;
            }

            for listing in listings {
                acc.listings_observed += 1;
                self.reconcile_listing(listing, Utc::now(), acc).await?;
            }
        }
        Ok(())
    }

    /// Reconciles one listing against the store. Malformed references and
    /// listings that exhaust their store retries are skipped; an `Err` means
    /// the cycle-wide store failure budget ran out and the cycle must abort.
    async fn reconcile_listing(
        &self,
        listing: Listing,
        now: DateTime<Utc>,
        acc: &mut CycleAccumulator,
    ) -> Result<()> {
        let key = match derive_key(&listing.reference) {
            Ok(key) => key,
            Err(err) => {
                warn!(reference = %listing.reference, %err, "listing skipped");
                acc.skipped_malformed += 1;
                return Ok(());
            }
        };

        let mut attempt = 0;
        loop {
            match self.store.upsert(key, &listing, now).await {
                Ok(outcome) => {
                    acc.observed.insert(key);
                    match outcome {
                        UpsertOutcome::Created => acc.created.push(listing),
                        UpsertOutcome::PriceChanged => acc.changed.push(listing),
                        UpsertOutcome::Unchanged => acc.unchanged += 1,
                    }
                    return Ok(());
                }
                Err(err) if err.is_retryable() && attempt < self.config.store_retry_limit => {
                    warn!(key, attempt, %err, "store upsert failed; retrying");
                    tokio::time::sleep(self.store_backoff.delay_for_attempt(attempt)).await;
                    attempt += 1;
                }
                Err(err) => {
                    warn!(key, %err, "listing skipped after exhausting store retries");
                    acc.skipped_store_failures += 1;
                    if acc.skipped_store_failures > self.config.store_failure_budget {
                        bail!(
                            "record store failed for {} listings this cycle; aborting",
                            acc.skipped_store_failures
                        );
                    }
                    return Ok(());
                }
            }
        }
    }

    /// Runs the staleness pass, unless the cycle observed nothing at all:
    /// an empty observed set means total fetch failure, and marking against
    /// it would expire every live record.
    async fn detect_outdated(
        &self,
        observed: &HashSet<i64>,
        now: DateTime<Utc>,
    ) -> (Vec<Record>, bool) {
        if observed.is_empty() {
            warn!("no listings observed this cycle; skipping staleness detection");
            return (Vec::new(), false);
        }
        match self.store.mark_outdated(observed, now).await {
            Ok(expired) => (expired, true),
            Err(err) => {
                error!(%err, "staleness detection aborted");
                (Vec::new(), true)
            }
        }
    }
}

/// One-shot entry point used by the CLI: build a runner from the
/// environment and run a single cycle.
pub async fn run_cycle_once_from_env() -> Result<CycleSummary> {
    let runner = CycleRunner::from_config(CycleConfig::from_env()).await?;
    runner.run_cycle().await
}

/// Cron-driven cycles, or `None` when scheduling is disabled. The schedule
/// fires one cycle at a time; an in-flight cycle's failure is logged, never
/// propagated to the scheduler.
pub async fn maybe_build_scheduler(runner: Arc<CycleRunner>) -> Result<Option<JobScheduler>> {
    if !runner.config().scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = runner.config().cycle_cron.clone();
    let job = Job::new_async(cron.as_str(), move |_uuid, _lock| {
        let runner = runner.clone();
        Box::pin(async move {
            match runner.run_cycle().await {
                Ok(summary) => info!(
                    run_id = %summary.run_id,
                    created = summary.created.len(),
                    changed = summary.changed.len(),
                    expired = summary.expired.len(),
                    "scheduled cycle finished"
                ),
                Err(err) => error!(%err, "scheduled cycle failed"),
            }
        })
    })
    .with_context(|| format!("creating cycle job for cron {cron}"))?;
    sched.add(job).await.context("adding cycle job")?;
    Ok(Some(sched))
}
