//! Sync pipeline orchestration: fetch, normalize, extract, upsert and run bookkeeping.

mod config;
mod tracker;

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use mcf_core::{RunCounts, RunStatus, Source};
use mcf_extract::{extractor_for_config, normalize, Extractor};
use mcf_storage::{HttpFetcher, SqliteStore, Store};
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, info_span, warn, Instrument};

pub use config::{SyncConfig, DEFAULT_CONFIG_PATH, DEFAULT_DATABASE_URL, DEFAULT_SYNC_CRON};
pub use tracker::RunTracker;

pub const CRATE_NAME: &str = "mcf-sync";

/// Sources visited in test mode.
pub const TEST_MODE_SOURCES: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOptions {
    pub max_urls: Option<usize>,
    pub extract_posts: bool,
    pub test_mode: bool,
}

impl RunOptions {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            max_urls: None,
            extract_posts: config.extract_posts,
            test_mode: false,
        }
    }

    pub fn source_limit(&self) -> Option<usize> {
        if self.test_mode {
            Some(TEST_MODE_SOURCES)
        } else {
            self.max_urls
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncRunSummary {
    pub run_id: i64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: RunStatus,
    pub active_sources: usize,
    pub visited_sources: usize,
    pub counts: RunCounts,
    pub price_changes: u64,
    pub abandoned_runs_failed: u64,
    /// `None` when reconciliation was disabled or skipped.
    pub removed_listings: Option<u64>,
}

#[derive(Debug, Default)]
struct PassState {
    seen: HashSet<String>,
    failed_fetches: usize,
}

pub struct SyncPipeline {
    config: SyncConfig,
    store: Arc<dyn Store>,
    http: HttpFetcher,
    extractor: Box<dyn Extractor>,
    run_lock: Mutex<()>,
}

impl SyncPipeline {
    pub fn new(
        config: SyncConfig,
        store: Arc<dyn Store>,
        http: HttpFetcher,
        extractor: Box<dyn Extractor>,
    ) -> Self {
        Self {
            config,
            store,
            http,
            extractor,
            run_lock: Mutex::new(()),
        }
    }

    /// Open the configured database and build the fetcher and extractor from `config`.
    pub async fn connect(config: SyncConfig) -> Result<Self> {
        let store = SqliteStore::connect(&config.database_url)
            .await
            .with_context(|| format!("opening database {}", config.database_url))?;
        let http = HttpFetcher::new(config.http_client_config())?;
        let extractor = extractor_for_config(&config.extractor);
        Ok(Self::new(config, Arc::new(store), http, extractor))
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        self.run_with(&RunOptions::from_config(&self.config)).await
    }

    pub async fn run_with(&self, options: &RunOptions) -> Result<SyncRunSummary> {
        match self.try_run_with(options).await? {
            Some(summary) => Ok(summary),
            None => bail!("a sync run is already in progress"),
        }
    }

    /// Like [`Self::run_with`], but returns `Ok(None)` instead of waiting when a run is active.
    pub async fn try_run_with(&self, options: &RunOptions) -> Result<Option<SyncRunSummary>> {
        let Ok(_guard) = self.run_lock.try_lock() else {
            return Ok(None);
        };
        self.execute(options).await.map(Some)
    }

    async fn execute(&self, options: &RunOptions) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        let abandoned_runs_failed = self
            .store
            .fail_abandoned_runs()
            .await
            .context("sweeping abandoned runs")?;
        if abandoned_runs_failed > 0 {
            warn!(count = abandoned_runs_failed, "finalized abandoned runs as failed");
        }

        let mut sources = self
            .store
            .list_active_sources()
            .await
            .context("listing active sources")?;
        let active_sources = sources.len();
        if let Some(limit) = options.source_limit() {
            sources.truncate(limit);
        }

        let mut tracker = RunTracker::start(self.store.as_ref())
            .await
            .context("starting scrape run")?;
        let run_id = tracker.run_id();
        info!(
            run_id,
            sources = sources.len(),
            active_sources,
            extractor = self.extractor.kind().as_str(),
            "sync run started"
        );

        let outcome = self
            .drive(&sources, active_sources, options, &mut tracker)
            .instrument(info_span!("sync_run", run_id))
            .await;

        let price_changes = tracker.price_changes();
        let removed_listings = match outcome {
            Ok(removed) => removed,
            Err(err) => {
                error!(run_id, error = %err, "sync run aborted");
                if let Err(finalize_err) = tracker
                    .complete(self.store.as_ref(), RunStatus::Failed)
                    .await
                {
                    error!(run_id, error = %finalize_err, "could not mark run failed");
                }
                return Err(err.context(format!("scrape run {run_id} failed")));
            }
        };

        let counts = tracker
            .complete(self.store.as_ref(), RunStatus::Completed)
            .await
            .context("completing scrape run")?;
        info!(
            run_id,
            urls_processed = counts.urls_processed,
            listings_found = counts.listings_found,
            new_listings = counts.new_listings,
            price_changes,
            new_posts = counts.new_posts,
            errors = counts.errors,
            "sync run complete"
        );

        Ok(SyncRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            status: RunStatus::Completed,
            active_sources,
            visited_sources: sources.len(),
            counts,
            price_changes,
            abandoned_runs_failed,
            removed_listings,
        })
    }

    async fn drive(
        &self,
        sources: &[Source],
        active_sources: usize,
        options: &RunOptions,
        tracker: &mut RunTracker,
    ) -> Result<Option<u64>> {
        let mut pass = PassState::default();
        for (index, source) in sources.iter().enumerate() {
            if index > 0 {
                tokio::time::sleep(self.config.pause_between_sources()).await;
            }
            self.process_source(source, options, tracker, &mut pass)
                .instrument(info_span!("source", url = %source.url))
                .await?;
        }
        self.reconcile(&pass, sources.len(), active_sources).await
    }

    async fn process_source(
        &self,
        source: &Source,
        options: &RunOptions,
        tracker: &mut RunTracker,
        pass: &mut PassState,
    ) -> Result<()> {
        tracker.record_source();

        let page = match self.http.fetch(&source.url).await {
            Ok(page) => page,
            Err(failure) => {
                error!(attempts = failure.attempts, error = %failure.last, "fetch failed");
                tracker.record_error();
                pass.failed_fetches += 1;
                self.store
                    .record_fetch_outcome(&source.url, Some(&failure.last.to_string()))
                    .await
                    .context("recording fetch failure")?;
                return Ok(());
            }
        };

        if page.was_redirected() {
            debug!(final_url = %page.final_url, "followed redirect");
        }
        let normalized = normalize(&page.body);
        let listings = self
            .extractor
            .extract_listings(&normalized, &source.url)
            .await;
        for candidate in &listings {
            let upsert = self
                .store
                .upsert_listing(candidate)
                .await
                .context("upserting listing")?;
            if upsert.is_new {
                info!(id = %upsert.id, address = ?candidate.address, "new listing");
            } else if upsert.has_price_change {
                info!(id = %upsert.id, price = ?candidate.price_raw, "price change");
            }
            pass.seen.insert(upsert.id.clone());
            tracker.record_listing(&upsert);
        }

        let mut post_count = 0usize;
        if options.extract_posts {
            let posts = self.extractor.extract_posts(&normalized, &source.url).await;
            post_count = posts.len();
            for candidate in &posts {
                let upsert = self
                    .store
                    .upsert_blog_post(candidate)
                    .await
                    .context("upserting blog post")?;
                if upsert.is_new {
                    info!(id = %upsert.id, post_url = %candidate.post_url, "new blog post");
                }
                tracker.record_post(&upsert);
            }
        }

        self.store
            .record_fetch_outcome(&source.url, None)
            .await
            .context("recording fetch success")?;
        info!(
            listings = listings.len(),
            posts = post_count,
            attempts = page.attempts,
            "source processed"
        );
        Ok(())
    }

    /// Removal sweep, only after a pass that visited and fetched every active source.
    async fn reconcile(
        &self,
        pass: &PassState,
        visited: usize,
        active_sources: usize,
    ) -> Result<Option<u64>> {
        if !self.config.reconcile_removed {
            return Ok(None);
        }
        if visited < active_sources || pass.failed_fetches > 0 {
            warn!(
                visited,
                active_sources,
                failed_fetches = pass.failed_fetches,
                "skipping removal reconciliation after a partial pass"
            );
            return Ok(None);
        }
        let removed = self
            .store
            .mark_unseen_listings_removed(&pass.seen)
            .await
            .context("reconciling removed listings")?;
        Ok(Some(removed))
    }

    /// Cron-driven runs when the scheduler is enabled. Overlapping triggers are skipped.
    pub async fn maybe_build_scheduler(self: &Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let cron = self.config.sync_cron.clone();
        let pipeline = Arc::clone(self);
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let pipeline = Arc::clone(&pipeline);
            Box::pin(async move {
                let options = RunOptions::from_config(&pipeline.config);
                match pipeline.try_run_with(&options).await {
                    Ok(Some(summary)) => info!(run_id = summary.run_id, "scheduled sync finished"),
                    Ok(None) => warn!("previous sync still running, skipping scheduled trigger"),
                    Err(err) => error!(error = %err, "scheduled sync failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }
}

/// One-shot run against the configured database, as driven by `mcf-cli sync`.
pub async fn run_sync_once(config: SyncConfig, options: &RunOptions) -> Result<SyncRunSummary> {
    let pipeline = SyncPipeline::connect(config).await?;
    pipeline.run_with(options).await
}
