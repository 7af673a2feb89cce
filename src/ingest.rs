//! Run driver for the `download` command.
//!
//! One run = one `runs` row. A run is one pass (backfill) or, in watch
//! mode, passes repeated until shutdown is requested:
//!
//! 1. refuse to start if the store's first run had another scope
//! 2. insert the run row
//! 3. per pass: window from the store -> paginate -> persist each batch
//! 4. stamp `end_ts`
//!
//! Fatal errors (scope drift, an empty final page, storage failures) return
//! early and leave `end_ts` unset.

use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::auth::TokenCache;
use crate::checkpoint::CheckpointManager;
use crate::config::{DownloadConfig, IngestTuning, RunScope};
use crate::gcp::{ListEntriesRequest, PageKind, PageSource};
use crate::paginator::{Paginator, Termination};
use crate::store::LogStore;
use crate::VERSION;

// =============================================================================
// Errors
// =============================================================================

/// Failures that stop a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestError {
    /// The store was started with another resource set or filter.
    ConfigurationDrift { first: RunScope, current: RunScope },
    /// The backend returned a closed page with no entries.
    EmptyFinalPage { page_token: Option<String> },
}

impl std::fmt::Display for IngestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConfigurationDrift { first, current } => write!(
                f,
                "Configuration drift: the store was first used with resource names {:?} and filter {:?}, \
                 this run has resource names {:?} and filter {:?}. Use a new --db for a different scope",
                first.resource_names, first.filter, current.resource_names, current.filter
            ),
            Self::EmptyFinalPage { page_token } => write!(
                f,
                "Logging API returned a final page with no entries (page token {:?})",
                page_token
            ),
        }
    }
}

impl std::error::Error for IngestError {}

// =============================================================================
// Reports
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    pub requests: u64,
    pub batches: u64,
    pub inserted: usize,
    pub skipped: usize,
    pub termination: Option<Termination>,
    /// Most recent page kinds of the pass, oldest first.
    pub recent_pages: Vec<PageKind>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub run_id: i64,
    pub passes: u64,
    pub batches: u64,
    pub inserted: usize,
    pub skipped: usize,
}

impl RunSummary {
    fn absorb(&mut self, pass: &PassReport) {
        self.passes += 1;
        self.batches += pass.batches;
        self.inserted += pass.inserted;
        self.skipped += pass.skipped;
    }
}

// =============================================================================
// Downloader
// =============================================================================

pub struct Downloader {
    config: DownloadConfig,
    tuning: IngestTuning,
    source: Arc<dyn PageSource>,
    tokens: Arc<TokenCache>,
}

impl Downloader {
    pub fn new(
        config: DownloadConfig,
        tuning: IngestTuning,
        source: Arc<dyn PageSource>,
        tokens: Arc<TokenCache>,
    ) -> Self {
        Self {
            config,
            tuning,
            source,
            tokens,
        }
    }

    /// Open the configured store and run until done (or until `shutdown`
    /// turns true in watch mode).
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<RunSummary> {
        let store = LogStore::open(&self.config.db)?;
        self.run_with_store(&store, shutdown).await
    }

    pub async fn run_with_store(
        &self,
        store: &LogStore,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<RunSummary> {
        let checkpoint = CheckpointManager::new(self.config.filter.clone(), &self.tuning);
        checkpoint.verify_scope(store, &self.config.scope())?;

        let run_id = store.begin_run(VERSION, &self.config.to_json()?)?;
        info!(run_id, watch_ms = ?self.config.watch, "Run started");

        let mut summary = RunSummary {
            run_id,
            ..Default::default()
        };

        loop {
            let pass = self.run_pass(store, &checkpoint, run_id).await?;
            summary.absorb(&pass);

            let Some(interval) = self.config.watch_interval() else {
                break;
            };
            if *shutdown.borrow() {
                info!("Shutdown requested, not starting another pass");
                break;
            }

            tokio::select! {
                _ = sleep(interval) => {}
                Ok(()) = shutdown.changed() => {
                    info!("Shutdown requested, not starting another pass");
                    break;
                }
            }
        }

        store.close_run(run_id)?;
        info!(
            run_id,
            passes = summary.passes,
            batches = summary.batches,
            inserted = summary.inserted,
            skipped = summary.skipped,
            "Run closed"
        );
        Ok(summary)
    }

    /// One window, paginated to its end.
    pub async fn run_pass(
        &self,
        store: &LogStore,
        checkpoint: &CheckpointManager,
        run_id: i64,
    ) -> Result<PassReport> {
        let window = checkpoint.compute_window(store, Utc::now())?;
        info!(
            lower_bound = ?window.lower_bound,
            upper_bound = %window.upper_bound,
            "Starting pass"
        );

        let request = ListEntriesRequest::new(
            self.config.resource_names.clone(),
            Some(window.filter),
            self.tuning.page_size,
        );
        let mut paginator = Paginator::new(
            Arc::clone(&self.source),
            Arc::clone(&self.tokens),
            request,
            self.tuning.clone(),
        );

        let mut report = PassReport::default();
        while let Some(batch) = paginator.next_batch().await {
            let started = Instant::now();
            let stats = store.persist(run_id, &batch)?;
            info!(
                total = batch.len(),
                inserted = stats.inserted,
                skipped = stats.skipped,
                ms = started.elapsed().as_millis() as u64,
                "Persisted batch"
            );
            report.batches += 1;
            report.inserted += stats.inserted;
            report.skipped += stats.skipped;
        }

        report.requests = paginator.stats().requests;
        report.termination = paginator.termination().cloned();
        report.recent_pages = paginator.history().recent().collect();

        match &report.termination {
            Some(Termination::EmptyFinalPage { page_token }) => {
                return Err(IngestError::EmptyFinalPage {
                    page_token: page_token.clone(),
                }
                .into());
            }
            Some(Termination::TailReached) | None => {}
            Some(other) => warn!(
                reason = %other,
                recent_pages = ?report.recent_pages,
                "Pass ended before the tail page"
            ),
        }

        Ok(report)
    }
}
