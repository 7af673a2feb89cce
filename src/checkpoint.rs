//! Query window computation.
//!
//! Nothing is checkpointed explicitly: the resume point is derived from the
//! store every pass. Entries can become visible after later ones were already
//! read, so each window re-reads `overlap` worth of data below the highest
//! stored `receiveTimestamp` and leaves the freshest `upper_bound_margin`
//! for the next pass.

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use std::time::Duration;
use tracing::info;

use crate::config::{IngestTuning, RunScope};
use crate::ingest::IngestError;
use crate::store::LogStore;

/// Bounds and composite filter for one pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryWindow {
    /// `None` when the store is empty: read from the start of retention.
    pub lower_bound: Option<DateTime<Utc>>,
    pub upper_bound: DateTime<Utc>,
    pub filter: String,
}

pub struct CheckpointManager {
    user_filter: Option<String>,
    overlap: Duration,
    upper_bound_margin: Duration,
}

impl CheckpointManager {
    pub fn new(user_filter: Option<String>, tuning: &IngestTuning) -> Self {
        Self {
            user_filter,
            overlap: tuning.overlap,
            upper_bound_margin: tuning.upper_bound_margin,
        }
    }

    /// Reject a store whose first run was started with a different scope.
    ///
    /// Mixing scopes would make the high-watermark meaningless for the new
    /// query. Nothing is written on either outcome.
    pub fn verify_scope(&self, store: &LogStore, current: &RunScope) -> Result<()> {
        let Some(first_run) = store.first_run()? else {
            return Ok(());
        };

        let first = RunScope::from_config_json(&first_run.config)
            .with_context(|| format!("Failed to read scope of run {}", first_run.run_id))?;

        if &first != current {
            return Err(IngestError::ConfigurationDrift {
                first,
                current: current.clone(),
            }
            .into());
        }
        Ok(())
    }

    /// Window for the next pass given the store's current high-watermark.
    pub fn compute_window(&self, store: &LogStore, now: DateTime<Utc>) -> Result<QueryWindow> {
        let upper_bound = now - to_chrono(self.upper_bound_margin)?;

        let watermark = store
            .max_receive_timestamp_rows()?
            .into_iter()
            .find_map(|row| row.receive_timestamp);

        let lower_bound = match watermark {
            Some(ts) => {
                let max = DateTime::parse_from_rfc3339(&ts)
                    .with_context(|| format!("Stored receiveTimestamp is not RFC3339: {}", ts))?
                    .with_timezone(&Utc);
                info!(max_receive_timestamp = %ts, "Resuming from stored high-watermark");
                Some(max - to_chrono(self.overlap)?)
            }
            None => None,
        };

        Ok(QueryWindow {
            lower_bound,
            upper_bound,
            filter: compose_filter(self.user_filter.as_deref(), lower_bound, upper_bound),
        })
    }
}

/// `(<user filter>) AND receiveTimestamp >= "<lower>" AND receiveTimestamp <= "<upper>"`
pub fn compose_filter(
    user_filter: Option<&str>,
    lower_bound: Option<DateTime<Utc>>,
    upper_bound: DateTime<Utc>,
) -> String {
    let mut clauses = Vec::with_capacity(3);
    if let Some(f) = user_filter {
        clauses.push(format!("({})", f));
    }
    if let Some(lower) = lower_bound {
        clauses.push(format!("receiveTimestamp >= \"{}\"", iso(lower)));
    }
    clauses.push(format!("receiveTimestamp <= \"{}\"", iso(upper_bound)));
    clauses.join(" AND ")
}

fn iso(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn to_chrono(d: Duration) -> Result<chrono::Duration> {
    chrono::Duration::from_std(d).context("Duration out of range")
}
