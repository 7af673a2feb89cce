//! Download configuration and ingest tuning.
//!
//! `DownloadConfig` is what a run records in the `runs` table; its
//! `RunScope` projection (resource names + filter) must never change for
//! the lifetime of a store.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_API_BASE: &str = "https://logging.googleapis.com";

// =============================================================================
// Tuning
// =============================================================================

/// Timing constants and stuck-loop limits.
///
/// Defaults were tuned against Cloud Logging; a different backend may need
/// other values, so everything can be overridden from `LILO_*` variables.
#[derive(Debug, Clone)]
pub struct IngestTuning {
    /// Sleep between polls while the server computes or waits for data.
    pub poll_interval: Duration,
    /// Sleep after a network error or a non-429 HTTP error.
    pub retry_backoff: Duration,
    /// Sleep after HTTP 429.
    pub quota_backoff: Duration,
    /// Consecutive `WaitingForFutureEvent` pages tolerated before the pass ends.
    pub future_event_limit: u32,
    /// Consecutive `WaitingForServerCompute` pages tolerated before the pass ends.
    pub server_compute_limit: u32,
    /// Consecutive malformed responses tolerated before the pass ends.
    pub protocol_violation_limit: u32,
    /// Re-read margin subtracted from the stored high-watermark.
    pub overlap: Duration,
    /// Distance kept from the live edge of the log.
    pub upper_bound_margin: Duration,
    /// `pageSize` hint sent with every list request.
    pub page_size: u32,
    /// How long a bearer token is reused before a new one is requested.
    pub token_lifetime: Duration,
    /// Upper bound on one run of the credential command.
    pub token_command_timeout: Duration,
    /// Watch interval used when `--watch` is given without a value.
    pub default_watch_interval: Duration,
}

impl Default for IngestTuning {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(2_000),
            retry_backoff: Duration::from_millis(2_000),
            quota_backoff: Duration::from_millis(10_000),
            future_event_limit: 2,
            server_compute_limit: 30,
            protocol_violation_limit: 3,
            overlap: Duration::from_millis(60_000),
            upper_bound_margin: Duration::from_millis(2_000),
            page_size: 1000,
            token_lifetime: Duration::from_secs(10 * 60),
            token_command_timeout: Duration::from_millis(30_000),
            default_watch_interval: Duration::from_millis(2_000),
        }
    }
}

impl IngestTuning {
    pub fn from_env() -> Self {
        let mut tuning = Self::default();

        if let Some(ms) = env_parse::<u64>("LILO_POLL_INTERVAL_MS") {
            tuning.poll_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("LILO_RETRY_BACKOFF_MS") {
            tuning.retry_backoff = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("LILO_QUOTA_BACKOFF_MS") {
            tuning.quota_backoff = Duration::from_millis(ms);
        }
        if let Some(n) = env_parse("LILO_FUTURE_EVENT_LIMIT") {
            tuning.future_event_limit = n;
        }
        if let Some(n) = env_parse("LILO_SERVER_COMPUTE_LIMIT") {
            tuning.server_compute_limit = n;
        }
        if let Some(n) = env_parse("LILO_PROTOCOL_VIOLATION_LIMIT") {
            tuning.protocol_violation_limit = n;
        }
        if let Some(ms) = env_parse::<u64>("LILO_OVERLAP_MS") {
            tuning.overlap = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("LILO_UPPER_BOUND_MARGIN_MS") {
            tuning.upper_bound_margin = Duration::from_millis(ms);
        }
        if let Some(n) = env_parse("LILO_PAGE_SIZE") {
            tuning.page_size = n;
        }
        if let Some(secs) = env_parse::<u64>("LILO_TOKEN_LIFETIME_SECS") {
            tuning.token_lifetime = Duration::from_secs(secs);
        }
        if let Some(ms) = env_parse::<u64>("LILO_TOKEN_COMMAND_TIMEOUT_MS") {
            tuning.token_command_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("LILO_DEFAULT_WATCH_MS") {
            tuning.default_watch_interval = Duration::from_millis(ms);
        }

        tuning
    }

    /// Zero-delay tuning with the default limits. Used by tests and local replays.
    pub fn immediate() -> Self {
        Self {
            poll_interval: Duration::ZERO,
            retry_backoff: Duration::ZERO,
            quota_backoff: Duration::ZERO,
            default_watch_interval: Duration::ZERO,
            ..Self::default()
        }
    }
}

/// Base URL of the logging API, overridable for proxies and tests.
pub fn api_base_from_env() -> String {
    std::env::var("LILO_LOGGING_API_URL")
        .ok()
        .map(|v| v.trim().trim_end_matches('/').to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| DEFAULT_API_BASE.to_string())
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

// =============================================================================
// Download command
// =============================================================================

/// Validated arguments of the `download` command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadConfig {
    pub resource_names: Vec<String>,
    pub filter: Option<String>,
    pub db: PathBuf,
    /// Delay between passes in milliseconds; `None` runs a single pass.
    pub watch: Option<u64>,
}

/// The part of a download config that decides which entries end up in the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunScope {
    pub resource_names: Vec<String>,
    #[serde(default)]
    pub filter: Option<String>,
}

impl DownloadConfig {
    pub fn new(
        resource_names_arg: &str,
        filter: Option<String>,
        db: PathBuf,
        watch: Option<Duration>,
    ) -> Result<Self> {
        let resource_names = parse_resource_names(resource_names_arg)?;

        if db.as_os_str().is_empty() {
            bail!("--db must not be empty");
        }

        let watch = match watch {
            Some(d) => match u64::try_from(d.as_millis()) {
                Ok(ms) => Some(ms),
                Err(_) => bail!("--watch interval is too large: {:?}", d),
            },
            None => None,
        };

        Ok(Self {
            resource_names,
            filter: normalize_filter(filter),
            db,
            watch,
        })
    }

    pub fn scope(&self) -> RunScope {
        RunScope {
            resource_names: self.resource_names.clone(),
            filter: self.filter.clone(),
        }
    }

    pub fn watch_interval(&self) -> Option<Duration> {
        self.watch.map(Duration::from_millis)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).context("Failed to serialize download config")
    }
}

impl RunScope {
    /// Extract the scope from a run's stored config JSON.
    pub fn from_config_json(config_json: &str) -> Result<Self> {
        let mut scope: RunScope = serde_json::from_str(config_json)
            .with_context(|| format!("Stored run config is not valid: {}", config_json))?;
        scope.filter = normalize_filter(scope.filter);
        Ok(scope)
    }
}

/// `--resource-names` accepts either one name or a JSON array of names.
pub fn parse_resource_names(arg: &str) -> Result<Vec<String>> {
    let value = arg.trim();
    if value.is_empty() {
        bail!("--resource-names must not be empty");
    }

    let names: Vec<String> = if value.starts_with('[') {
        serde_json::from_str(value)
            .context("--resource-names starts with a [ but it is not a valid JSON array of strings")?
    } else {
        vec![value.to_string()]
    };

    if names.is_empty() {
        bail!("--resource-names must contain at least one name");
    }
    if names.iter().any(|n| n.trim().is_empty()) {
        bail!("--resource-names must not contain empty names");
    }

    Ok(names)
}

/// `--watch` with no value uses the default interval, `--watch <ms>` an explicit one.
pub fn resolve_watch(arg: Option<Option<u64>>, default: Duration) -> Option<Duration> {
    match arg {
        None => None,
        Some(None) => Some(default),
        Some(Some(ms)) => Some(Duration::from_millis(ms)),
    }
}

fn normalize_filter(filter: Option<String>) -> Option<String> {
    filter.and_then(|f| {
        let trimmed = f.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    })
}
