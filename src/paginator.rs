//! Consistency-Aware Paginator
//!
//! Drives `entries:list` page by page for one query window and hands out
//! batches of entries. One `Paginator` models exactly one pass:
//!
//! - `FinalPage` batches are emitted and the pass continues with the new token
//! - `InProgressPage` (the tail) is emitted and ends the pass
//! - `WaitingForFutureEvent` / `WaitingForServerCompute` are polled until they
//!   repeat too often in a row, which ends the pass
//! - network, HTTP and malformed-body failures are retried here and never
//!   escape; the caller only sees batches and, at the end, a `Termination`
//!
//! Tailing is the caller's job: it builds a fresh window from the store and
//! starts a new `Paginator`.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::auth::TokenCache;
use crate::config::IngestTuning;
use crate::gcp::{FetchError, ListEntriesRequest, LogEntry, PageKind, PageSource, PageState};

/// Recent page kinds kept for diagnostics.
const HISTORY_CAPACITY: usize = 16;

// =============================================================================
// History
// =============================================================================

/// Bounded record of recent page kinds plus the length of the current run of
/// identical kinds.
#[derive(Debug, Clone, Default)]
pub struct PageHistory {
    recent: VecDeque<PageKind>,
    streak: u32,
}

impl PageHistory {
    /// Record a page kind and return how many times in a row it has now occurred.
    pub fn push(&mut self, kind: PageKind) -> u32 {
        if self.recent.back() == Some(&kind) {
            self.streak = self.streak.saturating_add(1);
        } else {
            self.streak = 1;
        }

        if self.recent.len() == HISTORY_CAPACITY {
            self.recent.pop_front();
        }
        self.recent.push_back(kind);
        self.streak
    }

    pub fn streak(&self) -> u32 {
        self.streak
    }

    pub fn recent(&self) -> impl Iterator<Item = PageKind> + '_ {
        self.recent.iter().copied()
    }
}

// =============================================================================
// Termination
// =============================================================================

/// Why a pass ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    /// The tail page was reached.
    TailReached,
    /// Nothing is visible for this window yet.
    FutureEventLimit { occurrences: u32 },
    /// The backend kept computing; the query is probably too broad.
    ServerComputeLimit { occurrences: u32 },
    /// The backend kept answering with bodies that match no page shape.
    ProtocolViolationLimit { occurrences: u32, last_error: String },
    /// A closed page came back empty. The run must stop.
    EmptyFinalPage { page_token: Option<String> },
}

impl Termination {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::EmptyFinalPage { .. })
    }
}

impl std::fmt::Display for Termination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TailReached => write!(f, "reached the in-progress tail page"),
            Self::FutureEventLimit { occurrences } => write!(
                f,
                "{} consecutive {} pages",
                occurrences,
                PageKind::WaitingForFutureEvent
            ),
            Self::ServerComputeLimit { occurrences } => write!(
                f,
                "{} consecutive {} pages",
                occurrences,
                PageKind::WaitingForServerCompute
            ),
            Self::ProtocolViolationLimit {
                occurrences,
                last_error,
            } => write!(
                f,
                "{} consecutive malformed responses (last: {})",
                occurrences, last_error
            ),
            Self::EmptyFinalPage { page_token } => write!(
                f,
                "final page with no entries (page token {})",
                token_tail(page_token.as_deref())
            ),
        }
    }
}

/// Counters for one pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassStats {
    pub requests: u64,
    pub retries: u64,
    pub batches: u64,
    pub entries: u64,
}

// =============================================================================
// Paginator
// =============================================================================

pub struct Paginator {
    source: Arc<dyn PageSource>,
    tokens: Arc<TokenCache>,
    tuning: IngestTuning,
    request: ListEntriesRequest,
    page_token: Option<String>,
    history: PageHistory,
    protocol_violations: u32,
    auth_refreshed: bool,
    stats: PassStats,
    termination: Option<Termination>,
}

impl Paginator {
    pub fn new(
        source: Arc<dyn PageSource>,
        tokens: Arc<TokenCache>,
        request: ListEntriesRequest,
        tuning: IngestTuning,
    ) -> Self {
        info!(
            resource_names = ?request.resource_names,
            filter = ?request.filter,
            page_size = request.page_size,
            "Initial request params"
        );

        Self {
            source,
            tokens,
            tuning,
            page_token: request.page_token.clone(),
            request,
            history: PageHistory::default(),
            protocol_violations: 0,
            auth_refreshed: false,
            stats: PassStats::default(),
            termination: None,
        }
    }

    /// Next batch of entries, or `None` once the pass has ended.
    ///
    /// Batches come out in page order. After `None`, `termination()` says why.
    pub async fn next_batch(&mut self) -> Option<Vec<LogEntry>> {
        if self.termination.is_some() {
            return None;
        }

        loop {
            let token = match self.tokens.get_token().await {
                Ok(t) => t,
                Err(e) => {
                    warn!("Could not get a bearer token, retrying: {}", e);
                    self.backoff(self.tuning.retry_backoff).await;
                    continue;
                }
            };

            let request = self.request.with_page_token(self.page_token.as_deref());
            self.stats.requests += 1;

            let state = match self.source.fetch_page(&request, &token).await {
                Ok(state) => {
                    self.auth_refreshed = false;
                    self.protocol_violations = 0;
                    state
                }
                Err(err) => match self.on_fetch_error(err).await {
                    Some(termination) => return self.finish(termination),
                    None => continue,
                },
            };

            let kind = state.kind();
            let streak = self.history.push(kind);
            debug!(state = %kind, streak, "HTTP 200 returned from logging API");

            match state {
                PageState::WaitingForFutureEvent => {
                    info!(
                        state = %kind,
                        streak,
                        "Empty response: window starts in the future, the page token is waiting for new entries, or the resource names are invalid"
                    );
                    if streak > self.tuning.future_event_limit {
                        return self.finish(Termination::FutureEventLimit {
                            occurrences: streak,
                        });
                    }
                    sleep(self.tuning.poll_interval).await;
                }
                PageState::WaitingForServerCompute { next_page_token } => {
                    info!(
                        state = %kind,
                        streak,
                        next_page_token = %token_tail(Some(&next_page_token)),
                        "Server is still computing the query, resubmitting page token"
                    );
                    self.page_token = Some(next_page_token);
                    if streak > self.tuning.server_compute_limit {
                        warn!("Server computed for too long; narrow the filter or the time range");
                        return self.finish(Termination::ServerComputeLimit {
                            occurrences: streak,
                        });
                    }
                    sleep(self.tuning.poll_interval).await;
                }
                PageState::FinalPage {
                    entries,
                    next_page_token,
                } => {
                    if entries.is_empty() {
                        error!(
                            this_page_token = %token_tail(self.page_token.as_deref()),
                            next_page_token = %token_tail(Some(&next_page_token)),
                            "Final page returned with no entries"
                        );
                        return self.finish(Termination::EmptyFinalPage {
                            page_token: self.page_token.clone(),
                        });
                    }

                    info!(
                        state = %kind,
                        this_page_token = %token_tail(self.page_token.as_deref()),
                        next_page_token = %token_tail(Some(&next_page_token)),
                        total_entries_in_page = entries.len(),
                        "Page is final, no more entries will be added to it"
                    );
                    self.page_token = Some(next_page_token);
                    return Some(self.emit(entries));
                }
                PageState::InProgressPage { entries } => {
                    info!(
                        state = %kind,
                        this_page_token = %token_tail(self.page_token.as_deref()),
                        total_entries_in_page = entries.len(),
                        "Reached the tail page, entries may still be appended to it"
                    );
                    self.termination = Some(Termination::TailReached);
                    if entries.is_empty() {
                        return None;
                    }
                    return Some(self.emit(entries));
                }
            }
        }
    }

    /// Set once the pass has ended.
    pub fn termination(&self) -> Option<&Termination> {
        self.termination.as_ref()
    }

    pub fn stats(&self) -> PassStats {
        self.stats
    }

    pub fn history(&self) -> &PageHistory {
        &self.history
    }

    fn emit(&mut self, entries: Vec<LogEntry>) -> Vec<LogEntry> {
        self.stats.batches += 1;
        self.stats.entries += entries.len() as u64;
        entries
    }

    fn finish(&mut self, termination: Termination) -> Option<Vec<LogEntry>> {
        let recent: Vec<String> = self.history.recent().map(|k| k.to_string()).collect();
        if termination.is_fatal() {
            error!(reason = %termination, recent_pages = ?recent, "Pass aborted");
        } else {
            info!(reason = %termination, recent_pages = ?recent, "Reached the same page type limit, pass ended");
        }
        self.termination = Some(termination);
        None
    }

    async fn backoff(&mut self, delay: Duration) {
        self.stats.retries += 1;
        sleep(delay).await;
    }

    /// Apply the retry policy for a failed attempt. Returns a termination
    /// only when malformed responses keep coming.
    async fn on_fetch_error(&mut self, err: FetchError) -> Option<Termination> {
        match &err {
            FetchError::Remote { status, body } if err.is_auth_expired() => {
                self.tokens.force_refresh();
                if self.auth_refreshed {
                    warn!(status, body = %body, "Bearer token rejected again after refresh, backing off");
                    self.backoff(self.tuning.retry_backoff).await;
                } else {
                    info!("Bearer token rejected, getting a new one");
                    self.auth_refreshed = true;
                    self.stats.retries += 1;
                }
            }
            FetchError::Remote { status, body } if err.is_quota_exceeded() => {
                warn!(
                    status,
                    body = %body,
                    "HTTP 429: the default read quota is 60 requests per minute, it can be raised in the Cloud console (APIs & Services > Logging API > Quotas). Backing off"
                );
                self.backoff(self.tuning.quota_backoff).await;
            }
            FetchError::Remote { status, body } => {
                warn!(status, body = %body, "Logging API responded with an error, will retry");
                self.backoff(self.tuning.retry_backoff).await;
            }
            FetchError::Transient(e) => {
                warn!("Network error, HTTP request to the logging API failed: {}", e);
                self.backoff(self.tuning.retry_backoff).await;
            }
            FetchError::Protocol(e) => {
                self.protocol_violations += 1;
                warn!(
                    occurrences = self.protocol_violations,
                    "Response matched no known page shape: {}", e
                );
                if self.protocol_violations > self.tuning.protocol_violation_limit {
                    return Some(Termination::ProtocolViolationLimit {
                        occurrences: self.protocol_violations,
                        last_error: e.to_string(),
                    });
                }
                self.backoff(self.tuning.retry_backoff).await;
            }
        }
        None
    }
}

/// Last six characters of a page token, enough to follow it in the logs.
fn token_tail(token: Option<&str>) -> String {
    match token {
        Some(t) => {
            let chars: Vec<char> = t.chars().collect();
            chars[chars.len().saturating_sub(6)..].iter().collect()
        }
        None => "none".to_string(),
    }
}
