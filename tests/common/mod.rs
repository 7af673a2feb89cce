//! Shared fixtures for integration tests.

#![allow(dead_code)]

use lilo::auth::{StaticTokenSource, Token, TokenCache};
use lilo::gcp::{FetchError, ListEntriesRequest, LogEntry, PageSource, PageState};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

pub type Reply = Result<PageState, FetchError>;

/// Replays scripted replies, then answers with an empty tail page.
///
/// Optionally flips a shutdown flag after a number of requests.
pub struct ScriptedSource {
    replies: Mutex<VecDeque<Reply>>,
    requests: Mutex<Vec<ListEntriesRequest>>,
    shutdown: Option<(usize, watch::Sender<bool>)>,
}

impl ScriptedSource {
    pub fn new(replies: Vec<Reply>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            requests: Mutex::new(Vec::new()),
            shutdown: None,
        })
    }

    pub fn stopping_after(requests: usize, tx: watch::Sender<bool>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            shutdown: Some((requests, tx)),
        })
    }

    pub fn requests(&self) -> Vec<ListEntriesRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait::async_trait]
impl PageSource for ScriptedSource {
    async fn fetch_page(
        &self,
        request: &ListEntriesRequest,
        _token: &Token,
    ) -> Result<PageState, FetchError> {
        let seen = {
            let mut requests = self.requests.lock();
            requests.push(request.clone());
            requests.len()
        };
        if let Some((after, tx)) = &self.shutdown {
            if seen >= *after {
                let _ = tx.send(true);
            }
        }

        let next = self.replies.lock().pop_front();
        next.unwrap_or(Ok(PageState::InProgressPage { entries: vec![] }))
    }
}

pub fn entry(id: &str, receive_timestamp: &str) -> LogEntry {
    LogEntry {
        insert_id: Some(id.to_string()),
        receive_timestamp: Some(receive_timestamp.to_string()),
        timestamp: Some(receive_timestamp.to_string()),
        text_payload: Some(format!("payload {}", id)),
        ..Default::default()
    }
}

pub fn final_page(entries: Vec<LogEntry>, next: &str) -> Reply {
    Ok(PageState::FinalPage {
        entries,
        next_page_token: next.to_string(),
    })
}

pub fn tail_page(entries: Vec<LogEntry>) -> Reply {
    Ok(PageState::InProgressPage { entries })
}

pub fn tokens() -> Arc<TokenCache> {
    Arc::new(TokenCache::new(
        Box::new(StaticTokenSource::new("test-token")),
        Duration::from_secs(600),
    ))
}

/// A shutdown receiver that never fires.
pub fn no_shutdown() -> watch::Receiver<bool> {
    watch::channel(false).1
}
