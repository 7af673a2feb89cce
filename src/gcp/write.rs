//! `entries:write` client.
//!
//! Only the load generator uses this; ingestion never writes to the backend.

use anyhow::{Context, Result};
use reqwest::header;
use serde::Serialize;
use serde_json::Value;
use tracing::error;

use super::client::LoggingClient;
use crate::auth::TokenCache;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WriteEntriesRequest<'a> {
    log_name: &'a str,
    entries: &'a [Value],
    partial_success: bool,
    dry_run: bool,
}

pub struct LogWriter {
    client: LoggingClient,
}

impl LogWriter {
    pub fn new(client: LoggingClient) -> Self {
        Self { client }
    }

    /// Write `entries` to `log_name` in one all-or-nothing request.
    ///
    /// Returns `Ok(false)` when the backend rejects the write; the response
    /// body is logged. Transport and credential failures are errors.
    pub async fn write_entries(
        &self,
        tokens: &TokenCache,
        log_name: &str,
        entries: &[Value],
    ) -> Result<bool> {
        let token = tokens.get_token().await?;
        let url = format!("{}/v2/entries:write", self.client.base_url());

        let resp = self
            .client
            .http()
            .post(url)
            .bearer_auth(token.as_str())
            .header(header::ACCEPT, "application/json")
            .json(&WriteEntriesRequest {
                log_name,
                entries,
                partial_success: false,
                dry_run: false,
            })
            .send()
            .await
            .context("POST /v2/entries:write failed")?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            error!(status = %status, body = %text, log_name, "entries:write rejected");
            return Ok(false);
        }

        Ok(true)
    }
}
