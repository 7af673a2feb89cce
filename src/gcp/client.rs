//! Cloud Logging `entries:list` client.
//!
//! One call = one HTTP request. Retry policy lives in the paginator; this
//! layer only reports what happened.

use anyhow::{Context, Result};
use reqwest::{header, Client, StatusCode};
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

use super::page::{classify, PageState, ProtocolError};
use crate::auth::Token;

/// Body of `POST /v2/entries:list`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListEntriesRequest {
    pub resource_names: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
    pub order_by: String,
    pub page_size: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_token: Option<String>,
}

impl ListEntriesRequest {
    pub fn new(resource_names: Vec<String>, filter: Option<String>, page_size: u32) -> Self {
        Self {
            resource_names,
            filter,
            order_by: "timestamp asc".to_string(),
            page_size,
            page_token: None,
        }
    }

    pub fn with_page_token(&self, page_token: Option<&str>) -> Self {
        Self {
            page_token: page_token.map(str::to_string),
            ..self.clone()
        }
    }
}

/// Why a fetch attempt produced no page.
#[derive(Debug, Clone)]
pub enum FetchError {
    /// The request never got an HTTP response (connect, TLS, timeout, body read).
    Transient(String),
    /// Non-2xx response.
    Remote { status: u16, body: String },
    /// 2xx response with a body that matches no page shape.
    Protocol(ProtocolError),
}

impl FetchError {
    pub fn is_quota_exceeded(&self) -> bool {
        matches!(self, Self::Remote { status, .. } if *status == StatusCode::TOO_MANY_REQUESTS.as_u16())
    }

    pub fn is_auth_expired(&self) -> bool {
        matches!(self, Self::Remote { status, .. } if *status == StatusCode::UNAUTHORIZED.as_u16())
    }
}

impl std::fmt::Display for FetchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transient(e) => write!(f, "network error: {}", e),
            Self::Remote { status, body } => write!(f, "HTTP {}: {}", status, body),
            Self::Protocol(e) => write!(f, "protocol violation: {}", e),
        }
    }
}

impl std::error::Error for FetchError {}

/// Anything that can answer an `entries:list` request.
#[async_trait::async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch_page(
        &self,
        request: &ListEntriesRequest,
        token: &Token,
    ) -> Result<PageState, FetchError>;
}

#[derive(Clone)]
pub struct LoggingClient {
    client: Client,
    base_url: String,
}

impl LoggingClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            // Large searches can take close to a minute to answer.
            .timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(4)
            .tcp_keepalive(Duration::from_secs(60))
            .user_agent(concat!("lilo/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build LoggingClient")?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    #[inline]
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub(crate) fn http(&self) -> &Client {
        &self.client
    }

    pub(crate) fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait::async_trait]
impl PageSource for LoggingClient {
    async fn fetch_page(
        &self,
        request: &ListEntriesRequest,
        token: &Token,
    ) -> Result<PageState, FetchError> {
        let resp = self
            .client
            .post(self.url("/v2/entries:list"))
            .bearer_auth(token.as_str())
            .header(header::ACCEPT, "application/json")
            .json(request)
            .send()
            .await
            .map_err(|e| FetchError::Transient(e.to_string()))?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| FetchError::Transient(format!("failed to read body: {}", e)))?;

        if !status.is_success() {
            return Err(FetchError::Remote {
                status: status.as_u16(),
                body,
            });
        }

        debug!(bytes = body.len(), "entries:list returned HTTP {}", status);
        classify(&body).map_err(FetchError::Protocol)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_serializes_like_the_rest_api() {
        let req = ListEntriesRequest::new(
            vec!["projects/demo".to_string()],
            Some("severity>=ERROR".to_string()),
            1000,
        );

        assert_eq!(
            serde_json::to_value(&req).unwrap(),
            json!({
                "resourceNames": ["projects/demo"],
                "filter": "severity>=ERROR",
                "orderBy": "timestamp asc",
                "pageSize": 1000
            })
        );

        let next = req.with_page_token(Some("t1"));
        assert_eq!(serde_json::to_value(&next).unwrap()["pageToken"], json!("t1"));
        assert_eq!(next.with_page_token(None).page_token, None);
    }

    #[test]
    fn remote_status_helpers() {
        let quota = FetchError::Remote {
            status: 429,
            body: String::new(),
        };
        let auth = FetchError::Remote {
            status: 401,
            body: String::new(),
        };
        let other = FetchError::Remote {
            status: 500,
            body: String::new(),
        };

        assert!(quota.is_quota_exceeded() && !quota.is_auth_expired());
        assert!(auth.is_auth_expired() && !auth.is_quota_exceeded());
        assert!(!other.is_auth_expired() && !other.is_quota_exceeded());
        assert!(!FetchError::Transient("reset".into()).is_quota_exceeded());
    }
}
