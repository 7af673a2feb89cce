//! Cloud Logging REST API (v2)
//!
//! - `page`: classification of raw `entries:list` bodies
//! - `client`: one `entries:list` request per call
//! - `write`: `entries:write`, used by the load generator

pub mod client;
pub mod page;
pub mod write;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub use client::{FetchError, ListEntriesRequest, LoggingClient, PageSource};
pub use page::{classify, PageKind, PageState, ProtocolError};

/// One log entry as returned by `entries:list`.
///
/// Only the fields the store keeps are typed; everything else lands in
/// `extra` so nothing is lost in memory.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub insert_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_payload: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json_payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proto_payload: Option<Value>,
    /// Set by the backend on arrival. Many entries can share one value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receive_timestamp: Option<String>,
    /// Set by the writer, may lie in the past.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// `projects/<project>/logs/<log_id>`
pub fn log_name(project_id: &str, log_id: &str) -> String {
    format!("projects/{}/logs/{}", project_id, log_id)
}
