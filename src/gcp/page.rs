//! Page classification for `entries:list` responses.
//!
//! The shape of a successful response tells the reader what the backend is
//! doing; the same request can legitimately return any of these:
//!
//! | body                              | state                     |
//! |-----------------------------------|---------------------------|
//! | `{}`                              | `WaitingForFutureEvent`   |
//! | `{nextPageToken}`                 | `WaitingForServerCompute` |
//! | `{entries: [..], nextPageToken}`  | `FinalPage`               |
//! | `{entries: [..]}`                 | `InProgressPage`          |
//!
//! A final page never changes once returned. An in-progress page is the
//! tail of the log; its membership can still grow or flap between polls.

use serde_json::Value;

use super::LogEntry;

/// Classified `entries:list` response.
#[derive(Debug, Clone, PartialEq)]
pub enum PageState {
    /// Empty body: the window starts after the backend's visible data, or the
    /// token points slightly ahead of it.
    WaitingForFutureEvent,
    /// The search has not finished. The token must be sent back or the
    /// backend drops the computation.
    WaitingForServerCompute { next_page_token: String },
    /// Closed page. An empty `entries` array here is a backend contract
    /// violation; the paginator treats it as fatal.
    FinalPage {
        entries: Vec<LogEntry>,
        next_page_token: String,
    },
    /// Open tail page.
    InProgressPage { entries: Vec<LogEntry> },
}

/// Fieldless twin of `PageState` for history tracking and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PageKind {
    WaitingForFutureEvent,
    WaitingForServerCompute,
    FinalPage,
    InProgressPage,
}

impl PageState {
    pub fn kind(&self) -> PageKind {
        match self {
            Self::WaitingForFutureEvent => PageKind::WaitingForFutureEvent,
            Self::WaitingForServerCompute { .. } => PageKind::WaitingForServerCompute,
            Self::FinalPage { .. } => PageKind::FinalPage,
            Self::InProgressPage { .. } => PageKind::InProgressPage,
        }
    }
}

impl std::fmt::Display for PageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::WaitingForFutureEvent => "WAITING_FOR_FUTURE_EVENT",
            Self::WaitingForServerCompute => "WAITING_FOR_SERVER_TO_COMPUTE",
            Self::FinalPage => "FINAL_PAGE",
            Self::InProgressPage => "IN_PROGRESS_PAGE",
        };
        f.write_str(s)
    }
}

/// A 2xx body that matches none of the known page shapes.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolError {
    InvalidJson(String),
    NotAnObject,
    InvalidField { field: &'static str, reason: String },
    UnrecognizedShape { keys: Vec<String> },
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidJson(e) => write!(f, "response body is not JSON: {}", e),
            Self::NotAnObject => write!(f, "response body is not a JSON object"),
            Self::InvalidField { field, reason } => {
                write!(f, "response field `{}` is invalid: {}", field, reason)
            }
            Self::UnrecognizedShape { keys } => write!(
                f,
                "response has neither `entries` nor `nextPageToken` (keys: {:?})",
                keys
            ),
        }
    }
}

impl std::error::Error for ProtocolError {}

/// Classify a raw response body.
pub fn classify(body: &str) -> Result<PageState, ProtocolError> {
    let value: Value =
        serde_json::from_str(body).map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;
    classify_value(value)
}

pub fn classify_value(value: Value) -> Result<PageState, ProtocolError> {
    let Value::Object(mut obj) = value else {
        return Err(ProtocolError::NotAnObject);
    };

    if obj.is_empty() {
        return Ok(PageState::WaitingForFutureEvent);
    }

    // An empty token carries no cursor, same as a missing one.
    let next_page_token = match obj.remove("nextPageToken") {
        None | Some(Value::Null) => None,
        Some(Value::String(t)) if t.is_empty() => None,
        Some(Value::String(t)) => Some(t),
        Some(other) => {
            return Err(ProtocolError::InvalidField {
                field: "nextPageToken",
                reason: format!("expected a string, got {}", other),
            })
        }
    };

    let entries = match obj.remove("entries") {
        None | Some(Value::Null) => None,
        Some(v @ Value::Array(_)) => Some(serde_json::from_value::<Vec<LogEntry>>(v).map_err(
            |e| ProtocolError::InvalidField {
                field: "entries",
                reason: e.to_string(),
            },
        )?),
        Some(other) => {
            return Err(ProtocolError::InvalidField {
                field: "entries",
                reason: format!("expected an array, got {}", other),
            })
        }
    };

    match (entries, next_page_token) {
        (None, Some(next_page_token)) => Ok(PageState::WaitingForServerCompute { next_page_token }),
        (Some(entries), Some(next_page_token)) => Ok(PageState::FinalPage {
            entries,
            next_page_token,
        }),
        (Some(entries), None) => Ok(PageState::InProgressPage { entries }),
        (None, None) => Err(ProtocolError::UnrecognizedShape {
            keys: obj.keys().cloned().collect(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(entries: &[LogEntry]) -> Vec<&str> {
        entries
            .iter()
            .map(|e| e.insert_id.as_deref().unwrap_or("-"))
            .collect()
    }

    #[test]
    fn empty_object_is_waiting_for_future_event() {
        assert_eq!(classify("{}").unwrap(), PageState::WaitingForFutureEvent);
    }

    #[test]
    fn token_without_entries_is_server_compute() {
        let state = classify(r#"{"nextPageToken": "tok-1"}"#).unwrap();
        assert_eq!(
            state,
            PageState::WaitingForServerCompute {
                next_page_token: "tok-1".to_string()
            }
        );
        assert_eq!(state.kind(), PageKind::WaitingForServerCompute);
    }

    #[test]
    fn entries_and_token_is_final_page() {
        let body = r#"{
            "entries": [{"insertId": "e1"}, {"insertId": "e2"}],
            "nextPageToken": "t1"
        }"#;
        match classify(body).unwrap() {
            PageState::FinalPage {
                entries,
                next_page_token,
            } => {
                assert_eq!(ids(&entries), vec!["e1", "e2"]);
                assert_eq!(next_page_token, "t1");
            }
            other => panic!("unexpected state {:?}", other),
        }
    }

    #[test]
    fn entries_without_token_is_in_progress_page() {
        match classify(r#"{"entries": [{"insertId": "e3"}]}"#).unwrap() {
            PageState::InProgressPage { entries } => assert_eq!(ids(&entries), vec!["e3"]),
            other => panic!("unexpected state {:?}", other),
        }
    }

    #[test]
    fn empty_final_page_is_still_classified_as_final() {
        // Rejected later by the paginator, not silently turned into a compute state.
        let state = classify(r#"{"entries": [], "nextPageToken": "t1"}"#).unwrap();
        assert_eq!(state.kind(), PageKind::FinalPage);
    }

    #[test]
    fn empty_string_token_counts_as_absent() {
        let state = classify(r#"{"entries": [{"insertId": "e1"}], "nextPageToken": ""}"#).unwrap();
        assert_eq!(state.kind(), PageKind::InProgressPage);
    }

    #[test]
    fn malformed_bodies_are_protocol_errors() {
        assert!(matches!(
            classify("not json"),
            Err(ProtocolError::InvalidJson(_))
        ));
        assert_eq!(classify("[]"), Err(ProtocolError::NotAnObject));
        assert_eq!(
            classify(r#"{"unexpected": true}"#),
            Err(ProtocolError::UnrecognizedShape {
                keys: vec!["unexpected".to_string()]
            })
        );
        assert!(matches!(
            classify(r#"{"nextPageToken": 12}"#),
            Err(ProtocolError::InvalidField {
                field: "nextPageToken",
                ..
            })
        ));
        assert!(matches!(
            classify(r#"{"entries": {"insertId": "e1"}}"#),
            Err(ProtocolError::InvalidField { field: "entries", .. })
        ));
        assert!(matches!(
            classify(r#"{"entries": [{"insertId": 5}]}"#),
            Err(ProtocolError::InvalidField { field: "entries", .. })
        ));
    }
}
