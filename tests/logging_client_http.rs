//! HTTP behaviour of the Cloud Logging client against a mock server.

mod common;

use lilo::auth::Token;
use lilo::gcp::write::LogWriter;
use lilo::gcp::{FetchError, ListEntriesRequest, LoggingClient, PageKind, PageSource, PageState};
use mockito::{Matcher, Server};
use serde_json::json;

fn request() -> ListEntriesRequest {
    ListEntriesRequest::new(
        vec!["projects/demo".to_string()],
        Some("severity>=ERROR".to_string()),
        1000,
    )
}

#[tokio::test]
async fn list_sends_bearer_token_and_classifies_final_page() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/v2/entries:list")
        .match_header("authorization", "Bearer tok-123")
        .match_body(Matcher::PartialJson(json!({
            "resourceNames": ["projects/demo"],
            "filter": "severity>=ERROR",
            "orderBy": "timestamp asc",
            "pageSize": 1000,
            "pageToken": "t0"
        })))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"entries":[{"insertId":"e1"},{"insertId":"e2"}],"nextPageToken":"t1"}"#)
        .create_async()
        .await;

    let client = LoggingClient::new(server.url()).unwrap();
    let state = client
        .fetch_page(&request().with_page_token(Some("t0")), &Token::new("tok-123"))
        .await
        .unwrap();

    match state {
        PageState::FinalPage {
            entries,
            next_page_token,
        } => {
            assert_eq!(entries.len(), 2);
            assert_eq!(next_page_token, "t1");
        }
        other => panic!("unexpected state {:?}", other),
    }
    mock.assert_async().await;
}

#[tokio::test]
async fn list_classifies_every_page_shape() {
    let bodies = [
        ("{}", PageKind::WaitingForFutureEvent),
        (r#"{"nextPageToken":"t9"}"#, PageKind::WaitingForServerCompute),
        (r#"{"entries":[{"insertId":"e3"}]}"#, PageKind::InProgressPage),
    ];

    for (body, expected) in bodies {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/v2/entries:list")
            .with_status(200)
            .with_body(body)
            .create_async()
            .await;

        let client = LoggingClient::new(server.url()).unwrap();
        let state = client
            .fetch_page(&request(), &Token::new("tok"))
            .await
            .unwrap();
        assert_eq!(state.kind(), expected, "body {}", body);
    }
}

#[tokio::test]
async fn list_maps_error_statuses() {
    for (status, quota, auth) in [(429, true, false), (401, false, true), (500, false, false)] {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/v2/entries:list")
            .with_status(status)
            .with_body(r#"{"error":{"message":"nope"}}"#)
            .create_async()
            .await;

        let client = LoggingClient::new(server.url()).unwrap();
        let err = client
            .fetch_page(&request(), &Token::new("tok"))
            .await
            .unwrap_err();

        match &err {
            FetchError::Remote { status: got, body } => {
                assert_eq!(*got as usize, status);
                assert!(body.contains("nope"));
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(err.is_quota_exceeded(), quota);
        assert_eq!(err.is_auth_expired(), auth);
    }
}

#[tokio::test]
async fn list_reports_malformed_body_as_protocol_error() {
    let mut server = Server::new_async().await;
    let _mock = server
        .mock("POST", "/v2/entries:list")
        .with_status(200)
        .with_body("<html>proxy error</html>")
        .create_async()
        .await;

    let client = LoggingClient::new(server.url()).unwrap();
    let err = client
        .fetch_page(&request(), &Token::new("tok"))
        .await
        .unwrap_err();

    assert!(matches!(err, FetchError::Protocol(_)));
}

#[tokio::test]
async fn list_reports_unreachable_server_as_transient() {
    // Nothing listens on port 1.
    let client = LoggingClient::new("http://127.0.0.1:1").unwrap();
    let err = client
        .fetch_page(&request(), &Token::new("tok"))
        .await
        .unwrap_err();

    assert!(matches!(err, FetchError::Transient(_)));
}

#[tokio::test]
async fn writer_reports_acceptance_and_rejection() {
    let mut server = Server::new_async().await;
    let accepted = server
        .mock("POST", "/v2/entries:write")
        .match_header("authorization", "Bearer test-token")
        .match_body(Matcher::PartialJson(json!({
            "logName": "projects/demo/logs/ok",
            "partialSuccess": false,
            "dryRun": false
        })))
        .with_status(200)
        .with_body("{}")
        .create_async()
        .await;
    let rejected = server
        .mock("POST", "/v2/entries:write")
        .match_body(Matcher::PartialJson(json!({"logName": "projects/demo/logs/bad"})))
        .with_status(400)
        .with_body(r#"{"error":{"message":"bad entry"}}"#)
        .create_async()
        .await;

    let tokens = common::tokens();
    let writer = LogWriter::new(LoggingClient::new(server.url()).unwrap());
    let entries = vec![json!({"jsonPayload": {"id": "s0000_n000000001_id000001_abcdefg"}})];

    assert!(writer
        .write_entries(&tokens, "projects/demo/logs/ok", &entries)
        .await
        .unwrap());
    assert!(!writer
        .write_entries(&tokens, "projects/demo/logs/bad", &entries)
        .await
        .unwrap());

    accepted.assert_async().await;
    rejected.assert_async().await;
}
