//! Status handling and error body sanitization.

use url::Url;

use trustfilter::attestation::poll_hosts::PollHostsClient;
use trustfilter::attestation::{sanitize_http_error_body, AttestationClient, AttestationError};
use trustfilter::types::HostId;

use crate::server::serve_once;

fn client_for(base: &str, auth_blob: Option<&str>) -> PollHostsClient {
    let url = match Url::parse(base) {
        Ok(url) => url,
        Err(err) => panic!("test url should parse: {err}"),
    };
    match PollHostsClient::with_base_url(url, auth_blob.map(str::to_owned), reqwest::Client::new())
    {
        Ok(client) => client,
        Err(err) => panic!("client should build: {err}"),
    }
}

#[tokio::test]
async fn error_status_is_reported_with_redacted_body() {
    let (base, _captured) = serve_once(
        "401 Unauthorized",
        "text/plain",
        "bad credentials: secret-blob-value",
    )
    .await;
    let client = client_for(&base, Some("secret-blob-value"));

    match client.query(&[HostId::new("h1")]).await {
        Err(AttestationError::HttpStatus { status, body }) => {
            assert_eq!(status, 401);
            assert!(!body.contains("secret-blob-value"));
            assert!(body.contains("[REDACTED]"));
        }
        other => panic!("expected http status error, got: {other:?}"),
    }
}

#[tokio::test]
async fn server_error_is_not_data() {
    let (base, _captured) = serve_once("503 Service Unavailable", "text/plain", "busy").await;
    let client = client_for(&base, None);

    assert!(matches!(
        client.query(&[HostId::new("h1")]).await,
        Err(AttestationError::HttpStatus { status: 503, .. })
    ));
}

#[tokio::test]
async fn connection_refused_is_a_request_error() {
    // Bind then drop to get a port nobody listens on.
    let listener = match tokio::net::TcpListener::bind("127.0.0.1:0").await {
        Ok(listener) => listener,
        Err(err) => panic!("listener should bind: {err}"),
    };
    let addr = match listener.local_addr() {
        Ok(addr) => addr,
        Err(err) => panic!("listener should expose local addr: {err}"),
    };
    drop(listener);

    let client = client_for(&format!("http://{addr}/api"), None);
    assert!(matches!(
        client.query(&[HostId::new("h1")]).await,
        Err(AttestationError::Request(_))
    ));
}

#[test]
fn long_error_bodies_are_truncated() {
    let sanitized = sanitize_http_error_body(&"x".repeat(400), None);
    assert!(sanitized.ends_with("...[truncated]"));
    assert!(sanitized.chars().count() < 300);
}

#[test]
fn whitespace_is_collapsed() {
    assert_eq!(
        sanitize_http_error_body("  host\n\n not   found ", None),
        "host not found"
    );
}
