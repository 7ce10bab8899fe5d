//! `PollHosts` wire format and transport tests.

use serde_json::json;
use url::Url;

use trustfilter::attestation::poll_hosts::{build_request, parse_response, PollHostsClient};
use trustfilter::attestation::{AttestationClient, AttestationError};
use trustfilter::types::HostId;

use crate::server::serve_once;

fn client_for(base: &str, auth_blob: Option<&str>) -> PollHostsClient {
    let url = match Url::parse(&format!("{base}/OpenAttestationWebServices/V1.0")) {
        Ok(url) => url,
        Err(err) => panic!("test url should parse: {err}"),
    };
    match PollHostsClient::with_base_url(url, auth_blob.map(str::to_owned), reqwest::Client::new())
    {
        Ok(client) => client,
        Err(err) => panic!("client should build: {err}"),
    }
}

#[test]
fn request_body_carries_count_and_hosts() {
    let hosts = [HostId::new("h1"), HostId::new("h2")];
    let body = serde_json::to_value(build_request(&hosts)).expect("should serialize");
    assert_eq!(body, json!({"count": 2, "hosts": ["h1", "h2"]}));
}

#[test]
fn parse_response_reads_levels_times_and_tags() {
    let body = json!({
        "hosts": [
            {"host_name": "h1", "trust_lvl": "trusted", "vtime": "2012-03-27T09:42:09Z",
             "tags": {"env": "prod", "rack": 7}},
            {"host_name": "h2", "trust_lvl": "untrusted", "vtime": "Tue Mar 27 09:42:09 2012"}
        ]
    });
    let reports = parse_response(&body.to_string()).expect("should parse");
    assert_eq!(reports.len(), 2);
    assert_eq!(reports[0].host, "h1");
    assert_eq!(reports[0].trust_level, "trusted");
    assert_eq!(reports[0].tags.get("rack").map(String::as_str), Some("7"));
    assert_eq!(reports[1].vtime, "Tue Mar 27 09:42:09 2012");
    assert!(reports[1].tags.is_empty());
}

#[test]
fn parse_response_skips_entries_without_host_name() {
    let body = json!({"hosts": [{"trust_lvl": "trusted"}, {"host_name": "h1"}]});
    let reports = parse_response(&body.to_string()).expect("should parse");
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].host, "h1");
    assert_eq!(reports[0].trust_level, "");
}

#[test]
fn parse_response_without_hosts_is_malformed() {
    for body in ["not json", "{}", r#"{"hosts": null}"#, r#"{"hosts": "h1"}"#, ""] {
        assert!(
            matches!(parse_response(body), Err(AttestationError::Malformed(_))),
            "body {body:?}"
        );
    }
}

#[tokio::test]
async fn query_posts_batch_with_auth_header() {
    let answer = json!({"hosts": [{"host_name": "h1", "trust_lvl": "trusted",
                                   "vtime": "2012-03-27T09:42:09Z"}]});
    let (base, captured) = serve_once("200 OK", "application/json", &answer.to_string()).await;
    let client = client_for(&base, Some("blob-123"));

    let reports = client
        .query(&[HostId::new("h1"), HostId::new("h2")])
        .await
        .expect("query should succeed");
    assert_eq!(reports.len(), 1);

    let request = captured.await.expect("server should capture the request");
    assert_eq!(
        request.request_line(),
        "POST /OpenAttestationWebServices/V1.0/PollHosts HTTP/1.1"
    );
    assert_eq!(request.header("x-auth-blob"), Some("blob-123"));
    assert_eq!(request.header("accept"), Some("application/json"));
    assert_eq!(request.header("content-type"), Some("application/json"));
    let body: serde_json::Value = serde_json::from_str(&request.body).expect("json body");
    assert_eq!(body, json!({"count": 2, "hosts": ["h1", "h2"]}));
}

#[tokio::test]
async fn query_without_blob_sends_no_auth_header() {
    let (base, captured) = serve_once("200 OK", "application/json", r#"{"hosts": []}"#).await;
    let client = client_for(&base, Some(""));

    let reports = client.query(&[HostId::new("h1")]).await.expect("should succeed");
    assert!(reports.is_empty());
    let request = captured.await.expect("server should capture the request");
    assert_eq!(request.header("x-auth-blob"), None);
}

#[tokio::test]
async fn accepted_with_empty_body_is_malformed() {
    let (base, _captured) = serve_once("204 No Content", "application/json", "").await;
    let client = client_for(&base, None);

    let result = client.query(&[HostId::new("h1")]).await;
    assert!(matches!(result, Err(AttestationError::Malformed(_))));
}
