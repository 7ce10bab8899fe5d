//! Batch attestation over the JSON `PollHosts` endpoint.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};
use url::Url;

use super::{
    authority_base_url, build_http_client, check_http_response, AttestationClient,
    AttestationError, AttestationReport,
};
use crate::config::AttestationConfig;
use crate::types::HostId;

// ---------------------------------------------------------------------------
// Wire types (pub for integration testing)
// ---------------------------------------------------------------------------

/// `PollHosts` request body.
#[doc(hidden)]
#[derive(Debug, Serialize)]
pub struct PollHostsRequest<'a> {
    /// Number of hosts in the batch.
    pub count: usize,
    /// Host names to attest.
    pub hosts: Vec<&'a str>,
}

/// `PollHosts` response body.
#[doc(hidden)]
#[derive(Debug, Deserialize)]
pub struct PollHostsResponse {
    /// Per-host results.
    pub hosts: Vec<PollHostsEntry>,
}

/// One host in a `PollHosts` response.
#[doc(hidden)]
#[derive(Debug, Deserialize)]
pub struct PollHostsEntry {
    /// Attested host name.
    #[serde(default)]
    pub host_name: Option<String>,
    /// Reported trust level.
    #[serde(default)]
    pub trust_lvl: Option<String>,
    /// Verification time, usually ISO-8601.
    #[serde(default)]
    pub vtime: Option<Value>,
    /// Optional asset tags.
    #[serde(default)]
    pub tags: Option<BTreeMap<String, Value>>,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Client for the batch `PollHosts` endpoint. One POST per query.
#[derive(Debug, Clone)]
pub struct PollHostsClient {
    endpoint: Url,
    auth_blob: Option<String>,
    http: reqwest::Client,
}

impl PollHostsClient {
    /// Create a client from connection settings.
    ///
    /// # Errors
    ///
    /// Returns an error if the server address or TLS material is unusable.
    pub fn new(config: &AttestationConfig) -> Result<Self, AttestationError> {
        let base = authority_base_url(config)?;
        let http = build_http_client(config)?;
        Self::with_base_url(base, config.auth_blob.clone(), http)
    }

    /// Create a client for an explicit base URL (the `PollHosts` segment is appended).
    ///
    /// # Errors
    ///
    /// Returns [`AttestationError::Config`] if `base` cannot carry a path.
    pub fn with_base_url(
        base: Url,
        auth_blob: Option<String>,
        http: reqwest::Client,
    ) -> Result<Self, AttestationError> {
        let mut endpoint = base;
        endpoint
            .path_segments_mut()
            .map_err(|()| AttestationError::Config("URL cannot carry a path".to_owned()))?
            .pop_if_empty()
            .push("PollHosts");
        Ok(Self {
            endpoint,
            auth_blob: auth_blob.filter(|blob| !blob.is_empty()),
            http,
        })
    }

    /// The full `PollHosts` URL.
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

#[async_trait]
impl AttestationClient for PollHostsClient {
    async fn query(&self, hosts: &[HostId]) -> Result<Vec<AttestationReport>, AttestationError> {
        let body = build_request(hosts);
        let mut request = self
            .http
            .post(self.endpoint.clone())
            .header(reqwest::header::ACCEPT, "application/json")
            .json(&body);
        if let Some(blob) = &self.auth_blob {
            request = request.header("x-auth-blob", blob);
        }

        debug!(count = body.count, endpoint = %self.endpoint, "polling attestation authority");
        let response = request.send().await?;
        let text = check_http_response(response, self.auth_blob.as_deref()).await?;
        parse_response(&text)
    }
}

// ---------------------------------------------------------------------------
// Request / Response builders (pub for integration testing)
// ---------------------------------------------------------------------------

/// Build the `PollHosts` request body.
#[doc(hidden)]
pub fn build_request(hosts: &[HostId]) -> PollHostsRequest<'_> {
    PollHostsRequest {
        count: hosts.len(),
        hosts: hosts.iter().map(HostId::as_str).collect(),
    }
}

/// Parse a `PollHosts` response body into raw reports.
///
/// Entries without a host name are dropped. Missing levels and timestamps
/// become empty strings for the cache to resolve.
///
/// # Errors
///
/// Returns [`AttestationError::Malformed`] if the body is not JSON or lacks
/// the `hosts` array.
#[doc(hidden)]
pub fn parse_response(body: &str) -> Result<Vec<AttestationReport>, AttestationError> {
    let resp: PollHostsResponse =
        serde_json::from_str(body).map_err(|e| AttestationError::Malformed(e.to_string()))?;

    let mut reports = Vec::with_capacity(resp.hosts.len());
    for entry in resp.hosts {
        let Some(host) = entry.host_name.filter(|h| !h.trim().is_empty()) else {
            warn!("dropping attestation entry without host_name");
            continue;
        };
        let tags = entry
            .tags
            .unwrap_or_default()
            .into_iter()
            .map(|(name, value)| (name, value_to_string(value)))
            .collect();
        reports.push(AttestationReport {
            host,
            trust_level: entry.trust_lvl.unwrap_or_default(),
            tags,
            vtime: entry.vtime.map(value_to_string).unwrap_or_default(),
        });
    }
    Ok(reports)
}

fn value_to_string(value: Value) -> String {
    match value {
        Value::String(s) => s,
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
