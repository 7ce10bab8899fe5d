//! Single-host attestation over the signed-assertion (SAML) endpoint.
//!
//! The authority answers `GET {api_url}?nameEqualTo={host}` with a SAML
//! assertion whose attribute statement carries the trust verdict and the
//! host's asset tags. Hosts it does not know produce a JSON body instead.

use async_trait::async_trait;
use base64::Engine;
use chrono::{SecondsFormat, Utc};
use regex::Regex;
use tracing::{debug, warn};
use url::Url;

use super::{
    authority_base_url, build_http_client, check_http_response, AttestationClient,
    AttestationError, AttestationReport,
};
use crate::config::AttestationConfig;
use crate::types::HostId;

const ASSERTION_MEDIA_TYPE: &str = "application/samlassertion+xml";

/// Client for the single-host assertion endpoint. One GET per host.
#[derive(Debug, Clone)]
pub struct AssertionClient {
    endpoint: Url,
    auth_blob: Option<String>,
    http: reqwest::Client,
}

impl AssertionClient {
    /// Create a client from connection settings.
    ///
    /// # Errors
    ///
    /// Returns an error if the server address or TLS material is unusable.
    pub fn new(config: &AttestationConfig) -> Result<Self, AttestationError> {
        let endpoint = authority_base_url(config)?;
        let http = build_http_client(config)?;
        Ok(Self::with_endpoint(endpoint, config.auth_blob.clone(), http))
    }

    /// Create a client for an explicit endpoint URL.
    pub fn with_endpoint(endpoint: Url, auth_blob: Option<String>, http: reqwest::Client) -> Self {
        Self {
            endpoint,
            auth_blob: auth_blob.filter(|blob| !blob.is_empty()),
            http,
        }
    }

    /// The URL queried for `host`.
    pub fn host_url(&self, host: &HostId) -> Url {
        let mut url = self.endpoint.clone();
        url.query_pairs_mut()
            .append_pair("nameEqualTo", host.as_str());
        url
    }

    async fn fetch(&self, host: &HostId) -> Result<Option<AttestationReport>, AttestationError> {
        let mut request = self
            .http
            .get(self.host_url(host))
            .header(reqwest::header::ACCEPT, ASSERTION_MEDIA_TYPE);
        if let Some(blob) = &self.auth_blob {
            let basic = base64::engine::general_purpose::STANDARD.encode(blob);
            request = request
                .header("x-auth-blob", blob)
                .header(reqwest::header::AUTHORIZATION, format!("Basic {basic}"));
        }

        let response = request.send().await?;
        let body = check_http_response(response, self.auth_blob.as_deref()).await?;
        let fetched_at = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        parse_assertion(host, &body, &fetched_at)
    }
}

#[async_trait]
impl AttestationClient for AssertionClient {
    async fn query(&self, hosts: &[HostId]) -> Result<Vec<AttestationReport>, AttestationError> {
        let mut reports = Vec::with_capacity(hosts.len());
        let mut failures = 0_usize;
        let mut last_error = None;

        for host in hosts {
            match self.fetch(host).await {
                Ok(Some(report)) => reports.push(report),
                Ok(None) => debug!(%host, "host is not registered with the attestation authority"),
                Err(e) => {
                    warn!(%host, error = %e, "assertion request failed");
                    failures = failures.saturating_add(1);
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) if failures == hosts.len() => Err(e),
            _ => Ok(reports),
        }
    }
}

/// Extract the trust verdict and tags from an assertion body.
///
/// Returns `Ok(None)` when the body is JSON, which is how the authority says
/// the host is not registered. `fetched_at` is used as the verification time
/// when the assertion carries no `IssueInstant`.
///
/// # Errors
///
/// Returns [`AttestationError::Malformed`] if the body holds no attribute
/// statement at all.
#[doc(hidden)]
pub fn parse_assertion(
    host: &HostId,
    body: &str,
    fetched_at: &str,
) -> Result<Option<AttestationReport>, AttestationError> {
    if serde_json::from_str::<serde_json::Value>(body).is_ok() {
        return Ok(None);
    }

    let attribute_re = compile(r"(?s)<(?:[\w-]+:)?Attribute\b([^>]*)>(.*?)</(?:[\w-]+:)?Attribute>")?;
    let name_re = compile(r#"\bName\s*=\s*"([^"]*)""#)?;
    let value_re =
        compile(r"(?s)<(?:[\w-]+:)?AttributeValue\b[^>]*>(.*?)</(?:[\w-]+:)?AttributeValue>")?;
    let instant_re = compile(r#"\bIssueInstant\s*=\s*"([^"]*)""#)?;

    let mut report = AttestationReport {
        host: host.as_str().to_owned(),
        trust_level: "untrusted".to_owned(),
        ..AttestationReport::default()
    };
    let mut saw_attribute = false;

    for attribute in attribute_re.captures_iter(body) {
        saw_attribute = true;
        let Some(name) = name_re
            .captures(&attribute[1])
            .map(|c| unescape(&c[1]).to_lowercase())
        else {
            continue;
        };
        let value = value_re
            .captures(&attribute[2])
            .map(|c| unescape(c[1].trim()))
            .unwrap_or_default();

        if name == "trusted" {
            if value.eq_ignore_ascii_case("true") {
                report.trust_level = "trusted".to_owned();
            }
        } else if let Some(tag) = tag_key(&name) {
            report.tags.insert(tag.to_owned(), value.to_lowercase());
        }
    }

    if !saw_attribute {
        return Err(AttestationError::Malformed(
            "assertion carries no attribute statement".to_owned(),
        ));
    }

    report.vtime = instant_re
        .captures(body)
        .map(|c| c[1].to_owned())
        .unwrap_or_else(|| fetched_at.to_owned());
    Ok(Some(report))
}

/// `tag[env]` -> `env`.
fn tag_key(name: &str) -> Option<&str> {
    let inner = name.strip_prefix("tag")?;
    let (_, rest) = inner.split_once('[')?;
    let (key, _) = rest.split_once(']')?;
    let key = key.trim();
    (!key.is_empty()).then_some(key)
}

fn compile(pattern: &str) -> Result<Regex, AttestationError> {
    Regex::new(pattern).map_err(|e| AttestationError::Malformed(format!("bad pattern: {e}")))
}

fn unescape(raw: &str) -> String {
    raw.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}
