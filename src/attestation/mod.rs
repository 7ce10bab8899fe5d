//! Attestation authority clients.
//!
//! Defines the [`AttestationClient`] trait and the raw per-host report type
//! every client returns. Two wire modes are implemented:
//! - [`poll_hosts::PollHostsClient`]: batch JSON `PollHosts` endpoint
//! - [`assertion::AssertionClient`]: single-host signed assertion endpoint
//!
//! Clients perform no retries. Callers treat any error as "no data".

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use reqwest::StatusCode;
use tracing::warn;
use url::Url;

use crate::config::{AttestationConfig, AttestationMode};
use crate::types::HostId;

pub mod assertion;
pub mod poll_hosts;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

/// One host's attestation exactly as the authority reported it.
///
/// Nothing here is validated; the cache normalizes levels and parses
/// timestamps.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttestationReport {
    /// Host name as reported by the authority.
    pub host: String,
    /// Raw trust level string.
    pub trust_level: String,
    /// Raw tag map.
    pub tags: BTreeMap<String, String>,
    /// Raw verification timestamp.
    pub vtime: String,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors returned by attestation clients.
#[derive(Debug, thiserror::Error)]
pub enum AttestationError {
    /// Connection, timeout or TLS handshake failure.
    #[error("attestation request failed: {0}")]
    Request(#[from] reqwest::Error),
    /// The authority answered with a status outside the accepted set.
    #[error("attestation authority returned status {status}: {body}")]
    HttpStatus {
        /// HTTP status code.
        status: u16,
        /// Sanitized response body.
        body: String,
    },
    /// The response body could not be interpreted.
    #[error("malformed attestation response: {0}")]
    Malformed(String),
    /// Trust material could not be loaded.
    #[error("attestation TLS setup failed: {0}")]
    Tls(String),
    /// Connection settings are unusable.
    #[error("invalid attestation configuration: {0}")]
    Config(String),
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Query attestation status for a set of hosts.
#[async_trait]
pub trait AttestationClient: Send + Sync {
    /// Fetch reports for `hosts`.
    ///
    /// Hosts the authority does not know are simply absent from the result.
    ///
    /// # Errors
    ///
    /// Returns [`AttestationError`] on transport, status or body failure.
    async fn query(&self, hosts: &[HostId]) -> Result<Vec<AttestationReport>, AttestationError>;
}

/// Build the client matching `config.mode`.
///
/// # Errors
///
/// Returns an error if the server address is missing or the CA bundle cannot
/// be loaded.
pub fn build_client(
    config: &AttestationConfig,
) -> Result<Arc<dyn AttestationClient>, AttestationError> {
    let client: Arc<dyn AttestationClient> = match config.mode {
        AttestationMode::PollHosts => Arc::new(poll_hosts::PollHostsClient::new(config)?),
        AttestationMode::Assertion => Arc::new(assertion::AssertionClient::new(config)?),
    };
    Ok(client)
}

// ---------------------------------------------------------------------------
// HTTP helpers
// ---------------------------------------------------------------------------

/// Statuses the authority uses for a successful answer.
const ACCEPTED_STATUSES: [StatusCode; 4] = [
    StatusCode::OK,
    StatusCode::CREATED,
    StatusCode::ACCEPTED,
    StatusCode::NO_CONTENT,
];

/// Build the HTTPS client with the configured trust material and timeout.
///
/// # Errors
///
/// Returns [`AttestationError::Tls`] if the CA bundle cannot be read or parsed.
pub fn build_http_client(config: &AttestationConfig) -> Result<reqwest::Client, AttestationError> {
    let mut builder =
        reqwest::Client::builder().timeout(Duration::from_secs(config.request_timeout_secs));

    if let Some(ca_file) = &config.ca_file {
        let pem = std::fs::read(ca_file).map_err(|e| {
            AttestationError::Tls(format!("cannot read CA file {}: {e}", ca_file.display()))
        })?;
        let cert = reqwest::Certificate::from_pem(&pem).map_err(|e| {
            AttestationError::Tls(format!("invalid CA file {}: {e}", ca_file.display()))
        })?;
        builder = builder.add_root_certificate(cert);
    }

    if config.insecure_ssl {
        warn!(
            server = %config.server,
            "attestation server certificate verification is disabled"
        );
        builder = builder.danger_accept_invalid_certs(true);
    }

    builder
        .build()
        .map_err(|e| AttestationError::Tls(format!("cannot build HTTP client: {e}")))
}

/// `https://{server}:{port}{api_url}`.
///
/// # Errors
///
/// Returns [`AttestationError::Config`] if the server is empty or the result
/// is not a valid URL.
pub fn authority_base_url(config: &AttestationConfig) -> Result<Url, AttestationError> {
    let server = config.server.trim();
    if server.is_empty() {
        return Err(AttestationError::Config(
            "attestation server is not configured".to_owned(),
        ));
    }
    let raw = format!("https://{server}:{}{}", config.port, config.api_url);
    Url::parse(&raw).map_err(|e| AttestationError::Config(format!("invalid URL {raw:?}: {e}")))
}

/// Check the response status and return the body text.
///
/// # Errors
///
/// Returns [`AttestationError::Request`] on transport failure and
/// [`AttestationError::HttpStatus`] for statuses outside the accepted set.
pub async fn check_http_response(
    response: reqwest::Response,
    secret: Option<&str>,
) -> Result<String, AttestationError> {
    let status = response.status();
    let body = response.text().await?;
    if !ACCEPTED_STATUSES.contains(&status) {
        return Err(AttestationError::HttpStatus {
            status: status.as_u16(),
            body: sanitize_http_error_body(&body, secret),
        });
    }
    Ok(body)
}

/// Collapse whitespace, redact credentials and truncate an error body.
#[doc(hidden)]
pub fn sanitize_http_error_body(raw: &str, secret: Option<&str>) -> String {
    let mut sanitized = raw.split_whitespace().collect::<Vec<_>>().join(" ");

    if let Some(secret) = secret.filter(|s| !s.is_empty()) {
        sanitized = sanitized.replace(secret, "[REDACTED]");
    }
    if let Ok(regex) = Regex::new(r"(?i)basic\s+[A-Za-z0-9+/=]{8,}") {
        sanitized = regex.replace_all(&sanitized, "Basic [REDACTED]").into_owned();
    }

    const MAX_ERROR_BODY_CHARS: usize = 256;
    if sanitized.chars().count() > MAX_ERROR_BODY_CHARS {
        let shortened = sanitized
            .chars()
            .take(MAX_ERROR_BODY_CHARS)
            .collect::<String>();
        return format!("{shortened}...[truncated]");
    }

    sanitized
}
