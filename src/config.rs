//! Configuration loading and validation.
//!
//! Loads the filter configuration from `~/.trustfilter/config.toml` (or
//! `$TRUSTFILTER_CONFIG`). Environment variables override file values; file
//! values override defaults.
//!
//! Precedence: env vars > config file > defaults.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Attestation authority connection settings.
    pub attestation: AttestationConfig,

    /// Attestation cache settings.
    pub cache: CacheConfig,

    /// Request policy defaults.
    pub policy: PolicyConfig,
}

/// Which wire protocol the attestation authority speaks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttestationMode {
    /// Batch JSON `PollHosts` endpoint.
    #[default]
    PollHosts,
    /// Single-host signed assertion (SAML) endpoint.
    Assertion,
}

/// Attestation authority connection settings.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct AttestationConfig {
    /// Host name or IP address of the attestation server.
    pub server: String,

    /// TCP port of the attestation server.
    pub port: u16,

    /// Path prefix joined to the server address.
    pub api_url: String,

    /// Opaque authentication blob sent with every request.
    pub auth_blob: Option<String>,

    /// CA bundle (PEM) used to verify the server certificate.
    pub ca_file: Option<PathBuf>,

    /// Skip server certificate verification. Insecure.
    pub insecure_ssl: bool,

    /// Wire protocol of the authority.
    pub mode: AttestationMode,

    /// Transport timeout for a single request, in seconds.
    pub request_timeout_secs: u64,
}

impl std::fmt::Debug for AttestationConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttestationConfig")
            .field("server", &self.server)
            .field("port", &self.port)
            .field("api_url", &self.api_url)
            .field(
                "auth_blob",
                &self.auth_blob.as_ref().map(|_| "[REDACTED]"),
            )
            .field("ca_file", &self.ca_file)
            .field("insecure_ssl", &self.insecure_ssl)
            .field("mode", &self.mode)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .finish()
    }
}

impl Default for AttestationConfig {
    fn default() -> Self {
        Self {
            server: String::new(),
            port: default_port(),
            api_url: default_api_url(),
            auth_blob: None,
            ca_file: None,
            insecure_ssl: false,
            mode: AttestationMode::default(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

/// Attestation cache settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// How long a successful attestation stays valid, in seconds.
    ///
    /// Zero or negative values are accepted; every lookup then refreshes.
    pub auth_timeout_secs: i64,

    /// Minimum spacing between refresh attempts, in seconds. 0 disables.
    pub min_refresh_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            auth_timeout_secs: default_auth_timeout_secs(),
            min_refresh_interval_secs: 0,
        }
    }
}

impl CacheConfig {
    /// Staleness window as a signed duration.
    ///
    /// Out-of-range values saturate toward their own sign, so a huge negative
    /// timeout still refreshes on every lookup.
    pub fn staleness_window(&self) -> chrono::Duration {
        chrono::Duration::try_seconds(self.auth_timeout_secs).unwrap_or(
            if self.auth_timeout_secs < 0 {
                chrono::Duration::MIN
            } else {
                chrono::Duration::MAX
            },
        )
    }
}

/// Defaults applied when requests omit trust metadata.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Trust level required when a request asks for trust without naming one.
    ///
    /// There is no built-in value; a requirement that needs it while unset
    /// is rejected.
    pub default_trust_level: Option<String>,

    /// Tag selection applied to blank requests. `"None"` means no selection.
    pub default_asset_tags: String,

    /// Require default trust for requests without a source image or snapshot.
    pub create_blank_on_trusted: bool,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            default_trust_level: None,
            default_asset_tags: default_asset_tags(),
            create_blank_on_trusted: true,
        }
    }
}

// Default value functions for serde

fn default_port() -> u16 {
    8443
}
fn default_api_url() -> String {
    "/OpenAttestationWebServices/V1.0".to_owned()
}
fn default_request_timeout_secs() -> u64 {
    30
}
fn default_auth_timeout_secs() -> i64 {
    60
}
fn default_asset_tags() -> String {
    "None".to_owned()
}

impl Config {
    /// Parse a TOML string into config.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid.
    pub fn from_toml(toml_str: &str) -> anyhow::Result<Self> {
        toml::from_str(toml_str).context("failed to parse config TOML")
    }

    /// Apply environment variable overrides (env > config > defaults).
    ///
    /// Takes a resolver function so tests avoid mutating the process env.
    pub fn apply_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        if let Some(v) = env("TRUSTFILTER_ATTESTATION_SERVER") {
            self.attestation.server = v;
        }
        if let Some(v) = env("TRUSTFILTER_ATTESTATION_PORT") {
            match v.parse() {
                Ok(port) => self.attestation.port = port,
                Err(_) => tracing::warn!(
                    var = "TRUSTFILTER_ATTESTATION_PORT",
                    value = %v,
                    "ignoring invalid env override"
                ),
            }
        }
        if let Some(v) = env("TRUSTFILTER_ATTESTATION_AUTH_BLOB") {
            self.attestation.auth_blob = Some(v);
        }
        if let Some(v) = env("TRUSTFILTER_ATTESTATION_CA_FILE") {
            self.attestation.ca_file = Some(PathBuf::from(v));
        }
        if let Some(v) = env("TRUSTFILTER_AUTH_TIMEOUT_SECS") {
            match v.parse() {
                Ok(secs) => self.cache.auth_timeout_secs = secs,
                Err(_) => tracing::warn!(
                    var = "TRUSTFILTER_AUTH_TIMEOUT_SECS",
                    value = %v,
                    "ignoring invalid env override"
                ),
            }
        }
        if let Some(v) = env("TRUSTFILTER_DEFAULT_TRUST_LEVEL") {
            self.policy.default_trust_level = Some(v);
        }
    }
}

/// Load config from a TOML file, then apply env overrides.
///
/// A missing file yields defaults.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read or parsed.
pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let mut config = match std::fs::read_to_string(path) {
        Ok(contents) => {
            tracing::info!(path = %path.display(), "loading config from file");
            Config::from_toml(&contents)
                .with_context(|| format!("failed to parse config at {}", path.display()))?
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::info!(path = %path.display(), "no config file found, using defaults");
            Config::default()
        }
        Err(e) => {
            return Err(anyhow::anyhow!(
                "failed to read config at {}: {e}",
                path.display()
            ))
        }
    };
    config.apply_overrides(|key| std::env::var(key).ok());
    Ok(config)
}

/// Resolve the config file path: `$TRUSTFILTER_CONFIG`, else
/// `~/.trustfilter/config.toml`.
///
/// # Errors
///
/// Returns an error if the home directory cannot be determined.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
    config_path_with(|key| std::env::var(key).ok())
}

fn config_path_with(env: impl Fn(&str) -> Option<String>) -> anyhow::Result<PathBuf> {
    if let Some(p) = env("TRUSTFILTER_CONFIG") {
        return Ok(PathBuf::from(p));
    }
    Ok(config_dir()?.join("config.toml"))
}

/// Resolve the default config directory (`~/.trustfilter/`).
///
/// # Errors
///
/// Returns an error if the home directory cannot be determined.
pub fn config_dir() -> anyhow::Result<PathBuf> {
    let home = directories::BaseDirs::new()
        .ok_or_else(|| anyhow::anyhow!("cannot determine home directory"))?;
    Ok(home.home_dir().join(".trustfilter"))
}
