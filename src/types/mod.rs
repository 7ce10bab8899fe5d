//! Core value types shared by the cache, the tag evaluator and the decision engine.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Attested descriptive tags of a host (`tag_name -> tag_value`), lowercased.
pub type HostTags = BTreeMap<String, String>;

/// Opaque key naming a schedulable host.
///
/// Scheduler backends are addressed as `host@backend#pool`; only the part
/// before the first `@` names the machine the authority attests.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HostId(String);

impl HostId {
    /// Wrap an already-stripped host name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Derive the host identifier from a composite `host@backend` name.
    pub fn from_backend(backend_host: &str) -> Self {
        let host = backend_host
            .split_once('@')
            .map_or(backend_host, |(host, _)| host);
        Self(host.trim().to_owned())
    }

    /// The host name as sent to the attestation authority.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for HostId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Authority-assigned integrity classification of a host.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum TrustLevel {
    /// Not attested, attestation pending, or attestation data unusable.
    #[default]
    Unknown,
    /// Host passed attestation.
    Trusted,
    /// Host failed attestation.
    Untrusted,
    /// Any other authority-defined level, normalized to lowercase.
    Other(String),
}

impl TrustLevel {
    /// Normalize a raw level string. Empty input yields [`TrustLevel::Unknown`].
    pub fn parse(raw: &str) -> Self {
        let normalized = raw.trim().to_lowercase();
        match normalized.as_str() {
            "" | "unknown" => Self::Unknown,
            "trusted" => Self::Trusted,
            "untrusted" => Self::Untrusted,
            _ => Self::Other(normalized),
        }
    }

    /// Lowercase wire form of the level.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Unknown => "unknown",
            Self::Trusted => "trusted",
            Self::Untrusted => "untrusted",
            Self::Other(level) => level,
        }
    }

    /// Whether a host at this level satisfies `required`.
    ///
    /// `Unknown` never satisfies anything, including a requirement of `unknown`.
    pub fn satisfies(&self, required: &TrustLevel) -> bool {
        !matches!(self, Self::Unknown) && self == required
    }
}

impl fmt::Display for TrustLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for TrustLevel {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for TrustLevel {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::parse(&raw))
    }
}

/// A copied-out view of one cached attestation.
///
/// Serialized as one JSON object per host by `trustfilter status --json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttestationRecord {
    /// Host the record describes.
    pub host: HostId,
    /// Last known trust level.
    pub trust_level: TrustLevel,
    /// Attested tags; empty if never successfully attested.
    pub tags: HostTags,
    /// When the authority last verified the host.
    pub verified_at: DateTime<Utc>,
}
