//! Trust requirements and the per-candidate accept/reject decision.
//!
//! [`TrustRequirement::from_request`] derives what a scheduling request asks
//! for without touching the request. [`TrustDecisionEngine`] checks one
//! candidate host against that requirement using the attestation cache.
//! Every ambiguous or failed state resolves to reject.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::cache::AttestationCache;
use crate::config::PolicyConfig;
use crate::tags::{TagSelection, TagSelectionError};
use crate::types::{HostId, TrustLevel};

/// Metadata key naming the required trust level.
pub const TRUST_KEY: &str = "trust:trusted_host";
/// Short alias of [`TRUST_KEY`].
pub const TRUST_ALIAS_KEY: &str = "trust";
/// Metadata key carrying the tag selection.
pub const TAGS_KEY: &str = "trust:asset_tags";
/// Short alias of [`TAGS_KEY`].
pub const TAGS_ALIAS_KEY: &str = "asset_tags";

// ---------------------------------------------------------------------------
// Request context
// ---------------------------------------------------------------------------

/// What the scheduler knows about one placement request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    /// Caller-supplied metadata (`trust:trusted_host`, `trust:asset_tags`, ...).
    pub metadata: BTreeMap<String, String>,
    /// Source image of the requested resource, if any.
    pub image_id: Option<String>,
    /// Source snapshot of the requested resource, if any.
    pub snapshot_id: Option<String>,
}

impl RequestContext {
    /// Context with only metadata.
    pub fn with_metadata<I, K, V>(metadata: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            metadata: metadata
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
            ..Self::default()
        }
    }

    /// Whether the request creates a resource from nothing.
    pub fn is_blank(&self) -> bool {
        self.image_id.is_none() && self.snapshot_id.is_none()
    }

    fn get(&self, key: &str, alias: &str) -> Option<&str> {
        self.metadata
            .get(key)
            .or_else(|| self.metadata.get(alias))
            .map(String::as_str)
    }
}

// ---------------------------------------------------------------------------
// Requirement
// ---------------------------------------------------------------------------

/// Why a requirement could not be derived.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequirementError {
    /// The tag selection did not parse.
    #[error(transparent)]
    MalformedSelection(#[from] TagSelectionError),
    /// A default trust level was needed but none is configured.
    #[error("no default trust level is configured")]
    MissingDefaultTrustLevel,
}

/// What a request demands of its host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrustRequirement {
    /// Level the host must be attested at.
    pub level: Option<TrustLevel>,
    /// Tags the host must carry.
    pub tags: Option<TagSelection>,
}

impl TrustRequirement {
    /// Derive the requirement of `request` under `policy`.
    ///
    /// Requests without trust metadata pass unconditionally, except blank
    /// requests when `create_blank_on_trusted` is set: those get the
    /// configured default level and default tag selection.
    ///
    /// A request carrying only a tag selection is still checked against the
    /// host's attested tags; it does not pass unverified.
    ///
    /// # Errors
    ///
    /// Returns [`RequirementError`] if a tag selection is malformed or a
    /// default level is needed but unset.
    pub fn from_request(
        request: &RequestContext,
        policy: &PolicyConfig,
    ) -> Result<Self, RequirementError> {
        let trust = request.get(TRUST_KEY, TRUST_ALIAS_KEY);
        let tags = request.get(TAGS_KEY, TAGS_ALIAS_KEY);

        if trust.is_none() && tags.is_none() {
            if request.is_blank() && policy.create_blank_on_trusted {
                return Ok(Self {
                    level: Some(default_level(policy)?),
                    tags: TagSelection::parse(&policy.default_asset_tags)?,
                });
            }
            return Ok(Self::default());
        }

        let level = match trust {
            Some(raw) if raw.trim().is_empty() => Some(default_level(policy)?),
            Some(raw) => Some(TrustLevel::parse(raw)),
            None => None,
        };
        let tags = match tags {
            Some(raw) => TagSelection::parse(raw)?,
            None => None,
        };
        Ok(Self { level, tags })
    }

    /// Whether nothing is required.
    pub fn is_empty(&self) -> bool {
        self.level.is_none() && self.tags.is_none()
    }
}

fn default_level(policy: &PolicyConfig) -> Result<TrustLevel, RequirementError> {
    policy
        .default_trust_level
        .as_deref()
        .map(str::trim)
        .filter(|level| !level.is_empty())
        .map(TrustLevel::parse)
        .ok_or(RequirementError::MissingDefaultTrustLevel)
}

// ---------------------------------------------------------------------------
// Decision
// ---------------------------------------------------------------------------

/// Why a candidate was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    /// The host's attested level differs from the required one.
    TrustMismatch {
        /// Level the request demanded.
        required: TrustLevel,
        /// Level the cache reported.
        actual: TrustLevel,
    },
    /// The host's attested tags do not satisfy the selection.
    TagMismatch,
    /// The request's requirement could not be derived.
    InvalidRequirement(RequirementError),
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TrustMismatch { required, actual } => {
                write!(f, "host is {actual}, request requires {required}")
            }
            Self::TagMismatch => f.write_str("host tags do not satisfy the tag selection"),
            Self::InvalidRequirement(e) => write!(f, "invalid trust requirement: {e}"),
        }
    }
}

/// Outcome for one candidate host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// The host may be used.
    Accept,
    /// The host must be skipped.
    Reject(RejectReason),
}

impl Decision {
    /// Whether the host may be used.
    pub fn is_accept(&self) -> bool {
        matches!(self, Self::Accept)
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Evaluates candidate hosts against request trust requirements.
#[derive(Debug, Clone)]
pub struct TrustDecisionEngine {
    cache: Arc<AttestationCache>,
    policy: PolicyConfig,
}

impl TrustDecisionEngine {
    /// Create an engine over a shared cache.
    pub fn new(cache: Arc<AttestationCache>, policy: PolicyConfig) -> Self {
        Self { cache, policy }
    }

    /// Whether `backend_host` (`host@backend` form) passes `request`.
    pub async fn evaluate(&self, backend_host: &str, request: &RequestContext) -> bool {
        self.decide(backend_host, request).await.is_accept()
    }

    /// Decide for `backend_host` (`host@backend` form), with the reject reason.
    pub async fn decide(&self, backend_host: &str, request: &RequestContext) -> Decision {
        let host = HostId::from_backend(backend_host);
        let requirement = match TrustRequirement::from_request(request, &self.policy) {
            Ok(requirement) => requirement,
            Err(e) => {
                warn!(%host, error = %e, "rejecting host, trust requirement is invalid");
                return Decision::Reject(RejectReason::InvalidRequirement(e));
            }
        };
        if requirement.is_empty() {
            debug!(%host, "no trust requirement, passing host");
            return Decision::Accept;
        }

        let decision = self.check(&host, &requirement).await;
        match &decision {
            Decision::Accept => debug!(%host, "host satisfies trust requirement"),
            Decision::Reject(reason) => info!(%host, %reason, "host rejected"),
        }
        decision
    }

    /// Check `host` against an already-derived requirement.
    pub async fn check(&self, host: &HostId, requirement: &TrustRequirement) -> Decision {
        if let Some(required) = &requirement.level {
            let actual = self.cache.get_trust_level(host).await;
            if !actual.satisfies(required) {
                return Decision::Reject(RejectReason::TrustMismatch {
                    required: required.clone(),
                    actual,
                });
            }
        }

        if let Some(selection) = &requirement.tags {
            let host_tags = self.cache.get_tags(host).await;
            debug!(%host, ?host_tags, selection = ?selection.required(), "checking tag selection");
            if !selection.matches(&host_tags) {
                return Decision::Reject(RejectReason::TagMismatch);
            }
        }

        Decision::Accept
    }
}
