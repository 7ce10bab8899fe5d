//! Time-bounded attestation cache.
//!
//! Maps each tracked host to its last attested trust level, tags and
//! verification time. A lookup that finds its host unseen or stale refreshes
//! the whole tracked set with one batch query before answering.
//!
//! Refresh sequence:
//! 1. every tracked entry is invalidated (level `unknown`, tags cleared)
//! 2. one [`AttestationClient::query`] covers all tracked hosts, with no
//!    table lock held
//! 3. on "no data" the entries stay invalidated until the next lookup
//! 4. otherwise every reported entry is written under one write lock
//!
//! Refreshes are single-flight: concurrent stale lookups wait on one gate
//! and re-check freshness before issuing another query.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeDelta, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::attestation::{AttestationClient, AttestationReport};
use crate::config::CacheConfig;
use crate::types::{AttestationRecord, HostId, HostTags, TrustLevel};

/// What a refresh did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// The authority answered; this many reports were stored.
    Updated(usize),
    /// The query failed; tracked hosts stay `unknown`.
    NoData,
    /// No hosts are tracked, nothing was queried.
    Empty,
    /// A previous attempt is too recent; nothing was queried.
    Deferred,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    trust_level: TrustLevel,
    tags: HostTags,
    verified_at: DateTime<Utc>,
    /// Not attested since it was first tracked or last invalidated.
    pending: bool,
}

impl CacheEntry {
    fn unseen() -> Self {
        Self {
            trust_level: TrustLevel::Unknown,
            tags: HostTags::new(),
            verified_at: DateTime::<Utc>::UNIX_EPOCH,
            pending: true,
        }
    }

    fn invalidate(&mut self) {
        self.trust_level = TrustLevel::Unknown;
        self.tags.clear();
        self.pending = true;
    }

    fn to_record(&self, host: &HostId) -> AttestationRecord {
        AttestationRecord {
            host: host.clone(),
            trust_level: self.trust_level.clone(),
            tags: self.tags.clone(),
            verified_at: self.verified_at,
        }
    }
}

/// Shared cache of host attestations.
///
/// Safe to share behind an [`Arc`] across scheduling tasks. The table lock is
/// a sync [`RwLock`] since its critical sections never await.
pub struct AttestationCache {
    client: Arc<dyn AttestationClient>,
    staleness_window: TimeDelta,
    min_refresh_interval: TimeDelta,
    table: RwLock<HashMap<HostId, CacheEntry>>,
    /// Serializes refreshes; holds the start time of the last attempt.
    refresh_gate: Mutex<Option<DateTime<Utc>>>,
}

impl std::fmt::Debug for AttestationCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttestationCache")
            .field("staleness_window", &self.staleness_window)
            .field("min_refresh_interval", &self.min_refresh_interval)
            .field("tracked", &self.tracked_hosts().len())
            .finish_non_exhaustive()
    }
}

impl AttestationCache {
    /// Create an empty cache backed by `client`.
    pub fn new(client: Arc<dyn AttestationClient>, config: &CacheConfig) -> Self {
        if config.auth_timeout_secs <= 0 {
            warn!(
                auth_timeout_secs = config.auth_timeout_secs,
                "non-positive attestation cache window, every lookup will query the authority"
            );
        }
        let min_refresh_interval = i64::try_from(config.min_refresh_interval_secs)
            .ok()
            .and_then(TimeDelta::try_seconds)
            .unwrap_or(TimeDelta::MAX);

        Self {
            client,
            staleness_window: config.staleness_window(),
            min_refresh_interval,
            table: RwLock::new(HashMap::new()),
            refresh_gate: Mutex::new(None),
        }
    }

    /// Current trust level of `host`, refreshing first if stale or unseen.
    pub async fn get_trust_level(&self, host: &HostId) -> TrustLevel {
        self.lookup(host).await.trust_level
    }

    /// Attested tags of `host`, refreshing first if stale or unseen.
    ///
    /// Empty if the host was never successfully attested.
    pub async fn get_tags(&self, host: &HostId) -> HostTags {
        self.lookup(host).await.tags
    }

    /// Full record of `host`, refreshing first if stale or unseen.
    pub async fn lookup(&self, host: &HostId) -> AttestationRecord {
        if let Some(record) = self.fresh_record(host, Utc::now()) {
            return record;
        }
        self.track(std::slice::from_ref(host));

        let mut last_attempt = self.refresh_gate.lock().await;
        let now = Utc::now();
        // Another task may have refreshed while this one waited.
        if let Some(record) = self.fresh_record(host, now) {
            return record;
        }
        if self.deferred(*last_attempt, now) {
            debug!(%host, "refresh attempted too recently, serving cached state");
        } else {
            *last_attempt = Some(now);
            self.refresh_locked().await;
        }
        drop(last_attempt);

        self.record(host).unwrap_or_else(|| CacheEntry::unseen().to_record(host))
    }

    /// Refresh every tracked host now, regardless of staleness.
    pub async fn refresh(&self) -> RefreshOutcome {
        let mut last_attempt = self.refresh_gate.lock().await;
        let now = Utc::now();
        if self.deferred(*last_attempt, now) {
            return RefreshOutcome::Deferred;
        }
        *last_attempt = Some(now);
        self.refresh_locked().await
    }

    /// Start tracking `hosts` without attesting them.
    pub fn track(&self, hosts: &[HostId]) {
        let mut table = self.table.write().unwrap_or_else(PoisonError::into_inner);
        for host in hosts {
            table.entry(host.clone()).or_insert_with(CacheEntry::unseen);
        }
    }

    /// Copy out the cached record for `host` without refreshing.
    pub fn record(&self, host: &HostId) -> Option<AttestationRecord> {
        let table = self.table.read().unwrap_or_else(PoisonError::into_inner);
        table.get(host).map(|entry| entry.to_record(host))
    }

    /// All tracked hosts, sorted.
    pub fn tracked_hosts(&self) -> Vec<HostId> {
        let table = self.table.read().unwrap_or_else(PoisonError::into_inner);
        let mut hosts: Vec<HostId> = table.keys().cloned().collect();
        hosts.sort();
        hosts
    }

    /// Whether the cached record for `host` needs a refresh at `now`.
    ///
    /// Untracked hosts are stale.
    pub fn is_stale(&self, host: &HostId, now: DateTime<Utc>) -> bool {
        self.fresh_record(host, now).is_none()
    }

    fn fresh_record(&self, host: &HostId, now: DateTime<Utc>) -> Option<AttestationRecord> {
        let table = self.table.read().unwrap_or_else(PoisonError::into_inner);
        table
            .get(host)
            .filter(|entry| !self.entry_stale(entry, now))
            .map(|entry| entry.to_record(host))
    }

    fn entry_stale(&self, entry: &CacheEntry, now: DateTime<Utc>) -> bool {
        entry.pending || now.signed_duration_since(entry.verified_at) >= self.staleness_window
    }

    fn deferred(&self, last_attempt: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        self.min_refresh_interval > TimeDelta::zero()
            && last_attempt
                .is_some_and(|at| now.signed_duration_since(at) < self.min_refresh_interval)
    }

    /// Caller must hold `refresh_gate`.
    async fn refresh_locked(&self) -> RefreshOutcome {
        let hosts = {
            let mut table = self.table.write().unwrap_or_else(PoisonError::into_inner);
            for entry in table.values_mut() {
                entry.invalidate();
            }
            let mut hosts: Vec<HostId> = table.keys().cloned().collect();
            hosts.sort();
            hosts
        };
        if hosts.is_empty() {
            return RefreshOutcome::Empty;
        }

        info!(hosts = hosts.len(), "refreshing attestation cache");
        let reports = match self.client.query(&hosts).await {
            Ok(reports) => reports,
            Err(e) => {
                warn!(error = %e, hosts = hosts.len(), "attestation query failed, hosts stay unknown");
                return RefreshOutcome::NoData;
            }
        };

        let now = Utc::now();
        let updates: Vec<(HostId, CacheEntry)> = reports
            .into_iter()
            .map(|report| entry_from_report(report, now))
            .collect();
        let stored = updates.len();

        let mut table = self.table.write().unwrap_or_else(PoisonError::into_inner);
        for (host, mut entry) in updates {
            if let Some(previous) = table.get(&host) {
                entry.verified_at = entry.verified_at.max(previous.verified_at);
            }
            table.insert(host, entry);
        }
        drop(table);

        debug!(stored, "attestation cache refreshed");
        RefreshOutcome::Updated(stored)
    }
}

fn entry_from_report(report: AttestationReport, now: DateTime<Utc>) -> (HostId, CacheEntry) {
    let host = HostId::new(report.host.trim());
    let tags = report
        .tags
        .into_iter()
        .map(|(name, value)| (name.trim().to_lowercase(), value.trim().to_lowercase()))
        .collect();

    let entry = match parse_vtime(&report.vtime) {
        Some(verified_at) => CacheEntry {
            trust_level: TrustLevel::parse(&report.trust_level),
            tags,
            verified_at,
            pending: false,
        },
        None => {
            warn!(%host, vtime = %report.vtime, "unparsable verification time, marking host unknown");
            CacheEntry {
                trust_level: TrustLevel::Unknown,
                tags: HostTags::new(),
                verified_at: now,
                pending: false,
            }
        }
    };
    (host, entry)
}

/// Parse an authority verification time as UTC.
///
/// ISO-8601 first (offset-aware or naive-as-UTC), then the C locale
/// `%c` rendering, e.g. `Tue Mar 27 09:42:09 2012`.
pub fn parse_vtime(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    parse_iso8601(raw).or_else(|| {
        NaiveDateTime::parse_from_str(raw, "%a %b %e %H:%M:%S %Y")
            .ok()
            .map(|naive| naive.and_utc())
    })
}

fn parse_iso8601(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f%z", "%Y-%m-%d %H:%M:%S%.f%z"] {
        if let Ok(dt) = DateTime::parse_from_str(raw, fmt) {
            return Some(dt.with_timezone(&Utc));
        }
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}
