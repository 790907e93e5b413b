//! Session correlation across the HTTP and DNS channels.
//!
//! A page load registers a client-chosen session id against the address the
//! server saw. The same id is later embedded as the first label of a hostname
//! the client resolves; the DNS side channel reports which resolver asked, and
//! that address is attached to the session as a second observation.

use crate::detectors::same_address;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

/// Hostnames need more than this many labels to carry a correlation key.
const MIN_HOSTNAME_LABELS: usize = 3;

/// A correlated session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionRecord {
    /// Client-declared session id (case-folded)
    pub session_id: String,
    /// Address observed on the HTTP request
    pub observed_address: String,
    /// Resolver address reported by the DNS side channel
    pub resolver_address: Option<String>,
    /// Registration time
    pub created_at: DateTime<Utc>,
    /// Time the DNS observation arrived
    pub completed_at: Option<DateTime<Utc>>,
    /// Monotonic registration time used for expiry
    #[serde(skip)]
    registered: Instant,
}

impl SessionRecord {
    fn new(session_id: String, observed_address: String) -> Self {
        Self {
            session_id,
            observed_address,
            resolver_address: None,
            created_at: Utc::now(),
            completed_at: None,
            registered: Instant::now(),
        }
    }

    /// Whether the DNS observation came from a different address.
    pub fn resolver_mismatch(&self) -> bool {
        self.resolver_address
            .as_deref()
            .is_some_and(|resolver| !same_address(resolver, &self.observed_address))
    }

    /// Check if the session has expired.
    pub fn is_expired(&self, ttl: Duration) -> bool {
        self.registered.elapsed() > ttl
    }
}

/// Extract the correlation key from a side-channel hostname.
///
/// The first label is the key when the hostname has more than three labels.
/// A single trailing root dot is ignored.
pub fn correlation_key(hostname: &str) -> Option<&str> {
    let hostname = hostname.trim();
    let hostname = hostname.strip_suffix('.').unwrap_or(hostname);
    let labels: Vec<&str> = hostname.split('.').collect();
    if labels.len() <= MIN_HOSTNAME_LABELS {
        return None;
    }
    Some(labels[0]).filter(|key| !key.is_empty())
}

/// Concurrent session store shared by the request and callback paths.
pub struct SessionCorrelator {
    /// Session store
    sessions: DashMap<String, SessionRecord>,
    /// Maximum sessions to track
    max_sessions: usize,
    /// Session lifetime
    ttl: Duration,
    /// Sweep every N operations
    sweep_interval: u64,
    /// Counter for sweep scheduling
    op_counter: AtomicU64,
}

impl SessionCorrelator {
    /// Create a new correlator.
    pub fn new(max_sessions: usize, ttl: Duration, sweep_interval: u64) -> Self {
        Self {
            sessions: DashMap::new(),
            max_sessions,
            ttl,
            sweep_interval: sweep_interval.max(1),
            op_counter: AtomicU64::new(0),
        }
    }

    /// Register a session, replacing any previous record with the same id.
    pub fn register(&self, session_id: &str, observed_address: &str) {
        self.maybe_sweep();

        let key = session_id.trim().to_lowercase();
        if key.is_empty() {
            return;
        }

        if !self.sessions.contains_key(&key) && self.sessions.len() >= self.max_sessions {
            self.evict_oldest();
        }

        debug!(session_id = %key, address = %observed_address, "Session registered");
        self.sessions.insert(
            key.clone(),
            SessionRecord::new(key, observed_address.to_string()),
        );
    }

    /// Attach a resolver address to the session named by `hostname`.
    ///
    /// Returns the merged record, or `None` when the hostname is too short or
    /// the key is unknown or expired.
    pub fn complete(&self, hostname: &str, resolver_address: &str) -> Option<SessionRecord> {
        self.maybe_sweep();

        let key = correlation_key(hostname)?.to_lowercase();

        // Expiry check, removal and merge happen under one shard lock.
        let Entry::Occupied(mut entry) = self.sessions.entry(key) else {
            return None;
        };
        if entry.get().is_expired(self.ttl) {
            entry.remove();
            return None;
        }

        let record = entry.get_mut();
        record.resolver_address = Some(resolver_address.to_string());
        record.completed_at = Some(Utc::now());
        debug!(
            session_id = %record.session_id,
            observed = %record.observed_address,
            resolver = %resolver_address,
            "Session completed by side channel"
        );
        Some(record.clone())
    }

    /// Snapshot of a live session.
    pub fn get(&self, session_id: &str) -> Option<SessionRecord> {
        let key = session_id.trim().to_lowercase();
        self.sessions
            .get(&key)
            .filter(|record| !record.is_expired(self.ttl))
            .map(|record| record.value().clone())
    }

    /// Number of tracked sessions, expired ones included until swept.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no sessions are tracked.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Drop expired sessions.
    pub fn sweep(&self) {
        self.sessions.retain(|_, v| !v.is_expired(self.ttl));
    }

    fn maybe_sweep(&self) {
        let count = self.op_counter.fetch_add(1, Ordering::Relaxed);
        if count % self.sweep_interval == 0 {
            self.sweep();
        }
    }

    fn evict_oldest(&self) {
        let oldest = self
            .sessions
            .iter()
            .min_by_key(|entry| entry.registered)
            .map(|entry| entry.key().clone());
        if let Some(key) = oldest {
            self.sessions.remove(&key);
        }
    }
}

impl Default for SessionCorrelator {
    fn default() -> Self {
        Self::new(100_000, Duration::from_secs(3600), 1000)
    }
}
