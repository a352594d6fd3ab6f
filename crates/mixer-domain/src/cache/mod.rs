//! Check result caching with TTL and count-based revalidation.
//!
//! This module provides the check cache using Moka for concurrent access
//! with LRU eviction and per-entry expiry.
//!
//! # Amortization
//!
//! A cached decision backs a bounded number of local approvals. Each lookup
//! increments the entry's hit counter:
//!
//! - within the amortization limit the lookup is a [`CacheLookup::Hit`]
//! - beyond it the lookup is [`CacheLookup::StaleNeedsRevalidate`]: the cached
//!   decision is still served while the caller refreshes it in the background
//! - once `valid_until` passes the entry is gone and the lookup is a
//!   [`CacheLookup::Miss`]
//!
//! # Key Design
//!
//! Entries are keyed by the attribute [`Fingerprint`]. A fingerprint
//! collision can only produce a stale answer bounded by TTL and hit count;
//! entries never need the original attribute set.
//!
//! # Example
//!
//! ```rust,ignore
//! use mixer_domain::cache::{CacheLookup, CheckCache};
//! use mixer_domain::{CheckDecision, CheckOptions};
//! use std::time::Duration;
//!
//! let cache = CheckCache::new(CheckOptions::default());
//! cache.put(fingerprint, CheckDecision::Allowed, Duration::from_secs(1));
//!
//! assert!(matches!(cache.get(&fingerprint), CacheLookup::Hit(_)));
//! ```

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use moka::policy::EvictionPolicy;
use moka::sync::Cache;
use moka::Expiry;

use crate::attributes::Fingerprint;
use crate::options::{valid_until, CheckOptions};
use crate::transport::CheckDecision;

/// Result of a cache lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheLookup {
    /// Fresh decision within its amortization limit.
    Hit(CheckDecision),
    /// No usable entry; the server must be consulted.
    Miss,
    /// Decision past its amortization limit; serve it and revalidate.
    StaleNeedsRevalidate(CheckDecision),
}

/// A cached server decision.
#[derive(Debug)]
struct CheckCacheEntry {
    fingerprint: Fingerprint,
    decision: CheckDecision,
    valid_until: Instant,
    hits: AtomicU32,
    amortization_limit: u32,
    pending_revalidation: AtomicBool,
}

impl CheckCacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.valid_until
    }

    /// Increments the hit counter and returns the new count.
    fn record_hit(&self) -> u32 {
        let previous = self
            .hits
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |hits| {
                Some(hits.saturating_add(1))
            })
            .unwrap_or(u32::MAX);
        previous.saturating_add(1)
    }
}

/// Expires each entry at its own `valid_until`.
struct ValidUntilExpiry;

impl Expiry<Fingerprint, Arc<CheckCacheEntry>> for ValidUntilExpiry {
    fn expire_after_create(
        &self,
        _key: &Fingerprint,
        value: &Arc<CheckCacheEntry>,
        created_at: Instant,
    ) -> Option<Duration> {
        Some(value.valid_until.saturating_duration_since(created_at))
    }

    fn expire_after_update(
        &self,
        _key: &Fingerprint,
        value: &Arc<CheckCacheEntry>,
        updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.valid_until.saturating_duration_since(updated_at))
    }
}

/// Check decision cache with LRU eviction and amortized revalidation.
///
/// # Thread Safety
///
/// This cache is fully thread-safe and can be shared across threads without
/// external synchronization. Hit counters and revalidation flags are atomics
/// on the shared entry.
pub struct CheckCache {
    /// The underlying Moka cache storing decisions.
    cache: Cache<Fingerprint, Arc<CheckCacheEntry>>,
    /// Configuration for this cache instance.
    options: CheckOptions,
}

impl std::fmt::Debug for CheckCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckCache")
            .field("options", &self.options)
            .field("entry_count", &self.cache.entry_count())
            .finish()
    }
}

impl CheckCache {
    /// Creates a new check cache with the given options.
    pub fn new(options: CheckOptions) -> Self {
        let cache = Cache::builder()
            .max_capacity(options.cache_capacity)
            .eviction_policy(EvictionPolicy::lru())
            .expire_after(ValidUntilExpiry)
            .build();

        Self { cache, options }
    }

    /// Returns the options for this cache.
    pub fn options(&self) -> &CheckOptions {
        &self.options
    }

    /// Returns whether caching is enabled (non-zero capacity).
    pub fn is_enabled(&self) -> bool {
        self.options.cache_capacity > 0
    }

    /// Looks up a decision and counts the lookup against its amortization limit.
    ///
    /// # Metrics
    ///
    /// - `mixer_check_cache_hits_total` - fresh hits
    /// - `mixer_check_cache_stale_total` - hits past the amortization limit
    /// - `mixer_check_cache_misses_total` - misses
    pub fn get(&self, fingerprint: &Fingerprint) -> CacheLookup {
        if !self.is_enabled() {
            return CacheLookup::Miss;
        }

        let entry = match self.cache.get(fingerprint) {
            Some(entry) if !entry.is_expired(Instant::now()) => entry,
            _ => {
                metrics::counter!("mixer_check_cache_misses_total").increment(1);
                return CacheLookup::Miss;
            }
        };

        let hits = entry.record_hit();
        if hits <= entry.amortization_limit {
            metrics::counter!("mixer_check_cache_hits_total").increment(1);
            CacheLookup::Hit(entry.decision.clone())
        } else {
            metrics::counter!("mixer_check_cache_stale_total").increment(1);
            tracing::trace!(
                fingerprint = %entry.fingerprint,
                hits,
                limit = entry.amortization_limit,
                "cached check decision past amortization limit"
            );
            CacheLookup::StaleNeedsRevalidate(entry.decision.clone())
        }
    }

    /// Inserts or overwrites a decision using the configured amortization limit.
    pub fn put(&self, fingerprint: Fingerprint, decision: CheckDecision, ttl: Duration) {
        self.put_with_limit(fingerprint, decision, ttl, self.options.amortization_limit);
    }

    /// Inserts or overwrites a decision with an explicit amortization limit.
    ///
    /// The hit counter and revalidation flag start fresh.
    pub fn put_with_limit(
        &self,
        fingerprint: Fingerprint,
        decision: CheckDecision,
        ttl: Duration,
        amortization_limit: u32,
    ) {
        if !self.is_enabled() || ttl.is_zero() || amortization_limit == 0 {
            return;
        }

        let entry = CheckCacheEntry {
            fingerprint,
            decision,
            valid_until: valid_until(Instant::now(), ttl),
            hits: AtomicU32::new(0),
            amortization_limit,
            pending_revalidation: AtomicBool::new(false),
        };
        self.cache.insert(fingerprint, Arc::new(entry));
    }

    /// Marks the entry as being revalidated.
    ///
    /// Returns `true` only for the caller that flipped the flag, so at most
    /// one revalidation is started per cached decision.
    pub fn begin_revalidation(&self, fingerprint: &Fingerprint) -> bool {
        self.cache
            .get(fingerprint)
            .is_some_and(|entry| !entry.pending_revalidation.swap(true, Ordering::AcqRel))
    }

    /// Clears the revalidation flag after a failed revalidation so a later
    /// lookup may try again.
    pub fn end_revalidation(&self, fingerprint: &Fingerprint) {
        if let Some(entry) = self.cache.get(fingerprint) {
            entry.pending_revalidation.store(false, Ordering::Release);
        }
    }

    /// Returns the hit count of a live entry.
    pub fn hit_count(&self, fingerprint: &Fingerprint) -> Option<u32> {
        self.cache
            .get(fingerprint)
            .map(|entry| entry.hits.load(Ordering::Acquire))
    }

    /// Manually invalidates a single cache entry.
    pub fn invalidate(&self, fingerprint: &Fingerprint) {
        self.cache.invalidate(fingerprint);
    }

    /// Drops every cached decision.
    pub fn clear(&self) {
        self.cache.invalidate_all();
    }

    /// Returns the approximate number of entries in the cache.
    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }

    /// Runs pending maintenance tasks.
    ///
    /// This triggers any pending evictions. Useful for testing eviction.
    pub fn run_pending_tasks(&self) {
        self.cache.run_pending_tasks();
    }
}

/// Registers check cache metrics descriptions.
///
/// Call this function once during application startup to register metric
/// descriptions with the installed recorder.
pub fn register_check_cache_metrics() {
    metrics::describe_counter!(
        "mixer_check_cache_hits_total",
        "Total number of check cache hits within the amortization limit"
    );
    metrics::describe_counter!(
        "mixer_check_cache_stale_total",
        "Total number of check cache hits served while revalidating"
    );
    metrics::describe_counter!(
        "mixer_check_cache_misses_total",
        "Total number of check cache misses"
    );
}
