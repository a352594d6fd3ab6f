//! Local quota allocation cache.
//!
//! The server stays authoritative for quota, but granting every unit over
//! the network would cost a round trip per request. Instead the client asks
//! for a prefetch amount and serves later allocations from the local
//! balance (`granted - consumed`).
//!
//! # Allocation Flow
//!
//! - balance covers the request: consume locally, `Granted`
//! - the grant leaves balance under the low-water mark: also start one
//!   background refill
//! - balance short and best-effort off: `NeedsFetch`, the caller waits for a
//!   network allocation
//! - balance short and best-effort on: consume optimistically and refill,
//!   unless the consumed tally would overflow
//!
//! Expired entries lose their remaining balance.
//!
//! # Thread Safety
//!
//! Entries live in a DashMap; every mutation of an entry happens under its
//! shard lock, never across a network call.

use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::attributes::{Attributes, Fingerprint, QUOTA_AMOUNT, QUOTA_NAME};
use crate::error::{MixerError, MixerResult};
use crate::options::{valid_until, QuotaOptions};

/// Key identifying one locally held allocation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QuotaKey {
    /// The quota name (e.g., "requestcount").
    pub name: String,
    /// Fingerprint of the call's attributes without the amount.
    pub fingerprint: Fingerprint,
}

impl QuotaKey {
    pub fn new(name: impl Into<String>, fingerprint: Fingerprint) -> Self {
        Self {
            name: name.into(),
            fingerprint,
        }
    }
}

/// A Quota call decoded from its attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaCall {
    pub key: QuotaKey,
    pub amount: i64,
}

impl QuotaCall {
    /// Extracts the quota name and amount from `quota.name` and
    /// `quota.amount`. The amount defaults to 1.
    pub fn from_attributes(attributes: &Attributes) -> MixerResult<Self> {
        let name = attributes
            .get(QUOTA_NAME)
            .and_then(|value| value.as_str())
            .filter(|name| !name.is_empty())
            .ok_or_else(|| MixerError::InvalidArgument {
                message: format!("quota call requires a non-empty string attribute '{QUOTA_NAME}'"),
            })?;

        let amount = match attributes.get(QUOTA_AMOUNT) {
            None => 1,
            Some(value) => value.as_i64().filter(|amount| *amount > 0).ok_or_else(|| {
                MixerError::InvalidArgument {
                    message: format!(
                        "attribute '{QUOTA_AMOUNT}' must be a positive int64, got {}",
                        value.type_name()
                    ),
                }
            })?,
        };

        let fingerprint = if attributes.contains(QUOTA_AMOUNT) {
            let mut keyed = attributes.clone();
            keyed.remove(QUOTA_AMOUNT);
            keyed.fingerprint()
        } else {
            attributes.fingerprint()
        };

        Ok(Self {
            key: QuotaKey::new(name, fingerprint),
            amount,
        })
    }
}

/// Outcome of a local allocation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocOutcome {
    /// Served locally. `refill` is set for the single caller that must
    /// start the background refill for this key.
    Granted { refill: bool },
    /// Local balance is insufficient; a network allocation is required.
    NeedsFetch,
}

/// Point-in-time view of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaSnapshot {
    pub granted: i64,
    pub consumed: i64,
    pub refill_in_flight: bool,
}

impl QuotaSnapshot {
    pub fn balance(&self) -> i64 {
        self.granted - self.consumed
    }
}

#[derive(Debug)]
struct QuotaCacheEntry {
    granted: i64,
    consumed: i64,
    expires_at: Instant,
    refill_in_flight: bool,
    last_used: Instant,
}

impl QuotaCacheEntry {
    fn new(now: Instant, ttl: Duration) -> Self {
        Self {
            granted: 0,
            consumed: 0,
            expires_at: valid_until(now, ttl),
            refill_in_flight: false,
            last_used: now,
        }
    }

    fn balance(&self) -> i64 {
        self.granted - self.consumed
    }

    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    /// Discards the balance; a refill already in flight stays tracked.
    fn discard(&mut self, now: Instant, ttl: Duration) {
        self.granted = 0;
        self.consumed = 0;
        self.expires_at = valid_until(now, ttl);
    }

    fn try_begin_refill(&mut self) -> bool {
        !std::mem::replace(&mut self.refill_in_flight, true)
    }
}

/// Quota allocations held locally, keyed by [`QuotaKey`].
#[derive(Debug)]
pub struct QuotaCache {
    entries: DashMap<QuotaKey, QuotaCacheEntry>,
    options: QuotaOptions,
}

impl QuotaCache {
    pub fn new(options: QuotaOptions) -> Self {
        Self {
            entries: DashMap::new(),
            options,
        }
    }

    pub fn options(&self) -> &QuotaOptions {
        &self.options
    }

    /// Amount to request from the server for a call needing `amount`.
    pub fn fetch_amount(&self, amount: i64) -> i64 {
        amount.max(self.options.prefetch_amount)
    }

    /// Tries to allocate `amount` from the local balance.
    pub fn alloc(&self, key: &QuotaKey, amount: i64) -> AllocOutcome {
        let now = Instant::now();
        self.make_room(key, now);

        let mut entry = self
            .entries
            .entry(key.clone())
            .or_insert_with(|| QuotaCacheEntry::new(now, self.options.ttl));
        if entry.is_expired(now) {
            entry.discard(now, self.options.ttl);
        }
        entry.last_used = now;

        if entry.balance() >= amount {
            entry.consumed += amount;
            let refill = entry.balance() < self.options.low_water_mark && entry.try_begin_refill();
            metrics::counter!("mixer_quota_local_grants_total").increment(1);
            return AllocOutcome::Granted { refill };
        }

        if self.options.best_effort {
            // An optimistic grant that would overflow the tally waits for
            // the server instead.
            if let Some(consumed) = entry.consumed.checked_add(amount) {
                entry.consumed = consumed;
                let refill = entry.try_begin_refill();
                tracing::debug!(
                    quota = %key.name,
                    amount,
                    balance = entry.balance(),
                    "granting quota optimistically"
                );
                return AllocOutcome::Granted { refill };
            }
        }

        AllocOutcome::NeedsFetch
    }

    /// Marks a network allocation as in flight for `key`.
    pub fn begin_refill(&self, key: &QuotaKey) {
        if let Some(mut entry) = self.entries.get_mut(key) {
            entry.refill_in_flight = true;
        }
    }

    /// Clears the in-flight marker after a failed allocation.
    pub fn end_refill(&self, key: &QuotaKey) {
        if let Some(mut entry) = self.entries.get_mut(key) {
            entry.refill_in_flight = false;
        }
    }

    /// Applies a server grant: adds to a live balance or starts a new one.
    pub fn apply_grant(&self, key: &QuotaKey, granted: i64, valid_duration: Duration) {
        let now = Instant::now();
        self.make_room(key, now);

        let mut entry = self
            .entries
            .entry(key.clone())
            .or_insert_with(|| QuotaCacheEntry::new(now, valid_duration));
        if entry.is_expired(now) {
            entry.discard(now, valid_duration);
        }
        entry.granted = entry.granted.saturating_add(granted.max(0));
        entry.expires_at = valid_until(now, valid_duration);
        entry.refill_in_flight = false;
        entry.last_used = now;
    }

    /// Consumes `amount` from the balance if it is fully covered.
    pub fn consume(&self, key: &QuotaKey, amount: i64) -> bool {
        let now = Instant::now();
        match self.entries.get_mut(key) {
            Some(mut entry) if !entry.is_expired(now) && entry.balance() >= amount => {
                entry.consumed += amount;
                entry.last_used = now;
                true
            }
            _ => false,
        }
    }

    /// Returns the current state of a live entry.
    pub fn snapshot(&self, key: &QuotaKey) -> Option<QuotaSnapshot> {
        let now = Instant::now();
        self.entries
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| QuotaSnapshot {
                granted: entry.granted,
                consumed: entry.consumed,
                refill_in_flight: entry.refill_in_flight,
            })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Keeps the map under capacity before a new key is inserted: expired
    /// entries go first, then the least recently used one.
    ///
    /// Must not be called while holding an entry reference.
    fn make_room(&self, key: &QuotaKey, now: Instant) {
        if self.entries.len() < self.options.cache_capacity || self.entries.contains_key(key) {
            return;
        }

        self.entries.retain(|_, entry| !entry.is_expired(now));
        if self.entries.len() < self.options.cache_capacity {
            return;
        }

        let victim = self
            .entries
            .iter()
            .min_by_key(|entry| entry.value().last_used)
            .map(|entry| entry.key().clone());
        if let Some(victim) = victim {
            tracing::debug!(quota = %victim.name, "evicting least recently used quota entry");
            self.entries.remove(&victim);
        }
    }
}

/// Registers quota metrics descriptions.
pub fn register_quota_metrics() {
    metrics::describe_counter!(
        "mixer_quota_local_grants_total",
        "Total number of quota allocations served from the local balance"
    );
    metrics::describe_counter!(
        "mixer_quota_fetches_total",
        "Total number of quota allocation requests sent to the server"
    );
}
