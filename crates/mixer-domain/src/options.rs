//! Options for the Check, Report and Quota subsystems.

use std::time::{Duration, Instant};

use crate::error::{MixerError, MixerResult};

/// Longest validity honored for a cached decision or a quota grant.
/// Longer durations, such as a server's "valid forever", are clamped to it.
pub const MAX_VALIDITY: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Instant at which something valid for `ttl` from `now` expires.
pub(crate) fn valid_until(now: Instant, ttl: Duration) -> Instant {
    now.checked_add(ttl.min(MAX_VALIDITY)).unwrap_or(now)
}

/// Options for the Check result cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckOptions {
    /// Maximum number of cached decisions. Zero disables caching; every
    /// Check then goes to the server (still deduplicated while in flight).
    pub cache_capacity: u64,
    /// Default lifetime of a cached decision.
    pub ttl: Duration,
    /// Local approvals served from one decision before it is revalidated.
    pub amortization_limit: u32,
}

impl Default for CheckOptions {
    fn default() -> Self {
        Self {
            cache_capacity: 10_000,
            ttl: Duration::from_secs(10),
            amortization_limit: 100,
        }
    }
}

impl CheckOptions {
    pub fn with_cache_capacity(mut self, capacity: u64) -> Self {
        self.cache_capacity = capacity;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_amortization_limit(mut self, limit: u32) -> Self {
        self.amortization_limit = limit;
        self
    }

    pub fn validate(&self) -> MixerResult<()> {
        if self.cache_capacity > 0 {
            if self.ttl.is_zero() {
                return Err(MixerError::configuration(
                    "check.ttl must be greater than 0 when caching is enabled",
                ));
            }
            if self.amortization_limit == 0 {
                return Err(MixerError::configuration(
                    "check.amortization_limit must be greater than 0 when caching is enabled",
                ));
            }
        }
        Ok(())
    }
}

/// Options for the Report batching buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportOptions {
    /// Flush once this many entries are buffered.
    pub max_batch_entries: usize,
    /// Flush once the oldest buffered entry is this old.
    pub max_batch_age: Duration,
    /// Flush once the buffered attributes reach this estimated size.
    pub max_buffer_bytes: usize,
}

impl Default for ReportOptions {
    fn default() -> Self {
        Self {
            max_batch_entries: 1_000,
            max_batch_age: Duration::from_secs(1),
            max_buffer_bytes: 1024 * 1024,
        }
    }
}

impl ReportOptions {
    pub fn with_max_batch_entries(mut self, entries: usize) -> Self {
        self.max_batch_entries = entries;
        self
    }

    pub fn with_max_batch_age(mut self, age: Duration) -> Self {
        self.max_batch_age = age;
        self
    }

    pub fn with_max_buffer_bytes(mut self, bytes: usize) -> Self {
        self.max_buffer_bytes = bytes;
        self
    }

    pub fn validate(&self) -> MixerResult<()> {
        if self.max_batch_entries == 0 {
            return Err(MixerError::configuration(
                "report.max_batch_entries must be greater than 0",
            ));
        }
        if self.max_batch_age.is_zero() {
            return Err(MixerError::configuration(
                "report.max_batch_age must be greater than 0",
            ));
        }
        if self.max_buffer_bytes == 0 {
            return Err(MixerError::configuration(
                "report.max_buffer_bytes must be greater than 0",
            ));
        }
        Ok(())
    }
}

/// Options for the Quota allocation cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaOptions {
    /// Maximum number of quota keys held locally.
    pub cache_capacity: usize,
    /// Minimum amount requested from the server per allocation.
    pub prefetch_amount: i64,
    /// A local grant leaving less than this balance starts a background refill.
    pub low_water_mark: i64,
    /// Lifetime of a grant when the server does not specify one.
    pub ttl: Duration,
    /// Grant optimistically when the local balance is insufficient.
    pub best_effort: bool,
}

impl Default for QuotaOptions {
    fn default() -> Self {
        Self {
            cache_capacity: 10_000,
            prefetch_amount: 100,
            low_water_mark: 10,
            ttl: Duration::from_secs(60),
            best_effort: false,
        }
    }
}

impl QuotaOptions {
    pub fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity;
        self
    }

    pub fn with_prefetch_amount(mut self, amount: i64) -> Self {
        self.prefetch_amount = amount;
        self
    }

    pub fn with_low_water_mark(mut self, mark: i64) -> Self {
        self.low_water_mark = mark;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Enables or disables optimistic grants.
    pub fn with_best_effort(mut self, best_effort: bool) -> Self {
        self.best_effort = best_effort;
        self
    }

    pub fn validate(&self) -> MixerResult<()> {
        if self.cache_capacity == 0 {
            return Err(MixerError::configuration(
                "quota.cache_capacity must be greater than 0",
            ));
        }
        if self.prefetch_amount <= 0 {
            return Err(MixerError::configuration(
                "quota.prefetch_amount must be greater than 0",
            ));
        }
        if self.low_water_mark < 0 || self.low_water_mark >= self.prefetch_amount {
            return Err(MixerError::configuration(format!(
                "quota.low_water_mark must be in [0, {}), got {}",
                self.prefetch_amount, self.low_water_mark
            )));
        }
        if self.ttl.is_zero() {
            return Err(MixerError::configuration(
                "quota.ttl must be greater than 0",
            ));
        }
        Ok(())
    }
}

/// Options bundle for a mixer client.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MixerClientOptions {
    pub check_options: CheckOptions,
    pub report_options: ReportOptions,
    pub quota_options: QuotaOptions,
    /// Deadline hint attached to every transport request.
    pub deadline_hint: Option<Duration>,
}

impl MixerClientOptions {
    pub fn new(
        check_options: CheckOptions,
        report_options: ReportOptions,
        quota_options: QuotaOptions,
    ) -> Self {
        Self {
            check_options,
            report_options,
            quota_options,
            deadline_hint: None,
        }
    }

    pub fn with_deadline_hint(mut self, deadline: Duration) -> Self {
        self.deadline_hint = Some(deadline);
        self
    }

    /// Rejects invalid option combinations.
    pub fn validate(&self) -> MixerResult<()> {
        self.check_options.validate()?;
        self.report_options.validate()?;
        self.quota_options.validate()
    }
}
