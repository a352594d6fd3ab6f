//! Report batching buffer.
//!
//! Reports are fire-and-forget telemetry events. The buffer groups them so
//! many events travel in one transport call. A batch is swapped out of the
//! buffer atomically when one of the flush triggers fires:
//!
//! 1. **Count**: the buffer holds `max_batch_entries` entries
//! 2. **Size**: the buffered attributes reach `max_buffer_bytes`
//! 3. **Age**: the oldest entry is older than `max_batch_age`
//! 4. **Explicit**: [`ReportBatch::flush`], e.g. on shutdown
//!
//! Each swap hands the entries to exactly one caller; an empty buffer never
//! yields a batch. Concurrent flush triggers therefore cannot send the same
//! entries twice, and new entries accumulate in a fresh buffer while the
//! previous batch is being transmitted.

use std::mem;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::attributes::Attributes;
use crate::error::{DoneFunc, MixerError, MixerResult, TransportError};
use crate::options::ReportOptions;

/// One buffered telemetry event.
///
/// An entry may carry a delivery callback that learns the outcome of the
/// batch send. If the entry is dropped before delivery, the callback is
/// completed with a cancellation so it still fires exactly once.
pub struct ReportEntry {
    attributes: Attributes,
    on_delivered: Option<DoneFunc>,
}

impl ReportEntry {
    /// Creates an entry without delivery tracking.
    pub fn new(attributes: Attributes) -> Self {
        Self {
            attributes,
            on_delivered: None,
        }
    }

    /// Creates an entry whose callback receives the batch send result.
    pub fn with_delivery(attributes: Attributes, on_delivered: DoneFunc) -> Self {
        Self {
            attributes,
            on_delivered: Some(on_delivered),
        }
    }

    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    pub fn has_delivery_callback(&self) -> bool {
        self.on_delivered.is_some()
    }

    /// Completes the delivery callback, if any, with `err`.
    fn reject(mut self, err: MixerError) {
        if let Some(on_delivered) = self.on_delivered.take() {
            on_delivered(Err(err));
        }
    }
}

impl std::fmt::Debug for ReportEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReportEntry")
            .field("attributes", &self.attributes)
            .field("tracked", &self.on_delivered.is_some())
            .finish()
    }
}

impl Drop for ReportEntry {
    fn drop(&mut self) {
        if let Some(on_delivered) = self.on_delivered.take() {
            on_delivered(Err(
                TransportError::cancelled("report dropped before delivery").into()
            ));
        }
    }
}

/// Why a batch left the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    MaxEntries,
    MaxBytes,
    MaxAge,
    Explicit,
}

impl FlushReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlushReason::MaxEntries => "max_entries",
            FlushReason::MaxBytes => "max_bytes",
            FlushReason::MaxAge => "max_age",
            FlushReason::Explicit => "explicit",
        }
    }
}

/// Entries swapped out of the buffer, in insertion order.
#[derive(Debug)]
pub struct FlushBatch {
    pub entries: Vec<ReportEntry>,
    pub reason: FlushReason,
}

impl FlushBatch {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Splits the batch into the attribute sets to send and the pending
    /// delivery callbacks.
    pub fn into_parts(mut self) -> (Vec<Attributes>, PendingDeliveries) {
        let mut attributes = Vec::with_capacity(self.entries.len());
        let mut callbacks = Vec::new();
        for mut entry in self.entries.drain(..) {
            attributes.push(mem::take(&mut entry.attributes));
            if let Some(callback) = entry.on_delivered.take() {
                callbacks.push(callback);
            }
        }
        (attributes, PendingDeliveries { callbacks })
    }
}

/// Delivery callbacks of a batch in flight.
///
/// Dropping without [`PendingDeliveries::resolve`] completes every callback
/// with a cancellation.
pub struct PendingDeliveries {
    callbacks: Vec<DoneFunc>,
}

impl PendingDeliveries {
    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }

    /// Completes every callback, in insertion order, with `status`.
    pub fn resolve(mut self, status: MixerResult<()>) {
        for callback in self.callbacks.drain(..) {
            callback(status.clone());
        }
    }
}

impl Drop for PendingDeliveries {
    fn drop(&mut self) {
        let err: MixerError = TransportError::cancelled("report batch abandoned").into();
        for callback in self.callbacks.drain(..) {
            callback(Err(err.clone()));
        }
    }
}

#[derive(Default)]
struct ReportBuffer {
    entries: Vec<ReportEntry>,
    bytes: usize,
    oldest: Option<Instant>,
    closed: bool,
}

impl ReportBuffer {
    fn swap_out(&mut self, reason: FlushReason) -> Option<FlushBatch> {
        if self.entries.is_empty() {
            return None;
        }
        let entries = mem::take(&mut self.entries);
        self.bytes = 0;
        self.oldest = None;
        Some(FlushBatch { entries, reason })
    }
}

/// Thread-safe report buffer with count, size and age flush triggers.
pub struct ReportBatch {
    buffer: Mutex<ReportBuffer>,
    options: ReportOptions,
}

impl std::fmt::Debug for ReportBatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReportBatch")
            .field("options", &self.options)
            .field("pending", &self.len())
            .finish()
    }
}

impl ReportBatch {
    pub fn new(options: ReportOptions) -> Self {
        Self {
            buffer: Mutex::new(ReportBuffer::default()),
            options,
        }
    }

    pub fn options(&self) -> &ReportOptions {
        &self.options
    }

    fn lock(&self) -> MutexGuard<'_, ReportBuffer> {
        // A panic while holding the lock cannot leave the buffer half-swapped.
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends an entry, returning the swapped-out batch when the entry
    /// reached the count or size threshold.
    ///
    /// # Errors
    ///
    /// Returns `MixerError::ShutDown` once the buffer is closed. The entry's
    /// delivery callback, if any, is completed with the same error.
    pub fn add(&self, entry: ReportEntry) -> MixerResult<Option<FlushBatch>> {
        let size = entry.attributes.estimated_size();
        let mut buffer = self.lock();
        if buffer.closed {
            drop(buffer);
            entry.reject(MixerError::ShutDown);
            return Err(MixerError::ShutDown);
        }
        buffer.oldest.get_or_insert_with(Instant::now);
        buffer.bytes += size;
        buffer.entries.push(entry);

        Ok(if buffer.entries.len() >= self.options.max_batch_entries {
            buffer.swap_out(FlushReason::MaxEntries)
        } else if buffer.bytes >= self.options.max_buffer_bytes {
            buffer.swap_out(FlushReason::MaxBytes)
        } else {
            None
        })
    }

    /// Swaps the buffer out if its oldest entry is older than the maximum
    /// batch age at `now`.
    pub fn take_expired(&self, now: Instant) -> Option<FlushBatch> {
        let mut buffer = self.lock();
        let oldest = buffer.oldest?;
        if now.saturating_duration_since(oldest) >= self.options.max_batch_age {
            buffer.swap_out(FlushReason::MaxAge)
        } else {
            None
        }
    }

    /// Swaps the buffer out unconditionally.
    pub fn flush(&self) -> Option<FlushBatch> {
        self.lock().swap_out(FlushReason::Explicit)
    }

    /// Rejects further entries and swaps out what is buffered.
    ///
    /// Closing and the final swap happen under one lock, so every entry
    /// accepted by [`ReportBatch::add`] is either in the returned batch or
    /// in a batch swapped out earlier.
    pub fn close(&self) -> Option<FlushBatch> {
        let mut buffer = self.lock();
        buffer.closed = true;
        buffer.swap_out(FlushReason::Explicit)
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Number of buffered entries.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    /// Estimated bytes held by buffered entries.
    pub fn pending_bytes(&self) -> usize {
        self.lock().bytes
    }

    /// Age of the oldest buffered entry at `now`.
    pub fn oldest_age(&self, now: Instant) -> Option<Duration> {
        self.lock()
            .oldest
            .map(|oldest| now.saturating_duration_since(oldest))
    }
}

/// Registers report metrics descriptions.
pub fn register_report_metrics() {
    metrics::describe_counter!(
        "mixer_report_batches_total",
        "Total number of report batches sent"
    );
    metrics::describe_counter!(
        "mixer_report_entries_total",
        "Total number of report entries sent"
    );
    metrics::describe_counter!(
        "mixer_report_failures_total",
        "Total number of report batches that failed to send"
    );
}
