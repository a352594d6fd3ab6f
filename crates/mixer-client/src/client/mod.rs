//! The `MixerClient` facade.
//!
//! Check, Report and Quota calls return immediately and complete their
//! callback exactly once. Calls the local caches can answer complete inline
//! on the caller's thread; everything else completes on a Tokio worker
//! once the transport resolves.
//!
//! # Concurrency
//!
//! - Check cache: moka (internally synchronized)
//! - Quota cache and in-flight registries: DashMap shard locks
//! - Report buffer and attribute contexts: short `std::sync::Mutex` sections
//!
//! No lock is held across a transport call.

mod check;
mod inflight;
mod quota;
mod report;


use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use mixer_domain::{
    AttributeContext, Attributes, CheckCache, DoneFunc, Fingerprint, MixerClientOptions,
    MixerError, MixerResult, QuotaCache, QuotaKey, ReportBatch, Transport, TransportError,
};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use inflight::{InFlight, QuotaWaiter};

const MIN_FLUSH_WAIT: Duration = Duration::from_millis(1);

/// Client for Check, Report and Quota calls against a policy server.
///
/// Must be created inside a Tokio runtime; background work (transport
/// calls, the report flush timer) runs on that runtime.
///
/// # Example
///
/// ```ignore
/// let client = MixerClient::new(MixerClientOptions::default(), transport)?;
///
/// client.check(&attributes, |status| {
///     if status.is_ok() { /* admit */ }
/// });
/// client.report(attributes, |_| {});
/// client.shutdown().await?;
/// ```
pub struct MixerClient {
    inner: Arc<ClientInner>,
    flush_task: Mutex<Option<JoinHandle<()>>>,
}

pub(crate) struct ClientInner {
    options: MixerClientOptions,
    transport: Arc<dyn Transport>,
    runtime: Handle,
    check_cache: CheckCache,
    check_in_flight: Arc<InFlight<Fingerprint, DoneFunc>>,
    check_context: Mutex<AttributeContext>,
    report_batch: ReportBatch,
    quota_cache: QuotaCache,
    quota_in_flight: Arc<InFlight<QuotaKey, QuotaWaiter>>,
    quota_context: Mutex<AttributeContext>,
    shut_down: AtomicBool,
}

impl MixerClient {
    /// Creates a client over `transport`.
    ///
    /// # Errors
    ///
    /// Returns `MixerError::Configuration` for invalid options or when no
    /// Tokio runtime is available.
    pub fn new(options: MixerClientOptions, transport: Arc<dyn Transport>) -> MixerResult<Self> {
        options.validate()?;
        let runtime = Handle::try_current().map_err(|err| MixerError::Configuration {
            message: format!("mixer client requires a Tokio runtime: {err}"),
        })?;

        let inner = Arc::new(ClientInner {
            check_cache: CheckCache::new(options.check_options.clone()),
            check_in_flight: Arc::new(InFlight::new()),
            check_context: Mutex::new(AttributeContext::new()),
            report_batch: ReportBatch::new(options.report_options.clone()),
            quota_cache: QuotaCache::new(options.quota_options.clone()),
            quota_in_flight: Arc::new(InFlight::new()),
            quota_context: Mutex::new(AttributeContext::new()),
            shut_down: AtomicBool::new(false),
            options,
            transport,
            runtime,
        });
        let flush_task = spawn_flush_task(&inner);

        tracing::debug!(
            check_cache_capacity = inner.options.check_options.cache_capacity,
            max_batch_entries = inner.options.report_options.max_batch_entries,
            quota_prefetch = inner.options.quota_options.prefetch_amount,
            "mixer client started"
        );

        Ok(Self {
            inner,
            flush_task: Mutex::new(Some(flush_task)),
        })
    }

    pub fn options(&self) -> &MixerClientOptions {
        &self.inner.options
    }

    /// Checks whether a request described by `attributes` is allowed.
    ///
    /// `on_done` receives `Ok(())` when allowed, `Denied` for an
    /// authoritative refusal and `TransportFailure` when the server could
    /// not be consulted.
    pub fn check<F>(&self, attributes: &Attributes, on_done: F)
    where
        F: FnOnce(MixerResult<()>) + Send + 'static,
    {
        if self.inner.is_shut_down() {
            on_done(Err(MixerError::ShutDown));
            return;
        }
        self.inner.check(attributes, Box::new(on_done));
    }

    /// Buffers a telemetry event.
    ///
    /// `on_done` fires once the event is accepted into the buffer. Delivery
    /// failures are logged and counted but not reported per event; use
    /// [`MixerClient::report_with_delivery`] for that.
    pub fn report<F>(&self, attributes: Attributes, on_done: F)
    where
        F: FnOnce(MixerResult<()>) + Send + 'static,
    {
        on_done(self.inner.enqueue_report(attributes, None));
    }

    /// Buffers a telemetry event and completes `on_delivered` with the
    /// outcome of the batch that carried it.
    pub fn report_with_delivery<F>(&self, attributes: Attributes, on_delivered: F)
    where
        F: FnOnce(MixerResult<()>) + Send + 'static,
    {
        // A rejected entry has already completed `on_delivered`.
        let _ = self
            .inner
            .enqueue_report(attributes, Some(Box::new(on_delivered)));
    }

    /// Allocates quota named by `quota.name`, `quota.amount` units (default 1).
    ///
    /// `on_done` receives `QuotaDenied` when the server refused and
    /// `QuotaUnknown` when the outcome could not be determined.
    pub fn quota<F>(&self, attributes: &Attributes, on_done: F)
    where
        F: FnOnce(MixerResult<()>) + Send + 'static,
    {
        if self.inner.is_shut_down() {
            on_done(Err(MixerError::ShutDown));
            return;
        }
        self.inner.quota(attributes, Box::new(on_done));
    }

    pub async fn check_async(&self, attributes: &Attributes) -> MixerResult<()> {
        let (tx, rx) = oneshot::channel();
        self.check(attributes, move |status| {
            let _ = tx.send(status);
        });
        await_status(rx).await
    }

    pub async fn report_async(&self, attributes: Attributes) -> MixerResult<()> {
        let (tx, rx) = oneshot::channel();
        self.report(attributes, move |status| {
            let _ = tx.send(status);
        });
        await_status(rx).await
    }

    /// Resolves once the batch carrying the event was delivered or failed.
    pub async fn report_delivered_async(&self, attributes: Attributes) -> MixerResult<()> {
        let (tx, rx) = oneshot::channel();
        self.report_with_delivery(attributes, move |status| {
            let _ = tx.send(status);
        });
        await_status(rx).await
    }

    pub async fn quota_async(&self, attributes: &Attributes) -> MixerResult<()> {
        let (tx, rx) = oneshot::channel();
        self.quota(attributes, move |status| {
            let _ = tx.send(status);
        });
        await_status(rx).await
    }

    /// Sends buffered reports now without waiting for the outcome.
    pub fn flush(&self) {
        if let Some(batch) = self.inner.report_batch.flush() {
            self.inner.send_report(batch);
        }
    }

    /// Stops accepting calls, stops the flush timer and delivers the
    /// remaining report buffer.
    ///
    /// Calls made afterwards complete with `ShutDown`. Outstanding Check and
    /// Quota calls still complete normally. Returns the outcome of the final
    /// report batch; repeated calls return `Ok(())`.
    pub async fn shutdown(&self) -> MixerResult<()> {
        if self.inner.shut_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.stop_flush_task();

        let pending = self.inner.report_batch.len();
        tracing::info!(pending_reports = pending, "mixer client shutting down");
        match self.inner.report_batch.close() {
            Some(batch) => self.inner.deliver_report(batch).await,
            None => Ok(()),
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.is_shut_down()
    }

    /// Number of report entries waiting in the buffer.
    pub fn pending_reports(&self) -> usize {
        self.inner.report_batch.len()
    }

    /// Number of Check calls currently on the network.
    pub fn in_flight_checks(&self) -> usize {
        self.inner.check_in_flight.len()
    }

    /// Number of quota allocations currently on the network.
    pub fn in_flight_quotas(&self) -> usize {
        self.inner.quota_in_flight.len()
    }

    fn stop_flush_task(&self) {
        if let Some(task) = lock(&self.flush_task).take() {
            task.abort();
        }
    }
}

impl Drop for MixerClient {
    fn drop(&mut self) {
        self.stop_flush_task();
        self.inner.shut_down.store(true, Ordering::Release);
        if let Some(batch) = self.inner.report_batch.close() {
            tracing::debug!(entries = batch.len(), "flushing reports on drop");
            self.inner.send_report(batch);
        }
    }
}

impl ClientInner {
    fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    fn deadline(&self) -> Option<Duration> {
        self.options.deadline_hint
    }
}

/// Sends the report buffer once its oldest entry reaches the maximum batch
/// age. Each wake-up sleeps until the current oldest entry is due, so a batch
/// leaves at most one scheduling delay after `max_batch_age`. Holds only a
/// weak reference between wake-ups so the client can drop.
fn spawn_flush_task(inner: &Arc<ClientInner>) -> JoinHandle<()> {
    let weak: Weak<ClientInner> = Arc::downgrade(inner);

    inner.runtime.spawn(async move {
        loop {
            let wait = {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let now = Instant::now();
                if let Some(batch) = inner.report_batch.take_expired(now) {
                    inner.send_report(batch);
                }
                let max_age = inner.options.report_options.max_batch_age;
                inner
                    .report_batch
                    .oldest_age(now)
                    .map_or(max_age, |age| max_age.saturating_sub(age))
                    .max(MIN_FLUSH_WAIT)
            };
            tokio::time::sleep(wait).await;
        }
    })
}

async fn await_status(rx: oneshot::Receiver<MixerResult<()>>) -> MixerResult<()> {
    rx.await
        .unwrap_or_else(|_| Err(TransportError::cancelled("completion dropped").into()))
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
