//! Report path: buffering and batch delivery.

use std::sync::Arc;

use mixer_domain::{Attributes, DoneFunc, FlushBatch, MixerResult, ReportEntry, ReportRequest};

use super::ClientInner;

impl ClientInner {
    /// Buffers an entry. Fails with `ShutDown` once the buffer was closed by
    /// shutdown, in which case `on_delivered` has already been completed.
    pub(super) fn enqueue_report(
        self: &Arc<Self>,
        attributes: Attributes,
        on_delivered: Option<DoneFunc>,
    ) -> MixerResult<()> {
        let entry = match on_delivered {
            Some(callback) => ReportEntry::with_delivery(attributes, callback),
            None => ReportEntry::new(attributes),
        };
        if let Some(batch) = self.report_batch.add(entry)? {
            self.send_report(batch);
        }
        Ok(())
    }

    /// Delivers a batch on the runtime without waiting for it.
    pub(super) fn send_report(self: &Arc<Self>, batch: FlushBatch) {
        let inner = Arc::clone(self);
        self.runtime.spawn(async move {
            let _ = inner.deliver_report(batch).await;
        });
    }

    /// Sends one batch and resolves its delivery callbacks.
    ///
    /// Entries are not requeued on failure.
    pub(super) async fn deliver_report(&self, batch: FlushBatch) -> MixerResult<()> {
        let reason = batch.reason;
        let (entries, deliveries) = batch.into_parts();
        let count = entries.len();
        let request = ReportRequest {
            entries,
            deadline: self.deadline(),
        };

        let status: MixerResult<()> = match self.transport.report(request).await {
            Ok(_) => {
                metrics::counter!("mixer_report_batches_total").increment(1);
                metrics::counter!("mixer_report_entries_total").increment(count as u64);
                tracing::debug!(entries = count, reason = reason.as_str(), "report batch delivered");
                Ok(())
            }
            Err(err) => {
                metrics::counter!("mixer_report_failures_total").increment(1);
                metrics::counter!("mixer_transport_failures_total", "operation" => "report")
                    .increment(1);
                tracing::warn!(
                    entries = count,
                    reason = reason.as_str(),
                    code = %err.code,
                    error = %err.message,
                    "report batch dropped after transport failure"
                );
                Err(err.into())
            }
        };

        deliveries.resolve(status.clone());
        status
    }
}
