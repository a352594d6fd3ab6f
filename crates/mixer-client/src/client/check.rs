//! Check path: cache lookup, in-flight dedup and revalidation.

use std::sync::Arc;

use mixer_domain::{
    Attributes, CacheLookup, CheckRequest, CheckResponse, DoneFunc, Fingerprint, MixerResult,
    TransportError,
};

use super::inflight::{InFlightGuard, Slot};
use super::{lock, ClientInner};

impl ClientInner {
    pub(super) fn check(self: &Arc<Self>, attributes: &Attributes, on_done: DoneFunc) {
        let fingerprint = attributes.fingerprint();

        match self.check_cache.get(&fingerprint) {
            CacheLookup::Hit(decision) => on_done(decision.to_status()),
            CacheLookup::StaleNeedsRevalidate(decision) => {
                if self.check_cache.begin_revalidation(&fingerprint) {
                    if self.check_in_flight.try_lead(fingerprint) {
                        tracing::debug!(%fingerprint, "revalidating cached check decision");
                        self.spawn_check(fingerprint, attributes.clone());
                    } else {
                        // The call already in flight refreshes the entry.
                        self.check_cache.end_revalidation(&fingerprint);
                    }
                }
                on_done(decision.to_status());
            }
            CacheLookup::Miss => match self.check_in_flight.join(fingerprint, on_done) {
                Slot::Leader => self.spawn_check(fingerprint, attributes.clone()),
                Slot::Joined => {
                    tracing::trace!(%fingerprint, "joined in-flight check");
                }
            },
        }
    }

    /// Sends a Check for a key this caller leads.
    fn spawn_check(self: &Arc<Self>, fingerprint: Fingerprint, attributes: Attributes) {
        let (request_index, update) = lock(&self.check_context).next_update(&attributes);
        let request = CheckRequest {
            attributes,
            fingerprint,
            update,
            request_index,
            deadline: self.deadline(),
        };
        let guard = InFlightGuard::new(Arc::clone(&self.check_in_flight), fingerprint);
        metrics::counter!("mixer_check_requests_total").increment(1);

        let inner = Arc::clone(self);
        self.runtime.spawn(async move {
            let result = inner.transport.check(request).await;
            inner.finish_check(fingerprint, guard, result);
        });
    }

    /// Caches the response before releasing waiters so callers arriving
    /// after the release hit the cache.
    fn finish_check(
        &self,
        fingerprint: Fingerprint,
        guard: InFlightGuard<Fingerprint, DoneFunc>,
        result: Result<CheckResponse, TransportError>,
    ) {
        let status: MixerResult<()> = match result {
            Ok(response) => {
                let options = self.check_cache.options();
                let ttl = response.valid_duration.unwrap_or(options.ttl);
                let limit = response.valid_use_count.unwrap_or(options.amortization_limit);
                let status = response.decision.to_status();
                self.check_cache
                    .put_with_limit(fingerprint, response.decision, ttl, limit);
                status
            }
            Err(err) => {
                tracing::warn!(
                    %fingerprint,
                    code = %err.code,
                    error = %err.message,
                    "check transport call failed"
                );
                metrics::counter!("mixer_transport_failures_total", "operation" => "check")
                    .increment(1);
                // A failed revalidation keeps serving the old decision until
                // it expires; clearing the flag lets a later lookup retry.
                self.check_cache.end_revalidation(&fingerprint);
                Err(err.into())
            }
        };

        for waiter in guard.complete() {
            waiter(status.clone());
        }
    }
}
