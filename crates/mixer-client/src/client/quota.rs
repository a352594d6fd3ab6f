//! Quota path: local allocation, prefetch and refill.

use std::sync::Arc;

use mixer_domain::{
    AllocOutcome, Attributes, DoneFunc, MixerError, MixerResult, QuotaCall, QuotaKey,
    QuotaRequest, QuotaResponse, TransportError,
};

use super::inflight::{InFlightGuard, QuotaWaiter, Slot};
use super::{lock, ClientInner};

impl ClientInner {
    pub(super) fn quota(self: &Arc<Self>, attributes: &Attributes, on_done: DoneFunc) {
        let call = match QuotaCall::from_attributes(attributes) {
            Ok(call) => call,
            Err(err) => {
                on_done(Err(err));
                return;
            }
        };

        match self.quota_cache.alloc(&call.key, call.amount) {
            AllocOutcome::Granted { refill } => {
                if refill && self.quota_in_flight.try_lead(call.key.clone()) {
                    tracing::debug!(quota = %call.key.name, "refilling quota below low-water mark");
                    self.spawn_quota_fetch(call.key, attributes.clone(), call.amount);
                }
                on_done(Ok(()));
            }
            AllocOutcome::NeedsFetch => {
                let waiter = QuotaWaiter {
                    amount: call.amount,
                    on_done,
                };
                match self.quota_in_flight.join(call.key.clone(), waiter) {
                    Slot::Leader => {
                        self.quota_cache.begin_refill(&call.key);
                        self.spawn_quota_fetch(call.key, attributes.clone(), call.amount);
                    }
                    Slot::Joined => {
                        tracing::trace!(quota = %call.key.name, "joined in-flight quota allocation");
                    }
                }
            }
        }
    }

    /// Requests `max(amount, prefetch)` units for a key this caller leads.
    fn spawn_quota_fetch(self: &Arc<Self>, key: QuotaKey, attributes: Attributes, amount: i64) {
        let (request_index, update) = lock(&self.quota_context).next_update(&attributes);
        let request = QuotaRequest {
            quota: key.name.clone(),
            fingerprint: key.fingerprint,
            attributes,
            update,
            request_index,
            amount: self.quota_cache.fetch_amount(amount),
            best_effort: self.quota_cache.options().best_effort,
            deadline: self.deadline(),
        };
        let guard = InFlightGuard::new(Arc::clone(&self.quota_in_flight), key.clone());
        metrics::counter!("mixer_quota_fetches_total").increment(1);

        let inner = Arc::clone(self);
        self.runtime.spawn(async move {
            let result = inner.transport.quota(request).await;
            inner.finish_quota(&key, guard, result);
        });
    }

    /// Applies the grant, then serves parked callers in arrival order from
    /// the new balance.
    fn finish_quota(
        &self,
        key: &QuotaKey,
        guard: InFlightGuard<QuotaKey, QuotaWaiter>,
        result: Result<QuotaResponse, TransportError>,
    ) {
        match result {
            Ok(response) => {
                let valid = response
                    .valid_duration
                    .unwrap_or(self.quota_cache.options().ttl);
                self.quota_cache
                    .apply_grant(key, response.granted_amount, valid);
                tracing::debug!(
                    quota = %key.name,
                    granted = response.granted_amount,
                    "quota allocation applied"
                );

                for waiter in guard.complete() {
                    let status = if self.quota_cache.consume(key, waiter.amount) {
                        Ok(())
                    } else {
                        Err(MixerError::QuotaDenied {
                            message: format!(
                                "quota '{}' exhausted: requested {}, granted {}",
                                key.name, waiter.amount, response.granted_amount
                            ),
                        })
                    };
                    (waiter.on_done)(status);
                }
            }
            Err(err) => {
                tracing::warn!(
                    quota = %key.name,
                    code = %err.code,
                    error = %err.message,
                    "quota transport call failed"
                );
                metrics::counter!("mixer_transport_failures_total", "operation" => "quota")
                    .increment(1);
                self.quota_cache.end_refill(key);
                let status: MixerResult<()> = Err(MixerError::quota_unknown(err));
                for waiter in guard.complete() {
                    (waiter.on_done)(status.clone());
                }
            }
        }
    }
}
