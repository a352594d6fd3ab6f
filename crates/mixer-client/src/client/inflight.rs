//! In-flight registry deduplicating concurrent network calls.
//!
//! At most one transport call per key is outstanding. The first caller to
//! register a key becomes the leader and starts the call; later callers
//! append their waiter to the key's list and are released, in arrival order,
//! when the leader completes.

use std::hash::Hash;
use std::sync::{Arc, Mutex, PoisonError};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use mixer_domain::{DoneFunc, MixerError, TransportError};

/// A parked caller that can be released without a result.
pub(crate) trait PendingCall {
    /// Completes the caller after its leader went away.
    fn abandon(self);
}

impl PendingCall for DoneFunc {
    fn abandon(self) {
        self(Err(TransportError::cancelled("in-flight call abandoned").into()));
    }
}

/// Quota caller waiting on an allocation.
pub(crate) struct QuotaWaiter {
    pub(crate) amount: i64,
    pub(crate) on_done: DoneFunc,
}

impl PendingCall for QuotaWaiter {
    fn abandon(self) {
        (self.on_done)(Err(MixerError::quota_unknown(TransportError::cancelled(
            "in-flight quota allocation abandoned",
        ))));
    }
}

/// Result of registering with the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Slot {
    /// No call was outstanding; the caller must start one.
    Leader,
    /// The waiter was parked behind an outstanding call.
    Joined,
}

pub(crate) struct InFlight<K, W>
where
    K: Hash + Eq + Clone,
{
    // Callbacks are Send but not Sync. The mutex is only reached through
    // `&mut` under the shard lock and never contended.
    calls: DashMap<K, Mutex<Vec<W>>>,
}

impl<K, W> InFlight<K, W>
where
    K: Hash + Eq + Clone,
{
    pub(crate) fn new() -> Self {
        Self {
            calls: DashMap::new(),
        }
    }

    /// Atomically parks `waiter` on the key, registering the key first if no
    /// call is outstanding.
    pub(crate) fn join(&self, key: K, waiter: W) -> Slot {
        match self.calls.entry(key) {
            Entry::Occupied(mut entry) => {
                entry
                    .get_mut()
                    .get_mut()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(waiter);
                Slot::Joined
            }
            Entry::Vacant(entry) => {
                entry.insert(Mutex::new(vec![waiter]));
                Slot::Leader
            }
        }
    }

    /// Registers a call without a waiter of its own (background refresh).
    ///
    /// Returns `false` if a call for the key is already outstanding.
    pub(crate) fn try_lead(&self, key: K) -> bool {
        match self.calls.entry(key) {
            Entry::Occupied(_) => false,
            Entry::Vacant(entry) => {
                entry.insert(Mutex::new(Vec::new()));
                true
            }
        }
    }

    /// Unregisters the key and hands back its waiters in arrival order.
    pub(crate) fn complete(&self, key: &K) -> Vec<W> {
        self.calls
            .remove(key)
            .map(|(_, waiters)| waiters.into_inner().unwrap_or_else(PoisonError::into_inner))
            .unwrap_or_default()
    }

    /// Number of outstanding calls.
    pub(crate) fn len(&self) -> usize {
        self.calls.len()
    }
}

/// Leadership of one outstanding call.
///
/// Dropping the guard without [`InFlightGuard::complete`] (the leader task
/// panicked or was cancelled) unregisters the key and abandons its waiters,
/// so every parked callback still fires once.
pub(crate) struct InFlightGuard<K, W>
where
    K: Hash + Eq + Clone,
    W: PendingCall,
{
    registry: Arc<InFlight<K, W>>,
    key: Option<K>,
}

impl<K, W> InFlightGuard<K, W>
where
    K: Hash + Eq + Clone,
    W: PendingCall,
{
    pub(crate) fn new(registry: Arc<InFlight<K, W>>, key: K) -> Self {
        Self {
            registry,
            key: Some(key),
        }
    }

    /// Completes the call normally, returning the waiters to release.
    pub(crate) fn complete(mut self) -> Vec<W> {
        match self.key.take() {
            Some(key) => self.registry.complete(&key),
            None => Vec::new(),
        }
    }
}

impl<K, W> Drop for InFlightGuard<K, W>
where
    K: Hash + Eq + Clone,
    W: PendingCall,
{
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            let waiters = self.registry.complete(&key);
            if !waiters.is_empty() {
                tracing::debug!(waiters = waiters.len(), "releasing waiters of abandoned call");
            }
            for waiter in waiters {
                waiter.abandon();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mixer_domain::{MixerResult, StatusCode};

    fn recording(log: &Arc<Mutex<Vec<(usize, MixerResult<()>)>>>, id: usize) -> DoneFunc {
        let log = Arc::clone(log);
        Box::new(move |status| log.lock().unwrap().push((id, status)))
    }

    #[test]
    fn test_first_caller_leads_and_others_join() {
        let registry: InFlight<u64, DoneFunc> = InFlight::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        assert_eq!(registry.join(1, recording(&log, 0)), Slot::Leader);
        assert_eq!(registry.join(1, recording(&log, 1)), Slot::Joined);
        assert_eq!(registry.join(2, recording(&log, 2)), Slot::Leader);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_complete_returns_waiters_in_arrival_order() {
        // Arrange
        let registry: InFlight<u64, DoneFunc> = InFlight::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        for id in 0..5 {
            registry.join(7, recording(&log, id));
        }

        // Act
        for waiter in registry.complete(&7) {
            waiter(Ok(()));
        }

        // Assert
        let ids: Vec<usize> = log.lock().unwrap().iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![0, 1, 2, 3, 4]);
        assert_eq!(registry.len(), 0);
        assert!(registry.complete(&7).is_empty());
    }

    #[test]
    fn test_try_lead_registers_without_waiter() {
        let registry: InFlight<u64, DoneFunc> = InFlight::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        assert!(registry.try_lead(3));
        assert!(!registry.try_lead(3));
        assert_eq!(registry.join(3, recording(&log, 0)), Slot::Joined);
        assert_eq!(registry.complete(&3).len(), 1);
    }

    #[test]
    fn test_dropped_guard_abandons_waiters_with_cancelled() {
        // Arrange
        let registry: Arc<InFlight<u64, DoneFunc>> = Arc::new(InFlight::new());
        let log = Arc::new(Mutex::new(Vec::new()));
        registry.join(9, recording(&log, 0));
        registry.join(9, recording(&log, 1));
        let guard = InFlightGuard::new(Arc::clone(&registry), 9);

        // Act
        drop(guard);

        // Assert
        let log = log.lock().unwrap();
        assert_eq!(log.len(), 2);
        for (_, status) in log.iter() {
            assert!(matches!(
                status,
                Err(MixerError::TransportFailure {
                    code: StatusCode::Cancelled,
                    ..
                })
            ));
        }
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn test_completed_guard_does_not_abandon() {
        let registry: Arc<InFlight<u64, DoneFunc>> = Arc::new(InFlight::new());
        let log = Arc::new(Mutex::new(Vec::new()));
        registry.join(9, recording(&log, 0));
        let guard = InFlightGuard::new(Arc::clone(&registry), 9);

        let waiters = guard.complete();

        assert_eq!(waiters.len(), 1);
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn test_abandoned_quota_waiter_reports_unknown() {
        let registry: Arc<InFlight<&'static str, QuotaWaiter>> = Arc::new(InFlight::new());
        let log = Arc::new(Mutex::new(Vec::new()));
        registry.join(
            "requestcount",
            QuotaWaiter {
                amount: 1,
                on_done: recording(&log, 0),
            },
        );

        drop(InFlightGuard::new(Arc::clone(&registry), "requestcount"));

        let log = log.lock().unwrap();
        assert!(matches!(
            log[0].1,
            Err(MixerError::QuotaUnknown {
                code: StatusCode::Cancelled,
                ..
            })
        ));
    }
}
