// Allow dead_code because each test file is compiled as a separate crate,
// so not all helper functions are used in every test file.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use mixer_client::{
    Attributes, CheckRequest, CheckResponse, MixerClient, MixerClientOptions, QuotaRequest,
    QuotaResponse, ReportRequest, ReportResponse, StatusCode, Transport, TransportError,
};

// ============================================================================
// In-Memory Policy Server
// ============================================================================

/// Authoritative server stand-in: denies listed sources, enforces quota
/// budgets and records delivered report batches.
pub struct InMemoryPolicyServer {
    latency: Duration,
    denied_sources: Mutex<HashSet<String>>,
    quota_budgets: Mutex<HashMap<String, i64>>,
    report_batches: Mutex<Vec<Vec<Attributes>>>,
    unavailable: AtomicBool,
    check_calls: AtomicUsize,
    report_calls: AtomicUsize,
    quota_calls: AtomicUsize,
}

impl InMemoryPolicyServer {
    pub fn new() -> Self {
        Self::with_latency(Duration::ZERO)
    }

    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency,
            denied_sources: Mutex::new(HashSet::new()),
            quota_budgets: Mutex::new(HashMap::new()),
            report_batches: Mutex::new(Vec::new()),
            unavailable: AtomicBool::new(false),
            check_calls: AtomicUsize::new(0),
            report_calls: AtomicUsize::new(0),
            quota_calls: AtomicUsize::new(0),
        }
    }

    pub fn deny_source(&self, source: &str) {
        self.denied_sources
            .lock()
            .unwrap()
            .insert(source.to_string());
    }

    pub fn set_quota_budget(&self, quota: &str, budget: i64) {
        self.quota_budgets
            .lock()
            .unwrap()
            .insert(quota.to_string(), budget);
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn check_calls(&self) -> usize {
        self.check_calls.load(Ordering::SeqCst)
    }

    pub fn report_calls(&self) -> usize {
        self.report_calls.load(Ordering::SeqCst)
    }

    pub fn quota_calls(&self) -> usize {
        self.quota_calls.load(Ordering::SeqCst)
    }

    pub fn report_batches(&self) -> Vec<Vec<Attributes>> {
        self.report_batches.lock().unwrap().clone()
    }

    pub fn reported_entries(&self) -> usize {
        self.report_batches.lock().unwrap().iter().map(Vec::len).sum()
    }

    async fn round_trip(&self) -> Result<(), TransportError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(TransportError::unavailable("policy server unreachable"));
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for InMemoryPolicyServer {
    async fn check(&self, request: CheckRequest) -> Result<CheckResponse, TransportError> {
        self.check_calls.fetch_add(1, Ordering::SeqCst);
        self.round_trip().await?;

        let source = request
            .attributes
            .get("source.name")
            .and_then(|value| value.as_str())
            .unwrap_or_default();
        if self.denied_sources.lock().unwrap().contains(source) {
            Ok(CheckResponse::denied(
                StatusCode::PermissionDenied,
                format!("source '{source}' is not allowed"),
            ))
        } else {
            Ok(CheckResponse::allowed())
        }
    }

    async fn report(&self, request: ReportRequest) -> Result<ReportResponse, TransportError> {
        self.report_calls.fetch_add(1, Ordering::SeqCst);
        self.round_trip().await?;
        self.report_batches.lock().unwrap().push(request.entries);
        Ok(ReportResponse)
    }

    async fn quota(&self, request: QuotaRequest) -> Result<QuotaResponse, TransportError> {
        self.quota_calls.fetch_add(1, Ordering::SeqCst);
        self.round_trip().await?;

        let mut budgets = self.quota_budgets.lock().unwrap();
        let remaining = budgets.entry(request.quota.clone()).or_insert(0);
        let granted = if request.best_effort {
            request.amount.min(*remaining)
        } else if *remaining >= request.amount {
            request.amount
        } else {
            0
        };
        *remaining -= granted;
        Ok(QuotaResponse::granted(granted))
    }
}

// ============================================================================
// Helpers
// ============================================================================

pub fn new_client(options: MixerClientOptions, server: &Arc<InMemoryPolicyServer>) -> MixerClient {
    let transport: Arc<dyn Transport> = Arc::clone(server) as Arc<dyn Transport>;
    MixerClient::new(options, transport).expect("valid client options")
}

pub fn request(source: &str, path: &str) -> Attributes {
    Attributes::new()
        .with("source.name", source)
        .with("destination.name", "reviews")
        .with("request.path", path)
        .with("request.method", "GET")
}

pub fn quota_request(source: &str, quota: &str, amount: i64) -> Attributes {
    request(source, "/api")
        .with("quota.name", quota)
        .with("quota.amount", amount)
}

/// Polls `condition` every 5ms for up to 2s.
pub async fn eventually<F: Fn() -> bool>(condition: F) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached within 2s");
}
