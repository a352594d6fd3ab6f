//! Transport contract between the client and the policy server.
//!
//! The transport physically sends a request and resolves exactly once with
//! either the server's response or a [`TransportError`]. Retries, backoff,
//! timeouts and wire encoding belong to the implementation, not to the
//! caches driving it.

use std::time::Duration;

use async_trait::async_trait;

use crate::attributes::{AttributeUpdate, Attributes, Fingerprint};
use crate::error::{MixerError, MixerResult, StatusCode, TransportError};

/// Check request sent on a cache miss or revalidation.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckRequest {
    /// Full attribute set of the call.
    pub attributes: Attributes,
    /// Fingerprint computed once for the call.
    pub fingerprint: Fingerprint,
    /// Delta against the previous Check request on this client.
    pub update: AttributeUpdate,
    /// Position of this request on the Check channel.
    pub request_index: u64,
    /// Optional deadline hint for the transport.
    pub deadline: Option<Duration>,
}

/// The server's decision for a Check request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckDecision {
    Allowed,
    Denied { code: StatusCode, message: String },
}

impl CheckDecision {
    /// Creates a denial with the given status.
    pub fn denied(code: StatusCode, message: impl Into<String>) -> Self {
        CheckDecision::Denied {
            code,
            message: message.into(),
        }
    }

    pub fn is_allowed(&self) -> bool {
        matches!(self, CheckDecision::Allowed)
    }

    /// Converts the decision into the status delivered to callers.
    pub fn to_status(&self) -> MixerResult<()> {
        match self {
            CheckDecision::Allowed => Ok(()),
            CheckDecision::Denied { code, message } => Err(MixerError::Denied {
                code: *code,
                message: message.clone(),
            }),
        }
    }
}

/// Response to a Check request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckResponse {
    pub decision: CheckDecision,
    /// How long the decision may be served from cache; the configured TTL
    /// applies when absent.
    pub valid_duration: Option<Duration>,
    /// How many local approvals the decision may back; the configured
    /// amortization limit applies when absent.
    pub valid_use_count: Option<u32>,
}

impl CheckResponse {
    pub fn allowed() -> Self {
        Self {
            decision: CheckDecision::Allowed,
            valid_duration: None,
            valid_use_count: None,
        }
    }

    pub fn denied(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            decision: CheckDecision::denied(code, message),
            valid_duration: None,
            valid_use_count: None,
        }
    }

    pub fn with_valid_duration(mut self, duration: Duration) -> Self {
        self.valid_duration = Some(duration);
        self
    }

    pub fn with_valid_use_count(mut self, count: u32) -> Self {
        self.valid_use_count = Some(count);
        self
    }
}

/// A batch of telemetry events, in insertion order.
#[derive(Debug, Clone, PartialEq)]
pub struct ReportRequest {
    pub entries: Vec<Attributes>,
    pub deadline: Option<Duration>,
}

/// Acknowledgement of a report batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReportResponse;

/// Quota allocation request.
#[derive(Debug, Clone, PartialEq)]
pub struct QuotaRequest {
    /// Name of the quota being allocated.
    pub quota: String,
    /// Fingerprint identifying the quota key.
    pub fingerprint: Fingerprint,
    /// Full attribute set of the call that triggered the allocation.
    pub attributes: Attributes,
    /// Delta against the previous Quota request on this client.
    pub update: AttributeUpdate,
    pub request_index: u64,
    /// Amount requested, including prefetch.
    pub amount: i64,
    /// Whether the server may grant less than `amount`.
    pub best_effort: bool,
    pub deadline: Option<Duration>,
}

/// Response to a quota allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaResponse {
    /// Amount granted; zero means the server refused.
    pub granted_amount: i64,
    /// How long the grant stays usable; the configured TTL applies when absent.
    pub valid_duration: Option<Duration>,
}

impl QuotaResponse {
    pub fn granted(amount: i64) -> Self {
        Self {
            granted_amount: amount,
            valid_duration: None,
        }
    }

    pub fn with_valid_duration(mut self, duration: Duration) -> Self {
        self.valid_duration = Some(duration);
        self
    }
}

/// Asynchronous channel to the policy server.
///
/// Implementations must tolerate concurrent calls from all three
/// subsystems. Each returned future resolves exactly once.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends a Check request.
    async fn check(&self, request: CheckRequest) -> Result<CheckResponse, TransportError>;

    /// Sends a batch of reports.
    async fn report(&self, request: ReportRequest) -> Result<ReportResponse, TransportError>;

    /// Sends a quota allocation request.
    async fn quota(&self, request: QuotaRequest) -> Result<QuotaResponse, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allowed_decision_maps_to_ok() {
        assert_eq!(CheckDecision::Allowed.to_status(), Ok(()));
    }

    #[test]
    fn test_denied_decision_keeps_server_status() {
        let decision = CheckDecision::denied(StatusCode::PermissionDenied, "blocked by policy");

        let status = decision.to_status();

        assert!(!decision.is_allowed());
        assert_eq!(
            status,
            Err(MixerError::Denied {
                code: StatusCode::PermissionDenied,
                message: "blocked by policy".to_string(),
            })
        );
    }

    #[test]
    fn test_response_builders() {
        let response = CheckResponse::allowed()
            .with_valid_duration(Duration::from_secs(1))
            .with_valid_use_count(5);

        assert_eq!(response.valid_duration, Some(Duration::from_secs(1)));
        assert_eq!(response.valid_use_count, Some(5));
    }
}
