//! mixer-client: Caching, batching client for a policy server
//!
//! This crate drives the domain caches over a pluggable transport:
//! - `MixerClient` facade for Check, Report and Quota calls
//! - In-flight deduplication of concurrent network calls
//! - Background report flushing
//! - Configuration loading (YAML + environment)
//! - Structured logging setup
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │                mixer-client                  │
//! ├─────────────────────────────────────────────┤
//! │  client/        - MixerClient facade        │
//! │    check.rs     - Cache + dedup + refresh   │
//! │    report.rs    - Batch delivery            │
//! │    quota.rs     - Allocation + prefetch     │
//! │    inflight.rs  - Call deduplication        │
//! │  config.rs      - Configuration management  │
//! │  observability/ - Logging & metric setup    │
//! └─────────────────────────────────────────────┘
//! ```

pub mod client;
pub mod config;
pub mod observability;

// Re-exports for convenience
pub use client::MixerClient;
pub use config::{ConfigLoadError, MixerConfig};
pub use mixer_domain::{
    AttributeValue, Attributes, CheckDecision, CheckOptions, CheckRequest, CheckResponse,
    MixerClientOptions, MixerError, MixerResult, QuotaOptions, QuotaRequest, QuotaResponse,
    ReportOptions, ReportRequest, ReportResponse, StatusCode, Transport, TransportError,
};
