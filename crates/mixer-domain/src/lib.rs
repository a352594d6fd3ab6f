//! mixer-domain: Attribute-keyed decision and allocation layer
//!
//! This crate contains the local state the mixer client keeps between
//! network round trips:
//! - Typed attributes and their order-independent fingerprint
//! - Check result caching with count-based revalidation
//! - Report batching with count, size and age flush triggers
//! - Local quota allocation with prefetch and low-water refill
//! - The transport contract the client drives on cache misses
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │                mixer-domain                  │
//! ├─────────────────────────────────────────────┤
//! │  attributes/ - Attribute sets & fingerprint │
//! │  cache/      - Check result caching         │
//! │  report/     - Report batching buffer       │
//! │  quota/      - Quota allocation cache       │
//! │  transport   - Transport trait & messages   │
//! │  options     - Subsystem options            │
//! └─────────────────────────────────────────────┘
//! ```

pub mod attributes;
pub mod cache;
pub mod error;
pub mod options;
pub mod quota;
pub mod report;
pub mod transport;

// Re-export commonly used types at the crate root
pub use attributes::{AttributeContext, AttributeUpdate, AttributeValue, Attributes, Fingerprint};
pub use cache::{CacheLookup, CheckCache};
pub use error::{DoneFunc, MixerError, MixerResult, StatusCode, TransportError};
pub use options::{CheckOptions, MixerClientOptions, QuotaOptions, ReportOptions};
pub use quota::{AllocOutcome, QuotaCache, QuotaCall, QuotaKey};
pub use report::{FlushBatch, FlushReason, ReportBatch, ReportEntry};
pub use transport::{
    CheckDecision, CheckRequest, CheckResponse, QuotaRequest, QuotaResponse, ReportRequest,
    ReportResponse, Transport,
};
