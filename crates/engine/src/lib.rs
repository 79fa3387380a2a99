//! Rekon engine: plan execution and drift reconciliation against an
//! injected external client.

#![forbid(unsafe_code)]

pub mod client;
pub mod drift;
pub mod executor;
pub mod fake;
pub mod report;
pub mod retry;

pub use client::{ClientError, LiveObject, ResourceClient};
pub use drift::{Reconciler, ReconcilerConfig, ReportHandle};
pub use executor::{Executor, ExecutorConfig};
pub use fake::FakeClient;
pub use report::{EntryReport, ExecutionReport, Outcome};
pub use retry::RetryConfig;

/// Engine-level failures: either the input could not be validated/ordered,
/// or the state store refused a read. Execution failures are per-entry and
/// live in the report, never here.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Validation(#[from] rekon_core::ValidationError),
    #[error(transparent)]
    Store(#[from] rekon_store::StoreError),
}
