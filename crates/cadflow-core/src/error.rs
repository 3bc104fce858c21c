//! Error types for cadflow-core

use thiserror::Error;

use cadflow_kernel::KernelError;
use cadflow_state::{BuildError, StoreError};

/// Errors surfaced by the orchestration machines.
#[derive(Error, Debug)]
pub enum OrchestrationError {
    /// A capability failed to attach within its deadline
    #[error("Registration timed out after {timeout_ms} ms for request {request_id}")]
    RegistrationTimeout { request_id: String, timeout_ms: u64 },

    /// The capture collaborator dropped a forwarded request
    #[error("Capture request dropped: {request_id}")]
    CaptureAborted { request_id: String },

    /// A machine mailbox closed while a request was in flight
    #[error("Machine stopped: {0}")]
    MachineStopped(String),

    /// Persistence failure (read/write)
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Build aggregate mutation failure
    #[error(transparent)]
    Build(#[from] BuildError),

    /// Kernel worker failure
    #[error(transparent)]
    Kernel(#[from] KernelError),
}
