//! Cadflow-Kernel: Worker Protocol and Isolation Boundary
//!
//! This crate defines the contract between the orchestration machines and
//! the isolated execution context that runs untrusted CAD source:
//!
//! - `CadWorker`: the async worker trait (sniff / extract / compute /
//!   export), one implementation per CAD DSL variant
//! - `spawn_worker` / `WorkerClient`: the isolation boundary, a dedicated
//!   task serving RPC requests, catching panics, streaming logs
//! - `GeometryCache`: bounded LRU of computed geometry sets per worker
//! - `KernelError` + `normalize_failure`: total failure normalization with
//!   stack-frame parsing
//! - `sniff` / `WorkerSelector`: extension and library-marker based worker
//!   selection, never executing source

mod cache;
mod error;
mod host;
mod protocol;
pub mod sniff;
pub mod testing;

pub use cache::{GeometryCache, MAX_STORED_GEOMETRIES};
pub use error::{
    normalize_failure, normalize_panic, parse_stack_frames, ErrorKind, FailurePayload,
    KernelError, StackFrame,
};
pub use host::{spawn_worker, WorkerClient};
pub use protocol::{
    schema_for_defaults, CadWorker, ExportedBlob, Geometry, GeometryFile, GeometryId, LogLevel,
    LogLine, LogSender, ParameterExtraction, ParameterMap, WorkerOptions, WorkerProfile,
    WorkerSelector,
};
pub use sniff::ModuleFormat;
