//! Cadflow-Core: Orchestration State Machines
//!
//! The hierarchy of cooperating machines that coordinates a parametric CAD
//! session:
//!
//! - **Build machine**: per-build lifecycle: load/persist the Build
//!   aggregate, spawn per-build children, debounce persistence writes
//! - **CAD machine**: the orchestrator: debounced file/parameter edits,
//!   generation-guarded compute results, schema capture, export
//! - **Kernel machine**: owns exactly one live worker; relays worker
//!   results and logs as typed events
//! - **Parameter machine**: per-parameter interaction state: units,
//!   slider/text/keyboard reconciliation, commit epsilon, range heuristics
//!
//! Collaborator contracts (graphics, capture, git, file explorer, chat
//! naming, virtual filesystem) live in [`collab`].

pub mod build_machine;
pub mod cad_machine;
pub mod collab;
mod error;
pub mod kernel_machine;
pub mod parameter_machine;
pub mod telemetry;
pub mod units;

pub use build_machine::{
    spawn_build_machine, BuildChildren, BuildCommand, BuildEvent, BuildMachineConfig,
    BuildMachineHandle, BuildSnapshot, BuildState, ChildSpawner, NullSpawner, StoringState,
    WorkerMaker, STORE_DEBOUNCE,
};
pub use cad_machine::{
    spawn_cad_machine, CadCommand, CadEvent, CadMachineConfig, CadMachineHandle, CadSnapshot,
    CadState, FILE_DEBOUNCE, PARAMETER_DEBOUNCE,
};
pub use collab::{
    spawn_capture_broker, CaptureCommand, CaptureJob, CaptureResult, ChatNamer, ExplorerCommand,
    FixedChatNamer, GitCommand, MemoryFs, SceneUpdate, VirtualFs, REGISTRATION_TIMEOUT,
};
pub use error::OrchestrationError;
pub use kernel_machine::{
    spawn_kernel_machine, KernelCommand, KernelEvent, KernelMachineHandle, KernelState,
    WorkerFactory,
};
pub use parameter_machine::{
    slider_max, slider_min, slider_step, ParameterConfig, ParameterMachine, SliderRange,
    COMMIT_EPSILON,
};
pub use telemetry::init_tracing;
pub use units::{parse_measurement, Unit};
