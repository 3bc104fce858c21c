//! CAD machine: the orchestrator
//!
//! Owns the current source file and parameter set, coalesces rapid edits
//! through per-category debounce timers, drives the kernel machine, and
//! forwards results to the graphics collaborator. Late results for a
//! superseded request are dropped by a generation guard: every new
//! buffering/initializing entry bumps the generation, and completions
//! tagged with a stale generation are ignored.
//!
//! States: Booting → Initializing → Ready ⇄ {BufferingFile,
//! BufferingParameters} → Rendering → Ready, with Error reachable from
//! Initializing/Rendering on kernel failure and left again on any new
//! model or edit.

use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};

use cadflow_kernel::{
    ExportedBlob, Geometry, GeometryFile, GeometryId, KernelError, LogLine, ParameterMap,
    WorkerOptions,
};

use crate::collab::SceneUpdate;
use crate::kernel_machine::{
    spawn_kernel_machine, KernelCommand, KernelEvent, KernelMachineHandle, WorkerFactory,
};
use crate::units::Unit;

/// Debounce window for source/content edits.
pub const FILE_DEBOUNCE: Duration = Duration::from_millis(500);

/// Debounce window for parameter edits.
pub const PARAMETER_DEBOUNCE: Duration = Duration::from_millis(50);

/// Observable state of the CAD machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CadState {
    Booting,
    Initializing,
    Ready,
    BufferingFile,
    BufferingParameters,
    Rendering,
    Error,
}

/// Commands from the build machine / UI.
#[derive(Debug)]
pub enum CadCommand {
    /// Load a model: extract its parameter declaration, then compute.
    InitializeModel {
        file: GeometryFile,
        parameters: Option<ParameterMap>,
    },
    /// Source edit; debounced on the file window.
    UpdateFile { file: GeometryFile },
    /// Parameter edit; debounced on the parameter window.
    SetParameters { parameters: ParameterMap },
    /// Export the current geometry.
    ExportGeometry { format: String },
    /// Read-only context snapshot.
    GetSnapshot {
        reply: oneshot::Sender<CadSnapshot>,
    },
}

/// Events emitted to the parent.
#[derive(Debug)]
pub enum CadEvent {
    /// Extraction succeeded during model initialization
    ModelInitialized {
        defaults: ParameterMap,
        schema: serde_json::Value,
    },
    /// A compute finished and geometry went to the graphics collaborator
    GeometryReady { count: usize },
    /// Kernel failure (init, extract, or compute)
    KernelFailed(KernelError),
    GeometryExported(ExportedBlob),
    ExportFailed(KernelError),
    /// Worker log line, relayed unbuffered
    KernelLog(LogLine),
}

/// Read-only view of the machine context.
#[derive(Debug, Clone)]
pub struct CadSnapshot {
    pub state: CadState,
    pub current_file: Option<GeometryFile>,
    pub parameters: ParameterMap,
    pub default_parameters: ParameterMap,
    pub parameter_schema: serde_json::Value,
    pub geometry_count: usize,
    pub exported_blob: Option<ExportedBlob>,
    pub kernel_error: Option<KernelError>,
}

/// Configuration for one CAD machine instance.
pub struct CadMachineConfig {
    /// Cache key for this machine's geometry within the worker
    pub geometry_id: GeometryId,
    /// Units forwarded with every scene update
    pub units: Unit,
    pub file_debounce: Duration,
    pub parameter_debounce: Duration,
    pub worker_options: WorkerOptions,
}

impl CadMachineConfig {
    pub fn new(geometry_id: GeometryId) -> Self {
        Self {
            geometry_id,
            units: Unit::Millimeters,
            file_debounce: FILE_DEBOUNCE,
            parameter_debounce: PARAMETER_DEBOUNCE,
            worker_options: WorkerOptions::default(),
        }
    }

    pub fn with_debounce(mut self, file: Duration, parameter: Duration) -> Self {
        self.file_debounce = file;
        self.parameter_debounce = parameter;
        self
    }
}

/// Handle to a spawned CAD machine.
pub struct CadMachineHandle {
    commands: mpsc::Sender<CadCommand>,
    state: watch::Receiver<CadState>,
}

impl CadMachineHandle {
    pub async fn send(&self, command: CadCommand) -> bool {
        self.commands.send(command).await.is_ok()
    }

    pub fn state(&self) -> CadState {
        *self.state.borrow()
    }

    /// Wait until the machine publishes the given state.
    pub async fn wait_for_state(&self, target: CadState) {
        let mut rx = self.state.clone();
        loop {
            if *rx.borrow() == target {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Fetch a read-only context snapshot.
    pub async fn snapshot(&self) -> Option<CadSnapshot> {
        let (reply, rx) = oneshot::channel();
        if !self.send(CadCommand::GetSnapshot { reply }).await {
            return None;
        }
        rx.await.ok()
    }
}

/// Spawn a CAD machine (which spawns its own kernel machine).
pub fn spawn_cad_machine(
    factory: WorkerFactory,
    config: CadMachineConfig,
    graphics: mpsc::Sender<SceneUpdate>,
    events: mpsc::Sender<CadEvent>,
) -> CadMachineHandle {
    let (tx, rx) = mpsc::channel(64);
    let (state_tx, state_rx) = watch::channel(CadState::Booting);

    tokio::spawn(cad_loop(factory, config, rx, graphics, events, state_tx));

    CadMachineHandle {
        commands: tx,
        state: state_rx,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BufferKind {
    File,
    Parameters,
}

struct CadMachine {
    config: CadMachineConfig,
    kernel: KernelMachineHandle,
    graphics: mpsc::Sender<SceneUpdate>,
    events: mpsc::Sender<CadEvent>,
    state: watch::Sender<CadState>,

    current_file: Option<GeometryFile>,
    parameters: ParameterMap,
    /// Model that arrived before the kernel reported ready
    pending_model: Option<(GeometryFile, Option<ParameterMap>)>,
    /// Parameters provided alongside the model being initialized
    initializing_parameters: Option<ParameterMap>,
    /// Request generation; completions with a stale tag are dropped
    generation: u64,
    default_parameters: ParameterMap,
    parameter_schema: serde_json::Value,
    geometries: Vec<Geometry>,
    exported_blob: Option<ExportedBlob>,
    kernel_error: Option<KernelError>,
    kernel_ready: bool,

    deadline: Option<tokio::time::Instant>,
    buffer_kind: Option<BufferKind>,
}

async fn cad_loop(
    factory: WorkerFactory,
    config: CadMachineConfig,
    mut commands: mpsc::Receiver<CadCommand>,
    graphics: mpsc::Sender<SceneUpdate>,
    events: mpsc::Sender<CadEvent>,
    state: watch::Sender<CadState>,
) {
    let (kernel_events_tx, mut kernel_events) = mpsc::channel(64);
    let kernel = spawn_kernel_machine(factory, kernel_events_tx);
    kernel
        .send(KernelCommand::Initialize {
            options: config.worker_options.clone(),
        })
        .await;

    let mut machine = CadMachine {
        config,
        kernel,
        graphics,
        events,
        state,
        current_file: None,
        parameters: ParameterMap::new(),
        pending_model: None,
        initializing_parameters: None,
        generation: 0,
        default_parameters: ParameterMap::new(),
        parameter_schema: serde_json::json!({}),
        geometries: Vec::new(),
        exported_blob: None,
        kernel_error: None,
        kernel_ready: false,
        deadline: None,
        buffer_kind: None,
    };

    loop {
        let deadline = machine.deadline;
        let timer = async {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            command = commands.recv() => {
                let Some(command) = command else { break };
                machine.handle_command(command).await;
            }
            Some(event) = kernel_events.recv() => {
                machine.handle_kernel_event(event).await;
            }
            _ = timer => {
                machine.debounce_fired().await;
            }
        }
    }

    debug!("cad machine stopped");
}

impl CadMachine {
    fn set_state(&self, next: CadState) {
        if *self.state.borrow() != next {
            debug!(state = ?next, "cad machine transition");
            let _ = self.state.send(next);
        }
    }

    fn current_state(&self) -> CadState {
        *self.state.borrow()
    }

    /// Invalidate any in-flight request; its completion will carry a stale
    /// generation and be dropped.
    fn supersede(&mut self) {
        self.generation += 1;
    }

    async fn handle_command(&mut self, command: CadCommand) {
        match command {
            CadCommand::InitializeModel { file, parameters } => {
                if !self.kernel_ready {
                    // Kernel init is already in flight; only the model is
                    // stored until `Initialized` arrives. A failed init is
                    // retried explicitly by the new model request.
                    if self.current_state() == CadState::Error {
                        self.kernel
                            .send(KernelCommand::Initialize {
                                options: self.config.worker_options.clone(),
                            })
                            .await;
                    }
                    self.pending_model = Some((file, parameters));
                    return;
                }
                self.begin_initializing(file, parameters).await;
            }
            CadCommand::UpdateFile { file } => {
                if !self.kernel_ready {
                    let parameters = self.pending_model.take().and_then(|(_, p)| p);
                    self.pending_model = Some((file, parameters));
                    return;
                }
                self.current_file = Some(file);
                self.supersede();
                self.buffer_kind = Some(BufferKind::File);
                self.deadline = Some(tokio::time::Instant::now() + self.config.file_debounce);
                self.set_state(CadState::BufferingFile);
            }
            CadCommand::SetParameters { parameters } => {
                self.parameters = parameters;
                if self.current_file.is_none() {
                    // No model yet: hold the values, nothing to compute.
                    return;
                }
                self.supersede();
                self.buffer_kind = Some(BufferKind::Parameters);
                self.deadline =
                    Some(tokio::time::Instant::now() + self.config.parameter_debounce);
                self.set_state(CadState::BufferingParameters);
            }
            CadCommand::ExportGeometry { format } => {
                self.kernel
                    .send(KernelCommand::Export {
                        format,
                        geometry_id: self.config.geometry_id.clone(),
                    })
                    .await;
            }
            CadCommand::GetSnapshot { reply } => {
                let _ = reply.send(CadSnapshot {
                    state: self.current_state(),
                    current_file: self.current_file.clone(),
                    parameters: self.parameters.clone(),
                    default_parameters: self.default_parameters.clone(),
                    parameter_schema: self.parameter_schema.clone(),
                    geometry_count: self.geometries.len(),
                    exported_blob: self.exported_blob.clone(),
                    kernel_error: self.kernel_error.clone(),
                });
            }
        }
    }

    /// Full model load: extract the parameter declaration, then compute.
    async fn begin_initializing(&mut self, file: GeometryFile, parameters: Option<ParameterMap>) {
        self.supersede();
        self.deadline = None;
        self.buffer_kind = None;
        self.current_file = Some(file.clone());
        self.initializing_parameters = parameters;
        self.set_state(CadState::Initializing);
        self.kernel
            .send(KernelCommand::ExtractParameters {
                file,
                generation: self.generation,
            })
            .await;
    }

    /// A debounce window elapsed: issue the coalesced compute.
    async fn debounce_fired(&mut self) {
        self.deadline = None;
        self.buffer_kind = None;

        let Some(file) = self.current_file.clone() else {
            self.set_state(CadState::Ready);
            return;
        };

        self.set_state(CadState::Rendering);
        self.kernel
            .send(KernelCommand::Compute {
                file,
                parameters: self.parameters.clone(),
                geometry_id: self.config.geometry_id.clone(),
                generation: self.generation,
            })
            .await;
    }

    async fn handle_kernel_event(&mut self, event: KernelEvent) {
        match event {
            KernelEvent::Initialized => {
                self.kernel_ready = true;
                if let Some((file, parameters)) = self.pending_model.take() {
                    self.begin_initializing(file, parameters).await;
                } else if self.current_state() == CadState::Booting {
                    self.set_state(CadState::Ready);
                }
            }
            KernelEvent::InitFailed(error) => {
                warn!(error = %error, "kernel failed to initialize");
                self.kernel_error = Some(error.clone());
                self.set_state(CadState::Error);
                let _ = self.events.send(CadEvent::KernelFailed(error)).await;
            }
            KernelEvent::ExtractFinished { generation, result } => {
                if generation != self.generation {
                    debug!(generation, current = self.generation, "stale extract dropped");
                    return;
                }
                match result {
                    Ok(extraction) => {
                        self.default_parameters = extraction.default_parameters.clone();
                        self.parameter_schema = extraction.json_schema.clone();
                        self.parameters = match self.initializing_parameters.take() {
                            Some(provided) if !provided.is_empty() => provided,
                            _ => extraction.default_parameters,
                        };
                        let _ = self
                            .events
                            .send(CadEvent::ModelInitialized {
                                defaults: self.default_parameters.clone(),
                                schema: self.parameter_schema.clone(),
                            })
                            .await;

                        // Still Initializing: completion arrives as a
                        // compute result for the same generation.
                        if let Some(file) = self.current_file.clone() {
                            self.kernel
                                .send(KernelCommand::Compute {
                                    file,
                                    parameters: self.parameters.clone(),
                                    geometry_id: self.config.geometry_id.clone(),
                                    generation: self.generation,
                                })
                                .await;
                        }
                    }
                    Err(error) => {
                        self.kernel_error = Some(error.clone());
                        self.set_state(CadState::Error);
                        let _ = self.events.send(CadEvent::KernelFailed(error)).await;
                    }
                }
            }
            KernelEvent::ComputeFinished { generation, result } => {
                if generation != self.generation {
                    debug!(generation, current = self.generation, "stale compute dropped");
                    return;
                }
                // Only consume results the current state is wired for.
                if !matches!(
                    self.current_state(),
                    CadState::Rendering | CadState::Initializing
                ) {
                    debug!("compute finished in unexpected state, dropped");
                    return;
                }
                match result {
                    Ok(geometries) => {
                        self.geometries = geometries;
                        self.kernel_error = None;
                        let _ = self
                            .graphics
                            .send(SceneUpdate {
                                geometries: self.geometries.clone(),
                                units: self.config.units,
                            })
                            .await;
                        self.set_state(CadState::Ready);
                        let _ = self
                            .events
                            .send(CadEvent::GeometryReady {
                                count: self.geometries.len(),
                            })
                            .await;
                    }
                    Err(error) => {
                        self.kernel_error = Some(error.clone());
                        self.set_state(CadState::Error);
                        let _ = self.events.send(CadEvent::KernelFailed(error)).await;
                    }
                }
            }
            KernelEvent::ExportFinished { result } => match result {
                Ok(blob) => {
                    self.exported_blob = Some(blob.clone());
                    let _ = self.events.send(CadEvent::GeometryExported(blob)).await;
                }
                Err(error) => {
                    let _ = self.events.send(CadEvent::ExportFailed(error)).await;
                }
            },
            KernelEvent::Log(line) => {
                let _ = self.events.send(CadEvent::KernelLog(line)).await;
            }
        }
    }
}
