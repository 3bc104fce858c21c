//! Kernel machine: owns exactly one live worker
//!
//! A state machine mediating initialize / extract / compute / export
//! requests against the hosted worker, converting worker responses into
//! typed events for its parent (the CAD machine) and relaying worker log
//! lines upward unbuffered.
//!
//! Failure semantics: initialization failure is terminal for that attempt
//! (the caller retries explicitly); compute/export failures are always
//! recoverable; the machine returns to `Ready` so subsequent requests can
//! proceed.

use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use cadflow_kernel::{
    spawn_worker, CadWorker, ExportedBlob, Geometry, GeometryFile, GeometryId, KernelError,
    LogLine, ParameterExtraction, ParameterMap, WorkerClient, WorkerOptions,
};

/// Creates a fresh worker instance per kernel initialization.
pub type WorkerFactory = Box<dyn FnMut() -> Box<dyn CadWorker> + Send>;

/// Observable state of the kernel machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelState {
    Uninitialized,
    Initializing,
    Ready,
    Computing,
    Exporting,
    Error,
}

/// Commands from the parent machine.
#[derive(Debug)]
pub enum KernelCommand {
    Initialize {
        options: WorkerOptions,
    },
    ExtractParameters {
        file: GeometryFile,
        generation: u64,
    },
    Compute {
        file: GeometryFile,
        parameters: ParameterMap,
        geometry_id: GeometryId,
        generation: u64,
    },
    Export {
        format: String,
        geometry_id: GeometryId,
    },
}

/// Events emitted to the parent machine.
#[derive(Debug)]
pub enum KernelEvent {
    Initialized,
    InitFailed(KernelError),
    ExtractFinished {
        generation: u64,
        result: Result<ParameterExtraction, KernelError>,
    },
    ComputeFinished {
        generation: u64,
        result: Result<Vec<Geometry>, KernelError>,
    },
    ExportFinished {
        result: Result<ExportedBlob, KernelError>,
    },
    Log(LogLine),
}

enum Internal {
    InitDone(Result<(), KernelError>),
    ExtractDone {
        generation: u64,
        result: Result<ParameterExtraction, KernelError>,
    },
    ComputeDone {
        generation: u64,
        result: Result<Vec<Geometry>, KernelError>,
    },
    ExportDone {
        result: Result<ExportedBlob, KernelError>,
    },
}

/// Handle to a spawned kernel machine.
pub struct KernelMachineHandle {
    commands: mpsc::Sender<KernelCommand>,
    state: watch::Receiver<KernelState>,
}

impl KernelMachineHandle {
    pub async fn send(&self, command: KernelCommand) -> bool {
        self.commands.send(command).await.is_ok()
    }

    pub fn state(&self) -> KernelState {
        *self.state.borrow()
    }
}

/// Spawn the kernel machine actor. Events flow to `events`; the machine
/// stops when the handle is dropped.
pub fn spawn_kernel_machine(
    factory: WorkerFactory,
    events: mpsc::Sender<KernelEvent>,
) -> KernelMachineHandle {
    let (tx, rx) = mpsc::channel(32);
    let (state_tx, state_rx) = watch::channel(KernelState::Uninitialized);

    tokio::spawn(kernel_loop(factory, rx, events, state_tx));

    KernelMachineHandle {
        commands: tx,
        state: state_rx,
    }
}

struct KernelMachine {
    factory: WorkerFactory,
    client: Option<WorkerClient>,
    log_rx: Option<mpsc::UnboundedReceiver<LogLine>>,
    events: mpsc::Sender<KernelEvent>,
    state: watch::Sender<KernelState>,
    internal_tx: mpsc::Sender<Internal>,
    computes_in_flight: u32,
    exports_in_flight: u32,
}

async fn kernel_loop(
    factory: WorkerFactory,
    mut commands: mpsc::Receiver<KernelCommand>,
    events: mpsc::Sender<KernelEvent>,
    state: watch::Sender<KernelState>,
) {
    let (internal_tx, mut internal_rx) = mpsc::channel(32);
    let mut machine = KernelMachine {
        factory,
        client: None,
        log_rx: None,
        events,
        state,
        internal_tx,
        computes_in_flight: 0,
        exports_in_flight: 0,
    };

    loop {
        tokio::select! {
            command = commands.recv() => {
                let Some(command) = command else { break };
                machine.handle_command(command).await;
            }
            Some(internal) = internal_rx.recv() => {
                machine.handle_internal(internal).await;
            }
            line = next_log(&mut machine.log_rx) => {
                let _ = machine.events.send(KernelEvent::Log(line)).await;
            }
        }
    }

    if let Some(client) = machine.client.take() {
        let _ = client.cleanup().await;
    }
    debug!("kernel machine stopped");
}

/// Await the next worker log line, parking forever when no stream is
/// attached or the stream has ended.
async fn next_log(log_rx: &mut Option<mpsc::UnboundedReceiver<LogLine>>) -> LogLine {
    match log_rx {
        Some(rx) => match rx.recv().await {
            Some(line) => line,
            None => {
                *log_rx = None;
                std::future::pending().await
            }
        },
        None => std::future::pending().await,
    }
}

impl KernelMachine {
    fn set_state(&self, next: KernelState) {
        if *self.state.borrow() != next {
            debug!(state = ?next, "kernel machine transition");
            let _ = self.state.send(next);
        }
    }

    /// Ready/Computing/Exporting, based on what is in flight. Never
    /// overrides Initializing/Error; those resolve through init events.
    fn refresh_busy_state(&self) {
        let current = *self.state.borrow();
        if !matches!(
            current,
            KernelState::Ready | KernelState::Computing | KernelState::Exporting
        ) {
            return;
        }
        let next = if self.computes_in_flight > 0 {
            KernelState::Computing
        } else if self.exports_in_flight > 0 {
            KernelState::Exporting
        } else {
            KernelState::Ready
        };
        self.set_state(next);
    }

    async fn handle_command(&mut self, command: KernelCommand) {
        match command {
            KernelCommand::Initialize { options } => self.initialize(options).await,
            KernelCommand::ExtractParameters { file, generation } => {
                let Some(client) = self.client.clone() else {
                    let _ = self
                        .events
                        .send(KernelEvent::ExtractFinished {
                            generation,
                            result: Err(uninitialized()),
                        })
                        .await;
                    return;
                };
                self.computes_in_flight += 1;
                self.refresh_busy_state();
                let internal = self.internal_tx.clone();
                tokio::spawn(async move {
                    let result = client.extract_parameters(file).await;
                    let _ = internal
                        .send(Internal::ExtractDone { generation, result })
                        .await;
                });
            }
            KernelCommand::Compute {
                file,
                parameters,
                geometry_id,
                generation,
            } => {
                let Some(client) = self.client.clone() else {
                    let _ = self
                        .events
                        .send(KernelEvent::ComputeFinished {
                            generation,
                            result: Err(uninitialized()),
                        })
                        .await;
                    return;
                };
                self.computes_in_flight += 1;
                self.refresh_busy_state();
                let internal = self.internal_tx.clone();
                tokio::spawn(async move {
                    let result = client.compute_geometry(file, parameters, geometry_id).await;
                    let _ = internal
                        .send(Internal::ComputeDone { generation, result })
                        .await;
                });
            }
            KernelCommand::Export {
                format,
                geometry_id,
            } => {
                let Some(client) = self.client.clone() else {
                    let _ = self
                        .events
                        .send(KernelEvent::ExportFinished {
                            result: Err(uninitialized()),
                        })
                        .await;
                    return;
                };
                self.exports_in_flight += 1;
                self.refresh_busy_state();
                let internal = self.internal_tx.clone();
                tokio::spawn(async move {
                    let result = client.export_geometry(format, geometry_id).await;
                    let _ = internal.send(Internal::ExportDone { result }).await;
                });
            }
        }
    }

    async fn initialize(&mut self, options: WorkerOptions) {
        // Exactly one live worker: replace any previous instance.
        if let Some(previous) = self.client.take() {
            tokio::spawn(async move {
                let _ = previous.cleanup().await;
            });
        }

        self.set_state(KernelState::Initializing);

        let worker = (self.factory)();
        let (client, log_rx) = spawn_worker(worker);
        self.client = Some(client.clone());
        self.log_rx = Some(log_rx);

        let internal = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = client.initialize(options).await;
            let _ = internal.send(Internal::InitDone(result)).await;
        });
    }

    async fn handle_internal(&mut self, internal: Internal) {
        match internal {
            Internal::InitDone(Ok(())) => {
                self.set_state(KernelState::Ready);
                let _ = self.events.send(KernelEvent::Initialized).await;
            }
            Internal::InitDone(Err(error)) => {
                warn!(error = %error, "kernel initialization failed");
                self.client = None;
                self.set_state(KernelState::Error);
                let _ = self.events.send(KernelEvent::InitFailed(error)).await;
            }
            Internal::ExtractDone { generation, result } => {
                self.computes_in_flight = self.computes_in_flight.saturating_sub(1);
                self.refresh_busy_state();
                let _ = self
                    .events
                    .send(KernelEvent::ExtractFinished { generation, result })
                    .await;
            }
            Internal::ComputeDone { generation, result } => {
                self.computes_in_flight = self.computes_in_flight.saturating_sub(1);
                self.refresh_busy_state();
                let _ = self
                    .events
                    .send(KernelEvent::ComputeFinished { generation, result })
                    .await;
            }
            Internal::ExportDone { result } => {
                self.exports_in_flight = self.exports_in_flight.saturating_sub(1);
                self.refresh_busy_state();
                let _ = self.events.send(KernelEvent::ExportFinished { result }).await;
            }
        }
    }
}

fn uninitialized() -> KernelError {
    KernelError::new(
        cadflow_kernel::ErrorKind::Unknown,
        "kernel is not initialized",
    )
}
