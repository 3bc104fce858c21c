//! Worker host: the isolation boundary
//!
//! One tokio task owns the worker exclusively and serves requests over an
//! mpsc channel with oneshot replies. Panics in worker code are caught at
//! this boundary and normalized into `KernelError`s, so a crash in user
//! CAD source can never corrupt caller state beyond "this request failed".
//! Worker log lines stream out through a separate unbounded channel.

use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::error::{normalize_panic, ErrorKind, KernelError};
use crate::protocol::{
    CadWorker, ExportedBlob, Geometry, GeometryFile, GeometryId, LogLine, ParameterExtraction,
    ParameterMap, WorkerOptions,
};

/// Buffered requests per worker; callers are serialized anyway.
const REQUEST_BUFFER: usize = 16;

enum WorkerRequest {
    Initialize {
        options: WorkerOptions,
        reply: oneshot::Sender<Result<(), KernelError>>,
    },
    CanHandle {
        file: GeometryFile,
        reply: oneshot::Sender<bool>,
    },
    ExtractParameters {
        file: GeometryFile,
        reply: oneshot::Sender<Result<ParameterExtraction, KernelError>>,
    },
    ComputeGeometry {
        file: GeometryFile,
        parameters: ParameterMap,
        geometry_id: GeometryId,
        reply: oneshot::Sender<Result<Vec<Geometry>, KernelError>>,
    },
    ExportGeometry {
        format: String,
        geometry_id: GeometryId,
        reply: oneshot::Sender<Result<ExportedBlob, KernelError>>,
    },
    Cleanup {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to a hosted worker. Cloneable; all clones talk to the same
/// worker task.
#[derive(Clone)]
pub struct WorkerClient {
    tx: mpsc::Sender<WorkerRequest>,
}

/// Spawn a worker behind the isolation boundary.
///
/// Returns the client handle plus the receiving half of the worker's log
/// stream. Dropping every client closes the request channel and ends the
/// host task after a final cleanup.
pub fn spawn_worker(
    worker: Box<dyn CadWorker>,
) -> (WorkerClient, mpsc::UnboundedReceiver<LogLine>) {
    let (tx, rx) = mpsc::channel(REQUEST_BUFFER);
    let (log_tx, log_rx) = mpsc::unbounded_channel();

    tokio::spawn(host_loop(worker, rx, log_tx));

    (WorkerClient { tx }, log_rx)
}

async fn host_loop(
    mut worker: Box<dyn CadWorker>,
    mut rx: mpsc::Receiver<WorkerRequest>,
    log_tx: mpsc::UnboundedSender<LogLine>,
) {
    let origin = worker.profile().name.clone();
    debug!(worker = %origin, "worker host started");

    while let Some(request) = rx.recv().await {
        match request {
            WorkerRequest::Initialize { options, reply } => {
                let result = AssertUnwindSafe(worker.initialize(log_tx.clone(), options))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|panic| {
                        warn!(worker = %origin, "worker panicked during initialize");
                        Err(normalize_panic(panic, "worker panicked during initialization"))
                    });
                let _ = reply.send(result);
            }
            WorkerRequest::CanHandle { file, reply } => {
                let _ = reply.send(worker.can_handle(&file));
            }
            WorkerRequest::ExtractParameters { file, reply } => {
                let result = AssertUnwindSafe(worker.extract_parameters(&file))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|panic| {
                        warn!(worker = %origin, file = %file.filename, "worker panicked during extract");
                        Err(normalize_panic(panic, "worker panicked while extracting parameters"))
                    });
                let _ = reply.send(result);
            }
            WorkerRequest::ComputeGeometry {
                file,
                parameters,
                geometry_id,
                reply,
            } => {
                let result =
                    AssertUnwindSafe(worker.compute_geometry(&file, &parameters, &geometry_id))
                        .catch_unwind()
                        .await
                        .unwrap_or_else(|panic| {
                            warn!(worker = %origin, geometry_id = %geometry_id, "worker panicked during compute");
                            Err(normalize_panic(panic, "worker panicked while computing geometry"))
                        });
                let _ = reply.send(result);
            }
            WorkerRequest::ExportGeometry {
                format,
                geometry_id,
                reply,
            } => {
                let result = AssertUnwindSafe(worker.export_geometry(&format, &geometry_id))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|panic| {
                        warn!(worker = %origin, geometry_id = %geometry_id, "worker panicked during export");
                        Err(normalize_panic(panic, "worker panicked while exporting geometry"))
                    });
                let _ = reply.send(result);
            }
            WorkerRequest::Cleanup { reply } => {
                worker.cleanup().await;
                let _ = reply.send(());
                debug!(worker = %origin, "worker host stopped");
                return;
            }
        }
    }

    // Every client dropped without an explicit cleanup.
    worker.cleanup().await;
    debug!(worker = %origin, "worker host stopped");
}

impl WorkerClient {
    /// Initialize the worker engine.
    pub async fn initialize(&self, options: WorkerOptions) -> Result<(), KernelError> {
        let (reply, rx) = oneshot::channel();
        self.send(WorkerRequest::Initialize { options, reply }).await?;
        rx.await.map_err(|_| terminated())?
    }

    /// Ask the worker whether it should process the file.
    pub async fn can_handle(&self, file: GeometryFile) -> Result<bool, KernelError> {
        let (reply, rx) = oneshot::channel();
        self.send(WorkerRequest::CanHandle { file, reply }).await?;
        rx.await.map_err(|_| terminated())
    }

    /// Extract the file's parameter declaration.
    pub async fn extract_parameters(
        &self,
        file: GeometryFile,
    ) -> Result<ParameterExtraction, KernelError> {
        let (reply, rx) = oneshot::channel();
        self.send(WorkerRequest::ExtractParameters { file, reply })
            .await?;
        rx.await.map_err(|_| terminated())?
    }

    /// Compute geometry for the file with the given parameters.
    pub async fn compute_geometry(
        &self,
        file: GeometryFile,
        parameters: ParameterMap,
        geometry_id: GeometryId,
    ) -> Result<Vec<Geometry>, KernelError> {
        let (reply, rx) = oneshot::channel();
        self.send(WorkerRequest::ComputeGeometry {
            file,
            parameters,
            geometry_id,
            reply,
        })
        .await?;
        rx.await.map_err(|_| terminated())?
    }

    /// Export previously computed geometry.
    pub async fn export_geometry(
        &self,
        format: impl Into<String>,
        geometry_id: GeometryId,
    ) -> Result<ExportedBlob, KernelError> {
        let (reply, rx) = oneshot::channel();
        self.send(WorkerRequest::ExportGeometry {
            format: format.into(),
            geometry_id,
            reply,
        })
        .await?;
        rx.await.map_err(|_| terminated())?
    }

    /// Release engine resources and stop the host task.
    pub async fn cleanup(&self) -> Result<(), KernelError> {
        let (reply, rx) = oneshot::channel();
        self.send(WorkerRequest::Cleanup { reply }).await?;
        rx.await.map_err(|_| terminated())
    }

    async fn send(&self, request: WorkerRequest) -> Result<(), KernelError> {
        self.tx.send(request).await.map_err(|_| terminated())
    }
}

fn terminated() -> KernelError {
    KernelError::new(ErrorKind::Unknown, "worker host terminated")
}
