//! Collaborator contracts around the orchestration core
//!
//! The machines talk to graphics, capture (screenshot/camera), git, file
//! explorer, chat-naming, and virtual-filesystem collaborators through
//! message channels and small async traits. The core only needs these to
//! be addressable; their internals live in the host application. In-memory
//! implementations for tests live alongside the contracts.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, warn};

use cadflow_kernel::Geometry;
use cadflow_state::BuildId;

use crate::error::OrchestrationError;
use crate::units::Unit;

/// Deadline for capture requests queued while no renderer is registered.
pub const REGISTRATION_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Graphics
// ---------------------------------------------------------------------------

/// Message the CAD machine sends to the graphics collaborator after every
/// successful compute.
#[derive(Debug, Clone, PartialEq)]
pub struct SceneUpdate {
    pub geometries: Vec<Geometry>,
    pub units: Unit,
}

// ---------------------------------------------------------------------------
// Capture broker (screenshot / camera)
// ---------------------------------------------------------------------------

/// A capture served by the registered renderer.
#[derive(Debug)]
pub struct CaptureJob {
    pub request_id: String,
    pub reply: oneshot::Sender<Result<CaptureResult, OrchestrationError>>,
}

/// A completed capture.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureResult {
    pub request_id: String,
    pub image: Vec<u8>,
}

/// Commands accepted by the capture broker.
#[derive(Debug)]
pub enum CaptureCommand {
    /// A renderer attached; queued requests flush to it.
    Register { renderer: mpsc::Sender<CaptureJob> },
    /// Capture request keyed by a caller-supplied id.
    Capture {
        request_id: String,
        reply: oneshot::Sender<Result<CaptureResult, OrchestrationError>>,
    },
}

struct QueuedCapture {
    request_id: String,
    reply: oneshot::Sender<Result<CaptureResult, OrchestrationError>>,
    deadline: Instant,
}

/// Spawn the capture broker actor.
///
/// Requests arriving before a renderer registers are queued; a queued
/// request not served within [`REGISTRATION_TIMEOUT`] fails with a
/// registration-timeout error instead of hanging.
pub fn spawn_capture_broker() -> mpsc::Sender<CaptureCommand> {
    let (tx, rx) = mpsc::channel(16);
    tokio::spawn(capture_loop(rx));
    tx
}

async fn capture_loop(mut rx: mpsc::Receiver<CaptureCommand>) {
    let mut renderer: Option<mpsc::Sender<CaptureJob>> = None;
    let mut queue: VecDeque<QueuedCapture> = VecDeque::new();

    loop {
        let next_deadline = queue.front().map(|q| q.deadline);
        let expiry = async {
            match next_deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            command = rx.recv() => {
                let Some(command) = command else { break };
                match command {
                    CaptureCommand::Register { renderer: attached } => {
                        debug!("capture renderer registered, flushing {} queued requests", queue.len());
                        for queued in queue.drain(..) {
                            forward_capture(&attached, queued.request_id, queued.reply).await;
                        }
                        renderer = Some(attached);
                    }
                    CaptureCommand::Capture { request_id, reply } => {
                        match &renderer {
                            Some(attached) => {
                                forward_capture(attached, request_id, reply).await;
                            }
                            None => {
                                queue.push_back(QueuedCapture {
                                    request_id,
                                    reply,
                                    deadline: Instant::now() + REGISTRATION_TIMEOUT,
                                });
                            }
                        }
                    }
                }
            }
            _ = expiry => {
                if let Some(expired) = queue.pop_front() {
                    warn!(request_id = %expired.request_id, "capture request expired before registration");
                    let _ = expired.reply.send(Err(OrchestrationError::RegistrationTimeout {
                        request_id: expired.request_id,
                        timeout_ms: REGISTRATION_TIMEOUT.as_millis() as u64,
                    }));
                }
            }
        }
    }
}

async fn forward_capture(
    renderer: &mpsc::Sender<CaptureJob>,
    request_id: String,
    reply: oneshot::Sender<Result<CaptureResult, OrchestrationError>>,
) {
    let job = CaptureJob {
        request_id: request_id.clone(),
        reply,
    };
    if let Err(mpsc::error::SendError(job)) = renderer.send(job).await {
        let _ = job
            .reply
            .send(Err(OrchestrationError::CaptureAborted { request_id }));
    }
}

// ---------------------------------------------------------------------------
// Git / file explorer
// ---------------------------------------------------------------------------

/// Messages to the git collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GitCommand {
    StageFile { path: String },
    Commit { message: String },
}

/// Messages to the file explorer collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExplorerCommand {
    OpenFile { path: String },
    CloseAll,
}

// ---------------------------------------------------------------------------
// Chat naming
// ---------------------------------------------------------------------------

/// Out-of-band chat naming collaborator. Called once a chat still carrying
/// the default name receives its first message; best-effort.
#[async_trait]
pub trait ChatNamer: Send + Sync {
    async fn name_chat(&self, messages: &[serde_json::Value]) -> Option<String>;
}

/// Namer that always returns a fixed name (testing).
#[derive(Debug, Default)]
pub struct FixedChatNamer {
    pub name: Option<String>,
}

impl FixedChatNamer {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
        }
    }
}

#[async_trait]
impl ChatNamer for FixedChatNamer {
    async fn name_chat(&self, _messages: &[serde_json::Value]) -> Option<String> {
        self.name.clone()
    }
}

// ---------------------------------------------------------------------------
// Virtual filesystem
// ---------------------------------------------------------------------------

/// Best-effort mirror of in-memory file content for editor/tooling use.
/// Failures are swallowed by the build machine (non-critical path).
#[async_trait]
pub trait VirtualFs: Send + Sync {
    async fn write_file(
        &self,
        build_id: &BuildId,
        path: &str,
        content: &str,
    ) -> std::io::Result<()>;

    async fn remove_file(&self, build_id: &BuildId, path: &str) -> std::io::Result<()>;
}

/// In-memory virtual filesystem with optional failure injection.
#[derive(Debug, Default)]
pub struct MemoryFs {
    files: Mutex<std::collections::HashMap<(String, String), String>>,
    failing: Mutex<bool>,
}

impl MemoryFs {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make every subsequent operation fail (for swallow-path tests).
    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock().unwrap() = failing;
    }

    pub fn read(&self, build_id: &BuildId, path: &str) -> Option<String> {
        self.files
            .lock()
            .unwrap()
            .get(&(build_id.0.clone(), path.to_string()))
            .cloned()
    }
}

#[async_trait]
impl VirtualFs for MemoryFs {
    async fn write_file(
        &self,
        build_id: &BuildId,
        path: &str,
        content: &str,
    ) -> std::io::Result<()> {
        if *self.failing.lock().unwrap() {
            return Err(std::io::Error::other("injected fs failure"));
        }
        self.files
            .lock()
            .unwrap()
            .insert((build_id.0.clone(), path.to_string()), content.to_string());
        Ok(())
    }

    async fn remove_file(&self, build_id: &BuildId, path: &str) -> std::io::Result<()> {
        if *self.failing.lock().unwrap() {
            return Err(std::io::Error::other("injected fs failure"));
        }
        self.files
            .lock()
            .unwrap()
            .remove(&(build_id.0.clone(), path.to_string()));
        Ok(())
    }
}
