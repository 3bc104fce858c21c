//! Build machine: per-build lifecycle and persistence
//!
//! Loads the persisted Build aggregate, spawns the per-build children (CAD
//! machine, git, file explorer, graphics, capture), applies file and chat
//! operations against the in-memory aggregate, mirrors file content into a
//! virtual filesystem best-effort, and debounces persistence writes.
//!
//! States: CheckEnvironment → {Inert | Idle | Loading} → Ready | Failed.
//! The storing region runs Idle → Pending → Writing → Idle with a fixed
//! debounce window; a failed write returns to Pending with the timer
//! re-armed, so persistence failures retry silently instead of failing the
//! machine. Initial-load failures are terminal for that load and recovered
//! only by an explicit `LoadBuild`.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};

use cadflow_kernel::{CadWorker, GeometryFile};
use cadflow_state::{Build, BuildId, BuildStore, ChatId, ContentDigest};

use crate::cad_machine::{
    spawn_cad_machine, CadCommand, CadEvent, CadMachineConfig, CadMachineHandle, CadSnapshot,
};
use crate::collab::{
    spawn_capture_broker, CaptureCommand, ChatNamer, ExplorerCommand, GitCommand, SceneUpdate,
    VirtualFs,
};
use crate::units::Unit;

/// Debounce window for persistence writes.
pub const STORE_DEBOUNCE: Duration = Duration::from_millis(500);

/// Observable lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildState {
    CheckEnvironment,
    /// Non-interactive host; the machine parks and ignores commands
    Inert,
    Idle,
    Loading,
    Ready,
    Failed,
}

/// Observable state of the storing region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoringState {
    Idle,
    Pending,
    Writing,
}

/// Creates fresh worker instances for each CAD machine spawn.
pub type WorkerMaker = Arc<dyn Fn() -> Box<dyn CadWorker> + Send + Sync>;

/// Per-build child collaborators, respawned on every build switch.
pub struct BuildChildren {
    pub git: mpsc::Sender<GitCommand>,
    pub explorer: mpsc::Sender<ExplorerCommand>,
    pub graphics: mpsc::Sender<SceneUpdate>,
    pub capture: mpsc::Sender<CaptureCommand>,
}

/// Spawns the per-build children. Hosts provide real collaborators; tests
/// capture the channel ends.
pub trait ChildSpawner: Send + Sync {
    fn spawn_children(&self, build_id: &BuildId) -> BuildChildren;
}

/// Spawner wiring every child to a draining no-op actor (plus a real
/// capture broker). Useful for headless hosts and tests that don't observe
/// collaborators.
pub struct NullSpawner;

impl ChildSpawner for NullSpawner {
    fn spawn_children(&self, _build_id: &BuildId) -> BuildChildren {
        BuildChildren {
            git: drain_actor(),
            explorer: drain_actor(),
            graphics: drain_actor(),
            capture: spawn_capture_broker(),
        }
    }
}

fn drain_actor<T: Send + 'static>() -> mpsc::Sender<T> {
    let (tx, mut rx) = mpsc::channel::<T>(16);
    tokio::spawn(async move { while rx.recv().await.is_some() {} });
    tx
}

/// Commands accepted by the build machine.
#[derive(Debug)]
pub enum BuildCommand {
    LoadBuild { id: BuildId },
    CreateFile { path: String, content: String },
    UpdateFile { path: String, content: String },
    RenameFile { from: String, to: String },
    DeleteFile { path: String },
    SetParameter { name: String, value: serde_json::Value },
    Rename { name: String },
    SetDescription { description: String },
    SetTags { tags: Vec<String> },
    AddChat,
    AppendChatMessage { chat_id: ChatId, message: serde_json::Value },
    SetLastChat { chat_id: ChatId },
    RemoveChat { chat_id: ChatId },
    SetPreview { enabled: bool },
    ThumbnailCaptured { data_url: String },
    ExportGeometry { format: String },
    GetSnapshot { reply: oneshot::Sender<BuildSnapshot> },
    GetCadSnapshot { reply: oneshot::Sender<CadSnapshot> },
}

/// Events emitted by the build machine. CAD machine events are relayed
/// through the same stream.
#[derive(Debug)]
pub enum BuildEvent {
    Loaded { id: BuildId },
    LoadFailed { id: BuildId, error: String },
    BuildUpdated { digest: ContentDigest },
    /// A background save failed; it will retry on the next window
    StoreFailed { error: String },
    FileWritten { path: String },
    ChatAdded { chat_id: ChatId },
    ChatRenamed { chat_id: ChatId, name: String },
    OperationFailed { error: String },
    Cad(CadEvent),
}

/// Read-only view of the machine context.
#[derive(Debug, Clone)]
pub struct BuildSnapshot {
    pub state: BuildState,
    pub storing: StoringState,
    pub build: Option<Build>,
    pub preview: bool,
}

/// Configuration of one build machine instance.
#[derive(Debug, Clone)]
pub struct BuildMachineConfig {
    /// Non-interactive hosts park in `Inert` after the environment check
    pub interactive: bool,
    /// Push the loaded model into the CAD machine automatically
    pub auto_load_model: bool,
    /// Initial file-preview toggle: push every edited file (on) or only
    /// the main file (off)
    pub preview: bool,
    pub store_debounce: Duration,
    pub units: Unit,
}

impl Default for BuildMachineConfig {
    fn default() -> Self {
        Self {
            interactive: true,
            auto_load_model: true,
            preview: false,
            store_debounce: STORE_DEBOUNCE,
            units: Unit::Millimeters,
        }
    }
}

/// Handle to a spawned build machine.
pub struct BuildMachineHandle {
    commands: mpsc::Sender<BuildCommand>,
    state: watch::Receiver<BuildState>,
    storing: watch::Receiver<StoringState>,
}

impl BuildMachineHandle {
    pub async fn send(&self, command: BuildCommand) -> bool {
        self.commands.send(command).await.is_ok()
    }

    pub fn state(&self) -> BuildState {
        *self.state.borrow()
    }

    pub fn storing(&self) -> StoringState {
        *self.storing.borrow()
    }

    /// Wait until the machine publishes the given lifecycle state.
    pub async fn wait_for_state(&self, target: BuildState) {
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

    pub async fn snapshot(&self) -> Option<BuildSnapshot> {
        let (reply, rx) = oneshot::channel();
        if !self.send(BuildCommand::GetSnapshot { reply }).await {
            return None;
        }
        rx.await.ok()
    }

    /// Read-only snapshot of the CAD machine's context, if one is spawned.
    pub async fn cad_snapshot(&self) -> Option<CadSnapshot> {
        let (reply, rx) = oneshot::channel();
        if !self.send(BuildCommand::GetCadSnapshot { reply }).await {
            return None;
        }
        rx.await.ok()
    }
}

/// Spawn the build machine actor.
pub fn spawn_build_machine(
    store: Arc<dyn BuildStore>,
    worker_maker: WorkerMaker,
    spawner: Arc<dyn ChildSpawner>,
    vfs: Arc<dyn VirtualFs>,
    namer: Arc<dyn ChatNamer>,
    config: BuildMachineConfig,
    events: mpsc::Sender<BuildEvent>,
) -> BuildMachineHandle {
    let (tx, rx) = mpsc::channel(64);
    let (state_tx, state_rx) = watch::channel(BuildState::CheckEnvironment);
    let (storing_tx, storing_rx) = watch::channel(StoringState::Idle);

    tokio::spawn(build_loop(
        store,
        worker_maker,
        spawner,
        vfs,
        namer,
        config,
        rx,
        events,
        state_tx,
        storing_tx,
    ));

    BuildMachineHandle {
        commands: tx,
        state: state_rx,
        storing: storing_rx,
    }
}

struct BuildMachine {
    store: Arc<dyn BuildStore>,
    worker_maker: WorkerMaker,
    spawner: Arc<dyn ChildSpawner>,
    vfs: Arc<dyn VirtualFs>,
    namer: Arc<dyn ChatNamer>,
    config: BuildMachineConfig,
    events: mpsc::Sender<BuildEvent>,
    state: watch::Sender<BuildState>,
    storing: watch::Sender<StoringState>,

    build: Option<Build>,
    last_stored_digest: Option<ContentDigest>,
    preview: bool,
    children: Option<BuildChildren>,
    cad: Option<CadMachineHandle>,
    cad_events: Option<mpsc::Receiver<CadEvent>>,
    store_deadline: Option<tokio::time::Instant>,
}

#[allow(clippy::too_many_arguments)]
async fn build_loop(
    store: Arc<dyn BuildStore>,
    worker_maker: WorkerMaker,
    spawner: Arc<dyn ChildSpawner>,
    vfs: Arc<dyn VirtualFs>,
    namer: Arc<dyn ChatNamer>,
    config: BuildMachineConfig,
    mut commands: mpsc::Receiver<BuildCommand>,
    events: mpsc::Sender<BuildEvent>,
    state: watch::Sender<BuildState>,
    storing: watch::Sender<StoringState>,
) {
    let preview = config.preview;
    let mut machine = BuildMachine {
        store,
        worker_maker,
        spawner,
        vfs,
        namer,
        config,
        events,
        state,
        storing,
        build: None,
        last_stored_digest: None,
        preview,
        children: None,
        cad: None,
        cad_events: None,
        store_deadline: None,
    };

    // Environment check: a non-interactive host parks the machine.
    if machine.config.interactive {
        machine.set_state(BuildState::Idle);
    } else {
        machine.set_state(BuildState::Inert);
    }

    loop {
        let deadline = machine.store_deadline;
        let store_timer = async {
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
            event = next_cad_event(&mut machine.cad_events) => {
                let _ = machine.events.send(BuildEvent::Cad(event)).await;
            }
            _ = store_timer => {
                machine.write_build().await;
            }
        }
    }

    debug!("build machine stopped");
}

async fn next_cad_event(rx: &mut Option<mpsc::Receiver<CadEvent>>) -> CadEvent {
    match rx {
        Some(receiver) => match receiver.recv().await {
            Some(event) => event,
            None => {
                *rx = None;
                std::future::pending().await
            }
        },
        None => std::future::pending().await,
    }
}

impl BuildMachine {
    fn set_state(&self, next: BuildState) {
        if *self.state.borrow() != next {
            debug!(state = ?next, "build machine transition");
            let _ = self.state.send(next);
        }
    }

    fn set_storing(&self, next: StoringState) {
        if *self.storing.borrow() != next {
            let _ = self.storing.send(next);
        }
    }

    /// A mutation happened: arm (or re-arm) the persistence debounce.
    fn mark_dirty(&mut self) {
        self.set_storing(StoringState::Pending);
        self.store_deadline = Some(tokio::time::Instant::now() + self.config.store_debounce);
    }

    async fn emit(&self, event: BuildEvent) {
        let _ = self.events.send(event).await;
    }

    async fn handle_command(&mut self, command: BuildCommand) {
        if *self.state.borrow() == BuildState::Inert {
            debug!("command ignored by inert build machine");
            return;
        }

        match command {
            BuildCommand::LoadBuild { id } => self.load_build(id).await,
            BuildCommand::GetSnapshot { reply } => {
                let _ = reply.send(BuildSnapshot {
                    state: *self.state.borrow(),
                    storing: *self.storing.borrow(),
                    build: self.build.clone(),
                    preview: self.preview,
                });
            }
            BuildCommand::GetCadSnapshot { reply } => {
                // Forward the reply channel; the CAD machine answers
                // directly, so this actor never blocks on its child.
                if let Some(cad) = &self.cad {
                    cad.send(CadCommand::GetSnapshot { reply }).await;
                }
            }
            BuildCommand::SetPreview { enabled } => {
                self.preview = enabled;
            }
            BuildCommand::ExportGeometry { format } => {
                if let Some(cad) = &self.cad {
                    cad.send(CadCommand::ExportGeometry { format }).await;
                }
            }
            other => {
                if *self.state.borrow() != BuildState::Ready {
                    debug!("mutation ignored outside ready state");
                    return;
                }
                self.handle_mutation(other).await;
            }
        }
    }

    /// Load (or reload) a build by id, respawning all per-build children.
    async fn load_build(&mut self, id: BuildId) {
        // Stop current children before reloading; no state may leak across
        // builds sharing this machine instance.
        self.children = None;
        self.cad = None;
        self.cad_events = None;
        self.store_deadline = None;
        self.set_storing(StoringState::Idle);

        self.set_state(BuildState::Loading);

        let build = match self.store.get_build(&id).await {
            Ok(build) => build,
            Err(error) => {
                warn!(build_id = %id, error = %error, "build load failed");
                self.build = None;
                self.set_state(BuildState::Failed);
                self.emit(BuildEvent::LoadFailed {
                    id,
                    error: error.to_string(),
                })
                .await;
                return;
            }
        };

        let children = self.spawner.spawn_children(&id);

        let (cad_events_tx, cad_events_rx) = mpsc::channel(64);
        let maker = Arc::clone(&self.worker_maker);
        let mut cad_config =
            CadMachineConfig::new(cadflow_kernel::GeometryId::new(id.0.clone()));
        cad_config.units = self.config.units;
        let cad = spawn_cad_machine(
            Box::new(move || (*maker)()),
            cad_config,
            children.graphics.clone(),
            cad_events_tx,
        );

        if let Some(mech) = &build.assets.mechanical {
            let _ = children
                .explorer
                .send(ExplorerCommand::OpenFile {
                    path: mech.main.clone(),
                })
                .await;

            if self.config.auto_load_model {
                if let Some(content) = mech.main_content() {
                    let parameters = if mech.parameters.is_empty() {
                        None
                    } else {
                        Some(mech.parameters.clone())
                    };
                    cad.send(CadCommand::InitializeModel {
                        file: GeometryFile::new(mech.main.clone(), content),
                        parameters,
                    })
                    .await;
                }
            }

            // Best-effort filesystem mirror of every file.
            for (path, content) in &mech.files {
                self.mirror_write(&build.id, path, content).await;
            }
        }

        self.last_stored_digest = Some(build.snapshot_digest());
        self.build = Some(build);
        self.children = Some(children);
        self.cad = Some(cad);
        self.cad_events = Some(cad_events_rx);
        self.set_state(BuildState::Ready);
        self.emit(BuildEvent::Loaded { id }).await;
    }

    /// Mirror a file into the virtual filesystem. Failures are swallowed:
    /// the mirror is a convenience for editor tooling, not a source of
    /// truth.
    async fn mirror_write(&self, build_id: &BuildId, path: &str, content: &str) {
        if let Err(error) = self.vfs.write_file(build_id, path, content).await {
            warn!(path, error = %error, "filesystem mirror write failed");
        }
    }

    async fn mirror_remove(&self, build_id: &BuildId, path: &str) {
        if let Err(error) = self.vfs.remove_file(build_id, path).await {
            warn!(path, error = %error, "filesystem mirror remove failed");
        }
    }

    /// Push edited source into the CAD machine when the preview toggle is
    /// on, or when the edited file is the designated main file.
    async fn push_to_cad(&self, path: &str, content: &str) {
        let is_main = self
            .build
            .as_ref()
            .and_then(|b| b.assets.mechanical.as_ref())
            .map(|m| m.main == path)
            .unwrap_or(false);
        if !(self.preview || is_main) {
            return;
        }
        if let Some(cad) = &self.cad {
            cad.send(CadCommand::UpdateFile {
                file: GeometryFile::new(path, content),
            })
            .await;
        }
    }

    async fn handle_mutation(&mut self, command: BuildCommand) {
        let Some(build) = self.build.as_mut() else {
            return;
        };
        let build_id = build.id.clone();

        match command {
            BuildCommand::CreateFile { path, content } => {
                let language = build
                    .assets
                    .mechanical
                    .as_ref()
                    .map(|m| m.language.clone())
                    .unwrap_or_else(|| "replicad".to_string());
                build.upsert_file(path.as_str(), content.as_str(), language);
                self.mirror_write(&build_id, &path, &content).await;
                self.emit(BuildEvent::FileWritten { path: path.clone() }).await;
                self.push_to_cad(&path, &content).await;
                self.mark_dirty();
            }
            BuildCommand::UpdateFile { path, content } => {
                let language = build
                    .assets
                    .mechanical
                    .as_ref()
                    .map(|m| m.language.clone())
                    .unwrap_or_else(|| "replicad".to_string());
                build.upsert_file(path.as_str(), content.as_str(), language);
                self.mirror_write(&build_id, &path, &content).await;
                self.emit(BuildEvent::FileWritten { path: path.clone() }).await;
                self.push_to_cad(&path, &content).await;
                self.mark_dirty();
            }
            BuildCommand::RenameFile { from, to } => match build.rename_file(&from, to.as_str()) {
                Ok(()) => {
                    let content = build
                        .assets
                        .mechanical
                        .as_ref()
                        .and_then(|m| m.files.get(&to).cloned())
                        .unwrap_or_default();
                    self.mirror_remove(&build_id, &from).await;
                    self.mirror_write(&build_id, &to, &content).await;
                    self.emit(BuildEvent::FileWritten { path: to.clone() }).await;
                    self.push_to_cad(&to, &content).await;
                    self.mark_dirty();
                }
                Err(error) => {
                    self.emit(BuildEvent::OperationFailed {
                        error: error.to_string(),
                    })
                    .await;
                }
            },
            BuildCommand::DeleteFile { path } => match build.remove_file(&path) {
                Ok(()) => {
                    self.mirror_remove(&build_id, &path).await;
                    self.mark_dirty();
                }
                Err(error) => {
                    self.emit(BuildEvent::OperationFailed {
                        error: error.to_string(),
                    })
                    .await;
                }
            },
            BuildCommand::SetParameter { name, value } => {
                match build.set_parameter(name, value) {
                    Ok(()) => {
                        let parameters = build
                            .assets
                            .mechanical
                            .as_ref()
                            .map(|m| m.parameters.clone())
                            .unwrap_or_default();
                        if let Some(cad) = &self.cad {
                            cad.send(CadCommand::SetParameters { parameters }).await;
                        }
                        self.mark_dirty();
                    }
                    Err(error) => {
                        self.emit(BuildEvent::OperationFailed {
                            error: error.to_string(),
                        })
                        .await;
                    }
                }
            }
            BuildCommand::Rename { name } => {
                build.rename(name);
                self.mark_dirty();
            }
            BuildCommand::SetDescription { description } => {
                build.set_description(description);
                self.mark_dirty();
            }
            BuildCommand::SetTags { tags } => {
                build.set_tags(tags);
                self.mark_dirty();
            }
            BuildCommand::AddChat => {
                let chat_id = build.add_chat();
                self.emit(BuildEvent::ChatAdded { chat_id }).await;
                self.mark_dirty();
            }
            BuildCommand::AppendChatMessage { chat_id, message } => {
                match build.append_chat_message(&chat_id, message) {
                    Ok(()) => {
                        self.mark_dirty();
                        self.maybe_name_chat(chat_id).await;
                    }
                    Err(error) => {
                        self.emit(BuildEvent::OperationFailed {
                            error: error.to_string(),
                        })
                        .await;
                    }
                }
            }
            BuildCommand::SetLastChat { chat_id } => match build.set_last_chat(&chat_id) {
                Ok(()) => self.mark_dirty(),
                Err(error) => {
                    self.emit(BuildEvent::OperationFailed {
                        error: error.to_string(),
                    })
                    .await;
                }
            },
            BuildCommand::RemoveChat { chat_id } => match build.remove_chat(&chat_id) {
                Ok(()) => self.mark_dirty(),
                Err(error) => {
                    self.emit(BuildEvent::OperationFailed {
                        error: error.to_string(),
                    })
                    .await;
                }
            },
            BuildCommand::ThumbnailCaptured { data_url } => {
                build.set_thumbnail(Some(data_url));
                self.mark_dirty();
            }
            // Routed before reaching handle_mutation.
            BuildCommand::LoadBuild { .. }
            | BuildCommand::SetPreview { .. }
            | BuildCommand::ExportGeometry { .. }
            | BuildCommand::GetSnapshot { .. }
            | BuildCommand::GetCadSnapshot { .. } => {}
        }
    }

    /// First message into a chat still carrying the default name triggers
    /// the out-of-band naming collaborator, best-effort.
    async fn maybe_name_chat(&mut self, chat_id: ChatId) {
        let Some(build) = self.build.as_ref() else {
            return;
        };
        let Some(chat) = build.chat(&chat_id) else {
            return;
        };
        if !chat.has_default_name() || chat.messages.len() != 1 {
            return;
        }

        let messages = chat.messages.clone();
        if let Some(name) = self.namer.name_chat(&messages).await {
            if let Some(build) = self.build.as_mut() {
                if build.rename_chat(&chat_id, &name).is_ok() {
                    self.emit(BuildEvent::ChatRenamed { chat_id, name }).await;
                    self.mark_dirty();
                }
            }
        }
    }

    /// The storing debounce elapsed: persist the current aggregate.
    async fn write_build(&mut self) {
        self.store_deadline = None;
        let Some(build) = self.build.clone() else {
            self.set_storing(StoringState::Idle);
            return;
        };

        let digest = build.snapshot_digest();
        if self.last_stored_digest.as_ref() == Some(&digest) {
            // Nothing changed since the last successful write.
            self.set_storing(StoringState::Idle);
            return;
        }

        self.set_storing(StoringState::Writing);
        match self.store.update_build(&build).await {
            Ok(()) => {
                self.last_stored_digest = Some(digest.clone());
                self.set_storing(StoringState::Idle);
                self.emit(BuildEvent::BuildUpdated { digest }).await;
            }
            Err(error) => {
                // Silent retry: back to pending with the window re-armed.
                warn!(error = %error, "build write failed, retrying");
                self.emit(BuildEvent::StoreFailed {
                    error: error.to_string(),
                })
                .await;
                self.set_storing(StoringState::Pending);
                self.store_deadline =
                    Some(tokio::time::Instant::now() + self.config.store_debounce);
            }
        }
    }
}
