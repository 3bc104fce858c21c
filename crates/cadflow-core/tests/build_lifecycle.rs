//! Build machine lifecycle tests: load, build switch, persistence
//! debounce/retry, preview push policy, chat naming, and thumbnail
//! metadata.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;

use cadflow_core::{
    spawn_build_machine, spawn_capture_broker, BuildChildren, BuildCommand, BuildEvent,
    BuildMachineConfig, BuildMachineHandle, BuildState, CadEvent, CadState, ChildSpawner,
    ExplorerCommand, FixedChatNamer, MemoryFs, StoringState,
};
use cadflow_kernel::testing::{ComputeCall, ScriptedBehavior, ScriptedWorker};
use cadflow_kernel::CadWorker;
use cadflow_state::fakes::MemoryBuildStore;
use cadflow_state::{Build, BuildId, BuildStore, MechanicalAssets};

type CallLog = Arc<Mutex<Vec<ComputeCall>>>;

fn drain<T: Send + 'static>() -> mpsc::Sender<T> {
    let (tx, mut rx) = mpsc::channel::<T>(16);
    tokio::spawn(async move { while rx.recv().await.is_some() {} });
    tx
}

/// Spawner that records every spawn and keeps the explorer receivers so
/// tests can observe child lifecycle across build switches.
#[derive(Default)]
struct RecordingSpawner {
    spawn_count: AtomicUsize,
    explorers: Mutex<Vec<mpsc::Receiver<ExplorerCommand>>>,
}

impl RecordingSpawner {
    fn take_explorer(&self, index: usize) -> mpsc::Receiver<ExplorerCommand> {
        self.explorers.lock().unwrap().remove(index)
    }
}

impl ChildSpawner for RecordingSpawner {
    fn spawn_children(&self, _build_id: &BuildId) -> BuildChildren {
        self.spawn_count.fetch_add(1, Ordering::SeqCst);
        let (explorer_tx, explorer_rx) = mpsc::channel(16);
        self.explorers.lock().unwrap().push(explorer_rx);
        BuildChildren {
            git: drain(),
            explorer: explorer_tx,
            graphics: drain(),
            capture: spawn_capture_broker(),
        }
    }
}

struct Harness {
    handle: BuildMachineHandle,
    events: mpsc::Receiver<BuildEvent>,
    store: Arc<MemoryBuildStore>,
    calls: CallLog,
    spawner: Arc<RecordingSpawner>,
    fs: Arc<MemoryFs>,
}

fn spawn_harness(config: BuildMachineConfig) -> Harness {
    let store = Arc::new(MemoryBuildStore::new());
    let calls: CallLog = Arc::new(Mutex::new(Vec::new()));
    let maker_calls = Arc::clone(&calls);
    let maker = Arc::new(move || {
        Box::new(
            ScriptedWorker::new(ScriptedBehavior::default())
                .with_shared_call_log(Arc::clone(&maker_calls)),
        ) as Box<dyn CadWorker>
    });
    let spawner = Arc::new(RecordingSpawner::default());
    let fs = MemoryFs::new();
    let namer = Arc::new(FixedChatNamer::new("Bracket hinge"));
    let (events_tx, events_rx) = mpsc::channel(256);

    let handle = spawn_build_machine(
        Arc::clone(&store) as Arc<dyn BuildStore>,
        maker,
        Arc::clone(&spawner) as Arc<dyn ChildSpawner>,
        Arc::clone(&fs) as Arc<dyn cadflow_core::VirtualFs>,
        namer,
        config,
        events_tx,
    );

    Harness {
        handle,
        events: events_rx,
        store,
        calls,
        spawner,
        fs,
    }
}

fn sample_build(file: &str, width: f64) -> Build {
    let mut assets = MechanicalAssets::single_file(
        file,
        "import { draw } from 'replicad'; export const main = () => {}",
        "replicad",
    );
    assets
        .parameters
        .insert("width".to_string(), serde_json::json!(width));
    Build::with_mechanical_assets("bracket", assets).unwrap()
}

async fn seed(store: &MemoryBuildStore, build: &Build) {
    store.create_build(build).await.unwrap();
}

async fn wait_for_event<F>(events: &mut mpsc::Receiver<BuildEvent>, mut pred: F) -> BuildEvent
where
    F: FnMut(&BuildEvent) -> bool,
{
    loop {
        let event = events.recv().await.expect("event stream closed");
        if pred(&event) {
            return event;
        }
    }
}

#[tokio::test(start_paused = true)]
async fn load_build_runs_full_model_cycle() {
    let mut harness = spawn_harness(BuildMachineConfig::default());
    let build = sample_build("a.js", 10.0);
    seed(&harness.store, &build).await;

    harness
        .handle
        .send(BuildCommand::LoadBuild {
            id: build.id.clone(),
        })
        .await;
    harness.handle.wait_for_state(BuildState::Ready).await;

    wait_for_event(&mut harness.events, |e| {
        matches!(e, BuildEvent::Cad(CadEvent::GeometryReady { .. }))
    })
    .await;

    let calls = harness.calls.lock().unwrap().clone();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].filename, "a.js");
    assert_eq!(calls[0].parameters["width"], serde_json::json!(10.0));

    let cad = harness.handle.cad_snapshot().await.unwrap();
    assert_eq!(cad.state, CadState::Ready);
    assert_eq!(cad.current_file.unwrap().filename, "a.js");

    // The explorer was asked to open the main file.
    let mut explorer = harness.spawner.take_explorer(0);
    assert_eq!(
        explorer.recv().await,
        Some(ExplorerCommand::OpenFile {
            path: "a.js".to_string()
        })
    );

    // File content was mirrored into the virtual filesystem.
    assert!(harness.fs.read(&build.id, "a.js").is_some());
}

#[tokio::test(start_paused = true)]
async fn build_switch_respawns_children_and_reloads_cad() {
    let mut harness = spawn_harness(BuildMachineConfig::default());
    let build_a = sample_build("a.js", 10.0);
    let build_b = sample_build("b.js", 20.0);
    seed(&harness.store, &build_a).await;
    seed(&harness.store, &build_b).await;

    harness
        .handle
        .send(BuildCommand::LoadBuild {
            id: build_a.id.clone(),
        })
        .await;
    harness.handle.wait_for_state(BuildState::Ready).await;
    wait_for_event(&mut harness.events, |e| {
        matches!(e, BuildEvent::Cad(CadEvent::GeometryReady { .. }))
    })
    .await;

    harness
        .handle
        .send(BuildCommand::LoadBuild {
            id: build_b.id.clone(),
        })
        .await;
    wait_for_event(&mut harness.events, |e| {
        matches!(e, BuildEvent::Loaded { id } if *id == build_b.id)
    })
    .await;
    wait_for_event(&mut harness.events, |e| {
        matches!(e, BuildEvent::Cad(CadEvent::GeometryReady { .. }))
    })
    .await;

    // Children were respawned for the new build.
    assert_eq!(harness.spawner.spawn_count.load(Ordering::SeqCst), 2);

    // The old explorer channel is closed after draining its open command.
    let mut old_explorer = harness.spawner.take_explorer(0);
    assert_eq!(
        old_explorer.recv().await,
        Some(ExplorerCommand::OpenFile {
            path: "a.js".to_string()
        })
    );
    assert_eq!(old_explorer.recv().await, None);

    // The CAD machine holds the new build's file, not the old one's.
    let cad = harness.handle.cad_snapshot().await.unwrap();
    assert_eq!(cad.current_file.unwrap().filename, "b.js");
    assert_eq!(cad.parameters["width"], serde_json::json!(20.0));
}

#[tokio::test(start_paused = true)]
async fn persistence_failure_retries_silently() {
    let mut config = BuildMachineConfig::default();
    config.auto_load_model = false;
    let mut harness = spawn_harness(config);
    let build = sample_build("a.js", 10.0);
    seed(&harness.store, &build).await;

    harness
        .handle
        .send(BuildCommand::LoadBuild {
            id: build.id.clone(),
        })
        .await;
    harness.handle.wait_for_state(BuildState::Ready).await;

    harness.store.fail_next_updates(1);
    harness
        .handle
        .send(BuildCommand::Rename {
            name: "clamp".to_string(),
        })
        .await;

    // First window: the write fails and the machine re-arms silently.
    wait_for_event(&mut harness.events, |e| {
        matches!(e, BuildEvent::StoreFailed { .. })
    })
    .await;
    assert_eq!(harness.handle.state(), BuildState::Ready);

    // Second window: the retry succeeds.
    wait_for_event(&mut harness.events, |e| {
        matches!(e, BuildEvent::BuildUpdated { .. })
    })
    .await;

    assert_eq!(harness.store.update_count(), 2);
    assert_eq!(harness.handle.storing(), StoringState::Idle);
    assert_eq!(harness.handle.state(), BuildState::Ready);

    let stored = harness.store.get_build(&build.id).await.unwrap();
    assert_eq!(stored.name, "clamp");
}

#[tokio::test(start_paused = true)]
async fn preview_toggle_controls_cad_push() {
    let mut harness = spawn_harness(BuildMachineConfig::default());
    let mut build = sample_build("main.js", 10.0);
    build.upsert_file("helper.js", "// helpers", "replicad");
    seed(&harness.store, &build).await;

    harness
        .handle
        .send(BuildCommand::LoadBuild {
            id: build.id.clone(),
        })
        .await;
    wait_for_event(&mut harness.events, |e| {
        matches!(e, BuildEvent::Cad(CadEvent::GeometryReady { .. }))
    })
    .await;
    assert_eq!(harness.calls.lock().unwrap().len(), 1);

    // Preview off: editing a non-main file does not reach the CAD machine.
    harness
        .handle
        .send(BuildCommand::UpdateFile {
            path: "helper.js".to_string(),
            content: "// helpers v2".to_string(),
        })
        .await;
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(harness.calls.lock().unwrap().len(), 1);

    // Preview off: editing the main file does.
    harness
        .handle
        .send(BuildCommand::UpdateFile {
            path: "main.js".to_string(),
            content: "// main v2".to_string(),
        })
        .await;
    wait_for_event(&mut harness.events, |e| {
        matches!(e, BuildEvent::Cad(CadEvent::GeometryReady { .. }))
    })
    .await;
    {
        let calls = harness.calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].filename, "main.js");
    }

    // Preview on: any edited file is pushed.
    harness
        .handle
        .send(BuildCommand::SetPreview { enabled: true })
        .await;
    harness
        .handle
        .send(BuildCommand::UpdateFile {
            path: "helper.js".to_string(),
            content: "// helpers v3".to_string(),
        })
        .await;
    wait_for_event(&mut harness.events, |e| {
        matches!(e, BuildEvent::Cad(CadEvent::GeometryReady { .. }))
    })
    .await;
    {
        let calls = harness.calls.lock().unwrap();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[2].filename, "helper.js");
    }
}

#[tokio::test(start_paused = true)]
async fn chat_first_message_triggers_auto_naming() {
    let mut config = BuildMachineConfig::default();
    config.auto_load_model = false;
    let mut harness = spawn_harness(config);
    let build = sample_build("a.js", 10.0);
    seed(&harness.store, &build).await;

    harness
        .handle
        .send(BuildCommand::LoadBuild {
            id: build.id.clone(),
        })
        .await;
    harness.handle.wait_for_state(BuildState::Ready).await;

    harness.handle.send(BuildCommand::AddChat).await;
    let chat_id = match wait_for_event(&mut harness.events, |e| {
        matches!(e, BuildEvent::ChatAdded { .. })
    })
    .await
    {
        BuildEvent::ChatAdded { chat_id } => chat_id,
        _ => unreachable!(),
    };

    harness
        .handle
        .send(BuildCommand::AppendChatMessage {
            chat_id: chat_id.clone(),
            message: serde_json::json!({"role": "user", "text": "make a hinge"}),
        })
        .await;

    let renamed = wait_for_event(&mut harness.events, |e| {
        matches!(e, BuildEvent::ChatRenamed { .. })
    })
    .await;
    match renamed {
        BuildEvent::ChatRenamed { name, .. } => assert_eq!(name, "Bracket hinge"),
        _ => unreachable!(),
    }

    // The rename reaches the store with the next debounced write.
    wait_for_event(&mut harness.events, |e| {
        matches!(e, BuildEvent::BuildUpdated { .. })
    })
    .await;
    let stored = harness.store.get_build(&build.id).await.unwrap();
    assert_eq!(stored.chats[0].name, "Bracket hinge");
    assert_eq!(stored.chats[0].messages.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn thumbnail_capture_persists_without_touching_updated_at() {
    let mut config = BuildMachineConfig::default();
    config.auto_load_model = false;
    let mut harness = spawn_harness(config);
    let build = sample_build("a.js", 10.0);
    let original_updated_at = build.updated_at;
    seed(&harness.store, &build).await;

    harness
        .handle
        .send(BuildCommand::LoadBuild {
            id: build.id.clone(),
        })
        .await;
    harness.handle.wait_for_state(BuildState::Ready).await;

    harness
        .handle
        .send(BuildCommand::ThumbnailCaptured {
            data_url: "data:image/png;base64,AAAA".to_string(),
        })
        .await;
    wait_for_event(&mut harness.events, |e| {
        matches!(e, BuildEvent::BuildUpdated { .. })
    })
    .await;

    let stored = harness.store.get_build(&build.id).await.unwrap();
    assert!(stored.thumbnail.is_some());
    assert_eq!(stored.updated_at, original_updated_at);
}

#[tokio::test(start_paused = true)]
async fn identical_content_write_is_skipped() {
    let mut config = BuildMachineConfig::default();
    config.auto_load_model = false;
    let mut harness = spawn_harness(config);
    let build = sample_build("a.js", 10.0);
    seed(&harness.store, &build).await;

    harness
        .handle
        .send(BuildCommand::LoadBuild {
            id: build.id.clone(),
        })
        .await;
    harness.handle.wait_for_state(BuildState::Ready).await;

    harness
        .handle
        .send(BuildCommand::SetTags {
            tags: vec!["cad".to_string()],
        })
        .await;
    wait_for_event(&mut harness.events, |e| {
        matches!(e, BuildEvent::BuildUpdated { .. })
    })
    .await;
    let writes_after_first = harness.store.update_count();

    // The same tags again: the debounce fires but the write is skipped
    // because the snapshot digest is unchanged.
    harness
        .handle
        .send(BuildCommand::SetTags {
            tags: vec!["cad".to_string()],
        })
        .await;
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert_eq!(harness.store.update_count(), writes_after_first);
    assert_eq!(harness.handle.storing(), StoringState::Idle);
}

#[tokio::test(start_paused = true)]
async fn load_failure_is_terminal_until_explicit_reload() {
    let mut harness = spawn_harness(BuildMachineConfig::default());
    let build = sample_build("a.js", 10.0);
    seed(&harness.store, &build).await;

    let missing = BuildId::new();
    harness
        .handle
        .send(BuildCommand::LoadBuild {
            id: missing.clone(),
        })
        .await;
    wait_for_event(&mut harness.events, |e| {
        matches!(e, BuildEvent::LoadFailed { id, .. } if *id == missing)
    })
    .await;
    assert_eq!(harness.handle.state(), BuildState::Failed);

    // Mutations are ignored while failed.
    harness
        .handle
        .send(BuildCommand::Rename {
            name: "ghost".to_string(),
        })
        .await;

    // An explicit reload with a valid id recovers.
    harness
        .handle
        .send(BuildCommand::LoadBuild {
            id: build.id.clone(),
        })
        .await;
    harness.handle.wait_for_state(BuildState::Ready).await;
    let snapshot = harness.handle.snapshot().await.unwrap();
    assert_eq!(snapshot.build.unwrap().name, "bracket");
}

#[tokio::test(start_paused = true)]
async fn inert_machine_ignores_commands() {
    let mut config = BuildMachineConfig::default();
    config.interactive = false;
    let harness = spawn_harness(config);
    let build = sample_build("a.js", 10.0);
    seed(&harness.store, &build).await;

    harness.handle.wait_for_state(BuildState::Inert).await;
    harness
        .handle
        .send(BuildCommand::LoadBuild {
            id: build.id.clone(),
        })
        .await;
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(harness.handle.state(), BuildState::Inert);
}

#[tokio::test(start_paused = true)]
async fn filesystem_mirror_failures_are_swallowed() {
    let mut config = BuildMachineConfig::default();
    config.auto_load_model = false;
    let mut harness = spawn_harness(config);
    let build = sample_build("a.js", 10.0);
    seed(&harness.store, &build).await;

    harness
        .handle
        .send(BuildCommand::LoadBuild {
            id: build.id.clone(),
        })
        .await;
    harness.handle.wait_for_state(BuildState::Ready).await;

    harness.fs.set_failing(true);
    harness
        .handle
        .send(BuildCommand::UpdateFile {
            path: "a.js".to_string(),
            content: "// v2".to_string(),
        })
        .await;

    // The operation still completes: file event, then a persisted write.
    wait_for_event(&mut harness.events, |e| {
        matches!(e, BuildEvent::FileWritten { path } if path == "a.js")
    })
    .await;
    wait_for_event(&mut harness.events, |e| {
        matches!(e, BuildEvent::BuildUpdated { .. })
    })
    .await;

    let stored = harness.store.get_build(&build.id).await.unwrap();
    assert_eq!(
        stored.assets.mechanical.unwrap().files["a.js"],
        "// v2"
    );
    assert_eq!(harness.handle.state(), BuildState::Ready);
}
