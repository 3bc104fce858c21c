//! CAD machine orchestration tests: debounce coalescing, stale-result
//! rejection, schema capture, export flow, and error recovery.
//!
//! All tests run with paused time, so the debounce windows elapse
//! deterministically without real waiting.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;

use cadflow_core::{
    spawn_cad_machine, CadCommand, CadEvent, CadMachineConfig, CadMachineHandle, CadState,
    SceneUpdate,
};
use cadflow_kernel::testing::{ComputeCall, ScriptedBehavior, ScriptedWorker};
use cadflow_kernel::{CadWorker, ErrorKind, GeometryFile, GeometryId, ParameterMap};

type CallLog = Arc<Mutex<Vec<ComputeCall>>>;

struct Harness {
    cad: CadMachineHandle,
    events: mpsc::Receiver<CadEvent>,
    scene: mpsc::Receiver<SceneUpdate>,
    calls: CallLog,
}

fn spawn_harness(behavior: ScriptedBehavior) -> Harness {
    let calls: CallLog = Arc::new(Mutex::new(Vec::new()));
    let factory_calls = Arc::clone(&calls);
    let factory = Box::new(move || {
        Box::new(
            ScriptedWorker::new(behavior.clone())
                .with_shared_call_log(Arc::clone(&factory_calls)),
        ) as Box<dyn CadWorker>
    });

    let (scene_tx, scene_rx) = mpsc::channel(16);
    let (events_tx, events_rx) = mpsc::channel(64);
    let cad = spawn_cad_machine(
        factory,
        CadMachineConfig::new(GeometryId::new("test-geometry")),
        scene_tx,
        events_tx,
    );

    Harness {
        cad,
        events: events_rx,
        scene: scene_rx,
        calls,
    }
}

fn params(width: f64) -> ParameterMap {
    let mut map = BTreeMap::new();
    map.insert("width".to_string(), serde_json::json!(width));
    map
}

fn model_file() -> GeometryFile {
    GeometryFile::new("a.js", "import { draw } from 'replicad'; export const main = () => {}")
}

async fn init_model(harness: &Harness, width: f64) {
    harness
        .cad
        .send(CadCommand::InitializeModel {
            file: model_file(),
            parameters: Some(params(width)),
        })
        .await;
    harness.cad.wait_for_state(CadState::Ready).await;
}

#[tokio::test(start_paused = true)]
async fn full_model_cycle_reaches_ready_with_geometry() {
    let harness = spawn_harness(ScriptedBehavior::default());
    init_model(&harness, 10.0).await;

    let calls = harness.calls.lock().unwrap().clone();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].parameters["width"], serde_json::json!(10.0));

    let snapshot = harness.cad.snapshot().await.unwrap();
    assert_eq!(snapshot.state, CadState::Ready);
    assert_eq!(snapshot.geometry_count, 1);
    assert_eq!(snapshot.parameters["width"], serde_json::json!(10.0));
}

#[tokio::test(start_paused = true)]
async fn parameter_schema_captured_on_initialization() {
    let mut behavior = ScriptedBehavior::default();
    behavior.default_parameters = params(5.0);
    let mut harness = spawn_harness(behavior);

    harness
        .cad
        .send(CadCommand::InitializeModel {
            file: model_file(),
            parameters: None,
        })
        .await;
    harness.cad.wait_for_state(CadState::Ready).await;

    let snapshot = harness.cad.snapshot().await.unwrap();
    assert_eq!(
        snapshot.default_parameters["width"],
        serde_json::json!(5.0)
    );
    assert_eq!(
        snapshot.parameter_schema["properties"]["width"]["type"],
        "number"
    );
    // With no explicit parameters, the defaults drive the compute.
    assert_eq!(snapshot.parameters["width"], serde_json::json!(5.0));

    let mut saw_initialized = false;
    while let Ok(event) = harness.events.try_recv() {
        if let CadEvent::ModelInitialized { defaults, .. } = event {
            assert_eq!(defaults["width"], serde_json::json!(5.0));
            saw_initialized = true;
        }
    }
    assert!(saw_initialized);
}

#[tokio::test(start_paused = true)]
async fn rapid_parameter_edits_coalesce_into_one_compute() {
    let harness = spawn_harness(ScriptedBehavior::default());
    init_model(&harness, 10.0).await;

    for width in [11.0, 12.0, 13.0] {
        harness
            .cad
            .send(CadCommand::SetParameters {
                parameters: params(width),
            })
            .await;
    }
    harness.cad.wait_for_state(CadState::Ready).await;

    let calls = harness.calls.lock().unwrap().clone();
    // Initial compute plus exactly one coalesced compute.
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[1].parameters["width"], serde_json::json!(13.0));
}

#[tokio::test(start_paused = true)]
async fn cross_category_edit_switches_debounce_class() {
    let harness = spawn_harness(ScriptedBehavior::default());
    init_model(&harness, 10.0).await;

    // File edit arms the slow window; the parameter edit right after
    // cancels it and takes the fast window. One compute covers both.
    harness
        .cad
        .send(CadCommand::UpdateFile {
            file: GeometryFile::new("a.js", "// edited"),
        })
        .await;
    harness
        .cad
        .send(CadCommand::SetParameters {
            parameters: params(20.0),
        })
        .await;
    harness.cad.wait_for_state(CadState::Ready).await;

    let calls = harness.calls.lock().unwrap().clone();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[1].parameters["width"], serde_json::json!(20.0));
}

#[tokio::test(start_paused = true)]
async fn stale_compute_result_never_overwrites_current_state() {
    let mut behavior = ScriptedBehavior::default();
    behavior.compute_delay = Some(Duration::from_millis(200));
    let mut harness = spawn_harness(behavior);

    harness
        .cad
        .send(CadCommand::InitializeModel {
            file: model_file(),
            parameters: Some(params(10.0)),
        })
        .await;
    harness.cad.wait_for_state(CadState::Initializing).await;

    // Wait until the first compute has actually started (its result is
    // still 200ms away), then supersede it with a new file.
    while harness.calls.lock().unwrap().is_empty() {
        tokio::task::yield_now().await;
    }
    harness
        .cad
        .send(CadCommand::UpdateFile {
            file: GeometryFile::new("b.js", "import { draw } from 'replicad'; // v2"),
        })
        .await;
    harness.cad.wait_for_state(CadState::Ready).await;

    // Both computes ran, but only the second produced a scene update.
    let calls = harness.calls.lock().unwrap().clone();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].filename, "a.js");
    assert_eq!(calls[1].filename, "b.js");

    let mut updates = Vec::new();
    while let Ok(update) = harness.scene.try_recv() {
        updates.push(update);
    }
    assert_eq!(updates.len(), 1);
    let payload: serde_json::Value =
        serde_json::from_slice(&updates[0].geometries[0].payload).unwrap();
    assert_eq!(payload["file"], "b.js");

    let snapshot = harness.cad.snapshot().await.unwrap();
    assert_eq!(snapshot.current_file.unwrap().filename, "b.js");
}

#[tokio::test(start_paused = true)]
async fn export_before_compute_fails_with_not_computed() {
    let mut harness = spawn_harness(ScriptedBehavior::default());
    harness.cad.wait_for_state(CadState::Ready).await;

    harness
        .cad
        .send(CadCommand::ExportGeometry {
            format: "gltf".into(),
        })
        .await;

    loop {
        match harness.events.recv().await.unwrap() {
            CadEvent::ExportFailed(error) => {
                assert_eq!(error.kind, ErrorKind::NotComputed);
                break;
            }
            CadEvent::KernelLog(_) => continue,
            other => panic!("expected ExportFailed, got {other:?}"),
        }
    }
}

#[tokio::test(start_paused = true)]
async fn export_after_compute_updates_exported_blob() {
    let mut harness = spawn_harness(ScriptedBehavior::default());
    init_model(&harness, 10.0).await;

    harness
        .cad
        .send(CadCommand::ExportGeometry {
            format: "step".into(),
        })
        .await;

    loop {
        match harness.events.recv().await.unwrap() {
            CadEvent::GeometryExported(blob) => {
                assert_eq!(blob.format, "step");
                break;
            }
            CadEvent::KernelLog(_) | CadEvent::ModelInitialized { .. } | CadEvent::GeometryReady { .. } => {
                continue
            }
            other => panic!("expected GeometryExported, got {other:?}"),
        }
    }

    let snapshot = harness.cad.snapshot().await.unwrap();
    assert_eq!(snapshot.exported_blob.unwrap().format, "step");
}

#[tokio::test(start_paused = true)]
async fn export_is_allowed_from_error_state() {
    let mut behavior = ScriptedBehavior::default();
    behavior.fail_above_width = Some(100.0);
    let mut harness = spawn_harness(behavior);
    init_model(&harness, 10.0).await;

    // Drive the machine into Error with an out-of-range edit.
    harness
        .cad
        .send(CadCommand::SetParameters {
            parameters: params(999.0),
        })
        .await;
    harness.cad.wait_for_state(CadState::Error).await;

    // Export still serves the last successful geometry from Error.
    harness
        .cad
        .send(CadCommand::ExportGeometry {
            format: "gltf".into(),
        })
        .await;
    loop {
        match harness.events.recv().await.unwrap() {
            CadEvent::GeometryExported(blob) => {
                assert_eq!(blob.format, "gltf");
                break;
            }
            CadEvent::ExportFailed(error) => panic!("export failed: {error}"),
            _ => continue,
        }
    }

    // Export does not alter the machine state.
    let snapshot = harness.cad.snapshot().await.unwrap();
    assert_eq!(snapshot.state, CadState::Error);
}

#[tokio::test(start_paused = true)]
async fn compute_failure_enters_error_and_edit_recovers() {
    let mut behavior = ScriptedBehavior::default();
    behavior.fail_next_computes = 1;
    let mut harness = spawn_harness(behavior);

    harness
        .cad
        .send(CadCommand::InitializeModel {
            file: model_file(),
            parameters: Some(params(10.0)),
        })
        .await;
    harness.cad.wait_for_state(CadState::Error).await;

    let mut saw_failure = false;
    while let Ok(event) = harness.events.try_recv() {
        if let CadEvent::KernelFailed(error) = event {
            assert_eq!(error.kind, ErrorKind::Runtime);
            saw_failure = true;
        }
    }
    assert!(saw_failure);

    let snapshot = harness.cad.snapshot().await.unwrap();
    assert!(snapshot.kernel_error.is_some());

    // A new edit leaves the error state and computes successfully.
    harness
        .cad
        .send(CadCommand::SetParameters {
            parameters: params(11.0),
        })
        .await;
    harness.cad.wait_for_state(CadState::Ready).await;

    let snapshot = harness.cad.snapshot().await.unwrap();
    assert!(snapshot.kernel_error.is_none());
    assert_eq!(snapshot.geometry_count, 1);
}

#[tokio::test(start_paused = true)]
async fn extract_failure_surfaces_as_compilation_error() {
    let mut behavior = ScriptedBehavior::default();
    behavior.fail_extract = true;
    let mut harness = spawn_harness(behavior);

    harness
        .cad
        .send(CadCommand::InitializeModel {
            file: model_file(),
            parameters: None,
        })
        .await;
    harness.cad.wait_for_state(CadState::Error).await;

    loop {
        match harness.events.recv().await.unwrap() {
            CadEvent::KernelFailed(error) => {
                assert_eq!(error.kind, ErrorKind::Compilation);
                assert!(error.message.contains("a.js"));
                break;
            }
            CadEvent::KernelLog(_) => continue,
            other => panic!("expected KernelFailed, got {other:?}"),
        }
    }

    // No compute was attempted for the broken source.
    assert!(harness.calls.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn worker_logs_are_relayed_as_events() {
    let mut harness = spawn_harness(ScriptedBehavior::default());
    init_model(&harness, 10.0).await;

    let mut saw_log = false;
    while let Ok(event) = harness.events.try_recv() {
        if let CadEvent::KernelLog(line) = event {
            assert_eq!(line.origin, "scripted");
            saw_log = true;
        }
    }
    assert!(saw_log);
}

#[tokio::test(start_paused = true)]
async fn model_arriving_before_kernel_ready_is_deferred() {
    // InitializeModel is sent immediately after spawn, while kernel init
    // is still in flight; the machine must hold it and run it on
    // kernelInitialized.
    let harness = spawn_harness(ScriptedBehavior::default());
    harness
        .cad
        .send(CadCommand::InitializeModel {
            file: model_file(),
            parameters: Some(params(10.0)),
        })
        .await;
    harness.cad.wait_for_state(CadState::Ready).await;

    let calls = harness.calls.lock().unwrap().clone();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].parameters["width"], serde_json::json!(10.0));
}
