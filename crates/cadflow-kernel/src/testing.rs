//! Scripted worker for orchestration tests
//!
//! `ScriptedWorker` is a deterministic `CadWorker` implementation with a
//! real geometry cache and injectable behavior: canned parameter
//! declarations, delayed or failing computes, per-shape conversion drops,
//! and panics. It gives the machines everything the protocol promises
//! without a JS engine behind it.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use crate::cache::GeometryCache;
use crate::error::{ErrorKind, KernelError};
use crate::protocol::{
    schema_for_defaults, CadWorker, ExportedBlob, Geometry, GeometryFile, GeometryId, LogLevel,
    LogLine, LogSender, ParameterExtraction, ParameterMap, WorkerOptions, WorkerProfile,
};
use crate::sniff::detect_module_format;

/// One recorded `compute_geometry` invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct ComputeCall {
    pub filename: String,
    pub parameters: ParameterMap,
    pub geometry_id: String,
}

/// Behavior knobs for the scripted worker.
#[derive(Debug, Clone)]
pub struct ScriptedBehavior {
    /// Parameter declaration reported by `extract_parameters`
    pub default_parameters: ParameterMap,
    /// Fail `initialize` with a kernel error
    pub fail_initialize: bool,
    /// Fail `extract_parameters` with a compilation error
    pub fail_extract: bool,
    /// Fail this many upcoming computes with a runtime error
    pub fail_next_computes: u32,
    /// Fail computes whose "width" parameter exceeds this value
    pub fail_above_width: Option<f64>,
    /// Sleep before serving each compute (for stale-result tests)
    pub compute_delay: Option<Duration>,
    /// Shapes produced per compute
    pub shapes_per_compute: usize,
    /// 1-based index of a shape whose conversion "fails" and is dropped
    pub failing_shape: Option<usize>,
    /// Formats `export_geometry` accepts
    pub supported_export_formats: Vec<String>,
    /// Panic inside `compute_geometry` (exercises the host boundary)
    pub panic_on_compute: bool,
}

impl Default for ScriptedBehavior {
    fn default() -> Self {
        Self {
            default_parameters: BTreeMap::new(),
            fail_initialize: false,
            fail_extract: false,
            fail_next_computes: 0,
            fail_above_width: None,
            compute_delay: None,
            shapes_per_compute: 1,
            failing_shape: None,
            supported_export_formats: vec!["gltf".into(), "step".into(), "stl".into()],
            panic_on_compute: false,
        }
    }
}

/// Deterministic in-process `CadWorker`.
pub struct ScriptedWorker {
    profile: WorkerProfile,
    behavior: ScriptedBehavior,
    cache: GeometryCache,
    logs: Option<LogSender>,
    calls: Arc<Mutex<Vec<ComputeCall>>>,
}

impl ScriptedWorker {
    pub fn new(behavior: ScriptedBehavior) -> Self {
        Self {
            profile: WorkerProfile::new("scripted")
                .with_extensions(["js"])
                .with_library_markers(["replicad"]),
            behavior,
            cache: GeometryCache::default(),
            logs: None,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// With a bounded cache capacity (for eviction tests).
    pub fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.cache = GeometryCache::new(capacity);
        self
    }

    /// Record compute calls into an externally owned log. Lets a factory
    /// that creates workers on demand share one log across instances.
    pub fn with_shared_call_log(mut self, calls: Arc<Mutex<Vec<ComputeCall>>>) -> Self {
        self.calls = calls;
        self
    }

    /// Shared record of every compute call served.
    pub fn call_log(&self) -> Arc<Mutex<Vec<ComputeCall>>> {
        Arc::clone(&self.calls)
    }

    fn log(&self, level: LogLevel, message: impl Into<String>) {
        if let Some(logs) = &self.logs {
            let _ = logs.send(LogLine {
                level,
                origin: self.profile.name.clone(),
                message: message.into(),
            });
        }
    }
}

#[async_trait]
impl CadWorker for ScriptedWorker {
    fn profile(&self) -> &WorkerProfile {
        &self.profile
    }

    async fn initialize(
        &mut self,
        logs: LogSender,
        _options: WorkerOptions,
    ) -> Result<(), KernelError> {
        if self.behavior.fail_initialize {
            return Err(KernelError::new(
                ErrorKind::Kernel,
                "engine failed to load",
            ));
        }
        self.logs = Some(logs);
        self.log(LogLevel::Info, "engine initialized");
        Ok(())
    }

    async fn extract_parameters(
        &mut self,
        file: &GeometryFile,
    ) -> Result<ParameterExtraction, KernelError> {
        if self.behavior.fail_extract {
            return Err(KernelError::new(
                ErrorKind::Compilation,
                format!("Unexpected token in {}", file.filename),
            ));
        }
        if self.behavior.default_parameters.is_empty() {
            return Ok(ParameterExtraction::empty());
        }
        Ok(ParameterExtraction {
            default_parameters: self.behavior.default_parameters.clone(),
            json_schema: schema_for_defaults(&self.behavior.default_parameters),
        })
    }

    async fn compute_geometry(
        &mut self,
        file: &GeometryFile,
        parameters: &ParameterMap,
        geometry_id: &GeometryId,
    ) -> Result<Vec<Geometry>, KernelError> {
        if self.behavior.panic_on_compute {
            panic!("scripted compute panic");
        }

        // Recorded at request start so tests can synchronize on "compute
        // began" even when a delay is configured.
        self.calls.lock().unwrap().push(ComputeCall {
            filename: file.filename.clone(),
            parameters: parameters.clone(),
            geometry_id: geometry_id.0.clone(),
        });

        let module_format = detect_module_format(&file.content);
        self.log(
            LogLevel::Debug,
            format!("loading {} as {module_format:?}", file.filename),
        );

        if let Some(delay) = self.behavior.compute_delay {
            tokio::time::sleep(delay).await;
        }

        if self.behavior.fail_next_computes > 0 {
            self.behavior.fail_next_computes -= 1;
            return Err(KernelError::new(
                ErrorKind::Runtime,
                "scripted compute failure",
            ));
        }

        if let Some(limit) = self.behavior.fail_above_width {
            let width = parameters.get("width").and_then(|v| v.as_f64());
            if width.map(|w| w > limit).unwrap_or(false) {
                return Err(KernelError::new(
                    ErrorKind::Kernel,
                    "width exceeds printable volume",
                ));
            }
        }

        let mut shapes = Vec::new();
        for index in 1..=self.behavior.shapes_per_compute {
            if self.behavior.failing_shape == Some(index) {
                // Partial-success policy: drop the failing shape, keep going.
                self.log(
                    LogLevel::Warn,
                    format!("shape {index} failed conversion, dropping"),
                );
                warn!(shape = index, "shape conversion failed, dropped");
                continue;
            }
            let payload = serde_json::json!({
                "file": file.filename,
                "parameters": parameters,
                "shape": index,
            });
            shapes.push(Geometry {
                format: "gltf".into(),
                payload: serde_json::to_vec(&payload).unwrap_or_default(),
            });
        }

        self.cache.put(geometry_id.0.clone(), shapes.clone());
        Ok(shapes)
    }

    async fn export_geometry(
        &mut self,
        format: &str,
        geometry_id: &GeometryId,
    ) -> Result<ExportedBlob, KernelError> {
        if !self
            .behavior
            .supported_export_formats
            .iter()
            .any(|f| f == format)
        {
            return Err(KernelError::unsupported_format(format));
        }

        let shapes = self
            .cache
            .get(geometry_id.as_str())
            .ok_or_else(|| KernelError::not_computed(geometry_id.as_str()))?;

        let mut bytes = Vec::new();
        for shape in shapes {
            bytes.extend_from_slice(&shape.payload);
        }

        Ok(ExportedBlob {
            format: format.to_string(),
            filename: format!("{}.{}", geometry_id.as_str(), format),
            bytes,
        })
    }

    async fn cleanup(&mut self) {
        self.cache.clear();
        self.logs = None;
    }
}
