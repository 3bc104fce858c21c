//! Kernel worker protocol types and the `CadWorker` trait
//!
//! The contract between the orchestration machines and the isolated
//! execution context running untrusted CAD source. All calls are async and
//! return a tagged success/error result; nothing throws across the
//! boundary.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::KernelError;
use crate::sniff::{file_extension, references_library};

/// A CAD source file: filename + content. Ephemeral; never persisted by
/// the kernel layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeometryFile {
    pub filename: String,
    pub content: String,
}

impl GeometryFile {
    pub fn new(filename: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            content: content.into(),
        }
    }
}

/// Caller-supplied key distinguishing independently cached geometry sets
/// within one worker instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GeometryId(pub String);

impl GeometryId {
    pub fn new(id: impl Into<String>) -> Self {
        GeometryId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for GeometryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Parameter name → JSON-compatible value.
pub type ParameterMap = BTreeMap<String, serde_json::Value>;

/// Output artifact of a compute: format tag + opaque binary payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geometry {
    /// Intermediate format tag (e.g. "gltf")
    pub format: String,
    pub payload: Vec<u8>,
}

/// Result of parameter extraction: defaults plus a JSON schema describing
/// them, so the parameter UI can render controls without a second round
/// trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterExtraction {
    pub default_parameters: ParameterMap,
    pub json_schema: serde_json::Value,
}

impl ParameterExtraction {
    /// Extraction result for source declaring no parameters: empty defaults
    /// with a schema introspected from the empty value set.
    pub fn empty() -> Self {
        Self {
            default_parameters: ParameterMap::new(),
            json_schema: schema_for_defaults(&ParameterMap::new()),
        }
    }
}

/// Derive a JSON schema by introspecting a defaults map.
pub fn schema_for_defaults(defaults: &ParameterMap) -> serde_json::Value {
    let mut properties = serde_json::Map::new();
    for (name, value) in defaults {
        let type_name = match value {
            serde_json::Value::Bool(_) => "boolean",
            serde_json::Value::Number(_) => "number",
            serde_json::Value::String(_) => "string",
            serde_json::Value::Array(_) => "array",
            serde_json::Value::Object(_) => "object",
            serde_json::Value::Null => "null",
        };
        properties.insert(
            name.clone(),
            serde_json::json!({ "type": type_name, "default": value }),
        );
    }
    serde_json::json!({ "type": "object", "properties": properties })
}

/// An exported model file produced from cached geometry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportedBlob {
    pub format: String,
    pub filename: String,
    pub bytes: Vec<u8>,
}

/// Severity of a worker log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// A log line emitted by worker-side code, relayed unbuffered to the UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLine {
    pub level: LogLevel,
    /// Which worker variant produced the line
    pub origin: String,
    pub message: String,
}

/// Sender half of the worker's log stream.
pub type LogSender = mpsc::UnboundedSender<LogLine>;

/// Options passed to a worker at initialization.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerOptions {
    /// Relay debug-level engine chatter in addition to warnings/errors
    pub verbose_logs: bool,
}

/// Static selection profile of a worker variant: which files it handles.
#[derive(Debug, Clone)]
pub struct WorkerProfile {
    /// Variant name, used as log origin and for diagnostics
    pub name: String,
    /// Lowercase file extensions this variant accepts unconditionally
    pub extensions: Vec<String>,
    /// Library names whose textual import/require marks a file as ours
    pub library_markers: Vec<String>,
}

impl WorkerProfile {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            extensions: Vec::new(),
            library_markers: Vec::new(),
        }
    }

    pub fn with_extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extensions = extensions.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_library_markers<I, S>(mut self, markers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.library_markers = markers.into_iter().map(Into::into).collect();
        self
    }

    /// Extension match, or textual library marker match.
    pub fn matches(&self, file: &GeometryFile) -> bool {
        if let Some(ext) = file_extension(&file.filename) {
            if self.extensions.iter().any(|e| *e == ext) {
                return true;
            }
        }
        let markers: Vec<&str> = self.library_markers.iter().map(String::as_str).collect();
        !markers.is_empty() && references_library(&file.content, &markers)
    }
}

/// The worker contract. One implementation per CAD DSL variant.
///
/// Implementations run behind the isolation boundary set up by
/// [`spawn_worker`](crate::spawn_worker); the host serializes calls,
/// so `&mut self` access is safe. The actual geometry engine behind
/// `compute_geometry` is a collaborator of the implementation, not of this
/// crate.
#[async_trait]
pub trait CadWorker: Send {
    /// Static selection profile for `can_handle`.
    fn profile(&self) -> &WorkerProfile;

    /// Whether this worker variant should process the file. Pure sniffing,
    /// never executes source.
    fn can_handle(&self, file: &GeometryFile) -> bool {
        self.profile().matches(file)
    }

    /// Load the engine and wire the log stream.
    async fn initialize(
        &mut self,
        logs: LogSender,
        options: WorkerOptions,
    ) -> Result<(), KernelError>;

    /// Read the file's parameter declaration without invoking the
    /// geometry-generating entry point.
    async fn extract_parameters(
        &mut self,
        file: &GeometryFile,
    ) -> Result<ParameterExtraction, KernelError>;

    /// Execute the entry point with the given parameters and convert the
    /// result into intermediate geometry. Per-shape conversion failures
    /// drop the shape with a warn log rather than failing the request; an
    /// empty successful result is success.
    async fn compute_geometry(
        &mut self,
        file: &GeometryFile,
        parameters: &ParameterMap,
        geometry_id: &GeometryId,
    ) -> Result<Vec<Geometry>, KernelError>;

    /// Export previously computed geometry. Fails with `NotComputed` when
    /// no cached shapes exist for the id, and `UnsupportedFormat` for
    /// formats the variant cannot produce.
    async fn export_geometry(
        &mut self,
        format: &str,
        geometry_id: &GeometryId,
    ) -> Result<ExportedBlob, KernelError>;

    /// Release engine resources. Infallible by contract.
    async fn cleanup(&mut self);
}

/// First-match worker selection across registered variants.
pub struct WorkerSelector {
    profiles: Vec<WorkerProfile>,
}

impl WorkerSelector {
    pub fn new(profiles: Vec<WorkerProfile>) -> Self {
        Self { profiles }
    }

    /// Name of the first variant whose profile matches the file.
    pub fn select(&self, file: &GeometryFile) -> Option<&str> {
        self.profiles
            .iter()
            .find(|p| p.matches(file))
            .map(|p| p.name.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn replicad_profile() -> WorkerProfile {
        WorkerProfile::new("replicad")
            .with_extensions(["js", "ts"])
            .with_library_markers(["replicad"])
    }

    fn openscad_profile() -> WorkerProfile {
        WorkerProfile::new("openscad").with_extensions(["scad"])
    }

    #[test]
    fn test_profile_matches_extension() {
        let profile = openscad_profile();
        assert!(profile.matches(&GeometryFile::new("part.scad", "cube(1);")));
        assert!(!profile.matches(&GeometryFile::new("part.js", "cube(1);")));
    }

    #[test]
    fn test_profile_matches_library_marker() {
        let profile = WorkerProfile::new("jscad").with_library_markers(["@jscad/modeling"]);
        let file = GeometryFile::new(
            "model.txt",
            "const { cube } = require(\"@jscad/modeling\").primitives;",
        );
        assert!(profile.matches(&file));
    }

    #[test]
    fn test_selector_first_match_wins() {
        let selector = WorkerSelector::new(vec![replicad_profile(), openscad_profile()]);
        let js = GeometryFile::new("model.js", "import { draw } from 'replicad';");
        assert_eq!(selector.select(&js), Some("replicad"));

        let scad = GeometryFile::new("model.scad", "cube(1);");
        assert_eq!(selector.select(&scad), Some("openscad"));

        let unknown = GeometryFile::new("notes.md", "# nothing");
        assert_eq!(selector.select(&unknown), None);
    }

    #[test]
    fn test_schema_for_defaults_introspects_types() {
        let mut defaults = ParameterMap::new();
        defaults.insert("width".into(), serde_json::json!(10.0));
        defaults.insert("rounded".into(), serde_json::json!(true));
        let schema = schema_for_defaults(&defaults);
        assert_eq!(schema["properties"]["width"]["type"], "number");
        assert_eq!(schema["properties"]["rounded"]["type"], "boolean");
        assert_eq!(schema["properties"]["width"]["default"], 10.0);
    }

    #[test]
    fn test_empty_extraction_has_object_schema() {
        let extraction = ParameterExtraction::empty();
        assert!(extraction.default_parameters.is_empty());
        assert_eq!(extraction.json_schema["type"], "object");
    }
}
