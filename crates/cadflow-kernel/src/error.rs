//! Kernel error taxonomy and failure normalization
//!
//! Every failure crossing the worker boundary is normalized into a
//! [`KernelError`]: message, coarse category, optional raw stack, optional
//! parsed frames, and a primary source location. The normalization is
//! total: no input can make the error-formatting step itself fail.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Coarse failure category for worker errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Source failed to parse or load
    Compilation,
    /// Thrown during entry-point execution
    Runtime,
    /// Geometry-engine-level failure (e.g. invalid boolean operation)
    Kernel,
    /// Export requested before any successful compute for that geometry id
    NotComputed,
    /// Export format the worker does not support
    UnsupportedFormat,
    Unknown,
}

/// One parsed call-stack frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackFrame {
    pub file: String,
    pub function: String,
    pub line: u32,
    pub column: u32,
    /// Set by the engine when the frame is inside the user entry function.
    /// The primary error location prefers such frames.
    pub in_entry_point: bool,
}

/// Structured failure descriptor relayed across the worker boundary.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("{message}")]
pub struct KernelError {
    pub kind: ErrorKind,
    pub message: String,
    pub stack: Option<String>,
    pub stack_frames: Option<Vec<StackFrame>>,
    pub start_line_number: u32,
    pub start_column: u32,
}

impl KernelError {
    /// Plain error with no location information.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            stack: None,
            stack_frames: None,
            start_line_number: 0,
            start_column: 0,
        }
    }

    /// Export-before-compute failure for a geometry id.
    pub fn not_computed(geometry_id: &str) -> Self {
        Self::new(
            ErrorKind::NotComputed,
            format!("No computed geometry for id '{geometry_id}', run a compute first"),
        )
    }

    /// Named failure for an export format the worker cannot produce.
    pub fn unsupported_format(format: &str) -> Self {
        Self::new(
            ErrorKind::UnsupportedFormat,
            format!("Unsupported export format: '{format}'"),
        )
    }
}

/// A failure payload as thrown/rejected by worker-side code.
///
/// Mirrors what untrusted code can actually throw: a structured error
/// carrying a stack, a bare string, or anything else.
#[derive(Debug, Clone)]
pub enum FailurePayload {
    /// Structured error object with a message and raw call stack
    Structured { message: String, stack: String },
    /// Bare string throw; becomes the message verbatim
    Text(String),
    /// Anything else; the caller-supplied fallback message is used
    Opaque,
}

/// Normalize an arbitrary failure payload into a [`KernelError`].
///
/// Total: every input maps to a well-formed error. Structured payloads get
/// their stack parsed into frames; the primary location prefers a frame
/// inside the entry point, else the first frame, else (0, 0).
pub fn normalize_failure(
    payload: FailurePayload,
    kind: ErrorKind,
    fallback_message: &str,
    entry_point_names: &[&str],
) -> KernelError {
    match payload {
        FailurePayload::Structured { message, stack } => {
            let frames = parse_stack_frames(&stack, entry_point_names);
            let (line, column) = primary_location(&frames);
            KernelError {
                kind,
                message,
                stack: Some(stack),
                stack_frames: if frames.is_empty() {
                    None
                } else {
                    Some(frames)
                },
                start_line_number: line,
                start_column: column,
            }
        }
        FailurePayload::Text(message) => KernelError::new(kind, message),
        FailurePayload::Opaque => KernelError::new(kind, fallback_message),
    }
}

/// Convert a caught panic payload into a [`KernelError`].
///
/// Used by the worker host so a panic in worker code never crosses the
/// boundary as an unwind.
pub fn normalize_panic(payload: Box<dyn std::any::Any + Send>, fallback_message: &str) -> KernelError {
    let failure = if let Some(text) = payload.downcast_ref::<&str>() {
        FailurePayload::Text((*text).to_string())
    } else if let Some(text) = payload.downcast_ref::<String>() {
        FailurePayload::Text(text.clone())
    } else {
        FailurePayload::Opaque
    };
    normalize_failure(failure, ErrorKind::Runtime, fallback_message, &[])
}

/// Pick the primary (line, column) from parsed frames: entry-point frame
/// first, else the first frame, else (0, 0).
fn primary_location(frames: &[StackFrame]) -> (u32, u32) {
    if let Some(frame) = frames.iter().find(|f| f.in_entry_point) {
        return (frame.line, frame.column);
    }
    if let Some(frame) = frames.first() {
        return (frame.line, frame.column);
    }
    (0, 0)
}

/// Parse a raw call stack into frames.
///
/// Accepts the two layouts worker runtimes emit:
/// - `at func (file:line:col)` / `at file:line:col`
/// - `func@file:line:col`
///
/// Unparseable lines are skipped; parsing never fails.
pub fn parse_stack_frames(stack: &str, entry_point_names: &[&str]) -> Vec<StackFrame> {
    stack
        .lines()
        .filter_map(|line| parse_frame_line(line.trim()))
        .map(|mut frame| {
            frame.in_entry_point = entry_point_names.contains(&frame.function.as_str());
            frame
        })
        .collect()
}

fn parse_frame_line(line: &str) -> Option<StackFrame> {
    if let Some(rest) = line.strip_prefix("at ") {
        // "at func (file:line:col)" or "at file:line:col"
        if let Some(open) = rest.find('(') {
            let function = rest[..open].trim().to_string();
            let location = rest[open + 1..].trim_end_matches(')');
            let (file, line_no, column) = split_location(location)?;
            return Some(StackFrame {
                file,
                function,
                line: line_no,
                column,
                in_entry_point: false,
            });
        }
        let (file, line_no, column) = split_location(rest.trim())?;
        return Some(StackFrame {
            file,
            function: String::new(),
            line: line_no,
            column,
            in_entry_point: false,
        });
    }

    // "func@file:line:col"
    if let Some(at) = line.find('@') {
        let function = line[..at].to_string();
        let (file, line_no, column) = split_location(&line[at + 1..])?;
        return Some(StackFrame {
            file,
            function,
            line: line_no,
            column,
            in_entry_point: false,
        });
    }

    None
}

/// Split "file:line:col" from the right, so file paths containing colons
/// (e.g. URLs) survive.
fn split_location(location: &str) -> Option<(String, u32, u32)> {
    let (rest, column) = location.rsplit_once(':')?;
    let (file, line) = rest.rsplit_once(':')?;
    Some((file.to_string(), line.parse().ok()?, column.parse().ok()?))
}
