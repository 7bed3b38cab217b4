//! Request/result types for supervised execution.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One code submission. Never mutated after creation.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    /// Session whose kernel runs the code.
    pub session_id: Uuid,
    /// Code to execute.
    pub code: String,
    /// Wall-clock ceiling for this execution.
    pub timeout: Duration,
    /// Address-space ceiling, applied if this request causes a kernel spawn.
    /// `None` uses the pool default. The ceiling is per-process, set at
    /// creation time, not re-applied per execution.
    pub memory_limit_mb: Option<u64>,
}

impl ExecutionRequest {
    pub fn new(session_id: Uuid, code: impl Into<String>, timeout: Duration) -> Self {
        Self {
            session_id,
            code: code.into(),
            timeout,
            memory_limit_mb: None,
        }
    }
}

/// Terminal status of one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecStatus {
    /// Code ran to completion.
    Ok,
    /// Deadline passed; the kernel was interrupted and restarted.
    Timeout,
    /// Code raised; the exception is in [`ExecutionResult::error`].
    RuntimeError,
    /// The kernel process died (resource ceiling or crash). Restarted on
    /// next acquisition.
    Killed,
}

/// Typed rich output produced during execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub kind: ArtifactKind,
    /// Ordering index within the execution, for deterministic reassembly.
    pub index: usize,
    /// Payload: base64 for images, JSON text for tables, plain text otherwise.
    pub data: String,
}

/// What an artifact's payload contains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Image,
    Table,
    Text,
}

impl ArtifactKind {
    /// Driver kinds map here; anything unrecognized degrades to text.
    pub fn parse(kind: &str) -> Self {
        match kind {
            "image" => ArtifactKind::Image,
            "table" => ArtifactKind::Table,
            _ => ArtifactKind::Text,
        }
    }
}

/// Outcome of one execution. Immutable once produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub status: ExecStatus,
    pub stdout: String,
    pub stderr: String,
    /// Formatted exception type/message/traceback for `RuntimeError`.
    pub error: Option<String>,
    pub artifacts: Vec<Artifact>,
    /// Wall-clock duration of the execution.
    pub duration: Duration,
    /// Whether stdout or stderr hit the output ceiling.
    pub truncated: bool,
}

/// Incremental output delivered by the streaming variant, in production
/// order, followed by the final [`ExecutionResult`].
#[derive(Debug, Clone)]
pub enum ExecChunk {
    Stdout(String),
    Stderr(String),
    Artifact(Artifact),
}

/// Errors the supervisor reports to its caller.
///
/// Timeouts, runtime errors, and kills are not here: those are routine
/// outcomes captured in [`ExecutionResult::status`].
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error(transparent)]
    Kernel(#[from] crate::kernel::KernelError),

    /// The session's cancellation token fired mid-execution.
    #[error("execution cancelled")]
    Cancelled,
}
