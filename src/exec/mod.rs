//! Supervised code execution against the kernel pool.

mod supervisor;
mod types;

pub use supervisor::Supervisor;
pub use types::{
    Artifact, ArtifactKind, ExecChunk, ExecError, ExecStatus, ExecutionRequest, ExecutionResult,
};
