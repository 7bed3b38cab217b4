//! Execution supervisor: timeouts, output capture, kernel recovery.
//!
//! The supervisor is the only component that sends code into a kernel or
//! terminates one. It enforces the wall-clock deadline with an escalation
//! ladder (interrupt, grace period, force kill) and always restarts the
//! kernel after a timeout so an interrupted statement cannot leave the
//! interpreter in a half-mutated state.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::ExecSettings;
use crate::exec::types::{
    Artifact, ArtifactKind, ExecChunk, ExecError, ExecStatus, ExecutionRequest, ExecutionResult,
};
use crate::kernel::{DriverStatus, KernelError, KernelMessage, KernelPool, StreamName};

/// Supervises executions against the kernel pool.
pub struct Supervisor {
    pool: Arc<KernelPool>,
    settings: ExecSettings,
    next_id: AtomicU64,
}

/// Accumulates output during one execution, truncating at the ceiling and
/// forwarding chunks to an optional streaming sink.
struct OutputCollector<'a> {
    stdout: String,
    stderr: String,
    artifacts: Vec<Artifact>,
    truncated: bool,
    max_bytes: usize,
    sink: Option<&'a mpsc::Sender<ExecChunk>>,
}

impl<'a> OutputCollector<'a> {
    fn new(max_bytes: usize, sink: Option<&'a mpsc::Sender<ExecChunk>>) -> Self {
        Self {
            stdout: String::new(),
            stderr: String::new(),
            artifacts: Vec::new(),
            truncated: false,
            max_bytes,
            sink,
        }
    }

    async fn stream(&mut self, name: StreamName, text: String) {
        let buf = match name {
            StreamName::Stdout => &mut self.stdout,
            StreamName::Stderr => &mut self.stderr,
        };
        if buf.len() < self.max_bytes {
            let room = self.max_bytes - buf.len();
            if text.len() > room {
                buf.push_str(truncate_to_boundary(&text, room));
                self.truncated = true;
            } else {
                buf.push_str(&text);
            }
        } else {
            self.truncated = true;
        }

        if let Some(sink) = self.sink {
            let chunk = match name {
                StreamName::Stdout => ExecChunk::Stdout(text),
                StreamName::Stderr => ExecChunk::Stderr(text),
            };
            let _ = sink.send(chunk).await;
        }
    }

    async fn artifact(&mut self, kind: String, index: usize, data: String) {
        let artifact = Artifact {
            kind: ArtifactKind::parse(&kind),
            index,
            data,
        };
        if let Some(sink) = self.sink {
            let _ = sink.send(ExecChunk::Artifact(artifact.clone())).await;
        }
        self.artifacts.push(artifact);
    }

    fn finish(
        self,
        status: ExecStatus,
        error: Option<String>,
        started: Instant,
    ) -> ExecutionResult {
        ExecutionResult {
            status,
            stdout: self.stdout,
            stderr: self.stderr,
            error,
            artifacts: self.artifacts,
            duration: started.elapsed(),
            truncated: self.truncated,
        }
    }
}

impl Supervisor {
    pub fn new(pool: Arc<KernelPool>, settings: ExecSettings) -> Self {
        Self {
            pool,
            settings,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn pool(&self) -> &Arc<KernelPool> {
        &self.pool
    }

    /// Execute a request to completion.
    pub async fn execute(&self, req: &ExecutionRequest) -> Result<ExecutionResult, ExecError> {
        self.run(req, None, &CancellationToken::new()).await
    }

    /// Execute with a cancellation token; cancellation interrupts the kernel
    /// rather than waiting for natural completion.
    pub async fn execute_cancellable(
        &self,
        req: &ExecutionRequest,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, ExecError> {
        self.run(req, None, cancel).await
    }

    /// Streaming variant: partial stdout/stderr/artifact chunks are sent to
    /// `sink` as produced, followed by the returned final result.
    pub async fn execute_streaming(
        &self,
        req: &ExecutionRequest,
        sink: mpsc::Sender<ExecChunk>,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, ExecError> {
        self.run(req, Some(&sink), cancel).await
    }

    /// Liveness probe. A kernel that misses the heartbeat deadline is
    /// force-restarted; returns whether the kernel answered.
    pub async fn probe(&self, session_id: Uuid) -> Result<bool, ExecError> {
        let handle = self.pool.acquire(session_id).await?;
        let mut guard = handle.lock().await;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let sent = match guard.as_mut() {
            Some(kernel) => kernel.send_ping(id).await,
            None => return Ok(false),
        };
        if sent.is_err() {
            return self.replace_unresponsive(session_id, &mut guard).await;
        }

        let deadline = tokio::time::Instant::now() + self.settings.heartbeat_timeout;
        loop {
            let read = {
                let kernel = guard.as_mut().expect("kernel present during probe");
                tokio::time::timeout_at(deadline, kernel.read_message()).await
            };
            match read {
                Ok(Ok(KernelMessage::Pong { id: got })) if got == id => {
                    handle.touch();
                    return Ok(true);
                }
                Ok(Ok(_)) => continue,
                Ok(Err(_)) | Err(_) => {
                    return self.replace_unresponsive(session_id, &mut guard).await;
                }
            }
        }
    }

    async fn replace_unresponsive(
        &self,
        session_id: Uuid,
        guard: &mut tokio::sync::MutexGuard<'_, Option<crate::kernel::KernelProcess>>,
    ) -> Result<bool, ExecError> {
        tracing::warn!(%session_id, "Kernel missed heartbeat, restarting");
        if let Some(mut dead) = guard.take() {
            dead.kill().await;
        }
        self.pool.respawn_locked(guard).await?;
        Ok(false)
    }

    async fn run(
        &self,
        req: &ExecutionRequest,
        sink: Option<&mpsc::Sender<ExecChunk>>,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, ExecError> {
        let handle = self
            .pool
            .acquire_with(req.session_id, req.memory_limit_mb)
            .await?;
        let mut guard = handle.lock().await;

        // The kernel can die between acquire and lock (another execution's
        // timeout, resource kill). Respawn rather than failing the request.
        let alive = guard.as_mut().is_some_and(|k| k.is_alive());
        if !alive {
            if let Some(mut dead) = guard.take() {
                dead.kill().await;
            }
            self.pool.respawn_locked(&mut guard).await?;
        }

        let exec_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();
        let mut collector = OutputCollector::new(self.settings.max_output_bytes, sink);

        let send_result = {
            let kernel = guard.as_mut().expect("kernel present after respawn");
            kernel.send_exec(exec_id, &req.code).await
        };
        if let Err(e) = send_result {
            if let Some(mut dead) = guard.take() {
                dead.kill().await;
            }
            return Err(ExecError::Kernel(e));
        }

        let deadline = tokio::time::Instant::now() + req.timeout;
        loop {
            let message = {
                let kernel = guard.as_mut().expect("kernel present during execution");
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    read = tokio::time::timeout_at(deadline, kernel.read_message()) => Some(read),
                }
            };

            let Some(message) = message else {
                tracing::debug!(session_id = %req.session_id, "Execution cancelled");
                self.abort_locked(&mut guard).await;
                return Err(ExecError::Cancelled);
            };

            match message {
                Err(_elapsed) => {
                    tracing::info!(
                        session_id = %req.session_id,
                        timeout = ?req.timeout,
                        "Execution deadline passed, interrupting kernel"
                    );
                    self.abort_locked(&mut guard).await;
                    handle.touch();
                    return Ok(collector.finish(ExecStatus::Timeout, None, started));
                }
                Ok(Err(KernelError::Exited)) => {
                    // Resource ceiling or crash took the process down.
                    if let Some(mut dead) = guard.take() {
                        dead.kill().await;
                    }
                    tracing::warn!(session_id = %req.session_id, "Kernel died during execution");
                    return Ok(collector.finish(ExecStatus::Killed, None, started));
                }
                Ok(Err(e)) => {
                    if let Some(mut dead) = guard.take() {
                        dead.kill().await;
                    }
                    return Err(ExecError::Kernel(e));
                }
                Ok(Ok(KernelMessage::Stream { name, text })) => {
                    collector.stream(name, text).await;
                }
                Ok(Ok(KernelMessage::Artifact { kind, index, data })) => {
                    collector.artifact(kind, index, data).await;
                }
                Ok(Ok(KernelMessage::Result {
                    status,
                    error_type,
                    error,
                    traceback,
                    ..
                })) => {
                    handle.touch();
                    let result = match status {
                        DriverStatus::Ok => collector.finish(ExecStatus::Ok, None, started),
                        DriverStatus::Interrupted => {
                            // Only reachable via an external interrupt; treat
                            // as a timeout-style abort.
                            self.abort_locked(&mut guard).await;
                            collector.finish(ExecStatus::Timeout, None, started)
                        }
                        DriverStatus::Error => {
                            let formatted = format_error(error_type, error, traceback);
                            collector.finish(ExecStatus::RuntimeError, Some(formatted), started)
                        }
                    };
                    return Ok(result);
                }
                Ok(Ok(other)) => {
                    tracing::debug!(?other, "Ignoring out-of-band kernel message");
                }
            }
        }
    }

    /// Interrupt, wait out the grace period for voluntary exit of the
    /// statement, then force kill and replace the kernel. The restart keeps
    /// the session usable; its interpreter state is gone.
    async fn abort_locked(
        &self,
        guard: &mut tokio::sync::MutexGuard<'_, Option<crate::kernel::KernelProcess>>,
    ) {
        let Some(kernel) = guard.as_mut() else { return };
        kernel.interrupt();

        let grace = tokio::time::Instant::now() + self.settings.interrupt_grace;
        loop {
            match tokio::time::timeout_at(grace, kernel.read_message()).await {
                Ok(Ok(KernelMessage::Result { .. })) | Ok(Err(_)) | Err(_) => break,
                Ok(Ok(_)) => continue,
            }
        }

        let mut old = guard.take().expect("kernel present in abort");
        old.kill().await;

        if let Err(e) = self.pool.respawn_locked(guard).await {
            tracing::warn!(error = %e, "Kernel respawn after abort failed; next acquire will retry");
        }
    }
}

/// Longest prefix of `text` that fits in `room` bytes without splitting a
/// character.
fn truncate_to_boundary(text: &str, room: usize) -> &str {
    let mut cut = room.min(text.len());
    while cut > 0 && !text.is_char_boundary(cut) {
        cut -= 1;
    }
    &text[..cut]
}

fn format_error(
    error_type: Option<String>,
    error: Option<String>,
    traceback: Option<String>,
) -> String {
    let header = format!(
        "{}: {}",
        error_type.unwrap_or_else(|| "Error".to_string()),
        error.unwrap_or_default()
    );
    match traceback {
        Some(tb) if !tb.is_empty() => format!("{header}\n{tb}"),
        _ => header,
    }
}
