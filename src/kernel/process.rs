//! A single kernel: a persistent Python interpreter owned by one session.
//!
//! The kernel is a child process running an embedded driver that executes
//! code in a persistent namespace and speaks newline-delimited JSON over
//! stdin/stdout. Variables defined by one execution are visible to the next,
//! until the process is restarted or evicted.
//!
//! # Wire protocol
//!
//! ```text
//! host ─▶ kernel   {"type":"exec","id":N,"code":"..."}
//!                  {"type":"ping","id":N}
//! kernel ─▶ host   {"type":"ready"}
//!                  {"type":"stream","name":"stdout","text":"..."}
//!                  {"type":"artifact","kind":"image","index":0,"data":"..."}
//!                  {"type":"result","id":N,"status":"ok"|"error"|"interrupted",...}
//!                  {"type":"pong","id":N}
//! ```

use std::process::Stdio;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

use crate::config::KernelSettings;
use crate::kernel::error::{KernelError, Result};

/// Driver executed inside the kernel process.
///
/// Applies the address-space ceiling once at startup, then loops over exec
/// and ping requests. stdout/stderr of executed code are redirected into
/// `stream` messages; a trailing expression is echoed like a REPL would; the
/// `display()` builtin emits typed artifacts.
const KERNEL_DRIVER: &str = r#"
import ast
import io
import json
import os
import sys
import traceback

_OUT = sys.stdout


def _emit(obj):
    _OUT.write(json.dumps(obj, ensure_ascii=False) + "\n")
    _OUT.flush()


try:
    import resource

    _limit = int(os.environ.get("KILN_KERNEL_MEMORY_BYTES", "0"))
    if _limit > 0:
        resource.setrlimit(resource.RLIMIT_AS, (_limit, _limit))
except (ImportError, ValueError, OSError):
    pass


class _Stream(io.TextIOBase):
    def __init__(self, name):
        self._name = name

    def writable(self):
        return True

    def write(self, text):
        text = str(text)
        if text:
            _emit({"type": "stream", "name": self._name, "text": text})
        return len(text)


_artifact_index = 0


def display(value, kind=None):
    global _artifact_index
    if kind is None:
        if isinstance(value, (bytes, bytearray)):
            kind = "image"
        elif isinstance(value, (dict, list)):
            kind = "table"
        else:
            kind = "text"
    if isinstance(value, (bytes, bytearray)):
        import base64

        data = base64.b64encode(bytes(value)).decode("ascii")
    elif kind == "table":
        data = json.dumps(value, ensure_ascii=False, default=str)
    else:
        data = str(value)
    _emit({"type": "artifact", "kind": kind, "index": _artifact_index, "data": data})
    _artifact_index += 1


_globals = {"__name__": "__main__", "display": display}

sys.stdout = _Stream("stdout")
sys.stderr = _Stream("stderr")

_emit({"type": "ready"})

while True:
    line = sys.stdin.readline()
    if not line:
        break
    try:
        request = json.loads(line)
    except ValueError:
        _emit({
            "type": "result", "id": None, "status": "error",
            "error_type": "ProtocolError", "error": "invalid request",
            "traceback": None,
        })
        continue

    rid = request.get("id")
    if request.get("type") == "ping":
        _emit({"type": "pong", "id": rid})
        continue
    if request.get("type") != "exec":
        _emit({
            "type": "result", "id": rid, "status": "error",
            "error_type": "ProtocolError", "error": "unknown request type",
            "traceback": None,
        })
        continue

    _artifact_index = 0
    code = request.get("code", "")
    try:
        tree = ast.parse(code, "<kiln>", "exec")
        if tree.body and isinstance(tree.body[-1], ast.Expr):
            head = ast.Module(body=tree.body[:-1], type_ignores=[])
            tail = ast.Expression(body=tree.body[-1].value)
            ast.fix_missing_locations(head)
            ast.fix_missing_locations(tail)
            exec(compile(head, "<kiln>", "exec"), _globals, _globals)
            _value = eval(compile(tail, "<kiln>", "eval"), _globals, _globals)
            if _value is not None:
                print(repr(_value))
        else:
            exec(compile(tree, "<kiln>", "exec"), _globals, _globals)
        _emit({
            "type": "result", "id": rid, "status": "ok",
            "error_type": None, "error": None, "traceback": None,
        })
    except KeyboardInterrupt:
        _emit({
            "type": "result", "id": rid, "status": "interrupted",
            "error_type": "KeyboardInterrupt", "error": "execution interrupted",
            "traceback": None,
        })
    except Exception as exc:
        _emit({
            "type": "result", "id": rid, "status": "error",
            "error_type": type(exc).__name__, "error": str(exc),
            "traceback": traceback.format_exc(),
        })
"#;

/// Requests the host sends into a kernel.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum HostMessage<'a> {
    Exec { id: u64, code: &'a str },
    Ping { id: u64 },
}

/// Final status reported by the driver for one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverStatus {
    Ok,
    Error,
    Interrupted,
}

/// Messages a kernel sends back to the host.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum KernelMessage {
    Ready,
    Stream {
        name: StreamName,
        text: String,
    },
    Artifact {
        kind: String,
        index: usize,
        data: String,
    },
    Result {
        id: Option<u64>,
        status: DriverStatus,
        error_type: Option<String>,
        error: Option<String>,
        traceback: Option<String>,
    },
    Pong {
        id: u64,
    },
}

/// Which stream a chunk of output came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamName {
    Stdout,
    Stderr,
}

/// A live kernel process and its stdio pipes.
///
/// Exclusively owned by the pool; the supervisor borrows it through a pool
/// handle for the duration of one execution.
pub struct KernelProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    pid: Option<u32>,
    workdir: tempfile::TempDir,
    created_at: Instant,
}

impl KernelProcess {
    /// Spawn a fresh kernel and wait for it to report ready.
    pub async fn spawn(settings: &KernelSettings) -> Result<Self> {
        let workdir = tempfile::Builder::new()
            .prefix("kiln-kernel-")
            .tempdir()
            .map_err(|e| KernelError::SpawnFailed {
                reason: format!("workdir creation failed: {e}"),
            })?;

        let memory_bytes = settings.memory_limit_mb * 1024 * 1024;

        let mut command = Command::new(&settings.python_command);
        command
            .arg("-u")
            .arg("-c")
            .arg(KERNEL_DRIVER)
            .current_dir(workdir.path())
            .env("KILN_KERNEL_MEMORY_BYTES", memory_bytes.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| KernelError::SpawnFailed {
            reason: format!("`{}`: {e}", settings.python_command),
        })?;

        let stdin = child.stdin.take().ok_or_else(|| KernelError::SpawnFailed {
            reason: "failed to capture kernel stdin".to_string(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| KernelError::SpawnFailed {
            reason: "failed to capture kernel stdout".to_string(),
        })?;

        let pid = child.id();
        let mut kernel = Self {
            child,
            stdin,
            stdout: BufReader::new(stdout),
            pid,
            workdir,
            created_at: Instant::now(),
        };

        // The driver announces itself once the resource ceiling is in place.
        match tokio::time::timeout(settings.spawn_timeout, kernel.read_message()).await {
            Ok(Ok(KernelMessage::Ready)) => {}
            Ok(Ok(other)) => {
                kernel.kill().await;
                return Err(KernelError::Protocol {
                    reason: format!("expected ready, got {other:?}"),
                });
            }
            Ok(Err(e)) => {
                kernel.kill().await;
                return Err(e);
            }
            Err(_) => {
                kernel.kill().await;
                return Err(KernelError::Unresponsive(settings.spawn_timeout));
            }
        }

        tracing::debug!(pid = ?kernel.pid, workdir = %kernel.workdir.path().display(), "Kernel spawned");
        Ok(kernel)
    }

    /// Submit code for execution. The result arrives via [`read_message`].
    pub async fn send_exec(&mut self, id: u64, code: &str) -> Result<()> {
        self.send(&HostMessage::Exec { id, code }).await
    }

    /// Send a liveness ping.
    pub async fn send_ping(&mut self, id: u64) -> Result<()> {
        self.send(&HostMessage::Ping { id }).await
    }

    async fn send(&mut self, msg: &HostMessage<'_>) -> Result<()> {
        let mut line = serde_json::to_vec(msg)?;
        line.push(b'\n');
        self.stdin.write_all(&line).await?;
        self.stdin.flush().await?;
        Ok(())
    }

    /// Read the next message from the kernel. Blocks until one arrives;
    /// callers apply their own deadline.
    pub async fn read_message(&mut self) -> Result<KernelMessage> {
        let mut line = String::new();
        let read = self.stdout.read_line(&mut line).await?;
        if read == 0 {
            return Err(KernelError::Exited);
        }
        serde_json::from_str(line.trim()).map_err(|e| KernelError::Protocol {
            reason: format!("{e}; raw={}", line.trim()),
        })
    }

    /// Deliver a graceful interrupt (SIGINT), raising KeyboardInterrupt in
    /// the executing code. Falls back to a kill if signalling is unavailable.
    pub fn interrupt(&mut self) {
        #[cfg(unix)]
        {
            if let Some(pid) = self.pid {
                // SAFETY: delivering a signal to our own child process.
                unsafe {
                    libc::kill(pid as libc::pid_t, libc::SIGINT);
                }
                return;
            }
        }
        let _ = self.child.start_kill();
    }

    /// Force-terminate the process and reap it.
    pub async fn kill(&mut self) {
        let _ = self.child.start_kill();
        let _ = self.child.wait().await;
    }

    /// Whether the process is still running.
    pub fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// OS process id, if the process has not been reaped.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Working directory given to the kernel (file outputs land here).
    pub fn workdir(&self) -> &std::path::Path {
        self.workdir.path()
    }

    /// How long this kernel has existed.
    pub fn age(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }
}

impl std::fmt::Debug for KernelProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelProcess")
            .field("pid", &self.pid)
            .field("workdir", &self.workdir.path())
            .finish()
    }
}

/// Whether the configured interpreter is present on this machine.
///
/// Tests use this to skip when no `python3` is installed.
pub fn interpreter_available(python_command: &str) -> bool {
    std::process::Command::new(python_command)
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_settings() -> KernelSettings {
        KernelSettings::default()
    }

    fn python_missing() -> bool {
        !interpreter_available("python3")
    }

    #[test]
    fn test_driver_protocol_markers() {
        // The driver must emit every message type the host parses.
        for marker in ["\"ready\"", "\"stream\"", "\"artifact\"", "\"result\"", "\"pong\""] {
            assert!(KERNEL_DRIVER.contains(marker), "driver missing {marker}");
        }
    }

    #[test]
    fn test_message_parsing() {
        let msg: KernelMessage =
            serde_json::from_str(r#"{"type":"stream","name":"stdout","text":"hi"}"#).unwrap();
        assert!(matches!(
            msg,
            KernelMessage::Stream { name: StreamName::Stdout, ref text } if text == "hi"
        ));

        let msg: KernelMessage = serde_json::from_str(
            r#"{"type":"result","id":1,"status":"error","error_type":"NameError","error":"x","traceback":"tb"}"#,
        )
        .unwrap();
        assert!(matches!(
            msg,
            KernelMessage::Result { status: DriverStatus::Error, .. }
        ));
    }

    #[tokio::test]
    async fn test_spawn_and_execute() {
        if python_missing() {
            return;
        }
        let mut kernel = KernelProcess::spawn(&test_settings()).await.unwrap();

        kernel.send_exec(1, "print('hello')").await.unwrap();
        let mut stdout = String::new();
        loop {
            match kernel.read_message().await.unwrap() {
                KernelMessage::Stream { text, .. } => stdout.push_str(&text),
                KernelMessage::Result { status, .. } => {
                    assert_eq!(status, DriverStatus::Ok);
                    break;
                }
                other => panic!("unexpected message: {other:?}"),
            }
        }
        assert_eq!(stdout.trim(), "hello");
        kernel.kill().await;
    }

    #[tokio::test]
    async fn test_state_persists_across_executions() {
        if python_missing() {
            return;
        }
        let mut kernel = KernelProcess::spawn(&test_settings()).await.unwrap();

        kernel.send_exec(1, "x = 41").await.unwrap();
        loop {
            if matches!(kernel.read_message().await.unwrap(), KernelMessage::Result { .. }) {
                break;
            }
        }

        kernel.send_exec(2, "x + 1").await.unwrap();
        let mut stdout = String::new();
        loop {
            match kernel.read_message().await.unwrap() {
                KernelMessage::Stream { text, .. } => stdout.push_str(&text),
                KernelMessage::Result { status, .. } => {
                    assert_eq!(status, DriverStatus::Ok);
                    break;
                }
                other => panic!("unexpected message: {other:?}"),
            }
        }
        assert_eq!(stdout.trim(), "42");
        kernel.kill().await;
    }

    #[tokio::test]
    async fn test_runtime_error_reported_with_traceback() {
        if python_missing() {
            return;
        }
        let mut kernel = KernelProcess::spawn(&test_settings()).await.unwrap();

        kernel.send_exec(1, "1 / 0").await.unwrap();
        loop {
            match kernel.read_message().await.unwrap() {
                KernelMessage::Result {
                    status,
                    error_type,
                    traceback,
                    ..
                } => {
                    assert_eq!(status, DriverStatus::Error);
                    assert_eq!(error_type.as_deref(), Some("ZeroDivisionError"));
                    assert!(traceback.unwrap_or_default().contains("ZeroDivisionError"));
                    break;
                }
                KernelMessage::Stream { .. } => continue,
                other => panic!("unexpected message: {other:?}"),
            }
        }
        kernel.kill().await;
    }

    #[tokio::test]
    async fn test_display_emits_artifact() {
        if python_missing() {
            return;
        }
        let mut kernel = KernelProcess::spawn(&test_settings()).await.unwrap();

        kernel
            .send_exec(1, "display({'a': 1})")
            .await
            .unwrap();
        let mut saw_artifact = false;
        loop {
            match kernel.read_message().await.unwrap() {
                KernelMessage::Artifact { kind, index, data } => {
                    assert_eq!(kind, "table");
                    assert_eq!(index, 0);
                    assert!(data.contains("\"a\""));
                    saw_artifact = true;
                }
                KernelMessage::Result { status, .. } => {
                    assert_eq!(status, DriverStatus::Ok);
                    break;
                }
                _ => {}
            }
        }
        assert!(saw_artifact);
        kernel.kill().await;
    }

    #[tokio::test]
    async fn test_ping_pong() {
        if python_missing() {
            return;
        }
        let mut kernel = KernelProcess::spawn(&test_settings()).await.unwrap();

        kernel.send_ping(7).await.unwrap();
        match kernel.read_message().await.unwrap() {
            KernelMessage::Pong { id } => assert_eq!(id, 7),
            other => panic!("unexpected message: {other:?}"),
        }
        kernel.kill().await;
    }
}
