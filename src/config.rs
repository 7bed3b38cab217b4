//! Runtime settings for the agent and its kernel pool.
//!
//! Settings are built from defaults and overridden by `KILN_*` environment
//! variables. The binary loads `.env` via dotenvy before calling
//! [`Settings::from_env`], so a local `.env` file works the same way.

use std::time::Duration;

/// Top-level settings, grouped by subsystem.
#[derive(Debug, Clone, Default)]
pub struct Settings {
    pub kernel: KernelSettings,
    pub exec: ExecSettings,
    pub agent: AgentSettings,
    pub model: ModelSettings,
}

/// Settings for the kernel pool.
#[derive(Debug, Clone)]
pub struct KernelSettings {
    /// Maximum number of concurrently live kernel processes.
    pub max_kernels: usize,
    /// Kernels idle for longer than this are eligible for eviction.
    pub idle_window: Duration,
    /// Address-space ceiling applied to each kernel process at creation.
    pub memory_limit_mb: u64,
    /// Interpreter command used to start a kernel.
    pub python_command: String,
    /// How long to wait for a fresh kernel to report ready.
    pub spawn_timeout: Duration,
}

impl Default for KernelSettings {
    fn default() -> Self {
        Self {
            max_kernels: 8,
            idle_window: Duration::from_secs(300),
            memory_limit_mb: 512,
            python_command: "python3".to_string(),
            spawn_timeout: Duration::from_secs(10),
        }
    }
}

/// Settings for the execution supervisor.
#[derive(Debug, Clone)]
pub struct ExecSettings {
    /// Default wall-clock timeout when a request does not declare one.
    pub default_timeout: Duration,
    /// Grace period between interrupt and force kill.
    pub interrupt_grace: Duration,
    /// Captured stdout/stderr are each truncated at this many bytes.
    pub max_output_bytes: usize,
    /// Deadline for a kernel to answer a liveness ping.
    pub heartbeat_timeout: Duration,
}

impl Default for ExecSettings {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(30),
            interrupt_grace: Duration::from_secs(2),
            max_output_bytes: 64 * 1024,
            heartbeat_timeout: Duration::from_secs(5),
        }
    }
}

/// Settings for the turn orchestrator and session manager.
#[derive(Debug, Clone)]
pub struct AgentSettings {
    /// Maximum model/tool rounds per user turn.
    pub max_rounds: usize,
    /// Sessions idle for longer than this are pruned (kernel torn down).
    pub session_idle: Duration,
    /// Interval between idle sweeps.
    pub sweep_interval: Duration,
    /// System prompt prepended to every context replay.
    pub system_prompt: String,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            max_rounds: 8,
            session_idle: Duration::from_secs(3600),
            sweep_interval: Duration::from_secs(60),
            system_prompt: "You are a helpful assistant. When a task calls for \
                            computation, use the run_code tool; variables persist \
                            between executions within this conversation."
                .to_string(),
        }
    }
}

/// Settings for the model client.
#[derive(Debug, Clone)]
pub struct ModelSettings {
    /// Base URL of an OpenAI-compatible chat completions endpoint.
    pub base_url: String,
    /// API key, if the endpoint requires one.
    pub api_key: Option<String>,
    /// Model identifier sent with each request.
    pub model: String,
    /// Per-request HTTP timeout.
    pub request_timeout: Duration,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com".to_string(),
            api_key: None,
            model: "gpt-4o-mini".to_string(),
            request_timeout: Duration::from_secs(120),
        }
    }
}

impl Settings {
    /// Build settings from defaults plus `KILN_*` environment overrides.
    pub fn from_env() -> Self {
        let mut s = Self::default();

        if let Some(v) = env_usize("KILN_MAX_KERNELS") {
            s.kernel.max_kernels = v;
        }
        if let Some(v) = env_secs("KILN_KERNEL_IDLE_SECS") {
            s.kernel.idle_window = v;
        }
        if let Some(v) = env_u64("KILN_KERNEL_MEMORY_MB") {
            s.kernel.memory_limit_mb = v;
        }
        if let Ok(v) = std::env::var("KILN_PYTHON_COMMAND") {
            if !v.trim().is_empty() {
                s.kernel.python_command = v;
            }
        }
        if let Some(v) = env_secs("KILN_EXEC_TIMEOUT_SECS") {
            s.exec.default_timeout = v;
        }
        if let Some(v) = env_secs("KILN_INTERRUPT_GRACE_SECS") {
            s.exec.interrupt_grace = v;
        }
        if let Some(v) = env_usize("KILN_MAX_OUTPUT_BYTES") {
            s.exec.max_output_bytes = v;
        }
        if let Some(v) = env_usize("KILN_MAX_ROUNDS") {
            s.agent.max_rounds = v;
        }
        if let Some(v) = env_secs("KILN_SESSION_IDLE_SECS") {
            s.agent.session_idle = v;
        }
        if let Ok(v) = std::env::var("KILN_MODEL_BASE_URL") {
            if !v.trim().is_empty() {
                s.model.base_url = v;
            }
        }
        if let Ok(v) = std::env::var("KILN_API_KEY") {
            if !v.trim().is_empty() {
                s.model.api_key = Some(v);
            }
        }
        if let Ok(v) = std::env::var("KILN_MODEL") {
            if !v.trim().is_empty() {
                s.model.model = v;
            }
        }

        s
    }
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok()?.trim().parse().ok().filter(|v| *v > 0)
}

fn env_usize(key: &str) -> Option<usize> {
    std::env::var(key).ok()?.trim().parse().ok().filter(|v| *v > 0)
}

fn env_secs(key: &str) -> Option<Duration> {
    env_u64(key).map(Duration::from_secs)
}
