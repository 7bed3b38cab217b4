//! kiln: a turn-based LLM agent runtime built around pooled, isolated
//! Python execution kernels.
//!
//! The model converses in turns and can run code through the `run_code`
//! tool. Each conversation gets its own kernel process, so interpreter
//! state persists across executions within a session and never leaks
//! between sessions. Timeouts, memory ceilings, and crashes are handled by
//! the supervisor; the model sees them as ordinary tool results.
//!
//! Layering, bottom up:
//! - [`kernel`] owns the interpreter processes and the pool.
//! - [`exec`] supervises individual executions against the pool.
//! - [`tools`] parses, validates, and dispatches tool calls; code
//!   execution is one registered tool.
//! - [`agent`] drives the per-session turn loop against a model client.

pub mod agent;
pub mod config;
pub mod exec;
pub mod kernel;
pub mod llm;
pub mod tools;

pub use agent::{AgentError, Orchestrator, SessionManager};
pub use config::Settings;
pub use exec::{ExecutionRequest, ExecutionResult, Supervisor};
pub use kernel::KernelPool;
pub use llm::{ModelClient, OpenAiClient};
pub use tools::{RunCodeTool, ToolRegistry, ToolRouter};
