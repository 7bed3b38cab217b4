//! Turn orchestration and session lifecycle.

mod orchestrator;
mod session;
mod session_manager;

pub use orchestrator::{AgentError, AgentEvent, Orchestrator};
pub use session::{Session, Turn};
pub use session_manager::SessionManager;
