//! Extensible tool system.
//!
//! Tools are the agent's interface to the outside world. The model asks for
//! them either through structured function calling or inline
//! `<tool_call>` blocks; the router parses, validates, and dispatches both
//! forms. Code execution is just one registered tool.

pub mod builtin;

mod code;
mod parser;
mod registry;
mod router;
mod schema;
mod tool;

pub use code::RunCodeTool;
pub use parser::{extract_calls, Extraction, RawCall};
pub use registry::ToolRegistry;
pub use router::{ToolCall, ToolResult, ToolRouter, ValidationError};
pub use tool::{CallContext, Tool, ToolError, ToolKind, ToolOutput, ToolSpec};
