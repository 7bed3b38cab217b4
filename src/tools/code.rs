//! The code-execution tool.
//!
//! This is the one `SandboxedCode` tool in the default registry: it hands
//! model-generated Python to the supervisor, which runs it in the calling
//! session's kernel. Timeouts, runtime errors, and kernel deaths all come
//! back as ordinary results the model can read.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::info;

use crate::config::ExecSettings;
use crate::exec::{ExecError, ExecutionRequest, ExecutionResult, Supervisor};
use crate::tools::tool::{CallContext, Tool, ToolError, ToolKind, ToolOutput};

const MAX_TIMEOUT_SECS: u64 = 600;

/// Runs Python code in the session's persistent kernel.
pub struct RunCodeTool {
    supervisor: Arc<Supervisor>,
    settings: ExecSettings,
}

impl RunCodeTool {
    pub fn new(supervisor: Arc<Supervisor>, settings: ExecSettings) -> Self {
        Self {
            supervisor,
            settings,
        }
    }

    fn render(result: &ExecutionResult) -> serde_json::Value {
        serde_json::json!({
            "status": result.status,
            "stdout": result.stdout,
            "stderr": result.stderr,
            "error": result.error,
            "artifacts": result.artifacts,
            "duration_ms": result.duration.as_millis() as u64,
            "truncated": result.truncated,
        })
    }
}

#[async_trait]
impl Tool for RunCodeTool {
    fn name(&self) -> &str {
        "run_code"
    }

    fn description(&self) -> &str {
        "Executes Python code in a persistent interpreter scoped to this \
         conversation. Variables, imports, and function definitions persist \
         between calls. Use print() for output; the value of a trailing \
         expression is echoed back."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "code": {
                    "type": "string",
                    "description": "The Python code to execute"
                },
                "language": {
                    "type": "string",
                    "enum": ["python"],
                    "description": "Language of the code. Only python is supported."
                },
                "timeout_secs": {
                    "type": "integer",
                    "description": "Wall-clock limit for this execution, in seconds"
                }
            },
            "required": ["code"]
        })
    }

    fn kind(&self) -> ToolKind {
        ToolKind::SandboxedCode
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        ctx: &CallContext,
    ) -> Result<ToolOutput, ToolError> {
        let code = params
            .get("code")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::InvalidParameters("missing 'code' parameter".to_string()))?;

        if let Some(language) = params.get("language").and_then(|v| v.as_str()) {
            if language != "python" {
                return Err(ToolError::InvalidParameters(format!(
                    "unsupported language '{language}', only python is available"
                )));
            }
        }

        let timeout = params
            .get("timeout_secs")
            .and_then(|v| v.as_u64())
            .filter(|v| *v > 0)
            .map(|v| Duration::from_secs(v.min(MAX_TIMEOUT_SECS)))
            .unwrap_or(self.settings.default_timeout);

        let start = Instant::now();
        let request = ExecutionRequest::new(ctx.session_id, code, timeout);

        info!(
            session_id = %ctx.session_id,
            bytes = code.len(),
            timeout_secs = timeout.as_secs(),
            "Executing code"
        );

        let result = self
            .supervisor
            .execute_cancellable(&request, &ctx.cancel)
            .await
            .map_err(|e| match e {
                ExecError::Cancelled => ToolError::Cancelled,
                other => ToolError::ExecutionFailed(other.to_string()),
            })?;

        Ok(ToolOutput::success(Self::render(&result), start.elapsed()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::kernel::{interpreter_available, KernelPool};
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    fn tool() -> RunCodeTool {
        let settings = Settings::default();
        let pool = Arc::new(KernelPool::new(settings.kernel.clone()));
        let supervisor = Arc::new(Supervisor::new(pool, settings.exec.clone()));
        RunCodeTool::new(supervisor, settings.exec)
    }

    fn ctx() -> CallContext {
        CallContext::new(Uuid::new_v4(), CancellationToken::new())
    }

    #[tokio::test]
    async fn test_rejects_non_python() {
        let tool = tool();
        let err = tool
            .execute(
                serde_json::json!({"code": "puts 1", "language": "ruby"}),
                &ctx(),
            )
            .await;
        assert!(matches!(err, Err(ToolError::InvalidParameters(_))));
    }

    #[tokio::test]
    async fn test_missing_code_rejected() {
        let tool = tool();
        let err = tool.execute(serde_json::json!({}), &ctx()).await;
        assert!(matches!(err, Err(ToolError::InvalidParameters(_))));
    }

    #[tokio::test]
    async fn test_executes_and_renders_result() {
        if !interpreter_available("python3") {
            return;
        }
        let tool = tool();
        let ctx = ctx();

        let output = tool
            .execute(serde_json::json!({"code": "print('from tool')"}), &ctx)
            .await
            .unwrap();

        assert_eq!(output.result["status"], "ok");
        assert_eq!(output.result["stdout"], "from tool\n");

        // Session scoping: state persists across calls through the same ctx.
        tool.execute(serde_json::json!({"code": "n = 10"}), &ctx)
            .await
            .unwrap();
        let output = tool
            .execute(serde_json::json!({"code": "n * 2"}), &ctx)
            .await
            .unwrap();
        assert!(output.result["stdout"].as_str().unwrap().contains("20"));
    }

    #[tokio::test]
    async fn test_runtime_error_is_data() {
        if !interpreter_available("python3") {
            return;
        }
        let tool = tool();

        let output = tool
            .execute(serde_json::json!({"code": "1 / 0"}), &ctx())
            .await
            .unwrap();

        assert_eq!(output.result["status"], "runtime_error");
        assert!(output.result["error"]
            .as_str()
            .unwrap()
            .contains("ZeroDivisionError"));
    }
}
