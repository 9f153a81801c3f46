//! 工具执行器
//!
//! 对每次调用施加超时，超时转为 ToolError::Timeout；每次调用输出一条结构化审计日志（JSON）。

use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::time::timeout;

use crate::agent::ToolContext;
use crate::tools::{Tool, ToolError, ToolOutcome};

/// 工具执行器：超时 + 审计
#[derive(Clone, Debug)]
pub struct ToolExecutor {
    timeout: Duration,
}

impl ToolExecutor {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// 执行工具；超时返回 Timeout，工具自身错误原样返回；输出 JSON 审计日志
    pub async fn execute(&self, tool: &Tool, args: Value, ctx: ToolContext) -> Result<ToolOutcome, ToolError> {
        let start = Instant::now();
        let args_preview = args_preview(&args);
        let call_id = ctx.function_call_id().to_string();
        let result = timeout(self.timeout, tool.invoke(args, ctx)).await;

        let (ok, outcome): (bool, &str) = match &result {
            Ok(Ok(ToolOutcome::Value(_))) => (true, "ok"),
            Ok(Ok(ToolOutcome::NeedsAuth { .. })) => (true, "auth_required"),
            Ok(Err(_)) => (false, "error"),
            Err(_) => (false, "timeout"),
        };
        let duration_ms = start.elapsed().as_millis() as u64;
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": tool.name(),
            "call_id": call_id,
            "ok": ok,
            "outcome": outcome,
            "duration_ms": duration_ms,
            "args_preview": args_preview,
        });
        tracing::info!(audit = %audit.to_string(), "tool");

        match result {
            Ok(r) => r,
            Err(_) => Err(ToolError::Timeout(tool.name().to_string())),
        }
    }
}

impl Default for ToolExecutor {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::Services;
    use crate::session::SessionKey;
    use crate::tools::FunctionTool;
    use serde_json::json;

    fn ctx() -> ToolContext {
        ToolContext::standalone(Services::in_memory(), SessionKey::new("app", "u", "s"))
    }

    #[tokio::test]
    async fn test_timeout_is_reported() {
        let slow: Tool = FunctionTool::new("slow", "sleeps", json!({"type": "object"}), |_args, _ctx| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(json!({}))
        })
        .into();
        let exec = ToolExecutor::new(Duration::from_millis(20));
        let err = exec.execute(&slow, json!({}), ctx()).await.unwrap_err();
        assert_eq!(err, ToolError::Timeout("slow".into()));
    }

    #[tokio::test]
    async fn test_errors_pass_through() {
        let failing: Tool = FunctionTool::new("fail", "fails", json!({"type": "object"}), |_args, _ctx| async {
            Err(ToolError::Execution("boom".into()))
        })
        .into();
        let err = ToolExecutor::default()
            .execute(&failing, json!({}), ctx())
            .await
            .unwrap_err();
        assert_eq!(err, ToolError::Execution("boom".into()));
    }

    #[test]
    fn test_args_preview_truncates() {
        let long = json!({"text": "x".repeat(500)});
        let preview = args_preview(&long);
        assert!(preview.ends_with("..."));
        assert_eq!(preview.chars().count(), 203);
    }
}
