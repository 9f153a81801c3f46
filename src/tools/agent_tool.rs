//! 把一个 agent 包装成工具
//!
//! 嵌套 agent 在一次性的内存会话中运行（继承调用方状态快照），返回最终文本；
//! 它对状态的修改作为调用方工具上下文的写入传回，随工具结果事件一起提交。
//! 嵌套运行未完成（包括等待认证）时作为普通工具错误返回给调用方模型。

use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde_json::{json, Value};

use crate::agent::{LlmAgent, ToolContext};
use crate::core::TurnStatus;
use crate::llm::FunctionDeclaration;
use crate::runner::Runner;
use crate::services::Services;
use crate::session::{Content, InMemorySessionStore, StateMap};
use crate::tools::{ToolError, ToolOutcome};

/// 内部键，不向嵌套 agent 传递
const PRIVATE_PREFIX: char = '_';

#[derive(Clone)]
pub struct AgentTool {
    agent: Arc<LlmAgent>,
}

impl AgentTool {
    pub fn new(agent: Arc<LlmAgent>) -> Self {
        Self { agent }
    }

    pub fn name(&self) -> &str {
        &self.agent.name
    }

    pub fn declaration(&self) -> FunctionDeclaration {
        FunctionDeclaration {
            name: self.agent.name.clone(),
            description: self.agent.description.clone(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "request": {"type": "string", "description": "The request to hand to the agent."}
                },
                "required": ["request"]
            }),
        }
    }

    /// 返回装箱 future：嵌套运行会再次进入编排循环
    pub fn invoke(&self, args: Value, ctx: ToolContext) -> BoxFuture<'_, Result<ToolOutcome, ToolError>> {
        async move {
            let request = match args.get("request").and_then(Value::as_str) {
                Some(r) => r.to_string(),
                None => args.to_string(),
            };

            let services = Services {
                sessions: Arc::new(InMemorySessionStore::new()),
                ..ctx.services().clone()
            };
            let runner = Runner::new(
                self.agent.name.clone(),
                self.agent.clone(),
                services,
                ctx.registry().clone(),
                ctx.run_config().clone(),
            )
            .map_err(|e| ToolError::Execution(e.to_string()))?;

            let seed: StateMap = ctx
                .readonly()
                .state()
                .iter()
                .filter(|(k, _)| !k.starts_with(PRIVATE_PREFIX))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            let user_id = ctx.readonly().user_id().to_string();
            let session_id = format!("agent_tool_{}", uuid::Uuid::new_v4().simple());
            runner
                .seed_session(&user_id, &session_id, seed.clone(), Vec::new())
                .await
                .map_err(|e| ToolError::Execution(e.to_string()))?;

            tracing::debug!(agent = %self.agent.name, "running nested agent");
            let outcome = runner
                .run(&user_id, &session_id, Content::user_text(request))
                .await
                .map_err(|e| ToolError::Execution(e.to_string()))?;

            if let Some(session) = runner
                .session(&user_id, &session_id)
                .await
                .map_err(|e| ToolError::Execution(e.to_string()))?
            {
                // 内部键（如嵌套运行的 _pending_auth）留在一次性会话里
                for (key, value) in session.state.iter().filter(|(k, _)| !k.starts_with(PRIVATE_PREFIX)) {
                    if seed.get(key) != Some(value) {
                        ctx.state_set(key.clone(), value.clone());
                    }
                }
                for key in seed.keys() {
                    if !session.state.contains_key(key) {
                        ctx.state_remove(key.clone());
                    }
                }
            }

            match outcome.status {
                TurnStatus::Completed => Ok(ToolOutcome::Value(json!({
                    "result": outcome.final_text.unwrap_or_default()
                }))),
                other => Err(ToolError::Execution(format!(
                    "agent {} ended with {:?}: {}",
                    self.agent.name,
                    other,
                    outcome.final_text.unwrap_or_default()
                ))),
            }
        }
        .boxed()
    }
}
