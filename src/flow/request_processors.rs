//! 请求处理器：按顺序填充发给模型的 LlmRequest
//!
//! 1. Instruction：指令模板 + 可转移目标 + 规划指令
//! 2. Auth：解析带回的凭证，恢复待认证的工具调用；仍缺凭证时短路本 cycle
//! 3. Contents：把会话事件映射成模型消息历史
//! 4. ToolDeclaration：工具声明
//! 5. CodeExecutionRequest：代码执行约定

use std::collections::HashSet;

use async_trait::async_trait;
use serde_json::Value;

use crate::agent::InvocationContext;
use crate::code_executor::{format_code_block, format_execution_result, CodeExecutorConfig};
use crate::core::{FlowError, TurnStatus};
use crate::flow::functions::{
    auth_event, error_response, function_response_event, invoke_call, pending_auth, pending_auth_value,
    record_call, wrap_response, PENDING_AUTH_KEY, REQUEST_CREDENTIAL,
};
use crate::llm::LlmRequest;
use crate::services::Credential;
use crate::session::{
    Content, Event, EventActions, FunctionCall, Part, Role, CODE_EXECUTOR_AUTHOR, USER_AUTHOR,
};
use crate::tools::{builtin, ToolOutcome};

/// 处理器结果：继续，或以给定状态结束本轮（不调用模型）
#[derive(Debug, PartialEq)]
pub enum Preprocess {
    Continue,
    Halt(TurnStatus),
}

#[async_trait]
pub trait RequestProcessor: Send + Sync {
    fn name(&self) -> &'static str;

    async fn process(&self, ctx: &mut InvocationContext, request: &mut LlmRequest) -> Result<Preprocess, FlowError>;
}

pub fn default_request_processors() -> Vec<Box<dyn RequestProcessor>> {
    vec![
        Box::new(InstructionProcessor),
        Box::new(AuthPreprocessor),
        Box::new(ContentsProcessor),
        Box::new(ToolDeclarationProcessor),
        Box::new(CodeExecutionRequestProcessor),
    ]
}

pub const PLANNING_INSTRUCTION: &str = "\
When answering, first write a plan under /*PLANNING*/, then explain each step under /*REASONING*/ \
before calling tools under /*ACTION*/. If the plan has to change, write the new plan under /*REPLANNING*/. \
Put the answer for the user after /*FINAL_ANSWER*/.";

pub struct InstructionProcessor;

#[async_trait]
impl RequestProcessor for InstructionProcessor {
    fn name(&self) -> &'static str {
        "instruction"
    }

    async fn process(&self, ctx: &mut InvocationContext, request: &mut LlmRequest) -> Result<Preprocess, FlowError> {
        let agent = ctx.agent.clone();
        request.append_instruction(agent.render_instruction(&ctx.session.state));

        let targets = agent.transfer_targets(&ctx.root_agent);
        if !targets.is_empty() {
            let mut text = format!(
                "You are agent `{}`. If another agent is better suited to answer, call `{}` with its name. Available agents:",
                agent.name,
                builtin::TRANSFER_TO_AGENT
            );
            for name in &targets {
                let description = ctx
                    .root_agent
                    .find_agent(name)
                    .map(|a| a.description.clone())
                    .unwrap_or_default();
                text.push_str(&format!("\n- {name}: {description}"));
            }
            request.append_instruction(text);
        }

        if agent.planning {
            request.append_instruction(PLANNING_INSTRUCTION);
        }
        request.config = agent.generate_config.clone();
        Ok(Preprocess::Continue)
    }
}

pub struct AuthPreprocessor;

impl AuthPreprocessor {
    /// 用户内容里的 request_credential 结果：{scheme, token}
    async fn store_incoming_credentials(ctx: &InvocationContext) -> Result<(), FlowError> {
        let Some(content) = &ctx.user_content else {
            return Ok(());
        };
        for resp in content.function_responses().filter(|r| r.name == REQUEST_CREDENTIAL) {
            let scheme = resp.response.get("scheme").and_then(Value::as_str);
            let token = resp.response.get("token").and_then(Value::as_str);
            if let (Some(scheme), Some(token)) = (scheme, token) {
                ctx.services
                    .credentials
                    .store_credential(
                        &ctx.session.user_id,
                        Credential {
                            scheme: scheme.to_string(),
                            token: token.to_string(),
                        },
                    )
                    .await?;
                tracing::info!(invocation_id = %ctx.invocation_id, scheme, "credential received");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl RequestProcessor for AuthPreprocessor {
    fn name(&self) -> &'static str {
        "auth"
    }

    async fn process(&self, ctx: &mut InvocationContext, _request: &mut LlmRequest) -> Result<Preprocess, FlowError> {
        let mut pending = pending_auth(&ctx.session.state);
        if pending.is_empty() {
            return Ok(Preprocess::Continue);
        }
        Self::store_incoming_credentials(ctx).await?;

        let entries: Vec<_> = pending.clone().into_iter().collect();
        for (call_id, req) in entries {
            let cached = ctx
                .services
                .credentials
                .get_cached_credential(&ctx.session.user_id, &req.scheme)
                .await?;
            if cached.is_none() {
                continue;
            }

            let owner = ctx.root_agent.find_agent(&req.agent).unwrap_or_else(|| ctx.agent.clone());
            let call = FunctionCall {
                id: call_id.clone(),
                name: req.tool_name.clone(),
                args: req.args.clone(),
            };
            record_call(ctx, &call);
            let tool_ctx = ctx.tool_context(&call_id);
            let outcome = invoke_call(ctx, &owner, &call, tool_ctx.clone()).await;
            let response = match outcome {
                Ok(ToolOutcome::Value(v)) => wrap_response(v),
                Ok(ToolOutcome::NeedsAuth { .. }) => {
                    tracing::warn!(tool = %req.tool_name, call_id = %call_id, "credential rejected; still pending");
                    continue;
                }
                Err(e) => error_response(&e),
            };
            tracing::info!(tool = %req.tool_name, call_id = %call_id, "resumed tool call after authentication");

            pending.remove(&call_id);
            let mut actions = tool_ctx.take_actions();
            actions
                .state_delta
                .insert(PENDING_AUTH_KEY.to_string(), pending_auth_value(&pending));
            let event = function_response_event(ctx, &call_id, &req.tool_name, response, actions);
            ctx.emit(event).await?;
        }

        if pending.is_empty() {
            return Ok(Preprocess::Continue);
        }
        let event = auth_event(ctx, &pending, EventActions::default());
        let committed = ctx.emit(event).await?;
        ctx.final_text = committed.text();
        Ok(Preprocess::Halt(TurnStatus::AuthRequired))
    }
}

pub struct ContentsProcessor;

impl ContentsProcessor {
    fn include(event: &Event) -> bool {
        !event.partial
            && !event.is_error()
            && event.actions.requested_auth.is_empty()
            && event.content.as_ref().is_some_and(|c| !c.is_empty())
    }

    /// 最新事件是函数结果而对应调用之后还夹着其他事件时（认证恢复后的情形），
    /// 只保留该调用与它的结果
    fn rearrange_latest_response(events: Vec<&Event>) -> Vec<&Event> {
        let Some(&last) = events.last() else {
            return events;
        };
        let ids: HashSet<String> = last.function_responses().into_iter().map(|r| r.id).collect();
        if ids.is_empty() {
            return events;
        }
        let Some(call_idx) = events[..events.len() - 1]
            .iter()
            .rposition(|e| e.function_calls().iter().any(|c| ids.contains(&c.id)))
        else {
            return events;
        };
        let call_ids: HashSet<String> = events[call_idx].function_calls().into_iter().map(|c| c.id).collect();
        let mut out: Vec<&Event> = events[..=call_idx].to_vec();
        out.extend(
            events[call_idx + 1..]
                .iter()
                .filter(|e| e.function_responses().iter().any(|r| call_ids.contains(&r.id))),
        );
        out
    }

    /// 每个函数结果紧跟在它回答的调用之后
    fn rearrange_responses(events: Vec<&Event>) -> Vec<&Event> {
        let mut response_of: std::collections::HashMap<String, usize> = std::collections::HashMap::new();
        for (idx, event) in events.iter().enumerate() {
            for r in event.function_responses() {
                response_of.insert(r.id, idx);
            }
        }
        let mut used = HashSet::new();
        let mut out = Vec::with_capacity(events.len());
        for (idx, event) in events.iter().enumerate() {
            if used.contains(&idx) {
                continue;
            }
            out.push(*event);
            used.insert(idx);
            for call in event.function_calls() {
                if let Some(&r_idx) = response_of.get(&call.id) {
                    if used.insert(r_idx) {
                        out.push(events[r_idx]);
                    }
                }
            }
        }
        out
    }

    /// 其他 agent 的发言改写成用户侧的背景信息
    fn as_context(event: &Event, content: &Content) -> Content {
        let mut lines = vec!["For context:".to_string()];
        for part in &content.parts {
            let line = match part {
                Part::Text { text, thought: false } => format!("[{}] said: {}", event.author, text),
                Part::Text { thought: true, .. } => continue,
                Part::FunctionCall(fc) => {
                    format!("[{}] called tool `{}` with parameters: {}", event.author, fc.name, fc.args)
                }
                Part::FunctionResponse(fr) => {
                    format!("[{}] `{}` tool returned result: {}", event.author, fr.name, fr.response)
                }
                Part::ExecutableCode(code) => format!("[{}] ran code:\n{}", event.author, code.code),
                Part::CodeExecutionResult(out) => {
                    format!("[{}] code execution result:\n{}{}", event.author, out.stdout, out.stderr)
                }
            };
            lines.push(line);
        }
        Content::new(Role::User, vec![Part::text(lines.join("\n"))])
    }

    /// 代码与执行结果以定界文本的形式出现在历史中
    fn render_code(content: &Content, config: &CodeExecutorConfig) -> Content {
        let mut parts = Vec::with_capacity(content.parts.len());
        for part in &content.parts {
            match part {
                Part::ExecutableCode(code) => {
                    parts.push(Part::text(format_code_block(&code.code, &config.code_block_delimiters)))
                }
                Part::CodeExecutionResult(out) => {
                    parts.push(Part::text(format_execution_result(out, &config.execution_result_delimiters)))
                }
                other => parts.push(other.clone()),
            }
        }
        Content::new(content.role, parts)
    }

    fn without_credential_parts(content: &Content) -> Content {
        let parts = content
            .parts
            .iter()
            .filter(|p| match p {
                Part::FunctionCall(fc) => fc.name != REQUEST_CREDENTIAL,
                Part::FunctionResponse(fr) => fr.name != REQUEST_CREDENTIAL,
                _ => true,
            })
            .cloned()
            .collect();
        Content::new(content.role, parts)
    }
}

#[async_trait]
impl RequestProcessor for ContentsProcessor {
    fn name(&self) -> &'static str {
        "contents"
    }

    async fn process(&self, ctx: &mut InvocationContext, request: &mut LlmRequest) -> Result<Preprocess, FlowError> {
        let exec_config = ctx
            .agent
            .code_executor
            .as_ref()
            .map(|e| e.config().clone())
            .unwrap_or_default();

        let events: Vec<&Event> = ctx.session.events.iter().filter(|e| Self::include(e)).collect();
        let events = Self::rearrange_latest_response(events);
        let events = Self::rearrange_responses(events);

        for event in events {
            let Some(content) = &event.content else { continue };
            let content = Self::without_credential_parts(content);
            if content.is_empty() {
                continue;
            }
            let own = event.author == USER_AUTHOR
                || event.author == CODE_EXECUTOR_AUTHOR
                || event.author == ctx.agent.name;
            let content = if own {
                Self::render_code(&content, &exec_config)
            } else {
                Self::as_context(event, &content)
            };
            request.contents.push(content);
        }
        Ok(Preprocess::Continue)
    }
}

pub struct ToolDeclarationProcessor;

#[async_trait]
impl RequestProcessor for ToolDeclarationProcessor {
    fn name(&self) -> &'static str {
        "tool_declaration"
    }

    async fn process(&self, ctx: &mut InvocationContext, request: &mut LlmRequest) -> Result<Preprocess, FlowError> {
        request.tools = ctx.agent.tools.declarations();
        if !ctx.agent.transfer_targets(&ctx.root_agent).is_empty() {
            request.tools.push(builtin::transfer_to_agent().declaration());
        }
        Ok(Preprocess::Continue)
    }
}

pub struct CodeExecutionRequestProcessor;

#[async_trait]
impl RequestProcessor for CodeExecutionRequestProcessor {
    fn name(&self) -> &'static str {
        "code_execution_request"
    }

    async fn process(&self, ctx: &mut InvocationContext, request: &mut LlmRequest) -> Result<Preprocess, FlowError> {
        let Some(executor) = &ctx.agent.code_executor else {
            return Ok(Preprocess::Continue);
        };
        let config = executor.config();
        let Some((start, end)) = config.code_block_delimiters.first() else {
            return Ok(Preprocess::Continue);
        };
        let (res_start, res_end) = &config.execution_result_delimiters;
        request.append_instruction(format!(
            "You can run Python code. To run code, write exactly one block between `{}` and `{}`; \
             the modules math, json, re and datetime are already imported. \
             The output is returned to you between `{}` and `{}`. \
             If the code fails, fix it and try again.",
            start.trim_end(),
            end.trim_start(),
            res_start.trim_end(),
            res_end.trim_start()
        ));
        Ok(Preprocess::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ev(author: &str, content: Content) -> Event {
        Event::new("inv", author).with_content(content)
    }

    fn call(id: &str) -> Content {
        Content::new(Role::Model, vec![Part::function_call(id, "add", json!({"a": 1}))])
    }

    fn resp(id: &str) -> Content {
        Content::new(Role::Tool, vec![Part::function_response(id, "add", json!({"result": 2}))])
    }

    #[test]
    fn test_responses_follow_their_calls() {
        let events = [
            ev("user", Content::user_text("q")),
            ev("a", call("c1")),
            ev("user", Content::user_text("more")),
            ev("a", resp("c1")),
            ev("a", Content::model_text("done")),
        ];
        let refs: Vec<&Event> = events.iter().collect();
        let out = ContentsProcessor::rearrange_responses(refs);
        let texts: Vec<String> = out
            .iter()
            .map(|e| {
                e.text()
                    .or_else(|| e.function_calls().first().map(|c| format!("call:{}", c.id)))
                    .or_else(|| e.function_responses().first().map(|r| format!("resp:{}", r.id)))
                    .unwrap_or_default()
            })
            .collect();
        assert_eq!(texts, vec!["q", "call:c1", "resp:c1", "more", "done"]);
    }

    #[test]
    fn test_latest_response_drops_intervening_events() {
        let events = [
            ev("user", Content::user_text("q")),
            ev("a", call("c1")),
            ev("user", Content::user_text("here is my key")),
            ev("a", resp("c1")),
        ];
        let refs: Vec<&Event> = events.iter().collect();
        let out = ContentsProcessor::rearrange_latest_response(refs);
        assert_eq!(out.len(), 3);
        assert_eq!(out[2].function_responses()[0].id, "c1");
    }

    #[test]
    fn test_parallel_responses_are_kept() {
        let both = Content::new(
            Role::Model,
            vec![
                Part::function_call("c1", "add", json!({})),
                Part::function_call("c2", "add", json!({})),
            ],
        );
        let events = [ev("user", Content::user_text("q")), ev("a", both), ev("a", resp("c1")), ev("a", resp("c2"))];
        let refs: Vec<&Event> = events.iter().collect();
        assert_eq!(ContentsProcessor::rearrange_latest_response(refs).len(), 4);
    }

    #[test]
    fn test_other_agent_rendered_as_context() {
        let event = ev("billing", Content::model_text("balance is 5"));
        let content = ContentsProcessor::as_context(&event, event.content.as_ref().unwrap());
        assert_eq!(content.role, Role::User);
        assert_eq!(content.text().as_deref(), Some("For context:\n[billing] said: balance is 5"));
    }

    #[test]
    fn test_error_and_auth_events_are_excluded() {
        let err = Event::error("inv", "a", "SAFETY", "blocked");
        assert!(!ContentsProcessor::include(&err));
        let mut auth = ev("a", Content::model_text("auth"));
        auth.actions.requested_auth.insert(
            "c1".into(),
            crate::services::AuthRequest {
                request_id: "r".into(),
                scheme: "s".into(),
                function_call_id: "c1".into(),
                tool_name: "t".into(),
                args: json!({}),
                agent: "a".into(),
            },
        );
        assert!(!ContentsProcessor::include(&auth));
        assert!(ContentsProcessor::include(&ev("a", Content::model_text("ok"))));
    }
}
