//! 函数调用分发
//!
//! 同一回复中的多个调用并发执行（受 TaskScheduler 限制），结果事件严格按请求顺序提交；
//! 同一状态键的写入因此按请求顺序生效，后者覆盖前者。
//! 需要认证的调用不提交结果事件，而是汇总成一个认证请求事件，并把待办记录写入 `_pending_auth`。

use std::collections::BTreeMap;

use futures_util::future::join_all;
use serde::Serialize;
use serde_json::{json, Value};

use crate::agent::{InvocationContext, LlmAgent, ToolContext};
use crate::core::FlowError;
use crate::services::AuthRequest;
use crate::session::{Content, Event, EventActions, FunctionCall, Part, Role, StateMap};
use crate::tools::{ToolError, ToolOutcome};

/// 认证请求在历史中的伪函数名；不会交给模型
pub const REQUEST_CREDENTIAL: &str = "request_credential";
/// 会话状态中的待认证调用（function call id -> AuthRequest）
pub const PENDING_AUTH_KEY: &str = "_pending_auth";

/// 本轮实际发出的一次工具调用（评测轨迹）
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ToolCallRecord {
    pub name: String,
    pub args: Value,
}

#[derive(Debug, PartialEq)]
pub enum DispatchResult {
    Continue,
    Transfer(String),
    AuthRequired,
    /// 某个工具请求上交控制：本轮在结果提交后结束，携带该工具结果的文本
    Escalate(String),
}

pub fn pending_auth(state: &StateMap) -> BTreeMap<String, AuthRequest> {
    state
        .get(PENDING_AUTH_KEY)
        .cloned()
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or_default()
}

/// 待办为空时写 null，删除该键
pub fn pending_auth_value(pending: &BTreeMap<String, AuthRequest>) -> Value {
    if pending.is_empty() {
        Value::Null
    } else {
        serde_json::to_value(pending).unwrap_or(Value::Null)
    }
}

/// 工具返回值统一成对象
pub fn wrap_response(value: Value) -> Value {
    match value {
        Value::Object(_) => value,
        other => json!({ "result": other }),
    }
}

pub fn error_response(err: &ToolError) -> Value {
    json!({ "error": err.to_string() })
}

/// 结果对象的可展示文本：优先 result 字符串，否则整段 JSON
pub fn response_text(response: &Value) -> String {
    match response.get("result") {
        Some(Value::String(s)) => s.clone(),
        _ => response.to_string(),
    }
}

/// 单个函数结果事件
pub fn function_response_event(
    ctx: &InvocationContext,
    call_id: &str,
    tool_name: &str,
    response: Value,
    actions: EventActions,
) -> Event {
    Event::new(&ctx.invocation_id, &ctx.agent.name)
        .with_content(Content::new(
            Role::Tool,
            vec![Part::function_response(call_id, tool_name, response)],
        ))
        .with_actions(actions)
}

/// 认证提示事件：每个待认证调用一个 request_credential 伪调用，附带给用户的说明文本
pub fn auth_event(ctx: &InvocationContext, requests: &BTreeMap<String, AuthRequest>, mut actions: EventActions) -> Event {
    let mut parts = Vec::new();
    let mut schemes = Vec::new();
    for (call_id, req) in requests {
        parts.push(Part::function_call(
            crate::session::new_function_call_id(),
            REQUEST_CREDENTIAL,
            json!({
                "function_call_id": call_id,
                "scheme": req.scheme,
                "request_id": req.request_id,
            }),
        ));
        schemes.push(format!("{} (for {})", req.scheme, req.tool_name));
    }
    parts.push(Part::text(format!(
        "Authentication required: {}. Provide the credential to continue.",
        schemes.join(", ")
    )));
    actions.requested_auth.extend(requests.clone());
    let mut event = Event::new(&ctx.invocation_id, &ctx.agent.name)
        .with_content(Content::new(Role::Model, parts))
        .with_actions(actions);
    event.turn_complete = true;
    event
}

/// 执行单个调用：拦截器优先，否则在 owner 上解析工具并受调度器限流。
/// 首次分发与认证后的恢复都走这里。
pub async fn invoke_call(
    ctx: &InvocationContext,
    owner: &LlmAgent,
    call: &FunctionCall,
    tool_ctx: ToolContext,
) -> Result<ToolOutcome, ToolError> {
    if let Some(interceptor) = &ctx.run_config.tool_interceptor {
        if let Some(mocked) = interceptor.intercept(&call.name, &call.args) {
            tracing::info!(tool = %call.name, call_id = %call.id, "tool call answered by interceptor");
            return Ok(ToolOutcome::Value(mocked));
        }
    }
    let has_transfer_targets = !owner.transfer_targets(&ctx.root_agent).is_empty();
    let tool = owner
        .resolve_tool(&call.name, has_transfer_targets)
        .ok_or_else(|| ToolError::NotFound(call.name.clone()))?;
    let _permit = ctx.scheduler.acquire_tool().await;
    ctx.executor.execute(&tool, call.args.clone(), tool_ctx).await
}

/// 记入本轮轨迹（评测按此顺序比较）
pub fn record_call(ctx: &mut InvocationContext, call: &FunctionCall) {
    ctx.tool_calls.push(ToolCallRecord {
        name: call.name.clone(),
        args: call.args.clone(),
    });
}

/// 执行一次回复中的全部函数调用，并按请求顺序提交结果
pub async fn dispatch(ctx: &mut InvocationContext, calls: Vec<FunctionCall>) -> Result<DispatchResult, FlowError> {
    for call in &calls {
        record_call(ctx, call);
    }

    let outcomes = {
        let shared: &InvocationContext = &*ctx;
        join_all(calls.into_iter().map(move |call| async move {
            let tool_ctx = shared.tool_context(&call.id);
            let outcome = invoke_call(shared, &shared.agent, &call, tool_ctx.clone()).await;
            (call, tool_ctx, outcome)
        }))
        .await
    };

    let mut transfer = None;
    let mut escalation = None;
    let mut needs_auth = BTreeMap::new();
    let mut auth_actions = EventActions::default();
    for (call, tool_ctx, outcome) in outcomes {
        let actions = tool_ctx.take_actions();
        let response = match outcome {
            Ok(ToolOutcome::Value(v)) => wrap_response(v),
            Ok(ToolOutcome::NeedsAuth { scheme, request_id }) => {
                tracing::info!(tool = %call.name, call_id = %call.id, scheme = %scheme, "tool needs authentication");
                needs_auth.insert(
                    call.id.clone(),
                    AuthRequest {
                        request_id,
                        scheme,
                        function_call_id: call.id.clone(),
                        tool_name: call.name.clone(),
                        args: call.args.clone(),
                        agent: ctx.agent.name.clone(),
                    },
                );
                auth_actions.merge(actions);
                continue;
            }
            Err(e) => {
                tracing::warn!(tool = %call.name, call_id = %call.id, error = %e, "tool failed; returning error to model");
                error_response(&e)
            }
        };
        if let Some(target) = &actions.transfer_to_agent {
            transfer = Some(target.clone());
        }
        if actions.escalate && escalation.is_none() {
            tracing::info!(tool = %call.name, call_id = %call.id, "tool escalated; turn ends after results");
            escalation = Some(response_text(&response));
        }
        let event = function_response_event(ctx, &call.id, &call.name, response, actions);
        ctx.emit(event).await?;
    }

    if !needs_auth.is_empty() {
        let mut pending = pending_auth(&ctx.session.state);
        pending.extend(needs_auth.clone());
        auth_actions
            .state_delta
            .insert(PENDING_AUTH_KEY.to_string(), pending_auth_value(&pending));
        let event = auth_event(ctx, &needs_auth, auth_actions);
        let committed = ctx.emit(event).await?;
        ctx.final_text = committed.text();
        return Ok(DispatchResult::AuthRequired);
    }

    Ok(match (escalation, transfer) {
        (Some(text), _) => DispatchResult::Escalate(text),
        (None, Some(target)) => DispatchResult::Transfer(target),
        (None, None) => DispatchResult::Continue,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrap_response() {
        assert_eq!(wrap_response(json!({"a": 1})), json!({"a": 1}));
        assert_eq!(wrap_response(json!(30)), json!({"result": 30}));
        assert_eq!(
            error_response(&ToolError::NotFound("nope".into())),
            json!({"error": "Tool not found: nope"})
        );
        assert_eq!(response_text(&json!({"result": "done"})), "done");
        assert_eq!(response_text(&json!({"result": 3})), r#"{"result":3}"#);
    }

    #[test]
    fn test_pending_auth_round_trip() {
        let mut pending = BTreeMap::new();
        pending.insert(
            "call_1".to_string(),
            AuthRequest {
                request_id: "auth_1".into(),
                scheme: "api_key".into(),
                function_call_id: "call_1".into(),
                tool_name: "get_balance".into(),
                args: json!({"account": "A"}),
                agent: "bank".into(),
            },
        );
        let mut state = StateMap::new();
        state.insert(PENDING_AUTH_KEY.into(), pending_auth_value(&pending));
        assert_eq!(pending_auth(&state), pending);
        assert_eq!(pending_auth_value(&BTreeMap::new()), Value::Null);
        assert!(pending_auth(&StateMap::new()).is_empty());
    }
}
