//! 编排主循环：驱动一轮对话直到得到终止回复
//!
//! 每个 cycle：请求处理器 -> 计数 -> 模型调用（唯一挂起点）-> 回复处理器 -> 分类：
//! 函数调用则分发后回到 PREPARING；代码块则执行后回到 PREPARING；否则 FINALIZING。
//! 取消只在 cycle 边界生效，不回滚已提交事件。

use futures_util::StreamExt;

use crate::agent::{InvocationContext, ModelRef};
use crate::code_executor::CodeExecutionInput;
use crate::core::{FlowError, FlowPhase, TurnStatus};
use crate::flow::functions::{dispatch, DispatchResult};
use crate::flow::request_processors::{default_request_processors, Preprocess};
use crate::flow::response_processors::default_response_processors;
use crate::llm::{LlmClient, LlmError, LlmRequest, LlmResponse};
use crate::session::{Content, Event, FunctionCall, Part, Role, CODE_EXECUTOR_AUTHOR};

pub const CODE_EXECUTION_FAILED: &str = "CODE_EXECUTION_FAILED";
pub const CODE_EXECUTOR_ERROR: &str = "CODE_EXECUTOR_ERROR";
pub const CANCELLED_TEXT: &str = "Cancelled: the invocation was ended before a final answer.";

fn advance(ctx: &InvocationContext, phase: &mut FlowPhase, next: FlowPhase) {
    debug_assert!(phase.can_transition_to(next), "illegal transition {phase} -> {next}");
    tracing::debug!(invocation_id = %ctx.invocation_id, agent = %ctx.agent.name, from = %phase, to = %next, "phase");
    *phase = next;
}

/// 运行一轮；非致命结局以 TurnStatus 返回，致命错误（配置、调用上限）以 Err 返回
pub async fn run_turn(ctx: &mut InvocationContext) -> Result<TurnStatus, FlowError> {
    let request_processors = default_request_processors();
    let response_processors = default_response_processors();
    let mut phase = FlowPhase::Preparing;

    loop {
        if ctx.is_cancelled() {
            tracing::info!(invocation_id = %ctx.invocation_id, "invocation ended at cycle boundary");
            ctx.final_text = Some(CANCELLED_TEXT.to_string());
            return Ok(TurnStatus::Cancelled);
        }

        let model = ctx
            .agent
            .effective_model(&ctx.root_agent)
            .ok_or_else(|| FlowError::Config(format!("agent {} has no model", ctx.agent.name)))?;
        let mut request = LlmRequest::new(model.name());
        for processor in &request_processors {
            if let Preprocess::Halt(status) = processor.process(ctx, &mut request).await? {
                tracing::info!(invocation_id = %ctx.invocation_id, processor = processor.name(), ?status, "turn halted before model call");
                return Ok(status);
            }
        }

        let step = ctx.increment_llm_call_count()?;
        let client = match model {
            ModelRef::Client(client) => client,
            ModelRef::Name(name) => ctx.registry.resolve(&name)?,
        };

        advance(ctx, &mut phase, FlowPhase::AwaitingModel);
        tracing::debug!(invocation_id = %ctx.invocation_id, model = %request.model, step, "calling model");
        let mut response = match call_model(ctx, client.as_ref(), &request).await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(invocation_id = %ctx.invocation_id, model = %request.model, error = %e, "model call failed");
                fail(ctx, &e.code(), &e.to_string()).await?;
                return Ok(TurnStatus::ModelError);
            }
        };
        if let Some(code) = response.error_code.clone() {
            let message = response.error_message.clone().unwrap_or_else(|| code.clone());
            tracing::warn!(invocation_id = %ctx.invocation_id, code = %code, "model returned an error");
            fail(ctx, &code, &message).await?;
            return Ok(TurnStatus::ModelError);
        }

        advance(ctx, &mut phase, FlowPhase::Interpreting);
        for processor in &response_processors {
            processor.process(ctx, &mut response).await?;
        }

        let mut content = response.content.unwrap_or_else(|| Content::new(Role::Model, Vec::new()));
        content.role = Role::Model;
        for part in content.parts.iter_mut() {
            if let Part::FunctionCall(fc) = part {
                if fc.id.is_empty() {
                    fc.id = crate::session::new_function_call_id();
                }
            }
        }
        let calls: Vec<FunctionCall> = content.function_calls().cloned().collect();
        let code = if ctx.agent.code_executor.is_some() {
            content.executable_code().map(|c| c.code.clone())
        } else {
            None
        };

        let mut event = Event::new(&ctx.invocation_id, &ctx.agent.name).with_content(content);
        event.turn_complete = calls.is_empty() && code.is_none();
        let committed = ctx.emit(event).await?;

        if !calls.is_empty() {
            advance(ctx, &mut phase, FlowPhase::DispatchingTool);
            match dispatch(ctx, calls).await? {
                DispatchResult::Continue => {}
                DispatchResult::AuthRequired => return Ok(TurnStatus::AuthRequired),
                DispatchResult::Escalate(text) => {
                    advance(ctx, &mut phase, FlowPhase::Finalizing);
                    ctx.final_text = Some(text);
                    return Ok(TurnStatus::Completed);
                }
                DispatchResult::Transfer(target) => {
                    let next = ctx
                        .root_agent
                        .find_agent(&target)
                        .ok_or_else(|| FlowError::Config(format!("unknown transfer target: {target}")))?;
                    tracing::info!(invocation_id = %ctx.invocation_id, from = %ctx.agent.name, to = %next.name, "control transferred");
                    ctx.agent = next;
                    ctx.reset_code_errors();
                }
            }
            advance(ctx, &mut phase, FlowPhase::Preparing);
            continue;
        }

        if let Some(code) = code {
            advance(ctx, &mut phase, FlowPhase::DispatchingTool);
            if let Some(status) = execute_code(ctx, code).await? {
                return Ok(status);
            }
            advance(ctx, &mut phase, FlowPhase::Preparing);
            continue;
        }

        advance(ctx, &mut phase, FlowPhase::Finalizing);
        ctx.final_text = committed.text();
        return Ok(TurnStatus::Completed);
    }
}

/// 流式模式下 partial 片段只投递给观察者，返回最后的完整回复
async fn call_model(
    ctx: &InvocationContext,
    client: &dyn LlmClient,
    request: &LlmRequest,
) -> Result<LlmResponse, LlmError> {
    if !ctx.run_config.streaming {
        return client.generate(request).await;
    }
    let mut stream = client.generate_stream(request).await?;
    let mut last = None;
    while let Some(item) = stream.next().await {
        let response = item?;
        if response.partial {
            if let Some(content) = &response.content {
                let event = Event::new(&ctx.invocation_id, &ctx.agent.name)
                    .with_content(content.clone())
                    .with_partial(true);
                ctx.notify(&event);
            }
        } else {
            last = Some(response);
        }
    }
    last.ok_or_else(|| LlmError::Decode("stream ended without a final response".into()))
}

/// 带错误码的终止事件，同时作为本轮的可展示文本
async fn fail(ctx: &mut InvocationContext, code: &str, message: &str) -> Result<(), FlowError> {
    let event = Event::error(&ctx.invocation_id, &ctx.agent.name, code, message);
    ctx.emit(event).await?;
    ctx.final_text = Some(message.to_string());
    Ok(())
}

/// 执行代码块；返回 Some 表示本轮以该状态结束
async fn execute_code(ctx: &mut InvocationContext, code: String) -> Result<Option<TurnStatus>, FlowError> {
    let Some(executor) = ctx.agent.code_executor.clone() else {
        return Ok(None);
    };
    let config = executor.config().clone();
    let input = CodeExecutionInput {
        code,
        session_id: config.stateful.then(|| ctx.session.id.clone()),
        execution_id: Some(uuid::Uuid::new_v4().to_string()),
    };

    let result = match executor.execute(&input).await {
        Ok(r) => r,
        Err(e) => {
            tracing::error!(invocation_id = %ctx.invocation_id, executor = executor.name(), error = %e, "code executor unavailable");
            fail(ctx, CODE_EXECUTOR_ERROR, &format!("Code execution is unavailable: {e}")).await?;
            return Ok(Some(TurnStatus::CodeExecutionFailed));
        }
    };

    let callback = ctx.callback_context();
    for file in &result.output_files {
        callback.save_artifact(&file.name, file.data.clone()).await?;
    }
    let output = result.to_output();
    let event = Event::new(&ctx.invocation_id, CODE_EXECUTOR_AUTHOR)
        .with_content(Content::new(Role::User, vec![Part::CodeExecutionResult(output.clone())]))
        .with_actions(callback.take_actions());
    ctx.emit(event).await?;

    if !output.is_error() {
        ctx.reset_code_errors();
        return Ok(None);
    }
    let failures = ctx.record_code_error();
    tracing::info!(invocation_id = %ctx.invocation_id, failures, limit = config.error_retry_attempts, "code execution error returned to model");
    if failures > config.error_retry_attempts {
        let message = format!(
            "Code execution failed {failures} times in a row; giving up.\n{}",
            output.stderr.trim_end()
        );
        fail(ctx, CODE_EXECUTION_FAILED, &message).await?;
        return Ok(Some(TurnStatus::CodeExecutionFailed));
    }
    Ok(None)
}
