//! 回复处理器：在分类之前改写模型回复
//!
//! - CodeExecution：识别第一个代码块，截断其后的文本，转成 ExecutableCode
//! - Planning：规划 / 推理片段标记为 thought，只把最终答案作为可展示文本

use async_trait::async_trait;

use crate::agent::InvocationContext;
use crate::code_executor::extract_code_and_truncate;
use crate::core::FlowError;
use crate::llm::LlmResponse;
use crate::session::{Content, Part};

#[async_trait]
pub trait ResponseProcessor: Send + Sync {
    fn name(&self) -> &'static str;

    async fn process(&self, ctx: &mut InvocationContext, response: &mut LlmResponse) -> Result<(), FlowError>;
}

pub fn default_response_processors() -> Vec<Box<dyn ResponseProcessor>> {
    vec![Box::new(PlanningResponseProcessor), Box::new(CodeExecutionResponseProcessor)]
}

pub struct CodeExecutionResponseProcessor;

#[async_trait]
impl ResponseProcessor for CodeExecutionResponseProcessor {
    fn name(&self) -> &'static str {
        "code_execution_response"
    }

    async fn process(&self, ctx: &mut InvocationContext, response: &mut LlmResponse) -> Result<(), FlowError> {
        let Some(executor) = &ctx.agent.code_executor else {
            return Ok(());
        };
        let Some(content) = response.content.as_mut() else {
            return Ok(());
        };
        // 函数调用优先于代码块
        if content.function_calls().next().is_some() {
            return Ok(());
        }
        if let Some(code) = extract_code_and_truncate(content, &executor.config().code_block_delimiters) {
            tracing::debug!(invocation_id = %ctx.invocation_id, chars = code.len(), "code block extracted");
        }
        Ok(())
    }
}

pub const PLANNING_TAG: &str = "/*PLANNING*/";
pub const REPLANNING_TAG: &str = "/*REPLANNING*/";
pub const REASONING_TAG: &str = "/*REASONING*/";
pub const ACTION_TAG: &str = "/*ACTION*/";
pub const FINAL_ANSWER_TAG: &str = "/*FINAL_ANSWER*/";

pub struct PlanningResponseProcessor;

impl PlanningResponseProcessor {
    pub fn split_planning(content: &mut Content) {
        let mut parts = Vec::with_capacity(content.parts.len());
        for part in content.parts.drain(..) {
            let text = match part {
                Part::Text { text, thought: false } => text,
                other => {
                    parts.push(other);
                    continue;
                }
            };
            if let Some(idx) = text.rfind(FINAL_ANSWER_TAG) {
                let (before, after) = text.split_at(idx);
                if !before.trim().is_empty() {
                    parts.push(Part::thought(before));
                }
                let answer = after[FINAL_ANSWER_TAG.len()..].trim_start();
                if !answer.is_empty() {
                    parts.push(Part::text(answer));
                }
            } else if [PLANNING_TAG, REPLANNING_TAG, REASONING_TAG, ACTION_TAG]
                .iter()
                .any(|tag| text.trim_start().starts_with(tag))
            {
                parts.push(Part::thought(text));
            } else {
                parts.push(Part::text(text));
            }
        }
        content.parts = parts;
    }
}

#[async_trait]
impl ResponseProcessor for PlanningResponseProcessor {
    fn name(&self) -> &'static str {
        "planning_response"
    }

    async fn process(&self, ctx: &mut InvocationContext, response: &mut LlmResponse) -> Result<(), FlowError> {
        if !ctx.agent.planning {
            return Ok(());
        }
        if let Some(content) = response.content.as_mut() {
            Self::split_planning(content);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Role;
    use serde_json::json;

    #[test]
    fn test_final_answer_split() {
        let mut content = Content::model_text("/*PLANNING*/\n1. add numbers\n/*FINAL_ANSWER*/\nThe sum is 12.");
        PlanningResponseProcessor::split_planning(&mut content);
        assert_eq!(content.text().as_deref(), Some("The sum is 12."));
        assert!(matches!(&content.parts[0], Part::Text { thought: true, .. }));
    }

    #[test]
    fn test_plan_only_text_becomes_thought() {
        let mut content = Content::new(
            Role::Model,
            vec![
                Part::text("/*ACTION*/ calling add"),
                Part::function_call("c1", "add", json!({"a": 1, "b": 2})),
            ],
        );
        PlanningResponseProcessor::split_planning(&mut content);
        assert!(content.text().is_none());
        assert_eq!(content.function_calls().count(), 1);
    }

    #[test]
    fn test_plain_text_untouched() {
        let mut content = Content::model_text("Hello");
        PlanningResponseProcessor::split_planning(&mut content);
        assert_eq!(content, Content::model_text("Hello"));
    }
}
