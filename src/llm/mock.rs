//! Mock LLM 客户端（用于测试，无需 API）
//!
//! 先按顺序返回预置脚本；脚本耗尽后回显：上一条是工具结果则复述结果，否则回显最后一条用户消息。
//! 每次请求都会被记录，测试可以断言模型实际看到了什么。

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use futures_util::stream;
use serde_json::Value;

use crate::llm::request::{LlmRequest, LlmResponse};
use crate::llm::{LlmClient, LlmError, LlmStream};
use crate::session::{Content, Part, Role};

pub struct MockLlmClient {
    name: String,
    script: Mutex<VecDeque<Result<LlmResponse, LlmError>>>,
    requests: Mutex<Vec<LlmRequest>>,
}

impl MockLlmClient {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            script: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn with_responses(name: impl Into<String>, responses: Vec<LlmResponse>) -> Self {
        let client = Self::new(name);
        for r in responses {
            client.push_response(r);
        }
        client
    }

    pub fn push_response(&self, response: LlmResponse) {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(Ok(response));
        }
    }

    pub fn push_error(&self, error: LlmError) {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(Err(error));
        }
    }

    /// 便捷脚本：一次函数调用
    pub fn push_function_call(&self, id: &str, name: &str, args: Value) {
        self.push_response(LlmResponse::from_content(Content::new(
            Role::Model,
            vec![Part::function_call(id, name, args)],
        )));
    }

    pub fn requests(&self) -> Vec<LlmRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().map(|r| r.len()).unwrap_or(0)
    }

    fn echo(request: &LlmRequest) -> LlmResponse {
        if let Some(last) = request.contents.last() {
            if let Some(resp) = last.function_responses().last() {
                let shown = match resp.response.get("result") {
                    Some(Value::String(s)) => s.clone(),
                    Some(v) => v.to_string(),
                    None => resp.response.to_string(),
                };
                return LlmResponse::text(format!("Tool {} returned: {}", resp.name, shown));
            }
        }
        let user = request
            .last_user_text()
            .unwrap_or_else(|| "(no input)".to_string());
        LlmResponse::text(format!("Echo: {user}"))
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    fn model_name(&self) -> &str {
        &self.name
    }

    async fn generate(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }
        let scripted = self.script.lock().ok().and_then(|mut s| s.pop_front());
        match scripted {
            Some(result) => result,
            None => Ok(Self::echo(request)),
        }
    }

    /// 把纯文本回复按词切成若干 partial，再给出完整的最终回复
    async fn generate_stream(&self, request: &LlmRequest) -> Result<LlmStream, LlmError> {
        let response = self.generate(request).await?;
        let text = response
            .content
            .as_ref()
            .filter(|c| c.parts.iter().all(|p| matches!(p, Part::Text { .. })))
            .and_then(Content::text);
        let mut items = Vec::new();
        if let Some(text) = text {
            for word in text.split_inclusive(' ') {
                items.push(Ok(LlmResponse {
                    partial: true,
                    ..LlmResponse::text(word)
                }));
            }
        }
        items.push(Ok(response));
        Ok(Box::pin(stream::iter(items)))
    }
}
