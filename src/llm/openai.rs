//! OpenAI 兼容 API 客户端
//!
//! 通过 reqwest 直接调用任意 OpenAI 兼容端点（可配置 base_url）；支持 DeepSeek、OpenAI、自建代理等。
//! 统一请求被翻译成 chat-completions 格式（system / user / assistant+tool_calls / tool 消息），
//! 流式模式解析 SSE，文本增量作为 partial 回复逐条产出，结束时产出完整回复。

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream};
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::llm::request::{LlmRequest, LlmResponse, UsageMetadata};
use crate::llm::{LlmClient, LlmError, LlmStream};
use crate::session::{Content, Part, Role};

pub const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEEPSEEK_BASE_URL: &str = "https://api.deepseek.com";

/// Token 使用统计（累计值）
#[derive(Debug, Clone, Default)]
pub struct TokenUsage {
    pub prompt_tokens: Arc<AtomicU64>,
    pub completion_tokens: Arc<AtomicU64>,
}

impl TokenUsage {
    pub fn add(&self, usage: &UsageMetadata) {
        self.prompt_tokens.fetch_add(usage.prompt_tokens, Ordering::Relaxed);
        self.completion_tokens
            .fetch_add(usage.completion_tokens, Ordering::Relaxed);
    }

    /// (prompt, completion, total)
    pub fn get(&self) -> (u64, u64, u64) {
        let p = self.prompt_tokens.load(Ordering::Relaxed);
        let c = self.completion_tokens.load(Ordering::Relaxed);
        (p, c, p + c)
    }
}

/// OpenAI 兼容客户端：持有 HTTP Client、端点与 model 名
pub struct OpenAiCompatibleClient {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
    pub usage: TokenUsage,
}

impl OpenAiCompatibleClient {
    pub fn new(base_url: Option<&str>, model: &str, api_key: Option<&str>, timeout: Duration) -> Self {
        let api_key = api_key
            .map(String::from)
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .unwrap_or_else(|| "sk-placeholder".to_string());
        let base = base_url.unwrap_or(OPENAI_BASE_URL).trim_end_matches('/');
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            http,
            endpoint: format!("{base}/chat/completions"),
            api_key,
            model: model.to_string(),
            usage: TokenUsage::default(),
        }
    }

    /// DeepSeek 预设：同一协议，不同端点与密钥变量（DEEPSEEK_API_KEY 优先）
    pub fn deepseek(model: &str, timeout: Duration) -> Self {
        let api_key = std::env::var("DEEPSEEK_API_KEY").ok();
        Self::new(Some(DEEPSEEK_BASE_URL), model, api_key.as_deref(), timeout)
    }

    pub fn token_usage(&self) -> (u64, u64, u64) {
        self.usage.get()
    }

    async fn post(&self, body: &Value) -> Result<reqwest::Response, LlmError> {
        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let text = response.text().await.unwrap_or_default();
        Err(api_error(status.as_u16(), &text))
    }
}

#[async_trait]
impl LlmClient for OpenAiCompatibleClient {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError> {
        let body = build_request_body(&self.model, request, false);
        tracing::debug!(model = %self.model, messages = body["messages"].as_array().map(Vec::len).unwrap_or(0), "chat completion");
        let raw = self.post(&body).await?.text().await?;
        let response = parse_completion(&raw)?;
        if let Some(usage) = &response.usage {
            self.usage.add(usage);
        }
        Ok(response)
    }

    async fn generate_stream(&self, request: &LlmRequest) -> Result<LlmStream, LlmError> {
        let body = build_request_body(&self.model, request, true);
        let response = self.post(&body).await?;
        let bytes: BoxStream<'static, Result<Vec<u8>, reqwest::Error>> = response
            .bytes_stream()
            .map(|r| r.map(|b| b.to_vec()))
            .boxed();

        let state = SseState {
            body: bytes,
            decoder: SseDecoder::default(),
            pending: VecDeque::new(),
            finished: false,
        };
        let usage = self.usage.clone();
        let stream = stream::unfold(state, |mut st| async move {
            loop {
                if let Some(item) = st.pending.pop_front() {
                    return Some((item, st));
                }
                if st.finished {
                    return None;
                }
                match st.body.next().await {
                    Some(Ok(chunk)) => {
                        let (items, done) = st.decoder.feed(&chunk);
                        st.pending.extend(items);
                        if done {
                            st.finished = true;
                            st.pending.push_back(st.decoder.finish());
                        }
                    }
                    Some(Err(e)) => {
                        st.finished = true;
                        st.pending.push_back(Err(e.into()));
                    }
                    None => {
                        st.finished = true;
                        st.pending.push_back(st.decoder.finish());
                    }
                }
            }
        })
        .inspect(move |item| {
            if let Ok(LlmResponse {
                partial: false,
                usage: Some(u),
                ..
            }) = item
            {
                usage.add(u);
            }
        });
        Ok(Box::pin(stream))
    }
}

fn api_error(status: u16, body: &str) -> LlmError {
    let parsed: Option<Value> = serde_json::from_str(body).ok();
    let err = parsed.as_ref().and_then(|v| v.get("error"));
    let code = err
        .and_then(|e| e.get("code").or_else(|| e.get("type")))
        .and_then(Value::as_str)
        .map(String::from)
        .unwrap_or_else(|| format!("HTTP_{status}"));
    let message = err
        .and_then(|e| e.get("message"))
        .and_then(Value::as_str)
        .map(String::from)
        .unwrap_or_else(|| body.chars().take(500).collect());
    LlmError::Api { code, message }
}

/// 统一请求 -> chat-completions 请求体
pub fn build_request_body(model: &str, request: &LlmRequest, stream: bool) -> Value {
    let mut messages = Vec::new();
    if let Some(system) = request.system_instruction() {
        messages.push(json!({"role": "system", "content": system}));
    }
    for content in &request.contents {
        push_wire_messages(content, &mut messages);
    }

    let mut body = json!({
        "model": model,
        "messages": messages,
        "stream": stream,
    });
    if !request.tools.is_empty() {
        body["tools"] = Value::Array(
            request
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters,
                        }
                    })
                })
                .collect(),
        );
    }
    if let Some(t) = request.config.temperature {
        body["temperature"] = json!(t);
    }
    if let Some(n) = request.config.max_output_tokens {
        body["max_tokens"] = json!(n);
    }
    if !request.config.stop_sequences.is_empty() {
        body["stop"] = json!(request.config.stop_sequences);
    }
    if stream {
        body["stream_options"] = json!({"include_usage": true});
    }
    body
}

fn push_wire_messages(content: &Content, out: &mut Vec<Value>) {
    let mut text = String::new();
    let mut tool_calls = Vec::new();
    let mut tool_results = Vec::new();
    for part in &content.parts {
        match part {
            Part::Text { text: t, thought: false } => text.push_str(t),
            Part::Text { thought: true, .. } => {}
            Part::FunctionCall(fc) => tool_calls.push(json!({
                "id": fc.id,
                "type": "function",
                "function": {"name": fc.name, "arguments": fc.args.to_string()},
            })),
            Part::FunctionResponse(fr) => tool_results.push(json!({
                "role": "tool",
                "tool_call_id": fr.id,
                "content": fr.response.to_string(),
            })),
            Part::ExecutableCode(code) => text.push_str(&code.code),
            Part::CodeExecutionResult(res) => text.push_str(&res.stdout),
        }
    }

    match content.role {
        Role::Model => {
            if text.is_empty() && tool_calls.is_empty() {
                return;
            }
            let mut msg = json!({
                "role": "assistant",
                "content": if text.is_empty() { Value::Null } else { Value::String(text) },
            });
            if !tool_calls.is_empty() {
                msg["tool_calls"] = Value::Array(tool_calls);
            }
            out.push(msg);
        }
        Role::User | Role::Tool => {
            out.extend(tool_results);
            if !text.is_empty() {
                out.push(json!({"role": "user", "content": text}));
            }
        }
    }
}

#[derive(Deserialize)]
struct ChatCompletion {
    #[serde(default)]
    choices: Vec<Choice>,
    usage: Option<WireUsage>,
}

#[derive(Deserialize)]
struct Choice {
    message: WireMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct WireMessage {
    content: Option<String>,
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Deserialize)]
struct WireToolCall {
    id: String,
    function: WireFunction,
}

#[derive(Deserialize)]
struct WireFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Deserialize, Clone, Copy)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

impl From<WireUsage> for UsageMetadata {
    fn from(u: WireUsage) -> Self {
        UsageMetadata {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
        }
    }
}

fn parse_arguments(raw: &str) -> Result<Value, LlmError> {
    if raw.trim().is_empty() {
        return Ok(json!({}));
    }
    serde_json::from_str(raw).map_err(|e| LlmError::Decode(format!("tool arguments: {e}")))
}

fn build_response(
    text: String,
    calls: Vec<(String, String, String)>,
    finish_reason: Option<&str>,
    usage: Option<UsageMetadata>,
) -> Result<LlmResponse, LlmError> {
    if finish_reason == Some("content_filter") {
        return Err(LlmError::Safety("response blocked by content filter".into()));
    }
    let mut parts = Vec::new();
    if !text.is_empty() {
        parts.push(Part::text(text));
    }
    for (id, name, args) in calls {
        parts.push(Part::function_call(id, name, parse_arguments(&args)?));
    }
    Ok(LlmResponse {
        content: Some(Content::new(Role::Model, parts)),
        usage,
        ..Default::default()
    })
}

/// 非流式回复 -> 统一回复
pub fn parse_completion(raw: &str) -> Result<LlmResponse, LlmError> {
    let completion: ChatCompletion =
        serde_json::from_str(raw).map_err(|e| LlmError::Decode(e.to_string()))?;
    let choice = completion
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| LlmError::Decode("no choices in response".into()))?;
    let calls = choice
        .message
        .tool_calls
        .unwrap_or_default()
        .into_iter()
        .map(|c| (c.id, c.function.name, c.function.arguments))
        .collect();
    build_response(
        choice.message.content.unwrap_or_default(),
        calls,
        choice.finish_reason.as_deref(),
        completion.usage.map(Into::into),
    )
}

#[derive(Deserialize)]
struct ChatChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    usage: Option<WireUsage>,
}

#[derive(Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
    finish_reason: Option<String>,
}

#[derive(Deserialize, Default)]
struct ChunkDelta {
    content: Option<String>,
    tool_calls: Option<Vec<ChunkToolCall>>,
}

#[derive(Deserialize)]
struct ChunkToolCall {
    #[serde(default)]
    index: usize,
    id: Option<String>,
    function: Option<ChunkFunction>,
}

#[derive(Deserialize)]
struct ChunkFunction {
    name: Option<String>,
    arguments: Option<String>,
}

struct SseState {
    body: BoxStream<'static, Result<Vec<u8>, reqwest::Error>>,
    decoder: SseDecoder,
    pending: VecDeque<Result<LlmResponse, LlmError>>,
    finished: bool,
}

/// SSE 增量解码：按行切分 `data:` 负载，累积文本与 tool_calls 片段
#[derive(Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    text: String,
    /// index -> (id, name, arguments)
    calls: BTreeMap<usize, (String, String, String)>,
    finish_reason: Option<String>,
    usage: Option<UsageMetadata>,
}

impl SseDecoder {
    /// 喂入一段字节；返回产生的 partial 回复，以及是否已见到 `[DONE]`
    pub fn feed(&mut self, chunk: &[u8]) -> (Vec<Result<LlmResponse, LlmError>>, bool) {
        self.buffer.extend_from_slice(chunk);
        let mut out = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let Some(payload) = line.trim().strip_prefix("data:") else {
                continue;
            };
            let payload = payload.trim();
            if payload == "[DONE]" {
                return (out, true);
            }
            match serde_json::from_str::<ChatChunk>(payload) {
                Ok(chunk) => {
                    if let Some(partial) = self.apply(chunk) {
                        out.push(Ok(partial));
                    }
                }
                Err(e) => out.push(Err(LlmError::Decode(format!("sse chunk: {e}")))),
            }
        }
        (out, false)
    }

    fn apply(&mut self, chunk: ChatChunk) -> Option<LlmResponse> {
        if let Some(u) = chunk.usage {
            self.usage = Some(u.into());
        }
        let mut delta_text = String::new();
        for choice in chunk.choices {
            if let Some(reason) = choice.finish_reason {
                self.finish_reason = Some(reason);
            }
            if let Some(t) = choice.delta.content {
                delta_text.push_str(&t);
            }
            for call in choice.delta.tool_calls.unwrap_or_default() {
                let entry = self.calls.entry(call.index).or_default();
                if let Some(id) = call.id {
                    entry.0 = id;
                }
                if let Some(f) = call.function {
                    if let Some(name) = f.name {
                        entry.1.push_str(&name);
                    }
                    if let Some(args) = f.arguments {
                        entry.2.push_str(&args);
                    }
                }
            }
        }
        if delta_text.is_empty() {
            return None;
        }
        self.text.push_str(&delta_text);
        Some(LlmResponse {
            partial: true,
            ..LlmResponse::text(delta_text)
        })
    }

    /// 汇总为完整回复
    pub fn finish(&mut self) -> Result<LlmResponse, LlmError> {
        let calls = std::mem::take(&mut self.calls).into_values().collect();
        build_response(
            std::mem::take(&mut self.text),
            calls,
            self.finish_reason.as_deref(),
            self.usage,
        )
    }
}
