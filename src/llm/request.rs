//! 模型网关的统一请求 / 回复形状
//!
//! 各后端负责把 LlmRequest 翻译成厂商格式，再把厂商回复翻译回 LlmResponse。

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::session::Content;

/// 交给模型的工具声明
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FunctionDeclaration {
    pub name: String,
    pub description: String,
    /// JSON Schema（object）
    pub parameters: Value,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerateConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop_sequences: Vec<String>,
}

/// 一次模型调用的完整请求，由 request processor 依次填充
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LlmRequest {
    pub model: String,
    /// 系统指令片段，按追加顺序以空行拼接
    #[serde(default)]
    pub instructions: Vec<String>,
    #[serde(default)]
    pub contents: Vec<Content>,
    #[serde(default)]
    pub tools: Vec<FunctionDeclaration>,
    #[serde(default)]
    pub config: GenerateConfig,
}

impl LlmRequest {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Default::default()
        }
    }

    pub fn append_instruction(&mut self, text: impl Into<String>) {
        let text = text.into();
        if !text.trim().is_empty() {
            self.instructions.push(text);
        }
    }

    pub fn system_instruction(&self) -> Option<String> {
        if self.instructions.is_empty() {
            None
        } else {
            Some(self.instructions.join("\n\n"))
        }
    }

    /// 最近一条用户文本（Mock 回显、调试使用）
    pub fn last_user_text(&self) -> Option<String> {
        self.contents
            .iter()
            .rev()
            .filter(|c| c.role == crate::session::Role::User)
            .find_map(Content::text)
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.tools.iter().any(|t| t.name == name)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageMetadata {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

/// 模型回复：内容或结构化错误（错误码 + 消息）
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LlmResponse {
    #[serde(default)]
    pub content: Option<Content>,
    /// 流式增量片段
    #[serde(default)]
    pub partial: bool,
    #[serde(default)]
    pub error_code: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub usage: Option<UsageMetadata>,
}

impl LlmResponse {
    pub fn from_content(content: Content) -> Self {
        Self {
            content: Some(content),
            ..Default::default()
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::from_content(Content::model_text(text))
    }

    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error_code: Some(code.into()),
            error_message: Some(message.into()),
            ..Default::default()
        }
    }
}
