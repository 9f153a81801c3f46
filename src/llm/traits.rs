//! LLM 客户端抽象
//!
//! 所有后端（OpenAI 兼容 / DeepSeek / Mock）实现 LlmClient：generate（非流式）、generate_stream（增量回复流）。

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::{stream, Stream};
use thiserror::Error;

use crate::llm::request::{LlmRequest, LlmResponse};

/// 增量回复流：除最后一项外都是 partial
pub type LlmStream = Pin<Box<dyn Stream<Item = Result<LlmResponse, LlmError>> + Send>>;

/// 模型网关错误；编排循环把它转成带错误码的终止事件，不重试
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LlmError {
    #[error("API error [{code}]: {message}")]
    Api { code: String, message: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Decode error: {0}")]
    Decode(String),

    /// 厂商安全拦截
    #[error("Blocked by safety filter: {0}")]
    Safety(String),
}

impl LlmError {
    /// 写入终止事件的错误码
    pub fn code(&self) -> String {
        match self {
            LlmError::Api { code, .. } => code.clone(),
            LlmError::Network(_) => "NETWORK_ERROR".to_string(),
            LlmError::Timeout => "TIMEOUT".to_string(),
            LlmError::Decode(_) => "MALFORMED_RESPONSE".to_string(),
            LlmError::Safety(_) => "SAFETY".to_string(),
        }
    }
}

impl From<reqwest::Error> for LlmError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            LlmError::Timeout
        } else if e.is_decode() {
            LlmError::Decode(e.to_string())
        } else {
            LlmError::Network(e.to_string())
        }
    }
}

/// LLM 客户端 trait
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// 模型标识
    fn model_name(&self) -> &str;

    /// 非流式生成
    async fn generate(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError>;

    /// 流式生成；默认退化为单项流
    async fn generate_stream(&self, request: &LlmRequest) -> Result<LlmStream, LlmError> {
        let response = self.generate(request).await?;
        Ok(Box::pin(stream::iter(vec![Ok(response)])))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(LlmError::Safety("x".into()).code(), "SAFETY");
        assert_eq!(
            LlmError::Api {
                code: "429".into(),
                message: "quota".into()
            }
            .code(),
            "429"
        );
        assert_eq!(LlmError::Timeout.code(), "TIMEOUT");
    }
}
