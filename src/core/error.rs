//! 编排层错误分类
//!
//! 只有 Config 与 ResourceExhausted 会作为致命错误传出编排循环；
//! 工具 / 代码执行 / 模型错误都会被转换为普通（负面）事件，让对话继续。

use thiserror::Error;

use crate::code_executor::CodeExecutorError;
use crate::llm::LlmError;
use crate::tools::ToolError;

/// 编排循环、会话存储与各服务共享的错误类型
#[derive(Error, Debug)]
pub enum FlowError {
    /// 配置错误：未知模型名、重复工具名等，启动期致命，不重试
    #[error("Config error: {0}")]
    Config(String),

    /// 单轮模型调用次数超过上限（区分「循环失控」与「调用失败」）
    #[error("Resource exhausted: exceeded {limit} model calls in one turn")]
    ResourceExhausted { limit: usize },

    #[error("Session error: {0}")]
    Session(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    /// 代码执行基础设施故障（沙箱不可达、超时），不是被执行代码自身的错误
    #[error("Code executor error: {0}")]
    CodeExecution(#[from] CodeExecutorError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),
}

impl FlowError {
    /// 稳定的错误码，供调用方区分「循环失控」与其它失败
    pub fn code(&self) -> &'static str {
        match self {
            FlowError::Config(_) => "CONFIG_ERROR",
            FlowError::ResourceExhausted { .. } => "RESOURCE_EXHAUSTED",
            FlowError::Session(_) => "SESSION_ERROR",
            FlowError::Storage(_) => "STORAGE_ERROR",
            FlowError::Tool(_) => "TOOL_ERROR",
            FlowError::CodeExecution(_) => "CODE_EXECUTOR_ERROR",
            FlowError::Llm(_) => "LLM_ERROR",
        }
    }

    /// 是否属于必须传出编排循环的致命错误
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            FlowError::Config(_) | FlowError::ResourceExhausted { .. }
        )
    }
}

impl From<rusqlite::Error> for FlowError {
    fn from(e: rusqlite::Error) -> Self {
        FlowError::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for FlowError {
    fn from(e: serde_json::Error) -> Self {
        FlowError::Storage(format!("serialization: {e}"))
    }
}
