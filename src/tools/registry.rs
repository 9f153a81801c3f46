//! 工具与工具集
//!
//! Tool 是封闭的三种变体：直接可调用函数、嵌套 agent、远程 REST API；
//! 都暴露稳定的声明（name / description / 参数 schema）与异步 invoke。
//! Toolset 在 agent 构造时检查名称唯一，重名是配置错误而不是调用期错误。

use serde_json::Value;
use thiserror::Error;

use crate::agent::ToolContext;
use crate::core::FlowError;
use crate::llm::FunctionDeclaration;
use crate::tools::{AgentTool, FunctionTool, RestApiTool};

/// 工具自身逻辑的失败；编排循环把它包装成结构化错误结果回交模型
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ToolError {
    #[error("Tool not found: {0}")]
    NotFound(String),

    #[error("Invalid arguments: {0}")]
    InvalidArgs(String),

    #[error("Tool execution failed: {0}")]
    Execution(String),

    #[error("Tool {0} timed out")]
    Timeout(String),
}

/// 工具调用的结果：返回值，或「需要认证」哨兵
#[derive(Clone, Debug, PartialEq)]
pub enum ToolOutcome {
    Value(Value),
    NeedsAuth { scheme: String, request_id: String },
}

impl From<Value> for ToolOutcome {
    fn from(v: Value) -> Self {
        ToolOutcome::Value(v)
    }
}

#[derive(Clone)]
pub enum Tool {
    Function(FunctionTool),
    Agent(AgentTool),
    RestApi(RestApiTool),
}

impl Tool {
    pub fn name(&self) -> &str {
        match self {
            Tool::Function(t) => t.name(),
            Tool::Agent(t) => t.name(),
            Tool::RestApi(t) => t.name(),
        }
    }

    pub fn is_long_running(&self) -> bool {
        match self {
            Tool::Function(t) => t.is_long_running(),
            Tool::Agent(_) | Tool::RestApi(_) => false,
        }
    }

    pub fn declaration(&self) -> FunctionDeclaration {
        match self {
            Tool::Function(t) => t.declaration(),
            Tool::Agent(t) => t.declaration(),
            Tool::RestApi(t) => t.declaration(),
        }
    }

    pub async fn invoke(&self, args: Value, ctx: ToolContext) -> Result<ToolOutcome, ToolError> {
        match self {
            Tool::Function(t) => t.invoke(args, ctx).await,
            Tool::Agent(t) => t.invoke(args, ctx).await,
            Tool::RestApi(t) => t.invoke(args, ctx).await,
        }
    }
}

impl From<FunctionTool> for Tool {
    fn from(t: FunctionTool) -> Self {
        Tool::Function(t)
    }
}

impl From<AgentTool> for Tool {
    fn from(t: AgentTool) -> Self {
        Tool::Agent(t)
    }
}

impl From<RestApiTool> for Tool {
    fn from(t: RestApiTool) -> Self {
        Tool::RestApi(t)
    }
}

/// 一个 agent 拥有的工具集合，保持声明顺序
#[derive(Clone, Default)]
pub struct Toolset {
    tools: Vec<Tool>,
}

impl Toolset {
    /// 重名即配置错误
    pub fn new(tools: Vec<Tool>) -> Result<Self, FlowError> {
        let mut seen = std::collections::HashSet::new();
        for tool in &tools {
            if tool.name().is_empty() {
                return Err(FlowError::Config("tool name must not be empty".into()));
            }
            if !seen.insert(tool.name().to_string()) {
                return Err(FlowError::Config(format!("duplicate tool name: {}", tool.name())));
            }
        }
        Ok(Self { tools })
    }

    pub fn get(&self, name: &str) -> Option<&Tool> {
        self.tools.iter().find(|t| t.name() == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.iter().map(|t| t.name().to_string()).collect()
    }

    pub fn declarations(&self) -> Vec<FunctionDeclaration> {
        self.tools.iter().map(Tool::declaration).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Tool> {
        self.tools.iter()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}
