//! Bee Flow - LLM 工具调用编排核心
//!
//! 模块划分：
//! - **session**: 事件 / 内容模型、会话与分作用域状态、内存与 SQLite 存储
//! - **services**: artifact、长期记忆、凭证等外部协作服务
//! - **llm**: 模型网关（OpenAI 兼容 / DeepSeek / Mock）与模型名注册表
//! - **tools**: 函数 / 嵌套 agent / REST API 三种工具与执行器
//! - **code_executor**: 本地、容器、远程三种代码执行后端
//! - **agent**: LlmAgent 定义、agent 树与分层上下文视图
//! - **flow**: 请求 / 回复处理器与编排主循环
//! - **runner**: 会话寻址与单轮驱动
//! - **evaluation**: 评测用例、mock 注入与打分
//! - **core**: 错误分类、状态机、并发调度
//! - **config** / **observability**: 配置加载与日志

pub mod agent;
pub mod code_executor;
pub mod config;
pub mod core;
pub mod evaluation;
pub mod flow;
pub mod llm;
pub mod observability;
pub mod runner;
pub mod services;
pub mod session;
pub mod tools;

pub use agent::{AgentDefinition, LlmAgent};
pub use core::{FlowError, TurnStatus};
pub use runner::{Runner, TurnOutcome};
