//! Agent 层：LLM agent 定义与层级、声明式定义文件、调用上下文

pub mod context;
pub mod definition;
pub mod llm_agent;

pub use context::{CallbackContext, InvocationContext, ReadonlyContext, ToolContext};
pub use definition::AgentDefinition;
pub use llm_agent::{render_template, LlmAgent, LlmAgentBuilder, ModelRef};
