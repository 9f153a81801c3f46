//! 工具层：三种工具变体、工具集、内置工具与带超时 / 审计的执行器

pub mod agent_tool;
pub mod builtin;
pub mod executor;
pub mod function;
pub mod registry;
pub mod rest_api;

pub use agent_tool::AgentTool;
pub use builtin::TRANSFER_TO_AGENT;
pub use executor::ToolExecutor;
pub use function::{schema_of, FunctionTool};
pub use registry::{Tool, ToolError, ToolOutcome, Toolset};
pub use rest_api::{HttpMethod, ParamLocation, RestApiTool, RestParam};
