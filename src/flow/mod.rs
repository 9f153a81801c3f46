//! 编排层：请求 / 回复处理器、函数调用分发、主循环与运行配置

pub mod functions;
pub mod loop_;
pub mod request_processors;
pub mod response_processors;
pub mod run_config;

pub use functions::{dispatch, DispatchResult, ToolCallRecord, PENDING_AUTH_KEY, REQUEST_CREDENTIAL};
pub use loop_::{run_turn, CANCELLED_TEXT, CODE_EXECUTION_FAILED, CODE_EXECUTOR_ERROR};
pub use request_processors::{default_request_processors, Preprocess, RequestProcessor};
pub use response_processors::{default_response_processors, ResponseProcessor};
pub use run_config::{RunConfig, ToolInterceptor};
