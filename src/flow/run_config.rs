//! 单次运行的配置：调用上限、流式、工具并发、超时、mock 注入、取消

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;

/// 工具调用拦截：返回 Some 时用该值代替真实调用（评测 mock）
pub trait ToolInterceptor: Send + Sync {
    fn intercept(&self, tool_name: &str, args: &Value) -> Option<Value>;
}

#[derive(Clone)]
pub struct RunConfig {
    /// 单轮模型调用上限；0 表示不限制
    pub max_llm_calls: usize,
    pub streaming: bool,
    pub max_concurrent_tools: usize,
    pub tool_timeout: Duration,
    pub tool_interceptor: Option<Arc<dyn ToolInterceptor>>,
    /// 取消后在下一个 cycle 边界结束本轮
    pub end_invocation: CancellationToken,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_llm_calls: 20,
            streaming: false,
            max_concurrent_tools: 3,
            tool_timeout: Duration::from_secs(30),
            tool_interceptor: None,
            end_invocation: CancellationToken::new(),
        }
    }
}

impl RunConfig {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            max_llm_calls: config.run.max_llm_calls,
            streaming: config.run.streaming,
            max_concurrent_tools: config.run.max_concurrent_tools,
            tool_timeout: Duration::from_secs(config.tools.tool_timeout_secs),
            ..Self::default()
        }
    }

    pub fn with_interceptor(mut self, interceptor: Arc<dyn ToolInterceptor>) -> Self {
        self.tool_interceptor = Some(interceptor);
        self
    }

    pub fn with_max_llm_calls(mut self, limit: usize) -> Self {
        self.max_llm_calls = limit;
        self
    }

    pub fn with_streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }
}

impl std::fmt::Debug for RunConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunConfig")
            .field("max_llm_calls", &self.max_llm_calls)
            .field("streaming", &self.streaming)
            .field("max_concurrent_tools", &self.max_concurrent_tools)
            .field("tool_timeout", &self.tool_timeout)
            .field("tool_interceptor", &self.tool_interceptor.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_config_copies_limits() {
        let mut cfg = AppConfig::default();
        cfg.run.max_llm_calls = 5;
        cfg.run.streaming = true;
        cfg.tools.tool_timeout_secs = 7;
        let rc = RunConfig::from_config(&cfg);
        assert_eq!(rc.max_llm_calls, 5);
        assert!(rc.streaming);
        assert_eq!(rc.tool_timeout, Duration::from_secs(7));
        assert!(rc.tool_interceptor.is_none());
    }
}
