//! 工具并发调度
//!
//! 同一模型回复中的多个工具调用可以并发执行，使用 Semaphore 限制同时运行的数量；
//! 结果顺序由调用方按请求顺序收集，与这里的调度无关。

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// 工具调度器（默认最多 3 个并发）
#[derive(Clone, Debug)]
pub struct TaskScheduler {
    tool_semaphore: Arc<Semaphore>,
    max_concurrent_tools: usize,
}

impl TaskScheduler {
    pub fn new(max_concurrent_tools: usize) -> Self {
        let max_concurrent_tools = max_concurrent_tools.max(1);
        Self {
            tool_semaphore: Arc::new(Semaphore::new(max_concurrent_tools)),
            max_concurrent_tools,
        }
    }

    /// 获取工具执行许可；信号量从不关闭，None 仅在被关闭时出现
    pub async fn acquire_tool(&self) -> Option<OwnedSemaphorePermit> {
        self.tool_semaphore.clone().acquire_owned().await.ok()
    }

    pub fn max_concurrent_tools(&self) -> usize {
        self.max_concurrent_tools
    }
}

impl Default for TaskScheduler {
    fn default() -> Self {
        Self::new(3)
    }
}
