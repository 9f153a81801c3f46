//! 核心层：错误分类、编排状态机、工具并发调度

pub mod error;
pub mod state;
pub mod task_scheduler;

pub use error::FlowError;
pub use state::{FlowPhase, TurnStatus};
pub use task_scheduler::TaskScheduler;
