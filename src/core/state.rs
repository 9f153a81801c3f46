//! 编排状态机与单轮结果状态
//!
//! PREPARING -> AWAITING_MODEL -> INTERPRETING -> {DISPATCHING_TOOL | FINALIZING}；
//! DISPATCHING_TOOL 折叠结果后回到 PREPARING，FINALIZING 为本轮终态。

use serde::Serialize;

/// 单个 cycle 内的阶段
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowPhase {
    Preparing,
    AwaitingModel,
    Interpreting,
    DispatchingTool,
    Finalizing,
}

impl FlowPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlowPhase::Preparing => "PREPARING",
            FlowPhase::AwaitingModel => "AWAITING_MODEL",
            FlowPhase::Interpreting => "INTERPRETING",
            FlowPhase::DispatchingTool => "DISPATCHING_TOOL",
            FlowPhase::Finalizing => "FINALIZING",
        }
    }

    /// 合法迁移表
    pub fn can_transition_to(&self, next: FlowPhase) -> bool {
        matches!(
            (self, next),
            (FlowPhase::Preparing, FlowPhase::AwaitingModel)
                | (FlowPhase::AwaitingModel, FlowPhase::Interpreting)
                | (FlowPhase::Interpreting, FlowPhase::DispatchingTool)
                | (FlowPhase::Interpreting, FlowPhase::Finalizing)
                | (FlowPhase::DispatchingTool, FlowPhase::Preparing)
                | (FlowPhase::DispatchingTool, FlowPhase::Finalizing)
        )
    }
}

impl std::fmt::Display for FlowPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 一轮结束时的结果分类（非致命；致命错误走 FlowError）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    /// 模型给出了不含工具调用的最终回复
    Completed,
    /// 某个工具需要用户在带外完成认证，本轮暂停
    AuthRequired,
    /// 模型网关返回错误（安全拦截、配额、请求非法等）
    ModelError,
    /// 代码执行失败次数超过 error_retry_attempts，或沙箱不可用
    CodeExecutionFailed,
    /// end_invocation 在 cycle 边界被观察到
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_round_trip_returns_to_preparing() {
        assert!(FlowPhase::Interpreting.can_transition_to(FlowPhase::DispatchingTool));
        assert!(FlowPhase::DispatchingTool.can_transition_to(FlowPhase::Preparing));
        assert!(!FlowPhase::Finalizing.can_transition_to(FlowPhase::Preparing));
        assert!(FlowPhase::DispatchingTool.can_transition_to(FlowPhase::Finalizing));
        assert!(!FlowPhase::Preparing.can_transition_to(FlowPhase::Finalizing));
    }
}
