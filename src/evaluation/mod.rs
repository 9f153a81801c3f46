//! 评测：用例文件、mock 注入、轨迹与回复打分

pub mod case;
pub mod evaluator;

pub use case::{
    load_cases, load_thresholds, parse_cases, parse_thresholds, EvalCase, EvalTurn, ExpectedToolUse,
    InitialSession, MockToolInterceptor, Thresholds,
};
pub use evaluator::{rouge1_f, tool_trajectory_score, CaseReport, Evaluator, TurnReport};
