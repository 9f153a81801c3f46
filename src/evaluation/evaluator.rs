//! 评测执行与打分
//!
//! 每个用例使用全新的内存服务与独立会话，逐轮驱动 Runner，并按轮注入 mock。

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;

use crate::agent::LlmAgent;
use crate::core::{FlowError, TurnStatus};
use crate::evaluation::case::{json_eq, EvalCase, EvalTurn, MockToolInterceptor, Thresholds};
use crate::flow::{RunConfig, ToolCallRecord};
use crate::llm::ModelRegistry;
use crate::runner::Runner;
use crate::services::Services;
use crate::session::Content;

const EVAL_USER: &str = "eval_user";

/// 一轮的实际结果与得分
#[derive(Debug, Clone, Serialize)]
pub struct TurnReport {
    pub query: String,
    pub status: Option<TurnStatus>,
    pub actual_tool_use: Vec<ToolCallRecord>,
    pub expected_tool_use: Vec<ToolCallRecord>,
    pub response: Option<String>,
    pub reference: String,
    pub trajectory_score: f64,
    pub response_score: f64,
    /// 本轮以致命错误结束时的错误信息
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CaseReport {
    pub name: String,
    pub turns: Vec<TurnReport>,
    pub tool_trajectory_avg_score: f64,
    pub response_match_score: f64,
    pub passed: bool,
    pub failures: Vec<String>,
}

impl std::fmt::Display for CaseReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let verdict = if self.passed { "PASS" } else { "FAIL" };
        writeln!(
            f,
            "[{verdict}] {} (tool_trajectory_avg_score={:.2}, response_match_score={:.2})",
            self.name, self.tool_trajectory_avg_score, self.response_match_score
        )?;
        for (i, turn) in self.turns.iter().enumerate() {
            let calls: Vec<&str> = turn.actual_tool_use.iter().map(|c| c.name.as_str()).collect();
            writeln!(
                f,
                "  turn {}: tools={:?} response={:?}",
                i + 1,
                calls,
                turn.response.as_deref().unwrap_or("")
            )?;
        }
        for failure in &self.failures {
            writeln!(f, "  - {failure}")?;
        }
        Ok(())
    }
}

pub struct Evaluator {
    root: Arc<LlmAgent>,
    registry: ModelRegistry,
    run_config: RunConfig,
    thresholds: Thresholds,
}

impl Evaluator {
    pub fn new(root: Arc<LlmAgent>, registry: ModelRegistry, run_config: RunConfig, thresholds: Thresholds) -> Self {
        Self {
            root,
            registry,
            run_config,
            thresholds,
        }
    }

    pub async fn evaluate_all(&self, cases: &[EvalCase]) -> Result<Vec<CaseReport>, FlowError> {
        let mut reports = Vec::with_capacity(cases.len());
        for case in cases {
            reports.push(self.evaluate_case(case).await?);
        }
        Ok(reports)
    }

    /// 配置错误（未知模型等）直接返回 Err；单轮的致命错误记入报告并判为失败
    pub async fn evaluate_case(&self, case: &EvalCase) -> Result<CaseReport, FlowError> {
        let runner = Runner::new(
            "eval",
            self.root.clone(),
            Services::in_memory(),
            self.registry.clone(),
            self.run_config.clone(),
        )?;
        let session_id = format!("{}_{}", case.name, uuid::Uuid::new_v4().simple());
        if let Some(initial) = &case.initial_session {
            let artifacts = initial
                .artifacts
                .iter()
                .map(|(name, text)| (name.clone(), text.clone().into_bytes()))
                .collect();
            runner
                .seed_session(EVAL_USER, &session_id, initial.state.clone(), artifacts)
                .await?;
        }

        let mut turns = Vec::with_capacity(case.data.len());
        for turn in &case.data {
            turns.push(self.evaluate_turn(&runner, &session_id, turn).await);
        }

        let count = turns.len().max(1) as f64;
        let tool_trajectory_avg_score = turns.iter().map(|t| t.trajectory_score).sum::<f64>() / count;
        let response_match_score = turns.iter().map(|t| t.response_score).sum::<f64>() / count;

        let mut failures = Vec::new();
        for (i, turn) in turns.iter().enumerate() {
            if let Some(error) = &turn.error {
                failures.push(format!("turn {} aborted: {error}", i + 1));
            }
        }
        if let Some(min) = self.thresholds.tool_trajectory_avg_score {
            if tool_trajectory_avg_score < min {
                failures.push(format!(
                    "tool_trajectory_avg_score {tool_trajectory_avg_score:.2} < {min:.2}"
                ));
            }
        }
        if let Some(min) = self.thresholds.response_match_score {
            if response_match_score < min {
                failures.push(format!("response_match_score {response_match_score:.2} < {min:.2}"));
            }
        }

        let passed = failures.is_empty();
        tracing::info!(case = %case.name, passed, tool_trajectory_avg_score, response_match_score, "case evaluated");
        Ok(CaseReport {
            name: case.name.clone(),
            turns,
            tool_trajectory_avg_score,
            response_match_score,
            passed,
            failures,
        })
    }

    async fn evaluate_turn(&self, runner: &Runner, session_id: &str, turn: &EvalTurn) -> TurnReport {
        let mut run_config = self.run_config.clone();
        if let Some(mock) = MockToolInterceptor::for_turn(turn) {
            run_config = run_config.with_interceptor(Arc::new(mock));
        }
        let expected: Vec<ToolCallRecord> = turn
            .expected_tool_use
            .iter()
            .map(|e| ToolCallRecord {
                name: e.tool_name.clone(),
                args: e.tool_input.clone(),
            })
            .collect();

        let result = runner
            .run_with_config(EVAL_USER, session_id, Content::user_text(&turn.query), run_config)
            .await;
        match result {
            Ok(outcome) => {
                let response = outcome.final_text.clone().unwrap_or_default();
                TurnReport {
                    query: turn.query.clone(),
                    status: Some(outcome.status),
                    trajectory_score: tool_trajectory_score(&outcome.tool_calls, &expected),
                    response_score: rouge1_f(&response, &turn.reference),
                    actual_tool_use: outcome.tool_calls,
                    expected_tool_use: expected,
                    response: outcome.final_text,
                    reference: turn.reference.clone(),
                    error: None,
                }
            }
            Err(e) => {
                tracing::warn!(query = %turn.query, code = e.code(), error = %e, "eval turn aborted");
                TurnReport {
                    query: turn.query.clone(),
                    status: None,
                    actual_tool_use: Vec::new(),
                    expected_tool_use: expected,
                    response: None,
                    reference: turn.reference.clone(),
                    trajectory_score: 0.0,
                    response_score: 0.0,
                    error: Some(format!("{}: {e}", e.code())),
                }
            }
        }
    }
}

/// 名字与参数都按顺序完全一致得 1，否则 0
pub fn tool_trajectory_score(actual: &[ToolCallRecord], expected: &[ToolCallRecord]) -> f64 {
    let same = actual.len() == expected.len()
        && actual
            .iter()
            .zip(expected)
            .all(|(a, e)| a.name == e.name && json_eq(&a.args, &e.args));
    if same {
        1.0
    } else {
        0.0
    }
}

/// 数字按数值比较（5 与 5.0 视为相同）
fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// ROUGE-1 F-measure；两边都没有词时记为 1
pub fn rouge1_f(candidate: &str, reference: &str) -> f64 {
    let cand = tokenize(candidate);
    let refs = tokenize(reference);
    if cand.is_empty() && refs.is_empty() {
        return 1.0;
    }
    if cand.is_empty() || refs.is_empty() {
        return 0.0;
    }
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for t in &refs {
        *counts.entry(t.as_str()).or_default() += 1;
    }
    let mut overlap = 0usize;
    for t in &cand {
        if let Some(n) = counts.get_mut(t.as_str()) {
            if *n > 0 {
                *n -= 1;
                overlap += 1;
            }
        }
    }
    if overlap == 0 {
        return 0.0;
    }
    let precision = overlap as f64 / cand.len() as f64;
    let recall = overlap as f64 / refs.len() as f64;
    2.0 * precision * recall / (precision + recall)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluation::case::parse_cases;
    use crate::llm::{LlmClient, MockLlmClient};
    use crate::tools::builtin;
    use serde_json::{json, Value};

    #[test]
    fn test_rouge1() {
        assert!((rouge1_f("The sum is 12", "the sum is 12") - 1.0).abs() < 1e-9);
        assert_eq!(rouge1_f("", ""), 1.0);
        assert_eq!(rouge1_f("abc", ""), 0.0);
        let partial = rouge1_f("sum is 12", "the sum is 12");
        assert!(partial > 0.8 && partial < 1.0);
    }

    #[test]
    fn test_trajectory_order_and_numbers() {
        let a = |n: &str, args: Value| ToolCallRecord { name: n.into(), args };
        let actual = vec![a("add", json!({"a": 5.0, "b": 7})), a("echo", json!({"text": "x"}))];
        let expected = vec![a("add", json!({"a": 5, "b": 7})), a("echo", json!({"text": "x"}))];
        assert_eq!(tool_trajectory_score(&actual, &expected), 1.0);
        let swapped: Vec<_> = expected.iter().rev().cloned().collect();
        assert_eq!(tool_trajectory_score(&actual, &swapped), 0.0);
        assert_eq!(tool_trajectory_score(&[], &[]), 1.0);
    }

    fn evaluator(mock: Arc<MockLlmClient>, thresholds: Thresholds) -> Evaluator {
        let agent = LlmAgent::builder("calc")
            .model_client(mock as Arc<dyn LlmClient>)
            .tool(builtin::add())
            .build()
            .unwrap();
        Evaluator::new(agent, ModelRegistry::builder().build(), RunConfig::default(), thresholds)
    }

    #[tokio::test]
    async fn test_mocked_case_passes() {
        let mock = Arc::new(MockLlmClient::new("mock"));
        mock.push_function_call("c1", "add", json!({"a": 5, "b": 7}));
        let cases = parse_cases(
            r#"{"name": "mocked", "data": [{"query": "What is 5 plus 7?",
                "expected_tool_use": [{"tool_name": "add", "tool_input": {"a": 5, "b": 7}, "mock_tool_output": 30}],
                "reference": "Tool add returned: 30"}]}"#,
        )
        .unwrap();
        let report = evaluator(mock, Thresholds::default())
            .evaluate_case(&cases[0])
            .await
            .unwrap();
        assert!(report.passed, "{report}");
        assert_eq!(report.turns[0].response.as_deref(), Some("Tool add returned: 30"));
    }

    #[tokio::test]
    async fn test_wrong_trajectory_fails() {
        let mock = Arc::new(MockLlmClient::new("mock"));
        let cases = parse_cases(
            r#"{"name": "expects_tool", "data": [{"query": "What is 5 plus 7?",
                "expected_tool_use": [{"tool_name": "add", "tool_input": {"a": 5, "b": 7}}],
                "reference": "12"}]}"#,
        )
        .unwrap();
        let thresholds = Thresholds {
            tool_trajectory_avg_score: Some(1.0),
            response_match_score: None,
        };
        let report = evaluator(mock, thresholds).evaluate_case(&cases[0]).await.unwrap();
        assert!(!report.passed);
        assert_eq!(report.tool_trajectory_avg_score, 0.0);
        assert_eq!(report.failures.len(), 1);
    }
}
