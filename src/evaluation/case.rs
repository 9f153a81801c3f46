//! 评测用例与阈值文件格式（JSON）

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::flow::ToolInterceptor;
use crate::session::StateMap;

/// 期望的一次工具调用；mock_tool_output 存在时评测以它代替真实调用
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExpectedToolUse {
    pub tool_name: String,
    #[serde(default = "empty_object")]
    pub tool_input: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mock_tool_output: Option<Value>,
}

fn empty_object() -> Value {
    Value::Object(Default::default())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalTurn {
    pub query: String,
    #[serde(default)]
    pub expected_tool_use: Vec<ExpectedToolUse>,
    #[serde(default)]
    pub reference: String,
}

/// 运行第一轮之前写入的状态与 artifact（文本内容）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InitialSession {
    #[serde(default)]
    pub state: StateMap,
    #[serde(default)]
    pub artifacts: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalCase {
    pub name: String,
    pub data: Vec<EvalTurn>,
    #[serde(default)]
    pub initial_session: Option<InitialSession>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum CaseFile {
    Many(Vec<EvalCase>),
    One(EvalCase),
}

pub fn parse_cases(json: &str) -> anyhow::Result<Vec<EvalCase>> {
    let file: CaseFile = serde_json::from_str(json).context("invalid eval case file")?;
    Ok(match file {
        CaseFile::Many(cases) => cases,
        CaseFile::One(case) => vec![case],
    })
}

/// 文件内容可以是单个用例或用例数组
pub fn load_cases(path: impl AsRef<Path>) -> anyhow::Result<Vec<EvalCase>> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    parse_cases(&text).with_context(|| format!("parse {}", path.display()))
}

pub const DEFAULT_TRAJECTORY_THRESHOLD: f64 = 1.0;
pub const DEFAULT_RESPONSE_THRESHOLD: f64 = 0.8;

/// 阈值文件中缺失的指标不做检查
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    #[serde(default)]
    pub tool_trajectory_avg_score: Option<f64>,
    #[serde(default)]
    pub response_match_score: Option<f64>,
}

impl Default for Thresholds {
    /// 未提供阈值文件时的默认标准
    fn default() -> Self {
        Self {
            tool_trajectory_avg_score: Some(DEFAULT_TRAJECTORY_THRESHOLD),
            response_match_score: Some(DEFAULT_RESPONSE_THRESHOLD),
        }
    }
}

#[derive(Deserialize)]
struct ThresholdFile {
    criteria: Thresholds,
}

/// 接受 `{"criteria": {...}}` 或直接的指标对象
pub fn parse_thresholds(json: &str) -> anyhow::Result<Thresholds> {
    let value: Value = serde_json::from_str(json).context("invalid thresholds file")?;
    if value.get("criteria").is_some() {
        let file: ThresholdFile = serde_json::from_value(value)?;
        return Ok(file.criteria);
    }
    Ok(serde_json::from_value(value)?)
}

pub fn load_thresholds(path: impl AsRef<Path>) -> anyhow::Result<Thresholds> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    parse_thresholds(&text).with_context(|| format!("parse {}", path.display()))
}

/// JSON 相等，数字按数值比较（5 与 5.0 视为相同）
pub(crate) fn json_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        (Value::Array(x), Value::Array(y)) => x.len() == y.len() && x.iter().zip(y).all(|(a, b)| json_eq(a, b)),
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len() && x.iter().all(|(k, v)| y.get(k).is_some_and(|w| json_eq(v, w)))
        }
        _ => a == b,
    }
}

/// 按一轮的期望调用返回 mock 输出：先按 (名字, 参数) 精确匹配，再退回只按名字匹配
pub struct MockToolInterceptor {
    mocks: Vec<ExpectedToolUse>,
}

impl MockToolInterceptor {
    /// 没有任何 mock 时返回 None，本轮工具真实执行
    pub fn for_turn(turn: &EvalTurn) -> Option<Self> {
        let mocks: Vec<ExpectedToolUse> = turn
            .expected_tool_use
            .iter()
            .filter(|e| e.mock_tool_output.is_some())
            .cloned()
            .collect();
        (!mocks.is_empty()).then_some(Self { mocks })
    }
}

impl ToolInterceptor for MockToolInterceptor {
    fn intercept(&self, tool_name: &str, args: &Value) -> Option<Value> {
        let exact = self
            .mocks
            .iter()
            .find(|m| m.tool_name == tool_name && json_eq(&m.tool_input, args));
        exact
            .or_else(|| self.mocks.iter().find(|m| m.tool_name == tool_name))
            .and_then(|m| m.mock_tool_output.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    const CASE: &str = r#"{
        "name": "add_mocked",
        "data": [{
            "query": "What is 5 plus 7?",
            "expected_tool_use": [
                {"tool_name": "add", "tool_input": {"a": 5, "b": 7}, "mock_tool_output": 30}
            ],
            "reference": "The answer is 30."
        }],
        "initial_session": {"state": {"user:name": "Ada"}, "artifacts": {"notes.txt": "hello"}}
    }"#;

    #[test]
    fn test_single_case_or_array() {
        let one = parse_cases(CASE).unwrap();
        assert_eq!(one.len(), 1);
        assert_eq!(one[0].data[0].expected_tool_use[0].tool_input, json!({"a": 5, "b": 7}));
        let initial = one[0].initial_session.as_ref().unwrap();
        assert_eq!(initial.state["user:name"], json!("Ada"));
        assert_eq!(initial.artifacts["notes.txt"], "hello");

        let many = parse_cases(&format!("[{CASE}, {CASE}]")).unwrap();
        assert_eq!(many.len(), 2);
    }

    #[test]
    fn test_load_cases_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{CASE}").unwrap();
        let cases = load_cases(file.path()).unwrap();
        assert_eq!(cases[0].name, "add_mocked");
        assert!(load_cases("/nonexistent/cases.json").is_err());
    }

    #[test]
    fn test_thresholds_formats() {
        let t = parse_thresholds(r#"{"criteria": {"tool_trajectory_avg_score": 0.5}}"#).unwrap();
        assert_eq!(t.tool_trajectory_avg_score, Some(0.5));
        assert_eq!(t.response_match_score, None);
        let t = parse_thresholds(r#"{"response_match_score": 0.7}"#).unwrap();
        assert_eq!(t.response_match_score, Some(0.7));
        assert_eq!(Thresholds::default().tool_trajectory_avg_score, Some(1.0));
    }

    #[test]
    fn test_mock_exact_match_before_name_match() {
        let turn = EvalTurn {
            query: "q".into(),
            expected_tool_use: vec![
                ExpectedToolUse {
                    tool_name: "add".into(),
                    tool_input: json!({"a": 1, "b": 1}),
                    mock_tool_output: Some(json!(2)),
                },
                ExpectedToolUse {
                    tool_name: "add".into(),
                    tool_input: json!({"a": 5, "b": 7}),
                    mock_tool_output: Some(json!(30)),
                },
            ],
            reference: String::new(),
        };
        let mock = MockToolInterceptor::for_turn(&turn).unwrap();
        assert_eq!(mock.intercept("add", &json!({"a": 5, "b": 7})), Some(json!(30)));
        assert_eq!(mock.intercept("add", &json!({"a": 9, "b": 9})), Some(json!(2)));
        assert_eq!(mock.intercept("add", &json!({"a": 5.0, "b": 7})), Some(json!(30)));
        assert_eq!(mock.intercept("echo", &json!({})), None);
    }

    #[test]
    fn test_no_mocks_means_no_interceptor() {
        let turn = EvalTurn {
            query: "q".into(),
            expected_tool_use: vec![ExpectedToolUse {
                tool_name: "add".into(),
                tool_input: json!({}),
                mock_tool_output: None,
            }],
            reference: String::new(),
        };
        assert!(MockToolInterceptor::for_turn(&turn).is_none());
    }
}
