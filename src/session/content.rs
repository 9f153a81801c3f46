//! 消息内容模型
//!
//! 一条 Content 由角色与若干 Part 组成；每个 Part 恰好是文本、函数调用请求、函数调用结果、
//! 可执行代码块、代码执行结果之一。函数调用带唯一 id，结果通过 id 关联到它回答的请求。

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 内容角色（与模型消息格式对应）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
    Tool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub args: Value,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FunctionResponse {
    pub id: String,
    pub name: String,
    pub response: Value,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecutableCode {
    pub language: String,
    pub code: String,
}

/// 代码执行结果在历史中的表示；输出文件以 artifact 文件名引用
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CodeExecutionOutput {
    pub stdout: String,
    pub stderr: String,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub output_files: Vec<String>,
}

impl CodeExecutionOutput {
    pub fn is_error(&self) -> bool {
        !self.stderr.is_empty() || self.exit_code.is_some_and(|c| c != 0)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Part {
    Text {
        text: String,
        /// 规划/推理内容，不作为可展示回复
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        thought: bool,
    },
    FunctionCall(FunctionCall),
    FunctionResponse(FunctionResponse),
    ExecutableCode(ExecutableCode),
    CodeExecutionResult(CodeExecutionOutput),
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Part::Text {
            text: text.into(),
            thought: false,
        }
    }

    pub fn thought(text: impl Into<String>) -> Self {
        Part::Text {
            text: text.into(),
            thought: true,
        }
    }

    pub fn function_call(id: impl Into<String>, name: impl Into<String>, args: Value) -> Self {
        Part::FunctionCall(FunctionCall {
            id: id.into(),
            name: name.into(),
            args,
        })
    }

    pub fn function_response(
        id: impl Into<String>,
        name: impl Into<String>,
        response: Value,
    ) -> Self {
        Part::FunctionResponse(FunctionResponse {
            id: id.into(),
            name: name.into(),
            response,
        })
    }

    /// 可展示文本（思考内容不算）
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Part::Text { text, thought: false } => Some(text),
            _ => None,
        }
    }
}

/// 一个轮次的内容
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Content {
    pub role: Role,
    #[serde(default)]
    pub parts: Vec<Part>,
}

impl Content {
    pub fn new(role: Role, parts: Vec<Part>) -> Self {
        Self { role, parts }
    }

    pub fn user_text(text: impl Into<String>) -> Self {
        Self::new(Role::User, vec![Part::text(text)])
    }

    pub fn model_text(text: impl Into<String>) -> Self {
        Self::new(Role::Model, vec![Part::text(text)])
    }

    /// 拼接所有可展示文本；没有文本时返回 None
    pub fn text(&self) -> Option<String> {
        let texts: Vec<&str> = self.parts.iter().filter_map(Part::as_text).collect();
        if texts.is_empty() {
            None
        } else {
            Some(texts.concat())
        }
    }

    pub fn function_calls(&self) -> impl Iterator<Item = &FunctionCall> {
        self.parts.iter().filter_map(|p| match p {
            Part::FunctionCall(fc) => Some(fc),
            _ => None,
        })
    }

    pub fn function_responses(&self) -> impl Iterator<Item = &FunctionResponse> {
        self.parts.iter().filter_map(|p| match p {
            Part::FunctionResponse(fr) => Some(fr),
            _ => None,
        })
    }

    pub fn executable_code(&self) -> Option<&ExecutableCode> {
        self.parts.iter().find_map(|p| match p {
            Part::ExecutableCode(code) => Some(code),
            _ => None,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_text_skips_thoughts() {
        let content = Content::new(
            Role::Model,
            vec![Part::thought("planning..."), Part::text("Hello "), Part::text("world")],
        );
        assert_eq!(content.text().as_deref(), Some("Hello world"));
    }

    #[test]
    fn test_part_serialization_is_tagged() {
        let part = Part::function_call("call_1", "add", json!({"a": 5, "b": 7}));
        let value = serde_json::to_value(&part).unwrap();
        assert_eq!(value["type"], "function_call");
        assert_eq!(value["name"], "add");
        let text = serde_json::to_value(Part::text("hi")).unwrap();
        assert!(text.get("thought").is_none());
    }

    #[test]
    fn test_code_output_error_detection() {
        let ok = CodeExecutionOutput {
            stdout: "120\n".into(),
            stderr: String::new(),
            exit_code: Some(0),
            output_files: vec![],
        };
        assert!(!ok.is_error());
        let failed = CodeExecutionOutput {
            exit_code: Some(1),
            ..ok.clone()
        };
        assert!(failed.is_error());
    }
}
