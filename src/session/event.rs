//! 事件：会话中一次原子发生的不可变记录
//!
//! 由模型网关回复、工具调用、编排循环收尾等产生；partial 事件只投递给观察者，不写入历史。

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::services::AuthRequest;
use crate::session::content::{CodeExecutionOutput, Content, FunctionCall, FunctionResponse, Part};

/// 用户消息的作者名
pub const USER_AUTHOR: &str = "user";
/// 代码执行结果事件的作者名
pub const CODE_EXECUTOR_AUTHOR: &str = "code_executor";

/// 事件提交时原子应用的副作用记录
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EventActions {
    /// 状态增量；值为 null 表示删除该键
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub state_delta: BTreeMap<String, Value>,
    /// artifact 文件名 -> 新版本号
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub artifact_delta: BTreeMap<String, u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transfer_to_agent: Option<String>,
    /// function call id -> 待完成的认证请求
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub requested_auth: BTreeMap<String, AuthRequest>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub escalate: bool,
}

impl EventActions {
    pub fn is_empty(&self) -> bool {
        self.state_delta.is_empty()
            && self.artifact_delta.is_empty()
            && self.transfer_to_agent.is_none()
            && self.requested_auth.is_empty()
            && !self.escalate
    }

    /// 按顺序合并另一组动作：同键后写覆盖先写
    pub fn merge(&mut self, other: EventActions) {
        self.state_delta.extend(other.state_delta);
        self.artifact_delta.extend(other.artifact_delta);
        if other.transfer_to_agent.is_some() {
            self.transfer_to_agent = other.transfer_to_agent;
        }
        self.requested_auth.extend(other.requested_auth);
        self.escalate |= other.escalate;
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub invocation_id: String,
    /// "user"、agent 名，或 "code_executor" 等合成作者
    pub author: String,
    #[serde(default)]
    pub content: Option<Content>,
    #[serde(default)]
    pub partial: bool,
    #[serde(default)]
    pub turn_complete: bool,
    #[serde(default)]
    pub actions: EventActions,
    #[serde(default)]
    pub error_code: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    /// 毫秒时间戳；提交时保证同一会话内单调不减
    pub timestamp: i64,
}

impl Event {
    pub fn new(invocation_id: impl Into<String>, author: impl Into<String>) -> Self {
        Self {
            id: new_event_id(),
            invocation_id: invocation_id.into(),
            author: author.into(),
            content: None,
            partial: false,
            turn_complete: false,
            actions: EventActions::default(),
            error_code: None,
            error_message: None,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// 带错误码的终止事件（模型错误、代码执行失败等）
    pub fn error(
        invocation_id: impl Into<String>,
        author: impl Into<String>,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        let message = message.into();
        let mut event = Self::new(invocation_id, author);
        event.content = Some(Content::model_text(message.clone()));
        event.error_code = Some(code.into());
        event.error_message = Some(message);
        event.turn_complete = true;
        event
    }

    pub fn with_content(mut self, content: Content) -> Self {
        self.content = Some(content);
        self
    }

    pub fn with_actions(mut self, actions: EventActions) -> Self {
        self.actions = actions;
        self
    }

    pub fn with_partial(mut self, partial: bool) -> Self {
        self.partial = partial;
        self
    }

    pub fn function_calls(&self) -> Vec<FunctionCall> {
        self.content
            .as_ref()
            .map(|c| c.function_calls().cloned().collect())
            .unwrap_or_default()
    }

    pub fn function_responses(&self) -> Vec<FunctionResponse> {
        self.content
            .as_ref()
            .map(|c| c.function_responses().cloned().collect())
            .unwrap_or_default()
    }

    pub fn text(&self) -> Option<String> {
        self.content.as_ref().and_then(Content::text)
    }

    pub fn code_execution_output(&self) -> Option<&CodeExecutionOutput> {
        self.content.as_ref()?.parts.iter().find_map(|p| match p {
            Part::CodeExecutionResult(out) => Some(out),
            _ => None,
        })
    }

    pub fn is_error(&self) -> bool {
        self.error_code.is_some()
    }

    /// 是否为本轮可展示的最终回复：非 partial、无函数调用/结果、无待执行代码
    pub fn is_final_response(&self) -> bool {
        if self.partial {
            return false;
        }
        match &self.content {
            None => self.is_error(),
            Some(c) => {
                c.function_calls().next().is_none()
                    && c.function_responses().next().is_none()
                    && c.executable_code().is_none()
                    && !c
                        .parts
                        .iter()
                        .any(|p| matches!(p, Part::CodeExecutionResult(_)))
            }
        }
    }
}

fn new_event_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// 为缺少 id 的函数调用补全客户端 id
pub fn new_function_call_id() -> String {
    format!("call_{}", uuid::Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::content::Role;
    use serde_json::json;

    #[test]
    fn test_final_response_classification() {
        let text = Event::new("inv", "agent").with_content(Content::model_text("done"));
        assert!(text.is_final_response());

        let call = Event::new("inv", "agent").with_content(Content::new(
            Role::Model,
            vec![Part::function_call("c1", "add", json!({}))],
        ));
        assert!(!call.is_final_response());

        let partial = Event::new("inv", "agent")
            .with_content(Content::model_text("do"))
            .with_partial(true);
        assert!(!partial.is_final_response());
    }

    #[test]
    fn test_merge_later_wins() {
        let mut a = EventActions::default();
        a.state_delta.insert("k".into(), json!(1));
        let mut b = EventActions::default();
        b.state_delta.insert("k".into(), json!(2));
        b.transfer_to_agent = Some("helper".into());
        a.merge(b);
        assert_eq!(a.state_delta["k"], json!(2));
        assert_eq!(a.transfer_to_agent.as_deref(), Some("helper"));
    }

    #[test]
    fn test_event_roundtrips_through_json() {
        let mut event = Event::new("inv", "agent").with_content(Content::model_text("hi"));
        event.actions.state_delta.insert("count".into(), json!(3));
        let raw = serde_json::to_string(&event).unwrap();
        let back: Event = serde_json::from_str(&raw).unwrap();
        assert_eq!(back, event);
    }
}
