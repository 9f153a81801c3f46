//! 会话与会话存储接口
//!
//! 会话由 (app, user, session_id) 唯一寻址；事件日志只追加，状态只能通过提交事件的 actions 修改。
//! 同一会话的并发追加必须串行化，快照读取可并发。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::FlowError;
use crate::session::event::Event;
use crate::session::state::{apply_delta, StateMap, StateScope};

/// 会话身份三元组
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionKey {
    pub app_name: String,
    pub user_id: String,
    pub session_id: String,
}

impl SessionKey {
    pub fn new(
        app_name: impl Into<String>,
        user_id: impl Into<String>,
        session_id: impl Into<String>,
    ) -> Self {
        Self {
            app_name: app_name.into(),
            user_id: user_id.into(),
            session_id: session_id.into(),
        }
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.app_name, self.user_id, self.session_id)
    }
}

/// 一个对话线程
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub app_name: String,
    pub user_id: String,
    pub events: Vec<Event>,
    /// 合并视图：会话键 + user:/app: 键（轮内还包括 temp: 键）
    pub state: StateMap,
    pub last_update_time: i64,
}

impl Session {
    pub fn new(key: &SessionKey) -> Self {
        Self {
            id: key.session_id.clone(),
            app_name: key.app_name.clone(),
            user_id: key.user_id.clone(),
            events: Vec::new(),
            state: StateMap::new(),
            last_update_time: 0,
        }
    }

    pub fn key(&self) -> SessionKey {
        SessionKey::new(&self.app_name, &self.user_id, &self.id)
    }

    /// 把时间戳夹到不早于最近一次提交，保证事件日志按时间单调
    pub fn clamp_timestamp(&self, event: &mut Event) {
        if event.timestamp < self.last_update_time {
            event.timestamp = self.last_update_time;
        }
    }

    /// 应用已提交事件：状态增量 + 追加日志。include_temp=false 时丢弃 temp: 键
    pub fn apply_event(&mut self, event: &Event, include_temp: bool) {
        let mut stored = event.clone();
        if !include_temp {
            stored
                .actions
                .state_delta
                .retain(|k, _| StateScope::of(k) != StateScope::Temp);
        }
        apply_delta(&mut self.state, &stored.actions.state_delta);
        self.last_update_time = self.last_update_time.max(stored.timestamp);
        self.events.push(stored);
    }

    /// 最近一次由某个 agent（非 user）产生的事件作者
    pub fn last_agent_author(&self) -> Option<&str> {
        self.events
            .iter()
            .rev()
            .map(|e| e.author.as_str())
            .find(|a| *a != crate::session::USER_AUTHOR && *a != crate::session::CODE_EXECUTOR_AUTHOR)
    }
}

/// 会话存储接口（内存 / SQLite）
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// 首次引用新三元组时创建空会话
    async fn get_or_create(&self, key: &SessionKey) -> Result<Session, FlowError>;

    async fn get(&self, key: &SessionKey) -> Result<Option<Session>, FlowError>;

    /// 提交事件：原子应用 state_delta 并追加；partial 事件原样返回、不落盘
    async fn append_event(&self, session: &Session, event: Event) -> Result<Event, FlowError>;

    async fn list_sessions(&self, app_name: &str, user_id: &str) -> Result<Vec<String>, FlowError>;

    /// 显式删除；之后再次 get_or_create 会得到空会话
    async fn delete(&self, key: &SessionKey) -> Result<(), FlowError>;
}
