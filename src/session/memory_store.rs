//! 内存会话存储
//!
//! 所有写操作在同一把写锁下完成，天然满足「同一会话至多一个写者」；
//! user:/app: 状态保存在存储级映射里，每次读取时合并进会话视图。

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::core::FlowError;
use crate::session::event::Event;
use crate::session::state::{apply_delta, split_delta, strip_temp, StateMap};
use crate::session::store::{Session, SessionKey, SessionStore};

#[derive(Default)]
struct Inner {
    /// 存储的会话只保留会话级状态
    sessions: HashMap<SessionKey, Session>,
    user_state: HashMap<(String, String), StateMap>,
    app_state: HashMap<String, StateMap>,
}

impl Inner {
    fn merged_view(&self, stored: &Session) -> Session {
        let mut view = stored.clone();
        if let Some(app) = self.app_state.get(&stored.app_name) {
            view.state.extend(app.clone());
        }
        if let Some(user) = self
            .user_state
            .get(&(stored.app_name.clone(), stored.user_id.clone()))
        {
            view.state.extend(user.clone());
        }
        view
    }
}

#[derive(Default)]
pub struct InMemorySessionStore {
    inner: RwLock<Inner>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn get_or_create(&self, key: &SessionKey) -> Result<Session, FlowError> {
        let mut inner = self.inner.write().await;
        if !inner.sessions.contains_key(key) {
            tracing::debug!(session = %key, "creating session");
            inner.sessions.insert(key.clone(), Session::new(key));
        }
        let stored = &inner.sessions[key];
        Ok(inner.merged_view(stored))
    }

    async fn get(&self, key: &SessionKey) -> Result<Option<Session>, FlowError> {
        let inner = self.inner.read().await;
        Ok(inner.sessions.get(key).map(|s| inner.merged_view(s)))
    }

    async fn append_event(&self, session: &Session, mut event: Event) -> Result<Event, FlowError> {
        if event.partial {
            return Ok(event);
        }
        let key = session.key();
        let mut inner = self.inner.write().await;
        let split = split_delta(&event.actions.state_delta);

        let stored = inner
            .sessions
            .get_mut(&key)
            .ok_or_else(|| FlowError::Session(format!("session not found: {key}")))?;
        stored.clamp_timestamp(&mut event);
        // 会话对象只保留会话键，app/user 键写入存储级映射
        let mut persisted = event.clone();
        strip_temp(&mut persisted.actions.state_delta);
        apply_delta(&mut stored.state, &split.session);
        stored.last_update_time = stored.last_update_time.max(persisted.timestamp);
        stored.events.push(persisted);

        if !split.app.is_empty() {
            let app = inner.app_state.entry(key.app_name.clone()).or_default();
            apply_delta(app, &split.app);
        }
        if !split.user.is_empty() {
            let user = inner
                .user_state
                .entry((key.app_name.clone(), key.user_id.clone()))
                .or_default();
            apply_delta(user, &split.user);
        }
        Ok(event)
    }

    async fn list_sessions(&self, app_name: &str, user_id: &str) -> Result<Vec<String>, FlowError> {
        let inner = self.inner.read().await;
        let mut ids: Vec<String> = inner
            .sessions
            .keys()
            .filter(|k| k.app_name == app_name && k.user_id == user_id)
            .map(|k| k.session_id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn delete(&self, key: &SessionKey) -> Result<(), FlowError> {
        self.inner.write().await.sessions.remove(key);
        Ok(())
    }
}
