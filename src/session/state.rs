//! 作用域状态：按键前缀划分四种生命周期
//!
//! - 无前缀：会话级
//! - `user:`：同一用户跨会话
//! - `app:`：整个应用
//! - `temp:`：仅当前轮，绝不持久化

use std::collections::BTreeMap;

use serde_json::Value;

pub const APP_PREFIX: &str = "app:";
pub const USER_PREFIX: &str = "user:";
pub const TEMP_PREFIX: &str = "temp:";

pub type StateMap = BTreeMap<String, Value>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StateScope {
    Session,
    User,
    App,
    Temp,
}

impl StateScope {
    pub fn of(key: &str) -> Self {
        if key.starts_with(APP_PREFIX) {
            StateScope::App
        } else if key.starts_with(USER_PREFIX) {
            StateScope::User
        } else if key.starts_with(TEMP_PREFIX) {
            StateScope::Temp
        } else {
            StateScope::Session
        }
    }
}

/// 按作用域拆分后的状态增量（temp 已丢弃）
#[derive(Debug, Default)]
pub struct ScopedDelta {
    pub app: StateMap,
    pub user: StateMap,
    pub session: StateMap,
}

/// 拆分增量；app/user 键保留原始前缀，便于直接合并回会话视图
pub fn split_delta(delta: &StateMap) -> ScopedDelta {
    let mut out = ScopedDelta::default();
    for (key, value) in delta {
        match StateScope::of(key) {
            StateScope::App => {
                out.app.insert(key.clone(), value.clone());
            }
            StateScope::User => {
                out.user.insert(key.clone(), value.clone());
            }
            StateScope::Session => {
                out.session.insert(key.clone(), value.clone());
            }
            StateScope::Temp => {}
        }
    }
    out
}

/// 将增量应用到状态：null 删除，其余覆盖
pub fn apply_delta(state: &mut StateMap, delta: &StateMap) {
    for (key, value) in delta {
        if value.is_null() {
            state.remove(key);
        } else {
            state.insert(key.clone(), value.clone());
        }
    }
}

/// 去掉 temp: 键（持久化前调用）
pub fn strip_temp(state: &mut StateMap) {
    state.retain(|k, _| StateScope::of(k) != StateScope::Temp);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_scope_by_prefix() {
        assert_eq!(StateScope::of("app:theme"), StateScope::App);
        assert_eq!(StateScope::of("user:name"), StateScope::User);
        assert_eq!(StateScope::of("temp:scratch"), StateScope::Temp);
        assert_eq!(StateScope::of("counter"), StateScope::Session);
    }

    #[test]
    fn test_split_drops_temp() {
        let mut delta = StateMap::new();
        delta.insert("app:x".into(), json!(1));
        delta.insert("user:y".into(), json!(2));
        delta.insert("z".into(), json!(3));
        delta.insert("temp:w".into(), json!(4));
        let split = split_delta(&delta);
        assert_eq!(split.app.len(), 1);
        assert_eq!(split.user.len(), 1);
        assert_eq!(split.session.len(), 1);
        assert!(!split.session.contains_key("temp:w"));
    }

    #[test]
    fn test_null_deletes() {
        let mut state = StateMap::new();
        state.insert("k".into(), json!("v"));
        let mut delta = StateMap::new();
        delta.insert("k".into(), Value::Null);
        apply_delta(&mut state, &delta);
        assert!(state.is_empty());
    }
}
