//! SQLite 会话存储
//!
//! 会话、事件（JSON）、user/app 作用域状态落盘，进程重启后可恢复待认证的工具调用。
//! rusqlite 为同步接口，所有操作在 spawn_blocking 中执行，连接由 Mutex 串行化。

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};

use crate::core::FlowError;
use crate::session::event::Event;
use crate::session::state::{apply_delta, split_delta, strip_temp, StateMap};
use crate::session::store::{Session, SessionKey, SessionStore};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS flow_sessions (
    app_name TEXT NOT NULL,
    user_id TEXT NOT NULL,
    session_id TEXT NOT NULL,
    state TEXT NOT NULL,
    last_update_time INTEGER NOT NULL,
    PRIMARY KEY (app_name, user_id, session_id)
);
CREATE TABLE IF NOT EXISTS flow_events (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    app_name TEXT NOT NULL,
    user_id TEXT NOT NULL,
    session_id TEXT NOT NULL,
    payload TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_flow_events_session
    ON flow_events(app_name, user_id, session_id);
CREATE TABLE IF NOT EXISTS flow_user_state (
    app_name TEXT NOT NULL,
    user_id TEXT NOT NULL,
    state TEXT NOT NULL,
    PRIMARY KEY (app_name, user_id)
);
CREATE TABLE IF NOT EXISTS flow_app_state (
    app_name TEXT PRIMARY KEY,
    state TEXT NOT NULL
);
";

pub struct SqliteSessionStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteSessionStore {
    /// 打开（或创建）数据库文件并建表
    pub fn open(path: impl AsRef<Path>) -> Result<Self, FlowError> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| FlowError::Storage(format!("create {}: {e}", parent.display())))?;
        }
        let conn = Connection::open(path.as_ref())?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, FlowError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, FlowError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, FlowError>
    where
        F: FnOnce(&mut Connection) -> Result<T, FlowError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| FlowError::Storage("sqlite connection poisoned".to_string()))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| FlowError::Storage(format!("sqlite task failed: {e}")))?
    }
}

fn read_state(conn: &Connection, sql: &str, params: &[&dyn rusqlite::ToSql]) -> Result<StateMap, FlowError> {
    let raw: Option<String> = conn
        .query_row(sql, params, |row| row.get(0))
        .optional()?;
    match raw {
        Some(raw) => Ok(serde_json::from_str(&raw)?),
        None => Ok(StateMap::new()),
    }
}

fn load_session(conn: &Connection, key: &SessionKey) -> Result<Option<Session>, FlowError> {
    let row: Option<(String, i64)> = conn
        .query_row(
            "SELECT state, last_update_time FROM flow_sessions
             WHERE app_name = ?1 AND user_id = ?2 AND session_id = ?3",
            params![key.app_name, key.user_id, key.session_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    let Some((state_raw, last_update_time)) = row else {
        return Ok(None);
    };

    let mut stmt = conn.prepare(
        "SELECT payload FROM flow_events
         WHERE app_name = ?1 AND user_id = ?2 AND session_id = ?3 ORDER BY seq ASC",
    )?;
    let payloads = stmt
        .query_map(params![key.app_name, key.user_id, key.session_id], |row| {
            row.get::<_, String>(0)
        })?
        .collect::<Result<Vec<_>, _>>()?;
    let events = payloads
        .iter()
        .map(|p| serde_json::from_str::<Event>(p))
        .collect::<Result<Vec<_>, _>>()?;

    let mut state: StateMap = serde_json::from_str(&state_raw)?;
    state.extend(read_state(
        conn,
        "SELECT state FROM flow_app_state WHERE app_name = ?1",
        &[&key.app_name],
    )?);
    state.extend(read_state(
        conn,
        "SELECT state FROM flow_user_state WHERE app_name = ?1 AND user_id = ?2",
        &[&key.app_name, &key.user_id],
    )?);

    Ok(Some(Session {
        id: key.session_id.clone(),
        app_name: key.app_name.clone(),
        user_id: key.user_id.clone(),
        events,
        state,
        last_update_time,
    }))
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn get_or_create(&self, key: &SessionKey) -> Result<Session, FlowError> {
        let key = key.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO flow_sessions (app_name, user_id, session_id, state, last_update_time)
                 VALUES (?1, ?2, ?3, '{}', 0)",
                params![key.app_name, key.user_id, key.session_id],
            )?;
            load_session(conn, &key)?
                .ok_or_else(|| FlowError::Session(format!("session vanished: {key}")))
        })
        .await
    }

    async fn get(&self, key: &SessionKey) -> Result<Option<Session>, FlowError> {
        let key = key.clone();
        self.with_conn(move |conn| load_session(conn, &key)).await
    }

    async fn append_event(&self, session: &Session, mut event: Event) -> Result<Event, FlowError> {
        if event.partial {
            return Ok(event);
        }
        let key = session.key();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let row: Option<(String, i64)> = tx
                .query_row(
                    "SELECT state, last_update_time FROM flow_sessions
                     WHERE app_name = ?1 AND user_id = ?2 AND session_id = ?3",
                    params![key.app_name, key.user_id, key.session_id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            let (state_raw, last_update_time) =
                row.ok_or_else(|| FlowError::Session(format!("session not found: {key}")))?;

            if event.timestamp < last_update_time {
                event.timestamp = last_update_time;
            }
            let split = split_delta(&event.actions.state_delta);

            let mut session_state: StateMap = serde_json::from_str(&state_raw)?;
            apply_delta(&mut session_state, &split.session);
            tx.execute(
                "UPDATE flow_sessions SET state = ?4, last_update_time = ?5
                 WHERE app_name = ?1 AND user_id = ?2 AND session_id = ?3",
                params![
                    key.app_name,
                    key.user_id,
                    key.session_id,
                    serde_json::to_string(&session_state)?,
                    event.timestamp
                ],
            )?;

            let mut persisted = event.clone();
            strip_temp(&mut persisted.actions.state_delta);
            tx.execute(
                "INSERT INTO flow_events (app_name, user_id, session_id, payload) VALUES (?1, ?2, ?3, ?4)",
                params![
                    key.app_name,
                    key.user_id,
                    key.session_id,
                    serde_json::to_string(&persisted)?
                ],
            )?;

            if !split.app.is_empty() {
                let mut app = read_state(
                    &tx,
                    "SELECT state FROM flow_app_state WHERE app_name = ?1",
                    &[&key.app_name],
                )?;
                apply_delta(&mut app, &split.app);
                tx.execute(
                    "INSERT INTO flow_app_state (app_name, state) VALUES (?1, ?2)
                     ON CONFLICT(app_name) DO UPDATE SET state = excluded.state",
                    params![key.app_name, serde_json::to_string(&app)?],
                )?;
            }
            if !split.user.is_empty() {
                let mut user = read_state(
                    &tx,
                    "SELECT state FROM flow_user_state WHERE app_name = ?1 AND user_id = ?2",
                    &[&key.app_name, &key.user_id],
                )?;
                apply_delta(&mut user, &split.user);
                tx.execute(
                    "INSERT INTO flow_user_state (app_name, user_id, state) VALUES (?1, ?2, ?3)
                     ON CONFLICT(app_name, user_id) DO UPDATE SET state = excluded.state",
                    params![key.app_name, key.user_id, serde_json::to_string(&user)?],
                )?;
            }

            tx.commit()?;
            Ok(event)
        })
        .await
    }

    async fn list_sessions(&self, app_name: &str, user_id: &str) -> Result<Vec<String>, FlowError> {
        let (app_name, user_id) = (app_name.to_string(), user_id.to_string());
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT session_id FROM flow_sessions
                 WHERE app_name = ?1 AND user_id = ?2 ORDER BY session_id ASC",
            )?;
            let ids = stmt
                .query_map(params![app_name, user_id], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(ids)
        })
        .await
    }

    async fn delete(&self, key: &SessionKey) -> Result<(), FlowError> {
        let key = key.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "DELETE FROM flow_events WHERE app_name = ?1 AND user_id = ?2 AND session_id = ?3",
                params![key.app_name, key.user_id, key.session_id],
            )?;
            tx.execute(
                "DELETE FROM flow_sessions WHERE app_name = ?1 AND user_id = ?2 AND session_id = ?3",
                params![key.app_name, key.user_id, key.session_id],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_events_and_state_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sessions.db");
        let key = SessionKey::new("app", "u", "s");
        {
            let store = SqliteSessionStore::open(&path).unwrap();
            let session = store.get_or_create(&key).await.unwrap();
            let mut event = Event::new("inv", "agent");
            event.actions.state_delta.insert("counter".into(), json!(1));
            event.actions.state_delta.insert("user:name".into(), json!("ada"));
            event.actions.state_delta.insert("temp:scratch".into(), json!("x"));
            store.append_event(&session, event).await.unwrap();
        }
        let store = SqliteSessionStore::open(&path).unwrap();
        let session = store.get(&key).await.unwrap().unwrap();
        assert_eq!(session.events.len(), 1);
        assert_eq!(session.state.get("counter"), Some(&json!(1)));
        assert_eq!(session.state.get("user:name"), Some(&json!("ada")));
        assert!(session.state.get("temp:scratch").is_none());
        assert!(session.events[0].actions.state_delta.get("temp:scratch").is_none());
    }

    #[tokio::test]
    async fn test_user_state_shared_across_sessions() {
        let store = SqliteSessionStore::open_in_memory().unwrap();
        let a = SessionKey::new("app", "u", "a");
        let b = SessionKey::new("app", "u", "b");
        let session = store.get_or_create(&a).await.unwrap();
        let mut event = Event::new("inv", "agent");
        event.actions.state_delta.insert("user:tz".into(), json!("UTC"));
        store.append_event(&session, event).await.unwrap();
        let other = store.get_or_create(&b).await.unwrap();
        assert_eq!(other.state.get("user:tz"), Some(&json!("UTC")));
        assert_eq!(
            store.list_sessions("app", "u").await.unwrap(),
            vec!["a".to_string(), "b".to_string()]
        );
    }

    #[tokio::test]
    async fn test_delete_removes_events() {
        let store = SqliteSessionStore::open_in_memory().unwrap();
        let key = SessionKey::new("app", "u", "s");
        let session = store.get_or_create(&key).await.unwrap();
        store.append_event(&session, Event::new("inv", "agent")).await.unwrap();
        store.delete(&key).await.unwrap();
        assert!(store.get(&key).await.unwrap().is_none());
    }
}
