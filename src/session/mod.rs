//! 会话层：内容与事件模型、作用域状态、会话存储（内存 / SQLite）

pub mod content;
pub mod event;
pub mod memory_store;
pub mod sqlite_store;
pub mod state;
pub mod store;

pub use content::{
    CodeExecutionOutput, Content, ExecutableCode, FunctionCall, FunctionResponse, Part, Role,
};
pub use event::{new_function_call_id, Event, EventActions, CODE_EXECUTOR_AUTHOR, USER_AUTHOR};
pub use memory_store::InMemorySessionStore;
pub use sqlite_store::SqliteSessionStore;
pub use state::{StateMap, StateScope, APP_PREFIX, TEMP_PREFIX, USER_PREFIX};
pub use store::{Session, SessionKey, SessionStore};
