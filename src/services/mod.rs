//! 外部协作服务：artifact、长期记忆、凭证
//!
//! 编排核心只通过这些窄接口访问它们，具体一致性由各实现自行保证。

pub mod artifact;
pub mod credential;
pub mod memory;

use std::sync::Arc;

pub use artifact::{ArtifactService, InMemoryArtifactService};
pub use credential::{AuthRequest, Credential, CredentialService, InMemoryCredentialService};
pub use memory::{InMemoryMemoryService, MemoryEntry, MemoryService};

use crate::session::{InMemorySessionStore, SessionStore};

/// 一次运行所需的服务句柄集合
#[derive(Clone)]
pub struct Services {
    pub sessions: Arc<dyn SessionStore>,
    pub artifacts: Arc<dyn ArtifactService>,
    pub memory: Arc<dyn MemoryService>,
    pub credentials: Arc<dyn CredentialService>,
}

impl Services {
    /// 全内存实现，测试与评测默认使用
    pub fn in_memory() -> Self {
        Self::with_session_store(Arc::new(InMemorySessionStore::new()))
    }

    pub fn with_session_store(sessions: Arc<dyn SessionStore>) -> Self {
        Self {
            sessions,
            artifacts: Arc::new(InMemoryArtifactService::new()),
            memory: Arc::new(InMemoryMemoryService::new()),
            credentials: Arc::new(InMemoryCredentialService::new()),
        }
    }
}
