//! 凭证协作方：工具在缺少凭证时发起带外认证请求，凭证在之后的轮次写回

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;

use crate::core::FlowError;

/// 已解析的凭证
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Credential {
    pub scheme: String,
    pub token: String,
}

/// 一个待用户完成的认证请求
///
/// 持久化在会话状态里（`_pending_auth`），因此等待可以跨越轮次甚至进程重启；
/// 凭证到达后按 tool_name + args 重新调用原工具。
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AuthRequest {
    pub request_id: String,
    pub scheme: String,
    pub function_call_id: String,
    pub tool_name: String,
    #[serde(default)]
    pub args: Value,
    /// 发起调用的 agent
    pub agent: String,
}

#[async_trait]
pub trait CredentialService: Send + Sync {
    /// 登记一个待解析的请求，返回 request id
    async fn request_credential(&self, user_id: &str, scheme: &str) -> Result<String, FlowError>;

    async fn get_cached_credential(
        &self,
        user_id: &str,
        scheme: &str,
    ) -> Result<Option<Credential>, FlowError>;

    /// 带外流程完成后写回凭证
    async fn store_credential(&self, user_id: &str, credential: Credential) -> Result<(), FlowError>;
}

#[derive(Default)]
pub struct InMemoryCredentialService {
    cached: RwLock<HashMap<(String, String), Credential>>,
    pending: RwLock<HashMap<String, (String, String)>>,
}

impl InMemoryCredentialService {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.read().await.len()
    }
}

#[async_trait]
impl CredentialService for InMemoryCredentialService {
    async fn request_credential(&self, user_id: &str, scheme: &str) -> Result<String, FlowError> {
        let request_id = format!("auth_{}", uuid::Uuid::new_v4().simple());
        self.pending
            .write()
            .await
            .insert(request_id.clone(), (user_id.to_string(), scheme.to_string()));
        tracing::info!(user = user_id, scheme, request_id = %request_id, "credential requested");
        Ok(request_id)
    }

    async fn get_cached_credential(
        &self,
        user_id: &str,
        scheme: &str,
    ) -> Result<Option<Credential>, FlowError> {
        Ok(self
            .cached
            .read()
            .await
            .get(&(user_id.to_string(), scheme.to_string()))
            .cloned())
    }

    async fn store_credential(&self, user_id: &str, credential: Credential) -> Result<(), FlowError> {
        self.pending
            .write()
            .await
            .retain(|_, (u, s)| !(u == user_id && *s == credential.scheme));
        self.cached
            .write()
            .await
            .insert((user_id.to_string(), credential.scheme.clone()), credential);
        Ok(())
    }
}
