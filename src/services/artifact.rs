//! Artifact 存储：按会话保存带版本的二进制文件

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::core::FlowError;
use crate::session::SessionKey;

#[async_trait]
pub trait ArtifactService: Send + Sync {
    /// 保存一个新版本，返回版本号（从 0 开始）
    async fn save(&self, key: &SessionKey, filename: &str, data: Vec<u8>) -> Result<u32, FlowError>;

    /// version 为 None 时读取最新版本
    async fn load(
        &self,
        key: &SessionKey,
        filename: &str,
        version: Option<u32>,
    ) -> Result<Option<Vec<u8>>, FlowError>;

    async fn list_keys(&self, key: &SessionKey) -> Result<Vec<String>, FlowError>;
}

#[derive(Default)]
pub struct InMemoryArtifactService {
    artifacts: RwLock<HashMap<(SessionKey, String), Vec<Vec<u8>>>>,
}

impl InMemoryArtifactService {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ArtifactService for InMemoryArtifactService {
    async fn save(&self, key: &SessionKey, filename: &str, data: Vec<u8>) -> Result<u32, FlowError> {
        let mut artifacts = self.artifacts.write().await;
        let versions = artifacts
            .entry((key.clone(), filename.to_string()))
            .or_default();
        versions.push(data);
        Ok((versions.len() - 1) as u32)
    }

    async fn load(
        &self,
        key: &SessionKey,
        filename: &str,
        version: Option<u32>,
    ) -> Result<Option<Vec<u8>>, FlowError> {
        let artifacts = self.artifacts.read().await;
        let Some(versions) = artifacts.get(&(key.clone(), filename.to_string())) else {
            return Ok(None);
        };
        Ok(match version {
            Some(v) => versions.get(v as usize).cloned(),
            None => versions.last().cloned(),
        })
    }

    async fn list_keys(&self, key: &SessionKey) -> Result<Vec<String>, FlowError> {
        let artifacts = self.artifacts.read().await;
        let mut names: Vec<String> = artifacts
            .keys()
            .filter(|(k, _)| k == key)
            .map(|(_, name)| name.clone())
            .collect();
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_versions_increment_and_latest_wins() {
        let svc = InMemoryArtifactService::new();
        let key = SessionKey::new("app", "u", "s");
        assert_eq!(svc.save(&key, "plot.png", vec![1]).await.unwrap(), 0);
        assert_eq!(svc.save(&key, "plot.png", vec![2]).await.unwrap(), 1);
        assert_eq!(svc.load(&key, "plot.png", None).await.unwrap(), Some(vec![2]));
        assert_eq!(svc.load(&key, "plot.png", Some(0)).await.unwrap(), Some(vec![1]));
        assert_eq!(svc.load(&key, "plot.png", Some(9)).await.unwrap(), None);
        assert_eq!(svc.list_keys(&key).await.unwrap(), vec!["plot.png".to_string()]);
    }

    #[tokio::test]
    async fn test_sessions_are_isolated() {
        let svc = InMemoryArtifactService::new();
        let a = SessionKey::new("app", "u", "a");
        let b = SessionKey::new("app", "u", "b");
        svc.save(&a, "notes.txt", b"x".to_vec()).await.unwrap();
        assert!(svc.list_keys(&b).await.unwrap().is_empty());
        assert_eq!(svc.load(&b, "notes.txt", None).await.unwrap(), None);
    }
}
