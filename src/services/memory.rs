//! 长期记忆服务：把会话中的文本事件沉淀下来，供后续会话按关键词检索

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::core::FlowError;
use crate::session::Session;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub author: String,
    pub text: String,
    pub timestamp: i64,
}

#[async_trait]
pub trait MemoryService: Send + Sync {
    /// 摄入一个会话的全部文本事件
    async fn add_session(&self, session: &Session) -> Result<(), FlowError>;

    async fn search(
        &self,
        app_name: &str,
        user_id: &str,
        query: &str,
    ) -> Result<Vec<MemoryEntry>, FlowError>;
}

/// 内存实现：与查询共享至少一个小写单词即命中
#[derive(Default)]
pub struct InMemoryMemoryService {
    entries: RwLock<HashMap<(String, String), Vec<MemoryEntry>>>,
}

impl InMemoryMemoryService {
    pub fn new() -> Self {
        Self::default()
    }
}

fn words(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .collect()
}

#[async_trait]
impl MemoryService for InMemoryMemoryService {
    async fn add_session(&self, session: &Session) -> Result<(), FlowError> {
        let new_entries: Vec<MemoryEntry> = session
            .events
            .iter()
            .filter_map(|e| {
                e.text().map(|text| MemoryEntry {
                    author: e.author.clone(),
                    text,
                    timestamp: e.timestamp,
                })
            })
            .collect();
        let mut entries = self.entries.write().await;
        entries
            .entry((session.app_name.clone(), session.user_id.clone()))
            .or_default()
            .extend(new_entries);
        Ok(())
    }

    async fn search(
        &self,
        app_name: &str,
        user_id: &str,
        query: &str,
    ) -> Result<Vec<MemoryEntry>, FlowError> {
        let query_words = words(query);
        let entries = self.entries.read().await;
        Ok(entries
            .get(&(app_name.to_string(), user_id.to_string()))
            .map(|list| {
                list.iter()
                    .filter(|e| !words(&e.text).is_disjoint(&query_words))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{Content, Event, SessionKey};

    #[tokio::test]
    async fn test_search_matches_shared_words() {
        let svc = InMemoryMemoryService::new();
        let mut session = Session::new(&SessionKey::new("app", "u", "s"));
        session.apply_event(
            &Event::new("inv", "user").with_content(Content::user_text("My favourite colour is teal")),
            false,
        );
        session.apply_event(
            &Event::new("inv", "agent").with_content(Content::model_text("Noted!")),
            false,
        );
        svc.add_session(&session).await.unwrap();

        let hits = svc.search("app", "u", "what COLOUR do I like?").await.unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].text.contains("teal"));
        assert!(svc.search("app", "other", "colour").await.unwrap().is_empty());
    }
}
