//! 模型名 -> 后端适配器的解析表
//!
//! 启动时通过 ModelRegistryBuilder 显式注册一次，build() 之后只读；
//! 模式为锚定正则，按注册顺序匹配，先匹配者胜。未注册的模型名直接报配置错误，不重试。

use std::sync::Arc;

use regex::Regex;

use crate::config::LlmSection;
use crate::core::FlowError;
use crate::llm::mock::MockLlmClient;
use crate::llm::openai::OpenAiCompatibleClient;
use crate::llm::LlmClient;

/// 根据模型名构造客户端
pub type ModelFactory = Arc<dyn Fn(&str) -> Arc<dyn LlmClient> + Send + Sync>;

struct Entry {
    pattern: Regex,
    factory: ModelFactory,
}

#[derive(Default)]
pub struct ModelRegistryBuilder {
    entries: Vec<Entry>,
}

impl ModelRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册一个模式；模式会被自动锚定为 `^(?:pattern)$`
    pub fn register<F>(mut self, pattern: &str, factory: F) -> Result<Self, FlowError>
    where
        F: Fn(&str) -> Arc<dyn LlmClient> + Send + Sync + 'static,
    {
        let anchored = format!("^(?:{pattern})$");
        let pattern = Regex::new(&anchored)
            .map_err(|e| FlowError::Config(format!("invalid model pattern {pattern}: {e}")))?;
        self.entries.push(Entry {
            pattern,
            factory: Arc::new(factory),
        });
        Ok(self)
    }

    /// 以精确名注册一个现成客户端（测试中注入有状态的 Mock）
    pub fn register_client(mut self, name: &str, client: Arc<dyn LlmClient>) -> Self {
        let anchored = format!("^{}$", regex::escape(name));
        if let Ok(pattern) = Regex::new(&anchored) {
            self.entries.push(Entry {
                pattern,
                factory: Arc::new(move |_| client.clone()),
            });
        }
        self
    }

    pub fn build(self) -> ModelRegistry {
        ModelRegistry {
            entries: Arc::new(self.entries),
        }
    }
}

/// 只读解析表，可廉价克隆并在多个 Runner 间共享
#[derive(Clone)]
pub struct ModelRegistry {
    entries: Arc<Vec<Entry>>,
}

impl ModelRegistry {
    pub fn builder() -> ModelRegistryBuilder {
        ModelRegistryBuilder::new()
    }

    pub fn supports(&self, model: &str) -> bool {
        self.entries.iter().any(|e| e.pattern.is_match(model))
    }

    pub fn resolve(&self, model: &str) -> Result<Arc<dyn LlmClient>, FlowError> {
        self.entries
            .iter()
            .find(|e| e.pattern.is_match(model))
            .map(|e| (e.factory)(model))
            .ok_or_else(|| FlowError::Config(format!("no backend registered for model '{model}'")))
    }
}

/// 默认注册表：gpt-* / o1.. 走 OpenAI 兼容端点，deepseek-* 走 DeepSeek，mock* 走本地 Mock
pub fn default_registry(llm: &LlmSection) -> Result<ModelRegistry, FlowError> {
    let openai_cfg = llm.clone();
    let deepseek_timeout = llm.request_timeout();
    let builder = ModelRegistry::builder()
        .register(r"gpt-.*|o[0-9].*", move |model| {
            Arc::new(OpenAiCompatibleClient::new(
                openai_cfg.base_url.as_deref(),
                model,
                openai_cfg.api_key().as_deref(),
                openai_cfg.request_timeout(),
            )) as Arc<dyn LlmClient>
        })?
        .register(r"deepseek-.*", move |model| {
            Arc::new(OpenAiCompatibleClient::deepseek(model, deepseek_timeout)) as Arc<dyn LlmClient>
        })?
        .register(r"mock.*", |model| {
            Arc::new(MockLlmClient::new(model)) as Arc<dyn LlmClient>
        })?;
    Ok(builder.build())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_patterns_are_anchored() {
        let registry = default_registry(&LlmSection::default()).unwrap();
        assert!(registry.supports("gpt-4o"));
        assert!(registry.supports("o3-mini"));
        assert!(registry.supports("deepseek-chat"));
        assert!(registry.supports("mock"));
        assert!(!registry.supports("my-gpt-4o"));
        assert!(!registry.supports("claude-x"));
    }

    #[test]
    fn test_unknown_model_is_config_error() {
        let registry = default_registry(&LlmSection::default()).unwrap();
        match registry.resolve("unknown-model") {
            Err(FlowError::Config(msg)) => assert!(msg.contains("unknown-model")),
            _ => panic!("expected config error"),
        }
    }

    #[test]
    fn test_first_match_wins() {
        let a: Arc<dyn LlmClient> = Arc::new(MockLlmClient::new("first"));
        let b: Arc<dyn LlmClient> = Arc::new(MockLlmClient::new("second"));
        let registry = ModelRegistry::builder()
            .register_client("mock-x", a)
            .register("mock.*", move |_| b.clone())
            .unwrap()
            .build();
        assert_eq!(registry.resolve("mock-x").unwrap().model_name(), "first");
        assert_eq!(registry.resolve("mock-y").unwrap().model_name(), "second");
    }

    #[test]
    fn test_invalid_pattern_is_rejected() {
        assert!(ModelRegistry::builder()
            .register("(", |m| Arc::new(MockLlmClient::new(m)) as Arc<dyn LlmClient>)
            .is_err());
    }
}
