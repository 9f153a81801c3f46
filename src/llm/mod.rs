//! LLM 层：模型网关抽象、模型名解析表与实现（OpenAI 兼容 / DeepSeek / Mock）

pub mod mock;
pub mod openai;
pub mod registry;
pub mod request;
pub mod traits;

pub use mock::MockLlmClient;
pub use openai::{OpenAiCompatibleClient, TokenUsage, DEEPSEEK_BASE_URL, OPENAI_BASE_URL};
pub use registry::{default_registry, ModelFactory, ModelRegistry, ModelRegistryBuilder};
pub use request::{FunctionDeclaration, GenerateConfig, LlmRequest, LlmResponse, UsageMetadata};
pub use traits::{LlmClient, LlmError, LlmStream};
