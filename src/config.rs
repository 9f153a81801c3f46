//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `BEE_FLOW__*` 覆盖（双下划线表示嵌套，如 `BEE_FLOW__RUN__MAX_LLM_CALLS=5`）。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub run: RunSection,
    pub tools: ToolsSection,
    pub code_executor: CodeExecutorSection,
    pub session: SessionSection,
}

/// [app] 段：应用名、数据目录
#[derive(Debug, Clone, Deserialize)]
pub struct AppSection {
    #[serde(default = "default_app_name")]
    pub name: String,
    /// SQLite 等持久化文件的默认目录
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            data_dir: default_data_dir(),
        }
    }
}

fn default_app_name() -> String {
    "bee-flow".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

/// [llm] 段：OpenAI 兼容端点、密钥来源、超时与默认模型
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    pub base_url: Option<String>,
    /// 读取 API Key 的环境变量名
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// agent 定义未指定模型时使用
    #[serde(default = "default_model")]
    pub default_model: String,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            base_url: None,
            api_key_env: default_api_key_env(),
            request_timeout_secs: default_request_timeout(),
            default_model: default_model(),
        }
    }
}

impl LlmSection {
    pub fn api_key(&self) -> Option<String> {
        std::env::var(&self.api_key_env).ok()
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_request_timeout() -> u64 {
    60
}

fn default_model() -> String {
    "mock".to_string()
}

/// [run] 段：单轮限制
#[derive(Debug, Clone, Deserialize)]
pub struct RunSection {
    /// 单轮模型调用上限，0 表示不限制
    #[serde(default = "default_max_llm_calls")]
    pub max_llm_calls: usize,
    #[serde(default)]
    pub streaming: bool,
    #[serde(default = "default_max_concurrent_tools")]
    pub max_concurrent_tools: usize,
}

impl Default for RunSection {
    fn default() -> Self {
        Self {
            max_llm_calls: default_max_llm_calls(),
            streaming: false,
            max_concurrent_tools: default_max_concurrent_tools(),
        }
    }
}

fn default_max_llm_calls() -> usize {
    20
}

fn default_max_concurrent_tools() -> usize {
    3
}

/// [tools] 段：工具超时
#[derive(Debug, Clone, Deserialize)]
pub struct ToolsSection {
    /// 单次工具调用超时（秒）
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            tool_timeout_secs: default_tool_timeout_secs(),
        }
    }
}

fn default_tool_timeout_secs() -> u64 {
    30
}

/// 代码执行后端
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum CodeExecutorKind {
    #[default]
    None,
    Local,
    Container,
    Remote,
}

/// [code_executor] 段
#[derive(Debug, Clone, Deserialize)]
pub struct CodeExecutorSection {
    #[serde(default)]
    pub kind: CodeExecutorKind,
    /// local 后端必须显式打开：被执行代码拥有宿主全部权限
    #[serde(default)]
    pub allow_unsafe_local: bool,
    #[serde(default)]
    pub stateful: bool,
    #[serde(default = "default_error_retry_attempts")]
    pub error_retry_attempts: usize,
    #[serde(default = "default_code_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_python")]
    pub python: String,
    #[serde(default = "default_image")]
    pub image: String,
    #[serde(default = "default_memory_limit")]
    pub memory_limit: String,
    pub endpoint: Option<String>,
    #[serde(default = "default_code_block_delimiters")]
    pub code_block_delimiters: Vec<(String, String)>,
    #[serde(default = "default_execution_result_delimiters")]
    pub execution_result_delimiters: (String, String),
}

impl Default for CodeExecutorSection {
    fn default() -> Self {
        Self {
            kind: CodeExecutorKind::None,
            allow_unsafe_local: false,
            stateful: false,
            error_retry_attempts: default_error_retry_attempts(),
            timeout_secs: default_code_timeout_secs(),
            python: default_python(),
            image: default_image(),
            memory_limit: default_memory_limit(),
            endpoint: None,
            code_block_delimiters: default_code_block_delimiters(),
            execution_result_delimiters: default_execution_result_delimiters(),
        }
    }
}

fn default_error_retry_attempts() -> usize {
    2
}

fn default_code_timeout_secs() -> u64 {
    30
}

fn default_python() -> String {
    "python3".to_string()
}

fn default_image() -> String {
    "python:3.12-slim".to_string()
}

fn default_memory_limit() -> String {
    "256m".to_string()
}

pub fn default_code_block_delimiters() -> Vec<(String, String)> {
    vec![
        ("```tool_code\n".into(), "\n```".into()),
        ("```python\n".into(), "\n```".into()),
    ]
}

pub fn default_execution_result_delimiters() -> (String, String) {
    ("```tool_output\n".into(), "\n```".into())
}

/// 会话存储后端
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SessionBackend {
    #[default]
    Memory,
    Sqlite,
}

/// [session] 段
#[derive(Debug, Clone, Deserialize, Default)]
pub struct SessionSection {
    #[serde(default)]
    pub backend: SessionBackend,
    /// 未设置时使用 `<data_dir>/sessions.db`
    pub sqlite_path: Option<PathBuf>,
}

impl AppConfig {
    pub fn sqlite_path(&self) -> PathBuf {
        self.session
            .sqlite_path
            .clone()
            .unwrap_or_else(|| self.app.data_dir.join("sessions.db"))
    }
}

/// 从 config 目录加载配置，环境变量 BEE_FLOW__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 BEE_FLOW__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        } else {
            tracing::warn!(path = %path.display(), "config file not found, ignoring");
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("BEE_FLOW")
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

/// 加载失败时退回默认值并记录告警，保证二进制总能启动
pub fn load_config_or_default(config_path: Option<PathBuf>) -> AppConfig {
    match load_config(config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::warn!(error = %e, "failed to load config, using defaults");
            AppConfig::default()
        }
    }
}
