//! 代码执行器抽象
//!
//! 被执行代码自身的失败（非零退出、异常）是一次「成功的执行」，以 stderr / exit_code 作为数据返回；
//! 只有基础设施故障（解释器缺失、沙箱不可达、超时）才是 CodeExecutorError。

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{default_code_block_delimiters, default_execution_result_delimiters};
use crate::session::CodeExecutionOutput;

#[derive(Error, Debug)]
pub enum CodeExecutorError {
    /// 解释器 / 容器运行时 / 远端服务不可用
    #[error("Executor unavailable: {0}")]
    Unavailable(String),

    #[error("Execution timed out after {0:?}")]
    Timeout(Duration),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Remote executor error: {0}")]
    Remote(String),

    /// 配置组合不被该后端支持（例如 stateful）
    #[error("Unsupported: {0}")]
    Unsupported(String),
}

impl From<reqwest::Error> for CodeExecutorError {
    fn from(e: reqwest::Error) -> Self {
        CodeExecutorError::Remote(e.to_string())
    }
}

#[derive(Clone, Debug)]
pub struct CodeExecutorConfig {
    /// 同一会话内跨次执行保留变量绑定（仅部分后端支持）
    pub stateful: bool,
    /// 失败代码回交模型自我修正的最大次数
    pub error_retry_attempts: usize,
    /// 识别模型文本中代码块的定界符，按顺序尝试
    pub code_block_delimiters: Vec<(String, String)>,
    /// 把执行结果回交模型时使用的定界符
    pub execution_result_delimiters: (String, String),
    pub timeout: Duration,
}

impl Default for CodeExecutorConfig {
    fn default() -> Self {
        Self {
            stateful: false,
            error_retry_attempts: 2,
            code_block_delimiters: default_code_block_delimiters(),
            execution_result_delimiters: default_execution_result_delimiters(),
            timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CodeExecutionInput {
    pub code: String,
    /// stateful 后端用它关联同一会话的多次执行
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub execution_id: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OutputFile {
    pub name: String,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub data: Vec<u8>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CodeExecutionResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub output_files: Vec<OutputFile>,
}

impl CodeExecutionResult {
    pub fn is_error(&self) -> bool {
        !self.stderr.is_empty() || self.exit_code.is_some_and(|c| c != 0)
    }

    /// 历史中的表示：文件只以名字引用，内容另存为 artifact
    pub fn to_output(&self) -> CodeExecutionOutput {
        CodeExecutionOutput {
            stdout: self.stdout.clone(),
            stderr: self.stderr.clone(),
            exit_code: self.exit_code,
            output_files: self.output_files.iter().map(|f| f.name.clone()).collect(),
        }
    }
}

#[async_trait]
pub trait CodeExecutor: Send + Sync {
    fn name(&self) -> &str;

    fn config(&self) -> &CodeExecutorConfig;

    async fn execute(&self, input: &CodeExecutionInput) -> Result<CodeExecutionResult, CodeExecutorError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_detection() {
        let ok = CodeExecutionResult {
            stdout: "120\n".into(),
            exit_code: Some(0),
            ..Default::default()
        };
        assert!(!ok.is_error());
        let failed = CodeExecutionResult {
            stderr: "NameError".into(),
            exit_code: Some(1),
            ..Default::default()
        };
        assert!(failed.is_error());
        assert!(failed.to_output().is_error());
    }
}
