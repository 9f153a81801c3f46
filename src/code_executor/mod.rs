//! 代码执行：本地非隔离 / 容器隔离 / 托管远程三种后端，共享一个 execute 能力

pub mod container;
pub mod extract;
pub mod local;
pub mod remote;
pub mod traits;

use std::sync::Arc;
use std::time::Duration;

pub use container::ContainerCodeExecutor;
pub use extract::{extract_code_and_truncate, format_code_block, format_execution_result};
pub use local::UnsafeLocalCodeExecutor;
pub use remote::RemoteCodeExecutor;
pub use traits::{
    CodeExecutionInput, CodeExecutionResult, CodeExecutor, CodeExecutorConfig, CodeExecutorError,
    OutputFile,
};

use crate::config::{CodeExecutorKind, CodeExecutorSection};
use crate::core::FlowError;

impl From<&CodeExecutorSection> for CodeExecutorConfig {
    fn from(section: &CodeExecutorSection) -> Self {
        Self {
            stateful: section.stateful,
            error_retry_attempts: section.error_retry_attempts,
            code_block_delimiters: section.code_block_delimiters.clone(),
            execution_result_delimiters: section.execution_result_delimiters.clone(),
            timeout: Duration::from_secs(section.timeout_secs),
        }
    }
}

/// 按 [code_executor] 配置构造后端；kind = none 时返回 None
pub fn from_config(section: &CodeExecutorSection) -> Result<Option<Arc<dyn CodeExecutor>>, FlowError> {
    let config = CodeExecutorConfig::from(section);
    let executor: Arc<dyn CodeExecutor> = match section.kind {
        CodeExecutorKind::None => return Ok(None),
        CodeExecutorKind::Local => {
            tracing::warn!("unsafe local code execution enabled: snippets run with full host access");
            Arc::new(
                UnsafeLocalCodeExecutor::new(config, &section.python, section.allow_unsafe_local)
                    .map_err(|e| FlowError::Config(e.to_string()))?,
            )
        }
        CodeExecutorKind::Container => Arc::new(
            ContainerCodeExecutor::new(config, &section.image, &section.memory_limit)
                .map_err(|e| FlowError::Config(e.to_string()))?,
        ),
        CodeExecutorKind::Remote => {
            let endpoint = section
                .endpoint
                .clone()
                .ok_or_else(|| FlowError::Config("code_executor.endpoint is required for kind = remote".into()))?;
            Arc::new(RemoteCodeExecutor::new(config, endpoint))
        }
    };
    Ok(Some(executor))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_without_opt_in_is_config_error() {
        let section = CodeExecutorSection {
            kind: CodeExecutorKind::Local,
            ..Default::default()
        };
        assert!(matches!(from_config(&section), Err(FlowError::Config(_))));
    }

    #[test]
    fn test_none_and_remote() {
        assert!(from_config(&CodeExecutorSection::default()).unwrap().is_none());
        let remote = CodeExecutorSection {
            kind: CodeExecutorKind::Remote,
            ..Default::default()
        };
        assert!(from_config(&remote).is_err());
        let remote = CodeExecutorSection {
            kind: CodeExecutorKind::Remote,
            endpoint: Some("http://localhost:1/run".into()),
            stateful: true,
            ..Default::default()
        };
        let exec = from_config(&remote).unwrap().unwrap();
        assert_eq!(exec.name(), "remote");
        assert!(exec.config().stateful);
    }
}
