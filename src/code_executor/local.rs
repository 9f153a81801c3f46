//! 非隔离本地执行：用宿主解释器直接运行代码片段
//!
//! 被执行代码与编排进程处于同一权限域，拥有宿主全部访问权限，构造时必须显式 opt-in。
//! 每次执行在独立的临时工作目录中进行，执行后目录中的文件作为输出文件返回。

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::time::timeout;

use crate::code_executor::traits::{
    CodeExecutionInput, CodeExecutionResult, CodeExecutor, CodeExecutorConfig, CodeExecutorError,
    OutputFile,
};

/// 预先导入的标准库模块，代码片段可直接使用
pub const PYTHON_PRELUDE: &str = "import math, json, re, datetime\n";

pub struct UnsafeLocalCodeExecutor {
    config: CodeExecutorConfig,
    python: String,
}

impl UnsafeLocalCodeExecutor {
    pub fn new(
        config: CodeExecutorConfig,
        python: impl Into<String>,
        allow_unsafe: bool,
    ) -> Result<Self, CodeExecutorError> {
        if !allow_unsafe {
            return Err(CodeExecutorError::Unsupported(
                "unsafe local execution requires an explicit opt-in".into(),
            ));
        }
        if config.stateful {
            return Err(CodeExecutorError::Unsupported(
                "the local executor cannot be stateful".into(),
            ));
        }
        Ok(Self {
            config,
            python: python.into(),
        })
    }
}

#[async_trait]
impl CodeExecutor for UnsafeLocalCodeExecutor {
    fn name(&self) -> &str {
        "unsafe_local"
    }

    fn config(&self) -> &CodeExecutorConfig {
        &self.config
    }

    async fn execute(&self, input: &CodeExecutionInput) -> Result<CodeExecutionResult, CodeExecutorError> {
        let workdir = std::env::temp_dir().join(format!("bee-flow-exec-{}", uuid::Uuid::new_v4().simple()));
        tokio::fs::create_dir_all(&workdir).await?;

        let result = run_in(&self.python, &workdir, &input.code, &self.config).await;
        let files = match &result {
            Ok(_) => collect_files(&workdir).await,
            Err(_) => Vec::new(),
        };
        if let Err(e) = tokio::fs::remove_dir_all(&workdir).await {
            tracing::warn!(error = %e, dir = %workdir.display(), "failed to clean exec dir");
        }

        let mut result = result?;
        result.output_files = files;
        tracing::debug!(exit_code = ?result.exit_code, files = result.output_files.len(), "local code execution finished");
        Ok(result)
    }
}

async fn run_in(
    python: &str,
    workdir: &Path,
    code: &str,
    config: &CodeExecutorConfig,
) -> Result<CodeExecutionResult, CodeExecutorError> {
    let mut command = tokio::process::Command::new(python);
    command.kill_on_drop(true);
    command.arg("-c").arg(format!("{PYTHON_PRELUDE}{code}"));
    command.current_dir(workdir);
    command.stdin(Stdio::null());
    command.stdout(Stdio::piped());
    command.stderr(Stdio::piped());

    let output = timeout(config.timeout, command.output())
        .await
        .map_err(|_| CodeExecutorError::Timeout(config.timeout))?
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                CodeExecutorError::Unavailable(format!("interpreter not found: {python}"))
            }
            _ => CodeExecutorError::Io(e),
        })?;

    Ok(CodeExecutionResult {
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        exit_code: output.status.code(),
        output_files: Vec::new(),
    })
}

async fn collect_files(dir: &Path) -> Vec<OutputFile> {
    let mut files = Vec::new();
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return files;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        if let Ok(data) = tokio::fs::read(&path).await {
            files.push(OutputFile {
                name: entry.file_name().to_string_lossy().into_owned(),
                mime_type: None,
                data,
            });
        }
    }
    files.sort_by(|a, b| a.name.cmp(&b.name));
    files
}

#[cfg(test)]
mod tests {
    use super::*;

    fn python_available() -> bool {
        std::process::Command::new("python3")
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    #[test]
    fn test_requires_opt_in() {
        let err = UnsafeLocalCodeExecutor::new(CodeExecutorConfig::default(), "python3", false);
        assert!(matches!(err, Err(CodeExecutorError::Unsupported(_))));
    }

    #[test]
    fn test_rejects_stateful() {
        let config = CodeExecutorConfig {
            stateful: true,
            ..Default::default()
        };
        assert!(UnsafeLocalCodeExecutor::new(config, "python3", true).is_err());
    }

    #[tokio::test]
    async fn test_factorial_with_prelude() {
        if !python_available() {
            return;
        }
        let exec = UnsafeLocalCodeExecutor::new(CodeExecutorConfig::default(), "python3", true).unwrap();
        let result = exec
            .execute(&CodeExecutionInput {
                code: "print(math.factorial(5))".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(result.stdout, "120\n");
        assert_eq!(result.stderr, "");
        assert!(!result.is_error());
    }

    #[tokio::test]
    async fn test_program_error_is_data() {
        if !python_available() {
            return;
        }
        let exec = UnsafeLocalCodeExecutor::new(CodeExecutorConfig::default(), "python3", true).unwrap();
        let result = exec
            .execute(&CodeExecutionInput {
                code: "raise ValueError('boom')".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(result.is_error());
        assert!(result.stderr.contains("boom"));
    }

    #[tokio::test]
    async fn test_output_files_are_collected() {
        if !python_available() {
            return;
        }
        let exec = UnsafeLocalCodeExecutor::new(CodeExecutorConfig::default(), "python3", true).unwrap();
        let result = exec
            .execute(&CodeExecutionInput {
                code: "open('out.txt', 'w').write('hi')".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(result.output_files.len(), 1);
        assert_eq!(result.output_files[0].name, "out.txt");
        assert_eq!(result.output_files[0].data, b"hi");
    }

    #[tokio::test]
    async fn test_missing_interpreter_is_unavailable() {
        let exec = UnsafeLocalCodeExecutor::new(
            CodeExecutorConfig::default(),
            "definitely-not-a-python-binary",
            true,
        )
        .unwrap();
        let err = exec
            .execute(&CodeExecutionInput {
                code: "print(1)".into(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CodeExecutorError::Unavailable(_)));
    }
}
