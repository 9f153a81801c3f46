//! 容器隔离执行：代码经 stdin 送入一次性容器，无网络、限内存，调用之间不保留状态

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::time::timeout;

use crate::code_executor::traits::{
    CodeExecutionInput, CodeExecutionResult, CodeExecutor, CodeExecutorConfig, CodeExecutorError,
};

pub struct ContainerCodeExecutor {
    config: CodeExecutorConfig,
    runtime: String,
    image: String,
    memory_limit: String,
}

impl ContainerCodeExecutor {
    pub fn new(
        config: CodeExecutorConfig,
        image: impl Into<String>,
        memory_limit: impl Into<String>,
    ) -> Result<Self, CodeExecutorError> {
        if config.stateful {
            return Err(CodeExecutorError::Unsupported(
                "the container executor cannot be stateful".into(),
            ));
        }
        Ok(Self {
            config,
            runtime: "docker".to_string(),
            image: image.into(),
            memory_limit: memory_limit.into(),
        })
    }

    /// 替换容器运行时（如 podman）
    pub fn with_runtime(mut self, runtime: impl Into<String>) -> Self {
        self.runtime = runtime.into();
        self
    }

    pub fn command_args(&self) -> Vec<String> {
        vec![
            "run".into(),
            "--rm".into(),
            "-i".into(),
            "--network".into(),
            "none".into(),
            "--memory".into(),
            self.memory_limit.clone(),
            self.image.clone(),
            "python3".into(),
            "-".into(),
        ]
    }
}

#[async_trait]
impl CodeExecutor for ContainerCodeExecutor {
    fn name(&self) -> &str {
        "container"
    }

    fn config(&self) -> &CodeExecutorConfig {
        &self.config
    }

    async fn execute(&self, input: &CodeExecutionInput) -> Result<CodeExecutionResult, CodeExecutorError> {
        let mut command = tokio::process::Command::new(&self.runtime);
        command.kill_on_drop(true);
        command.args(self.command_args());
        command.stdin(Stdio::piped());
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());

        let mut child = command.spawn().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                CodeExecutorError::Unavailable(format!("container runtime not found: {}", self.runtime))
            }
            _ => CodeExecutorError::Io(e),
        })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(input.code.as_bytes()).await?;
            // 关闭 stdin，容器内 python 读到 EOF 后开始执行
            drop(stdin);
        }

        let output = timeout(self.config.timeout, child.wait_with_output())
            .await
            .map_err(|_| CodeExecutorError::Timeout(self.config.timeout))??;

        // 125: docker 自身失败（镜像缺失、daemon 不可达）
        if output.status.code() == Some(125) {
            return Err(CodeExecutorError::Unavailable(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        Ok(CodeExecutionResult {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code(),
            output_files: Vec::new(),
        })
    }
}
