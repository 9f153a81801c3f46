//! 托管远程执行：把代码交给外部执行服务；stateful 时以 session_id 关联同一会话的多次执行

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::code_executor::traits::{
    CodeExecutionInput, CodeExecutionResult, CodeExecutor, CodeExecutorConfig, CodeExecutorError,
    OutputFile,
};

#[derive(Serialize)]
struct RemoteRequest<'a> {
    code: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    session_id: Option<&'a str>,
    stateful: bool,
}

#[derive(Deserialize)]
struct RemoteResponse {
    #[serde(default)]
    stdout: String,
    #[serde(default)]
    stderr: String,
    #[serde(default)]
    exit_code: Option<i32>,
    #[serde(default)]
    output_files: Vec<RemoteFile>,
}

#[derive(Deserialize)]
struct RemoteFile {
    name: String,
    #[serde(default)]
    mime_type: Option<String>,
    #[serde(default)]
    content: String,
}

pub struct RemoteCodeExecutor {
    config: CodeExecutorConfig,
    endpoint: String,
    http: reqwest::Client,
}

impl RemoteCodeExecutor {
    pub fn new(config: CodeExecutorConfig, endpoint: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            config,
            endpoint: endpoint.into(),
            http,
        }
    }
}

#[async_trait]
impl CodeExecutor for RemoteCodeExecutor {
    fn name(&self) -> &str {
        "remote"
    }

    fn config(&self) -> &CodeExecutorConfig {
        &self.config
    }

    async fn execute(&self, input: &CodeExecutionInput) -> Result<CodeExecutionResult, CodeExecutorError> {
        let body = RemoteRequest {
            code: &input.code,
            session_id: if self.config.stateful {
                input.session_id.as_deref()
            } else {
                None
            },
            stateful: self.config.stateful,
        };
        let response = self
            .http
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    CodeExecutorError::Timeout(self.config.timeout)
                } else if e.is_connect() {
                    CodeExecutorError::Unavailable(e.to_string())
                } else {
                    CodeExecutorError::Remote(e.to_string())
                }
            })?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(CodeExecutorError::Remote(format!("HTTP {status}: {text}")));
        }
        let parsed: RemoteResponse = response.json().await?;
        Ok(CodeExecutionResult {
            stdout: parsed.stdout,
            stderr: parsed.stderr,
            exit_code: parsed.exit_code,
            output_files: parsed
                .output_files
                .into_iter()
                .map(|f| OutputFile {
                    name: f.name,
                    mime_type: f.mime_type,
                    data: f.content.into_bytes(),
                })
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// 单连接 HTTP 桩：读取请求后返回固定 JSON，并把请求体交回测试
    async fn serve_once(body: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 8192];
            let mut request = Vec::new();
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                request.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&request);
                if let Some(head_end) = text.find("\r\n\r\n") {
                    let len = text[..head_end]
                        .lines()
                        .find_map(|l| {
                            l.to_ascii_lowercase()
                                .strip_prefix("content-length:")
                                .map(|v| v.trim().parse::<usize>().unwrap_or(0))
                        })
                        .unwrap_or(0);
                    if request.len() >= head_end + 4 + len || n == 0 {
                        break;
                    }
                }
                if n == 0 {
                    break;
                }
            }
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            let text = String::from_utf8_lossy(&request).into_owned();
            text.split("\r\n\r\n").nth(1).unwrap_or_default().to_string()
        });
        (format!("http://{addr}/execute"), handle)
    }

    #[tokio::test]
    async fn test_stateful_request_carries_session() {
        let (url, server) =
            serve_once(r#"{"stdout":"3\n","stderr":"","exit_code":0,"output_files":[{"name":"a.txt","content":"x"}]}"#).await;
        let config = CodeExecutorConfig {
            stateful: true,
            ..Default::default()
        };
        let exec = RemoteCodeExecutor::new(config, url);
        let result = exec
            .execute(&CodeExecutionInput {
                code: "print(1+2)".into(),
                session_id: Some("s1".into()),
                execution_id: None,
            })
            .await
            .unwrap();
        assert_eq!(result.stdout, "3\n");
        assert_eq!(result.output_files[0].data, b"x");

        let sent: serde_json::Value = serde_json::from_str(&server.await.unwrap()).unwrap();
        assert_eq!(sent["session_id"], "s1");
        assert_eq!(sent["stateful"], true);
    }

    #[tokio::test]
    async fn test_unreachable_endpoint() {
        // 端口 9 (discard) 在测试环境中通常没有监听者
        let exec = RemoteCodeExecutor::new(CodeExecutorConfig::default(), "http://127.0.0.1:9/run");
        let err = exec
            .execute(&CodeExecutionInput {
                code: "print(1)".into(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CodeExecutorError::Unavailable(_) | CodeExecutorError::Remote(_)
        ));
    }
}
