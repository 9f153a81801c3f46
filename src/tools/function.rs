//! 直接可调用函数包装
//!
//! 参数 schema 可以手写，也可以由 `typed` 通过 schemars 从参数结构体自动生成。

use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use schemars::{schema_for, JsonSchema};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::agent::ToolContext;
use crate::llm::FunctionDeclaration;
use crate::tools::{ToolError, ToolOutcome};

type Handler = Arc<dyn Fn(Value, ToolContext) -> BoxFuture<'static, Result<Value, ToolError>> + Send + Sync>;

const LONG_RUNNING_NOTE: &str = "NOTE: This is a long-running operation. Do not call this tool again if it has already returned some intermediate or pending status.";

#[derive(Clone)]
pub struct FunctionTool {
    name: String,
    description: String,
    parameters: Value,
    handler: Handler,
    long_running: bool,
    auth_scheme: Option<String>,
}

impl FunctionTool {
    pub fn new<F, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Value,
        handler: F,
    ) -> Self
    where
        F: Fn(Value, ToolContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ToolError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
            handler: Arc::new(move |args, ctx| handler(args, ctx).boxed()),
            long_running: false,
            auth_scheme: None,
        }
    }

    /// 参数反序列化为 A，schema 由 A 的 JsonSchema 生成；反序列化失败即 InvalidArgs
    pub fn typed<A, F, Fut>(name: impl Into<String>, description: impl Into<String>, handler: F) -> Self
    where
        A: DeserializeOwned + JsonSchema + Send + 'static,
        F: Fn(A, ToolContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ToolError>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        Self::new(name, description, schema_of::<A>(), move |args: Value, ctx| {
            let handler = handler.clone();
            async move {
                let parsed: A =
                    serde_json::from_value(args).map_err(|e| ToolError::InvalidArgs(e.to_string()))?;
                handler(parsed, ctx).await
            }
        })
    }

    /// 调用前要求已缓存的凭证；没有则发起认证请求并返回 NeedsAuth
    pub fn requires_auth(mut self, scheme: impl Into<String>) -> Self {
        self.auth_scheme = Some(scheme.into());
        self
    }

    pub fn long_running(mut self) -> Self {
        self.long_running = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_long_running(&self) -> bool {
        self.long_running
    }

    pub fn auth_scheme(&self) -> Option<&str> {
        self.auth_scheme.as_deref()
    }

    pub fn declaration(&self) -> FunctionDeclaration {
        let description = if self.long_running {
            format!("{}\n\n{}", self.description, LONG_RUNNING_NOTE)
        } else {
            self.description.clone()
        };
        FunctionDeclaration {
            name: self.name.clone(),
            description,
            parameters: self.parameters.clone(),
        }
    }

    pub async fn invoke(&self, args: Value, ctx: ToolContext) -> Result<ToolOutcome, ToolError> {
        if let Some(scheme) = &self.auth_scheme {
            let cached = ctx
                .get_credential(scheme)
                .await
                .map_err(|e| ToolError::Execution(e.to_string()))?;
            if cached.is_none() {
                let request_id = ctx
                    .request_credential(scheme)
                    .await
                    .map_err(|e| ToolError::Execution(e.to_string()))?;
                return Ok(ToolOutcome::NeedsAuth {
                    scheme: scheme.clone(),
                    request_id,
                });
            }
        }
        (self.handler)(args, ctx).await.map(ToolOutcome::Value)
    }
}

/// 从类型生成 object schema，去掉 $schema / title 等对模型无用的元字段
pub fn schema_of<A: JsonSchema>() -> Value {
    let schema = schema_for!(A);
    let mut value = serde_json::to_value(schema).unwrap_or_else(|_| serde_json::json!({"type": "object"}));
    if let Some(obj) = value.as_object_mut() {
        obj.remove("$schema");
        obj.remove("title");
    }
    value
}
