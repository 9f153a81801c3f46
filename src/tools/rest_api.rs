//! 协议描述的远程 API 工具：一个 HTTP 操作 = 一个工具
//!
//! URL 模板中的 `{param}` 由路径参数替换；其余参数按位置放进 query 或 JSON body。

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::agent::ToolContext;
use crate::llm::FunctionDeclaration;
use crate::tools::{ToolError, ToolOutcome};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl From<HttpMethod> for reqwest::Method {
    fn from(m: HttpMethod) -> Self {
        match m {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Patch => reqwest::Method::PATCH,
            HttpMethod::Delete => reqwest::Method::DELETE,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamLocation {
    Path,
    Query,
    Body,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RestParam {
    pub name: String,
    pub location: ParamLocation,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub required: bool,
    /// JSON Schema 类型名：string / integer / number / boolean / object / array
    #[serde(default = "default_param_type")]
    pub schema_type: String,
}

fn default_param_type() -> String {
    "string".to_string()
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RestApiTool {
    pub name: String,
    pub description: String,
    pub method: HttpMethod,
    pub url_template: String,
    #[serde(default)]
    pub parameters: Vec<RestParam>,
    /// 需要凭证时的认证方案；凭证以 Bearer token 发送
    #[serde(default)]
    pub auth_scheme: Option<String>,
    #[serde(skip)]
    http: reqwest::Client,
}

impl RestApiTool {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        method: HttpMethod,
        url_template: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            method,
            url_template: url_template.into(),
            parameters: Vec::new(),
            auth_scheme: None,
            http: reqwest::Client::new(),
        }
    }

    pub fn param(mut self, param: RestParam) -> Self {
        self.parameters.push(param);
        self
    }

    pub fn requires_auth(mut self, scheme: impl Into<String>) -> Self {
        self.auth_scheme = Some(scheme.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn declaration(&self) -> FunctionDeclaration {
        let mut properties = Map::new();
        let mut required = Vec::new();
        for p in &self.parameters {
            properties.insert(
                p.name.clone(),
                json!({"type": p.schema_type, "description": p.description}),
            );
            if p.required || p.location == ParamLocation::Path {
                required.push(Value::String(p.name.clone()));
            }
        }
        FunctionDeclaration {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: json!({
                "type": "object",
                "properties": properties,
                "required": required,
            }),
        }
    }

    /// 展开 URL 模板并拆分 query / body；缺少必填参数即 InvalidArgs
    pub fn prepare(&self, args: &Value) -> Result<(String, Vec<(String, String)>, Map<String, Value>), ToolError> {
        let mut url = self.url_template.clone();
        let mut query = Vec::new();
        let mut body = Map::new();
        for p in &self.parameters {
            let value = args.get(&p.name).filter(|v| !v.is_null());
            let Some(value) = value else {
                if p.required || p.location == ParamLocation::Path {
                    return Err(ToolError::InvalidArgs(format!("missing parameter: {}", p.name)));
                }
                continue;
            };
            match p.location {
                ParamLocation::Path => {
                    let s = scalar_to_string(value);
                    if s.contains('/') || s.contains('?') || s.contains('#') {
                        return Err(ToolError::InvalidArgs(format!(
                            "path parameter {} contains reserved characters",
                            p.name
                        )));
                    }
                    url = url.replace(&format!("{{{}}}", p.name), &s);
                }
                ParamLocation::Query => query.push((p.name.clone(), scalar_to_string(value))),
                ParamLocation::Body => {
                    body.insert(p.name.clone(), value.clone());
                }
            }
        }
        Ok((url, query, body))
    }

    pub async fn invoke(&self, args: Value, ctx: ToolContext) -> Result<ToolOutcome, ToolError> {
        let (url, query, body) = self.prepare(&args)?;

        let mut token = None;
        if let Some(scheme) = &self.auth_scheme {
            match ctx
                .get_credential(scheme)
                .await
                .map_err(|e| ToolError::Execution(e.to_string()))?
            {
                Some(cred) => token = Some(cred.token),
                None => {
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
        }

        let mut request = self.http.request(self.method.into(), &url);
        if !query.is_empty() {
            request = request.query(&query);
        }
        if !body.is_empty() {
            request = request.json(&Value::Object(body));
        }
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ToolError::Execution(e.to_string()))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ToolError::Execution(e.to_string()))?;
        if !status.is_success() {
            let preview: String = text.chars().take(500).collect();
            return Err(ToolError::Execution(format!("HTTP {status}: {preview}")));
        }
        let value = serde_json::from_str(&text).unwrap_or_else(|_| json!({"text": text}));
        Ok(ToolOutcome::Value(value))
    }
}

fn scalar_to_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
