//! LLM Agent 定义与层级
//!
//! agent 是静态树：sub_agents 在构造时确定，之后只读。转移控制权（transfer_to_agent）
//! 只在这棵树内进行：子 agent、父 agent 与兄弟 agent。

use std::collections::HashSet;
use std::sync::{Arc, OnceLock};

use regex::Regex;
use serde_json::Value;

use crate::code_executor::CodeExecutor;
use crate::core::FlowError;
use crate::llm::{GenerateConfig, LlmClient};
use crate::session::{StateMap, CODE_EXECUTOR_AUTHOR, USER_AUTHOR};
use crate::tools::{builtin, Tool, Toolset, TRANSFER_TO_AGENT};

/// 模型引用：注册表中的名字，或直接给定的客户端
#[derive(Clone)]
pub enum ModelRef {
    Name(String),
    Client(Arc<dyn LlmClient>),
}

impl ModelRef {
    pub fn name(&self) -> &str {
        match self {
            ModelRef::Name(n) => n,
            ModelRef::Client(c) => c.model_name(),
        }
    }
}

impl std::fmt::Debug for ModelRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModelRef::Name(n) => write!(f, "Name({n})"),
            ModelRef::Client(c) => write!(f, "Client({})", c.model_name()),
        }
    }
}

pub struct LlmAgent {
    pub name: String,
    pub description: String,
    /// 未设置时沿用最近祖先的模型
    pub model: Option<ModelRef>,
    /// 支持 `{key}` / `{key?}` 占位符，从会话状态取值
    pub instruction: String,
    pub tools: Toolset,
    pub code_executor: Option<Arc<dyn CodeExecutor>>,
    pub sub_agents: Vec<Arc<LlmAgent>>,
    pub disallow_transfer_to_parent: bool,
    /// 启用规划指令，回复中的规划片段作为 thought 处理
    pub planning: bool,
    pub generate_config: GenerateConfig,
}

impl LlmAgent {
    pub fn builder(name: impl Into<String>) -> LlmAgentBuilder {
        LlmAgentBuilder::new(name)
    }

    /// 在以 self 为根的树中查找
    pub fn find_agent(self: &Arc<Self>, name: &str) -> Option<Arc<LlmAgent>> {
        if self.name == name {
            return Some(self.clone());
        }
        self.sub_agents.iter().find_map(|a| a.find_agent(name))
    }

    /// 以 self 为根，查找名为 name 的 agent 的父节点
    pub fn find_parent(self: &Arc<Self>, name: &str) -> Option<Arc<LlmAgent>> {
        if self.sub_agents.iter().any(|a| a.name == name) {
            return Some(self.clone());
        }
        self.sub_agents.iter().find_map(|a| a.find_parent(name))
    }

    /// 深度优先列出整棵树
    pub fn all_agents(self: &Arc<Self>) -> Vec<Arc<LlmAgent>> {
        let mut out = vec![self.clone()];
        for sub in &self.sub_agents {
            out.extend(sub.all_agents());
        }
        out
    }

    /// 合法的转移目标：子 agent；未禁止时再加父 agent 与兄弟 agent
    pub fn transfer_targets(&self, root: &Arc<LlmAgent>) -> Vec<String> {
        let mut targets: Vec<String> = self.sub_agents.iter().map(|a| a.name.clone()).collect();
        if !self.disallow_transfer_to_parent {
            if let Some(parent) = root.find_parent(&self.name) {
                targets.push(parent.name.clone());
                targets.extend(
                    parent
                        .sub_agents
                        .iter()
                        .filter(|s| s.name != self.name)
                        .map(|s| s.name.clone()),
                );
            }
        }
        targets
    }

    /// 自身模型，或最近祖先的模型
    pub fn effective_model(&self, root: &Arc<LlmAgent>) -> Option<ModelRef> {
        if let Some(m) = &self.model {
            return Some(m.clone());
        }
        let mut current = root.find_parent(&self.name);
        while let Some(agent) = current {
            if let Some(m) = &agent.model {
                return Some(m.clone());
            }
            current = root.find_parent(&agent.name);
        }
        None
    }

    /// 按名解析工具；有转移目标时 transfer_to_agent 可用
    pub fn resolve_tool(&self, name: &str, has_transfer_targets: bool) -> Option<Tool> {
        if name == TRANSFER_TO_AGENT && has_transfer_targets {
            return Some(builtin::transfer_to_agent());
        }
        self.tools.get(name).cloned()
    }

    /// 用状态填充指令模板；未知键保持原样，`{key?}` 缺失时替换为空串
    pub fn render_instruction(&self, state: &StateMap) -> String {
        render_template(&self.instruction, state)
    }
}

fn placeholder() -> Option<&'static Regex> {
    static PLACEHOLDER: OnceLock<Option<Regex>> = OnceLock::new();
    PLACEHOLDER
        .get_or_init(|| Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*(?::[A-Za-z0-9_]+)?)(\?)?\}").ok())
        .as_ref()
}

pub fn render_template(template: &str, state: &StateMap) -> String {
    let Some(re) = placeholder() else {
        return template.to_string();
    };
    re.replace_all(template, |caps: &regex::Captures<'_>| {
        let key = &caps[1];
        let optional = caps.get(2).is_some();
        match state.get(key) {
            Some(Value::String(s)) => s.clone(),
            Some(v) => v.to_string(),
            None if optional => String::new(),
            None => caps[0].to_string(),
        }
    })
    .into_owned()
}

pub struct LlmAgentBuilder {
    name: String,
    description: String,
    model: Option<ModelRef>,
    instruction: String,
    tools: Vec<Tool>,
    code_executor: Option<Arc<dyn CodeExecutor>>,
    sub_agents: Vec<Arc<LlmAgent>>,
    disallow_transfer_to_parent: bool,
    planning: bool,
    generate_config: GenerateConfig,
}

impl LlmAgentBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            model: None,
            instruction: String::new(),
            tools: Vec::new(),
            code_executor: None,
            sub_agents: Vec::new(),
            disallow_transfer_to_parent: false,
            planning: false,
            generate_config: GenerateConfig::default(),
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(ModelRef::Name(model.into()));
        self
    }

    pub fn model_client(mut self, client: Arc<dyn LlmClient>) -> Self {
        self.model = Some(ModelRef::Client(client));
        self
    }

    pub fn instruction(mut self, instruction: impl Into<String>) -> Self {
        self.instruction = instruction.into();
        self
    }

    pub fn tool(mut self, tool: impl Into<Tool>) -> Self {
        self.tools.push(tool.into());
        self
    }

    pub fn tools(mut self, tools: impl IntoIterator<Item = Tool>) -> Self {
        self.tools.extend(tools);
        self
    }

    pub fn code_executor(mut self, executor: Arc<dyn CodeExecutor>) -> Self {
        self.code_executor = Some(executor);
        self
    }

    pub fn sub_agent(mut self, agent: Arc<LlmAgent>) -> Self {
        self.sub_agents.push(agent);
        self
    }

    pub fn disallow_transfer_to_parent(mut self) -> Self {
        self.disallow_transfer_to_parent = true;
        self
    }

    pub fn planning(mut self, enabled: bool) -> Self {
        self.planning = enabled;
        self
    }

    pub fn generate_config(mut self, config: GenerateConfig) -> Self {
        self.generate_config = config;
        self
    }

    pub fn build(self) -> Result<Arc<LlmAgent>, FlowError> {
        if self.name.trim().is_empty() {
            return Err(FlowError::Config("agent name must not be empty".into()));
        }
        if self.name == USER_AUTHOR || self.name == CODE_EXECUTOR_AUTHOR {
            return Err(FlowError::Config(format!("agent name '{}' is reserved", self.name)));
        }
        if self.tools.iter().any(|t| t.name() == TRANSFER_TO_AGENT) {
            return Err(FlowError::Config(format!("tool name '{TRANSFER_TO_AGENT}' is reserved")));
        }
        let tools = Toolset::new(self.tools)
            .map_err(|e| FlowError::Config(format!("agent {}: {e}", self.name)))?;

        let agent = Arc::new(LlmAgent {
            name: self.name,
            description: self.description,
            model: self.model,
            instruction: self.instruction,
            tools,
            code_executor: self.code_executor,
            sub_agents: self.sub_agents,
            disallow_transfer_to_parent: self.disallow_transfer_to_parent,
            planning: self.planning,
            generate_config: self.generate_config,
        });

        let mut seen = HashSet::new();
        for a in agent.all_agents() {
            if !seen.insert(a.name.clone()) {
                return Err(FlowError::Config(format!("duplicate agent name in hierarchy: {}", a.name)));
            }
        }
        Ok(agent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn leaf(name: &str) -> Arc<LlmAgent> {
        LlmAgent::builder(name).build().unwrap()
    }

    #[test]
    fn test_template_rendering() {
        let mut state = StateMap::new();
        state.insert("name".into(), json!("Ada"));
        state.insert("user:lang".into(), json!("rust"));
        state.insert("count".into(), json!(3));
        let out = render_template(
            "Hi {name}, you like {user:lang} ({count}). {missing} {missing?}. JSON: {\"a\": 1}",
            &state,
        );
        assert_eq!(out, "Hi Ada, you like rust (3). {missing} . JSON: {\"a\": 1}");
    }

    #[test]
    fn test_hierarchy_lookup_and_targets() {
        let billing = leaf("billing");
        let support = leaf("support");
        let root = LlmAgent::builder("root")
            .model("mock")
            .sub_agent(billing.clone())
            .sub_agent(support)
            .build()
            .unwrap();

        assert_eq!(root.find_agent("support").unwrap().name, "support");
        assert_eq!(root.find_parent("billing").unwrap().name, "root");
        assert!(root.find_parent("root").is_none());
        assert_eq!(root.transfer_targets(&root), vec!["billing", "support"]);
        assert_eq!(billing.transfer_targets(&root), vec!["root", "support"]);
        assert_eq!(billing.effective_model(&root).unwrap().name(), "mock");
        assert!(billing.resolve_tool(TRANSFER_TO_AGENT, true).is_some());
        assert!(billing.resolve_tool(TRANSFER_TO_AGENT, false).is_none());
    }

    #[test]
    fn test_disallow_transfer_to_parent() {
        let child = LlmAgent::builder("child").disallow_transfer_to_parent().build().unwrap();
        let root = LlmAgent::builder("root").sub_agent(child.clone()).build().unwrap();
        assert!(child.transfer_targets(&root).is_empty());
    }

    #[test]
    fn test_build_validation() {
        assert!(LlmAgent::builder("").build().is_err());
        assert!(LlmAgent::builder("user").build().is_err());
        assert!(LlmAgent::builder("a")
            .tool(builtin::echo())
            .tool(builtin::echo())
            .build()
            .is_err());
        assert!(LlmAgent::builder("a").tool(builtin::transfer_to_agent()).build().is_err());

        let dup = leaf("twin");
        let err = LlmAgent::builder("root")
            .sub_agent(dup.clone())
            .sub_agent(LlmAgent::builder("mid").sub_agent(leaf("twin")).build().unwrap())
            .build();
        assert!(matches!(err, Err(FlowError::Config(msg)) if msg.contains("twin")));
    }
}
