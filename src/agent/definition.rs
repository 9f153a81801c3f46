//! 声明式 agent 定义（TOML）
//!
//! ```toml
//! name = "calculator"
//! model = "mock"
//! instruction = "You are a calculator."
//! tools = ["add"]
//!
//! [[sub_agents]]
//! name = "greeter"
//! tools = ["echo"]
//! ```

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use serde::Deserialize;

use crate::agent::LlmAgent;
use crate::code_executor::CodeExecutor;
use crate::core::FlowError;
use crate::tools::builtin;

#[derive(Clone, Debug, Default, Deserialize)]
pub struct AgentDefinition {
    pub name: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub instruction: String,
    /// 内置工具名
    #[serde(default)]
    pub tools: Vec<String>,
    /// 是否挂载 [code_executor] 配置的执行后端
    #[serde(default)]
    pub code_executor: bool,
    #[serde(default)]
    pub planning: bool,
    #[serde(default)]
    pub disallow_transfer_to_parent: bool,
    #[serde(default)]
    pub sub_agents: Vec<AgentDefinition>,
}

impl AgentDefinition {
    pub fn from_toml_str(s: &str) -> anyhow::Result<Self> {
        toml::from_str(s).context("invalid agent definition")
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read agent definition {}", path.display()))?;
        Self::from_toml_str(&raw).with_context(|| format!("in {}", path.display()))
    }

    /// 构造 agent 树；根未指定模型时使用 default_model，子 agent 沿用祖先模型
    pub fn build(
        &self,
        default_model: &str,
        code_executor: Option<Arc<dyn CodeExecutor>>,
    ) -> Result<Arc<LlmAgent>, FlowError> {
        let root_model = self.model.clone().unwrap_or_else(|| default_model.to_string());
        self.build_node(Some(root_model), code_executor.as_ref())
    }

    fn build_node(
        &self,
        model: Option<String>,
        code_executor: Option<&Arc<dyn CodeExecutor>>,
    ) -> Result<Arc<LlmAgent>, FlowError> {
        let mut builder = LlmAgent::builder(&self.name)
            .description(&self.description)
            .instruction(&self.instruction)
            .planning(self.planning);
        if let Some(model) = model.or_else(|| self.model.clone()) {
            builder = builder.model(model);
        }
        if self.disallow_transfer_to_parent {
            builder = builder.disallow_transfer_to_parent();
        }
        for name in &self.tools {
            let tool = builtin::by_name(name).ok_or_else(|| {
                FlowError::Config(format!(
                    "agent {}: unknown tool '{name}' (available: {})",
                    self.name,
                    builtin::BUILTIN_NAMES.join(", ")
                ))
            })?;
            builder = builder.tool(tool);
        }
        if self.code_executor {
            let executor = code_executor.ok_or_else(|| {
                FlowError::Config(format!(
                    "agent {} wants a code executor but [code_executor] kind is none",
                    self.name
                ))
            })?;
            builder = builder.code_executor(executor.clone());
        }
        for sub in &self.sub_agents {
            builder = builder.sub_agent(sub.build_node(None, code_executor)?);
        }
        builder.build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TREE: &str = r#"
name = "coordinator"
instruction = "Route requests."

[[sub_agents]]
name = "calculator"
model = "mock-math"
tools = ["add"]

[[sub_agents]]
name = "greeter"
tools = ["echo", "remember"]
"#;

    #[test]
    fn test_builds_tree_with_inherited_model() {
        let def = AgentDefinition::from_toml_str(TREE).unwrap();
        let root = def.build("mock", None).unwrap();
        assert_eq!(root.sub_agents.len(), 2);
        let greeter = root.find_agent("greeter").unwrap();
        assert_eq!(greeter.effective_model(&root).unwrap().name(), "mock");
        let calc = root.find_agent("calculator").unwrap();
        assert_eq!(calc.effective_model(&root).unwrap().name(), "mock-math");
        assert!(calc.tools.contains("add"));
    }

    #[test]
    fn test_unknown_tool_is_config_error() {
        let def = AgentDefinition::from_toml_str("name = \"a\"\ntools = [\"nope\"]").unwrap();
        assert!(matches!(def.build("mock", None), Err(FlowError::Config(msg)) if msg.contains("nope")));
    }

    #[test]
    fn test_code_executor_requires_backend() {
        let def = AgentDefinition::from_toml_str("name = \"coder\"\ncode_executor = true").unwrap();
        assert!(def.build("mock", None).is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.toml");
        std::fs::write(&path, TREE).unwrap();
        assert_eq!(AgentDefinition::load(&path).unwrap().name, "coordinator");
        assert!(AgentDefinition::load(dir.path().join("missing.toml")).is_err());
    }
}
