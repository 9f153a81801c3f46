//! 内置工具：echo、add、remember、transfer_to_agent
//!
//! agent 定义文件按名字引用前三个；transfer_to_agent 在 agent 有父 / 子 agent 时自动注入。

use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::tools::{FunctionTool, Tool, ToolError};

pub const TRANSFER_TO_AGENT: &str = "transfer_to_agent";

/// 可以在 agent 定义中按名引用的内置工具
pub const BUILTIN_NAMES: &[&str] = &["echo", "add", "remember"];

pub fn by_name(name: &str) -> Option<Tool> {
    match name {
        "echo" => Some(echo()),
        "add" => Some(add()),
        "remember" => Some(remember()),
        _ => None,
    }
}

#[derive(Deserialize, JsonSchema)]
struct EchoArgs {
    /// 要回显的文本
    text: String,
}

/// Echo 工具：回显文本
pub fn echo() -> Tool {
    FunctionTool::typed("echo", "Echo text back (for testing).", |args: EchoArgs, _ctx| async move {
        Ok(json!({"result": args.text}))
    })
    .into()
}

#[derive(Deserialize, JsonSchema)]
struct AddArgs {
    a: f64,
    b: f64,
}

/// 加法：整数结果保持整数形式
pub fn add() -> Tool {
    FunctionTool::typed("add", "Add two numbers and return the sum.", |args: AddArgs, _ctx| async move {
        let sum = args.a + args.b;
        let result = if sum.fract() == 0.0 && sum.abs() < 9.0e15 {
            json!(sum as i64)
        } else {
            json!(sum)
        };
        Ok(json!({"result": result}))
    })
    .into()
}

#[derive(Deserialize, JsonSchema)]
struct RememberArgs {
    /// 状态键；可用 user: / app: / temp: 前缀选择作用域
    key: String,
    value: Value,
}

/// 把一个值写入会话状态
pub fn remember() -> Tool {
    FunctionTool::typed(
        "remember",
        "Store a value in session state under the given key.",
        |args: RememberArgs, ctx| async move {
            if args.key.trim().is_empty() {
                return Err(ToolError::InvalidArgs("key must not be empty".into()));
            }
            ctx.state_set(args.key.clone(), args.value);
            Ok(json!({"status": "stored", "key": args.key}))
        },
    )
    .into()
}

#[derive(Deserialize, JsonSchema)]
struct TransferArgs {
    /// 目标 agent 名
    agent_name: String,
}

/// 把控制权交给另一个 agent；只接受层级中的合法目标
pub fn transfer_to_agent() -> Tool {
    FunctionTool::typed(
        TRANSFER_TO_AGENT,
        "Transfer the conversation to another agent that is better suited to answer.",
        |args: TransferArgs, ctx| async move {
            if !ctx.transfer_targets().iter().any(|t| *t == args.agent_name) {
                return Err(ToolError::InvalidArgs(format!(
                    "unknown agent '{}'; valid targets: {}",
                    args.agent_name,
                    ctx.transfer_targets().join(", ")
                )));
            }
            ctx.transfer_to_agent(args.agent_name.clone());
            Ok(json!({"result": format!("transferred to {}", args.agent_name)}))
        },
    )
    .into()
}
