//! Bee Flow 命令行
//!
//! - `run`：加载 agent 定义，运行单轮并打印最终回复（流式模式实时打印片段）
//! - `eval`：对一个或多个用例文件评测，任一用例失败则以非零码退出

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;

use bee_flow::agent::AgentDefinition;
use bee_flow::config::{load_config_or_default, AppConfig, SessionBackend};
use bee_flow::evaluation::{load_cases, load_thresholds, Evaluator, Thresholds};
use bee_flow::flow::RunConfig;
use bee_flow::llm::default_registry;
use bee_flow::services::Services;
use bee_flow::session::{Content, Event, Part, SqliteSessionStore};
use bee_flow::{code_executor, observability, LlmAgent, Runner};

#[derive(Parser)]
#[command(name = "bee-flow", version, about = "LLM tool-calling orchestration")]
struct Cli {
    /// 额外的配置文件（覆盖 config/default.toml）
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// 默认日志过滤（RUST_LOG 优先）
    #[arg(long, global = true, default_value = "info")]
    log: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one turn against an agent definition
    Run {
        #[arg(long)]
        agent: PathBuf,
        #[arg(long)]
        query: String,
        #[arg(long, default_value = "local_user")]
        user: String,
        #[arg(long, default_value = "default")]
        session: String,
    },
    /// Evaluate an agent against test case files
    Eval {
        #[arg(long)]
        agent: PathBuf,
        #[arg(long, num_args = 1.., required = true)]
        cases: Vec<PathBuf>,
        #[arg(long)]
        thresholds: Option<PathBuf>,
    },
}

fn build_agent(config: &AppConfig, path: &PathBuf) -> anyhow::Result<Arc<LlmAgent>> {
    let definition = AgentDefinition::load(path)?;
    let executor = code_executor::from_config(&config.code_executor)?;
    Ok(definition.build(&config.llm.default_model, executor)?)
}

fn services(config: &AppConfig) -> anyhow::Result<Services> {
    match config.session.backend {
        SessionBackend::Memory => Ok(Services::in_memory()),
        SessionBackend::Sqlite => {
            let path = config.sqlite_path();
            if let Some(dir) = path.parent() {
                std::fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
            }
            let store = SqliteSessionStore::open(&path)?;
            tracing::info!(path = %path.display(), "sqlite session store opened");
            Ok(Services::with_session_store(Arc::new(store)))
        }
    }
}

async fn run(config: AppConfig, agent: PathBuf, query: String, user: String, session: String) -> anyhow::Result<()> {
    let root = build_agent(&config, &agent)?;
    let registry = default_registry(&config.llm)?;
    let run_config = RunConfig::from_config(&config);
    let streaming = run_config.streaming;
    let runner = Runner::new(&config.app.name, root, services(&config)?, registry, run_config)?;

    let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if streaming && event.partial {
                if let Some(text) = event.content.as_ref().and_then(Content::text) {
                    print!("{text}");
                }
            } else if let Some(content) = &event.content {
                for part in &content.parts {
                    match part {
                        Part::FunctionCall(fc) => eprintln!("[{}] -> {}({})", event.author, fc.name, fc.args),
                        Part::FunctionResponse(fr) => eprintln!("[{}] <- {}: {}", event.author, fr.name, fr.response),
                        _ => {}
                    }
                }
            }
        }
    });

    let outcome = runner
        .run_with_observer(&user, &session, Content::user_text(query), tx)
        .await?;
    let _ = printer.await;

    if streaming {
        println!();
    }
    println!("{}", outcome.final_text.unwrap_or_default());
    tracing::info!(status = ?outcome.status, tool_calls = outcome.tool_calls.len(), "done");
    Ok(())
}

async fn eval(config: AppConfig, agent: PathBuf, cases: Vec<PathBuf>, thresholds: Option<PathBuf>) -> anyhow::Result<bool> {
    let root = build_agent(&config, &agent)?;
    let registry = default_registry(&config.llm)?;
    let thresholds = match thresholds {
        Some(path) => load_thresholds(path)?,
        None => Thresholds::default(),
    };
    let evaluator = Evaluator::new(root, registry, RunConfig::from_config(&config), thresholds);

    let mut all_passed = true;
    for path in cases {
        let cases = load_cases(&path)?;
        println!("== {} ({} cases)", path.display(), cases.len());
        for report in evaluator.evaluate_all(&cases).await? {
            all_passed &= report.passed;
            print!("{report}");
        }
    }
    Ok(all_passed)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    observability::init(&cli.log);
    let config = load_config_or_default(cli.config);

    match cli.command {
        Command::Run {
            agent,
            query,
            user,
            session,
        } => run(config, agent, query, user, session).await,
        Command::Eval {
            agent,
            cases,
            thresholds,
        } => {
            if !eval(config, agent, cases, thresholds).await? {
                std::process::exit(1);
            }
            Ok(())
        }
    }
}
