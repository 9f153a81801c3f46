//! Runner：会话寻址 + 选择 agent + 驱动一轮
//!
//! 构造时校验整棵 agent 树的模型都能解析，未知模型是启动期配置错误。

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;

use crate::agent::{InvocationContext, LlmAgent, ModelRef};
use crate::core::{FlowError, TurnStatus};
use crate::flow::{run_turn, RunConfig, ToolCallRecord};
use crate::llm::ModelRegistry;
use crate::services::Services;
use crate::session::{Content, Event, EventActions, Session, SessionKey, StateMap, USER_AUTHOR};

/// 一轮的结果
#[derive(Clone, Debug, Serialize)]
pub struct TurnOutcome {
    pub status: TurnStatus,
    pub final_text: Option<String>,
    /// 按发出顺序记录的工具调用（含被 mock 拦截的调用）
    pub tool_calls: Vec<ToolCallRecord>,
    /// 本轮提交的事件（不含用户消息）
    pub events: Vec<Event>,
}

pub struct Runner {
    app_name: String,
    root: Arc<LlmAgent>,
    services: Services,
    registry: ModelRegistry,
    run_config: RunConfig,
}

impl Runner {
    pub fn new(
        app_name: impl Into<String>,
        root: Arc<LlmAgent>,
        services: Services,
        registry: ModelRegistry,
        run_config: RunConfig,
    ) -> Result<Self, FlowError> {
        for agent in root.all_agents() {
            match agent.effective_model(&root) {
                None => {
                    return Err(FlowError::Config(format!("agent {} has no model", agent.name)));
                }
                Some(ModelRef::Name(name)) if !registry.supports(&name) => {
                    return Err(FlowError::Config(format!(
                        "agent {}: unknown model '{name}'",
                        agent.name
                    )));
                }
                Some(_) => {}
            }
        }
        Ok(Self {
            app_name: app_name.into(),
            root,
            services,
            registry,
            run_config,
        })
    }

    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    pub fn root_agent(&self) -> &Arc<LlmAgent> {
        &self.root
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    pub async fn run(&self, user_id: &str, session_id: &str, message: Content) -> Result<TurnOutcome, FlowError> {
        self.run_inner(user_id, session_id, message, self.run_config.clone(), None)
            .await
    }

    /// 观察者实时收到本轮每个事件（包括流式 partial 片段）
    pub async fn run_with_observer(
        &self,
        user_id: &str,
        session_id: &str,
        message: Content,
        observer: UnboundedSender<Event>,
    ) -> Result<TurnOutcome, FlowError> {
        self.run_inner(user_id, session_id, message, self.run_config.clone(), Some(observer))
            .await
    }

    /// 以单轮专用配置运行（评测时注入 mock）
    pub async fn run_with_config(
        &self,
        user_id: &str,
        session_id: &str,
        message: Content,
        run_config: RunConfig,
    ) -> Result<TurnOutcome, FlowError> {
        self.run_inner(user_id, session_id, message, run_config, None).await
    }

    async fn run_inner(
        &self,
        user_id: &str,
        session_id: &str,
        message: Content,
        run_config: RunConfig,
        observer: Option<UnboundedSender<Event>>,
    ) -> Result<TurnOutcome, FlowError> {
        let key = SessionKey::new(&self.app_name, user_id, session_id);
        let session = self.services.sessions.get_or_create(&key).await?;
        let agent = self.select_agent(&session);

        let mut ctx = InvocationContext::new(
            agent,
            self.root.clone(),
            session,
            Some(message.clone()),
            self.services.clone(),
            self.registry.clone(),
            run_config,
            observer,
        );
        tracing::info!(
            invocation_id = %ctx.invocation_id,
            session = %key,
            agent = %ctx.agent.name,
            "turn started"
        );

        let user_event = Event::new(&ctx.invocation_id, USER_AUTHOR).with_content(message);
        ctx.commit(user_event).await?;

        let status = run_turn(&mut ctx).await.inspect_err(|e| {
            tracing::error!(invocation_id = %ctx.invocation_id, code = e.code(), error = %e, "turn aborted");
        })?;
        tracing::info!(
            invocation_id = %ctx.invocation_id,
            ?status,
            llm_calls = ctx.llm_call_count(),
            tool_calls = ctx.tool_calls.len(),
            "turn finished"
        );

        Ok(TurnOutcome {
            status,
            final_text: ctx.final_text.take(),
            tool_calls: std::mem::take(&mut ctx.tool_calls),
            events: std::mem::take(&mut ctx.turn_events),
        })
    }

    /// 上次发言的 agent 仍在树中则继续由它处理，否则回到根
    fn select_agent(&self, session: &Session) -> Arc<LlmAgent> {
        session
            .last_agent_author()
            .and_then(|name| self.root.find_agent(name))
            .unwrap_or_else(|| self.root.clone())
    }

    /// 预置会话状态与 artifact（评测初始会话、嵌套 agent）
    pub async fn seed_session(
        &self,
        user_id: &str,
        session_id: &str,
        state: StateMap,
        artifacts: Vec<(String, Vec<u8>)>,
    ) -> Result<Session, FlowError> {
        let key = SessionKey::new(&self.app_name, user_id, session_id);
        let session = self.services.sessions.get_or_create(&key).await?;
        if !state.is_empty() {
            let event = Event::new(format!("seed_{}", uuid::Uuid::new_v4().simple()), USER_AUTHOR)
                .with_actions(EventActions {
                    state_delta: state,
                    ..EventActions::default()
                });
            self.services.sessions.append_event(&session, event).await?;
        }
        for (name, data) in artifacts {
            self.services.artifacts.save(&key, &name, data).await?;
        }
        self.services
            .sessions
            .get(&key)
            .await?
            .ok_or_else(|| FlowError::Session(format!("session {key} vanished while seeding")))
    }

    pub async fn session(&self, user_id: &str, session_id: &str) -> Result<Option<Session>, FlowError> {
        self.services
            .sessions
            .get(&SessionKey::new(&self.app_name, user_id, session_id))
            .await
    }

    /// 把会话文本沉淀到长期记忆
    pub async fn save_to_memory(&self, user_id: &str, session_id: &str) -> Result<(), FlowError> {
        if let Some(session) = self.session(user_id, session_id).await? {
            self.services.memory.add_session(&session).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{LlmResponse, MockLlmClient};
    use serde_json::json;

    fn registry() -> ModelRegistry {
        ModelRegistry::builder()
            .register("mock.*", |name: &str| -> Arc<dyn crate::llm::LlmClient> { Arc::new(MockLlmClient::new(name)) })
            .unwrap()
            .build()
    }

    #[test]
    fn test_unknown_model_rejected_up_front() {
        let agent = LlmAgent::builder("a").model("gpt-unknown").build().unwrap();
        let err = Runner::new("app", agent, Services::in_memory(), registry(), RunConfig::default());
        assert!(matches!(err, Err(FlowError::Config(msg)) if msg.contains("gpt-unknown")));

        let modelless = LlmAgent::builder("b").build().unwrap();
        assert!(Runner::new("app", modelless, Services::in_memory(), registry(), RunConfig::default()).is_err());
    }

    #[tokio::test]
    async fn test_echo_turn_commits_user_and_reply() {
        let agent = LlmAgent::builder("echo_agent").model("mock").build().unwrap();
        let runner = Runner::new("app", agent, Services::in_memory(), registry(), RunConfig::default()).unwrap();
        let out = runner.run("u", "s", Content::user_text("hello")).await.unwrap();
        assert_eq!(out.status, TurnStatus::Completed);
        assert_eq!(out.final_text.as_deref(), Some("Echo: hello"));
        assert_eq!(out.events.len(), 1);

        let session = runner.session("u", "s").await.unwrap().unwrap();
        assert_eq!(session.events.len(), 2);
        assert_eq!(session.events[0].author, USER_AUTHOR);
    }

    #[tokio::test]
    async fn test_seed_session_sets_state_and_artifacts() {
        let agent = LlmAgent::builder("a").model("mock").build().unwrap();
        let runner = Runner::new("app", agent, Services::in_memory(), registry(), RunConfig::default()).unwrap();
        let mut state = StateMap::new();
        state.insert("city".into(), json!("Paris"));
        let session = runner
            .seed_session("u", "s", state, vec![("notes.txt".into(), b"hi".to_vec())])
            .await
            .unwrap();
        assert_eq!(session.state["city"], json!("Paris"));
        let key = SessionKey::new("app", "u", "s");
        assert_eq!(
            runner.services().artifacts.load(&key, "notes.txt", None).await.unwrap(),
            Some(b"hi".to_vec())
        );
    }

    #[tokio::test]
    async fn test_scripted_error_is_model_error_status() {
        let mock = Arc::new(MockLlmClient::with_responses(
            "mock",
            vec![LlmResponse::error("SAFETY", "blocked by policy")],
        ));
        let agent = LlmAgent::builder("a").model_client(mock).build().unwrap();
        let runner = Runner::new("app", agent, Services::in_memory(), registry(), RunConfig::default()).unwrap();
        let out = runner.run("u", "s", Content::user_text("hi")).await.unwrap();
        assert_eq!(out.status, TurnStatus::ModelError);
        assert_eq!(out.events[0].error_code.as_deref(), Some("SAFETY"));
        assert_eq!(out.final_text.as_deref(), Some("blocked by policy"));
    }
}
