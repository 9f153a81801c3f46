//! 调用上下文与收窄视图
//!
//! InvocationContext 持有单轮的全部数据，只在编排循环内部使用；
//! 回调与工具代码拿到的是按能力收窄的投影：
//! - ReadonlyContext：只读状态
//! - CallbackContext：状态读写（写入累积到自己的 EventActions，随事件提交生效）+ artifact
//! - ToolContext：CallbackContext + function call id + 凭证 / 记忆访问

use std::ops::Deref;
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use crate::agent::LlmAgent;
use crate::core::{FlowError, TaskScheduler};
use crate::flow::{RunConfig, ToolCallRecord};
use crate::llm::ModelRegistry;
use crate::services::{ArtifactService, Credential, MemoryEntry, Services};
use crate::session::{Content, Event, EventActions, Session, SessionKey, StateMap};
use crate::tools::ToolExecutor;

/// 只读投影：调用 id、agent 名、状态快照
#[derive(Clone)]
pub struct ReadonlyContext {
    invocation_id: String,
    agent_name: String,
    key: SessionKey,
    state: Arc<StateMap>,
    user_content: Option<Content>,
}

impl ReadonlyContext {
    pub fn new(
        invocation_id: impl Into<String>,
        agent_name: impl Into<String>,
        key: SessionKey,
        state: StateMap,
        user_content: Option<Content>,
    ) -> Self {
        Self {
            invocation_id: invocation_id.into(),
            agent_name: agent_name.into(),
            key,
            state: Arc::new(state),
            user_content,
        }
    }

    pub fn invocation_id(&self) -> &str {
        &self.invocation_id
    }

    pub fn agent_name(&self) -> &str {
        &self.agent_name
    }

    pub fn session_key(&self) -> &SessionKey {
        &self.key
    }

    pub fn user_id(&self) -> &str {
        &self.key.user_id
    }

    pub fn state(&self) -> &StateMap {
        &self.state
    }

    pub fn user_content(&self) -> Option<&Content> {
        self.user_content.as_ref()
    }
}

/// 状态读写 + artifact 投影；写入不直接修改会话，而是累积成待提交的 EventActions
#[derive(Clone)]
pub struct CallbackContext {
    readonly: ReadonlyContext,
    actions: Arc<Mutex<EventActions>>,
    artifacts: Arc<dyn ArtifactService>,
}

impl CallbackContext {
    pub fn new(readonly: ReadonlyContext, artifacts: Arc<dyn ArtifactService>) -> Self {
        Self {
            readonly,
            actions: Arc::new(Mutex::new(EventActions::default())),
            artifacts,
        }
    }

    pub fn readonly(&self) -> &ReadonlyContext {
        &self.readonly
    }

    pub fn invocation_id(&self) -> &str {
        self.readonly.invocation_id()
    }

    pub fn agent_name(&self) -> &str {
        self.readonly.agent_name()
    }

    /// 先看本次未提交的写入，再看快照；写入 null 视为已删除
    pub fn state_get(&self, key: &str) -> Option<Value> {
        let actions = self.actions.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(v) = actions.state_delta.get(key) {
            return (!v.is_null()).then(|| v.clone());
        }
        self.readonly.state.get(key).cloned()
    }

    pub fn state_set(&self, key: impl Into<String>, value: Value) {
        self.actions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .state_delta
            .insert(key.into(), value);
    }

    pub fn state_remove(&self, key: impl Into<String>) {
        self.state_set(key, Value::Null);
    }

    pub async fn save_artifact(&self, filename: &str, data: Vec<u8>) -> Result<u32, FlowError> {
        let version = self
            .artifacts
            .save(self.readonly.session_key(), filename, data)
            .await?;
        self.actions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .artifact_delta
            .insert(filename.to_string(), version);
        Ok(version)
    }

    pub async fn load_artifact(&self, filename: &str, version: Option<u32>) -> Result<Option<Vec<u8>>, FlowError> {
        self.artifacts
            .load(self.readonly.session_key(), filename, version)
            .await
    }

    pub async fn list_artifacts(&self) -> Result<Vec<String>, FlowError> {
        self.artifacts.list_keys(self.readonly.session_key()).await
    }

    pub fn actions(&self) -> EventActions {
        self.actions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// 取走累积的动作（随工具结果事件一起提交）
    pub fn take_actions(&self) -> EventActions {
        std::mem::take(&mut *self.actions.lock().unwrap_or_else(PoisonError::into_inner))
    }

    fn update_actions(&self, f: impl FnOnce(&mut EventActions)) {
        f(&mut self.actions.lock().unwrap_or_else(PoisonError::into_inner));
    }
}

/// 工具视图
#[derive(Clone)]
pub struct ToolContext {
    callback: CallbackContext,
    function_call_id: String,
    services: Services,
    registry: ModelRegistry,
    run_config: RunConfig,
    end_invocation: CancellationToken,
    transfer_targets: Arc<Vec<String>>,
}

impl Deref for ToolContext {
    type Target = CallbackContext;

    fn deref(&self) -> &Self::Target {
        &self.callback
    }
}

impl ToolContext {
    /// 不绑定运行中调用的独立上下文（直接调用工具、测试）
    pub fn standalone(services: Services, key: SessionKey) -> Self {
        let readonly = ReadonlyContext::new(
            format!("inv_{}", uuid::Uuid::new_v4().simple()),
            "standalone",
            key,
            StateMap::new(),
            None,
        );
        Self {
            callback: CallbackContext::new(readonly, services.artifacts.clone()),
            function_call_id: crate::session::new_function_call_id(),
            services,
            registry: ModelRegistry::builder().build(),
            run_config: RunConfig::default(),
            end_invocation: CancellationToken::new(),
            transfer_targets: Arc::new(Vec::new()),
        }
    }

    pub fn with_state(mut self, state: StateMap) -> Self {
        self.callback.readonly.state = Arc::new(state);
        self
    }

    pub fn function_call_id(&self) -> &str {
        &self.function_call_id
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    pub fn run_config(&self) -> &RunConfig {
        &self.run_config
    }

    pub async fn get_credential(&self, scheme: &str) -> Result<Option<Credential>, FlowError> {
        self.services
            .credentials
            .get_cached_credential(self.readonly.user_id(), scheme)
            .await
    }

    /// 发起带外认证，返回待解析请求 id；工具随后应返回 NeedsAuth
    pub async fn request_credential(&self, scheme: &str) -> Result<String, FlowError> {
        self.services
            .credentials
            .request_credential(self.readonly.user_id(), scheme)
            .await
    }

    pub async fn search_memory(&self, query: &str) -> Result<Vec<MemoryEntry>, FlowError> {
        let key = self.readonly.session_key();
        self.services.memory.search(&key.app_name, &key.user_id, query).await
    }

    pub fn transfer_targets(&self) -> &[String] {
        &self.transfer_targets
    }

    pub fn transfer_to_agent(&self, agent_name: impl Into<String>) {
        let name = agent_name.into();
        self.callback.update_actions(|a| a.transfer_to_agent = Some(name));
    }

    /// 上交控制：本次分发的结果提交后即结束本轮，不再调用模型
    pub fn escalate(&self) {
        self.callback.update_actions(|a| a.escalate = true);
    }

    /// 请求在下一个 cycle 边界结束本轮
    pub fn end_invocation(&self) {
        self.end_invocation.cancel();
    }
}

/// 单轮调用的完整上下文，由 Runner 构造、编排循环独占使用
pub struct InvocationContext {
    pub invocation_id: String,
    pub agent: Arc<LlmAgent>,
    pub root_agent: Arc<LlmAgent>,
    pub session: Session,
    pub user_content: Option<Content>,
    pub services: Services,
    pub registry: ModelRegistry,
    pub run_config: RunConfig,
    pub end_invocation: CancellationToken,
    pub scheduler: TaskScheduler,
    pub executor: ToolExecutor,
    llm_call_count: usize,
    code_error_count: usize,
    observer: Option<UnboundedSender<Event>>,
    pub(crate) turn_events: Vec<Event>,
    pub(crate) tool_calls: Vec<ToolCallRecord>,
    pub(crate) final_text: Option<String>,
}

impl InvocationContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        agent: Arc<LlmAgent>,
        root_agent: Arc<LlmAgent>,
        session: Session,
        user_content: Option<Content>,
        services: Services,
        registry: ModelRegistry,
        run_config: RunConfig,
        observer: Option<UnboundedSender<Event>>,
    ) -> Self {
        let end_invocation = run_config.end_invocation.child_token();
        let scheduler = TaskScheduler::new(run_config.max_concurrent_tools);
        let executor = ToolExecutor::new(run_config.tool_timeout);
        Self {
            invocation_id: format!("inv_{}", uuid::Uuid::new_v4().simple()),
            agent,
            root_agent,
            session,
            user_content,
            services,
            registry,
            run_config,
            end_invocation,
            scheduler,
            executor,
            llm_call_count: 0,
            code_error_count: 0,
            observer,
            turn_events: Vec::new(),
            tool_calls: Vec::new(),
            final_text: None,
        }
    }

    pub fn session_key(&self) -> SessionKey {
        self.session.key()
    }

    pub fn readonly(&self) -> ReadonlyContext {
        ReadonlyContext::new(
            &self.invocation_id,
            &self.agent.name,
            self.session_key(),
            self.session.state.clone(),
            self.user_content.clone(),
        )
    }

    pub fn callback_context(&self) -> CallbackContext {
        CallbackContext::new(self.readonly(), self.services.artifacts.clone())
    }

    pub fn tool_context(&self, function_call_id: &str) -> ToolContext {
        ToolContext {
            callback: self.callback_context(),
            function_call_id: function_call_id.to_string(),
            services: self.services.clone(),
            registry: self.registry.clone(),
            run_config: self.run_config.clone(),
            end_invocation: self.end_invocation.clone(),
            transfer_targets: Arc::new(self.agent.transfer_targets(&self.root_agent)),
        }
    }

    /// 每次模型调用前计数；超过上限即致命错误（0 表示不限制）
    pub fn increment_llm_call_count(&mut self) -> Result<usize, FlowError> {
        self.llm_call_count += 1;
        let limit = self.run_config.max_llm_calls;
        if limit > 0 && self.llm_call_count > limit {
            tracing::warn!(invocation_id = %self.invocation_id, limit, "model call ceiling exceeded");
            return Err(FlowError::ResourceExhausted { limit });
        }
        Ok(self.llm_call_count)
    }

    pub fn llm_call_count(&self) -> usize {
        self.llm_call_count
    }

    /// 记录一次代码执行失败，返回连续失败次数
    pub fn record_code_error(&mut self) -> usize {
        self.code_error_count += 1;
        self.code_error_count
    }

    pub fn reset_code_errors(&mut self) {
        self.code_error_count = 0;
    }

    pub fn is_cancelled(&self) -> bool {
        self.end_invocation.is_cancelled()
    }

    /// 提交到会话存储，并把结果（含 temp: 键）应用到本轮视图
    pub async fn commit(&mut self, event: Event) -> Result<Event, FlowError> {
        let committed = self
            .services
            .sessions
            .append_event(&self.session, event)
            .await?;
        if !committed.partial {
            self.session.apply_event(&committed, true);
        }
        Ok(committed)
    }

    /// 提交并投递给观察者；partial 事件只投递不提交
    pub async fn emit(&mut self, event: Event) -> Result<Event, FlowError> {
        if event.partial {
            self.notify(&event);
            return Ok(event);
        }
        let committed = self.commit(event).await?;
        self.turn_events.push(committed.clone());
        self.notify(&committed);
        Ok(committed)
    }

    pub(crate) fn notify(&self, event: &Event) {
        if let Some(tx) = &self.observer {
            // 观察者已断开不影响本轮
            let _ = tx.send(event.clone());
        }
    }
}
