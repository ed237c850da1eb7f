//! 智能体编排器：注册表、单次调用与多智能体协作
//!
//! 协作策略：
//! - sequential：依次调用，上一个的输出文本作为下一个的输入；任一失败即中止整条链
//! - parallel：同一任务并发发给所有智能体，各自的成功或失败独立收集
//! - hierarchical：第一个智能体为协调者，先出计划，其余智能体并发执行，协调者再综合；不足两人时退化为 sequential
//!
//! 每次智能体调用都经过该智能体的熔断器，失败交给 ErrorHandler，耗时与结果上报 PerformanceMonitor。
//! 对外返回始终是结构化的 {success, ... | error}。

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::agent::{Agent, AgentStatus};
use crate::config::AppConfig;
use crate::core::{
    AgentError, CircuitBreakerError, CircuitBreakerRegistry, CircuitSnapshot, ErrorContext,
    ErrorHandler, RecoveryConfig, RecoveryStrategy, SessionHistory, SessionStore,
};
use crate::memory::{Message, Role};
use crate::observability::{MonitorConfig, PerformanceMonitor};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollaborationStrategy {
    Sequential,
    Parallel,
    Hierarchical,
}

impl CollaborationStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            CollaborationStrategy::Sequential => "sequential",
            CollaborationStrategy::Parallel => "parallel",
            CollaborationStrategy::Hierarchical => "hierarchical",
        }
    }
}

impl fmt::Display for CollaborationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CollaborationStrategy {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "sequential" => Ok(CollaborationStrategy::Sequential),
            "parallel" => Ok(CollaborationStrategy::Parallel),
            "hierarchical" => Ok(CollaborationStrategy::Hierarchical),
            other => Err(AgentError::Validation(format!(
                "unknown collaboration strategy: {other}"
            ))),
        }
    }
}

/// call_agent 的返回
#[derive(Debug, Clone, Serialize)]
pub struct AgentCallResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub agent_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,
}

/// 单个参与者的结果
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ParticipantOutcome {
    Success { output: String },
    Failure { error: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParticipantResult {
    pub agent_id: String,
    pub agent_name: String,
    #[serde(flatten)]
    pub outcome: ParticipantOutcome,
}

impl ParticipantResult {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, ParticipantOutcome::Success { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum CollaborationResult {
    Sequential {
        steps: Vec<ParticipantResult>,
        final_output: String,
    },
    Parallel {
        results: Vec<ParticipantResult>,
    },
    Hierarchical {
        coordinator_id: String,
        plan: String,
        workers: Vec<ParticipantResult>,
        final_output: String,
        /// 计划或综合阶段失败后按降级路径产出
        degraded: bool,
    },
}

impl CollaborationResult {
    pub fn strategy(&self) -> CollaborationStrategy {
        match self {
            CollaborationResult::Sequential { .. } => CollaborationStrategy::Sequential,
            CollaborationResult::Parallel { .. } => CollaborationStrategy::Parallel,
            CollaborationResult::Hierarchical { .. } => CollaborationStrategy::Hierarchical,
        }
    }

    /// 结果本身表示失败时的错误描述：并行协作中所有参与者都失败
    pub fn failure(&self) -> Option<String> {
        match self {
            CollaborationResult::Parallel { results }
                if !results.iter().any(ParticipantResult::is_success) =>
            {
                Some(format!("all {} agents failed", results.len()))
            }
            _ => None,
        }
    }

    /// 作为会话回复的文本
    pub fn final_text(&self) -> String {
        match self {
            CollaborationResult::Sequential { final_output, .. }
            | CollaborationResult::Hierarchical { final_output, .. } => final_output.clone(),
            CollaborationResult::Parallel { results } => results
                .iter()
                .map(|r| match &r.outcome {
                    ParticipantOutcome::Success { output } => format!("[{}] {}", r.agent_name, output),
                    ParticipantOutcome::Failure { error } => format!("[{}] 失败：{}", r.agent_name, error),
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

/// collaborate_agents 的返回
#[derive(Debug, Clone, Serialize)]
pub struct CollaborationResponse {
    pub success: bool,
    pub collaboration_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<CollaborationResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// 一次协作的完整记录
#[derive(Debug, Clone, Serialize)]
pub struct CollaborationRecord {
    pub id: String,
    /// 实际执行的策略（hierarchical 退化时为 sequential）
    pub strategy: CollaborationStrategy,
    pub agent_ids: Vec<String>,
    pub task: String,
    pub session_id: Option<String>,
    pub success: bool,
    pub result: Option<CollaborationResult>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

pub struct AgentOrchestrator {
    agents: RwLock<HashMap<String, Arc<dyn Agent>>>,
    breakers: CircuitBreakerRegistry,
    error_handler: Arc<ErrorHandler>,
    monitor: Arc<PerformanceMonitor>,
    sessions: SessionStore,
    collaborations: Mutex<VecDeque<CollaborationRecord>>,
    max_collaboration_history: usize,
    retry_agent_calls: bool,
}

impl AgentOrchestrator {
    pub fn new(
        error_handler: Arc<ErrorHandler>,
        monitor: Arc<PerformanceMonitor>,
        breakers: CircuitBreakerRegistry,
    ) -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
            breakers,
            error_handler,
            monitor,
            sessions: SessionStore::new(),
            collaborations: Mutex::new(VecDeque::new()),
            max_collaboration_history: 500,
            retry_agent_calls: true,
        }
    }

    /// 按配置组装：监控、错误处理（上报监控）与熔断器注册表
    pub fn from_config(cfg: &AppConfig) -> Self {
        let monitor = Arc::new(PerformanceMonitor::new(MonitorConfig::from(&cfg.monitor)));
        let handler = Arc::new(
            ErrorHandler::new(RecoveryConfig::from(&cfg.recovery)).with_monitor(monitor.clone()),
        );
        let breakers = CircuitBreakerRegistry::new(
            cfg.circuit_breaker.failure_threshold,
            Duration::from_secs(cfg.circuit_breaker.timeout_secs),
        );
        let mut orchestrator = Self::new(handler, monitor, breakers);
        orchestrator.max_collaboration_history = cfg.orchestrator.max_collaboration_history;
        orchestrator.retry_agent_calls = cfg.orchestrator.retry_agent_calls;
        orchestrator
    }

    pub fn with_retry_agent_calls(mut self, retry: bool) -> Self {
        self.retry_agent_calls = retry;
        self
    }

    pub fn error_handler(&self) -> &Arc<ErrorHandler> {
        &self.error_handler
    }

    pub fn monitor(&self) -> &Arc<PerformanceMonitor> {
        &self.monitor
    }

    // ---------- 注册表 ----------

    pub fn register_agent(&self, agent: Arc<dyn Agent>) -> Result<String, AgentError> {
        let id = agent.id().to_string();
        let mut agents = self.agents.write().unwrap_or_else(PoisonError::into_inner);
        if agents.contains_key(&id) {
            return Err(AgentError::DuplicateAgent(id));
        }
        tracing::info!(agent_id = %id, agent = agent.name(), "agent registered");
        agents.insert(id.clone(), agent);
        Ok(id)
    }

    pub fn unregister_agent(&self, agent_id: &str) -> Result<Arc<dyn Agent>, AgentError> {
        let removed = self
            .agents
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(agent_id)
            .ok_or_else(|| AgentError::AgentNotFound(agent_id.to_string()))?;
        self.breakers.remove(agent_id);
        tracing::info!(agent_id, "agent unregistered");
        Ok(removed)
    }

    pub fn get_agent(&self, agent_id: &str) -> Option<Arc<dyn Agent>> {
        self.agents
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(agent_id)
            .cloned()
    }

    fn agents_where(&self, pred: impl Fn(&dyn Agent) -> bool) -> Vec<Arc<dyn Agent>> {
        let mut found: Vec<Arc<dyn Agent>> = self
            .agents
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|a| pred(a.as_ref()))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.name().cmp(b.name()).then_with(|| a.id().cmp(b.id())));
        found
    }

    /// 所有智能体的公开状态，按名称排序
    pub fn list_agents(&self) -> Vec<AgentStatus> {
        self.agents_where(|_| true)
            .iter()
            .map(|a| a.core().status())
            .collect()
    }

    pub fn get_agents_by_capability(&self, capability: &str) -> Vec<Arc<dyn Agent>> {
        self.agents_where(|a| a.core().config().capabilities.contains(capability))
    }

    pub fn get_agents_by_role(&self, role: &str) -> Vec<Arc<dyn Agent>> {
        self.agents_where(|a| a.core().config().role == role)
    }

    pub fn circuit_states(&self) -> Vec<CircuitSnapshot> {
        self.breakers.snapshots()
    }

    // ---------- 单次调用 ----------

    /// 经熔断器调用一次智能体，并上报耗时与结果
    async fn invoke(&self, agent: &Arc<dyn Agent>, message: Message) -> Result<Message, AgentError> {
        let breaker = self.breakers.get(agent.id());
        let start = Instant::now();
        let result = breaker
            .call(|| agent.call(message))
            .await
            .map_err(|e| match e {
                CircuitBreakerError::Open(_) => AgentError::CircuitOpen(agent.id().to_string()),
                CircuitBreakerError::Inner(inner) => inner,
            });
        self.monitor
            .record_agent_performance(agent.id(), start.elapsed(), result.is_ok());
        result
    }

    fn error_context(
        agent: &Arc<dyn Agent>,
        session_id: Option<&str>,
        extra: Option<ErrorContext>,
    ) -> ErrorContext {
        let mut ctx = extra.unwrap_or_default();
        ctx.insert("agent_id".into(), Value::String(agent.id().to_string()));
        ctx.insert("agent_name".into(), Value::String(agent.name().to_string()));
        if let Some(sid) = session_id {
            ctx.insert("session_id".into(), Value::String(sid.to_string()));
        }
        ctx
    }

    pub async fn call_agent(
        &self,
        agent_id: &str,
        message: Message,
        session_id: Option<&str>,
        context: Option<ErrorContext>,
    ) -> AgentCallResponse {
        let Some(agent) = self.get_agent(agent_id) else {
            tracing::warn!(agent_id, "call to unknown agent");
            return AgentCallResponse {
                success: false,
                response: None,
                error: Some(AgentError::AgentNotFound(agent_id.to_string()).to_string()),
                agent_id: agent_id.to_string(),
                agent_name: None,
            };
        };

        let result = match self.invoke(&agent, message.clone()).await {
            Ok(reply) => Ok(reply),
            Err(e) => {
                let ctx = Self::error_context(&agent, session_id, context);
                // 熔断中的重放必然再次被拒绝
                if self.retry_agent_calls && !matches!(e, AgentError::CircuitOpen(_)) {
                    let (event, value) = self
                        .error_handler
                        .handle_error_with_retry(&e, ctx, || self.invoke(&agent, message.clone()))
                        .await;
                    match value {
                        Some(reply) => Ok(reply),
                        None => Err(event.message),
                    }
                } else {
                    Err(self.error_handler.handle_error(&e, ctx).await.message)
                }
            }
        };

        match result {
            Ok(reply) => {
                if let Some(sid) = session_id {
                    self.sessions
                        .record(sid, [agent.id()], [message, reply.clone()]);
                }
                AgentCallResponse {
                    success: true,
                    response: Some(reply),
                    error: None,
                    agent_id: agent.id().to_string(),
                    agent_name: Some(agent.name().to_string()),
                }
            }
            Err(error) => {
                if let Some(sid) = session_id {
                    self.sessions.record(sid, [agent.id()], [message]);
                }
                AgentCallResponse {
                    success: false,
                    response: None,
                    error: Some(error),
                    agent_id: agent.id().to_string(),
                    agent_name: Some(agent.name().to_string()),
                }
            }
        }
    }

    // ---------- 协作 ----------

    pub async fn collaborate_agents(
        &self,
        agent_ids: &[String],
        task: &str,
        strategy: CollaborationStrategy,
        session_id: Option<&str>,
    ) -> CollaborationResponse {
        let collaboration_id = Uuid::new_v4().to_string();
        let started_at = Utc::now();
        let start = Instant::now();

        let (effective, outcome) = match self.resolve(agent_ids) {
            Err(e) => (strategy, Err(e)),
            Ok(agents) => {
                tracing::info!(
                    collaboration_id = %collaboration_id,
                    strategy = %strategy,
                    agents = agents.len(),
                    "collaboration started"
                );
                match strategy {
                    CollaborationStrategy::Hierarchical if agents.len() < 2 => {
                        tracing::debug!("hierarchical with fewer than two agents, running sequential");
                        (
                            CollaborationStrategy::Sequential,
                            self.sequential(&agents, task, session_id).await,
                        )
                    }
                    CollaborationStrategy::Sequential => {
                        (strategy, self.sequential(&agents, task, session_id).await)
                    }
                    CollaborationStrategy::Parallel => {
                        (strategy, self.parallel(&agents, task, session_id).await)
                    }
                    CollaborationStrategy::Hierarchical => {
                        (strategy, self.hierarchical(&agents, task, session_id).await)
                    }
                }
            }
        };

        let (result, error) = match outcome {
            Ok(r) => {
                let error = r.failure();
                (Some(r), error)
            }
            Err(e) => (None, Some(e.to_string())),
        };
        let success = error.is_none();
        if let Some(e) = &error {
            tracing::warn!(collaboration_id = %collaboration_id, error = %e, "collaboration failed");
        }

        let elapsed = start.elapsed();
        self.monitor
            .record_task_execution(effective.as_str(), elapsed, success);

        if let Some(sid) = session_id {
            let reply = match &result {
                Some(r) => Message::assistant("orchestrator", r.final_text()),
                None => Message::assistant("orchestrator", error.clone().unwrap_or_default()),
            };
            let reply = if success {
                reply
            } else {
                reply.with_metadata("error", true)
            };
            self.sessions.record(
                sid,
                agent_ids.iter().map(String::as_str),
                [Message::user(task), reply],
            );
        }

        self.remember(CollaborationRecord {
            id: collaboration_id.clone(),
            strategy: effective,
            agent_ids: agent_ids.to_vec(),
            task: task.to_string(),
            session_id: session_id.map(String::from),
            success,
            result: result.clone(),
            error: error.clone(),
            started_at,
            duration_ms: elapsed.as_millis() as u64,
        });

        CollaborationResponse {
            success,
            collaboration_id,
            result,
            error,
        }
    }

    fn resolve(&self, agent_ids: &[String]) -> Result<Vec<Arc<dyn Agent>>, AgentError> {
        if agent_ids.is_empty() {
            return Err(AgentError::Validation("no agents given for collaboration".into()));
        }
        agent_ids
            .iter()
            .map(|id| {
                self.get_agent(id)
                    .ok_or_else(|| AgentError::AgentNotFound(id.clone()))
            })
            .collect()
    }

    /// 协作中的参与者失败只做分类与记录，不重放
    async fn report_failure(
        &self,
        agent: &Arc<dyn Agent>,
        error: &AgentError,
        session_id: Option<&str>,
    ) -> crate::core::ErrorEvent {
        let ctx = Self::error_context(agent, session_id, None);
        self.error_handler.handle_error(error, ctx).await
    }

    async fn participate(
        &self,
        agent: &Arc<dyn Agent>,
        message: Message,
        session_id: Option<&str>,
    ) -> ParticipantResult {
        let outcome = match self.invoke(agent, message).await {
            Ok(reply) => ParticipantOutcome::Success {
                output: reply.text(),
            },
            Err(e) => {
                self.report_failure(agent, &e, session_id).await;
                ParticipantOutcome::Failure {
                    error: e.to_string(),
                }
            }
        };
        ParticipantResult {
            agent_id: agent.id().to_string(),
            agent_name: agent.name().to_string(),
            outcome,
        }
    }

    async fn sequential(
        &self,
        agents: &[Arc<dyn Agent>],
        task: &str,
        session_id: Option<&str>,
    ) -> Result<CollaborationResult, AgentError> {
        let mut input = Message::user(task);
        let mut steps = Vec::with_capacity(agents.len());
        for agent in agents {
            match self.invoke(agent, input).await {
                Ok(reply) => {
                    let output = reply.text();
                    steps.push(ParticipantResult {
                        agent_id: agent.id().to_string(),
                        agent_name: agent.name().to_string(),
                        outcome: ParticipantOutcome::Success {
                            output: output.clone(),
                        },
                    });
                    input = Message::new(agent.name(), Role::User, output);
                }
                Err(e) => {
                    self.report_failure(agent, &e, session_id).await;
                    return Err(e);
                }
            }
        }
        Ok(CollaborationResult::Sequential {
            final_output: input.text(),
            steps,
        })
    }

    async fn parallel(
        &self,
        agents: &[Arc<dyn Agent>],
        task: &str,
        session_id: Option<&str>,
    ) -> Result<CollaborationResult, AgentError> {
        let results = join_all(
            agents
                .iter()
                .map(|a| self.participate(a, Message::user(task), session_id)),
        )
        .await;
        Ok(CollaborationResult::Parallel { results })
    }

    async fn hierarchical(
        &self,
        agents: &[Arc<dyn Agent>],
        task: &str,
        session_id: Option<&str>,
    ) -> Result<CollaborationResult, AgentError> {
        let coordinator = &agents[0];
        let workers = &agents[1..];
        let mut degraded = false;

        let plan_request = format!(
            "你是协调者。请为以下任务制定分工计划，说明每位成员应完成的部分：\n{}",
            task
        );
        let plan = match self.invoke(coordinator, Message::user(plan_request)).await {
            Ok(reply) => reply.text(),
            Err(e) => {
                let event = self
                    .report_failure(coordinator, &AgentError::Plan(e.to_string()), session_id)
                    .await;
                if event.resolved
                    && event.chosen_strategy == Some(RecoveryStrategy::GracefulDegradation)
                {
                    degraded = true;
                    task.to_string()
                } else {
                    return Err(AgentError::Plan(e.to_string()));
                }
            }
        };

        let worker_input = format!("## 任务\n{}\n\n## 计划\n{}", task, plan);
        let results = join_all(
            workers
                .iter()
                .map(|w| self.participate(w, Message::user(worker_input.clone()), session_id)),
        )
        .await;

        let mut synthesis_request = format!(
            "请综合团队成员的结果，给出最终答案。\n\n## 任务\n{}\n\n## 计划\n{}\n\n## 成员结果\n",
            task, plan
        );
        for r in &results {
            match &r.outcome {
                ParticipantOutcome::Success { output } => {
                    synthesis_request.push_str(&format!("### {}\n{}\n\n", r.agent_name, output))
                }
                ParticipantOutcome::Failure { error } => {
                    synthesis_request.push_str(&format!("### {}（失败）\n{}\n\n", r.agent_name, error))
                }
            }
        }

        let final_output = match self
            .invoke(coordinator, Message::user(synthesis_request))
            .await
        {
            Ok(reply) => reply.text(),
            Err(e) => {
                let event = self
                    .report_failure(coordinator, &AgentError::Synthesis(e.to_string()), session_id)
                    .await;
                let outputs: Vec<&str> = results
                    .iter()
                    .filter_map(|r| match &r.outcome {
                        ParticipantOutcome::Success { output } => Some(output.as_str()),
                        ParticipantOutcome::Failure { .. } => None,
                    })
                    .collect();
                if event.resolved
                    && event.chosen_strategy == Some(RecoveryStrategy::GracefulDegradation)
                    && !outputs.is_empty()
                {
                    degraded = true;
                    outputs.join("\n\n")
                } else {
                    return Err(AgentError::Synthesis(e.to_string()));
                }
            }
        };

        Ok(CollaborationResult::Hierarchical {
            coordinator_id: coordinator.id().to_string(),
            plan,
            workers: results,
            final_output,
            degraded,
        })
    }

    fn remember(&self, record: CollaborationRecord) {
        let mut history = self
            .collaborations
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        history.push_back(record);
        while history.len() > self.max_collaboration_history {
            history.pop_front();
        }
    }

    // ---------- 历史 ----------

    pub fn get_session_history(&self, session_id: &str) -> Option<SessionHistory> {
        self.sessions.get(session_id)
    }

    /// 当前保留的会话 id，按字典序
    pub fn list_sessions(&self) -> Vec<String> {
        self.sessions.session_ids()
    }

    /// 结束会话并丢弃其历史；会话不存在返回 false
    pub fn end_session(&self, session_id: &str) -> bool {
        let removed = self.sessions.remove(session_id);
        if removed {
            tracing::info!(session_id, "session ended");
        }
        removed
    }

    pub fn get_collaboration(&self, collaboration_id: &str) -> Option<CollaborationRecord> {
        self.collaborations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|r| r.id == collaboration_id)
            .cloned()
    }

    /// 最近的协作记录，新的在前
    pub fn collaboration_history(&self, limit: usize) -> Vec<CollaborationRecord> {
        self.collaborations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentConfig, AgentCore};
    use crate::core::CircuitState;
    use async_trait::async_trait;
    use tokio::sync::Barrier;

    /// 测试智能体：记录收到的输入，按前缀回复，可配置为失败或在 barrier 处等待
    struct Scripted {
        core: AgentCore,
        prefix: String,
        fail: bool,
        /// 只在这些调用序号（从 1 计）上失败
        fail_on: Vec<usize>,
        inputs: Mutex<Vec<String>>,
        barrier: Option<Arc<Barrier>>,
    }

    impl Scripted {
        fn new(name: &str, prefix: &str) -> Self {
            Self {
                core: AgentCore::new(
                    AgentConfig::new(name, "worker").with_capability("writing"),
                )
                .with_id(name),
                prefix: prefix.to_string(),
                fail: false,
                fail_on: Vec::new(),
                inputs: Mutex::new(Vec::new()),
                barrier: None,
            }
        }

        fn failing(mut self) -> Self {
            self.fail = true;
            self
        }

        fn failing_on(mut self, call: usize) -> Self {
            self.fail_on.push(call);
            self
        }

        fn with_barrier(mut self, barrier: Arc<Barrier>) -> Self {
            self.barrier = Some(barrier);
            self
        }

        fn inputs(&self) -> Vec<String> {
            self.inputs.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Agent for Scripted {
        fn core(&self) -> &AgentCore {
            &self.core
        }

        async fn reply(&self, message: Message) -> Result<Message, AgentError> {
            let call = {
                let mut inputs = self.inputs.lock().unwrap();
                inputs.push(message.text());
                inputs.len()
            };
            if let Some(b) = &self.barrier {
                b.wait().await;
            }
            if self.fail || self.fail_on.contains(&call) {
                return Err(AgentError::AgentFailure(format!("{} crashed", self.name())));
            }
            Ok(Message::assistant(
                self.name(),
                format!("{}({})", self.prefix, message.text()),
            ))
        }
    }

    fn orchestrator() -> AgentOrchestrator {
        let mut cfg = AppConfig::default();
        cfg.recovery.backoff_unit_ms = 1;
        AgentOrchestrator::from_config(&cfg)
    }

    fn ids(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_register_lookup_and_duplicate() {
        let orch = orchestrator();
        orch.register_agent(Arc::new(Scripted::new("a", "A"))).unwrap();
        assert_eq!(
            orch.register_agent(Arc::new(Scripted::new("a", "A"))).unwrap_err(),
            AgentError::DuplicateAgent("a".into())
        );
        assert_eq!(orch.get_agents_by_capability("writing").len(), 1);
        assert!(orch.get_agents_by_capability("coding").is_empty());
        assert_eq!(orch.get_agents_by_role("worker").len(), 1);
        assert_eq!(orch.list_agents()[0].name, "a");
        orch.unregister_agent("a").unwrap();
        assert!(orch.get_agent("a").is_none());
        assert!(orch.unregister_agent("a").is_err());
    }

    #[tokio::test]
    async fn test_call_agent_records_session() {
        let orch = orchestrator();
        orch.register_agent(Arc::new(Scripted::new("a", "A"))).unwrap();
        let resp = orch
            .call_agent("a", Message::user("hi"), Some("s1"), None)
            .await;
        assert!(resp.success);
        assert_eq!(resp.response.unwrap().text(), "A(hi)");
        assert_eq!(resp.agent_name.as_deref(), Some("a"));
        let session = orch.get_session_history("s1").unwrap();
        assert_eq!(session.messages.len(), 2);
        assert!(session.agents_used.contains("a"));
        assert_eq!(orch.list_sessions(), vec!["s1".to_string()]);
        assert!(orch.end_session("s1"));
        assert!(!orch.end_session("s1"));
        assert!(orch.get_session_history("s1").is_none());

        let missing = orch.call_agent("zz", Message::user("hi"), None, None).await;
        assert!(!missing.success);
        assert!(missing.error.unwrap().contains("zz"));
    }

    #[tokio::test]
    async fn test_call_agent_failure_is_structured() {
        let orch = orchestrator();
        let agent = Arc::new(Scripted::new("bad", "B").failing());
        orch.register_agent(agent.clone()).unwrap();
        let resp = orch.call_agent("bad", Message::user("x"), None, None).await;
        assert!(!resp.success);
        assert!(resp.error.unwrap().contains("bad crashed"));
        // 首次调用 + 一次 retry
        assert_eq!(agent.inputs().len(), 2);
        assert_eq!(orch.error_handler().history().len(), 1);
    }

    #[tokio::test]
    async fn test_sequential_chains_outputs() {
        let orch = orchestrator();
        let a = Arc::new(Scripted::new("a", "A"));
        let b = Arc::new(Scripted::new("b", "B"));
        let c = Arc::new(Scripted::new("c", "C"));
        for agent in [&a, &b, &c] {
            orch.register_agent(agent.clone()).unwrap();
        }
        let resp = orch
            .collaborate_agents(&ids(&["a", "b", "c"]), "T", CollaborationStrategy::Sequential, None)
            .await;
        assert!(resp.success);
        assert_eq!(a.inputs(), vec!["T"]);
        assert_eq!(b.inputs(), vec!["A(T)"]);
        assert_eq!(c.inputs(), vec!["B(A(T))"]);
        match resp.result.unwrap() {
            CollaborationResult::Sequential { final_output, steps } => {
                assert_eq!(final_output, "C(B(A(T)))");
                assert_eq!(steps.len(), 3);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_sequential_aborts_on_first_failure() {
        let orch = orchestrator();
        let a = Arc::new(Scripted::new("a", "A"));
        let b = Arc::new(Scripted::new("b", "B").failing());
        let c = Arc::new(Scripted::new("c", "C"));
        for agent in [&a, &b, &c] {
            orch.register_agent(agent.clone()).unwrap();
        }
        let resp = orch
            .collaborate_agents(&ids(&["a", "b", "c"]), "T", CollaborationStrategy::Sequential, Some("s"))
            .await;
        assert!(!resp.success);
        assert!(resp.error.unwrap().contains("b crashed"));
        assert!(c.inputs().is_empty());
        assert_eq!(b.inputs().len(), 1);
        let record = orch.get_collaboration(&resp.collaboration_id).unwrap();
        assert!(!record.success);
        assert_eq!(orch.get_session_history("s").unwrap().messages.len(), 2);
    }

    #[tokio::test]
    async fn test_parallel_isolates_failures() {
        let orch = orchestrator();
        let barrier = Arc::new(Barrier::new(3));
        let agents = [
            Scripted::new("a", "A").with_barrier(barrier.clone()),
            Scripted::new("b", "B").with_barrier(barrier.clone()).failing(),
            Scripted::new("c", "C").with_barrier(barrier.clone()),
        ];
        for agent in agents {
            orch.register_agent(Arc::new(agent)).unwrap();
        }
        let resp = tokio::time::timeout(
            Duration::from_secs(5),
            orch.collaborate_agents(&ids(&["a", "b", "c"]), "T", CollaborationStrategy::Parallel, None),
        )
        .await
        .expect("parallel agents must run concurrently");
        assert!(resp.success);
        let CollaborationResult::Parallel { results } = resp.result.unwrap() else {
            panic!("expected parallel result");
        };
        assert_eq!(results.len(), 3);
        assert_eq!(results.iter().filter(|r| r.is_success()).count(), 2);
        assert!(matches!(
            &results[1].outcome,
            ParticipantOutcome::Failure { error } if error.contains("b crashed")
        ));
    }

    #[tokio::test]
    async fn test_parallel_all_failed_keeps_every_entry() {
        let orch = orchestrator();
        orch.register_agent(Arc::new(Scripted::new("a", "A").failing())).unwrap();
        orch.register_agent(Arc::new(Scripted::new("b", "B").failing())).unwrap();
        let resp = orch
            .collaborate_agents(&ids(&["a", "b"]), "T", CollaborationStrategy::Parallel, Some("s"))
            .await;
        assert!(!resp.success);
        assert!(resp.error.as_deref().unwrap().contains("all 2 agents failed"));
        let CollaborationResult::Parallel { results } = resp.result.unwrap() else {
            panic!("expected parallel result");
        };
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| !r.is_success()));
        let record = orch.get_collaboration(&resp.collaboration_id).unwrap();
        assert!(!record.success);
        assert!(record.result.is_some());
        let session = orch.get_session_history("s").unwrap();
        assert_eq!(session.messages[1].metadata().get("error"), Some(&Value::Bool(true)));
    }

    #[tokio::test]
    async fn test_hierarchical_plan_failure_degrades_to_task() {
        let orch = orchestrator();
        let x = Arc::new(Scripted::new("x", "X").failing_on(1));
        let y = Arc::new(Scripted::new("y", "Y"));
        let z = Arc::new(Scripted::new("z", "Z"));
        for agent in [&x, &y, &z] {
            orch.register_agent(agent.clone()).unwrap();
        }
        let resp = orch
            .collaborate_agents(&ids(&["x", "y", "z"]), "T", CollaborationStrategy::Hierarchical, None)
            .await;
        assert!(resp.success, "{:?}", resp.error);
        assert_eq!(x.inputs().len(), 2);
        assert_eq!(y.inputs(), vec!["## 任务\nT\n\n## 计划\nT"]);
        assert_eq!(z.inputs().len(), 1);
        match resp.result.unwrap() {
            CollaborationResult::Hierarchical {
                plan,
                degraded,
                final_output,
                ..
            } => {
                assert_eq!(plan, "T");
                assert!(degraded);
                assert!(final_output.starts_with("X("));
            }
            other => panic!("unexpected result: {other:?}"),
        }
        let events = orch.error_handler().history();
        assert_eq!(events[0].error_type, crate::core::ErrorType::PlanError);
        assert_eq!(events[0].chosen_strategy, Some(RecoveryStrategy::GracefulDegradation));
    }

    #[tokio::test]
    async fn test_hierarchical_synthesis_failure_joins_worker_outputs() {
        let orch = orchestrator();
        let x = Arc::new(Scripted::new("x", "X").failing_on(2));
        let y = Arc::new(Scripted::new("y", "Y"));
        let z = Arc::new(Scripted::new("z", "Z"));
        for agent in [&x, &y, &z] {
            orch.register_agent(agent.clone()).unwrap();
        }
        let resp = orch
            .collaborate_agents(&ids(&["x", "y", "z"]), "T", CollaborationStrategy::Hierarchical, None)
            .await;
        assert!(resp.success, "{:?}", resp.error);
        assert_eq!(x.inputs().len(), 2);
        assert_eq!(y.inputs().len(), 1);
        assert_eq!(z.inputs().len(), 1);
        match resp.result.unwrap() {
            CollaborationResult::Hierarchical {
                plan,
                degraded,
                final_output,
                ..
            } => {
                assert!(plan.starts_with("X("));
                assert!(degraded);
                let expected = format!("Y({})\n\nZ({})", y.inputs()[0], z.inputs()[0]);
                assert_eq!(final_output, expected);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_open_circuit_is_not_replayed() {
        let mut cfg = AppConfig::default();
        cfg.recovery.backoff_unit_ms = 1;
        cfg.circuit_breaker.failure_threshold = 1;
        let orch = AgentOrchestrator::from_config(&cfg);
        let bad = Arc::new(Scripted::new("bad", "B").failing());
        orch.register_agent(bad.clone()).unwrap();
        orch.call_agent("bad", Message::user("x"), None, None).await;
        let resp = orch.call_agent("bad", Message::user("y"), None, None).await;
        assert!(!resp.success);
        assert!(resp.error.unwrap().contains("Circuit open"));
        assert_eq!(bad.inputs().len(), 1);
        let last = orch.error_handler().recent_errors(1).remove(0);
        assert_eq!(last.recovery_attempts, 1);
        assert_eq!(last.chosen_strategy, Some(RecoveryStrategy::GracefulDegradation));
    }

    #[tokio::test]
    async fn test_hierarchical_invocation_counts_and_concurrency() {
        let orch = orchestrator();
        let barrier = Arc::new(Barrier::new(2));
        let x = Arc::new(Scripted::new("x", "X"));
        let y = Arc::new(Scripted::new("y", "Y").with_barrier(barrier.clone()));
        let z = Arc::new(Scripted::new("z", "Z").with_barrier(barrier.clone()));
        for agent in [&x, &y, &z] {
            orch.register_agent(agent.clone()).unwrap();
        }
        let resp = tokio::time::timeout(
            Duration::from_secs(5),
            orch.collaborate_agents(&ids(&["x", "y", "z"]), "T", CollaborationStrategy::Hierarchical, None),
        )
        .await
        .expect("workers must run concurrently");
        assert!(resp.success);
        assert_eq!(x.inputs().len(), 2);
        assert_eq!(y.inputs().len(), 1);
        assert_eq!(z.inputs().len(), 1);
        assert!(y.inputs()[0].contains("## 计划"));
        let synthesis = &x.inputs()[1];
        assert!(synthesis.contains("Y(") && synthesis.contains("Z("));
        match resp.result.unwrap() {
            CollaborationResult::Hierarchical {
                coordinator_id,
                degraded,
                final_output,
                ..
            } => {
                assert_eq!(coordinator_id, "x");
                assert!(!degraded);
                assert!(final_output.starts_with("X("));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_hierarchical_worker_failure_is_isolated() {
        let orch = orchestrator();
        let x = Arc::new(Scripted::new("x", "X"));
        orch.register_agent(x.clone()).unwrap();
        orch.register_agent(Arc::new(Scripted::new("y", "Y").failing())).unwrap();
        orch.register_agent(Arc::new(Scripted::new("z", "Z"))).unwrap();
        let resp = orch
            .collaborate_agents(&ids(&["x", "y", "z"]), "T", CollaborationStrategy::Hierarchical, None)
            .await;
        assert!(resp.success);
        assert!(x.inputs()[1].contains("y（失败）"));
    }

    #[tokio::test]
    async fn test_hierarchical_single_agent_degenerates_to_sequential() {
        let orch = orchestrator();
        let x = Arc::new(Scripted::new("x", "X"));
        orch.register_agent(x.clone()).unwrap();
        let resp = orch
            .collaborate_agents(&ids(&["x"]), "T", CollaborationStrategy::Hierarchical, None)
            .await;
        assert!(resp.success);
        assert_eq!(x.inputs(), vec!["T"]);
        assert_eq!(
            resp.result.as_ref().map(CollaborationResult::strategy),
            Some(CollaborationStrategy::Sequential)
        );
        let record = orch.get_collaboration(&resp.collaboration_id).unwrap();
        assert_eq!(record.strategy, CollaborationStrategy::Sequential);
    }

    #[tokio::test]
    async fn test_unknown_agent_in_collaboration() {
        let orch = orchestrator();
        let resp = orch
            .collaborate_agents(&ids(&["ghost"]), "T", CollaborationStrategy::Parallel, None)
            .await;
        assert!(!resp.success);
        assert_eq!(resp.error.unwrap(), "Agent not found: ghost");
        let empty = orch
            .collaborate_agents(&[], "T", CollaborationStrategy::Sequential, None)
            .await;
        assert!(!empty.success);
    }

    #[tokio::test]
    async fn test_breaker_opens_after_repeated_failures() {
        let mut cfg = AppConfig::default();
        cfg.recovery.backoff_unit_ms = 1;
        cfg.circuit_breaker.failure_threshold = 2;
        let orch = AgentOrchestrator::from_config(&cfg).with_retry_agent_calls(false);
        let bad = Arc::new(Scripted::new("bad", "B").failing());
        orch.register_agent(bad.clone()).unwrap();
        for _ in 0..3 {
            orch.call_agent("bad", Message::user("x"), None, None).await;
        }
        // 第三次调用被熔断器拒绝，未进入智能体
        assert_eq!(bad.inputs().len(), 2);
        assert_eq!(orch.circuit_states()[0].state, CircuitState::Open);
        let perf = orch.monitor().agent_performance("bad").unwrap();
        assert_eq!(perf.failures, 3);
    }

    #[test]
    fn test_strategy_parse() {
        assert_eq!(
            "Hierarchical".parse::<CollaborationStrategy>().unwrap(),
            CollaborationStrategy::Hierarchical
        );
        assert!("round_robin".parse::<CollaborationStrategy>().is_err());
    }

    #[tokio::test]
    async fn test_collaboration_history_is_newest_first() {
        let orch = orchestrator();
        orch.register_agent(Arc::new(Scripted::new("a", "A"))).unwrap();
        let first = orch
            .collaborate_agents(&ids(&["a"]), "1", CollaborationStrategy::Sequential, None)
            .await;
        let second = orch
            .collaborate_agents(&ids(&["a"]), "2", CollaborationStrategy::Sequential, None)
            .await;
        let history = orch.collaboration_history(10);
        assert_eq!(history[0].id, second.collaboration_id);
        assert_eq!(history[1].id, first.collaboration_id);
        assert_eq!(orch.collaboration_history(1).len(), 1);
    }
}
