//! 错误恢复引擎
//!
//! 捕获到的失败先分类为 ErrorEvent，再按该类型的策略偏好依次尝试恢复：
//! 每次尝试递增 recovery_attempts，两次尝试之间等待 2^attempts 个时间单位，
//! 直到某个策略成功、次数达到上限或策略用尽。handle_error 永不返回错误，只返回事件。

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::config::RecoverySection;
use crate::core::{AgentError, ErrorType, RecoveryStrategy, Severity};
use crate::observability::PerformanceMonitor;

/// 错误上下文（调用点、agent_id、session_id 等）
pub type ErrorContext = BTreeMap<String, Value>;

/// 一次被捕获的失败及其恢复过程
#[derive(Debug, Clone, Serialize)]
pub struct ErrorEvent {
    pub id: String,
    pub error_type: ErrorType,
    pub severity: Severity,
    pub message: String,
    pub context: ErrorContext,
    pub recovery_attempts: u32,
    pub max_recovery_attempts: u32,
    pub resolved: bool,
    pub chosen_strategy: Option<RecoveryStrategy>,
    pub timestamp: DateTime<Utc>,
}

impl ErrorEvent {
    pub fn new(error: &AgentError, context: ErrorContext, max_recovery_attempts: u32) -> Self {
        let error_type = error.classify();
        Self {
            id: Uuid::new_v4().to_string(),
            error_type,
            severity: error_type.default_severity(),
            message: error.to_string(),
            context,
            recovery_attempts: 0,
            max_recovery_attempts,
            resolved: false,
            chosen_strategy: None,
            timestamp: Utc::now(),
        }
    }
}

/// 由外部系统提供的恢复动作（重启智能体、切换提供方等）；返回是否恢复成功
#[async_trait]
pub trait RecoveryPolicy: Send + Sync {
    async fn recover(&self, event: &ErrorEvent) -> bool;
}

/// 错误统计
#[derive(Debug, Clone, Default, Serialize)]
pub struct ErrorStatistics {
    pub total: usize,
    pub resolved: usize,
    pub resolution_rate: f64,
    pub by_type: BTreeMap<String, usize>,
    pub by_strategy: BTreeMap<String, usize>,
}

/// 恢复引擎配置
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    pub max_recovery_attempts: u32,
    /// 退避的时间单位：第 k 次尝试失败后等待 unit * 2^k
    pub backoff_unit: Duration,
    pub max_history: usize,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_recovery_attempts: 3,
            backoff_unit: Duration::from_secs(1),
            max_history: 1000,
        }
    }
}

impl From<&RecoverySection> for RecoveryConfig {
    fn from(s: &RecoverySection) -> Self {
        Self {
            max_recovery_attempts: s.max_recovery_attempts,
            backoff_unit: Duration::from_millis(s.backoff_unit_ms),
            max_history: s.max_history,
        }
    }
}

pub struct ErrorHandler {
    config: RecoveryConfig,
    policies: RwLock<HashMap<RecoveryStrategy, Arc<dyn RecoveryPolicy>>>,
    history: Mutex<VecDeque<ErrorEvent>>,
    monitor: Option<Arc<PerformanceMonitor>>,
}

impl ErrorHandler {
    pub fn new(config: RecoveryConfig) -> Self {
        Self {
            config,
            policies: RwLock::new(HashMap::new()),
            history: Mutex::new(VecDeque::new()),
            monitor: None,
        }
    }

    pub fn with_monitor(mut self, monitor: Arc<PerformanceMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    /// 注册某个策略的实际执行者；Retry 由调用方在 handle_error_with_retry 中直接提供
    pub fn register_policy(&self, strategy: RecoveryStrategy, policy: Arc<dyn RecoveryPolicy>) {
        self.policies
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(strategy, policy);
    }

    /// 第 attempt 次尝试失败后、下一次尝试前的等待时长
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        self.config.backoff_unit * 2u32.saturating_pow(attempt)
    }

    fn policy(&self, strategy: RecoveryStrategy) -> Option<Arc<dyn RecoveryPolicy>> {
        self.policies
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&strategy)
            .cloned()
    }

    /// 策略是否可执行：Retry 需要可重放的操作；重启与切换提供方需要外部注册的策略
    fn is_available(&self, strategy: RecoveryStrategy, has_retry: bool) -> bool {
        match strategy {
            RecoveryStrategy::Retry => has_retry,
            RecoveryStrategy::RestartAgent | RecoveryStrategy::FallbackProvider => {
                self.policy(strategy).is_some()
            }
            _ => true,
        }
    }

    /// 内置策略：降级 / 跳过直接视为已处理；上报与人工介入记录告警后同样视为已处理
    fn builtin(&self, strategy: RecoveryStrategy, event: &ErrorEvent) -> bool {
        match strategy {
            RecoveryStrategy::GracefulDegradation => {
                tracing::info!(error_id = %event.id, error_type = %event.error_type, "degrading gracefully");
                true
            }
            RecoveryStrategy::SkipTask => {
                tracing::info!(error_id = %event.id, error_type = %event.error_type, "skipping task");
                true
            }
            RecoveryStrategy::Escalate => {
                tracing::error!(
                    error_id = %event.id,
                    error_type = %event.error_type,
                    severity = ?event.severity,
                    message = %event.message,
                    "error escalated"
                );
                true
            }
            RecoveryStrategy::ManualIntervention => {
                tracing::error!(
                    error_id = %event.id,
                    error_type = %event.error_type,
                    message = %event.message,
                    "manual intervention required"
                );
                true
            }
            RecoveryStrategy::Retry
            | RecoveryStrategy::RestartAgent
            | RecoveryStrategy::FallbackProvider => false,
        }
    }

    /// 处理一次失败（无可重放操作）
    pub async fn handle_error(&self, error: &AgentError, context: ErrorContext) -> ErrorEvent {
        let (event, _) = self
            .recover::<(), _, _>(error, context, None::<fn() -> std::future::Ready<Result<(), AgentError>>>)
            .await;
        event
    }

    /// 处理一次失败；Retry 策略会以原参数重新调用 retry，成功时返回其结果
    pub async fn handle_error_with_retry<T, F, Fut>(
        &self,
        error: &AgentError,
        context: ErrorContext,
        retry: F,
    ) -> (ErrorEvent, Option<T>)
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, AgentError>>,
    {
        self.recover(error, context, Some(retry)).await
    }

    /// 执行操作；失败时交给恢复流程，并以同一操作作为 Retry 的重放
    pub async fn execute_with_recovery<T, F, Fut>(
        &self,
        context: ErrorContext,
        op: F,
    ) -> Result<T, ErrorEvent>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, AgentError>>,
    {
        match op().await {
            Ok(v) => Ok(v),
            Err(e) => match self.recover(&e, context, Some(&op)).await {
                (_, Some(v)) => Ok(v),
                (event, None) => Err(event),
            },
        }
    }

    async fn recover<T, F, Fut>(
        &self,
        error: &AgentError,
        context: ErrorContext,
        retry: Option<F>,
    ) -> (ErrorEvent, Option<T>)
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, AgentError>>,
    {
        let mut event = ErrorEvent::new(error, context, self.config.max_recovery_attempts);
        tracing::warn!(
            error_id = %event.id,
            error_type = %event.error_type,
            message = %event.message,
            "handling error"
        );
        if let Some(m) = &self.monitor {
            m.increment_counter(&format!("errors.{}", event.error_type), 1.0, None);
        }

        let mut value = None;
        for &strategy in event.error_type.preferred_strategies() {
            if event.recovery_attempts >= event.max_recovery_attempts {
                break;
            }
            if !self.is_available(strategy, retry.is_some()) {
                tracing::debug!(error_id = %event.id, ?strategy, "strategy unavailable, skipped");
                continue;
            }
            if event.recovery_attempts > 0 {
                tokio::time::sleep(self.backoff_delay(event.recovery_attempts)).await;
            }
            event.recovery_attempts += 1;
            event.chosen_strategy = Some(strategy);

            let recovered = match strategy {
                RecoveryStrategy::Retry => match &retry {
                    Some(op) => match op().await {
                        Ok(v) => {
                            value = Some(v);
                            true
                        }
                        Err(e) => {
                            tracing::debug!(error_id = %event.id, error = %e, "retry failed");
                            false
                        }
                    },
                    None => false,
                },
                other => match self.policy(other) {
                    Some(p) => p.recover(&event).await,
                    None => self.builtin(other, &event),
                },
            };
            if recovered {
                event.resolved = true;
                break;
            }
        }

        if event.resolved {
            tracing::info!(
                error_id = %event.id,
                strategy = ?event.chosen_strategy,
                attempts = event.recovery_attempts,
                "error resolved"
            );
        } else {
            tracing::warn!(error_id = %event.id, attempts = event.recovery_attempts, "error unresolved");
        }
        self.remember(event.clone());
        (event, value)
    }

    fn remember(&self, event: ErrorEvent) {
        let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        history.push_back(event);
        while history.len() > self.config.max_history {
            history.pop_front();
        }
    }

    pub fn history(&self) -> Vec<ErrorEvent> {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    pub fn recent_errors(&self, limit: usize) -> Vec<ErrorEvent> {
        let history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        history.iter().rev().take(limit).cloned().collect()
    }

    pub fn error_statistics(&self) -> ErrorStatistics {
        let history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        let mut stats = ErrorStatistics {
            total: history.len(),
            ..Default::default()
        };
        for e in history.iter() {
            if e.resolved {
                stats.resolved += 1;
            }
            *stats.by_type.entry(e.error_type.to_string()).or_default() += 1;
            if let Some(s) = e.chosen_strategy {
                let key = serde_json::to_value(s)
                    .ok()
                    .and_then(|v| v.as_str().map(str::to_string))
                    .unwrap_or_default();
                *stats.by_strategy.entry(key).or_default() += 1;
            }
        }
        if stats.total > 0 {
            stats.resolution_rate = stats.resolved as f64 / stats.total as f64;
        }
        stats
    }
}

impl Default for ErrorHandler {
    fn default() -> Self {
        Self::new(RecoveryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::LlmError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    fn fast(max: u32) -> ErrorHandler {
        ErrorHandler::new(RecoveryConfig {
            max_recovery_attempts: max,
            backoff_unit: Duration::from_millis(1),
            max_history: 5,
        })
    }

    struct Flaky(AtomicUsize, bool);

    #[async_trait]
    impl RecoveryPolicy for Flaky {
        async fn recover(&self, _event: &ErrorEvent) -> bool {
            self.0.fetch_add(1, Ordering::SeqCst);
            self.1
        }
    }

    #[test]
    fn test_backoff_is_exponential() {
        let h = ErrorHandler::new(RecoveryConfig {
            backoff_unit: Duration::from_millis(10),
            ..Default::default()
        });
        assert_eq!(h.backoff_delay(0), Duration::from_millis(10));
        assert_eq!(h.backoff_delay(1), Duration::from_millis(20));
        assert_eq!(h.backoff_delay(3), Duration::from_millis(80));
    }

    #[tokio::test]
    async fn test_retry_success_resolves() {
        let h = fast(3);
        let calls = AtomicUsize::new(0);
        let err = AgentError::Llm(LlmError::Network("reset".into()));
        let (event, value) = h
            .handle_error_with_retry(&err, ErrorContext::new(), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, AgentError>(7)
            })
            .await;
        assert!(event.resolved);
        assert_eq!(event.error_type, ErrorType::NetworkError);
        assert_eq!(event.chosen_strategy, Some(RecoveryStrategy::Retry));
        assert_eq!(event.recovery_attempts, 1);
        assert_eq!(value, Some(7));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_attempts_never_exceed_max() {
        let h = fast(2);
        let fallback = Arc::new(Flaky(AtomicUsize::new(0), false));
        h.register_policy(RecoveryStrategy::FallbackProvider, fallback.clone());
        let err = AgentError::Llm(LlmError::Timeout("slow".into()));
        let (event, value) = h
            .handle_error_with_retry(&err, ErrorContext::new(), || async {
                Err::<(), _>(AgentError::Llm(LlmError::Timeout("slow".into())))
            })
            .await;
        // Retry 与 FallbackProvider 均失败，GracefulDegradation 因上限未被尝试
        assert_eq!(event.recovery_attempts, 2);
        assert!(!event.resolved);
        assert!(value.is_none());
        assert_eq!(fallback.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unavailable_strategies_are_skipped() {
        let h = fast(3);
        // agent_failure: RestartAgent（未注册）、Retry（无操作）均跳过，Escalate 内置处理
        let event = h
            .handle_error(&AgentError::AgentFailure("crashed".into()), ErrorContext::new())
            .await;
        assert!(event.resolved);
        assert_eq!(event.recovery_attempts, 1);
        assert_eq!(event.chosen_strategy, Some(RecoveryStrategy::Escalate));
    }

    #[tokio::test]
    async fn test_registered_policy_is_used() {
        let h = fast(3);
        let restart = Arc::new(Flaky(AtomicUsize::new(0), true));
        h.register_policy(RecoveryStrategy::RestartAgent, restart.clone());
        let event = h
            .handle_error(&AgentError::AgentFailure("crashed".into()), ErrorContext::new())
            .await;
        assert_eq!(event.chosen_strategy, Some(RecoveryStrategy::RestartAgent));
        assert_eq!(restart.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_backoff_waits_between_attempts() {
        let h = ErrorHandler::new(RecoveryConfig {
            max_recovery_attempts: 3,
            backoff_unit: Duration::from_millis(20),
            max_history: 10,
        });
        let start = Instant::now();
        // network_error: Retry 失败 -> 等待 2^1 单位 -> GracefulDegradation 成功
        let (event, _) = h
            .handle_error_with_retry(
                &AgentError::Llm(LlmError::Network("x".into())),
                ErrorContext::new(),
                || async { Err::<(), _>(AgentError::Llm(LlmError::Network("x".into()))) },
            )
            .await;
        assert!(event.resolved);
        assert_eq!(event.chosen_strategy, Some(RecoveryStrategy::GracefulDegradation));
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[tokio::test]
    async fn test_execute_with_recovery_retries_op() {
        let h = fast(3);
        let calls = AtomicUsize::new(0);
        let out = h
            .execute_with_recovery(ErrorContext::new(), || async {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(AgentError::TaskExecution("first".into()))
                } else {
                    Ok("second")
                }
            })
            .await;
        assert_eq!(out.unwrap(), "second");
    }

    #[tokio::test]
    async fn test_history_is_bounded_and_counted() {
        let h = fast(1);
        for _ in 0..8 {
            h.handle_error(&AgentError::Validation("bad".into()), ErrorContext::new())
                .await;
        }
        assert_eq!(h.history().len(), 5);
        let stats = h.error_statistics();
        assert_eq!(stats.total, 5);
        assert_eq!(stats.by_type.get("validation_error"), Some(&5));
        assert_eq!(stats.by_strategy.get("skip_task"), Some(&5));
        assert!((stats.resolution_rate - 1.0).abs() < f64::EPSILON);
    }
}
