//! 多提供方故障转移客户端
//!
//! 按注册顺序持有多个 LlmClient，每个提供方一个熔断器。chat 从当前活跃提供方开始，
//! 跳过熔断中的提供方，失败则顺延到下一个；全部不可用时返回最后一个错误。
//! 同时实现 RecoveryPolicy，作为 fallback_provider 策略的执行者（切换活跃提供方）。

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::core::{CircuitBreaker, CircuitBreakerError, CircuitState, ErrorEvent, RecoveryPolicy};
use crate::llm::{ChatMessage, ChatOptions, ChatResponse, LlmClient, LlmError};

struct Provider {
    name: String,
    client: Arc<dyn LlmClient>,
    breaker: Arc<CircuitBreaker>,
}

pub struct FailoverLlmClient {
    providers: Vec<Provider>,
    active: AtomicUsize,
    failure_threshold: u32,
    timeout: Duration,
}

impl FailoverLlmClient {
    pub fn new(failure_threshold: u32, timeout: Duration) -> Self {
        Self {
            providers: Vec::new(),
            active: AtomicUsize::new(0),
            failure_threshold,
            timeout,
        }
    }

    pub fn with_provider(mut self, name: impl Into<String>, client: Arc<dyn LlmClient>) -> Self {
        let name = name.into();
        let breaker = Arc::new(CircuitBreaker::new(
            format!("llm:{name}"),
            self.failure_threshold,
            self.timeout,
        ));
        self.providers.push(Provider {
            name,
            client,
            breaker,
        });
        self
    }

    pub fn active_provider(&self) -> Option<&str> {
        self.providers
            .get(self.active.load(Ordering::SeqCst))
            .map(|p| p.name.as_str())
    }

    pub fn provider_state(&self, name: &str) -> Option<CircuitState> {
        self.providers
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.breaker.state())
    }

    /// 切换到下一个未熔断的提供方；没有可切换的返回 false
    pub fn switch_to_next(&self) -> bool {
        let n = self.providers.len();
        if n < 2 {
            return false;
        }
        let current = self.active.load(Ordering::SeqCst);
        for offset in 1..n {
            let idx = (current + offset) % n;
            if self.providers[idx].breaker.state() != CircuitState::Open {
                self.active.store(idx, Ordering::SeqCst);
                tracing::info!(
                    from = %self.providers[current].name,
                    to = %self.providers[idx].name,
                    "llm provider switched"
                );
                return true;
            }
        }
        false
    }
}

#[async_trait]
impl LlmClient for FailoverLlmClient {
    async fn chat(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> Result<ChatResponse, LlmError> {
        let n = self.providers.len();
        let start = self.active.load(Ordering::SeqCst);
        let mut last_err = LlmError::NoProvider;
        for offset in 0..n {
            let idx = (start + offset) % n;
            let p = &self.providers[idx];
            match p.breaker.call(|| p.client.chat(messages, options)).await {
                Ok(resp) => {
                    if idx != start {
                        self.active.store(idx, Ordering::SeqCst);
                    }
                    return Ok(resp);
                }
                Err(CircuitBreakerError::Open(_)) => {
                    tracing::debug!(provider = %p.name, "provider circuit open, skipped");
                }
                Err(CircuitBreakerError::Inner(e)) => {
                    tracing::warn!(provider = %p.name, error = %e, "provider call failed");
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    fn provider_name(&self) -> &str {
        self.active_provider().unwrap_or("failover")
    }
}

#[async_trait]
impl RecoveryPolicy for FailoverLlmClient {
    async fn recover(&self, event: &ErrorEvent) -> bool {
        tracing::info!(error_id = %event.id, "falling back to next llm provider");
        self.switch_to_next()
    }
}
