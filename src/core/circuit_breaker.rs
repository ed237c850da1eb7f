//! 熔断器：保护单个高风险调用点（某个智能体、某个 LLM 提供方）
//!
//! closed：放行，失败计数；失败数达到阈值转 open。
//! open：timeout 内直接拒绝，不调用被包装的操作；超时后下一次调用转 half_open。
//! half_open：仅放行一次试探调用，成功回到 closed 并清零计数，失败回到 open。

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CircuitBreakerError<E> {
    /// 熔断中，调用被拒绝
    #[error("circuit '{0}' is open")]
    Open(String),
    /// 被包装操作本身的错误
    #[error(transparent)]
    Inner(E),
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    last_failure_time: Option<Instant>,
    trial_in_flight: bool,
}

/// 对外可见的熔断器快照
#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub failure_threshold: u32,
    pub timeout_ms: u64,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    timeout: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, failure_threshold: u32, timeout: Duration) -> Self {
        Self {
            name: name.into(),
            failure_threshold: failure_threshold.max(1),
            timeout,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure_time: None,
                trial_in_flight: false,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn timeout_elapsed(&self, inner: &BreakerInner) -> bool {
        inner
            .last_failure_time
            .map(|t| t.elapsed() >= self.timeout)
            .unwrap_or(true)
    }

    /// 当前状态；open 超过 timeout 后报告为 half_open
    pub fn state(&self) -> CircuitState {
        let inner = self.lock();
        match inner.state {
            CircuitState::Open if self.timeout_elapsed(&inner) => CircuitState::HalfOpen,
            s => s,
        }
    }

    pub fn failure_count(&self) -> u32 {
        self.lock().failure_count
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        CircuitSnapshot {
            name: self.name.clone(),
            state: self.state(),
            failure_count: self.failure_count(),
            failure_threshold: self.failure_threshold,
            timeout_ms: self.timeout.as_millis() as u64,
        }
    }

    /// 判断本次调用是否放行；放行 half_open 试探时占住试探名额
    fn try_acquire(&self) -> Admission {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => Admission::Normal,
            CircuitState::Open => {
                if self.timeout_elapsed(&inner) {
                    tracing::info!(circuit = %self.name, "circuit half-open, allowing trial call");
                    inner.state = CircuitState::HalfOpen;
                    inner.trial_in_flight = true;
                    Admission::Trial
                } else {
                    Admission::Rejected
                }
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    Admission::Rejected
                } else {
                    inner.trial_in_flight = true;
                    Admission::Trial
                }
            }
        }
    }

    /// 试探调用未完成就被取消：归还名额，下一次调用可重新试探
    fn release_trial(&self) {
        let mut inner = self.lock();
        if inner.state == CircuitState::HalfOpen && inner.trial_in_flight {
            tracing::debug!(circuit = %self.name, "trial call cancelled, slot released");
            inner.trial_in_flight = false;
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        if inner.state != CircuitState::Closed {
            tracing::info!(circuit = %self.name, "circuit closed");
        }
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.trial_in_flight = false;
    }

    pub fn record_failure(&self) {
        let mut inner = self.lock();
        inner.failure_count = inner.failure_count.saturating_add(1);
        inner.last_failure_time = Some(Instant::now());
        inner.trial_in_flight = false;
        let reopen = inner.state == CircuitState::HalfOpen;
        if reopen || inner.failure_count >= self.failure_threshold {
            if inner.state != CircuitState::Open {
                tracing::warn!(
                    circuit = %self.name,
                    failures = inner.failure_count,
                    "circuit opened"
                );
            }
            inner.state = CircuitState::Open;
        }
    }

    /// 经熔断器执行一次操作
    pub async fn call<F, Fut, T, E>(&self, op: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut guard = match self.try_acquire() {
            Admission::Rejected => return Err(CircuitBreakerError::Open(self.name.clone())),
            Admission::Normal => TrialGuard::disarmed(self),
            Admission::Trial => TrialGuard::armed(self),
        };
        let result = op().await;
        guard.disarm();
        match result {
            Ok(v) => {
                self.record_success();
                Ok(v)
            }
            Err(e) => {
                self.record_failure();
                Err(CircuitBreakerError::Inner(e))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Rejected,
    Normal,
    Trial,
}

/// 持有 half_open 试探名额；future 在完成前被丢弃时于 Drop 中归还
struct TrialGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl<'a> TrialGuard<'a> {
    fn armed(breaker: &'a CircuitBreaker) -> Self {
        Self {
            breaker,
            armed: true,
        }
    }

    fn disarmed(breaker: &'a CircuitBreaker) -> Self {
        Self {
            breaker,
            armed: false,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.release_trial();
        }
    }
}

/// 按名称管理的熔断器集合（每个调用点一个）
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    failure_threshold: u32,
    timeout: Duration,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    pub fn new(failure_threshold: u32, timeout: Duration) -> Self {
        Self {
            failure_threshold,
            timeout,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, name: &str) -> Arc<CircuitBreaker> {
        let mut map = self.breakers.lock().unwrap_or_else(PoisonError::into_inner);
        map.entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(name, self.failure_threshold, self.timeout))
            })
            .clone()
    }

    pub fn remove(&self, name: &str) {
        self.breakers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
    }

    pub fn snapshots(&self) -> Vec<CircuitSnapshot> {
        let map = self.breakers.lock().unwrap_or_else(PoisonError::into_inner);
        let mut out: Vec<_> = map.values().map(|b| b.snapshot()).collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn fail(b: &CircuitBreaker) {
        let r: Result<(), CircuitBreakerError<&str>> = b.call(|| async { Err("boom") }).await;
        assert!(r.is_err());
    }

    #[tokio::test]
    async fn test_opens_after_threshold() {
        let b = CircuitBreaker::new("llm", 3, Duration::from_secs(60));
        fail(&b).await;
        fail(&b).await;
        assert_eq!(b.state(), CircuitState::Closed);
        fail(&b).await;
        assert_eq!(b.state(), CircuitState::Open);
        assert_eq!(b.failure_count(), 3);
    }

    #[tokio::test]
    async fn test_open_rejects_without_invoking() {
        let b = CircuitBreaker::new("llm", 1, Duration::from_secs(60));
        fail(&b).await;
        let calls = AtomicUsize::new(0);
        let r: Result<u8, CircuitBreakerError<&str>> = b
            .call(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(1)
            })
            .await;
        assert!(matches!(r, Err(CircuitBreakerError::Open(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_half_open_success_closes() {
        let b = CircuitBreaker::new("agent", 2, Duration::from_millis(30));
        fail(&b).await;
        fail(&b).await;
        assert_eq!(b.state(), CircuitState::Open);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(b.state(), CircuitState::HalfOpen);
        let r: Result<&str, CircuitBreakerError<&str>> = b.call(|| async { Ok("fine") }).await;
        assert_eq!(r.unwrap(), "fine");
        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(b.failure_count(), 0);
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens() {
        let b = CircuitBreaker::new("agent", 1, Duration::from_millis(20));
        fail(&b).await;
        tokio::time::sleep(Duration::from_millis(40)).await;
        fail(&b).await;
        assert_eq!(b.state(), CircuitState::Open);
    }

    #[test]
    fn test_half_open_allows_single_trial() {
        let b = CircuitBreaker::new("agent", 1, Duration::from_millis(0));
        b.record_failure();
        assert_eq!(b.try_acquire(), Admission::Trial);
        assert_eq!(b.try_acquire(), Admission::Rejected);
        b.record_success();
        assert_eq!(b.try_acquire(), Admission::Normal);
    }

    #[tokio::test]
    async fn test_cancelled_trial_releases_slot() {
        let b = CircuitBreaker::new("p", 1, Duration::from_millis(20));
        fail(&b).await;
        tokio::time::sleep(Duration::from_millis(40)).await;
        let cancelled = tokio::time::timeout(
            Duration::from_millis(5),
            b.call(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, &str>(())
            }),
        )
        .await;
        assert!(cancelled.is_err());
        assert_eq!(b.state(), CircuitState::HalfOpen);

        let r: Result<&str, CircuitBreakerError<&str>> = b.call(|| async { Ok("back") }).await;
        assert_eq!(r.unwrap(), "back");
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[test]
    fn test_registry_reuses_breakers() {
        let reg = CircuitBreakerRegistry::new(2, Duration::from_secs(1));
        let a = reg.get("a");
        a.record_failure();
        assert_eq!(reg.get("a").failure_count(), 1);
        assert_eq!(reg.snapshots().len(), 1);
        reg.remove("a");
        assert_eq!(reg.get("a").failure_count(), 0);
    }
}
