//! 性能监控：计数器 / 仪表 / 计时器 / 直方图写入有界序列，按时间窗口汇总
//!
//! start() 启动后台采样任务：定期采样系统资源写入滚动窗口与 system.* 仪表，然后评估告警规则。
//! 所有写入都是短临界区；监控本身不向调用方返回错误。

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::MonitorSection;
use crate::observability::{Alert, AlertHandler, AlertOperator, AlertRule, SystemSample, SystemSampler};

pub type Tags = BTreeMap<String, String>;

pub fn tags<const N: usize>(pairs: [(&str, &str); N]) -> Tags {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Counter,
    Gauge,
    Timer,
    Histogram,
}

#[derive(Debug, Clone)]
struct MetricPoint {
    at: Instant,
    value: f64,
    tags: Option<Tags>,
}

#[derive(Debug)]
struct Series {
    kind: MetricKind,
    points: VecDeque<MetricPoint>,
    /// 计数器累计值（不受序列截断影响）
    total: f64,
}

/// 单个指标在窗口内的汇总
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricSummary {
    pub kind: MetricKind,
    pub count: usize,
    pub sum: f64,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    /// 每秒速率：计数器为 sum / 窗口秒数，其余为点数 / 窗口秒数
    pub rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemSummary {
    pub samples: usize,
    pub cpu_mean: f64,
    pub cpu_max: f64,
    pub memory_mean: f64,
    pub memory_max: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PerformanceSummary {
    pub window_secs: f64,
    pub generated_at: DateTime<Utc>,
    pub metrics: BTreeMap<String, MetricSummary>,
    pub system: Option<SystemSummary>,
    pub alerts_triggered: usize,
}

/// 单个智能体的累计表现
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AgentPerformance {
    pub calls: u64,
    pub successes: u64,
    pub failures: u64,
    pub total_response_ms: f64,
}

impl AgentPerformance {
    pub fn success_rate(&self) -> f64 {
        if self.calls == 0 {
            0.0
        } else {
            self.successes as f64 / self.calls as f64
        }
    }

    pub fn avg_response_ms(&self) -> f64 {
        if self.calls == 0 {
            0.0
        } else {
            self.total_response_ms / self.calls as f64
        }
    }
}

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub sample_interval: Duration,
    pub max_series_points: usize,
    pub system_window: usize,
    pub alert_cooldown: Duration,
    pub max_alert_history: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self::from(&MonitorSection::default())
    }
}

impl From<&MonitorSection> for MonitorConfig {
    fn from(s: &MonitorSection) -> Self {
        Self {
            sample_interval: Duration::from_secs(s.sample_interval_secs.max(1)),
            max_series_points: s.max_series_points.max(1),
            system_window: s.system_window.max(1),
            alert_cooldown: Duration::from_secs(s.alert_cooldown_secs),
            max_alert_history: 100,
        }
    }
}

#[derive(Debug, Clone)]
struct SystemPoint {
    at: Instant,
    sample: SystemSample,
}

#[derive(Default)]
struct AlertState {
    rules: Vec<AlertRule>,
    history: VecDeque<(Instant, Alert)>,
}

pub struct PerformanceMonitor {
    config: MonitorConfig,
    series: Mutex<HashMap<String, Series>>,
    system: Mutex<VecDeque<SystemPoint>>,
    agents: Mutex<HashMap<String, AgentPerformance>>,
    alerts: Mutex<AlertState>,
    handlers: RwLock<Vec<AlertHandler>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl PerformanceMonitor {
    pub fn new(config: MonitorConfig) -> Self {
        Self {
            config,
            series: Mutex::new(HashMap::new()),
            system: Mutex::new(VecDeque::new()),
            agents: Mutex::new(HashMap::new()),
            alerts: Mutex::new(AlertState::default()),
            handlers: RwLock::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    fn push(&self, name: &str, kind: MetricKind, value: f64, tags: Option<Tags>) {
        let mut series = lock(&self.series);
        let s = series.entry(name.to_string()).or_insert_with(|| Series {
            kind,
            points: VecDeque::new(),
            total: 0.0,
        });
        if s.kind != kind {
            tracing::warn!(metric = name, existing = ?s.kind, requested = ?kind, "metric kind mismatch, ignored");
            return;
        }
        if kind == MetricKind::Counter {
            s.total += value;
        }
        s.points.push_back(MetricPoint {
            at: Instant::now(),
            value,
            tags,
        });
        while s.points.len() > self.config.max_series_points {
            s.points.pop_front();
        }
    }

    pub fn increment_counter(&self, name: &str, value: f64, tags: Option<Tags>) {
        self.push(name, MetricKind::Counter, value, tags);
    }

    pub fn set_gauge(&self, name: &str, value: f64, tags: Option<Tags>) {
        self.push(name, MetricKind::Gauge, value, tags);
    }

    /// 计时器以毫秒记录
    pub fn record_timer(&self, name: &str, duration: Duration, tags: Option<Tags>) {
        self.push(name, MetricKind::Timer, duration.as_secs_f64() * 1000.0, tags);
    }

    pub fn record_histogram(&self, name: &str, value: f64, tags: Option<Tags>) {
        self.push(name, MetricKind::Histogram, value, tags);
    }

    pub fn counter_total(&self, name: &str) -> Option<f64> {
        lock(&self.series)
            .get(name)
            .filter(|s| s.kind == MetricKind::Counter)
            .map(|s| s.total)
    }

    /// 告警取值：计数器取累计值，其余取最新点
    pub fn current_value(&self, name: &str) -> Option<f64> {
        let series = lock(&self.series);
        let s = series.get(name)?;
        match s.kind {
            MetricKind::Counter => Some(s.total),
            _ => s.points.back().map(|p| p.value),
        }
    }

    pub fn record_agent_performance(&self, agent_id: &str, duration: Duration, success: bool) {
        let outcome = if success { "success" } else { "failure" };
        self.record_timer("agent.response_time", duration, Some(tags([("agent_id", agent_id)])));
        self.increment_counter(
            "agent.calls",
            1.0,
            Some(tags([("agent_id", agent_id), ("outcome", outcome)])),
        );
        if !success {
            self.increment_counter("agent.errors", 1.0, Some(tags([("agent_id", agent_id)])));
        }

        let mut agents = lock(&self.agents);
        let perf = agents.entry(agent_id.to_string()).or_default();
        perf.calls += 1;
        if success {
            perf.successes += 1;
        } else {
            perf.failures += 1;
        }
        perf.total_response_ms += duration.as_secs_f64() * 1000.0;
    }

    pub fn agent_performance(&self, agent_id: &str) -> Option<AgentPerformance> {
        lock(&self.agents).get(agent_id).cloned()
    }

    pub fn record_task_execution(&self, task_type: &str, duration: Duration, success: bool) {
        let outcome = if success { "success" } else { "failure" };
        self.record_timer("task.duration", duration, Some(tags([("task_type", task_type)])));
        self.increment_counter(
            "task.executions",
            1.0,
            Some(tags([("task_type", task_type), ("outcome", outcome)])),
        );
        if !success {
            self.increment_counter("task.failures", 1.0, Some(tags([("task_type", task_type)])));
        }
    }

    /// 写入一次系统采样：进入滚动窗口，并更新 system.* 仪表
    pub fn record_system_sample(&self, sample: SystemSample) {
        self.set_gauge("system.cpu_percent", sample.cpu_percent, None);
        self.set_gauge("system.memory_percent", sample.memory_percent, None);
        if let Some(mb) = sample.process_memory_mb {
            self.set_gauge("process.memory_mb", mb, None);
        }
        let mut window = lock(&self.system);
        window.push_back(SystemPoint {
            at: Instant::now(),
            sample,
        });
        while window.len() > self.config.system_window {
            window.pop_front();
        }
    }

    pub fn system_samples(&self) -> Vec<SystemSample> {
        lock(&self.system).iter().map(|p| p.sample.clone()).collect()
    }

    /// 新增或更新告警规则（同一 metric + operator 只保留一条）
    pub fn set_alert_threshold(&self, metric: &str, operator: AlertOperator, threshold: f64) {
        let mut state = lock(&self.alerts);
        match state
            .rules
            .iter_mut()
            .find(|r| r.metric == metric && r.operator == operator)
        {
            Some(rule) => rule.update_threshold(threshold),
            None => state.rules.push(AlertRule::new(
                metric,
                operator,
                threshold,
                self.config.alert_cooldown,
            )),
        }
    }

    pub fn remove_alert_threshold(&self, metric: &str, operator: AlertOperator) -> bool {
        let mut state = lock(&self.alerts);
        let before = state.rules.len();
        state
            .rules
            .retain(|r| !(r.metric == metric && r.operator == operator));
        state.rules.len() != before
    }

    pub fn add_alert_handler(&self, handler: AlertHandler) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handler);
    }

    pub fn evaluate_alerts(&self) -> Vec<Alert> {
        self.evaluate_alerts_at(Instant::now())
    }

    /// 以给定时刻评估所有规则；没有数据的指标跳过
    pub fn evaluate_alerts_at(&self, now: Instant) -> Vec<Alert> {
        let metrics: Vec<String> = lock(&self.alerts)
            .rules
            .iter()
            .map(|r| r.metric.clone())
            .collect();
        let values: HashMap<String, f64> = metrics
            .into_iter()
            .filter_map(|m| self.current_value(&m).map(|v| (m, v)))
            .collect();

        let fired: Vec<Alert> = {
            let mut state = lock(&self.alerts);
            let mut fired = Vec::new();
            for rule in state.rules.iter_mut() {
                if let Some(&value) = values.get(&rule.metric) {
                    if rule.check(value, now) {
                        fired.push(Alert::from_rule(rule, value));
                    }
                }
            }
            for alert in &fired {
                state.history.push_back((now, alert.clone()));
            }
            while state.history.len() > self.config.max_alert_history {
                state.history.pop_front();
            }
            fired
        };

        if !fired.is_empty() {
            let handlers = self
                .handlers
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            for alert in &fired {
                tracing::warn!(metric = %alert.metric, value = alert.value, threshold = alert.threshold, "alert triggered");
                for h in &handlers {
                    h(alert);
                }
            }
        }
        fired
    }

    pub fn alert_history(&self) -> Vec<Alert> {
        lock(&self.alerts)
            .history
            .iter()
            .map(|(_, a)| a.clone())
            .collect()
    }

    /// 单个指标的窗口汇总；filter 为 (tag, value) 时只统计带该标签的点
    pub fn get_metric_summary(
        &self,
        name: &str,
        window: Duration,
        filter: Option<(&str, &str)>,
    ) -> Option<MetricSummary> {
        let cutoff = Instant::now().checked_sub(window);
        let series = lock(&self.series);
        let s = series.get(name)?;
        let values: Vec<f64> = s
            .points
            .iter()
            .filter(|p| cutoff.map_or(true, |c| p.at >= c))
            .filter(|p| match filter {
                Some((k, v)) => p
                    .tags
                    .as_ref()
                    .and_then(|t| t.get(k))
                    .is_some_and(|tv| tv == v),
                None => true,
            })
            .map(|p| p.value)
            .collect();
        summarize(s.kind, &values, window.as_secs_f64())
    }

    pub fn get_performance_summary(&self, window: Duration) -> PerformanceSummary {
        let now = Instant::now();
        let cutoff = now.checked_sub(window);
        let in_window = |at: Instant| cutoff.map_or(true, |c| at >= c);
        let window_secs = window.as_secs_f64();

        let metrics = lock(&self.series)
            .iter()
            .filter_map(|(name, s)| {
                let values: Vec<f64> = s
                    .points
                    .iter()
                    .filter(|p| in_window(p.at))
                    .map(|p| p.value)
                    .collect();
                summarize(s.kind, &values, window_secs).map(|m| (name.clone(), m))
            })
            .collect();

        let system = {
            let window = lock(&self.system);
            let samples: Vec<&SystemSample> = window
                .iter()
                .filter(|p| in_window(p.at))
                .map(|p| &p.sample)
                .collect();
            (!samples.is_empty()).then(|| {
                let n = samples.len() as f64;
                SystemSummary {
                    samples: samples.len(),
                    cpu_mean: samples.iter().map(|s| s.cpu_percent).sum::<f64>() / n,
                    cpu_max: samples.iter().map(|s| s.cpu_percent).fold(f64::MIN, f64::max),
                    memory_mean: samples.iter().map(|s| s.memory_percent).sum::<f64>() / n,
                    memory_max: samples
                        .iter()
                        .map(|s| s.memory_percent)
                        .fold(f64::MIN, f64::max),
                }
            })
        };

        let alerts_triggered = lock(&self.alerts)
            .history
            .iter()
            .filter(|(at, _)| in_window(*at))
            .count();

        PerformanceSummary {
            window_secs,
            generated_at: Utc::now(),
            metrics,
            system,
            alerts_triggered,
        }
    }

    /// 启动后台采样；返回的句柄用于停止
    pub fn start(self: &Arc<Self>) -> MonitorHandle {
        let token = CancellationToken::new();
        let monitor = Arc::clone(self);
        let child = token.clone();
        let join = tokio::spawn(async move {
            let mut sampler = SystemSampler::new();
            let mut interval = tokio::time::interval(monitor.config.sample_interval);
            tracing::info!(interval_secs = monitor.config.sample_interval.as_secs(), "performance monitor started");
            loop {
                tokio::select! {
                    _ = child.cancelled() => break,
                    _ = interval.tick() => {
                        monitor.record_system_sample(sampler.sample());
                        monitor.evaluate_alerts();
                    }
                }
            }
            tracing::info!("performance monitor stopped");
        });
        MonitorHandle { token, join }
    }
}

impl Default for PerformanceMonitor {
    fn default() -> Self {
        Self::new(MonitorConfig::default())
    }
}

fn summarize(kind: MetricKind, values: &[f64], window_secs: f64) -> Option<MetricSummary> {
    if values.is_empty() {
        return None;
    }
    let sum: f64 = values.iter().sum();
    let count = values.len();
    let per_window = if kind == MetricKind::Counter { sum } else { count as f64 };
    Some(MetricSummary {
        kind,
        count,
        sum,
        mean: sum / count as f64,
        min: values.iter().copied().fold(f64::INFINITY, f64::min),
        max: values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        rate: if window_secs > 0.0 { per_window / window_secs } else { 0.0 },
    })
}

/// 后台采样任务句柄
pub struct MonitorHandle {
    token: CancellationToken,
    join: JoinHandle<()>,
}

impl MonitorHandle {
    pub fn cancel_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// 停止采样并等待任务退出
    pub async fn stop(self) {
        self.token.cancel();
        if let Err(e) = self.join.await {
            tracing::warn!(error = %e, "monitor task join failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn small() -> PerformanceMonitor {
        PerformanceMonitor::new(MonitorConfig {
            max_series_points: 3,
            ..Default::default()
        })
    }

    #[test]
    fn test_series_are_bounded_but_counter_total_is_kept() {
        let m = small();
        for _ in 0..5 {
            m.increment_counter("requests", 2.0, None);
        }
        assert_eq!(m.counter_total("requests"), Some(10.0));
        let summary = m.get_performance_summary(Duration::from_secs(60));
        assert_eq!(summary.metrics["requests"].count, 3);
        assert_eq!(summary.metrics["requests"].sum, 6.0);
    }

    #[test]
    fn test_summary_mean_min_max() {
        let m = PerformanceMonitor::default();
        m.record_timer("latency", Duration::from_millis(10), None);
        m.record_timer("latency", Duration::from_millis(30), None);
        m.record_histogram("score", 0.5, Some(tags([("agent_id", "a")])));
        let s = m.get_performance_summary(Duration::from_secs(10));
        let latency = &s.metrics["latency"];
        assert_eq!(latency.kind, MetricKind::Timer);
        assert!((latency.mean - 20.0).abs() < 1e-6);
        assert!((latency.min - 10.0).abs() < 1e-6);
        assert!((latency.max - 30.0).abs() < 1e-6);
        assert!((latency.rate - 0.2).abs() < 1e-6);
        assert_eq!(s.metrics["score"].count, 1);
    }

    #[test]
    fn test_agent_and_task_recording() {
        let m = PerformanceMonitor::default();
        m.record_agent_performance("a1", Duration::from_millis(100), true);
        m.record_agent_performance("a1", Duration::from_millis(300), false);
        m.record_task_execution("sequential", Duration::from_millis(50), true);
        let perf = m.agent_performance("a1").unwrap();
        assert_eq!(perf.calls, 2);
        assert!((perf.success_rate() - 0.5).abs() < 1e-9);
        assert!((perf.avg_response_ms() - 200.0).abs() < 1e-6);
        assert_eq!(m.counter_total("agent.errors"), Some(1.0));
        assert_eq!(m.counter_total("task.executions"), Some(1.0));
        let failures = m
            .get_metric_summary("agent.calls", Duration::from_secs(60), Some(("outcome", "failure")))
            .unwrap();
        assert_eq!(failures.count, 1);
        assert!(m
            .get_metric_summary("agent.calls", Duration::from_secs(60), Some(("agent_id", "zz")))
            .is_none());
    }

    #[test]
    fn test_alert_fires_once_per_cooldown() {
        let m = PerformanceMonitor::default();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        m.add_alert_handler(Arc::new(move |_alert: &Alert| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        m.set_alert_threshold("system.cpu_percent", AlertOperator::Gt, 80.0);
        m.set_gauge("system.cpu_percent", 95.0, None);

        let t0 = Instant::now();
        assert_eq!(m.evaluate_alerts_at(t0).len(), 1);
        assert!(m.evaluate_alerts_at(t0 + Duration::from_secs(59)).is_empty());
        assert_eq!(m.evaluate_alerts_at(t0 + Duration::from_secs(60)).len(), 1);
        assert_eq!(fired.load(Ordering::SeqCst), 2);
        assert_eq!(m.alert_history().len(), 2);
    }

    #[test]
    fn test_set_alert_threshold_updates_existing_rule() {
        let m = PerformanceMonitor::default();
        m.set_alert_threshold("agent.errors", AlertOperator::Ge, 10.0);
        m.set_alert_threshold("agent.errors", AlertOperator::Ge, 1.0);
        m.increment_counter("agent.errors", 1.0, None);
        let alerts = m.evaluate_alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].threshold, 1.0);
        assert!(m.remove_alert_threshold("agent.errors", AlertOperator::Ge));
    }

    #[tokio::test]
    async fn test_background_sampler_can_be_stopped() {
        let m = Arc::new(PerformanceMonitor::default());
        let handle = m.start();
        // interval 的第一次 tick 立即触发
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.stop().await;
        assert_eq!(m.system_samples().len(), 1);
        assert!(m.current_value("system.memory_percent").is_some());
    }
}
