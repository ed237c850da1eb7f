//! 可观测性：tracing 初始化、性能监控、告警与系统采样

pub mod alert;
pub mod monitor;
pub mod system;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub use alert::{Alert, AlertHandler, AlertOperator, AlertRule};
pub use monitor::{
    tags, AgentPerformance, MetricKind, MetricSummary, MonitorConfig, MonitorHandle,
    PerformanceMonitor, PerformanceSummary, SystemSummary, Tags,
};
pub use system::{SystemSample, SystemSampler};

/// 初始化全局 tracing：默认 info 级别，RUST_LOG 可覆盖
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .try_init();
}
