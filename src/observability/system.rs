//! 系统资源采样（CPU / 内存 / 本进程内存）

use chrono::{DateTime, Utc};
use serde::Serialize;
use sysinfo::{CpuRefreshKind, MemoryRefreshKind, Pid, RefreshKind, System};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemSample {
    pub timestamp: DateTime<Utc>,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub memory_used_mb: u64,
    pub memory_total_mb: u64,
    pub process_memory_mb: Option<f64>,
}

/// 持有 sysinfo::System，跨次采样复用（CPU 使用率需要两次刷新之间的差值）
pub struct SystemSampler {
    sys: System,
    pid: Option<Pid>,
}

impl SystemSampler {
    pub fn new() -> Self {
        let mut sys = System::new_with_specifics(
            RefreshKind::new()
                .with_cpu(CpuRefreshKind::everything())
                .with_memory(MemoryRefreshKind::everything()),
        );
        sys.refresh_cpu_usage();
        Self {
            sys,
            pid: sysinfo::get_current_pid().ok(),
        }
    }

    pub fn sample(&mut self) -> SystemSample {
        self.sys.refresh_cpu_usage();
        self.sys.refresh_memory();

        let total = self.sys.total_memory();
        let used = self.sys.used_memory();
        let memory_percent = if total > 0 {
            used as f64 / total as f64 * 100.0
        } else {
            0.0
        };
        let process_memory_mb = self.pid.and_then(|pid| {
            self.sys.refresh_process(pid);
            self.sys
                .process(pid)
                .map(|p| p.memory() as f64 / 1024.0 / 1024.0)
        });

        SystemSample {
            timestamp: Utc::now(),
            cpu_percent: self.sys.global_cpu_info().cpu_usage() as f64,
            memory_percent,
            memory_used_mb: used / 1024 / 1024,
            memory_total_mb: total / 1024 / 1024,
            process_memory_mb,
        }
    }
}

impl Default for SystemSampler {
    fn default() -> Self {
        Self::new()
    }
}
