//! 告警规则：(metric, operator, threshold)，每条规则在冷却期内最多触发一次

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertOperator {
    Gt,
    Ge,
    Lt,
    Le,
    Eq,
}

impl AlertOperator {
    pub fn evaluate(&self, value: f64, threshold: f64) -> bool {
        match self {
            AlertOperator::Gt => value > threshold,
            AlertOperator::Ge => value >= threshold,
            AlertOperator::Lt => value < threshold,
            AlertOperator::Le => value <= threshold,
            AlertOperator::Eq => (value - threshold).abs() < f64::EPSILON,
        }
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            AlertOperator::Gt => ">",
            AlertOperator::Ge => ">=",
            AlertOperator::Lt => "<",
            AlertOperator::Le => "<=",
            AlertOperator::Eq => "==",
        }
    }
}

impl fmt::Display for AlertOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

impl FromStr for AlertOperator {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            ">" | "gt" => Ok(AlertOperator::Gt),
            ">=" | "ge" => Ok(AlertOperator::Ge),
            "<" | "lt" => Ok(AlertOperator::Lt),
            "<=" | "le" => Ok(AlertOperator::Le),
            "==" | "eq" => Ok(AlertOperator::Eq),
            other => Err(format!("unknown alert operator: {other}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AlertRule {
    pub metric: String,
    pub operator: AlertOperator,
    pub threshold: f64,
    cooldown: Duration,
    last_triggered: Option<Instant>,
}

impl AlertRule {
    pub fn new(metric: impl Into<String>, operator: AlertOperator, threshold: f64, cooldown: Duration) -> Self {
        Self {
            metric: metric.into(),
            operator,
            threshold,
            cooldown,
            last_triggered: None,
        }
    }

    pub fn update_threshold(&mut self, threshold: f64) {
        self.threshold = threshold;
    }

    /// 条件成立且不在冷却期内时返回 true，并记下触发时间
    pub fn check(&mut self, value: f64, now: Instant) -> bool {
        if !self.operator.evaluate(value, self.threshold) {
            return false;
        }
        if let Some(last) = self.last_triggered {
            if now.saturating_duration_since(last) < self.cooldown {
                return false;
            }
        }
        self.last_triggered = Some(now);
        true
    }
}

/// 一次触发的告警
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    pub metric: String,
    pub operator: AlertOperator,
    pub threshold: f64,
    pub value: f64,
    pub message: String,
    pub triggered_at: DateTime<Utc>,
}

impl Alert {
    pub fn from_rule(rule: &AlertRule, value: f64) -> Self {
        Self {
            metric: rule.metric.clone(),
            operator: rule.operator,
            threshold: rule.threshold,
            value,
            message: format!(
                "{} = {:.2} {} {}",
                rule.metric, value, rule.operator, rule.threshold
            ),
            triggered_at: Utc::now(),
        }
    }
}

/// 告警回调
pub type AlertHandler = Arc<dyn Fn(&Alert) + Send + Sync>;
