//! 置信度评分：对可用信号取平均，缺失的信号不参与平均
//!
//! 信号：(a) 迭代次数分段得分；(b) 未用工具或自报置信度 > 0.7 的步骤占比；
//! (c) 子步骤完成率 min(iterations, substeps) / substeps；(d) 最近一轮自报置信度。

use crate::react::ReasoningRecord;

const HIGH_STEP_CONFIDENCE: f64 = 0.7;

/// 迭代次数分段得分：2~3 轮最优，一轮直接作答次之，之后逐段下降
pub fn iteration_score(iterations: usize) -> f64 {
    match iterations {
        0 => 0.0,
        1 => 0.8,
        2..=3 => 0.9,
        4..=5 => 0.7,
        6..=8 => 0.5,
        _ => 0.3,
    }
}

pub fn compute_confidence(records: &[ReasoningRecord], substep_count: usize) -> f64 {
    if records.is_empty() {
        return 0.0;
    }
    let iterations = records.len();
    let mut signals = vec![iteration_score(iterations)];

    let good_steps = records
        .iter()
        .filter(|r| !r.used_tool || r.confidence.is_some_and(|c| c > HIGH_STEP_CONFIDENCE))
        .count();
    signals.push(good_steps as f64 / iterations as f64);

    if substep_count > 0 {
        signals.push(iterations.min(substep_count) as f64 / substep_count as f64);
    }

    if let Some(last) = records.last().and_then(|r| r.confidence) {
        signals.push(last);
    }

    let mean = signals.iter().sum::<f64>() / signals.len() as f64;
    if mean.is_finite() {
        mean.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(iteration: usize, used_tool: bool, confidence: Option<f64>) -> ReasoningRecord {
        ReasoningRecord {
            iteration,
            reasoning_text: String::new(),
            used_tool,
            tool_name: used_tool.then(|| "echo".to_string()),
            confidence,
        }
    }

    #[test]
    fn test_missing_signals_are_omitted() {
        // 只有 (a)=0.8 与 (b)=1.0
        let c = compute_confidence(&[record(1, false, None)], 0);
        assert!((c - 0.9).abs() < 1e-9);
    }

    #[test]
    fn test_all_four_signals() {
        let records = [record(1, true, Some(0.5)), record(2, false, Some(0.9))];
        // (a)=0.9 (b)=0.5 (c)=2/4 (d)=0.9
        let c = compute_confidence(&records, 4);
        assert!((c - (0.9 + 0.5 + 0.5 + 0.9) / 4.0).abs() < 1e-9);
    }

    #[test]
    fn test_confidence_stays_in_range() {
        for n in 0..15 {
            let records: Vec<_> = (1..=n).map(|i| record(i, i % 2 == 0, Some(1.0))).collect();
            for substeps in 0..5 {
                let c = compute_confidence(&records, substeps);
                assert!((0.0..=1.0).contains(&c));
            }
        }
    }
}
