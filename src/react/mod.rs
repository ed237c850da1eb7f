//! ReAct 推理：任务分解、结构化决策解析、推理循环、置信度评分与 ReActAgent

pub mod agent;
pub mod confidence;
pub mod decompose;
pub mod loop_;
pub mod planner;

pub use agent::ReActAgent;
pub use confidence::{compute_confidence, iteration_score};
pub use decompose::{heuristic_split, parse_substeps, DecompositionPolicy};
pub use loop_::{ActionOutcome, ReasoningLoop, ReasoningRecord, ReasoningTrace};
pub use planner::{
    decision_format_hint, parse_decision, ReasoningDecision, ReasoningStep, StructuredDecision,
};
