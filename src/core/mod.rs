//! 核心编排层：错误分类与恢复、熔断器、会话记录、多智能体编排

pub mod circuit_breaker;
pub mod error;
pub mod orchestrator;
pub mod recovery;
pub mod session;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerError, CircuitBreakerRegistry, CircuitSnapshot, CircuitState,
};
pub use error::{AgentError, ErrorType, RecoveryStrategy, Severity};
pub use orchestrator::{
    AgentCallResponse, AgentOrchestrator, CollaborationRecord, CollaborationResponse,
    CollaborationResult, CollaborationStrategy, ParticipantOutcome, ParticipantResult,
};
pub use recovery::{
    ErrorContext, ErrorEvent, ErrorHandler, ErrorStatistics, RecoveryConfig, RecoveryPolicy,
};
pub use session::{SessionHistory, SessionStore};
