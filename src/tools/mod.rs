//! 工具层：Tool trait、注册表（ToolInvoker 实现）与带超时的执行器

pub mod echo;
pub mod executor;
pub mod registry;

pub use echo::EchoTool;
pub use executor::ToolExecutor;
pub use registry::{Tool, ToolInvoker, ToolOutput, ToolRegistry};
