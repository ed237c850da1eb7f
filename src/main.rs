//! Beehive 演示入口
//!
//! 用 Mock LLM 组装三个智能体（协调者 / 研究员 / 评审），按指定策略协作一次，
//! 输出协作结果与性能摘要（JSON）。
//!
//! 用法：beehive [sequential|parallel|hierarchical] [任务...]

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use beehive::{
    agent::{Agent, AgentConfig, ChatAgent},
    config::load_config,
    core::{AgentOrchestrator, CollaborationStrategy},
    llm::{LlmClient, MockLlmClient},
    observability,
    react::{ReActAgent, ReasoningLoop},
    tools::{EchoTool, ToolExecutor, ToolRegistry},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let cfg = load_config(None).context("Failed to load config")?;

    let mut args = std::env::args().skip(1);
    let strategy: CollaborationStrategy = args
        .next()
        .unwrap_or_else(|| "hierarchical".to_string())
        .parse()
        .context("Invalid strategy")?;
    let task = {
        let rest: Vec<String> = args.collect();
        if rest.is_empty() {
            "分析区块链的优缺点并给出结论".to_string()
        } else {
            rest.join(" ")
        }
    };

    let orchestrator = AgentOrchestrator::from_config(&cfg);
    let monitor_handle = orchestrator.monitor().start();

    let llm: Arc<dyn LlmClient> = Arc::new(MockLlmClient);
    let mut registry = ToolRegistry::new();
    registry.register(EchoTool);
    tracing::info!(tools = ?registry.tool_names(), "tools registered");
    let tools = ToolExecutor::with_timeout_secs(Arc::new(registry), cfg.tools.tool_timeout_secs);

    let coordinator = ChatAgent::new(
        AgentConfig::from_defaults(&cfg.agent, "coordinator", "coordinator")
            .with_capability("planning"),
        llm.clone(),
    );
    let reasoning = || {
        ReasoningLoop::from_config(llm.clone(), &cfg.react)
            .with_tools(tools.clone())
            .with_error_handler(orchestrator.error_handler().clone())
            .with_monitor(orchestrator.monitor().clone())
    };
    let researcher = ReActAgent::new(
        AgentConfig::from_defaults(&cfg.agent, "researcher", "researcher")
            .with_capability("research")
            .with_tool("echo"),
        reasoning(),
    );
    let reviewer = ReActAgent::new(
        AgentConfig::from_defaults(&cfg.agent, "reviewer", "reviewer").with_capability("review"),
        reasoning(),
    );

    let agents: Vec<Arc<dyn Agent>> = vec![
        Arc::new(coordinator),
        Arc::new(researcher),
        Arc::new(reviewer),
    ];
    let mut ids = Vec::with_capacity(agents.len());
    for agent in agents {
        ids.push(orchestrator.register_agent(agent)?);
    }

    tracing::info!(strategy = %strategy, task = %task, "running collaboration");
    let response = orchestrator
        .collaborate_agents(&ids, &task, strategy, Some("demo"))
        .await;
    println!("{}", serde_json::to_string_pretty(&response)?);

    let summary = orchestrator
        .monitor()
        .get_performance_summary(Duration::from_secs(3600));
    println!("{}", serde_json::to_string_pretty(&summary)?);

    tracing::info!(sessions = ?orchestrator.list_sessions(), "sessions retained");
    monitor_handle.stop().await;
    Ok(())
}
