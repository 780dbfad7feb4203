use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use agentrt_config::{AgentConfig, AgentMode, Config};
use agentrt_tools::{
    events::{TodoItem, ToolEvent},
    policy::ApprovalPolicy,
    tool::{Tool, ToolCall, ToolOutput},
    DeleteFileTool, EditFileTool, GlobTool, GrepTool, ListDirTool, ReadFileTool,
    ShellTool, TodoWriteTool, ToolRegistry, WriteTool,
};

use crate::agent::Agent;
use crate::events::AgentEvent;
use crate::runtime_context::AgentRuntimeContext;

const MAX_DEPTH: usize = 3;

pub struct TaskTool {
    model: Arc<dyn agentrt_model::ModelProvider>,
    config: Arc<Config>,
    agent_config: Arc<AgentConfig>,
    depth: Arc<AtomicUsize>,
}

impl TaskTool {
    pub fn new(
        model: Arc<dyn agentrt_model::ModelProvider>,
        config: Arc<Config>,
        agent_config: Arc<AgentConfig>,
        depth: Arc<AtomicUsize>,
    ) -> Self {
        Self { model, config, agent_config, depth }
    }

    /// Build a fresh tool registry for a sub-agent, along with the mode lock
    /// and tool-event receiver that must be passed to `Agent::new` alongside
    /// it — these are wired through the same channel/lock so
    /// `TodoWriteTool` updates reach the sub-agent's loop.
    fn build_sub_registry(
        &self,
        mode: AgentMode,
    ) -> (ToolRegistry, Arc<Mutex<AgentMode>>, mpsc::Receiver<ToolEvent>) {
        let todos: Arc<Mutex<Vec<TodoItem>>> = Arc::new(Mutex::new(Vec::new()));
        let mode: Arc<Mutex<AgentMode>> = Arc::new(Mutex::new(mode));
        let (tx, rx) = mpsc::channel::<ToolEvent>(64);

        let mut reg = ToolRegistry::new();
        reg.register(ReadFileTool);
        reg.register(ListDirTool);
        reg.register(GlobTool);
        reg.register(GrepTool);
        reg.register(TodoWriteTool::new(todos, tx.clone()));
        reg.register(WriteTool);
        reg.register(EditFileTool);
        reg.register(DeleteFileTool);
        reg.register(ShellTool { timeout_secs: self.config.tools.timeout_secs });
        // Note: TaskTool is intentionally NOT registered here to limit nesting
        (reg, mode, rx)
    }
}

#[async_trait]
impl Tool for TaskTool {
    fn name(&self) -> &str { "task" }

    fn description(&self) -> &str {
        "Spawn a sub-agent to complete a focused task and return its final text output. \
         Useful for delegating isolated sub-tasks. The sub-agent has access to all standard \
         tools. Maximum nesting depth is 3."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "prompt": {
                    "type": "string",
                    "description": "The task description for the sub-agent"
                },
                "mode": {
                    "type": "string",
                    "enum": ["research", "plan", "agent"],
                    "description": "Operating mode for the sub-agent (default: agent)"
                },
                "max_rounds": {
                    "type": "integer",
                    "description": "Maximum tool-call rounds (default: from config)"
                }
            },
            "required": ["prompt"]
        })
    }

    fn default_policy(&self) -> ApprovalPolicy { ApprovalPolicy::Ask }

    fn modes(&self) -> &[AgentMode] { &[AgentMode::Agent] }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let prompt = match call.args.get("prompt").and_then(|v| v.as_str()) {
            Some(p) => p.to_string(),
            None => return ToolOutput::err(&call.id, "missing 'prompt'"),
        };
        let mode_str = call.args.get("mode").and_then(|v| v.as_str()).unwrap_or("agent");
        let mode = match mode_str {
            "research" => AgentMode::Research,
            "plan" => AgentMode::Plan,
            "agent" => AgentMode::Agent,
            other => return ToolOutput::err(&call.id, format!("unknown mode: {other}")),
        };

        let current_depth = self.depth.load(Ordering::Relaxed);
        if current_depth >= MAX_DEPTH {
            return ToolOutput::err(
                &call.id,
                format!("maximum sub-agent depth ({MAX_DEPTH}) reached"),
            );
        }

        self.depth.fetch_add(1, Ordering::Relaxed);
        debug!(prompt = %prompt, mode = %mode, depth = current_depth + 1, "task: spawning sub-agent");

        let mut sub_config = (*self.agent_config).clone();
        if let Some(max_rounds) = call.args.get("max_rounds").and_then(|v| v.as_u64()) {
            sub_config.max_tool_rounds = max_rounds as u32;
        }

        let (registry, mode_lock, tool_event_rx) = self.build_sub_registry(mode);
        let tools = Arc::new(registry);
        let max_context_tokens = self.model.catalog_context_window().unwrap_or(128_000) as usize;

        let mut agent = Agent::new(
            self.model.clone(),
            tools,
            Arc::new(sub_config),
            AgentRuntimeContext::default(),
            mode_lock,
            tool_event_rx,
            max_context_tokens,
        );

        let (tx, mut rx) = mpsc::channel::<AgentEvent>(256);

        // Drain concurrently: `submit` backpressures on `tx.send().await`, so
        // the receiver must be polled while the sub-agent loop is still
        // running or a long task would deadlock against the bounded channel.
        let drain = tokio::spawn(async move {
            let mut output = String::new();
            while let Some(event) = rx.recv().await {
                if let AgentEvent::TextDelta(delta) = event {
                    output.push_str(&delta);
                }
            }
            output
        });

        let submit_result = agent.submit(&prompt, tx).await;
        let output = drain.await.unwrap_or_default();

        self.depth.fetch_sub(1, Ordering::Relaxed);

        match submit_result {
            Ok(_) => {
                if output.is_empty() {
                    ToolOutput::ok(&call.id, "(sub-agent produced no text output)")
                } else {
                    ToolOutput::ok(&call.id, output)
                }
            }
            Err(e) => ToolOutput::err(&call.id, format!("sub-agent error: {e}")),
        }
    }
}
