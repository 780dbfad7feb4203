// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Facade crate wiring the model router, tool registry, guardrails,
//! middleware/hook chain, and runtime context into a single
//! [`AgentRuntime`] entry point, so a front end (the headless CLI in
//! `main.rs`, or any other driver) doesn't have to hand-assemble an
//! [`Agent`] from its component crates itself.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};

use agentrt_config::{AgentConfig, AgentMode, Config};
use agentrt_core::{Agent, AgentEvent, AgentRuntimeContext, LoggingMemoryPersister, MemoryExtractor, SecurityGate};
use agentrt_model::{ModelProvider, ModelRouter, RouterConfig};
use agentrt_tools::{events::ToolEvent, ToolRegistry};

/// Assembled, ready-to-run agent plus the pieces a driver may still want
/// direct access to (the tool-event channel is already wired in; the mode
/// lock is kept so a driver can switch modes from outside a tool call).
pub struct AgentRuntime {
    agent: Agent,
    mode_lock: Arc<Mutex<AgentMode>>,
}

impl AgentRuntime {
    /// Builds an `AgentRuntime` from a loaded [`Config`]: resolves the model
    /// (or failover router) from `config.providers`/`model_override`,
    /// registers the built-in filesystem/shell tools, discovers the runtime
    /// context (project root, git/CI notes), and wires the built-in
    /// `SecurityGate` and `MemoryExtractor` hooks from `config` on top of
    /// `Agent::new`'s own always-on `MetricsCollector`.
    pub fn from_config(
        config: &Config,
        mode: AgentMode,
        model_override: Option<&str>,
    ) -> anyhow::Result<Self> {
        let model = build_model(config, model_override)?;
        let max_context_tokens = model.catalog_context_window().unwrap_or(8192) as usize;

        let (tool_event_tx, tool_event_rx) = mpsc::channel::<ToolEvent>(32);
        let tools = Arc::new(build_tool_registry(tool_event_tx));
        let agent_config = Arc::new(config.agent.clone());
        let runtime_context = build_runtime_context(&agent_config);
        let mode_lock = Arc::new(Mutex::new(mode));

        let mut agent = Agent::new(
            Arc::clone(&model),
            tools,
            agent_config,
            runtime_context,
            Arc::clone(&mode_lock),
            tool_event_rx,
            max_context_tokens,
        );
        agent.push_hook(Box::new(SecurityGate::from_config(&config.tools)));
        agent.push_hook(Box::new(MemoryExtractor::new(model, Arc::new(LoggingMemoryPersister))));

        Ok(Self { agent, mode_lock })
    }

    /// Submit one user turn, streaming its events to `tx`.
    pub async fn submit(&mut self, prompt: &str, tx: mpsc::Sender<AgentEvent>) -> anyhow::Result<()> {
        self.agent.submit(prompt, tx).await
    }

    /// Current agent mode.
    pub async fn mode(&self) -> AgentMode {
        *self.mode_lock.lock().await
    }

    /// Read-only access to the underlying agent, e.g. for `agent.metrics()`
    /// or `agent.session()`.
    pub fn agent(&self) -> &Agent {
        &self.agent
    }
}

/// Constructs the model provider to use for this run.
///
/// With no `--model` override and no named `providers:` entries, this is a
/// single provider built from `config.model`. When `providers:` has
/// entries, they are chained into a [`ModelRouter`] (config.model first,
/// then the named providers in map-iteration order) so a transient failure
/// on the primary fails over automatically.
fn build_model(config: &Config, model_override: Option<&str>) -> anyhow::Result<Arc<dyn ModelProvider>> {
    if let Some(spec) = model_override {
        let (key, model_name) = match spec.split_once('/') {
            Some((k, m)) => (k, Some(m)),
            None => (spec, None),
        };
        let mut cfg = config
            .providers
            .get(key)
            .cloned()
            .unwrap_or_else(|| config.model.clone());
        if let Some(m) = model_name {
            cfg.name = m.to_string();
        }
        return Ok(Arc::from(agentrt_model::from_config(&cfg)?));
    }

    if config.providers.is_empty() {
        return Ok(Arc::from(agentrt_model::from_config(&config.model)?));
    }

    let mut providers = vec![agentrt_model::from_config(&config.model)?];
    let mut names: Vec<&String> = config.providers.keys().collect();
    names.sort();
    for name in names {
        providers.push(agentrt_model::from_config(&config.providers[name])?);
    }
    let router_config = RouterConfig {
        failure_threshold: config.agent.circuit_failure_threshold,
        recovery_timeout: std::time::Duration::from_secs(config.agent.circuit_recovery_timeout_secs),
        ..RouterConfig::default()
    };
    Ok(Arc::new(ModelRouter::with_config(providers, router_config)))
}

fn build_tool_registry(tool_event_tx: mpsc::Sender<ToolEvent>) -> ToolRegistry {
    let mut reg = ToolRegistry::new();
    reg.register(agentrt_tools::ReadFileTool);
    reg.register(agentrt_tools::WriteTool);
    reg.register(agentrt_tools::EditFileTool);
    reg.register(agentrt_tools::DeleteFileTool);
    reg.register(agentrt_tools::GlobTool);
    reg.register(agentrt_tools::GrepTool);
    reg.register(agentrt_tools::ListDirTool);
    reg.register(agentrt_tools::ShellTool::default());
    reg.register(agentrt_tools::builtin::todo_write::TodoWriteTool::new(
        Arc::new(Mutex::new(Vec::new())),
        tool_event_tx,
    ));
    reg
}

fn build_runtime_context(agent_config: &AgentConfig) -> AgentRuntimeContext {
    let project_root = agentrt_runtime::find_project_root().ok();
    let git_context_note = project_root.as_deref().map(|root| {
        let git = agentrt_runtime::collect_git_context(root);
        format!(
            "branch={} commit={} dirty={}",
            git.branch.as_deref().unwrap_or("unknown"),
            git.commit.as_deref().unwrap_or("unknown"),
            git.dirty_count
        )
    });
    let ci_context_note = {
        let ci = agentrt_runtime::detect_ci_context();
        ci.provider.map(|provider| format!("ci={provider} run={}", ci.run_id.unwrap_or_default()))
    };
    let project_context_file = project_root
        .as_deref()
        .and_then(agentrt_runtime::load_project_context_file);

    AgentRuntimeContext {
        project_root,
        git_context_note,
        ci_context_note,
        project_context_file,
        append_system_prompt: None,
        system_prompt_override: agent_config.system_prompt.clone(),
    }
}
