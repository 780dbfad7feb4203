// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Built-in observational hooks: a metrics collector and a tool-approval
//! security gate backed by [`agentrt_tools::ToolPolicy`].

use std::sync::atomic::{AtomicU64, Ordering};

use agentrt_model::Message;
use agentrt_tools::{ApprovalPolicy, ToolCall, ToolPolicy};
use tracing::warn;

use crate::middleware::{Hook, HookOutcome};

/// Point-in-time counters snapshotted from a [`MetricsCollector`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub llm_calls: u64,
    pub tool_calls: u64,
    pub tool_errors: u64,
    pub tool_denials: u64,
    pub errors: u64,
    pub completions: u64,
}

/// Lock-free counters for the handful of events a driver's status line or
/// `/metrics`-style endpoint cares about. Safe to share across concurrent
/// runs (each counter is an independent atomic).
#[derive(Default)]
pub struct MetricsCollector {
    llm_calls: AtomicU64,
    tool_calls: AtomicU64,
    tool_errors: AtomicU64,
    tool_denials: AtomicU64,
    errors: AtomicU64,
    completions: AtomicU64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Recorded by the agent loop itself when a dispatch observes a `Deny`
    /// outcome from `HookChain::before_tool_call` — no individual hook
    /// (including `SecurityGate`) can tell from its own `before_tool_call`
    /// return value whether the chain's aggregate verdict was a denial, so
    /// this can't be tracked from inside a `Hook` impl.
    pub fn record_denial(&self) {
        self.tool_denials.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            llm_calls: self.llm_calls.load(Ordering::Relaxed),
            tool_calls: self.tool_calls.load(Ordering::Relaxed),
            tool_errors: self.tool_errors.load(Ordering::Relaxed),
            tool_denials: self.tool_denials.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            completions: self.completions.load(Ordering::Relaxed),
        }
    }
}

#[async_trait::async_trait]
impl Hook for MetricsCollector {
    fn name(&self) -> &str {
        "metrics_collector"
    }

    async fn before_llm_call(&self, _messages: &[Message]) {
        self.llm_calls.fetch_add(1, Ordering::Relaxed);
    }

    async fn after_tool_call(&self, _call: &ToolCall, _output: &str, is_error: bool) {
        self.tool_calls.fetch_add(1, Ordering::Relaxed);
        if is_error {
            self.tool_errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    async fn on_error(&self, _message: &str) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    async fn on_complete(&self, _messages: &[Message]) {
        self.completions.fetch_add(1, Ordering::Relaxed);
    }
}

/// Gates tool dispatch on [`ToolPolicy`]'s deny/auto/ask decision.
///
/// `ToolPolicy::decide` otherwise has no caller outside its own unit tests;
/// this hook is the loop-side wiring the spec's "a `Policy` may deny or
/// restrict tools" language describes, distinct from (and additional to)
/// `ToolExecutorFacade`'s static per-tool `default_policy()==Deny` check.
pub struct SecurityGate {
    policy: ToolPolicy,
}

impl SecurityGate {
    pub fn new(policy: ToolPolicy) -> Self {
        Self { policy }
    }

    pub fn from_config(cfg: &agentrt_config::ToolsConfig) -> Self {
        Self::new(ToolPolicy::from_config(cfg))
    }
}

#[async_trait::async_trait]
impl Hook for SecurityGate {
    fn name(&self) -> &str {
        "security_gate"
    }

    async fn before_tool_call(&self, call: &ToolCall) -> HookOutcome {
        match self.policy.decide(&command_string(call)) {
            ApprovalPolicy::Deny => HookOutcome::Deny,
            // `Auto` and `Ask` both proceed: an unattended run has no
            // approval channel to block on for `Ask`, so it degrades to
            // allow-with-a-logged-warning rather than hanging or denying a
            // call the policy didn't actually say to deny. A driver with an
            // interactive front end wanting to prompt on `Ask` should push
            // its own hook ahead of this one — the first `Deny` wins.
            ApprovalPolicy::Ask => {
                warn!(tool = %call.name, "security gate: no approval channel wired; allowing 'ask'-policy call");
                HookOutcome::Allow
            }
            ApprovalPolicy::Auto => HookOutcome::Allow,
        }
    }
}

/// Builds the string `ToolPolicy`'s glob patterns match against. Shell-style
/// tools carry their actual command in a `shell_command` argument, which is
/// what deny/auto-approve patterns like `"rm *"` are written against;
/// anything else falls back to `"<name> <json args>"`.
fn command_string(call: &ToolCall) -> String {
    if let Some(cmd) = call.args.get("shell_command").and_then(|v| v.as_str()) {
        return cmd.to_string();
    }
    format!("{} {}", call.name, call.args)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn call(name: &str, args: serde_json::Value) -> ToolCall {
        ToolCall { id: "1".into(), name: name.into(), args }
    }

    #[tokio::test]
    async fn metrics_collector_counts_events() {
        let m = MetricsCollector::new();
        m.before_llm_call(&[]).await;
        m.before_llm_call(&[]).await;
        m.after_tool_call(&call("cat", json!({})), "ok", false).await;
        m.after_tool_call(&call("cat", json!({})), "boom", true).await;
        m.on_error("oops").await;
        m.on_complete(&[]).await;

        let snap = m.snapshot();
        assert_eq!(snap.llm_calls, 2);
        assert_eq!(snap.tool_calls, 2);
        assert_eq!(snap.tool_errors, 1);
        assert_eq!(snap.errors, 1);
        assert_eq!(snap.completions, 1);
        assert_eq!(snap.tool_denials, 0);
    }

    #[tokio::test]
    async fn record_denial_increments_tool_denials() {
        let m = MetricsCollector::new();
        m.record_denial();
        m.record_denial();
        assert_eq!(m.snapshot().tool_denials, 2);
    }

    #[tokio::test]
    async fn security_gate_denies_by_deny_pattern() {
        let gate = SecurityGate::new(ToolPolicy::from_config(&agentrt_config::ToolsConfig {
            deny_patterns: vec!["rm -rf *".to_string()],
            ..agentrt_config::ToolsConfig::default()
        }));
        let outcome = gate
            .before_tool_call(&call("shell", json!({"shell_command": "rm -rf /tmp/x"})))
            .await;
        assert_eq!(outcome, HookOutcome::Deny);
    }

    #[tokio::test]
    async fn security_gate_allows_auto_approved() {
        let gate = SecurityGate::new(ToolPolicy::from_config(&agentrt_config::ToolsConfig {
            auto_approve_patterns: vec!["cat *".to_string()],
            ..agentrt_config::ToolsConfig::default()
        }));
        let outcome = gate
            .before_tool_call(&call("shell", json!({"shell_command": "cat README.md"})))
            .await;
        assert_eq!(outcome, HookOutcome::Allow);
    }

    #[tokio::test]
    async fn security_gate_allows_ask_with_no_approval_channel() {
        let gate = SecurityGate::new(ToolPolicy::from_config(&agentrt_config::ToolsConfig {
            auto_approve_patterns: vec![],
            deny_patterns: vec![],
            ..agentrt_config::ToolsConfig::default()
        }));
        let outcome = gate
            .before_tool_call(&call("shell", json!({"shell_command": "git status"})))
            .await;
        assert_eq!(outcome, HookOutcome::Allow);
    }
}
