// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Single entry point for dispatching a tool call: policy gating, result
//! caching, and registry dispatch, unified so the agent loop never has to
//! juggle the three separately.
//!
//! `execute` never returns a transport-level error. A denied or failing
//! call comes back as a normal [`ToolOutput`] with `is_error` set — the only
//! thing the loop has to branch on.

use thiserror::Error;

use crate::cache::{ToolResultCache, ToolResultCacheConfig};
use crate::registry::{ToolRegistry, ToolSchema};
use crate::tool::{ToolCall, ToolKind, ToolOutput};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExecError {
    #[error("tool `{0}` is denied by policy")]
    Denied(String),
    #[error("unknown tool: {0}")]
    Unknown(String),
}

/// Wraps a [`ToolRegistry`] with policy gating and a result cache behind one
/// `execute()` call.
pub struct ToolExecutorFacade {
    registry: ToolRegistry,
    cache: ToolResultCache,
}

impl ToolExecutorFacade {
    pub fn new(registry: ToolRegistry) -> Self {
        Self { registry, cache: ToolResultCache::default() }
    }

    pub fn with_cache_config(mut self, config: ToolResultCacheConfig) -> Self {
        self.cache = ToolResultCache::new(config);
        self
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Sensitivity classification for a tool name, for security hooks.
    /// Unknown names classify as [`ToolKind::Execute`].
    pub fn get_tool_kind(&self, name: &str) -> ToolKind {
        self.registry.tool_kind(name)
    }

    /// Schemas of every registered tool, for building the model's tool list.
    pub fn get_definitions(&self) -> Vec<ToolSchema> {
        self.registry.schemas()
    }

    /// Deny-first policy check: a tool whose `default_policy()` is
    /// [`crate::policy::ApprovalPolicy::Deny`] is refused unconditionally.
    /// `Auto`/`Ask` are both treated as runnable here — interactive
    /// confirmation for `Ask` tools is the caller's concern (a hook can
    /// intercept `before_tool_call` to implement it), not this facade's.
    fn check_policy(&self, call: &ToolCall) -> Result<(), ExecError> {
        use crate::policy::ApprovalPolicy;
        match self.registry.get(&call.name) {
            None => Err(ExecError::Unknown(call.name.clone())),
            Some(tool) if tool.default_policy() == ApprovalPolicy::Deny => {
                Err(ExecError::Denied(call.name.clone()))
            }
            Some(_) => Ok(()),
        }
    }

    /// Run a tool call through policy gating, the result cache, and the
    /// registry, in that order. Only `Read`-kind tools are cached — caching
    /// a `Write`/`Execute` call would serve a stale result after the call
    /// has already changed the world it reads from.
    pub async fn execute(&self, call: &ToolCall) -> ToolOutput {
        if let Err(err) = self.check_policy(call) {
            return ToolOutput::err(&call.id, err.to_string());
        }

        let cacheable = self.get_tool_kind(&call.name) == ToolKind::Read;
        if cacheable {
            if let Some((output, success)) = self.cache.get(&call.name, &call.args) {
                return if success {
                    ToolOutput::ok(&call.id, output)
                } else {
                    ToolOutput::err(&call.id, output)
                };
            }
        }

        let result = self.registry.execute(call).await;

        if cacheable {
            self.cache.put(&call.name, &call.args, result.content.clone(), !result.is_error);
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::{json, Value};

    use crate::policy::ApprovalPolicy;
    use crate::tool::{OutputCategory, Tool};

    struct CountingReadTool {
        calls: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl Tool for CountingReadTool {
        fn name(&self) -> &str {
            "cat"
        }
        fn description(&self) -> &str {
            "reads a file"
        }
        fn parameters_schema(&self) -> Value {
            json!({"type": "object"})
        }
        fn default_policy(&self) -> ApprovalPolicy {
            ApprovalPolicy::Auto
        }
        fn kind(&self) -> ToolKind {
            ToolKind::Read
        }
        fn output_category(&self) -> OutputCategory {
            OutputCategory::FileContent
        }
        async fn execute(&self, call: &ToolCall) -> ToolOutput {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            ToolOutput::ok(&call.id, "file contents")
        }
    }

    struct DeniedTool;

    #[async_trait]
    impl Tool for DeniedTool {
        fn name(&self) -> &str {
            "rm_everything"
        }
        fn description(&self) -> &str {
            "dangerous"
        }
        fn parameters_schema(&self) -> Value {
            json!({"type": "object"})
        }
        fn default_policy(&self) -> ApprovalPolicy {
            ApprovalPolicy::Deny
        }
        async fn execute(&self, call: &ToolCall) -> ToolOutput {
            ToolOutput::ok(&call.id, "should never run")
        }
    }

    fn call(name: &str, args: Value) -> ToolCall {
        ToolCall { id: "1".into(), name: name.into(), args }
    }

    #[tokio::test]
    async fn unknown_tool_is_an_error_result() {
        let facade = ToolExecutorFacade::new(ToolRegistry::new());
        let out = facade.execute(&call("nope", json!({}))).await;
        assert!(out.is_error);
    }

    #[tokio::test]
    async fn denied_tool_never_executes() {
        let mut reg = ToolRegistry::new();
        reg.register(DeniedTool);
        let facade = ToolExecutorFacade::new(reg);
        let out = facade.execute(&call("rm_everything", json!({}))).await;
        assert!(out.is_error);
        assert!(out.content.contains("denied"));
    }

    #[tokio::test]
    async fn read_tool_result_is_cached() {
        let mut reg = ToolRegistry::new();
        reg.register(CountingReadTool { calls: std::sync::atomic::AtomicUsize::new(0) });
        let facade = ToolExecutorFacade::new(reg);
        let args = json!({"path": "a.txt"});

        let out1 = facade.execute(&call("cat", args.clone())).await;
        let out2 = facade.execute(&call("cat", args)).await;

        assert_eq!(out1.content, out2.content);
        assert_eq!(facade.cache.len(), 1);
    }

    #[tokio::test]
    async fn get_tool_kind_reports_read() {
        let mut reg = ToolRegistry::new();
        reg.register(CountingReadTool { calls: std::sync::atomic::AtomicUsize::new(0) });
        let facade = ToolExecutorFacade::new(reg);
        assert_eq!(facade.get_tool_kind("cat"), ToolKind::Read);
    }

    #[tokio::test]
    async fn get_tool_kind_unknown_is_execute() {
        let facade = ToolExecutorFacade::new(ToolRegistry::new());
        assert_eq!(facade.get_tool_kind("nope"), ToolKind::Execute);
    }

    #[tokio::test]
    async fn get_definitions_lists_registered_tools() {
        let mut reg = ToolRegistry::new();
        reg.register(CountingReadTool { calls: std::sync::atomic::AtomicUsize::new(0) });
        let facade = ToolExecutorFacade::new(reg);
        let defs = facade.get_definitions();
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].name, "cat");
    }
}
