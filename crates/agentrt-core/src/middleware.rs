// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Middleware (data-transforming) and hook (observational/vetoing) pipelines
//! around the model call and tool dispatch steps of the agent loop.
//!
//! The two are deliberately different shapes. Middleware sees and may
//! rewrite the data flowing through a turn — it runs `before_model` in
//! registration order and `after_model` in reverse, like any onion-style
//! chain, and never mutates its input in place (it returns the rewritten
//! value). Hooks never touch the data: they observe, and `before_tool_call`
//! may veto, but nothing else changes what the loop does. A panicking hook
//! must not take the whole turn down with it.

use std::panic::AssertUnwindSafe;

use agentrt_config::DanglingToolStrategy;
use agentrt_model::Message;
use agentrt_tools::ToolCall;
use futures::FutureExt;
use tracing::{error, warn};

use crate::state::RunState;

/// A data-transforming stage run around every model call.
///
/// Implementors may add, remove, or rewrite messages (inject a system
/// reminder, redact a secret, append an anti-loop nudge). Each hook method
/// returns the (possibly unchanged) message list it would like to pass on.
#[async_trait::async_trait]
pub trait Middleware: Send + Sync {
    fn name(&self) -> &str;

    /// Runs just before a model call is issued. Called in registration
    /// order: the first-registered middleware sees the rawest input.
    async fn before_model(&self, messages: Vec<Message>) -> Vec<Message> {
        messages
    }

    /// Runs just after a model call returns, before the result reaches the
    /// loop. Called in *reverse* registration order, so the chain unwinds
    /// symmetrically (the last thing to touch the request is the first
    /// thing to see the response).
    async fn after_model(&self, messages: Vec<Message>) -> Vec<Message> {
        messages
    }
}

/// Ordered list of [`Middleware`] run around every model call.
#[derive(Default)]
pub struct MiddlewareChain {
    stages: Vec<Box<dyn Middleware>>,
}

impl MiddlewareChain {
    pub fn new() -> Self {
        Self { stages: Vec::new() }
    }

    pub fn push(&mut self, middleware: Box<dyn Middleware>) {
        self.stages.push(middleware);
    }

    pub async fn run_before_model(&self, mut messages: Vec<Message>) -> Vec<Message> {
        for stage in self.stages.iter() {
            messages = stage.before_model(messages).await;
        }
        messages
    }

    pub async fn run_after_model(&self, mut messages: Vec<Message>) -> Vec<Message> {
        for stage in self.stages.iter().rev() {
            messages = stage.after_model(messages).await;
        }
        messages
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

/// What a hook's `before_tool_call` decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookOutcome {
    /// Let the call proceed.
    Allow,
    /// Refuse the call. The tool is never invoked; the loop synthesizes an
    /// error `ToolResult` in its place.
    Deny,
}

/// Observational (and, for tool calls, vetoing) hook into the loop.
///
/// Unlike [`Middleware`], a hook cannot rewrite the conversation — it can
/// only look, log, and (for tool calls only) say no. A hook that panics is
/// caught and logged by [`HookChain`]; it never aborts the run.
#[async_trait::async_trait]
pub trait Hook: Send + Sync {
    fn name(&self) -> &str;

    async fn before_llm_call(&self, _messages: &[Message]) {}
    async fn after_llm_call(&self, _messages: &[Message]) {}

    /// Called before a tool is dispatched. Return [`HookOutcome::Deny`] to
    /// veto the call.
    async fn before_tool_call(&self, _call: &ToolCall) -> HookOutcome {
        HookOutcome::Allow
    }
    async fn after_tool_call(&self, _call: &ToolCall, _output: &str, _is_error: bool) {}

    async fn on_state_change(&self, _from: RunState, _to: RunState) {}
    async fn on_error(&self, _message: &str) {}

    /// Called once the run has produced its final response. `messages` is
    /// the full session history at that point, so a hook that needs the
    /// conversation (e.g. a memory extractor) doesn't have to track it
    /// itself.
    async fn on_complete(&self, _messages: &[Message]) {}
}

/// Lets a hook be registered by `Arc` instead of consuming it into a `Box`,
/// so a caller can keep a handle to read state back out (e.g. a metrics
/// collector's counters) after handing a copy to [`HookChain::push`].
#[async_trait::async_trait]
impl<T: Hook + ?Sized> Hook for std::sync::Arc<T> {
    fn name(&self) -> &str {
        (**self).name()
    }
    async fn before_llm_call(&self, messages: &[Message]) {
        (**self).before_llm_call(messages).await
    }
    async fn after_llm_call(&self, messages: &[Message]) {
        (**self).after_llm_call(messages).await
    }
    async fn before_tool_call(&self, call: &ToolCall) -> HookOutcome {
        (**self).before_tool_call(call).await
    }
    async fn after_tool_call(&self, call: &ToolCall, output: &str, is_error: bool) {
        (**self).after_tool_call(call, output, is_error).await
    }
    async fn on_state_change(&self, from: RunState, to: RunState) {
        (**self).on_state_change(from, to).await
    }
    async fn on_error(&self, message: &str) {
        (**self).on_error(message).await
    }
    async fn on_complete(&self, messages: &[Message]) {
        (**self).on_complete(messages).await
    }
}

/// Ordered list of [`Hook`]s invoked at each loop checkpoint.
#[derive(Default)]
pub struct HookChain {
    hooks: Vec<Box<dyn Hook>>,
}

impl HookChain {
    pub fn new() -> Self {
        Self { hooks: Vec::new() }
    }

    pub fn push(&mut self, hook: Box<dyn Hook>) {
        self.hooks.push(hook);
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    pub async fn before_llm_call(&self, messages: &[Message]) {
        for hook in &self.hooks {
            let name = hook.name().to_string();
            if let Err(panic) = AssertUnwindSafe(hook.before_llm_call(messages))
                .catch_unwind()
                .await
            {
                log_hook_panic(&name, "before_llm_call", panic);
            }
        }
    }

    pub async fn after_llm_call(&self, messages: &[Message]) {
        for hook in &self.hooks {
            let name = hook.name().to_string();
            if let Err(panic) = AssertUnwindSafe(hook.after_llm_call(messages))
                .catch_unwind()
                .await
            {
                log_hook_panic(&name, "after_llm_call", panic);
            }
        }
    }

    /// Runs every hook's `before_tool_call`. A single `Deny` vetoes the
    /// call; a panicking hook counts as `Allow` (fails open — a broken
    /// observability hook should not silently disable every tool).
    pub async fn before_tool_call(&self, call: &ToolCall) -> HookOutcome {
        let mut outcome = HookOutcome::Allow;
        for hook in &self.hooks {
            let name = hook.name().to_string();
            match AssertUnwindSafe(hook.before_tool_call(call)).catch_unwind().await {
                Ok(HookOutcome::Deny) => outcome = HookOutcome::Deny,
                Ok(HookOutcome::Allow) => {}
                Err(panic) => log_hook_panic(&name, "before_tool_call", panic),
            }
        }
        outcome
    }

    pub async fn after_tool_call(&self, call: &ToolCall, output: &str, is_error: bool) {
        for hook in &self.hooks {
            let name = hook.name().to_string();
            if let Err(panic) = AssertUnwindSafe(hook.after_tool_call(call, output, is_error))
                .catch_unwind()
                .await
            {
                log_hook_panic(&name, "after_tool_call", panic);
            }
        }
    }

    pub async fn on_state_change(&self, from: RunState, to: RunState) {
        for hook in &self.hooks {
            let name = hook.name().to_string();
            if let Err(panic) = AssertUnwindSafe(hook.on_state_change(from, to))
                .catch_unwind()
                .await
            {
                log_hook_panic(&name, "on_state_change", panic);
            }
        }
    }

    pub async fn on_error(&self, message: &str) {
        for hook in &self.hooks {
            let name = hook.name().to_string();
            if let Err(panic) = AssertUnwindSafe(hook.on_error(message)).catch_unwind().await {
                log_hook_panic(&name, "on_error", panic);
            }
        }
    }

    pub async fn on_complete(&self, messages: &[Message]) {
        for hook in &self.hooks {
            let name = hook.name().to_string();
            if let Err(panic) = AssertUnwindSafe(hook.on_complete(messages))
                .catch_unwind()
                .await
            {
                log_hook_panic(&name, "on_complete", panic);
            }
        }
    }
}

fn log_hook_panic(hook_name: &str, phase: &str, panic: Box<dyn std::any::Any + Send>) {
    let msg = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "<non-string panic payload>".to_string());
    error!(hook = hook_name, phase, panic = %msg, "hook panicked; isolated, run continues");
}

/// Built-in middleware that patches up a message list ending on a dangling
/// `tool_call` with no matching `tool_result` — the shape left behind when
/// a run is cancelled or crashes mid tool-dispatch. Applied as the first
/// `before_model` stage so every downstream middleware sees a
/// provider-valid history.
pub struct DanglingToolCallPatcher {
    strategy: DanglingToolStrategy,
}

impl DanglingToolCallPatcher {
    pub fn new(strategy: DanglingToolStrategy) -> Self {
        Self { strategy }
    }
}

#[async_trait::async_trait]
impl Middleware for DanglingToolCallPatcher {
    fn name(&self) -> &str {
        "dangling_tool_call_patcher"
    }

    async fn before_model(&self, messages: Vec<Message>) -> Vec<Message> {
        sanitize_dangling_tool_calls(messages, self.strategy)
    }
}

/// Walks the message list and, for every assistant `tool_call` with no
/// following `tool_result` sharing its id, either strips the dangling call
/// (default) or injects a synthetic `tool_result` placeholder so the
/// provider's strict turn-shape validation does not reject the request.
pub fn sanitize_dangling_tool_calls(
    messages: Vec<Message>,
    strategy: DanglingToolStrategy,
) -> Vec<Message> {
    use agentrt_model::{MessageContent, Role, ToolResultContent};

    let answered: std::collections::HashSet<String> = messages
        .iter()
        .filter_map(|m| match &m.content {
            MessageContent::ToolResult { tool_call_id, .. } => Some(tool_call_id.clone()),
            _ => None,
        })
        .collect();

    let mut out = Vec::with_capacity(messages.len());
    for message in messages {
        let is_dangling = matches!(
            &message.content,
            MessageContent::ToolCall { tool_call_id, .. } if !answered.contains(tool_call_id)
        );
        if !is_dangling {
            out.push(message);
            continue;
        }
        match strategy {
            DanglingToolStrategy::Strip => {
                warn!("stripping dangling tool_call with no matching tool_result");
            }
            DanglingToolStrategy::InjectPlaceholder => {
                if let MessageContent::ToolCall { tool_call_id, function } = &message.content {
                    let placeholder = Message {
                        role: Role::Tool,
                        content: MessageContent::ToolResult {
                            tool_call_id: tool_call_id.clone(),
                            content: ToolResultContent::Text(format!(
                                "(no result recorded for call to `{}`; the run was interrupted before it completed)",
                                function.name
                            )),
                        },
                    };
                    out.push(message);
                    out.push(placeholder);
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentrt_model::{FunctionCall, MessageContent, Role};

    fn tool_call_message(id: &str, name: &str) -> Message {
        Message {
            role: Role::Assistant,
            content: MessageContent::ToolCall {
                tool_call_id: id.to_string(),
                function: FunctionCall { name: name.to_string(), arguments: "{}".to_string() },
            },
        }
    }

    fn tool_result_message(id: &str) -> Message {
        Message {
            role: Role::Tool,
            content: MessageContent::ToolResult {
                tool_call_id: id.to_string(),
                content: agentrt_model::ToolResultContent::Text("ok".to_string()),
            },
        }
    }

    #[test]
    fn answered_tool_calls_pass_through_unchanged() {
        let messages = vec![tool_call_message("1", "read_file"), tool_result_message("1")];
        let out = sanitize_dangling_tool_calls(messages.clone(), DanglingToolStrategy::Strip);
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn strip_removes_dangling_call() {
        let messages = vec![
            Message::user("hi"),
            tool_call_message("1", "read_file"),
        ];
        let out = sanitize_dangling_tool_calls(messages, DanglingToolStrategy::Strip);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn placeholder_injects_synthetic_result() {
        let messages = vec![tool_call_message("1", "read_file")];
        let out = sanitize_dangling_tool_calls(messages, DanglingToolStrategy::InjectPlaceholder);
        assert_eq!(out.len(), 2);
        assert!(matches!(
            out[1].content,
            MessageContent::ToolResult { .. }
        ));
    }

    struct CountingMiddleware {
        tag: &'static str,
    }

    #[async_trait::async_trait]
    impl Middleware for CountingMiddleware {
        fn name(&self) -> &str {
            self.tag
        }
        async fn before_model(&self, mut messages: Vec<Message>) -> Vec<Message> {
            messages.push(Message::system(self.tag));
            messages
        }
    }

    #[tokio::test]
    async fn chain_runs_before_model_in_registration_order() {
        let mut chain = MiddlewareChain::new();
        chain.push(Box::new(CountingMiddleware { tag: "first" }));
        chain.push(Box::new(CountingMiddleware { tag: "second" }));
        let out = chain.run_before_model(vec![]).await;
        let tags: Vec<String> = out
            .iter()
            .map(|m| match &m.content {
                agentrt_model::MessageContent::Text(t) => t.clone(),
                _ => String::new(),
            })
            .collect();
        assert_eq!(tags, vec!["first", "second"]);
    }

    struct DenyHook;

    #[async_trait::async_trait]
    impl Hook for DenyHook {
        fn name(&self) -> &str {
            "deny_all"
        }
        async fn before_tool_call(&self, _call: &ToolCall) -> HookOutcome {
            HookOutcome::Deny
        }
    }

    struct PanickingHook;

    #[async_trait::async_trait]
    impl Hook for PanickingHook {
        fn name(&self) -> &str {
            "panics"
        }
        async fn before_tool_call(&self, _call: &ToolCall) -> HookOutcome {
            panic!("boom");
        }
    }

    fn sample_call() -> ToolCall {
        ToolCall { id: "1".into(), name: "read_file".into(), args: serde_json::json!({}) }
    }

    #[tokio::test]
    async fn hook_chain_vetoes_on_deny() {
        let mut chain = HookChain::new();
        chain.push(Box::new(DenyHook));
        let outcome = chain.before_tool_call(&sample_call()).await;
        assert_eq!(outcome, HookOutcome::Deny);
    }

    #[tokio::test]
    async fn panicking_hook_is_isolated_and_fails_open() {
        let mut chain = HookChain::new();
        chain.push(Box::new(PanickingHook));
        let outcome = chain.before_tool_call(&sample_call()).await;
        assert_eq!(outcome, HookOutcome::Allow);
    }

    #[tokio::test]
    async fn empty_chain_allows_everything() {
        let chain = HookChain::new();
        assert!(chain.is_empty());
        let outcome = chain.before_tool_call(&sample_call()).await;
        assert_eq!(outcome, HookOutcome::Allow);
    }
}
