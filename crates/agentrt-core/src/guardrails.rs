// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Budget, context, and loop guardrails that bound a single run.
//!
//! All three are run-scoped (owned exclusively by one [`crate::agent::Agent`]
//! run), unlike the process-wide model router and tool registry.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use thiserror::Error;

use agentrt_model::{ContentPart, Message, MessageContent, ToolResultContent};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GuardrailError {
    #[error("token budget exceeded: used {used}, max {max}")]
    TokenBudgetExceeded { used: u64, max: u64 },
    #[error("wall-clock budget exceeded: elapsed {elapsed_secs}s, max {max_secs}s")]
    DurationBudgetExceeded { elapsed_secs: u64, max_secs: u64 },
}

/// Tracks cumulative token usage and wall-clock elapsed time for one run.
/// `0` for either limit means "unlimited". Safe for concurrent readers:
/// the token counter is atomic, and `check_budget` only reads the
/// (immutable) start instant.
pub struct CostGuard {
    tokens: AtomicU64,
    max_tokens: u64,
    max_duration: Duration,
    started_at: Instant,
}

impl CostGuard {
    pub fn new(max_tokens: u64, max_duration: Duration) -> Self {
        Self {
            tokens: AtomicU64::new(0),
            max_tokens,
            max_duration,
            started_at: Instant::now(),
        }
    }

    /// Add `n` tokens to the running total. Returns an error (without
    /// undoing the addition — the spend already happened) if the new total
    /// exceeds the budget.
    pub fn add_tokens(&self, n: u64) -> Result<(), GuardrailError> {
        let total = self.tokens.fetch_add(n, Ordering::Relaxed) + n;
        if self.max_tokens != 0 && total > self.max_tokens {
            return Err(GuardrailError::TokenBudgetExceeded {
                used: total,
                max: self.max_tokens,
            });
        }
        Ok(())
    }

    pub fn tokens_used(&self) -> u64 {
        self.tokens.load(Ordering::Relaxed)
    }

    pub fn check_budget(&self) -> Result<(), GuardrailError> {
        if self.max_duration.is_zero() {
            return Ok(());
        }
        let elapsed = self.started_at.elapsed();
        if elapsed > self.max_duration {
            return Err(GuardrailError::DurationBudgetExceeded {
                elapsed_secs: elapsed.as_secs(),
                max_secs: self.max_duration.as_secs(),
            });
        }
        Ok(())
    }
}

/// Snapshot of a context-window estimate against the model's usable budget.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContextEstimate {
    pub estimated: usize,
    pub max: usize,
    pub ratio: f32,
    pub need_compaction: bool,
    pub warning: bool,
}

/// Estimates token usage of an assembled message list using the
/// provider-agnostic `chars/3` heuristic (a blend of English ~4 chars/token
/// and CJK ~2 chars/token), adding a fixed per-part and per-tool-call
/// overhead. The contract is only that the estimate is a monotone, O(n)
/// function of content length — swap in a real tokenizer if one is
/// available without changing callers.
pub struct ContextGuard {
    pub max: usize,
    pub warn_ratio: f32,
    pub hard_ratio: f32,
}

impl ContextGuard {
    pub fn new(max: usize, warn_ratio: f32, hard_ratio: f32) -> Self {
        Self { max, warn_ratio, hard_ratio }
    }

    pub fn estimate(&self, messages: &[Message]) -> ContextEstimate {
        let total: usize = messages.iter().map(message_estimate).sum();
        let ratio = if self.max == 0 { 0.0 } else { total as f32 / self.max as f32 };
        ContextEstimate {
            estimated: total,
            max: self.max,
            ratio,
            need_compaction: ratio > self.hard_ratio,
            warning: ratio > self.warn_ratio,
        }
    }
}

/// `chars/3` text estimate plus 85 tokens per non-text part and
/// `len(name)+50` per tool call, per spec's ContextGuard heuristic.
fn message_estimate(m: &Message) -> usize {
    match &m.content {
        MessageContent::Text(t) => t.chars().count() / 3,
        MessageContent::ContentParts(parts) => parts
            .iter()
            .map(|p| match p {
                ContentPart::Text { text } => text.chars().count() / 3,
                ContentPart::Image { .. } => 85,
            })
            .sum(),
        MessageContent::ToolCall { function, .. } => {
            function.name.len() + 50 + function.arguments.chars().count() / 3
        }
        MessageContent::ToolResult { content, .. } => match content {
            ToolResultContent::Text(t) => t.chars().count() / 3,
            ToolResultContent::Parts(parts) => parts
                .iter()
                .map(|p| match p {
                    agentrt_model::ToolContentPart::Text { text } => text.chars().count() / 3,
                    agentrt_model::ToolContentPart::Image { .. } => 85,
                })
                .sum(),
        },
    }
}

/// Signature used by the exact-match loop detector: tool name plus a hash of
/// its (order-insensitive-at-the-JSON-level) arguments.
fn signature(name: &str, args_json: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    hasher.update([0u8]);
    hasher.update(args_json.as_bytes());
    format!("{}|{:x}", name, hasher.finalize())
}

/// Detects two flavors of tool-call loop within a sliding window:
///
/// - **exact-match**: the last `exact_threshold` calls are all identical
///   (same name + same argument hash).
/// - **name-only**: a tool name occurs `name_threshold` times within the
///   window, even with other tools interleaved.
///
/// Neither aborts the run; both return a reflection prompt to inject as a
/// `system` message into the next step.
pub struct LoopDetector {
    window: usize,
    exact_threshold: usize,
    name_threshold: usize,
    signatures: VecDeque<String>,
    names: VecDeque<String>,
}

impl LoopDetector {
    pub fn new(window: usize, exact_threshold: usize, name_threshold: usize) -> Self {
        Self {
            window,
            exact_threshold,
            name_threshold,
            signatures: VecDeque::with_capacity(window),
            names: VecDeque::with_capacity(window),
        }
    }

    /// Record one tool call and return a reflection prompt if either
    /// detector fires on this call.
    pub fn record(&mut self, name: &str, args_json: &str) -> Option<String> {
        let sig = signature(name, args_json);
        self.signatures.push_back(sig);
        if self.signatures.len() > self.window {
            self.signatures.pop_front();
        }
        self.names.push_back(name.to_string());
        if self.names.len() > self.window {
            self.names.pop_front();
        }

        if self.exact_match_loop() {
            return Some(format!(
                "You have called the same tool with the same arguments {} times in a row. \
                 Stop repeating this call — try a different approach or explain to the user \
                 why you are stuck.",
                self.exact_threshold
            ));
        }
        if self.name_only_loop(name) {
            return Some(format!(
                "You have called the tool `{name}` {} times recently. \
                 Explain to the user what difficulty you are having and stop calling tools \
                 until they respond.",
                self.name_threshold
            ));
        }
        None
    }

    fn exact_match_loop(&self) -> bool {
        if self.signatures.len() < self.exact_threshold {
            return false;
        }
        let tail: Vec<&String> = self
            .signatures
            .iter()
            .rev()
            .take(self.exact_threshold)
            .collect();
        tail.windows(2).all(|w| w[0] == w[1])
    }

    fn name_only_loop(&self, name: &str) -> bool {
        self.names.iter().filter(|n| n.as_str() == name).count() >= self.name_threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cost_guard_allows_under_budget() {
        let g = CostGuard::new(1000, Duration::ZERO);
        assert!(g.add_tokens(500).is_ok());
        assert!(g.add_tokens(400).is_ok());
    }

    #[test]
    fn cost_guard_trips_over_token_budget() {
        let g = CostGuard::new(1000, Duration::ZERO);
        g.add_tokens(900).unwrap();
        let err = g.add_tokens(200).unwrap_err();
        assert_eq!(
            err,
            GuardrailError::TokenBudgetExceeded { used: 1100, max: 1000 }
        );
    }

    #[test]
    fn cost_guard_zero_budget_is_unlimited() {
        let g = CostGuard::new(0, Duration::ZERO);
        assert!(g.add_tokens(1_000_000).is_ok());
    }

    #[test]
    fn cost_guard_trips_over_duration_budget() {
        let g = CostGuard::new(0, Duration::from_millis(10));
        std::thread::sleep(Duration::from_millis(20));
        assert!(g.check_budget().is_err());
    }

    #[test]
    fn context_guard_flags_warning_and_hard_ratios() {
        let guard = ContextGuard::new(100, 0.70, 0.85);
        let msgs = vec![Message::user(&"x".repeat(3 * 90))]; // ~90 estimated tokens
        let est = guard.estimate(&msgs);
        assert!(est.warning);
        assert!(!est.need_compaction);

        let msgs2 = vec![Message::user(&"x".repeat(3 * 95))];
        let est2 = guard.estimate(&msgs2);
        assert!(est2.need_compaction);
    }

    #[test]
    fn loop_detector_fires_on_exact_repeats() {
        let mut d = LoopDetector::new(8, 3, 8);
        assert!(d.record("search", r#"{"q":"x"}"#).is_none());
        assert!(d.record("search", r#"{"q":"x"}"#).is_none());
        assert!(d.record("search", r#"{"q":"x"}"#).is_some());
    }

    #[test]
    fn loop_detector_does_not_fire_on_varying_args() {
        let mut d = LoopDetector::new(8, 3, 8);
        assert!(d.record("search", r#"{"q":"a"}"#).is_none());
        assert!(d.record("search", r#"{"q":"b"}"#).is_none());
        assert!(d.record("search", r#"{"q":"c"}"#).is_none());
    }

    #[test]
    fn loop_detector_fires_on_name_only_interleaved() {
        let mut d = LoopDetector::new(8, 3, 3);
        assert!(d.record("search", r#"{"q":"a"}"#).is_none());
        assert!(d.record("other", r#"{}"#).is_none());
        assert!(d.record("search", r#"{"q":"b"}"#).is_none());
        assert!(d.record("other", r#"{}"#).is_none());
        assert!(d.record("search", r#"{"q":"c"}"#).is_some());
    }
}
