// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use agentrt_model::Message;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One saved turn in the conversation log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnRecord {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub role: String,
    pub content: String,
}

/// In-memory conversation session.
///
/// Tracks an *estimated* token count (chars/4 heuristic, see
/// [`Message::approx_tokens`]) alongside a running calibration factor that
/// corrects the estimate against the provider's actual reported usage. This
/// is the "real tokenizer" substitution point called out as an open question
/// in the context-guard design: as long as the correction stays a monotone
/// function of the estimate, callers that only need a budget ratio keep working.
#[derive(Debug)]
pub struct Session {
    pub id: String,
    pub messages: Vec<Message>,
    /// Approximate total token count for the current message list.
    pub token_count: usize,
    /// Maximum context tokens (set from model config / provider limits).
    pub max_tokens: usize,
    /// Reserved for the model's own output (subtracted from `max_tokens` when
    /// computing the input budget).
    pub max_output_tokens: usize,
    /// Estimated tokens for tool schemas and dynamic context sent with every
    /// request but not stored in `messages`. Refreshed by the agent loop
    /// before each budget check.
    pub schema_overhead: usize,
    /// Running correction factor applied to the chars/4 estimate, updated
    /// from the provider's actual `input_tokens` usage each turn.
    pub calibration_factor: f32,
    pub cache_read_total: u64,
    pub cache_write_total: u64,
}

impl Session {
    pub fn new(max_tokens: usize) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            messages: Vec::new(),
            token_count: 0,
            max_tokens,
            max_output_tokens: 0,
            schema_overhead: 0,
            calibration_factor: 1.0,
            cache_read_total: 0,
            cache_write_total: 0,
        }
    }

    pub fn push(&mut self, msg: Message) {
        self.token_count += msg.approx_tokens();
        self.messages.push(msg);
    }

    pub fn push_many(&mut self, msgs: impl IntoIterator<Item = Message>) {
        for m in msgs {
            self.push(m);
        }
    }

    /// Tokens available for the input side of a request: the context window
    /// minus the tokens reserved for the model's own output. Zero means
    /// "unbounded" (budget checks are skipped).
    pub fn input_budget(&self) -> usize {
        if self.max_tokens == 0 {
            return 0;
        }
        self.max_tokens.saturating_sub(self.max_output_tokens)
    }

    /// Calibrated estimate of the tokens this session would actually send,
    /// including schema overhead, as a fraction of the input budget.
    pub fn context_fraction(&self) -> f32 {
        let budget = self.input_budget();
        if budget == 0 {
            return 0.0;
        }
        let raw = (self.token_count + self.schema_overhead) as f32;
        (raw * self.calibration_factor) / budget as f32
    }

    pub fn is_near_limit(&self, threshold: f32) -> bool {
        self.context_fraction() >= threshold
    }

    /// Recalculate token count from scratch (call after compaction).
    pub fn recalculate_tokens(&mut self) {
        self.token_count = self.messages.iter().map(|m| m.approx_tokens()).sum();
    }

    /// Replace the message list and recalculate token count (for resubmit / edit).
    pub fn replace_messages(&mut self, messages: Vec<Message>) {
        self.messages = messages;
        self.recalculate_tokens();
    }

    /// Accumulate prompt-cache usage reported by the provider.
    pub fn add_cache_usage(&mut self, cache_read: u32, cache_write: u32) {
        self.cache_read_total += cache_read as u64;
        self.cache_write_total += cache_write as u64;
    }

    /// Fold the provider's actual input-token count into the running
    /// calibration factor. Uses an exponential moving average (alpha = 0.3)
    /// so a single noisy turn can't swing the estimate too far; the factor is
    /// clamped to a sane range to guard against division artifacts on tiny
    /// sessions skewing it toward zero or infinity.
    pub fn update_calibration(&mut self, actual_input: u32, estimated: usize) {
        if estimated == 0 || actual_input == 0 {
            return;
        }
        let sample = actual_input as f32 / estimated as f32;
        let sample = sample.clamp(0.25, 4.0);
        const ALPHA: f32 = 0.3;
        self.calibration_factor = self.calibration_factor * (1.0 - ALPHA) + sample * ALPHA;
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use agentrt_model::Message;

    // ── Construction ─────────────────────────────────────────────────────────

    #[test]
    fn new_session_has_unique_id() {
        let a = Session::new(1000);
        let b = Session::new(1000);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn new_session_starts_empty() {
        let s = Session::new(1000);
        assert!(s.messages.is_empty());
        assert_eq!(s.token_count, 0);
        assert_eq!(s.calibration_factor, 1.0);
    }

    // ── Token accounting ──────────────────────────────────────────────────────

    #[test]
    fn push_increments_token_count() {
        let mut s = Session::new(1000);
        s.push(Message::user("12345678")); // 8 chars → 2 tokens
        assert_eq!(s.token_count, 2);
    }

    #[test]
    fn push_many_accumulates_tokens() {
        let mut s = Session::new(10_000);
        s.push_many([
            Message::user("12345678"),  // 2 tokens
            Message::assistant("abcd"), // 1 token
        ]);
        assert_eq!(s.token_count, 3);
    }

    #[test]
    fn recalculate_tokens_matches_push_sum() {
        let mut s = Session::new(1000);
        s.push(Message::user("hello world"));
        let after_push = s.token_count;
        s.recalculate_tokens();
        assert_eq!(s.token_count, after_push);
    }

    #[test]
    fn recalculate_after_manual_drain_resets_to_zero() {
        let mut s = Session::new(1000);
        s.push(Message::user("text"));
        s.messages.clear();
        s.recalculate_tokens();
        assert_eq!(s.token_count, 0);
    }

    #[test]
    fn replace_messages_sets_messages_and_recalculates_tokens() {
        let mut s = Session::new(1000);
        s.push(Message::user("first"));
        s.push(Message::assistant("reply"));
        assert_eq!(s.messages.len(), 2);
        let new_msgs = vec![Message::user("only")];
        s.replace_messages(new_msgs.clone());
        assert_eq!(s.messages.len(), 1);
        assert_eq!(s.messages[0].as_text(), Some("only"));
        assert_eq!(s.token_count, 1);
    }

    // ── Input budget / context fraction ───────────────────────────────────────

    #[test]
    fn input_budget_zero_when_max_tokens_zero() {
        let s = Session::new(0);
        assert_eq!(s.input_budget(), 0);
    }

    #[test]
    fn input_budget_subtracts_output_reserve() {
        let mut s = Session::new(1000);
        s.max_output_tokens = 200;
        assert_eq!(s.input_budget(), 800);
    }

    #[test]
    fn context_fraction_zero_when_empty() {
        let s = Session::new(1000);
        assert_eq!(s.context_fraction(), 0.0);
    }

    #[test]
    fn context_fraction_zero_when_budget_unbounded() {
        let mut s = Session::new(0);
        s.push(Message::user("hello"));
        assert_eq!(s.context_fraction(), 0.0);
    }

    #[test]
    fn context_fraction_includes_schema_overhead() {
        let mut s = Session::new(100);
        s.push(Message::user("12345678")); // 2 tokens
        s.schema_overhead = 8;
        // (2 + 8) / 100 = 0.10
        assert!((s.context_fraction() - 0.10).abs() < 1e-6);
    }

    #[test]
    fn context_fraction_scales_with_calibration_factor() {
        let mut s = Session::new(100);
        s.push(Message::user("12345678")); // 2 tokens
        s.calibration_factor = 2.0;
        assert!((s.context_fraction() - 0.04).abs() < 1e-6);
    }

    // ── Near-limit detection ──────────────────────────────────────────────────

    #[test]
    fn is_near_limit_false_when_empty() {
        let s = Session::new(1000);
        assert!(!s.is_near_limit(0.8));
    }

    #[test]
    fn is_near_limit_true_when_over_threshold() {
        let mut s = Session::new(4);
        s.push(Message::user("1234567890123")); // 13 chars = 3 tokens; 3/4 = 0.75
        s.push(Message::user("abcd")); // +1 → 4/4 = 1.0
        assert!(s.is_near_limit(0.8));
    }

    #[test]
    fn is_near_limit_exactly_at_threshold() {
        let mut s = Session::new(10);
        s.push(Message::user("12345678901234567890")); // 20 chars = 5 tokens
        assert!(s.is_near_limit(0.5));
        assert!(!s.is_near_limit(0.6));
    }

    // ── Cache usage accounting ─────────────────────────────────────────────────

    #[test]
    fn add_cache_usage_accumulates() {
        let mut s = Session::new(1000);
        s.add_cache_usage(10, 5);
        s.add_cache_usage(3, 0);
        assert_eq!(s.cache_read_total, 13);
        assert_eq!(s.cache_write_total, 5);
    }

    // ── Calibration ────────────────────────────────────────────────────────────

    #[test]
    fn update_calibration_moves_toward_actual_ratio() {
        let mut s = Session::new(1000);
        assert_eq!(s.calibration_factor, 1.0);
        // actual double the estimate → factor should increase toward 2.0
        s.update_calibration(200, 100);
        assert!(s.calibration_factor > 1.0 && s.calibration_factor < 2.0);
    }

    #[test]
    fn update_calibration_ignores_zero_estimate() {
        let mut s = Session::new(1000);
        s.update_calibration(200, 0);
        assert_eq!(s.calibration_factor, 1.0);
    }

    #[test]
    fn update_calibration_clamps_extreme_samples() {
        let mut s = Session::new(1000);
        // actual 100x the estimate — sample clamped to 4.0, not 100.0.
        s.update_calibration(10_000, 100);
        // factor = 1.0*0.7 + 4.0*0.3 = 1.9
        assert!((s.calibration_factor - 1.9).abs() < 1e-6);
    }
}
