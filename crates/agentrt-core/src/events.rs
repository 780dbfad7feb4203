// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use agentrt_config::AgentMode;
use agentrt_tools::{events::TodoItem, ToolCall};

/// Events emitted by the agent during a single turn.
/// Consumers (CI runner, TUI) subscribe to these to drive their output.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// A text chunk streamed from the model
    TextDelta(String),
    /// A complete text response from the model (after streaming finishes)
    TextComplete(String),
    /// A thinking/reasoning chunk from the model (extended thinking API).
    /// Consumers should accumulate deltas and finalise them into a Thinking
    /// segment when the model signals the end of the reasoning block.
    ThinkingDelta(String),
    /// A complete thinking/reasoning block (accumulated from ThinkingDelta events).
    ThinkingComplete(String),
    /// The model has requested a tool call
    ToolCallStarted(ToolCall),
    /// A tool call finished
    ToolCallFinished {
        call_id: String,
        tool_name: String,
        output: String,
        is_error: bool,
    },
    /// Context was compacted; statistics for the UI
    ContextCompacted {
        tokens_before: usize,
        tokens_after: usize,
        strategy: CompactionStrategyUsed,
        /// The 1-based loop round the compaction fired on (0 = pre-submit,
        /// before the first model call of the turn).
        turn: u32,
    },
    /// Current token usage update
    TokenUsage {
        input: u32,
        output: u32,
        /// Tokens served from the provider's prompt cache this turn.
        cache_read: u32,
        /// Tokens written into the provider's prompt cache this turn.
        cache_write: u32,
        /// Running total of cache-read tokens across the session.
        cache_read_total: u64,
        /// Running total of cache-write tokens across the session.
        cache_write_total: u64,
        /// The session's current context window ceiling.
        max_tokens: usize,
    },
    /// The agent has finished processing the current user turn
    TurnComplete,
    /// A recoverable error occurred
    Error(String),
    /// The todo list was updated
    TodoUpdate(Vec<TodoItem>),
    /// The agent mode was changed
    ModeChanged(AgentMode),
    /// The agent is asking the user a question (id links to QuestionAnswer)
    Question { id: String, questions: Vec<String> },
    /// Answer to a previous Question event
    QuestionAnswer { id: String, answer: String },
    /// The run was cancelled before it reached a terminal `Done`/`Error`
    /// state. `partial_text` carries whatever assistant text had already
    /// streamed before the cancellation was observed.
    Aborted { partial_text: String },
    /// `ContextGuard`'s estimated usage crossed `warn_ratio` but not yet
    /// `hard_ratio` — a soft advisory surfaced before compaction becomes
    /// mandatory, so a driver can show the user the run is approaching its
    /// context window.
    ContextWarning { estimated: usize, max: usize, ratio: f32 },
}

/// Which compaction path produced a `ContextCompacted` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactionStrategyUsed {
    /// Rolling LLM summarization using the structured `<state_snapshot>` prompt.
    Structured,
    /// Rolling LLM summarization using a free-form narrative prompt.
    Narrative,
    /// Deterministic truncation fallback — no model call, always succeeds.
    Emergency,
}
