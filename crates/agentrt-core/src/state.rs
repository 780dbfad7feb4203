// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The agent loop's explicit state machine.
//!
//! Every run owns exactly one [`StateMachine`]. Transitions are validated
//! against a fixed table; anything not listed is a programming error and
//! returns [`StateError::InvalidTransition`] rather than silently happening.
//! Terminal states (`Complete`, `Error`, `Aborted`) never accept a further
//! transition.

use std::time::{Duration, Instant};

use thiserror::Error;

/// The run's current phase. See the module docs for the transition rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Planning,
    Streaming,
    ToolExec,
    Compacting,
    Retrying,
    Complete,
    Error,
    Aborted,
}

impl RunState {
    /// Terminal states accept no outgoing transition.
    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Complete | RunState::Error | RunState::Aborted)
    }

    fn allowed_targets(self) -> &'static [RunState] {
        use RunState::*;
        match self {
            Idle => &[Planning, Streaming, Error, Aborted],
            Planning => &[Streaming, Error, Aborted],
            Streaming => &[ToolExec, Compacting, Retrying, Complete, Error, Aborted],
            ToolExec => &[Streaming, Error, Aborted],
            Compacting => &[Streaming, Error, Aborted],
            Retrying => &[Streaming, Error, Aborted],
            Complete | Error | Aborted => &[],
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StateError {
    #[error("invalid transition {from:?} -> {to:?}")]
    InvalidTransition { from: RunState, to: RunState },
    #[error("state machine is already in a terminal state ({0:?})")]
    Terminal(RunState),
}

/// Point-in-time statistics for a run. A value copy; mutated only through
/// [`StateMachine`]'s own methods so a snapshot never observes a
/// half-updated run.
#[derive(Debug, Clone)]
pub struct RunStats {
    pub step: u32,
    pub tokens_used: u64,
    pub tools_executed: u32,
    pub retry_count: u32,
    pub error_count: u32,
    pub last_tool: Option<String>,
    pub model_used: Option<String>,
    pub elapsed: Duration,
}

impl RunStats {
    fn new() -> Self {
        Self {
            step: 0,
            tokens_used: 0,
            tools_executed: 0,
            retry_count: 0,
            error_count: 0,
            last_tool: None,
            model_used: None,
            elapsed: Duration::ZERO,
        }
    }
}

/// The run's state machine. Owns [`RunStats`] so that every mutation goes
/// through a single lock-free, single-owner path (each run owns its machine
/// exclusively — see spec's ownership model).
pub struct StateMachine {
    state: RunState,
    stats: RunStats,
    started_at: Instant,
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            state: RunState::Idle,
            stats: RunStats::new(),
            started_at: Instant::now(),
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    /// Snapshot of current run statistics. `elapsed` is recomputed from the
    /// run's start time at call time.
    pub fn stats(&self) -> RunStats {
        let mut s = self.stats.clone();
        s.elapsed = self.started_at.elapsed();
        s
    }

    /// Attempt a transition. Returns an error without mutating state if the
    /// transition is not in the table, or if the machine is already
    /// terminal.
    pub fn transition(&mut self, to: RunState) -> Result<(), StateError> {
        if self.state.is_terminal() {
            return Err(StateError::Terminal(self.state));
        }
        if !self.state.allowed_targets().contains(&to) {
            return Err(StateError::InvalidTransition { from: self.state, to });
        }
        self.state = to;
        Ok(())
    }

    pub fn begin_step(&mut self) {
        self.stats.step += 1;
    }

    pub fn add_tokens(&mut self, n: u64) {
        self.stats.tokens_used += n;
    }

    pub fn record_tool_executed(&mut self, name: impl Into<String>) {
        self.stats.tools_executed += 1;
        self.stats.last_tool = Some(name.into());
    }

    pub fn record_retry(&mut self) {
        self.stats.retry_count += 1;
    }

    pub fn record_error(&mut self) {
        self.stats.error_count += 1;
    }

    pub fn set_model_used(&mut self, model: impl Into<String>) {
        self.stats.model_used = Some(model.into());
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}
