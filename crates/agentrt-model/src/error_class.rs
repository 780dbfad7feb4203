// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Error classification for retry, failover, and budget decisions.
//!
//! Every error surfaced by a provider call is pattern-matched on its lowered
//! message text (plus any HTTP status the transport attached) into one of a
//! small set of [`ErrorKind`]s. Only [`ErrorKind::Transient`] is retried by
//! the router; the other kinds either fail fast or are handled by a
//! dedicated path (budget, cancellation, context overflow).

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    Auth,
    BadRequest,
    ContentFilter,
    Budget,
    Cancelled,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Transient => "transient",
            ErrorKind::Auth => "auth",
            ErrorKind::BadRequest => "bad_request",
            ErrorKind::ContentFilter => "content_filter",
            ErrorKind::Budget => "budget",
            ErrorKind::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl ErrorKind {
    /// Only transient errors are worth retrying against the same or a
    /// different provider.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Transient)
    }
}

const CANCELLED_PATTERNS: &[&str] = &["context canceled", "context cancelled", "context deadline exceeded"];
const AUTH_PATTERNS: &[&str] = &[
    "unauthorized",
    "invalid api key",
    "403",
    "permission denied",
    "authentication",
];
const CONTENT_FILTER_PATTERNS: &[&str] =
    &["content filter", "content policy", "safety", "blocked", "harmful"];
const BAD_REQUEST_PATTERNS: &[&str] = &[
    "bad request",
    "invalid argument",
    "model not found",
    "400",
    "invalid_request",
];
const BUDGET_PATTERNS: &[&str] = &["budget", "quota", "insufficient", "billing"];
const TRANSIENT_PATTERNS: &[&str] = &[
    "timeout",
    "deadline exceeded",
    "connection reset",
    "connection refused",
    "eof",
    "5xx",
    "500",
    "502",
    "503",
    "504",
    "529",
    "rate limit",
    "too many requests",
    "overloaded",
    "temporarily unavailable",
];
const CONTEXT_OVERFLOW_PATTERNS: &[&str] = &[
    "context length exceeded",
    "maximum context length",
    "prompt is too long",
    "413",
    "too large",
];

fn any_match(haystack: &str, patterns: &[&str]) -> bool {
    patterns.iter().any(|p| haystack.contains(p))
}

/// Classify an error message (and optional HTTP status) into an [`ErrorKind`].
/// Defaults to [`ErrorKind::Transient`] when nothing more specific matches,
/// since an unrecognised failure is usually worth one retry.
pub fn classify(message: &str, http_status: Option<u16>) -> ErrorKind {
    let lowered = message.to_lowercase();
    let with_status = match http_status {
        Some(s) => format!("{lowered} {s}"),
        None => lowered,
    };

    if any_match(&with_status, CANCELLED_PATTERNS) {
        return ErrorKind::Cancelled;
    }
    if any_match(&with_status, AUTH_PATTERNS) || matches!(http_status, Some(401) | Some(403)) {
        return ErrorKind::Auth;
    }
    if any_match(&with_status, CONTENT_FILTER_PATTERNS) {
        return ErrorKind::ContentFilter;
    }
    if any_match(&with_status, BUDGET_PATTERNS) {
        return ErrorKind::Budget;
    }
    if any_match(&with_status, BAD_REQUEST_PATTERNS) || matches!(http_status, Some(400)) {
        return ErrorKind::BadRequest;
    }
    if any_match(&with_status, TRANSIENT_PATTERNS)
        || matches!(http_status, Some(s) if (500..600).contains(&s))
    {
        return ErrorKind::Transient;
    }
    ErrorKind::Transient
}

/// Detects a provider-specific "context window exceeded" error so the loop
/// can trigger a one-shot compaction-then-retry instead of a normal failover.
pub fn is_context_overflow_error(message: &str, http_status: Option<u16>) -> bool {
    let lowered = message.to_lowercase();
    if any_match(&lowered, CONTEXT_OVERFLOW_PATTERNS) {
        return true;
    }
    matches!(http_status, Some(413))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancelled_takes_priority() {
        assert_eq!(classify("context canceled", None), ErrorKind::Cancelled);
        assert_eq!(classify("context deadline exceeded", None), ErrorKind::Cancelled);
    }

    #[test]
    fn classifies_auth_errors() {
        assert_eq!(classify("Unauthorized: invalid api key", None), ErrorKind::Auth);
        assert_eq!(classify("request failed", Some(403)), ErrorKind::Auth);
    }

    #[test]
    fn classifies_content_filter() {
        assert_eq!(classify("response blocked by content policy", None), ErrorKind::ContentFilter);
    }

    #[test]
    fn classifies_budget() {
        assert_eq!(classify("insufficient quota", None), ErrorKind::Budget);
    }

    #[test]
    fn classifies_bad_request() {
        assert_eq!(classify("Bad Request: invalid_request_error", None), ErrorKind::BadRequest);
        assert_eq!(classify("oops", Some(400)), ErrorKind::BadRequest);
    }

    #[test]
    fn classifies_transient() {
        assert_eq!(classify("connection reset by peer", None), ErrorKind::Transient);
        assert_eq!(classify("rate limit exceeded, try again", None), ErrorKind::Transient);
        assert_eq!(classify("service overloaded", Some(529)), ErrorKind::Transient);
        assert_eq!(classify("internal error", Some(503)), ErrorKind::Transient);
    }

    #[test]
    fn unrecognised_error_defaults_to_transient() {
        assert_eq!(classify("some never before seen failure", None), ErrorKind::Transient);
    }

    #[test]
    fn only_transient_is_retryable() {
        assert!(ErrorKind::Transient.is_retryable());
        assert!(!ErrorKind::Auth.is_retryable());
        assert!(!ErrorKind::BadRequest.is_retryable());
        assert!(!ErrorKind::ContentFilter.is_retryable());
        assert!(!ErrorKind::Budget.is_retryable());
        assert!(!ErrorKind::Cancelled.is_retryable());
    }

    #[test]
    fn detects_context_overflow() {
        assert!(is_context_overflow_error("This model's maximum context length is 128000 tokens", None));
        assert!(is_context_overflow_error("prompt is too long: 220000 tokens > 200000 maximum", None));
        assert!(is_context_overflow_error("payload too large", Some(413)));
        assert!(!is_context_overflow_error("rate limit exceeded", None));
    }
}
