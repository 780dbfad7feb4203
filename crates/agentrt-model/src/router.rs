// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Multi-provider router with circuit breaking and failover.
//!
//! [`ModelRouter`] wraps an ordered list of [`ModelProvider`]s. Calls are
//! dispatched to the first eligible provider (in insertion order); a
//! provider is skipped when its [`CircuitBreaker`] is open or it is within
//! its post-failure cooldown window. A failed `complete()` call is
//! classified with [`crate::error_class::classify`] — only transient
//! failures trigger failover to the next provider, anything else is
//! returned to the caller immediately.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::circuit::CircuitBreaker;
use crate::error_class::{self, ErrorKind};
use crate::provider::{ModelProvider, ResponseStream};
use crate::CompletionRequest;

/// Tuning knobs for [`ModelRouter`]. Defaults follow the runtime's
/// configuration defaults for circuit breaking and failover.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Consecutive failures before a provider's breaker opens.
    pub failure_threshold: u32,
    /// How long an open breaker waits before allowing a half-open probe.
    pub recovery_timeout: Duration,
    /// Maximum number of distinct providers tried for a single `complete()` call.
    pub max_failover_attempts: usize,
    /// How long a provider is skipped after a retryable failure, independent
    /// of its breaker state (keeps a flaky-but-not-yet-open provider from
    /// being retried on the very next call).
    pub cooldown: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
            max_failover_attempts: 3,
            cooldown: Duration::from_secs(5 * 60),
        }
    }
}

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("no model provider is configured")]
    Empty,
    #[error("no provider is eligible to serve this request ({total} configured, all on cooldown or circuit-open)")]
    NoProviderAvailable { total: usize },
    #[error("all {attempts} attempted provider(s) failed; last error: {source}")]
    AllFailed {
        attempts: usize,
        #[source]
        source: anyhow::Error,
    },
}

struct ProviderSlot {
    provider: Box<dyn ModelProvider>,
    breaker: CircuitBreaker,
    /// Exponential moving average of call latency, seconds. `None` until the
    /// first successful call completes.
    latency_ema: Mutex<Option<f64>>,
    calls: AtomicU64,
    failures: AtomicU64,
    cooldown_until: Mutex<Option<Instant>>,
}

/// Point-in-time health snapshot for one routed provider, for status
/// displays and diagnostics.
#[derive(Debug, Clone)]
pub struct ProviderStats {
    pub name: String,
    pub model: String,
    pub calls: u64,
    pub failures: u64,
    pub circuit_open: bool,
    pub latency_ema_secs: Option<f64>,
}

/// Weight applied to the newest latency sample in the EMA update.
const LATENCY_EMA_ALPHA: f64 = 0.3;

pub struct ModelRouter {
    slots: Vec<ProviderSlot>,
    config: RouterConfig,
}

impl ModelRouter {
    pub fn new(providers: Vec<Box<dyn ModelProvider>>) -> Self {
        Self::with_config(providers, RouterConfig::default())
    }

    pub fn with_config(providers: Vec<Box<dyn ModelProvider>>, config: RouterConfig) -> Self {
        let slots = providers
            .into_iter()
            .map(|provider| ProviderSlot {
                provider,
                breaker: CircuitBreaker::new(config.failure_threshold, config.recovery_timeout),
                latency_ema: Mutex::new(None),
                calls: AtomicU64::new(0),
                failures: AtomicU64::new(0),
                cooldown_until: Mutex::new(None),
            })
            .collect();
        Self { slots, config }
    }

    pub fn provider_names(&self) -> Vec<&str> {
        self.slots.iter().map(|s| s.provider.name()).collect()
    }

    pub fn stats(&self) -> Vec<ProviderStats> {
        self.slots
            .iter()
            .map(|s| ProviderStats {
                name: s.provider.name().to_string(),
                model: s.provider.model_name().to_string(),
                calls: s.calls.load(Ordering::Relaxed),
                failures: s.failures.load(Ordering::Relaxed),
                circuit_open: s.breaker.is_open(),
                latency_ema_secs: *s.latency_ema.lock().unwrap(),
            })
            .collect()
    }

    fn is_eligible(&self, slot: &ProviderSlot) -> bool {
        if !slot.breaker.allow() {
            return false;
        }
        if let Some(until) = *slot.cooldown_until.lock().unwrap() {
            if Instant::now() < until {
                return false;
            }
        }
        true
    }

    fn record_latency(&self, slot: &ProviderSlot, elapsed: Duration) {
        let sample = elapsed.as_secs_f64();
        let mut ema = slot.latency_ema.lock().unwrap();
        *ema = Some(match *ema {
            Some(prev) => LATENCY_EMA_ALPHA * sample + (1.0 - LATENCY_EMA_ALPHA) * prev,
            None => sample,
        });
    }

    /// Dispatch a completion request to the first eligible provider, in
    /// insertion order. On a retryable failure, the provider is put on
    /// cooldown and the next eligible provider is tried, up to
    /// `max_failover_attempts`. A non-retryable failure (auth, bad request,
    /// content filter, budget, cancelled) is returned immediately without
    /// trying further providers.
    pub async fn complete(&self, req: CompletionRequest) -> anyhow::Result<ResponseStream> {
        if self.slots.is_empty() {
            return Err(RouterError::Empty.into());
        }

        let mut last_err: Option<anyhow::Error> = None;
        let mut attempts = 0usize;

        for slot in &self.slots {
            if attempts >= self.config.max_failover_attempts {
                break;
            }
            if !self.is_eligible(slot) {
                continue;
            }
            attempts += 1;
            let start = Instant::now();
            match slot.provider.complete(req.clone()).await {
                Ok(stream) => {
                    slot.breaker.record_success();
                    slot.calls.fetch_add(1, Ordering::Relaxed);
                    self.record_latency(slot, start.elapsed());
                    return Ok(stream);
                }
                Err(e) => {
                    slot.calls.fetch_add(1, Ordering::Relaxed);
                    slot.failures.fetch_add(1, Ordering::Relaxed);
                    slot.breaker.record_failure();
                    let kind = error_class::classify(&e.to_string(), None);
                    tracing::warn!(
                        provider = slot.provider.name(),
                        kind = %kind,
                        "provider call failed"
                    );
                    if !kind.is_retryable() {
                        return Err(e);
                    }
                    *slot.cooldown_until.lock().unwrap() =
                        Some(Instant::now() + self.config.cooldown);
                    last_err = Some(e);
                }
            }
        }

        match last_err {
            Some(source) => Err(RouterError::AllFailed { attempts, source }.into()),
            None => Err(RouterError::NoProviderAvailable {
                total: self.slots.len(),
            }
            .into()),
        }
    }
}

/// Returns the [`ErrorKind`] of an `anyhow::Error`, as classified from its
/// display text. Convenience wrapper so callers outside this module don't
/// need to know the message-based classification is text-based.
pub fn classify_error(err: &anyhow::Error) -> ErrorKind {
    error_class::classify(&err.to_string(), None)
}

/// Lets a [`ModelRouter`] stand in for a single [`ModelProvider`] anywhere
/// one is expected (the agent loop holds exactly one `Arc<dyn ModelProvider>`).
/// Metadata methods (`name`, `model_name`, catalog lookups, modalities)
/// report the first configured slot, since those are used for display and
/// capability checks before a specific provider has been selected for the
/// call; `complete` itself always goes through the full failover path.
#[async_trait::async_trait]
impl ModelProvider for ModelRouter {
    fn name(&self) -> &str {
        self.slots.first().map(|s| s.provider.name()).unwrap_or("router")
    }

    fn model_name(&self) -> &str {
        self.slots.first().map(|s| s.provider.model_name()).unwrap_or("none")
    }

    async fn complete(&self, req: CompletionRequest) -> anyhow::Result<ResponseStream> {
        ModelRouter::complete(self, req).await
    }

    async fn list_models(&self) -> anyhow::Result<Vec<crate::catalog::ModelCatalogEntry>> {
        let mut out = Vec::new();
        for slot in &self.slots {
            out.extend(slot.provider.list_models().await?);
        }
        Ok(out)
    }

    fn catalog_max_output_tokens(&self) -> Option<u32> {
        self.slots.first().and_then(|s| s.provider.catalog_max_output_tokens())
    }

    fn catalog_context_window(&self) -> Option<u32> {
        self.slots.first().and_then(|s| s.provider.catalog_context_window())
    }

    fn input_modalities(&self) -> Vec<crate::catalog::InputModality> {
        self.slots.first().map(|s| s.provider.input_modalities()).unwrap_or_default()
    }

    fn supports_images(&self) -> bool {
        self.slots.iter().any(|s| s.provider.supports_images())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockProvider;
    use async_trait::async_trait;
    use futures::stream;
    use std::pin::Pin;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    /// A provider that always fails with a given message, counting calls.
    struct FailingProvider {
        name: &'static str,
        message: &'static str,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ModelProvider for FailingProvider {
        fn name(&self) -> &str {
            self.name
        }
        fn model_name(&self) -> &str {
            "failing-model"
        }
        async fn complete(&self, _req: CompletionRequest) -> anyhow::Result<ResponseStream> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            Err(anyhow::anyhow!(self.message))
        }
    }

    fn empty_stream() -> ResponseStream {
        Pin::from(Box::new(stream::empty()))
    }

    struct SucceedingProvider {
        name: &'static str,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ModelProvider for SucceedingProvider {
        fn name(&self) -> &str {
            self.name
        }
        fn model_name(&self) -> &str {
            "ok-model"
        }
        async fn complete(&self, _req: CompletionRequest) -> anyhow::Result<ResponseStream> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            Ok(empty_stream())
        }
    }

    #[tokio::test]
    async fn empty_router_returns_empty_error() {
        let router = ModelRouter::new(vec![]);
        let err = router.complete(CompletionRequest::default()).await.unwrap_err();
        assert!(err.to_string().contains("no model provider"));
    }

    #[tokio::test]
    async fn single_provider_success_is_forwarded() {
        let calls = Arc::new(AtomicUsize::new(0));
        let router = ModelRouter::new(vec![Box::new(SucceedingProvider {
            name: "p1",
            calls: calls.clone(),
        })]);
        let result = router.complete(CompletionRequest::default()).await;
        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn transient_failure_fails_over_to_next_provider() {
        let calls_a = Arc::new(AtomicUsize::new(0));
        let calls_b = Arc::new(AtomicUsize::new(0));
        let router = ModelRouter::new(vec![
            Box::new(FailingProvider {
                name: "a",
                message: "connection reset by peer",
                calls: calls_a.clone(),
            }),
            Box::new(SucceedingProvider {
                name: "b",
                calls: calls_b.clone(),
            }),
        ]);
        let result = router.complete(CompletionRequest::default()).await;
        assert!(result.is_ok());
        assert_eq!(calls_a.load(Ordering::Relaxed), 1);
        assert_eq!(calls_b.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn non_retryable_failure_does_not_fail_over() {
        let calls_a = Arc::new(AtomicUsize::new(0));
        let calls_b = Arc::new(AtomicUsize::new(0));
        let router = ModelRouter::new(vec![
            Box::new(FailingProvider {
                name: "a",
                message: "unauthorized: invalid api key",
                calls: calls_a.clone(),
            }),
            Box::new(SucceedingProvider {
                name: "b",
                calls: calls_b.clone(),
            }),
        ]);
        let result = router.complete(CompletionRequest::default()).await;
        assert!(result.is_err());
        assert_eq!(calls_a.load(Ordering::Relaxed), 1);
        assert_eq!(calls_b.load(Ordering::Relaxed), 0, "must not fail over on auth errors");
    }

    #[tokio::test]
    async fn failed_provider_is_put_on_cooldown() {
        let calls_a = Arc::new(AtomicUsize::new(0));
        let calls_b = Arc::new(AtomicUsize::new(0));
        let router = ModelRouter::with_config(
            vec![
                Box::new(FailingProvider {
                    name: "a",
                    message: "timeout",
                    calls: calls_a.clone(),
                }),
                Box::new(SucceedingProvider {
                    name: "b",
                    calls: calls_b.clone(),
                }),
            ],
            RouterConfig {
                cooldown: Duration::from_secs(60),
                ..RouterConfig::default()
            },
        );
        router.complete(CompletionRequest::default()).await.unwrap();
        assert_eq!(calls_a.load(Ordering::Relaxed), 1);
        // Second call: "a" is still on cooldown, so only "b" is tried.
        router.complete(CompletionRequest::default()).await.unwrap();
        assert_eq!(calls_a.load(Ordering::Relaxed), 1, "cooled-down provider must be skipped");
        assert_eq!(calls_b.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn max_failover_attempts_caps_providers_tried() {
        let calls_a = Arc::new(AtomicUsize::new(0));
        let calls_b = Arc::new(AtomicUsize::new(0));
        let router = ModelRouter::with_config(
            vec![
                Box::new(FailingProvider {
                    name: "a",
                    message: "timeout",
                    calls: calls_a.clone(),
                }),
                Box::new(FailingProvider {
                    name: "b",
                    message: "timeout",
                    calls: calls_b.clone(),
                }),
            ],
            RouterConfig {
                max_failover_attempts: 1,
                ..RouterConfig::default()
            },
        );
        let result = router.complete(CompletionRequest::default()).await;
        assert!(result.is_err());
        assert_eq!(calls_a.load(Ordering::Relaxed), 1);
        assert_eq!(calls_b.load(Ordering::Relaxed), 0, "max_failover_attempts must stop further tries");
    }

    #[tokio::test]
    async fn stats_report_calls_and_failures() {
        let router = ModelRouter::new(vec![Box::new(MockProvider)]);
        router.complete(CompletionRequest::default()).await.unwrap();
        let stats = router.stats();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].calls, 1);
        assert_eq!(stats[0].failures, 0);
        assert!(!stats[0].circuit_open);
    }

    #[test]
    fn classify_error_reads_display_text() {
        let err = anyhow::anyhow!("rate limit exceeded");
        assert_eq!(classify_error(&err), ErrorKind::Transient);
    }
}
