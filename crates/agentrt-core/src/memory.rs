// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Built-in memory-extractor: after a run goes quiet for a debounce window,
//! asks the model to pull durable facts out of the conversation and hands
//! them to an external [`MemoryPersister`].
//!
//! Wired in as a [`Hook`] rather than a [`crate::middleware::Middleware`]:
//! fact extraction doesn't transform the messages flowing through a turn,
//! it is a side effect fired after the run's last response, which is
//! exactly what `Hook::on_complete` exists for.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tracing::warn;

use agentrt_model::{CompletionRequest, Message, ModelProvider, ResponseEvent};

use crate::middleware::Hook;

const EXTRACTION_PROMPT: &str = "\
Read the conversation above and extract any durable facts worth remembering \
for future conversations with this user: stated preferences, project \
conventions, recurring constraints, or corrections the user gave. Ignore \
one-off task details that won't matter once this conversation ends.

Respond with one fact per line, each starting with \"- \". If there is \
nothing worth remembering, respond with exactly NONE.";

/// Sink a memory extractor hands newly extracted facts to. The persistence
/// backend itself (a vector store, a flat file, a database) is an external
/// collaborator outside this crate's scope.
#[async_trait::async_trait]
pub trait MemoryPersister: Send + Sync {
    async fn persist(&self, facts: Vec<String>) -> anyhow::Result<()>;
}

/// Default persister for drivers that haven't wired up a real store: logs
/// extracted facts at info level so they are at least visible, then drops
/// them.
#[derive(Debug, Default)]
pub struct LoggingMemoryPersister;

#[async_trait::async_trait]
impl MemoryPersister for LoggingMemoryPersister {
    async fn persist(&self, facts: Vec<String>) -> anyhow::Result<()> {
        for fact in &facts {
            tracing::info!(fact = %fact, "memory extractor: fact extracted");
        }
        Ok(())
    }
}

/// Fires an LLM-based fact-extraction pass `debounce` after the *last*
/// `on_complete` in a burst (e.g. several back-to-back turns sharing this
/// hook), rather than after every single one. A `generation` counter lets a
/// later `on_complete` invalidate an in-flight, not-yet-fired debounce timer
/// cheaply, without a lock: the spawned task wakes, checks its captured
/// generation against the current one, and gives up if a newer completion
/// has since landed.
pub struct MemoryExtractor {
    model: Arc<dyn ModelProvider>,
    persister: Arc<dyn MemoryPersister>,
    debounce: Duration,
    generation: Arc<AtomicU64>,
}

impl MemoryExtractor {
    /// Debounces 30s, matching the spec's default.
    pub fn new(model: Arc<dyn ModelProvider>, persister: Arc<dyn MemoryPersister>) -> Self {
        Self::with_debounce(model, persister, Duration::from_secs(30))
    }

    pub fn with_debounce(
        model: Arc<dyn ModelProvider>,
        persister: Arc<dyn MemoryPersister>,
        debounce: Duration,
    ) -> Self {
        Self {
            model,
            persister,
            debounce,
            generation: Arc::new(AtomicU64::new(0)),
        }
    }
}

#[async_trait::async_trait]
impl Hook for MemoryExtractor {
    fn name(&self) -> &str {
        "memory_extractor"
    }

    async fn on_complete(&self, messages: &[Message]) {
        if messages.is_empty() {
            return;
        }
        let my_generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let snapshot = messages.to_vec();
        let model = self.model.clone();
        let persister = self.persister.clone();
        let generation = self.generation.clone();
        let debounce = self.debounce;

        tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            if generation.load(Ordering::SeqCst) != my_generation {
                return;
            }
            match extract_facts(model.as_ref(), &snapshot).await {
                Ok(facts) if !facts.is_empty() => {
                    if let Err(e) = persister.persist(facts).await {
                        warn!("memory extractor: persist failed: {e}");
                    }
                }
                Ok(_) => {}
                Err(e) => warn!("memory extractor: extraction call failed: {e}"),
            }
        });
    }
}

/// Runs one non-streaming-in-spirit extraction call (the provider still
/// streams; the deltas are just concatenated) and parses `- fact` lines out
/// of the response.
async fn extract_facts(model: &dyn ModelProvider, history: &[Message]) -> anyhow::Result<Vec<String>> {
    let mut messages = history.to_vec();
    messages.push(Message::user(EXTRACTION_PROMPT));

    let req = CompletionRequest {
        messages,
        tools: vec![],
        stream: true,
        system_dynamic_suffix: None,
        cache_key: None,
    };
    let mut stream = model.complete(req).await?;
    let mut text = String::new();
    while let Some(event) = stream.next().await {
        if let ResponseEvent::TextDelta(delta) = event? {
            text.push_str(&delta);
        }
    }

    if text.trim().eq_ignore_ascii_case("NONE") {
        return Ok(Vec::new());
    }
    Ok(text
        .lines()
        .filter_map(|line| line.trim().strip_prefix("- "))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentrt_model::ResponseEvent;
    use std::sync::Mutex;
    use tokio::time::timeout;

    struct RecordingPersister {
        calls: Mutex<Vec<Vec<String>>>,
    }

    impl RecordingPersister {
        fn new() -> Self {
            Self { calls: Mutex::new(Vec::new()) }
        }
    }

    #[async_trait::async_trait]
    impl MemoryPersister for RecordingPersister {
        async fn persist(&self, facts: Vec<String>) -> anyhow::Result<()> {
            self.calls.lock().unwrap().push(facts);
            Ok(())
        }
    }

    fn script(text: &str) -> Vec<ResponseEvent> {
        vec![ResponseEvent::TextDelta(text.to_string()), ResponseEvent::Done]
    }

    #[tokio::test]
    async fn extracts_fact_lines_from_response() {
        let model = Arc::new(agentrt_model::ScriptedMockProvider::new(vec![script(
            "- user prefers tabs over spaces\n- project uses conventional commits",
        )]));
        let facts = extract_facts(model.as_ref(), &[Message::user("hi")]).await.unwrap();
        assert_eq!(
            facts,
            vec!["user prefers tabs over spaces", "project uses conventional commits"]
        );
    }

    #[tokio::test]
    async fn none_response_yields_no_facts() {
        let model = Arc::new(agentrt_model::ScriptedMockProvider::new(vec![script("NONE")]));
        let facts = extract_facts(model.as_ref(), &[Message::user("hi")]).await.unwrap();
        assert!(facts.is_empty());
    }

    #[tokio::test]
    async fn debounced_extraction_persists_after_quiet_period() {
        let model = Arc::new(agentrt_model::ScriptedMockProvider::new(vec![script(
            "- remembered fact",
        )]));
        let persister = Arc::new(RecordingPersister::new());
        let hook = MemoryExtractor::with_debounce(model, persister.clone(), Duration::from_millis(20));

        hook.on_complete(&[Message::user("hello"), Message::assistant("hi there")]).await;
        timeout(Duration::from_secs(1), async {
            loop {
                if !persister.calls.lock().unwrap().is_empty() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("extraction did not fire within timeout");

        let calls = persister.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0], vec!["remembered fact".to_string()]);
    }

    #[tokio::test]
    async fn rapid_completions_debounce_into_a_single_extraction() {
        let model = Arc::new(agentrt_model::ScriptedMockProvider::new(vec![
            script("- fact one"),
            script("- fact two"),
        ]));
        let persister = Arc::new(RecordingPersister::new());
        let hook = MemoryExtractor::with_debounce(model, persister.clone(), Duration::from_millis(50));

        hook.on_complete(&[Message::user("first turn")]).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        hook.on_complete(&[Message::user("second turn")]).await;

        tokio::time::sleep(Duration::from_millis(150)).await;

        let calls = persister.calls.lock().unwrap();
        assert_eq!(calls.len(), 1, "only the last debounce window should fire");
    }
}
