// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Typed pub/sub event bus with an optional write-ahead log.
//!
//! Decouples the agent loop from whatever is watching it (a TUI, a CI
//! runner, a metrics exporter). Publish is fire-and-forget: a slow or wedged
//! subscriber never blocks the loop, and a full subscriber channel drops the
//! event with a warning rather than backing up the publisher.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tokio::fs::OpenOptions;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::warn;

const WILDCARD: &str = "*";

/// One message carried on the bus. `seq` is a per-bus monotonic counter
/// (not wall-clock time) so ordering survives even if the system clock
/// jumps; `payload` is left as JSON so the bus does not need to know every
/// event type a consumer might ever define.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusEvent {
    pub seq: u64,
    pub topic: String,
    pub payload: serde_json::Value,
}

struct Subscriber {
    topic: String,
    tx: mpsc::Sender<BusEvent>,
}

/// In-memory pub/sub bus. Subscribers register for a topic (or `"*"` for
/// everything) and receive events over a bounded channel.
pub struct EventBus {
    subscribers: Mutex<Vec<Subscriber>>,
    channel_capacity: usize,
    seq: AtomicU64,
}

impl EventBus {
    pub fn new(channel_capacity: usize) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            channel_capacity: channel_capacity.max(1),
            seq: AtomicU64::new(0),
        }
    }

    /// Subscribe to a topic. Pass `"*"` to receive every event published on
    /// this bus regardless of topic.
    pub fn subscribe(&self, topic: impl Into<String>) -> mpsc::Receiver<BusEvent> {
        let (tx, rx) = mpsc::channel(self.channel_capacity);
        let mut subs = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subs.push(Subscriber { topic: topic.into(), tx });
        rx
    }

    /// Publish an event. Never blocks: delivery to each matching subscriber
    /// happens on its own spawned task via `try_send`, so a full or dropped
    /// subscriber channel only loses that one event (logged) and never
    /// stalls the publisher or other subscribers.
    pub fn publish(&self, topic: impl Into<String>, payload: serde_json::Value) -> BusEvent {
        let topic = topic.into();
        let event = BusEvent {
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            topic,
            payload,
        };
        self.dispatch(event.clone());
        event
    }

    /// Fan out to every subscriber whose topic matches, dropping dead
    /// (closed) subscribers as it goes.
    fn dispatch(&self, event: BusEvent) {
        let mut subs = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subs.retain(|s| {
            if s.topic != WILDCARD && s.topic != event.topic {
                return true;
            }
            let tx = s.tx.clone();
            if tx.is_closed() {
                return false;
            }
            let ev = event.clone();
            let topic_for_warn = ev.topic.clone();
            tokio::spawn(async move {
                if let Err(err) = tx.try_send(ev) {
                    warn!(topic = %topic_for_warn, "event bus subscriber channel full or closed, dropping event: {err}");
                }
            });
            true
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(128)
    }
}

/// Default rotation threshold: once the WAL file exceeds this many bytes, a
/// fresh append starts a new segment (the old one is left on disk for
/// whatever retention policy the deployment wants; this module only keeps
/// the current segment's path).
const DEFAULT_ROTATE_BYTES: u64 = 10 * 1024 * 1024;

/// Wraps [`EventBus`] with a JSON-lines write-ahead log, so a crashed
/// process can replay everything that was published before it died.
pub struct PersistentEventBus {
    inner: EventBus,
    wal_path: Mutex<PathBuf>,
    rotate_bytes: u64,
}

impl PersistentEventBus {
    pub fn new(channel_capacity: usize, wal_path: impl Into<PathBuf>) -> Self {
        Self {
            inner: EventBus::new(channel_capacity),
            wal_path: Mutex::new(wal_path.into()),
            rotate_bytes: DEFAULT_ROTATE_BYTES,
        }
    }

    pub fn with_rotate_bytes(mut self, bytes: u64) -> Self {
        self.rotate_bytes = bytes;
        self
    }

    pub fn subscribe(&self, topic: impl Into<String>) -> mpsc::Receiver<BusEvent> {
        self.inner.subscribe(topic)
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscriber_count()
    }

    /// Publish to in-memory subscribers and append a JSON-line record to the
    /// WAL. WAL write failures are logged, not propagated: a full disk must
    /// not take down the agent loop.
    pub async fn publish(&self, topic: impl Into<String>, payload: serde_json::Value) -> BusEvent {
        let event = self.inner.publish(topic, payload);
        if let Err(err) = self.append_to_wal(&event).await {
            warn!("failed to append event to WAL: {err}");
        }
        event
    }

    async fn append_to_wal(&self, event: &BusEvent) -> std::io::Result<()> {
        self.maybe_rotate().await?;
        let path = self.wal_path.lock().unwrap_or_else(|e| e.into_inner()).clone();
        let mut line = serde_json::to_string(event).map_err(std::io::Error::other)?;
        line.push('\n');
        let mut file = OpenOptions::new().create(true).append(true).open(&path).await?;
        file.write_all(line.as_bytes()).await?;
        Ok(())
    }

    async fn maybe_rotate(&self) -> std::io::Result<()> {
        let path = self.wal_path.lock().unwrap_or_else(|e| e.into_inner()).clone();
        let len = match tokio::fs::metadata(&path).await {
            Ok(meta) => meta.len(),
            Err(_) => return Ok(()), // file does not exist yet, nothing to rotate
        };
        if len < self.rotate_bytes {
            return Ok(());
        }
        let rotated = rotated_path(&path);
        tokio::fs::rename(&path, &rotated).await?;
        Ok(())
    }

    /// Replay every event previously appended to `path`, in publish order.
    /// Malformed lines (a WAL truncated mid-write by a crash) are skipped.
    pub async fn replay(path: impl AsRef<Path>) -> std::io::Result<Vec<BusEvent>> {
        let mut contents = String::new();
        match tokio::fs::File::open(path.as_ref()).await {
            Ok(mut f) => {
                f.read_to_string(&mut contents).await?;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        }
        let events = contents
            .lines()
            .filter_map(|line| serde_json::from_str::<BusEvent>(line).ok())
            .collect();
        Ok(events)
    }

    /// Truncate the WAL to empty (used after a successful checkpoint that
    /// makes replay unnecessary).
    pub async fn truncate(&self) -> std::io::Result<()> {
        let path = self.wal_path.lock().unwrap_or_else(|e| e.into_inner()).clone();
        OpenOptions::new().create(true).write(true).truncate(true).open(&path).await?;
        Ok(())
    }

    pub fn wal_path(&self) -> PathBuf {
        self.wal_path.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

fn rotated_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "wal.jsonl".to_string());
    name.push_str(".1");
    path.with_file_name(name)
}

/// Sugar so callers that only care about per-topic fan-out statistics don't
/// need to reach into the subscriber list directly.
pub fn topic_matches(sub_topic: &str, event_topic: &str) -> bool {
    sub_topic == WILDCARD || sub_topic == event_topic
}

#[allow(dead_code)]
type TopicHandlers = HashMap<String, usize>;
