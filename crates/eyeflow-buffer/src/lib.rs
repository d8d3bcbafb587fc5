// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
#![warn(missing_docs)]
//! Offline Buffer (C5).
//!
//! A bounded FIFO of audit events, execution results, and trigger fires,
//! persisted as newline-delimited JSON so a process restart while
//! disconnected doesn't lose queued work. Grounded on this workspace's
//! JSONL wire codec (`sidecar-kit/src/codec.rs`) for the one-object-per-line
//! encoding, generalized here from a stateless encode/decode pair into a
//! stateful queue that owns its backing file.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use eyeflow_core::EyeflowError;
use serde::{Deserialize, Serialize};

/// Queue bound past which the oldest entry is dropped (`MAX_QUEUE_SIZE`).
pub const MAX_QUEUE_SIZE: usize = 10_000;

/// Default interval between reconnect-flush retries.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(15);

/// The three event kinds the buffer accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A crypto audit chain event (C6).
    Audit,
    /// A completed execution record.
    ExecutionResult,
    /// A trigger activation firing.
    TriggerFire,
}

/// One buffered event: its kind, plus the opaque payload to redeliver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferedEvent {
    /// Which of the three accepted kinds this is.
    pub kind: EventKind,
    /// The event payload, exactly as it will be redelivered.
    pub payload: serde_json::Value,
}

/// A consumer registered to drain buffered events once connectivity is
/// restored.
///
/// `kind_filter` scopes which events this handler is offered; a handler
/// interested only in [`EventKind::Audit`] (as the audit exporter is,
/// once disconnected) never sees execution results or trigger fires.
#[async_trait]
pub trait FlushHandler: Send + Sync {
    /// Restrict delivery to one kind, or `None` for every kind.
    fn kind_filter(&self) -> Option<EventKind> {
        None
    }

    /// Attempt to deliver one event. `true` means it may be dropped from
    /// the queue; `false` means it must be retried later.
    async fn deliver(&self, event: &BufferedEvent) -> bool;
}

/// Bounded, disk-backed FIFO queue with flush-on-reconnect semantics.
pub struct OfflineBuffer {
    path: PathBuf,
    max_queue_size: usize,
    retry_interval: Duration,
    queue: Mutex<VecDeque<BufferedEvent>>,
    handlers: Mutex<Vec<Box<dyn FlushHandler>>>,
}

impl OfflineBuffer {
    /// Open (or create) a buffer backed by newline-delimited JSON at
    /// `path`, loading any events persisted from a prior shutdown.
    ///
    /// # Errors
    ///
    /// Returns [`EyeflowError::Internal`] if an existing file at `path`
    /// cannot be read or contains a line that fails to parse.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, EyeflowError> {
        let path = path.into();
        let queue = if path.exists() {
            load_from_disk(&path)?
        } else {
            VecDeque::new()
        };
        Ok(Self {
            path,
            max_queue_size: MAX_QUEUE_SIZE,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            queue: Mutex::new(queue),
            handlers: Mutex::new(Vec::new()),
        })
    }

    /// Override the default queue bound.
    #[must_use]
    pub fn with_max_queue_size(mut self, max: usize) -> Self {
        self.max_queue_size = max;
        self
    }

    /// Override the default retry interval.
    #[must_use]
    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    /// Append an audit chain event.
    pub fn enqueue_audit(&self, payload: serde_json::Value) {
        self.push(EventKind::Audit, payload);
    }

    /// Append an execution result.
    pub fn enqueue_execution_result(&self, payload: serde_json::Value) {
        self.push(EventKind::ExecutionResult, payload);
    }

    /// Append a trigger fire.
    pub fn enqueue_trigger_fire(&self, payload: serde_json::Value) {
        self.push(EventKind::TriggerFire, payload);
    }

    fn push(&self, kind: EventKind, payload: serde_json::Value) {
        let mut queue = self.queue.lock().expect("offline buffer mutex poisoned");
        if queue.len() >= self.max_queue_size {
            queue.pop_front();
            tracing::warn!(
                ?kind,
                max = self.max_queue_size,
                "offline buffer at capacity, dropping oldest event"
            );
        }
        queue.push_back(BufferedEvent { kind, payload });
    }

    /// Register a consumer that [`flush`](Self::flush) will offer
    /// matching events to, in registration order.
    pub fn register_flush_handler(&self, handler: Box<dyn FlushHandler>) {
        self.handlers.lock().expect("offline buffer mutex poisoned").push(handler);
    }

    /// Number of events currently queued.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.lock().expect("offline buffer mutex poisoned").len()
    }

    /// `true` if the queue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drain the queue against every registered handler, in order.
    ///
    /// An event is removed once some handler whose `kind_filter` matches
    /// it returns `true`. Anything left after all handlers have had a
    /// turn is rewritten to disk so it survives a restart.
    ///
    /// # Errors
    ///
    /// Returns [`EyeflowError::Internal`] if rewriting the backing file
    /// fails.
    pub async fn flush(&self) -> Result<(), EyeflowError> {
        let snapshot: Vec<BufferedEvent> = {
            let queue = self.queue.lock().expect("offline buffer mutex poisoned");
            queue.iter().cloned().collect()
        };

        let mut delivered = vec![false; snapshot.len()];
        let handlers = self.handlers.lock().expect("offline buffer mutex poisoned");
        for handler in handlers.iter() {
            for (i, event) in snapshot.iter().enumerate() {
                if delivered[i] {
                    continue;
                }
                if let Some(filter) = handler.kind_filter() {
                    if filter != event.kind {
                        continue;
                    }
                }
                if handler.deliver(event).await {
                    delivered[i] = true;
                }
            }
        }
        drop(handlers);

        let remaining: VecDeque<BufferedEvent> = snapshot
            .into_iter()
            .zip(delivered)
            .filter_map(|(event, was_delivered)| (!was_delivered).then_some(event))
            .collect();

        {
            let mut queue = self.queue.lock().expect("offline buffer mutex poisoned");
            *queue = remaining;
        }
        self.persist()
    }

    /// Signal a connectivity change.
    ///
    /// `false` opens buffering mode (no-op beyond the log line — events
    /// keep accumulating via `enqueue_*`); `true` triggers an immediate
    /// [`flush`](Self::flush).
    ///
    /// # Errors
    ///
    /// Propagates [`flush`](Self::flush)'s error.
    pub async fn notify_connected(&self, connected: bool) -> Result<(), EyeflowError> {
        if connected {
            tracing::info!("offline buffer reconnected, flushing");
            self.flush().await
        } else {
            tracing::warn!("offline buffer entering buffering mode");
            Ok(())
        }
    }

    /// Retry interval configured for reconnect polling ("retry
    /// timer (default 15 s) polls until reconnected").
    #[must_use]
    pub fn retry_interval(&self) -> Duration {
        self.retry_interval
    }

    /// Persist the remaining queue to disk. Called by [`flush`] and
    /// should also be called on process shutdown.
    ///
    /// # Errors
    ///
    /// Returns [`EyeflowError::Internal`] on any I/O failure.
    pub fn persist(&self) -> Result<(), EyeflowError> {
        let queue = self.queue.lock().expect("offline buffer mutex poisoned");
        persist_to_disk(&self.path, queue.iter())
    }
}

fn load_from_disk(path: &Path) -> Result<VecDeque<BufferedEvent>, EyeflowError> {
    let content = std::fs::read_to_string(path).map_err(|e| EyeflowError::Internal {
        message: format!("failed to read offline buffer at {}: {e}", path.display()),
    })?;
    let mut queue = VecDeque::new();
    for line in content.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let event: BufferedEvent = serde_json::from_str(line).map_err(|e| EyeflowError::Internal {
            message: format!("corrupt offline buffer line: {e}"),
        })?;
        queue.push_back(event);
    }
    Ok(queue)
}

fn persist_to_disk<'a>(
    path: &Path,
    events: impl Iterator<Item = &'a BufferedEvent>,
) -> Result<(), EyeflowError> {
    let mut out = String::new();
    for event in events {
        let line = serde_json::to_string(event).map_err(EyeflowError::from_serde)?;
        out.push_str(&line);
        out.push('\n');
    }
    std::fs::write(path, out).map_err(|e| EyeflowError::Internal {
        message: format!("failed to persist offline buffer to {}: {e}", path.display()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct AlwaysDeliver {
        count: Arc<AtomicUsize>,
        filter: Option<EventKind>,
    }

    #[async_trait]
    impl FlushHandler for AlwaysDeliver {
        fn kind_filter(&self) -> Option<EventKind> {
            self.filter
        }

        async fn deliver(&self, _event: &BufferedEvent) -> bool {
            self.count.fetch_add(1, Ordering::SeqCst);
            true
        }
    }

    struct NeverDeliver;

    #[async_trait]
    impl FlushHandler for NeverDeliver {
        async fn deliver(&self, _event: &BufferedEvent) -> bool {
            false
        }
    }

    #[test]
    fn drops_oldest_when_full() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("buf.ndjson");
        let buffer = OfflineBuffer::open(&path).unwrap().with_max_queue_size(2);
        buffer.enqueue_audit(serde_json::json!({"n": 1}));
        buffer.enqueue_audit(serde_json::json!({"n": 2}));
        buffer.enqueue_audit(serde_json::json!({"n": 3}));
        assert_eq!(buffer.len(), 2);
    }

    #[tokio::test]
    async fn flush_delivers_and_clears_matching_events() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("buf.ndjson");
        let buffer = OfflineBuffer::open(&path).unwrap();
        buffer.enqueue_audit(serde_json::json!({"n": 1}));
        buffer.enqueue_trigger_fire(serde_json::json!({"n": 2}));

        let count = Arc::new(AtomicUsize::new(0));
        buffer.register_flush_handler(Box::new(AlwaysDeliver {
            count: Arc::clone(&count),
            filter: Some(EventKind::Audit),
        }));
        buffer.flush().await.unwrap();

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(buffer.len(), 1);
    }

    #[tokio::test]
    async fn undelivered_events_are_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("buf.ndjson");
        let buffer = OfflineBuffer::open(&path).unwrap();
        buffer.enqueue_audit(serde_json::json!({"n": 1}));
        buffer.register_flush_handler(Box::new(NeverDeliver));
        buffer.flush().await.unwrap();
        assert_eq!(buffer.len(), 1);

        let reloaded = OfflineBuffer::open(&path).unwrap();
        assert_eq!(reloaded.len(), 1);
    }

    #[tokio::test]
    async fn notify_connected_true_triggers_flush() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("buf.ndjson");
        let buffer = OfflineBuffer::open(&path).unwrap();
        buffer.enqueue_execution_result(serde_json::json!({"status": "SUCCEEDED"}));
        let count = Arc::new(AtomicUsize::new(0));
        buffer.register_flush_handler(Box::new(AlwaysDeliver {
            count: Arc::clone(&count),
            filter: None,
        }));
        buffer.notify_connected(true).await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(buffer.is_empty());
    }

    #[test]
    fn persist_then_reload_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("buf.ndjson");
        let buffer = OfflineBuffer::open(&path).unwrap();
        buffer.enqueue_audit(serde_json::json!({"a": true}));
        buffer.persist().unwrap();

        let reloaded = OfflineBuffer::open(&path).unwrap();
        assert_eq!(reloaded.len(), 1);
    }
}
