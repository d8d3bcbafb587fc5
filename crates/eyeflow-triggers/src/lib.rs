// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
#![warn(missing_docs)]
//! Trigger Drivers + Bus (C8).
//!
//! A [`Driver`] activates an [`Activation`] into a lazy stream of
//! [`TriggerEvent`]s; the [`TriggerBus`] merges every active stream into
//! one hot consumer that routes each event to the dispatcher registered
//! for its `workflow_id`, dropping with a warning if none is registered.
//! Grounded on this workspace's runtime event plumbing
//! (`abp-runtime/src/bus.rs`, `multiplex.rs`, `stream.rs`, and the
//! `abp-stream` crate they wrap): a filtered-subscription bus and a
//! fan-in multiplexer, generalized here from one process's own agent
//! events into many independently owned driver streams keyed by
//! `activationId`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use eyeflow_core::{EyeflowError, WorkflowId};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// One normalized event produced by a driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerEvent {
    /// Which driver produced this event.
    pub driver_id: String,
    /// The activation this event fired through.
    pub activation_id: String,
    /// Workflow this event is destined for.
    pub workflow_id: WorkflowId,
    /// ISO-8601 timestamp of the firing.
    pub timestamp: String,
    /// Driver-specific payload (already mapped into the internal shape).
    pub payload: serde_json::Value,
}

/// Describes one driver activation: which workflow it feeds and the
/// driver-specific configuration needed to start watching.
#[derive(Debug, Clone)]
pub struct Activation {
    /// Unique id for this activation, stable across restarts.
    pub activation_id: String,
    /// Driver that owns this activation.
    pub driver_id: String,
    /// Workflow this activation's events route to.
    pub workflow_id: WorkflowId,
    /// Driver-specific config (cron expression, path glob, topic name, ...).
    pub config: serde_json::Value,
}

/// The capability set every trigger source implements.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Begin watching for `activation`, returning a channel of events
    /// scoped to its workflow. The receiver end is handed to
    /// [`TriggerBus::add_stream`].
    ///
    /// # Errors
    ///
    /// Returns [`EyeflowError::Internal`] if the underlying source
    /// cannot be watched (e.g. path does not exist, broker unreachable).
    async fn activate(&self, activation: &Activation) -> Result<mpsc::Receiver<TriggerEvent>, EyeflowError>;

    /// Stop watching a previously activated source.
    ///
    /// # Errors
    ///
    /// Returns [`EyeflowError::Internal`] if the activation is unknown to
    /// this driver.
    async fn deactivate(&self, activation_id: &str) -> Result<(), EyeflowError>;
}

/// Receives every [`TriggerEvent`] routed to its workflow, in order.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Handle one event. The bus awaits this before pulling the next
    /// event off the merged stream, so a dispatcher that blocks stalls
    /// every workflow, not just its own — long-running work should be
    /// handed off (e.g. to the C13 orchestrator) rather than awaited here.
    async fn dispatch(&self, event: TriggerEvent);
}

struct StreamHandle {
    task: JoinHandle<()>,
    shutdown: oneshot::Sender<()>,
}

/// Merges every active driver stream into one hot consumer and routes
/// events to per-workflow dispatchers.
pub struct TriggerBus {
    dispatchers: Mutex<HashMap<WorkflowId, Arc<dyn Dispatcher>>>,
    streams: Mutex<HashMap<String, StreamHandle>>,
    tx: mpsc::Sender<TriggerEvent>,
    rx: Mutex<Option<mpsc::Receiver<TriggerEvent>>>,
}

impl TriggerBus {
    /// Construct an empty bus with the given merged-channel capacity.
    #[must_use]
    pub fn new(channel_capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(channel_capacity);
        Self {
            dispatchers: Mutex::new(HashMap::new()),
            streams: Mutex::new(HashMap::new()),
            tx,
            rx: Mutex::new(Some(rx)),
        }
    }

    /// Register the dispatcher invoked for every event whose
    /// `workflow_id` matches. Replaces any previously registered
    /// dispatcher for the same workflow.
    pub fn register_dispatcher(&self, workflow_id: WorkflowId, dispatcher: Arc<dyn Dispatcher>) {
        self.dispatchers
            .lock()
            .expect("trigger dispatch table mutex poisoned")
            .insert(workflow_id, dispatcher);
    }

    /// Remove the dispatcher for a workflow. Events that arrive after
    /// this call are dropped with a warning until a dispatcher is
    /// registered again.
    pub fn unregister_dispatcher(&self, workflow_id: WorkflowId) {
        self.dispatchers
            .lock()
            .expect("trigger dispatch table mutex poisoned")
            .remove(&workflow_id);
    }

    /// Register a driver-produced stream under `activation_id`, merging
    /// it into the bus's single hot consumer. `debounce` collapses
    /// events arriving within the window into the first one seen,
    /// matching [`Driver::activate`] callers that pass a noisy source
    /// (e.g. a filesystem watcher firing once per write syscall).
    pub fn add_stream(
        &self,
        activation_id: impl Into<String>,
        mut events: mpsc::Receiver<TriggerEvent>,
        debounce: Option<Duration>,
    ) {
        let activation_id = activation_id.into();
        let tx = self.tx.clone();
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let task = tokio::spawn(async move {
            let mut last_emit: Option<Instant> = None;
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    received = events.recv() => {
                        let Some(event) = received else { break };
                        if let Some(window) = debounce {
                            if let Some(prev) = last_emit {
                                if prev.elapsed() < window {
                                    continue;
                                }
                            }
                        }
                        last_emit = Some(Instant::now());
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        let mut streams = self.streams.lock().expect("trigger stream table mutex poisoned");
        if let Some(previous) = streams.insert(activation_id, StreamHandle { task, shutdown: shutdown_tx }) {
            let _ = previous.shutdown.send(());
            previous.task.abort();
        }
    }

    /// Cancel a previously registered stream. A no-op if unknown.
    pub fn remove_stream(&self, activation_id: &str) {
        let removed = self
            .streams
            .lock()
            .expect("trigger stream table mutex poisoned")
            .remove(activation_id);
        if let Some(handle) = removed {
            let _ = handle.shutdown.send(());
            handle.task.abort();
        }
    }

    /// Number of currently registered streams.
    #[must_use]
    pub fn stream_count(&self) -> usize {
        self.streams.lock().expect("trigger stream table mutex poisoned").len()
    }

    /// Drive the merged consumer loop: pull events off the internal
    /// channel and route each to its workflow's dispatcher, dropping
    /// with a warning if none is registered. Runs until every stream
    /// has been removed and the merged channel closes — intended to be
    /// spawned once for the process's lifetime.
    ///
    /// # Panics
    ///
    /// Panics if called more than once on the same bus.
    pub async fn run(&self) {
        let mut rx = self
            .rx
            .lock()
            .expect("trigger bus receiver mutex poisoned")
            .take()
            .expect("TriggerBus::run called more than once");

        while let Some(event) = rx.recv().await {
            let dispatcher = self
                .dispatchers
                .lock()
                .expect("trigger dispatch table mutex poisoned")
                .get(&event.workflow_id)
                .cloned();
            match dispatcher {
                Some(dispatcher) => dispatcher.dispatch(event).await,
                None => {
                    tracing::warn!(
                        workflow_id = %event.workflow_id,
                        driver_id = %event.driver_id,
                        activation_id = %event.activation_id,
                        "no dispatcher registered for workflow, dropping trigger event"
                    );
                }
            }
        }
    }

    /// Propagate a shutdown signal to every active stream.
    pub fn shutdown(&self) {
        let mut streams = self.streams.lock().expect("trigger stream table mutex poisoned");
        for (_, handle) in streams.drain() {
            let _ = handle.shutdown.send(());
            handle.task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct RecordingDispatcher {
        events: Arc<Mutex<Vec<TriggerEvent>>>,
    }

    #[async_trait]
    impl Dispatcher for RecordingDispatcher {
        async fn dispatch(&self, event: TriggerEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    fn event(workflow_id: WorkflowId, n: u64) -> TriggerEvent {
        TriggerEvent {
            driver_id: "cron".to_string(),
            activation_id: "act-1".to_string(),
            workflow_id,
            timestamp: format!("t{n}"),
            payload: serde_json::json!({ "n": n }),
        }
    }

    #[tokio::test]
    async fn routes_events_to_the_registered_dispatcher() {
        let bus = Arc::new(TriggerBus::new(16));
        let workflow_id = WorkflowId::new();
        let events = Arc::new(Mutex::new(Vec::new()));
        bus.register_dispatcher(
            workflow_id,
            Arc::new(RecordingDispatcher { events: events.clone() }),
        );

        let (tx, rx) = mpsc::channel(4);
        bus.add_stream("act-1", rx, None);
        let runner = tokio::spawn({
            let bus = bus.clone();
            async move { bus.run().await }
        });

        tx.send(event(workflow_id, 1)).await.unwrap();
        drop(tx);
        bus.remove_stream("act-1");
        tokio::time::sleep(Duration::from_millis(20)).await;
        bus.shutdown();
        let _ = tokio::time::timeout(Duration::from_millis(100), runner).await;

        assert_eq!(events.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unregistered_workflow_drops_without_panicking() {
        let bus = Arc::new(TriggerBus::new(16));
        let (tx, rx) = mpsc::channel(4);
        bus.add_stream("act-1", rx, None);
        let runner = tokio::spawn({
            let bus = bus.clone();
            async move { bus.run().await }
        });

        tx.send(event(WorkflowId::new(), 1)).await.unwrap();
        drop(tx);
        tokio::time::sleep(Duration::from_millis(20)).await;
        bus.shutdown();
        let _ = tokio::time::timeout(Duration::from_millis(100), runner).await;
    }

    #[tokio::test]
    async fn debounce_collapses_rapid_events() {
        let bus = Arc::new(TriggerBus::new(16));
        let workflow_id = WorkflowId::new();
        let events = Arc::new(Mutex::new(Vec::new()));
        bus.register_dispatcher(
            workflow_id,
            Arc::new(RecordingDispatcher { events: events.clone() }),
        );

        let (tx, rx) = mpsc::channel(8);
        bus.add_stream("act-1", rx, Some(Duration::from_millis(200)));
        let runner = tokio::spawn({
            let bus = bus.clone();
            async move { bus.run().await }
        });

        tx.send(event(workflow_id, 1)).await.unwrap();
        tx.send(event(workflow_id, 2)).await.unwrap();
        tx.send(event(workflow_id, 3)).await.unwrap();
        drop(tx);
        tokio::time::sleep(Duration::from_millis(20)).await;
        bus.shutdown();
        let _ = tokio::time::timeout(Duration::from_millis(100), runner).await;

        assert_eq!(events.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn remove_stream_stops_further_delivery() {
        let bus = Arc::new(TriggerBus::new(16));
        let workflow_id = WorkflowId::new();
        let events = Arc::new(Mutex::new(Vec::new()));
        bus.register_dispatcher(
            workflow_id,
            Arc::new(RecordingDispatcher { events: events.clone() }),
        );

        let (tx, rx) = mpsc::channel(8);
        bus.add_stream("act-1", rx, None);
        assert_eq!(bus.stream_count(), 1);
        bus.remove_stream("act-1");
        assert_eq!(bus.stream_count(), 0);

        // the sender is still open but nothing reads it now; send should
        // either fail or be ignored, never delivered.
        let _ = tx.try_send(event(workflow_id, 1));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(events.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn re_adding_a_stream_under_the_same_activation_replaces_the_old_one() {
        let bus = Arc::new(TriggerBus::new(16));
        let (_tx1, rx1) = mpsc::channel(4);
        bus.add_stream("act-1", rx1, None);
        let (_tx2, rx2) = mpsc::channel(4);
        bus.add_stream("act-1", rx2, None);
        assert_eq!(bus.stream_count(), 1);
    }
}
