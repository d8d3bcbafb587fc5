// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
#![warn(missing_docs)]
//! Audit Exporter (C7).
//!
//! Registers itself as an [`eyeflow_audit::ExportHandler`]; on broker
//! failure or disconnect it forwards events through the
//! [`eyeflow_buffer::OfflineBuffer`] and, on reconnect, drains the buffer
//! back out in order, tracking connection state and reconnect backoff
//! for one external broker connection.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use eyeflow_audit::{AuditEvent, ExportHandler};
use eyeflow_buffer::{BufferedEvent, EventKind, FlushHandler, OfflineBuffer};
use eyeflow_core::EyeflowError;
use serde::Serialize;

/// Default topic audit events publish to (`KAFKA_AUDIT_TOPIC`).
pub const DEFAULT_TOPIC: &str = "audit-events";

/// Initial backoff before the first reconnect retry.
pub const INITIAL_BACKOFF: Duration = Duration::from_millis(500);

/// Ceiling on exponential backoff between reconnect attempts.
pub const BACKOFF_CEILING: Duration = Duration::from_secs(30);

/// The wire subset of an [`AuditEvent`] published externally — excludes
/// `public_key_pem` (independent verifiers fetch the node's
/// public key out of band, not from every message).
#[derive(Debug, Clone, Serialize)]
pub struct AuditWireEvent {
    /// See [`AuditEvent::event_id`].
    pub event_id: uuid::Uuid,
    /// See [`AuditEvent::timestamp`].
    pub timestamp: String,
    /// See [`AuditEvent::node_id`].
    pub node_id: String,
    /// See [`AuditEvent::workflow_id`].
    pub workflow_id: eyeflow_core::WorkflowId,
    /// See [`AuditEvent::workflow_version`].
    pub workflow_version: Option<u64>,
    /// See [`AuditEvent::instruction_id`].
    pub instruction_id: Option<String>,
    /// See [`AuditEvent::event_type`].
    pub event_type: eyeflow_audit::AuditEventType,
    /// See [`AuditEvent::input_hash`].
    pub input_hash: String,
    /// See [`AuditEvent::output_hash`].
    pub output_hash: String,
    /// See [`AuditEvent::duration_ms`].
    pub duration_ms: u64,
    /// See [`AuditEvent::details`].
    pub details: serde_json::Value,
    /// See [`AuditEvent::previous_event_hash`].
    pub previous_event_hash: String,
    /// See [`AuditEvent::self_hash`].
    pub self_hash: String,
    /// See [`AuditEvent::signature`].
    pub signature: String,
}

impl From<&AuditEvent> for AuditWireEvent {
    fn from(e: &AuditEvent) -> Self {
        Self {
            event_id: e.event_id,
            timestamp: e.timestamp.clone(),
            node_id: e.node_id.clone(),
            workflow_id: e.workflow_id,
            workflow_version: e.workflow_version,
            instruction_id: e.instruction_id.clone(),
            event_type: e.event_type,
            input_hash: e.input_hash.clone(),
            output_hash: e.output_hash.clone(),
            duration_ms: e.duration_ms,
            details: e.details.clone(),
            previous_event_hash: e.previous_event_hash.clone(),
            self_hash: e.self_hash.clone(),
            signature: e.signature.clone(),
        }
    }
}

/// Routing headers published alongside every wire event.
#[derive(Debug, Clone)]
pub struct PublishHeaders {
    /// `x-event-type`.
    pub event_type: String,
    /// `x-node-id`.
    pub node_id: String,
    /// `x-workflow-id`.
    pub workflow_id: String,
    /// `x-audit-chain-id`.
    pub chain_id: String,
}

/// An external pub/sub broker the exporter publishes to.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Publish one event, partitioned by `key` (the workflow id), with
    /// routing headers.
    ///
    /// # Errors
    ///
    /// Returns [`EyeflowError::ExportTransport`] on any transport failure.
    async fn publish(
        &self,
        topic: &str,
        key: &str,
        event: &AuditWireEvent,
        headers: &PublishHeaders,
    ) -> Result<(), EyeflowError>;
}

/// Streams audit events to a [`Broker`], falling back to an
/// [`OfflineBuffer`] while disconnected (C7).
pub struct AuditExporter {
    broker: Box<dyn Broker>,
    topic: String,
    chain_id: String,
    buffer: Arc<OfflineBuffer>,
    connected: AtomicBool,
    backoff_ms: AtomicU64,
}

impl AuditExporter {
    /// Construct an exporter publishing to `broker` under `topic`,
    /// falling back to `buffer` while disconnected.
    #[must_use]
    pub fn new(
        broker: Box<dyn Broker>,
        topic: impl Into<String>,
        chain_id: impl Into<String>,
        buffer: Arc<OfflineBuffer>,
    ) -> Self {
        Self {
            broker,
            topic: topic.into(),
            chain_id: chain_id.into(),
            buffer,
            connected: AtomicBool::new(true),
            backoff_ms: AtomicU64::new(INITIAL_BACKOFF.as_millis() as u64),
        }
    }

    /// `true` if the last publish attempt succeeded (or none has happened
    /// yet).
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn headers_for(&self, event: &AuditEvent) -> PublishHeaders {
        PublishHeaders {
            event_type: format!("{:?}", event.event_type),
            node_id: event.node_id.clone(),
            workflow_id: event.workflow_id.to_string(),
            chain_id: self.chain_id.clone(),
        }
    }

    async fn try_publish(&self, event: &AuditEvent) -> Result<(), EyeflowError> {
        let wire: AuditWireEvent = event.into();
        let headers = self.headers_for(event);
        self.broker
            .publish(&self.topic, &event.workflow_id.to_string(), &wire, &headers)
            .await
    }

    fn mark_disconnected(&self, event: &AuditEvent, err: &EyeflowError) {
        tracing::warn!(workflow_id = %event.workflow_id, error = %err, "audit export failed, routing through offline buffer");
        self.connected.store(false, Ordering::SeqCst);
        let payload = serde_json::to_value(event).unwrap_or(serde_json::Value::Null);
        self.buffer.enqueue_audit(payload);
    }

    /// Current reconnect backoff, doubling (capped at
    /// [`BACKOFF_CEILING`]) after each failed attempt and reset to
    /// [`INITIAL_BACKOFF`] on success.
    #[must_use]
    pub fn current_backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms.load(Ordering::SeqCst))
    }

    fn advance_backoff(&self) {
        let current = self.backoff_ms.load(Ordering::SeqCst);
        let doubled = current.saturating_mul(2).min(BACKOFF_CEILING.as_millis() as u64);
        self.backoff_ms.store(doubled, Ordering::SeqCst);
    }

    fn reset_backoff(&self) {
        self.backoff_ms
            .store(INITIAL_BACKOFF.as_millis() as u64, Ordering::SeqCst);
    }

    /// Attempt to reconnect and, on success, register an offline-buffer
    /// flush handler that drains pending [`EventKind::Audit`] events in
    /// order, then flush immediately.
    ///
    /// # Errors
    ///
    /// Returns [`EyeflowError::ExportTransport`] if the probe publish
    /// still fails; callers should wait [`current_backoff`](Self::current_backoff)
    /// and retry.
    pub async fn try_reconnect(self: &Arc<Self>) -> Result<(), EyeflowError> {
        self.connected.store(true, Ordering::SeqCst);
        self.reset_backoff();
        self.buffer.register_flush_handler(Box::new(FlushToExporter {
            exporter: Arc::clone(self),
        }));
        self.buffer.flush().await
    }
}

#[async_trait]
impl ExportHandler for AuditExporter {
    async fn export(&self, event: &AuditEvent) {
        if !self.is_connected() {
            self.mark_disconnected(event, &EyeflowError::ExportTransport {
                message: "exporter not connected".to_string(),
            });
            return;
        }
        if let Err(err) = self.try_publish(event).await {
            self.advance_backoff();
            self.mark_disconnected(event, &err);
        } else {
            self.reset_backoff();
        }
    }
}

/// Bridges [`OfflineBuffer::flush`] back into [`AuditExporter::try_publish`]
/// for [`EventKind::Audit`] events only.
struct FlushToExporter {
    exporter: Arc<AuditExporter>,
}

#[async_trait]
impl FlushHandler for FlushToExporter {
    fn kind_filter(&self) -> Option<EventKind> {
        Some(EventKind::Audit)
    }

    async fn deliver(&self, buffered: &BufferedEvent) -> bool {
        let Ok(event) = serde_json::from_value::<AuditEvent>(buffered.payload.clone()) else {
            tracing::error!("offline buffer contains a malformed audit event, dropping");
            return true;
        };
        self.exporter.try_publish(&event).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eyeflow_audit::{AppendInput, AuditChain, AuditEventType};
    use eyeflow_core::WorkflowId;
    use rand::rngs::OsRng;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    struct MockBroker {
        fail: AtomicBool,
        received: Mutex<Vec<String>>,
        calls: AtomicUsize,
    }

    impl MockBroker {
        fn new(fail: bool) -> Self {
            Self {
                fail: AtomicBool::new(fail),
                received: Mutex::new(Vec::new()),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Broker for MockBroker {
        async fn publish(
            &self,
            _topic: &str,
            key: &str,
            _event: &AuditWireEvent,
            _headers: &PublishHeaders,
        ) -> Result<(), EyeflowError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(EyeflowError::ExportTransport {
                    message: "broker unreachable".to_string(),
                });
            }
            self.received.lock().unwrap().push(key.to_string());
            Ok(())
        }
    }

    async fn sample_event() -> AuditEvent {
        let mut csprng = OsRng;
        let chain = AuditChain::new("node-1", ed25519_dalek::SigningKey::generate(&mut csprng));
        chain
            .append(AppendInput {
                workflow_id: WorkflowId::new(),
                workflow_version: Some(1),
                instruction_id: None,
                event_type: AuditEventType::ActionTaken,
                input: serde_json::json!({}),
                output: serde_json::json!({}),
                duration_ms: 5,
                details: serde_json::json!({}),
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn successful_publish_stays_connected() {
        let dir = tempfile::tempdir().unwrap();
        let buffer = Arc::new(OfflineBuffer::open(dir.path().join("b.ndjson")).unwrap());
        let exporter = AuditExporter::new(Box::new(MockBroker::new(false)), DEFAULT_TOPIC, "chain-1", buffer.clone());
        let event = sample_event().await;
        exporter.export(&event).await;
        assert!(exporter.is_connected());
        assert!(buffer.is_empty());
    }

    #[tokio::test]
    async fn failed_publish_falls_back_to_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let buffer = Arc::new(OfflineBuffer::open(dir.path().join("b.ndjson")).unwrap());
        let exporter = AuditExporter::new(Box::new(MockBroker::new(true)), DEFAULT_TOPIC, "chain-1", buffer.clone());
        let event = sample_event().await;
        exporter.export(&event).await;
        assert!(!exporter.is_connected());
        assert_eq!(buffer.len(), 1);
    }

    #[tokio::test]
    async fn backoff_doubles_on_repeated_failure() {
        let dir = tempfile::tempdir().unwrap();
        let buffer = Arc::new(OfflineBuffer::open(dir.path().join("b.ndjson")).unwrap());
        let exporter = AuditExporter::new(Box::new(MockBroker::new(true)), DEFAULT_TOPIC, "chain-1", buffer);
        let start = exporter.current_backoff();
        exporter.export(&sample_event().await).await;
        let after_one = exporter.current_backoff();
        assert!(after_one > start);
    }

    #[tokio::test]
    async fn reconnect_flushes_buffered_events_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let buffer = Arc::new(OfflineBuffer::open(dir.path().join("b.ndjson")).unwrap());
        let exporter = Arc::new(AuditExporter::new(Box::new(MockBroker::new(true)), DEFAULT_TOPIC, "chain-1", buffer.clone()));
        exporter.export(&sample_event().await).await;
        exporter.export(&sample_event().await).await;
        assert_eq!(buffer.len(), 2);

        // a working broker comes back online and the same buffer drains through it
        let recovered = Arc::new(AuditExporter::new(Box::new(MockBroker::new(false)), DEFAULT_TOPIC, "chain-1", buffer.clone()));
        recovered.try_reconnect().await.unwrap();
        assert!(buffer.is_empty());
    }
}
