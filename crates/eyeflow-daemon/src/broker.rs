// SPDX-License-Identifier: MIT OR Apache-2.0
//! A logging-only [`Broker`] used when no real message broker is wired up.
//!
//! Kafka (or any other messaging broker) is a pluggable external system
//! per the platform's own scope note ("messaging brokers... HTTP
//! APIs" are collaborators, not something this kernel implements). This
//! stands in for one so `eyeflow-audit-export` always has something to
//! publish to; swap it for a real `rdkafka`-backed `Broker` to talk to an
//! actual cluster.

use async_trait::async_trait;
use eyeflow_audit_export::{AuditWireEvent, Broker, PublishHeaders};
use eyeflow_core::EyeflowError;

/// Publishes by logging at `info` level instead of reaching a real broker.
pub struct LoggingBroker;

#[async_trait]
impl Broker for LoggingBroker {
    async fn publish(
        &self,
        topic: &str,
        key: &str,
        event: &AuditWireEvent,
        headers: &PublishHeaders,
    ) -> Result<(), EyeflowError> {
        tracing::info!(
            topic,
            key,
            event_id = %event.event_id,
            event_type = ?event.event_type,
            node_id = %headers.node_id,
            "audit event published (logging broker, no external transport)"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eyeflow_audit::{AuditChain, AuditEventType};
    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;
    use serde_json::json;

    #[tokio::test]
    async fn logging_broker_always_succeeds() {
        let chain = AuditChain::new("node-1", SigningKey::generate(&mut OsRng));
        let event = chain
            .append(eyeflow_audit::AppendInput {
                workflow_id: eyeflow_core::WorkflowId::new(),
                workflow_version: None,
                instruction_id: None,
                event_type: AuditEventType::ExecutionStart,
                input: json!({}),
                output: json!({}),
                duration_ms: 0,
                details: json!({}),
            })
            .await
            .unwrap();
        let wire: AuditWireEvent = (&event).into();
        let headers = PublishHeaders {
            event_type: "EXECUTION_START".to_string(),
            node_id: "node-1".to_string(),
            workflow_id: event.workflow_id.to_string(),
            chain_id: "node-1".to_string(),
        };
        LoggingBroker.publish("audit-events", "wf", &wire, &headers).await.unwrap();
    }
}
