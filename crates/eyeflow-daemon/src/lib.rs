// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
//! Composition root for one EyeFlow node.
//!
//! Wires the manifest, vault, cancellation bus, offline buffer, audit
//! chain (+ exporter), trigger bus, CDC processor, and orchestrator
//! together, and exposes a minimal operational readiness surface over
//! HTTP: just `/healthz` and `/status`, not a full product API.

/// Logging-only [`eyeflow_audit_export::Broker`] stand-in for a real
/// message broker.
pub mod broker;
/// Default `ServiceInvoker`/`ActionInvoker` wiring for a sandbox-less node.
pub mod invokers;
/// Ed25519 signing key resolution from PEM configuration.
pub mod keys;

use std::sync::Arc;

use axum::{extract::State, routing::get, Json, Router};
use eyeflow_audit::AuditChain;
use eyeflow_buffer::OfflineBuffer;
use eyeflow_cancel::CancellationBus;
use eyeflow_cdc::CdcProcessor;
use eyeflow_lifecycle::LifecycleRegistry;
use eyeflow_manifest::ServiceManifest;
use eyeflow_orchestrator::Orchestrator;
use eyeflow_triggers::TriggerBus;
use eyeflow_vault::Vault;
use serde::Serialize;

/// Every long-lived collaborator a running node holds, shared with
/// `Arc` across the trigger bus's dispatch tasks and the HTTP surface.
#[derive(Clone)]
pub struct AppState {
    /// Node identity stamped into audit events (`SVM_NODE_ID`).
    pub node_id: String,
    /// C1: read-only-after-startup service table.
    pub manifest: Arc<ServiceManifest>,
    /// C3: secret resolution.
    pub vault: Arc<Vault>,
    /// C4: per-execution cancellation signaling.
    pub cancellation: Arc<CancellationBus>,
    /// C5: offline durability for audit/result/trigger events.
    pub offline_buffer: Arc<OfflineBuffer>,
    /// C6: append-only signed audit chain.
    pub audit: Arc<AuditChain>,
    /// C8: merged trigger event bus.
    pub triggers: Arc<TriggerBus>,
    /// C9: CDC dedup + routing.
    pub cdc: Arc<CdcProcessor>,
    /// C12: project/version lifecycle state.
    pub lifecycle: Arc<LifecycleRegistry>,
    /// C13: drives one execution end to end.
    pub orchestrator: Arc<Orchestrator>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    node_id: String,
}

#[derive(Serialize)]
struct StatusResponse {
    node_id: String,
    manifest_entries: usize,
    audit_chain_len: usize,
    audit_chain_offline: bool,
    offline_buffer_len: usize,
    active_trigger_streams: usize,
}

async fn healthz(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        node_id: state.node_id,
    })
}

async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        node_id: state.node_id.clone(),
        manifest_entries: state.manifest.len(),
        audit_chain_len: state.audit.len(),
        audit_chain_offline: state.audit.is_offline(),
        offline_buffer_len: state.offline_buffer.len(),
        active_trigger_streams: state.triggers.stream_count(),
    })
}

/// Build the Axum router for this node's readiness surface.
#[must_use]
pub fn build_app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/status", get(status))
        .with_state(state)
}
