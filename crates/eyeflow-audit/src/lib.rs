// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
#![warn(missing_docs)]
//! Crypto Audit Chain (C6).
//!
//! A per-node singleton append-only log: every event carries a SHA-256
//! hash of its predecessor, a self-hash over its own body, and an Ed25519
//! signature over that self-hash, with export hooks and an offline
//! fallback for when the downstream broker is unreachable.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use eyeflow_buffer::OfflineBuffer;
use eyeflow_core::{sha256_of_canonical, EyeflowError, WorkflowId, GENESIS_HASH};
use serde::{Deserialize, Serialize};

/// The event kinds this chain carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditEventType {
    /// An execution began.
    ExecutionStart,
    /// An execution reached a terminal state.
    ExecutionComplete,
    /// An instruction took a recorded action.
    ActionTaken,
    /// A physical-world effect was committed.
    PhysicalAction,
    /// A fallback operand was applied after a dispatch failure.
    FallbackTriggered,
    /// The (compile-time) LLM parsing callout was invoked.
    LlmCall,
    /// A `VALIDATE` instruction's schema check passed.
    ValidationPass,
    /// A `VALIDATE` instruction's schema check failed.
    ValidationFail,
    /// One pass through a `LOOP` instruction's body.
    LoopIteration,
    /// A `LOOP` instruction's convergence register went truthy.
    LoopConverged,
    /// A `LOOP` instruction exceeded `maxIterations`.
    LoopTimeout,
    /// A `POSTCONDITION` instruction's predicate held.
    PostconditionPassed,
    /// A `POSTCONDITION` instruction's predicate failed.
    PostconditionFailed,
    /// A secret was resolved through the vault.
    VaultSecretFetched,
    /// A physical action requires a human to confirm before proceeding.
    HumanConfirmationRequired,
    /// A cancellation window elapsed without a cancel signal.
    CancellationWindowExpired,
    /// A security-relevant anomaly was detected (signature or chain failure).
    SecurityAlert,
}

/// Everything [`AuditChain::append`] needs to build one event, prior to
/// hashing and signing.
#[derive(Debug, Clone)]
pub struct AppendInput {
    /// Workflow this event belongs to.
    pub workflow_id: WorkflowId,
    /// Compiled workflow version, if applicable.
    pub workflow_version: Option<u64>,
    /// Instruction index/id this event correlates with, if any.
    pub instruction_id: Option<String>,
    /// What kind of event this is.
    pub event_type: AuditEventType,
    /// Input payload, hashed into `input_hash`. Never includes raw secret
    /// values — callers pass the same redacted shape used for dispatch.
    pub input: serde_json::Value,
    /// Output payload, hashed into `output_hash`.
    pub output: serde_json::Value,
    /// Wall-clock duration of the action this event records.
    pub duration_ms: u64,
    /// Free-form structured detail.
    pub details: serde_json::Value,
}

/// The portion of an [`AuditEvent`] that is hashed to produce `self_hash`.
/// Excludes `self_hash` and `signature` themselves.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct EventBody {
    event_id: uuid::Uuid,
    timestamp: String,
    node_id: String,
    workflow_id: WorkflowId,
    #[serde(skip_serializing_if = "Option::is_none")]
    workflow_version: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    instruction_id: Option<String>,
    event_type: AuditEventType,
    input_hash: String,
    output_hash: String,
    duration_ms: u64,
    details: serde_json::Value,
    previous_event_hash: String,
    public_key_pem: String,
}

/// One signed, hash-linked entry in the chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Unique event identifier.
    pub event_id: uuid::Uuid,
    /// ISO-8601 timestamp.
    pub timestamp: String,
    /// Identity of the node that appended this event.
    pub node_id: String,
    /// Workflow this event belongs to.
    pub workflow_id: WorkflowId,
    /// Compiled workflow version, if applicable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow_version: Option<u64>,
    /// Instruction index/id this event correlates with, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instruction_id: Option<String>,
    /// What kind of event this is.
    pub event_type: AuditEventType,
    /// SHA-256 of canonical JSON of `input`.
    pub input_hash: String,
    /// SHA-256 of canonical JSON of `output`.
    pub output_hash: String,
    /// Duration in milliseconds.
    pub duration_ms: u64,
    /// Free-form structured detail.
    pub details: serde_json::Value,
    /// SHA-256 of canonical JSON of the previous full event, or
    /// [`GENESIS_HASH`] for the first event.
    pub previous_event_hash: String,
    /// SHA-256 of this event's own canonical body (everything above).
    pub self_hash: String,
    /// Hex-encoded Ed25519 signature over `self_hash`.
    pub signature: String,
    /// PEM-encoded Ed25519 public key, for independent verification.
    pub public_key_pem: String,
}

impl AuditEvent {
    fn body(&self) -> EventBody {
        EventBody {
            event_id: self.event_id,
            timestamp: self.timestamp.clone(),
            node_id: self.node_id.clone(),
            workflow_id: self.workflow_id,
            workflow_version: self.workflow_version,
            instruction_id: self.instruction_id.clone(),
            event_type: self.event_type,
            input_hash: self.input_hash.clone(),
            output_hash: self.output_hash.clone(),
            duration_ms: self.duration_ms,
            details: self.details.clone(),
            previous_event_hash: self.previous_event_hash.clone(),
            public_key_pem: self.public_key_pem.clone(),
        }
    }
}

/// Result of [`verify_chain`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainVerification {
    /// `true` if every event verified.
    pub valid: bool,
    /// Number of events checked before the first (or no) failure.
    pub checked_count: usize,
    /// Index of the first event that failed to verify, if any.
    pub first_broken_at: Option<usize>,
    /// Human-readable diagnostic for the first failure, if any.
    pub error: Option<String>,
}

/// Notified with every event appended, in append order. Used by
/// `eyeflow-audit-export` (C7) to ship events to an external broker.
#[async_trait]
pub trait ExportHandler: Send + Sync {
    /// Offer one freshly appended event for export. Implementations that
    /// cannot deliver immediately are expected to fall back to their own
    /// buffering (C7 routes through [`OfflineBuffer`]); this call never
    /// blocks `append`'s caller on network I/O succeeding.
    async fn export(&self, event: &AuditEvent);
}

/// Per-node append-only audit chain (C6).
pub struct AuditChain {
    node_id: String,
    signing_key: SigningKey,
    public_key_pem: String,
    events: Mutex<Vec<AuditEvent>>,
    export_handlers: Mutex<Vec<Arc<dyn ExportHandler>>>,
    offline_buffer: Option<Arc<OfflineBuffer>>,
    offline: AtomicBool,
}

impl AuditChain {
    /// Construct a chain for `node_id`, signing with `signing_key`.
    #[must_use]
    pub fn new(node_id: impl Into<String>, signing_key: SigningKey) -> Self {
        let public_key_pem = encode_public_key_pem(&signing_key.verifying_key());
        Self {
            node_id: node_id.into(),
            signing_key,
            public_key_pem,
            events: Mutex::new(Vec::new()),
            export_handlers: Mutex::new(Vec::new()),
            offline_buffer: None,
            offline: AtomicBool::new(false),
        }
    }

    /// Attach the offline buffer events fall back to while `set_offline(true)`.
    #[must_use]
    pub fn with_offline_buffer(mut self, buffer: Arc<OfflineBuffer>) -> Self {
        self.offline_buffer = Some(buffer);
        self
    }

    /// Register a consumer notified of every future append, in order.
    pub fn register_export_handler(&self, handler: Arc<dyn ExportHandler>) {
        self.export_handlers
            .lock()
            .expect("audit export handlers mutex poisoned")
            .push(handler);
    }

    /// Toggle offline mode. While `true`, newly appended events are routed
    /// to the offline buffer instead of the export handlers.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// `true` if the chain is currently buffering instead of exporting.
    #[must_use]
    pub fn is_offline(&self) -> bool {
        self.offline.load(Ordering::SeqCst)
    }

    /// This node's PEM-encoded Ed25519 public key.
    #[must_use]
    pub fn public_key_pem(&self) -> &str {
        &self.public_key_pem
    }

    /// Number of events appended so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.lock().expect("audit chain mutex poisoned").len()
    }

    /// `true` if no events have been appended.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every event appended so far, in append order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<AuditEvent> {
        self.events.lock().expect("audit chain mutex poisoned").clone()
    }

    /// Append one event, computing its hash linkage and signature, and
    /// offer it to export handlers (or the offline buffer, per
    /// [`is_offline`](Self::is_offline)).
    ///
    /// # Errors
    ///
    /// Returns [`EyeflowError::Internal`] if `input.input`/`input.output`
    /// cannot be canonicalized.
    pub async fn append(&self, input: AppendInput) -> Result<AuditEvent, EyeflowError> {
        let previous_event_hash = {
            let events = self.events.lock().expect("audit chain mutex poisoned");
            match events.last() {
                Some(prev) => sha256_of_canonical(prev)?,
                None => GENESIS_HASH.to_string(),
            }
        };

        let body = EventBody {
            event_id: uuid::Uuid::new_v4(),
            timestamp: Utc::now().to_rfc3339(),
            node_id: self.node_id.clone(),
            workflow_id: input.workflow_id,
            workflow_version: input.workflow_version,
            instruction_id: input.instruction_id,
            event_type: input.event_type,
            input_hash: sha256_of_canonical(&input.input)?,
            output_hash: sha256_of_canonical(&input.output)?,
            duration_ms: input.duration_ms,
            details: input.details,
            previous_event_hash,
            public_key_pem: self.public_key_pem.clone(),
        };

        let self_hash = sha256_of_canonical(&body)?;
        let signature: Signature = self.signing_key.sign(self_hash.as_bytes());

        let event = AuditEvent {
            event_id: body.event_id,
            timestamp: body.timestamp,
            node_id: body.node_id,
            workflow_id: body.workflow_id,
            workflow_version: body.workflow_version,
            instruction_id: body.instruction_id,
            event_type: body.event_type,
            input_hash: body.input_hash,
            output_hash: body.output_hash,
            duration_ms: body.duration_ms,
            details: body.details,
            previous_event_hash: body.previous_event_hash,
            self_hash,
            signature: hex_encode(&signature.to_bytes()),
            public_key_pem: body.public_key_pem,
        };

        self.events
            .lock()
            .expect("audit chain mutex poisoned")
            .push(event.clone());

        if self.is_offline() {
            if let Some(buffer) = &self.offline_buffer {
                let payload = serde_json::to_value(&event).map_err(EyeflowError::from_serde)?;
                buffer.enqueue_audit(payload);
            }
        } else {
            let handlers = self
                .export_handlers
                .lock()
                .expect("audit export handlers mutex poisoned")
                .clone();
            for handler in handlers {
                handler.export(&event).await;
            }
        }

        Ok(event)
    }
}

/// Verify a sequence of events for hash linkage and signature validity
/// (invariant 3).
///
/// Checks, for each event at index `i`: `self_hash` recomputes correctly
/// from the stripped body; the Ed25519 signature over `self_hash`
/// verifies under `public_key_pem`; and (for `i > 0`) `previous_event_hash`
/// equals the SHA-256 of canonical JSON of event `i - 1` (event `0` must
/// carry [`GENESIS_HASH`]). Stops at the first mismatch.
#[must_use]
pub fn verify_chain(events: &[AuditEvent]) -> ChainVerification {
    for (i, event) in events.iter().enumerate() {
        if let Err(message) = verify_one(events, i, event) {
            return ChainVerification {
                valid: false,
                checked_count: i,
                first_broken_at: Some(i),
                error: Some(message),
            };
        }
    }
    ChainVerification {
        valid: true,
        checked_count: events.len(),
        first_broken_at: None,
        error: None,
    }
}

fn verify_one(events: &[AuditEvent], i: usize, event: &AuditEvent) -> Result<(), String> {
    let recomputed_self = sha256_of_canonical(&event.body())
        .map_err(|e| format!("selfHash recompute failed: {e}"))?;
    if recomputed_self != event.self_hash {
        return Err("selfHash mismatch".to_string());
    }

    let verifying_key = decode_public_key_pem(&event.public_key_pem)
        .map_err(|e| format!("invalid publicKeyPem: {e}"))?;
    let sig_bytes = hex_decode(&event.signature).map_err(|e| format!("invalid signature hex: {e}"))?;
    let sig_array: [u8; 64] = sig_bytes
        .try_into()
        .map_err(|_| "signature is not 64 bytes".to_string())?;
    let signature = Signature::from_bytes(&sig_array);
    verifying_key
        .verify(event.self_hash.as_bytes(), &signature)
        .map_err(|_| "signature invalid".to_string())?;

    let expected_previous = if i == 0 {
        GENESIS_HASH.to_string()
    } else {
        sha256_of_canonical(&events[i - 1]).map_err(|e| format!("previousEventHash recompute failed: {e}"))?
    };
    if event.previous_event_hash != expected_previous {
        return Err("previousEventHash mismatch".to_string());
    }
    Ok(())
}

fn encode_public_key_pem(key: &VerifyingKey) -> String {
    use base64::Engine;
    let b64 = base64::engine::general_purpose::STANDARD.encode(key.to_bytes());
    format!("-----BEGIN PUBLIC KEY-----\n{b64}\n-----END PUBLIC KEY-----\n")
}

fn decode_public_key_pem(pem: &str) -> Result<VerifyingKey, String> {
    use base64::Engine;
    let b64: String = pem
        .lines()
        .filter(|l| !l.starts_with("-----"))
        .collect::<Vec<_>>()
        .join("");
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(b64)
        .map_err(|e| e.to_string())?;
    let array: [u8; 32] = bytes.try_into().map_err(|_| "public key is not 32 bytes".to_string())?;
    VerifyingKey::from_bytes(&array).map_err(|e| e.to_string())
}

fn hex_encode(bytes: &[u8]) -> String {
    const TABLE: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push(TABLE[(b >> 4) as usize] as char);
        out.push(TABLE[(b & 0x0f) as usize] as char);
    }
    out
}

fn hex_decode(s: &str) -> Result<Vec<u8>, String> {
    if s.len() % 2 != 0 {
        return Err("odd-length hex string".to_string());
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).map_err(|e| e.to_string()))
        .collect()
}
