// SPDX-License-Identifier: MIT OR Apache-2.0
//! Crate-wide error taxonomy.
//!
//! Every component crate returns this type directly rather than defining
//! its own; it is the common denominator the orchestrator (C13) uses to
//! classify a failure for the execution record's `error` field.

use serde::{Deserialize, Serialize};

/// The recognized error kinds a node can raise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EyeflowError {
    /// Rule compile: missing connector/function/field (C14).
    #[error("validation error: {message}")]
    Validation {
        /// Human-readable diagnostic.
        message: String,
    },

    /// Unknown service id/version, or trust-level violation (C1).
    #[error("resolution error: {message}")]
    Resolution {
        /// Human-readable diagnostic, names the offending instruction/service.
        message: String,
    },

    /// Artifact fetch/load failure during sealing (C2).
    #[error("preload error for service {service_id}: {message}")]
    Preload {
        /// The service whose artifact could not be preloaded.
        service_id: String,
        /// Human-readable diagnostic.
        message: String,
    },

    /// IR signature/checksum mismatch at execution time (C13).
    #[error("signature error: {message}")]
    Signature {
        /// Human-readable diagnostic.
        message: String,
    },

    /// Transport, remote, or runtime fault during service dispatch (C11).
    #[error("service dispatch error calling {service_id}: {message}")]
    ServiceDispatch {
        /// The service that failed.
        service_id: String,
        /// Human-readable diagnostic.
        message: String,
    },

    /// Secret not found anywhere vault resolution looks (C3).
    #[error("vault error resolving {path}: {message}")]
    Vault {
        /// The path that could not be resolved.
        path: String,
        /// Human-readable diagnostic.
        message: String,
    },

    /// User or emergency-stop cancellation (C4).
    #[error("execution cancelled: {reason}")]
    Cancelled {
        /// Why the run was cancelled.
        reason: String,
    },

    /// `verifyChain` detected a mismatch (C6).
    #[error("chain verification failed at index {first_broken_at}: {message}")]
    ChainVerification {
        /// Index of the first event that failed to verify.
        first_broken_at: usize,
        /// Human-readable diagnostic.
        message: String,
    },

    /// Broker unreachable during audit export (C7) — non-fatal, routed
    /// through the offline buffer, but still surfaced for observability.
    #[error("export transport failure: {message}")]
    ExportTransport {
        /// Human-readable diagnostic.
        message: String,
    },

    /// E.g. activate DRAFT, archive ACTIVE (C12).
    #[error("lifecycle violation: {message}")]
    LifecycleViolation {
        /// Human-readable diagnostic.
        message: String,
    },

    /// Confidence below the project's threshold on rule refinement.
    #[error("confidence {confidence} below threshold {threshold}")]
    ConfidenceTooLow {
        /// Confidence value returned by the LLM parsing callout.
        confidence: f64,
        /// Configured minimum confidence.
        threshold: f64,
    },

    /// Generic I/O or (de)serialization failure, not classified above.
    #[error("internal error: {message}")]
    Internal {
        /// Human-readable diagnostic.
        message: String,
    },
}

impl EyeflowError {
    /// Wrap a `serde_json` error as an [`EyeflowError::Internal`].
    #[must_use]
    pub fn from_serde(err: serde_json::Error) -> Self {
        Self::Internal {
            message: format!("serialization failure: {err}"),
        }
    }

    /// `true` for errors are fatal to the whole pipeline
    /// (signature verification and chain integrity failures).
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Signature { .. } | Self::ChainVerification { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_and_chain_errors_are_fatal() {
        assert!(EyeflowError::Signature { message: "x".into() }.is_fatal());
        assert!(EyeflowError::ChainVerification {
            first_broken_at: 0,
            message: "x".into()
        }
        .is_fatal());
    }

    #[test]
    fn validation_error_is_not_fatal() {
        assert!(!EyeflowError::Validation { message: "x".into() }.is_fatal());
    }

    #[test]
    fn serde_roundtrip() {
        let e = EyeflowError::Preload {
            service_id: "svc".into(),
            message: "boom".into(),
        };
        let json = serde_json::to_string(&e).unwrap();
        let back: EyeflowError = serde_json::from_str(&json).unwrap();
        assert_eq!(e, back);
    }
}
