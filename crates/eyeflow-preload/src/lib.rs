// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
#![warn(missing_docs)]
//! Service Preloader (C2).
//!
//! Takes C1's resolution output plus a `userId`/workflow name and produces
//! the immutable, signed [`eyeflow_ir::CompiledWorkflow`] the VM executes:
//! fetch-then-seal per artifact across four delivery formats, each with a
//! re-validation predicate that doesn't need the live connection.

use std::collections::BTreeMap;

use async_trait::async_trait;
use ed25519_dalek::{Signature, Signer, SigningKey};
use eyeflow_core::{EyeflowError, ServiceFormat, ServiceRef, UserId, WorkflowId};
use eyeflow_ir::{CompiledWorkflow, IrProgram, PreLoadedServices, ServiceHandle};
use eyeflow_manifest::ResolvedService;

/// Fetches or instantiates one service artifact by delivery format.
///
/// Implementors talk to the real world (module registries, MCP servers,
/// dynamic loaders, container runtimes); tests and fixtures use an
/// in-memory stand-in. One `Fetcher` is consulted per [`ServiceFormat`].
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Acquire the artifact named by `service`/`resolved`, returning a
    /// sealed [`ServiceHandle`].
    ///
    /// # Errors
    ///
    /// Returns [`EyeflowError::Preload`] naming `service.service_id` on any
    /// fetch/load/handshake failure.
    async fn fetch(
        &self,
        service: &ServiceRef,
        resolved: &ResolvedService,
    ) -> Result<ServiceHandle, EyeflowError>;
}

/// Dispatches to one [`Fetcher`] per [`ServiceFormat`].
#[derive(Default)]
pub struct FetcherTable {
    fetchers: BTreeMap<ServiceFormat, Box<dyn Fetcher>>,
}

impl FetcherTable {
    /// An empty table — every format is unsupported until registered.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the fetcher responsible for `format`.
    #[must_use]
    pub fn with_fetcher(mut self, format: ServiceFormat, fetcher: Box<dyn Fetcher>) -> Self {
        self.fetchers.insert(format, fetcher);
        self
    }

    fn get(&self, format: ServiceFormat) -> Result<&dyn Fetcher, EyeflowError> {
        self.fetchers
            .get(&format)
            .map(AsRef::as_ref)
            .ok_or_else(|| EyeflowError::Preload {
                service_id: String::new(),
                message: format!("no fetcher registered for format {format}"),
            })
    }
}

impl std::fmt::Debug for FetcherTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetcherTable")
            .field("formats", &self.fetchers.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Seals resolved programs into signed [`CompiledWorkflow`] artifacts.
///
/// Holds the node's Ed25519 signing key (
/// `SVM_SIGNING_PRIVATE_KEY_PEM`) and a [`FetcherTable`] covering every
/// delivery format the manifest may reference.
pub struct Preloader {
    signing_key: SigningKey,
    signature_key_id: String,
    fetchers: FetcherTable,
}

impl Preloader {
    /// Construct a preloader with an explicit signing key and key id.
    #[must_use]
    pub fn new(signing_key: SigningKey, signature_key_id: impl Into<String>, fetchers: FetcherTable) -> Self {
        Self {
            signing_key,
            signature_key_id: signature_key_id.into(),
            fetchers,
        }
    }

    /// Resolve-then-seal: fetch every resolved service's artifact, compute
    /// the content checksum, sign it, and produce the immutable workflow.
    ///
    /// Deterministic ("idempotent seal"): the
    /// checksum covers canonical JSON of `(ir, resolved services)` only —
    /// never the live handles, whose channel ids/image refs may differ
    /// across runs without changing the artifact's meaning.
    ///
    /// # Errors
    ///
    /// Returns [`EyeflowError::Preload`] naming the offending `serviceId`
    /// on the first fetch failure; aborts the whole seal (no partial
    /// artifact is ever returned).
    pub async fn seal(
        &self,
        user_id: UserId,
        workflow_name: impl Into<String>,
        ir: IrProgram,
        resolved_services: &[ResolvedService],
    ) -> Result<CompiledWorkflow, EyeflowError> {
        ir.validate().map_err(|e| EyeflowError::Preload {
            service_id: String::new(),
            message: format!("cannot seal an invalid program: {e}"),
        })?;

        let mut pre_loaded = PreLoadedServices::new();
        for resolved in resolved_services {
            let service = resolved.entry.key();
            let fetcher = self.fetchers.get(resolved.entry.format).map_err(|e| match e {
                EyeflowError::Preload { message, .. } => EyeflowError::Preload {
                    service_id: service.service_id.clone(),
                    message,
                },
                other => other,
            })?;
            let handle = fetcher.fetch(&service, resolved).await.map_err(|e| match e {
                EyeflowError::Preload { message, .. } => EyeflowError::Preload {
                    service_id: service.service_id.clone(),
                    message,
                },
                other => other,
            })?;
            tracing::debug!(service = %service, format = %resolved.entry.format, "service preloaded");
            pre_loaded.insert(service, handle);
        }

        let checksum = checksum_of(&ir, resolved_services)?;
        let signature: Signature = self.signing_key.sign(checksum.as_bytes());

        Ok(CompiledWorkflow {
            id: WorkflowId::new(),
            user_id,
            workflow_name: workflow_name.into(),
            ir,
            pre_loaded_services: pre_loaded,
            checksum,
            signature: hex_encode(&signature.to_bytes()),
            signature_key_id: self.signature_key_id.clone(),
        })
    }

    /// Verify that `workflow.signature` is a valid Ed25519 signature over
    /// `workflow.checksum` under this preloader's public key.
    #[must_use]
    pub fn verify(&self, workflow: &CompiledWorkflow) -> bool {
        let Ok(sig_bytes) = hex_decode(&workflow.signature) else {
            return false;
        };
        let Ok(sig_array): Result<[u8; 64], _> = sig_bytes.try_into() else {
            return false;
        };
        let signature = Signature::from_bytes(&sig_array);
        self.signing_key
            .verifying_key()
            .verify_strict(workflow.checksum.as_bytes(), &signature)
            .is_ok()
    }
}

fn checksum_of(ir: &IrProgram, resolved: &[ResolvedService]) -> Result<String, EyeflowError> {
    #[derive(serde::Serialize)]
    struct ChecksumInput<'a> {
        ir: &'a IrProgram,
        resolved_services: &'a [ResolvedService],
    }
    eyeflow_core::sha256_of_canonical(&ChecksumInput {
        ir,
        resolved_services: resolved,
    })
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

fn hex_decode(s: &str) -> Result<Vec<u8>, EyeflowError> {
    if s.len() % 2 != 0 {
        return Err(EyeflowError::Internal {
            message: "odd-length hex string".to_string(),
        });
    }
    (0..s.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&s[i..i + 2], 16).map_err(|e| EyeflowError::Internal {
                message: format!("invalid hex digit: {e}"),
            })
        })
        .collect()
}
