// SPDX-License-Identifier: MIT OR Apache-2.0
//! The sealed, immutable compiled-workflow artifact.

use std::collections::BTreeMap;

use eyeflow_core::{ServiceFormat, ServiceRef, UserId, WorkflowId};
use serde::{Deserialize, Serialize};

use crate::program::IrProgram;

/// A single pre-loaded service handle, keyed by format-specific identity.
///
/// These are data shapes, not live connections: the actual fetch/handshake
/// happens in `eyeflow-preload`, which populates the boolean health flags
/// this type carries. `is_healthy` re-validates from those flags rather than
/// holding `async`-capable resources directly, so the sealed artifact stays
/// `Send + Sync + Serialize` without wrapping every handle in a mutex.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "format", rename_all = "UPPERCASE")]
pub enum ServiceHandle {
    /// A fetched and instantiated WASM module.
    Wasm {
        /// Number of bytes in the fetched module — `0` means never loaded.
        module_bytes: usize,
        /// Whether the module passed validation at load time.
        valid: bool,
    },
    /// A persistent, handshaked MCP channel.
    Mcp {
        /// Opaque channel identifier assigned at handshake time.
        channel_id: String,
        /// Whether the channel is currently open.
        open: bool,
    },
    /// A loaded native dynamic-library handle.
    Native {
        /// Opaque handle identifier.
        handle_id: String,
        /// Whether the handle is currently valid.
        valid: bool,
    },
    /// A pulled container image reference.
    Container {
        /// Fully-qualified image reference.
        image_ref: String,
        /// Whether the reference currently resolves.
        resolvable: bool,
    },
}

impl ServiceHandle {
    /// Re-validate this handle per "module valid, channel open,
    /// ref resolvable".
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        match self {
            Self::Wasm { module_bytes, valid } => *valid && *module_bytes > 0,
            Self::Mcp { open, .. } => *open,
            Self::Native { valid, .. } => *valid,
            Self::Container { resolvable, .. } => *resolvable,
        }
    }

    /// The format this handle was preloaded for.
    #[must_use]
    pub fn format(&self) -> ServiceFormat {
        match self {
            Self::Wasm { .. } => ServiceFormat::Wasm,
            Self::Mcp { .. } => ServiceFormat::Mcp,
            Self::Native { .. } => ServiceFormat::Native,
            Self::Container { .. } => ServiceFormat::Container,
        }
    }
}

/// All pre-loaded service handles for one compiled workflow, keyed by
/// `(serviceId, version)`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PreLoadedServices {
    handles: BTreeMap<ServiceRef, ServiceHandle>,
}

impl PreLoadedServices {
    /// An empty set of pre-loaded handles.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert (or replace) the handle for `service`.
    pub fn insert(&mut self, service: ServiceRef, handle: ServiceHandle) {
        self.handles.insert(service, handle);
    }

    /// Look up a service's handle.
    #[must_use]
    pub fn get(&self, service: &ServiceRef) -> Option<&ServiceHandle> {
        self.handles.get(service)
    }

    /// Number of pre-loaded handles.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// `true` if no handles are pre-loaded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Iterate all `(service, handle)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&ServiceRef, &ServiceHandle)> {
        self.handles.iter()
    }

    /// `true` if every handle currently re-validates as healthy.
    #[must_use]
    pub fn all_healthy(&self) -> bool {
        self.handles.values().all(ServiceHandle::is_healthy)
    }

    /// Services (if any) whose handle fails re-validation.
    #[must_use]
    pub fn unhealthy_services(&self) -> Vec<ServiceRef> {
        self.handles
            .iter()
            .filter(|(_, h)| !h.is_healthy())
            .map(|(s, _)| s.clone())
            .collect()
    }
}

/// The immutable, signed output of the Service Preloader (C2).
///
/// Everything here is set once at sealing time; there is no API to mutate a
/// `CompiledWorkflow` in place. `checksum` and `signature` cover the
/// canonical JSON of `(ir, resolved service list)` — not `pre_loaded_services`,
/// since live handles are not part of the deterministic content and would
/// make "same IR ⇒ same checksum"  impossible to
/// satisfy across preloader runs that assign different channel ids.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompiledWorkflow {
    /// Identity of this sealed artifact.
    pub id: WorkflowId,
    /// Owning tenant.
    pub user_id: UserId,
    /// Human-readable workflow name.
    pub workflow_name: String,
    /// The validated, resolved program this artifact executes.
    pub ir: IrProgram,
    /// Live (or live-shaped) service handles, keyed by service.
    pub pre_loaded_services: PreLoadedServices,
    /// SHA-256 hex digest over canonical JSON of `(ir, resolved services)`.
    pub checksum: String,
    /// Ed25519 signature (hex) over `checksum`.
    pub signature: String,
    /// Identifier of the signing key, for verification-time key lookup.
    pub signature_key_id: String,
}

impl CompiledWorkflow {
    /// Re-validate every pre-loaded handle (`isHealthy()`
    /// predicate).
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.pre_loaded_services.all_healthy()
    }
}
