// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
#![warn(missing_docs)]
//! Shared identifiers, error taxonomy, and canonical-JSON hashing.
//!
//! Every other EyeFlow crate depends on this one. It carries nothing that
//! needs a runtime: no I/O, no async, no process state. If a type is shared
//! by two or more components, it belongs here.

/// Canonical JSON normalization and SHA-256 hashing.
pub mod canonical;
/// Crate-wide error taxonomy.
pub mod error;
/// Trust levels, service formats, and other small shared enums.
pub mod kinds;

pub use canonical::{canonical_json, sha256_hex, sha256_of_canonical, GENESIS_HASH};
pub use error::EyeflowError;
pub use kinds::{ServiceFormat, TrustLevel};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifies a service entry in the manifest: `(service_id, version)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ServiceRef {
    /// Opaque service identifier, e.g. `"sentiment-analyzer"`.
    pub service_id: String,
    /// Semantic version string, e.g. `"2.1.0"`.
    pub version: String,
}

impl ServiceRef {
    /// Construct a new service reference.
    #[must_use]
    pub fn new(service_id: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            service_id: service_id.into(),
            version: version.into(),
        }
    }
}

impl std::fmt::Display for ServiceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.service_id, self.version)
    }
}

/// A `{slotId, vaultPath}` reference resolved to a secret at dispatch time.
///
/// Secrets never appear inline in an [`eyeflow_ir`]-level instruction; only
/// this reference does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultSlot {
    /// Identifier of the register slot this secret fills.
    pub slot_id: String,
    /// Path to resolve in the vault (or env fallback).
    pub vault_path: String,
}

/// Monotone project version number. Always `>= 1`.
pub type VersionNumber = u64;

/// Newtype identifiers, distinguished at the type level so a project id can
/// never be passed where an execution id is expected.
macro_rules! uuid_id {
    ($name:ident, $doc:literal) => {
        #[doc = $doc]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(pub Uuid);

        impl $name {
            #[doc = concat!("Generate a new random ", stringify!($name), ".")]
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(u: Uuid) -> Self {
                Self(u)
            }
        }
    };
}

uuid_id!(ProjectId, "Identifies a [`Project`](https://docs.rs) workspace.");
uuid_id!(VersionId, "Identifies one immutable project version.");
uuid_id!(ExecutionId, "Identifies one run of a compiled workflow.");
uuid_id!(WorkflowId, "Identifies a sealed, compiled workflow artifact.");
uuid_id!(UserId, "Identifies the owning tenant/user of a persisted entity.");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_ref_display() {
        let r = ServiceRef::new("sentiment-analyzer", "2.1.0");
        assert_eq!(r.to_string(), "sentiment-analyzer@2.1.0");
    }

    #[test]
    fn ids_are_distinct_types_but_same_shape() {
        let p = ProjectId::new();
        let v = VersionId::new();
        assert_ne!(p.0, Uuid::nil());
        assert_ne!(v.0, Uuid::nil());
    }
}
