// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
#![warn(missing_docs)]
//! Service Manifest & Resolver (C1).
//!
//! A process-wide, read-only-after-startup table of known services,
//! together with the resolution pass that annotates an [`IrProgram`]'s
//! `CALL_SERVICE` instructions with dispatch metadata. A `BTreeMap`-keyed
//! table with `register`/`validate`/lookup, keyed by a composite
//! `(service_id, version)` pair, feeding a fallible resolution pass.

use std::collections::{BTreeMap, BTreeSet};

use eyeflow_core::{EyeflowError, ServiceFormat, ServiceRef, TrustLevel};
use eyeflow_ir::{DispatchMetadata, IrProgram, Operands};
use serde::{Deserialize, Serialize};

/// A typed input/output signature entry for a manifest service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypedSignature {
    /// Parameter/field name.
    pub name: String,
    /// Declared type, e.g. `"string"`, `"number"`, `"object"`.
    pub type_name: String,
    /// Whether this field is required.
    #[serde(default = "default_true")]
    pub required: bool,
}

fn default_true() -> bool {
    true
}

/// One entry in the service manifest ().
///
/// Unique by `(service_id, version)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceManifestEntry {
    /// Opaque service identifier.
    pub service_id: String,
    /// Semantic version.
    pub version: String,
    /// Delivery format.
    pub format: ServiceFormat,
    /// Fetch/connect URL (module registry URL, MCP endpoint, image
    /// reference, or native binary path, depending on `format`).
    pub url: String,
    /// Trust classification, checked against project policy.
    pub trust_level: TrustLevel,
    /// Declared input parameters.
    #[serde(default)]
    pub inputs: Vec<TypedSignature>,
    /// Declared outputs.
    #[serde(default)]
    pub outputs: Vec<TypedSignature>,
    /// Default dispatch timeout in milliseconds, overridable per instruction.
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,
}

fn default_timeout_ms() -> u64 {
    30_000
}

impl ServiceManifestEntry {
    /// The `(service_id, version)` key this entry is stored under.
    #[must_use]
    pub fn key(&self) -> ServiceRef {
        ServiceRef::new(self.service_id.clone(), self.version.clone())
    }
}

/// The output of resolution for one `CALL_SERVICE` instruction: the
/// manifest entry plus the dispatch metadata annotated onto the IR (spec
/// §3, Resolved Service).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedService {
    /// The manifest entry this instruction resolved to.
    pub entry: ServiceManifestEntry,
    /// Dispatch metadata written onto the instruction.
    pub dispatch: DispatchMetadata,
}

/// Policy gate applied during resolution: the minimum trust level a
/// project accepts for any service it calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrustPolicy {
    /// Minimum acceptable trust level.
    pub minimum_trust: TrustLevel,
}

impl Default for TrustPolicy {
    fn default() -> Self {
        Self {
            minimum_trust: TrustLevel::Low,
        }
    }
}

/// A process-wide, immutable-after-startup table of service manifest
/// entries.
#[derive(Debug, Clone, Default)]
pub struct ServiceManifest {
    entries: BTreeMap<ServiceRef, ServiceManifestEntry>,
}

impl ServiceManifest {
    /// An empty manifest.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an entry. Returns an error if `(service_id, version)` is
    /// already present — manifest entries are append-only once loaded.
    pub fn register(&mut self, entry: ServiceManifestEntry) -> Result<(), EyeflowError> {
        let key = entry.key();
        if self.entries.contains_key(&key) {
            return Err(EyeflowError::Resolution {
                message: format!("duplicate manifest entry for {key}"),
            });
        }
        self.entries.insert(key, entry);
        Ok(())
    }

    /// Look up an entry by its service reference.
    #[must_use]
    pub fn get(&self, service: &ServiceRef) -> Option<&ServiceManifestEntry> {
        self.entries.get(service)
    }

    /// Number of registered entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// `true` if no entries are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Resolve every `CALL_SERVICE` instruction in `program`, annotating
    /// `dispatch_metadata` in place and returning the deduplicated list of
    /// resolved services, in first-appearance order.
    ///
    /// Deterministic: identical `(program, manifest)` inputs produce
    /// byte-identical annotations, since resolution only reads the
    /// manifest and never consults wall-clock time or randomness.
    ///
    /// # Errors
    ///
    /// Returns [`EyeflowError::Resolution`] (fatal to compilation) on the
    /// first instruction referencing an unknown service id, an unknown
    /// version, or a trust level below `policy.minimum_trust` — the error
    /// message names the offending instruction index and service.
    pub fn resolve(
        &self,
        program: &mut IrProgram,
        policy: &TrustPolicy,
    ) -> Result<Vec<ResolvedService>, EyeflowError> {
        let mut resolved = Vec::new();
        let mut seen = BTreeSet::new();

        for instr in &mut program.instructions {
            let service = match &instr.operands {
                Operands::CallService { service, .. } => service.clone(),
                _ => continue,
            };

            let same_id: Vec<&ServiceManifestEntry> = self
                .entries
                .values()
                .filter(|e| e.service_id == service.service_id)
                .collect();

            let entry = match self.entries.get(&service) {
                Some(e) => e,
                None if same_id.is_empty() => {
                    return Err(EyeflowError::Resolution {
                        message: format!(
                            "instruction {}: service '{}' not found in manifest",
                            instr.index, service.service_id
                        ),
                    })
                }
                None => {
                    return Err(EyeflowError::Resolution {
                        message: format!(
                            "instruction {}: service '{}' not found at version '{}' (not found)",
                            instr.index, service.service_id, service.version
                        ),
                    })
                }
            };

            if !entry.trust_level.satisfies(&policy.minimum_trust) {
                return Err(EyeflowError::Resolution {
                    message: format!(
                        "instruction {}: service '{}' trust level {:?} is below project policy minimum {:?}",
                        instr.index, service, entry.trust_level, policy.minimum_trust
                    ),
                });
            }

            let dispatch = DispatchMetadata {
                format: entry.format,
                method_name: default_method_name(entry),
                transport_endpoint: transport_endpoint(entry),
                container_env: BTreeMap::new(),
            };

            instr.dispatch_metadata = Some(dispatch.clone());

            if seen.insert(service.clone()) {
                resolved.push(ResolvedService {
                    entry: entry.clone(),
                    dispatch,
                });
            }
        }

        Ok(resolved)
    }
}

fn default_method_name(entry: &ServiceManifestEntry) -> String {
    match entry.format {
        ServiceFormat::Wasm => "invoke".to_string(),
        ServiceFormat::Mcp => "call_tool".to_string(),
        ServiceFormat::Native => "call".to_string(),
        ServiceFormat::Container => "run".to_string(),
    }
}

fn transport_endpoint(entry: &ServiceManifestEntry) -> Option<String> {
    match entry.format {
        ServiceFormat::Mcp | ServiceFormat::Container => Some(entry.url.clone()),
        ServiceFormat::Wasm | ServiceFormat::Native => None,
    }
}
