// SPDX-License-Identifier: MIT OR Apache-2.0
//! Small shared enums referenced across several components.

use serde::{Deserialize, Serialize};

/// Artifact delivery format for a manifest entry. Drives both preloading
/// (C2) and dispatch (C11) behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ServiceFormat {
    /// WebAssembly module, fetched and instantiated.
    Wasm,
    /// Model Context Protocol server, reached over a persistent channel.
    Mcp,
    /// Native dynamic library loaded in-process.
    Native,
    /// Containerized service, reached by pulling and running an image.
    Container,
}

impl std::fmt::Display for ServiceFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Wasm => "WASM",
            Self::Mcp => "MCP",
            Self::Native => "NATIVE",
            Self::Container => "CONTAINER",
        };
        write!(f, "{s}")
    }
}

/// Trust classification of a service manifest entry, checked against
/// project policy during resolution (C1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustLevel {
    /// Lowest trust; rejected by any project policy requiring more.
    Low,
    /// Default trust for vetted third-party services.
    Medium,
    /// Highest trust; first-party or formally verified services.
    High,
}

impl TrustLevel {
    /// `true` if `self` satisfies a minimum required level.
    #[must_use]
    pub fn satisfies(&self, minimum: &TrustLevel) -> bool {
        self >= minimum
    }
}
