// SPDX-License-Identifier: MIT OR Apache-2.0
//! Concrete [`Fetcher`] implementations, one per [`ServiceFormat`].
//!
//! The preloader crate only defines the trait; every binary that seals
//! workflows owns its own fetchers rather than sharing a registration
//! crate. These reach the real world over HTTP (`reqwest`) or the local
//! filesystem (`tokio::fs`) depending on delivery format.

use std::time::Duration;

use async_trait::async_trait;
use eyeflow_core::{EyeflowError, ServiceRef};
use eyeflow_ir::ServiceHandle;
use eyeflow_manifest::ResolvedService;
use eyeflow_preload::Fetcher;

const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

fn preload_err(service: &ServiceRef, message: impl Into<String>) -> EyeflowError {
    EyeflowError::Preload {
        service_id: service.service_id.clone(),
        message: message.into(),
    }
}

fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(FETCH_TIMEOUT)
        .build()
        .expect("reqwest client builds with a fixed timeout")
}

/// Fetches a WASM module's bytes from its registry URL.
pub struct HttpWasmFetcher {
    client: reqwest::Client,
}

impl HttpWasmFetcher {
    /// A fetcher using a fresh HTTP client with [`FETCH_TIMEOUT`].
    #[must_use]
    pub fn new() -> Self {
        Self { client: http_client() }
    }
}

impl Default for HttpWasmFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Fetcher for HttpWasmFetcher {
    async fn fetch(
        &self,
        service: &ServiceRef,
        resolved: &ResolvedService,
    ) -> Result<ServiceHandle, EyeflowError> {
        let response = self
            .client
            .get(&resolved.entry.url)
            .send()
            .await
            .map_err(|e| preload_err(service, format!("wasm module fetch failed: {e}")))?;
        let valid = response.status().is_success();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| preload_err(service, format!("wasm module body read failed: {e}")))?;
        Ok(ServiceHandle::Wasm {
            module_bytes: bytes.len(),
            valid,
        })
    }
}

/// Probes reachability of an MCP server's endpoint.
pub struct McpFetcher {
    client: reqwest::Client,
}

impl McpFetcher {
    /// A fetcher using a fresh HTTP client with [`FETCH_TIMEOUT`].
    #[must_use]
    pub fn new() -> Self {
        Self { client: http_client() }
    }
}

impl Default for McpFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Fetcher for McpFetcher {
    async fn fetch(
        &self,
        service: &ServiceRef,
        resolved: &ResolvedService,
    ) -> Result<ServiceHandle, EyeflowError> {
        let channel_id = resolved
            .dispatch
            .transport_endpoint
            .clone()
            .unwrap_or_else(|| resolved.entry.url.clone());
        let open = self
            .client
            .get(&resolved.entry.url)
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false);
        if !open {
            tracing::debug!(%service, url = %resolved.entry.url, "mcp endpoint unreachable, handle marked closed");
        }
        Ok(ServiceHandle::Mcp { channel_id, open })
    }
}

/// Checks a native service's binary/artifact path on the local filesystem.
/// `resolved.entry.url` is interpreted as a path, matching the manifest's
/// documented per-format meaning of that field.
pub struct NativeFetcher;

#[async_trait]
impl Fetcher for NativeFetcher {
    async fn fetch(
        &self,
        _service: &ServiceRef,
        resolved: &ResolvedService,
    ) -> Result<ServiceHandle, EyeflowError> {
        let valid = tokio::fs::metadata(&resolved.entry.url).await.is_ok();
        Ok(ServiceHandle::Native {
            handle_id: resolved.entry.url.clone(),
            valid,
        })
    }
}

/// Probes reachability of a container registry for an image reference.
pub struct ContainerFetcher {
    client: reqwest::Client,
}

impl ContainerFetcher {
    /// A fetcher using a fresh HTTP client with [`FETCH_TIMEOUT`].
    #[must_use]
    pub fn new() -> Self {
        Self { client: http_client() }
    }
}

impl Default for ContainerFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Fetcher for ContainerFetcher {
    async fn fetch(
        &self,
        _service: &ServiceRef,
        resolved: &ResolvedService,
    ) -> Result<ServiceHandle, EyeflowError> {
        let resolvable = self
            .client
            .get(&resolved.entry.url)
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false);
        Ok(ServiceHandle::Container {
            image_ref: resolved.entry.url.clone(),
            resolvable,
        })
    }
}

/// Build the table used by the CLI's `seal` subcommand, covering every
/// delivery format the manifest may reference.
#[must_use]
pub fn default_fetcher_table() -> eyeflow_preload::FetcherTable {
    use eyeflow_core::ServiceFormat;
    eyeflow_preload::FetcherTable::new()
        .with_fetcher(ServiceFormat::Wasm, Box::new(HttpWasmFetcher::new()))
        .with_fetcher(ServiceFormat::Mcp, Box::new(McpFetcher::new()))
        .with_fetcher(ServiceFormat::Native, Box::new(NativeFetcher))
        .with_fetcher(ServiceFormat::Container, Box::new(ContainerFetcher::new()))
}
