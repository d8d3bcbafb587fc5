// SPDX-License-Identifier: MIT OR Apache-2.0
//! Default `ServiceInvoker`/`ActionInvoker` wiring for a standalone node
//! with no live sandbox behind it: something that answers every dispatch
//! deterministically so the node boots and serves `/healthz` without
//! external dependencies. Swap these for sandboxed invokers wired to a
//! real WASM/MCP/container runtime in a deployment that needs one.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use eyeflow_core::EyeflowError;
use eyeflow_ir::{DispatchMetadata, ServiceHandle};
use eyeflow_vm::{ActionInvoker, ServiceInvoker};
use serde_json::json;

const PHYSICAL_ACTION_PREFIX: &str = "physical:";
const PHYSICAL_ACTION_WINDOW: Duration = Duration::from_secs(5);

/// Dispatches `CALL_SERVICE` against a pre-loaded handle without a live
/// sandbox: unhealthy handles fail, healthy ones echo back the method
/// name, transport, and assembled arguments.
pub struct LocalServiceInvoker;

#[async_trait]
impl ServiceInvoker for LocalServiceInvoker {
    async fn invoke(
        &self,
        handle: &ServiceHandle,
        metadata: &DispatchMetadata,
        args: serde_json::Value,
        secrets: &BTreeMap<String, String>,
    ) -> Result<serde_json::Value, EyeflowError> {
        if !handle.is_healthy() {
            return Err(EyeflowError::ServiceDispatch {
                service_id: metadata.method_name.clone(),
                message: format!("handle for format {} is unhealthy", handle.format()),
            });
        }
        Ok(json!({
            "format": handle.format().to_string(),
            "method": metadata.method_name,
            "transport": metadata.transport_endpoint,
            "args": args,
            "secrets_resolved": secrets.keys().collect::<Vec<_>>(),
        }))
    }
}

/// Runs a `CALL_ACTION` instruction by logging and echoing its arguments.
/// Actions named `physical:<name>` are treated as committing a
/// physical-world effect and report [`PHYSICAL_ACTION_WINDOW`].
pub struct LoggingActionInvoker;

#[async_trait]
impl ActionInvoker for LoggingActionInvoker {
    async fn invoke(&self, action: &str, args: serde_json::Value) -> Result<serde_json::Value, EyeflowError> {
        tracing::info!(action, %args, "action invoked");
        Ok(args)
    }

    fn physical_window(&self, action: &str) -> Option<Duration> {
        if action.starts_with(PHYSICAL_ACTION_PREFIX) {
            Some(PHYSICAL_ACTION_WINDOW)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eyeflow_core::ServiceFormat;

    fn metadata() -> DispatchMetadata {
        DispatchMetadata {
            format: ServiceFormat::Wasm,
            method_name: "invoke".to_string(),
            transport_endpoint: None,
            container_env: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn healthy_handle_echoes_args() {
        let invoker = LocalServiceInvoker;
        let handle = ServiceHandle::Wasm {
            module_bytes: 10,
            valid: true,
        };
        let out = invoker
            .invoke(&handle, &metadata(), json!({"a": 1}), &BTreeMap::new())
            .await
            .unwrap();
        assert_eq!(out["args"], json!({"a": 1}));
    }

    #[test]
    fn physical_prefixed_actions_get_a_window() {
        let invoker = LoggingActionInvoker;
        assert!(invoker.physical_window("physical:move-arm").is_some());
        assert!(invoker.physical_window("send-email").is_none());
    }
}
