// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
#![warn(missing_docs)]
//! Cancellation Bus (C4).
//!
//! A per-execution, per-target broadcast channel that physical-action
//! instructions poll before committing: a `tokio::sync::broadcast`
//! sender per subscription key, created lazily so one bus instance
//! serves every execution in the process, plus a windowed wait instead
//! of an unbounded `recv` loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use eyeflow_core::ExecutionId;
use tokio::sync::broadcast;
use tokio::time::timeout;

const CANCEL_SIGNAL: &str = "CANCEL";
const CHANNEL_CAPACITY: usize = 16;

fn subscription_key(execution_id: ExecutionId, target: &str) -> String {
    format!("{execution_id}#{target}")
}

/// Publishes and awaits cancellation signals, scoped per `(executionId,
/// target)` pair.
///
/// In its normal mode channels are created lazily and held in memory for
/// the process lifetime of the execution; [`CancellationBus::degraded`]
/// constructs a bus that always reports no cancellation capability, for
/// use when the platform's underlying pub/sub transport cannot be
/// reached at startup.
pub struct CancellationBus {
    channels: DashMap<String, broadcast::Sender<()>>,
    degraded: bool,
    warned: AtomicBool,
}

impl CancellationBus {
    /// A bus backed by in-process broadcast channels.
    #[must_use]
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
            degraded: false,
            warned: AtomicBool::new(false),
        }
    }

    /// A bus with no cancellation capability — every
    /// [`wait_for_cancellation`](Self::wait_for_cancellation) call sleeps
    /// out its window and returns `false`. Used when the underlying
    /// pub/sub transport is unavailable at startup.
    #[must_use]
    pub fn degraded() -> Self {
        Self {
            channels: DashMap::new(),
            degraded: true,
            warned: AtomicBool::new(false),
        }
    }

    fn sender(&self, key: &str) -> broadcast::Sender<()> {
        self.channels
            .entry(key.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }

    /// Subscribe to `(execution_id, target)` and wait up to `window` for a
    /// cancellation signal.
    ///
    /// Returns `true` if a cancellation arrived within the window, `false`
    /// on timeout. `command` names the physical action about to commit;
    /// it has no effect on resolution and exists purely for callers'
    /// logging/audit correlation.
    pub async fn wait_for_cancellation(
        &self,
        execution_id: ExecutionId,
        target: &str,
        command: &str,
        window: Duration,
    ) -> bool {
        if self.degraded {
            if !self.warned.swap(true, Ordering::Relaxed) {
                tracing::warn!(
                    %execution_id,
                    target,
                    "cancellation bus degraded: no pub/sub transport, command '{command}' cannot be cancelled"
                );
            }
            tokio::time::sleep(window).await;
            return false;
        }

        let key = subscription_key(execution_id, target);
        let mut rx = self.sender(&key).subscribe();
        match timeout(window, rx.recv()).await {
            Ok(Ok(())) => true,
            Ok(Err(_)) | Err(_) => false,
        }
    }

    /// Publish a cancellation signal to every channel registered under
    /// `execution_id`, regardless of target.
    pub fn cancel_execution(&self, execution_id: ExecutionId) {
        let prefix = format!("{execution_id}#");
        for entry in &self.channels {
            if entry.key().starts_with(&prefix) {
                let _ = entry.value().send(());
            }
        }
        tracing::info!(%execution_id, "execution cancellation published");
    }

    /// Publish a cancellation signal to every channel whose subscription
    /// key contains `target`, across all executions.
    pub fn emergency_stop(&self, target: &str) {
        let mut matched = 0usize;
        for entry in &self.channels {
            if entry.key().contains(target) {
                let _ = entry.value().send(());
                matched += 1;
            }
        }
        tracing::warn!(target, matched, "emergency stop published");
    }
}

impl Default for CancellationBus {
    fn default() -> Self {
        Self::new()
    }
}
