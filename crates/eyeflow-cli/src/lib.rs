// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
//! Library half of the `eyeflow` operator CLI: reusable pieces the `eyeflow`
//! binary wires together, kept separate so integration tests can exercise
//! them without spawning a process.

/// HTTP/filesystem [`eyeflow_preload::Fetcher`] implementations for `seal`.
pub mod fetchers;
/// Local dry-run [`eyeflow_vm::ServiceInvoker`]/[`eyeflow_vm::ActionInvoker`]
/// for `execute`.
pub mod invokers;
/// PEM encoding for the node's Ed25519 signing key.
pub mod keys;
/// Scripted project/version lifecycle scenario runner for `lifecycle`.
pub mod scenario;
