// SPDX-License-Identifier: MIT OR Apache-2.0
//! Lifecycle scenario runner for the `lifecycle` subcommand.
//!
//! [`LifecycleRegistry`] is an in-memory, per-process table with no
//! persistence of its own — there is nothing for a CLI
//! invocation to attach to from a prior run. So the `lifecycle` subcommand
//! scripts a whole sequence of transitions from one input file and prints
//! the resulting project/version state, rather than pretending to offer a
//! `create`/`activate`/... command pair against state that wouldn't survive
//! the process exiting.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use base64::Engine;
use eyeflow_core::{UserId, VersionNumber};
use eyeflow_lifecycle::{LifecycleRegistry, Project, ProjectVersion};
use serde::{Deserialize, Serialize};

/// One step in a scripted lifecycle scenario.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    /// [`LifecycleRegistry::create_version`].
    CreateVersion {
        /// Human-authored DAG source of truth.
        dag_definition: serde_json::Value,
        /// Whether a `RUNNING` execution exists against the current
        /// `ACTIVE` version.
        #[serde(default)]
        has_running_execution: bool,
    },
    /// [`LifecycleRegistry::validate_version`]. `ir_binary_base64` is the
    /// base64 encoding of the compiled IR bytes.
    ValidateVersion {
        /// Version number to validate.
        version: VersionNumber,
        /// Base64-encoded compiled IR.
        ir_binary_base64: String,
        /// Checksum of the IR.
        ir_checksum: String,
        /// Signature over the checksum.
        ir_signature: String,
        /// Key id that produced the signature.
        signature_key_id: String,
        /// Node-id placements for distributed execution, if any.
        #[serde(default)]
        node_placements: BTreeMap<String, String>,
    },
    /// [`LifecycleRegistry::activate_version`].
    ActivateVersion {
        /// Version number to activate.
        version: VersionNumber,
    },
    /// [`LifecycleRegistry::archive_version`].
    ArchiveVersion {
        /// Version number to archive.
        version: VersionNumber,
    },
    /// [`LifecycleRegistry::begin_execution`].
    BeginExecution {
        /// Version number to mark `EXECUTING`.
        version: VersionNumber,
    },
    /// [`LifecycleRegistry::end_execution`].
    EndExecution {
        /// Version number to release from `EXECUTING`.
        version: VersionNumber,
    },
    /// [`LifecycleRegistry::record_execution`].
    RecordExecution {
        /// Whether the execution succeeded.
        succeeded: bool,
    },
}

/// Final state of a scenario run: the project plus every version touched.
#[derive(Debug, Serialize)]
pub struct ScenarioResult {
    /// The project, after every operation has applied.
    pub project: Project,
    /// Every version the project now has, in version-number order.
    pub versions: Vec<ProjectVersion>,
}

/// Create a fresh project under one author and apply `ops` in order.
///
/// # Errors
///
/// Returns the first [`eyeflow_core::EyeflowError::LifecycleViolation`] (or
/// malformed base64) any operation raises; scenario application stops at
/// that point.
pub fn run_scenario(project_name: &str, ops: Vec<Operation>) -> Result<ScenarioResult> {
    let registry = LifecycleRegistry::new();
    let author = UserId::new();
    let project = registry.create_project(author, project_name);
    let project_id = project.id;

    for (i, op) in ops.into_iter().enumerate() {
        apply(&registry, project_id, author, op)
            .with_context(|| format!("scenario step {i}"))?;
    }

    let project = registry
        .get_project(project_id)
        .context("project vanished mid-scenario")?;
    let mut versions = Vec::new();
    for v in 1..=project.current_version {
        if let Some(version) = registry.get_version(project_id, v) {
            versions.push(version);
        }
    }

    Ok(ScenarioResult { project, versions })
}

fn apply(
    registry: &LifecycleRegistry,
    project_id: eyeflow_core::ProjectId,
    author: UserId,
    op: Operation,
) -> Result<()> {
    match op {
        Operation::CreateVersion {
            dag_definition,
            has_running_execution,
        } => {
            registry.create_version(project_id, author, dag_definition, has_running_execution)?;
        }
        Operation::ValidateVersion {
            version,
            ir_binary_base64,
            ir_checksum,
            ir_signature,
            signature_key_id,
            node_placements,
        } => {
            let ir_binary = base64::engine::general_purpose::STANDARD
                .decode(ir_binary_base64)
                .context("decode ir_binary_base64")?;
            registry.validate_version(
                project_id,
                version,
                author,
                ir_binary,
                ir_checksum,
                ir_signature,
                signature_key_id,
                node_placements,
            )?;
        }
        Operation::ActivateVersion { version } => {
            registry.activate_version(project_id, version, author)?;
        }
        Operation::ArchiveVersion { version } => {
            registry.archive_version(project_id, version, author)?;
        }
        Operation::BeginExecution { version } => {
            registry.begin_execution(project_id, version)?;
        }
        Operation::EndExecution { version } => {
            registry.end_execution(project_id, version);
        }
        Operation::RecordExecution { succeeded } => {
            registry.record_execution(project_id, succeeded);
        }
    }
    Ok(())
}
