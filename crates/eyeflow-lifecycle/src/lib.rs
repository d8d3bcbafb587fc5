// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
#![warn(missing_docs)]
//! Project / Version Lifecycle (C12).
//!
//! A project is a long-lived workspace; each version is immutable once it
//! leaves `DRAFT`. This crate owns the state machine below —
//! `DRAFT → VALID → ACTIVE → ARCHIVED`, with `EXECUTING` as a transient
//! marker — and enforces its invariants: version numbers are monotone per
//! project, at most one version is `ACTIVE` at a time, and the only
//! `DRAFT`-to-non-`DRAFT` transition is through successful validation.
//! State lives in a `BTreeMap`-backed table keyed by a monotone counter,
//! with every transition timestamped for audit.

use std::collections::BTreeMap;
use std::sync::Mutex;

use chrono::Utc;
use eyeflow_core::{sha256_of_canonical, EyeflowError, ProjectId, UserId, VersionId, VersionNumber};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a [`Project`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    /// Newly created, no version has ever been activated.
    Draft,
    /// Has an `ACTIVE` version and may execute.
    Active,
    /// Execution suspended by the owner; versions are unaffected.
    Paused,
    /// Retired; no further versions may be created or activated.
    Archived,
}

/// Lifecycle status of a [`ProjectVersion`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionStatus {
    /// Mutable, unvalidated. Never executes.
    Draft,
    /// Validated but not the project's running version.
    Valid,
    /// The project's single currently-running version.
    Active,
    /// Retired; cannot be activated again without re-validation... except
    /// an `ARCHIVED` version that was once `VALID` may be reactivated
    /// directly ("activate only from VALID or
    /// ARCHIVED-but-valid").
    Archived,
    /// Transient marker held only for the duration of an atomic
    /// transition or an in-flight execution; never observed to persist
    /// across a call returning.
    Executing,
}

/// Sets of identifiers a project's versions may reference; all execution
/// is constrained to these.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AllowedSets {
    /// Connector ids this project may call.
    pub connector_ids: Vec<String>,
    /// Function ids this project may invoke.
    pub function_ids: Vec<String>,
    /// Trigger types this project may register.
    pub trigger_types: Vec<String>,
    /// Node ids this project may place work on.
    pub node_ids: Vec<String>,
}

/// Running counters a project accumulates across its lifetime.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectStatistics {
    /// Total executions ever started against any version of this project.
    pub total_executions: u64,
    /// Executions that reached `SUCCEEDED`.
    pub succeeded_executions: u64,
    /// Executions that reached `FAILED`.
    pub failed_executions: u64,
    /// ISO-8601 timestamp of the most recent execution start, if any.
    pub last_execution_at: Option<String>,
}

/// A long-lived workspace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    /// Unique identifier.
    pub id: ProjectId,
    /// Owning tenant.
    pub user_id: UserId,
    /// Human-readable name.
    pub name: String,
    /// Current lifecycle status.
    pub status: ProjectStatus,
    /// Highest version number ever created for this project.
    pub current_version: VersionNumber,
    /// The version currently `ACTIVE`, if any.
    pub active_version_id: Option<VersionId>,
    /// Connector/function/trigger/node allowlists.
    pub allowed: AllowedSets,
    /// Accumulated statistics.
    pub statistics: ProjectStatistics,
}

/// One immutable (once past `DRAFT`) version of a project's workflow
/// definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectVersion {
    /// Unique identifier.
    pub id: VersionId,
    /// Owning project.
    pub project_id: ProjectId,
    /// Monotone version number, `>= 1`.
    pub version: VersionNumber,
    /// The active version's number at the time this one was created.
    pub parent_version: Option<VersionNumber>,
    /// Current lifecycle status.
    pub status: VersionStatus,
    /// Human-authored DAG source of truth.
    pub dag_definition: serde_json::Value,
    /// SHA-256 of canonical JSON of `dag_definition`.
    pub dag_checksum: String,
    /// Compiled IR, base64 or opaque bytes, once attached.
    pub ir_binary: Option<Vec<u8>>,
    /// SHA-256 of `ir_binary`.
    pub ir_checksum: Option<String>,
    /// Ed25519 signature over `ir_checksum`.
    pub ir_signature: Option<String>,
    /// Identifies the key that produced `ir_signature`.
    pub signature_key_id: Option<String>,
    /// Node-id placements for distributed execution, if any.
    #[serde(default)]
    pub node_placements: BTreeMap<String, String>,
    /// Pre-load resource manifest snapshot, if the artifact has been sealed.
    pub preload_resources: Option<serde_json::Value>,
    /// When this version was compiled (IR attached), and by whom.
    pub compiled_at: Option<String>,
    /// See [`Self::compiled_at`].
    pub compiled_by: Option<UserId>,
    /// When this version passed validation.
    pub validated_at: Option<String>,
    /// See [`Self::validated_at`].
    pub validated_by: Option<UserId>,
    /// When this version was activated.
    pub activated_at: Option<String>,
    /// See [`Self::activated_at`].
    pub activated_by: Option<UserId>,
    /// When this version was archived.
    pub archived_at: Option<String>,
    /// See [`Self::archived_at`].
    pub archived_by: Option<UserId>,
    /// Executions started against this version.
    pub execution_count: u64,
}

struct ProjectRecord {
    project: Project,
    versions: BTreeMap<VersionNumber, ProjectVersion>,
}

/// In-memory registry enforcing the lifecycle invariants
/// across every project it tracks. One instance per node; callers own
/// persistence of the `Project`/`ProjectVersion` snapshots it returns.
pub struct LifecycleRegistry {
    projects: Mutex<BTreeMap<ProjectId, ProjectRecord>>,
}

impl LifecycleRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            projects: Mutex::new(BTreeMap::new()),
        }
    }

    /// Create a new, empty project in `DRAFT` status.
    pub fn create_project(&self, user_id: UserId, name: impl Into<String>) -> Project {
        let project = Project {
            id: ProjectId::new(),
            user_id,
            name: name.into(),
            status: ProjectStatus::Draft,
            current_version: 0,
            active_version_id: None,
            allowed: AllowedSets::default(),
            statistics: ProjectStatistics::default(),
        };
        let mut projects = self.lock();
        projects.insert(
            project.id,
            ProjectRecord {
                project: project.clone(),
                versions: BTreeMap::new(),
            },
        );
        project
    }

    /// Snapshot a project by id.
    #[must_use]
    pub fn get_project(&self, project_id: ProjectId) -> Option<Project> {
        self.lock().get(&project_id).map(|r| r.project.clone())
    }

    /// Snapshot one version by its project and number.
    #[must_use]
    pub fn get_version(&self, project_id: ProjectId, version: VersionNumber) -> Option<ProjectVersion> {
        self.lock()
            .get(&project_id)
            .and_then(|r| r.versions.get(&version))
            .cloned()
    }

    /// The project's currently `ACTIVE` version, if any.
    #[must_use]
    pub fn active_version(&self, project_id: ProjectId) -> Option<ProjectVersion> {
        let projects = self.lock();
        let record = projects.get(&project_id)?;
        let active_id = record.project.active_version_id?;
        record.versions.values().find(|v| v.id == active_id).cloned()
    }

    /// Create a new `DRAFT` version.
    ///
    /// `new version = project.currentVersion + 1`; `parentVersion` is the
    /// number of the current `ACTIVE` version, or `None` for a project's
    /// first version (invariant 5).
    ///
    /// # Errors
    ///
    /// [`EyeflowError::LifecycleViolation`] if the project is archived, or
    /// if `has_running_execution` is `true` (the caller — the execution
    /// orchestrator — is the only party that knows whether a `RUNNING`
    /// execution exists against the current `ACTIVE` version).
    pub fn create_version(
        &self,
        project_id: ProjectId,
        author: UserId,
        dag_definition: serde_json::Value,
        has_running_execution: bool,
    ) -> Result<ProjectVersion, EyeflowError> {
        let mut projects = self.lock();
        let record = projects
            .get_mut(&project_id)
            .ok_or_else(|| not_found(project_id))?;

        if record.project.status == ProjectStatus::Archived {
            return Err(EyeflowError::LifecycleViolation {
                message: format!("project {project_id} is archived; cannot create a version"),
            });
        }
        if has_running_execution {
            return Err(EyeflowError::LifecycleViolation {
                message: "a RUNNING execution exists against the current ACTIVE version"
                    .to_string(),
            });
        }

        let parent_version = record
            .project
            .active_version_id
            .and_then(|active_id| record.versions.values().find(|v| v.id == active_id))
            .map(|v| v.version);

        let new_number = record.project.current_version + 1;
        let dag_checksum = sha256_of_canonical(&dag_definition)?;
        let now = Utc::now().to_rfc3339();

        let version = ProjectVersion {
            id: VersionId::new(),
            project_id,
            version: new_number,
            parent_version,
            status: VersionStatus::Draft,
            dag_definition,
            dag_checksum,
            ir_binary: None,
            ir_checksum: None,
            ir_signature: None,
            signature_key_id: None,
            node_placements: BTreeMap::new(),
            preload_resources: None,
            compiled_at: Some(now.clone()),
            compiled_by: Some(author),
            validated_at: None,
            validated_by: None,
            activated_at: None,
            activated_by: None,
            archived_at: None,
            archived_by: None,
            execution_count: 0,
        };

        record.project.current_version = new_number;
        record.versions.insert(new_number, version.clone());
        tracing::info!(%project_id, version = new_number, "version created");
        Ok(version)
    }

    /// Attach a compiled, signed IR artifact and transition `DRAFT → VALID`.
    ///
    /// # Errors
    ///
    /// [`EyeflowError::LifecycleViolation`] unless the version is
    /// currently `DRAFT`.
    #[allow(clippy::too_many_arguments)]
    pub fn validate_version(
        &self,
        project_id: ProjectId,
        version: VersionNumber,
        author: UserId,
        ir_binary: Vec<u8>,
        ir_checksum: impl Into<String>,
        ir_signature: impl Into<String>,
        signature_key_id: impl Into<String>,
        node_placements: BTreeMap<String, String>,
    ) -> Result<ProjectVersion, EyeflowError> {
        let mut projects = self.lock();
        let v = self.version_mut(&mut projects, project_id, version)?;
        if v.status != VersionStatus::Draft {
            return Err(EyeflowError::LifecycleViolation {
                message: format!(
                    "version {version} is {:?}, not DRAFT; cannot validate",
                    v.status
                ),
            });
        }
        v.ir_binary = Some(ir_binary);
        v.ir_checksum = Some(ir_checksum.into());
        v.ir_signature = Some(ir_signature.into());
        v.signature_key_id = Some(signature_key_id.into());
        v.node_placements = node_placements;
        v.status = VersionStatus::Valid;
        v.validated_at = Some(Utc::now().to_rfc3339());
        v.validated_by = Some(author);
        tracing::info!(%project_id, version, "version validated");
        Ok(v.clone())
    }

    /// Activate a `VALID` (or previously-`VALID`, now `ARCHIVED`) version.
    ///
    /// If another version is currently `ACTIVE`, it is archived in the
    /// same transaction. Sets `project.active_version_id`.
    ///
    /// # Errors
    ///
    /// [`EyeflowError::LifecycleViolation`] if the target version is not
    /// `VALID` or `ARCHIVED`-with-a-validation-record, or if the current
    /// `ACTIVE` version is `EXECUTING`.
    pub fn activate_version(
        &self,
        project_id: ProjectId,
        version: VersionNumber,
        author: UserId,
    ) -> Result<ProjectVersion, EyeflowError> {
        let mut projects = self.lock();
        let record = projects
            .get_mut(&project_id)
            .ok_or_else(|| not_found(project_id))?;

        {
            let target = record
                .versions
                .get(&version)
                .ok_or_else(|| no_such_version(project_id, version))?;
            let reactivatable = target.status == VersionStatus::Archived && target.validated_at.is_some();
            if target.status != VersionStatus::Valid && !reactivatable {
                return Err(EyeflowError::LifecycleViolation {
                    message: format!(
                        "version {version} is {:?}; activate requires VALID or previously-valid ARCHIVED",
                        target.status
                    ),
                });
            }
        }

        if let Some(active_id) = record.project.active_version_id {
            if let Some(current_active) = record.versions.values_mut().find(|v| v.id == active_id) {
                if current_active.status == VersionStatus::Executing {
                    return Err(EyeflowError::LifecycleViolation {
                        message: format!(
                            "version {} is EXECUTING; cannot activate a replacement",
                            current_active.version
                        ),
                    });
                }
                if current_active.version != version {
                    current_active.status = VersionStatus::Archived;
                    current_active.archived_at = Some(Utc::now().to_rfc3339());
                    current_active.archived_by = Some(author);
                }
            }
        }

        let now = Utc::now().to_rfc3339();
        let target = record
            .versions
            .get_mut(&version)
            .ok_or_else(|| no_such_version(project_id, version))?;
        target.status = VersionStatus::Active;
        target.activated_at = Some(now);
        target.activated_by = Some(author);

        record.project.active_version_id = Some(target.id);
        record.project.status = ProjectStatus::Active;
        if version > record.project.current_version {
            record.project.current_version = version;
        }
        tracing::info!(%project_id, version, "version activated");
        Ok(target.clone())
    }

    /// Archive a version outright.
    ///
    /// # Errors
    ///
    /// [`EyeflowError::LifecycleViolation`] if `version` is the project's
    /// current `ACTIVE` version, or is currently `EXECUTING`.
    pub fn archive_version(
        &self,
        project_id: ProjectId,
        version: VersionNumber,
        author: UserId,
    ) -> Result<ProjectVersion, EyeflowError> {
        let mut projects = self.lock();
        let record = projects
            .get_mut(&project_id)
            .ok_or_else(|| not_found(project_id))?;
        let is_active = record
            .project
            .active_version_id
            .is_some_and(|id| record.versions.get(&version).is_some_and(|v| v.id == id));

        let v = record
            .versions
            .get_mut(&version)
            .ok_or_else(|| no_such_version(project_id, version))?;

        if is_active {
            return Err(EyeflowError::LifecycleViolation {
                message: format!("version {version} is the current ACTIVE version; cannot archive directly"),
            });
        }
        if v.status == VersionStatus::Executing {
            return Err(EyeflowError::LifecycleViolation {
                message: format!("version {version} is EXECUTING; cannot archive"),
            });
        }

        v.status = VersionStatus::Archived;
        v.archived_at = Some(Utc::now().to_rfc3339());
        v.archived_by = Some(author);
        tracing::info!(%project_id, version, "version archived");
        Ok(v.clone())
    }

    /// Mark a version `EXECUTING` for the duration of one execution.
    ///
    /// Used by the execution orchestrator (C13) to block concurrent
    /// lifecycle transitions (`activate`, `archive`) while a run is in
    /// flight. Only the currently `ACTIVE` version may be marked.
    ///
    /// # Errors
    ///
    /// [`EyeflowError::LifecycleViolation`] if `version` is not `ACTIVE`.
    pub fn begin_execution(&self, project_id: ProjectId, version: VersionNumber) -> Result<(), EyeflowError> {
        let mut projects = self.lock();
        let v = self.version_mut(&mut projects, project_id, version)?;
        if v.status != VersionStatus::Active {
            return Err(EyeflowError::LifecycleViolation {
                message: format!("version {version} is {:?}, not ACTIVE; cannot execute", v.status),
            });
        }
        v.status = VersionStatus::Executing;
        v.execution_count += 1;
        Ok(())
    }

    /// Release the `EXECUTING` marker set by [`begin_execution`](Self::begin_execution),
    /// restoring `ACTIVE`.
    pub fn end_execution(&self, project_id: ProjectId, version: VersionNumber) {
        let mut projects = self.lock();
        if let Ok(v) = self.version_mut(&mut projects, project_id, version) {
            if v.status == VersionStatus::Executing {
                v.status = VersionStatus::Active;
            }
        }
    }

    /// Record one execution's outcome against the project's running
    /// statistics . Called by the
    /// execution orchestrator (C13) once an execution reaches a terminal
    /// state; has no effect on version status.
    pub fn record_execution(&self, project_id: ProjectId, succeeded: bool) {
        let mut projects = self.lock();
        if let Some(record) = projects.get_mut(&project_id) {
            record.project.statistics.total_executions += 1;
            if succeeded {
                record.project.statistics.succeeded_executions += 1;
            } else {
                record.project.statistics.failed_executions += 1;
            }
            record.project.statistics.last_execution_at = Some(Utc::now().to_rfc3339());
        }
    }

    fn version_mut<'a>(
        &self,
        projects: &'a mut BTreeMap<ProjectId, ProjectRecord>,
        project_id: ProjectId,
        version: VersionNumber,
    ) -> Result<&'a mut ProjectVersion, EyeflowError> {
        projects
            .get_mut(&project_id)
            .ok_or_else(|| not_found(project_id))?
            .versions
            .get_mut(&version)
            .ok_or_else(|| no_such_version(project_id, version))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<ProjectId, ProjectRecord>> {
        self.projects.lock().expect("lifecycle registry mutex poisoned")
    }
}

impl Default for LifecycleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn not_found(project_id: ProjectId) -> EyeflowError {
    EyeflowError::LifecycleViolation {
        message: format!("no such project {project_id}"),
    }
}

fn no_such_version(project_id: ProjectId, version: VersionNumber) -> EyeflowError {
    EyeflowError::LifecycleViolation {
        message: format!("project {project_id} has no version {version}"),
    }
}
