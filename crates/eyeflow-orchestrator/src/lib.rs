// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
#![warn(missing_docs)]
//! Project Execution Orchestrator (C13).
//!
//! The composition point that turns "run project P's active version" into
//! a VM invocation plus an audited, lifecycle-aware record of what
//! happened: a verify-run-record loop that checks the workflow's
//! signature before ever invoking the VM, and appends an audit-chain
//! side effect at every instruction-level boundary the VM reports.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use dashmap::DashMap;
use eyeflow_audit::{AppendInput, AuditChain, AuditEventType};
use eyeflow_cancel::CancellationBus;
use eyeflow_core::{EyeflowError, ExecutionId, ProjectId, UserId, VersionNumber, WorkflowId};
use eyeflow_ir::{CompiledWorkflow, Opcode};
use eyeflow_lifecycle::LifecycleRegistry;
use eyeflow_preload::Preloader;
use eyeflow_vm::{StepOutcome, StepStatus, Vm};
use serde::{Deserialize, Serialize};

/// Terminal (or in-flight) status of one [`ExecutionRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Currently running.
    Running,
    /// Reached `RETURN` without error.
    Succeeded,
    /// Aborted on an unrecovered instruction error.
    Failed,
    /// Aborted by a cancellation signal.
    Cancelled,
}

/// One run of a compiled workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    /// Unique identifier for this run.
    pub id: ExecutionId,
    /// The sealed artifact this run executed.
    pub workflow_id: WorkflowId,
    /// Owning project.
    pub project_id: ProjectId,
    /// Project version this run executed against.
    pub version: VersionNumber,
    /// ISO-8601 start timestamp.
    pub started_at: String,
    /// ISO-8601 completion timestamp, once terminal.
    pub completed_at: Option<String>,
    /// Current status.
    pub status: ExecutionStatus,
    /// Published output, once `RETURN` is reached.
    pub output: Option<serde_json::Value>,
    /// Structured error, once failed.
    pub error: Option<EyeflowError>,
    /// Per-instruction trace, in execution order.
    pub steps: Vec<StepOutcome>,
}

/// Cross-execution scratch state for one workflow: accumulators a
/// workflow's instructions may read and update across separate runs (e.g.
/// a rolling average a `TRANSFORM` consults). Not part of the VM's
/// per-execution register file — this persists in the orchestrator,
/// keyed by [`WorkflowId`], and is handed to the caller around each
/// [`Orchestrator::run`] rather than threaded through the VM itself,
/// since this instruction set has no opcode that reads it directly.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryState {
    /// Arbitrary named values a caller-supplied transform/predicate may
    /// consult or update between runs.
    pub values: BTreeMap<String, serde_json::Value>,
    /// Total executions observed against this workflow.
    pub execution_count: u64,
}

/// Runs compiled workflows against a project's lifecycle state, verifying
/// the artifact's signature, invoking the VM, and appending audit events
/// at each reported instruction boundary.
pub struct Orchestrator {
    vm: Arc<Vm>,
    preloader: Arc<Preloader>,
    audit: Arc<AuditChain>,
    cancellation: Arc<CancellationBus>,
    lifecycle: Arc<LifecycleRegistry>,
    memory: DashMap<WorkflowId, Arc<std::sync::Mutex<MemoryState>>>,
}

/// Target used on the cancellation bus for a whole-execution-level stop,
/// distinct from the per-action targets physical instructions subscribe
/// under (action-scoped windows are unaffected by this).
const EXECUTION_CANCEL_TARGET: &str = "__execution__";

impl Orchestrator {
    /// Build an orchestrator from its collaborators.
    #[must_use]
    pub fn new(
        vm: Arc<Vm>,
        preloader: Arc<Preloader>,
        audit: Arc<AuditChain>,
        cancellation: Arc<CancellationBus>,
        lifecycle: Arc<LifecycleRegistry>,
    ) -> Self {
        Self {
            vm,
            preloader,
            audit,
            cancellation,
            lifecycle,
            memory: DashMap::new(),
        }
    }

    /// Fetch (creating if absent) the cross-execution memory state for
    /// `workflow_id`.
    #[must_use]
    pub fn get_or_create_memory_state(&self, workflow_id: WorkflowId) -> Arc<std::sync::Mutex<MemoryState>> {
        self.memory
            .entry(workflow_id)
            .or_insert_with(|| Arc::new(std::sync::Mutex::new(MemoryState::default())))
            .clone()
    }

    /// Run `workflow` under `project_id`/`version` against `input`.
    ///
    /// 1. Verifies `workflow.checksum`/`workflow.signature` under the
    ///    node's signing key ("verify irChecksum/irSignature").
    /// 2. Marks the version `EXECUTING` via the lifecycle registry, so
    ///    concurrent `activate`/`archive` calls are rejected for its
    ///    duration.
    /// 3. Appends an `EXECUTION_START` audit event, invokes the VM racing
    ///    a whole-execution cancellation signal, appends per-step audit
    ///    events, then an `EXECUTION_COMPLETE`/failure event.
    /// 4. Updates the workflow's [`MemoryState`] and the project's
    ///    running statistics.
    ///
    /// # Errors
    ///
    /// Returns [`EyeflowError::Signature`] if verification fails (fatal)
    /// without ever invoking the VM. Otherwise returns `Ok` with
    /// an [`ExecutionRecord`] whose `status`/`error` reflect the run's
    /// actual outcome — a failed or cancelled execution is not itself a
    /// `Result::Err` from this function.
    pub async fn run(
        &self,
        project_id: ProjectId,
        version: VersionNumber,
        workflow: &CompiledWorkflow,
        input: serde_json::Value,
    ) -> Result<ExecutionRecord, EyeflowError> {
        if !self.preloader.verify(workflow) {
            return Err(EyeflowError::Signature {
                message: format!(
                    "compiled workflow {} failed signature verification under key '{}'",
                    workflow.id, workflow.signature_key_id
                ),
            });
        }

        self.lifecycle.begin_execution(project_id, version)?;
        let execution_id = ExecutionId::new();
        let started_at = Utc::now().to_rfc3339();
        let started = Instant::now();

        self.audit
            .append(AppendInput {
                workflow_id: workflow.id,
                workflow_version: Some(version),
                instruction_id: None,
                event_type: AuditEventType::ExecutionStart,
                input: input.clone(),
                output: serde_json::Value::Null,
                duration_ms: 0,
                details: serde_json::json!({"executionId": execution_id.to_string()}),
            })
            .await?;

        let vm = Arc::clone(&self.vm);
        let workflow_owned = workflow.clone();
        let input_for_vm = input.clone();
        let run = vm.execute(&workflow_owned, execution_id, input_for_vm);
        let cancel_wait = self.cancellation.wait_for_cancellation(
            execution_id,
            EXECUTION_CANCEL_TARGET,
            "EXECUTE",
            std::time::Duration::from_secs(u64::from(u32::MAX)),
        );
        tokio::pin!(run);
        tokio::pin!(cancel_wait);

        let outcome = tokio::select! {
            biased;
            cancelled = &mut cancel_wait => {
                if cancelled {
                    None
                } else {
                    Some(run.await)
                }
            }
            result = &mut run => Some(result),
        };

        self.lifecycle.end_execution(project_id, version);

        let (status, output, error, steps) = match outcome {
            None => (ExecutionStatus::Cancelled, None, Some(EyeflowError::Cancelled {
                reason: "execution-level cancellation signal received".to_string(),
            }), Vec::new()),
            Some(Ok(result)) => (ExecutionStatus::Succeeded, result.output, None, result.steps),
            Some(Err(failure)) => (ExecutionStatus::Failed, None, Some(failure.error), failure.steps),
        };

        for step in &steps {
            self.append_step_event(workflow.id, version, step).await?;
        }

        let succeeded = status == ExecutionStatus::Succeeded;
        self.audit
            .append(AppendInput {
                workflow_id: workflow.id,
                workflow_version: Some(version),
                instruction_id: None,
                event_type: AuditEventType::ExecutionComplete,
                input: serde_json::Value::Null,
                output: output.clone().unwrap_or(serde_json::Value::Null),
                duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
                details: serde_json::json!({
                    "executionId": execution_id.to_string(),
                    "status": status,
                    "error": error.as_ref().map(ToString::to_string),
                }),
            })
            .await?;

        self.lifecycle.record_execution(project_id, succeeded);
        {
            let state = self.get_or_create_memory_state(workflow.id);
            let mut state = state.lock().expect("memory state mutex poisoned");
            state.execution_count += 1;
        }

        Ok(ExecutionRecord {
            id: execution_id,
            workflow_id: workflow.id,
            project_id,
            version,
            started_at,
            completed_at: Some(Utc::now().to_rfc3339()),
            status,
            output,
            error,
            steps,
        })
    }

    /// Publish a user-initiated cancellation for `execution_id` (spec
    /// §4.5): wakes both the whole-execution wait this orchestrator holds
    /// open during [`run`](Self::run) and any per-action waits the VM is
    /// blocked on.
    pub fn cancel(&self, execution_id: ExecutionId) {
        self.cancellation.cancel_execution(execution_id);
    }

    async fn append_step_event(
        &self,
        workflow_id: WorkflowId,
        version: VersionNumber,
        step: &StepOutcome,
    ) -> Result<(), EyeflowError> {
        let event_type = match (step.opcode, step.status) {
            (Opcode::Validate, StepStatus::Succeeded) => AuditEventType::ValidationPass,
            (Opcode::Validate, StepStatus::Failed) => AuditEventType::ValidationFail,
            (Opcode::Postcondition, StepStatus::Succeeded) => AuditEventType::PostconditionPassed,
            (Opcode::Postcondition, StepStatus::Failed) => AuditEventType::PostconditionFailed,
            (Opcode::CallService, StepStatus::FellBack) => AuditEventType::FallbackTriggered,
            (Opcode::CallAction, _) => AuditEventType::ActionTaken,
            (Opcode::Loop, StepStatus::Succeeded) => AuditEventType::LoopConverged,
            (Opcode::Loop, StepStatus::Failed) => AuditEventType::LoopTimeout,
            _ => return Ok(()),
        };
        self.audit
            .append(AppendInput {
                workflow_id,
                workflow_version: Some(version),
                instruction_id: Some(step.instruction_index.to_string()),
                event_type,
                input: serde_json::Value::Null,
                output: serde_json::Value::Null,
                duration_ms: step.duration_ms,
                details: serde_json::json!({"error": step.error}),
            })
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use ed25519_dalek::SigningKey;
    use eyeflow_core::UserId;
    use eyeflow_ir::{DispatchMetadata, IrInstruction, IrProgram, Operands, RegisterId, ServiceHandle};
    use eyeflow_vault::Vault;
    use eyeflow_vm::{ActionInvoker, ServiceInvoker};
    use rand::rngs::OsRng;
    use std::collections::{BTreeMap as Map, BTreeSet as Set};

    struct EchoAction;
    #[async_trait]
    impl ActionInvoker for EchoAction {
        async fn invoke(&self, _action: &str, args: serde_json::Value) -> Result<serde_json::Value, EyeflowError> {
            Ok(args)
        }
    }

    struct EchoService;
    #[async_trait]
    impl ServiceInvoker for EchoService {
        async fn invoke(
            &self,
            _handle: &ServiceHandle,
            _metadata: &DispatchMetadata,
            args: serde_json::Value,
            _secrets: &BTreeMap<String, String>,
        ) -> Result<serde_json::Value, EyeflowError> {
            Ok(args)
        }
    }

    fn signing_key() -> SigningKey {
        let mut csprng = OsRng;
        SigningKey::generate(&mut csprng)
    }

    fn trivial_program() -> IrProgram {
        let instructions = vec![
            IrInstruction {
                index: 0,
                opcode: Opcode::Transform,
                dest: Some(RegisterId(1)),
                src: vec![RegisterId(0)],
                operands: Operands::Transform { function: "identity".to_string() },
                dispatch_metadata: None,
            },
            IrInstruction {
                index: 1,
                opcode: Opcode::Return,
                dest: None,
                src: vec![RegisterId(1)],
                operands: Operands::Return,
                dispatch_metadata: None,
            },
        ];
        IrProgram {
            instructions,
            instruction_order: vec![0, 1],
            dependency_graph: Map::from([(0, Set::new()), (1, Set::from([0]))]),
            resource_table: Map::new(),
            parallelization_groups: vec![],
            schemas: Map::new(),
            input_register: RegisterId(0),
            output_register: RegisterId(1),
            compiler_metadata: Map::new(),
        }
    }

    fn failing_validation_program() -> IrProgram {
        let instructions = vec![IrInstruction {
            index: 0,
            opcode: Opcode::Validate,
            dest: None,
            src: vec![RegisterId(0)],
            operands: Operands::Validate { schema_id: "must_be_string".to_string() },
            dispatch_metadata: None,
        }];
        IrProgram {
            instructions,
            instruction_order: vec![0],
            dependency_graph: Map::from([(0, Set::new())]),
            resource_table: Map::new(),
            parallelization_groups: vec![],
            schemas: Map::from([(
                "must_be_string".to_string(),
                serde_json::json!({"type": "string"}),
            )]),
            input_register: RegisterId(0),
            output_register: RegisterId(0),
            compiler_metadata: Map::new(),
        }
    }

    async fn harness() -> (Orchestrator, CompiledWorkflow, ProjectId, VersionNumber) {
        harness_with(trivial_program(), "trivial").await
    }

    async fn harness_with(
        program: IrProgram,
        name: &str,
    ) -> (Orchestrator, CompiledWorkflow, ProjectId, VersionNumber) {
        let key = signing_key();
        let preloader = Arc::new(eyeflow_preload::Preloader::new(
            key,
            "node-1",
            eyeflow_preload::FetcherTable::new(),
        ));
        let workflow = preloader
            .seal(UserId::new(), name, program, &[])
            .await
            .unwrap();

        let mut vm = Vm::new(
            Arc::new(Vault::degraded()),
            Arc::new(CancellationBus::new()),
            Arc::new(EchoService),
            Arc::new(EchoAction),
        );
        vm.register_transform("identity", Arc::new(|args: &[serde_json::Value]| Ok(args[0].clone())));

        let lifecycle = Arc::new(LifecycleRegistry::new());
        let user = UserId::new();
        let project = lifecycle.create_project(user, "demo");
        let v1 = lifecycle
            .create_version(project.id, user, serde_json::json!({}), false)
            .unwrap();
        lifecycle
            .validate_version(project.id, v1.version, user, vec![], "c", "s", "k", Map::new())
            .unwrap();
        lifecycle.activate_version(project.id, v1.version, user).unwrap();

        let audit = Arc::new(AuditChain::new("node-1", signing_key()));
        let orchestrator = Orchestrator::new(
            Arc::new(vm),
            Arc::clone(&preloader),
            audit,
            Arc::new(CancellationBus::new()),
            lifecycle,
        );
        (orchestrator, workflow, project.id, v1.version)
    }

    #[tokio::test]
    async fn successful_run_produces_output_and_audit_events() {
        let (orchestrator, workflow, project_id, version) = harness().await;
        let record = orchestrator
            .run(project_id, version, &workflow, serde_json::json!(42))
            .await
            .unwrap();
        assert_eq!(record.status, ExecutionStatus::Succeeded);
        assert_eq!(record.output, Some(serde_json::json!(42)));
        assert!(orchestrator.audit.len() >= 2);
    }

    #[tokio::test]
    async fn failed_run_still_appends_the_step_that_rejected_it() {
        let (orchestrator, workflow, project_id, version) =
            harness_with(failing_validation_program(), "rejects-non-strings").await;
        let record = orchestrator
            .run(project_id, version, &workflow, serde_json::json!(42))
            .await
            .unwrap();
        assert_eq!(record.status, ExecutionStatus::Failed);
        assert_eq!(record.steps.len(), 1);
        assert_eq!(record.steps[0].status, StepStatus::Failed);
        assert!(orchestrator
            .audit
            .snapshot()
            .iter()
            .any(|e| e.event_type == AuditEventType::ValidationFail));
    }

    #[tokio::test]
    async fn tampered_workflow_is_rejected_before_execution() {
        let (orchestrator, mut workflow, project_id, version) = harness().await;
        workflow.checksum.push('x');
        let err = orchestrator
            .run(project_id, version, &workflow, serde_json::json!(1))
            .await
            .unwrap_err();
        assert!(matches!(err, EyeflowError::Signature { .. }));
    }

    #[tokio::test]
    async fn memory_state_accumulates_across_runs() {
        let (orchestrator, workflow, project_id, version) = harness().await;
        orchestrator.run(project_id, version, &workflow, serde_json::json!(1)).await.unwrap();
        orchestrator.run(project_id, version, &workflow, serde_json::json!(2)).await.unwrap();
        let state = orchestrator.get_or_create_memory_state(workflow.id);
        assert_eq!(state.lock().unwrap().execution_count, 2);
    }

    #[tokio::test]
    async fn project_statistics_reflect_run_outcome() {
        let (orchestrator, workflow, project_id, version) = harness().await;
        orchestrator.run(project_id, version, &workflow, serde_json::json!(1)).await.unwrap();
        let project = orchestrator.lifecycle.get_project(project_id).unwrap();
        assert_eq!(project.statistics.succeeded_executions, 1);
    }
}
