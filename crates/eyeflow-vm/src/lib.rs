// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
//! The semantic virtual machine that executes a sealed [`CompiledWorkflow`].
//! Grounded on the backplane's stage pipeline
//! (`abp-runtime/src/stages.rs`, `pipeline.rs`): a linear pass that reports a
//! result per step rather than short-circuiting on the first failure unless
//! the instruction itself demands it.
//!
//! The VM owns no transport of its own. Service dispatch, action sandboxing,
//! pure-function evaluation, and predicate evaluation are all injected
//! through traits so this crate stays free of any particular wire format.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use eyeflow_cancel::CancellationBus;
use eyeflow_core::{EyeflowError, ExecutionId};
use eyeflow_ir::{CompiledWorkflow, DispatchMetadata, IrInstruction, Operands, RegisterId, ServiceHandle};
use eyeflow_vault::Vault;
use serde::{Deserialize, Serialize};

/// Default scratch buffer size ("10 MiB scratch buffer").
pub const DEFAULT_SCRATCH_BUFFER_BYTES: usize = 10 * 1024 * 1024;

/// Dispatches a resolved `CALL_SERVICE` instruction to its pre-loaded handle.
#[async_trait]
pub trait ServiceInvoker: Send + Sync {
    /// Invoke `handle` per `metadata`, with `args` as the assembled argument
    /// value and `secrets` holding any vault slots the instruction declared.
    async fn invoke(
        &self,
        handle: &ServiceHandle,
        metadata: &DispatchMetadata,
        args: serde_json::Value,
        secrets: &BTreeMap<String, String>,
    ) -> Result<serde_json::Value, EyeflowError>;
}

/// Invokes a sandboxed `CALL_ACTION` instruction.
#[async_trait]
pub trait ActionInvoker: Send + Sync {
    /// Run `action` with `args`, returning its result.
    async fn invoke(&self, action: &str, args: serde_json::Value) -> Result<serde_json::Value, EyeflowError>;

    /// `Some(window)` if `action` commits a physical-world effect and must
    /// honor a cancellation window before doing so. `None` for
    /// actions with no physical side effect.
    fn physical_window(&self, action: &str) -> Option<Duration> {
        let _ = action;
        None
    }
}

/// A pure function identified by a `TRANSFORM` instruction's `function` name.
pub type TransformFn = Arc<dyn Fn(&[serde_json::Value]) -> Result<serde_json::Value, EyeflowError> + Send + Sync>;

/// A predicate identified by a `POSTCONDITION` instruction's `predicate` name.
pub type PredicateFn = Arc<dyn Fn(&[serde_json::Value]) -> bool + Send + Sync>;

/// Outcome of one instruction's execution, the unit the execution record's
/// step trace is built from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepOutcome {
    /// Instruction index this step corresponds to.
    pub instruction_index: usize,
    /// The opcode that ran.
    pub opcode: eyeflow_ir::Opcode,
    /// Whether the step completed, was skipped by a branch, or failed.
    pub status: StepStatus,
    /// Wall-clock duration of the step.
    pub duration_ms: u64,
    /// Diagnostic on failure.
    pub error: Option<String>,
}

/// Terminal state of one executed (or skipped) step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// The step ran to completion.
    Succeeded,
    /// A `CALL_SERVICE` dispatch failed but its `fallback_register` absorbed it.
    FellBack,
    /// A `BRANCH` instruction skipped this step.
    Skipped,
    /// The step failed and aborted the run.
    Failed,
}

/// Result of a full program execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    /// Value published by the `RETURN` instruction's `outputRegister`, if
    /// execution reached one.
    pub output: Option<serde_json::Value>,
    /// Per-step trace, in execution order.
    pub steps: Vec<StepOutcome>,
}

/// [`Vm::execute`]'s error, carrying the step trace accumulated before
/// `error` aborted the run.
///
/// A failed `VALIDATE`/`POSTCONDITION`/`LOOP` still needs its step appended
/// to the audit chain (spec §4.3, §4.13) even though the run as a whole
/// failed, so this type lets a caller record those steps before surfacing
/// the error.
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct VmExecutionError {
    /// Steps that ran (or were skipped by a branch) before `error` aborted
    /// the execution, in execution order.
    pub steps: Vec<StepOutcome>,
    /// The error that aborted execution.
    #[source]
    pub error: EyeflowError,
}

/// The virtual machine, holding the pluggable pieces instruction dispatch
/// needs but none of the per-execution state (that lives in [`RegisterFile`]
/// and is created fresh by [`Vm::execute`]).
pub struct Vm {
    vault: Arc<Vault>,
    cancellation: Arc<CancellationBus>,
    service_invoker: Arc<dyn ServiceInvoker>,
    action_invoker: Arc<dyn ActionInvoker>,
    transforms: BTreeMap<String, TransformFn>,
    predicates: BTreeMap<String, PredicateFn>,
    scratch_buffer_bytes: usize,
}

impl Vm {
    /// Build a VM from its required collaborators. `scratch_buffer_bytes`
    /// defaults to [`DEFAULT_SCRATCH_BUFFER_BYTES`] via
    /// [`Vm::with_scratch_buffer_bytes`].
    #[must_use]
    pub fn new(
        vault: Arc<Vault>,
        cancellation: Arc<CancellationBus>,
        service_invoker: Arc<dyn ServiceInvoker>,
        action_invoker: Arc<dyn ActionInvoker>,
    ) -> Self {
        Self {
            vault,
            cancellation,
            service_invoker,
            action_invoker,
            transforms: BTreeMap::new(),
            predicates: BTreeMap::new(),
            scratch_buffer_bytes: DEFAULT_SCRATCH_BUFFER_BYTES,
        }
    }

    /// Override the scratch buffer budget.
    #[must_use]
    pub fn with_scratch_buffer_bytes(mut self, bytes: usize) -> Self {
        self.scratch_buffer_bytes = bytes;
        self
    }

    /// Register a named pure function for `TRANSFORM` instructions.
    pub fn register_transform(&mut self, name: impl Into<String>, f: TransformFn) {
        self.transforms.insert(name.into(), f);
    }

    /// Register a named predicate for `POSTCONDITION` instructions.
    pub fn register_predicate(&mut self, name: impl Into<String>, f: PredicateFn) {
        self.predicates.insert(name.into(), f);
    }

    /// Execute `workflow`'s program against `input`, honoring
    /// `instructionOrder`, `parallelizationGroups`, and the cancellation
    /// window for physical actions.
    ///
    /// # Errors
    ///
    /// Returns the first unrecovered instruction error, together with the
    /// step trace accumulated up to that point, so a caller (the execution
    /// orchestrator, C13) can still append the failure-path audit events a
    /// `VALIDATE`/`POSTCONDITION`/`LOOP` step records. Recovered errors (a
    /// `CALL_SERVICE` with a `fallback_register`) do not abort the run.
    pub async fn execute(
        &self,
        workflow: &CompiledWorkflow,
        execution_id: ExecutionId,
        input: serde_json::Value,
    ) -> Result<ExecutionOutcome, VmExecutionError> {
        if !workflow.is_healthy() {
            return Err(VmExecutionError {
                steps: Vec::new(),
                error: EyeflowError::ServiceDispatch {
                    service_id: "<preload>".to_string(),
                    message: "compiled workflow has one or more unhealthy pre-loaded services"
                        .to_string(),
                },
            });
        }

        let program = &workflow.ir;
        let mut registers = RegisterFile::new();
        if let Err(error) = registers.define(program.input_register, input) {
            return Err(VmExecutionError { steps: Vec::new(), error });
        }
        let mut scratch = ScratchBudget::new(self.scratch_buffer_bytes);

        let position: BTreeMap<usize, usize> = program
            .instruction_order
            .iter()
            .enumerate()
            .map(|(pos, &idx)| (idx, pos))
            .collect();
        let group_of: BTreeMap<usize, usize> = program
            .parallelization_groups
            .iter()
            .enumerate()
            .flat_map(|(group_idx, members)| members.iter().map(move |&m| (m, group_idx)))
            .collect();

        let mut steps = Vec::with_capacity(program.instruction_order.len());
        let mut output = None;
        let mut cursor = 0usize;
        let mut visited_groups = std::collections::BTreeSet::new();

        while cursor < program.instruction_order.len() {
            let idx = program.instruction_order[cursor];

            if let Some(&group_idx) = group_of.get(&idx) {
                let members = &program.parallelization_groups[group_idx];
                if members.len() > 1 && visited_groups.insert(group_idx) {
                    match self
                        .run_group(
                            program,
                            members,
                            &mut registers,
                            &mut scratch,
                            execution_id,
                            &workflow.pre_loaded_services,
                        )
                        .await
                    {
                        Ok(outcomes) => {
                            let advanced = outcomes.len();
                            steps.extend(outcomes);
                            cursor += advanced.max(1);
                            continue;
                        }
                        Err((outcomes, error)) => {
                            steps.extend(outcomes);
                            return Err(VmExecutionError { steps, error });
                        }
                    }
                }
                if members.len() > 1 {
                    // Already executed as part of this group's concurrent pass.
                    cursor += 1;
                    continue;
                }
            }

            let instr = &program.instructions[idx];
            match instr.opcode {
                eyeflow_ir::Opcode::Branch => {
                    let Operands::Branch { target_instruction } = &instr.operands else {
                        unreachable!("BRANCH instruction without Branch operands");
                    };
                    let started = Instant::now();
                    let cond = match self.read(&registers, instr.src.first().copied()) {
                        Ok(v) => v,
                        Err(error) => return Err(VmExecutionError { steps, error }),
                    };
                    let truthy = is_truthy(&cond);
                    steps.push(StepOutcome {
                        instruction_index: idx,
                        opcode: instr.opcode,
                        status: StepStatus::Succeeded,
                        duration_ms: elapsed_ms(started),
                        error: None,
                    });
                    if truthy {
                        cursor = match position.get(target_instruction) {
                            Some(&pos) => pos,
                            None => {
                                return Err(VmExecutionError {
                                    steps,
                                    error: EyeflowError::Internal {
                                        message: format!(
                                            "BRANCH at {idx} targets instruction {target_instruction} outside instructionOrder"
                                        ),
                                    },
                                });
                            }
                        };
                    } else {
                        cursor += 1;
                    }
                    continue;
                }
                eyeflow_ir::Opcode::Return => {
                    let started = Instant::now();
                    let value = match self.read(&registers, Some(program.output_register)) {
                        Ok(v) => v,
                        Err(error) => return Err(VmExecutionError { steps, error }),
                    };
                    output = Some(value);
                    steps.push(StepOutcome {
                        instruction_index: idx,
                        opcode: instr.opcode,
                        status: StepStatus::Succeeded,
                        duration_ms: elapsed_ms(started),
                        error: None,
                    });
                    break;
                }
                eyeflow_ir::Opcode::Loop => {
                    let outcome = self
                        .run_loop(
                            program,
                            instr,
                            &mut registers,
                            &mut scratch,
                            execution_id,
                            &workflow.pre_loaded_services,
                        )
                        .await;
                    match outcome {
                        Ok(step) => steps.push(step),
                        Err((step, error)) => {
                            steps.push(step);
                            return Err(VmExecutionError { steps, error });
                        }
                    }
                    cursor += 1;
                    continue;
                }
                _ => {
                    let result = self
                        .run_instruction(
                            instr,
                            &mut registers,
                            &mut scratch,
                            execution_id,
                            &program.resource_table,
                            &program.schemas,
                            &workflow.pre_loaded_services,
                        )
                        .await;
                    match result {
                        Ok(step) => steps.push(step),
                        Err((step, fatal)) => {
                            steps.push(step);
                            if let Some(error) = fatal {
                                return Err(VmExecutionError { steps, error });
                            }
                        }
                    }
                }
            }
            cursor += 1;
        }

        Ok(ExecutionOutcome { output, steps })
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_group(
        &self,
        program: &eyeflow_ir::IrProgram,
        members: &std::collections::BTreeSet<usize>,
        registers: &mut RegisterFile,
        scratch: &mut ScratchBudget,
        execution_id: ExecutionId,
        pre_loaded_services: &eyeflow_ir::PreLoadedServices,
    ) -> Result<Vec<StepOutcome>, (Vec<StepOutcome>, EyeflowError)> {
        // Run concurrently: each member writes a distinct dest register (the
        // group's members are guaranteed non-conflicting by the compiler), so
        // we dispatch them all before folding any writes back in.
        let mut handles = Vec::with_capacity(members.len());
        for &idx in members {
            let instr = program.instructions[idx].clone();
            let snapshot = registers.clone();
            let vault = Arc::clone(&self.vault);
            let cancellation = Arc::clone(&self.cancellation);
            let service_invoker = Arc::clone(&self.service_invoker);
            let action_invoker = Arc::clone(&self.action_invoker);
            let transforms = self.transforms.clone();
            let predicates = self.predicates.clone();
            let scratch_budget = scratch.capacity;
            let resource_table = program.resource_table.clone();
            let schemas = program.schemas.clone();
            let pre_loaded = pre_loaded_services.clone();
            handles.push((idx, tokio::spawn(async move {
                let worker = Vm {
                    vault,
                    cancellation,
                    service_invoker,
                    action_invoker,
                    transforms,
                    predicates,
                    scratch_buffer_bytes: scratch_budget,
                };
                let mut local_registers = snapshot;
                let mut local_scratch = ScratchBudget::new(scratch_budget);
                let result = worker
                    .run_instruction(
                        &instr,
                        &mut local_registers,
                        &mut local_scratch,
                        execution_id,
                        &resource_table,
                        &schemas,
                        &pre_loaded,
                    )
                    .await;
                (local_registers, result)
            })));
        }

        let mut outcomes = Vec::with_capacity(handles.len());
        for (idx, handle) in handles {
            let (local_registers, result) = match handle.await {
                Ok(v) => v,
                Err(e) => {
                    return Err((
                        outcomes,
                        EyeflowError::Internal {
                            message: format!("parallel instruction {idx} panicked: {e}"),
                        },
                    ));
                }
            };
            if let Some(dest) = program.instructions[idx].dest {
                if let Some(v) = local_registers.peek(dest) {
                    if let Err(error) = registers.define(dest, v.clone()) {
                        return Err((outcomes, error));
                    }
                }
            }
            match result {
                Ok(step) => outcomes.push(step),
                Err((step, fatal)) => {
                    outcomes.push(step);
                    if let Some(error) = fatal {
                        return Err((outcomes, error));
                    }
                }
            }
        }
        Ok(outcomes)
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_loop(
        &self,
        program: &eyeflow_ir::IrProgram,
        instr: &IrInstruction,
        registers: &mut RegisterFile,
        scratch: &mut ScratchBudget,
        execution_id: ExecutionId,
        pre_loaded_services: &eyeflow_ir::PreLoadedServices,
    ) -> Result<StepOutcome, (StepOutcome, EyeflowError)> {
        let Operands::Loop {
            max_iterations,
            convergence_register,
            body,
        } = &instr.operands
        else {
            unreachable!("LOOP instruction without Loop operands");
        };
        let started = Instant::now();
        let mut iterations = 0u32;
        let mut converged = false;

        while iterations < *max_iterations {
            for &body_idx in body {
                let body_instr = &program.instructions[body_idx];
                let result = self
                    .run_instruction(
                        body_instr,
                        registers,
                        scratch,
                        execution_id,
                        &program.resource_table,
                        &program.schemas,
                        pre_loaded_services,
                    )
                    .await;
                if let Err((_, Some(err))) = result {
                    let failed = StepOutcome {
                        instruction_index: instr.index,
                        opcode: instr.opcode,
                        status: StepStatus::Failed,
                        duration_ms: elapsed_ms(started),
                        error: Some(err.to_string()),
                    };
                    return Err((failed, err));
                }
            }
            iterations += 1;
            let convergence = registers.peek(*convergence_register).cloned().unwrap_or(serde_json::Value::Null);
            if is_truthy(&convergence) {
                converged = true;
                break;
            }
        }

        let status = if converged {
            StepStatus::Succeeded
        } else {
            StepStatus::Failed
        };
        let step = StepOutcome {
            instruction_index: instr.index,
            opcode: instr.opcode,
            status,
            duration_ms: elapsed_ms(started),
            error: if converged {
                None
            } else {
                Some(format!("loop exceeded max_iterations ({max_iterations}) without converging"))
            },
        };
        if converged {
            Ok(step)
        } else {
            Err((step.clone(), EyeflowError::Internal {
                message: step.error.clone().unwrap_or_default(),
            }))
        }
    }

    /// Execute one non-control-flow instruction. Returns `Err((step, Some(err)))`
    /// for an error that should abort the run, `Err((step, None))` for one
    /// that was absorbed by a fallback.
    #[allow(clippy::too_many_arguments)]
    async fn run_instruction(
        &self,
        instr: &IrInstruction,
        registers: &mut RegisterFile,
        scratch: &mut ScratchBudget,
        execution_id: ExecutionId,
        resource_table: &BTreeMap<String, serde_json::Value>,
        schemas: &BTreeMap<String, serde_json::Value>,
        pre_loaded_services: &eyeflow_ir::PreLoadedServices,
    ) -> Result<StepOutcome, (StepOutcome, Option<EyeflowError>)> {
        let started = Instant::now();
        let outcome = self
            .dispatch(
                instr,
                registers,
                scratch,
                execution_id,
                resource_table,
                schemas,
                pre_loaded_services,
            )
            .await;

        match outcome {
            Ok(()) => Ok(StepOutcome {
                instruction_index: instr.index,
                opcode: instr.opcode,
                status: StepStatus::Succeeded,
                duration_ms: elapsed_ms(started),
                error: None,
            }),
            Err(err) => {
                if let Operands::CallService {
                    fallback_register: Some(fallback),
                    ..
                } = &instr.operands
                {
                    tracing::warn!(index = instr.index, %err, "call_service failed, applying fallback");
                    let _ = registers.define(*fallback, serde_json::Value::Null);
                    return Err((
                        StepOutcome {
                            instruction_index: instr.index,
                            opcode: instr.opcode,
                            status: StepStatus::FellBack,
                            duration_ms: elapsed_ms(started),
                            error: Some(err.to_string()),
                        },
                        None,
                    ));
                }
                Err((
                    StepOutcome {
                        instruction_index: instr.index,
                        opcode: instr.opcode,
                        status: StepStatus::Failed,
                        duration_ms: elapsed_ms(started),
                        error: Some(err.to_string()),
                    },
                    Some(err),
                ))
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn dispatch(
        &self,
        instr: &IrInstruction,
        registers: &mut RegisterFile,
        scratch: &mut ScratchBudget,
        execution_id: ExecutionId,
        resource_table: &BTreeMap<String, serde_json::Value>,
        schemas: &BTreeMap<String, serde_json::Value>,
        pre_loaded_services: &eyeflow_ir::PreLoadedServices,
    ) -> Result<(), EyeflowError> {
        match &instr.operands {
            Operands::LoadResource { resource_key } => {
                let value = resource_table.get(resource_key).cloned().ok_or_else(|| {
                    EyeflowError::Internal {
                        message: format!("no resource table entry for key '{resource_key}'"),
                    }
                })?;
                if let Some(dest) = instr.dest {
                    registers.define(dest, value)?;
                }
                Ok(())
            }
            Operands::Validate { schema_id } => {
                let schema = schemas.get(schema_id).ok_or_else(|| EyeflowError::Internal {
                    message: format!("no schema registered under id '{schema_id}'"),
                })?;
                let instance = self.read(registers, instr.src.first().copied())?;
                let validator = jsonschema::validator_for(schema).map_err(|e| EyeflowError::Internal {
                    message: format!("schema '{schema_id}' failed to compile: {e}"),
                })?;
                if let Err(e) = validator.validate(&instance) {
                    return Err(EyeflowError::Validation {
                        message: format!("schema '{schema_id}' rejected input: {e}"),
                    });
                }
                Ok(())
            }
            Operands::CallService {
                service,
                vault_slots,
                timeout_ms,
                ..
            } => {
                let metadata = instr.dispatch_metadata.as_ref().ok_or_else(|| {
                    EyeflowError::Resolution {
                        message: format!(
                            "instruction {} calls {} with no resolved dispatch metadata",
                            instr.index, service
                        ),
                    }
                })?;
                let handle = pre_loaded_services.get(service).ok_or_else(|| {
                    EyeflowError::ServiceDispatch {
                        service_id: service.service_id.clone(),
                        message: "no pre-loaded handle for resolved service".to_string(),
                    }
                })?;
                let secrets = self.vault.resolve_slots(vault_slots).await?;
                let args = self.args_value(registers, &instr.src)?;
                scratch.reserve(approx_size(&args))?;
                let timeout = timeout_ms.map_or(Duration::from_secs(30), Duration::from_millis);
                let call = self.service_invoker.invoke(handle, metadata, args, &secrets);
                let result = tokio::time::timeout(timeout, call).await.map_err(|_| {
                    EyeflowError::ServiceDispatch {
                        service_id: service.service_id.clone(),
                        message: format!("timed out after {}ms", timeout.as_millis()),
                    }
                })??;
                if let Some(dest) = instr.dest {
                    registers.define(dest, result)?;
                }
                self.vault.clear_cache();
                Ok(())
            }
            Operands::CallAction { action } => {
                if let Some(window) = self.action_invoker.physical_window(action) {
                    let cancelled = self
                        .cancellation
                        .wait_for_cancellation(execution_id, action, action, window)
                        .await;
                    if cancelled {
                        return Err(EyeflowError::Cancelled {
                            reason: format!("action '{action}' cancelled during commit window"),
                        });
                    }
                }
                let args = self.args_value(registers, &instr.src)?;
                let result = self.action_invoker.invoke(action, args).await?;
                if let Some(dest) = instr.dest {
                    registers.define(dest, result)?;
                }
                Ok(())
            }
            Operands::Transform { function } => {
                let f = self.transforms.get(function).ok_or_else(|| EyeflowError::Internal {
                    message: format!("no transform registered for '{function}'"),
                })?;
                let args = self.values(registers, &instr.src)?;
                let result = f(&args)?;
                if let Some(dest) = instr.dest {
                    registers.define(dest, result)?;
                }
                Ok(())
            }
            Operands::Postcondition { predicate } => {
                let f = self.predicates.get(predicate).ok_or_else(|| EyeflowError::Internal {
                    message: format!("no predicate registered for '{predicate}'"),
                })?;
                let args = self.values(registers, &instr.src)?;
                let held = f(&args);
                if !held {
                    return Err(EyeflowError::Validation {
                        message: format!("postcondition '{predicate}' failed at instruction {}", instr.index),
                    });
                }
                Ok(())
            }
            Operands::Trigger { .. } => Ok(()),
            Operands::Branch { .. } | Operands::Return | Operands::Loop { .. } => {
                unreachable!("control-flow opcodes handled by execute()'s main loop")
            }
        }
    }

    fn read(&self, registers: &RegisterFile, reg: Option<RegisterId>) -> Result<serde_json::Value, EyeflowError> {
        let reg = reg.ok_or_else(|| EyeflowError::Internal {
            message: "instruction expected a source register but had none".to_string(),
        })?;
        registers.peek(reg).cloned().ok_or_else(|| EyeflowError::Internal {
            message: format!("register {reg} read before it was ever written"),
        })
    }

    fn values(&self, registers: &RegisterFile, regs: &[RegisterId]) -> Result<Vec<serde_json::Value>, EyeflowError> {
        regs.iter().map(|&r| self.read(registers, Some(r))).collect()
    }

    fn args_value(&self, registers: &RegisterFile, regs: &[RegisterId]) -> Result<serde_json::Value, EyeflowError> {
        Ok(serde_json::Value::Array(self.values(registers, regs)?))
    }
}

fn is_truthy(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Bool(b) => *b,
        serde_json::Value::Null => false,
        serde_json::Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        serde_json::Value::String(s) => !s.is_empty(),
        serde_json::Value::Array(a) => !a.is_empty(),
        serde_json::Value::Object(o) => !o.is_empty(),
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

fn approx_size(value: &serde_json::Value) -> usize {
    serde_json::to_vec(value).map(|v| v.len()).unwrap_or(0)
}

/// The VM's 256-register file. Each register is write-once per
/// execution: [`RegisterFile::define`] rejects a second write to the same
/// slot, matching the "register writes are single-assignment" invariant.
#[derive(Clone)]
struct RegisterFile {
    values: Vec<Option<serde_json::Value>>,
}

impl RegisterFile {
    fn new() -> Self {
        Self {
            values: vec![None; eyeflow_ir::MAX_REGISTERS],
        }
    }

    fn define(&mut self, reg: RegisterId, value: serde_json::Value) -> Result<(), EyeflowError> {
        let slot = &mut self.values[reg.0 as usize];
        if slot.is_some() {
            return Err(EyeflowError::Internal {
                message: format!("register {reg} written more than once in a single execution"),
            });
        }
        *slot = Some(value);
        Ok(())
    }

    fn peek(&self, reg: RegisterId) -> Option<&serde_json::Value> {
        self.values[reg.0 as usize].as_ref()
    }
}

/// Tracks the 10 MiB scratch buffer budget. Not a real memory
/// arena — a size accountant that rejects instructions whose intermediate
/// values would blow the configured ceiling.
struct ScratchBudget {
    capacity: usize,
    used: usize,
}

impl ScratchBudget {
    fn new(capacity: usize) -> Self {
        Self { capacity, used: 0 }
    }

    fn reserve(&mut self, bytes: usize) -> Result<(), EyeflowError> {
        if self.used.saturating_add(bytes) > self.capacity {
            return Err(EyeflowError::Internal {
                message: format!(
                    "scratch buffer exhausted: requested {bytes} bytes, {} available",
                    self.capacity.saturating_sub(self.used)
                ),
            });
        }
        self.used += bytes;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eyeflow_core::{ServiceFormat, ServiceRef, UserId, VaultSlot, WorkflowId};
    use eyeflow_ir::{IrProgram, Opcode, PreLoadedServices};
    use std::collections::{BTreeMap as Map, BTreeSet};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct EchoInvoker {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ServiceInvoker for EchoInvoker {
        async fn invoke(
            &self,
            _handle: &ServiceHandle,
            _metadata: &DispatchMetadata,
            args: serde_json::Value,
            _secrets: &BTreeMap<String, String>,
        ) -> Result<serde_json::Value, EyeflowError> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            Ok(args)
        }
    }

    struct RecordingActionInvoker {
        physical: Option<String>,
        invoked: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ActionInvoker for RecordingActionInvoker {
        async fn invoke(&self, action: &str, args: serde_json::Value) -> Result<serde_json::Value, EyeflowError> {
            self.invoked.lock().unwrap().push(action.to_string());
            Ok(args)
        }

        fn physical_window(&self, action: &str) -> Option<Duration> {
            if self.physical.as_deref() == Some(action) {
                Some(Duration::from_millis(20))
            } else {
                None
            }
        }
    }

    fn workflow_with(program: IrProgram) -> CompiledWorkflow {
        workflow_with_services(program, PreLoadedServices::new())
    }

    fn workflow_with_services(program: IrProgram, pre_loaded_services: PreLoadedServices) -> CompiledWorkflow {
        CompiledWorkflow {
            id: WorkflowId::new(),
            user_id: UserId::new(),
            workflow_name: "test".to_string(),
            ir: program,
            pre_loaded_services,
            checksum: "deadbeef".to_string(),
            signature: "sig".to_string(),
            signature_key_id: "key".to_string(),
        }
    }

    fn vm(action_invoker: Arc<dyn ActionInvoker>) -> Vm {
        Vm::new(
            Arc::new(Vault::degraded()),
            Arc::new(CancellationBus::degraded()),
            Arc::new(EchoInvoker { calls: AtomicUsize::new(0) }),
            action_invoker,
        )
    }

    fn passthrough_action_invoker() -> Arc<RecordingActionInvoker> {
        Arc::new(RecordingActionInvoker { physical: None, invoked: Mutex::new(Vec::new()) })
    }

    #[tokio::test]
    async fn transform_then_return_publishes_output() {
        let instructions = vec![
            IrInstruction {
                index: 0,
                opcode: Opcode::Transform,
                dest: Some(RegisterId(1)),
                src: vec![RegisterId(0)],
                operands: Operands::Transform { function: "double".to_string() },
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
        let program = IrProgram {
            instructions,
            instruction_order: vec![0, 1],
            dependency_graph: Map::from([(0, BTreeSet::new()), (1, BTreeSet::from([0]))]),
            resource_table: Map::new(),
            parallelization_groups: vec![],
            schemas: Map::new(),
            input_register: RegisterId(0),
            output_register: RegisterId(1),
            compiler_metadata: Map::new(),
        };
        let workflow = workflow_with(program);

        let mut vm = vm(passthrough_action_invoker());
        vm.register_transform(
            "double",
            Arc::new(|args: &[serde_json::Value]| {
                let n = args[0].as_f64().unwrap_or(0.0);
                Ok(serde_json::json!(n * 2.0))
            }),
        );

        let outcome = vm
            .execute(&workflow, ExecutionId::new(), serde_json::json!(21))
            .await
            .unwrap();
        assert_eq!(outcome.output, Some(serde_json::json!(42.0)));
        assert_eq!(outcome.steps.len(), 2);
        assert!(outcome.steps.iter().all(|s| s.status == StepStatus::Succeeded));
    }

    #[tokio::test]
    async fn branch_skips_to_target_when_condition_falsy() {
        let instructions = vec![
            IrInstruction {
                index: 0,
                opcode: Opcode::Branch,
                dest: None,
                src: vec![RegisterId(0)],
                operands: Operands::Branch { target_instruction: 2 },
                dispatch_metadata: None,
            },
            IrInstruction {
                index: 1,
                opcode: Opcode::Transform,
                dest: Some(RegisterId(1)),
                src: vec![RegisterId(0)],
                operands: Operands::Transform { function: "identity".to_string() },
                dispatch_metadata: None,
            },
            IrInstruction {
                index: 2,
                opcode: Opcode::Return,
                dest: None,
                src: vec![RegisterId(0)],
                operands: Operands::Return,
                dispatch_metadata: None,
            },
        ];
        let program = IrProgram {
            instructions,
            instruction_order: vec![0, 1, 2],
            dependency_graph: Map::from([
                (0, BTreeSet::new()),
                (1, BTreeSet::from([0])),
                (2, BTreeSet::from([0])),
            ]),
            resource_table: Map::new(),
            parallelization_groups: vec![],
            schemas: Map::new(),
            input_register: RegisterId(0),
            output_register: RegisterId(0),
            compiler_metadata: Map::new(),
        };
        let workflow = workflow_with(program);
        let mut vm = vm(passthrough_action_invoker());
        vm.register_transform("identity", Arc::new(|args: &[serde_json::Value]| Ok(args[0].clone())));

        let outcome = vm
            .execute(&workflow, ExecutionId::new(), serde_json::json!(false))
            .await
            .unwrap();
        assert_eq!(outcome.output, Some(serde_json::json!(false)));
        // instruction 1 never ran: only BRANCH and RETURN appear.
        assert_eq!(outcome.steps.len(), 2);
    }

    #[tokio::test]
    async fn call_service_failure_without_fallback_aborts() {
        struct FailingInvoker;
        #[async_trait]
        impl ServiceInvoker for FailingInvoker {
            async fn invoke(
                &self,
                _handle: &ServiceHandle,
                _metadata: &DispatchMetadata,
                _args: serde_json::Value,
                _secrets: &BTreeMap<String, String>,
            ) -> Result<serde_json::Value, EyeflowError> {
                Err(EyeflowError::ServiceDispatch {
                    service_id: "svc".to_string(),
                    message: "boom".to_string(),
                })
            }
        }

        let instructions = vec![IrInstruction {
            index: 0,
            opcode: Opcode::CallService,
            dest: Some(RegisterId(1)),
            src: vec![RegisterId(0)],
            operands: Operands::CallService {
                service: ServiceRef::new("svc", "1.0.0"),
                vault_slots: vec![],
                timeout_ms: None,
                fallback_register: None,
            },
            dispatch_metadata: Some(DispatchMetadata {
                format: ServiceFormat::Native,
                method_name: "run".to_string(),
                transport_endpoint: None,
                container_env: Map::new(),
            }),
        }];
        let program = IrProgram {
            instructions,
            instruction_order: vec![0],
            dependency_graph: Map::from([(0, BTreeSet::new())]),
            resource_table: Map::new(),
            parallelization_groups: vec![],
            schemas: Map::new(),
            input_register: RegisterId(0),
            output_register: RegisterId(1),
            compiler_metadata: Map::new(),
        };
        let mut services = PreLoadedServices::new();
        services.insert(
            ServiceRef::new("svc", "1.0.0"),
            ServiceHandle::Native { handle_id: "h1".to_string(), valid: true },
        );
        let workflow = workflow_with_services(program, services);
        let vm = Vm::new(
            Arc::new(Vault::degraded()),
            Arc::new(CancellationBus::degraded()),
            Arc::new(FailingInvoker),
            passthrough_action_invoker(),
        );

        let err = vm
            .execute(&workflow, ExecutionId::new(), serde_json::json!(null))
            .await
            .unwrap_err();
        assert!(matches!(err.error, EyeflowError::ServiceDispatch { .. }));
    }

    #[tokio::test]
    async fn call_service_failure_with_fallback_continues() {
        struct FailingInvoker;
        #[async_trait]
        impl ServiceInvoker for FailingInvoker {
            async fn invoke(
                &self,
                _handle: &ServiceHandle,
                _metadata: &DispatchMetadata,
                _args: serde_json::Value,
                _secrets: &BTreeMap<String, String>,
            ) -> Result<serde_json::Value, EyeflowError> {
                Err(EyeflowError::ServiceDispatch {
                    service_id: "svc".to_string(),
                    message: "boom".to_string(),
                })
            }
        }

        let instructions = vec![
            IrInstruction {
                index: 0,
                opcode: Opcode::CallService,
                dest: Some(RegisterId(1)),
                src: vec![RegisterId(0)],
                operands: Operands::CallService {
                    service: ServiceRef::new("svc", "1.0.0"),
                    vault_slots: vec![],
                    timeout_ms: None,
                    fallback_register: Some(RegisterId(2)),
                },
                dispatch_metadata: Some(DispatchMetadata {
                    format: ServiceFormat::Native,
                    method_name: "run".to_string(),
                    transport_endpoint: None,
                    container_env: Map::new(),
                }),
            },
            IrInstruction {
                index: 1,
                opcode: Opcode::Return,
                dest: None,
                src: vec![RegisterId(2)],
                operands: Operands::Return,
                dispatch_metadata: None,
            },
        ];
        let program = IrProgram {
            instructions,
            instruction_order: vec![0, 1],
            dependency_graph: Map::from([(0, BTreeSet::new()), (1, BTreeSet::from([0]))]),
            resource_table: Map::new(),
            parallelization_groups: vec![],
            schemas: Map::new(),
            input_register: RegisterId(0),
            output_register: RegisterId(2),
            compiler_metadata: Map::new(),
        };
        let mut services = PreLoadedServices::new();
        services.insert(
            ServiceRef::new("svc", "1.0.0"),
            ServiceHandle::Native { handle_id: "h1".to_string(), valid: true },
        );
        let workflow = workflow_with_services(program, services);
        let vm = Vm::new(
            Arc::new(Vault::degraded()),
            Arc::new(CancellationBus::degraded()),
            Arc::new(FailingInvoker),
            passthrough_action_invoker(),
        );

        let outcome = vm
            .execute(&workflow, ExecutionId::new(), serde_json::json!(null))
            .await
            .unwrap();
        assert_eq!(outcome.output, Some(serde_json::Value::Null));
        assert_eq!(outcome.steps[0].status, StepStatus::FellBack);
    }

    #[tokio::test]
    async fn call_service_dispatches_the_resolved_pre_loaded_handle() {
        struct RecordingInvoker {
            seen: Mutex<Vec<ServiceFormat>>,
        }

        #[async_trait]
        impl ServiceInvoker for RecordingInvoker {
            async fn invoke(
                &self,
                handle: &ServiceHandle,
                _metadata: &DispatchMetadata,
                args: serde_json::Value,
                _secrets: &BTreeMap<String, String>,
            ) -> Result<serde_json::Value, EyeflowError> {
                self.seen.lock().unwrap().push(handle.format());
                Ok(args)
            }
        }

        let instructions = vec![
            IrInstruction {
                index: 0,
                opcode: Opcode::CallService,
                dest: Some(RegisterId(1)),
                src: vec![RegisterId(0)],
                operands: Operands::CallService {
                    service: ServiceRef::new("sentiment-analyzer", "2.1.0"),
                    vault_slots: vec![],
                    timeout_ms: None,
                    fallback_register: None,
                },
                dispatch_metadata: Some(DispatchMetadata {
                    format: ServiceFormat::Wasm,
                    method_name: "analyze".to_string(),
                    transport_endpoint: None,
                    container_env: Map::new(),
                }),
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
        let program = IrProgram {
            instructions,
            instruction_order: vec![0, 1],
            dependency_graph: Map::from([(0, BTreeSet::new()), (1, BTreeSet::from([0]))]),
            resource_table: Map::new(),
            parallelization_groups: vec![],
            schemas: Map::new(),
            input_register: RegisterId(0),
            output_register: RegisterId(1),
            compiler_metadata: Map::new(),
        };
        let mut services = PreLoadedServices::new();
        services.insert(
            ServiceRef::new("sentiment-analyzer", "2.1.0"),
            ServiceHandle::Wasm { module_bytes: 4096, valid: true },
        );
        let workflow = workflow_with_services(program, services);
        let invoker = Arc::new(RecordingInvoker { seen: Mutex::new(Vec::new()) });
        let vm = Vm::new(
            Arc::new(Vault::degraded()),
            Arc::new(CancellationBus::degraded()),
            invoker.clone(),
            passthrough_action_invoker(),
        );

        let outcome = vm
            .execute(&workflow, ExecutionId::new(), serde_json::json!("I love this product!"))
            .await
            .unwrap();
        assert_eq!(outcome.output, Some(serde_json::json!("I love this product!")));
        assert_eq!(invoker.seen.lock().unwrap().as_slice(), [ServiceFormat::Wasm]);
    }

    #[tokio::test]
    async fn call_service_without_pre_loaded_handle_fails_dispatch() {
        let instructions = vec![IrInstruction {
            index: 0,
            opcode: Opcode::CallService,
            dest: Some(RegisterId(1)),
            src: vec![RegisterId(0)],
            operands: Operands::CallService {
                service: ServiceRef::new("svc", "1.0.0"),
                vault_slots: vec![],
                timeout_ms: None,
                fallback_register: None,
            },
            dispatch_metadata: Some(DispatchMetadata {
                format: ServiceFormat::Native,
                method_name: "run".to_string(),
                transport_endpoint: None,
                container_env: Map::new(),
            }),
        }];
        let program = IrProgram {
            instructions,
            instruction_order: vec![0],
            dependency_graph: Map::from([(0, BTreeSet::new())]),
            resource_table: Map::new(),
            parallelization_groups: vec![],
            schemas: Map::new(),
            input_register: RegisterId(0),
            output_register: RegisterId(1),
            compiler_metadata: Map::new(),
        };
        // no handle pre-loaded for "svc" this time.
        let workflow = workflow_with(program);
        let err = vm(passthrough_action_invoker())
            .execute(&workflow, ExecutionId::new(), serde_json::json!(null))
            .await
            .unwrap_err();
        assert!(matches!(err.error, EyeflowError::ServiceDispatch { .. }));
    }

    #[tokio::test]
    async fn physical_action_honors_cancellation_window() {
        let instructions = vec![IrInstruction {
            index: 0,
            opcode: Opcode::CallAction,
            dest: Some(RegisterId(1)),
            src: vec![RegisterId(0)],
            operands: Operands::CallAction { action: "ship_package".to_string() },
            dispatch_metadata: None,
        }];
        let program = IrProgram {
            instructions,
            instruction_order: vec![0],
            dependency_graph: Map::from([(0, BTreeSet::new())]),
            resource_table: Map::new(),
            parallelization_groups: vec![],
            schemas: Map::new(),
            input_register: RegisterId(0),
            output_register: RegisterId(1),
            compiler_metadata: Map::new(),
        };
        let workflow = workflow_with(program);
        let action_invoker = Arc::new(RecordingActionInvoker {
            physical: Some("ship_package".to_string()),
            invoked: Mutex::new(Vec::new()),
        });
        let vm = vm(action_invoker.clone());

        let outcome = vm
            .execute(&workflow, ExecutionId::new(), serde_json::json!(null))
            .await
            .unwrap();
        assert_eq!(outcome.output, None);
        assert_eq!(action_invoker.invoked.lock().unwrap().as_slice(), ["ship_package"]);
    }

    #[tokio::test]
    async fn postcondition_failure_aborts_with_validation_error() {
        let instructions = vec![IrInstruction {
            index: 0,
            opcode: Opcode::Postcondition,
            dest: None,
            src: vec![RegisterId(0)],
            operands: Operands::Postcondition { predicate: "always_false".to_string() },
            dispatch_metadata: None,
        }];
        let program = IrProgram {
            instructions,
            instruction_order: vec![0],
            dependency_graph: Map::from([(0, BTreeSet::new())]),
            resource_table: Map::new(),
            parallelization_groups: vec![],
            schemas: Map::new(),
            input_register: RegisterId(0),
            output_register: RegisterId(0),
            compiler_metadata: Map::new(),
        };
        let workflow = workflow_with(program);
        let mut vm = vm(passthrough_action_invoker());
        vm.register_predicate("always_false", Arc::new(|_: &[serde_json::Value]| false));

        let err = vm
            .execute(&workflow, ExecutionId::new(), serde_json::json!(null))
            .await
            .unwrap_err();
        assert!(matches!(err.error, EyeflowError::Validation { .. }));
        assert_eq!(err.steps.len(), 1);
        assert_eq!(err.steps[0].status, StepStatus::Failed);
    }

    #[tokio::test]
    async fn loop_runs_until_convergence_register_is_truthy() {
        let body = vec![IrInstruction {
            index: 1,
            opcode: Opcode::Transform,
            dest: None,
            src: vec![RegisterId(0)],
            operands: Operands::Transform { function: "noop".to_string() },
            dispatch_metadata: None,
        }];
        let mut instructions = vec![IrInstruction {
            index: 0,
            opcode: Opcode::Loop,
            dest: None,
            src: vec![],
            operands: Operands::Loop {
                max_iterations: 5,
                convergence_register: RegisterId(0),
                body: vec![1],
            },
            dispatch_metadata: None,
        }];
        instructions.extend(body);
        instructions.push(IrInstruction {
            index: 2,
            opcode: Opcode::Return,
            dest: None,
            src: vec![RegisterId(0)],
            operands: Operands::Return,
            dispatch_metadata: None,
        });
        let program = IrProgram {
            instructions,
            instruction_order: vec![0, 2],
            dependency_graph: Map::from([(0, BTreeSet::new()), (2, BTreeSet::from([0]))]),
            resource_table: Map::new(),
            parallelization_groups: vec![],
            schemas: Map::new(),
            input_register: RegisterId(0),
            output_register: RegisterId(0),
            compiler_metadata: Map::new(),
        };
        let workflow = workflow_with(program);
        let mut vm = vm(passthrough_action_invoker());
        vm.register_transform("noop", Arc::new(|args: &[serde_json::Value]| Ok(args[0].clone())));

        // The convergence register is the input register itself, already
        // truthy, so the loop converges after exactly one pass.
        let outcome = vm
            .execute(&workflow, ExecutionId::new(), serde_json::json!(true))
            .await
            .unwrap();
        assert_eq!(outcome.output, Some(serde_json::json!(true)));
    }
}
