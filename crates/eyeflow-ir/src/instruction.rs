// SPDX-License-Identifier: MIT OR Apache-2.0
//! Opcodes, registers, and per-instruction dispatch metadata.

use eyeflow_core::{ServiceFormat, ServiceRef, VaultSlot};
use serde::{Deserialize, Serialize};

/// A VM register slot, `0..=255`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RegisterId(pub u8);

impl std::fmt::Display for RegisterId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// The ten opcodes this instruction set carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Opcode {
    /// Read a resource table entry into `dest`.
    LoadResource,
    /// Apply a named schema to `src[0]`.
    Validate,
    /// Dispatch to a pre-loaded service handle.
    CallService,
    /// Invoke a sandboxed action.
    CallAction,
    /// Apply a pure function identified by operands.
    Transform,
    /// Conditional jump.
    Branch,
    /// Terminate, publishing `outputRegister`.
    Return,
    /// Marker only — interpreted by the trigger activation pipeline.
    Trigger,
    /// Iterate a loop body.
    Loop,
    /// Evaluate a predicate and route to pass/fail audit events.
    Postcondition,
}

/// Opcode-specific operand payload. Kept as a typed enum (not a bare
/// `serde_json::Value`) so the VM can match exhaustively without re-parsing
/// untyped JSON at dispatch time — the one place this workspace diverges
/// from a dynamic-dispatch-by-opcode source pattern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operands {
    /// `LOAD_RESOURCE`: key into the program's resource table.
    LoadResource {
        /// Resource table key.
        resource_key: String,
    },
    /// `VALIDATE`: schema id to apply.
    Validate {
        /// Key into `IrProgram::schemas`.
        schema_id: String,
    },
    /// `CALL_SERVICE`: the service to invoke, plus any vault slots its
    /// arguments require.
    CallService {
        /// `(serviceId, version)` pair, resolved by C1 before dispatch.
        service: ServiceRef,
        /// Secret slots this call's arguments depend on.
        #[serde(default)]
        vault_slots: Vec<VaultSlot>,
        /// Per-instruction override of the service's default timeout.
        #[serde(default)]
        timeout_ms: Option<u64>,
        /// Fallback behavior if dispatch fails: register to populate
        /// instead of aborting the execution.
        #[serde(default)]
        fallback_register: Option<RegisterId>,
    },
    /// `CALL_ACTION`: sandboxed action identifier.
    CallAction {
        /// Action name.
        action: String,
    },
    /// `TRANSFORM`: pure function identifier.
    Transform {
        /// Function name understood by the VM's transform table.
        function: String,
    },
    /// `BRANCH`: jump target when `src[0]` is truthy.
    Branch {
        /// Instruction index to jump to.
        target_instruction: usize,
    },
    /// `RETURN`: no operands beyond the program's `outputRegister`.
    Return,
    /// `TRIGGER`: marker, carries the activation id it corresponds to.
    Trigger {
        /// Activation identifier from the trigger bus (C8).
        activation_id: String,
    },
    /// `LOOP`: bounds and convergence check.
    Loop {
        /// Upper bound on iterations.
        max_iterations: u32,
        /// Register that, when truthy, ends the loop early.
        convergence_register: RegisterId,
        /// Instruction indices making up the loop body, in order.
        body: Vec<usize>,
    },
    /// `POSTCONDITION`: predicate function identifier.
    Postcondition {
        /// Function name understood by the VM's predicate table.
        predicate: String,
    },
}

/// Dispatch metadata attached to a `CALL_SERVICE` instruction once C1 has
/// resolved its manifest entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchMetadata {
    /// Delivery format of the resolved service.
    pub format: ServiceFormat,
    /// Method/function name to invoke on the handle.
    pub method_name: String,
    /// Transport endpoint (MCP channel id, HTTP URL, etc.), if applicable.
    pub transport_endpoint: Option<String>,
    /// Environment variables to pass a container invocation, if applicable.
    pub container_env: std::collections::BTreeMap<String, String>,
}

/// One instruction in a compiled workflow program.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IrInstruction {
    /// Monotone position in program order.
    pub index: usize,
    /// What this instruction does.
    pub opcode: Opcode,
    /// Register written by this instruction, if any.
    pub dest: Option<RegisterId>,
    /// Registers read by this instruction, in argument order.
    pub src: Vec<RegisterId>,
    /// Opcode-specific payload.
    pub operands: Operands,
    /// Populated by C1 for `CALL_SERVICE` instructions; `None` otherwise or
    /// before resolution.
    #[serde(default)]
    pub dispatch_metadata: Option<DispatchMetadata>,
}

impl IrInstruction {
    /// `true` if this instruction is a `CALL_SERVICE` referencing `service`.
    #[must_use]
    pub fn calls_service(&self) -> Option<&ServiceRef> {
        match &self.operands {
            Operands::CallService { service, .. } => Some(service),
            _ => None,
        }
    }
}
