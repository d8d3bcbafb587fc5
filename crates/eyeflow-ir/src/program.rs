// SPDX-License-Identifier: MIT OR Apache-2.0
//! `IrProgram`: ordered instructions, dependency graph, and the invariants
//! an IR program must satisfy.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::instruction::{IrInstruction, Operands, RegisterId};

/// Errors produced while validating an [`IrProgram`]'s invariants.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProgramError {
    /// The dependency graph contains a cycle.
    #[error("dependency graph is not a DAG: cycle involves instruction {index}")]
    Cycle {
        /// An instruction index participating in the cycle.
        index: usize,
    },
    /// A `src` register is read before any instruction defines it.
    #[error("instruction {index} reads register {register} before it is ever written")]
    UndefinedRegister {
        /// Reading instruction's index.
        index: usize,
        /// The register in question.
        register: RegisterId,
    },
    /// A `CALL_SERVICE` instruction has no resolved dispatch metadata.
    #[error("instruction {index} calls service {service_id}@{version} with no resolved dispatch metadata")]
    UnresolvedService {
        /// Instruction index.
        index: usize,
        /// Service id.
        service_id: String,
        /// Service version.
        version: String,
    },
    /// `instructionOrder` does not contain every instruction exactly once.
    #[error("instruction order is malformed: {message}")]
    MalformedOrder {
        /// Human-readable diagnostic.
        message: String,
    },
}

/// Ordered sequence of instructions plus the bookkeeping that makes the
/// program deterministic and schedulable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IrProgram {
    /// Instructions indexed by their `index` field (dense, `0..len`).
    pub instructions: Vec<IrInstruction>,
    /// Topological order respecting `dependency_graph`.
    pub instruction_order: Vec<usize>,
    /// Instruction index -> set of predecessor instruction indices.
    pub dependency_graph: BTreeMap<usize, BTreeSet<usize>>,
    /// Pre-allocated resource handles keyed by `LOAD_RESOURCE`'s
    /// `resource_key` operand.
    pub resource_table: BTreeMap<String, serde_json::Value>,
    /// Sets of mutually independent instruction indices eligible for
    /// concurrent execution.
    pub parallelization_groups: Vec<BTreeSet<usize>>,
    /// JSON Schema documents keyed by the id `VALIDATE` instructions refer
    /// to.
    pub schemas: BTreeMap<String, serde_json::Value>,
    /// Register the caller populates before execution begins.
    pub input_register: RegisterId,
    /// Register `RETURN` publishes as the program's result.
    pub output_register: RegisterId,
    /// Opaque compiler provenance (rule id, compiler version, timestamps).
    #[serde(default)]
    pub compiler_metadata: BTreeMap<String, String>,
}

impl IrProgram {
    /// Validate this program's invariants:
    ///
    /// 1. the dependency graph is a DAG;
    /// 2. every `src` register is defined by an earlier-ordered instruction;
    /// 3. every `CALL_SERVICE` instruction has resolved dispatch metadata.
    ///
    /// (The fourth invariant — "every vault slot has a path" — is enforced
    /// at the type level: [`eyeflow_core::VaultSlot`] has no optional path.)
    ///
    /// # Errors
    ///
    /// Returns the first [`ProgramError`] found, in the order listed above.
    pub fn validate(&self) -> Result<(), ProgramError> {
        self.validate_order()?;
        self.validate_acyclic()?;
        self.validate_register_definitions()?;
        self.validate_services_resolved()?;
        Ok(())
    }

    fn validate_order(&self) -> Result<(), ProgramError> {
        if self.instruction_order.len() != self.instructions.len() {
            return Err(ProgramError::MalformedOrder {
                message: format!(
                    "instructionOrder has {} entries but there are {} instructions",
                    self.instruction_order.len(),
                    self.instructions.len()
                ),
            });
        }
        let mut seen = BTreeSet::new();
        for &idx in &self.instruction_order {
            if idx >= self.instructions.len() {
                return Err(ProgramError::MalformedOrder {
                    message: format!("instructionOrder references out-of-range index {idx}"),
                });
            }
            if !seen.insert(idx) {
                return Err(ProgramError::MalformedOrder {
                    message: format!("instructionOrder contains index {idx} more than once"),
                });
            }
        }
        Ok(())
    }

    fn validate_acyclic(&self) -> Result<(), ProgramError> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            InProgress,
            Done,
        }
        let n = self.instructions.len();
        let mut marks = vec![Mark::Unvisited; n];

        fn visit(
            node: usize,
            graph: &BTreeMap<usize, BTreeSet<usize>>,
            marks: &mut [Mark],
        ) -> Result<(), ProgramError> {
            match marks[node] {
                Mark::Done => return Ok(()),
                Mark::InProgress => return Err(ProgramError::Cycle { index: node }),
                Mark::Unvisited => {}
            }
            marks[node] = Mark::InProgress;
            if let Some(preds) = graph.get(&node) {
                for &p in preds {
                    visit(p, graph, marks)?;
                }
            }
            marks[node] = Mark::Done;
            Ok(())
        }

        for idx in 0..n {
            visit(idx, &self.dependency_graph, &mut marks)?;
        }
        Ok(())
    }

    fn validate_register_definitions(&self) -> Result<(), ProgramError> {
        let position: BTreeMap<usize, usize> = self
            .instruction_order
            .iter()
            .enumerate()
            .map(|(pos, &idx)| (idx, pos))
            .collect();

        let mut defined_at: BTreeMap<RegisterId, usize> = BTreeMap::new();
        defined_at.insert(self.input_register, 0);

        for &idx in &self.instruction_order {
            let instr = &self.instructions[idx];
            let my_pos = position[&idx];
            for reg in &instr.src {
                match defined_at.get(reg) {
                    Some(&def_pos) if def_pos <= my_pos => {}
                    _ => {
                        return Err(ProgramError::UndefinedRegister {
                            index: idx,
                            register: *reg,
                        })
                    }
                }
            }
            if let Some(dest) = instr.dest {
                defined_at.entry(dest).or_insert(my_pos);
            }
        }
        Ok(())
    }

    fn validate_services_resolved(&self) -> Result<(), ProgramError> {
        for instr in &self.instructions {
            if let Operands::CallService { service, .. } = &instr.operands {
                if instr.dispatch_metadata.is_none() {
                    return Err(ProgramError::UnresolvedService {
                        index: instr.index,
                        service_id: service.service_id.clone(),
                        version: service.version.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// All distinct `(serviceId, version)` pairs referenced by `CALL_SERVICE`
    /// instructions, in first-appearance order.
    #[must_use]
    pub fn referenced_services(&self) -> Vec<eyeflow_core::ServiceRef> {
        let mut seen = BTreeSet::new();
        let mut out = Vec::new();
        for instr in &self.instructions {
            if let Some(svc) = instr.calls_service() {
                if seen.insert(svc.clone()) {
                    out.push(svc.clone());
                }
            }
        }
        out
    }
}
