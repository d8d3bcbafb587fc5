// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
#![warn(missing_docs)]
//! Intermediate representation for compiled EyeFlow workflows.
//!
//! This crate owns the instruction set, the dependency graph, and the
//! `CompiledWorkflow` sealed-artifact shape. It has no opinion on *how* a
//! program gets resolved (that's [`eyeflow-manifest`]), preloaded (that's
//! [`eyeflow-preload`]), or executed (that's [`eyeflow-vm`]) — it is the
//! wire format and the invariant checker those crates share.

/// Sealed, immutable compiled workflow artifact (C2's output, C11's input).
pub mod artifact;
/// Instruction set: opcodes, registers, dispatch metadata.
pub mod instruction;
/// `IrProgram`: the ordered instruction sequence plus its dependency graph.
pub mod program;

pub use artifact::{CompiledWorkflow, PreLoadedServices, ServiceHandle};
pub use instruction::{DispatchMetadata, IrInstruction, Opcode, RegisterId};
pub use program::{IrProgram, ProgramError};

/// Total addressable registers in the VM's execution context ("256 numbered registers").
pub const MAX_REGISTERS: usize = 256;
