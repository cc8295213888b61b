//! EVM2 Core — source ISA data model.
//!
//! Shared types for the bit-packed EVM2 bytecode: the opcode set and
//! its variable-length prefix table, typed operands, decoded
//! instructions, and the on-disk program image format.

pub mod isa;
pub mod program;

pub use isa::{Instruction, Op, Operand};
pub use program::{LoadError, Program};
