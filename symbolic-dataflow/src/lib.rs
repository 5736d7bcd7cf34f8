//! Crate implementing the core trace analyses.
//!
//! This crate is broken up into a module per analysis stage. The
//! `operand` module decodes the operand strings captured in a trace into
//! structured operands. The `parameter` module lowers decoded
//! instructions into byte-granular def/use sets, which the `slicer`
//! consumes to compute backward data-dependency slices. The `expr`,
//! `memory`, `regfile` and `executor` modules form the symbolic
//! execution engine: an append-only expression arena, a range-keyed
//! symbolic memory, a register file with sub-register lowering, and the
//! sequencing loop that ties them together. The `vm` module is an
//! independent pattern matcher that locates obfuscator-style context
//! save/restore windows, and `smt` renders finished formulas as
//! SMT-LIB2.
//!
//! All stages share one instruction representation
//! ([`inst::Instruction`]) and one invariant: partial registers and
//! overlapping memory ranges alias byte-accurately.

pub mod address;
pub mod error;
pub mod executor;
pub mod expr;
pub mod inst;
pub mod memory;
pub mod operand;
pub mod parameter;
pub mod regfile;
pub mod slicer;
pub mod smt;
pub mod vm;

/// Dense index of a value in an expression arena.
pub type Index = usize;

pub mod prelude {
    pub use super::address::AddrRange;
    pub use super::error::DataflowError;
    pub use super::executor::SymExecutor;
    pub use super::expr::{ExprArena, OpKind, ValueId, ValueKind};
    pub use super::inst::Instruction;
    pub use super::operand::{MemOperand, Operand};
    pub use super::parameter::Parameter;
    pub use super::slicer::backward_slice;
    pub use super::vm::VmExtractor;
}
