//! Crate for reading and writing x86-64 instruction traces.
//!
//! A trace is a line-oriented text file produced by a DBI agent. Each line
//! records one executed instruction: its address, its disassembly, the
//! contents of the eight general purpose integer registers immediately
//! before execution, and the effective addresses of any memory read or
//! write the instruction performed.
//!
//! This crate is purely a data model. It knows how to parse a trace line
//! into a [`record::TraceRecord`], how to emit a record back out in the
//! same format, and how register names relate to the eight canonical
//! 64-bit registers captured in the per-record context. All analysis
//! semantics live elsewhere.

pub mod reader;
pub mod record;
pub mod register;

pub use reader::TraceReader;
pub use record::{ParseError, TraceRecord};
pub use register::{RegAccess, RegPart, Register};

#[derive(Copy, Clone)]
pub(crate) struct Hex<T>(pub(crate) T);

impl std::fmt::Display for Hex<u64> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:x}", self.0)
    }
}
