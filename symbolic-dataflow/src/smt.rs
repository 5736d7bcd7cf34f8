//! SMT-LIB2 rendering of finished formulas.
//!
//! The emitted dialect is SMT-LIB2 over `(_ BitVec 64)` (the historical
//! tooling this replaces labeled a similar output "CVC"; this emitter
//! commits to one standard dialect). Every input symbol of the formula
//! is declared as a constant, and the formula itself is bound to a
//! defined function so a solver or a human can query it directly.

use crate::expr::{ExprArena, OpKind, ValueId, ValueKind};
use std::io::{self, Write};

/// Writes a complete SMT-LIB2 script defining `formula` in terms of its
/// input symbols.
pub fn write_smt2(arena: &ExprArena, formula: ValueId, out: &mut dyn Write) -> io::Result<()> {
    writeln!(out, "(set-logic QF_BV)")?;
    for input in arena.inputs(formula) {
        writeln!(out, "(declare-const {input} (_ BitVec 64))")?;
    }
    write!(out, "(define-fun formula () (_ BitVec 64) ")?;
    write_term(arena, formula, out)?;
    writeln!(out, ")")?;
    writeln!(out, "(check-sat)")
}

fn write_term(arena: &ExprArena, id: ValueId, out: &mut dyn Write) -> io::Result<()> {
    let value = arena.get(id);
    if let Some(op) = value.op() {
        let operands = op.operands();
        match op.kind() {
            OpKind::Mov => return write_term(arena, operands[0], out),
            OpKind::Inc => {
                write!(out, "(bvadd ")?;
                write_term(arena, operands[0], out)?;
                return write!(out, " {})", bv(1));
            }
            kind => {
                write!(out, "({}", bv_op(kind))?;
                for &operand in operands {
                    write!(out, " ")?;
                    write_term(arena, operand, out)?;
                }
                return write!(out, ")");
            }
        }
    }
    match value.kind() {
        ValueKind::Concrete(bits) => write!(out, "{}", bv(*bits)),
        ValueKind::Symbol => write!(out, "{id}"),
        ValueKind::Hybrid(children) => {
            // Compose the word as the OR of each child masked and
            // shifted into place.
            write!(out, "(bvor")?;
            for &(range, child) in children {
                write!(out, " (bvshl (bvand ")?;
                write_term(arena, child, out)?;
                write!(out, " {}) {})", bv(range.low_mask()), bv(u64::from(range.lo)))?;
            }
            write!(out, ")")
        }
    }
}

fn bv_op(kind: OpKind) -> &'static str {
    match kind {
        OpKind::Add => "bvadd",
        OpKind::Sub => "bvsub",
        OpKind::Imul => "bvmul",
        OpKind::Xor => "bvxor",
        OpKind::And => "bvand",
        OpKind::Or => "bvor",
        OpKind::Shl => "bvshl",
        OpKind::Shr => "bvlshr",
        OpKind::Neg => "bvneg",
        OpKind::Inc | OpKind::Mov => unreachable!("lowered before dispatch"),
    }
}

fn bv(bits: u64) -> String {
    format!("#x{bits:016x}")
}
