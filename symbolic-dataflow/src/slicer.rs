//! Backward data-dependency slicing.
//!
//! The slicer walks the trace in reverse with a worklist of
//! [`Parameter`]s that the target still depends on. An instruction that
//! defines any parameter in the worklist is included in the slice: its
//! matched definitions leave the worklist and its uses enter it.
//! Everything never included is provably irrelevant to the target under
//! the byte-granular def/use model.
//!
//! `xchg` carries two independent dependency edges (`dst <- src` and
//! `dst2 <- src2`); each edge is matched on its own, so slicing through
//! a swap follows only the half that actually feeds the target.

use crate::inst::Instruction;
use crate::parameter::Parameter;
use std::collections::BTreeSet;
use std::io::{self, Write};
use tracing::debug;

/// Result of a backward slice.
#[derive(Debug, Clone)]
pub struct Slice {
    /// Indices into the sliced sequence, in original trace order. The
    /// target itself is always included.
    pub included: Vec<usize>,
    /// Parameters still wanted after the walk: the slice's live inputs.
    pub inputs: BTreeSet<Parameter>,
}

/// Computes the backward slice of `insts` from the instruction at
/// `target` (an index into `insts`).
///
/// The worklist is seeded with the target's `src` set; for an `xchg`
/// target that is its main edge, so the slice follows the operand the
/// swap actually delivered.
///
/// Parameter sets must already be populated by
/// [`crate::parameter::build_parameters`].
pub fn backward_slice(insts: &[Instruction], target: usize) -> Slice {
    let mut wanted: BTreeSet<Parameter> = BTreeSet::new();
    wanted.extend(insts[target].src.iter().copied());

    let mut included = vec![target];

    for index in (0..target).rev() {
        let inst = &insts[index];
        if inst.dst.is_empty() && inst.dst2.is_empty() {
            continue;
        }

        if inst.mnemonic() == "xchg" {
            let main = drain_matches(&mut wanted, &inst.dst);
            if main {
                wanted.extend(inst.src2.iter().copied());
            }
            let cross = drain_matches(&mut wanted, &inst.dst2);
            if cross {
                wanted.extend(inst.src.iter().copied());
            }
            if main || cross {
                included.push(index);
            }
            continue;
        }

        if drain_matches(&mut wanted, &inst.dst) {
            wanted.extend(inst.src.iter().copied().filter(|p| !p.is_imm()));
            wanted.extend(inst.src2.iter().copied().filter(|p| !p.is_imm()));
            included.push(index);
        }
    }

    included.reverse();

    if !wanted.is_empty() {
        debug!(
            remaining = wanted.len(),
            "worklist parameters left unresolved (live slice inputs)"
        );
    }

    Slice {
        included,
        inputs: wanted,
    }
}

/// Removes every parameter of `defs` from the worklist, reporting
/// whether any was present.
fn drain_matches(wanted: &mut BTreeSet<Parameter>, defs: &[Parameter]) -> bool {
    let mut matched = false;
    for def in defs {
        matched |= wanted.remove(def);
    }
    matched
}

/// Writes the slice in a human-oriented format: id, address, assembly
/// and the parameter sets that drove inclusion.
pub fn write_human(insts: &[Instruction], slice: &Slice, out: &mut dyn Write) -> io::Result<()> {
    for &index in &slice.included {
        let inst = &insts[index];
        write!(
            out,
            "{} {:x} {}\tsrc:",
            inst.id,
            inst.record.addr(),
            inst.record.disassembly()
        )?;
        for param in &inst.src {
            write!(out, " {param}")?;
        }
        if !inst.src2.is_empty() {
            write!(out, " src2:")?;
            for param in &inst.src2 {
                write!(out, " {param}")?;
            }
        }
        write!(out, ", dst:")?;
        for param in &inst.dst {
            write!(out, " {param}")?;
        }
        if !inst.dst2.is_empty() {
            write!(out, " dst2:")?;
            for param in &inst.dst2 {
                write!(out, " {param}")?;
            }
        }
        writeln!(out)?;
    }
    Ok(())
}

/// Writes the slice as trace lines, re-parseable by every tool that
/// reads traces.
pub fn write_llse(insts: &[Instruction], slice: &Slice, out: &mut dyn Write) -> io::Result<()> {
    let mut line = String::new();
    for &index in &slice.included {
        line.clear();
        insts[index].record.emit(&mut line);
        writeln!(out, "{line}")?;
    }
    Ok(())
}
