//! Extraction of obfuscator-style VM context windows.
//!
//! Interpreter bodies produced by virtualizing obfuscators are
//! bracketed by a block of consecutive `push reg` instructions (the
//! context save) and a matching block of consecutive `pop reg`
//! instructions (the restore). The extractor scans the trace for such
//! blocks, pairs saves with restores whose trace-observed stack
//! pointers line up, and re-emits each bracketed window as a trace of
//! its own.

use crate::inst::Instruction;
use crate::operand::Operand;
use std::collections::BTreeSet;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use trace::register::Register;
use tracing::debug;

/// Block length used by the classic 7-register interpreter prologue.
pub const DEFAULT_WINDOW_LEN: usize = 7;

/// One matched save/restore pair. Both ranges are half-open index
/// ranges into the scanned instruction sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmWindow {
    pub save: std::ops::Range<usize>,
    pub restore: std::ops::Range<usize>,
    /// The stack pointer value that paired the two blocks.
    pub stack_ptr: u64,
}

impl VmWindow {
    /// Index range of the whole window, save through restore.
    pub fn span(&self) -> std::ops::Range<usize> {
        self.save.start..self.restore.end
    }
}

/// Scanner for VM context windows.
#[derive(Debug, Clone)]
pub struct VmExtractor {
    window_len: usize,
}

impl Default for VmExtractor {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW_LEN)
    }
}

impl VmExtractor {
    pub fn new(window_len: usize) -> Self {
        assert!(window_len > 0);
        Self { window_len }
    }

    /// Finds every save/restore pairing in the sequence.
    ///
    /// A save block is `window_len` consecutive `push reg` instructions
    /// over recognized integer registers with no register repeated; a
    /// restore block is the same shape over `pop`. A save pairs with
    /// every later restore whose stack pointer at block entry equals
    /// the save's at block exit.
    pub fn extract(&self, insts: &[Instruction]) -> Vec<VmWindow> {
        let k = self.window_len;
        let mut saves: Vec<(std::ops::Range<usize>, u64)> = Vec::new();
        let mut restores: Vec<(std::ops::Range<usize>, u64)> = Vec::new();

        let mut at = 0;
        while at + k <= insts.len() {
            let block = &insts[at..at + k];
            if is_reg_block(block, "push") {
                // The stack pointer after the final push is the
                // snapshot of the next executed instruction.
                if let Some(next) = insts.get(at + k) {
                    let sd = next.record.ctxreg_of(Register::Rsp);
                    debug!(id = block[0].id, sd, "context save block");
                    saves.push((at..at + k, sd));
                }
            } else if is_reg_block(block, "pop") {
                let sd = block[0].record.ctxreg_of(Register::Rsp);
                debug!(id = block[0].id, sd, "context restore block");
                restores.push((at..at + k, sd));
            }
            at += 1;
        }

        let mut windows = Vec::new();
        for (save, save_sd) in &saves {
            for (restore, restore_sd) in &restores {
                if save_sd == restore_sd && save.end <= restore.start {
                    windows.push(VmWindow {
                        save: save.clone(),
                        restore: restore.clone(),
                        stack_ptr: *save_sd,
                    });
                }
            }
        }
        windows
    }

    /// Writes each window to `vm1.txt`, `vm2.txt`, … under `outdir`,
    /// returning the created paths.
    pub fn emit(
        &self,
        insts: &[Instruction],
        windows: &[VmWindow],
        outdir: &Path,
    ) -> io::Result<Vec<PathBuf>> {
        let mut paths = Vec::with_capacity(windows.len());
        for (n, window) in windows.iter().enumerate() {
            let path = outdir.join(format!("vm{}.txt", n + 1));
            let mut out = BufWriter::new(File::create(&path)?);
            write_window(insts, window, &mut out)?;
            out.flush()?;
            paths.push(path);
        }
        Ok(paths)
    }
}

/// Writes one window's instructions in the trace line format.
pub fn write_window(
    insts: &[Instruction],
    window: &VmWindow,
    out: &mut dyn Write,
) -> io::Result<()> {
    let mut line = String::new();
    for inst in &insts[window.span()] {
        line.clear();
        inst.record.emit(&mut line);
        writeln!(out, "{line}")?;
    }
    Ok(())
}

/// True when every instruction in the block is `<mnemonic> <reg>` over
/// recognized integer registers, with no register used twice.
fn is_reg_block(block: &[Instruction], mnemonic: &str) -> bool {
    let mut seen = BTreeSet::new();
    block.iter().all(|inst| {
        inst.mnemonic() == mnemonic
            && matches!(
                inst.operands.as_slice(),
                [Operand::Reg { name, .. }] if is_recognized_reg(name) && seen.insert(name.clone())
            )
    })
}

/// The integer registers a context block may save: the eight canonical
/// GPRs plus `r8`..`r15`.
fn is_recognized_reg(name: &str) -> bool {
    if Register::ALL.iter().any(|reg| reg.name() == name) {
        return true;
    }
    name.strip_prefix('r')
        .and_then(|digits| digits.parse::<u8>().ok())
        .map_or(false, |n| (8..=15).contains(&n))
}

/// Deletes adjacent canceling pairs from the sequence.
///
/// Handled pairs are `pushad`/`popad` in either order, `push`/`pop` (or
/// the reverse) of the same operand, `add`/`sub` (either order) with
/// identical operands, and `inc`/`dec` (either order) of the same
/// operand. One forward scan: each position is checked against its
/// successor and the scan advances past both on a match.
pub fn peephole(insts: Vec<Instruction>) -> Vec<Instruction> {
    let mut kept = Vec::with_capacity(insts.len());
    let mut iter = insts.into_iter().peekable();
    while let Some(inst) = iter.next() {
        if iter.peek().map_or(false, |next| cancels(&inst, next)) {
            let next = iter.next().expect("peeked");
            debug!(first = inst.id, second = next.id, "peephole deleted pair");
        } else {
            kept.push(inst);
        }
    }
    kept
}

fn cancels(a: &Instruction, b: &Instruction) -> bool {
    let inverse = |x: &str, y: &str| {
        (a.mnemonic() == x && b.mnemonic() == y) || (a.mnemonic() == y && b.mnemonic() == x)
    };
    if inverse("pushad", "popad") {
        return true;
    }
    let same_first = a.record.operands().first() == b.record.operands().first()
        && !a.record.operands().is_empty();
    if (inverse("push", "pop") || inverse("inc", "dec")) && same_first {
        return true;
    }
    inverse("add", "sub") && same_first && a.record.operands().get(1) == b.record.operands().get(1)
}
