//! Decoded instructions: trace records plus operand structure and the
//! derived def/use parameter sets.

use crate::operand::Operand;
use crate::parameter::Parameter;
use trace::TraceRecord;

/// Mnemonics that carry no data dependency for either the executor or
/// the slicer: control flow and pure comparisons.
pub fn is_no_effect(mnemonic: &str) -> bool {
    matches!(
        mnemonic,
        "test" | "cmp" | "ret" | "call" | "jmp" | "jo" | "jno" | "js" | "jns" | "je" | "jz"
            | "jne" | "jnz" | "jb" | "jnae" | "jc" | "jnb" | "jae" | "jnc" | "jna" | "jbe"
            | "ja" | "jnbe" | "jl" | "jnge" | "jge" | "jnl" | "jle" | "jng" | "jg" | "jnle"
            | "jp" | "jpe" | "jnp" | "jpo" | "jcxz" | "jecxz"
    )
}

/// One instruction of the trace with its decoded operands.
///
/// The record itself is never mutated; `src`/`dst` (and the `src2`/
/// `dst2` pair carrying xchg's second dependency edge) are derived
/// fields populated by [`crate::parameter::build_parameters`].
#[derive(Debug, Clone)]
pub struct Instruction {
    /// 1-based position in the trace.
    pub id: usize,
    pub record: TraceRecord,
    pub operands: Vec<Operand>,
    /// Effective read address, from the record or derived from the
    /// memory operand and the register snapshot when the record carries
    /// a missing-access marker.
    pub raddr: Option<u64>,
    /// Effective write address, resolved the same way.
    pub waddr: Option<u64>,
    pub src: Vec<Parameter>,
    pub dst: Vec<Parameter>,
    pub src2: Vec<Parameter>,
    pub dst2: Vec<Parameter>,
}

impl Instruction {
    /// Decodes one record. Operand strings that cannot be classified
    /// decode to [`Operand::Unknown`]; that only becomes an error if an
    /// analysis later needs the operand's meaning.
    pub fn decode(id: usize, record: TraceRecord) -> Self {
        let operands: Vec<Operand> = record.operands().iter().map(|s| Operand::decode(s)).collect();

        let derived = operands.iter().find_map(|op| match op {
            Operand::Mem(mem) => mem.effective_addr(record.ctxreg()),
            _ => None,
        });
        let raddr = record.read_addr().or(derived);
        let waddr = record.write_addr().or(derived);

        Self {
            id,
            record,
            operands,
            raddr,
            waddr,
            src: Vec::new(),
            dst: Vec::new(),
            src2: Vec::new(),
            dst2: Vec::new(),
        }
    }

    /// Decodes a whole trace, assigning 1-based ids.
    pub fn decode_all(records: Vec<TraceRecord>) -> Vec<Self> {
        records
            .into_iter()
            .enumerate()
            .map(|(i, record)| Self::decode(i + 1, record))
            .collect()
    }

    #[inline]
    pub fn mnemonic(&self) -> &str {
        self.record.mnemonic()
    }
}
