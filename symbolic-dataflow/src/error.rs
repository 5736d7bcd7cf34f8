//! Error taxonomy shared by the analyses.

use crate::address::AddrRange;

/// Fatal analysis errors.
///
/// Every variant identifies the offending instruction by its trace id so
/// the failure can be located in the input. All of these abort the
/// running command; none leave partial state behind.
#[derive(thiserror::Error, Debug)]
pub enum DataflowError {
    #[error("instruction {id}: unknown mnemonic `{mnemonic}`")]
    UnknownMnemonic { id: usize, mnemonic: String },

    #[error("instruction {id}: operand `{text}` could not be classified")]
    UnknownOperand { id: usize, text: String },

    #[error("instruction {id}: register `{name}` has no symbolic state")]
    UnknownRegister { id: usize, name: String },

    #[error(
        "instruction {id}: access {range} partially overlaps tracked memory {existing}; \
         partial aliasing is not supported"
    )]
    UnsupportedMemoryAliasing {
        id: usize,
        range: AddrRange,
        existing: AddrRange,
    },

    #[error("instruction {id}: `{mnemonic}` does not support addressing tag {tag}")]
    UnsupportedAddressingTag { id: usize, mnemonic: String, tag: u8 },

    #[error("instruction {id}: `{mnemonic}` with {found} operand(s) has no handler")]
    ArityMismatch {
        id: usize,
        mnemonic: String,
        found: usize,
    },

    #[error("instruction {id}: memory access with no recorded or derivable effective address")]
    MissingEffectiveAddress { id: usize },
}
