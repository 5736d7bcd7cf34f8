//! Range-keyed symbolic memory.
//!
//! Memory state is a map from byte ranges to values. Reads and writes
//! resolve against existing ranges as exact hits, fresh (disjoint)
//! ranges, subsets, or supersets; a partially-overlapping access has no
//! sound lowering in this model and is reported as an error for the
//! caller to surface. At rest the tracked ranges are pairwise disjoint.

use crate::address::AddrRange;
use crate::expr::{ExprArena, OpKind, ValueId};
use std::collections::BTreeMap;

/// An access that straddles the edge of an existing range.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("access {range} partially overlaps tracked range {existing}")]
pub struct PartialOverlap {
    pub range: AddrRange,
    pub existing: AddrRange,
}

/// How an access range relates to the tracked ranges.
enum Resolution {
    Exact,
    Fresh,
    /// The access lies inside this existing range.
    Within(AddrRange),
    /// The access covers these existing ranges entirely.
    Covers(Vec<AddrRange>),
    Straddles(AddrRange),
}

/// Symbolic memory state for one execution.
#[derive(Debug, Default)]
pub struct MemoryMap {
    cells: BTreeMap<AddrRange, ValueId>,
    inputs: Vec<(ValueId, AddrRange)>,
}

impl MemoryMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Symbols allocated for reads of untracked memory, with the range
    /// each one covers. These are the memory inputs of the analysis.
    pub fn inputs(&self) -> &[(ValueId, AddrRange)] {
        &self.inputs
    }

    /// All tracked ranges and their values, in address order.
    pub fn iter(&self) -> impl Iterator<Item = (AddrRange, ValueId)> + '_ {
        self.cells.iter().map(|(&range, &value)| (range, value))
    }

    fn resolve(&self, range: AddrRange) -> Resolution {
        if self.cells.contains_key(&range) {
            return Resolution::Exact;
        }
        let mut covered = Vec::new();
        for &existing in self.cells.keys() {
            if !existing.overlaps(&range) {
                continue;
            }
            if range.subset_of(&existing) {
                return Resolution::Within(existing);
            }
            if range.superset_of(&existing) {
                covered.push(existing);
                continue;
            }
            return Resolution::Straddles(existing);
        }
        if covered.is_empty() {
            Resolution::Fresh
        } else {
            Resolution::Covers(covered)
        }
    }

    /// Reads `nbytes` at `addr`.
    ///
    /// A read of untracked memory allocates a fresh symbol of width
    /// `8 * nbytes` and registers it as a memory input. A read inside a
    /// wider tracked range extracts the addressed bytes by mask and
    /// shift. A read that covers a tracked range only partially (or
    /// covers it along with untracked bytes) fails.
    pub fn read(
        &mut self,
        arena: &mut ExprArena,
        addr: u64,
        nbytes: u64,
    ) -> Result<ValueId, PartialOverlap> {
        let range = AddrRange::with_len(addr, nbytes);
        match self.resolve(range) {
            Resolution::Exact => Ok(self.cells[&range]),
            Resolution::Fresh => {
                let symbol = arena.symbol((nbytes * 8) as u16);
                self.cells.insert(range, symbol);
                self.inputs.push((symbol, range));
                Ok(symbol)
            }
            Resolution::Within(existing) => {
                let select = byte_mask(&existing, &range);
                let shift = (range.start() - existing.start()) * 8;

                let tracked = self.cells[&existing];
                let mask = arena.constant(select);
                let masked = arena.op2(OpKind::And, tracked, mask);
                let shift = arena.constant(shift);
                Ok(arena.op2(OpKind::Shr, masked, shift))
            }
            Resolution::Covers(covered) => Err(PartialOverlap {
                range,
                // A read has no way to stitch covered sub-ranges back
                // together with the untracked bytes around them.
                existing: covered[0],
            }),
            Resolution::Straddles(existing) => Err(PartialOverlap { range, existing }),
        }
    }

    /// Writes `value` over `nbytes` at `addr`.
    ///
    /// Writing over tracked ranges replaces them; writing inside a wider
    /// tracked range merges the new bytes in by mask and shift. A
    /// straddling write fails.
    pub fn write(
        &mut self,
        arena: &mut ExprArena,
        addr: u64,
        nbytes: u64,
        value: ValueId,
    ) -> Result<(), PartialOverlap> {
        let range = AddrRange::with_len(addr, nbytes);
        match self.resolve(range) {
            Resolution::Exact | Resolution::Fresh => {
                self.cells.insert(range, value);
                Ok(())
            }
            Resolution::Covers(covered) => {
                for existing in covered {
                    self.cells.remove(&existing);
                }
                self.cells.insert(range, value);
                Ok(())
            }
            Resolution::Within(existing) => {
                let keep = !byte_mask(&existing, &range) & byte_mask(&existing, &existing);
                let shift = (range.start() - existing.start()) * 8;

                let tracked = self.cells[&existing];
                let mask = arena.constant(keep);
                let cleared = arena.op2(OpKind::And, tracked, mask);
                let shift = arena.constant(shift);
                let placed = arena.op2(OpKind::Shl, value, shift);
                let merged = arena.op2(OpKind::Or, cleared, placed);
                self.cells.insert(existing, merged);
                Ok(())
            }
            Resolution::Straddles(existing) => Err(PartialOverlap { range, existing }),
        }
    }
}

/// Mask selecting the bytes of `inner` within a value stored at `outer`
/// (little-endian byte order, bit 0 of the value at `outer.start()`).
fn byte_mask(outer: &AddrRange, inner: &AddrRange) -> u64 {
    debug_assert!(inner.subset_of(outer));
    debug_assert!(outer.len() <= 8);
    let mut mask = 0u64;
    for addr in inner.iter() {
        mask |= 0xff << ((addr - outer.start()) * 8);
    }
    mask
}
