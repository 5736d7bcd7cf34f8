//! Symbolic register file with sub-register lowering.
//!
//! Each of the eight canonical registers holds one 64-bit wide value.
//! Reads and writes through narrower aliases lower to mask-and-shift
//! expressions against the parent, so no access ever disturbs bits
//! outside the alias it names. The one exception to pure mask-and-shift
//! is writing a symbolic high byte (`ah`..`dh`) into a concrete parent,
//! which splices a hybrid value instead so the parent's untouched bytes
//! stay concrete and legible.

use crate::expr::{BitRange, ExprArena, OpKind, ValueId, ValueKind};
use trace::register::{RegAccess, RegPart, Register};

const KEEP_HIGH32: u64 = 0xffff_ffff_0000_0000;
const KEEP_HIGH48: u64 = 0xffff_ffff_ffff_0000;
const KEEP_ALL_BUT_LOW8: u64 = 0xffff_ffff_ffff_ff00;
const KEEP_ALL_BUT_BYTE1: u64 = 0xffff_ffff_ffff_00ff;

const LOW32: u64 = 0x0000_0000_ffff_ffff;
const LOW16: u64 = 0x0000_0000_0000_ffff;
const LOW8: u64 = 0x0000_0000_0000_00ff;
const BYTE1: u64 = 0x0000_0000_0000_ff00;

/// Symbolic state of the eight canonical registers.
#[derive(Debug, Clone)]
pub struct RegisterFile {
    slots: [ValueId; Register::COUNT],
}

impl RegisterFile {
    /// Builds a register file from one initial value per register, in
    /// context order.
    pub fn new(slots: [ValueId; Register::COUNT]) -> Self {
        Self { slots }
    }

    /// Current value of a full 64-bit register.
    #[inline]
    pub fn get(&self, reg: Register) -> ValueId {
        self.slots[reg.index()]
    }

    /// Replaces a full 64-bit register.
    #[inline]
    pub fn set(&mut self, reg: Register, value: ValueId) {
        self.slots[reg.index()] = value;
    }

    /// Reads through a register access, lowering sub-register aliases.
    pub fn read(&self, arena: &mut ExprArena, access: RegAccess) -> ValueId {
        let parent = self.get(access.reg);
        match access.part {
            RegPart::Qword => parent,
            RegPart::Dword => self.read_low(arena, parent, access, LOW32),
            RegPart::Word => self.read_low(arena, parent, access, LOW16),
            RegPart::ByteLo => self.read_low(arena, parent, access, LOW8),
            RegPart::ByteHi => {
                if let Some(child) = hybrid_child(arena, parent, access) {
                    return child;
                }
                let mask = arena.constant(BYTE1);
                let masked = arena.op2(OpKind::And, parent, mask);
                let eight = arena.constant(8);
                arena.op2(OpKind::Shr, masked, eight)
            }
        }
    }

    fn read_low(
        &self,
        arena: &mut ExprArena,
        parent: ValueId,
        access: RegAccess,
        mask: u64,
    ) -> ValueId {
        if let Some(child) = hybrid_child(arena, parent, access) {
            return child;
        }
        let mask = arena.constant(mask);
        arena.op2(OpKind::And, parent, mask)
    }

    /// Writes through a register access, lowering sub-register aliases.
    ///
    /// Sub-register writes merge: the bits outside the alias keep their
    /// previous value.
    pub fn write(&mut self, arena: &mut ExprArena, access: RegAccess, value: ValueId) {
        match access.part {
            RegPart::Qword => self.set(access.reg, value),
            RegPart::Dword => self.write_low(arena, access.reg, value, KEEP_HIGH32),
            RegPart::Word => self.write_low(arena, access.reg, value, KEEP_HIGH48),
            RegPart::ByteLo => self.write_low(arena, access.reg, value, KEEP_ALL_BUT_LOW8),
            RegPart::ByteHi => self.write_byte_hi(arena, access.reg, value),
        }
    }

    fn write_low(&mut self, arena: &mut ExprArena, reg: Register, value: ValueId, keep: u64) {
        let parent = self.get(reg);
        let keep = arena.constant(keep);
        let kept = arena.op2(OpKind::And, parent, keep);
        let merged = arena.op2(OpKind::Or, kept, value);
        self.set(reg, merged);
    }

    fn write_byte_hi(&mut self, arena: &mut ExprArena, reg: Register, value: ValueId) {
        let parent = self.get(reg);
        let target = BitRange::new(8, 15);

        if arena.get(value).is_symbolic() {
            // Concrete byte preservation: splice the symbol into bits
            // [8, 15] and keep the parent's other bits as concrete
            // children.
            if let Some(bits) = arena.get(parent).concrete() {
                let low = arena.constant(ExprArena::extract_bits(bits, BitRange::new(0, 7)));
                let high = arena.constant(ExprArena::extract_bits(bits, BitRange::new(16, 63)));
                let hybrid = arena.hybrid(vec![
                    (BitRange::new(0, 7), low),
                    (target, value),
                    (BitRange::new(16, 63), high),
                ]);
                self.set(reg, hybrid);
                return;
            }
            // A hybrid parent with an exact [8, 15] child is rebuilt
            // with that child swapped; nodes themselves stay frozen.
            let rebuilt = match arena.get(parent).kind() {
                ValueKind::Hybrid(children)
                    if children.iter().any(|&(range, _)| range == target) =>
                {
                    Some(
                        children
                            .iter()
                            .map(|&(range, child)| {
                                (range, if range == target { value } else { child })
                            })
                            .collect::<Vec<_>>(),
                    )
                }
                _ => None,
            };
            if let Some(children) = rebuilt {
                let hybrid = arena.hybrid(children);
                self.set(reg, hybrid);
                return;
            }
        }

        let eight = arena.constant(8);
        let placed = arena.op2(OpKind::Shl, value, eight);
        let keep = arena.constant(KEEP_ALL_BUT_BYTE1);
        let kept = arena.op2(OpKind::And, parent, keep);
        let merged = arena.op2(OpKind::Or, kept, placed);
        self.set(reg, merged);
    }
}

/// Returns the hybrid child covering exactly the accessed bit range, if
/// the parent is a hybrid that has one.
fn hybrid_child(arena: &ExprArena, parent: ValueId, access: RegAccess) -> Option<ValueId> {
    let (lo, hi) = access.bit_range();
    let wanted = BitRange::new(lo, hi);
    match arena.get(parent).kind() {
        ValueKind::Hybrid(children) => children
            .iter()
            .find(|&&(range, _)| range == wanted)
            .map(|&(_, child)| child),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hashbrown::HashMap;

    fn access(name: &str) -> RegAccess {
        RegAccess::parse(name).unwrap()
    }

    fn fresh() -> (ExprArena, RegisterFile, [ValueId; 8]) {
        let mut arena = ExprArena::new();
        let slots = [(); 8].map(|_| arena.symbol(64));
        let regs = RegisterFile::new(slots);
        (arena, regs, slots)
    }

    #[test]
    fn full_width_reads_are_direct() {
        let (mut arena, regs, slots) = fresh();
        assert_eq!(regs.read(&mut arena, access("rbx")), slots[1]);
    }

    #[test]
    fn dword_write_keeps_high_bits() {
        let (mut arena, mut regs, slots) = fresh();
        let initial = slots[Register::Rax.index()];

        let new = arena.constant(0x1234_5678);
        regs.write(&mut arena, access("eax"), new);
        let rax = regs.get(Register::Rax);

        let mut inputs = HashMap::new();
        inputs.insert(initial, 0xaaaa_bbbb_cccc_dddd);
        let got = arena.evaluate(rax, &inputs).unwrap();
        assert_eq!(got, 0xaaaa_bbbb_1234_5678);
    }

    #[test]
    fn low_byte_write_is_isolated() {
        let (mut arena, mut regs, slots) = fresh();
        let initial = slots[Register::Rax.index()];

        let new = arena.constant(0x42);
        regs.write(&mut arena, access("al"), new);

        let mut inputs = HashMap::new();
        inputs.insert(initial, 0x1111_1111_1111_1111);
        let got = arena.evaluate(regs.get(Register::Rax), &inputs).unwrap();
        assert_eq!(got, 0x1111_1111_1111_1142);
    }

    #[test]
    fn high_byte_write_into_symbolic_parent_masks_and_shifts() {
        let (mut arena, mut regs, slots) = fresh();
        let initial = slots[Register::Rbx.index()];

        let new = arena.constant(0x7f);
        regs.write(&mut arena, access("bh"), new);

        let mut inputs = HashMap::new();
        inputs.insert(initial, 0x2222_2222_2222_2222);
        let got = arena.evaluate(regs.get(Register::Rbx), &inputs).unwrap();
        assert_eq!(got, 0x2222_2222_2222_7f22);
    }

    #[test]
    fn symbolic_high_byte_into_concrete_parent_splices_a_hybrid() {
        let mut arena = ExprArena::new();
        let slots = [(); 8].map(|_| arena.constant(0x1122_3344_5566_7788));
        let mut regs = RegisterFile::new(slots);

        let sym = arena.symbol(8);
        regs.write(&mut arena, access("ah"), sym);
        let rax = regs.get(Register::Rax);
        assert!(arena.get(rax).is_hybrid());

        // Reading `ah` back yields the spliced symbol itself.
        assert_eq!(regs.read(&mut arena, access("ah")), sym);

        // The other bytes evaluate to the old concrete contents.
        let mut inputs = HashMap::new();
        inputs.insert(sym, 0xee);
        let got = arena.evaluate(rax, &inputs).unwrap();
        assert_eq!(got, 0x1122_3344_5566_ee88);
    }

    #[test]
    fn hybrid_parent_rebuilds_on_second_high_byte_write() {
        let mut arena = ExprArena::new();
        let slots = [(); 8].map(|_| arena.constant(0xffff_ffff_ffff_ffff));
        let mut regs = RegisterFile::new(slots);

        let first = arena.symbol(8);
        regs.write(&mut arena, access("ah"), first);
        let after_first = regs.get(Register::Rax);

        let second = arena.symbol(8);
        regs.write(&mut arena, access("ah"), second);
        let after_second = regs.get(Register::Rax);

        assert_ne!(after_first, after_second, "nodes are frozen, not mutated");
        assert_eq!(regs.read(&mut arena, access("ah")), second);
    }

    #[test]
    fn word_and_dword_reads_mask_the_parent() {
        let (mut arena, mut regs, _) = fresh();
        let value = arena.constant(0xdead_beef_f00d_cafe);
        regs.write(&mut arena, access("rcx"), value);

        let inputs = HashMap::new();
        let ecx = regs.read(&mut arena, access("ecx"));
        assert_eq!(arena.evaluate(ecx, &inputs).unwrap(), 0xf00d_cafe);

        let cx = regs.read(&mut arena, access("cx"));
        assert_eq!(arena.evaluate(cx, &inputs).unwrap(), 0xcafe);

        let ch = regs.read(&mut arena, access("ch"));
        assert_eq!(arena.evaluate(ch, &inputs).unwrap(), 0xca);
    }
}
