//! Byte-granular def/use parameters.
//!
//! A [`Parameter`] is the atom of data dependency: an immediate, one
//! byte of one canonical register, or one byte of memory. Lowering an
//! instruction produces the exact sets of parameters it reads (`src`)
//! and writes (`dst`) — plus a second, independent edge (`src2`/`dst2`)
//! for `xchg`, whose two transfers must not be conflated. The backward
//! slicer works entirely over these sets.

use crate::address::AddrRange;
use crate::error::DataflowError;
use crate::inst::{is_no_effect, Instruction};
use crate::operand::{MemOperand, Operand};
use std::fmt;
use trace::register::{RegAccess, Register};

/// A byte-granular def/use atom.
///
/// The derived ordering (immediates, then register bytes, then memory
/// bytes) gives parameters a total order so they can live in ordered
/// sets.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Parameter {
    /// An immediate value. Never a dependency target.
    Imm(u64),
    /// Byte `byte` (0..8) of a canonical 64-bit register.
    Reg { reg: Register, byte: u8 },
    /// The single memory byte at `addr`.
    Mem(u64),
}

impl Parameter {
    pub fn is_imm(&self) -> bool {
        matches!(self, Parameter::Imm(_))
    }
}

impl fmt::Display for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Parameter::Imm(value) => write!(f, "(IMM {value:#x})"),
            Parameter::Reg { reg, byte } => write!(f, "(REG {reg}{byte})"),
            Parameter::Mem(addr) => write!(f, "(MEM {addr:#x})"),
        }
    }
}

/// Which of an instruction's four parameter lists to extend.
#[derive(Copy, Clone)]
enum List {
    Src,
    Dst,
    Src2,
    Dst2,
}

struct Lowering<'a> {
    inst: &'a mut Instruction,
}

impl Lowering<'_> {
    fn list(&mut self, which: List) -> &mut Vec<Parameter> {
        match which {
            List::Src => &mut self.inst.src,
            List::Dst => &mut self.inst.dst,
            List::Src2 => &mut self.inst.src2,
            List::Dst2 => &mut self.inst.dst2,
        }
    }

    fn add_imm(&mut self, which: List, value: u64) {
        self.list(which).push(Parameter::Imm(value));
    }

    /// Expands a register name to one parameter per byte it covers:
    /// eight bytes for 64-bit names, four for 32-bit, bytes {0, 1} for
    /// 16-bit, byte 0 for low-byte aliases and byte 1 for high-byte
    /// aliases.
    fn add_reg(&mut self, which: List, name: &str) -> Result<(), DataflowError> {
        let access = RegAccess::parse(name).ok_or_else(|| DataflowError::UnknownRegister {
            id: self.inst.id,
            name: name.to_owned(),
        })?;
        let reg = access.reg;
        let list = self.list(which);
        for byte in access.byte_span() {
            list.push(Parameter::Reg { reg, byte });
        }
        Ok(())
    }

    /// Expands an n-byte memory access to one parameter per byte.
    fn add_mem(&mut self, which: List, range: AddrRange) {
        let list = self.list(which);
        list.extend(range.iter().map(Parameter::Mem));
    }

    fn read_range(&self, mem: &MemOperand) -> Result<AddrRange, DataflowError> {
        let addr = self
            .inst
            .raddr
            .ok_or(DataflowError::MissingEffectiveAddress { id: self.inst.id })?;
        Ok(AddrRange::with_len(addr, mem.width_bytes()))
    }

    fn write_range(&self, nbytes: u64) -> Result<AddrRange, DataflowError> {
        let addr = self
            .inst
            .waddr
            .or(self.inst.raddr)
            .ok_or(DataflowError::MissingEffectiveAddress { id: self.inst.id })?;
        Ok(AddrRange::with_len(addr, nbytes))
    }

    fn unknown_operand(&self, operand: &Operand) -> DataflowError {
        DataflowError::UnknownOperand {
            id: self.inst.id,
            text: operand.to_string(),
        }
    }

    fn arity_mismatch(&self) -> DataflowError {
        DataflowError::ArityMismatch {
            id: self.inst.id,
            mnemonic: self.inst.mnemonic().to_owned(),
            found: self.inst.operands.len(),
        }
    }
}

/// Populates `src`/`dst`/`src2`/`dst2` for every non-skipped
/// instruction.
///
/// Shapes outside the handled instruction subset are a hard error;
/// parameters are never silently dropped.
pub fn build_parameters(insts: &mut [Instruction]) -> Result<(), DataflowError> {
    for inst in insts {
        if is_no_effect(inst.mnemonic()) {
            continue;
        }
        lower_one(inst)?;
    }
    Ok(())
}

fn lower_one(inst: &mut Instruction) -> Result<(), DataflowError> {
    let mnemonic = inst.mnemonic().to_owned();
    let operands = inst.operands.clone();
    let mut low = Lowering { inst };

    match operands.as_slice() {
        [] => Ok(()),

        [op0] => match mnemonic.as_str() {
            "push" => match op0 {
                Operand::Imm { value, .. } => {
                    low.add_imm(List::Src, *value);
                    // A 64-bit push always stores eight bytes.
                    let war = low.write_range(8)?;
                    low.add_mem(List::Dst, war);
                    Ok(())
                }
                Operand::Reg { name, width } => {
                    low.add_reg(List::Src, name)?;
                    let war = low.write_range(u64::from(*width) / 8)?;
                    low.add_mem(List::Dst, war);
                    Ok(())
                }
                Operand::Mem(mem) => {
                    let rar = low.read_range(mem)?;
                    low.add_mem(List::Src, rar);
                    let war = low.write_range(mem.width_bytes())?;
                    low.add_mem(List::Dst, war);
                    Ok(())
                }
                Operand::Unknown { .. } => Err(low.unknown_operand(op0)),
            },
            "pop" => match op0 {
                Operand::Reg { name, width } => {
                    let addr = low
                        .inst
                        .raddr
                        .ok_or(DataflowError::MissingEffectiveAddress { id: low.inst.id })?;
                    let rar = AddrRange::with_len(addr, u64::from(*width) / 8);
                    low.add_mem(List::Src, rar);
                    low.add_reg(List::Dst, name)
                }
                Operand::Mem(mem) => {
                    let rar = low.read_range(mem)?;
                    low.add_mem(List::Src, rar);
                    let war = low.write_range(mem.width_bytes())?;
                    low.add_mem(List::Dst, war);
                    Ok(())
                }
                _ => Err(low.unknown_operand(op0)),
            },
            // Single-operand updates: the operand is both source and
            // destination.
            _ => match op0 {
                Operand::Reg { name, .. } => {
                    low.add_reg(List::Src, name)?;
                    low.add_reg(List::Dst, name)
                }
                Operand::Mem(mem) => {
                    let rar = low.read_range(mem)?;
                    low.add_mem(List::Src, rar);
                    let war = low.write_range(mem.width_bytes())?;
                    low.add_mem(List::Dst, war);
                    Ok(())
                }
                _ => Err(low.unknown_operand(op0)),
            },
        },

        [op0, op1] => match mnemonic.as_str() {
            "mov" | "movzx" | "movsx" => {
                match op1 {
                    Operand::Imm { value, .. } => low.add_imm(List::Src, *value),
                    Operand::Reg { name, .. } => low.add_reg(List::Src, name)?,
                    Operand::Mem(mem) => {
                        let rar = low.read_range(mem)?;
                        low.add_mem(List::Src, rar);
                    }
                    Operand::Unknown { .. } => return Err(low.unknown_operand(op1)),
                }
                match op0 {
                    Operand::Reg { name, .. } => low.add_reg(List::Dst, name),
                    Operand::Mem(mem) => {
                        let war = low.write_range(mem.width_bytes())?;
                        low.add_mem(List::Dst, war);
                        Ok(())
                    }
                    _ => Err(low.unknown_operand(op0)),
                }
            }
            "lea" => {
                let (Operand::Reg { name: dst, .. }, Operand::Mem(mem)) = (op0, op1) else {
                    return Err(low.arity_mismatch());
                };
                // Sources are the register components of the address
                // expression; the displacement contributes nothing and
                // no memory is touched.
                if let Some(base) = &mem.base {
                    low.add_reg(List::Src, base)?;
                }
                if let Some(index) = &mem.index {
                    low.add_reg(List::Src, index)?;
                }
                low.add_reg(List::Dst, dst)
            }
            "xchg" => {
                // Two independent transfers: op0 <- op1 (src/dst) and
                // op1 <- op0 (src2/dst2).
                match op1 {
                    Operand::Reg { name, .. } => {
                        low.add_reg(List::Src, name)?;
                        low.add_reg(List::Dst2, name)?;
                    }
                    Operand::Mem(mem) => {
                        let rar = low.read_range(mem)?;
                        low.add_mem(List::Src, rar);
                        low.add_mem(List::Dst2, rar);
                    }
                    _ => return Err(low.unknown_operand(op1)),
                }
                match op0 {
                    Operand::Reg { name, .. } => {
                        low.add_reg(List::Src2, name)?;
                        low.add_reg(List::Dst, name)
                    }
                    Operand::Mem(mem) => {
                        let rar = low.read_range(mem)?;
                        low.add_mem(List::Src2, rar);
                        low.add_mem(List::Dst, rar);
                        Ok(())
                    }
                    _ => Err(low.unknown_operand(op0)),
                }
            }
            // Remaining two-operand forms: op0 is read and written,
            // op1 is read.
            _ => {
                match op1 {
                    Operand::Imm { value, .. } => low.add_imm(List::Src, *value),
                    Operand::Reg { name, .. } => low.add_reg(List::Src, name)?,
                    Operand::Mem(mem) => {
                        let rar = low.read_range(mem)?;
                        low.add_mem(List::Src, rar);
                    }
                    Operand::Unknown { .. } => return Err(low.unknown_operand(op1)),
                }
                match op0 {
                    Operand::Reg { name, .. } => {
                        low.add_reg(List::Src, name)?;
                        low.add_reg(List::Dst, name)
                    }
                    Operand::Mem(mem) => {
                        let rar = low.read_range(mem)?;
                        low.add_mem(List::Src, rar);
                        let war = low.write_range(mem.width_bytes())?;
                        low.add_mem(List::Dst, war);
                        Ok(())
                    }
                    _ => Err(low.unknown_operand(op0)),
                }
            }
        },

        [op0, op1, op2] => {
            let is_imul_rri = mnemonic == "imul"
                && op0.is_reg()
                && op1.is_reg()
                && op2.is_imm();
            if !is_imul_rri {
                return Err(low.arity_mismatch());
            }
            let (Operand::Reg { name: dst, .. }, Operand::Reg { name: lhs, .. }, Operand::Imm { value, .. }) =
                (op0, op1, op2)
            else {
                unreachable!()
            };
            low.add_imm(List::Src, *value);
            low.add_reg(List::Src, lhs)?;
            low.add_reg(List::Src, dst)?;
            low.add_reg(List::Dst, dst)
        }

        _ => Err(low.arity_mismatch()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trace::TraceRecord;

    fn inst(disassembly: &str, raddr: u64, waddr: u64) -> Instruction {
        let record = TraceRecord::new(0x401000, disassembly, [0; 8], raddr, waddr);
        Instruction::decode(1, record)
    }

    fn lowered(disassembly: &str, raddr: u64, waddr: u64) -> Instruction {
        let mut insts = [inst(disassembly, raddr, waddr)];
        build_parameters(&mut insts).unwrap();
        let [inst] = insts;
        inst
    }

    #[test]
    fn register_widths_expand_to_bytes() {
        let i = lowered("mov rax, rbx", 0, 0);
        assert_eq!(i.src.len(), 8);
        assert_eq!(i.dst.len(), 8);
        assert_eq!(i.src[0], Parameter::Reg { reg: Register::Rbx, byte: 0 });
        assert_eq!(i.dst[7], Parameter::Reg { reg: Register::Rax, byte: 7 });

        let i = lowered("mov eax, ebx", 0, 0);
        assert_eq!((i.src.len(), i.dst.len()), (4, 4));

        let i = lowered("mov ah, bl", 0, 0);
        assert_eq!(i.src, vec![Parameter::Reg { reg: Register::Rbx, byte: 0 }]);
        assert_eq!(i.dst, vec![Parameter::Reg { reg: Register::Rax, byte: 1 }]);
    }

    #[test]
    fn push_writes_eight_stack_bytes() {
        let i = lowered("push rax", 0, 0x7fe0);
        assert_eq!(i.src.len(), 8);
        assert_eq!(i.dst.len(), 8);
        assert_eq!(i.dst[0], Parameter::Mem(0x7fe0));
        assert_eq!(i.dst[7], Parameter::Mem(0x7fe7));

        let i = lowered("push 0x1234", 0, 0x7fe0);
        assert_eq!(i.src, vec![Parameter::Imm(0x1234)]);
        assert_eq!(i.dst.len(), 8);
    }

    #[test]
    fn memory_parameters_follow_the_recorded_addresses() {
        let i = lowered("mov rax, qword ptr [rbp-0x8]", 0x7fd0, 0);
        assert_eq!(i.src.len(), 8);
        assert_eq!(i.src[0], Parameter::Mem(0x7fd0));

        let i = lowered("mov dword ptr [rbp-0x8], ecx", 0, 0x7fd0);
        assert_eq!(i.dst.len(), 4);
        assert_eq!(i.dst[3], Parameter::Mem(0x7fd3));
    }

    #[test]
    fn lea_uses_registers_but_not_memory() {
        let i = lowered("lea rax, [rbx+rcx*2+0x10]", 0, 0);
        assert_eq!(i.src.len(), 16); // rbx and rcx, byte-expanded
        assert!(i.src.iter().all(|p| matches!(p, Parameter::Reg { .. })));
        assert_eq!(i.dst.len(), 8);
    }

    #[test]
    fn xchg_builds_two_independent_edges() {
        let i = lowered("xchg rax, rbx", 0, 0);
        // src/dst: rax <- rbx; src2/dst2: rbx <- rax.
        assert!(i.src.iter().all(|p| matches!(p, Parameter::Reg { reg: Register::Rbx, .. })));
        assert!(i.dst.iter().all(|p| matches!(p, Parameter::Reg { reg: Register::Rax, .. })));
        assert!(i.src2.iter().all(|p| matches!(p, Parameter::Reg { reg: Register::Rax, .. })));
        assert!(i.dst2.iter().all(|p| matches!(p, Parameter::Reg { reg: Register::Rbx, .. })));
    }

    #[test]
    fn alu_first_operand_is_both_source_and_destination() {
        let i = lowered("add rax, 0x20", 0, 0);
        assert_eq!(i.src.len(), 9); // the immediate plus rax's 8 bytes
        assert_eq!(i.dst.len(), 8);
    }

    #[test]
    fn three_operand_imul() {
        let i = lowered("imul rax, rbx, 0x4", 0, 0);
        assert_eq!(i.src.len(), 17);
        assert_eq!(i.dst.len(), 8);
        assert!(i.dst.iter().all(|p| matches!(p, Parameter::Reg { reg: Register::Rax, .. })));
    }

    #[test]
    fn skip_set_gets_no_parameters() {
        let mut insts = [inst("cmp rax, rbx", 0, 0), inst("jnz 0x401000", 0, 0)];
        build_parameters(&mut insts).unwrap();
        assert!(insts.iter().all(|i| i.src.is_empty() && i.dst.is_empty()));
    }

    #[test]
    fn untracked_registers_are_fatal() {
        let mut insts = [inst("mov rax, r8", 0, 0)];
        assert!(matches!(
            build_parameters(&mut insts),
            Err(DataflowError::UnknownRegister { .. })
        ));
    }

    #[test]
    fn parameter_ordering_is_kind_register_index() {
        let imm = Parameter::Imm(u64::MAX);
        let reg_lo = Parameter::Reg { reg: Register::Rax, byte: 7 };
        let reg_hi = Parameter::Reg { reg: Register::Rbx, byte: 0 };
        let mem = Parameter::Mem(0);
        assert!(imm < reg_lo && reg_lo < reg_hi && reg_hi < mem);
    }
}
