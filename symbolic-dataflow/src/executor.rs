//! The symbolic execution engine.
//!
//! [`SymExecutor`] owns the expression arena, the register file and the
//! symbolic memory for one run. Stepping an instruction reads its
//! operands into values, dispatches on the mnemonic to build a new
//! operation node, and writes the result back; effects commit in trace
//! order. Memory effective addresses come from the trace record (or the
//! decode-time derivation from the register snapshot), never from
//! re-evaluating symbolic state.

use crate::error::DataflowError;
use crate::expr::{ExprArena, Formula, OpKind, UnboundSymbol, ValueId};
use crate::inst::{is_no_effect, Instruction};
use crate::memory::MemoryMap;
use crate::operand::{MemOperand, Operand, Sign};
use crate::regfile::RegisterFile;
use hashbrown::HashMap;
use tracing::{debug, trace};

use crate::address::AddrRange;
use trace::register::{RegAccess, Register};

/// Where an input symbol came from.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum InputOrigin {
    /// Initial contents of a register.
    Register(Register),
    /// First read of an untracked memory range.
    Memory(AddrRange),
}

impl std::fmt::Display for InputOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InputOrigin::Register(reg) => write!(f, "{reg}"),
            InputOrigin::Memory(range) => write!(f, "{range}"),
        }
    }
}

/// Symbolic executor over a decoded instruction sequence.
pub struct SymExecutor {
    arena: ExprArena,
    regs: RegisterFile,
    mem: MemoryMap,
    reg_inputs: Vec<(ValueId, Register)>,
}

impl SymExecutor {
    /// Creates an executor with every register initialized to a fresh
    /// 64-bit input symbol.
    pub fn new() -> Self {
        let mut arena = ExprArena::new();
        let mut reg_inputs = Vec::with_capacity(Register::COUNT);
        let slots = Register::ALL.map(|reg| {
            let symbol = arena.symbol(64);
            reg_inputs.push((symbol, reg));
            symbol
        });
        Self {
            arena,
            regs: RegisterFile::new(slots),
            mem: MemoryMap::new(),
            reg_inputs,
        }
    }

    /// Executes the whole sequence in order.
    pub fn run(&mut self, insts: &[Instruction]) -> Result<(), DataflowError> {
        for inst in insts {
            self.step(inst)?;
        }
        Ok(())
    }

    /// Executes one instruction.
    pub fn step(&mut self, inst: &Instruction) -> Result<(), DataflowError> {
        let mnemonic = inst.mnemonic();
        if is_no_effect(mnemonic) {
            return Ok(());
        }
        trace!(id = inst.id, mnemonic, "step");

        match inst.operands.as_slice() {
            [] => Ok(()),
            [op0] => match mnemonic {
                "push" => self.push(inst, op0),
                "pop" => self.pop(inst, op0),
                _ => self.unary(inst, op0),
            },
            [op0, op1] => match mnemonic {
                "mov" => self.mov(inst, op0, op1),
                "lea" => self.lea(inst, op0, op1),
                "xchg" => self.xchg(inst, op0, op1),
                _ => self.alu2(inst, op0, op1),
            },
            [op0, op1, op2] => self.imul3(inst, op0, op1, op2),
            _ => Err(self.arity(inst)),
        }
    }

    fn push(&mut self, inst: &Instruction, op0: &Operand) -> Result<(), DataflowError> {
        match op0 {
            Operand::Imm { value, .. } => {
                let v = self.arena.constant(*value);
                // A 64-bit push stores eight bytes regardless of how
                // the immediate was written.
                self.write_mem(inst, inst.waddr, 8, v)
            }
            Operand::Reg { name, width } => {
                let v = self.read_reg(inst, name)?;
                self.write_mem(inst, inst.waddr, u64::from(*width) / 8, v)
            }
            Operand::Mem(mem) => {
                let v = self.read_mem(inst, inst.raddr, mem.width_bytes())?;
                self.write_mem(inst, inst.waddr, mem.width_bytes(), v)
            }
            Operand::Unknown { .. } => Err(self.unknown_operand(inst, op0)),
        }
    }

    fn pop(&mut self, inst: &Instruction, op0: &Operand) -> Result<(), DataflowError> {
        match op0 {
            Operand::Reg { name, width } => {
                let v = self.read_mem(inst, inst.raddr, u64::from(*width) / 8)?;
                self.write_reg(inst, name, v)
            }
            Operand::Mem(mem) => {
                let v = self.read_mem(inst, inst.raddr, mem.width_bytes())?;
                self.write_mem(inst, inst.waddr, mem.width_bytes(), v)
            }
            _ => Err(self.unknown_operand(inst, op0)),
        }
    }

    fn unary(&mut self, inst: &Instruction, op0: &Operand) -> Result<(), DataflowError> {
        let kind = match OpKind::from_mnemonic(inst.mnemonic()) {
            Some(kind) if kind.arity() == 1 => kind,
            _ => return Err(self.unknown_mnemonic(inst)),
        };
        match op0 {
            Operand::Reg { name, .. } => {
                let v = self.read_reg(inst, name)?;
                let res = self.arena.op1(kind, v);
                self.write_reg(inst, name, res)
            }
            Operand::Mem(mem) => {
                let v = self.read_mem(inst, inst.raddr, mem.width_bytes())?;
                let res = self.arena.op1(kind, v);
                self.write_mem(inst, inst.waddr, mem.width_bytes(), res)
            }
            _ => Err(self.unknown_operand(inst, op0)),
        }
    }

    fn mov(&mut self, inst: &Instruction, op0: &Operand, op1: &Operand) -> Result<(), DataflowError> {
        let value = match op1 {
            Operand::Imm { value, .. } => self.arena.constant(*value),
            Operand::Reg { name, .. } => self.read_reg(inst, name)?,
            Operand::Mem(mem) => self.read_mem(inst, inst.raddr, mem.width_bytes())?,
            Operand::Unknown { .. } => return Err(self.unknown_operand(inst, op1)),
        };
        match op0 {
            Operand::Reg { name, .. } => self.write_reg(inst, name, value),
            Operand::Mem(mem) if !op1.is_mem() => {
                self.write_mem(inst, inst.waddr, mem.width_bytes(), value)
            }
            _ => Err(self.unknown_operand(inst, op0)),
        }
    }

    /// `lea` evaluates the addressing expression symbolically; it is
    /// the one instruction whose "memory" operand touches no memory.
    fn lea(&mut self, inst: &Instruction, op0: &Operand, op1: &Operand) -> Result<(), DataflowError> {
        let (Operand::Reg { name: dst, .. }, Operand::Mem(mem)) = (op0, op1) else {
            return Err(self.arity(inst));
        };
        let res = self.addr_expr(inst, mem)?;
        self.write_reg(inst, dst, res)
    }

    fn addr_expr(&mut self, inst: &Instruction, mem: &MemOperand) -> Result<ValueId, DataflowError> {
        let base = match &mem.base {
            Some(name) => Some(self.read_reg(inst, name)?),
            None => None,
        };
        let index = match &mem.index {
            Some(name) => {
                let reg = self.read_reg(inst, name)?;
                let scale = self.arena.constant(mem.scale);
                Some(self.arena.op2(OpKind::Imul, reg, scale))
            }
            None => None,
        };
        let regs = match (base, index) {
            (Some(base), Some(index)) => Some(self.arena.op2(OpKind::Add, base, index)),
            (Some(one), None) | (None, Some(one)) => Some(one),
            (None, None) => None,
        };
        let op = match mem.sign {
            Sign::Plus => OpKind::Add,
            Sign::Minus => OpKind::Sub,
        };
        Ok(match (regs, mem.disp) {
            (None, disp) => self.arena.constant(disp),
            (Some(regs), 0) if mem.tag != 1 && mem.tag != 4 && mem.tag != 6 && mem.tag != 7 => regs,
            (Some(regs), disp) => {
                let disp = self.arena.constant(disp);
                self.arena.op2(op, regs, disp)
            }
        })
    }

    fn xchg(&mut self, inst: &Instruction, op0: &Operand, op1: &Operand) -> Result<(), DataflowError> {
        match (op0, op1) {
            (Operand::Reg { name: n0, .. }, Operand::Reg { name: n1, .. }) => {
                let v0 = self.read_reg(inst, n0)?;
                let v1 = self.read_reg(inst, n1)?;
                self.write_reg(inst, n1, v0)?;
                self.write_reg(inst, n0, v1)
            }
            (Operand::Mem(mem), Operand::Reg { name, .. }) => {
                let v0 = self.read_mem(inst, inst.raddr, mem.width_bytes())?;
                let v1 = self.read_reg(inst, name)?;
                self.write_reg(inst, name, v0)?;
                self.write_mem(inst, inst.waddr, mem.width_bytes(), v1)
            }
            (Operand::Reg { name, .. }, Operand::Mem(mem)) => {
                let v0 = self.read_reg(inst, name)?;
                let v1 = self.read_mem(inst, inst.raddr, mem.width_bytes())?;
                self.write_reg(inst, name, v1)?;
                self.write_mem(inst, inst.waddr, mem.width_bytes(), v0)
            }
            _ => Err(self.unknown_operand(inst, op0)),
        }
    }

    fn alu2(&mut self, inst: &Instruction, op0: &Operand, op1: &Operand) -> Result<(), DataflowError> {
        let kind = match OpKind::from_mnemonic(inst.mnemonic()) {
            Some(kind) if kind.arity() == 2 => kind,
            _ => return Err(self.unknown_mnemonic(inst)),
        };
        let rhs = match op1 {
            Operand::Imm { value, .. } => self.arena.constant(*value),
            Operand::Reg { name, .. } => self.read_reg(inst, name)?,
            Operand::Mem(mem) => self.read_mem(inst, inst.raddr, mem.width_bytes())?,
            Operand::Unknown { .. } => return Err(self.unknown_operand(inst, op1)),
        };
        match op0 {
            Operand::Reg { name, .. } => {
                let lhs = self.read_reg(inst, name)?;
                let res = self.arena.op2(kind, lhs, rhs);
                self.write_reg(inst, name, res)
            }
            Operand::Mem(mem) => {
                let lhs = self.read_mem(inst, inst.raddr, mem.width_bytes())?;
                let res = self.arena.op2(kind, lhs, rhs);
                self.write_mem(inst, inst.waddr, mem.width_bytes(), res)
            }
            _ => Err(self.unknown_operand(inst, op0)),
        }
    }

    fn imul3(
        &mut self,
        inst: &Instruction,
        op0: &Operand,
        op1: &Operand,
        op2: &Operand,
    ) -> Result<(), DataflowError> {
        let ("imul", Operand::Reg { name: dst, .. }, Operand::Reg { name: lhs, .. }, Operand::Imm { value, .. }) =
            (inst.mnemonic(), op0, op1, op2)
        else {
            return Err(self.arity(inst));
        };
        let lhs = self.read_reg(inst, lhs)?;
        let rhs = self.arena.constant(*value);
        let res = self.arena.op2(OpKind::Imul, lhs, rhs);
        self.write_reg(inst, dst, res)
    }

    fn read_reg(&mut self, inst: &Instruction, name: &str) -> Result<ValueId, DataflowError> {
        let access = RegAccess::parse(name).ok_or_else(|| DataflowError::UnknownRegister {
            id: inst.id,
            name: name.to_owned(),
        })?;
        Ok(self.regs.read(&mut self.arena, access))
    }

    fn write_reg(&mut self, inst: &Instruction, name: &str, value: ValueId) -> Result<(), DataflowError> {
        let access = RegAccess::parse(name).ok_or_else(|| DataflowError::UnknownRegister {
            id: inst.id,
            name: name.to_owned(),
        })?;
        self.regs.write(&mut self.arena, access, value);
        Ok(())
    }

    fn read_mem(
        &mut self,
        inst: &Instruction,
        addr: Option<u64>,
        nbytes: u64,
    ) -> Result<ValueId, DataflowError> {
        let addr = addr.ok_or(DataflowError::MissingEffectiveAddress { id: inst.id })?;
        self.mem
            .read(&mut self.arena, addr, nbytes)
            .map_err(|overlap| DataflowError::UnsupportedMemoryAliasing {
                id: inst.id,
                range: overlap.range,
                existing: overlap.existing,
            })
    }

    fn write_mem(
        &mut self,
        inst: &Instruction,
        addr: Option<u64>,
        nbytes: u64,
        value: ValueId,
    ) -> Result<(), DataflowError> {
        let addr = addr.ok_or(DataflowError::MissingEffectiveAddress { id: inst.id })?;
        self.mem
            .write(&mut self.arena, addr, nbytes, value)
            .map_err(|overlap| DataflowError::UnsupportedMemoryAliasing {
                id: inst.id,
                range: overlap.range,
                existing: overlap.existing,
            })
    }

    fn unknown_mnemonic(&self, inst: &Instruction) -> DataflowError {
        DataflowError::UnknownMnemonic {
            id: inst.id,
            mnemonic: inst.mnemonic().to_owned(),
        }
    }

    fn unknown_operand(&self, inst: &Instruction, operand: &Operand) -> DataflowError {
        DataflowError::UnknownOperand {
            id: inst.id,
            text: operand.to_string(),
        }
    }

    fn arity(&self, inst: &Instruction) -> DataflowError {
        DataflowError::ArityMismatch {
            id: inst.id,
            mnemonic: inst.mnemonic().to_owned(),
            found: inst.operands.len(),
        }
    }

    /// The expression arena of this run.
    pub fn arena(&self) -> &ExprArena {
        &self.arena
    }

    /// Final value of a full 64-bit register.
    pub fn register(&self, reg: Register) -> ValueId {
        self.regs.get(reg)
    }

    /// Renders a register's final formula.
    pub fn formula(&self, reg: Register) -> Formula<'_> {
        self.arena.display(self.register(reg))
    }

    /// Input symbols seeded for the initial register contents.
    pub fn register_inputs(&self) -> &[(ValueId, Register)] {
        &self.reg_inputs
    }

    /// Input symbols allocated for reads of untracked memory.
    pub fn memory_inputs(&self) -> &[(ValueId, AddrRange)] {
        self.mem.inputs()
    }

    /// Tracked memory state, in address order.
    pub fn memory(&self) -> impl Iterator<Item = (AddrRange, ValueId)> + '_ {
        self.mem.iter()
    }

    /// Identifies what an input symbol stands for.
    pub fn input_origin(&self, id: ValueId) -> Option<InputOrigin> {
        if let Some(&(_, reg)) = self.reg_inputs.iter().find(|&&(sym, _)| sym == id) {
            return Some(InputOrigin::Register(reg));
        }
        self.mem
            .inputs()
            .iter()
            .find(|&&(sym, _)| sym == id)
            .map(|&(_, range)| InputOrigin::Memory(range))
    }

    /// All register and memory values that were derived by at least one
    /// operation: the run's outputs.
    pub fn outputs(&self) -> Vec<ValueId> {
        let mut outputs: Vec<ValueId> = Register::ALL
            .iter()
            .map(|&reg| self.regs.get(reg))
            .filter(|&id| self.arena.get(id).op().is_some())
            .collect();
        outputs.extend(
            self.mem
                .iter()
                .map(|(_, id)| id)
                .filter(|&id| self.arena.get(id).op().is_some()),
        );
        outputs
    }

    /// Evaluates a value under a concrete assignment of input symbols.
    ///
    /// Every input symbol the value depends on must be assigned.
    pub fn evaluate(
        &self,
        id: ValueId,
        inputs: &HashMap<ValueId, u64>,
    ) -> Result<u64, UnboundSymbol> {
        let result = self.arena.evaluate(id, inputs);
        if let Err(UnboundSymbol(sym)) = &result {
            debug!(%sym, "evaluation aborted on unbound input");
        }
        result
    }
}

impl Default for SymExecutor {
    fn default() -> Self {
        Self::new()
    }
}
