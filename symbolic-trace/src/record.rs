//! Parsing and emission of individual trace records.
//!
//! # Format
//!
//! One record per line:
//!
//! `<addr>;<disassembly>;<rax>,<rbx>,<rcx>,<rdx>,<rsi>,<rdi>,<rsp>,<rbp>,<raddr>,<waddr>`
//!
//! All ten register and effective-address fields are lowercase
//! hexadecimal without a `0x` prefix. The disassembly is the mnemonic
//! followed by a comma-separated operand list; spaces around the commas
//! are permitted. An instruction that performed no memory read (or
//! write) records `0` — or, in the extended tracer variant,
//! `ffffffffffffffff` — in the corresponding field.

use crate::register::Register;
use crate::Hex;
use std::fmt;

/// Sentinel written by the extended tracer for an absent memory access.
pub const NO_ACCESS_SENTINEL: u64 = u64::MAX;

/// Ways a single trace line can be malformed.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RecordError {
    #[error("missing `{0}` field")]
    MissingField(&'static str),

    #[error("invalid hex value `{0}`")]
    BadHex(String),

    #[error("empty disassembly")]
    EmptyDisassembly,
}

/// A malformed trace line, tagged with its 1-based line number.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("trace line {line}: {source}")]
pub struct ParseError {
    pub line: u64,
    #[source]
    pub source: RecordError,
}

/// One executed instruction as captured by the tracer.
///
/// Records are passive: once parsed they are never mutated. Downstream
/// analyses derive their own structures from the operand strings and the
/// context snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceRecord {
    addr: u64,
    disassembly: String,
    mnemonic: String,
    operands: Vec<String>,
    ctxreg: [u64; Register::COUNT],
    raddr: u64,
    waddr: u64,
}

impl TraceRecord {
    /// Builds a record from its parts. Primarily useful for tests and
    /// for tools that synthesize traces.
    pub fn new(
        addr: u64,
        disassembly: impl Into<String>,
        ctxreg: [u64; Register::COUNT],
        raddr: u64,
        waddr: u64,
    ) -> Self {
        let disassembly = disassembly.into();
        let (mnemonic, operands) = split_disassembly(&disassembly);
        Self {
            addr,
            disassembly,
            mnemonic,
            operands,
            ctxreg,
            raddr,
            waddr,
        }
    }

    /// Parses one trace line.
    pub fn parse(line: &str) -> Result<Self, RecordError> {
        let mut fields = line.trim_end().splitn(3, ';');

        let addr = fields.next().ok_or(RecordError::MissingField("addr"))?;
        let addr = parse_hex(addr)?;

        let disassembly = fields
            .next()
            .ok_or(RecordError::MissingField("disassembly"))?
            .trim();
        if disassembly.is_empty() {
            return Err(RecordError::EmptyDisassembly);
        }
        let (mnemonic, operands) = split_disassembly(disassembly);

        let tail = fields.next().ok_or(RecordError::MissingField("ctxreg"))?;
        let mut values = tail.split(',');

        let mut ctxreg = [0u64; Register::COUNT];
        for (slot, reg) in ctxreg.iter_mut().zip(Register::ALL) {
            let field = values
                .next()
                .ok_or(RecordError::MissingField(reg.name()))?;
            *slot = parse_hex(field)?;
        }
        let raddr = parse_hex(values.next().ok_or(RecordError::MissingField("raddr"))?)?;
        let waddr = parse_hex(values.next().ok_or(RecordError::MissingField("waddr"))?)?;

        Ok(Self {
            addr,
            disassembly: disassembly.to_owned(),
            mnemonic,
            operands,
            ctxreg,
            raddr,
            waddr,
        })
    }

    /// Address of the executed instruction.
    pub fn addr(&self) -> u64 {
        self.addr
    }

    /// Full disassembly text as recorded.
    pub fn disassembly(&self) -> &str {
        &self.disassembly
    }

    /// Lowercased instruction mnemonic.
    pub fn mnemonic(&self) -> &str {
        &self.mnemonic
    }

    /// Raw operand strings, in disassembly order.
    pub fn operands(&self) -> &[String] {
        &self.operands
    }

    /// The pre-execution register snapshot, in context order.
    pub fn ctxreg(&self) -> &[u64; Register::COUNT] {
        &self.ctxreg
    }

    /// The pre-execution value of one register.
    #[inline]
    pub fn ctxreg_of(&self, reg: Register) -> u64 {
        self.ctxreg[reg.index()]
    }

    /// Effective address of the instruction's memory read, if it
    /// performed one.
    pub fn read_addr(&self) -> Option<u64> {
        filter_access(self.raddr)
    }

    /// Effective address of the instruction's memory write, if it
    /// performed one.
    pub fn write_addr(&self) -> Option<u64> {
        filter_access(self.waddr)
    }

    /// Writes the record back out in the trace line format.
    pub fn emit(&self, out: &mut String) {
        use fmt::Write;
        // Infallible for String.
        let _ = write!(out, "{};{};", Hex(self.addr), self.disassembly);
        for value in self.ctxreg {
            let _ = write!(out, "{},", Hex(value));
        }
        let _ = write!(out, "{},{}", Hex(self.raddr), Hex(self.waddr));
    }
}

impl fmt::Display for TraceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut line = String::new();
        self.emit(&mut line);
        f.write_str(&line)
    }
}

fn filter_access(addr: u64) -> Option<u64> {
    match addr {
        0 | NO_ACCESS_SENTINEL => None,
        addr => Some(addr),
    }
}

fn parse_hex(field: &str) -> Result<u64, RecordError> {
    let field = field.trim();
    let digits = field.strip_prefix("0x").unwrap_or(field);
    u64::from_str_radix(digits, 16).map_err(|_| RecordError::BadHex(field.to_owned()))
}

/// Splits a disassembly string into its mnemonic and operand texts.
///
/// The mnemonic is everything up to the first space; operands are split
/// on commas with surrounding whitespace removed. Empty pieces (from a
/// trailing comma) are dropped.
fn split_disassembly(disassembly: &str) -> (String, Vec<String>) {
    let disassembly = disassembly.trim();
    match disassembly.split_once(' ') {
        None => (disassembly.to_ascii_lowercase(), Vec::new()),
        Some((mnemonic, rest)) => {
            let operands = rest
                .split(',')
                .map(str::trim)
                .filter(|text| !text.is_empty())
                .map(str::to_owned)
                .collect();
            (mnemonic.to_ascii_lowercase(), operands)
        }
    }
}
