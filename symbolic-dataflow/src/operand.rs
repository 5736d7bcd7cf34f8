//! Decoding of disassembly operand strings.
//!
//! The decoder classifies each operand as an immediate, a register, or a
//! memory reference, and for memory references recognizes the seven
//! addressing schemas used throughout the analyses:
//!
//! | tag | schema                      |
//! |-----|-----------------------------|
//! | 1   | `disp`                      |
//! | 2   | `base`                      |
//! | 3   | `index*scale`               |
//! | 4   | `base ± disp`               |
//! | 5   | `base + index*scale`        |
//! | 6   | `index*scale ± disp`        |
//! | 7   | `base + index*scale ± disp` |
//!
//! Shapes the decoder cannot classify become [`Operand::Unknown`] rather
//! than an error; whether that is fatal depends on whether an analysis
//! later needs the operand's meaning.

use std::fmt;
use trace::register::{RegAccess, Register};

/// Sign applied to a memory displacement.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Sign {
    Plus,
    Minus,
}

impl Sign {
    /// Applies the sign to `disp` with two's-complement wrapping.
    #[inline]
    pub fn apply(self, base: u64, disp: u64) -> u64 {
        match self {
            Sign::Plus => base.wrapping_add(disp),
            Sign::Minus => base.wrapping_sub(disp),
        }
    }
}

impl fmt::Display for Sign {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Sign::Plus => "+",
            Sign::Minus => "-",
        })
    }
}

/// A decoded memory operand.
///
/// Which fields are populated follows the tag schema above: `base` is
/// present for tags 2, 4, 5 and 7; `index` and `scale` for tags 3, 5, 6
/// and 7; `disp` for tags 1, 4, 6 and 7. `rip` is accepted as a base
/// register for rip-relative references.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemOperand {
    pub tag: u8,
    pub base: Option<String>,
    pub index: Option<String>,
    pub scale: u64,
    pub sign: Sign,
    pub disp: u64,
    /// Access width in bits.
    pub width: u16,
    /// Segment register for `fs:[...]`-style references.
    pub segment: Option<String>,
}

impl MemOperand {
    /// Access width in bytes.
    #[inline]
    pub fn width_bytes(&self) -> u64 {
        u64::from(self.width) / 8
    }

    /// Computes the concrete effective address from a pre-execution
    /// register snapshot.
    ///
    /// Returns `None` when a base or index register is outside the
    /// tracked set (including `rip`, whose value is not part of the
    /// snapshot).
    pub fn effective_addr(&self, ctxreg: &[u64; Register::COUNT]) -> Option<u64> {
        let resolve = |name: &String| -> Option<u64> {
            let access = RegAccess::parse(name)?;
            Some(ctxreg[access.reg.index()])
        };
        let base = match &self.base {
            Some(name) => resolve(name)?,
            None => 0,
        };
        let scaled = match &self.index {
            Some(name) => resolve(name)?.wrapping_mul(self.scale),
            None => 0,
        };
        Some(self.sign.apply(base.wrapping_add(scaled), self.disp))
    }
}

impl fmt::Display for MemOperand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.width {
            8 => write!(f, "byte ptr ")?,
            16 => write!(f, "word ptr ")?,
            32 => write!(f, "dword ptr ")?,
            64 => write!(f, "qword ptr ")?,
            _ => {}
        }
        if let Some(segment) = &self.segment {
            write!(f, "{segment}:")?;
        }
        f.write_str("[")?;
        let mut leading = true;
        if let Some(base) = &self.base {
            write!(f, "{base}")?;
            leading = false;
        }
        if let Some(index) = &self.index {
            if !leading {
                f.write_str("+")?;
            }
            write!(f, "{index}*{}", self.scale)?;
            leading = false;
        }
        if self.tag == 1 || self.disp != 0 {
            match (leading, self.sign) {
                (true, Sign::Plus) => write!(f, "{:#x}", self.disp)?,
                _ => write!(f, "{}{:#x}", self.sign, self.disp)?,
            }
        }
        f.write_str("]")
    }
}

/// A decoded operand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operand {
    Imm { value: u64, width: u16 },
    Reg { name: String, width: u16 },
    Mem(MemOperand),
    Unknown { text: String },
}

impl Operand {
    /// Decodes one operand string.
    pub fn decode(text: &str) -> Self {
        let trimmed = text.trim();
        let lowered = trimmed.to_ascii_lowercase();

        let (width, rest) = strip_size_prefix(&lowered);
        let (segment, rest) = strip_segment_prefix(rest);

        if let Some(expr) = rest
            .strip_prefix('[')
            .and_then(|inner| inner.strip_suffix(']'))
        {
            return match decode_addr_expr(expr, width.unwrap_or(64), segment) {
                Some(mem) => Operand::Mem(mem),
                None => Operand::Unknown {
                    text: trimmed.to_owned(),
                },
            };
        }

        // Segment or size prefix without brackets is not a data operand.
        if segment.is_some() || width.is_some() {
            return Operand::Unknown {
                text: trimmed.to_owned(),
            };
        }

        if let Some(width) = register_width(rest) {
            return Operand::Reg {
                name: rest.to_owned(),
                width,
            };
        }

        if let Some(value) = parse_number(rest) {
            return Operand::Imm { value, width: 64 };
        }

        Operand::Unknown {
            text: trimmed.to_owned(),
        }
    }

    /// Width of the operand in bits, where one is known.
    pub fn width(&self) -> Option<u16> {
        match self {
            Operand::Imm { width, .. } | Operand::Reg { width, .. } => Some(*width),
            Operand::Mem(mem) => Some(mem.width),
            Operand::Unknown { .. } => None,
        }
    }

    pub fn is_imm(&self) -> bool {
        matches!(self, Operand::Imm { .. })
    }

    pub fn is_reg(&self) -> bool {
        matches!(self, Operand::Reg { .. })
    }

    pub fn is_mem(&self) -> bool {
        matches!(self, Operand::Mem(_))
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Imm { value, .. } => write!(f, "{value:#x}"),
            Operand::Reg { name, .. } => f.write_str(name),
            Operand::Mem(mem) => mem.fmt(f),
            Operand::Unknown { text } => f.write_str(text),
        }
    }
}

fn strip_size_prefix(text: &str) -> (Option<u16>, &str) {
    for (prefix, width) in [
        ("byte ptr", 8),
        ("word ptr", 16),
        ("dword ptr", 32),
        ("qword ptr", 64),
        ("xmmword ptr", 128),
        ("ymmword ptr", 256),
        ("zmmword ptr", 512),
    ] {
        if let Some(rest) = text.strip_prefix(prefix) {
            return (Some(width), rest.trim_start());
        }
    }
    (None, text)
}

fn strip_segment_prefix(text: &str) -> (Option<String>, &str) {
    for segment in ["cs", "ds", "es", "fs", "gs", "ss"] {
        if let Some(rest) = text.strip_prefix(segment) {
            if let Some(rest) = rest.trim_start().strip_prefix(':') {
                return (Some(segment.to_owned()), rest.trim_start());
            }
        }
    }
    (None, text)
}

/// One `±`-separated term of an addressing expression.
enum Term {
    Reg(String),
    Scaled(String, u64),
    Disp(u64),
}

fn decode_addr_expr(expr: &str, width: u16, segment: Option<String>) -> Option<MemOperand> {
    let compact: String = expr.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    if compact.is_empty() {
        return None;
    }

    let mut base = None;
    let mut index = None;
    let mut scale = 1u64;
    let mut sign = Sign::Plus;
    let mut disp = None;

    for (term_sign, term) in split_terms(&compact)? {
        match (decode_term(term)?, term_sign) {
            (Term::Disp(value), s) => {
                if disp.replace(value).is_some() {
                    return None;
                }
                sign = s;
            }
            // A subtracted register has no addressing encoding.
            (Term::Reg(_) | Term::Scaled(..), Sign::Minus) => return None,
            (Term::Scaled(name, n), Sign::Plus) => {
                if index.replace(name).is_some() {
                    return None;
                }
                scale = n;
            }
            (Term::Reg(name), Sign::Plus) => {
                if base.is_none() {
                    base = Some(name);
                } else if index.is_none() {
                    // Second bare register acts as an index with scale 1.
                    index = Some(name);
                } else {
                    return None;
                }
            }
        }
    }

    let tag = match (&base, &index, &disp) {
        (None, None, Some(_)) => 1,
        (Some(_), None, None) => 2,
        (None, Some(_), None) => 3,
        (Some(_), None, Some(_)) => 4,
        (Some(_), Some(_), None) => 5,
        (None, Some(_), Some(_)) => 6,
        (Some(_), Some(_), Some(_)) => 7,
        (None, None, None) => return None,
    };

    Some(MemOperand {
        tag,
        base,
        index,
        scale,
        sign,
        disp: disp.unwrap_or(0),
        width,
        segment,
    })
}

/// Splits `a+b-c` into signed terms. The leading term must be positive.
fn split_terms(expr: &str) -> Option<Vec<(Sign, &str)>> {
    let mut terms = Vec::new();
    let mut sign = Sign::Plus;
    let mut start = 0;
    for (at, c) in expr.char_indices() {
        if c != '+' && c != '-' {
            continue;
        }
        if at == start {
            // A leading sign only makes sense before a displacement.
            if at == 0 && c == '-' {
                sign = Sign::Minus;
                start = 1;
                continue;
            }
            return None;
        }
        terms.push((sign, &expr[start..at]));
        sign = if c == '+' { Sign::Plus } else { Sign::Minus };
        start = at + 1;
    }
    if start >= expr.len() {
        return None;
    }
    terms.push((sign, &expr[start..]));
    Some(terms)
}

fn decode_term(term: &str) -> Option<Term> {
    if let Some((lhs, rhs)) = term.split_once('*') {
        // reg*scale, with scale*reg tolerated.
        let (reg, scale) = if register_width(lhs).is_some() {
            (lhs, rhs)
        } else {
            (rhs, lhs)
        };
        register_width(reg)?;
        let scale = parse_number(scale)?;
        if !matches!(scale, 1 | 2 | 4 | 8) {
            return None;
        }
        return Some(Term::Scaled(reg.to_owned(), scale));
    }
    if register_width(term).is_some() {
        return Some(Term::Reg(term.to_owned()));
    }
    parse_number(term).map(Term::Disp)
}

/// Width in bits of a register name, or `None` if the name is not a
/// register.
///
/// Beyond the tracked GPR aliases this recognizes `r8`..`r15` and their
/// sub-names, `rip`, and the vector/FPU/segment register families; those
/// are preserved through decoding but carry no symbolic semantics.
pub fn register_width(name: &str) -> Option<u16> {
    if let Some(access) = RegAccess::parse(name) {
        return Some(access.bits());
    }
    if name == "rip" {
        return Some(64);
    }
    if let Some(rest) = name.strip_prefix('r') {
        let (digits, suffix) = match rest.as_bytes().last() {
            Some(b'd') => (&rest[..rest.len() - 1], 32),
            Some(b'w') => (&rest[..rest.len() - 1], 16),
            Some(b'b') => (&rest[..rest.len() - 1], 8),
            _ => (rest, 64),
        };
        if let Ok(n) = digits.parse::<u8>() {
            if (8..=15).contains(&n) {
                return Some(suffix);
            }
        }
    }
    for (prefix, width) in [("xmm", 128), ("ymm", 256), ("zmm", 512)] {
        if let Some(digits) = name.strip_prefix(prefix) {
            if digits.parse::<u8>().map_or(false, |n| n < 32) {
                return Some(width);
            }
        }
    }
    if let Some(digits) = name.strip_prefix("st") {
        if digits.parse::<u8>().map_or(false, |n| n < 8) {
            return Some(80);
        }
    }
    if matches!(name, "cs" | "ds" | "es" | "fs" | "gs" | "ss") {
        return Some(16);
    }
    None
}

fn parse_number(text: &str) -> Option<u64> {
    if let Some(digits) = text.strip_prefix("0x") {
        return u64::from_str_radix(digits, 16).ok();
    }
    if !text.is_empty() && text.bytes().all(|b| b.is_ascii_digit()) {
        return text.parse().ok();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mem(text: &str) -> MemOperand {
        match Operand::decode(text) {
            Operand::Mem(mem) => mem,
            other => panic!("expected memory operand for `{text}`, got {other:?}"),
        }
    }

    #[test]
    fn data_operands() {
        assert_eq!(
            Operand::decode("rax"),
            Operand::Reg {
                name: "rax".into(),
                width: 64
            }
        );
        assert_eq!(
            Operand::decode(" AH "),
            Operand::Reg {
                name: "ah".into(),
                width: 8
            }
        );
        assert_eq!(
            Operand::decode("0xFF"),
            Operand::Imm {
                value: 0xff,
                width: 64
            }
        );
        assert!(matches!(
            Operand::decode("xmm3"),
            Operand::Reg { width: 128, .. }
        ));
        assert!(matches!(Operand::decode("r9d"), Operand::Reg { width: 32, .. }));
        assert!(matches!(Operand::decode("??"), Operand::Unknown { .. }));
    }

    #[test]
    fn all_seven_tags() {
        assert_eq!(mem("[0x1000]").tag, 1);
        assert_eq!(mem("[rax]").tag, 2);
        assert_eq!(mem("[rbx*4]").tag, 3);
        assert_eq!(mem("[rax+0x10]").tag, 4);
        assert_eq!(mem("[rax - 0x10]").tag, 4);
        assert_eq!(mem("[rax+rbx*2]").tag, 5);
        assert_eq!(mem("[rbx*8-0x4]").tag, 6);
        assert_eq!(mem("[rax+rbx*2+0x10]").tag, 7);
    }

    #[test]
    fn tag_fields_follow_schema() {
        let m = mem("qword ptr [rax+rcx*4-0x18]");
        assert_eq!(m.tag, 7);
        assert_eq!(m.base.as_deref(), Some("rax"));
        assert_eq!(m.index.as_deref(), Some("rcx"));
        assert_eq!(m.scale, 4);
        assert_eq!(m.sign, Sign::Minus);
        assert_eq!(m.disp, 0x18);
        assert_eq!(m.width, 64);

        let m = mem("dword ptr [rbp-0x8]");
        assert_eq!((m.tag, m.width), (4, 32));
        assert_eq!(m.sign, Sign::Minus);
    }

    #[test]
    fn bare_register_pair_is_scale_one_index() {
        let m = mem("[rax+rbx]");
        assert_eq!(m.tag, 5);
        assert_eq!(m.index.as_deref(), Some("rbx"));
        assert_eq!(m.scale, 1);
    }

    #[test]
    fn segment_prefix_is_preserved() {
        let m = mem("fs:[0x28]");
        assert_eq!(m.tag, 1);
        assert_eq!(m.segment.as_deref(), Some("fs"));
    }

    #[test]
    fn rejects_bad_scales_and_shapes() {
        assert!(matches!(
            Operand::decode("[rax+rbx*3]"),
            Operand::Unknown { .. }
        ));
        assert!(matches!(Operand::decode("[rax-rbx]"), Operand::Unknown { .. }));
        assert!(matches!(Operand::decode("[]"), Operand::Unknown { .. }));
    }

    #[test]
    fn render_then_decode_is_stable() {
        for text in [
            "[0x1000]",
            "[rax]",
            "[rbx*4]",
            "byte ptr [rax+0x10]",
            "[rbp-0x20]",
            "[rax+rbx*2]",
            "[rbx*8-0x4]",
            "qword ptr [rax+rcx*4+0x18]",
            "fs:[0x28]",
        ] {
            let first = Operand::decode(text);
            let again = Operand::decode(&first.to_string());
            assert_eq!(first, again, "round trip failed for `{text}`");
        }
    }

    #[test]
    fn effective_addr_uses_snapshot() {
        let mut ctx = [0u64; 8];
        ctx[Register::Rax.index()] = 0x1000;
        ctx[Register::Rcx.index()] = 0x10;

        assert_eq!(mem("[rax+rcx*4-0x8]").effective_addr(&ctx), Some(0x1038));
        assert_eq!(mem("[0x2000]").effective_addr(&ctx), Some(0x2000));
        // rip is not part of the snapshot.
        assert_eq!(mem("[rip+0x100]").effective_addr(&ctx), None);
    }
}
