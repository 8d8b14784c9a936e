//! The decoded-instruction data model.
//!
//! Instructions in the graph are the *output* of an x86 decoder: an opcode,
//! typed operand descriptors, prefix flags, the encoded bytes, and the
//! references carried by immediate/displacement fields. The graph never
//! re-derives any of this from raw bytes; the assembler
//! ([`crate::asm`]) produces the same representation for synthesized
//! instructions so transformed and original code are indistinguishable to
//! downstream consumers.

use core::fmt;

use bitflags::bitflags;
use smallvec::SmallVec;

use crate::entities::{BasicBlock, Block};
use crate::graph::RefKind;
use crate::reg::{Gpr, Seg};
use crate::source::SourceRange;

bitflags! {
    /// Instruction prefixes relevant to the graph.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Prefixes: u8 {
        /// `REP`/`REPZ` (F3).
        const REPZ = 1 << 0;
        /// `REPNZ` (F2).
        const REPNZ = 1 << 1;
    }
}

bitflags! {
    /// The arithmetic EFLAGS bits tracked by liveness analysis.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct EFlags: u8 {
        const CF = 1 << 0;
        const PF = 1 << 1;
        const AF = 1 << 2;
        const ZF = 1 << 3;
        const SF = 1 << 4;
        const OF = 1 << 5;
    }
}

impl EFlags {
    /// All arithmetic flags.
    pub const ARITH: EFlags = EFlags::all();
}

/// The mnemonic set the graph understands.
///
/// This covers the instructions the instrumentation pass has to reason
/// about: plain data movement, the ALU operations that define flags, the
/// string operations with their own probe ABI, the wide SSE/AVX and FPU
/// loads, and the access-exempt cache-control instructions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Opcode {
    Mov,
    Lea,
    Push,
    Pop,
    Xchg,
    Add,
    Adc,
    Sub,
    Sbb,
    And,
    Or,
    Xor,
    Cmp,
    Test,
    Inc,
    Dec,
    Neg,
    Not,
    Imul,
    Shl,
    Shr,
    Sar,
    Call,
    Ret,
    Jmp,
    Je,
    Jne,
    Leave,
    Nop,
    Pushfd,
    Popfd,
    Movs,
    Stos,
    Lods,
    Cmps,
    Fld,
    Fstp,
    Movq,
    Movdqa,
    Vmovdqa,
    Clflush,
    Prefetch,
    Prefetchnta,
    Prefetcht0,
    Prefetcht1,
    Prefetcht2,
    Prefetchw,
}

impl Opcode {
    /// The lower-case mnemonic text.
    pub fn mnemonic(self) -> &'static str {
        match self {
            Opcode::Mov => "mov",
            Opcode::Lea => "lea",
            Opcode::Push => "push",
            Opcode::Pop => "pop",
            Opcode::Xchg => "xchg",
            Opcode::Add => "add",
            Opcode::Adc => "adc",
            Opcode::Sub => "sub",
            Opcode::Sbb => "sbb",
            Opcode::And => "and",
            Opcode::Or => "or",
            Opcode::Xor => "xor",
            Opcode::Cmp => "cmp",
            Opcode::Test => "test",
            Opcode::Inc => "inc",
            Opcode::Dec => "dec",
            Opcode::Neg => "neg",
            Opcode::Not => "not",
            Opcode::Imul => "imul",
            Opcode::Shl => "shl",
            Opcode::Shr => "shr",
            Opcode::Sar => "sar",
            Opcode::Call => "call",
            Opcode::Ret => "ret",
            Opcode::Jmp => "jmp",
            Opcode::Je => "je",
            Opcode::Jne => "jne",
            Opcode::Leave => "leave",
            Opcode::Nop => "nop",
            Opcode::Pushfd => "pushfd",
            Opcode::Popfd => "popfd",
            Opcode::Movs => "movs",
            Opcode::Stos => "stos",
            Opcode::Lods => "lods",
            Opcode::Cmps => "cmps",
            Opcode::Fld => "fld",
            Opcode::Fstp => "fstp",
            Opcode::Movq => "movq",
            Opcode::Movdqa => "movdqa",
            Opcode::Vmovdqa => "vmovdqa",
            Opcode::Clflush => "clflush",
            Opcode::Prefetch => "prefetch",
            Opcode::Prefetchnta => "prefetchnta",
            Opcode::Prefetcht0 => "prefetcht0",
            Opcode::Prefetcht1 => "prefetcht1",
            Opcode::Prefetcht2 => "prefetcht2",
            Opcode::Prefetchw => "prefetchw",
        }
    }

    /// Decoder-recognized no-op.
    pub fn is_nop(self) -> bool {
        self == Opcode::Nop
    }

    /// One of the string instructions with implicit `ESI`/`EDI` operands.
    pub fn is_string(self) -> bool {
        matches!(
            self,
            Opcode::Movs | Opcode::Stos | Opcode::Lods | Opcode::Cmps
        )
    }

    /// Any of the prefetch family.
    pub fn is_prefetch(self) -> bool {
        matches!(
            self,
            Opcode::Prefetch
                | Opcode::Prefetchnta
                | Opcode::Prefetcht0
                | Opcode::Prefetcht1
                | Opcode::Prefetcht2
                | Opcode::Prefetchw
        )
    }

    /// Does this instruction write its first operand?
    pub fn writes_dest(self) -> bool {
        matches!(
            self,
            Opcode::Mov
                | Opcode::Lea
                | Opcode::Pop
                | Opcode::Xchg
                | Opcode::Add
                | Opcode::Adc
                | Opcode::Sub
                | Opcode::Sbb
                | Opcode::And
                | Opcode::Or
                | Opcode::Xor
                | Opcode::Inc
                | Opcode::Dec
                | Opcode::Neg
                | Opcode::Not
                | Opcode::Imul
                | Opcode::Shl
                | Opcode::Shr
                | Opcode::Sar
                | Opcode::Fstp
                | Opcode::Movq
                | Opcode::Movdqa
                | Opcode::Vmovdqa
                | Opcode::Movs
                | Opcode::Stos
        )
    }

    /// Arithmetic flags defined (written) by this opcode.
    pub fn flags_defined(self) -> EFlags {
        match self {
            Opcode::Add
            | Opcode::Adc
            | Opcode::Sub
            | Opcode::Sbb
            | Opcode::And
            | Opcode::Or
            | Opcode::Xor
            | Opcode::Cmp
            | Opcode::Test
            | Opcode::Neg
            | Opcode::Imul
            | Opcode::Cmps
            | Opcode::Shl
            | Opcode::Shr
            | Opcode::Sar
            | Opcode::Popfd => EFlags::ARITH,
            // INC/DEC preserve CF.
            Opcode::Inc | Opcode::Dec => EFlags::ARITH.difference(EFlags::CF),
            _ => EFlags::empty(),
        }
    }

    /// Arithmetic flags read by this opcode.
    ///
    /// Shifts pass the flags through untouched when the count is zero, so
    /// they are treated as readers as well as writers.
    pub fn flags_used(self) -> EFlags {
        match self {
            Opcode::Adc | Opcode::Sbb => EFlags::CF,
            Opcode::Je | Opcode::Jne => EFlags::ZF,
            Opcode::Shl | Opcode::Shr | Opcode::Sar => EFlags::ARITH,
            Opcode::Pushfd => EFlags::ARITH,
            Opcode::Call => EFlags::ARITH,
            _ => EFlags::empty(),
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.mnemonic())
    }
}

/// The scaling factor for the index register of a complex memory operand.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Scale {
    One,
    Two,
    Four,
    Eight,
}

impl Scale {
    /// The hardware encoding of this scale (the SIB `ss` field).
    pub fn enc(self) -> u8 {
        match self {
            Scale::One => 0b00,
            Scale::Two => 0b01,
            Scale::Four => 0b10,
            Scale::Eight => 0b11,
        }
    }

    /// The multiplier value.
    pub fn bytes(self) -> u8 {
        1 << self.enc()
    }
}

/// What a reference inside an instruction points at.
///
/// Before decomposition all targets are graph blocks; decomposition
/// retargets intra-block references at the basic blocks it creates, and
/// the block builder turns them back into block-relative references.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RefTarget {
    /// A block in the graph.
    Block(Block),
    /// A basic block of the subgraph currently being transformed.
    BasicBlock(BasicBlock),
}

/// A displacement field, possibly carrying a reference.
///
/// When `target` is present, `value` doubles as the offset into the target;
/// adjusting the displacement adjusts the offset and preserves the
/// reference.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Displacement {
    pub value: i32,
    pub target: Option<RefTarget>,
}

impl Displacement {
    /// A plain displacement with no reference.
    pub fn imm(value: i32) -> Self {
        Self {
            value,
            target: None,
        }
    }

    /// A displacement referring to `target` at `offset`.
    pub fn to_target(target: RefTarget, offset: i32) -> Self {
        Self {
            value: offset,
            target: Some(target),
        }
    }
}

impl From<i32> for Displacement {
    fn from(value: i32) -> Self {
        Self::imm(value)
    }
}

/// A memory operand: `seg:[base + index*scale + disp]`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemOperand {
    pub base: Option<Gpr>,
    pub index: Option<Gpr>,
    pub scale: Scale,
    pub disp: Displacement,
    pub seg: Option<Seg>,
    /// Bit width of the access this operand describes.
    pub size_bits: u16,
}

impl MemOperand {
    /// A simple base-plus-displacement operand (the decoder's `O_SMEM`).
    pub fn simple(base: Gpr, disp: impl Into<Displacement>, size_bits: u16) -> Self {
        Self {
            base: Some(base),
            index: None,
            scale: Scale::One,
            disp: disp.into(),
            seg: None,
            size_bits,
        }
    }

    /// A full base+index*scale+displacement operand (the decoder's `O_MEM`).
    ///
    /// An operand with an index but no base must carry a non-zero
    /// displacement or a reference; the encoding has no room for anything
    /// else, so a violation is a decoder bug.
    pub fn complex(
        base: Option<Gpr>,
        index: Option<Gpr>,
        scale: Scale,
        disp: impl Into<Displacement>,
        size_bits: u16,
    ) -> Self {
        let disp = disp.into();
        debug_assert!(
            !(base.is_none() && index.is_some() && disp.value == 0 && disp.target.is_none()),
            "index without base requires a displacement"
        );
        Self {
            base,
            index,
            scale,
            disp,
            seg: None,
            size_bits,
        }
    }

    /// Attach a segment override.
    pub fn seg(mut self, seg: Seg) -> Self {
        self.seg = Some(seg);
        self
    }

    /// Size of the access in bytes.
    pub fn size_bytes(&self) -> u8 {
        (self.size_bits / 8) as u8
    }

    /// True if the index is used without a base register.
    pub fn has_index_without_base(&self) -> bool {
        self.base.is_none() && self.index.is_some()
    }
}

impl fmt::Display for MemOperand {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if let Some(seg) = self.seg {
            write!(f, "{seg}:")?;
        }
        write!(f, "[")?;
        let mut sep = "";
        if let Some(base) = self.base {
            write!(f, "{base}")?;
            sep = "+";
        }
        if let Some(index) = self.index {
            write!(f, "{sep}{index}*{}", self.scale.bytes())?;
            sep = "+";
        }
        match self.disp.target {
            Some(target) => write!(f, "{sep}<{target:?}>+{:#x}", self.disp.value)?,
            None if self.disp.value != 0 || sep.is_empty() => {
                if self.disp.value < 0 {
                    write!(f, "-{:#x}", -i64::from(self.disp.value))?
                } else {
                    write!(f, "{sep}{:#x}", self.disp.value)?
                }
            }
            None => {}
        }
        write!(f, "]")
    }
}

/// One operand of a decoded instruction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Operand {
    /// A general purpose register.
    Reg(Gpr),
    /// An XMM/YMM register, by encoding.
    Xmm(u8),
    /// An immediate.
    Imm(i64),
    /// A PC-relative branch target.
    Pc(Displacement),
    /// Simple memory: base plus displacement.
    Smem(MemOperand),
    /// Complex memory: base + index*scale + displacement.
    Mem(MemOperand),
}

impl Operand {
    /// The memory operand, if this operand is memory-typed.
    pub fn mem(&self) -> Option<&MemOperand> {
        match self {
            Operand::Smem(m) | Operand::Mem(m) => Some(m),
            _ => None,
        }
    }

    /// Is this operand memory-typed?
    pub fn is_memory(&self) -> bool {
        self.mem().is_some()
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Operand::Reg(r) => write!(f, "{r}"),
            Operand::Xmm(x) => write!(f, "xmm{x}"),
            Operand::Imm(v) => write!(f, "{v:#x}"),
            Operand::Pc(d) => match d.target {
                Some(t) => write!(f, "<{t:?}>+{:#x}", d.value),
                None => write!(f, "{:+#x}", d.value),
            },
            Operand::Smem(m) | Operand::Mem(m) => write!(f, "{m}"),
        }
    }
}

/// A reference carried by an immediate or displacement field.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InstRef {
    /// Byte offset of the field within the instruction.
    pub offset: u8,
    pub kind: RefKind,
    /// Size of the field in bytes.
    pub size: u8,
    pub target: RefTarget,
    /// Offset into the target.
    pub target_offset: i32,
}

/// A decoded instruction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Instruction {
    pub(crate) opcode: Opcode,
    pub(crate) operands: SmallVec<[Operand; 2]>,
    pub(crate) prefixes: Prefixes,
    pub(crate) bytes: Vec<u8>,
    pub(crate) refs: SmallVec<[InstRef; 1]>,
    pub(crate) source: SourceRange,
}

impl Instruction {
    pub fn opcode(&self) -> Opcode {
        self.opcode
    }

    pub fn operands(&self) -> &[Operand] {
        &self.operands
    }

    pub fn prefixes(&self) -> Prefixes {
        self.prefixes
    }

    /// The encoded bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Encoded length in bytes.
    pub fn len(&self) -> u32 {
        self.bytes.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// References carried by this instruction's fields.
    pub fn refs(&self) -> &[InstRef] {
        &self.refs
    }

    pub fn source(&self) -> SourceRange {
        self.source
    }

    /// Replace the source range (used when inserted instructions inherit
    /// the range of the instruction they precede).
    pub fn set_source(&mut self, source: SourceRange) {
        self.source = source;
    }

    /// Does this instruction write its first operand?
    pub fn writes_dest(&self) -> bool {
        self.opcode.writes_dest()
    }

    /// Arithmetic flags defined by this instruction.
    pub fn flags_defined(&self) -> EFlags {
        self.opcode.flags_defined()
    }

    /// Arithmetic flags read by this instruction.
    ///
    /// A repeated `CMPS` additionally reads `ZF` to decide termination.
    pub fn flags_used(&self) -> EFlags {
        let mut used = self.opcode.flags_used();
        if self.opcode == Opcode::Cmps
            && self
                .prefixes
                .intersects(Prefixes::REPZ | Prefixes::REPNZ)
        {
            used |= EFlags::ZF;
        }
        used
    }

    /// Ends a basic block.
    pub fn is_terminator(&self) -> bool {
        matches!(
            self.opcode,
            Opcode::Ret | Opcode::Jmp | Opcode::Je | Opcode::Jne
        )
    }

    /// Is this a conditional branch (terminator with fall-through)?
    pub fn is_conditional_branch(&self) -> bool {
        matches!(self.opcode, Opcode::Je | Opcode::Jne)
    }

    /// Does this instruction write `reg`, explicitly or implicitly?
    pub fn writes_reg(&self, reg: Gpr) -> bool {
        if self.writes_dest() {
            if let Some(Operand::Reg(r)) = self.operands.first() {
                if *r == reg {
                    return true;
                }
            }
        }
        // XCHG writes both of its operands.
        if self.opcode == Opcode::Xchg {
            if let Some(Operand::Reg(r)) = self.operands.get(1) {
                if *r == reg {
                    return true;
                }
            }
        }
        match self.opcode {
            Opcode::Push | Opcode::Pop | Opcode::Pushfd | Opcode::Popfd | Opcode::Call
            | Opcode::Ret => reg == Gpr::Esp,
            Opcode::Leave => reg == Gpr::Esp || reg == Gpr::Ebp,
            Opcode::Movs | Opcode::Cmps => reg == Gpr::Esi || reg == Gpr::Edi,
            Opcode::Stos => reg == Gpr::Edi,
            Opcode::Lods => reg == Gpr::Esi || reg == Gpr::Eax,
            _ => false,
        }
    }

    /// Retarget every reference matching `from` via `f`, in both the
    /// reference list and the operand displacement fields.
    pub(crate) fn retarget_refs(&mut self, mut f: impl FnMut(RefTarget, i32) -> (RefTarget, i32)) {
        for r in &mut self.refs {
            let (target, target_offset) = f(r.target, r.target_offset);
            r.target = target;
            r.target_offset = target_offset;
        }
        for op in &mut self.operands {
            let disp = match op {
                Operand::Smem(m) | Operand::Mem(m) => &mut m.disp,
                Operand::Pc(d) => d,
                _ => continue,
            };
            if let Some(target) = disp.target {
                let (target, value) = f(target, disp.value);
                disp.target = Some(target);
                disp.value = value;
            }
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.prefixes.contains(Prefixes::REPZ) {
            write!(f, "rep ")?;
        }
        if self.prefixes.contains(Prefixes::REPNZ) {
            write!(f, "repnz ")?;
        }
        write!(f, "{}", self.opcode)?;
        for (i, op) in self.operands.iter().enumerate() {
            if i == 0 {
                write!(f, " {op}")?;
            } else {
                write!(f, ", {op}")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inc_preserves_cf() {
        assert!(!Opcode::Inc.flags_defined().contains(EFlags::CF));
        assert!(Opcode::Inc.flags_defined().contains(EFlags::ZF));
        assert_eq!(Opcode::Add.flags_defined(), EFlags::ARITH);
    }

    #[test]
    fn repeated_cmps_reads_zf() {
        let plain = crate::asm::assemble(
            Opcode::Cmps,
            &[
                Operand::Smem(MemOperand::simple(Gpr::Esi, 0, 32)),
                Operand::Smem(MemOperand::simple(Gpr::Edi, 0, 32).seg(Seg::Es)),
            ],
            Prefixes::empty(),
            SourceRange::default(),
        )
        .unwrap();
        assert!(!plain.flags_used().contains(EFlags::ZF));

        let repz = crate::asm::assemble(
            Opcode::Cmps,
            &[
                Operand::Smem(MemOperand::simple(Gpr::Esi, 0, 32)),
                Operand::Smem(MemOperand::simple(Gpr::Edi, 0, 32).seg(Seg::Es)),
            ],
            Prefixes::REPZ,
            SourceRange::default(),
        )
        .unwrap();
        assert!(repz.flags_used().contains(EFlags::ZF));
    }

    #[test]
    fn implicit_register_writes() {
        let push = crate::asm::assemble(
            Opcode::Push,
            &[Operand::Reg(Gpr::Eax)],
            Prefixes::empty(),
            SourceRange::default(),
        )
        .unwrap();
        assert!(push.writes_reg(Gpr::Esp));
        assert!(!push.writes_reg(Gpr::Eax));

        let stos = crate::asm::assemble(
            Opcode::Stos,
            &[Operand::Smem(MemOperand::simple(Gpr::Edi, 0, 32).seg(Seg::Es))],
            Prefixes::empty(),
            SourceRange::default(),
        )
        .unwrap();
        assert!(stos.writes_reg(Gpr::Edi));
        assert!(!stos.writes_reg(Gpr::Esi));
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "index without base")]
    fn index_without_base_requires_displacement() {
        let _ = MemOperand::complex(None, Some(Gpr::Eax), Scale::Four, 0, 32);
    }
}
