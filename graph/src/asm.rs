//! A 32-bit x86 assembler for the instruction set transforms emit.
//!
//! This is not a general-purpose assembler: it encodes exactly the forms
//! the graph's instruction model can describe, and every encoded
//! instruction records where its displacement and immediate reference
//! fields landed so the block builder can relocate them. Unsupported
//! operand combinations are an error, never a silent fallback.

use smallvec::{smallvec, SmallVec};

use crate::entities::Block;
use crate::graph::{RefKind, Reference};
use crate::inst::{
    Displacement, InstRef, Instruction, MemOperand, Opcode, Operand, Prefixes, RefTarget,
};
use crate::reg::{Gpr, Seg};
use crate::source::SourceRange;
use crate::GraphError;

fn encode_modrm(m0d: u8, reg: u8, rm: u8) -> u8 {
    debug_assert!(m0d < 4 && reg < 8 && rm < 8);
    (m0d << 6) | (reg << 3) | rm
}

fn encode_sib(scale: u8, index: u8, base: u8) -> u8 {
    debug_assert!(scale < 4 && index < 8 && base < 8);
    (scale << 6) | (index << 3) | base
}

/// The default segment the hardware would use for `mem` in the given
/// operand role; an override prefix is only emitted when the operand's
/// segment differs from this.
fn default_seg(mem: &MemOperand, string_dest: bool) -> Seg {
    if string_dest {
        Seg::Es
    } else {
        match mem.base {
            Some(Gpr::Esp) | Some(Gpr::Ebp) => Seg::Ss,
            _ => Seg::Ds,
        }
    }
}

struct Enc {
    bytes: Vec<u8>,
    refs: SmallVec<[InstRef; 1]>,
}

impl Enc {
    fn new() -> Self {
        Self {
            bytes: Vec::with_capacity(8),
            refs: SmallVec::new(),
        }
    }

    fn put1(&mut self, b: u8) {
        self.bytes.push(b);
    }

    fn put2(&mut self, v: u16) {
        self.bytes.extend_from_slice(&v.to_le_bytes());
    }

    fn put4(&mut self, v: u32) {
        self.bytes.extend_from_slice(&v.to_le_bytes());
    }

    /// Emit a 32-bit displacement or immediate, recording a reference if
    /// the field carries one.
    fn field32(&mut self, kind: RefKind, disp: Displacement) {
        if let Some(target) = disp.target {
            self.refs.push(InstRef {
                offset: self.bytes.len() as u8,
                kind,
                size: 4,
                target,
                target_offset: disp.value,
            });
            self.put4(0);
        } else {
            self.put4(disp.value as u32);
        }
    }

    /// Emit the ModRM/SIB/displacement sequence for `mem` with `reg` in
    /// the reg field.
    fn modrm_mem(&mut self, reg: u8, mem: &MemOperand) -> Result<(), GraphError> {
        let disp = mem.disp;
        let force_disp32 = disp.target.is_some();
        match (mem.base, mem.index) {
            (None, None) => {
                // Bare [disp32].
                self.put1(encode_modrm(0b00, reg, 0b101));
                self.field32(RefKind::Absolute, disp);
            }
            (Some(base), None) => {
                // The rm=100 encoding is taken by the SIB escape, so an
                // ESP base always goes through a degenerate SIB byte.
                let m0d = if !force_disp32 && disp.value == 0 && base != Gpr::Ebp {
                    0b00
                } else if !force_disp32 && i8::try_from(disp.value).is_ok() {
                    0b01
                } else {
                    0b10
                };
                if base == Gpr::Esp {
                    self.put1(encode_modrm(m0d, reg, 0b100));
                    self.put1(encode_sib(0b00, 0b100, 0b100));
                } else {
                    self.put1(encode_modrm(m0d, reg, base.enc()));
                }
                match m0d {
                    0b01 => self.put1(disp.value as i8 as u8),
                    0b10 => self.field32(RefKind::Absolute, disp),
                    _ => {}
                }
            }
            (base, Some(index)) => {
                if index == Gpr::Esp {
                    return Err(GraphError::InvalidOperand("ESP cannot be an index"));
                }
                match base {
                    Some(base) => {
                        let m0d = if !force_disp32 && disp.value == 0 && base != Gpr::Ebp {
                            0b00
                        } else if !force_disp32 && i8::try_from(disp.value).is_ok() {
                            0b01
                        } else {
                            0b10
                        };
                        self.put1(encode_modrm(m0d, reg, 0b100));
                        self.put1(encode_sib(mem.scale.enc(), index.enc(), base.enc()));
                        match m0d {
                            0b01 => self.put1(disp.value as i8 as u8),
                            0b10 => self.field32(RefKind::Absolute, disp),
                            _ => {}
                        }
                    }
                    None => {
                        // Index without base: mod=00, SIB base=101 means
                        // "no base, disp32 follows".
                        self.put1(encode_modrm(0b00, reg, 0b100));
                        self.put1(encode_sib(mem.scale.enc(), index.enc(), 0b101));
                        self.field32(RefKind::Absolute, disp);
                    }
                }
            }
        }
        Ok(())
    }

    fn modrm_reg(&mut self, reg: u8, rm: u8) {
        self.put1(encode_modrm(0b11, reg, rm));
    }

    fn pc_rel32(&mut self, disp: Displacement) {
        self.field32(RefKind::PcRelative, disp);
    }
}

/// ALU opcode bytes: `(rm, r)` form, `(r, rm)` form, `/ext` for the
/// `81 /ext` immediate form.
fn alu_encoding(opcode: Opcode) -> Option<(u8, u8, u8)> {
    Some(match opcode {
        Opcode::Add => (0x01, 0x03, 0),
        Opcode::Or => (0x09, 0x0b, 1),
        Opcode::Adc => (0x11, 0x13, 2),
        Opcode::Sbb => (0x19, 0x1b, 3),
        Opcode::And => (0x21, 0x23, 4),
        Opcode::Sub => (0x29, 0x2b, 5),
        Opcode::Xor => (0x31, 0x33, 6),
        Opcode::Cmp => (0x39, 0x3b, 7),
        _ => return None,
    })
}

/// Encode one instruction.
///
/// The operand forms accepted here are exactly the forms the decoder
/// produces for the supported mnemonic set plus the forms transforms
/// synthesize; anything else returns [`GraphError::Encoding`].
pub fn assemble(
    opcode: Opcode,
    operands: &[Operand],
    prefixes: Prefixes,
    source: SourceRange,
) -> Result<Instruction, GraphError> {
    let mut enc = Enc::new();

    if prefixes.contains(Prefixes::REPZ) {
        enc.put1(0xf3);
    }
    if prefixes.contains(Prefixes::REPNZ) {
        enc.put1(0xf2);
    }

    // Segment override, taken from the first memory operand carrying one.
    let string_op = opcode.is_string();
    for (i, op) in operands.iter().enumerate() {
        if let Some(mem) = op.mem() {
            if let Some(seg) = mem.seg {
                let dest_role = string_op && i == 0 && opcode != Opcode::Cmps && opcode != Opcode::Lods;
                let cmps_dest = opcode == Opcode::Cmps && i == 1;
                if seg != default_seg(mem, dest_role || cmps_dest) {
                    enc.put1(seg.prefix_byte());
                }
            }
        }
    }

    // Operand-size prefix for 16-bit memory accesses. LEA only computes
    // the address; the operand's bit width describes the original
    // access, not the LEA itself.
    let mem_bits = operands.iter().find_map(|op| op.mem()).map(|m| m.size_bits);
    if mem_bits == Some(16) && !matches!(opcode, Opcode::Lea | Opcode::Fld | Opcode::Fstp) {
        enc.put1(0x66);
    }

    match (opcode, operands) {
        (Opcode::Mov, [Operand::Reg(d), Operand::Reg(s)]) => {
            enc.put1(0x8b);
            enc.modrm_reg(d.enc(), s.enc());
        }
        (Opcode::Mov, [Operand::Reg(d), op]) if op.is_memory() => {
            let mem = op.mem().unwrap();
            enc.put1(if mem.size_bits == 8 { 0x8a } else { 0x8b });
            enc.modrm_mem(d.enc(), mem)?;
        }
        (Opcode::Mov, [op, Operand::Reg(s)]) if op.is_memory() => {
            let mem = op.mem().unwrap();
            enc.put1(if mem.size_bits == 8 { 0x88 } else { 0x89 });
            enc.modrm_mem(s.enc(), mem)?;
        }
        (Opcode::Mov, [Operand::Reg(d), Operand::Imm(v)]) => {
            enc.put1(0xb8 + d.enc());
            enc.put4(*v as u32);
        }
        (Opcode::Mov, [op, Operand::Imm(v)]) if op.is_memory() => {
            let mem = op.mem().unwrap();
            enc.put1(if mem.size_bits == 8 { 0xc6 } else { 0xc7 });
            enc.modrm_mem(0, mem)?;
            if mem.size_bits == 8 {
                enc.put1(*v as u8);
            } else if mem.size_bits == 16 {
                enc.put2(*v as u16);
            } else {
                enc.put4(*v as u32);
            }
        }
        (Opcode::Lea, [Operand::Reg(d), op]) if op.is_memory() => {
            enc.put1(0x8d);
            enc.modrm_mem(d.enc(), op.mem().unwrap())?;
        }
        (Opcode::Push, [Operand::Reg(r)]) => enc.put1(0x50 + r.enc()),
        (Opcode::Push, [Operand::Imm(v)]) => {
            enc.put1(0x68);
            enc.put4(*v as u32);
        }
        (Opcode::Push, [op]) if op.is_memory() => {
            enc.put1(0xff);
            enc.modrm_mem(6, op.mem().unwrap())?;
        }
        (Opcode::Pop, [Operand::Reg(r)]) => enc.put1(0x58 + r.enc()),
        (Opcode::Xchg, [Operand::Reg(a), Operand::Reg(b)]) => {
            enc.put1(0x87);
            enc.modrm_reg(b.enc(), a.enc());
        }
        (Opcode::Xchg, [op, Operand::Reg(r)]) if op.is_memory() => {
            enc.put1(0x87);
            enc.modrm_mem(r.enc(), op.mem().unwrap())?;
        }
        (op, [Operand::Reg(d), Operand::Reg(s)]) if alu_encoding(op).is_some() => {
            let (_, r_rm, _) = alu_encoding(op).unwrap();
            enc.put1(r_rm);
            enc.modrm_reg(d.enc(), s.enc());
        }
        (op, [Operand::Reg(d), m]) if alu_encoding(op).is_some() && m.is_memory() => {
            let (_, r_rm, _) = alu_encoding(op).unwrap();
            enc.put1(r_rm);
            enc.modrm_mem(d.enc(), m.mem().unwrap())?;
        }
        (op, [m, Operand::Reg(s)]) if alu_encoding(op).is_some() && m.is_memory() => {
            let (rm_r, _, _) = alu_encoding(op).unwrap();
            enc.put1(rm_r);
            enc.modrm_mem(s.enc(), m.mem().unwrap())?;
        }
        (op, [Operand::Reg(d), Operand::Imm(v)]) if alu_encoding(op).is_some() => {
            let (_, _, ext) = alu_encoding(op).unwrap();
            enc.put1(0x81);
            enc.modrm_reg(ext, d.enc());
            enc.put4(*v as u32);
        }
        (op, [m, Operand::Imm(v)]) if alu_encoding(op).is_some() && m.is_memory() => {
            let (_, _, ext) = alu_encoding(op).unwrap();
            enc.put1(0x81);
            enc.modrm_mem(ext, m.mem().unwrap())?;
            enc.put4(*v as u32);
        }
        (Opcode::Test, [op, Operand::Reg(r)]) => {
            enc.put1(0x85);
            match op {
                Operand::Reg(d) => enc.modrm_reg(r.enc(), d.enc()),
                _ if op.is_memory() => enc.modrm_mem(r.enc(), op.mem().unwrap())?,
                _ => return Err(GraphError::Encoding(opcode)),
            }
        }
        (Opcode::Test, [Operand::Reg(d), Operand::Imm(v)]) => {
            enc.put1(0xf7);
            enc.modrm_reg(0, d.enc());
            enc.put4(*v as u32);
        }
        (Opcode::Inc, [Operand::Reg(r)]) => enc.put1(0x40 + r.enc()),
        (Opcode::Dec, [Operand::Reg(r)]) => enc.put1(0x48 + r.enc()),
        (Opcode::Inc, [op]) if op.is_memory() => {
            enc.put1(0xff);
            enc.modrm_mem(0, op.mem().unwrap())?;
        }
        (Opcode::Dec, [op]) if op.is_memory() => {
            enc.put1(0xff);
            enc.modrm_mem(1, op.mem().unwrap())?;
        }
        (Opcode::Neg, [op]) | (Opcode::Not, [op]) => {
            let ext = if opcode == Opcode::Neg { 3 } else { 2 };
            enc.put1(0xf7);
            match op {
                Operand::Reg(r) => enc.modrm_reg(ext, r.enc()),
                _ if op.is_memory() => enc.modrm_mem(ext, op.mem().unwrap())?,
                _ => return Err(GraphError::Encoding(opcode)),
            }
        }
        (Opcode::Imul, [Operand::Reg(d), op]) => {
            enc.put1(0x0f);
            enc.put1(0xaf);
            match op {
                Operand::Reg(s) => enc.modrm_reg(d.enc(), s.enc()),
                _ if op.is_memory() => enc.modrm_mem(d.enc(), op.mem().unwrap())?,
                _ => return Err(GraphError::Encoding(opcode)),
            }
        }
        (Opcode::Shl, [op, count]) | (Opcode::Shr, [op, count]) | (Opcode::Sar, [op, count]) => {
            let ext = match opcode {
                Opcode::Shl => 4,
                Opcode::Shr => 5,
                _ => 7,
            };
            let rm = |enc: &mut Enc, ext| -> Result<(), GraphError> {
                match op {
                    Operand::Reg(r) => {
                        enc.modrm_reg(ext, r.enc());
                        Ok(())
                    }
                    _ if op.is_memory() => enc.modrm_mem(ext, op.mem().unwrap()),
                    _ => Err(GraphError::Encoding(opcode)),
                }
            };
            match count {
                Operand::Imm(n) => {
                    enc.put1(0xc1);
                    rm(&mut enc, ext)?;
                    enc.put1(*n as u8);
                }
                Operand::Reg(Gpr::Ecx) => {
                    enc.put1(0xd3);
                    rm(&mut enc, ext)?;
                }
                _ => return Err(GraphError::Encoding(opcode)),
            }
        }
        (Opcode::Call, [Operand::Pc(d)]) => {
            enc.put1(0xe8);
            enc.pc_rel32(*d);
        }
        (Opcode::Call, [op]) if op.is_memory() => {
            enc.put1(0xff);
            enc.modrm_mem(2, op.mem().unwrap())?;
        }
        (Opcode::Jmp, [Operand::Pc(d)]) => {
            enc.put1(0xe9);
            enc.pc_rel32(*d);
        }
        (Opcode::Jmp, [op]) if op.is_memory() => {
            enc.put1(0xff);
            enc.modrm_mem(4, op.mem().unwrap())?;
        }
        (Opcode::Je, [Operand::Pc(d)]) => {
            enc.put1(0x0f);
            enc.put1(0x84);
            enc.pc_rel32(*d);
        }
        (Opcode::Jne, [Operand::Pc(d)]) => {
            enc.put1(0x0f);
            enc.put1(0x85);
            enc.pc_rel32(*d);
        }
        (Opcode::Ret, []) => enc.put1(0xc3),
        (Opcode::Ret, [Operand::Imm(n)]) => {
            enc.put1(0xc2);
            enc.put2(*n as u16);
        }
        (Opcode::Leave, []) => enc.put1(0xc9),
        (Opcode::Nop, []) => enc.put1(0x90),
        (Opcode::Pushfd, []) => enc.put1(0x9c),
        (Opcode::Popfd, []) => enc.put1(0x9d),
        (Opcode::Movs, [d, _]) if d.is_memory() => {
            enc.put1(if d.mem().unwrap().size_bits == 8 { 0xa4 } else { 0xa5 });
        }
        (Opcode::Cmps, [s, _]) if s.is_memory() => {
            enc.put1(if s.mem().unwrap().size_bits == 8 { 0xa6 } else { 0xa7 });
        }
        (Opcode::Stos, [d]) if d.is_memory() => {
            enc.put1(if d.mem().unwrap().size_bits == 8 { 0xaa } else { 0xab });
        }
        (Opcode::Lods, [s]) if s.is_memory() => {
            enc.put1(if s.mem().unwrap().size_bits == 8 { 0xac } else { 0xad });
        }
        (Opcode::Fld, [op]) if op.is_memory() && op.mem().unwrap().size_bits == 80 => {
            enc.put1(0xdb);
            enc.modrm_mem(5, op.mem().unwrap())?;
        }
        (Opcode::Fstp, [op]) if op.is_memory() && op.mem().unwrap().size_bits == 80 => {
            enc.put1(0xdb);
            enc.modrm_mem(7, op.mem().unwrap())?;
        }
        (Opcode::Movq, [Operand::Xmm(x), op]) if op.is_memory() => {
            enc.put1(0xf3);
            enc.put1(0x0f);
            enc.put1(0x7e);
            enc.modrm_mem(*x, op.mem().unwrap())?;
        }
        (Opcode::Movq, [op, Operand::Xmm(x)]) if op.is_memory() => {
            enc.put1(0x66);
            enc.put1(0x0f);
            enc.put1(0xd6);
            enc.modrm_mem(*x, op.mem().unwrap())?;
        }
        (Opcode::Movdqa, [Operand::Xmm(x), op]) if op.is_memory() => {
            enc.put1(0x66);
            enc.put1(0x0f);
            enc.put1(0x6f);
            enc.modrm_mem(*x, op.mem().unwrap())?;
        }
        (Opcode::Movdqa, [op, Operand::Xmm(x)]) if op.is_memory() => {
            enc.put1(0x66);
            enc.put1(0x0f);
            enc.put1(0x7f);
            enc.modrm_mem(*x, op.mem().unwrap())?;
        }
        (Opcode::Vmovdqa, [Operand::Xmm(x), op]) if op.is_memory() => {
            enc.put1(0xc5);
            enc.put1(0xfd);
            enc.put1(0x6f);
            enc.modrm_mem(*x, op.mem().unwrap())?;
        }
        (Opcode::Vmovdqa, [op, Operand::Xmm(x)]) if op.is_memory() => {
            enc.put1(0xc5);
            enc.put1(0xfd);
            enc.put1(0x7f);
            enc.modrm_mem(*x, op.mem().unwrap())?;
        }
        (Opcode::Clflush, [op]) if op.is_memory() => {
            enc.put1(0x0f);
            enc.put1(0xae);
            enc.modrm_mem(7, op.mem().unwrap())?;
        }
        (Opcode::Prefetchnta, [op])
        | (Opcode::Prefetcht0, [op])
        | (Opcode::Prefetcht1, [op])
        | (Opcode::Prefetcht2, [op])
        | (Opcode::Prefetch, [op])
        | (Opcode::Prefetchw, [op])
            if op.is_memory() =>
        {
            enc.put1(0x0f);
            let (byte2, ext) = match opcode {
                Opcode::Prefetchnta => (0x18, 0),
                Opcode::Prefetcht0 => (0x18, 1),
                Opcode::Prefetcht1 => (0x18, 2),
                Opcode::Prefetcht2 => (0x18, 3),
                Opcode::Prefetch => (0x0d, 0),
                _ => (0x0d, 1),
            };
            enc.put1(byte2);
            enc.modrm_mem(ext, op.mem().unwrap())?;
        }
        _ => return Err(GraphError::Encoding(opcode)),
    }

    Ok(Instruction {
        opcode,
        operands: operands.iter().cloned().collect(),
        prefixes,
        bytes: enc.bytes,
        refs: enc.refs,
        source,
    })
}

/// A cursor-style assembler appending instructions to a sequence.
///
/// Every emitted instruction is stamped with the assembler's source
/// range, so code inserted in front of an original instruction can
/// inherit that instruction's range.
pub struct Assembler<'a> {
    out: &'a mut Vec<Instruction>,
    source: SourceRange,
}

impl<'a> Assembler<'a> {
    pub fn new(out: &'a mut Vec<Instruction>, source: SourceRange) -> Self {
        Self { out, source }
    }

    fn emit(&mut self, opcode: Opcode, operands: &[Operand]) -> Result<(), GraphError> {
        let inst = assemble(opcode, operands, Prefixes::empty(), self.source)?;
        self.out.push(inst);
        Ok(())
    }

    pub fn push_reg(&mut self, reg: Gpr) -> Result<(), GraphError> {
        self.emit(Opcode::Push, &[Operand::Reg(reg)])
    }

    pub fn push_imm(&mut self, value: i32) -> Result<(), GraphError> {
        self.emit(Opcode::Push, &[Operand::Imm(value.into())])
    }

    pub fn lea(&mut self, dst: Gpr, mem: MemOperand) -> Result<(), GraphError> {
        self.emit(Opcode::Lea, &[Operand::Reg(dst), Operand::Mem(mem)])
    }

    pub fn mov_reg_mem(&mut self, dst: Gpr, mem: MemOperand) -> Result<(), GraphError> {
        self.emit(Opcode::Mov, &[Operand::Reg(dst), Operand::Mem(mem)])
    }

    pub fn ret(&mut self) -> Result<(), GraphError> {
        self.emit(Opcode::Ret, &[])
    }

    pub fn ret_n(&mut self, bytes: u16) -> Result<(), GraphError> {
        self.emit(Opcode::Ret, &[Operand::Imm(bytes.into())])
    }

    /// Call through `reference`: a direct near call for PC-relative
    /// references (COFF external symbols), an indirect call through the
    /// referenced slot for absolute ones (PE IAT slots).
    pub fn call_via(&mut self, reference: Reference) -> Result<(), GraphError> {
        match reference.kind {
            RefKind::PcRelative => self.emit(
                Opcode::Call,
                &[Operand::Pc(Displacement::to_target(
                    RefTarget::Block(reference.target),
                    reference.offset,
                ))],
            ),
            RefKind::Absolute => self.emit(
                Opcode::Call,
                &[Operand::Mem(MemOperand::complex(
                    None,
                    None,
                    crate::inst::Scale::One,
                    Displacement::to_target(RefTarget::Block(reference.target), reference.offset),
                    32,
                ))],
            ),
        }
    }

    /// Jump indirectly through the referenced 4-byte slot.
    pub fn jmp_via_slot(&mut self, slot: Reference) -> Result<(), GraphError> {
        self.emit(
            Opcode::Jmp,
            &[Operand::Mem(MemOperand::complex(
                None,
                None,
                crate::inst::Scale::One,
                Displacement::to_target(RefTarget::Block(slot.target), slot.offset),
                32,
            ))],
        )
    }

    /// Call a block directly (PC-relative).
    pub fn call_block(&mut self, target: Block, offset: i32) -> Result<(), GraphError> {
        self.emit(
            Opcode::Call,
            &[Operand::Pc(Displacement::to_target(
                RefTarget::Block(target),
                offset,
            ))],
        )
    }
}

/// Shorthand used by tests and decoder shims to build an instruction
/// without spelling the full [`assemble`] signature.
pub fn inst(opcode: Opcode, operands: &[Operand]) -> Instruction {
    assemble(opcode, operands, Prefixes::empty(), SourceRange::default())
        .expect("supported encoding")
}

/// Like [`inst`], with prefixes.
pub fn inst_with_prefixes(opcode: Opcode, operands: &[Operand], prefixes: Prefixes) -> Instruction {
    assemble(opcode, operands, prefixes, SourceRange::default()).expect("supported encoding")
}

/// The operand list for a string instruction of `size_bits`, in the
/// shape the decoder produces (`ES:[EDI]` destination, `DS:[ESI]`
/// source).
pub fn string_operands(opcode: Opcode, size_bits: u16) -> SmallVec<[Operand; 2]> {
    let src = Operand::Smem(MemOperand::simple(Gpr::Esi, 0, size_bits));
    let dst = Operand::Smem(MemOperand::simple(Gpr::Edi, 0, size_bits).seg(Seg::Es));
    match opcode {
        Opcode::Movs => smallvec![dst, src],
        Opcode::Cmps => smallvec![src, dst],
        Opcode::Stos => smallvec![dst],
        Opcode::Lods => smallvec![src],
        _ => panic!("not a string opcode: {opcode}"),
    }
}
