//! Memory access classification.
//!
//! For one decoded instruction, decides whether it accesses memory and,
//! if so, extracts the operand to check and the access descriptor that
//! keys the probe table.

use core::cmp::Ordering;
use core::fmt;

use pewter_graph::{Instruction, MemOperand, Opcode, Prefixes};

/// How an instruction touches memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum MemoryAccessMode {
    Read,
    Write,
    /// A string instruction executed once.
    Instr,
    /// A string instruction under `REP`/`REPZ`.
    RepZ,
    /// A string instruction under `REPNZ`.
    RepNZ,
}

impl MemoryAccessMode {
    /// Is this one of the string-instruction modes, with the direct
    /// register-argument probe ABI?
    pub fn is_string(self) -> bool {
        matches!(
            self,
            MemoryAccessMode::Instr | MemoryAccessMode::RepZ | MemoryAccessMode::RepNZ
        )
    }
}

/// The descriptor that keys the probe table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryAccessInfo {
    pub mode: MemoryAccessMode,
    /// Access size in bytes.
    pub size: u8,
    /// Whether the probe must preserve EFLAGS.
    pub save_flags: bool,
    /// The mnemonic, populated only for the string modes.
    pub opcode: Option<Opcode>,
}

impl MemoryAccessInfo {
    /// A plain read of `size` bytes.
    pub fn read(size: u8) -> Self {
        Self {
            mode: MemoryAccessMode::Read,
            size,
            save_flags: true,
            opcode: None,
        }
    }

    /// A plain write of `size` bytes.
    pub fn write(size: u8) -> Self {
        Self {
            mode: MemoryAccessMode::Write,
            size,
            save_flags: true,
            opcode: None,
        }
    }

    /// A string access of `size` bytes per element.
    pub fn string(mode: MemoryAccessMode, size: u8, opcode: Opcode) -> Self {
        debug_assert!(mode.is_string());
        Self {
            mode,
            size,
            save_flags: true,
            opcode: Some(opcode),
        }
    }
}

// The table key order is part of the design: lexicographic on
// (mode, size, save_flags, opcode).
impl Ord for MemoryAccessInfo {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.mode, self.size, self.save_flags, self.opcode).cmp(&(
            other.mode,
            other.size,
            other.save_flags,
            other.opcode,
        ))
    }
}

impl PartialOrd for MemoryAccessInfo {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for MemoryAccessInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.mode {
            MemoryAccessMode::Read => write!(f, "{}-byte read", self.size)?,
            MemoryAccessMode::Write => write!(f, "{}-byte write", self.size)?,
            MemoryAccessMode::Instr | MemoryAccessMode::RepZ | MemoryAccessMode::RepNZ => {
                let mnemonic = self.opcode.map_or("?", |op| op.mnemonic());
                if self.mode == MemoryAccessMode::RepZ {
                    write!(f, "repz ")?;
                } else if self.mode == MemoryAccessMode::RepNZ {
                    write!(f, "repnz ")?;
                }
                write!(f, "{}-byte {mnemonic}", self.size)?;
            }
        }
        if !self.save_flags {
            write!(f, " (no flags)")?;
        }
        Ok(())
    }
}

/// Classify `inst`, returning the memory operand to check (with its
/// displacement advanced to the last byte touched) and the access
/// descriptor.
///
/// Returns `None` for instructions that don't access memory. NOPs are
/// rejected outright: a decoder-recognized NOP may *name* registers and
/// memory without accessing them.
pub fn memory_access_of(inst: &Instruction) -> Option<(MemOperand, MemoryAccessInfo)> {
    if inst.opcode().is_nop() {
        return None;
    }

    let operands = inst.operands();
    let mem0 = operands.first().and_then(|op| op.mem());
    let mem1 = operands.get(1).and_then(|op| op.mem());

    // With two memory operands (`MOVS [EDI], [ESI]`) operand 0 wins; the
    // sizes must agree.
    let (operand, is_operand0) = match (mem0, mem1) {
        (Some(a), Some(b)) => {
            debug_assert_eq!(a.size_bits, b.size_bits);
            (a, true)
        }
        (Some(a), None) => (a, true),
        (None, Some(b)) => (b, false),
        (None, None) => return None,
    };

    let size = operand.size_bytes();
    let opcode = inst.opcode();
    let mode = if inst.prefixes().contains(Prefixes::REPNZ) {
        MemoryAccessMode::RepNZ
    } else if inst.prefixes().contains(Prefixes::REPZ) {
        MemoryAccessMode::RepZ
    } else if opcode.is_string() {
        MemoryAccessMode::Instr
    } else if inst.writes_dest() && is_operand0 {
        MemoryAccessMode::Write
    } else {
        MemoryAccessMode::Read
    };

    // Point the displacement at the last byte touched, preserving any
    // reference it carries.
    let mut operand = operand.clone();
    operand.disp.value += i32::from(size) - 1;

    let info = MemoryAccessInfo {
        mode,
        size,
        save_flags: true,
        opcode: mode.is_string().then_some(opcode),
    };
    Some((operand, info))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pewter_graph::asm::{inst, inst_with_prefixes, string_operands};
    use pewter_graph::{Displacement, Gpr, MemOperand, Operand, RefTarget, Scale};

    #[test]
    fn simple_read_points_at_last_byte() {
        let mov = inst(
            Opcode::Mov,
            &[
                Operand::Reg(Gpr::Eax),
                Operand::Smem(MemOperand::simple(Gpr::Ebx, 4, 32)),
            ],
        );
        let (operand, info) = memory_access_of(&mov).unwrap();
        assert_eq!(info, MemoryAccessInfo::read(4));
        assert_eq!(operand.disp.value, 7);
        assert_eq!(operand.base, Some(Gpr::Ebx));
    }

    #[test]
    fn write_when_destination_is_memory() {
        let mov = inst(
            Opcode::Mov,
            &[
                Operand::Smem(MemOperand::simple(Gpr::Ebp, -8, 32)),
                Operand::Reg(Gpr::Eax),
            ],
        );
        let (operand, info) = memory_access_of(&mov).unwrap();
        assert_eq!(info, MemoryAccessInfo::write(4));
        assert_eq!(operand.disp.value, -5);
    }

    #[test]
    fn compare_reads_its_memory_destination() {
        // CMP writes no operand, so a memory "destination" is a read.
        let cmp = inst(
            Opcode::Cmp,
            &[
                Operand::Smem(MemOperand::simple(Gpr::Ecx, 0, 32)),
                Operand::Reg(Gpr::Eax),
            ],
        );
        let (_, info) = memory_access_of(&cmp).unwrap();
        assert_eq!(info.mode, MemoryAccessMode::Read);
    }

    #[test]
    fn string_modes_carry_the_opcode() {
        let movs = inst(Opcode::Movs, &string_operands(Opcode::Movs, 32));
        let (operand, info) = memory_access_of(&movs).unwrap();
        assert_eq!(info.mode, MemoryAccessMode::Instr);
        assert_eq!(info.opcode, Some(Opcode::Movs));
        // Operand 0 (the EDI side) wins.
        assert_eq!(operand.base, Some(Gpr::Edi));

        let rep = inst_with_prefixes(
            Opcode::Movs,
            &string_operands(Opcode::Movs, 16),
            Prefixes::REPZ,
        );
        let (_, info) = memory_access_of(&rep).unwrap();
        assert_eq!(info.mode, MemoryAccessMode::RepZ);
        assert_eq!(info.size, 2);

        let repnz = inst_with_prefixes(
            Opcode::Cmps,
            &string_operands(Opcode::Cmps, 8),
            Prefixes::REPNZ,
        );
        let (_, info) = memory_access_of(&repnz).unwrap();
        assert_eq!(info.mode, MemoryAccessMode::RepNZ);
        assert_eq!(info.opcode, Some(Opcode::Cmps));
    }

    #[test]
    fn register_only_instructions_have_no_access() {
        let add = inst(
            Opcode::Add,
            &[Operand::Reg(Gpr::Eax), Operand::Reg(Gpr::Ebx)],
        );
        assert!(memory_access_of(&add).is_none());

        let nop = inst(Opcode::Nop, &[]);
        assert!(memory_access_of(&nop).is_none());
    }

    #[test]
    fn displacement_reference_is_preserved() {
        let target = RefTarget::Block(cranelift_entity::EntityRef::new(7));
        let mov = inst(
            Opcode::Mov,
            &[
                Operand::Reg(Gpr::Eax),
                Operand::Mem(MemOperand::complex(
                    None,
                    Some(Gpr::Ecx),
                    Scale::Four,
                    Displacement::to_target(target, 0x10),
                    32,
                )),
            ],
        );
        let (operand, _) = memory_access_of(&mov).unwrap();
        assert_eq!(operand.disp.target, Some(target));
        assert_eq!(operand.disp.value, 0x13);
    }

    #[test]
    fn access_info_order_is_mode_size_flags_opcode() {
        let mut keys = vec![
            MemoryAccessInfo::string(MemoryAccessMode::Instr, 1, Opcode::Movs),
            MemoryAccessInfo::write(1),
            MemoryAccessInfo::read(8),
            MemoryAccessInfo {
                save_flags: false,
                ..MemoryAccessInfo::read(8)
            },
            MemoryAccessInfo::read(1),
        ];
        keys.sort();
        assert_eq!(keys[0], MemoryAccessInfo::read(1));
        assert_eq!(
            keys[1],
            MemoryAccessInfo {
                save_flags: false,
                ..MemoryAccessInfo::read(8)
            }
        );
        assert_eq!(keys[2], MemoryAccessInfo::read(8));
        assert_eq!(keys[3], MemoryAccessInfo::write(1));
        assert_eq!(keys[4].mode, MemoryAccessMode::Instr);
    }
}
