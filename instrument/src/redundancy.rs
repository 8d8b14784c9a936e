//! Redundant memory access analysis.
//!
//! A forward, per-basic-block state answering "is this access already
//! covered by an earlier check on this path?". Two accesses are
//! redundant when they use the same address expression (base, index,
//! scale, segment, displacement) and the earlier check covered at least
//! as many bytes. The state is invalidated whenever a register feeding a
//! tracked expression is redefined, and dropped wholesale at calls,
//! which may unmap or repoison memory behind our back.

use rustc_hash::FxHashMap;

use pewter_graph::{Gpr, Instruction, MemOperand, Opcode, Seg};

/// The address expression of a checked access.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
struct AccessKey {
    base: Option<Gpr>,
    index: Option<Gpr>,
    scale: u8,
    disp: i32,
    seg: Option<Seg>,
}

impl AccessKey {
    /// Only reference-free operands are trackable; an operand whose
    /// displacement carries a reference is resolved at link time and
    /// never reaches a probe anyway.
    fn of(operand: &MemOperand) -> Option<Self> {
        if operand.disp.target.is_some() {
            return None;
        }
        Some(Self {
            base: operand.base,
            index: operand.index,
            scale: operand.scale.bytes(),
            disp: operand.disp.value,
            seg: operand.seg,
        })
    }
}

/// The running state of the analysis within one basic block.
#[derive(Debug, Default)]
pub struct RedundancyState {
    checked: FxHashMap<AccessKey, u8>,
}

impl RedundancyState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Is an access through `operand` of `size` bytes already covered?
    pub fn is_redundant(&self, operand: &MemOperand, size: u8) -> bool {
        AccessKey::of(operand)
            .and_then(|key| self.checked.get(&key))
            .is_some_and(|&covered| covered >= size)
    }

    /// Record that an access through `operand` was checked.
    pub fn record(&mut self, operand: &MemOperand, size: u8) {
        if let Some(key) = AccessKey::of(operand) {
            let covered = self.checked.entry(key).or_insert(0);
            *covered = (*covered).max(size);
        }
    }

    /// Propagate the state forward past `inst`.
    pub fn advance(&mut self, inst: &Instruction) {
        if inst.opcode() == Opcode::Call {
            self.checked.clear();
            return;
        }
        self.checked.retain(|key, _| {
            let base_live = key.base.is_none_or(|r| !inst.writes_reg(r));
            let index_live = key.index.is_none_or(|r| !inst.writes_reg(r));
            base_live && index_live
        });
    }
}
