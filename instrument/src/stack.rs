//! Safe-stack analysis.
//!
//! A conservative whole-subgraph inspection: does the function do
//! anything to `ESP`/`EBP` beyond the standard prologue/epilogue forms?
//! If not, accesses based on those registers are conventional stack
//! traffic and known safe, and the instrumenter can skip them.

use pewter_graph::subgraph::Subgraph;
use pewter_graph::{Gpr, Instruction, Opcode, Operand};

/// Whether a function's stack accesses are known conventional.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StackMode {
    /// Only standard prologue/epilogue stack manipulation was seen;
    /// `ESP`/`EBP`-based accesses are skipped.
    SafeStack,
    /// Something unexpected touches the stack registers; instrument
    /// everything.
    UnsafeStack,
}

/// Classify the subgraph's stack discipline.
pub fn analyze_stack(subgraph: &Subgraph) -> StackMode {
    let conventional = subgraph
        .basic_blocks
        .values()
        .flat_map(|bb| bb.instructions.iter())
        .all(is_expected_stack_use);
    if conventional {
        StackMode::SafeStack
    } else {
        StackMode::UnsafeStack
    }
}

/// Is this instruction's effect on `ESP`/`EBP` (if any) a standard
/// prologue/epilogue form?
fn is_expected_stack_use(inst: &Instruction) -> bool {
    let explicit_dest = |reg: Gpr| -> bool {
        inst.writes_dest() && inst.operands().first() == Some(&Operand::Reg(reg))
    };

    // XCHG with a stack register is never conventional.
    if inst.opcode() == Opcode::Xchg
        && inst.operands().iter().any(|op| {
            matches!(op, Operand::Reg(Gpr::Esp) | Operand::Reg(Gpr::Ebp))
        })
    {
        return false;
    }

    if explicit_dest(Gpr::Esp) {
        return match (inst.opcode(), inst.operands().get(1)) {
            // mov esp, ebp (epilogue)
            (Opcode::Mov, Some(Operand::Reg(Gpr::Ebp))) => true,
            // add/sub esp, imm (frame allocation)
            (Opcode::Add | Opcode::Sub, Some(Operand::Imm(_))) => true,
            _ => false,
        };
    }

    if explicit_dest(Gpr::Ebp) {
        return match (inst.opcode(), inst.operands().get(1)) {
            // mov ebp, esp (prologue)
            (Opcode::Mov, Some(Operand::Reg(Gpr::Esp))) => true,
            // pop ebp (epilogue)
            (Opcode::Pop, None) => true,
            _ => false,
        };
    }

    // Implicit adjustments (push/pop/call/ret/leave/pushfd/popfd) are
    // all conventional.
    true
}
