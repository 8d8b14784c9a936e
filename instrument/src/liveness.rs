//! Arithmetic-flags liveness analysis.
//!
//! A standard backward dataflow over one subgraph: for each instruction,
//! which EFLAGS bits are live at its exit. The instrumenter consumes the
//! per-instruction states walking forward, so [`FlagsLiveness::exit_states`]
//! front-loads them by walking each basic block in reverse under a
//! running state.
//!
//! Control flow leaving the subgraph (returns, jumps to other blocks,
//! indirect branches) is assumed to read every flag; being wrong there
//! only costs a flags-preserving probe where a cheaper one would do.

use cranelift_entity::SecondaryMap;

use pewter_graph::subgraph::{Subgraph, Successor};
use pewter_graph::{BasicBlock, EFlags};

/// Per-subgraph flags liveness.
pub struct FlagsLiveness {
    /// Flags live at entry of each basic block.
    live_in: SecondaryMap<BasicBlock, EFlags>,
}

impl FlagsLiveness {
    /// Run the analysis to a fixpoint.
    pub fn analyze(subgraph: &Subgraph) -> Self {
        let mut live_in: SecondaryMap<BasicBlock, EFlags> =
            SecondaryMap::with_default(EFlags::empty());
        let keys: Vec<BasicBlock> = subgraph.basic_blocks.keys().collect();

        let mut changed = true;
        while changed {
            changed = false;
            for &bb in keys.iter().rev() {
                let mut live = live_out(subgraph, &live_in, bb);
                for inst in subgraph.basic_blocks[bb].instructions.iter().rev() {
                    live = live.difference(inst.flags_defined()) | inst.flags_used();
                }
                if live != live_in[bb] {
                    live_in[bb] = live;
                    changed = true;
                }
            }
        }
        Self { live_in }
    }

    /// Flags live at the *exit* of each instruction of `bb`, in
    /// instruction order.
    pub fn exit_states(&self, subgraph: &Subgraph, bb: BasicBlock) -> Vec<EFlags> {
        let data = &subgraph.basic_blocks[bb];
        let mut states = vec![EFlags::empty(); data.instructions.len()];
        let mut live = live_out(subgraph, &self.live_in, bb);
        for (index, inst) in data.instructions.iter().enumerate().rev() {
            states[index] = live;
            live = live.difference(inst.flags_defined()) | inst.flags_used();
        }
        states
    }
}

fn live_out(
    subgraph: &Subgraph,
    live_in: &SecondaryMap<BasicBlock, EFlags>,
    bb: BasicBlock,
) -> EFlags {
    let mut live = EFlags::empty();
    for successor in &subgraph.basic_blocks[bb].successors {
        live |= match successor {
            Successor::BasicBlock(s) => live_in[*s],
            Successor::External => EFlags::ARITH,
        };
    }
    live
}

#[cfg(test)]
mod tests {
    use super::*;
    use pewter_graph::asm::inst;
    use pewter_graph::subgraph::decompose;
    use pewter_graph::{
        BlockGraph, BlockKind, Gpr, ImageFormat, Instruction, MemOperand, Opcode, Operand,
    };

    fn analyze(instructions: Vec<Instruction>) -> (Vec<EFlags>, usize) {
        let mut graph = BlockGraph::new(ImageFormat::Pe);
        let block = graph.add_block(BlockKind::Code, "f");
        graph.blocks[block].code = Some(instructions);
        let sg = decompose(&graph, block).unwrap();
        let liveness = FlagsLiveness::analyze(&sg);
        let bb = sg.basic_blocks.keys().next().unwrap();
        let states = liveness.exit_states(&sg, bb);
        (states, sg.basic_blocks.len())
    }

    #[test]
    fn flags_dead_before_a_clobber() {
        // mov eax, [ebx+4]; xor eax, eax; ret
        // XOR defines every flag and reads none, so flags are dead at the
        // MOV's exit.
        let (states, bbs) = analyze(vec![
            inst(
                Opcode::Mov,
                &[
                    Operand::Reg(Gpr::Eax),
                    Operand::Smem(MemOperand::simple(Gpr::Ebx, 4, 32)),
                ],
            ),
            inst(Opcode::Xor, &[Operand::Reg(Gpr::Eax), Operand::Reg(Gpr::Eax)]),
            inst(Opcode::Ret, &[]),
        ]);
        assert_eq!(bbs, 1);
        assert!(states[0].is_empty());
        // After the XOR the external boundary keeps everything live.
        assert_eq!(states[1], EFlags::ARITH);
    }

    #[test]
    fn flags_live_at_subgraph_boundary() {
        let (states, _) = analyze(vec![
            inst(
                Opcode::Mov,
                &[
                    Operand::Reg(Gpr::Eax),
                    Operand::Smem(MemOperand::simple(Gpr::Ebx, 4, 32)),
                ],
            ),
            inst(Opcode::Ret, &[]),
        ]);
        assert_eq!(states[0], EFlags::ARITH);
    }

    #[test]
    fn inc_does_not_kill_cf() {
        // add eax, 1 defines all flags; inc eax defines all but CF. A
        // consumer of CF past the inc keeps CF live across it.
        let (states, _) = analyze(vec![
            inst(Opcode::Add, &[Operand::Reg(Gpr::Eax), Operand::Imm(1)]),
            inst(Opcode::Inc, &[Operand::Reg(Gpr::Ecx)]),
            inst(
                Opcode::Adc,
                &[Operand::Reg(Gpr::Eax), Operand::Reg(Gpr::Edx)],
            ),
            inst(Opcode::Ret, &[]),
        ]);
        // At the ADD's exit, CF is live (read by ADC through the INC).
        assert!(states[0].contains(EFlags::CF));
    }
}
