//! Basic-block decomposition of code blocks.
//!
//! A [`Subgraph`] is the editable form of one code block: an ordered
//! collection of basic blocks, each holding decoded instructions and
//! outgoing successor edges. Decomposition splits the block's instruction
//! stream at branch targets and terminators, and retargets intra-block
//! references at the basic blocks it creates; the block builder
//! ([`crate::builder`]) reverses both.

use std::collections::{BTreeSet, HashMap};

use cranelift_entity::PrimaryMap;
use smallvec::SmallVec;

use crate::entities::{BasicBlock, Block};
use crate::graph::BlockGraph;
use crate::inst::{Instruction, Opcode, RefTarget};
use crate::GraphError;

/// An outgoing control-flow edge of a basic block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Successor {
    /// Control continues at another basic block of the same subgraph.
    BasicBlock(BasicBlock),
    /// Control leaves the subgraph: a return, a jump to another block,
    /// or an indirect jump whose targets are unknown.
    External,
}

/// One basic block of a decomposed code block.
#[derive(Clone, Debug)]
pub struct BasicBlockData {
    pub name: String,
    /// Offset of this basic block in the original block.
    pub offset: u32,
    pub instructions: Vec<Instruction>,
    pub successors: SmallVec<[Successor; 2]>,
}

/// The decomposition of one code block.
pub struct Subgraph {
    /// The block this subgraph was decomposed from.
    pub block: Block,
    /// Basic blocks in layout order.
    pub basic_blocks: PrimaryMap<BasicBlock, BasicBlockData>,
}

impl Subgraph {
    /// Total instruction count across all basic blocks.
    pub fn instruction_count(&self) -> usize {
        self.basic_blocks
            .values()
            .map(|bb| bb.instructions.len())
            .sum()
    }
}

/// Decompose `block` into basic blocks.
///
/// The block must carry a decoded instruction stream; blocks without one
/// are not safely decomposable. Branch targets that don't land on an
/// instruction boundary indicate a decoder bug and fail the
/// decomposition.
pub fn decompose(graph: &BlockGraph, block: Block) -> Result<Subgraph, GraphError> {
    let data = &graph.blocks[block];
    let instructions = data
        .code
        .as_ref()
        .ok_or(GraphError::NotDecomposable)?
        .clone();
    if instructions.is_empty() {
        return Ok(Subgraph {
            block,
            basic_blocks: PrimaryMap::new(),
        });
    }

    // Instruction start offsets, and the end offset of the stream.
    let mut starts = HashMap::new();
    let mut offset = 0u32;
    let mut offsets = Vec::with_capacity(instructions.len());
    for (index, inst) in instructions.iter().enumerate() {
        starts.insert(offset, index);
        offsets.push(offset);
        offset += inst.len();
    }

    // Leaders: the entry point, every intra-block branch target, and the
    // instruction after every terminator.
    let mut leaders = BTreeSet::new();
    leaders.insert(0u32);
    for (index, inst) in instructions.iter().enumerate() {
        for r in inst.refs() {
            if r.target == RefTarget::Block(block) {
                leaders.insert(r.target_offset as u32);
            }
        }
        if inst.is_terminator() && index + 1 < instructions.len() {
            leaders.insert(offsets[index + 1]);
        }
    }
    for &leader in &leaders {
        if !starts.contains_key(&leader) {
            return Err(GraphError::Build("branch target inside an instruction"));
        }
    }

    // Partition the stream.
    let mut basic_blocks: PrimaryMap<BasicBlock, BasicBlockData> = PrimaryMap::new();
    let mut bb_at = HashMap::new();
    let leader_list: Vec<u32> = leaders.iter().copied().collect();
    for (i, &start) in leader_list.iter().enumerate() {
        let end = leader_list.get(i + 1).copied().unwrap_or(offset);
        let first = starts[&start];
        let last = instructions
            .iter()
            .enumerate()
            .take_while(|(index, _)| offsets[*index] < end)
            .map(|(index, _)| index)
            .last()
            .unwrap_or(first);
        let name = if start == 0 {
            data.name.clone()
        } else {
            format!("{}+{:#x}", data.name, start)
        };
        let bb = basic_blocks.push(BasicBlockData {
            name,
            offset: start,
            instructions: instructions[first..=last].to_vec(),
            successors: SmallVec::new(),
        });
        bb_at.insert(start, bb);
    }

    // Retarget intra-block references at the basic blocks that now own
    // their targets, and wire up successor edges.
    let keys: Vec<BasicBlock> = basic_blocks.keys().collect();
    for (i, &bb) in keys.iter().enumerate() {
        for inst in &mut basic_blocks[bb].instructions {
            inst.retarget_refs(|target, target_offset| match target {
                RefTarget::Block(b) if b == block => {
                    (RefTarget::BasicBlock(bb_at[&(target_offset as u32)]), 0)
                }
                other => (other, target_offset),
            });
        }

        let next = keys.get(i + 1).copied();
        let mut successors = SmallVec::new();
        match basic_blocks[bb].instructions.last() {
            Some(last) if last.is_terminator() => {
                if last.opcode() != Opcode::Ret {
                    successors.push(branch_successor(last));
                }
                if last.is_conditional_branch() {
                    successors.push(match next {
                        Some(next) => Successor::BasicBlock(next),
                        None => Successor::External,
                    });
                }
                if last.opcode() == Opcode::Ret {
                    successors.push(Successor::External);
                }
            }
            _ => successors.push(match next {
                Some(next) => Successor::BasicBlock(next),
                None => Successor::External,
            }),
        }
        basic_blocks[bb].successors = successors;
    }

    Ok(Subgraph {
        block,
        basic_blocks,
    })
}

/// The successor named by a branch's target field, if known.
fn branch_successor(inst: &Instruction) -> Successor {
    match inst.refs().first() {
        Some(r) => match r.target {
            RefTarget::BasicBlock(bb) => Successor::BasicBlock(bb),
            RefTarget::Block(_) => Successor::External,
        },
        // Indirect branch with an unannotated target.
        None => Successor::External,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::{assemble, inst};
    use crate::graph::{BlockKind, ImageFormat};
    use crate::inst::{Displacement, MemOperand, Operand, Prefixes};
    use crate::reg::Gpr;
    use crate::source::SourceRange;

    fn graph_with_code(instructions: Vec<Instruction>) -> (BlockGraph, Block) {
        let mut graph = BlockGraph::new(ImageFormat::Pe);
        let block = graph.add_block(BlockKind::Code, "func");
        let bytes: Vec<u8> = instructions
            .iter()
            .flat_map(|i| i.bytes().to_vec())
            .collect();
        graph.blocks[block].data = bytes;
        graph.blocks[block].code = Some(instructions);
        (graph, block)
    }

    #[test]
    fn straight_line_is_one_basic_block() {
        let insts = vec![
            inst(
                Opcode::Mov,
                &[
                    Operand::Reg(Gpr::Eax),
                    Operand::Smem(MemOperand::simple(Gpr::Ebx, 4, 32)),
                ],
            ),
            inst(Opcode::Ret, &[]),
        ];
        let (graph, block) = graph_with_code(insts);
        let sg = decompose(&graph, block).unwrap();
        assert_eq!(sg.basic_blocks.len(), 1);
        let bb = sg.basic_blocks.values().next().unwrap();
        assert_eq!(bb.instructions.len(), 2);
        assert_eq!(bb.successors.as_slice(), &[Successor::External]);
    }

    #[test]
    fn conditional_branch_splits_and_retargets() {
        // 0: test eax, eax      (2 bytes)
        // 2: je +8              (6 bytes) -> taken target 10
        // 8: xor eax, eax       (2 bytes)
        // 10: ret
        let (graph, block) = {
            let mut graph = BlockGraph::new(ImageFormat::Pe);
            let block = graph.add_block(BlockKind::Code, "func");
            let insts = vec![
                inst(
                    Opcode::Test,
                    &[Operand::Reg(Gpr::Eax), Operand::Reg(Gpr::Eax)],
                ),
                assemble(
                    Opcode::Je,
                    &[Operand::Pc(Displacement::to_target(
                        RefTarget::Block(block),
                        10,
                    ))],
                    Prefixes::empty(),
                    SourceRange::default(),
                )
                .unwrap(),
                inst(Opcode::Xor, &[Operand::Reg(Gpr::Eax), Operand::Reg(Gpr::Eax)]),
                inst(Opcode::Ret, &[]),
            ];
            graph.blocks[block].code = Some(insts);
            (graph, block)
        };
        let sg = decompose(&graph, block).unwrap();
        assert_eq!(sg.basic_blocks.len(), 3);

        let bbs: Vec<_> = sg.basic_blocks.keys().collect();
        let entry = &sg.basic_blocks[bbs[0]];
        assert_eq!(entry.instructions.len(), 2);
        assert_eq!(
            entry.successors.as_slice(),
            &[
                Successor::BasicBlock(bbs[2]),
                Successor::BasicBlock(bbs[1])
            ]
        );

        // The branch now references the basic block, not the raw offset.
        let je = &entry.instructions[1];
        assert_eq!(je.refs()[0].target, RefTarget::BasicBlock(bbs[2]));
        assert_eq!(sg.basic_blocks[bbs[2]].offset, 10);
    }

    #[test]
    fn undecoded_blocks_are_not_decomposable() {
        let mut graph = BlockGraph::new(ImageFormat::Pe);
        let block = graph.add_block(BlockKind::Code, "opaque");
        graph.blocks[block].data = vec![0xcc; 16];
        assert!(matches!(
            decompose(&graph, block),
            Err(GraphError::NotDecomposable)
        ));
    }
}
