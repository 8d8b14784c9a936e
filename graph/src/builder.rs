//! Rebuilding blocks from subgraphs.
//!
//! The builder is the inverse of decomposition: it lays the basic blocks
//! of a [`Subgraph`] out in order, concatenates their instruction bytes,
//! and lowers instruction-level references back to block-level
//! references, resolving basic-block targets to their final offsets.
//! It is also the way synthesized code (stubs, thunks) becomes a block.

use std::collections::BTreeMap;

use cranelift_entity::SecondaryMap;
use log::trace;

use crate::entities::{BasicBlock, Block, Section};
use crate::graph::{BlockData, BlockGraph, BlockKind, RefKind, Reference};
use crate::inst::{Instruction, RefTarget};
use crate::subgraph::Subgraph;
use crate::GraphError;

/// Lay out `instructions` as block content.
///
/// `bb_offsets` resolves basic-block reference targets; pass an empty map
/// when building a fresh block, whose instructions may only reference
/// graph blocks.
fn layout(
    this: Block,
    instructions: &[Instruction],
    bb_offsets: &SecondaryMap<BasicBlock, u32>,
    allow_bb_refs: bool,
) -> Result<(Vec<u8>, BTreeMap<u32, Reference>), GraphError> {
    let mut bytes = Vec::new();
    let mut references = BTreeMap::new();
    for inst in instructions {
        let inst_offset = bytes.len() as u32;
        bytes.extend_from_slice(inst.bytes());
        for r in inst.refs() {
            let (target, target_offset) = match r.target {
                RefTarget::Block(b) => (b, r.target_offset),
                RefTarget::BasicBlock(bb) => {
                    if !allow_bb_refs {
                        return Err(GraphError::Build(
                            "basic-block reference in a fresh block",
                        ));
                    }
                    (this, bb_offsets[bb] as i32 + r.target_offset)
                }
            };
            let field_offset = inst_offset + u32::from(r.offset);
            // Intra-block PC-relative fields can be resolved right here;
            // everything else waits for image layout.
            if r.kind == RefKind::PcRelative && target == this {
                let rel = target_offset - (field_offset as i32 + i32::from(r.size));
                bytes[field_offset as usize..field_offset as usize + 4]
                    .copy_from_slice(&rel.to_le_bytes());
            }
            references.insert(
                field_offset,
                Reference {
                    kind: r.kind,
                    size: r.size,
                    target,
                    offset: target_offset,
                },
            );
        }
    }
    Ok((bytes, references))
}

/// Write a transformed subgraph back into the block it came from.
///
/// An untouched subgraph rebuilds to byte-identical content.
pub fn rebuild_block(graph: &mut BlockGraph, subgraph: &Subgraph) -> Result<(), GraphError> {
    let this = subgraph.block;

    let mut bb_offsets = SecondaryMap::with_default(0);
    let mut offset = 0u32;
    for (bb, data) in subgraph.basic_blocks.iter() {
        bb_offsets[bb] = offset;
        offset += data.instructions.iter().map(Instruction::len).sum::<u32>();
    }

    let mut flat: Vec<Instruction> = Vec::new();
    for data in subgraph.basic_blocks.values() {
        flat.extend(data.instructions.iter().cloned());
    }
    // The stored stream refers to block offsets again, so the block can
    // be decomposed anew later.
    for inst in &mut flat {
        inst.retarget_refs(|target, target_offset| match target {
            RefTarget::BasicBlock(bb) => {
                (RefTarget::Block(this), bb_offsets[bb] as i32 + target_offset)
            }
            other => (other, target_offset),
        });
    }

    let (bytes, references) = layout(this, &flat, &bb_offsets, true)?;
    trace!(
        "rebuilt {}: {} -> {} bytes",
        graph.blocks[this].name,
        graph.blocks[this].size(),
        bytes.len()
    );

    let data = &mut graph.blocks[this];
    data.data = bytes;
    data.references = references;
    data.code = Some(flat);
    Ok(())
}

/// Materialize `instructions` as a fresh code block in `section`.
pub fn build_block(
    graph: &mut BlockGraph,
    section: Section,
    name: &str,
    instructions: Vec<Instruction>,
) -> Result<Block, GraphError> {
    let block = graph.add_block(BlockKind::Code, name);
    let (bytes, references) = layout(block, &instructions, &SecondaryMap::with_default(0), false)?;
    let data: &mut BlockData = &mut graph.blocks[block];
    data.section = section.into();
    data.data = bytes;
    data.references = references;
    data.code = Some(instructions);
    Ok(block)
}
