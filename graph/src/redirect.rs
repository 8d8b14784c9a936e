//! Reference redirection.
//!
//! Transforms accumulate a map of `(target, offset)` pairs to their
//! replacements and apply it in one sweep, either across the whole graph
//! or scoped to a set of referring blocks. Redirection rewrites the
//! block-level reference tables and, for blocks that carry a decoded
//! instruction stream, the instruction-level references too, so a later
//! decomposition sees the redirected targets.

use log::trace;
use rustc_hash::FxHashMap;

use crate::entities::Block;
use crate::graph::BlockGraph;
use crate::inst::RefTarget;

/// Accumulated redirections: `(old target, old offset)` to
/// `(new target, new offset)`.
pub type RedirectMap = FxHashMap<(Block, i32), (Block, i32)>;

/// Apply `map` to every block in the graph.
pub fn apply_redirects(graph: &mut BlockGraph, map: &RedirectMap) {
    let blocks: Vec<Block> = graph.blocks.keys().collect();
    apply_redirects_in(graph, &blocks, map);
}

/// Apply `map` to references originating in `blocks` only.
pub fn apply_redirects_in(graph: &mut BlockGraph, blocks: &[Block], map: &RedirectMap) {
    if map.is_empty() {
        return;
    }
    for &block in blocks {
        let data = &mut graph.blocks[block];
        for reference in data.references.values_mut() {
            if let Some(&(target, offset)) = map.get(&(reference.target, reference.offset)) {
                trace!(
                    "redirecting reference in block{}: {:?} -> {:?}",
                    block.as_u32(),
                    (reference.target, reference.offset),
                    (target, offset),
                );
                reference.target = target;
                reference.offset = offset;
            }
        }
        if let Some(code) = &mut data.code {
            for inst in code {
                inst.retarget_refs(|target, target_offset| match target {
                    RefTarget::Block(b) => match map.get(&(b, target_offset)) {
                        Some(&(new_block, new_offset)) => {
                            (RefTarget::Block(new_block), new_offset)
                        }
                        None => (target, target_offset),
                    },
                    other => (other, target_offset),
                });
            }
        }
    }
}
