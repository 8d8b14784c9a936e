//! Content-hash block identification.
//!
//! Statically linked library functions keep their byte content across
//! images, but their reference fields are fixed up at link time. Hashing
//! with the reference bytes zeroed yields a stable fingerprint that
//! identifies a function regardless of where its callees ended up.

use sha2::{Digest, Sha256};

use crate::entities::Block;
use crate::graph::{BlockData, BlockGraph};

/// A block content fingerprint.
pub type ContentHash = [u8; 32];

/// Hash a block's bytes with all reference fields zeroed.
pub fn content_hash(block: &BlockData) -> ContentHash {
    let mut bytes = block.data.clone();
    for (&offset, reference) in &block.references {
        let start = offset as usize;
        let end = (start + usize::from(reference.size)).min(bytes.len());
        bytes[start..end].fill(0);
    }
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    hasher.finalize().into()
}

/// Parse a lower-case hex fingerprint, as intercept tables spell them.
pub fn parse_hash(hex: &str) -> Option<ContentHash> {
    if hex.len() != 64 {
        return None;
    }
    let mut out = [0u8; 32];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = u8::from_str_radix(hex.get(2 * i..2 * i + 2)?, 16).ok()?;
    }
    Some(out)
}

/// Find all non-external code blocks whose fingerprint is in `hashes`.
pub fn find_blocks_by_hash(graph: &BlockGraph, hashes: &[ContentHash]) -> Vec<Block> {
    if hashes.is_empty() {
        return Vec::new();
    }
    graph
        .blocks
        .iter()
        .filter(|(_, data)| !data.is_external() && !data.data.is_empty())
        .filter(|(_, data)| hashes.contains(&content_hash(data)))
        .map(|(id, _)| id)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{BlockKind, ImageFormat, Reference};

    #[test]
    fn hash_ignores_reference_bytes() {
        let mut graph = BlockGraph::new(ImageFormat::Pe);
        let callee = graph.add_block(BlockKind::Code, "callee");
        let a = graph.add_block(BlockKind::Code, "a");
        let b = graph.add_block(BlockKind::Code, "b");

        // Same code, different fixed-up call targets.
        graph.blocks[a].data = vec![0xe8, 0x11, 0x22, 0x33, 0x44, 0xc3];
        graph.blocks[b].data = vec![0xe8, 0x55, 0x66, 0x77, 0x88, 0xc3];
        graph.set_reference(a, 1, Reference::pc_relative(callee, 0));
        graph.set_reference(b, 1, Reference::pc_relative(callee, 0));

        assert_eq!(
            content_hash(&graph.blocks[a]),
            content_hash(&graph.blocks[b])
        );

        let hash = content_hash(&graph.blocks[a]);
        let found = find_blocks_by_hash(&graph, &[hash]);
        assert_eq!(found, vec![a, b]);
    }

    #[test]
    fn parse_hash_round_trips() {
        let mut graph = BlockGraph::new(ImageFormat::Pe);
        let block = graph.add_block(BlockKind::Code, "f");
        graph.blocks[block].data = vec![0x8b, 0xff, 0x55, 0x8b, 0xec];
        let hash = content_hash(&graph.blocks[block]);
        let hex: String = hash.iter().map(|b| format!("{b:02x}")).collect();
        assert_eq!(parse_hash(&hex), Some(hash));
        assert_eq!(parse_hash("xyz"), None);
    }
}
