//! Entity references used across the block graph.
//!
//! Blocks, sections and basic blocks are referenced by compact `u32` indices
//! into tables owned by [`BlockGraph`](crate::BlockGraph) and
//! [`Subgraph`](crate::subgraph::Subgraph) rather than by Rust references.
//! There is a separate index type for each entity type, so we don't lose
//! type safety.

use cranelift_entity::entity_impl;

/// An opaque reference to a block in a [`BlockGraph`](crate::BlockGraph).
///
/// While the order is stable, it is arbitrary and does not resemble the
/// image layout order.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Block(u32);
entity_impl!(Block, "block");

/// An opaque reference to an image section.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Section(u32);
entity_impl!(Section, "section");

/// An opaque reference to a basic block in a
/// [`Subgraph`](crate::subgraph::Subgraph).
///
/// Basic-block references are only meaningful within the subgraph that
/// produced them; they never outlive a rebuild of the original block.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BasicBlock(u32);
entity_impl!(BasicBlock, "bb");
