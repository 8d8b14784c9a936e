//! Block-graph representation of decomposed 32-bit PE/COFF images.
//!
//! A block graph is the unit transforms operate on: a collection of
//! named, typed blocks (code or data) with typed references between
//! them, plus image-level metadata (format, sections, imports). This
//! crate provides the data model and the primitives transforms build on:
//!
//! - basic-block decomposition of code blocks and the inverse block
//!   builder ([`subgraph`], [`builder`]);
//! - a 32-bit x86 assembler for the instruction forms transforms emit
//!   ([`asm`]);
//! - graph-level transforms: import resolution ([`imports`]), symbol
//!   renaming ([`rename`]), reference redirection ([`redirect`]), and
//!   content-hash block identification ([`filter`]).
//!
//! Decoding raw bytes into instructions is out of scope; the graph
//! carries the *output* of a decoder, and the assembler produces the same
//! representation for synthesized code.

pub mod asm;
pub mod builder;
mod entities;
pub mod filter;
mod graph;
pub mod imports;
mod inst;
pub mod redirect;
mod reg;
pub mod rename;
mod source;
pub mod subgraph;

pub use crate::entities::{BasicBlock, Block, Section};
pub use crate::graph::{
    characteristics, BlockAttributes, BlockData, BlockGraph, BlockKind, ImageFormat, RefKind,
    Reference, SectionData,
};
pub use crate::inst::{
    Displacement, EFlags, InstRef, Instruction, MemOperand, Opcode, Operand, Prefixes, RefTarget,
    Scale,
};
pub use crate::reg::{Gpr, Seg};
pub use crate::source::SourceRange;

use thiserror::Error;

/// Errors produced by graph primitives and transforms.
#[derive(Error, Debug)]
pub enum GraphError {
    /// The requested instruction form has no encoding here.
    #[error("cannot encode `{0}` with the given operands")]
    Encoding(Opcode),
    /// An operand violates an architectural constraint.
    #[error("invalid operand: {0}")]
    InvalidOperand(&'static str),
    /// The block carries no decoded instruction stream.
    #[error("block is not safely decomposable")]
    NotDecomposable,
    /// A rename would double-define a symbol.
    #[error("symbol `{0}` is already defined")]
    SymbolCollision(String),
    /// The block builder rejected its input.
    #[error("block build failed: {0}")]
    Build(&'static str),
}
