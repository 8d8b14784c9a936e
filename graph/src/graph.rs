//! The block graph: named, typed blocks with references between them.
//!
//! A [`BlockGraph`] is the in-memory representation of a decomposed PE
//! image or COFF object: every function, global, and header chunk is a
//! block, and every relocation, call, and data pointer between them is a
//! [`Reference`]. Transforms mutate the graph; serialization back to an
//! image happens elsewhere.

use std::collections::BTreeMap;

use bitflags::bitflags;
use cranelift_entity::packed_option::PackedOption;
use cranelift_entity::PrimaryMap;

use crate::entities::{Block, Section};
use crate::imports::ImportTable;
use crate::inst::Instruction;

/// The format of the image this graph was decomposed from.
///
/// The format fixes how imports and calls are materialized: PE images
/// call probes through IAT slots, COFF objects reference them as external
/// symbols the linker resolves.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImageFormat {
    Pe,
    Coff,
}

/// The kind of a block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockKind {
    Code,
    Data,
}

impl Default for BlockKind {
    fn default() -> Self {
        BlockKind::Data
    }
}

bitflags! {
    /// Properties of a block beyond its kind.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct BlockAttributes: u8 {
        /// The block is an undefined external symbol (COFF); it owns no
        /// bytes and the linker supplies its body.
        const EXTERNAL = 1 << 0;
        /// Padding or gap bytes; never instrumented.
        const PADDING = 1 << 1;
    }
}

/// How a reference is encoded in the referring block.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RefKind {
    /// An absolute address, fixed up by a base relocation.
    Absolute,
    /// A PC-relative offset.
    PcRelative,
}

/// A typed link from a byte range in one block to a location in another.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Reference {
    pub kind: RefKind,
    /// Size of the reference field in bytes.
    pub size: u8,
    pub target: Block,
    /// Offset into the target block.
    pub offset: i32,
}

impl Reference {
    /// A 4-byte absolute reference.
    pub fn absolute(target: Block, offset: i32) -> Self {
        Self {
            kind: RefKind::Absolute,
            size: 4,
            target,
            offset,
        }
    }

    /// A 4-byte PC-relative reference.
    pub fn pc_relative(target: Block, offset: i32) -> Self {
        Self {
            kind: RefKind::PcRelative,
            size: 4,
            target,
            offset,
        }
    }
}

/// PE section characteristics (the `IMAGE_SCN_*` bits this crate needs).
pub mod characteristics {
    pub const CNT_CODE: u32 = 0x0000_0020;
    pub const CNT_INITIALIZED_DATA: u32 = 0x0000_0040;
    pub const MEM_EXECUTE: u32 = 0x2000_0000;
    pub const MEM_READ: u32 = 0x4000_0000;
    pub const MEM_WRITE: u32 = 0x8000_0000;

    /// Characteristics for a generated code section.
    pub const CODE: u32 = CNT_CODE | MEM_EXECUTE | MEM_READ;
    /// Characteristics for a generated read-only data section.
    pub const DATA: u32 = CNT_INITIALIZED_DATA | MEM_READ;
    /// Characteristics for a generated writable data section.
    pub const WRITABLE_DATA: u32 = CNT_INITIALIZED_DATA | MEM_READ | MEM_WRITE;
}

/// An image section.
#[derive(Clone, Debug)]
pub struct SectionData {
    pub name: String,
    pub characteristics: u32,
}

/// One block of the graph.
#[derive(Clone, Debug, Default)]
pub struct BlockData {
    pub name: String,
    pub kind: BlockKind,
    pub attributes: BlockAttributes,
    pub section: PackedOption<Section>,
    /// The raw bytes of the block.
    pub data: Vec<u8>,
    /// Outgoing references, keyed by offset in `data`.
    pub references: BTreeMap<u32, Reference>,
    /// For safely-decomposable code blocks, the decoded instruction
    /// stream `data` was produced from. Code blocks without a stream are
    /// not decomposable and are skipped by transforms that need one.
    pub code: Option<Vec<Instruction>>,
}

impl BlockData {
    /// Size of the block in bytes.
    pub fn size(&self) -> u32 {
        self.data.len() as u32
    }

    pub fn is_external(&self) -> bool {
        self.attributes.contains(BlockAttributes::EXTERNAL)
    }
}

/// The block graph of one image.
pub struct BlockGraph {
    format: ImageFormat,
    pub blocks: PrimaryMap<Block, BlockData>,
    pub sections: PrimaryMap<Section, SectionData>,
    /// The PE import table model. Unused for COFF graphs.
    pub imports: ImportTable,
}

impl BlockGraph {
    /// Create an empty graph for an image of the given format.
    pub fn new(format: ImageFormat) -> Self {
        Self {
            format,
            blocks: PrimaryMap::new(),
            sections: PrimaryMap::new(),
            imports: ImportTable::default(),
        }
    }

    /// The image format of this graph.
    pub fn image_format(&self) -> ImageFormat {
        self.format
    }

    /// Find a section by name.
    pub fn find_section(&self, name: &str) -> Option<Section> {
        self.sections
            .iter()
            .find(|(_, s)| s.name == name)
            .map(|(id, _)| id)
    }

    /// Find a section by name, creating it if absent.
    pub fn add_section(&mut self, name: &str, characteristics: u32) -> Section {
        if let Some(existing) = self.find_section(name) {
            return existing;
        }
        self.sections.push(SectionData {
            name: name.to_string(),
            characteristics,
        })
    }

    /// Add an empty block.
    pub fn add_block(&mut self, kind: BlockKind, name: &str) -> Block {
        self.blocks.push(BlockData {
            name: name.to_string(),
            kind,
            ..Default::default()
        })
    }

    /// Add a data block with the given bytes, placed in `section`.
    pub fn add_data_block(&mut self, section: Section, name: &str, data: Vec<u8>) -> Block {
        self.blocks.push(BlockData {
            name: name.to_string(),
            kind: BlockKind::Data,
            section: section.into(),
            data,
            ..Default::default()
        })
    }

    /// Set (or replace) the reference at `offset` in `block`.
    pub fn set_reference(&mut self, block: Block, offset: u32, reference: Reference) {
        self.blocks[block].references.insert(offset, reference);
    }

    /// The reference at `offset` in `block`, if any.
    pub fn reference_at(&self, block: Block, offset: u32) -> Option<Reference> {
        self.blocks[block].references.get(&offset).copied()
    }

    /// Find a block by exact name.
    pub fn find_block(&self, name: &str) -> Option<Block> {
        self.blocks
            .iter()
            .find(|(_, b)| b.name == name)
            .map(|(id, _)| id)
    }

    /// Find all blocks whose name contains `needle`.
    pub fn find_blocks_containing(&self, needle: &str) -> Vec<Block> {
        self.blocks
            .iter()
            .filter(|(_, b)| b.name.contains(needle))
            .map(|(id, _)| id)
            .collect()
    }
}
