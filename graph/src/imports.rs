//! The image import model and the add-imports transform.
//!
//! PE graphs carry an import table: one entry per DLL, each owning a
//! 4-byte IAT slot per imported symbol. Transforms declare the imports
//! they need through [`ImportedModule`] and resolve them in one batch with
//! [`add_imports`]; resolved symbols yield [`Reference`]s to their IAT
//! slots that can be planted in emitted code.
//!
//! COFF objects have no import machinery here; external symbols are
//! modeled as zero-sized [`EXTERNAL`](crate::BlockAttributes::EXTERNAL)
//! blocks created by [`add_external_symbol`].

use log::debug;

use crate::entities::Block;
use crate::graph::{characteristics, BlockAttributes, BlockGraph, BlockKind, Reference};
use crate::GraphError;

/// The section generated IAT storage is placed in.
const IMPORT_SECTION: &str = ".idata";

/// One imported DLL and its IAT storage.
#[derive(Clone, Debug)]
pub struct ImportModuleData {
    pub dll_name: String,
    /// The bound-import timestamp stamped into the module's
    /// `IMAGE_IMPORT_DESCRIPTOR` at serialization.
    pub timestamp: u32,
    pub symbols: Vec<String>,
    /// The data block holding the module's IAT; symbol `i` owns the
    /// 4-byte slot at offset `4 * i`.
    pub iat_block: Block,
}

impl ImportModuleData {
    /// The IAT slot reference for symbol `index`.
    pub fn slot_reference(&self, index: usize) -> Reference {
        Reference::absolute(self.iat_block, (index * 4) as i32)
    }
}

/// All imports of a PE image.
#[derive(Clone, Debug, Default)]
pub struct ImportTable {
    pub modules: Vec<ImportModuleData>,
}

impl ImportTable {
    /// Find a module by DLL name (case-insensitive, as the loader is).
    pub fn find_module(&self, dll_name: &str) -> Option<usize> {
        self.modules
            .iter()
            .position(|m| m.dll_name.eq_ignore_ascii_case(dll_name))
    }

    /// Find a symbol, returning `(module index, symbol index)`.
    pub fn find_symbol(&self, dll_name: &str, symbol: &str) -> Option<(usize, usize)> {
        let module = self.find_module(dll_name)?;
        let index = self.modules[module]
            .symbols
            .iter()
            .position(|s| s == symbol)?;
        Some((module, index))
    }
}

/// Whether a declared symbol must be imported or only located.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImportMode {
    /// Import the symbol, adding it if the image doesn't already.
    AlwaysImport,
    /// Resolve the symbol only if the image already imports it.
    FindOnly,
}

/// A module whose imports a transform wants resolved.
///
/// Mirrors the two-phase protocol of the underlying transform: declare
/// symbols up front, run [`add_imports`] once, then query the resolved
/// slot references.
#[derive(Debug)]
pub struct ImportedModule {
    dll_name: String,
    timestamp: Option<u32>,
    symbols: Vec<(String, ImportMode)>,
    /// Filled by `add_imports`: `(module index, symbol index)` per
    /// declared symbol.
    resolved: Vec<Option<(usize, usize)>>,
}

impl ImportedModule {
    pub fn new(dll_name: &str) -> Self {
        Self {
            dll_name: dll_name.to_string(),
            timestamp: None,
            symbols: Vec::new(),
            resolved: Vec::new(),
        }
    }

    /// Request a specific bound-import timestamp for the module's import
    /// descriptor.
    pub fn with_timestamp(dll_name: &str, timestamp: u32) -> Self {
        let mut module = Self::new(dll_name);
        module.timestamp = Some(timestamp);
        module
    }

    pub fn dll_name(&self) -> &str {
        &self.dll_name
    }

    /// Declare a symbol; returns its index for later queries.
    pub fn add_symbol(&mut self, name: &str, mode: ImportMode) -> usize {
        self.symbols.push((name.to_string(), mode));
        self.symbols.len() - 1
    }

    /// Was the declared symbol resolved by `add_imports`?
    pub fn imported(&self, index: usize) -> bool {
        self.resolved.get(index).is_some_and(|r| r.is_some())
    }

    /// The IAT slot reference of a resolved symbol.
    pub fn symbol_reference(&self, graph: &BlockGraph, index: usize) -> Option<Reference> {
        let (module, symbol) = (*self.resolved.get(index)?)?;
        Some(graph.imports.modules[module].slot_reference(symbol))
    }
}

/// Resolve the declared imports of `modules` against `graph`, creating
/// modules, symbols and IAT storage as needed.
pub fn add_imports(graph: &mut BlockGraph, modules: &mut [ImportedModule]) -> Result<(), GraphError> {
    for module in modules {
        module.resolved.clear();

        let needs_module = module
            .symbols
            .iter()
            .any(|(_, mode)| *mode == ImportMode::AlwaysImport);
        let mut module_index = graph.imports.find_module(&module.dll_name);
        if module_index.is_none() && needs_module {
            let section = graph.add_section(IMPORT_SECTION, characteristics::WRITABLE_DATA);
            let iat_name = format!("{}:iat", module.dll_name);
            let iat_block = graph.add_data_block(section, &iat_name, Vec::new());
            debug!("adding import module {}", module.dll_name);
            graph.imports.modules.push(ImportModuleData {
                dll_name: module.dll_name.clone(),
                timestamp: module.timestamp.unwrap_or(0),
                symbols: Vec::new(),
                iat_block,
            });
            module_index = Some(graph.imports.modules.len() - 1);
        }

        let Some(module_index) = module_index else {
            // FindOnly against an absent module: nothing resolves.
            module.resolved.resize(module.symbols.len(), None);
            continue;
        };

        if let Some(timestamp) = module.timestamp {
            graph.imports.modules[module_index].timestamp = timestamp;
        }

        for (name, mode) in &module.symbols {
            let existing = graph.imports.modules[module_index]
                .symbols
                .iter()
                .position(|s| s == name);
            let resolved = match (existing, mode) {
                (Some(index), _) => Some((module_index, index)),
                (None, ImportMode::AlwaysImport) => {
                    let entry = &mut graph.imports.modules[module_index];
                    entry.symbols.push(name.clone());
                    let index = entry.symbols.len() - 1;
                    let iat_block = entry.iat_block;
                    graph.blocks[iat_block].data.extend_from_slice(&[0; 4]);
                    Some((module_index, index))
                }
                (None, ImportMode::FindOnly) => None,
            };
            module.resolved.push(resolved);
        }
    }
    Ok(())
}

/// Find or create the zero-sized external-symbol block for `name`.
///
/// COFF references to undefined symbols target these placeholders; the
/// linker substitutes the real definition.
pub fn add_external_symbol(graph: &mut BlockGraph, name: &str) -> Block {
    if let Some(existing) = graph
        .blocks
        .iter()
        .find(|(_, b)| b.is_external() && b.name == name)
        .map(|(id, _)| id)
    {
        return existing;
    }
    let block = graph.add_block(BlockKind::Code, name);
    graph.blocks[block].attributes |= BlockAttributes::EXTERNAL;
    block
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::ImageFormat;

    #[test]
    fn always_import_creates_module_and_slots() {
        let mut graph = BlockGraph::new(ImageFormat::Pe);
        let mut rtl = ImportedModule::with_timestamp("test_rtl.dll", 1);
        let a = rtl.add_symbol("probe_a", ImportMode::AlwaysImport);
        let b = rtl.add_symbol("probe_b", ImportMode::AlwaysImport);
        add_imports(&mut graph, std::slice::from_mut(&mut rtl)).unwrap();

        assert!(rtl.imported(a) && rtl.imported(b));
        let module = &graph.imports.modules[0];
        assert_eq!(module.timestamp, 1);
        assert_eq!(graph.blocks[module.iat_block].size(), 8);

        let ref_b = rtl.symbol_reference(&graph, b).unwrap();
        assert_eq!(ref_b.target, module.iat_block);
        assert_eq!(ref_b.offset, 4);
    }

    #[test]
    fn find_only_does_not_create() {
        let mut graph = BlockGraph::new(ImageFormat::Pe);
        let mut k32 = ImportedModule::new("kernel32.dll");
        let sym = k32.add_symbol("GetProcessHeap", ImportMode::FindOnly);
        add_imports(&mut graph, std::slice::from_mut(&mut k32)).unwrap();
        assert!(!k32.imported(sym));
        assert!(graph.imports.modules.is_empty());
    }

    #[test]
    fn existing_symbols_resolve_in_place() {
        let mut graph = BlockGraph::new(ImageFormat::Pe);
        let mut k32 = ImportedModule::new("kernel32.dll");
        let heap = k32.add_symbol("HeapAlloc", ImportMode::AlwaysImport);
        add_imports(&mut graph, std::slice::from_mut(&mut k32)).unwrap();
        let first = k32.symbol_reference(&graph, heap).unwrap();

        // Resolving the same symbol again finds the same slot, even with a
        // differently-cased DLL name.
        let mut again = ImportedModule::new("KERNEL32.dll");
        let heap = again.add_symbol("HeapAlloc", ImportMode::FindOnly);
        add_imports(&mut graph, std::slice::from_mut(&mut again)).unwrap();
        assert!(again.imported(heap));
        assert_eq!(again.symbol_reference(&graph, heap).unwrap(), first);
    }

    #[test]
    fn external_symbols_dedupe() {
        let mut graph = BlockGraph::new(ImageFormat::Coff);
        let a = add_external_symbol(&mut graph, "_asan_check_4_byte_read_access");
        let b = add_external_symbol(&mut graph, "_asan_check_4_byte_read_access");
        assert_eq!(a, b);
        assert!(graph.blocks[a].is_external());
        assert_eq!(graph.blocks[a].size(), 0);
    }
}
