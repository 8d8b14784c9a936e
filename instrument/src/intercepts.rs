//! Interceptor redirection.
//!
//! The RTL ships validating replacements for a set of CRT and system
//! functions. Every call site targeting an intercepted function is
//! redirected to the matching `asan_`-prefixed interceptor:
//!
//! - *imported* functions have their IAT-slot references redirected to
//!   the interceptor's IAT slot;
//! - *statically linked* copies are recognized by content hash and get a
//!   one-`jmp` thunk through the interceptor's IAT slot;
//! - in COFF objects both forms reduce to renaming external symbols and
//!   letting the linker bind the interceptors.

use log::{debug, warn};

use pewter_graph::asm::Assembler;
use pewter_graph::builder::build_block;
use pewter_graph::filter::{find_blocks_by_hash, parse_hash};
use pewter_graph::imports::{add_imports, ImportMode, ImportedModule};
use pewter_graph::redirect::RedirectMap;
use pewter_graph::rename::rename_symbols;
use pewter_graph::{
    Block, BlockGraph, GraphError, Instruction, Section, SourceRange,
};

use crate::stubs::RTL_IMPORT_TIMESTAMP;
use crate::{InstrumentError, InstrumentResult};

/// One intercepted function.
#[derive(Clone, Debug)]
pub struct Intercept {
    /// The DLL exporting the function, for the imported path; `None` for
    /// CRT functions that only exist statically linked.
    pub module: Option<String>,
    /// The undecorated name.
    pub name: String,
    /// The decorated (linker-level) name, for COFF renaming.
    pub decorated: Option<String>,
    /// Included only when optional intercepts are enabled.
    pub optional: bool,
    /// Content fingerprints of statically linked copies (lower-case hex
    /// SHA-256), per supported CRT release.
    pub hashes: Vec<String>,
}

impl Intercept {
    /// The interceptor's undecorated import name.
    pub fn interceptor_name(&self) -> String {
        format!("asan_{}", self.name)
    }
}

struct InterceptDef {
    module: Option<&'static str>,
    name: &'static str,
    decorated: Option<&'static str>,
    optional: bool,
}

/// The functions the RTL intercepts. Content fingerprints of statically
/// linked copies vary per CRT release and are filled in by the embedder.
const INTERCEPT_DEFS: &[InterceptDef] = &[
    InterceptDef { module: None, name: "memchr", decorated: Some("_memchr"), optional: false },
    InterceptDef { module: None, name: "memcpy", decorated: Some("_memcpy"), optional: false },
    InterceptDef { module: None, name: "memmove", decorated: Some("_memmove"), optional: false },
    InterceptDef { module: None, name: "memset", decorated: Some("_memset"), optional: false },
    InterceptDef { module: None, name: "strcspn", decorated: Some("_strcspn"), optional: true },
    InterceptDef { module: None, name: "strlen", decorated: Some("_strlen"), optional: false },
    InterceptDef { module: None, name: "strncat", decorated: Some("_strncat"), optional: true },
    InterceptDef { module: None, name: "strncpy", decorated: Some("_strncpy"), optional: true },
    InterceptDef { module: None, name: "strpbrk", decorated: Some("_strpbrk"), optional: true },
    InterceptDef { module: None, name: "strrchr", decorated: Some("_strrchr"), optional: false },
    InterceptDef { module: None, name: "strstr", decorated: Some("_strstr"), optional: false },
    InterceptDef { module: None, name: "wcschr", decorated: Some("_wcschr"), optional: true },
    InterceptDef { module: None, name: "wcsrchr", decorated: Some("_wcsrchr"), optional: true },
    InterceptDef { module: None, name: "wcsstr", decorated: Some("_wcsstr"), optional: true },
    InterceptDef { module: Some("kernel32.dll"), name: "ReadFile", decorated: None, optional: false },
    InterceptDef { module: Some("kernel32.dll"), name: "ReadFileEx", decorated: None, optional: true },
    InterceptDef { module: Some("kernel32.dll"), name: "WriteFile", decorated: None, optional: false },
    InterceptDef { module: Some("kernel32.dll"), name: "WriteFileEx", decorated: None, optional: true },
    InterceptDef { module: Some("kernel32.dll"), name: "HeapAlloc", decorated: None, optional: true },
    InterceptDef { module: Some("kernel32.dll"), name: "HeapFree", decorated: None, optional: true },
    InterceptDef { module: Some("kernel32.dll"), name: "HeapReAlloc", decorated: None, optional: true },
    InterceptDef { module: Some("kernel32.dll"), name: "HeapSize", decorated: None, optional: true },
];

/// The intercept table, with optional entries included or not.
pub fn default_intercepts(use_interceptors: bool) -> Vec<Intercept> {
    INTERCEPT_DEFS
        .iter()
        .filter(|def| use_interceptors || !def.optional)
        .map(|def| Intercept {
            module: def.module.map(str::to_string),
            name: def.name.to_string(),
            decorated: def.decorated.map(str::to_string),
            optional: def.optional,
            hashes: Vec::new(),
        })
        .collect()
}

/// Find statically linked copies of intercepted functions by content
/// hash. Returns `(block, index into intercepts)` pairs.
pub fn find_static_intercepts(
    graph: &BlockGraph,
    intercepts: &[Intercept],
) -> Vec<(Block, usize)> {
    let mut hits = Vec::new();
    for (index, intercept) in intercepts.iter().enumerate() {
        let hashes: Vec<_> = intercept
            .hashes
            .iter()
            .filter_map(|hex| {
                let parsed = parse_hash(hex);
                if parsed.is_none() {
                    warn!("ignoring malformed fingerprint for {}", intercept.name);
                }
                parsed
            })
            .collect();
        for block in find_blocks_by_hash(graph, &hashes) {
            hits.push((block, index));
        }
    }
    hits
}

/// Redirect call sites of *imported* intercepted functions at RTL
/// interceptor imports. PE only; hot-patching mode skips this entirely.
pub fn redirect_imported_intercepts(
    graph: &mut BlockGraph,
    rtl_dll: &str,
    intercepts: &[Intercept],
    redirects: &mut RedirectMap,
) -> InstrumentResult<usize> {
    // Discover which intercepts the image actually imports.
    let mut hits = Vec::new();
    for (index, intercept) in intercepts.iter().enumerate() {
        let Some(module) = &intercept.module else {
            continue;
        };
        for name in [Some(intercept.name.as_str()), intercept.decorated.as_deref()]
            .into_iter()
            .flatten()
        {
            if let Some((module_index, symbol_index)) = graph.imports.find_symbol(module, name) {
                hits.push((index, module_index, symbol_index));
                break;
            }
        }
    }
    if hits.is_empty() {
        return Ok(0);
    }

    let mut rtl = ImportedModule::with_timestamp(rtl_dll, RTL_IMPORT_TIMESTAMP);
    let interceptor_indices: Vec<usize> = hits
        .iter()
        .map(|&(index, _, _)| {
            rtl.add_symbol(&intercepts[index].interceptor_name(), ImportMode::AlwaysImport)
        })
        .collect();
    add_imports(graph, std::slice::from_mut(&mut rtl)).map_err(InstrumentError::ImportFailure)?;

    for (&(index, module_index, symbol_index), &interceptor) in
        hits.iter().zip(&interceptor_indices)
    {
        let original = graph.imports.modules[module_index].slot_reference(symbol_index);
        let replacement = rtl
            .symbol_reference(graph, interceptor)
            .ok_or_else(|| {
                InstrumentError::ImportFailure(GraphError::Build("interceptor did not resolve"))
            })?;
        debug!(
            "redirecting import {} -> {}",
            intercepts[index].name,
            intercepts[index].interceptor_name()
        );
        redirects.insert(
            (original.target, original.offset),
            (replacement.target, replacement.offset),
        );
    }
    Ok(hits.len())
}

/// Redirect statically linked copies of intercepted functions through
/// one-jump thunks at RTL interceptor imports. PE only.
pub fn redirect_static_intercepts(
    graph: &mut BlockGraph,
    rtl_dll: &str,
    intercepts: &[Intercept],
    hits: &[(Block, usize)],
    thunks: Section,
    redirects: &mut RedirectMap,
) -> InstrumentResult<usize> {
    if hits.is_empty() {
        return Ok(0);
    }

    let mut rtl = ImportedModule::with_timestamp(rtl_dll, RTL_IMPORT_TIMESTAMP);
    let interceptor_indices: Vec<usize> = hits
        .iter()
        .map(|&(_, index)| {
            rtl.add_symbol(&intercepts[index].interceptor_name(), ImportMode::AlwaysImport)
        })
        .collect();
    add_imports(graph, std::slice::from_mut(&mut rtl)).map_err(InstrumentError::ImportFailure)?;

    for (&(block, index), &interceptor) in hits.iter().zip(&interceptor_indices) {
        let slot = rtl
            .symbol_reference(graph, interceptor)
            .ok_or_else(|| {
                InstrumentError::ImportFailure(GraphError::Build("interceptor did not resolve"))
            })?;
        let mut body: Vec<Instruction> = Vec::new();
        Assembler::new(&mut body, SourceRange::default())
            .jmp_via_slot(slot)
            .map_err(InstrumentError::ThunkBuildFailure)?;
        let thunk = build_block(
            graph,
            thunks,
            &format!("asan_{}_thunk", intercepts[index].name),
            body,
        )
        .map_err(InstrumentError::ThunkBuildFailure)?;
        debug!(
            "thunking statically linked {} through {}",
            intercepts[index].name,
            intercepts[index].interceptor_name()
        );
        redirects.insert((block, 0), (thunk, 0));
    }
    Ok(hits.len())
}

/// Rename intercepted external symbols to their interceptor forms in a
/// COFF object. A pre-existing definition of any interceptor name is an
/// error.
pub fn rename_coff_intercepts(
    graph: &mut BlockGraph,
    intercepts: &[Intercept],
) -> InstrumentResult<usize> {
    let pairs: Vec<(String, String)> = intercepts
        .iter()
        .filter_map(|intercept| intercept.decorated.as_ref())
        .map(|decorated| (decorated.clone(), format!("asan_{decorated}")))
        .collect();
    rename_symbols(graph, &pairs).map_err(|err| match err {
        GraphError::SymbolCollision(name) => InstrumentError::CoffNameCollision(name),
        other => InstrumentError::TransformFailure(other),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pewter_graph::filter::content_hash;
    use pewter_graph::imports::add_external_symbol;
    use pewter_graph::redirect::apply_redirects;
    use pewter_graph::{characteristics, BlockKind, ImageFormat, Reference};

    #[test]
    fn imported_intercepts_are_redirected_to_the_rtl() {
        let mut graph = BlockGraph::new(ImageFormat::Pe);
        // The image imports ReadFile and calls it from `caller`.
        let mut k32 = ImportedModule::new("kernel32.dll");
        let read_file = k32.add_symbol("ReadFile", ImportMode::AlwaysImport);
        add_imports(&mut graph, std::slice::from_mut(&mut k32)).unwrap();
        let original = k32.symbol_reference(&graph, read_file).unwrap();

        let caller = graph.add_block(BlockKind::Code, "caller");
        graph.blocks[caller].data = vec![0xff, 0x15, 0, 0, 0, 0];
        graph.set_reference(caller, 2, original);

        let intercepts = default_intercepts(false);
        let mut redirects = RedirectMap::default();
        let count = redirect_imported_intercepts(
            &mut graph,
            "syzyasan_rtl.dll",
            &intercepts,
            &mut redirects,
        )
        .unwrap();
        assert_eq!(count, 1);
        apply_redirects(&mut graph, &redirects);

        // The caller now goes through the interceptor's IAT slot.
        let (module_index, symbol_index) = graph
            .imports
            .find_symbol("syzyasan_rtl.dll", "asan_ReadFile")
            .expect("interceptor imported");
        let interceptor = graph.imports.modules[module_index].slot_reference(symbol_index);
        let redirected = graph.reference_at(caller, 2).unwrap();
        assert_eq!(redirected.target, interceptor.target);
        assert_eq!(redirected.offset, interceptor.offset);
    }

    #[test]
    fn static_intercepts_get_a_thunk() {
        let mut graph = BlockGraph::new(ImageFormat::Pe);
        let thunks = graph.add_section(".thunks", characteristics::CODE);

        // A statically linked memset and one call site.
        let memset = graph.add_block(BlockKind::Code, "memset_0");
        graph.blocks[memset].data = vec![0x8b, 0xff, 0x55, 0x8b, 0xec, 0xc3];
        let caller = graph.add_block(BlockKind::Code, "caller");
        graph.blocks[caller].data = vec![0xe8, 0, 0, 0, 0];
        graph.set_reference(caller, 1, Reference::pc_relative(memset, 0));

        let mut intercepts = default_intercepts(false);
        let position = intercepts.iter().position(|i| i.name == "memset").unwrap();
        let hex: String = content_hash(&graph.blocks[memset])
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect();
        intercepts[position].hashes.push(hex);

        let hits = find_static_intercepts(&graph, &intercepts);
        assert_eq!(hits, vec![(memset, position)]);

        let mut redirects = RedirectMap::default();
        redirect_static_intercepts(
            &mut graph,
            "syzyasan_rtl.dll",
            &intercepts,
            &hits,
            thunks,
            &mut redirects,
        )
        .unwrap();
        apply_redirects(&mut graph, &redirects);

        let thunk = graph.find_block("asan_memset_thunk").expect("thunk built");
        assert_eq!(graph.reference_at(caller, 1).unwrap().target, thunk);
        // The thunk jumps through the interceptor's slot.
        let (module_index, symbol_index) = graph
            .imports
            .find_symbol("syzyasan_rtl.dll", "asan_memset")
            .unwrap();
        let slot = graph.imports.modules[module_index].slot_reference(symbol_index);
        let jmp_ref = graph.reference_at(thunk, 2).unwrap();
        assert_eq!((jmp_ref.target, jmp_ref.offset), (slot.target, slot.offset));
    }

    #[test]
    fn coff_rename_covers_both_forms_and_detects_collisions() {
        let mut graph = BlockGraph::new(ImageFormat::Coff);
        add_external_symbol(&mut graph, "_memcpy");
        add_external_symbol(&mut graph, "__imp__memcpy");

        let intercepts = default_intercepts(true);
        let renamed = rename_coff_intercepts(&mut graph, &intercepts).unwrap();
        assert_eq!(renamed, 2);
        assert!(graph.find_block("asan__memcpy").is_some());
        assert!(graph.find_block("__imp_asan__memcpy").is_some());

        // A pre-existing interceptor definition fails the pass.
        let mut graph = BlockGraph::new(ImageFormat::Coff);
        add_external_symbol(&mut graph, "_strlen");
        graph.add_block(BlockKind::Code, "asan__strlen");
        let result = rename_coff_intercepts(&mut graph, &intercepts);
        assert!(matches!(
            result,
            Err(InstrumentError::CoffNameCollision(name)) if name == "asan__strlen"
        ));
    }
}
