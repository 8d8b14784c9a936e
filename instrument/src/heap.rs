//! CRT heap-initialization patching.
//!
//! The CRT seeds its heap from `GetProcessHeap`, which would hand every
//! allocation to the OS heap and out of the RTL's sight. The patch
//! rewrites the heap-init routines to call a generated thunk equivalent
//! to `HeapCreate(0, 0x1000, 0)` instead, so the RTL owns a private heap
//! from the first allocation.
//!
//! `GetProcessHeap` is reached indirectly through its IAT slot, so the
//! thunk is paired with a 4-byte pointer block holding the thunk's
//! address; redirection swaps the IAT-slot reference for the pointer
//! block, scoped to the heap-init blocks only.

use log::{debug, warn};

use pewter_graph::asm::Assembler;
use pewter_graph::builder::build_block;
use pewter_graph::imports::{add_imports, ImportMode, ImportedModule};
use pewter_graph::redirect::{apply_redirects_in, RedirectMap};
use pewter_graph::{Block, BlockGraph, Instruction, Reference, Section, SourceRange};

use crate::stubs::RTL_IMPORT_TIMESTAMP;
use crate::{InstrumentError, InstrumentResult};

/// Name fragments identifying CRT heap-initialization routines across
/// toolchain generations (VS2012 and VS2015 respectively).
pub const HEAP_INIT_NAMES: [&str; 2] = ["_heap_init", "_acrt_initialize_heap"];

/// The initial size of the private heap.
const PRIVATE_HEAP_INITIAL_SIZE: i32 = 0x1000;

/// Find all CRT heap-initialization blocks.
pub fn find_heap_init_blocks(graph: &BlockGraph) -> Vec<Block> {
    let mut blocks = Vec::new();
    for fragment in HEAP_INIT_NAMES {
        for block in graph.find_blocks_containing(fragment) {
            if !blocks.contains(&block) {
                blocks.push(block);
            }
        }
    }
    blocks
}

/// Rewrite `GetProcessHeap` calls in the heap-init blocks to create a
/// private heap.
///
/// In hot-patching mode `HeapCreate` comes straight from `kernel32.dll`;
/// otherwise the RTL's `asan_HeapCreate` wraps it so the new heap is
/// registered with the runtime.
pub fn patch_heap_init(
    graph: &mut BlockGraph,
    heap_blocks: &[Block],
    thunks: Section,
    rtl_dll: &str,
    hot_patching: bool,
) -> InstrumentResult<bool> {
    if heap_blocks.is_empty() {
        return Ok(false);
    }

    // Locate the GetProcessHeap slot the CRT uses.
    let mut k32 = ImportedModule::new("kernel32.dll");
    let get_process_heap = k32.add_symbol("GetProcessHeap", ImportMode::FindOnly);
    add_imports(graph, std::slice::from_mut(&mut k32)).map_err(InstrumentError::ImportFailure)?;
    let Some(original) = k32.symbol_reference(graph, get_process_heap) else {
        warn!("heap-init blocks present but GetProcessHeap is not imported; not patching");
        return Ok(false);
    };

    // Import the HeapCreate the thunk will call. Only the RTL module
    // carries the bound-import timestamp.
    let mut module = if hot_patching {
        ImportedModule::new("kernel32.dll")
    } else {
        ImportedModule::with_timestamp(rtl_dll, RTL_IMPORT_TIMESTAMP)
    };
    let symbol_name = if hot_patching { "HeapCreate" } else { "asan_HeapCreate" };
    let heap_create = module.add_symbol(symbol_name, ImportMode::AlwaysImport);
    add_imports(graph, std::slice::from_mut(&mut module))
        .map_err(InstrumentError::ImportFailure)?;
    let heap_create_slot = module
        .symbol_reference(graph, heap_create)
        .ok_or_else(|| {
            InstrumentError::ImportFailure(pewter_graph::GraphError::Build(
                "HeapCreate import did not resolve",
            ))
        })?;

    // The thunk: HeapCreate(flOptions=0, dwInitialSize=0x1000,
    // dwMaximumSize=0), arguments pushed right to left. HeapCreate is
    // stdcall, so a bare return suffices.
    let mut body: Vec<Instruction> = Vec::new();
    let mut asm = Assembler::new(&mut body, SourceRange::default());
    asm.push_imm(0)
        .and_then(|()| asm.push_imm(PRIVATE_HEAP_INITIAL_SIZE))
        .and_then(|()| asm.push_imm(0))
        .and_then(|()| asm.call_via(heap_create_slot))
        .and_then(|()| asm.ret())
        .map_err(InstrumentError::ThunkBuildFailure)?;
    let thunk = build_block(graph, thunks, "asan_heap_create", body)
        .map_err(InstrumentError::ThunkBuildFailure)?;

    // The 4-byte pointer block standing in for the IAT slot.
    let pointer = graph.add_data_block(thunks, "asan_heap_create_ptr", vec![0; 4]);
    graph.set_reference(pointer, 0, Reference::absolute(thunk, 0));

    let mut redirects = RedirectMap::default();
    redirects.insert(
        (original.target, original.offset),
        (pointer, 0),
    );
    apply_redirects_in(graph, heap_blocks, &redirects);
    debug!(
        "patched {} heap-init block(s) to use a private heap",
        heap_blocks.len()
    );
    Ok(true)
}
