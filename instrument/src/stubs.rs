//! Probe import and IAT bootstrapping.
//!
//! On PE images the probes are imported from the RTL with the import
//! descriptor stamped with timestamp 1 (1970-01-01 00:00:01Z). The
//! loader treats such an import as bound long ago and trusts the
//! pre-written IAT values until it rebinds, so the IAT slots are pointed
//! at tiny bootstrap stubs that satisfy the probe ABI as no-ops. That
//! keeps probes callable during sandbox-interposed early execution,
//! before the RTL is actually mapped.
//!
//! On COFF objects none of this machinery exists: probes are referenced
//! as external symbols and the linker supplies their bodies.

use log::debug;

use pewter_graph::asm::Assembler;
use pewter_graph::builder::build_block;
use pewter_graph::imports::{add_external_symbol, add_imports, ImportMode, ImportedModule};
use pewter_graph::{
    Block, BlockGraph, Gpr, ImageFormat, Instruction, MemOperand, Reference, Section, SourceRange,
};

use crate::access::MemoryAccessMode;
use crate::probes::{enumerate_probes, probe_name, ProbeTable};
use crate::{InstrumentError, InstrumentResult};

/// The section all generated stubs and thunks live in.
pub const THUNKS_SECTION: &str = ".thunks";

/// Default RTL DLL.
pub const DEFAULT_RTL_DLL: &str = "syzyasan_rtl.dll";

/// Default RTL DLL in hot-patching mode.
pub const DEFAULT_HP_RTL_DLL: &str = "syzyasan_hp.dll";

/// The bound-import timestamp that makes the loader honor pre-written
/// IAT values until it rebinds. Must stay bit-exact; the RTL's
/// early-loader behavior depends on it.
pub const RTL_IMPORT_TIMESTAMP: u32 = 1;

/// The outcome of probe import.
pub struct ProbeImports {
    /// Probe references keyed by access descriptor.
    pub table: ProbeTable,
    /// The bootstrap stub blocks (PE only, in load/store then instr
    /// order). These must never be instrumented.
    pub stubs: Vec<Block>,
}

/// Import every enumerated probe variant and populate the probe table.
///
/// `thunks` is the section bootstrap stubs are emitted into on PE.
pub fn import_probes(
    graph: &mut BlockGraph,
    rtl_dll: &str,
    thunks: Section,
    use_liveness: bool,
) -> InstrumentResult<ProbeImports> {
    let variants = enumerate_probes(use_liveness);
    let mut table = ProbeTable::new();

    match graph.image_format() {
        ImageFormat::Coff => {
            for info in variants {
                let name = probe_name(&info, ImageFormat::Coff);
                let symbol = add_external_symbol(graph, &name);
                table.insert(info, Reference::pc_relative(symbol, 0));
            }
            Ok(ProbeImports {
                table,
                stubs: Vec::new(),
            })
        }
        ImageFormat::Pe => {
            let mut rtl = ImportedModule::with_timestamp(rtl_dll, RTL_IMPORT_TIMESTAMP);
            let indices: Vec<usize> = variants
                .iter()
                .map(|info| {
                    rtl.add_symbol(&probe_name(info, ImageFormat::Pe), ImportMode::AlwaysImport)
                })
                .collect();
            add_imports(graph, std::slice::from_mut(&mut rtl))
                .map_err(InstrumentError::ImportFailure)?;
            debug!("imported {} probes from {rtl_dll}", indices.len());

            let load_store_stub = build_load_store_stub(graph, thunks)?;
            let instr_stub = build_instr_stub(graph, thunks)?;

            for (info, index) in variants.into_iter().zip(indices) {
                let slot = rtl
                    .symbol_reference(graph, index)
                    .ok_or_else(|| {
                        InstrumentError::ImportFailure(pewter_graph::GraphError::Build(
                            "probe import did not resolve",
                        ))
                    })?;
                let stub = match info.mode {
                    MemoryAccessMode::Read | MemoryAccessMode::Write => load_store_stub,
                    _ => instr_stub,
                };
                // The pre-bind IAT value: point the slot at the stub.
                graph.set_reference(slot.target, slot.offset as u32, Reference::absolute(stub, 0));
                table.insert(info, slot);
            }
            Ok(ProbeImports {
                table,
                stubs: vec![load_store_stub, instr_stub],
            })
        }
    }
}

/// The load/store bootstrap stub.
///
/// Load/store probes are entered with the caller's `EDX` at `[esp+4]`
/// and must restore it and clean up the slot; the stub does exactly that
/// and nothing else.
fn build_load_store_stub(graph: &mut BlockGraph, thunks: Section) -> InstrumentResult<Block> {
    let mut body: Vec<Instruction> = Vec::new();
    let mut asm = Assembler::new(&mut body, SourceRange::default());
    asm.mov_reg_mem(Gpr::Edx, MemOperand::simple(Gpr::Esp, 4, 32))
        .and_then(|()| asm.ret_n(4))
        .map_err(InstrumentError::ThunkBuildFailure)?;
    build_block(graph, thunks, "asan_probe_stub", body).map_err(InstrumentError::ThunkBuildFailure)
}

/// The string-instruction bootstrap stub: a bare near return, since
/// string probes take their arguments from architectural registers and
/// own no stack slot.
fn build_instr_stub(graph: &mut BlockGraph, thunks: Section) -> InstrumentResult<Block> {
    let mut body: Vec<Instruction> = Vec::new();
    let mut asm = Assembler::new(&mut body, SourceRange::default());
    asm.ret().map_err(InstrumentError::ThunkBuildFailure)?;
    build_block(graph, thunks, "asan_string_probe_stub", body)
        .map_err(InstrumentError::ThunkBuildFailure)
}
