//! The pass driver.
//!
//! [`AsanTransform`] owns the pass state (options, skip set, probe
//! table, redirect map, statistics) and orchestrates the run: a pre-pass
//! that refuses re-entry and imports the probes, the per-block
//! instrumentation loop, and a post-pass that redirects interceptors,
//! patches heap initialization, and embeds RTL parameters.

use log::{debug, info};
use rustc_hash::FxHashSet;

use pewter_graph::builder::rebuild_block;
use pewter_graph::redirect::{apply_redirects, RedirectMap};
use pewter_graph::subgraph::decompose;
use pewter_graph::{
    characteristics, BasicBlock, Block, BlockGraph, BlockKind, EFlags, ImageFormat, Instruction,
};

use crate::heap::{find_heap_init_blocks, patch_heap_init};
use crate::instrumenter::BasicBlockInstrumenter;
use crate::intercepts::{
    default_intercepts, find_static_intercepts, redirect_imported_intercepts,
    redirect_static_intercepts, rename_coff_intercepts, Intercept,
};
use crate::liveness::FlagsLiveness;
use crate::probes::ProbeTable;
use crate::redundancy::RedundancyState;
use crate::stack::analyze_stack;
use crate::stubs::{import_probes, DEFAULT_HP_RTL_DLL, DEFAULT_RTL_DLL, THUNKS_SECTION};
use crate::{InstrumentError, InstrumentResult};

/// The section RTL configuration parameters are embedded in (PE only).
pub const ASAN_PARAMETERS_SECTION: &str = ".asanprm";

/// The section the hot-patching metadata record lives in.
pub const HOT_PATCH_SECTION: &str = ".hpmeta";

/// A caller-provided predicate selecting which instructions may be
/// instrumented.
pub type InstructionFilter = dyn Fn(&Instruction) -> bool + Send + Sync;

/// Pass configuration.
#[derive(Clone, Debug)]
pub struct InstrumentationOptions {
    /// Propagate original source ranges to inserted instructions.
    pub debug_friendly: bool,
    /// Run flags-liveness analysis and use the `_no_flags` probes where
    /// the flags are dead.
    pub use_liveness_analysis: bool,
    /// Elide checks covered by an earlier check in the same basic block.
    pub remove_redundant_checks: bool,
    /// Include the optional entries of the intercept table.
    pub use_interceptors: bool,
    /// Probability of instrumenting any given access; clamped to
    /// `[0, 1]` at pass entry.
    pub instrumentation_rate: f64,
    /// Dry-run instrumentation that prepares blocks for runtime
    /// attachment instead of emitting probe calls.
    pub hot_patching: bool,
    /// Override the RTL DLL name.
    pub rtl_dll_name: Option<String>,
    /// RTL configuration blob to embed in the image (PE only).
    pub rtl_parameters: Option<Vec<u8>>,
}

impl Default for InstrumentationOptions {
    fn default() -> Self {
        Self {
            debug_friendly: false,
            use_liveness_analysis: true,
            remove_redundant_checks: true,
            use_interceptors: true,
            instrumentation_rate: 1.0,
            hot_patching: false,
            rtl_dll_name: None,
            rtl_parameters: None,
        }
    }
}

/// Counters accumulated over one pass run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PassStats {
    pub blocks_visited: usize,
    pub blocks_instrumented: usize,
    pub accesses_instrumented: usize,
    /// Probes downgraded to `_no_flags` variants by liveness.
    pub no_flags_probes: usize,
    pub elided_redundant: usize,
    pub elided_reference: usize,
    pub elided_exempt: usize,
    pub elided_safe_stack: usize,
    pub elided_segment: usize,
    pub elided_filtered: usize,
    pub elided_sampled: usize,
}

/// The AddressSanitizer instrumentation pass.
pub struct AsanTransform {
    options: InstrumentationOptions,
    filter: Option<Box<InstructionFilter>>,
    intercepts: Vec<Intercept>,
    skip: FxHashSet<Block>,
    probes: ProbeTable,
    redirects: RedirectMap,
    stats: PassStats,
    prepared: Vec<Block>,
}

impl AsanTransform {
    pub fn new(options: InstrumentationOptions) -> Self {
        let intercepts = default_intercepts(options.use_interceptors);
        Self {
            options,
            filter: None,
            intercepts,
            skip: FxHashSet::default(),
            probes: ProbeTable::new(),
            redirects: RedirectMap::default(),
            stats: PassStats::default(),
            prepared: Vec::new(),
        }
    }

    /// Restrict instrumentation to instructions accepted by `filter`.
    pub fn set_filter(&mut self, filter: Box<InstructionFilter>) {
        self.filter = Some(filter);
    }

    /// Replace the intercept table (e.g. to supply content fingerprints
    /// for a specific CRT release).
    pub fn set_intercepts(&mut self, intercepts: Vec<Intercept>) {
        self.intercepts = intercepts;
    }

    /// The RTL DLL this pass imports from.
    pub fn rtl_dll_name(&self) -> &str {
        match &self.options.rtl_dll_name {
            Some(name) => name,
            None if self.options.hot_patching => DEFAULT_HP_RTL_DLL,
            None => DEFAULT_RTL_DLL,
        }
    }

    /// Statistics of the last run.
    pub fn stats(&self) -> &PassStats {
        &self.stats
    }

    /// Blocks prepared for runtime attachment (hot-patching mode).
    pub fn prepared_blocks(&self) -> &[Block] {
        &self.prepared
    }

    /// Run the pass over `graph`.
    pub fn apply(&mut self, graph: &mut BlockGraph) -> InstrumentResult<()> {
        if graph.find_section(THUNKS_SECTION).is_some() {
            return Err(InstrumentError::AlreadyInstrumented);
        }
        let rate = self.options.instrumentation_rate.clamp(0.0, 1.0);
        let rtl_dll = self.rtl_dll_name().to_string();
        let format = graph.image_format();
        info!("instrumenting {format:?} image against `{rtl_dll}`");

        // Pre-pass: discovery, then probe import.
        let heap_blocks = find_heap_init_blocks(graph);
        self.skip.extend(heap_blocks.iter().copied());
        let static_hits = match format {
            ImageFormat::Pe => find_static_intercepts(graph, &self.intercepts),
            ImageFormat::Coff => Vec::new(),
        };
        self.skip.extend(static_hits.iter().map(|&(block, _)| block));

        let thunks = graph.add_section(THUNKS_SECTION, characteristics::CODE);
        let imports = import_probes(
            graph,
            &rtl_dll,
            thunks,
            self.options.use_liveness_analysis,
        )?;
        self.skip.extend(imports.stubs.iter().copied());
        self.probes = imports.table;

        // Per-block loop over the blocks that existed at pre-pass time.
        let candidates: Vec<Block> = graph
            .blocks
            .iter()
            .filter(|(block, data)| {
                data.kind == BlockKind::Code
                    && data.code.is_some()
                    && !data.is_external()
                    && data.section.expand() != Some(thunks)
                    && !self.skip.contains(block)
            })
            .map(|(block, _)| block)
            .collect();

        for block in candidates {
            self.stats.blocks_visited += 1;
            // A zero rate short-circuits all per-block work.
            if rate == 0.0 {
                continue;
            }
            self.instrument_block(graph, block, rate)?;
        }

        // Post-pass: interceptors, heap, parameters, metadata.
        if format == ImageFormat::Pe && !self.options.hot_patching {
            redirect_imported_intercepts(graph, &rtl_dll, &self.intercepts, &mut self.redirects)?;
        }
        if format == ImageFormat::Pe {
            redirect_static_intercepts(
                graph,
                &rtl_dll,
                &self.intercepts,
                &static_hits,
                thunks,
                &mut self.redirects,
            )?;
        }
        if format == ImageFormat::Coff {
            rename_coff_intercepts(graph, &self.intercepts)?;
        }
        apply_redirects(graph, &self.redirects);

        patch_heap_init(
            graph,
            &heap_blocks,
            thunks,
            &rtl_dll,
            self.options.hot_patching,
        )?;

        if format == ImageFormat::Pe {
            if let Some(parameters) = &self.options.rtl_parameters {
                let section = graph.add_section(ASAN_PARAMETERS_SECTION, characteristics::DATA);
                graph.add_data_block(section, "asan_parameters", parameters.clone());
                debug!("embedded {} bytes of RTL parameters", parameters.len());
            }
        }

        if self.options.hot_patching {
            self.emit_hot_patch_metadata(graph);
        }

        debug!("pass complete: {:?}", self.stats);
        Ok(())
    }

    fn instrument_block(
        &mut self,
        graph: &mut BlockGraph,
        block: Block,
        rate: f64,
    ) -> InstrumentResult<()> {
        let mut subgraph = decompose(graph, block).map_err(InstrumentError::TransformFailure)?;
        let stack_mode = analyze_stack(&subgraph);
        let liveness = self
            .options
            .use_liveness_analysis
            .then(|| FlagsLiveness::analyze(&subgraph));

        let keys: Vec<BasicBlock> = subgraph.basic_blocks.keys().collect();
        let flag_states: Vec<Vec<EFlags>> = keys
            .iter()
            .map(|&bb| {
                liveness
                    .as_ref()
                    .map(|l| l.exit_states(&subgraph, bb))
                    .unwrap_or_default()
            })
            .collect();

        let instrumenter = BasicBlockInstrumenter {
            probes: &self.probes,
            options: &self.options,
            filter: self.filter.as_deref(),
            rate,
        };
        let dry_run = self.options.hot_patching;
        let mut happened = false;
        for (index, &bb) in keys.iter().enumerate() {
            let mut redundancy = self
                .options
                .remove_redundant_checks
                .then(RedundancyState::new);
            happened |= instrumenter.instrument_basic_block(
                &mut subgraph.basic_blocks[bb],
                stack_mode,
                &flag_states[index],
                redundancy.as_mut(),
                dry_run,
                &mut self.stats,
            )?;
        }

        if happened {
            self.stats.blocks_instrumented += 1;
            if dry_run {
                self.prepared.push(block);
            } else {
                rebuild_block(graph, &subgraph).map_err(InstrumentError::TransformFailure)?;
            }
        }
        Ok(())
    }

    /// Append the hot-patch metadata record: a count followed by
    /// length-prefixed names of the prepared blocks, for the runtime
    /// attachment machinery to find.
    fn emit_hot_patch_metadata(&self, graph: &mut BlockGraph) {
        let mut payload = Vec::new();
        payload.extend_from_slice(&(self.prepared.len() as u32).to_le_bytes());
        for &block in &self.prepared {
            let name = graph.blocks[block].name.as_bytes();
            payload.extend_from_slice(&(name.len() as u32).to_le_bytes());
            payload.extend_from_slice(name);
        }
        let section = graph.add_section(HOT_PATCH_SECTION, characteristics::DATA);
        graph.add_data_block(section, "hot_patch_metadata", payload);
        debug!(
            "recorded {} block(s) for runtime attachment",
            self.prepared.len()
        );
    }
}
