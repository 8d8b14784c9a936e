//! Per-basic-block instrumentation.
//!
//! Walks one basic block's instructions, decides which memory accesses
//! to check, and splices the probe call sequence in front of each.
//!
//! The probe ABI is a contract with the RTL:
//!
//! - *Load/store probes*: the caller pushes `EDX`, loads the effective
//!   address of the access (pointing at its last byte) into `EDX` with
//!   `LEA`, and calls the probe. The probe restores `EDX` and cleans up
//!   the slot; it may clobber EFLAGS only in its `_no_flags` variant.
//! - *String probes* (`Instr`/`RepZ`/`RepNZ`): called with no setup at
//!   all; the probe reads `ESI`/`EDI` directly and must preserve every
//!   register, the flags, and the stack.

use log::trace;
use rand::Rng;

use pewter_graph::asm::Assembler;
use pewter_graph::subgraph::BasicBlockData;
use pewter_graph::{EFlags, Gpr, Instruction, MemOperand, Opcode, Seg, SourceRange};

use crate::access::memory_access_of;
#[cfg(test)]
use crate::access::MemoryAccessMode;
use crate::probes::ProbeTable;
use crate::redundancy::RedundancyState;
use crate::stack::StackMode;
use crate::transform::{InstrumentationOptions, InstructionFilter, PassStats};
use crate::{InstrumentError, InstrumentResult};

/// Opcodes that name memory without a checkable access: address
/// computation and cache-control hints.
fn is_exempt_opcode(opcode: Opcode) -> bool {
    opcode == Opcode::Lea || opcode == Opcode::Clflush || opcode.is_prefetch()
}

/// The per-pass instrumentation engine, shared across basic blocks.
pub struct BasicBlockInstrumenter<'a> {
    pub probes: &'a ProbeTable,
    pub options: &'a InstrumentationOptions,
    pub filter: Option<&'a InstructionFilter>,
    /// Effective sampling rate, already clamped to `[0, 1]`.
    pub rate: f64,
}

impl BasicBlockInstrumenter<'_> {
    /// Instrument one basic block in place.
    ///
    /// `exit_flags` holds per-instruction "flags live after" states when
    /// liveness analysis ran, and is empty otherwise. In dry-run mode
    /// nothing is emitted; the return value still reports whether
    /// instrumentation would have happened.
    pub fn instrument_basic_block(
        &self,
        bb: &mut BasicBlockData,
        stack_mode: StackMode,
        exit_flags: &[EFlags],
        mut redundancy: Option<&mut RedundancyState>,
        dry_run: bool,
        stats: &mut PassStats,
    ) -> InstrumentResult<bool> {
        debug_assert!(exit_flags.is_empty() || exit_flags.len() == bb.instructions.len());

        let mut out: Vec<Instruction> = Vec::with_capacity(bb.instructions.len());
        let mut happened = false;

        for (index, inst) in bb.instructions.iter().enumerate() {
            if let Some((operand, mut info)) = memory_access_of(inst) {
                match self.check_decision(inst, &operand, &info, stack_mode, redundancy.as_deref(), stats)
                {
                    Decision::Instrument => {
                        // Select the cheaper probe when the flags are
                        // provably dead here.
                        if !info.mode.is_string()
                            && exit_flags.get(index).is_some_and(|live| live.is_empty())
                        {
                            info.save_flags = false;
                            stats.no_flags_probes += 1;
                        }
                        happened = true;
                        stats.accesses_instrumented += 1;
                        if !dry_run {
                            let probe = self
                                .probes
                                .get(&info)
                                .ok_or(InstrumentError::UnknownProbe(info))?;
                            let source = if self.options.debug_friendly {
                                inst.source()
                            } else {
                                SourceRange::default()
                            };
                            let mut asm = Assembler::new(&mut out, source);
                            if info.mode.is_string() {
                                asm.call_via(probe)
                            } else {
                                asm.push_reg(Gpr::Edx)
                                    .and_then(|()| asm.lea(Gpr::Edx, operand.clone()))
                                    .and_then(|()| asm.call_via(probe))
                            }
                            .map_err(InstrumentError::ThunkBuildFailure)?;
                            trace!("instrumented `{inst}` with {info}");
                        }
                        if let Some(state) = redundancy.as_deref_mut() {
                            state.record(&operand, info.size);
                        }
                    }
                    Decision::Covered => {
                        // Already checked on this path; keep the state
                        // aware of the coverage.
                        if let Some(state) = redundancy.as_deref_mut() {
                            state.record(&operand, info.size);
                        }
                    }
                    Decision::Skip => {}
                }
            }
            if let Some(state) = redundancy.as_deref_mut() {
                state.advance(inst);
            }
            out.push(inst.clone());
        }

        if !dry_run {
            bb.instructions = out;
        }
        Ok(happened)
    }

    fn check_decision(
        &self,
        inst: &Instruction,
        operand: &MemOperand,
        info: &crate::access::MemoryAccessInfo,
        stack_mode: StackMode,
        redundancy: Option<&RedundancyState>,
        stats: &mut PassStats,
    ) -> Decision {
        if let Some(state) = redundancy {
            if state.is_redundant(operand, info.size) {
                stats.elided_redundant += 1;
                return Decision::Covered;
            }
        }

        // A displacement referencing a basic block is a computed jump or
        // case table; one referencing a block is a global access. Neither
        // check is worth anything.
        if operand.disp.target.is_some() {
            stats.elided_reference += 1;
            return Decision::Skip;
        }

        if is_exempt_opcode(inst.opcode()) {
            stats.elided_exempt += 1;
            return Decision::Skip;
        }

        if stack_mode == StackMode::SafeStack
            && matches!(operand.base, Some(Gpr::Esp) | Some(Gpr::Ebp))
        {
            stats.elided_safe_stack += 1;
            return Decision::Skip;
        }

        // TLS and CPU-information accesses live behind FS/GS.
        if matches!(operand.seg, Some(Seg::Fs) | Some(Seg::Gs)) {
            stats.elided_segment += 1;
            return Decision::Skip;
        }

        if let Some(filter) = self.filter {
            if !filter(inst) {
                stats.elided_filtered += 1;
                return Decision::Skip;
            }
        }

        if self.rate < 1.0 && rand::rng().random::<f64>() >= self.rate {
            stats.elided_sampled += 1;
            return Decision::Skip;
        }

        Decision::Instrument
    }
}

enum Decision {
    /// Emit a probe call.
    Instrument,
    /// Redundant with an earlier check; skip but keep the coverage.
    Covered,
    /// Skip entirely.
    Skip,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::MemoryAccessInfo;
    use crate::liveness::FlagsLiveness;
    use crate::stubs::{import_probes, THUNKS_SECTION};
    use pewter_graph::asm::{inst, inst_with_prefixes, string_operands};
    use pewter_graph::subgraph::{decompose, Subgraph};
    use pewter_graph::{
        characteristics, BlockGraph, BlockKind, Displacement, ImageFormat, MemOperand, Operand,
        Prefixes, RefKind, RefTarget, Scale,
    };

    struct Fixture {
        graph: BlockGraph,
        probes: ProbeTable,
        subgraph: Subgraph,
    }

    fn fixture(format: ImageFormat, instructions: Vec<Instruction>) -> Fixture {
        let mut graph = BlockGraph::new(format);
        let thunks = graph.add_section(THUNKS_SECTION, characteristics::CODE);
        let probes = import_probes(&mut graph, "syzyasan_rtl.dll", thunks, true)
            .unwrap()
            .table;
        let block = graph.add_block(BlockKind::Code, "f");
        graph.blocks[block].code = Some(instructions);
        let subgraph = decompose(&graph, block).unwrap();
        Fixture {
            graph,
            probes,
            subgraph,
        }
    }

    fn run(
        fixture: &mut Fixture,
        stack_mode: StackMode,
        use_liveness: bool,
        remove_redundant: bool,
    ) -> (bool, PassStats) {
        let options = InstrumentationOptions::default();
        let instrumenter = BasicBlockInstrumenter {
            probes: &fixture.probes,
            options: &options,
            filter: None,
            rate: 1.0,
        };
        let liveness = use_liveness.then(|| FlagsLiveness::analyze(&fixture.subgraph));
        let mut stats = PassStats::default();
        let mut happened = false;
        let keys: Vec<_> = fixture.subgraph.basic_blocks.keys().collect();
        for bb in keys {
            let exit_flags = liveness
                .as_ref()
                .map(|l| l.exit_states(&fixture.subgraph, bb))
                .unwrap_or_default();
            let mut redundancy = remove_redundant.then(RedundancyState::new);
            happened |= instrumenter
                .instrument_basic_block(
                    &mut fixture.subgraph.basic_blocks[bb],
                    stack_mode,
                    &exit_flags,
                    redundancy.as_mut(),
                    false,
                    &mut stats,
                )
                .unwrap();
        }
        (happened, stats)
    }

    fn opcodes(subgraph: &Subgraph) -> Vec<Opcode> {
        subgraph
            .basic_blocks
            .values()
            .flat_map(|bb| bb.instructions.iter().map(|i| i.opcode()))
            .collect()
    }

    fn probe_ref_of(fixture: &Fixture, info: &MemoryAccessInfo) -> pewter_graph::Reference {
        fixture.probes.get(info).unwrap()
    }

    #[test]
    fn simple_load_gets_push_lea_call() {
        // Scenario: mov eax, [ebx+4] with dead flags afterwards.
        let mut f = fixture(
            ImageFormat::Pe,
            vec![
                inst(
                    Opcode::Mov,
                    &[
                        Operand::Reg(Gpr::Eax),
                        Operand::Smem(MemOperand::simple(Gpr::Ebx, 4, 32)),
                    ],
                ),
                inst(
                    Opcode::Xor,
                    &[Operand::Reg(Gpr::Eax), Operand::Reg(Gpr::Eax)],
                ),
                inst(Opcode::Ret, &[]),
            ],
        );
        let (happened, stats) = run(&mut f, StackMode::UnsafeStack, true, false);
        assert!(happened);
        assert_eq!(stats.accesses_instrumented, 1);
        assert_eq!(stats.no_flags_probes, 1);
        assert_eq!(
            opcodes(&f.subgraph),
            vec![
                Opcode::Push,
                Opcode::Lea,
                Opcode::Call,
                Opcode::Mov,
                Opcode::Xor,
                Opcode::Ret
            ]
        );

        let bb = f.subgraph.basic_blocks.values().next().unwrap();
        let push = &bb.instructions[0];
        assert_eq!(push.operands(), &[Operand::Reg(Gpr::Edx)]);
        let lea = &bb.instructions[1];
        let Operand::Mem(mem) = &lea.operands()[1] else {
            panic!("lea takes a memory operand");
        };
        assert_eq!(mem.base, Some(Gpr::Ebx));
        assert_eq!(mem.disp.value, 7);

        // The call goes through the no-flags probe's IAT slot.
        let call = &bb.instructions[2];
        let expected = probe_ref_of(
            &f,
            &MemoryAccessInfo {
                save_flags: false,
                ..MemoryAccessInfo::read(4)
            },
        );
        let r = &call.refs()[0];
        assert_eq!(r.kind, RefKind::Absolute);
        assert_eq!(r.target, RefTarget::Block(expected.target));
        assert_eq!(r.target_offset, expected.offset);
    }

    #[test]
    fn rep_movs_gets_bare_call() {
        let mut f = fixture(
            ImageFormat::Pe,
            vec![
                inst_with_prefixes(
                    Opcode::Movs,
                    &string_operands(Opcode::Movs, 32),
                    Prefixes::REPZ,
                ),
                inst(Opcode::Ret, &[]),
            ],
        );
        let (happened, _) = run(&mut f, StackMode::UnsafeStack, true, false);
        assert!(happened);
        assert_eq!(
            opcodes(&f.subgraph),
            vec![Opcode::Call, Opcode::Movs, Opcode::Ret]
        );
        let bb = f.subgraph.basic_blocks.values().next().unwrap();
        let expected = probe_ref_of(
            &f,
            &MemoryAccessInfo::string(MemoryAccessMode::RepZ, 4, Opcode::Movs),
        );
        assert_eq!(bb.instructions[0].refs()[0].target_offset, expected.offset);
    }

    #[test]
    fn exempt_opcodes_are_never_instrumented() {
        let mut f = fixture(
            ImageFormat::Pe,
            vec![
                inst(
                    Opcode::Lea,
                    &[
                        Operand::Reg(Gpr::Eax),
                        Operand::Mem(MemOperand::complex(
                            Some(Gpr::Ecx),
                            Some(Gpr::Edx),
                            Scale::Four,
                            0x10,
                            32,
                        )),
                    ],
                ),
                inst(
                    Opcode::Clflush,
                    &[Operand::Smem(MemOperand::simple(Gpr::Eax, 0, 8))],
                ),
                inst(
                    Opcode::Prefetchnta,
                    &[Operand::Smem(MemOperand::simple(Gpr::Eax, 0x40, 8))],
                ),
                inst(Opcode::Ret, &[]),
            ],
        );
        let (happened, stats) = run(&mut f, StackMode::UnsafeStack, true, false);
        assert!(!happened);
        assert_eq!(stats.elided_exempt, 3);
        assert_eq!(
            opcodes(&f.subgraph),
            vec![
                Opcode::Lea,
                Opcode::Clflush,
                Opcode::Prefetchnta,
                Opcode::Ret
            ]
        );
    }

    #[test]
    fn safe_stack_skips_frame_accesses() {
        let store = || {
            vec![
                inst(
                    Opcode::Mov,
                    &[
                        Operand::Smem(MemOperand::simple(Gpr::Ebp, -8, 32)),
                        Operand::Reg(Gpr::Eax),
                    ],
                ),
                inst(Opcode::Ret, &[]),
            ]
        };

        let mut f = fixture(ImageFormat::Pe, store());
        let (happened, stats) = run(&mut f, StackMode::SafeStack, false, false);
        assert!(!happened);
        assert_eq!(stats.elided_safe_stack, 1);

        let mut f = fixture(ImageFormat::Pe, store());
        let (happened, _) = run(&mut f, StackMode::UnsafeStack, false, false);
        assert!(happened);
        // Write probe for size 4 at the last byte: [ebp-5].
        let bb = f.subgraph.basic_blocks.values().next().unwrap();
        let Operand::Mem(mem) = &bb.instructions[1].operands()[1] else {
            panic!("lea takes a memory operand");
        };
        assert_eq!(mem.disp.value, -5);
        let expected = probe_ref_of(&f, &MemoryAccessInfo::write(4));
        assert_eq!(
            bb.instructions[2].refs()[0].target_offset,
            expected.offset
        );
    }

    #[test]
    fn referenced_displacements_are_skipped() {
        let mut f = fixture(
            ImageFormat::Pe,
            vec![
                inst(
                    Opcode::Test,
                    &[Operand::Reg(Gpr::Eax), Operand::Reg(Gpr::Eax)],
                ),
                inst(Opcode::Ret, &[]),
            ],
        );
        // A jump through a case table: the displacement references the
        // table's block, so the access is never instrumented.
        let table = f.graph.add_block(BlockKind::Data, "case_table");
        let jump = inst(
            Opcode::Jmp,
            &[Operand::Mem(MemOperand::complex(
                None,
                Some(Gpr::Eax),
                Scale::Four,
                Displacement::to_target(RefTarget::Block(table), 0),
                32,
            ))],
        );
        let entry = f.subgraph.basic_blocks.keys().next().unwrap();
        f.subgraph.basic_blocks[entry].instructions[0] = jump;

        let (happened, stats) = run(&mut f, StackMode::UnsafeStack, false, false);
        assert!(!happened);
        assert_eq!(stats.elided_reference, 1);
    }

    #[test]
    fn fs_accesses_are_skipped() {
        let mut f = fixture(
            ImageFormat::Pe,
            vec![
                inst(
                    Opcode::Mov,
                    &[
                        Operand::Reg(Gpr::Eax),
                        Operand::Smem(MemOperand::simple(Gpr::Eax, 0, 32).seg(Seg::Fs)),
                    ],
                ),
                inst(Opcode::Ret, &[]),
            ],
        );
        let (happened, stats) = run(&mut f, StackMode::UnsafeStack, false, false);
        assert!(!happened);
        assert_eq!(stats.elided_segment, 1);
    }

    #[test]
    fn redundant_second_access_is_elided() {
        let load = || {
            inst(
                Opcode::Mov,
                &[
                    Operand::Reg(Gpr::Eax),
                    Operand::Smem(MemOperand::simple(Gpr::Ebx, 4, 32)),
                ],
            )
        };
        let mut f = fixture(
            ImageFormat::Pe,
            vec![load(), load(), inst(Opcode::Ret, &[])],
        );
        let (_, stats) = run(&mut f, StackMode::UnsafeStack, false, true);
        assert_eq!(stats.accesses_instrumented, 1);
        assert_eq!(stats.elided_redundant, 1);
    }

    #[test]
    fn coff_probe_calls_are_direct() {
        let mut f = fixture(
            ImageFormat::Coff,
            vec![
                inst(
                    Opcode::Mov,
                    &[
                        Operand::Reg(Gpr::Eax),
                        Operand::Smem(MemOperand::simple(Gpr::Ebx, 4, 32)),
                    ],
                ),
                inst(Opcode::Ret, &[]),
            ],
        );
        let (happened, _) = run(&mut f, StackMode::UnsafeStack, false, false);
        assert!(happened);
        let bb = f.subgraph.basic_blocks.values().next().unwrap();
        let call = &bb.instructions[2];
        assert_eq!(call.bytes()[0], 0xe8);
        assert_eq!(call.refs()[0].kind, RefKind::PcRelative);
        let RefTarget::Block(symbol) = call.refs()[0].target else {
            panic!("direct call targets the probe symbol");
        };
        assert_eq!(
            f.graph.blocks[symbol].name,
            "_asan_check_4_byte_read_access"
        );
    }

    #[test]
    fn dry_run_reports_without_emitting() {
        let mut f = fixture(
            ImageFormat::Pe,
            vec![
                inst(
                    Opcode::Mov,
                    &[
                        Operand::Reg(Gpr::Eax),
                        Operand::Smem(MemOperand::simple(Gpr::Ebx, 4, 32)),
                    ],
                ),
                inst(Opcode::Ret, &[]),
            ],
        );
        let options = InstrumentationOptions::default();
        let instrumenter = BasicBlockInstrumenter {
            probes: &f.probes,
            options: &options,
            filter: None,
            rate: 1.0,
        };
        let mut stats = PassStats::default();
        let entry = f.subgraph.basic_blocks.keys().next().unwrap();
        let happened = instrumenter
            .instrument_basic_block(
                &mut f.subgraph.basic_blocks[entry],
                StackMode::UnsafeStack,
                &[],
                None,
                true,
                &mut stats,
            )
            .unwrap();
        assert!(happened);
        assert_eq!(opcodes(&f.subgraph), vec![Opcode::Mov, Opcode::Ret]);
    }
}
