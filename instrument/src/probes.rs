//! Probe variant enumeration and name mangling.
//!
//! The RTL exports one probe function per access shape. This module
//! enumerates the full variant grid an image may need and maps each
//! [`MemoryAccessInfo`] to the RTL's mangled export name.

use std::collections::BTreeMap;

use pewter_graph::{ImageFormat, Opcode, Reference};

use crate::access::{MemoryAccessInfo, MemoryAccessMode};

/// Access sizes with plain read/write probes.
const ACCESS_SIZES: [u8; 6] = [1, 2, 4, 8, 16, 32];

/// The FPU 80-bit access size.
const FPU_SIZE: u8 = 10;

/// Element sizes of the string-instruction probes.
const STRING_SIZES: [u8; 3] = [1, 2, 4];

/// String instructions with dedicated probes.
const STRING_OPCODES: [Opcode; 4] = [Opcode::Cmps, Opcode::Lods, Opcode::Movs, Opcode::Stos];

/// Enumerate every probe variant an image may need.
///
/// Read/write probes come in a flags-preserving variant and, when
/// liveness analysis will be used, a cheaper `_no_flags` variant. String
/// probes always preserve flags. `REPNZ` only terminates on the
/// comparison result, so only `CMPS` gets `REPNZ` variants.
pub fn enumerate_probes(use_liveness: bool) -> Vec<MemoryAccessInfo> {
    let mut variants = Vec::new();
    let mut push_pair = |info: MemoryAccessInfo| {
        variants.push(info);
        if use_liveness {
            variants.push(MemoryAccessInfo {
                save_flags: false,
                ..info
            });
        }
    };
    for size in ACCESS_SIZES {
        push_pair(MemoryAccessInfo::read(size));
        push_pair(MemoryAccessInfo::write(size));
    }
    push_pair(MemoryAccessInfo::read(FPU_SIZE));
    push_pair(MemoryAccessInfo::write(FPU_SIZE));

    for size in STRING_SIZES {
        for opcode in STRING_OPCODES {
            variants.push(MemoryAccessInfo::string(
                MemoryAccessMode::RepZ,
                size,
                opcode,
            ));
            variants.push(MemoryAccessInfo::string(
                MemoryAccessMode::Instr,
                size,
                opcode,
            ));
            if opcode == Opcode::Cmps {
                variants.push(MemoryAccessInfo::string(
                    MemoryAccessMode::RepNZ,
                    size,
                    opcode,
                ));
            }
        }
    }
    variants
}

/// The RTL export name for a probe variant.
///
/// The grammar is
/// `[prefix] "asan_check" [rep] "_" <size> "_byte_" <op> "_access" [nf]`,
/// where `prefix` is `_` for COFF symbols, `rep` is `_repz`/`_repnz` for
/// the repeated string modes, `op` is `read`/`write` or the mnemonic, and
/// `nf` is `_no_flags` for the flag-clobbering variants.
pub fn probe_name(info: &MemoryAccessInfo, format: ImageFormat) -> String {
    let prefix = match format {
        ImageFormat::Coff => "_",
        ImageFormat::Pe => "",
    };
    let rep = match info.mode {
        MemoryAccessMode::RepZ => "_repz",
        MemoryAccessMode::RepNZ => "_repnz",
        _ => "",
    };
    let op = match info.mode {
        MemoryAccessMode::Read => "read",
        MemoryAccessMode::Write => "write",
        _ => info
            .opcode
            .expect("string modes carry their opcode")
            .mnemonic(),
    };
    let nf = if info.save_flags { "" } else { "_no_flags" };
    format!(
        "{prefix}asan_check{rep}_{size}_byte_{op}_access{nf}",
        size = info.size
    )
}

/// The per-image mapping from access descriptor to probe reference.
///
/// Built once by the probe importer; read-only during per-block work.
/// PE references point at IAT slots, COFF references at external
/// symbols.
#[derive(Debug, Default)]
pub struct ProbeTable {
    map: BTreeMap<MemoryAccessInfo, Reference>,
}

impl ProbeTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the probe reference for `info`.
    pub fn insert(&mut self, info: MemoryAccessInfo, reference: Reference) {
        self.map.insert(info, reference);
    }

    /// Look up the probe for `info`.
    pub fn get(&self, info: &MemoryAccessInfo) -> Option<Reference> {
        self.map.get(info).copied()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Iterate the table in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&MemoryAccessInfo, &Reference)> {
        self.map.iter()
    }
}
