//! Symbol renaming for COFF graphs.
//!
//! Renames external symbols in place, covering both the direct form and
//! the `__imp_` import form of each name. Renaming onto a name the
//! object already defines is an error; silently double-defining a symbol
//! would leave the link outcome to chance.

use log::debug;
use rustc_hash::FxHashSet;

use crate::graph::BlockGraph;
use crate::GraphError;

/// Prefix of import-form symbol names.
const IMP_PREFIX: &str = "__imp_";

/// Rename every external symbol matching a `(from, to)` pair, including
/// the `__imp_` forms. Returns the number of symbols renamed.
pub fn rename_symbols(
    graph: &mut BlockGraph,
    pairs: &[(String, String)],
) -> Result<usize, GraphError> {
    // Collision check first, so a failed rename changes nothing.
    let existing: FxHashSet<&str> = graph.blocks.values().map(|b| b.name.as_str()).collect();
    for (_, to) in pairs {
        let imp_to = format!("{IMP_PREFIX}{to}");
        if existing.contains(to.as_str()) || existing.contains(imp_to.as_str()) {
            return Err(GraphError::SymbolCollision(to.clone()));
        }
    }

    let mut renamed = 0;
    for block in graph.blocks.values_mut() {
        if !block.is_external() {
            continue;
        }
        for (from, to) in pairs {
            let new_name = if block.name == *from {
                to.clone()
            } else if block.name == format!("{IMP_PREFIX}{from}") {
                format!("{IMP_PREFIX}{to}")
            } else {
                continue;
            };
            debug!("renaming symbol {} -> {}", block.name, new_name);
            block.name = new_name;
            renamed += 1;
            break;
        }
    }
    Ok(renamed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{BlockKind, ImageFormat};
    use crate::imports::add_external_symbol;

    #[test]
    fn renames_direct_and_import_forms() {
        let mut graph = BlockGraph::new(ImageFormat::Coff);
        add_external_symbol(&mut graph, "?memcpy@@YAXPAXPBXI@Z");
        add_external_symbol(&mut graph, "__imp_?memcpy@@YAXPAXPBXI@Z");
        let count = rename_symbols(
            &mut graph,
            &[(
                "?memcpy@@YAXPAXPBXI@Z".to_string(),
                "asan_?memcpy@@YAXPAXPBXI@Z".to_string(),
            )],
        )
        .unwrap();
        assert_eq!(count, 2);
        assert!(graph.find_block("asan_?memcpy@@YAXPAXPBXI@Z").is_some());
        assert!(graph.find_block("__imp_asan_?memcpy@@YAXPAXPBXI@Z").is_some());
        assert!(graph.find_block("?memcpy@@YAXPAXPBXI@Z").is_none());
    }

    #[test]
    fn collision_with_defined_symbol_fails() {
        let mut graph = BlockGraph::new(ImageFormat::Coff);
        add_external_symbol(&mut graph, "_strlen");
        graph.add_block(BlockKind::Code, "_asan_strlen");
        let result = rename_symbols(
            &mut graph,
            &[("_strlen".to_string(), "_asan_strlen".to_string())],
        );
        assert!(matches!(result, Err(GraphError::SymbolCollision(_))));
        // Nothing changed.
        assert!(graph.find_block("_strlen").is_some());
    }
}
