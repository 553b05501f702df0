//! Redundancy elimination (global value numbering)
//!
//! Only instructions that declare themselves side-effect-free and opt into
//! GVN participate. Equality is structural: same opcode (including its
//! subtype-specific fields) and same operands. Availability follows the
//! dominator tree, so a match is always a dominating earlier computation.

use tracing::debug;

use crate::hir::{BlockId, Graph, HFlags, HirId, HOp};

/// Run redundancy elimination; returns the number of values removed.
pub fn eliminate_redundancy(graph: &mut Graph) -> usize {
    graph.compute_dominators();

    // Dominator-tree children lists.
    let mut children: Vec<Vec<BlockId>> = vec![Vec::new(); graph.blocks.len()];
    for block in &graph.blocks {
        if let Some(idom) = block.dominator {
            if idom != block.id {
                children[idom.index()].push(block.id);
            }
        }
    }

    let mut available: Vec<HirId> = Vec::new();
    let mut removed = 0;
    let entry = graph.entry;
    walk(graph, entry, &children, &mut available, &mut removed);
    if removed > 0 {
        debug!(removed, "redundancy elimination");
    }
    removed
}

fn walk(
    graph: &mut Graph,
    block: BlockId,
    children: &[Vec<BlockId>],
    available: &mut Vec<HirId>,
    removed: &mut usize,
) {
    let mark = available.len();
    let instructions = graph.blocks[block.index()].instructions.clone();
    for id in instructions {
        let value = graph.value(id);
        if value.is_deleted() {
            continue;
        }
        if value.has_side_effects() {
            // Heap effects invalidate guard facts (map checks and the
            // like); pure arithmetic survives.
            available.retain(|&candidate| {
                !matches!(
                    graph.value(candidate).op,
                    HOp::CheckMap { .. } | HOp::CheckNonSmi
                )
            });
            continue;
        }
        if !value.flags.contains(HFlags::USE_GVN) {
            continue;
        }
        let matching = available.iter().copied().find(|&candidate| {
            let cand = graph.value(candidate);
            cand.op == graph.value(id).op && cand.operands == graph.value(id).operands
        });
        match matching {
            Some(existing) => {
                graph.replace_all_uses(id, existing);
                graph.delete_from_graph(id);
                *removed += 1;
            }
            None => available.push(id),
        }
    }
    for &child in &children[block.index()] {
        walk(graph, child, children, available, removed);
    }
    available.truncate(mark);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::BinOp;
    use crate::hir::HConst;

    #[test]
    fn test_common_subexpression_shared() {
        let mut graph = Graph::new();
        let entry = graph.entry;
        let a = graph.add_instruction(entry, HOp::Constant(HConst::Smi(1)), Vec::new());
        let b = graph.add_instruction(entry, HOp::Constant(HConst::Smi(2)), Vec::new());
        let add1 = graph.add_instruction(entry, HOp::Binary(BinOp::Add), vec![a, b]);
        let add2 = graph.add_instruction(entry, HOp::Binary(BinOp::Add), vec![a, b]);
        let ret = graph.add_instruction(entry, HOp::Binary(BinOp::Mul), vec![add1, add2]);

        let removed = eliminate_redundancy(&mut graph);
        assert_eq!(removed, 1);
        assert!(graph.value(add2).is_deleted());
        assert_eq!(graph.value(ret).operands, vec![add1, add1]);
    }

    #[test]
    fn test_different_opcode_fields_not_shared() {
        let mut graph = Graph::new();
        let entry = graph.entry;
        let a = graph.add_instruction(entry, HOp::Constant(HConst::Smi(1)), Vec::new());
        let b = graph.add_instruction(entry, HOp::Constant(HConst::Smi(2)), Vec::new());
        let add = graph.add_instruction(entry, HOp::Binary(BinOp::Add), vec![a, b]);
        let sub = graph.add_instruction(entry, HOp::Binary(BinOp::Sub), vec![a, b]);
        let _ret = graph.add_instruction(entry, HOp::Return, vec![add]);
        let _use2 = graph.value(sub);

        let removed = eliminate_redundancy(&mut graph);
        assert_eq!(removed, 0);
    }

    #[test]
    fn test_side_effect_instructions_never_eliminated() {
        let mut graph = Graph::new();
        let entry = graph.entry;
        let obj = graph.add_instruction(entry, HOp::Constant(HConst::Smi(0)), Vec::new());
        let name = graph.intern_name("x");
        let load1 = graph.add_instruction(entry, HOp::LoadNamedGeneric { name }, vec![obj]);
        graph.add_instruction(entry, HOp::Simulate { ast_id: 1 }, vec![load1]);
        let load2 = graph.add_instruction(entry, HOp::LoadNamedGeneric { name }, vec![obj]);
        graph.add_instruction(entry, HOp::Simulate { ast_id: 2 }, vec![load2]);

        let removed = eliminate_redundancy(&mut graph);
        assert_eq!(removed, 0);
        assert!(!graph.value(load2).is_deleted());
    }

    #[test]
    fn test_heap_effect_kills_guard_facts() {
        let mut graph = Graph::new();
        let entry = graph.entry;
        let obj = graph.add_instruction(entry, HOp::Constant(HConst::Smi(0)), Vec::new());
        let check1 = graph.add_instruction(entry, HOp::CheckMap { shape: 3 }, vec![obj]);
        let value = graph.add_instruction(entry, HOp::Constant(HConst::Smi(1)), Vec::new());
        let name = graph.intern_name("x");
        let store =
            graph.add_instruction(entry, HOp::StoreNamedGeneric { name }, vec![obj, value]);
        graph.add_instruction(entry, HOp::Simulate { ast_id: 1 }, vec![store]);
        // The same map check after a store must not be folded into the
        // pre-store one.
        let check2 = graph.add_instruction(entry, HOp::CheckMap { shape: 3 }, vec![obj]);

        let removed = eliminate_redundancy(&mut graph);
        assert_eq!(removed, 0);
        assert!(!graph.value(check2).is_deleted());
        assert!(!graph.value(check1).is_deleted());
    }

    #[test]
    fn test_dominating_value_shared_across_blocks() {
        let mut graph = Graph::new();
        let entry = graph.entry;
        let next = graph.new_block();
        let a = graph.add_instruction(entry, HOp::Constant(HConst::Smi(1)), Vec::new());
        let b = graph.add_instruction(entry, HOp::Constant(HConst::Smi(2)), Vec::new());
        let add1 = graph.add_instruction(entry, HOp::Binary(BinOp::Add), vec![a, b]);
        graph.goto(entry, next);
        let add2 = graph.add_instruction(next, HOp::Binary(BinOp::Add), vec![a, b]);
        let _ret = graph.add_instruction(next, HOp::Return, vec![add2]);

        let removed = eliminate_redundancy(&mut graph);
        assert_eq!(removed, 1);
        assert!(graph.value(add2).is_deleted());
        assert!(!graph.value(add1).is_deleted());
    }

    #[test]
    fn test_sibling_branches_do_not_share() {
        // Values computed in one branch are not available in the other.
        let mut graph = Graph::new();
        let entry = graph.entry;
        let left = graph.new_block();
        let right = graph.new_block();
        let a = graph.add_instruction(entry, HOp::Constant(HConst::Smi(1)), Vec::new());
        let b = graph.add_instruction(entry, HOp::Constant(HConst::Smi(2)), Vec::new());
        let cond = graph.add_instruction(entry, HOp::Constant(HConst::Boolean(true)), Vec::new());
        graph.branch(entry, cond, left, right);
        let add_left = graph.add_instruction(left, HOp::Binary(BinOp::Add), vec![a, b]);
        graph.add_instruction(left, HOp::Return, vec![add_left]);
        let add_right = graph.add_instruction(right, HOp::Binary(BinOp::Add), vec![a, b]);
        graph.add_instruction(right, HOp::Return, vec![add_right]);

        let removed = eliminate_redundancy(&mut graph);
        assert_eq!(removed, 0);
    }
}
