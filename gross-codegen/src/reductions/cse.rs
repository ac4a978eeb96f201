//! Trivial common subexpression elimination.
//!
//! Only nodes whose transitive value-input cone consists entirely of pool
//! values and that carry no control or effect inputs participate. Anything
//! touched by control flow is deliberately left alone; the conservative
//! precondition is part of the pass's contract.

use crate::graph::reducer::{no_change, replace, GraphEditor, Reducer, Reduction};
use crate::graph::{Graph, Node, Opcode};
use std::collections::HashMap;

/// Structural identity of an eligible node: opcode plus exact value-input
/// operands. Operand nodes are compared by identity, which suffices because
/// every eligible operand is interned or itself already deduplicated.
#[derive(PartialEq, Eq, Hash)]
struct NodeKey {
    op: Opcode,
    operands: Vec<Node>,
}

/// Hash-consing over the trivially-pure part of a function.
pub struct CseReducer {
    known: HashMap<NodeKey, Node>,
}

impl CseReducer {
    /// Create the pass.
    pub fn new() -> Self {
        Self {
            known: HashMap::new(),
        }
    }

    fn reduce_trivial_values(&mut self, graph: &Graph, node: Node) -> Reduction {
        if graph.opcode(node).is_global_value() {
            return no_change();
        }
        if !only_global_value_deps(graph, node) {
            return no_change();
        }

        let key = NodeKey {
            op: graph.opcode(node),
            operands: graph.value_inputs(node).to_vec(),
        };
        match self.known.get(&key) {
            Some(&existing) if existing != node => replace(existing),
            Some(_) => no_change(),
            None => {
                self.known.insert(key, node);
                no_change()
            }
        }
    }
}

/// BFS over value inputs: every path must bottom out in pool values without
/// crossing a node that has control or effect dependencies.
fn only_global_value_deps(graph: &Graph, node: Node) -> bool {
    let mut queue = vec![node];
    while let Some(top) = queue.pop() {
        if graph.num_control_inputs(top) > 0 || graph.num_effect_inputs(top) > 0 {
            return false;
        }
        if graph.opcode(top).is_global_value() {
            continue;
        }
        queue.extend_from_slice(graph.value_inputs(top));
    }
    true
}

impl Reducer for CseReducer {
    fn name(&self) -> &'static str {
        "cse"
    }

    fn reduce(&mut self, editor: &mut GraphEditor, node: Node) -> Reduction {
        self.reduce_trivial_values(editor.graph(), node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::reducer::run_reducer;
    use crate::graph::{builders, SubGraph};

    #[test]
    fn duplicate_adds_merge() {
        let mut g = Graph::new();
        let start = builders::function("f").build(&mut g);
        let c87 = builders::const_int(87).build(&mut g);
        let c94 = builders::const_int(94).build(&mut g);
        let add1 = builders::bin_op(Opcode::BinAdd)
            .lhs(c87)
            .rhs(c94)
            .build(&mut g);
        let add2 = builders::bin_op(Opcode::BinAdd)
            .lhs(c87)
            .rhs(c94)
            .build(&mut g);
        let sum = builders::bin_op(Opcode::BinMul)
            .lhs(add1)
            .rhs(add2)
            .build(&mut g);
        let ret = builders::return_stmt().value(sum).build(&mut g);
        g.append_control_input(ret, start);
        let end = builders::end(start).terminator(ret).build(&mut g);
        let sg = SubGraph::new(end);
        g.add_subgraph(sg);

        run_reducer(&mut g, &mut CseReducer::new());

        // Exactly one of the adds is left; the multiply sees it twice.
        assert_eq!(g.value_input(sum, 0), g.value_input(sum, 1));
        let adds = sg
            .nodes(&g)
            .iter()
            .filter(|&&n| g.opcode(n) == Opcode::BinAdd)
            .count();
        assert_eq!(adds, 1);
    }

    #[test]
    fn effectful_nodes_are_excluded() {
        let mut g = Graph::new();
        let start = builders::function("f").build(&mut g);
        let base = builders::alloca().build(&mut g);
        let zero = builders::const_int(0).build(&mut g);
        let ld1 = builders::mem_load(base, zero).build(&mut g);
        g.append_effect_input(ld1, start);
        let ld2 = builders::mem_load(base, zero).build(&mut g);
        g.append_effect_input(ld2, start);
        let sum = builders::bin_op(Opcode::BinAdd)
            .lhs(ld1)
            .rhs(ld2)
            .build(&mut g);
        let ret = builders::return_stmt().value(sum).build(&mut g);
        g.append_control_input(ret, start);
        let end = builders::end(start).terminator(ret).build(&mut g);
        g.add_subgraph(SubGraph::new(end));

        run_reducer(&mut g, &mut CseReducer::new());

        // Loads stay distinct: they carry effect inputs.
        assert_ne!(g.value_input(sum, 0), g.value_input(sum, 1));
    }
}
