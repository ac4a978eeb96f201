//! Dead code elimination.
//!
//! Two per-node rules: a node without users that is not a pool value or
//! registered global is killed, and input edges whose source is the dead
//! sentinel are dropped.
//!
//! As a reducer the rules run inside the standard fix-point driver, where
//! they clean up nodes that lose their users during a reduction (kills
//! cascade through the revisit queue). `run_dce` additionally sweeps the
//! whole arena, since a node that is already user-less is by definition not
//! reachable from any `End` and the subgraph walk alone would never see it.

use crate::graph::reducer::{no_change, run_reducer, GraphEditor, Reducer, Reduction};
use crate::graph::{Graph, Node, UseKind};
use gross_entity::EntityRef;

/// The dead code elimination pass.
pub struct DceReducer;

impl DceReducer {
    /// Create the pass.
    pub fn new() -> Self {
        Self
    }
}

/// Sweep the whole graph: kill user-less non-global nodes to fix-point,
/// then run the per-subgraph rules to drop dead input edges.
pub fn run_dce(graph: &mut Graph) {
    let mut changed = true;
    while changed {
        changed = false;
        for idx in 0..graph.node_size() {
            let n = Node::new(idx);
            if graph.opcode(n).is_global_value() || graph.is_global_var(n) {
                continue;
            }
            if graph.users(n).is_empty() && !graph.inputs(n).is_empty() {
                graph.kill(n);
                changed = true;
            }
        }
    }
    run_reducer(graph, &mut DceReducer::new());
}

impl Reducer for DceReducer {
    fn name(&self) -> &'static str {
        "dce"
    }

    fn reduce(&mut self, editor: &mut GraphEditor, node: Node) -> Reduction {
        if editor.graph().opcode(node).is_global_value() {
            return no_change();
        }
        if editor.graph().is_global_var(node) {
            return no_change();
        }

        if editor.graph().users(node).is_empty() {
            let inputs: Vec<Node> = editor.graph().inputs(node).to_vec();
            editor.graph_mut().kill(node);
            for input in inputs {
                editor.revisit(input);
            }
            return no_change();
        }

        // Drop edges from the dead sentinel.
        for kind in &[UseKind::Value, UseKind::Control, UseKind::Effect] {
            loop {
                let pos = {
                    let graph = editor.graph();
                    let section = match kind {
                        UseKind::Value => graph.value_inputs(node),
                        UseKind::Control => graph.control_inputs(node),
                        UseKind::Effect => graph.effect_inputs(node),
                    };
                    section.iter().position(|&i| graph.is_dead(i))
                };
                match pos {
                    Some(idx) => editor.graph_mut().remove_input(node, *kind, idx),
                    None => break,
                }
            }
        }
        no_change()
    }
}
