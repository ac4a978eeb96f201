//! Constant folding.

use crate::graph::properties::BinOpView;
use crate::graph::reducer::{no_change, replace, GraphEditor, Reducer, Reduction};
use crate::graph::{builders, Node, Opcode};

/// Folds arithmetic and relational operators whose operands are both
/// constants. Division is never folded, and subtraction only when the
/// result is non-negative (the source language has no negative literals).
pub struct PeepholeReducer;

impl PeepholeReducer {
    /// Create the pass.
    pub fn new() -> Self {
        Self
    }

    fn reduce_arithmetic(&self, editor: &mut GraphEditor, node: Node) -> Reduction {
        let (lhs_val, rhs_val) = {
            let graph = editor.graph();
            let view = BinOpView::new(graph, node).unwrap();
            match (graph.int_value(view.lhs()), graph.int_value(view.rhs())) {
                (Some(l), Some(r)) => (l, r),
                _ => return no_change(),
            }
        };

        let folded = match editor.graph().opcode(node) {
            Opcode::BinAdd => lhs_val.wrapping_add(rhs_val),
            Opcode::BinSub => {
                // Only fold non-negative results.
                if lhs_val < rhs_val {
                    return no_change();
                }
                lhs_val - rhs_val
            }
            Opcode::BinMul => lhs_val.wrapping_mul(rhs_val),
            // Do not fold division.
            _ => return no_change(),
        };
        replace(builders::const_int(folded).build(editor.graph_mut()))
    }

    fn reduce_relation(&self, editor: &mut GraphEditor, node: Node) -> Reduction {
        let (lhs_val, rhs_val) = {
            let graph = editor.graph();
            let view = BinOpView::new(graph, node).unwrap();
            match (graph.int_value(view.lhs()), graph.int_value(view.rhs())) {
                (Some(l), Some(r)) => (l, r),
                _ => return no_change(),
            }
        };

        let holds = match editor.graph().opcode(node) {
            Opcode::BinLe => lhs_val <= rhs_val,
            Opcode::BinLt => lhs_val < rhs_val,
            Opcode::BinGe => lhs_val >= rhs_val,
            Opcode::BinGt => lhs_val > rhs_val,
            Opcode::BinEq => lhs_val == rhs_val,
            Opcode::BinNe => lhs_val != rhs_val,
            _ => unreachable!("non-relational opcode"),
        };
        let value = if holds { 1 } else { 0 };
        replace(builders::const_int(value).build(editor.graph_mut()))
    }
}

impl Reducer for PeepholeReducer {
    fn name(&self) -> &'static str {
        "peephole"
    }

    fn reduce(&mut self, editor: &mut GraphEditor, node: Node) -> Reduction {
        let op = editor.graph().opcode(node);
        if op.is_arithmetic() {
            self.reduce_arithmetic(editor, node)
        } else if op.is_relation() {
            self.reduce_relation(editor, node)
        } else {
            no_change()
        }
    }
}
