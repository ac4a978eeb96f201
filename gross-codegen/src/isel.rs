//! Pre-machine lowering: target-independent to DLX opcode selection.
//!
//! Arithmetic picks the immediate instruction form when one operand is a
//! constant (commuting it to the right where the operator allows),
//! multiplication by a power of two becomes a left shift, and memory ops
//! pick word-indexed or register-indexed forms by the shape of their
//! offset. Relations are left untouched; branch lowering consumes them
//! together with their `If`.

use crate::graph::properties::{BinOpView, MemStoreView};
use crate::graph::reducer::{no_change, replace, GraphEditor, Reducer, Reduction};
use crate::graph::{builders, Graph, Node, Opcode};

/// The instruction selection pass.
pub struct PreMachineLowering;

impl PreMachineLowering {
    /// Create the pass.
    pub fn new() -> Self {
        Self
    }

    fn select_arithmetic(&self, editor: &mut GraphEditor, node: Node) -> Reduction {
        let (mut lhs, mut rhs) = {
            let view = BinOpView::new(editor.graph(), node).unwrap();
            (view.lhs(), view.rhs())
        };
        let op = editor.graph().opcode(node);
        let graph = editor.graph_mut();

        let lhs_is_const = graph.opcode(lhs) == Opcode::ConstantInt;
        let rhs_is_const = graph.opcode(rhs) == Opcode::ConstantInt;
        if !lhs_is_const && !rhs_is_const {
            let new = builders::dlx_bin(to_dlx_op(op, false))
                .lhs(lhs)
                .rhs(rhs)
                .build(graph);
            return replace(new);
        }

        if lhs_is_const && rhs_is_const {
            // Peephole leaves division (and negative subtraction) alone, so
            // the left constant must be materialized through the zero
            // register before the immediate form applies.
            let r0 = builders::dlx_register(0).build(graph);
            lhs = builders::dlx_bin(Opcode::DLXAddI)
                .immediate()
                .lhs(r0)
                .rhs(lhs)
                .build(graph);
        } else if lhs_is_const {
            if op.is_commutative() {
                core::mem::swap(&mut lhs, &mut rhs);
            } else {
                let r0 = builders::dlx_register(0).build(graph);
                lhs = builders::dlx_bin(Opcode::DLXAddI)
                    .immediate()
                    .lhs(r0)
                    .rhs(lhs)
                    .build(graph);
            }
        }

        if graph.opcode(rhs) != Opcode::ConstantInt {
            // Commuting moved the constant into the LHS materialization.
            let new = builders::dlx_bin(to_dlx_op(op, false))
                .lhs(lhs)
                .rhs(rhs)
                .build(graph);
            return replace(new);
        }

        let rhs_val = graph.int_value(rhs).unwrap();
        if op == Opcode::BinMul && rhs_val > 0 && (rhs_val & (rhs_val - 1)) == 0 {
            // Power of two (including 1): left shift by the exponent.
            let exp = rhs_val.trailing_zeros() as i32;
            let shift = builders::const_int(exp).build(graph);
            let new = builders::dlx_bin(Opcode::DLXLshI)
                .immediate()
                .lhs(lhs)
                .rhs(shift)
                .build(graph);
            return replace(new);
        }

        let new = builders::dlx_bin(to_dlx_op(op, true))
            .immediate()
            .lhs(lhs)
            .rhs(rhs)
            .build(graph);
        replace(new)
    }

    fn select_mem_op(&self, editor: &mut GraphEditor, node: Node) -> Reduction {
        let graph = editor.graph_mut();
        let base = graph.value_input(node, 0);
        let offset = graph.value_input(node, 1);
        let offset_is_const = graph.opcode(offset) == Opcode::ConstantInt;

        let new = match graph.opcode(node) {
            Opcode::MemLoad => {
                let op = if offset_is_const {
                    Opcode::DLXLdW
                } else {
                    Opcode::DLXLdX
                };
                builders::dlx_mem(op).base_addr(base).offset(offset).build(graph)
            }
            Opcode::MemStore => {
                let src = MemStoreView::new(graph, node).unwrap().src_val();
                let op = if offset_is_const {
                    Opcode::DLXStW
                } else {
                    Opcode::DLXStX
                };
                builders::dlx_mem(op)
                    .base_addr(base)
                    .offset(offset)
                    .src(src)
                    .build(graph)
            }
            op => panic!("unsupported memory opcode {}", op),
        };
        propagate_effects(graph, node, new);
        replace(new)
    }
}

/// Copy the effect and control inputs from the old node to its selection.
fn propagate_effects(graph: &mut Graph, old: Node, new: Node) {
    let effects: Vec<Node> = graph.effect_inputs(old).to_vec();
    for e in effects {
        graph.append_effect_input(new, e);
    }
    let ctrls: Vec<Node> = graph.control_inputs(old).to_vec();
    for c in ctrls {
        graph.append_control_input(new, c);
    }
}

fn to_dlx_op(op: Opcode, immediate: bool) -> Opcode {
    match op {
        Opcode::BinAdd => {
            if immediate {
                Opcode::DLXAddI
            } else {
                Opcode::DLXAdd
            }
        }
        Opcode::BinSub => {
            if immediate {
                Opcode::DLXSubI
            } else {
                Opcode::DLXSub
            }
        }
        Opcode::BinMul => {
            if immediate {
                Opcode::DLXMulI
            } else {
                Opcode::DLXMul
            }
        }
        Opcode::BinDiv => {
            if immediate {
                Opcode::DLXDivI
            } else {
                Opcode::DLXDiv
            }
        }
        _ => panic!("no DLX selection for {}", op),
    }
}

impl Reducer for PreMachineLowering {
    fn name(&self) -> &'static str {
        "pre-machine-lowering"
    }

    fn reduce(&mut self, editor: &mut GraphEditor, node: Node) -> Reduction {
        match editor.graph().opcode(node) {
            op if op.is_arithmetic() => self.select_arithmetic(editor, node),
            Opcode::MemLoad | Opcode::MemStore => self.select_mem_op(editor, node),
            _ => no_change(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::reducer::run_reducer;
    use crate::graph::SubGraph;

    fn select_one(build: impl FnOnce(&mut Graph, Node) -> Node) -> (Graph, Node) {
        let mut g = Graph::new();
        let start = builders::function("f").build(&mut g);
        let result = build(&mut g, start);
        let ret = builders::return_stmt().value(result).build(&mut g);
        g.append_control_input(ret, start);
        let end = builders::end(start).terminator(ret).build(&mut g);
        g.add_subgraph(SubGraph::new(end));
        run_reducer(&mut g, &mut PreMachineLowering::new());
        let selected = g.value_input(ret, 0);
        (g, selected)
    }

    #[test]
    fn register_form_for_two_variables() {
        let (g, n) = select_one(|g, _| {
            let a = builders::argument("a").build(g);
            let b = builders::argument("b").build(g);
            builders::bin_op(Opcode::BinAdd).lhs(a).rhs(b).build(g)
        });
        assert_eq!(g.opcode(n), Opcode::DLXAdd);
    }

    #[test]
    fn immediate_form_commutes_constant() {
        let (g, n) = select_one(|g, _| {
            let a = builders::argument("a").build(g);
            let c = builders::const_int(5).build(g);
            builders::bin_op(Opcode::BinAdd).lhs(c).rhs(a).build(g)
        });
        assert_eq!(g.opcode(n), Opcode::DLXAddI);
        assert_eq!(g.int_value(g.value_input(n, 1)), Some(5));
    }

    #[test]
    fn power_of_two_multiply_is_shift() {
        let (g, n) = select_one(|g, _| {
            let a = builders::argument("a").build(g);
            let c = builders::const_int(16).build(g);
            builders::bin_op(Opcode::BinMul).lhs(a).rhs(c).build(g)
        });
        assert_eq!(g.opcode(n), Opcode::DLXLshI);
        assert_eq!(g.int_value(g.value_input(n, 1)), Some(4));
    }

    #[test]
    fn multiply_by_one_shifts_by_zero() {
        let (g, n) = select_one(|g, _| {
            let a = builders::argument("a").build(g);
            let c = builders::const_int(1).build(g);
            builders::bin_op(Opcode::BinMul).lhs(a).rhs(c).build(g)
        });
        assert_eq!(g.opcode(n), Opcode::DLXLshI);
        assert_eq!(g.int_value(g.value_input(n, 1)), Some(0));
    }

    #[test]
    fn loads_pick_indexing_by_offset_shape() {
        let (g, n) = select_one(|g, start| {
            let base = builders::alloca().build(g);
            let off = builders::const_int(8).build(g);
            let ld = builders::mem_load(base, off).build(g);
            g.append_effect_input(ld, start);
            ld
        });
        assert_eq!(g.opcode(n), Opcode::DLXLdW);
        // Effect input survived the selection.
        assert_eq!(g.num_effect_inputs(n), 1);

        let (g2, n2) = select_one(|g, start| {
            let base = builders::alloca().build(g);
            let a = builders::argument("i").build(g);
            let ld = builders::mem_load(base, a).build(g);
            g.append_effect_input(ld, start);
            ld
        });
        assert_eq!(g2.opcode(n2), Opcode::DLXLdX);
    }

    #[test]
    fn relations_survive_selection() {
        let (g, n) = select_one(|g, _| {
            let a = builders::argument("a").build(g);
            let zero = builders::const_int(0).build(g);
            builders::bin_op(Opcode::BinLt).lhs(a).rhs(zero).build(g)
        });
        assert_eq!(g.opcode(n), Opcode::BinLt);
    }
}
