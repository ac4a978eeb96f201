//! Value promotion (memory to register).
//!
//! Eliminates the source-level declaration/access/assignment primitives by
//! threading each scalar variable's last-written value through the function:
//! a read becomes the right-hand side of the reaching assignment, and the
//! effect-phis the parser inserted at merges become value phis in place.
//!
//! Arrays and global variables cannot live in registers; their accesses
//! lower to `Alloca` + `MemLoad` / `MemStore` with row-major word
//! addressing, and the global marking moves from the declaration to its
//! allocation.

use crate::graph::properties::{ArrayAccessView, ArrayDeclView, AssignView, SrcAccessView};
use crate::graph::reducer::{no_change, replace, GraphEditor, Reducer, Reduction};
use crate::graph::{builders, Graph, Node, Opcode};
use log::debug;
use std::collections::HashMap;

/// Bytes per machine word.
const WORD_SIZE: i32 = 4;

/// The memory-to-register pass.
pub struct ValuePromotion {
    // Declaration -> its allocation, shared across call-sites of the pass
    // so globals keep a single backing chunk.
    allocas: HashMap<Node, Node>,
}

impl ValuePromotion {
    /// Create the pass.
    pub fn new() -> Self {
        Self {
            allocas: HashMap::new(),
        }
    }

    /// Whether accesses of `decl` must stay in memory.
    fn is_memory_decl(&self, graph: &Graph, decl: Node) -> bool {
        graph.opcode(decl) == Opcode::SrcArrayDecl
            || graph.is_global_var(decl)
            || self.allocas.contains_key(&decl)
    }

    /// The allocation backing `decl`, created on first demand. Creating it
    /// transfers a global marking from the declaration to the allocation.
    fn backing_alloca(&mut self, graph: &mut Graph, decl: Node) -> Node {
        if let Some(&a) = self.allocas.get(&decl) {
            return a;
        }
        let size = match graph.opcode(decl) {
            Opcode::SrcVarDecl => builders::const_int(WORD_SIZE).build(graph),
            Opcode::SrcArrayDecl => {
                let dims: Vec<Node> = ArrayDeclView::new(graph, decl).unwrap().dims().to_vec();
                let mut bytes = WORD_SIZE;
                let mut expr: Option<Node> = None;
                for d in dims {
                    match (graph.int_value(d), expr) {
                        (Some(c), None) => bytes = bytes.checked_mul(c).expect("array too large"),
                        _ => {
                            let cur = expr
                                .unwrap_or_else(|| builders::const_int(bytes).build(graph));
                            expr = Some(
                                builders::bin_op(Opcode::BinMul).lhs(cur).rhs(d).build(graph),
                            );
                        }
                    }
                }
                expr.unwrap_or_else(|| builders::const_int(bytes).build(graph))
            }
            op => panic!("no backing storage for {}", op),
        };
        let alloca = builders::alloca().size(size).build(graph);
        graph.replace_global_var(decl, alloca);
        self.allocas.insert(decl, alloca);
        debug!("backing {} with {}", graph.display_node(decl), graph.display_node(alloca));
        alloca
    }

    /// Row-major byte offset of an array element access.
    fn element_offset(graph: &mut Graph, decl: Node, indices: &[Node]) -> Node {
        let decl_dims: Vec<Node> = ArrayDeclView::new(graph, decl).unwrap().dims().to_vec();
        assert_eq!(decl_dims.len(), indices.len());
        let mut linear = indices[0];
        for (idx, &dim) in indices.iter().zip(decl_dims.iter()).skip(1) {
            let scaled = builders::bin_op(Opcode::BinMul)
                .lhs(linear)
                .rhs(dim)
                .build(graph);
            linear = builders::bin_op(Opcode::BinAdd)
                .lhs(scaled)
                .rhs(*idx)
                .build(graph);
        }
        let word = builders::const_int(WORD_SIZE).build(graph);
        builders::bin_op(Opcode::BinMul)
            .lhs(linear)
            .rhs(word)
            .build(graph)
    }

    fn reduce_var_access(&mut self, editor: &mut GraphEditor, node: Node) -> Reduction {
        if is_assign_dest(editor.graph(), node) {
            // Dies together with its assignment.
            return no_change();
        }
        let decl = editor.graph().value_input(node, 0);
        if self.is_memory_decl(editor.graph(), decl) {
            return self.lower_read_to_load(editor, node, decl, None);
        }

        let effect = SrcAccessView::new(editor.graph(), node)
            .unwrap()
            .effect_dependency();
        let graph = editor.graph();
        match effect.map(|e| (e, graph.opcode(e))) {
            Some((e, Opcode::SrcAssignStmt)) => {
                let source = AssignView::new(graph, e).unwrap().source();
                replace(source)
            }
            Some((e, Opcode::Phi)) => replace(e),
            Some((e, Opcode::Argument)) => replace(e),
            _ => {
                if graph.opcode(decl) == Opcode::Argument {
                    replace(decl)
                } else {
                    // Uninitialized scalar read.
                    replace(builders::const_int(0).build(editor.graph_mut()))
                }
            }
        }
    }

    fn reduce_array_access(&mut self, editor: &mut GraphEditor, node: Node) -> Reduction {
        if is_assign_dest(editor.graph(), node) {
            return no_change();
        }
        let decl = editor.graph().value_input(node, 0);
        let indices: Vec<Node> = ArrayAccessView::new(editor.graph(), node)
            .unwrap()
            .dims()
            .to_vec();
        self.lower_read_to_load(editor, node, decl, Some(indices))
    }

    fn lower_read_to_load(
        &mut self,
        editor: &mut GraphEditor,
        node: Node,
        decl: Node,
        indices: Option<Vec<Node>>,
    ) -> Reduction {
        let alloca = self.backing_alloca(editor.graph_mut(), decl);
        let offset = match indices {
            Some(idx) => Self::element_offset(editor.graph_mut(), decl, &idx),
            None => builders::const_int(0).build(editor.graph_mut()),
        };
        let load = builders::mem_load(alloca, offset).build(editor.graph_mut());
        propagate_deps(editor.graph_mut(), node, load);
        replace(load)
    }

    fn reduce_assign(&mut self, editor: &mut GraphEditor, node: Node) -> Reduction {
        let (dest, source) = {
            let view = AssignView::new(editor.graph(), node).unwrap();
            (view.dest(), view.source())
        };
        match editor.graph().opcode(dest) {
            Opcode::SrcVarAccess => {
                let decl = editor.graph().value_input(dest, 0);
                if !self.is_memory_decl(editor.graph(), decl) {
                    // Reads thread the value through; the statement itself
                    // dissolves into garbage once they have.
                    return no_change();
                }
                self.lower_write_to_store(editor, node, dest, decl, source, None)
            }
            Opcode::SrcArrayAccess => {
                let decl = editor.graph().value_input(dest, 0);
                let indices: Vec<Node> = ArrayAccessView::new(editor.graph(), dest)
                    .unwrap()
                    .dims()
                    .to_vec();
                self.lower_write_to_store(editor, node, dest, decl, source, Some(indices))
            }
            _ => no_change(),
        }
    }

    fn lower_write_to_store(
        &mut self,
        editor: &mut GraphEditor,
        assign: Node,
        dest: Node,
        decl: Node,
        source: Node,
        indices: Option<Vec<Node>>,
    ) -> Reduction {
        let alloca = self.backing_alloca(editor.graph_mut(), decl);
        let offset = match indices {
            Some(idx) => Self::element_offset(editor.graph_mut(), decl, &idx),
            None => builders::const_int(0).build(editor.graph_mut()),
        };
        let store = builders::mem_store(alloca, offset, source).build(editor.graph_mut());
        // Control comes from the statement, the memory chain from the
        // destination designator.
        propagate_deps(editor.graph_mut(), assign, store);
        propagate_deps(editor.graph_mut(), dest, store);
        replace(store)
    }

    fn reduce_initial_array(&mut self, editor: &mut GraphEditor, node: Node) -> Reduction {
        let decl = editor.graph().value_input(node, 0);
        let alloca = self.backing_alloca(editor.graph_mut(), decl);
        // The pristine array state is the allocation itself.
        replace(alloca)
    }

    fn reduce_phi(&mut self, editor: &mut GraphEditor, node: Node) -> Reduction {
        if editor.graph().num_value_inputs(node) > 0 {
            return no_change();
        }
        let num_effects = editor.graph().num_effect_inputs(node);
        if num_effects == 0 {
            return no_change();
        }

        // A parse-time scalar phi carries the per-branch last modifiers as
        // effect inputs; each converts to the value it wrote. Memory phis
        // (stores, loads, calls) stay for the memory passes.
        let mut values = Vec::with_capacity(num_effects);
        for idx in 0..num_effects {
            let e = editor.graph().effect_input(node, idx);
            let graph = editor.graph();
            let value = match graph.opcode(e) {
                Opcode::SrcAssignStmt => AssignView::new(graph, e).unwrap().source(),
                Opcode::Phi if graph.num_value_inputs(e) > 0 => e,
                Opcode::Argument => e,
                Opcode::ConstantInt => e,
                _ => return no_change(),
            };
            values.push(value);
        }

        for idx in (0..num_effects).rev() {
            editor.graph_mut().remove_effect_input(node, idx);
        }
        for v in values {
            editor.graph_mut().append_value_input(node, v);
        }
        replace(node)
    }
}

/// Whether `access` is the destination designator of some assignment.
fn is_assign_dest(graph: &Graph, access: Node) -> bool {
    graph.users(access).iter().any(|&u| {
        graph.opcode(u) == Opcode::SrcAssignStmt && graph.value_input(u, 0) == access
    })
}

/// Copy `old`'s control and effect inputs onto `new`.
fn propagate_deps(graph: &mut Graph, old: Node, new: Node) {
    let ctrls: Vec<Node> = graph.control_inputs(old).to_vec();
    for c in ctrls {
        graph.append_control_input(new, c);
    }
    let effects: Vec<Node> = graph.effect_inputs(old).to_vec();
    for e in effects {
        graph.append_effect_input(new, e);
    }
}

impl Reducer for ValuePromotion {
    fn name(&self) -> &'static str {
        "value-promotion"
    }

    fn reduce(&mut self, editor: &mut GraphEditor, node: Node) -> Reduction {
        match editor.graph().opcode(node) {
            Opcode::SrcVarAccess => self.reduce_var_access(editor, node),
            Opcode::SrcArrayAccess => self.reduce_array_access(editor, node),
            Opcode::SrcAssignStmt => self.reduce_assign(editor, node),
            Opcode::SrcInitialArray => self.reduce_initial_array(editor, node),
            Opcode::Phi => self.reduce_phi(editor, node),
            _ => no_change(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::reducer::run_reducer;
    use crate::graph::SubGraph;

    #[test]
    fn simple_promotion() {
        let mut g = Graph::new();
        let start = builders::function("func_mem2reg1").build(&mut g);
        let decl = builders::var_decl("foo").build(&mut g);
        let c87 = builders::const_int(87).build(&mut g);
        let c94 = builders::const_int(94).build(&mut g);
        let rhs = builders::bin_op(Opcode::BinAdd).lhs(c87).rhs(c94).build(&mut g);
        let dest = builders::var_access(decl).build(&mut g);
        let assign = builders::assign(dest, rhs).build(&mut g);
        g.append_control_input(assign, start);
        let read = builders::var_access(decl).effect(assign).build(&mut g);
        let ret = builders::return_stmt().value(read).build(&mut g);
        let end = builders::end(start).terminator(ret).build(&mut g);
        let sg = SubGraph::new(end);
        g.add_subgraph(sg);

        run_reducer(&mut g, &mut ValuePromotion::new());

        // Return reads the assignment's right-hand side directly, and the
        // whole source-level machinery is unreachable from End.
        assert_eq!(g.value_input(ret, 0), rhs);
        assert_eq!(sg.node_size(&g), 7);
    }

    #[test]
    fn multiple_assignments_thread_through() {
        let mut g = Graph::new();
        let start = builders::function("func_mem2reg2").build(&mut g);
        let decl = builders::var_decl("foo").build(&mut g);
        let c87 = builders::const_int(87).build(&mut g);
        let c94 = builders::const_int(94).build(&mut g);

        let dest1 = builders::var_access(decl).build(&mut g);
        let assign1 = builders::assign(dest1, c87).build(&mut g);
        g.append_control_input(assign1, start);

        let rhs = builders::bin_op(Opcode::BinAdd).lhs(c87).rhs(c94).build(&mut g);
        let dest2 = builders::var_access(decl).effect(assign1).build(&mut g);
        let assign2 = builders::assign(dest2, rhs).build(&mut g);

        let read = builders::var_access(decl).effect(assign2).build(&mut g);
        let ret = builders::return_stmt().value(read).build(&mut g);
        let end = builders::end(start).terminator(ret).build(&mut g);
        let sg = SubGraph::new(end);
        g.add_subgraph(sg);

        run_reducer(&mut g, &mut ValuePromotion::new());

        assert_eq!(g.value_input(ret, 0), rhs);
        assert_eq!(sg.node_size(&g), 7);
    }

    #[test]
    fn branch_phi_becomes_value_phi() {
        let mut g = Graph::new();
        let start = builders::function("f").build(&mut g);
        let decl = builders::var_decl("b").build(&mut g);
        let zero = builders::const_int(0).build(&mut g);
        let a = builders::argument("a").build(&mut g);
        let cond = builders::bin_op(Opcode::BinLt).lhs(a).rhs(zero).build(&mut g);
        let branch = builders::if_stmt(cond).build(&mut g);
        g.append_control_input(branch, start);
        let t = builders::if_branch(branch, true).build(&mut g);
        let f = builders::if_branch(branch, false).build(&mut g);

        let c1 = builders::const_int(1).build(&mut g);
        let dest_t = builders::var_access(decl).build(&mut g);
        let assign_t = builders::assign(dest_t, c1).build(&mut g);
        g.append_control_input(assign_t, t);

        let c2 = builders::const_int(2).build(&mut g);
        let dest_f = builders::var_access(decl).build(&mut g);
        let assign_f = builders::assign(dest_f, c2).build(&mut g);
        g.append_control_input(assign_f, f);

        let m = builders::merge().ctrl(t).ctrl(f).build(&mut g);
        let phi = builders::phi()
            .effect(assign_t)
            .effect(assign_f)
            .ctrl_merge(m)
            .build(&mut g);

        let read = builders::var_access(decl).effect(phi).build(&mut g);
        let ret = builders::return_stmt().value(read).build(&mut g);
        g.append_control_input(ret, m);
        let end = builders::end(start).terminator(ret).build(&mut g);
        g.add_subgraph(SubGraph::new(end));

        run_reducer(&mut g, &mut ValuePromotion::new());

        // Return reads the phi; the phi merges the two constants.
        assert_eq!(g.value_input(ret, 0), phi);
        assert_eq!(g.value_inputs(phi), &[c1, c2]);
        assert_eq!(g.num_effect_inputs(phi), 0);
        assert_eq!(g.control_input(phi, 0), m);
    }

    #[test]
    fn array_write_lowers_to_store() {
        let mut g = Graph::new();
        let start = builders::function("func_mem2reg4").build(&mut g);
        let decl = builders::array_decl("barArray")
            .const_dim(&mut g, 94)
            .const_dim(&mut g, 87)
            .build(&mut g);
        let d1 = builders::const_int(5).build(&mut g);
        let d2 = builders::const_int(7).build(&mut g);
        let access = builders::array_access(decl)
            .dim(d1)
            .dim(d2)
            .build(&mut g);
        let c2 = builders::const_int(2).build(&mut g);
        let assign = builders::assign(access, c2).build(&mut g);
        g.append_control_input(assign, start);
        let end = builders::end(start).effect(assign).build(&mut g);
        let sg = SubGraph::new(end);
        g.add_subgraph(sg);

        run_reducer(&mut g, &mut ValuePromotion::new());

        // End's dangling effect is now a store against the allocation.
        assert_eq!(g.num_effect_inputs(end), 1);
        let store = g.effect_input(end, 0);
        assert_eq!(g.opcode(store), Opcode::MemStore);
        let base = g.value_input(store, 0);
        assert_eq!(g.opcode(base), Opcode::Alloca);
        assert_eq!(g.value_input(store, 2), c2);
        // Allocation size folded: 94 * 87 * 4 bytes.
        assert_eq!(g.int_value(g.value_input(base, 0)), Some(94 * 87 * 4));
    }

    #[test]
    fn global_scalar_stays_in_memory() {
        let mut g = Graph::new();
        let decl = builders::var_decl("g").build(&mut g);
        g.mark_global(decl);

        let start = builders::function("f").build(&mut g);
        let c5 = builders::const_int(5).build(&mut g);
        let dest = builders::var_access(decl).build(&mut g);
        let assign = builders::assign(dest, c5).build(&mut g);
        g.append_control_input(assign, start);
        let read = builders::var_access(decl).effect(assign).build(&mut g);
        let ret = builders::return_stmt().value(read).build(&mut g);
        let end = builders::end(start).terminator(ret).build(&mut g);
        g.add_subgraph(SubGraph::new(end));

        run_reducer(&mut g, &mut ValuePromotion::new());

        let load = g.value_input(ret, 0);
        assert_eq!(g.opcode(load), Opcode::MemLoad);
        // The load observes the store through the effect chain.
        assert_eq!(g.num_effect_inputs(load), 1);
        let store = g.effect_input(load, 0);
        assert_eq!(g.opcode(store), Opcode::MemStore);
        // The global marking moved from the declaration to the alloca.
        let alloca = g.value_input(load, 0);
        assert_eq!(g.opcode(alloca), Opcode::Alloca);
        assert!(g.is_global_var(alloca));
        assert!(!g.is_global_var(decl));
    }
}
