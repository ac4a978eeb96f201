//! Read-only opcode-specific views.
//!
//! A view wraps `(&Graph, Node)` and exposes accessors that know which slot
//! means what for its opcode (or opcode family). Construction returns
//! `None` when the opcode does not match, so `View::new(..)` doubles as the
//! family test the surface design calls "coerces to false".

use crate::graph::{Graph, Node, Opcode, SubGraph, UseKind};

macro_rules! view {
    ($name:ident, $pred:expr) => {
        /// An opcode-checked read-only view.
        #[derive(Copy, Clone)]
        pub struct $name<'a> {
            graph: &'a Graph,
            node: Node,
        }

        impl<'a> $name<'a> {
            /// Wrap `node` if its opcode belongs to this view's family.
            pub fn new(graph: &'a Graph, node: Node) -> Option<Self> {
                let pred: fn(Opcode) -> bool = $pred;
                if pred(graph.opcode(node)) {
                    Some(Self { graph, node })
                } else {
                    None
                }
            }

            /// The viewed node.
            pub fn node(&self) -> Node {
                self.node
            }
        }
    };
}

view!(BinOpView, |op| op.is_bin_op());

impl<'a> BinOpView<'a> {
    pub fn lhs(&self) -> Node {
        self.graph.value_input(self.node, 0)
    }

    pub fn rhs(&self) -> Node {
        self.graph.value_input(self.node, 1)
    }

    pub fn is_commutative(&self) -> bool {
        self.graph.opcode(self.node).is_commutative()
    }
}

view!(CallView, |op| op == Opcode::Call);

impl<'a> CallView<'a> {
    /// The callee stub in value slot 0.
    pub fn func_stub(&self) -> Node {
        self.graph.value_input(self.node, 0)
    }

    pub fn num_params(&self) -> usize {
        self.graph.num_value_inputs(self.node) - 1
    }

    /// The actual parameters, value slots 1 and up.
    pub fn params(&self) -> &'a [Node] {
        &self.graph.value_inputs(self.node)[1..]
    }
}

view!(SrcDeclView, |op| op.is_src_decl());

impl<'a> SrcDeclView<'a> {
    pub fn symbol(&self) -> Node {
        self.graph.value_input(self.node, 0)
    }

    pub fn ident_name(&self) -> &'a str {
        self.graph
            .str_value(self.graph.value_input(self.node, 0))
            .expect("declaration symbol is not an interned string")
    }
}

view!(ArrayDeclView, |op| op == Opcode::SrcArrayDecl);

impl<'a> ArrayDeclView<'a> {
    pub fn dim_size(&self) -> usize {
        self.graph.num_value_inputs(self.node) - 1
    }

    pub fn dim(&self, idx: usize) -> Node {
        self.dims()[idx]
    }

    pub fn dims(&self) -> &'a [Node] {
        &self.graph.value_inputs(self.node)[1..]
    }
}

view!(StartView, |op| op == Opcode::Start);

impl<'a> StartView<'a> {
    pub fn name(&self) -> &'a str {
        self.graph
            .str_value(self.graph.value_input(self.node, 0))
            .expect("function name is not an interned string")
    }

    /// The matching `End`, found through the user list.
    pub fn end_node(&self) -> Option<Node> {
        self.graph
            .users(self.node)
            .iter()
            .cloned()
            .find(|&u| self.graph.opcode(u) == Opcode::End)
    }

    /// The interned stub of this function, if one was created.
    pub fn func_stub(&self) -> Option<Node> {
        let end = self.end_node()?;
        self.graph.stub_of(SubGraph::new(end))
    }

    /// The formal parameters, one effect input per `Argument`.
    pub fn arguments(&self) -> &'a [Node] {
        self.graph.effect_inputs(self.node)
    }
}

view!(ArgumentView, |op| op == Opcode::Argument);

impl<'a> ArgumentView<'a> {
    /// The owning `Start` is the argument's only effect user.
    pub fn func_start(&self) -> Node {
        self.graph
            .effect_users(self.node)
            .next()
            .expect("argument is not wired to a function")
    }

    /// Position of this argument in the owning prototype.
    pub fn index(&self) -> usize {
        let start = self.func_start();
        self.graph
            .effect_inputs(start)
            .iter()
            .position(|&a| a == self.node)
            .expect("argument missing from its prototype")
    }
}

view!(SrcAccessView, |op| op.is_src_access());

impl<'a> SrcAccessView<'a> {
    pub fn decl(&self) -> Node {
        self.graph.value_input(self.node, 0)
    }

    /// The last-modifier / last-memory-access this read hangs off.
    pub fn effect_dependency(&self) -> Option<Node> {
        if self.graph.num_effect_inputs(self.node) > 0 {
            Some(self.graph.effect_input(self.node, 0))
        } else {
            None
        }
    }
}

view!(ArrayAccessView, |op| op == Opcode::SrcArrayAccess);

impl<'a> ArrayAccessView<'a> {
    pub fn decl(&self) -> Node {
        self.graph.value_input(self.node, 0)
    }

    pub fn dim_size(&self) -> usize {
        self.graph.num_value_inputs(self.node) - 1
    }

    pub fn dims(&self) -> &'a [Node] {
        &self.graph.value_inputs(self.node)[1..]
    }
}

view!(AssignView, |op| op == Opcode::SrcAssignStmt);

impl<'a> AssignView<'a> {
    pub fn dest(&self) -> Node {
        self.graph.value_input(self.node, 0)
    }

    pub fn source(&self) -> Node {
        self.graph.value_input(self.node, 1)
    }
}

view!(IfView, |op| op == Opcode::If);

impl<'a> IfView<'a> {
    pub fn condition(&self) -> Node {
        self.graph.value_input(self.node, 0)
    }

    pub fn true_branch(&self) -> Option<Node> {
        self.graph
            .control_users(self.node)
            .find(|&u| self.graph.opcode(u) == Opcode::IfTrue)
    }

    /// The `IfFalse` projection, or any non-`IfTrue` control user.
    pub fn false_branch(&self) -> Option<Node> {
        let g = self.graph;
        g.control_users(self.node)
            .find(|&u| g.opcode(u) == Opcode::IfFalse)
            .or_else(|| g.control_users(self.node).find(|&u| g.opcode(u) != Opcode::IfTrue))
    }
}

view!(IfBranchView, |op| op.is_if_branch());

impl<'a> IfBranchView<'a> {
    /// The `If` this projection branches from.
    pub fn branch_point(&self) -> Node {
        self.graph
            .control_inputs(self.node)
            .iter()
            .cloned()
            .find(|&c| self.graph.opcode(c) == Opcode::If)
            .expect("branch projection without an If")
    }
}

view!(MergeView, |op| op == Opcode::Merge);

impl<'a> MergeView<'a> {
    pub fn true_branch(&self) -> Option<Node> {
        self.graph
            .control_inputs(self.node)
            .iter()
            .cloned()
            .find(|&c| self.graph.opcode(c) == Opcode::IfTrue)
    }

    pub fn false_branch(&self) -> Option<Node> {
        self.graph
            .control_inputs(self.node)
            .iter()
            .cloned()
            .find(|&c| self.graph.opcode(c) == Opcode::IfFalse)
    }
}

view!(LoopView, |op| op == Opcode::Loop);

impl<'a> LoopView<'a> {
    /// The loop's exit test.
    pub fn branch(&self) -> Option<Node> {
        self.graph
            .control_users(self.node)
            .find(|&u| self.graph.opcode(u) == Opcode::If)
    }

    /// The backedge always sits behind the entry control.
    pub fn backedge(&self) -> Node {
        assert_eq!(self.graph.num_control_inputs(self.node), 2);
        self.graph.control_input(self.node, 1)
    }
}

view!(PhiView, |op| op == Opcode::Phi);

impl<'a> PhiView<'a> {
    /// The merge or loop whose control inputs parallel this phi's inputs.
    pub fn ctrl_pivot(&self) -> Node {
        self.graph.control_input(self.node, 0)
    }

    /// Map a value/effect input of the phi to the control predecessor it
    /// flows in from.
    pub fn map_ctrl_node(&self, input: Node, kind: UseKind) -> Option<Node> {
        let idx = match kind {
            UseKind::Value => self
                .graph
                .value_inputs(self.node)
                .iter()
                .position(|&v| v == input)?,
            UseKind::Effect => self
                .graph
                .effect_inputs(self.node)
                .iter()
                .position(|&e| e == input)?,
            UseKind::Control => panic!("phi inputs are value or effect"),
        };
        let pivot = self.ctrl_pivot();
        assert!(idx < self.graph.num_control_inputs(pivot));
        Some(self.graph.control_input(pivot, idx))
    }
}

view!(AllocaView, |op| op == Opcode::Alloca);

impl<'a> AllocaView<'a> {
    pub fn size(&self) -> Node {
        self.graph.value_input(self.node, 0)
    }
}

view!(MemOpView, |op| op.is_mem_op());

impl<'a> MemOpView<'a> {
    pub fn base_addr(&self) -> Node {
        self.graph.value_input(self.node, 0)
    }

    pub fn offset(&self) -> Node {
        self.graph.value_input(self.node, 1)
    }
}

view!(MemStoreView, |op| op == Opcode::MemStore);

impl<'a> MemStoreView<'a> {
    pub fn base_addr(&self) -> Node {
        self.graph.value_input(self.node, 0)
    }

    pub fn offset(&self) -> Node {
        self.graph.value_input(self.node, 1)
    }

    pub fn src_val(&self) -> Node {
        self.graph.value_input(self.node, 2)
    }
}

view!(ReturnView, |op| op == Opcode::Return);

impl<'a> ReturnView<'a> {
    pub fn return_val(&self) -> Option<Node> {
        if self.graph.num_value_inputs(self.node) > 0 {
            Some(self.graph.value_input(self.node, 0))
        } else {
            None
        }
    }
}

view!(DlxBinView, |op| op.is_dlx_arith() || op.is_dlx_terminate());

impl<'a> DlxBinView<'a> {
    pub fn lhs(&self) -> Node {
        self.graph.value_input(self.node, 0)
    }

    pub fn rhs(&self) -> Node {
        self.graph.value_input(self.node, 1)
    }

    /// The RHS when it is an immediate operand.
    pub fn imm_rhs(&self) -> Option<Node> {
        let rhs = self.rhs();
        if self.graph.opcode(rhs) == Opcode::ConstantInt {
            Some(rhs)
        } else {
            None
        }
    }
}

view!(CallsiteBeginView, |op| op == Opcode::VirtDLXCallsiteBegin);

impl<'a> CallsiteBeginView<'a> {
    /// The matching end marker is the first effect user.
    pub fn callsite_end(&self) -> Node {
        self.graph
            .effect_users(self.node)
            .find(|&u| self.graph.opcode(u) == Opcode::VirtDLXCallsiteEnd)
            .expect("unterminated callsite")
    }

    /// The parameter transfers bracketed by this callsite.
    pub fn params(&self) -> Vec<Node> {
        self.graph
            .effect_users(self.node)
            .filter(|&u| self.graph.opcode(u) == Opcode::VirtDLXPassParam)
            .collect()
    }
}

view!(CallsiteEndView, |op| op == Opcode::VirtDLXCallsiteEnd);

impl<'a> CallsiteEndView<'a> {
    pub fn callsite_begin(&self) -> Node {
        self.graph.effect_input(self.node, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::builders;

    #[test]
    fn views_reject_wrong_opcodes() {
        let mut g = Graph::new();
        let a = builders::const_int(1).build(&mut g);
        let b = builders::const_int(2).build(&mut g);
        let add = builders::bin_op(Opcode::BinAdd).lhs(a).rhs(b).build(&mut g);

        assert!(BinOpView::new(&g, add).is_some());
        assert!(BinOpView::new(&g, a).is_none());
        assert!(IfView::new(&g, add).is_none());

        let view = BinOpView::new(&g, add).unwrap();
        assert_eq!(view.lhs(), a);
        assert_eq!(view.rhs(), b);
        assert!(view.is_commutative());
    }

    #[test]
    fn phi_maps_inputs_to_control() {
        let mut g = Graph::new();
        let start = builders::function("f").build(&mut g);
        let cond = builders::const_int(1).build(&mut g);
        let branch = builders::if_stmt(cond).build(&mut g);
        g.append_control_input(branch, start);
        let t = builders::if_branch(branch, true).build(&mut g);
        let f = builders::if_branch(branch, false).build(&mut g);
        let m = builders::merge().ctrl(t).ctrl(f).build(&mut g);

        let v1 = builders::const_int(10).build(&mut g);
        let v2 = builders::const_int(20).build(&mut g);
        let phi = builders::phi()
            .value(v1)
            .value(v2)
            .ctrl_merge(m)
            .build(&mut g);

        let view = PhiView::new(&g, phi).unwrap();
        assert_eq!(view.ctrl_pivot(), m);
        assert_eq!(view.map_ctrl_node(v1, UseKind::Value), Some(t));
        assert_eq!(view.map_ctrl_node(v2, UseKind::Value), Some(f));
    }

    #[test]
    fn if_projections() {
        let mut g = Graph::new();
        let cond = builders::const_int(0).build(&mut g);
        let branch = builders::if_stmt(cond).build(&mut g);
        let t = builders::if_branch(branch, true).build(&mut g);
        let f = builders::if_branch(branch, false).build(&mut g);

        let view = IfView::new(&g, branch).unwrap();
        assert_eq!(view.true_branch(), Some(t));
        assert_eq!(view.false_branch(), Some(f));
        assert_eq!(IfBranchView::new(&g, t).unwrap().branch_point(), branch);
    }
}
