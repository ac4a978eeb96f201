//! A frontend for building GROSS graphs from parsed source.
//!
//! The parser drives a `FunctionGraphBuilder` per function. The builder
//! owns the parsing-time state the graph itself cannot carry: the current
//! control point, each variable's last modifier, and the reads hanging off
//! each modifier. Control-flow constructs fork that state through the
//! affine tables and join it back with parse-time phis whose effect inputs
//! are the surviving per-branch modifiers; value promotion turns those
//! into value phis later.

use crate::affine::{AffineContainer, AffineRecordTable};
use gross_codegen::entity::EntityRef;
use gross_codegen::graph::attributes::stub_has_attribute;
use gross_codegen::graph::properties::{IfView, LoopView};
use gross_codegen::graph::{builders, Attr, AttributeBuilder, Graph, Node, Opcode, SubGraph, UseKind};
use log::debug;
use std::collections::HashMap;

struct IfFrame {
    if_node: Node,
}

struct LoopFrame {
    loop_node: Node,
    body: Node,
    exit: Node,
    watermark: usize,
}

/// Builds one function's subgraph on behalf of the parser.
pub struct FunctionGraphBuilder<'a> {
    graph: &'a mut Graph,
    start: Node,
    args: Vec<Node>,
    last_ctrl: AffineContainer<Node>,
    last_modified: AffineRecordTable<Node, Node>,
    last_mem_access: AffineRecordTable<Node, Vec<Node>>,
    // Chain of environment-visible calls; the tail anchors at End.
    last_io: AffineContainer<Option<Node>>,
    if_stack: Vec<IfFrame>,
    loop_stack: Vec<LoopFrame>,
    pending_watermarks: Vec<usize>,
    terminators: Vec<Node>,
}

impl<'a> FunctionGraphBuilder<'a> {
    /// Open a function with the given name and formal parameter names.
    pub fn new(graph: &'a mut Graph, name: &str, params: &[&str]) -> Self {
        let args: Vec<Node> = params
            .iter()
            .map(|p| builders::argument(p).build(graph))
            .collect();
        let mut fb = builders::function(name);
        for &a in &args {
            fb = fb.param(a);
        }
        let start = fb.build(graph);
        Self {
            graph,
            start,
            args,
            last_ctrl: AffineContainer::new(start),
            last_modified: AffineRecordTable::new(),
            last_mem_access: AffineRecordTable::new(),
            last_io: AffineContainer::new(None),
            if_stack: Vec::new(),
            loop_stack: Vec::new(),
            pending_watermarks: Vec::new(),
            terminators: Vec::new(),
        }
    }

    /// The graph under construction.
    pub fn graph(&mut self) -> &mut Graph {
        self.graph
    }

    /// The function's `Start` node.
    pub fn start(&self) -> Node {
        self.start
    }

    /// The `Argument` nodes, in parameter order.
    pub fn arguments(&self) -> &[Node] {
        &self.args
    }

    fn cur_ctrl(&self) -> Node {
        *self.last_ctrl.current()
    }

    fn set_cur_ctrl(&mut self, n: Node) {
        *self.last_ctrl.current_mut() = n;
    }

    // ------------------------------------------------------------------
    // Declarations.

    /// Declare a local scalar.
    pub fn declare_var(&mut self, name: &str) -> Node {
        builders::var_decl(name).build(self.graph)
    }

    /// Declare a local array; its pristine state anchors the memory chain.
    pub fn declare_array(&mut self, name: &str, dims: &[u32]) -> Node {
        let mut b = builders::array_decl(name);
        for &d in dims {
            b = b.const_dim(self.graph, d);
        }
        let decl = b.build(self.graph);
        let initial = builders::initial_array(decl).build(self.graph);
        self.last_modified.insert(decl, initial);
        decl
    }

    /// Declare a global scalar or array and register it with the graph.
    pub fn declare_global_var(&mut self, name: &str) -> Node {
        let decl = self.declare_var(name);
        self.graph.mark_global(decl);
        decl
    }

    /// Declare a global array.
    pub fn declare_global_array(&mut self, name: &str, dims: &[u32]) -> Node {
        let decl = self.declare_array(name, dims);
        self.graph.mark_global(decl);
        decl
    }

    // ------------------------------------------------------------------
    // Expressions.

    /// An integer literal.
    pub fn const_int(&mut self, value: i32) -> Node {
        builders::const_int(value).build(self.graph)
    }

    /// A binary operation.
    pub fn bin_op(&mut self, op: Opcode, lhs: Node, rhs: Node) -> Node {
        builders::bin_op(op).lhs(lhs).rhs(rhs).build(self.graph)
    }

    /// Read a scalar variable or parameter at the current program point.
    pub fn read_var(&mut self, decl: Node) -> Node {
        let mut b = builders::var_access(decl);
        if let Some(&modifier) = self.last_modified.get(&decl) {
            b = b.effect(modifier);
        }
        b.build(self.graph)
    }

    /// Read an array element; the read joins the modifier's read set so a
    /// later write is ordered after it.
    pub fn read_array(&mut self, decl: Node, indices: &[Node]) -> Node {
        let modifier = self.last_modified.get(&decl).cloned();
        let mut b = builders::array_access(decl);
        for &i in indices {
            b = b.dim(i);
        }
        if let Some(m) = modifier {
            b = b.effect(m);
        }
        let access = b.build(self.graph);
        if let Some(m) = modifier {
            let mut reads = self.last_mem_access.get(&m).cloned().unwrap_or_default();
            reads.push(access);
            self.last_mem_access.insert(m, reads);
        }
        access
    }

    // ------------------------------------------------------------------
    // Statements.

    /// `let <var> <- <value>`.
    pub fn assign_var(&mut self, decl: Node, value: Node) -> Node {
        let mut b = builders::var_access(decl);
        if let Some(&modifier) = self.last_modified.get(&decl) {
            b = b.effect(modifier);
        }
        let dest = b.build(self.graph);
        let assign = builders::assign(dest, value).build(self.graph);
        let ctrl = self.cur_ctrl();
        self.graph.append_control_input(assign, ctrl);
        self.last_modified.insert(decl, assign);
        assign
    }

    /// `let <arr>[i]... <- <value>`. The write is ordered after every read
    /// of the previous memory state.
    pub fn assign_array(&mut self, decl: Node, indices: &[Node], value: Node) -> Node {
        let modifier = self.last_modified.get(&decl).cloned();
        let reads: Vec<Node> = modifier
            .and_then(|m| self.last_mem_access.get(&m).cloned())
            .unwrap_or_default();

        let mut b = builders::array_access(decl);
        for &i in indices {
            b = b.dim(i);
        }
        let dest = b.build(self.graph);
        if !reads.is_empty() {
            for r in reads {
                self.graph.append_effect_input(dest, r);
            }
        } else if let Some(m) = modifier {
            self.graph.append_effect_input(dest, m);
        }

        let assign = builders::assign(dest, value).build(self.graph);
        let ctrl = self.cur_ctrl();
        self.graph.append_control_input(assign, ctrl);
        self.last_modified.insert(decl, assign);
        self.last_mem_access.insert(assign, Vec::new());
        assign
    }

    /// `if <cond> then ...`: fork the parse state.
    pub fn begin_if(&mut self, condition: Node) -> Node {
        let if_node = builders::if_stmt(condition).build(self.graph);
        let ctrl = self.cur_ctrl();
        self.graph.append_control_input(if_node, ctrl);
        self.set_cur_ctrl(if_node);

        self.last_ctrl.new_scope();
        self.last_modified.new_scope();
        self.last_mem_access.new_scope();
        self.last_io.new_scope();

        let true_branch = builders::if_branch(if_node, true).build(self.graph);
        self.set_cur_ctrl(true_branch);
        self.if_stack.push(IfFrame { if_node });
        if_node
    }

    /// `else ...`: switch to the sibling branch.
    pub fn begin_else(&mut self) -> Node {
        let if_node = self.if_stack.last().expect("else outside of if").if_node;
        self.last_ctrl.new_branch();
        self.last_modified.new_branch();
        self.last_mem_access.new_branch();
        self.last_io.new_branch();
        let false_branch = builders::if_branch(if_node, false).build(self.graph);
        self.set_cur_ctrl(false_branch);
        false_branch
    }

    /// `fi`: join control and state, inserting phis for variables the
    /// branches disagree on. Returns the merge node.
    pub fn end_if(&mut self) -> Node {
        let _frame = self.if_stack.pop().expect("unbalanced if");

        // Join control first so the phis have their pivot.
        let graph = &mut *self.graph;
        let mut merge_node = None;
        self.last_ctrl.close_scope(|ctrl, branches| {
            let mut mb = builders::merge().ctrl(branches[0]);
            if branches.len() == 1 {
                // No else: the fall-through edge comes from the If itself.
                mb = mb.ctrl(*ctrl.current());
            } else {
                mb = mb.ctrl(branches[1]);
            }
            let m = mb.build(graph);
            *ctrl.current_mut() = m;
            merge_node = Some(m);
        });
        let merge_node = merge_node.unwrap();

        // Reads recorded under a branch still guard later writes.
        self.last_mem_access.close_scope(|table, branch_tables| {
            for bt in branch_tables {
                for (store, reads) in bt {
                    let mut joined = table.get(&store).cloned().unwrap_or_default();
                    for r in reads {
                        if !joined.contains(&r) {
                            joined.push(r);
                        }
                    }
                    table.insert(store, joined);
                }
            }
        });

        // Join the IO chain the same way variables join.
        let graph = &mut *self.graph;
        self.last_io.close_scope(|io, branches| {
            let parent = io.current().clone();
            let b0 = branches[0];
            let b1 = if branches.len() == 2 { branches[1] } else { parent };
            let joined = match (b0, b1) {
                (Some(x), Some(y)) if x != y => {
                    let phi = builders::phi()
                        .effect(x)
                        .effect(y)
                        .ctrl_merge(merge_node)
                        .build(graph);
                    Some(phi)
                }
                (Some(x), _) => Some(x),
                (_, Some(y)) => Some(y),
                (None, None) => None,
            };
            *io.current_mut() = joined;
        });

        let graph = &mut *self.graph;
        self.last_modified.close_scope(|join, branch_tables| {
            let init_vals: HashMap<Node, Node> =
                join.iter().map(|(&d, &m)| (d, m)).collect();
            let num_branches = branch_tables.len().max(2);
            let mut variants: HashMap<Node, Vec<Node>> = HashMap::new();
            for (idx, bt) in branch_tables.iter().enumerate() {
                for (&decl, &modifier) in bt {
                    let slots = variants.entry(decl).or_insert_with(|| {
                        let init = init_vals
                            .get(&decl)
                            .cloned()
                            .unwrap_or_else(|| initial_value(graph, decl));
                        vec![init; num_branches]
                    });
                    slots[idx] = modifier;
                }
            }
            for (decl, variant) in variants {
                let n1 = variant[variant.len() - 2];
                let n2 = variant[variant.len() - 1];
                if n1 == n2 {
                    continue;
                }
                let phi = builders::phi()
                    .effect(n1)
                    .effect(n2)
                    .ctrl_merge(merge_node)
                    .build(graph);
                debug!("if-join phi {} for {}", phi, graph.display_node(decl));
                join.insert(decl, phi);
            }
        });

        merge_node
    }

    /// `while`: remember where the loop's nodes begin so their uses of
    /// pre-loop values can be rewired to the header phis. Call before
    /// building the condition expression.
    pub fn begin_while(&mut self) {
        self.pending_watermarks.push(self.graph.node_size());
    }

    /// `do`: build the loop header around the parsed condition and enter
    /// the body.
    pub fn enter_loop(&mut self, condition: Node) -> Node {
        let watermark = self
            .pending_watermarks
            .pop()
            .expect("enter_loop without begin_while");
        let ctrl = self.cur_ctrl();
        let loop_node = builders::loop_header(ctrl, condition).build(self.graph);
        let branch = LoopView::new(self.graph, loop_node)
            .unwrap()
            .branch()
            .expect("loop without branch");
        let view = IfView::new(self.graph, branch).unwrap();
        let body = view.true_branch().expect("loop without body entry");
        let exit = view.false_branch().expect("loop without exit");

        self.last_ctrl.new_scope();
        self.last_modified.new_scope();
        self.last_mem_access.new_scope();
        self.last_io.new_scope();
        self.set_cur_ctrl(body);

        self.loop_stack.push(LoopFrame {
            loop_node,
            body,
            exit,
            watermark,
        });
        loop_node
    }

    /// `od`: close the body, insert header phis, patch in-loop users of
    /// the pre-loop values, and continue at the exit branch.
    pub fn end_while(&mut self) -> Node {
        let frame = self.loop_stack.pop().expect("unbalanced while");

        // The backedge is the body's final control point.
        let mut backedge = None;
        self.last_ctrl.close_scope(|_, branches| {
            backedge = Some(branches[0]);
        });
        let backedge = backedge.unwrap();
        if backedge != frame.body {
            self.graph.set_control_input(frame.loop_node, 1, backedge);
        }

        self.last_mem_access.close_scope(|table, branch_tables| {
            for bt in branch_tables {
                for (store, reads) in bt {
                    let mut joined = table.get(&store).cloned().unwrap_or_default();
                    for r in reads {
                        if !joined.contains(&r) {
                            joined.push(r);
                        }
                    }
                    table.insert(store, joined);
                }
            }
        });

        let graph = &mut *self.graph;
        let loop_node = frame.loop_node;
        let watermark = frame.watermark;
        self.last_io.close_scope(|io, branches| {
            let init = io.current().clone();
            let body_io = branches[0];
            let joined = match (init, body_io) {
                (Some(i), Some(b)) if i != b => {
                    let phi = builders::phi()
                        .effect(i)
                        .effect(b)
                        .ctrl_merge(loop_node)
                        .build(graph);
                    let users: Vec<Node> = graph.users(i).to_vec();
                    for u in users {
                        if u != phi && u.index() >= watermark {
                            graph.replace_use_of_with(u, i, phi, UseKind::Effect);
                        }
                    }
                    Some(phi)
                }
                (_, Some(b)) => Some(b),
                (i, None) => i,
            };
            *io.current_mut() = joined;
        });

        let graph = &mut *self.graph;
        self.last_modified.close_scope(|join, branch_tables| {
            assert_eq!(branch_tables.len(), 1, "loop body forks no branch");
            for (&decl, &modifier) in &branch_tables[0] {
                let init = match join.get(&decl).cloned() {
                    Some(init) => init,
                    None => initial_value(graph, decl),
                };
                if init == modifier {
                    continue;
                }
                let phi = builders::phi()
                    .effect(init)
                    .effect(modifier)
                    .ctrl_merge(loop_node)
                    .build(graph);
                debug!("loop phi {} for {}", phi, graph.display_node(decl));
                // Everything created since the condition reads the value
                // through the phi, not the pre-loop state.
                let users: Vec<Node> = graph.users(init).to_vec();
                for u in users {
                    if u != phi && u.index() >= watermark {
                        graph.replace_use_of_with(u, init, phi, UseKind::Effect);
                    }
                }
                join.insert(decl, phi);
            }
        });

        self.set_cur_ctrl(frame.exit);
        frame.exit
    }

    /// A call at the current program point. A callee that may touch
    /// memory serializes against every live global chain.
    pub fn call(&mut self, stub: Node, args: &[Node]) -> Node {
        let mut cb = builders::call(stub);
        for &a in args {
            cb = cb.arg(a);
        }
        let call = cb.build(self.graph);
        let ctrl = self.cur_ctrl();
        self.graph.append_control_input(call, ctrl);

        if !stub_has_attribute(self.graph, stub, Attr::NoMem) {
            let globals: Vec<Node> = self.graph.global_vars().to_vec();
            for g in globals {
                if let Some(&last) = self.last_modified.get(&g) {
                    self.graph.append_effect_input(call, last);
                    if let Some(reads) = self.last_mem_access.get(&last).cloned() {
                        for r in reads {
                            self.graph.append_effect_input(call, r);
                        }
                    }
                    self.last_modified.insert(g, call);
                }
            }
        }
        if stub_has_attribute(self.graph, stub, Attr::HasSideEffect) {
            // Environment effects are ordered among themselves.
            if let Some(prev) = *self.last_io.current() {
                self.graph.append_effect_input(call, prev);
            }
            *self.last_io.current_mut() = Some(call);
        }
        call
    }

    /// `return [<expr>]`.
    pub fn ret(&mut self, value: Option<Node>) -> Node {
        let mut rb = builders::return_stmt();
        if let Some(v) = value {
            rb = rb.value(v);
        }
        let ret = rb.build(self.graph);
        let ctrl = self.cur_ctrl();
        self.graph.append_control_input(ret, ctrl);
        self.terminators.push(ret);
        ret
    }

    /// Close the function: build `End`, keep dangling memory writes
    /// alive, register the subgraph with the graph.
    pub fn finish(self) -> SubGraph {
        let mut eb = builders::end(self.start);
        for &t in &self.terminators {
            eb = eb.terminator(t);
        }
        // A store to a global or array with no later read must still
        // happen; End anchors it.
        let mut dangling: Vec<Node> = Vec::new();
        for (&decl, &last) in self.last_modified.iter() {
            let op = self.graph.opcode(decl);
            let memory = op == Opcode::SrcArrayDecl || self.graph.is_global_var(decl);
            if memory && self.graph.opcode(last) != Opcode::SrcInitialArray {
                dangling.push(last);
            }
        }
        dangling.sort();
        for last in dangling {
            eb = eb.effect(last);
        }
        if let Some(io) = *self.last_io.current() {
            eb = eb.effect(io);
        }
        let end = eb.build(self.graph);
        let sg = SubGraph::new(end);
        self.graph.add_subgraph(sg);
        sg
    }
}

fn initial_value(graph: &mut Graph, decl: Node) -> Node {
    if graph.opcode(decl) == Opcode::Argument {
        decl
    } else {
        builders::const_int(0).build(graph)
    }
}

/// Register the IO builtins and return `(name, stub)` pairs. Builtins get
/// no body; their attributes tell call-sites how they behave.
pub fn declare_builtins(graph: &mut Graph) -> Vec<(String, Node)> {
    let specs: [(&str, &[&str], &[Attr]); 3] = [
        (
            "InputNum",
            &[],
            &[Attr::IsBuiltin, Attr::HasSideEffect, Attr::ReadMem],
        ),
        ("OutputNum", &["x"], &[Attr::IsBuiltin, Attr::HasSideEffect]),
        ("OutputNewLine", &[], &[Attr::IsBuiltin, Attr::HasSideEffect]),
    ];

    let mut stubs = Vec::new();
    for &(name, params, attrs) in &specs {
        let args: Vec<Node> = params
            .iter()
            .map(|p| builders::argument(p).build(graph))
            .collect();
        let mut fb = builders::function(name);
        for &a in &args {
            fb = fb.param(a);
        }
        let start = fb.build(graph);
        let end = builders::end(start).build(graph);

        let mut ab = AttributeBuilder::new();
        for &attr in attrs {
            ab = ab.add(attr);
        }
        ab.attach(graph, start);

        let stub = builders::function_stub(SubGraph::new(end)).build(graph);
        stubs.push((name.to_string(), stub));
    }
    stubs
}

#[cfg(test)]
mod tests {
    use super::*;
    use gross_codegen::graph::reducer::run_reducer;
    use gross_codegen::reductions::{PeepholeReducer, ValuePromotion};

    // if a < 0 then let b <- 1 else let b <- 2 fi; return b
    #[test]
    fn if_else_promotes_to_value_phi() {
        let mut g = gross_codegen::graph::graph();
        let mut fb = FunctionGraphBuilder::new(&mut g, "f", &["a"]);
        let a = fb.arguments()[0];
        let b = fb.declare_var("b");

        let a_read = fb.read_var(a);
        let zero = fb.const_int(0);
        let cond = fb.bin_op(Opcode::BinLt, a_read, zero);
        fb.begin_if(cond);
        let one = fb.const_int(1);
        fb.assign_var(b, one);
        fb.begin_else();
        let two = fb.const_int(2);
        fb.assign_var(b, two);
        fb.end_if();
        let b_read = fb.read_var(b);
        let ret = fb.ret(Some(b_read));
        fb.finish();

        run_reducer(&mut g, &mut ValuePromotion::new());

        let phi = g.value_input(ret, 0);
        assert_eq!(g.opcode(phi), Opcode::Phi);
        assert_eq!(
            g.value_inputs(phi)
                .iter()
                .map(|&v| g.int_value(v))
                .collect::<Vec<_>>(),
            vec![Some(1), Some(2)]
        );
        let pivot = g.control_input(phi, 0);
        assert_eq!(g.opcode(pivot), Opcode::Merge);
        assert!(g
            .control_inputs(pivot)
            .iter()
            .all(|&c| g.opcode(c).is_if_branch()));
    }

    // let i <- 0; while i < 10 do let i <- i + 1 od; return i
    #[test]
    fn while_loop_builds_induction_phi() {
        let mut g = gross_codegen::graph::graph();
        let mut fb = FunctionGraphBuilder::new(&mut g, "f", &[]);
        let i = fb.declare_var("i");
        let zero = fb.const_int(0);
        fb.assign_var(i, zero);

        fb.begin_while();
        let i_read = fb.read_var(i);
        let ten = fb.const_int(10);
        let cond = fb.bin_op(Opcode::BinLt, i_read, ten);
        let loop_node = fb.enter_loop(cond);
        let i_body = fb.read_var(i);
        let one = fb.const_int(1);
        let inc = fb.bin_op(Opcode::BinAdd, i_body, one);
        fb.assign_var(i, inc);
        fb.end_while();

        let i_after = fb.read_var(i);
        let ret = fb.ret(Some(i_after));
        fb.finish();

        run_reducer(&mut g, &mut ValuePromotion::new());
        run_reducer(&mut g, &mut PeepholeReducer::new());

        // The return reads the header phi through the exit branch.
        let phi = g.value_input(ret, 0);
        assert_eq!(g.opcode(phi), Opcode::Phi);
        assert_eq!(g.control_input(phi, 0), loop_node);
        // The phi merges the initial zero with the incremented value.
        let inputs = g.value_inputs(phi);
        assert_eq!(g.int_value(inputs[0]), Some(0));
        assert_eq!(inputs[1], inc);
        // The increment reads through the phi, closing the cycle.
        assert_eq!(g.value_input(inc, 0), phi);
        // The loop condition reads through the phi as well.
        assert_eq!(g.value_input(cond, 0), phi);
    }

    #[test]
    fn builtins_carry_attributes() {
        let mut g = gross_codegen::graph::graph();
        let stubs = declare_builtins(&mut g);
        let output_num = stubs
            .iter()
            .find(|(name, _)| name == "OutputNum")
            .map(|&(_, stub)| stub)
            .unwrap();
        assert!(stub_has_attribute(&g, output_num, Attr::IsBuiltin));
        assert!(stub_has_attribute(&g, output_num, Attr::HasSideEffect));
        assert!(!stub_has_attribute(&g, output_num, Attr::NoMem));
    }
}
