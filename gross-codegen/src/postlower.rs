//! Post-machine lowering over the schedule.
//!
//! Branches become DLX conditional jumps against the block that is *not*
//! the RPO fall-through, unconditional jumps bridge non-adjacent sole
//! successors, call-sites expand into their bracketed parameter-passing
//! form, and the control skeleton that is now encoded in block layout is
//! trimmed away.

use crate::graph::properties::{CallView, IfView};
use crate::graph::{builders, Graph, Node, Opcode, UseKind};
use crate::schedule::GraphSchedule;
use log::debug;

/// The pass. Runs once per scheduled function.
pub struct PostMachineLowering;

impl PostMachineLowering {
    /// Create the pass.
    pub fn new() -> Self {
        Self
    }

    /// Run all three stages.
    pub fn run(&mut self, graph: &mut Graph, schedule: &mut GraphSchedule) {
        self.control_flow_lowering(graph, schedule);
        self.function_call_lowering(graph, schedule);
        self.trimming(graph, schedule);
    }

    fn control_flow_lowering(&mut self, graph: &mut Graph, schedule: &mut GraphSchedule) {
        // {old node, replacement or None to drop the old node}
        let mut staging: Vec<(Node, Option<Node>)> = Vec::new();
        let rpo = schedule.rpo_blocks().to_vec();
        for &bb in &rpo {
            let bb_rpo = schedule.rpo_index(bb);
            for &n in &schedule.block_nodes(bb).to_vec() {
                if graph.opcode(n) != Opcode::If {
                    continue;
                }
                let (true_br, false_br) = {
                    let view = IfView::new(graph, n).unwrap();
                    (
                        view.true_branch().expect("If without true branch"),
                        view.false_branch().expect("If without false branch"),
                    )
                };
                let true_bb = schedule.map_block(true_br).expect("branch not scheduled");
                let false_bb = schedule.map_block(false_br).expect("branch not scheduled");
                let target_bb = if schedule.rpo_index(true_bb) == bb_rpo + 1 {
                    false_bb
                } else if schedule.rpo_index(false_bb) == bb_rpo + 1 {
                    true_bb
                } else {
                    panic!("branch with no RPO-adjacent target");
                };
                let target_offset = schedule.block_offset(target_bb);

                assert_eq!(graph.num_value_inputs(n), 1);
                let mut predicate = graph.value_input(n, 0);
                if graph.opcode(predicate).is_relation() {
                    // The relation is consumed by the branch itself.
                    staging.push((predicate, None));
                } else {
                    // Materialize "!= 0" around non-relational predicates;
                    // the wrapper only carries the comparison shape, the
                    // predicate value stays scheduled.
                    let zero = builders::const_int(0).build(graph);
                    predicate = builders::bin_op(Opcode::BinNe)
                        .lhs(predicate)
                        .rhs(zero)
                        .build(graph);
                }

                let lhs = graph.value_input(predicate, 0);
                let rhs = graph.value_input(predicate, 1);
                // DLX branches compare one register against zero. A
                // relation with a non-zero right-hand side goes through a
                // compare first.
                let branch_val = if graph.int_value(rhs) == Some(0) {
                    lhs
                } else {
                    let cmp_op = if graph.opcode(rhs) == Opcode::ConstantInt {
                        Opcode::DLXCmpI
                    } else {
                        Opcode::DLXCmp
                    };
                    let cmp = builders::dlx_bin(cmp_op).lhs(lhs).rhs(rhs).build(graph);
                    schedule.add_node_before(bb, n, cmp);
                    cmp
                };

                let mut branch_op = to_branch_op(graph.opcode(predicate));
                if target_bb == false_bb {
                    branch_op = invert_branch_op(branch_op);
                }
                let br = builders::dlx_bin(branch_op)
                    .lhs(branch_val)
                    .rhs(target_offset)
                    .build(graph);
                debug!(
                    "lowering branch {} -> {}",
                    graph.display_node(n),
                    graph.display_node(br)
                );
                staging.push((n, Some(br)));
            }

            for (old, new) in staging.drain(..) {
                let old_bb = match schedule.map_block(old) {
                    Some(b) => b,
                    None => continue,
                };
                match new {
                    Some(new) => schedule.replace_node(old_bb, old, new),
                    None => {
                        schedule.remove_node(old_bb, old);
                    }
                }
            }

            // Bridge a non-adjacent sole successor with an unconditional
            // jump (branch-if-equal on the zero constant).
            if schedule.succs(bb).len() == 1 {
                let succ = schedule.succs(bb)[0];
                if schedule.rpo_index(succ) != bb_rpo + 1 {
                    let zero = builders::const_int(0).build(graph);
                    let offset = schedule.block_offset(succ);
                    let jmp = builders::dlx_bin(Opcode::DLXBeq)
                        .lhs(zero)
                        .rhs(offset)
                        .build(graph);
                    schedule.add_node(bb, jmp);
                }
            }
        }
    }

    fn function_call_lowering(&mut self, graph: &mut Graph, schedule: &mut GraphSchedule) {
        let mut callsites = Vec::new();
        for &bb in &schedule.rpo_blocks().to_vec() {
            for &n in schedule.block_nodes(bb) {
                if graph.opcode(n) == Opcode::Call {
                    callsites.push(n);
                }
            }
        }

        for call in callsites {
            let bb = schedule.map_block(call).expect("call not scheduled");
            let (stub, params) = {
                let view = CallView::new(graph, call).unwrap();
                (view.func_stub(), view.params().to_vec())
            };
            // The stub is not an instruction; drop it from the schedule
            // and from the call's operands.
            if let Some(stub_bb) = schedule.map_block(stub) {
                schedule.remove_node(stub_bb, stub);
            }
            graph.remove_value_input(call, 0);

            let begin = builders::callsite_begin().build(graph);
            schedule.add_node_before(bb, call, begin);
            let end = builders::callsite_end(begin).build(graph);
            schedule.add_node_after(bb, call, end);

            for param in params {
                let pass = builders::pass_param(param, begin).build(graph);
                schedule.add_node_before(bb, call, pass);
            }

            // The return value moves out of R1 right after the call.
            let ret_users: Vec<Node> = graph.value_users(call).collect();
            if !ret_users.is_empty() {
                let r1 = builders::dlx_register(1).build(graph);
                let zero = builders::const_int(0).build(graph);
                let new_ret = builders::dlx_bin(Opcode::DLXAddI)
                    .immediate()
                    .lhs(r1)
                    .rhs(zero)
                    .build(graph);
                for user in ret_users {
                    graph.replace_use_of_with(user, call, new_ret, UseKind::Value);
                }
                schedule.add_node_after(bb, call, new_ret);
            }
        }
    }

    fn trimming(&mut self, graph: &mut Graph, schedule: &mut GraphSchedule) {
        let mut staging = Vec::new();
        for &bb in &schedule.rpo_blocks().to_vec() {
            for &n in schedule.block_nodes(bb) {
                match graph.opcode(n) {
                    Opcode::If
                    | Opcode::Loop
                    | Opcode::IfTrue
                    | Opcode::IfFalse
                    | Opcode::Merge => staging.push((bb, n)),
                    // Effect-only phis are pure bookkeeping by now.
                    Opcode::Phi => {
                        if graph.num_value_inputs(n) == 0 && graph.num_effect_inputs(n) > 0 {
                            staging.push((bb, n));
                        }
                    }
                    _ => {}
                }
            }
            for &(block, n) in &staging {
                schedule.remove_node(block, n);
            }
            staging.clear();
        }
    }
}

fn to_branch_op(op: Opcode) -> Opcode {
    match op {
        Opcode::BinLt => Opcode::DLXBlt,
        Opcode::BinLe => Opcode::DLXBle,
        Opcode::BinGt => Opcode::DLXBgt,
        Opcode::BinGe => Opcode::DLXBge,
        Opcode::BinEq => Opcode::DLXBeq,
        Opcode::BinNe => Opcode::DLXBne,
        op => panic!("not a relation: {}", op),
    }
}

fn invert_branch_op(op: Opcode) -> Opcode {
    match op {
        Opcode::DLXBlt => Opcode::DLXBge,
        Opcode::DLXBle => Opcode::DLXBgt,
        Opcode::DLXBgt => Opcode::DLXBle,
        Opcode::DLXBge => Opcode::DLXBlt,
        Opcode::DLXBeq => Opcode::DLXBne,
        Opcode::DLXBne => Opcode::DLXBeq,
        op => panic!("not a branch: {}", op),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Graph, SubGraph};
    use crate::schedule::GraphScheduler;

    fn build_diamond(g: &mut Graph) -> (Node, SubGraph) {
        let a = builders::argument("a").build(g);
        let start = builders::function("f").param(a).build(g);
        let zero = builders::const_int(0).build(g);
        let cond = builders::bin_op(Opcode::BinLt).lhs(a).rhs(zero).build(g);
        let branch = builders::if_stmt(cond).build(g);
        g.append_control_input(branch, start);
        let t = builders::if_branch(branch, true).build(g);
        let f = builders::if_branch(branch, false).build(g);
        let m = builders::merge().ctrl(t).ctrl(f).build(g);
        let c1 = builders::const_int(1).build(g);
        let c2 = builders::const_int(2).build(g);
        let phi = builders::phi().value(c1).value(c2).ctrl_merge(m).build(g);
        let ret = builders::return_stmt().value(phi).build(g);
        g.append_control_input(ret, m);
        let end = builders::end(start).terminator(ret).build(g);
        let sg = SubGraph::new(end);
        g.add_subgraph(sg);
        (branch, sg)
    }

    #[test]
    fn branch_targets_the_non_adjacent_block() {
        let mut g = Graph::new();
        let (branch, sg) = build_diamond(&mut g);
        let mut schedule = GraphScheduler::compute(&mut g, sg).unwrap();

        let entry = schedule.entry_block();
        let true_bb = schedule.succs(entry)[0];
        let false_bb = schedule.succs(entry)[1];
        // The scheduler laid the true branch right after the entry.
        assert_eq!(schedule.rpo_index(true_bb), 1);

        PostMachineLowering::new().run(&mut g, &mut schedule);

        // The If is gone; its place is a conditional branch to the
        // non-adjacent false block, with the predicate inverted.
        assert!(schedule.map_block(branch).is_none());
        let last = *schedule.block_nodes(entry).last().unwrap();
        assert_eq!(g.opcode(last), Opcode::DLXBge);
        assert_eq!(g.value_input(last, 1), schedule.block_offset(false_bb));
        // No jump to the fall-through block was appended anywhere.
        let fallthrough_jumps = schedule
            .block_nodes(entry)
            .iter()
            .filter(|&&n| g.opcode(n) == Opcode::DLXBeq)
            .count();
        assert_eq!(fallthrough_jumps, 0);
    }

    #[test]
    fn trimming_erases_the_control_skeleton() {
        let mut g = Graph::new();
        let (_, sg) = build_diamond(&mut g);
        let mut schedule = GraphScheduler::compute(&mut g, sg).unwrap();
        PostMachineLowering::new().run(&mut g, &mut schedule);

        for &bb in schedule.rpo_blocks() {
            for &n in schedule.block_nodes(bb) {
                match g.opcode(n) {
                    Opcode::If
                    | Opcode::IfTrue
                    | Opcode::IfFalse
                    | Opcode::Merge
                    | Opcode::Loop => panic!("control skeleton survived trimming"),
                    _ => {}
                }
            }
        }
    }

    #[test]
    fn call_expands_into_bracketed_form() {
        let mut g = Graph::new();
        // A callee to reference.
        let callee_start = builders::function("callee").build(&mut g);
        let callee_end = builders::end(callee_start).build(&mut g);
        let callee_sg = SubGraph::new(callee_end);
        g.add_subgraph(callee_sg);
        let stub = builders::function_stub(callee_sg).build(&mut g);

        let start = builders::function("caller").build(&mut g);
        let c1 = builders::const_int(1).build(&mut g);
        let c2 = builders::const_int(2).build(&mut g);
        let call = builders::call(stub).arg(c1).arg(c2).build(&mut g);
        g.append_control_input(call, start);
        let ret = builders::return_stmt().value(call).build(&mut g);
        g.append_control_input(ret, start);
        let end = builders::end(start).terminator(ret).build(&mut g);
        let sg = SubGraph::new(end);
        g.add_subgraph(sg);

        let mut schedule = GraphScheduler::compute(&mut g, sg).unwrap();
        PostMachineLowering::new().run(&mut g, &mut schedule);

        let bb = schedule.map_block(call).unwrap();
        let nodes: Vec<Node> = schedule.block_nodes(bb).to_vec();
        let pos =
            |needle: Node| nodes.iter().position(|&n| n == needle).expect("node missing");

        let begin = nodes
            .iter()
            .cloned()
            .find(|&n| g.opcode(n) == Opcode::VirtDLXCallsiteBegin)
            .unwrap();
        let cs_end = nodes
            .iter()
            .cloned()
            .find(|&n| g.opcode(n) == Opcode::VirtDLXCallsiteEnd)
            .unwrap();
        let passes: Vec<Node> = nodes
            .iter()
            .cloned()
            .filter(|&n| g.opcode(n) == Opcode::VirtDLXPassParam)
            .collect();
        assert_eq!(passes.len(), 2);
        assert!(pos(begin) < pos(passes[0]));
        assert!(pos(passes[1]) < pos(call));
        assert!(pos(call) < pos(cs_end));

        // The return value is read out of R1, not the call node.
        let new_ret = g.value_input(ret, 0);
        assert_eq!(g.opcode(new_ret), Opcode::DLXAddI);
        assert!(pos(call) < pos(new_ret) && pos(new_ret) < pos(cs_end));
        // The stub operand is gone.
        assert!(!g.value_inputs(call).contains(&stub));
    }
}
