//! Post-register-allocation peepholes.
//!
//! A bounded per-block fix-point that deletes degenerate moves
//! (`AddI x, x, #0` after three-address commit) and the bookkeeping nodes
//! whose meaning is fully spent: phis, merges, and the call-site brackets.

use crate::graph::{Graph, Node, Opcode};
use crate::schedule::{Block, GraphSchedule};

const PEEPHOLE_MAX_ITERATIONS: usize = 10;

/// The pass. Runs once per allocated function.
pub struct PostRALowering {
    max_iterations: usize,
}

impl PostRALowering {
    /// Create the pass with the default iteration bound.
    pub fn new() -> Self {
        Self {
            max_iterations: PEEPHOLE_MAX_ITERATIONS,
        }
    }

    /// Run the peepholes over every block.
    pub fn run(&mut self, graph: &Graph, schedule: &mut GraphSchedule) {
        for &bb in &schedule.rpo_blocks().to_vec() {
            let mut counter = 0;
            while self.visit_block(graph, schedule, bb) {
                counter += 1;
                if counter >= self.max_iterations {
                    break;
                }
            }
        }
    }

    fn visit_block(&mut self, graph: &Graph, schedule: &mut GraphSchedule, bb: Block) -> bool {
        let nodes: Vec<Node> = schedule.block_nodes(bb).to_vec();
        let mut changed = false;
        for n in nodes {
            match graph.opcode(n) {
                Opcode::DLXAdd | Opcode::DLXAddI => {
                    changed |= self.visit_add(graph, schedule, bb, n);
                }
                Opcode::Phi
                | Opcode::Merge
                | Opcode::VirtDLXCallsiteBegin
                | Opcode::VirtDLXCallsiteEnd => {
                    changed |= schedule.remove_node(bb, n);
                }
                _ => {}
            }
        }
        changed
    }

    /// `AddI x, x, #0` moves nothing; drop it.
    fn visit_add(&mut self, graph: &Graph, schedule: &mut GraphSchedule, bb: Block, n: Node) -> bool {
        if graph.num_value_inputs(n) != 3 {
            // Not yet committed to three-address form.
            return false;
        }
        if is_zero(graph, graph.value_input(n, 2))
            && graph.value_input(n, 0) == graph.value_input(n, 1)
        {
            return schedule.remove_node(bb, n);
        }
        false
    }
}

// The zero register or the zero constant.
fn is_zero(graph: &Graph, n: Node) -> bool {
    graph.opcode(n) == Opcode::DLXr0 || graph.int_value(n) == Some(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{builders, SubGraph};
    use crate::schedule::GraphScheduler;

    #[test]
    fn degenerate_moves_disappear() {
        let mut g = Graph::new();
        let start = builders::function("f").build(&mut g);
        let end = builders::end(start).build(&mut g);
        let sg = SubGraph::new(end);
        g.add_subgraph(sg);
        let mut schedule = GraphScheduler::compute(&mut g, sg).unwrap();

        // A committed move r9 <- r9 + #0 and a real one r9 <- r8 + #0.
        let r8 = builders::dlx_register(8).build(&mut g);
        let r9 = builders::dlx_register(9).build(&mut g);
        let zero = builders::const_int(0).build(&mut g);
        let dead_move = builders::dlx_bin(Opcode::DLXAddI)
            .immediate()
            .lhs(r9)
            .rhs(zero)
            .build(&mut g);
        g.append_value_input(dead_move, r9); // wrong slot order fixed below
        let real_move = builders::dlx_bin(Opcode::DLXAddI)
            .immediate()
            .lhs(r9)
            .rhs(zero)
            .build(&mut g);
        g.append_value_input(real_move, r8);

        // Rearrange to committed (dest, src, imm) order.
        let entry = schedule.entry_block();
        g.set_value_input(dead_move, 1, r9);
        g.set_value_input(dead_move, 2, zero);
        g.set_value_input(real_move, 0, r9);
        g.set_value_input(real_move, 1, r8);
        g.set_value_input(real_move, 2, zero);
        schedule.add_node(entry, dead_move);
        schedule.add_node(entry, real_move);

        PostRALowering::new().run(&g, &mut schedule);

        let nodes = schedule.block_nodes(entry);
        assert!(!nodes.contains(&dead_move));
        assert!(nodes.contains(&real_move));
    }

    #[test]
    fn bookkeeping_nodes_are_trimmed() {
        let mut g = Graph::new();
        let start = builders::function("f").build(&mut g);
        let end = builders::end(start).build(&mut g);
        let sg = SubGraph::new(end);
        g.add_subgraph(sg);
        let mut schedule = GraphScheduler::compute(&mut g, sg).unwrap();
        let entry = schedule.entry_block();

        let begin = builders::callsite_begin().build(&mut g);
        schedule.add_node(entry, begin);
        let cs_end = builders::callsite_end(begin).build(&mut g);
        schedule.add_node(entry, cs_end);

        PostRALowering::new().run(&g, &mut schedule);

        for &n in schedule.block_nodes(entry) {
            match g.opcode(n) {
                Opcode::Phi
                | Opcode::Merge
                | Opcode::VirtDLXCallsiteBegin
                | Opcode::VirtDLXCallsiteEnd => panic!("bookkeeping node survived"),
                _ => {}
            }
        }
    }
}
