//! The fix-point graph reducer.
//!
//! A reducer object looks at one node at a time and either leaves it alone
//! or replaces it (possibly with itself, meaning "changed in place"). The
//! driver walks each function subgraph in DFS finish order, so a node is
//! visited after its inputs, and keeps revisiting affected users until
//! nothing changes.
//!
//! Reducers mutate the graph only through the `GraphEditor` handed to them;
//! the editor also carries the explicit revisit request queue.

use crate::graph::marker::NodeMarker;
use crate::graph::{Graph, Node, SubGraph};
use gross_entity::EntitySet;
use log::debug;
use std::collections::VecDeque;

/// Outcome of reducing one node.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Reduction {
    /// Nothing to do.
    NoChange,
    /// The node is superseded by the payload; if the payload is the node
    /// itself it was changed in place.
    Replace(Node),
}

/// Convenience constructor mirroring the C-style reducer protocol.
pub fn no_change() -> Reduction {
    Reduction::NoChange
}

/// Convenience constructor mirroring the C-style reducer protocol.
pub fn replace(n: Node) -> Reduction {
    Reduction::Replace(n)
}

/// Mutation capability handed to reducers.
pub struct GraphEditor<'a> {
    graph: &'a mut Graph,
    revisit: &'a mut Vec<Node>,
}

impl<'a> GraphEditor<'a> {
    /// Read access to the graph.
    pub fn graph(&self) -> &Graph {
        self.graph
    }

    /// Write access to the graph.
    pub fn graph_mut(&mut self) -> &mut Graph {
        self.graph
    }

    /// Ask the driver to re-run the reducer on `n` once the current node is
    /// done. Only nodes that were already visited are re-queued.
    pub fn revisit(&mut self, n: Node) {
        self.revisit.push(n);
    }
}

/// A single optimization pass, driven to fix-point by `run_reducer`.
pub trait Reducer {
    /// Pass name for diagnostics.
    fn name(&self) -> &'static str;

    /// Look at `node`, mutate through `editor`, report what happened.
    fn reduce(&mut self, editor: &mut GraphEditor, node: Node) -> Reduction;
}

// Reduction states stored in the marker window. `Recurse` only pushes nodes
// whose state is at most `REVISIT`.
const UNVISITED: u32 = 0;
const REVISIT: u32 = 1;
const ON_STACK: u32 = 2;
const VISITED: u32 = 3;

/// Run `reducer` to fix-point over every registered function subgraph.
pub fn run_reducer(graph: &mut Graph, reducer: &mut dyn Reducer) {
    let subgraphs: Vec<SubGraph> = graph.subgraphs().to_vec();
    for sg in subgraphs {
        run_reducer_on(graph, sg, reducer);
    }
}

/// Run `reducer` to fix-point over one function subgraph.
pub fn run_reducer_on(graph: &mut Graph, subgraph: SubGraph, reducer: &mut dyn Reducer) {
    debug!("running reducer {} on {}", reducer.name(), graph.display_node(subgraph.end()));
    let marker: NodeMarker<u32> = NodeMarker::new(graph, 4);

    // Reduction stack in DFS finish order: a node pops before its users.
    let mut stack = dfs_finish_order(graph, subgraph.end());
    stack.reverse();
    for &n in &stack {
        marker.set(graph, n, ON_STACK);
    }

    let mut revisit_queue: VecDeque<Node> = VecDeque::new();
    let mut requests: Vec<Node> = Vec::new();

    while !stack.is_empty() || !revisit_queue.is_empty() {
        while let Some(&n) = stack.last() {
            if graph.is_dead(n) {
                stack.pop();
                marker.set(graph, n, VISITED);
                continue;
            }

            let result = {
                let mut editor = GraphEditor {
                    graph: &mut *graph,
                    revisit: &mut requests,
                };
                reducer.reduce(&mut editor, n)
            };
            for r in requests.drain(..) {
                if marker.get(graph, r) == VISITED {
                    marker.set(graph, r, REVISIT);
                    revisit_queue.push_back(r);
                }
            }

            match result {
                Reduction::NoChange => {
                    stack.pop();
                    marker.set(graph, n, VISITED);
                }
                Reduction::Replace(m) if m == n => {
                    // Changed in place: reconsider the inputs first.
                    let mut recursed = false;
                    let inputs: Vec<Node> = graph.inputs(n).to_vec();
                    for input in inputs {
                        if input != n && marker.get(graph, input) <= REVISIT {
                            marker.set(graph, input, ON_STACK);
                            stack.push(input);
                            recursed = true;
                        }
                    }
                    if recursed {
                        continue;
                    }
                    stack.pop();
                    marker.set(graph, n, VISITED);
                    let users: Vec<Node> = graph.users(n).to_vec();
                    for u in users {
                        if u != n && marker.get(graph, u) == VISITED {
                            marker.set(graph, u, REVISIT);
                            revisit_queue.push_back(u);
                        }
                    }
                }
                Reduction::Replace(m) => {
                    debug!(
                        "{}: {} -> {}",
                        reducer.name(),
                        graph.display_node(n),
                        graph.display_node(m)
                    );
                    stack.pop();
                    marker.set(graph, n, VISITED);
                    let users: Vec<Node> = graph.users(n).to_vec();
                    for u in users {
                        if u != n && marker.get(graph, u) == VISITED {
                            marker.set(graph, u, REVISIT);
                            revisit_queue.push_back(u);
                        }
                    }
                    graph.replace_all_uses(n, m);
                    graph.kill(n);
                    if marker.get(graph, m) <= REVISIT {
                        marker.set(graph, m, ON_STACK);
                        stack.push(m);
                    }
                }
            }
        }

        // FIFO refill of users queued while already visited.
        while let Some(n) = revisit_queue.pop_front() {
            if marker.get(graph, n) == REVISIT {
                marker.set(graph, n, ON_STACK);
                stack.push(n);
            }
        }
    }
}

/// Iterative DFS over inputs from `end`; returns nodes in finish order
/// (inputs before users, `end` last).
fn dfs_finish_order(graph: &Graph, end: Node) -> Vec<Node> {
    let mut order = Vec::new();
    let mut visited = EntitySet::new();
    let mut stack: Vec<(Node, usize)> = Vec::new();
    visited.insert(end);
    stack.push((end, 0));
    loop {
        let (n, child) = match stack.last_mut() {
            Some(top) => {
                let pair = *top;
                top.1 += 1;
                pair
            }
            None => break,
        };
        let inputs = graph.inputs(n);
        if child < inputs.len() {
            let next = inputs[child];
            if visited.insert(next) {
                stack.push((next, 0));
            }
        } else {
            order.push(n);
            stack.pop();
        }
    }
    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{builders, Opcode};

    // Folds every BinAdd of two constants; used to exercise the driver.
    struct AddFolder;

    impl Reducer for AddFolder {
        fn name(&self) -> &'static str {
            "add-folder"
        }

        fn reduce(&mut self, editor: &mut GraphEditor, node: Node) -> Reduction {
            if editor.graph().opcode(node) != Opcode::BinAdd {
                return no_change();
            }
            let lhs = editor.graph().value_input(node, 0);
            let rhs = editor.graph().value_input(node, 1);
            match (editor.graph().int_value(lhs), editor.graph().int_value(rhs)) {
                (Some(a), Some(b)) => {
                    let folded = builders::const_int(a + b).build(editor.graph_mut());
                    replace(folded)
                }
                _ => no_change(),
            }
        }
    }

    #[test]
    fn folds_to_fix_point() {
        let mut g = Graph::new();
        let start = builders::function("f").build(&mut g);
        let c1 = builders::const_int(1).build(&mut g);
        let c2 = builders::const_int(2).build(&mut g);
        let c3 = builders::const_int(3).build(&mut g);
        // (1 + 2) + 3: the outer add only folds after the inner one.
        let inner = builders::bin_op(Opcode::BinAdd).lhs(c1).rhs(c2).build(&mut g);
        let outer = builders::bin_op(Opcode::BinAdd)
            .lhs(inner)
            .rhs(c3)
            .build(&mut g);
        let ret = builders::return_stmt().value(outer).build(&mut g);
        g.append_control_input(ret, start);
        let end = builders::end(start).terminator(ret).build(&mut g);
        let sg = SubGraph::new(end);
        g.add_subgraph(sg);

        run_reducer(&mut g, &mut AddFolder);

        let result = g.value_input(ret, 0);
        assert_eq!(g.opcode(result), Opcode::ConstantInt);
        assert_eq!(g.int_value(result), Some(6));
        // The intermediate adds are no longer reachable from End.
        assert!(!sg.nodes(&g).iter().any(|&n| g.opcode(n) == Opcode::BinAdd));
    }
}
