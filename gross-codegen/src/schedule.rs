//! Graph scheduling: from the sea of nodes to a control-flow graph of
//! ordered basic blocks.
//!
//! Control points anchor blocks; every other node floats and is placed in
//! the lowest common dominator of its uses (a phi use counts in the
//! predecessor block the value flows in from). Pool values are hoisted
//! into the entry block. Within a block, inputs come before users and the
//! effect chain dictates the order of memory operations.

use crate::graph::properties::{IfView, PhiView};
use crate::graph::{builders, Graph, Node, Opcode, SubGraph, UseKind};
use crate::result::{CodegenError, CodegenResult};
use gross_entity::packed_option::PackedOption;
use gross_entity::{entity_impl, EntityRef, PrimaryMap, SecondaryMap};
use log::debug;
use std::collections::HashMap;

/// An opaque reference to a basic block in a schedule.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Block(u32);
entity_impl!(Block, "block");

const NO_RPO: usize = usize::max_value();

#[derive(Clone, Default)]
struct BlockData {
    nodes: Vec<Node>,
    preds: Vec<Block>,
    succs: Vec<Block>,
    rpo_index: usize,
}

/// The schedule of one function: blocks, the node-to-block assignment, and
/// the reverse-postorder over the CFG.
pub struct GraphSchedule {
    subgraph: SubGraph,
    blocks: PrimaryMap<Block, BlockData>,
    node_block: SecondaryMap<Node, PackedOption<Block>>,
    rpo: Vec<Block>,
    offsets: HashMap<Block, Node>,
    entry: Block,
    /// Local frame size in bytes, carried from allocation lowering for the
    /// register allocator's spill area.
    pub frame_size: i32,
}

impl GraphSchedule {
    /// The function this schedule belongs to.
    pub fn subgraph(&self) -> SubGraph {
        self.subgraph
    }

    /// The entry block (the one holding `Start`).
    pub fn entry_block(&self) -> Block {
        self.entry
    }

    /// Number of blocks.
    pub fn block_size(&self) -> usize {
        self.blocks.len()
    }

    /// Blocks in reverse postorder.
    pub fn rpo_blocks(&self) -> &[Block] {
        &self.rpo
    }

    /// RPO index of `block`.
    pub fn rpo_index(&self, block: Block) -> usize {
        self.blocks[block].rpo_index
    }

    /// The node sequence of `block`.
    pub fn block_nodes(&self, block: Block) -> &[Node] {
        &self.blocks[block].nodes
    }

    /// Predecessors of `block`.
    pub fn preds(&self, block: Block) -> &[Block] {
        &self.blocks[block].preds
    }

    /// Successors of `block`.
    pub fn succs(&self, block: Block) -> &[Block] {
        &self.blocks[block].succs
    }

    /// The block `n` was assigned to, if any.
    pub fn map_block(&self, n: Node) -> Option<Block> {
        self.node_block[n].expand()
    }

    /// The `DLXOffset` symbol standing for `block`'s program-text position.
    pub fn block_offset(&self, block: Block) -> Node {
        self.offsets[&block]
    }

    /// All scheduled nodes, blocks in RPO, nodes in block order.
    pub fn rpo_nodes(&self) -> Vec<Node> {
        let mut out = Vec::new();
        for &b in &self.rpo {
            out.extend_from_slice(&self.blocks[b].nodes);
        }
        out
    }

    /// Position of `n` within its block.
    pub fn node_index(&self, n: Node) -> usize {
        let block = self.map_block(n).expect("node is not scheduled");
        self.blocks[block]
            .nodes
            .iter()
            .position(|&x| x == n)
            .expect("node missing from its block")
    }

    /// Append `n` at the end of `block`.
    pub fn add_node(&mut self, block: Block, n: Node) {
        self.blocks[block].nodes.push(n);
        self.node_block[n] = block.into();
    }

    /// Insert `n` immediately before `before` in `block`.
    pub fn add_node_before(&mut self, block: Block, before: Node, n: Node) {
        let pos = self.blocks[block]
            .nodes
            .iter()
            .position(|&x| x == before)
            .expect("anchor node missing from block");
        self.blocks[block].nodes.insert(pos, n);
        self.node_block[n] = block.into();
    }

    /// Insert `n` immediately after `after` in `block`.
    pub fn add_node_after(&mut self, block: Block, after: Node, n: Node) {
        let pos = self.blocks[block]
            .nodes
            .iter()
            .position(|&x| x == after)
            .expect("anchor node missing from block");
        self.blocks[block].nodes.insert(pos + 1, n);
        self.node_block[n] = block.into();
    }

    /// Insert `n` at the end of `block` but before its terminators.
    pub fn add_node_before_terminator(&mut self, graph: &Graph, block: Block, n: Node) {
        let pos = {
            let nodes = &self.blocks[block].nodes;
            let mut pos = nodes.len();
            while pos > 0 && is_terminator(graph, nodes[pos - 1]) {
                pos -= 1;
            }
            pos
        };
        self.blocks[block].nodes.insert(pos, n);
        self.node_block[n] = block.into();
    }

    /// Remove `n` from `block`, if present.
    pub fn remove_node(&mut self, block: Block, n: Node) -> bool {
        let nodes = &mut self.blocks[block].nodes;
        match nodes.iter().position(|&x| x == n) {
            Some(pos) => {
                nodes.remove(pos);
                self.node_block[n] = PackedOption::default();
                true
            }
            None => false,
        }
    }

    /// Replace `old` with `new` at the same position in `block`.
    pub fn replace_node(&mut self, block: Block, old: Node, new: Node) {
        let pos = self.blocks[block]
            .nodes
            .iter()
            .position(|&x| x == old)
            .expect("node missing from block");
        self.blocks[block].nodes[pos] = new;
        self.node_block[old] = PackedOption::default();
        self.node_block[new] = block.into();
    }

    /// Render the schedule for diagnostics and tests.
    pub fn display(&self, graph: &Graph) -> String {
        let mut out = String::new();
        for &b in &self.rpo {
            out.push_str(&format!(
                "{} (rpo {}): preds {:?} succs {:?}\n",
                b, self.blocks[b].rpo_index, self.blocks[b].preds, self.blocks[b].succs
            ));
            for &n in &self.blocks[b].nodes {
                out.push_str(&format!("  {}\n", graph.display_node(n)));
            }
        }
        out
    }
}

/// Whether `n` must stay at the end of its block.
fn is_terminator(graph: &Graph, n: Node) -> bool {
    match graph.opcode(n) {
        Opcode::If | Opcode::Return | Opcode::End => true,
        op => op.is_dlx_terminate(),
    }
}

/// Computes a `GraphSchedule` per function.
pub struct GraphScheduler;

impl GraphScheduler {
    /// Schedule one function subgraph.
    pub fn compute(graph: &mut Graph, subgraph: SubGraph) -> CodegenResult<GraphSchedule> {
        let start = graph
            .start_node(subgraph)
            .ok_or(CodegenError::MalformedFunction)?;
        let end = subgraph.end();
        let nodes = subgraph.nodes(graph);

        let mut schedule = GraphSchedule {
            subgraph,
            blocks: PrimaryMap::new(),
            node_block: SecondaryMap::new(),
            rpo: Vec::new(),
            offsets: HashMap::new(),
            entry: Block::from_u32(0),
            frame_size: 0,
        };

        // Step 1a: every block-head control point gets its own block. The
        // end node shares the entry block when nothing terminates into it
        // (an empty function is a single block holding Start and End).
        let end_is_trivial =
            graph.num_control_inputs(end) == 1 && graph.control_input(end, 0) == start;
        for &n in &nodes {
            let head = match graph.opcode(n) {
                Opcode::Start | Opcode::Merge | Opcode::Loop | Opcode::IfTrue | Opcode::IfFalse => {
                    true
                }
                Opcode::End => !end_is_trivial,
                _ => false,
            };
            if head {
                let b = schedule.blocks.push(BlockData::default());
                schedule.add_node(b, n);
            }
        }
        schedule.entry = schedule.map_block(start).expect("Start has a block");
        if end_is_trivial {
            let entry = schedule.entry;
            schedule.add_node(entry, end);
        }

        // Step 1b: branch points and returns join their predecessor's
        // block; phis sit with their pivot.
        for &n in &nodes {
            match graph.opcode(n) {
                Opcode::If | Opcode::Return => {
                    assert!(
                        graph.num_control_inputs(n) > 0,
                        "control point without a predecessor"
                    );
                    let pred = graph.control_input(n, 0);
                    let b = schedule.map_block(pred).expect("predecessor not placed");
                    schedule.add_node(b, n);
                }
                Opcode::Phi => {
                    let pivot = PhiView::new(graph, n).unwrap().ctrl_pivot();
                    let b = schedule.map_block(pivot).expect("phi pivot not placed");
                    schedule.add_node(b, n);
                }
                _ => {}
            }
        }

        // Step 1c: CFG edges along the control inputs of the fix nodes.
        for &n in &nodes {
            match graph.opcode(n) {
                Opcode::If => {
                    let from = schedule.map_block(n).unwrap();
                    let view = IfView::new(graph, n).unwrap();
                    let t = view.true_branch().expect("If without a true branch");
                    let f = view.false_branch().expect("If without a false branch");
                    let tb = schedule.map_block(t).unwrap();
                    let fb = schedule.map_block(f).unwrap();
                    add_edge(&mut schedule, from, tb);
                    add_edge(&mut schedule, from, fb);
                }
                Opcode::Merge | Opcode::Loop => {
                    // A branch-less arm merges straight from the If; its
                    // block is the If's own block.
                    let to = schedule.map_block(n).unwrap();
                    let preds: Vec<Node> = graph.control_inputs(n).to_vec();
                    for p in preds {
                        let from = schedule.map_block(p).expect("merge pred not placed");
                        add_edge(&mut schedule, from, to);
                    }
                }
                Opcode::End if !end_is_trivial => {
                    let to = schedule.map_block(n).unwrap();
                    let preds: Vec<Node> = graph.control_inputs(n).to_vec();
                    for p in preds {
                        if p == start {
                            continue;
                        }
                        let from = schedule.map_block(p).expect("terminator not placed");
                        add_edge(&mut schedule, from, to);
                    }
                }
                _ => {}
            }
        }

        // Step 2: reverse postorder and per-block offset symbols. Blocks
        // unreachable from the entry keep no RPO number.
        for data in schedule.blocks.values_mut() {
            data.rpo_index = NO_RPO;
        }
        schedule.rpo = compute_rpo(&schedule, schedule.entry);
        if schedule.rpo.is_empty() {
            return Err(CodegenError::NoEntryBlock);
        }
        for (idx, &b) in schedule.rpo.iter().enumerate() {
            schedule.blocks[b].rpo_index = idx;
        }
        for &b in &schedule.rpo.clone() {
            let offset = builders::dlx_offset().build(graph);
            schedule.offsets.insert(b, offset);
        }

        // Step 3: float the remaining nodes into the lowest common
        // dominator of their uses.
        let idom = compute_idom(&schedule);
        place_floating_nodes(graph, &mut schedule, &nodes, &idom);

        // Step 4: order every block so inputs precede users.
        for &b in &schedule.rpo.clone() {
            order_block(graph, &mut schedule, b);
        }

        debug!("scheduled {} blocks", schedule.block_size());
        Ok(schedule)
    }
}

fn add_edge(schedule: &mut GraphSchedule, from: Block, to: Block) {
    if !schedule.blocks[from].succs.contains(&to) {
        schedule.blocks[from].succs.push(to);
    }
    if !schedule.blocks[to].preds.contains(&from) {
        schedule.blocks[to].preds.push(from);
    }
}

/// Reverse postorder over the successor edges from `entry`. Successors are
/// visited last-to-first so that the first successor (the taken branch)
/// ends up immediately after its predecessor in the final order.
fn compute_rpo(schedule: &GraphSchedule, entry: Block) -> Vec<Block> {
    let mut post = Vec::new();
    let mut visited = vec![false; schedule.blocks.len()];
    let mut stack: Vec<(Block, usize)> = vec![(entry, 0)];
    visited[entry.index()] = true;
    loop {
        let (b, child) = match stack.last_mut() {
            Some(top) => {
                let pair = *top;
                top.1 += 1;
                pair
            }
            None => break,
        };
        let succs = &schedule.blocks[b].succs;
        if child < succs.len() {
            let next = succs[succs.len() - 1 - child];
            if !visited[next.index()] {
                visited[next.index()] = true;
                stack.push((next, 0));
            }
        } else {
            post.push(b);
            stack.pop();
        }
    }
    post.reverse();
    post
}

/// Immediate dominators over the RPO, the standard iterative fixed point.
/// Indexed by RPO number; the entry dominates itself.
fn compute_idom(schedule: &GraphSchedule) -> Vec<usize> {
    let rpo = &schedule.rpo;
    let n = rpo.len();
    let mut idom = vec![NO_RPO; n];
    idom[0] = 0;
    let mut changed = true;
    while changed {
        changed = false;
        for i in 1..n {
            let b = rpo[i];
            let mut new_idom = NO_RPO;
            for &p in &schedule.blocks[b].preds {
                let pi = schedule.blocks[p].rpo_index;
                if pi == NO_RPO || (idom[pi] == NO_RPO && pi != 0) {
                    continue;
                }
                new_idom = if new_idom == NO_RPO {
                    pi
                } else {
                    intersect(&idom, new_idom, pi)
                };
            }
            if new_idom != NO_RPO && idom[i] != new_idom {
                idom[i] = new_idom;
                changed = true;
            }
        }
    }
    idom
}

fn intersect(idom: &[usize], mut a: usize, mut b: usize) -> usize {
    while a != b {
        while a > b {
            a = idom[a];
        }
        while b > a {
            b = idom[b];
        }
    }
    a
}

/// Lowest common dominator of two RPO indices.
fn common_dominator(idom: &[usize], a: usize, b: usize) -> usize {
    intersect(idom, a, b)
}

fn place_floating_nodes(
    graph: &Graph,
    schedule: &mut GraphSchedule,
    nodes: &[Node],
    idom: &[usize],
) {
    let entry = schedule.entry;
    let mut pending: Vec<Node> = Vec::new();
    for &n in nodes {
        if schedule.map_block(n).is_some() {
            continue;
        }
        let op = graph.opcode(n);
        if op == Opcode::ConstantInt || op == Opcode::Argument || graph.is_global_var(n) {
            // Materializable pool values, arguments and globals hoist into
            // the entry block.
            let head = schedule.blocks[entry].nodes[0];
            schedule.add_node_after(entry, head, n);
            continue;
        }
        if op.is_global_value() {
            // Strings, stubs and the dead sentinel are metadata; they are
            // operands, never instructions.
            continue;
        }
        // A node carrying a control input is anchored to its statement's
        // control point; letting it drift to its uses could hoist a store
        // or call out of its branch.
        if graph.num_control_inputs(n) > 0 {
            if let Some(b) = schedule.map_block(graph.control_input(n, 0)) {
                schedule.add_node(b, n);
                continue;
            }
        }
        pending.push(n);
    }

    // Users first: place a node once all its placeable users are placed.
    // Cycles only pass through phis, which are already fixed.
    while !pending.is_empty() {
        let mut progressed = false;
        let mut still_pending = Vec::new();
        'next: for &n in &pending {
            let mut use_rpo: Option<usize> = None;
            for &u in graph.users(n) {
                let block = if graph.opcode(u) == Opcode::Phi {
                    // The value is consumed at the end of the predecessor
                    // it flows in from, not at the phi itself.
                    let view = PhiView::new(graph, u).unwrap();
                    let kind = if graph.value_inputs(u).contains(&n) {
                        UseKind::Value
                    } else {
                        UseKind::Effect
                    };
                    match view.map_ctrl_node(n, kind) {
                        Some(ctrl) => schedule.map_block(ctrl),
                        None => schedule.map_block(u),
                    }
                } else {
                    match schedule.map_block(u) {
                        Some(b) => Some(b),
                        None => {
                            // A user is still floating: try again later.
                            still_pending.push(n);
                            continue 'next;
                        }
                    }
                };
                if let Some(b) = block {
                    let r = schedule.blocks[b].rpo_index;
                    if r != NO_RPO {
                        use_rpo = Some(match use_rpo {
                            Some(cur) => common_dominator(idom, cur, r),
                            None => r,
                        });
                    }
                }
            }
            let target = match use_rpo {
                Some(r) => schedule.rpo[r],
                None => {
                    // No placed user: fall back to the nearest control
                    // point, or the entry block.
                    if graph.num_control_inputs(n) > 0 {
                        schedule
                            .map_block(graph.control_input(n, 0))
                            .unwrap_or(entry)
                    } else {
                        entry
                    }
                }
            };
            schedule.add_node(target, n);
            progressed = true;
        }
        if !progressed {
            // Mutually-floating leftovers: pin them to their control point
            // or the entry block.
            for &n in &still_pending {
                if schedule.map_block(n).is_some() {
                    continue;
                }
                let target = if graph.num_control_inputs(n) > 0 {
                    schedule
                        .map_block(graph.control_input(n, 0))
                        .unwrap_or(entry)
                } else {
                    entry
                };
                schedule.add_node(target, n);
            }
            break;
        }
        pending = still_pending;
    }
}

/// Stable topological order within one block: a node comes after its
/// value/effect inputs that live in the same block; the block head stays
/// first and `If`/`Return` terminators sink to the end. Ties keep the
/// placement order.
fn order_block(graph: &Graph, schedule: &mut GraphSchedule, block: Block) {
    let original = schedule.blocks[block].nodes.clone();
    let in_block = |n: Node| schedule.map_block(n) == Some(block);

    let mut remaining: Vec<Node> = original.clone();
    let mut ordered: Vec<Node> = Vec::with_capacity(remaining.len());

    while !remaining.is_empty() {
        let mut picked = None;
        for (pos, &n) in remaining.iter().enumerate() {
            let op = graph.opcode(n);
            // Terminators wait until everything else is out.
            if (op == Opcode::If || op == Opcode::Return || op == Opcode::End)
                && remaining.len() > 1
                && remaining
                    .iter()
                    .any(|&m| m != n && graph.opcode(m) != Opcode::If
                        && graph.opcode(m) != Opcode::Return
                        && graph.opcode(m) != Opcode::End)
            {
                continue;
            }
            let deps_ready = graph
                .value_inputs(n)
                .iter()
                .chain(graph.effect_inputs(n).iter())
                .all(|&i| i == n || !in_block(i) || ordered.contains(&i));
            if deps_ready {
                picked = Some(pos);
                break;
            }
        }
        match picked {
            Some(pos) => {
                let n = remaining.remove(pos);
                ordered.push(n);
            }
            None => {
                // A dependency cycle within the block (through a phi's
                // backedge): emit in placement order.
                ordered.extend(remaining.drain(..));
            }
        }
    }

    // Keep the control head at the front regardless of dependencies.
    if let Some(&head) = original.first() {
        if graph.opcode(head).is_ctrl_point() {
            if let Some(pos) = ordered.iter().position(|&x| x == head) {
                if pos != 0 {
                    ordered.remove(pos);
                    ordered.insert(0, head);
                }
            }
        }
    }

    schedule.blocks[block].nodes = ordered;
}
