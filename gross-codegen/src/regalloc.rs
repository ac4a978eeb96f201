//! Linear-scan register allocation over the scheduled function.
//!
//! Values walk in RPO; each definition with value users grabs any free
//! general register (callee-saved preferred by pool order) or a stack slot
//! when none is left. A phi and its inputs share one location: inputs are
//! first legalized into `AddI #0` moves at the tails of the predecessor
//! blocks, and the first input's assignment pre-books the phi's. Spill code
//! stores a definition right after it and reloads through the scratch
//! registers in front of each use, one per spilled operand; DLX arithmetic
//! finally commits to explicit three-address form with register-node
//! operands.

use crate::graph::{builders, Graph, Node, Opcode, UseKind};
use crate::schedule::{Block, GraphSchedule};
use crate::targets::TargetTraits;
use log::debug;
use std::collections::HashMap;

/// Where a value lives after allocation.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Location {
    /// A machine register number.
    Register(usize),
    /// An index into the function's spill area.
    StackSlot(usize),
}

/// The linear-scan allocator for one function.
pub struct LinearScanAllocator {
    target: TargetTraits,
    reg_nodes: Vec<Node>,
    // None when available, otherwise the node currently occupying it.
    reg_usages: Vec<Option<Node>>,
    spill_slots: Vec<Option<Node>>,
    assignment: HashMap<Node, Location>,
    ordered_users: HashMap<Node, Vec<Node>>,
    caller_saved: HashMap<Node, u32>,
    placeholder: Option<Node>,
}

impl LinearScanAllocator {
    /// Create an allocator for the given register-file profile.
    pub fn new(target: TargetTraits) -> Self {
        Self {
            target,
            reg_nodes: Vec::new(),
            reg_usages: vec![None; target.register_count],
            spill_slots: Vec::new(),
            assignment: HashMap::new(),
            ordered_users: HashMap::new(),
            caller_saved: HashMap::new(),
            placeholder: None,
        }
    }

    /// The location assigned to `n`, if it needed one.
    pub fn location(&self, n: Node) -> Option<Location> {
        self.assignment.get(&n).cloned()
    }

    /// The caller-saved snapshot recorded at a `VirtDLXCallsiteBegin`, as a
    /// register bitset.
    pub fn caller_saved_at(&self, callsite: Node) -> Option<u32> {
        self.caller_saved.get(&callsite).cloned()
    }

    /// Number of spill slots the function ended up needing.
    pub fn num_spill_slots(&self) -> usize {
        self.spill_slots.len()
    }

    /// Run allocation over `schedule`.
    pub fn allocate(&mut self, graph: &mut Graph, schedule: &mut GraphSchedule) {
        // Register nodes are per-allocation singletons.
        self.reg_nodes = (0..self.target.register_count)
            .map(|i| builders::dlx_register(i).build(graph))
            .collect();
        let placeholder = builders::const_int(0).build(graph);
        self.placeholder = Some(placeholder);
        for reg in 0..self.target.register_count {
            if self.target.is_reserved(reg) {
                self.reg_usages[reg] = Some(placeholder);
            }
        }

        // Phi inputs must live in assignable, non-constant nodes.
        let phis: Vec<Node> = schedule
            .rpo_nodes()
            .into_iter()
            .filter(|&n| {
                graph.opcode(n) == Opcode::Phi
                    && graph.num_value_inputs(n) > 0
                    && graph.num_effect_inputs(n) == 0
            })
            .collect();
        for phi in &phis {
            self.legalize_phi_inputs(graph, schedule, *phi);
        }

        // Main scan.
        for n in schedule.rpo_nodes() {
            self.recycle(graph, schedule, n);

            let op = graph.opcode(n);
            if op == Opcode::VirtDLXCallsiteBegin {
                // Record what a call at this point would clobber.
                let mut active: u32 = 0;
                active |= 1 << self.target.sp_reg;
                active |= 1 << self.target.lr_reg;
                for reg in self.target.first_caller_saved..=self.target.last_caller_saved {
                    if self.reg_usages[reg].is_some() {
                        active |= 1 << reg;
                    }
                }
                for reg in self.target.first_parameter..=self.target.last_parameter {
                    if self.reg_usages[reg].is_some() {
                        active |= 1 << reg;
                    }
                }
                self.caller_saved.insert(n, active);
                continue;
            }

            if op.is_constant_value() || op.is_dlx_register() || op == Opcode::DLXOffset {
                continue;
            }
            if op.is_global_value() {
                continue;
            }
            if !graph.has_value_users(n) {
                continue;
            }

            if op == Opcode::Phi {
                // Both phi inputs booked the location already; occupy it
                // for the phi's own live range.
                if let Some(&loc) = self.assignment.get(&n) {
                    match loc {
                        Location::Register(r) => self.reg_usages[r] = Some(n),
                        Location::StackSlot(s) => self.spill_slots[s] = Some(n),
                    }
                }
            }
            if !self.assignment.contains_key(&n) {
                if !self.assign_register(graph, n) {
                    self.spill(graph, n);
                }
            }
        }

        self.insert_spill_codes(graph, schedule);
        self.commit_register_nodes(graph, schedule);
    }

    /// 'Move' each phi input into a fresh value at the tail of its
    /// predecessor block and rewire the phi to the moves.
    fn legalize_phi_inputs(&mut self, graph: &mut Graph, schedule: &mut GraphSchedule, phi: Node) {
        assert_eq!(
            graph.num_value_inputs(phi),
            2,
            "phi with other than two inputs"
        );
        let phi_block = schedule.map_block(phi).expect("phi not scheduled");
        let preds: Vec<Block> = schedule.preds(phi_block).to_vec();
        assert_eq!(preds.len(), 2, "phi block without two predecessors");
        let zero = builders::const_int(0).build(graph);

        for i in 0..2 {
            let val = graph.value_input(phi, i);
            // A constant materializes through the zero register, anything
            // else moves register-to-register.
            let mov = if graph.opcode(val) == Opcode::ConstantInt {
                let r0 = builders::dlx_register(0).build(graph);
                builders::dlx_bin(Opcode::DLXAddI)
                    .immediate()
                    .lhs(r0)
                    .rhs(val)
                    .build(graph)
            } else {
                builders::dlx_bin(Opcode::DLXAddI)
                    .immediate()
                    .lhs(val)
                    .rhs(zero)
                    .build(graph)
            };
            graph.set_value_input(phi, i, mov);
            schedule.add_node_before_terminator(graph, preds[i], mov);
        }
    }

    /// Value users of `n` in schedule order, with live ranges extended
    /// through phi users to cover the whole phi.
    fn ordered_users(&mut self, graph: &Graph, schedule: &GraphSchedule, n: Node) -> &[Node] {
        if !self.ordered_users.contains_key(&n) {
            let mut queue: Vec<Node> = graph.value_users(n).collect();
            let mut seen: Vec<Node> = Vec::new();
            let mut users: Vec<Node> = Vec::new();
            while let Some(top) = queue.pop() {
                if seen.contains(&top) {
                    continue;
                }
                seen.push(top);
                if schedule.map_block(top).is_some() {
                    users.push(top);
                }
                if graph.opcode(top) == Opcode::Phi {
                    queue.extend(graph.value_users(top));
                }
            }
            users.sort_by_key(|&u| {
                let bb = schedule.map_block(u).unwrap();
                (schedule.rpo_index(bb), schedule.node_index(u))
            });
            self.ordered_users.insert(n, users);
        }
        &self.ordered_users[&n]
    }

    fn live_range_end(&mut self, graph: &Graph, schedule: &GraphSchedule, n: Node) -> Option<Node> {
        self.ordered_users(graph, schedule, n).last().cloned()
    }

    /// Free every register and slot whose occupant's live range ends at
    /// `n`.
    fn recycle(&mut self, graph: &Graph, schedule: &GraphSchedule, n: Node) {
        let placeholder = self.placeholder;
        for i in 0..self.reg_usages.len() {
            let occupant = match self.reg_usages[i] {
                Some(o) => o,
                None => continue,
            };
            if Some(occupant) == placeholder {
                continue;
            }
            if self.live_range_end(graph, schedule, occupant) == Some(n) {
                self.reg_usages[i] = None;
            }
        }
        for i in 0..self.spill_slots.len() {
            let occupant = match self.spill_slots[i] {
                Some(o) => o,
                None => continue,
            };
            if self.live_range_end(graph, schedule, occupant) == Some(n) {
                self.spill_slots[i] = None;
            }
        }
    }

    fn phi_user(&self, graph: &Graph, n: Node) -> Option<Node> {
        graph.value_users(n).find(|&u| graph.opcode(u) == Opcode::Phi)
    }

    fn assign_register(&mut self, graph: &Graph, n: Node) -> bool {
        let phi_user = self.phi_user(graph, n);
        if let Some(phi) = phi_user {
            if let Some(&loc) = self.assignment.get(&phi) {
                match loc {
                    Location::Register(r) => {
                        self.reg_usages[r] = Some(n);
                        self.assignment.insert(n, loc);
                        return true;
                    }
                    // The phi lives on the stack; so must the input.
                    Location::StackSlot(_) => return false,
                }
            }
        }

        let free = self
            .target
            .general_regs()
            .find(|&r| self.reg_usages[r].is_none());
        if let Some(reg) = free {
            self.reg_usages[reg] = Some(n);
            self.assignment.insert(n, Location::Register(reg));
            debug!("assign R{} to {}", reg, graph.display_node(n));
            if let Some(phi) = phi_user {
                self.assignment
                    .entry(phi)
                    .or_insert(Location::Register(reg));
            }
            return true;
        }
        false
    }

    fn spill(&mut self, graph: &Graph, n: Node) {
        let phi_user = self.phi_user(graph, n);
        if let Some(phi) = phi_user {
            if let Some(&Location::StackSlot(slot)) = self.assignment.get(&phi) {
                self.spill_slots[slot] = Some(n);
                self.assignment.insert(n, Location::StackSlot(slot));
                return;
            }
        }

        let slot = match self.spill_slots.iter().position(|s| s.is_none()) {
            Some(idx) => idx,
            None => {
                self.spill_slots.push(None);
                self.spill_slots.len() - 1
            }
        };
        self.spill_slots[slot] = Some(n);
        self.assignment.insert(n, Location::StackSlot(slot));
        debug!("spill {} to slot {}", graph.display_node(n), slot);
        if let Some(phi) = phi_user {
            self.assignment
                .entry(phi)
                .or_insert(Location::StackSlot(slot));
        }
    }

    /// Reserve the spill area at entry and bracket every spilled value
    /// with a store after its definition and a scratch-register reload in
    /// front of each use.
    fn insert_spill_codes(&mut self, graph: &mut Graph, schedule: &mut GraphSchedule) {
        if self.spill_slots.is_empty() {
            return;
        }

        // One stack-slot reservation at function entry.
        let bytes = (self.spill_slots.len() * 4) as i32;
        let sp = self.reg_nodes[self.target.sp_reg];
        let amount = builders::const_int(bytes).build(graph);
        let reservation = builders::dlx_bin(Opcode::DLXSubI)
            .immediate()
            .lhs(sp)
            .rhs(amount)
            .build(graph);
        let entry = schedule.entry_block();
        let anchor = schedule
            .block_nodes(entry)
            .iter()
            .cloned()
            .find(|&n| match graph.opcode(n) {
                Opcode::Start | Opcode::Alloca | Opcode::Argument => false,
                op if op.is_constant_value() || op.is_dlx_register() => false,
                _ => true,
            });
        match anchor {
            Some(before) => schedule.add_node_before(entry, before, reservation),
            None => schedule.add_node(entry, reservation),
        }
        // The reservation writes the stack pointer itself.
        self.assignment
            .insert(reservation, Location::Register(self.target.sp_reg));

        let fp = self.reg_nodes[self.target.fp_reg];
        let frame_size = schedule.frame_size;
        let mut scratch_loads: Vec<(Node, usize)> = Vec::new();
        let mut scratch_defs = Vec::new();
        // Reloads are routed per operand: an instruction with two spilled
        // operands must not see both through the same scratch register.
        let mut reloads_per_user: HashMap<Node, usize> = HashMap::new();

        let spilled: Vec<(Node, usize)> = self
            .assignment
            .iter()
            .filter_map(|(&n, &loc)| match loc {
                Location::StackSlot(idx) => Some((n, idx)),
                Location::Register(_) => None,
            })
            .collect();
        for (def, slot) in spilled {
            let def_bb = match schedule.map_block(def) {
                Some(b) => b,
                None => continue,
            };
            let offset = builders::const_int(frame_size + (slot as i32) * 4).build(graph);

            // Collect users before the store becomes one of them.
            let users: Vec<Node> = graph.value_users(def).collect();

            if graph.opcode(def) != Opcode::Phi {
                let store = builders::dlx_mem(Opcode::DLXStW)
                    .base_addr(fp)
                    .offset(offset)
                    .src(def)
                    .build(graph);
                schedule.add_node_after(def_bb, def, store);
                // The value is computed into scratch, then parked.
                scratch_defs.push(def);
            }

            for user in users {
                if graph.opcode(user) == Opcode::Phi {
                    continue;
                }
                // A user referencing the value twice was rewritten whole by
                // the first reload.
                if !graph.value_inputs(user).contains(&def) {
                    continue;
                }
                let bb = match schedule.map_block(user) {
                    Some(b) => b,
                    None => continue,
                };
                let load = builders::dlx_mem(Opcode::DLXLdW)
                    .base_addr(fp)
                    .offset(offset)
                    .build(graph);
                schedule.add_node_before(bb, user, load);
                graph.replace_use_of_with(user, def, load, UseKind::Value);
                let count = reloads_per_user.entry(user).or_insert(0);
                assert!(
                    *count < 2,
                    "more than two spilled operands at one instruction"
                );
                let reg = if *count == 0 {
                    self.target.last_scratch
                } else {
                    self.target.first_scratch
                };
                *count += 1;
                scratch_loads.push((load, reg));
            }
        }

        for def in scratch_defs {
            self.assignment
                .insert(def, Location::Register(self.target.first_scratch));
        }
        for (load, reg) in scratch_loads {
            self.assignment.insert(load, Location::Register(reg));
        }
    }

    /// Make DLX arithmetic explicit three-address form: prepend the
    /// destination register and replace register-allocated inputs with
    /// their register nodes.
    fn commit_register_nodes(&mut self, graph: &mut Graph, schedule: &GraphSchedule) {
        for n in schedule.rpo_nodes() {
            if !graph.opcode(n).is_dlx_arith() {
                continue;
            }
            assert_eq!(graph.num_value_inputs(n), 2);

            let dest = match self.assignment.get(&n) {
                Some(&Location::Register(r)) => self.reg_nodes[r],
                Some(&Location::StackSlot(_)) => panic!("spilled value still not in register"),
                // A pure-effect instruction (e.g. the stack reservation)
                // writes no allocatable result.
                None => self.reg_nodes[0],
            };

            let mut operands = [dest, Node::from_u32(0), Node::from_u32(0)];
            for i in 0..2 {
                let input = graph.value_input(n, i);
                let op = graph.opcode(input);
                operands[i + 1] = if op == Opcode::ConstantInt || op.is_dlx_register() {
                    input
                } else {
                    match self.assignment.get(&input) {
                        Some(&Location::Register(r)) => self.reg_nodes[r],
                        _ => panic!("operand {} has no register", graph.display_node(input)),
                    }
                };
            }

            graph.set_value_input(n, 0, operands[0]);
            graph.set_value_input(n, 1, operands[1]);
            graph.append_value_input(n, operands[2]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::SubGraph;
    use crate::postlower::PostMachineLowering;
    use crate::schedule::GraphScheduler;
    use crate::targets::{COMPACT_DLX, DLX};

    // let a; let b; let c; return a + b + c, all arithmetic so every value
    // is simultaneously live at the final add.
    fn build_three_live(g: &mut Graph) -> (Node, SubGraph) {
        let p = builders::argument("p").build(g);
        let start = builders::function("f").param(p).build(g);
        let c1 = builders::const_int(1).build(g);
        let a = builders::bin_op(Opcode::BinAdd).lhs(p).rhs(p).build(g);
        let b = builders::bin_op(Opcode::BinAdd).lhs(p).rhs(c1).build(g);
        let c = builders::bin_op(Opcode::BinSub).lhs(p).rhs(c1).build(g);
        let ab = builders::bin_op(Opcode::BinAdd).lhs(a).rhs(b).build(g);
        let abc = builders::bin_op(Opcode::BinAdd).lhs(ab).rhs(c).build(g);
        let ret = builders::return_stmt().value(abc).build(g);
        g.append_control_input(ret, start);
        let end = builders::end(start).terminator(ret).build(g);
        let sg = SubGraph::new(end);
        g.add_subgraph(sg);
        (ret, sg)
    }

    fn lower_and_allocate(
        g: &mut Graph,
        sg: SubGraph,
        target: TargetTraits,
    ) -> (crate::schedule::GraphSchedule, LinearScanAllocator) {
        crate::graph::reducer::run_reducer_on(
            g,
            sg,
            &mut crate::isel::PreMachineLowering::new(),
        );
        let mut schedule = GraphScheduler::compute(g, sg).unwrap();
        PostMachineLowering::new().run(g, &mut schedule);
        let mut ra = LinearScanAllocator::new(target);
        ra.allocate(g, &mut schedule);
        (schedule, ra)
    }

    #[test]
    fn three_address_commit() {
        let mut g = Graph::new();
        let (ret, sg) = build_three_live(&mut g);
        let (schedule, ra) = lower_and_allocate(&mut g, sg, DLX);

        assert_eq!(ra.num_spill_slots(), 0);
        for n in schedule.rpo_nodes() {
            if g.opcode(n).is_dlx_arith() {
                assert_eq!(g.num_value_inputs(n), 3);
                let mut constants = 0;
                for &input in g.value_inputs(n) {
                    let op = g.opcode(input);
                    assert!(
                        op.is_dlx_register() || op == Opcode::ConstantInt,
                        "uncommitted operand"
                    );
                    if op == Opcode::ConstantInt {
                        constants += 1;
                    }
                }
                assert!(constants <= 1);
                // Destination is always a register.
                assert!(g.opcode(g.value_input(n, 0)).is_dlx_register());
            }
        }
        // The return still reads the final sum.
        let result = g.value_input(ret, 0);
        assert!(g.opcode(result).is_dlx_arith());
    }

    #[test]
    fn compact_profile_spills() {
        let mut g = Graph::new();
        let (_ret, sg) = build_three_live(&mut g);
        let (schedule, ra) = lower_and_allocate(&mut g, sg, COMPACT_DLX);

        // Two general registers cannot hold three live values.
        assert!(ra.num_spill_slots() >= 1);

        let nodes = schedule.rpo_nodes();
        let stores = nodes
            .iter()
            .filter(|&&n| g.opcode(n) == Opcode::DLXStW)
            .count();
        let loads = nodes
            .iter()
            .filter(|&&n| g.opcode(n) == Opcode::DLXLdW)
            .count();
        assert!(stores >= 1, "expected at least one spill store");
        assert!(loads >= 1, "expected at least one spill reload");

        // Exactly one stack-area reservation at entry.
        let entry = schedule.entry_block();
        let reservations = schedule
            .block_nodes(entry)
            .iter()
            .filter(|&&n| g.opcode(n) == Opcode::DLXSubI)
            .count();
        assert_eq!(reservations, 1);
    }

    #[test]
    fn two_spilled_operands_reload_into_distinct_registers() {
        let mut g = Graph::new();
        let p = builders::argument("p").build(&mut g);
        let start = builders::function("f").param(p).build(&mut g);
        let c1 = builders::const_int(1).build(&mut g);
        let c2 = builders::const_int(2).build(&mut g);
        // `a` and `p` stay live to the end, pinning both general
        // registers, so `d1` and `d2` spill and both feed one add.
        let a = builders::bin_op(Opcode::BinAdd).lhs(p).rhs(p).build(&mut g);
        let d1 = builders::bin_op(Opcode::BinAdd).lhs(p).rhs(c1).build(&mut g);
        let d2 = builders::bin_op(Opcode::BinAdd).lhs(p).rhs(c2).build(&mut g);
        let x = builders::bin_op(Opcode::BinAdd).lhs(d1).rhs(d2).build(&mut g);
        let y = builders::bin_op(Opcode::BinAdd).lhs(x).rhs(a).build(&mut g);
        let z = builders::bin_op(Opcode::BinAdd).lhs(y).rhs(p).build(&mut g);
        let ret = builders::return_stmt().value(z).build(&mut g);
        g.append_control_input(ret, start);
        let end = builders::end(start).terminator(ret).build(&mut g);
        let sg = SubGraph::new(end);
        g.add_subgraph(sg);

        let (schedule, ra) = lower_and_allocate(&mut g, sg, COMPACT_DLX);

        assert!(ra.num_spill_slots() >= 2);

        // Both of x's operands come back through reloads; summing them
        // out of one shared register would compute d2 + d2.
        assert_eq!(g.num_value_inputs(x), 3);
        let lhs_reg = g
            .opcode(g.value_input(x, 1))
            .dlx_register_number()
            .expect("reload operand not committed to a register");
        let rhs_reg = g
            .opcode(g.value_input(x, 2))
            .dlx_register_number()
            .expect("reload operand not committed to a register");
        assert!(lhs_reg >= COMPACT_DLX.first_scratch && lhs_reg <= COMPACT_DLX.last_scratch);
        assert!(rhs_reg >= COMPACT_DLX.first_scratch && rhs_reg <= COMPACT_DLX.last_scratch);
        assert_ne!(lhs_reg, rhs_reg);

        // Each reload reads its own slot: the two loads in front of x use
        // different frame offsets.
        let x_block = schedule.map_block(x).unwrap();
        let x_pos = schedule.node_index(x);
        let nodes = schedule.block_nodes(x_block);
        let reload_offsets: Vec<i32> = nodes[..x_pos]
            .iter()
            .rev()
            .take_while(|&&n| g.opcode(n) == Opcode::DLXLdW)
            .map(|&n| g.int_value(g.value_input(n, 1)).unwrap())
            .collect();
        assert_eq!(reload_offsets.len(), 2);
        assert_ne!(reload_offsets[0], reload_offsets[1]);
    }
}
