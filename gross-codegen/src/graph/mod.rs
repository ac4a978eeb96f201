//! The sea-of-nodes graph.
//!
//! A `Graph` is the sole owner of its nodes. Nodes reference each other
//! through typed `u32` entity references into the graph's arena, so the
//! input/user cycles of a sea-of-nodes IR need no shared ownership: edges
//! are plain indices and a node is never freed before the graph drops.
//!
//! All edge mutation goes through the primitives on `Graph`. They maintain
//! the mirror invariant: for every edge `u -> v` of any kind, `v` appears in
//! `u`'s input vector and `u` appears once per occupied slot in `v`'s user
//! list. Breaking this invariant is a programmer error and asserts.

pub mod attributes;
pub mod builders;
pub mod marker;
pub mod node;
pub mod opcodes;
pub mod properties;
pub mod reducer;

pub use self::attributes::{Attr, AttributeBuilder};
pub use self::marker::NodeMarker;
pub use self::node::{Node, UseKind};
pub use self::opcodes::Opcode;

use self::node::NodeData;
use gross_entity::packed_option::PackedOption;
use gross_entity::{EntitySet, PrimaryMap};
use std::collections::{HashMap, VecDeque};

/// A lightweight handle for one function's portion of the graph.
///
/// Only the function's `End` node is stored; the node set is recomputed on
/// demand by a reverse breadth-first walk over inputs. Two subgraphs are the
/// same function iff their `End` nodes are identical.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct SubGraph {
    end: Node,
}

impl SubGraph {
    /// Create a handle from the function's `End` node.
    pub fn new(end: Node) -> Self {
        Self { end }
    }

    /// The function's `End` node.
    pub fn end(self) -> Node {
        self.end
    }

    /// All nodes reachable from `End` by reverse traversal, in BFS
    /// discovery order. Unreached nodes are garbage and not part of the
    /// function.
    pub fn nodes(self, graph: &Graph) -> Vec<Node> {
        let mut visited = EntitySet::new();
        let mut queue = VecDeque::new();
        let mut order = Vec::new();
        visited.insert(self.end);
        queue.push_back(self.end);
        while let Some(n) = queue.pop_front() {
            order.push(n);
            for &input in graph.inputs(n) {
                if visited.insert(input) {
                    queue.push_back(input);
                }
            }
        }
        order
    }

    /// Number of nodes in this function.
    pub fn node_size(self, graph: &Graph) -> usize {
        self.nodes(graph).len()
    }
}

/// Owner of nodes, interning pools and per-function subgraph handles.
pub struct Graph {
    nodes: PrimaryMap<Node, NodeData>,

    // Constant pools. One node per distinct value; builders consult the
    // value->node direction, property views the node->value direction.
    int_pool: HashMap<i32, Node>,
    int_values: HashMap<Node, i32>,
    str_pool: HashMap<String, Node>,
    str_values: HashMap<Node, String>,

    // Function stubs are singletons per subgraph so call-sites never alias
    // the callee body.
    stub_pool: HashMap<SubGraph, Node>,
    stub_funcs: HashMap<Node, SubGraph>,

    dead: PackedOption<Node>,
    global_vars: Vec<Node>,
    subgraphs: Vec<SubGraph>,
    attributes: HashMap<Node, Vec<Attr>>,

    // High-water mark of marker windows handed out so far.
    pub(crate) marker_max: u32,
}

/// Create an empty graph. The factory the parser is given.
pub fn graph() -> Graph {
    Graph::new()
}

impl Graph {
    /// Create a new empty graph.
    pub fn new() -> Self {
        Self {
            nodes: PrimaryMap::new(),
            int_pool: HashMap::new(),
            int_values: HashMap::new(),
            str_pool: HashMap::new(),
            str_values: HashMap::new(),
            stub_pool: HashMap::new(),
            stub_funcs: HashMap::new(),
            dead: PackedOption::default(),
            global_vars: Vec::new(),
            subgraphs: Vec::new(),
            attributes: HashMap::new(),
            marker_max: 0,
        }
    }

    /// Total number of nodes ever created, including garbage.
    pub fn node_size(&self) -> usize {
        self.nodes.len()
    }

    pub(crate) fn make_node(&mut self, op: Opcode) -> Node {
        self.nodes.push(NodeData::new(op))
    }

    /// The opcode of `n`.
    pub fn opcode(&self, n: Node) -> Opcode {
        self.nodes[n].op
    }

    /// Whether `n` is the dead sentinel.
    pub fn is_dead(&self, n: Node) -> bool {
        self.nodes[n].op == Opcode::Dead
    }

    /// The dead sentinel node, created on first use.
    pub fn dead_node(&mut self) -> Node {
        if let Some(dead) = self.dead.expand() {
            dead
        } else {
            let dead = self.make_node(Opcode::Dead);
            self.dead = dead.into();
            dead
        }
    }

    // ------------------------------------------------------------------
    // Input accessors.

    /// Number of value inputs of `n`.
    pub fn num_value_inputs(&self, n: Node) -> usize {
        self.nodes[n].num_value_inputs
    }

    /// Number of control inputs of `n`.
    pub fn num_control_inputs(&self, n: Node) -> usize {
        self.nodes[n].num_control_inputs
    }

    /// Number of effect inputs of `n`.
    pub fn num_effect_inputs(&self, n: Node) -> usize {
        self.nodes[n].num_effect_inputs
    }

    fn section(&self, n: Node, kind: UseKind) -> &[Node] {
        let data = &self.nodes[n];
        let off = data.section_offset(kind);
        &data.inputs[off..off + data.section_len(kind)]
    }

    /// The value-input slice of `n`.
    pub fn value_inputs(&self, n: Node) -> &[Node] {
        self.section(n, UseKind::Value)
    }

    /// The control-input slice of `n`.
    pub fn control_inputs(&self, n: Node) -> &[Node] {
        self.section(n, UseKind::Control)
    }

    /// The effect-input slice of `n`.
    pub fn effect_inputs(&self, n: Node) -> &[Node] {
        self.section(n, UseKind::Effect)
    }

    /// All inputs of `n`, value section first.
    pub fn inputs(&self, n: Node) -> &[Node] {
        &self.nodes[n].inputs
    }

    /// The `idx`-th value input.
    pub fn value_input(&self, n: Node, idx: usize) -> Node {
        self.value_inputs(n)[idx]
    }

    /// The `idx`-th control input.
    pub fn control_input(&self, n: Node, idx: usize) -> Node {
        self.control_inputs(n)[idx]
    }

    /// The `idx`-th effect input.
    pub fn effect_input(&self, n: Node, idx: usize) -> Node {
        self.effect_inputs(n)[idx]
    }

    // ------------------------------------------------------------------
    // User accessors.

    /// The raw user list of `n`: one entry per input slot referencing `n`,
    /// in no particular order.
    pub fn users(&self, n: Node) -> &[Node] {
        &self.nodes[n].users
    }

    /// Whether `user` has `src` in its input section of the given kind.
    pub fn is_use_of_kind(&self, user: Node, src: Node, kind: UseKind) -> bool {
        self.section(user, kind).contains(&src)
    }

    /// Users of `n` through a value edge. Users referencing `n` through
    /// several value slots appear once per user-list entry, like the raw
    /// list.
    pub fn value_users<'a>(&'a self, n: Node) -> impl Iterator<Item = Node> + 'a {
        self.users_of_kind(n, UseKind::Value)
    }

    /// Users of `n` through a control edge.
    pub fn control_users<'a>(&'a self, n: Node) -> impl Iterator<Item = Node> + 'a {
        self.users_of_kind(n, UseKind::Control)
    }

    /// Users of `n` through an effect edge.
    pub fn effect_users<'a>(&'a self, n: Node) -> impl Iterator<Item = Node> + 'a {
        self.users_of_kind(n, UseKind::Effect)
    }

    fn users_of_kind<'a>(&'a self, n: Node, kind: UseKind) -> impl Iterator<Item = Node> + 'a {
        self.nodes[n]
            .users
            .iter()
            .cloned()
            .filter(move |&u| self.is_use_of_kind(u, n, kind))
    }

    /// Whether any user references `n` through a value edge.
    pub fn has_value_users(&self, n: Node) -> bool {
        self.value_users(n).next().is_some()
    }

    // ------------------------------------------------------------------
    // Edge primitives. The only legal way to change an edge.

    fn unlink_user(&mut self, src: Node, user: Node) {
        let users = &mut self.nodes[src].users;
        let pos = users
            .iter()
            .position(|&u| u == user)
            .expect("input/user mirror broken");
        users.swap_remove(pos);
    }

    /// Append `src` at the end of `dest`'s input section of `kind`.
    pub fn append_input(&mut self, dest: Node, kind: UseKind, src: Node) {
        debug_assert!(self.nodes.is_valid(src));
        let data = &mut self.nodes[dest];
        let pos = data.section_offset(kind) + data.section_len(kind);
        data.inputs.insert(pos, src);
        data.bump_section(kind, 1);
        self.nodes[src].users.push(dest);
    }

    /// Append a value input.
    pub fn append_value_input(&mut self, dest: Node, src: Node) {
        self.append_input(dest, UseKind::Value, src);
    }

    /// Append a control input.
    pub fn append_control_input(&mut self, dest: Node, src: Node) {
        self.append_input(dest, UseKind::Control, src);
    }

    /// Append an effect input.
    pub fn append_effect_input(&mut self, dest: Node, src: Node) {
        self.append_input(dest, UseKind::Effect, src);
    }

    /// Overwrite the `idx`-th input of the given kind. The previous source
    /// loses one user-list entry for `dest`.
    pub fn set_input(&mut self, dest: Node, kind: UseKind, idx: usize, src: Node) {
        let data = &self.nodes[dest];
        assert!(idx < data.section_len(kind), "input slot out of range");
        let pos = data.section_offset(kind) + idx;
        let old = data.inputs[pos];
        self.unlink_user(old, dest);
        self.nodes[dest].inputs[pos] = src;
        self.nodes[src].users.push(dest);
    }

    /// Overwrite the `idx`-th value input.
    pub fn set_value_input(&mut self, dest: Node, idx: usize, src: Node) {
        self.set_input(dest, UseKind::Value, idx, src);
    }

    /// Overwrite the `idx`-th control input.
    pub fn set_control_input(&mut self, dest: Node, idx: usize, src: Node) {
        self.set_input(dest, UseKind::Control, idx, src);
    }

    /// Overwrite the `idx`-th effect input.
    pub fn set_effect_input(&mut self, dest: Node, idx: usize, src: Node) {
        self.set_input(dest, UseKind::Effect, idx, src);
    }

    /// Remove the `idx`-th input of the given kind, shifting the rest of
    /// the section left.
    pub fn remove_input(&mut self, dest: Node, kind: UseKind, idx: usize) {
        let data = &self.nodes[dest];
        assert!(idx < data.section_len(kind), "input slot out of range");
        let pos = data.section_offset(kind) + idx;
        let old = self.nodes[dest].inputs.remove(pos);
        self.nodes[dest].bump_section(kind, -1);
        self.unlink_user(old, dest);
    }

    /// Remove the `idx`-th value input.
    pub fn remove_value_input(&mut self, dest: Node, idx: usize) {
        self.remove_input(dest, UseKind::Value, idx);
    }

    /// Remove the `idx`-th control input.
    pub fn remove_control_input(&mut self, dest: Node, idx: usize) {
        self.remove_input(dest, UseKind::Control, idx);
    }

    /// Remove the `idx`-th effect input.
    pub fn remove_effect_input(&mut self, dest: Node, idx: usize) {
        self.remove_input(dest, UseKind::Effect, idx);
    }

    /// Remove every input of the given kind whose source is `src`.
    pub fn remove_input_all(&mut self, dest: Node, kind: UseKind, src: Node) {
        loop {
            let pos = self.section(dest, kind).iter().position(|&i| i == src);
            match pos {
                Some(idx) => self.remove_input(dest, kind, idx),
                None => break,
            }
        }
    }

    /// Remove every value input from `src`.
    pub fn remove_value_input_all(&mut self, dest: Node, src: Node) {
        self.remove_input_all(dest, UseKind::Value, src);
    }

    /// Remove every control input from `src`.
    pub fn remove_control_input_all(&mut self, dest: Node, src: Node) {
        self.remove_input_all(dest, UseKind::Control, src);
    }

    /// Remove every effect input from `src`.
    pub fn remove_effect_input_all(&mut self, dest: Node, src: Node) {
        self.remove_input_all(dest, UseKind::Effect, src);
    }

    /// Rewrite every `kind` edge from `user` to `old_src` so it targets
    /// `new_src` instead.
    pub fn replace_use_of_with(&mut self, user: Node, old_src: Node, new_src: Node, kind: UseKind) {
        let data = &self.nodes[user];
        let off = data.section_offset(kind);
        let len = data.section_len(kind);
        for idx in 0..len {
            if self.nodes[user].inputs[off + idx] == old_src {
                self.set_input(user, kind, idx, new_src);
            }
        }
    }

    /// For every user of `old` through an edge of `kind`, retarget the edge
    /// to `new`.
    pub fn replace_with(&mut self, old: Node, new: Node, kind: UseKind) {
        let users: Vec<Node> = self.users(old).to_vec();
        for user in users {
            self.replace_use_of_with(user, old, new, kind);
        }
    }

    /// Retarget every edge of every kind from users of `old` to `new`.
    pub fn replace_all_uses(&mut self, old: Node, new: Node) {
        let users: Vec<Node> = self.users(old).to_vec();
        for user in users {
            self.replace_use_of_with(user, old, new, UseKind::Value);
            self.replace_use_of_with(user, old, new, UseKind::Control);
            self.replace_use_of_with(user, old, new, UseKind::Effect);
        }
    }

    /// Sever all of `n`'s inputs and redirect its remaining users to the
    /// dead sentinel. The node stays in the arena as garbage.
    pub fn kill(&mut self, n: Node) {
        let dead = self.dead_node();
        assert!(n != dead, "killing the dead sentinel");
        while !self.nodes[n].inputs.is_empty() {
            let kind = if self.nodes[n].num_effect_inputs > 0 {
                UseKind::Effect
            } else if self.nodes[n].num_control_inputs > 0 {
                UseKind::Control
            } else {
                UseKind::Value
            };
            let idx = self.nodes[n].section_len(kind) - 1;
            self.remove_input(n, kind, idx);
        }
        self.replace_all_uses(n, dead);
    }

    // ------------------------------------------------------------------
    // Pools.

    pub(crate) fn intern_int(&mut self, value: i32) -> Node {
        if let Some(&n) = self.int_pool.get(&value) {
            return n;
        }
        let n = self.make_node(Opcode::ConstantInt);
        self.int_pool.insert(value, n);
        self.int_values.insert(n, value);
        n
    }

    /// The integer behind a `ConstantInt` node, if `n` is one.
    pub fn int_value(&self, n: Node) -> Option<i32> {
        self.int_values.get(&n).cloned()
    }

    pub(crate) fn intern_str(&mut self, value: &str) -> Node {
        if let Some(&n) = self.str_pool.get(value) {
            return n;
        }
        let n = self.make_node(Opcode::ConstantStr);
        self.str_pool.insert(value.to_string(), n);
        self.str_values.insert(n, value.to_string());
        n
    }

    /// The string behind a `ConstantStr` node, if `n` is one.
    pub fn str_value(&self, n: Node) -> Option<&str> {
        self.str_values.get(&n).map(|s| s.as_str())
    }

    pub(crate) fn intern_stub(&mut self, subgraph: SubGraph) -> Node {
        if let Some(&n) = self.stub_pool.get(&subgraph) {
            return n;
        }
        let n = self.make_node(Opcode::FunctionStub);
        self.stub_pool.insert(subgraph, n);
        self.stub_funcs.insert(n, subgraph);
        n
    }

    /// The function behind a `FunctionStub` node, if `n` is one.
    pub fn stub_subgraph(&self, n: Node) -> Option<SubGraph> {
        self.stub_funcs.get(&n).cloned()
    }

    /// The interned stub for `subgraph`, if one was created.
    pub fn stub_of(&self, subgraph: SubGraph) -> Option<Node> {
        self.stub_pool.get(&subgraph).cloned()
    }

    /// Number of distinct interned integer constants.
    pub fn num_const_ints(&self) -> usize {
        self.int_pool.len()
    }

    /// Number of distinct interned string constants.
    pub fn num_const_strs(&self) -> usize {
        self.str_pool.len()
    }

    // ------------------------------------------------------------------
    // Global variables and subgraphs.

    /// Register a declaration (or its lowered `Alloca`) as a global.
    pub fn mark_global(&mut self, n: Node) {
        let op = self.opcode(n);
        assert!(
            op.is_src_decl() || op == Opcode::Alloca,
            "only declarations and allocas can be globals, got {}",
            op
        );
        if !self.global_vars.contains(&n) {
            self.global_vars.push(n);
        }
    }

    /// Whether `n` is a registered global.
    pub fn is_global_var(&self, n: Node) -> bool {
        self.global_vars.contains(&n)
    }

    /// Transfer the global marking from `old` to `new`, if `old` had one.
    pub fn replace_global_var(&mut self, old: Node, new: Node) {
        if let Some(pos) = self.global_vars.iter().position(|&g| g == old) {
            self.global_vars.remove(pos);
            self.mark_global(new);
        }
    }

    /// The registered globals, in registration order.
    pub fn global_vars(&self) -> &[Node] {
        &self.global_vars
    }

    /// Register a finished function.
    pub fn add_subgraph(&mut self, subgraph: SubGraph) {
        self.subgraphs.push(subgraph);
    }

    /// The registered functions, in registration order.
    pub fn subgraphs(&self) -> &[SubGraph] {
        &self.subgraphs
    }

    /// The `Start` node of a function, if the subgraph is well formed.
    pub fn start_node(&self, subgraph: SubGraph) -> Option<Node> {
        self.inputs(subgraph.end())
            .iter()
            .cloned()
            .find(|&n| self.opcode(n) == Opcode::Start)
    }

    // ------------------------------------------------------------------
    // Attributes.

    pub(crate) fn attach_attribute(&mut self, n: Node, attr: Attr) {
        let list = self.attributes.entry(n).or_insert_with(Vec::new);
        if !list.contains(&attr) {
            list.push(attr);
        }
    }

    /// Whether `n` carries the given attribute.
    pub fn has_attribute(&self, n: Node, attr: Attr) -> bool {
        self.attributes
            .get(&n)
            .map_or(false, |list| list.contains(&attr))
    }

    /// The attribute list of `n`.
    pub fn attributes_of(&self, n: Node) -> &[Attr] {
        self.attributes.get(&n).map_or(&[], |list| list.as_slice())
    }

    // ------------------------------------------------------------------
    // Marker scratch access.

    pub(crate) fn marker_word(&self, n: Node) -> u32 {
        self.nodes[n].marker
    }

    pub(crate) fn set_marker_word(&mut self, n: Node, value: u32) {
        self.nodes[n].marker = value;
    }

    /// Render `n` for diagnostics: opcode plus pool payload where one
    /// exists.
    pub fn display_node(&self, n: Node) -> String {
        match self.opcode(n) {
            Opcode::ConstantInt => format!("ConstInt<{}>", self.int_values[&n]),
            Opcode::ConstantStr => format!("ConstStr<{}>", self.str_values[&n]),
            op => format!("{}", op),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn edge_mirror() {
        let mut g = Graph::new();
        let a = g.make_node(Opcode::ConstantInt);
        let b = g.make_node(Opcode::ConstantInt);
        let add = g.make_node(Opcode::BinAdd);
        g.append_value_input(add, a);
        g.append_value_input(add, b);

        assert_eq!(g.value_inputs(add), &[a, b]);
        assert_eq!(g.users(a), &[add]);
        assert_eq!(g.users(b), &[add]);

        let c = g.make_node(Opcode::ConstantInt);
        g.set_value_input(add, 1, c);
        assert_eq!(g.value_inputs(add), &[a, c]);
        assert!(g.users(b).is_empty());
        assert_eq!(g.users(c), &[add]);
    }

    #[test]
    fn sections_are_disjoint() {
        let mut g = Graph::new();
        let v = g.make_node(Opcode::ConstantInt);
        let ctrl = g.make_node(Opcode::Start);
        let eff = g.make_node(Opcode::MemStore);
        let n = g.make_node(Opcode::MemLoad);
        g.append_effect_input(n, eff);
        g.append_value_input(n, v);
        g.append_control_input(n, ctrl);

        assert_eq!(g.value_inputs(n), &[v]);
        assert_eq!(g.control_inputs(n), &[ctrl]);
        assert_eq!(g.effect_inputs(n), &[eff]);
        assert_eq!(g.inputs(n), &[v, ctrl, eff]);

        assert!(g.is_use_of_kind(n, v, UseKind::Value));
        assert!(!g.is_use_of_kind(n, v, UseKind::Effect));
        assert_eq!(g.effect_users(eff).collect::<Vec<_>>(), vec![n]);
    }

    #[test]
    fn kill_rewires_users_to_dead() {
        let mut g = Graph::new();
        let a = g.make_node(Opcode::ConstantInt);
        let mid = g.make_node(Opcode::BinAdd);
        let user = g.make_node(Opcode::Return);
        g.append_value_input(mid, a);
        g.append_value_input(user, mid);

        g.kill(mid);
        let dead = g.dead_node();
        assert!(g.inputs(mid).is_empty());
        assert!(g.users(mid).is_empty());
        assert!(g.users(a).is_empty());
        assert_eq!(g.value_inputs(user), &[dead]);
    }

    #[test]
    fn pools_intern() {
        let mut g = Graph::new();
        let a = g.intern_int(42);
        let b = g.intern_int(42);
        let c = g.intern_int(7);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(g.int_value(a), Some(42));
        assert_eq!(g.num_const_ints(), 2);

        let s1 = g.intern_str("foo");
        let s2 = g.intern_str("foo");
        assert_eq!(s1, s2);
        assert_eq!(g.str_value(s1), Some("foo"));
    }

    #[test]
    fn subgraph_nodes_reverse_bfs() {
        let mut g = Graph::new();
        let start = g.make_node(Opcode::Start);
        let val = g.intern_int(3);
        let ret = g.make_node(Opcode::Return);
        g.append_value_input(ret, val);
        g.append_control_input(ret, start);
        let end = g.make_node(Opcode::End);
        g.append_control_input(end, start);
        g.append_control_input(end, ret);

        let sg = SubGraph::new(end);
        let nodes = sg.nodes(&g);
        assert_eq!(nodes[0], end);
        assert_eq!(nodes.len(), 4);
        assert_eq!(g.start_node(sg), Some(start));
    }
}
