//! Node storage.
//!
//! A `Node` is an opaque `u32` reference into the graph's arena; `NodeData`
//! is the storage behind it. The three input kinds share one vector,
//! partitioned `[value | control | effect]`, with the section lengths kept
//! alongside. The user list is the unordered mirror of the input edges: for
//! every input slot of `u` occupied by `v`, `u` appears once in `v`'s users.

use crate::graph::Opcode;
use gross_entity::entity_impl;
use smallvec::SmallVec;

/// An opaque reference to a node in a graph.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Node(u32);
entity_impl!(Node, "node");

/// The kind of an input edge.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum UseKind {
    /// Data dependency.
    Value,
    /// Control dependency.
    Control,
    /// Memory / IO ordering dependency.
    Effect,
}

/// Storage for one node. Only the graph may touch the edge vectors; all
/// mutation goes through the graph's edge primitives so the input/user
/// mirror never breaks.
#[derive(Clone, Debug)]
pub(crate) struct NodeData {
    pub op: Opcode,
    pub num_value_inputs: usize,
    pub num_control_inputs: usize,
    pub num_effect_inputs: usize,
    /// `[value | control | effect]`, sections given by the counts above.
    pub inputs: SmallVec<[Node; 4]>,
    /// Unordered back-edges, one entry per input slot referencing this node.
    pub users: SmallVec<[Node; 4]>,
    /// Scratch word claimed by `NodeMarker` windows.
    pub marker: u32,
}

impl NodeData {
    pub fn new(op: Opcode) -> Self {
        Self {
            op,
            num_value_inputs: 0,
            num_control_inputs: 0,
            num_effect_inputs: 0,
            inputs: SmallVec::new(),
            users: SmallVec::new(),
            marker: 0,
        }
    }

    /// Offset of the first slot of the given input section.
    pub fn section_offset(&self, kind: UseKind) -> usize {
        match kind {
            UseKind::Value => 0,
            UseKind::Control => self.num_value_inputs,
            UseKind::Effect => self.num_value_inputs + self.num_control_inputs,
        }
    }

    /// Length of the given input section.
    pub fn section_len(&self, kind: UseKind) -> usize {
        match kind {
            UseKind::Value => self.num_value_inputs,
            UseKind::Control => self.num_control_inputs,
            UseKind::Effect => self.num_effect_inputs,
        }
    }

    pub fn bump_section(&mut self, kind: UseKind, delta: isize) {
        let len = match kind {
            UseKind::Value => &mut self.num_value_inputs,
            UseKind::Control => &mut self.num_control_inputs,
            UseKind::Effect => &mut self.num_effect_inputs,
        };
        *len = (*len as isize + delta) as usize;
    }
}
