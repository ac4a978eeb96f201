//! Per-node side-channel attributes.
//!
//! Attributes describe the memory and environment behavior of whole
//! functions. They are attached to `Start` nodes only and queried through
//! the function's `FunctionStub` at call-sites.

use crate::graph::{Graph, Node, Opcode};

/// The closed attribute set.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Attr {
    /// The function touches no memory at all.
    NoMem,
    /// Coarse-grained: the function may read some global memory.
    ReadMem,
    /// Coarse-grained: the function may write some global memory.
    WriteMem,
    /// Environment side-effects (e.g. reads input, writes output).
    HasSideEffect,
    /// The function is a compiler builtin.
    IsBuiltin,
}

/// Accumulates attributes, then attaches them to a node in one shot.
pub struct AttributeBuilder {
    attrs: Vec<Attr>,
}

impl AttributeBuilder {
    /// Create an empty builder.
    pub fn new() -> Self {
        Self { attrs: Vec::new() }
    }

    /// Add an attribute.
    pub fn add(mut self, attr: Attr) -> Self {
        self.attrs.push(attr);
        self
    }

    /// Whether anything has been added.
    pub fn has_attrs(&self) -> bool {
        !self.attrs.is_empty()
    }

    /// Attach the accumulated attributes to `n`, consuming the builder.
    pub fn attach(self, graph: &mut Graph, n: Node) {
        assert_eq!(
            graph.opcode(n),
            Opcode::Start,
            "attributes attach to function Start nodes"
        );
        for attr in self.attrs {
            graph.attach_attribute(n, attr);
        }
    }
}

/// Look up an attribute of the function behind a `FunctionStub`.
pub fn stub_has_attribute(graph: &Graph, stub: Node, attr: Attr) -> bool {
    let subgraph = match graph.stub_subgraph(stub) {
        Some(sg) => sg,
        None => return false,
    };
    match graph.start_node(subgraph) {
        Some(start) => graph.has_attribute(start, attr),
        None => false,
    }
}
