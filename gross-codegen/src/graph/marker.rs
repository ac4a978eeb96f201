//! Fast per-node scratch state.
//!
//! A `NodeMarker` claims a window `[min, max)` from the graph-wide marker
//! counter and stores small states in every node's single scratch word.
//! Reads of a node whose word predates the window return the default state,
//! so a fresh marker sees every node as unmarked without touching them.
//!
//! At most one marker may be live in a graph at a time; creating a new one
//! invalidates the previous window. Reading through an outdated marker
//! asserts.

use crate::graph::{Graph, Node};
use core::marker::PhantomData;

/// A window of the graph's marker counter storing values of type `T`.
///
/// `T` must round-trip through `u32`; in practice it is a small `enum` or an
/// integer type.
pub struct NodeMarker<T> {
    min: u32,
    max: u32,
    unused: PhantomData<T>,
}

impl<T> NodeMarker<T>
where
    T: Into<u32> + From<u32>,
{
    /// Claim a window of `num_states` values from the graph counter.
    pub fn new(graph: &mut Graph, num_states: u32) -> Self {
        assert!(num_states > 0);
        let min = graph.marker_max;
        let max = min.checked_add(num_states).expect("marker counter wraparound");
        graph.marker_max = max;
        Self {
            min,
            max,
            unused: PhantomData,
        }
    }

    /// Read the state of `n`. Nodes untouched during this window read as
    /// state zero.
    pub fn get(&self, graph: &Graph, n: Node) -> T {
        let word = graph.marker_word(n);
        if word < self.min {
            return T::from(0);
        }
        assert!(word < self.max, "reading through an outdated NodeMarker");
        T::from(word - self.min)
    }

    /// Store a state for `n`.
    pub fn set(&self, graph: &mut Graph, n: Node, state: T) {
        let value: u32 = state.into();
        assert!(value < self.max - self.min, "marker state out of window");
        debug_assert!(graph.marker_word(n) < self.max);
        graph.set_marker_word(n, self.min + value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Opcode;

    #[test]
    fn windows_do_not_bleed() {
        let mut g = Graph::new();
        let a = g.make_node(Opcode::None);
        let b = g.make_node(Opcode::None);

        let first: NodeMarker<u32> = NodeMarker::new(&mut g, 4);
        first.set(&mut g, a, 3);
        assert_eq!(first.get(&g, a), 3);
        assert_eq!(first.get(&g, b), 0);
        drop(first);

        // A fresh window reads everything as unmarked.
        let second: NodeMarker<u32> = NodeMarker::new(&mut g, 2);
        assert_eq!(second.get(&g, a), 0);
        second.set(&mut g, a, 1);
        assert_eq!(second.get(&g, a), 1);
    }
}
