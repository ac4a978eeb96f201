//! Memory chain legalization and allocation lowering.
//!
//! After value promotion, loads hang off the store (or phi) they observed.
//! Later stages want a linear memory chain per function: a store must come
//! after every load of the previous memory state. `MemoryNormalize` and
//! `MemoryLegalize` rewrite the effect edges accordingly;
//! `MemAllocationLowering` then folds every surviving allocation into one
//! frame-pointer- or global-pointer-relative region per function.

use crate::graph::reducer::{no_change, replace, GraphEditor, Reducer, Reduction};
use crate::graph::{builders, Graph, Node, Opcode, UseKind};
use log::debug;
use std::collections::HashMap;

fn is_mutable_mem_op(graph: &Graph, n: Node) -> bool {
    match graph.opcode(n) {
        Opcode::MemStore | Opcode::Phi => true,
        _ => false,
    }
}

/// Merge several loads into a single effect predecessor node.
fn merged_load_effect(graph: &mut Graph, loads: &[Node]) -> Node {
    if loads.len() == 1 {
        loads[0]
    } else {
        let mut builder = builders::effect_merge();
        for &load in loads {
            builder = builder.effect(load);
        }
        builder.build(graph)
    }
}

/// Rewrites the effect inputs of stores and phis so that loads of the
/// previous memory state become the direct effect predecessor, producing an
/// `EffectMerge` when several loads share one predecessor.
pub struct MemoryNormalize;

impl MemoryNormalize {
    /// Create the pass.
    pub fn new() -> Self {
        Self
    }

    fn reduce_mutable_mem_op(&self, editor: &mut GraphEditor, node: Node) -> Reduction {
        let mut changed = false;
        let num_effects = editor.graph().num_effect_inputs(node);
        for idx in 0..num_effects {
            let pred = editor.graph().effect_input(node, idx);
            if !is_mutable_mem_op(editor.graph(), pred) {
                continue;
            }
            let loads: Vec<Node> = {
                let graph = editor.graph();
                graph
                    .effect_users(pred)
                    .filter(|&u| u != node && graph.opcode(u) == Opcode::MemLoad)
                    .collect()
            };
            if loads.is_empty() {
                continue;
            }
            let new_effect = merged_load_effect(editor.graph_mut(), &loads);
            editor.graph_mut().set_effect_input(node, idx, new_effect);
            changed = true;
        }
        if changed {
            replace(node)
        } else {
            no_change()
        }
    }
}

impl Reducer for MemoryNormalize {
    fn name(&self) -> &'static str {
        "memory-normalize"
    }

    fn reduce(&mut self, editor: &mut GraphEditor, node: Node) -> Reduction {
        if is_mutable_mem_op(editor.graph(), node) {
            self.reduce_mutable_mem_op(editor, node)
        } else {
            no_change()
        }
    }
}

/// When a store feeds both phis and loads, the phis must observe the loads
/// rather than the raw store: phi effect inputs carry "latest seen read".
pub struct MemoryLegalize;

impl MemoryLegalize {
    /// Create the pass.
    pub fn new() -> Self {
        Self
    }

    fn reduce_mem_store(&self, editor: &mut GraphEditor, node: Node) -> Reduction {
        let phis: Vec<Node> = {
            let graph = editor.graph();
            graph
                .effect_users(node)
                .filter(|&u| graph.opcode(u) == Opcode::Phi)
                .collect()
        };
        if phis.is_empty() {
            return no_change();
        }
        let loads: Vec<Node> = {
            let graph = editor.graph();
            graph
                .effect_users(node)
                .filter(|&u| graph.opcode(u) == Opcode::MemLoad)
                .collect()
        };
        if loads.is_empty() {
            return no_change();
        }

        let new_effect = merged_load_effect(editor.graph_mut(), &loads);
        for phi in phis {
            editor
                .graph_mut()
                .replace_use_of_with(phi, node, new_effect, UseKind::Effect);
            editor.revisit(phi);
        }
        no_change()
    }
}

impl Reducer for MemoryLegalize {
    fn name(&self) -> &'static str {
        "memory-legalize"
    }

    fn reduce(&mut self, editor: &mut GraphEditor, node: Node) -> Reduction {
        if editor.graph().opcode(node) == Opcode::MemStore {
            self.reduce_mem_store(editor, node)
        } else {
            no_change()
        }
    }
}

/// Frame and globals-chunk sizes computed by `MemAllocationLowering`,
/// consumed by the register allocator's spill-slot placement.
pub struct AllocationLayout {
    /// Bytes of local allocation per function, keyed by the `End` node.
    pub frame_sizes: HashMap<Node, i32>,
    /// Bytes of the shared globals chunk.
    pub globals_size: i32,
}

impl AllocationLayout {
    /// Local frame size of the function ending at `end`.
    pub fn frame_size(&self, end: Node) -> i32 {
        self.frame_sizes.get(&end).cloned().unwrap_or(0)
    }
}

/// Collects the surviving `Alloca` nodes of each function, assigns every
/// allocation an offset in the frame (locals) or the globals chunk, and
/// rewrites loads and stores to address off the frame or global pointer.
/// Needs the function as a whole, so it runs outside the reducer.
pub struct MemAllocationLowering;

impl MemAllocationLowering {
    /// Run over every registered function; returns the region layout.
    pub fn run(graph: &mut Graph) -> AllocationLayout {
        // The globals chunk is shared: assign offsets once.
        let mut globals_size = 0i32;
        let mut global_offsets: HashMap<Node, i32> = HashMap::new();
        let global_allocas: Vec<Node> = graph
            .global_vars()
            .iter()
            .cloned()
            .filter(|&g| graph.opcode(g) == Opcode::Alloca)
            .collect();
        for ga in &global_allocas {
            global_offsets.insert(*ga, globals_size);
            globals_size += alloca_byte_size(graph, *ga);
        }

        let mut frame_sizes = HashMap::new();
        let subgraphs = graph.subgraphs().to_vec();
        for sg in subgraphs {
            let mut frame_size = 0i32;
            // One pointer node per function and region.
            let mut frame_ptr = None;
            let mut global_ptr = None;

            for n in sg.nodes(graph) {
                if graph.opcode(n) != Opcode::Alloca {
                    continue;
                }
                let (base, offset) = if let Some(&off) = global_offsets.get(&n) {
                    let gp = *global_ptr.get_or_insert_with(|| {
                        builders::dlx_register(crate::targets::DLX.gp_reg).build(graph)
                    });
                    (gp, off)
                } else {
                    let fp = *frame_ptr.get_or_insert_with(|| {
                        builders::dlx_register(crate::targets::DLX.fp_reg).build(graph)
                    });
                    let off = frame_size;
                    frame_size += alloca_byte_size(graph, n);
                    (fp, off)
                };
                debug!(
                    "alloca {} -> base {} offset {}",
                    graph.display_node(n),
                    graph.display_node(base),
                    offset
                );
                rewrite_memory_users(graph, n, base, offset);
            }
            frame_sizes.insert(sg.end(), frame_size);
        }

        AllocationLayout {
            frame_sizes,
            globals_size,
        }
    }
}

fn alloca_byte_size(graph: &Graph, alloca: Node) -> i32 {
    let size = graph.value_input(alloca, 0);
    let bytes = graph
        .int_value(size)
        .expect("allocation size did not fold to a constant");
    // Keep every region word-aligned.
    (bytes + 3) & !3
}

/// Point every load/store based on `alloca` at `(base, old offset + offset)`
/// instead. The alloca itself stays alive as the anchor of effect chains.
fn rewrite_memory_users(graph: &mut Graph, alloca: Node, base: Node, offset: i32) {
    let users: Vec<Node> = graph.value_users(alloca).collect();
    for user in users {
        if !graph.opcode(user).is_mem_op() {
            continue;
        }
        if graph.value_input(user, 0) != alloca {
            continue;
        }
        let old_offset = graph.value_input(user, 1);
        let new_offset = match graph.int_value(old_offset) {
            Some(c) => builders::const_int(c + offset).build(graph),
            None => {
                let chunk = builders::const_int(offset).build(graph);
                builders::bin_op(Opcode::BinAdd)
                    .lhs(old_offset)
                    .rhs(chunk)
                    .build(graph)
            }
        };
        graph.set_value_input(user, 1, new_offset);
        graph.set_value_input(user, 0, base);
    }
}
