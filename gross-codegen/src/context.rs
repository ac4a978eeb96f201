//! Compilation context.
//!
//! The `Context` struct drives the whole pipeline over a graph: the
//! graph-level optimization reducers, allocation lowering, instruction
//! selection, scheduling, the schedule-level lowerings and register
//! allocation. It owns no graph; it carries the target profile and the
//! region layout between stages.

use crate::graph::reducer::run_reducer;
use crate::graph::{Graph, SubGraph};
use crate::isel::PreMachineLowering;
use crate::postlower::PostMachineLowering;
use crate::postra::PostRALowering;
use crate::reductions::{
    run_dce, CseReducer, MemAllocationLowering, MemoryLegalize, MemoryNormalize, PeepholeReducer,
    ValuePromotion,
};
use crate::regalloc::LinearScanAllocator;
use crate::result::CodegenResult;
use crate::schedule::{GraphSchedule, GraphScheduler};
use crate::targets::{TargetTraits, DLX};
use log::debug;
use std::collections::HashMap;

/// One fully lowered function: the final block/instruction sequence plus
/// the allocator holding the location of every value. The DLX encoder
/// walks `schedule.rpo_blocks()` and queries `allocator.location`.
pub struct CompiledFunction {
    /// The scheduled, lowered, register-allocated function body.
    pub schedule: GraphSchedule,
    /// Location assignments and caller-saved snapshots.
    pub allocator: LinearScanAllocator,
}

/// Drives compilation for one graph at a time.
pub struct Context {
    target: TargetTraits,
    frame_sizes: HashMap<crate::graph::Node, i32>,
    /// Size in bytes of the shared globals chunk, valid after `optimize`.
    pub globals_size: i32,
}

impl Context {
    /// A context for the full DLX register file.
    pub fn new() -> Self {
        Self::for_target(DLX)
    }

    /// A context for a specific register-file profile.
    pub fn for_target(target: TargetTraits) -> Self {
        Self {
            target,
            frame_sizes: HashMap::new(),
            globals_size: 0,
        }
    }

    /// Run every graph-level stage: the optimization reducers to fix-point,
    /// allocation lowering, and DLX instruction selection.
    pub fn optimize(&mut self, graph: &mut Graph) {
        run_reducer(graph, &mut ValuePromotion::new());
        run_reducer(graph, &mut PeepholeReducer::new());
        run_reducer(graph, &mut CseReducer::new());
        run_reducer(graph, &mut MemoryNormalize::new());
        run_reducer(graph, &mut MemoryLegalize::new());
        run_dce(graph);

        let layout = MemAllocationLowering::run(graph);
        self.frame_sizes = layout.frame_sizes;
        self.globals_size = layout.globals_size;

        run_reducer(graph, &mut PreMachineLowering::new());
    }

    /// Lower one optimized function down to allocated machine form.
    pub fn compile_function(
        &mut self,
        graph: &mut Graph,
        subgraph: SubGraph,
    ) -> CodegenResult<CompiledFunction> {
        let mut schedule = GraphScheduler::compute(graph, subgraph)?;
        schedule.frame_size = self
            .frame_sizes
            .get(&subgraph.end())
            .cloned()
            .unwrap_or(0);

        PostMachineLowering::new().run(graph, &mut schedule);

        let mut allocator = LinearScanAllocator::new(self.target);
        allocator.allocate(graph, &mut schedule);

        PostRALowering::new().run(graph, &mut schedule);

        debug!(
            "compiled function with {} blocks, {} spill slots",
            schedule.block_size(),
            allocator.num_spill_slots()
        );
        Ok(CompiledFunction {
            schedule,
            allocator,
        })
    }

    /// Compile every registered function of `graph`.
    pub fn compile(&mut self, graph: &mut Graph) -> CodegenResult<Vec<CompiledFunction>> {
        self.optimize(graph);
        let subgraphs = graph.subgraphs().to_vec();
        subgraphs
            .into_iter()
            .map(|sg| self.compile_function(graph, sg))
            .collect()
    }
}
