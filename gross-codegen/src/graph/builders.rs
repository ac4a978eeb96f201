//! Typed node constructors.
//!
//! Every opcode the parser or a pass may create has a small fluent builder
//! here. A builder checks its preconditions and returns the finished node
//! already inserted into the graph with inputs and users wired up, so a
//! node is well formed from birth. For pooled opcodes (integer and string
//! constants, function stubs) the builder returns the interned node when
//! one exists.
//!
//! Slot layout knowledge lives in exactly two places: here (writing) and in
//! `properties` (reading).

use crate::graph::{Graph, Node, Opcode, SubGraph};
use smallvec::SmallVec;

/// The dead sentinel.
pub fn dead() -> DeadBuilder {
    DeadBuilder
}

/// A pooled 32-bit integer constant.
pub fn const_int(value: i32) -> ConstIntBuilder {
    ConstIntBuilder { value }
}

/// A pooled string constant.
pub fn const_str(value: &str) -> ConstStrBuilder {
    ConstStrBuilder { value }
}

/// The singleton stub standing for a callee function.
pub fn function_stub(subgraph: SubGraph) -> FunctionStubBuilder {
    FunctionStubBuilder { subgraph }
}

/// A call of the function behind `stub`.
pub fn call(stub: Node) -> CallBuilder {
    CallBuilder {
        stub,
        args: SmallVec::new(),
    }
}

/// A scalar variable declaration.
pub fn var_decl(name: &str) -> VarDeclBuilder {
    VarDeclBuilder { name }
}

/// An array declaration with one node per dimension.
pub fn array_decl(name: &str) -> ArrayDeclBuilder {
    ArrayDeclBuilder {
        name,
        dims: SmallVec::new(),
    }
}

/// The pristine state of a freshly declared array.
pub fn initial_array(decl: Node) -> InitialArrayBuilder {
    InitialArrayBuilder { decl }
}

/// An arithmetic or relational binary operation.
pub fn bin_op(op: Opcode) -> BinOpBuilder {
    assert!(op.is_bin_op(), "not a binary operator: {}", op);
    BinOpBuilder {
        op,
        lhs: None,
        rhs: None,
    }
}

/// A read (or assignment destination) of a scalar variable.
pub fn var_access(decl: Node) -> VarAccessBuilder {
    VarAccessBuilder { decl, effect: None }
}

/// A read (or assignment destination) of an array element.
pub fn array_access(decl: Node) -> ArrayAccessBuilder {
    ArrayAccessBuilder {
        decl,
        dims: SmallVec::new(),
        effect: None,
    }
}

/// An assignment statement.
pub fn assign(dest: Node, src: Node) -> AssignBuilder {
    AssignBuilder { dest, src }
}

/// A two-way branch on a predicate.
pub fn if_stmt(condition: Node) -> IfBuilder {
    IfBuilder { condition }
}

/// The taken / not-taken projection of an `If`.
pub fn if_branch(if_node: Node, taken: bool) -> IfBranchBuilder {
    IfBranchBuilder { if_node, taken }
}

/// A control-flow merge point.
pub fn merge() -> MergeBuilder {
    MergeBuilder {
        ctrls: SmallVec::new(),
    }
}

/// An effect-chain merge point.
pub fn effect_merge() -> EffectMergeBuilder {
    EffectMergeBuilder {
        effects: SmallVec::new(),
    }
}

/// A phi. Control input zero must be the merge or loop whose control inputs
/// parallel the phi's value/effect inputs.
pub fn phi() -> PhiBuilder {
    PhiBuilder {
        values: SmallVec::new(),
        effects: SmallVec::new(),
        ctrl_merge: None,
    }
}

/// A formal parameter.
pub fn argument(name: &str) -> ArgumentBuilder {
    ArgumentBuilder { name }
}

/// A function prototype: the `Start` node plus its parameter wiring.
pub fn function(name: &str) -> FunctionBuilder {
    FunctionBuilder {
        name,
        params: SmallVec::new(),
    }
}

/// The `End` node closing a function.
pub fn end(start: Node) -> EndBuilder {
    EndBuilder {
        start,
        terminators: SmallVec::new(),
        effects: SmallVec::new(),
    }
}

/// A return statement.
pub fn return_stmt() -> ReturnBuilder {
    ReturnBuilder { value: None }
}

/// A loop header merging the entry control with the backedge. Builds the
/// loop's `If` / `IfTrue` / `IfFalse` skeleton as a side effect.
pub fn loop_header(last_ctrl: Node, condition: Node) -> LoopBuilder {
    LoopBuilder {
        last_ctrl,
        condition,
    }
}

/// A stack or globals-area allocation.
pub fn alloca() -> AllocaBuilder {
    AllocaBuilder { size: None }
}

/// A target-independent memory load.
pub fn mem_load(base_addr: Node, offset: Node) -> MemLoadBuilder {
    MemLoadBuilder { base_addr, offset }
}

/// A target-independent memory store.
pub fn mem_store(base_addr: Node, offset: Node, src: Node) -> MemStoreBuilder {
    MemStoreBuilder {
        base_addr,
        offset,
        src,
    }
}

/// A DLX two-operand instruction (arithmetic or conditional branch).
pub fn dlx_bin(op: Opcode) -> DlxBinBuilder {
    assert!(
        op.is_dlx_arith() || op.is_dlx_terminate(),
        "not a DLX binary instruction: {}",
        op
    );
    DlxBinBuilder {
        op,
        immediate: false,
        lhs: None,
        rhs: None,
    }
}

/// A DLX load/store. `LdW`/`StW` require a constant offset.
pub fn dlx_mem(op: Opcode) -> DlxMemBuilder {
    assert!(op.is_dlx_mem(), "not a DLX memory instruction: {}", op);
    DlxMemBuilder {
        op,
        base_addr: None,
        offset: None,
        src: None,
    }
}

/// A DLX register node.
pub fn dlx_register(index: usize) -> DlxRegisterBuilder {
    DlxRegisterBuilder { index }
}

/// The program-text offset symbol of a basic block.
pub fn dlx_offset() -> DlxOffsetBuilder {
    DlxOffsetBuilder
}

/// A DLX return through the link register.
pub fn dlx_ret(link_reg: Node) -> DlxRetBuilder {
    DlxRetBuilder { link_reg }
}

/// The marker opening a lowered call-site.
pub fn callsite_begin() -> CallsiteBeginBuilder {
    CallsiteBeginBuilder
}

/// The marker closing a lowered call-site.
pub fn callsite_end(begin: Node) -> CallsiteEndBuilder {
    CallsiteEndBuilder { begin }
}

/// One actual-parameter transfer inside a lowered call-site.
pub fn pass_param(value: Node, begin: Node) -> PassParamBuilder {
    PassParamBuilder { value, begin }
}

// ---------------------------------------------------------------------

pub struct DeadBuilder;

impl DeadBuilder {
    pub fn build(self, graph: &mut Graph) -> Node {
        graph.dead_node()
    }
}

pub struct ConstIntBuilder {
    value: i32,
}

impl ConstIntBuilder {
    pub fn build(self, graph: &mut Graph) -> Node {
        graph.intern_int(self.value)
    }
}

pub struct ConstStrBuilder<'a> {
    value: &'a str,
}

impl<'a> ConstStrBuilder<'a> {
    pub fn build(self, graph: &mut Graph) -> Node {
        graph.intern_str(self.value)
    }
}

pub struct FunctionStubBuilder {
    subgraph: SubGraph,
}

impl FunctionStubBuilder {
    pub fn build(self, graph: &mut Graph) -> Node {
        graph.intern_stub(self.subgraph)
    }
}

pub struct CallBuilder {
    stub: Node,
    args: SmallVec<[Node; 4]>,
}

impl CallBuilder {
    /// Append an actual parameter.
    pub fn arg(mut self, n: Node) -> Self {
        self.args.push(n);
        self
    }

    pub fn num_args(&self) -> usize {
        self.args.len()
    }

    pub fn build(self, graph: &mut Graph) -> Node {
        assert_eq!(graph.opcode(self.stub), Opcode::FunctionStub);
        let n = graph.make_node(Opcode::Call);
        graph.append_value_input(n, self.stub);
        for arg in self.args {
            graph.append_value_input(n, arg);
        }
        n
    }
}

pub struct VarDeclBuilder<'a> {
    name: &'a str,
}

impl<'a> VarDeclBuilder<'a> {
    pub fn build(self, graph: &mut Graph) -> Node {
        let sym = graph.intern_str(self.name);
        let n = graph.make_node(Opcode::SrcVarDecl);
        graph.append_value_input(n, sym);
        n
    }
}

pub struct ArrayDeclBuilder<'a> {
    name: &'a str,
    dims: SmallVec<[Node; 2]>,
}

impl<'a> ArrayDeclBuilder<'a> {
    /// Append a dimension expression.
    pub fn dim(mut self, n: Node) -> Self {
        self.dims.push(n);
        self
    }

    /// Append a constant dimension.
    pub fn const_dim(self, graph: &mut Graph, dim: u32) -> Self {
        assert!(dim > 0, "array dimension must be positive");
        let n = graph.intern_int(dim as i32);
        self.dim(n)
    }

    pub fn build(self, graph: &mut Graph) -> Node {
        assert!(!self.dims.is_empty(), "array needs at least one dimension");
        let sym = graph.intern_str(self.name);
        // Value slot 0 is the symbol, slots 1.. are the dimensions.
        let n = graph.make_node(Opcode::SrcArrayDecl);
        graph.append_value_input(n, sym);
        for d in self.dims {
            graph.append_value_input(n, d);
        }
        n
    }
}

pub struct InitialArrayBuilder {
    decl: Node,
}

impl InitialArrayBuilder {
    pub fn build(self, graph: &mut Graph) -> Node {
        assert_eq!(graph.opcode(self.decl), Opcode::SrcArrayDecl);
        let n = graph.make_node(Opcode::SrcInitialArray);
        graph.append_value_input(n, self.decl);
        n
    }
}

pub struct BinOpBuilder {
    op: Opcode,
    lhs: Option<Node>,
    rhs: Option<Node>,
}

impl BinOpBuilder {
    pub fn lhs(mut self, n: Node) -> Self {
        self.lhs = Some(n);
        self
    }

    pub fn rhs(mut self, n: Node) -> Self {
        self.rhs = Some(n);
        self
    }

    pub fn build(self, graph: &mut Graph) -> Node {
        let lhs = self.lhs.expect("binary operator needs a LHS");
        let rhs = self.rhs.expect("binary operator needs a RHS");
        let n = graph.make_node(self.op);
        graph.append_value_input(n, lhs);
        graph.append_value_input(n, rhs);
        n
    }
}

pub struct VarAccessBuilder {
    decl: Node,
    effect: Option<Node>,
}

impl VarAccessBuilder {
    /// The last-modifier this read depends on.
    pub fn effect(mut self, n: Node) -> Self {
        self.effect = Some(n);
        self
    }

    pub fn build(self, graph: &mut Graph) -> Node {
        let op = graph.opcode(self.decl);
        assert!(
            op == Opcode::SrcVarDecl || op == Opcode::Argument,
            "scalar access of a non-scalar declaration: {}",
            op
        );
        let n = graph.make_node(Opcode::SrcVarAccess);
        graph.append_value_input(n, self.decl);
        if let Some(e) = self.effect {
            graph.append_effect_input(n, e);
        }
        n
    }
}

pub struct ArrayAccessBuilder {
    decl: Node,
    dims: SmallVec<[Node; 2]>,
    effect: Option<Node>,
}

impl ArrayAccessBuilder {
    /// Append an index expression.
    pub fn dim(mut self, n: Node) -> Self {
        self.dims.push(n);
        self
    }

    /// The last memory access this one depends on.
    pub fn effect(mut self, n: Node) -> Self {
        self.effect = Some(n);
        self
    }

    pub fn build(self, graph: &mut Graph) -> Node {
        assert_eq!(graph.opcode(self.decl), Opcode::SrcArrayDecl);
        let decl_dims = graph.num_value_inputs(self.decl) - 1;
        assert_eq!(
            decl_dims,
            self.dims.len(),
            "index count does not match the declaration"
        );
        // Value slot 0 is the declaration, slots 1.. the indices.
        let n = graph.make_node(Opcode::SrcArrayAccess);
        graph.append_value_input(n, self.decl);
        for d in self.dims {
            graph.append_value_input(n, d);
        }
        if let Some(e) = self.effect {
            graph.append_effect_input(n, e);
        }
        n
    }
}

pub struct AssignBuilder {
    dest: Node,
    src: Node,
}

impl AssignBuilder {
    pub fn build(self, graph: &mut Graph) -> Node {
        let n = graph.make_node(Opcode::SrcAssignStmt);
        graph.append_value_input(n, self.dest);
        graph.append_value_input(n, self.src);
        n
    }
}

pub struct IfBuilder {
    condition: Node,
}

impl IfBuilder {
    pub fn build(self, graph: &mut Graph) -> Node {
        let n = graph.make_node(Opcode::If);
        graph.append_value_input(n, self.condition);
        n
    }
}

pub struct IfBranchBuilder {
    if_node: Node,
    taken: bool,
}

impl IfBranchBuilder {
    pub fn build(self, graph: &mut Graph) -> Node {
        assert_eq!(graph.opcode(self.if_node), Opcode::If);
        let op = if self.taken {
            Opcode::IfTrue
        } else {
            Opcode::IfFalse
        };
        let n = graph.make_node(op);
        graph.append_control_input(n, self.if_node);
        n
    }
}

pub struct MergeBuilder {
    ctrls: SmallVec<[Node; 2]>,
}

impl MergeBuilder {
    /// Append a merged control predecessor.
    pub fn ctrl(mut self, n: Node) -> Self {
        self.ctrls.push(n);
        self
    }

    pub fn build(self, graph: &mut Graph) -> Node {
        let n = graph.make_node(Opcode::Merge);
        for c in self.ctrls {
            graph.append_control_input(n, c);
        }
        n
    }
}

pub struct EffectMergeBuilder {
    effects: SmallVec<[Node; 2]>,
}

impl EffectMergeBuilder {
    /// Append a merged effect predecessor.
    pub fn effect(mut self, n: Node) -> Self {
        self.effects.push(n);
        self
    }

    pub fn build(self, graph: &mut Graph) -> Node {
        let n = graph.make_node(Opcode::EffectMerge);
        for e in self.effects {
            graph.append_effect_input(n, e);
        }
        n
    }
}

pub struct PhiBuilder {
    values: SmallVec<[Node; 2]>,
    effects: SmallVec<[Node; 2]>,
    ctrl_merge: Option<Node>,
}

impl PhiBuilder {
    /// Append a per-predecessor value input.
    pub fn value(mut self, n: Node) -> Self {
        self.values.push(n);
        self
    }

    /// Append a per-predecessor effect input.
    pub fn effect(mut self, n: Node) -> Self {
        self.effects.push(n);
        self
    }

    /// The merge or loop node this phi pivots on.
    pub fn ctrl_merge(mut self, n: Node) -> Self {
        self.ctrl_merge = Some(n);
        self
    }

    pub fn build(self, graph: &mut Graph) -> Node {
        let pivot = self.ctrl_merge.expect("phi requires a control merge point");
        let pivot_op = graph.opcode(pivot);
        assert!(
            pivot_op == Opcode::Merge || pivot_op == Opcode::Loop,
            "phi pivot must be a Merge or Loop, got {}",
            pivot_op
        );
        let n = graph.make_node(Opcode::Phi);
        for v in self.values {
            graph.append_value_input(n, v);
        }
        graph.append_control_input(n, pivot);
        for e in self.effects {
            graph.append_effect_input(n, e);
        }
        n
    }
}

pub struct ArgumentBuilder<'a> {
    name: &'a str,
}

impl<'a> ArgumentBuilder<'a> {
    pub fn build(self, graph: &mut Graph) -> Node {
        let sym = graph.intern_str(self.name);
        let n = graph.make_node(Opcode::Argument);
        graph.append_value_input(n, sym);
        n
    }
}

pub struct FunctionBuilder<'a> {
    name: &'a str,
    params: SmallVec<[Node; 4]>,
}

impl<'a> FunctionBuilder<'a> {
    /// Append a formal parameter (an `Argument` node).
    pub fn param(mut self, n: Node) -> Self {
        self.params.push(n);
        self
    }

    pub fn build(self, graph: &mut Graph) -> Node {
        for &p in &self.params {
            assert_eq!(
                graph.opcode(p),
                Opcode::Argument,
                "function parameters must be Argument nodes"
            );
        }
        let sym = graph.intern_str(self.name);
        // Start carries one effect input per formal parameter so arguments
        // stay reachable from the function body.
        let n = graph.make_node(Opcode::Start);
        graph.append_value_input(n, sym);
        for p in self.params {
            graph.append_effect_input(n, p);
        }
        n
    }
}

pub struct EndBuilder {
    start: Node,
    terminators: SmallVec<[Node; 2]>,
    effects: SmallVec<[Node; 2]>,
}

impl EndBuilder {
    /// Append a terminator (`Return`, or a merge ending the body).
    pub fn terminator(mut self, n: Node) -> Self {
        self.terminators.push(n);
        self
    }

    /// Append a dangling effect the function must keep alive.
    pub fn effect(mut self, n: Node) -> Self {
        self.effects.push(n);
        self
    }

    pub fn build(self, graph: &mut Graph) -> Node {
        assert_eq!(graph.opcode(self.start), Opcode::Start);
        let n = graph.make_node(Opcode::End);
        graph.append_control_input(n, self.start);
        for t in self.terminators {
            graph.append_control_input(n, t);
        }
        for e in self.effects {
            graph.append_effect_input(n, e);
        }
        n
    }
}

pub struct ReturnBuilder {
    value: Option<Node>,
}

impl ReturnBuilder {
    /// The returned value, if the function returns one.
    pub fn value(mut self, n: Node) -> Self {
        self.value = Some(n);
        self
    }

    pub fn build(self, graph: &mut Graph) -> Node {
        let n = graph.make_node(Opcode::Return);
        if let Some(v) = self.value {
            graph.append_value_input(n, v);
        }
        n
    }
}

pub struct LoopBuilder {
    last_ctrl: Node,
    condition: Node,
}

impl LoopBuilder {
    pub fn build(self, graph: &mut Graph) -> Node {
        let if_node = if_stmt(self.condition).build(graph);
        let if_true = if_branch(if_node, true).build(graph);
        let _if_false = if_branch(if_node, false).build(graph);
        // The backedge always sits behind the entry control.
        let loop_node = graph.make_node(Opcode::Loop);
        graph.append_control_input(loop_node, self.last_ctrl);
        graph.append_control_input(loop_node, if_true);
        graph.append_control_input(if_node, loop_node);
        loop_node
    }
}

pub struct AllocaBuilder {
    size: Option<Node>,
}

impl AllocaBuilder {
    /// Allocation size in bytes. Defaults to one word.
    pub fn size(mut self, n: Node) -> Self {
        self.size = Some(n);
        self
    }

    pub fn build(self, graph: &mut Graph) -> Node {
        let size = match self.size {
            Some(n) => n,
            None => graph.intern_int(4),
        };
        let n = graph.make_node(Opcode::Alloca);
        graph.append_value_input(n, size);
        n
    }
}

pub struct MemLoadBuilder {
    base_addr: Node,
    offset: Node,
}

impl MemLoadBuilder {
    pub fn build(self, graph: &mut Graph) -> Node {
        let n = graph.make_node(Opcode::MemLoad);
        graph.append_value_input(n, self.base_addr);
        graph.append_value_input(n, self.offset);
        n
    }
}

pub struct MemStoreBuilder {
    base_addr: Node,
    offset: Node,
    src: Node,
}

impl MemStoreBuilder {
    pub fn build(self, graph: &mut Graph) -> Node {
        let n = graph.make_node(Opcode::MemStore);
        graph.append_value_input(n, self.base_addr);
        graph.append_value_input(n, self.offset);
        graph.append_value_input(n, self.src);
        n
    }
}

pub struct DlxBinBuilder {
    op: Opcode,
    immediate: bool,
    lhs: Option<Node>,
    rhs: Option<Node>,
}

impl DlxBinBuilder {
    /// Enforce that the RHS is a constant (the `..I` instruction forms).
    pub fn immediate(mut self) -> Self {
        self.immediate = true;
        self
    }

    pub fn lhs(mut self, n: Node) -> Self {
        self.lhs = Some(n);
        self
    }

    pub fn rhs(mut self, n: Node) -> Self {
        self.rhs = Some(n);
        self
    }

    pub fn build(self, graph: &mut Graph) -> Node {
        let lhs = self.lhs.expect("DLX instruction needs a LHS");
        let rhs = self.rhs.expect("DLX instruction needs a RHS");
        if self.immediate {
            assert_ne!(graph.opcode(lhs), Opcode::ConstantInt);
            assert_eq!(graph.opcode(rhs), Opcode::ConstantInt);
        }
        let n = graph.make_node(self.op);
        graph.append_value_input(n, lhs);
        graph.append_value_input(n, rhs);
        n
    }
}

pub struct DlxMemBuilder {
    op: Opcode,
    base_addr: Option<Node>,
    offset: Option<Node>,
    src: Option<Node>,
}

impl DlxMemBuilder {
    pub fn base_addr(mut self, n: Node) -> Self {
        self.base_addr = Some(n);
        self
    }

    pub fn offset(mut self, n: Node) -> Self {
        self.offset = Some(n);
        self
    }

    /// The stored value; only meaningful for the store forms.
    pub fn src(mut self, n: Node) -> Self {
        self.src = Some(n);
        self
    }

    pub fn build(self, graph: &mut Graph) -> Node {
        let base = self.base_addr.expect("memory instruction needs a base");
        let offset = self.offset.expect("memory instruction needs an offset");
        if self.op == Opcode::DLXLdW || self.op == Opcode::DLXStW {
            assert_eq!(
                graph.opcode(offset),
                Opcode::ConstantInt,
                "word-indexed form requires a constant offset"
            );
        }
        let n = graph.make_node(self.op);
        graph.append_value_input(n, base);
        graph.append_value_input(n, offset);
        match self.op {
            Opcode::DLXStW | Opcode::DLXStX => {
                let src = self.src.expect("store needs a source value");
                graph.append_value_input(n, src);
            }
            _ => assert!(self.src.is_none(), "only stores take a source value"),
        }
        n
    }
}

pub struct DlxRegisterBuilder {
    index: usize,
}

impl DlxRegisterBuilder {
    pub fn build(self, graph: &mut Graph) -> Node {
        graph.make_node(Opcode::dlx_register(self.index))
    }
}

pub struct DlxOffsetBuilder;

impl DlxOffsetBuilder {
    pub fn build(self, graph: &mut Graph) -> Node {
        graph.make_node(Opcode::DLXOffset)
    }
}

pub struct DlxRetBuilder {
    link_reg: Node,
}

impl DlxRetBuilder {
    pub fn build(self, graph: &mut Graph) -> Node {
        let n = graph.make_node(Opcode::DLXRet);
        graph.append_value_input(n, self.link_reg);
        n
    }
}

pub struct CallsiteBeginBuilder;

impl CallsiteBeginBuilder {
    pub fn build(self, graph: &mut Graph) -> Node {
        graph.make_node(Opcode::VirtDLXCallsiteBegin)
    }
}

pub struct CallsiteEndBuilder {
    begin: Node,
}

impl CallsiteEndBuilder {
    pub fn build(self, graph: &mut Graph) -> Node {
        assert_eq!(graph.opcode(self.begin), Opcode::VirtDLXCallsiteBegin);
        let n = graph.make_node(Opcode::VirtDLXCallsiteEnd);
        graph.append_effect_input(n, self.begin);
        n
    }
}

pub struct PassParamBuilder {
    value: Node,
    begin: Node,
}

impl PassParamBuilder {
    pub fn build(self, graph: &mut Graph) -> Node {
        assert_eq!(graph.opcode(self.begin), Opcode::VirtDLXCallsiteBegin);
        let n = graph.make_node(Opcode::VirtDLXPassParam);
        graph.append_value_input(n, self.value);
        graph.append_effect_input(n, self.begin);
        n
    }
}
