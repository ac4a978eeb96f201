//! Source-shaped programs taken from the builder facade through the whole
//! pipeline.

use gross_codegen::graph::{graph, Opcode};
use gross_codegen::Context;
use gross_frontend::FunctionGraphBuilder;

// if a < 0 then let b <- 1 else let b <- 2 fi; return b
#[test]
fn branchy_function_compiles() {
    let mut g = graph();
    let mut fb = FunctionGraphBuilder::new(&mut g, "pick", &["a"]);
    let a = fb.arguments()[0];
    let b = fb.declare_var("b");

    let a_read = fb.read_var(a);
    let zero = fb.const_int(0);
    let cond = fb.bin_op(Opcode::BinLt, a_read, zero);
    fb.begin_if(cond);
    let one = fb.const_int(1);
    fb.assign_var(b, one);
    fb.begin_else();
    let two = fb.const_int(2);
    fb.assign_var(b, two);
    fb.end_if();
    let result = fb.read_var(b);
    fb.ret(Some(result));
    fb.finish();

    let mut ctx = Context::new();
    let compiled = ctx.compile(&mut g).expect("compilation failed");
    assert_eq!(compiled.len(), 1);
    let func = &compiled[0];

    // entry, two arms, the join, and the exit block.
    assert_eq!(func.schedule.rpo_blocks().len(), 5);

    // The entry ends in a conditional DLX branch.
    let entry = func.schedule.entry_block();
    let last = *func.schedule.block_nodes(entry).last().unwrap();
    assert!(g.opcode(last).is_dlx_terminate());

    // Nothing source-level or virtual survives.
    for n in func.schedule.rpo_nodes() {
        let op = g.opcode(n);
        assert!(
            !op.is_src_decl() && !op.is_src_access() && op != Opcode::SrcAssignStmt,
            "source-level node {} survived",
            op
        );
        assert!(
            op != Opcode::Phi && op != Opcode::Merge,
            "bookkeeping node {} survived",
            op
        );
    }
}

// let i <- 0; while i < 10 do let i <- i + 1 od; return i
#[test]
fn counting_loop_compiles() {
    let mut g = graph();
    let mut fb = FunctionGraphBuilder::new(&mut g, "count", &[]);
    let i = fb.declare_var("i");
    let zero = fb.const_int(0);
    fb.assign_var(i, zero);

    fb.begin_while();
    let i_read = fb.read_var(i);
    let ten = fb.const_int(10);
    let cond = fb.bin_op(Opcode::BinLt, i_read, ten);
    fb.enter_loop(cond);
    let i_body = fb.read_var(i);
    let one = fb.const_int(1);
    let inc = fb.bin_op(Opcode::BinAdd, i_body, one);
    fb.assign_var(i, inc);
    fb.end_while();

    let after = fb.read_var(i);
    fb.ret(Some(after));
    fb.finish();

    let mut ctx = Context::new();
    let compiled = ctx.compile(&mut g).expect("compilation failed");
    let func = &compiled[0];

    // The loop header closes a cycle in the CFG.
    let mut has_backedge = false;
    for &bb in func.schedule.rpo_blocks() {
        for &succ in func.schedule.succs(bb) {
            if func.schedule.rpo_index(succ) <= func.schedule.rpo_index(bb) {
                has_backedge = true;
            }
        }
    }
    assert!(has_backedge, "loop produced no backedge");

    // The increment became an immediate-form add.
    let adds: Vec<_> = func
        .schedule
        .rpo_nodes()
        .into_iter()
        .filter(|&n| g.opcode(n) == Opcode::DLXAddI)
        .collect();
    assert!(!adds.is_empty());
}

// let s <- a * 16; return s
#[test]
fn multiply_by_sixteen_becomes_shift() {
    let mut g = graph();
    let mut fb = FunctionGraphBuilder::new(&mut g, "scale", &["a"]);
    let a = fb.arguments()[0];
    let s = fb.declare_var("s");
    let a_read = fb.read_var(a);
    let sixteen = fb.const_int(16);
    let product = fb.bin_op(Opcode::BinMul, a_read, sixteen);
    fb.assign_var(s, product);
    let result = fb.read_var(s);
    fb.ret(Some(result));
    fb.finish();

    let mut ctx = Context::new();
    let compiled = ctx.compile(&mut g).expect("compilation failed");
    let func = &compiled[0];

    let shifts: Vec<_> = func
        .schedule
        .rpo_nodes()
        .into_iter()
        .filter(|&n| g.opcode(n) == Opcode::DLXLshI)
        .collect();
    assert_eq!(shifts.len(), 1);
    // Shift amount is the exponent, as a constant operand.
    let imm = g
        .value_inputs(shifts[0])
        .iter()
        .cloned()
        .find(|&i| g.opcode(i) == Opcode::ConstantInt)
        .unwrap();
    assert_eq!(g.int_value(imm), Some(4));
}

// An array round-trip: let arr[4] ; let arr[2] <- x ; return arr[2]
#[test]
fn array_accesses_lower_to_memory() {
    let mut g = graph();
    let mut fb = FunctionGraphBuilder::new(&mut g, "mem", &["x"]);
    let x = fb.arguments()[0];
    let arr = fb.declare_array("arr", &[4]);
    let x_read = fb.read_var(x);
    let two = fb.const_int(2);
    fb.assign_array(arr, &[two], x_read);
    let two_again = fb.const_int(2);
    let loaded = fb.read_array(arr, &[two_again]);
    fb.ret(Some(loaded));
    fb.finish();

    let mut ctx = Context::new();
    let compiled = ctx.compile(&mut g).expect("compilation failed");
    let func = &compiled[0];

    let nodes = func.schedule.rpo_nodes();
    let stores = nodes
        .iter()
        .filter(|&&n| g.opcode(n) == Opcode::DLXStW)
        .count();
    let loads = nodes
        .iter()
        .filter(|&&n| g.opcode(n) == Opcode::DLXLdW)
        .count();
    assert_eq!(stores, 1);
    assert_eq!(loads, 1);

    // The store addresses the frame pointer with the element's byte
    // offset.
    let store = nodes
        .iter()
        .cloned()
        .find(|&n| g.opcode(n) == Opcode::DLXStW)
        .unwrap();
    assert_eq!(g.opcode(g.value_input(store, 0)), Opcode::DLXr28);
    assert_eq!(g.int_value(g.value_input(store, 1)), Some(8));
}

// Calling a builtin threads control but no memory state.
#[test]
fn builtin_call_site_expands() {
    let mut g = graph();
    let stubs = gross_frontend::declare_builtins(&mut g);
    let output_num = stubs
        .iter()
        .find(|(name, _)| name == "OutputNum")
        .map(|&(_, stub)| stub)
        .unwrap();

    let mut fb = FunctionGraphBuilder::new(&mut g, "say", &["v"]);
    let v = fb.arguments()[0];
    let v_read = fb.read_var(v);
    let call = fb.call(output_num, &[v_read]);
    let _ = call;
    fb.ret(None);
    fb.finish();

    let mut ctx = Context::new();
    let compiled = ctx.compile(&mut g).expect("compilation failed");
    // The builtin bodies are not registered; only "say" compiles.
    assert_eq!(compiled.len(), 1);
    let func = &compiled[0];

    let nodes = func.schedule.rpo_nodes();
    let passes = nodes
        .iter()
        .filter(|&&n| g.opcode(n) == Opcode::VirtDLXPassParam)
        .count();
    assert_eq!(passes, 1);
    // The callsite brackets were consumed by post-RA lowering.
    assert!(!nodes
        .iter()
        .any(|&n| g.opcode(n) == Opcode::VirtDLXCallsiteBegin
            || g.opcode(n) == Opcode::VirtDLXCallsiteEnd));
    // The call itself is still scheduled for the encoder.
    assert!(nodes.iter().any(|&n| g.opcode(n) == Opcode::Call));
}
