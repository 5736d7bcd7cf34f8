//! End-to-end scenarios over literal trace text: parse, decode, lower,
//! execute, slice, extract — the way the command-line tools drive the
//! crates.

use dataflow::address::AddrRange;
use dataflow::error::DataflowError;
use dataflow::executor::{InputOrigin, SymExecutor};
use dataflow::inst::Instruction;
use dataflow::parameter::{build_parameters, Parameter};
use dataflow::slicer;
use dataflow::vm::{self, VmExtractor};
use hashbrown::HashMap;
use trace::{Register, TraceReader};

fn load(text: &str) -> Vec<Instruction> {
    let records = TraceReader::new(text.as_bytes())
        .read_to_end()
        .expect("io")
        .expect("parse");
    Instruction::decode_all(records)
}

fn execute(text: &str) -> (SymExecutor, Vec<Instruction>) {
    let insts = load(text);
    let mut engine = SymExecutor::new();
    engine.run(&insts).expect("symbolic execution");
    (engine, insts)
}

fn sliced_ids(text: &str) -> Vec<usize> {
    let mut insts = load(text);
    build_parameters(&mut insts).expect("parameter lowering");
    let slice = slicer::backward_slice(&insts, insts.len() - 1);
    slice.included.iter().map(|&i| insts[i].id).collect()
}

// Scenario A: register-only propagation stays concrete.
#[test]
fn register_only_propagation() {
    let (engine, _) = execute(
        "401000;mov rax, 0x10;0,0,0,0,0,0,0,0,0,0\n\
         401004;add rax, 0x20;10,0,0,0,0,0,0,0,0,0\n",
    );
    let rax = engine.register(Register::Rax);
    let value = engine.arena().get(rax);
    assert!(value.is_concrete());
    assert_eq!(value.concrete(), Some(0x30));
}

// Scenario B: a memory read introduces exactly one input symbol that
// the final formula depends on.
#[test]
fn symbolic_input_via_memory() {
    let (engine, _) = execute(
        "401000;mov rax, qword ptr [0x1000];0,0,0,0,0,0,0,0,1000,0\n\
         401008;xor rax, 0xff;0,0,0,0,0,0,0,0,0,0\n",
    );
    let rax = engine.register(Register::Rax);
    let inputs = engine.arena().inputs(rax);
    assert_eq!(inputs.len(), 1);

    let sym = *inputs.iter().next().unwrap();
    assert_eq!(
        engine.input_origin(sym),
        Some(InputOrigin::Memory(AddrRange::new(0x1000, 0x1007)))
    );
    assert_eq!(
        engine.formula(Register::Rax).to_string(),
        format!("(xor {sym} 0xff)")
    );
}

// Scenario C: a sub-register write merges into the symbolic parent.
#[test]
fn sub_register_write_then_full_read() {
    let (engine, _) = execute("401000;mov al, 0x42;0,0,0,0,0,0,0,0,0,0\n");
    let initial = engine.register_inputs()[Register::Rax.index()].0;
    assert_eq!(
        engine.formula(Register::Rax).to_string(),
        format!("(or (and {initial} 0xffffffffffffff00) 0x42)")
    );

    // Evaluating confirms bits [8, 63] survive and the low byte is 0x42.
    let mut inputs = HashMap::new();
    inputs.insert(initial, 0x1122_3344_5566_7788);
    let got = engine
        .evaluate(engine.register(Register::Rax), &inputs)
        .unwrap();
    assert_eq!(got, 0x1122_3344_5566_7742);
}

// Scenario D: xchg swaps concretely, and the slice of final rax keeps
// the defining mov of the other register.
#[test]
fn xchg_dependency() {
    const TRACE: &str = "401000;mov rax, 0x1;0,0,0,0,0,0,0,0,0,0\n\
                         401007;mov rbx, 0x2;1,0,0,0,0,0,0,0,0,0\n\
                         40100e;xchg rax, rbx;1,2,0,0,0,0,0,0,0,0\n";

    let (engine, _) = execute(TRACE);
    let arena = engine.arena();
    assert_eq!(arena.get(engine.register(Register::Rax)).concrete(), Some(0x2));
    assert_eq!(arena.get(engine.register(Register::Rbx)).concrete(), Some(0x1));

    assert_eq!(sliced_ids(TRACE), vec![2, 3]);
}

// Scenario E: push/pop round-trips a symbolic register through memory.
#[test]
fn push_pop_round_trip() {
    const TRACE: &str = "401000;push rax;0,0,0,0,0,0,7ff8,0,0,7ff0\n\
                         401001;pop rbx;0,0,0,0,0,0,7ff0,0,7ff0,0\n";

    let (engine, _) = execute(TRACE);
    let initial_rax = engine.register_inputs()[Register::Rax.index()].0;
    assert_eq!(engine.register(Register::Rbx), initial_rax);

    assert_eq!(sliced_ids(TRACE), vec![1, 2]);
}

// Scenario F: a 7-push/7-pop pair with matching stack pointers is
// extracted as exactly one window holding all 14 instructions.
#[test]
fn vm_window_extraction() {
    let mut text = String::new();
    let mut rsp = 0x8000u64;
    let mut addr = 0x401000u64;
    for reg in ["rax", "rbx", "rcx", "rdx", "rsi", "rdi", "rbp"] {
        text.push_str(&format!(
            "{addr:x};push {reg};0,0,0,0,0,0,{rsp:x},0,0,{:x}\n",
            rsp - 8
        ));
        rsp -= 8;
        addr += 1;
    }
    // Dispatch body between the blocks.
    text.push_str(&format!("{addr:x};mov rax, 0x1;0,0,0,0,0,0,{rsp:x},0,0,0\n"));
    addr += 7;
    for reg in ["rbp", "rdi", "rsi", "rdx", "rcx", "rbx", "rax"] {
        text.push_str(&format!(
            "{addr:x};pop {reg};0,0,0,0,0,0,{rsp:x},0,{rsp:x},0\n"
        ));
        rsp += 8;
        addr += 1;
    }
    text.push_str(&format!("{addr:x};ret;0,0,0,0,0,0,{rsp:x},0,0,0\n"));

    let insts = load(&text);
    let windows = VmExtractor::default().extract(&insts);
    assert_eq!(windows.len(), 1);

    let window = &windows[0];
    assert_eq!(window.span().len(), 15); // 7 pushes, the body, 7 pops

    let mut emitted = Vec::new();
    vm::write_window(&insts, window, &mut emitted).unwrap();
    let emitted = String::from_utf8(emitted).unwrap();
    assert_eq!(emitted.lines().count(), 15);
    assert!(emitted.lines().next().unwrap().contains("push rax"));
    assert!(emitted.lines().last().unwrap().contains("pop rax"));
}

// Slicer soundness (weak form): re-running the executor on just the
// sliced instructions produces the same formula for the target
// register, modulo symbol numbering.
#[test]
fn slice_preserves_the_target_formula() {
    const TRACE: &str = "401000;mov rbx, 0x7;0,0,0,0,0,0,0,0,0,0\n\
                         401003;push rbx;0,7,0,0,0,0,7ff8,0,0,7ff0\n\
                         401004;mov rcx, 0xdead;0,7,0,0,0,0,7ff0,0,0,0\n\
                         40100b;pop rax;0,7,dead,0,0,0,7ff0,0,7ff0,0\n\
                         40100c;add rax, 0x1;7,7,dead,0,0,0,7ff8,0,0,0\n";

    let mut insts = load(TRACE);
    build_parameters(&mut insts).unwrap();
    let slice = slicer::backward_slice(&insts, insts.len() - 1);

    let mut full = SymExecutor::new();
    full.run(&insts).unwrap();

    let sliced: Vec<Instruction> = slice
        .included
        .iter()
        .map(|&i| insts[i].clone())
        .collect();
    let mut partial = SymExecutor::new();
    partial.run(&sliced).unwrap();

    assert_eq!(
        full.formula(Register::Rax).to_string(),
        partial.formula(Register::Rax).to_string()
    );
    assert_eq!(
        full.arena().get(full.register(Register::Rax)).concrete(),
        Some(0x8)
    );
}

// Parameter byte-count property over a mixed program.
#[test]
fn destination_bytes_match_observed_write_sizes() {
    let mut insts = load(
        "401000;push rax;0,0,0,0,0,0,7ff8,0,0,7ff0\n\
         401001;mov dword ptr [0x2000], ecx;0,0,0,0,0,0,0,0,0,2000\n\
         401008;mov bl, 0x5;0,0,0,0,0,0,0,0,0,0\n",
    );
    build_parameters(&mut insts).unwrap();

    let mem_dst = |i: &Instruction| {
        i.dst
            .iter()
            .filter(|p| matches!(p, Parameter::Mem(_)))
            .count()
    };
    assert_eq!(mem_dst(&insts[0]), 8);
    assert_eq!(mem_dst(&insts[1]), 4);
    assert_eq!(mem_dst(&insts[2]), 0);
    assert_eq!(insts[2].dst.len(), 1);
}

// A partially-overlapping access aborts with the offending id.
#[test]
fn partial_overlap_is_fatal() {
    let insts = load(
        "401000;mov qword ptr [0x1000], rax;0,0,0,0,0,0,0,0,0,1000\n\
         401007;mov rbx, qword ptr [0x1004];0,0,0,0,0,0,0,0,1004,0\n",
    );
    let mut engine = SymExecutor::new();
    match engine.run(&insts) {
        Err(DataflowError::UnsupportedMemoryAliasing { id, range, existing }) => {
            assert_eq!(id, 2);
            assert_eq!(range, AddrRange::new(0x1004, 0x100b));
            assert_eq!(existing, AddrRange::new(0x1000, 0x1007));
        }
        other => panic!("expected aliasing failure, got {other:?}"),
    }
}
