//! End-to-end runs: raw sequences through mapping, instantiation and the
//! dispatch loop.

use std::sync::Mutex;

use compiler::{Program, Report};
use ir::{BlueprintKind, CType, Instr, Pragma, Register, Sequence};
use vm::{execute, MemChecker, ThreadContext, TrackedChecker};

// emitter layout: blueprint, blueprintsize, stacksize, signature,
// bodystart, body, end

fn open(seq: &mut Sequence, kind: BlueprintKind, name: &str) -> u32 {
    let sref = seq.intern(name);
    let at = seq.emit(Instr::Blueprint {
        kind,
        name: sref,
        lvid: 0,
    });
    seq.emit(Instr::Pragma(Pragma::BlueprintSize { size: 0 }));
    at
}

fn close(seq: &mut Sequence, at: u32) {
    seq.emit(Instr::End);
    let size = seq.len() - at;
    seq.patch(at + 1, Instr::Pragma(Pragma::BlueprintSize { size }));
}

fn open_funcdef(seq: &mut Sequence, name: &str, stacksize: u32) -> u32 {
    let at = open(seq, BlueprintKind::Funcdef, name);
    seq.emit(Instr::Stacksize { count: stacksize });
    at
}

fn param(seq: &mut Sequence, name: &str, lvid: u32, typename: &str) {
    let sref = seq.intern(name);
    seq.emit(Instr::Blueprint {
        kind: BlueprintKind::Param,
        name: sref,
        lvid,
    });
    if !typename.is_empty() {
        let tref = seq.intern(typename);
        seq.emit(Instr::Identify {
            lvid,
            self_lvid: 0,
            name: tref,
        });
    }
}

fn identify(seq: &mut Sequence, lvid: u32, name: &str) {
    let sref = seq.intern(name);
    seq.emit(Instr::Identify {
        lvid,
        self_lvid: 0,
        name: sref,
    });
}

fn intrinsic(seq: &mut Sequence, lvid: u32, name: &str) {
    let sref = seq.intern(name);
    seq.emit(Instr::Intrinsic {
        lvid,
        id: 0,
        name: sref,
    });
}

fn compile(seq: Sequence) -> Program {
    let mut program = Program::default();
    let mut report = Report::new();
    program.load(&mut report, seq).expect("mapping");
    program
        .instantiate_entrypoint(&mut report, "main")
        .expect("instantiation");
    assert!(!report.has_errors(), "{report}");
    program
}

#[test]
fn arithmetic_reaches_the_exit_code() {
    let mut seq = Sequence::new();
    let main = open_funcdef(&mut seq, "main", 8);
    seq.emit(Instr::Pragma(Pragma::BodyStart));
    seq.emit(Instr::StoreConstant { lvid: 3, value: 6 });
    seq.emit(Instr::StoreConstant { lvid: 4, value: 7 });
    seq.emit(Instr::Push { lvid: 3, name: 0 });
    seq.emit(Instr::Push { lvid: 4, name: 0 });
    intrinsic(&mut seq, 5, "mul");
    seq.emit(Instr::Ret { lvid: 5 });
    close(&mut seq, main);

    let program = compile(seq);
    assert_eq!(execute(&program), 42);
}

#[test]
fn function_calls_have_isolated_frames() {
    let mut seq = Sequence::new();
    let bump = open_funcdef(&mut seq, "bump", 8);
    param(&mut seq, "x", 2, "__u64");
    seq.emit(Instr::Pragma(Pragma::BodyStart));
    seq.emit(Instr::StoreConstant { lvid: 3, value: 1 });
    seq.emit(Instr::Push { lvid: 2, name: 0 });
    seq.emit(Instr::Push { lvid: 3, name: 0 });
    intrinsic(&mut seq, 4, "add");
    seq.emit(Instr::Ret { lvid: 4 });
    close(&mut seq, bump);

    let main = open_funcdef(&mut seq, "main", 8);
    seq.emit(Instr::Pragma(Pragma::BodyStart));
    seq.emit(Instr::StoreConstant { lvid: 3, value: 41 });
    identify(&mut seq, 4, "bump");
    seq.emit(Instr::Push { lvid: 3, name: 0 });
    seq.emit(Instr::Call {
        lvid: 2,
        func: 4,
        instanceid: u32::MAX,
    });
    seq.emit(Instr::Ret { lvid: 2 });
    close(&mut seq, main);

    let program = compile(seq);
    assert_eq!(execute(&program), 42);
}

#[test]
fn backward_jumps_drive_loops() {
    let mut seq = Sequence::new();
    let main = open_funcdef(&mut seq, "main", 10);
    seq.emit(Instr::Pragma(Pragma::BodyStart));
    seq.emit(Instr::StoreConstant { lvid: 3, value: 0 });
    seq.emit(Instr::StoreConstant { lvid: 4, value: 5 });
    seq.emit(Instr::Label { id: 1 });
    seq.emit(Instr::Push { lvid: 3, name: 0 });
    seq.emit(Instr::Push { lvid: 4, name: 0 });
    intrinsic(&mut seq, 5, "lt");
    seq.emit(Instr::Jz { lvid: 5, label: 2 });
    seq.emit(Instr::StoreConstant { lvid: 6, value: 1 });
    seq.emit(Instr::Push { lvid: 3, name: 0 });
    seq.emit(Instr::Push { lvid: 6, name: 0 });
    intrinsic(&mut seq, 3, "add");
    seq.emit(Instr::Jmp { label: 1 });
    seq.emit(Instr::Label { id: 2 });
    seq.emit(Instr::Ret { lvid: 3 });
    close(&mut seq, main);

    let program = compile(seq);
    assert_eq!(execute(&program), 5);
}

#[test]
fn failed_assertions_abort_with_a_fault() {
    let mut seq = Sequence::new();
    let main = open_funcdef(&mut seq, "main", 5);
    seq.emit(Instr::Pragma(Pragma::BodyStart));
    seq.emit(Instr::StoreConstant { lvid: 3, value: 0 });
    seq.emit(Instr::Push { lvid: 3, name: 0 });
    intrinsic(&mut seq, 4, "assert");
    close(&mut seq, main);

    let program = compile(seq);
    assert_eq!(execute(&program), compiler::config::EXIT_INTERNAL_FAULT);
}

#[test]
fn division_by_zero_aborts() {
    let mut seq = Sequence::new();
    let main = open_funcdef(&mut seq, "main", 8);
    seq.emit(Instr::Pragma(Pragma::BodyStart));
    seq.emit(Instr::StoreConstant { lvid: 3, value: 1 });
    seq.emit(Instr::StoreConstant { lvid: 4, value: 0 });
    seq.emit(Instr::Push { lvid: 3, name: 0 });
    seq.emit(Instr::Push { lvid: 4, name: 0 });
    intrinsic(&mut seq, 5, "div");
    seq.emit(Instr::Ret { lvid: 5 });
    close(&mut seq, main);

    let program = compile(seq);
    assert_eq!(execute(&program), compiler::config::EXIT_INTERNAL_FAULT);
}

#[test]
fn unbounded_recursion_exhausts_the_frame_budget() {
    let mut seq = Sequence::new();
    let spin = open_funcdef(&mut seq, "spin", 6);
    param(&mut seq, "n", 2, "__u64");
    identify(&mut seq, 1, "__u64");
    seq.emit(Instr::Pragma(Pragma::BodyStart));
    identify(&mut seq, 4, "spin");
    seq.emit(Instr::Push { lvid: 2, name: 0 });
    seq.emit(Instr::Call {
        lvid: 3,
        func: 4,
        instanceid: u32::MAX,
    });
    seq.emit(Instr::Ret { lvid: 3 });
    close(&mut seq, spin);

    let main = open_funcdef(&mut seq, "main", 6);
    seq.emit(Instr::Pragma(Pragma::BodyStart));
    seq.emit(Instr::StoreConstant { lvid: 3, value: 1 });
    identify(&mut seq, 4, "spin");
    seq.emit(Instr::Push { lvid: 3, name: 0 });
    seq.emit(Instr::Call {
        lvid: 2,
        func: 4,
        instanceid: u32::MAX,
    });
    close(&mut seq, main);

    let program = compile(seq);
    assert_eq!(execute(&program), compiler::config::EXIT_INTERNAL_FAULT);
}

#[test]
fn object_lifecycle_is_leak_free() {
    let mut seq = Sequence::new();
    let class = open(&mut seq, BlueprintKind::Class, "Point");
    let x = open(&mut seq, BlueprintKind::Vardef, "x");
    identify(&mut seq, 1, "__u64");
    close(&mut seq, x);
    let y = open(&mut seq, BlueprintKind::Vardef, "y");
    identify(&mut seq, 1, "__u64");
    close(&mut seq, y);
    close(&mut seq, class);

    let main = open_funcdef(&mut seq, "main", 4);
    seq.emit(Instr::Pragma(Pragma::BodyStart));
    identify(&mut seq, 3, "Point");
    seq.emit(Instr::Call {
        lvid: 2,
        func: 3,
        instanceid: u32::MAX,
    });
    close(&mut seq, main);

    let program = compile(seq);
    let mut context = ThreadContext::new(&program, TrackedChecker::new());
    let value = context.run_entry().expect("clean run");
    assert_eq!(value, Register::ZERO);
    assert_eq!(context.checker.leaked(), 0, "live allocations left behind");
}

/// A class boxing `__i32` with its raw value in field 0.
fn boxed_i32_class(seq: &mut Sequence, name: &str) {
    let class = open(seq, BlueprintKind::Class, name);
    let alias = seq.intern("__i32");
    seq.emit(Instr::Pragma(Pragma::BuiltinAlias { name: alias }));
    let value = open(seq, BlueprintKind::Vardef, "value");
    identify(seq, 1, "__i32");
    close(seq, value);
    close(seq, class);
}

#[test]
fn scalar_assignment_boxes_into_the_class() {
    let mut seq = Sequence::new();
    boxed_i32_class(&mut seq, "Int");

    let main = open_funcdef(&mut seq, "main", 10);
    seq.emit(Instr::Pragma(Pragma::BodyStart));
    identify(&mut seq, 3, "Int");
    seq.emit(Instr::Call {
        lvid: 2,
        func: 3,
        instanceid: u32::MAX,
    });
    seq.emit(Instr::StoreConstant { lvid: 4, value: 5 });
    seq.emit(Instr::Assign {
        lhs: 2,
        rhs: 4,
        dispose_lhs: true,
    });
    // read the assigned value back through the unboxing path
    seq.emit(Instr::StoreConstant { lvid: 5, value: 0 });
    seq.emit(Instr::Push { lvid: 2, name: 0 });
    seq.emit(Instr::Push { lvid: 5, name: 0 });
    intrinsic(&mut seq, 6, "add");
    seq.emit(Instr::Ret { lvid: 6 });
    close(&mut seq, main);

    let program = compile(seq);
    let mut context = ThreadContext::new(&program, TrackedChecker::new());
    let value = context.run_entry().expect("clean run");
    assert_eq!(value.as_u64(), 5);
    assert_eq!(context.checker.leaked(), 0, "live allocations left behind");
}

fn box_roundtrip(value: u64) -> u64 {
    let mut seq = Sequence::new();
    boxed_i32_class(&mut seq, "Int");

    // the call site boxes the raw argument, the return unboxes it
    let keep = open_funcdef(&mut seq, "keep", 8);
    param(&mut seq, "v", 2, "Int");
    identify(&mut seq, 1, "__i32");
    seq.emit(Instr::Pragma(Pragma::BodyStart));
    seq.emit(Instr::Ret { lvid: 2 });
    close(&mut seq, keep);

    let main = open_funcdef(&mut seq, "main", 8);
    seq.emit(Instr::Pragma(Pragma::BodyStart));
    seq.emit(Instr::StoreConstant { lvid: 3, value });
    identify(&mut seq, 4, "keep");
    seq.emit(Instr::Push { lvid: 3, name: 0 });
    seq.emit(Instr::Call {
        lvid: 2,
        func: 4,
        instanceid: u32::MAX,
    });
    seq.emit(Instr::Ret { lvid: 2 });
    close(&mut seq, main);

    let program = compile(seq);
    let mut context = ThreadContext::new(&program, TrackedChecker::new());
    let result = context.run_entry().expect("clean run");
    assert_eq!(context.checker.leaked(), 0, "live allocations left behind");
    result.as_u64()
}

#[test]
fn boxing_roundtrips_full_bit_patterns() {
    // boxes move whole registers: sign-extended negatives survive intact
    for value in [5, (i32::MIN as i64) as u64, u64::MAX] {
        assert_eq!(box_roundtrip(value), value);
    }
}

#[test]
fn self_assignment_keeps_the_object_alive() {
    let mut seq = Sequence::new();
    let class = open(&mut seq, BlueprintKind::Class, "Point");
    let x = open(&mut seq, BlueprintKind::Vardef, "x");
    identify(&mut seq, 1, "__u64");
    close(&mut seq, x);
    close(&mut seq, class);

    let main = open_funcdef(&mut seq, "main", 4);
    seq.emit(Instr::Pragma(Pragma::BodyStart));
    identify(&mut seq, 3, "Point");
    seq.emit(Instr::Call {
        lvid: 2,
        func: 3,
        instanceid: u32::MAX,
    });
    // acquire-before-release: this must not free the object early
    seq.emit(Instr::Assign {
        lhs: 2,
        rhs: 2,
        dispose_lhs: true,
    });
    close(&mut seq, main);

    let program = compile(seq);
    let mut context = ThreadContext::new(&program, TrackedChecker::new());
    let value = context.run_entry().expect("clean run");
    assert_eq!(value, Register::ZERO);
    assert_eq!(context.checker.leaked(), 0, "live allocations left behind");
}

static DROPS: Mutex<Vec<u64>> = Mutex::new(Vec::new());

fn host_record_drop(args: &[Register]) -> Register {
    DROPS.lock().unwrap().push(args[0].as_u64());
    Register::ZERO
}

/// A class whose user `^dispose` reports `tag` to the host.
fn tagged_class(seq: &mut Sequence, name: &str, tag: u64) {
    let class = open(seq, BlueprintKind::Class, name);
    let dtor = open_funcdef(seq, "^dispose", 6);
    param(seq, "self", 2, "");
    seq.emit(Instr::Pragma(Pragma::BodyStart));
    seq.emit(Instr::StoreConstant { lvid: 3, value: tag });
    seq.emit(Instr::Push { lvid: 3, name: 0 });
    intrinsic(seq, 4, "drop.note");
    close(seq, dtor);
    close(seq, class);
}

#[test]
fn locals_are_released_newest_first() {
    let mut seq = Sequence::new();
    tagged_class(&mut seq, "First", 1);
    tagged_class(&mut seq, "Second", 2);
    tagged_class(&mut seq, "Third", 3);

    let main = open_funcdef(&mut seq, "main", 10);
    seq.emit(Instr::Pragma(Pragma::BodyStart));
    identify(&mut seq, 6, "First");
    seq.emit(Instr::Call {
        lvid: 3,
        func: 6,
        instanceid: u32::MAX,
    });
    identify(&mut seq, 7, "Second");
    seq.emit(Instr::Call {
        lvid: 4,
        func: 7,
        instanceid: u32::MAX,
    });
    identify(&mut seq, 8, "Third");
    seq.emit(Instr::Call {
        lvid: 5,
        func: 8,
        instanceid: u32::MAX,
    });
    close(&mut seq, main);

    let mut program = Program::default();
    program
        .intrinsics
        .register("drop.note", &[CType::U64], CType::Void, host_record_drop);
    let mut report = Report::new();
    program.load(&mut report, seq).expect("mapping");
    program
        .instantiate_entrypoint(&mut report, "main")
        .expect("instantiation");
    assert!(!report.has_errors(), "{report}");

    DROPS.lock().unwrap().clear();
    let mut context = ThreadContext::new(&program, TrackedChecker::new());
    context.run_entry().expect("clean run");
    assert_eq!(context.checker.leaked(), 0, "live allocations left behind");
    assert_eq!(*DROPS.lock().unwrap(), [3, 2, 1]);
}

#[test]
fn distinct_argument_types_create_distinct_instances() {
    let mut seq = Sequence::new();
    let class = open(&mut seq, BlueprintKind::Class, "Point");
    let x = open(&mut seq, BlueprintKind::Vardef, "x");
    identify(&mut seq, 1, "__u64");
    close(&mut seq, x);
    close(&mut seq, class);

    let keep = open_funcdef(&mut seq, "keep", 6);
    param(&mut seq, "v", 2, "");
    seq.emit(Instr::Pragma(Pragma::BodyStart));
    seq.emit(Instr::Ret { lvid: 2 });
    close(&mut seq, keep);

    let main = open_funcdef(&mut seq, "main", 12);
    seq.emit(Instr::Pragma(Pragma::BodyStart));
    seq.emit(Instr::StoreConstant { lvid: 3, value: 7 });
    identify(&mut seq, 4, "keep");
    seq.emit(Instr::Push { lvid: 3, name: 0 });
    seq.emit(Instr::Call {
        lvid: 5,
        func: 4,
        instanceid: u32::MAX,
    });
    identify(&mut seq, 6, "Point");
    seq.emit(Instr::Call {
        lvid: 7,
        func: 6,
        instanceid: u32::MAX,
    });
    identify(&mut seq, 8, "keep");
    seq.emit(Instr::Push { lvid: 7, name: 0 });
    seq.emit(Instr::Call {
        lvid: 9,
        func: 8,
        instanceid: u32::MAX,
    });
    seq.emit(Instr::Ret { lvid: 5 });
    close(&mut seq, main);

    let program = compile(seq);
    let found = program.atoms.lookup(program.atoms.root, "keep");
    assert_eq!(found.len(), 1);
    let instances = program
        .atoms
        .get(found[0])
        .map_or(0, |a| a.instances.len());
    assert_eq!(instances, 2, "one instance per concrete argument type");

    let mut context = ThreadContext::new(&program, TrackedChecker::new());
    let value = context.run_entry().expect("clean run");
    assert_eq!(value.as_u64(), 7);
    assert_eq!(context.checker.leaked(), 0, "live allocations left behind");
}

#[test]
fn interior_nul_truncates_stored_text() {
    let mut seq = Sequence::new();
    let main = open_funcdef(&mut seq, "main", 6);
    seq.emit(Instr::Pragma(Pragma::BodyStart));
    let text = seq.intern("ab\0cd");
    seq.emit(Instr::StoreText { lvid: 3, text });
    seq.emit(Instr::Cstrlen { lvid: 4, ptr: 3 });
    seq.emit(Instr::Ret { lvid: 4 });
    close(&mut seq, main);

    let program = compile(seq);
    assert_eq!(execute(&program), 2);
}

fn host_bump(args: &[Register]) -> Register {
    Register::from_u64(args[0].as_u64() + 1)
}

#[test]
fn host_intrinsics_marshal_by_declared_kind() {
    let mut seq = Sequence::new();
    let main = open_funcdef(&mut seq, "main", 5);
    seq.emit(Instr::Pragma(Pragma::BodyStart));
    seq.emit(Instr::StoreConstant { lvid: 3, value: 0x1ff });
    seq.emit(Instr::Push { lvid: 3, name: 0 });
    intrinsic(&mut seq, 4, "bump8");
    seq.emit(Instr::Ret { lvid: 4 });
    close(&mut seq, main);

    let mut program = Program::default();
    program
        .intrinsics
        .register("bump8", &[CType::U8], CType::U64, host_bump);
    let mut report = Report::new();
    program.load(&mut report, seq).expect("mapping");
    program
        .instantiate_entrypoint(&mut report, "main")
        .expect("instantiation");
    assert!(!report.has_errors(), "{report}");

    // 0x1ff is clipped to 0xff before the callback sees it
    assert_eq!(execute(&program), 0x100);
}
