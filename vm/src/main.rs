//! Demo driver.
//!
//! Assembles a small factorial unit in raw IR, compiles it through
//! mapping and instantiation, then hands the result to the executor.
//! The guest's return value becomes the process exit code.

use clap::Parser;
use compiler::{config, Program, Report};
use ir::{BlueprintKind, CType, Instr, Pragma, Register, Sequence};

#[derive(Parser)]
#[command(name = "lume", about = "Compile and run the built-in demo program")]
struct Cli {
    /// Entry point to instantiate.
    #[arg(long, default_value = "main")]
    entry: String,

    /// Print every finalized instantiation before running.
    #[arg(long)]
    list: bool,
}

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

/// fac(n: __u64): __u64 { if n < 2 return 1; return n * fac(n - 1) }
/// main { r = fac(4); print.u64(r); return r }
fn demo_unit() -> Sequence {
    let mut seq = Sequence::new();

    let fac = open(&mut seq, BlueprintKind::Funcdef, "fac");
    seq.emit(Instr::Stacksize { count: 12 });
    let n = seq.intern("n");
    seq.emit(Instr::Blueprint {
        kind: BlueprintKind::Param,
        name: n,
        lvid: 2,
    });
    identify(&mut seq, 2, "__u64");
    identify(&mut seq, 1, "__u64");
    seq.emit(Instr::Pragma(Pragma::BodyStart));
    seq.emit(Instr::StoreConstant { lvid: 4, value: 2 });
    seq.emit(Instr::Push { lvid: 2, name: 0 });
    seq.emit(Instr::Push { lvid: 4, name: 0 });
    intrinsic(&mut seq, 5, "lt");
    seq.emit(Instr::Jz { lvid: 5, label: 1 });
    seq.emit(Instr::StoreConstant { lvid: 6, value: 1 });
    seq.emit(Instr::Ret { lvid: 6 });
    seq.emit(Instr::Label { id: 1 });
    seq.emit(Instr::StoreConstant { lvid: 7, value: 1 });
    seq.emit(Instr::Push { lvid: 2, name: 0 });
    seq.emit(Instr::Push { lvid: 7, name: 0 });
    intrinsic(&mut seq, 8, "sub");
    identify(&mut seq, 9, "fac");
    seq.emit(Instr::Push { lvid: 8, name: 0 });
    seq.emit(Instr::Call {
        lvid: 10,
        func: 9,
        instanceid: u32::MAX,
    });
    seq.emit(Instr::Push { lvid: 2, name: 0 });
    seq.emit(Instr::Push { lvid: 10, name: 0 });
    intrinsic(&mut seq, 11, "mul");
    seq.emit(Instr::Ret { lvid: 11 });
    close(&mut seq, fac);

    let main = open(&mut seq, BlueprintKind::Funcdef, "main");
    seq.emit(Instr::Stacksize { count: 8 });
    seq.emit(Instr::Pragma(Pragma::BodyStart));
    seq.emit(Instr::StoreConstant { lvid: 3, value: 4 });
    identify(&mut seq, 4, "fac");
    seq.emit(Instr::Push { lvid: 3, name: 0 });
    seq.emit(Instr::Call {
        lvid: 2,
        func: 4,
        instanceid: u32::MAX,
    });
    seq.emit(Instr::Push { lvid: 2, name: 0 });
    intrinsic(&mut seq, 5, "print.u64");
    seq.emit(Instr::Ret { lvid: 2 });
    close(&mut seq, main);

    seq
}

fn host_print_u64(args: &[Register]) -> Register {
    println!("{}", args[0].as_u64());
    Register::ZERO
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let mut program = Program::default();
    program
        .intrinsics
        .register("print.u64", &[CType::U64], CType::Void, host_print_u64);

    let mut report = Report::new();
    if program.load(&mut report, demo_unit()).is_err() {
        eprint!("{report}");
        std::process::exit(config::EXIT_NOT_INSTANTIATED as i32);
    }
    if program.instantiate_entrypoint(&mut report, &cli.entry).is_err() {
        eprint!("{report}");
        let code = if program.has_entrypoint(&cli.entry) {
            config::EXIT_NOT_INSTANTIATED
        } else {
            config::EXIT_BAD_ENTRYPOINT
        };
        std::process::exit(code as i32);
    }
    eprint!("{report}");

    if cli.list {
        for symbol in program.instance_listing() {
            println!("{symbol}");
        }
    }

    std::process::exit(vm::execute(&program) as i32);
}
