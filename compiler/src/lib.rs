//! Instantiation middle-end for the register IR.
//!
//! The pipeline has two passes. Mapping walks a raw sequence once and
//! turns every `blueprint` into an atom in the [`AtomMap`]; nothing is
//! type-checked yet. Instantiation then starts from an entry point and
//! resolves bodies on demand: each funcdef is specialized per concrete
//! argument signature, overloads are settled, closures capture their
//! environment, classes get their lifecycle synthesized, and the result
//! is an executable sequence per instance, cached write-once on its atom.
//!
//! [`Program`] ties the passes together and owns the outcome handed to
//! the executor.

pub mod atoms;
pub mod config;
pub mod instantiate;
pub mod intrinsics;
pub mod mapping;
pub mod report;
pub mod signature;
pub mod suggest;
pub mod types;

use std::rc::Rc;

use ir::Sequence;
use log::{debug, trace};

pub use atoms::{AtomId, AtomKind, AtomMap, InstanceId};
pub use instantiate::{instantiate_atom, Build, InstantiateRequest};
pub use intrinsics::{IntrinsicCatalog, IntrinsicFn, IntrinsicPrototype};
pub use report::{CResult, Failed, Level, Report};
pub use signature::Signature;
pub use types::{Classdef, TypeCheck};

/// One compiled program: the atom graph, the host intrinsic catalog and
/// the instantiated entry point.
pub struct Program {
    pub atoms: AtomMap,
    pub intrinsics: IntrinsicCatalog,
    pub entry: Option<(AtomId, InstanceId)>,
}

impl Default for Program {
    fn default() -> Self {
        Self::new(IntrinsicCatalog::new())
    }
}

impl Program {
    pub fn new(intrinsics: IntrinsicCatalog) -> Self {
        Self {
            atoms: AtomMap::new(),
            intrinsics,
            entry: None,
        }
    }

    /// Map one raw input sequence into the atom graph. May be called once
    /// per compilation unit; later units see the declarations of earlier
    /// ones.
    pub fn load(&mut self, report: &mut Report, seq: Sequence) -> CResult<()> {
        let shared = mapping::map_sequence(
            &mut self.atoms,
            report,
            seq,
            mapping::MappingOptions::default(),
        )?;
        trace!("mapped unit of {} instructions", shared.len());
        Ok(())
    }

    /// Find and instantiate the entry point, then remember it for the
    /// executor. The entry point must be a single parameterless funcdef.
    pub fn instantiate_entrypoint(
        &mut self,
        report: &mut Report,
        name: &str,
    ) -> CResult<(AtomId, InstanceId)> {
        let found = self.find_funcdefs(name);
        let atomid = match found.len() {
            0 => {
                report.error(format!("entry point '{name}' not found"));
                return Err(Failed);
            }
            1 => found[0],
            _ => {
                let msg = report.error(format!("entry point '{name}' is ambiguous"));
                for &atomid in &found {
                    let symbol = self.atoms.full_name(atomid);
                    msg.hint(format!("candidate '{symbol}'"));
                }
                return Err(Failed);
            }
        };
        if !self.atoms.get(atomid).is_some_and(|a| a.parameters.is_empty()) {
            report.error(format!("entry point '{name}' must take no parameters"));
            return Err(Failed);
        }

        let mut build = Build::new(&mut self.atoms, &self.intrinsics, report);
        let req = InstantiateRequest {
            atomid,
            params: Vec::new(),
            tmplparams: Vec::new(),
        };
        let (instanceid, _) = instantiate_atom(&mut build, &req)?;
        debug!("entry point '{name}' instantiated as atom:{atomid}#{instanceid}");
        self.entry = Some((atomid, instanceid));
        Ok((atomid, instanceid))
    }

    /// Whether a funcdef of that name exists, instantiated or not. Lets a
    /// host distinguish a missing entry point from a failed instantiation.
    pub fn has_entrypoint(&self, name: &str) -> bool {
        !self.find_funcdefs(name).is_empty()
    }

    /// Resolved sequence of the instantiated entry point.
    pub fn entry_sequence(&self) -> Option<Rc<Sequence>> {
        let (atomid, instanceid) = self.entry?;
        self.atoms.sequence(atomid, instanceid)
    }

    /// Every funcdef named `name`, searched through all namespaces and
    /// units (classes are excluded: methods are not entry points).
    fn find_funcdefs(&self, name: &str) -> Vec<AtomId> {
        let mut found = Vec::new();
        let mut pending = vec![self.atoms.root];
        while let Some(current) = pending.pop() {
            let Some(atom) = self.atoms.get(current) else {
                continue;
            };
            for &child in &atom.children {
                let Some(c) = self.atoms.get(child) else {
                    continue;
                };
                match c.kind {
                    AtomKind::Funcdef if c.name == name => found.push(child),
                    AtomKind::Namespace | AtomKind::Unit => pending.push(child),
                    _ => {}
                }
            }
        }
        found
    }

    /// Symbols of every finalized instantiation, for `--list` style
    /// output and tests.
    pub fn instance_listing(&self) -> Vec<String> {
        let mut symbols = Vec::new();
        for atom in self.atoms.iter() {
            for (_, entry) in atom.instances.iter() {
                if entry.sequence.is_some() && !entry.symbol.is_empty() {
                    symbols.push(entry.symbol.clone());
                }
            }
        }
        symbols.sort();
        symbols
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ir::{BlueprintKind, Instr, Op, Pragma};

    // test sequences follow the emitter layout: blueprint, blueprintsize,
    // stacksize, signature, bodystart, body, end

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

    fn compile(seq: Sequence) -> (Program, Report) {
        let mut program = Program::default();
        let mut report = Report::new();
        program.load(&mut report, seq).expect("mapping");
        (program, report)
    }

    fn has_op(seq: &Sequence, op: Op) -> bool {
        seq.iter_from(0).any(|(_, instr)| instr.op() == op)
    }

    #[test]
    fn entrypoint_is_instantiated_and_cached() {
        let mut seq = Sequence::new();
        let main = open_funcdef(&mut seq, "main", 3);
        seq.emit(Instr::Pragma(Pragma::BodyStart));
        seq.emit(Instr::StoreConstant { lvid: 2, value: 7 });
        close(&mut seq, main);

        let (mut program, mut report) = compile(seq);
        let (atomid, instanceid) = program
            .instantiate_entrypoint(&mut report, "main")
            .expect("instantiation");
        assert!(!report.has_errors(), "{report}");

        let resolved = program.atoms.sequence(atomid, instanceid).expect("sequence");
        assert!(resolved.is_executable());
        assert!(has_op(&resolved, Op::Ret));

        // a second demand hits the cache
        let again = program
            .instantiate_entrypoint(&mut report, "main")
            .expect("cached");
        assert_eq!(again, (atomid, instanceid));
        assert_eq!(program.atoms.get(atomid).unwrap().instances.len(), 1);
    }

    #[test]
    fn one_instance_per_signature() {
        let mut seq = Sequence::new();
        let id = open_funcdef(&mut seq, "id", 3);
        param(&mut seq, "x", 2, "");
        seq.emit(Instr::Pragma(Pragma::BodyStart));
        seq.emit(Instr::Ret { lvid: 2 });
        close(&mut seq, id);

        let main = open_funcdef(&mut seq, "main", 8);
        seq.emit(Instr::Pragma(Pragma::BodyStart));
        seq.emit(Instr::StoreConstant { lvid: 3, value: 5 });
        identify(&mut seq, 4, "id");
        seq.emit(Instr::Push { lvid: 3, name: 0 });
        seq.emit(Instr::Call {
            lvid: 2,
            func: 4,
            instanceid: u32::MAX,
        });
        seq.emit(Instr::StoreConstant { lvid: 6, value: 9 });
        identify(&mut seq, 7, "id");
        seq.emit(Instr::Push { lvid: 6, name: 0 });
        seq.emit(Instr::Call {
            lvid: 5,
            func: 7,
            instanceid: u32::MAX,
        });
        close(&mut seq, main);

        let (mut program, mut report) = compile(seq);
        program
            .instantiate_entrypoint(&mut report, "main")
            .expect("instantiation");
        assert!(!report.has_errors(), "{report}");

        let id_atom = program.atoms.lookup(program.atoms.root, "id")[0];
        assert_eq!(program.atoms.get(id_atom).unwrap().instances.len(), 1);
    }

    #[test]
    fn recursion_without_declared_parameter_types_is_rejected() {
        let mut seq = Sequence::new();
        let g = open_funcdef(&mut seq, "g", 5);
        param(&mut seq, "x", 2, "");
        seq.emit(Instr::Pragma(Pragma::BodyStart));
        identify(&mut seq, 4, "g");
        seq.emit(Instr::Push { lvid: 2, name: 0 });
        seq.emit(Instr::Call {
            lvid: 3,
            func: 4,
            instanceid: u32::MAX,
        });
        close(&mut seq, g);

        let main = open_funcdef(&mut seq, "main", 5);
        seq.emit(Instr::Pragma(Pragma::BodyStart));
        seq.emit(Instr::StoreConstant { lvid: 3, value: 1 });
        identify(&mut seq, 4, "g");
        seq.emit(Instr::Push { lvid: 3, name: 0 });
        seq.emit(Instr::Call {
            lvid: 2,
            func: 4,
            instanceid: u32::MAX,
        });
        close(&mut seq, main);

        let (mut program, mut report) = compile(seq);
        assert!(program.instantiate_entrypoint(&mut report, "main").is_err());
        assert!(report.to_string().contains("explicit type"));
    }

    #[test]
    fn recursion_with_declared_types_terminates() {
        let mut seq = Sequence::new();
        let f = open_funcdef(&mut seq, "fac", 6);
        param(&mut seq, "n", 2, "__u64");
        identify(&mut seq, 1, "__u64");
        seq.emit(Instr::Pragma(Pragma::BodyStart));
        identify(&mut seq, 4, "fac");
        seq.emit(Instr::Push { lvid: 2, name: 0 });
        seq.emit(Instr::Call {
            lvid: 3,
            func: 4,
            instanceid: u32::MAX,
        });
        seq.emit(Instr::Ret { lvid: 3 });
        close(&mut seq, f);

        let main = open_funcdef(&mut seq, "main", 5);
        seq.emit(Instr::Pragma(Pragma::BodyStart));
        seq.emit(Instr::StoreConstant { lvid: 3, value: 4 });
        identify(&mut seq, 4, "fac");
        seq.emit(Instr::Push { lvid: 3, name: 0 });
        seq.emit(Instr::Call {
            lvid: 2,
            func: 4,
            instanceid: u32::MAX,
        });
        close(&mut seq, main);

        let (mut program, mut report) = compile(seq);
        program
            .instantiate_entrypoint(&mut report, "main")
            .expect("instantiation");
        assert!(!report.has_errors(), "{report}");
        // one shared instance despite the self-call
        let fac = program.atoms.lookup(program.atoms.root, "fac")[0];
        assert_eq!(program.atoms.get(fac).unwrap().instances.len(), 1);
    }

    #[test]
    fn perfect_overload_beats_convertible_one() {
        let mut seq = Sequence::new();
        let typed = open_funcdef(&mut seq, "f", 3);
        param(&mut seq, "x", 2, "__u64");
        seq.emit(Instr::Pragma(Pragma::BodyStart));
        close(&mut seq, typed);

        let untyped = open_funcdef(&mut seq, "f", 3);
        param(&mut seq, "x", 2, "");
        seq.emit(Instr::Pragma(Pragma::BodyStart));
        close(&mut seq, untyped);

        let main = open_funcdef(&mut seq, "main", 8);
        seq.emit(Instr::Pragma(Pragma::BodyStart));
        seq.emit(Instr::StoreConstant { lvid: 3, value: 2 });
        seq.emit(Instr::StoreConstant { lvid: 4, value: 3 });
        // a concrete u64, not a literal
        seq.emit(Instr::Push { lvid: 3, name: 0 });
        seq.emit(Instr::Push { lvid: 4, name: 0 });
        intrinsic(&mut seq, 5, "add");
        identify(&mut seq, 6, "f");
        seq.emit(Instr::Push { lvid: 5, name: 0 });
        seq.emit(Instr::Call {
            lvid: 2,
            func: 6,
            instanceid: u32::MAX,
        });
        close(&mut seq, main);

        let (mut program, mut report) = compile(seq);
        program
            .instantiate_entrypoint(&mut report, "main")
            .expect("instantiation");
        assert!(!report.has_errors(), "{report}");

        let overloads = program.atoms.lookup(program.atoms.root, "f");
        assert_eq!(overloads.len(), 2);
        let instantiated: Vec<usize> = overloads
            .iter()
            .map(|&a| program.atoms.get(a).unwrap().instances.len())
            .collect();
        // only the strictly matching overload got built
        assert_eq!(instantiated.iter().sum::<usize>(), 1);
        let winner = overloads[instantiated.iter().position(|&n| n == 1).unwrap()];
        assert_eq!(
            program.atoms.get(winner).unwrap().parameters[0].typename,
            "__u64"
        );
    }

    #[test]
    fn unknown_identifier_gets_a_suggestion() {
        let mut seq = Sequence::new();
        let counter = open_funcdef(&mut seq, "counter", 2);
        seq.emit(Instr::Pragma(Pragma::BodyStart));
        close(&mut seq, counter);

        let main = open_funcdef(&mut seq, "main", 3);
        seq.emit(Instr::Pragma(Pragma::BodyStart));
        identify(&mut seq, 2, "countr");
        close(&mut seq, main);

        let (mut program, mut report) = compile(seq);
        assert!(program.instantiate_entrypoint(&mut report, "main").is_err());
        let text = report.to_string();
        assert!(text.contains("unknown identifier 'countr'"), "{text}");
        assert!(text.contains("counter"), "{text}");
    }

    #[test]
    fn short_circuit_and_lowers_to_conditional_jump() {
        let mut seq = Sequence::new();
        let main = open_funcdef(&mut seq, "main", 10);
        seq.emit(Instr::Pragma(Pragma::BodyStart));
        seq.emit(Instr::StoreConstant { lvid: 3, value: 1 });
        seq.emit(Instr::StoreConstant { lvid: 4, value: 2 });
        seq.emit(Instr::Push { lvid: 3, name: 0 });
        seq.emit(Instr::Push { lvid: 4, name: 0 });
        intrinsic(&mut seq, 5, "lt");
        seq.emit(Instr::Pragma(Pragma::ShortCircuit { label: 11 }));
        seq.emit(Instr::Nop);
        seq.emit(Instr::Nop);
        seq.emit(Instr::Push { lvid: 4, name: 0 });
        seq.emit(Instr::Push { lvid: 3, name: 0 });
        intrinsic(&mut seq, 6, "gt");
        seq.emit(Instr::Push { lvid: 5, name: 0 });
        seq.emit(Instr::Push { lvid: 6, name: 0 });
        intrinsic(&mut seq, 7, "and");
        seq.emit(Instr::Label { id: 11 });
        close(&mut seq, main);

        let (mut program, mut report) = compile(seq);
        let (atomid, instanceid) = program
            .instantiate_entrypoint(&mut report, "main")
            .expect("instantiation");
        assert!(!report.has_errors(), "{report}");

        let resolved = program.atoms.sequence(atomid, instanceid).unwrap();
        // the nop padding became a store plus a jump-if-false
        assert!(resolved
            .iter_from(0)
            .any(|(_, i)| i == Instr::Jz { lvid: 7, label: 11 }));
        assert!(!has_op(&resolved, Op::Nop) || has_op(&resolved, Op::Jz));
    }

    #[test]
    fn class_construction_synthesizes_lifecycle() {
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

        let (mut program, mut report) = compile(seq);
        let (atomid, instanceid) = program
            .instantiate_entrypoint(&mut report, "main")
            .expect("instantiation");
        assert!(!report.has_errors(), "{report}");

        let point = program.atoms.lookup(program.atoms.root, "Point")[0];
        let info = program.atoms.get(point).unwrap().classinfo;
        assert!(info.dtor.is_some());
        assert!(info.clone.is_some());
        assert!(info.default_ctor.is_some());

        let resolved = program.atoms.sequence(atomid, instanceid).unwrap();
        assert!(has_op(&resolved, Op::Allocate));
        // the tracked instance is released when main's scope closes
        assert!(has_op(&resolved, Op::Unref));

        // the synthesized destructor itself is executable
        let (da, di) = info.dtor.unwrap();
        let dtor = program.atoms.sequence(da, di).unwrap();
        assert!(dtor.is_executable());
    }

    #[test]
    fn unused_named_variable_is_reported() {
        let mut seq = Sequence::new();
        let main = open_funcdef(&mut seq, "main", 4);
        seq.emit(Instr::Pragma(Pragma::BodyStart));
        seq.emit(Instr::StoreConstant { lvid: 3, value: 1 });
        let name = seq.intern("ignored");
        seq.emit(Instr::Namealias { lvid: 3, name });
        close(&mut seq, main);

        let (mut program, mut report) = compile(seq);
        program
            .instantiate_entrypoint(&mut report, "main")
            .expect("instantiation");
        assert_eq!(report.count(Level::Warning), 1);
        assert!(report.to_string().contains("ignored"));
    }

    #[test]
    fn entrypoint_errors_are_reported() {
        let mut seq = Sequence::new();
        let f = open_funcdef(&mut seq, "helper", 2);
        seq.emit(Instr::Pragma(Pragma::BodyStart));
        close(&mut seq, f);

        let (mut program, mut report) = compile(seq);
        assert!(program.instantiate_entrypoint(&mut report, "main").is_err());
        assert!(report.to_string().contains("not found"));
    }

    #[test]
    fn invalidated_instances_still_report_on_reuse() {
        let mut seq = Sequence::new();
        let main = open_funcdef(&mut seq, "main", 4);
        seq.emit(Instr::Pragma(Pragma::BodyStart));
        identify(&mut seq, 3, "nonesuch");
        close(&mut seq, main);

        let (mut program, mut report) = compile(seq);
        assert!(program.instantiate_entrypoint(&mut report, "main").is_err());
        assert!(report.has_errors());

        // the failure is tombstoned; a later demand must not come back
        // with an empty report
        let mut second = Report::new();
        assert!(program.instantiate_entrypoint(&mut second, "main").is_err());
        assert!(second.has_errors(), "{second}");
        assert!(second.to_string().contains("previous attempt"), "{second}");
    }

    #[test]
    fn listing_contains_finalized_symbols() {
        let mut seq = Sequence::new();
        let main = open_funcdef(&mut seq, "main", 2);
        seq.emit(Instr::Pragma(Pragma::BodyStart));
        close(&mut seq, main);

        let (mut program, mut report) = compile(seq);
        program
            .instantiate_entrypoint(&mut report, "main")
            .expect("instantiation");
        let listing = program.instance_listing();
        assert!(listing.iter().any(|s| s.starts_with("main(")), "{listing:?}");
    }
}
