//! Overload resolution.
//!
//! Signature matching alone does not decide a call: when several
//! candidates remain compatible, each one is speculatively instantiated
//! and candidates whose bodies fail to type-check are eliminated. The
//! call is ambiguous only if more than one survives that.

use log::trace;

use crate::atoms::{Atom, AtomId};
use crate::report::{CResult, Failed, Level, Report};
use crate::types::{Classdef, TypeCheck};

use super::{check_declared, instantiate_atom, Build, InstantiateRequest};

/// One pushed call-site argument.
#[derive(Debug, Clone)]
pub struct CallArg {
    pub lvid: u32,
    /// Empty for positional arguments.
    pub name: String,
    pub cdef: Classdef,
}

struct Candidate {
    atomid: AtomId,
    ordered: Vec<CallArg>,
    perfect: bool,
}

/// Pick exactly one callee among `candidates` for the given arguments.
/// Returns the winner and the arguments reordered into declared
/// parameter order (named arguments resolved to their slots).
pub fn resolve_call(
    build: &mut Build,
    candidates: &[AtomId],
    args: &[CallArg],
) -> CResult<(AtomId, Vec<CallArg>)> {
    debug_assert!(!candidates.is_empty());
    if args.len() > crate::config::MAX_PUSHED_PARAMS {
        build.report.error(format!(
            "too many call arguments ({}, limit {})",
            args.len(),
            crate::config::MAX_PUSHED_PARAMS
        ));
        return Err(Failed);
    }

    let mut suitable: Vec<Candidate> = Vec::new();
    let mut rejected: Vec<(AtomId, String)> = Vec::new();
    for &atomid in candidates {
        let Some(atom) = build.atoms.get(atomid) else {
            continue;
        };
        if !atom.is_funcdef() {
            rejected.push((atomid, "not callable".to_owned()));
            continue;
        }
        match order_args(build, atom, args) {
            Ok((ordered, perfect)) => suitable.push(Candidate {
                atomid,
                ordered,
                perfect,
            }),
            Err(reason) => rejected.push((atomid, reason)),
        }
    }

    let name = build.atoms.full_name(candidates[0]);
    if suitable.is_empty() {
        let msg = build
            .report
            .error(format!("cannot call '{name}': no suitable overload"));
        for (atomid, reason) in &rejected {
            msg.entry(Level::Hint, format!("candidate atom:{atomid}: {reason}"));
        }
        return Err(Failed);
    }
    if suitable.len() == 1 {
        let winner = suitable.pop().unwrap();
        return Ok((winner.atomid, winner.ordered));
    }

    // a unique perfect match beats any number of convertible matches
    let perfect: Vec<usize> = suitable
        .iter()
        .enumerate()
        .filter(|(_, c)| c.perfect)
        .map(|(i, _)| i)
        .collect();
    if perfect.len() == 1 {
        let winner = suitable.swap_remove(perfect[0]);
        return Ok((winner.atomid, winner.ordered));
    }

    // tie: instantiate each candidate and keep the ones that type-check
    trace!("overload tie on '{name}': trying {} candidates", suitable.len());
    let mut survivors: Vec<Candidate> = Vec::new();
    for candidate in suitable {
        let req = InstantiateRequest {
            atomid: candidate.atomid,
            params: candidate.ordered.iter().map(|a| a.cdef.clone()).collect(),
            tmplparams: Vec::new(),
        };
        // diagnostics from failed attempts are discarded; the failure is
        // recorded in the candidate's cache either way
        let saved = core::mem::replace(build.report, Report::new());
        let outcome = instantiate_atom(build, &req);
        *build.report = saved;
        if outcome.is_ok() {
            survivors.push(candidate);
        }
    }
    match survivors.len() {
        1 => {
            let winner = survivors.pop().unwrap();
            Ok((winner.atomid, winner.ordered))
        }
        0 => {
            build.report.error(format!(
                "cannot call '{name}': no overload can be instantiated for these arguments"
            ));
            Err(Failed)
        }
        _ => {
            let msg = build.report.error(format!("ambiguous call to '{name}'"));
            for candidate in &survivors {
                msg.entry(
                    Level::Hint,
                    format!("matches candidate atom:{}", candidate.atomid),
                );
            }
            Err(Failed)
        }
    }
}

/// Map arguments onto one candidate's declared parameters. Returns the
/// reordered list and whether every parameter matched strictly.
fn order_args(build: &Build, atom: &Atom, args: &[CallArg]) -> Result<(Vec<CallArg>, bool), String> {
    let decls = &atom.parameters;
    if args.len() > decls.len() {
        return Err(format!(
            "takes {} argument(s), got {}",
            decls.len(),
            args.len()
        ));
    }
    let mut slots: Vec<Option<CallArg>> = vec![None; decls.len()];
    let mut next = 0usize;
    for arg in args {
        let index = if arg.name.is_empty() {
            while next < decls.len() && slots[next].is_some() {
                next += 1;
            }
            if next >= decls.len() {
                return Err("too many positional arguments".to_owned());
            }
            next
        } else {
            match decls.iter().position(|d| d.name == arg.name) {
                Some(i) => i,
                None => return Err(format!("no parameter named '{}'", arg.name)),
            }
        };
        if slots[index].is_some() {
            return Err(format!("parameter '{}' given twice", decls[index].name));
        }
        slots[index] = Some(arg.clone());
    }

    let mut ordered = Vec::with_capacity(decls.len());
    let mut perfect = true;
    for (slot, decl) in slots.into_iter().zip(decls) {
        let Some(arg) = slot else {
            return Err(format!("missing argument '{}'", decl.name));
        };
        match check_declared(build, atom.atomid, &decl.typename, &arg.cdef) {
            TypeCheck::None => {
                return Err(format!(
                    "parameter '{}': expected '{}', got '{}'",
                    decl.name, decl.typename, arg.cdef
                ))
            }
            TypeCheck::Equal => perfect = false,
            TypeCheck::StrictEqual => {}
        }
        ordered.push(arg);
    }
    Ok((ordered, perfect))
}
