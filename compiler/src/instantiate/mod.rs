//! The instantiation engine.
//!
//! Atoms carry raw, unresolved opcodes; nothing executes until a concrete
//! call reaches them with concrete argument types. `instantiate_atom` is
//! the front door: it builds the signature, consults the atom's cache,
//! and on a miss walks the body through [`SequenceBuilder`], producing a
//! resolved executable sequence that is cached write-once.

mod builder;
mod closures;
mod lifecycle;
mod overload;

pub use builder::SequenceBuilder;
pub use lifecycle::instantiate_class;
pub use overload::resolve_call;

use std::rc::Rc;

use ir::CType;
use log::trace;

use crate::atoms::{AtomId, AtomKind, AtomMap, InstanceId, InstanceLookup};
use crate::intrinsics::IntrinsicCatalog;
use crate::report::{CResult, Failed, Report};
use crate::signature::Signature;
use crate::types::{Classdef, TypeCheck};

/// Shared state of one whole compilation pass.
pub struct Build<'a> {
    pub atoms: &'a mut AtomMap,
    pub intrinsics: &'a IntrinsicCatalog,
    pub report: &'a mut Report,
    /// Atoms whose bodies are currently being walked, innermost last.
    /// Cycles never grow this unboundedly: a recursive call hits the
    /// reserved cache entry instead of walking the body again.
    pub stack: Vec<AtomId>,
    /// Emit unused-variable warnings.
    pub warn_unused: bool,
}

impl<'a> Build<'a> {
    pub fn new(
        atoms: &'a mut AtomMap,
        intrinsics: &'a IntrinsicCatalog,
        report: &'a mut Report,
    ) -> Self {
        Self {
            atoms,
            intrinsics,
            report,
            stack: Vec::new(),
            warn_unused: true,
        }
    }
}

/// One instantiation demand: a funcdef atom plus the resolved types of
/// the arguments at the call site (in declared parameter order).
#[derive(Debug, Clone, Default)]
pub struct InstantiateRequest {
    pub atomid: AtomId,
    pub params: Vec<Classdef>,
    pub tmplparams: Vec<Classdef>,
}

/// Instantiate `req.atomid` for the given argument types, reusing the
/// cached instance when one exists. Returns the instance id and the
/// resolved return type.
pub fn instantiate_atom(
    build: &mut Build,
    req: &InstantiateRequest,
) -> CResult<(InstanceId, Classdef)> {
    let signature = Signature::from_classdefs(&req.params, &req.tmplparams);
    let Some(atom) = build.atoms.get(req.atomid) else {
        build.report.ice(format!("instantiation of unknown atom {}", req.atomid));
        return Err(Failed);
    };
    if atom.kind != AtomKind::Funcdef {
        let name = build.atoms.full_name(req.atomid);
        build.report.ice(format!("'{name}' is not callable"));
        return Err(Failed);
    }
    let declared_params = atom.parameters.len();

    match atom.instances.find(&signature) {
        InstanceLookup::Found(id) => {
            let entry = atom.instances.get(id).ok_or(Failed)?;
            if entry.sequence.is_none() {
                // the entry is reserved but still being built: recursion.
                // Termination needs a provisional type, so every parameter
                // and the return type must be declared explicitly.
                return recursive_instance(build, req.atomid, id);
            }
            let rettype = entry.rettype.clone();
            return Ok((id, rettype));
        }
        InstanceLookup::Invalid => {
            // the body is not re-walked, so the original diagnostics are
            // gone; still name what failed
            let symbol = symbol_of(build.atoms, req.atomid, &req.params);
            build.report.error(format!(
                "'{symbol}' cannot be instantiated: a previous attempt failed"
            ));
            return Err(Failed);
        }
        InstanceLookup::Unknown => {}
    }

    if req.params.len() != declared_params {
        let name = build.atoms.full_name(req.atomid);
        build.report.ice(format!(
            "'{name}': got {} argument types, expected {declared_params}",
            req.params.len()
        ));
        return Err(Failed);
    }

    if build.stack.len() >= crate::config::MAX_INSTANTIATE_DEPTH {
        let name = build.atoms.full_name(req.atomid);
        build.report.error(format!(
            "instantiation depth exceeded while instantiating '{name}'"
        ));
        return Err(Failed);
    }

    let symbol = symbol_of(build.atoms, req.atomid, &req.params);
    trace!("instantiating {symbol}");

    let id = build
        .atoms
        .get_mut(req.atomid)
        .ok_or(Failed)?
        .instances
        .create(signature.clone());
    build.stack.push(req.atomid);

    let outcome = SequenceBuilder::new(build, req, id).run();

    build.stack.pop();
    let atom = build.atoms.get_mut(req.atomid).ok_or(Failed)?;
    match outcome {
        Ok((sequence, rettype)) => {
            atom.instances
                .update(id, Rc::new(sequence), rettype.clone(), symbol);
            Ok((id, rettype))
        }
        Err(Failed) => {
            atom.instances.invalidate(&signature);
            Err(Failed)
        }
    }
}

/// Resolve the provisional type of a recursive call from the declared
/// annotations alone.
fn recursive_instance(
    build: &mut Build,
    atomid: AtomId,
    id: InstanceId,
) -> CResult<(InstanceId, Classdef)> {
    let atom = build.atoms.get(atomid).ok_or(Failed)?;
    let name = build.atoms.full_name(atomid);
    let missing_param = atom.parameters.iter().any(|p| p.typename.is_empty());
    let ret_typename = atom.return_typename.clone();
    if missing_param {
        build
            .report
            .error(format!(
                "recursive call to '{name}': every parameter needs an explicit type"
            ))
            .hint("type inference cannot close the cycle");
        return Err(Failed);
    }
    let rettype = if ret_typename.is_empty() {
        Classdef::void()
    } else {
        match resolve_typename(build, atomid, &ret_typename) {
            Some(cdef) => cdef,
            None => {
                build.report.error(format!(
                    "recursive call to '{name}': unknown return type '{ret_typename}'"
                ));
                return Err(Failed);
            }
        }
    };
    Ok((id, rettype))
}

/// Resolve a declared type name in the scope of `scope`: builtin names
/// first, then template bindings of enclosing remapped generics, then the
/// atom tree.
pub fn resolve_typename(build: &Build, scope: AtomId, typename: &str) -> Option<Classdef> {
    if typename.is_empty() {
        return None;
    }
    if typename == "void" {
        return Some(Classdef::void());
    }
    if let Some(kind) = CType::from_builtin_name(typename) {
        return Some(Classdef::builtin(kind));
    }
    // template bindings shadow the atom tree
    let mut current = scope;
    while current != 0 {
        let atom = build.atoms.get(current)?;
        if let Some((_, cdef)) = atom.tmpl_bindings.iter().find(|(n, _)| n == typename) {
            return Some(cdef.clone());
        }
        current = atom.parent;
    }
    let found = build.atoms.lookup(scope, typename);
    if found.len() != 1 {
        return None;
    }
    let atom = build.atoms.get(found[0])?;
    match atom.kind {
        AtomKind::Class => Some(Classdef::object(found[0])),
        AtomKind::Typealias => {
            let target = atom.return_typename.clone();
            resolve_typename(build, atom.parent, &target)
        }
        _ => None,
    }
}

/// Check one argument type against a declared parameter type name.
/// An empty declaration accepts anything.
pub fn check_declared(
    build: &Build,
    scope: AtomId,
    typename: &str,
    arg: &Classdef,
) -> TypeCheck {
    if typename.is_empty() {
        return TypeCheck::Equal;
    }
    match resolve_typename(build, scope, typename) {
        Some(declared) => arg.compare(&declared, |a| build.atoms.boxed_kind(a)),
        None => TypeCheck::None,
    }
}

/// Human-readable symbol of one instantiation, for listings and errors.
pub fn symbol_of(atoms: &AtomMap, atomid: AtomId, params: &[Classdef]) -> String {
    use core::fmt::Write;
    let mut out = atoms.full_name(atomid);
    out.push('(');
    for (i, p) in params.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        if p.has_atom() {
            let _ = write!(out, "{}", atoms.full_name(p.atom));
        } else {
            let _ = write!(out, "{p}");
        }
    }
    out.push(')');
    out
}
