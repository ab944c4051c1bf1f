//! Class instantiation and lifecycle synthesis.
//!
//! Instantiating a class resolves its member field types and guarantees
//! that a destructor, a clone operator and a default constructor exist as
//! resolved instances. Synthesized bodies are emitted directly as
//! resolved sequences; user-defined lifecycle operators are invoked from
//! the synthesized body rather than replacing it, so both compose.

use std::rc::Rc;

use ir::{Instr, Sequence};

use crate::atoms::{AtomId, AtomKind, InstanceId, InstanceLookup};
use crate::config;
use crate::report::{CResult, Failed};
use crate::signature::Signature;
use crate::types::Classdef;

use super::closures::Capture;
use super::{instantiate_atom, resolve_typename, Build, InstantiateRequest};

/// Ensure `class` is instantiated: field types resolved, lifecycle
/// operators synthesized and cached. Idempotent; re-entrant for
/// self-referential classes (the reserved cache entry breaks the cycle).
pub fn instantiate_class(build: &mut Build, class: AtomId, captures: &[Capture]) -> CResult<InstanceId> {
    let signature = Signature::new();
    {
        let Some(atom) = build.atoms.get(class) else {
            build.report.ice(format!("instantiation of unknown class atom {class}"));
            return Err(Failed);
        };
        if atom.kind != AtomKind::Class {
            let name = build.atoms.full_name(class);
            build.report.ice(format!("'{name}' is not a class"));
            return Err(Failed);
        }
        if atom.is_generic() {
            let name = build.atoms.full_name(class);
            build
                .report
                .ice(format!("generic class '{name}' must be remapped before instantiation"));
            return Err(Failed);
        }
        match atom.instances.find(&signature) {
            InstanceLookup::Found(id) => return Ok(id),
            InstanceLookup::Invalid => {
                let name = build.atoms.full_name(class);
                build.report.error(format!(
                    "class '{name}' cannot be instantiated: a previous attempt failed"
                ));
                return Err(Failed);
            }
            InstanceLookup::Unknown => {}
        }
    }

    let id = build
        .atoms
        .get_mut(class)
        .ok_or(Failed)?
        .instances
        .create(signature.clone());

    let outcome = instantiate_class_inner(build, class, captures);

    let symbol = build_symbol(build, class);
    let atom = build.atoms.get_mut(class).ok_or(Failed)?;
    match outcome {
        Ok(()) => {
            atom.instances
                .update(id, Rc::new(Sequence::new()), Classdef::object(class), symbol);
            Ok(id)
        }
        Err(Failed) => {
            build
                .atoms
                .get_mut(class)
                .ok_or(Failed)?
                .instances
                .invalidate(&signature);
            Err(Failed)
        }
    }
}

fn build_symbol(build: &Build, class: AtomId) -> String {
    build.atoms.full_name(class)
}

fn instantiate_class_inner(build: &mut Build, class: AtomId, captures: &[Capture]) -> CResult<()> {
    resolve_fields(build, class, captures)?;

    // reserve the lifecycle atoms and publish them in classinfo before
    // building their bodies, so self-referential member types find them
    let dtor = reserve_synth(build, class, config::NAME_DISPOSE, 2);
    let cloner = reserve_synth(build, class, config::NAME_CLONE, 3);
    let ctor = reserve_synth(build, class, config::NAME_DEFAULT_NEW, 1 + captures.len());
    {
        let atom = build.atoms.get_mut(class).ok_or(Failed)?;
        atom.classinfo.dtor = Some(dtor);
        atom.classinfo.clone = Some(cloner);
        atom.classinfo.default_ctor = Some(ctor);
    }

    // instantiate the classes of object fields so their destructors are
    // addressable from the synthesized bodies
    let field_atoms: Vec<AtomId> = build
        .atoms
        .get(class)
        .ok_or(Failed)?
        .field_types
        .iter()
        .filter(|c| c.has_atom())
        .map(|c| c.atom)
        .collect();
    for field_class in field_atoms {
        instantiate_class(build, field_class, &[])?;
    }

    // user-defined operators compose with the synthesized bodies
    let user_dtor = user_lifecycle(build, class, config::NAME_DISPOSE)?;
    let user_clone = user_lifecycle(build, class, config::NAME_CLONE)?;

    synth_dtor(build, class, dtor, user_dtor)?;
    synth_clone(build, class, cloner, user_clone)?;
    synth_default_ctor(build, class, ctor, captures)?;
    Ok(())
}

/// Resolve declared member types into `field_types`, honoring slots
/// pre-seeded by capture binding.
fn resolve_fields(build: &mut Build, class: AtomId, captures: &[Capture]) -> CResult<()> {
    let (children, count) = {
        let atom = build.atoms.get(class).ok_or(Failed)?;
        (atom.children.clone(), atom.classinfo.next_field_index as usize)
    };
    let mut fields = vec![Classdef::default(); count];
    for (i, field) in fields.iter_mut().enumerate() {
        if let Some(cap) = captures.iter().find(|c| c.index as usize == i) {
            *field = cap.cdef.clone();
        }
    }
    for child in children {
        let Some(atom) = build.atoms.get(child) else {
            continue;
        };
        if !atom.is_member_var() {
            continue;
        }
        let index = atom.field_index as usize;
        let captured = atom.category.captured;
        let typename = atom.return_typename.clone();
        let member = atom.name.clone();
        if !fields[index].is_any() {
            continue; // pre-seeded by a capture
        }
        if typename.is_empty() {
            if captured {
                continue; // unbound capture candidate, slot stays zeroed
            }
            let name = build.atoms.full_name(class);
            build.report.error(format!(
                "member '{member}' of '{name}' needs an explicit type"
            ));
            return Err(Failed);
        }
        match resolve_typename(build, class, &typename) {
            Some(cdef) => fields[index] = cdef,
            None => {
                let name = build.atoms.full_name(class);
                build.report.error(format!(
                    "member '{member}' of '{name}': unknown type '{typename}'"
                ));
                return Err(Failed);
            }
        }
    }
    build.atoms.get_mut(class).ok_or(Failed)?.field_types = fields;
    Ok(())
}

/// Create a synthetic funcdef child and reserve its one instance.
/// `argc` counts declared parameters including `self`.
fn reserve_synth(build: &mut Build, class: AtomId, name: &str, argc: usize) -> (AtomId, InstanceId) {
    let atomid = build.atoms.create(AtomKind::Funcdef, name, class);
    let self_cdef = Classdef::object(class);
    let mut params = vec![self_cdef; argc];
    // non-self parameter types are unknown at reservation; any is fine
    // for the cache key of a synthetic that is never overload-resolved
    for cdef in params.iter_mut().skip(1) {
        *cdef = Classdef::default();
    }
    let signature = Signature::from_classdefs(&params, &[]);
    let atom = build.atoms.get_mut(atomid).expect("freshly created atom");
    atom.category.suggestible = false;
    match name {
        config::NAME_DISPOSE => atom.category.dtor = true,
        config::NAME_CLONE => atom.category.clone = true,
        _ => atom.category.ctor = true,
    }
    atom.parameters = (0..argc)
        .map(|i| crate::atoms::ParamDecl {
            name: if i == 0 { "self".to_owned() } else { format!("arg{i}") },
            lvid: 2 + i as u32,
            typename: String::new(),
        })
        .collect();
    let id = atom.instances.create(signature);
    (atomid, id)
}

/// Locate and instantiate a user-defined lifecycle operator taking only
/// `self` (plus `other` for clone).
fn user_lifecycle(
    build: &mut Build,
    class: AtomId,
    name: &str,
) -> CResult<Option<(AtomId, InstanceId)>> {
    let candidates: Vec<AtomId> = build
        .atoms
        .find_children(class, name)
        .into_iter()
        .filter(|&id| {
            build
                .atoms
                .get(id)
                .is_some_and(|a| a.is_funcdef() && a.body.is_some())
        })
        .collect();
    let Some(&atomid) = candidates.first() else {
        return Ok(None);
    };
    let argc = build.atoms.get(atomid).ok_or(Failed)?.parameters.len();
    let mut params = vec![Classdef::object(class)];
    if argc == 2 {
        params.push(Classdef::object(class));
    }
    let req = InstantiateRequest {
        atomid,
        params,
        tmplparams: Vec::new(),
    };
    let (iid, _) = instantiate_atom(build, &req)?;
    Ok(Some((atomid, iid)))
}

/// Destructor body: run the user `^dispose` when present, then release
/// object fields in reverse declaration order.
fn synth_dtor(
    build: &mut Build,
    class: AtomId,
    slot: (AtomId, InstanceId),
    user: Option<(AtomId, InstanceId)>,
) -> CResult<()> {
    let fields = build.atoms.get(class).ok_or(Failed)?.field_types.clone();
    let mut seq = Sequence::new();
    seq.emit(Instr::Stacksize { count: 4 });
    if let Some((ua, ui)) = user {
        seq.emit(Instr::Push { lvid: 2, name: 0 });
        seq.emit(Instr::Call {
            lvid: 3,
            func: ua,
            instanceid: ui,
        });
    }
    for (index, cdef) in fields.iter().enumerate().rev() {
        if !cdef.has_atom() {
            continue;
        }
        let (da, di) = field_dtor(build, cdef.atom)?;
        seq.emit(Instr::Fieldget {
            lvid: 3,
            self_lvid: 2,
            index: index as u32,
        });
        seq.emit(Instr::Unref {
            lvid: 3,
            atomid: da,
            instanceid: di,
        });
    }
    seq.emit(Instr::Ret { lvid: 0 });
    finalize_synth(build, class, slot, seq, config::NAME_DISPOSE)
}

/// Clone body: copy every field from `source` (slot 3) into `self`
/// (slot 2), acquiring object fields, then run the user `^clone`.
fn synth_clone(
    build: &mut Build,
    class: AtomId,
    slot: (AtomId, InstanceId),
    user: Option<(AtomId, InstanceId)>,
) -> CResult<()> {
    let fields = build.atoms.get(class).ok_or(Failed)?.field_types.clone();
    let mut seq = Sequence::new();
    seq.emit(Instr::Stacksize { count: 5 });
    for (index, cdef) in fields.iter().enumerate() {
        seq.emit(Instr::Fieldget {
            lvid: 4,
            self_lvid: 3,
            index: index as u32,
        });
        if cdef.has_atom() {
            seq.emit(Instr::Ref { lvid: 4 });
        }
        seq.emit(Instr::Fieldset {
            lvid: 4,
            self_lvid: 2,
            index: index as u32,
        });
    }
    if let Some((ua, ui)) = user {
        seq.emit(Instr::Push { lvid: 2, name: 0 });
        seq.emit(Instr::Push { lvid: 3, name: 0 });
        seq.emit(Instr::Call {
            lvid: 4,
            func: ua,
            instanceid: ui,
        });
    }
    seq.emit(Instr::Ret { lvid: 0 });
    finalize_synth(build, class, slot, seq, config::NAME_CLONE)
}

/// Default constructor body: zero every non-captured field, then store
/// the captured values handed in as extra parameters.
fn synth_default_ctor(
    build: &mut Build,
    class: AtomId,
    slot: (AtomId, InstanceId),
    captures: &[Capture],
) -> CResult<()> {
    let count = build.atoms.get(class).ok_or(Failed)?.classinfo.next_field_index;
    let ncaptures = captures.len() as u32;
    let tmp = 3 + ncaptures;
    let mut seq = Sequence::new();
    seq.emit(Instr::Stacksize { count: tmp + 1 });
    for index in 0..count {
        if captures.iter().any(|c| c.index == index) {
            continue;
        }
        seq.emit(Instr::StoreConstant { lvid: tmp, value: 0 });
        seq.emit(Instr::Fieldset {
            lvid: tmp,
            self_lvid: 2,
            index,
        });
    }
    for (i, cap) in captures.iter().enumerate() {
        let lvid = 3 + i as u32;
        if cap.cdef.has_atom() {
            seq.emit(Instr::Ref { lvid });
        }
        seq.emit(Instr::Fieldset {
            lvid,
            self_lvid: 2,
            index: cap.index,
        });
    }
    seq.emit(Instr::Ret { lvid: 0 });
    // name the capture parameters so call sites can push them by name
    {
        let atom = build.atoms.get_mut(slot.0).ok_or(Failed)?;
        for (i, cap) in captures.iter().enumerate() {
            if let Some(decl) = atom.parameters.get_mut(1 + i) {
                decl.name = cap.name.clone();
            }
        }
    }
    finalize_synth(build, class, slot, seq, config::NAME_DEFAULT_NEW)
}

fn field_dtor(build: &mut Build, field_class: AtomId) -> CResult<(AtomId, InstanceId)> {
    instantiate_class(build, field_class, &[])?;
    build
        .atoms
        .get(field_class)
        .and_then(|a| a.classinfo.dtor)
        .ok_or(Failed)
}

fn finalize_synth(
    build: &mut Build,
    class: AtomId,
    slot: (AtomId, InstanceId),
    seq: Sequence,
    name: &str,
) -> CResult<()> {
    debug_assert!(seq.is_executable());
    let symbol = format!("{}.{name}", build.atoms.full_name(class));
    let atom = build.atoms.get_mut(slot.0).ok_or(Failed)?;
    atom.instances
        .update(slot.1, Rc::new(seq), Classdef::void(), symbol);
    Ok(())
}

/// Clone the raw subtree of `class` into a fresh sequence and re-run the
/// mapping pass on it, yielding an independent atom subtree. Used for
/// generic instantiation and per-call-site functor capture sets.
pub fn clone_class(build: &mut Build, class: AtomId) -> CResult<AtomId> {
    let (src, offset, parent, name) = {
        let atom = build.atoms.get(class).ok_or(Failed)?;
        let Some(body) = &atom.body else {
            let name = build.atoms.full_name(class);
            build.report.ice(format!("class '{name}' has no mapped body"));
            return Err(Failed);
        };
        (
            Rc::clone(&body.sequence),
            body.offset,
            atom.parent,
            atom.name.clone(),
        )
    };
    let next = src.skip_blueprint(offset).map_err(|err| {
        build.report.ice(format!("cannot clone class subtree: {err}"));
        Failed
    })?;

    let mut copy = Sequence::with_capacity((next - offset) as usize);
    copy.strings = src.strings.clone();
    for at in offset..next {
        let instr = src.read(at).map_err(|err| {
            build.report.ice(format!("cannot clone class subtree: {err}"));
            Failed
        })?;
        copy.emit(instr);
    }

    let before = build.atoms.len() as AtomId;
    crate::mapping::map_sequence(
        build.atoms,
        build.report,
        copy,
        crate::mapping::MappingOptions { parent, offset: 0 },
    )?;
    // the clone is the newly created class with the original's name
    let cloned = build
        .atoms
        .find_children(parent, &name)
        .into_iter()
        .filter(|&id| id >= before)
        .find(|&id| build.atoms.get(id).is_some_and(|a| a.is_class()));
    let Some(cloned) = cloned else {
        build.report.ice(format!("clone of '{name}' not found after re-mapping"));
        return Err(Failed);
    };
    if let Some(atom) = build.atoms.get_mut(cloned) {
        atom.category.suggestible = false;
    }
    Ok(cloned)
}

/// Instantiate a generic class for concrete template arguments: clone
/// the subtree, bind the template names, and cache the clone under the
/// template signature on the original atom.
pub fn remap_generic(build: &mut Build, class: AtomId, targs: &[Classdef]) -> CResult<AtomId> {
    let signature = Signature::from_classdefs(&[], targs);
    let (decl_count, names): (usize, Vec<String>) = {
        let atom = build.atoms.get(class).ok_or(Failed)?;
        match atom.instances.find(&signature) {
            InstanceLookup::Found(id) => {
                let remap = atom.instances.get(id).map_or(0, |e| e.remap_atom);
                if remap == 0 {
                    build.report.ice("generic cache entry without a remap atom");
                    return Err(Failed);
                }
                return Ok(remap);
            }
            InstanceLookup::Invalid => {
                let name = build.atoms.full_name(class);
                build.report.error(format!(
                    "'{name}' cannot be remapped for these template arguments: \
                     a previous attempt failed"
                ));
                return Err(Failed);
            }
            InstanceLookup::Unknown => {}
        }
        (
            atom.tmplparams.len(),
            atom.tmplparams.iter().map(|p| p.name.clone()).collect(),
        )
    };
    if targs.len() != decl_count {
        let name = build.atoms.full_name(class);
        build.report.error(format!(
            "'{name}' expects {decl_count} template argument(s), got {}",
            targs.len()
        ));
        return Err(Failed);
    }

    let id = build
        .atoms
        .get_mut(class)
        .ok_or(Failed)?
        .instances
        .create(signature.clone());

    let outcome = clone_class(build, class);
    match outcome {
        Ok(cloned) => {
            {
                let atom = build.atoms.get_mut(cloned).ok_or(Failed)?;
                atom.tmpl_bindings = names.into_iter().zip(targs.iter().cloned()).collect();
                // the clone is concrete; its own tmplparams are satisfied
                atom.tmplparams.clear();
            }
            let symbol = build_symbol(build, cloned);
            let atom = build.atoms.get_mut(class).ok_or(Failed)?;
            atom.instances
                .update(id, Rc::new(Sequence::new()), Classdef::object(cloned), symbol);
            atom.instances.set_remap(id, cloned);
            Ok(cloned)
        }
        Err(Failed) => {
            build
                .atoms
                .get_mut(class)
                .ok_or(Failed)?
                .instances
                .invalidate(&signature);
            Err(Failed)
        }
    }
}
