//! Captured-variable synthesis.
//!
//! A functor class carries capture candidates: hidden member slots named
//! after the free variables its body may reference. At each construction
//! site the candidate list is narrowed to the names that actually resolve
//! to locals in the enclosing scope; the constructor is then widened to
//! take the captured values as extra named parameters, renumbering the
//! registers its body already assigned.

use std::collections::HashMap;
use std::rc::Rc;

use ir::{BlueprintKind, Instr, Pragma, Sequence};

use crate::atoms::{AtomBody, AtomId, ParamDecl};
use crate::config;
use crate::report::{CResult, Failed};
use crate::types::Classdef;

use super::Build;

/// One narrowed capture: a free name bound to an enclosing local.
#[derive(Debug, Clone)]
pub struct Capture {
    pub name: String,
    /// Field slot of the hidden member inside the functor object.
    pub index: u32,
    /// Register of the captured local in the enclosing frame.
    pub outer: u32,
    pub cdef: Classdef,
}

/// Narrow the capture candidates of `class` against the names visible in
/// the enclosing builder frame. Candidates that do not resolve stay
/// unbound (their slot is zeroed and never read).
pub fn narrow_captures(
    build: &Build,
    class: AtomId,
    visible: &HashMap<String, u32>,
    cdef_of: impl Fn(u32) -> Classdef,
) -> Vec<Capture> {
    let Some(atom) = build.atoms.get(class) else {
        return Vec::new();
    };
    let mut captures = Vec::new();
    for &child in &atom.children {
        let Some(member) = build.atoms.get(child) else {
            continue;
        };
        if !member.is_member_var() || !member.category.captured {
            continue;
        }
        if let Some(&outer) = visible.get(&member.name) {
            captures.push(Capture {
                name: member.name.clone(),
                index: member.field_index,
                outer,
                cdef: cdef_of(outer),
            });
        }
    }
    captures
}

/// Widen the user `^new` of `class` (a per-call-site clone) to accept the
/// captured values as trailing named parameters, storing each into its
/// hidden member slot at the top of the body.
///
/// The body was generated before the extra parameters existed, so every
/// register above the original parameter range is shifted to make room.
/// No-op when the class has no user constructor.
pub fn widen_ctor(build: &mut Build, class: AtomId, captures: &[Capture]) -> CResult<()> {
    if captures.is_empty() {
        return Ok(());
    }
    let ctor = build
        .atoms
        .find_children(class, config::NAME_NEW)
        .into_iter()
        .find(|&id| build.atoms.get(id).is_some_and(|a| a.is_funcdef() && a.body.is_some()));
    let Some(ctor) = ctor else {
        return Ok(());
    };

    let (src, offset, nparams) = {
        let atom = build.atoms.get(ctor).ok_or(Failed)?;
        let body = atom.body.as_ref().ok_or(Failed)?;
        (
            Rc::clone(&body.sequence),
            body.offset,
            atom.parameters.len() as u32,
        )
    };
    let end = src.skip_blueprint(offset).map_err(|err| {
        build.report.ice(format!("cannot widen constructor: {err}"));
        Failed
    })?;

    // working copy of just the constructor blueprint
    let mut copy = Sequence::with_capacity((end - offset) as usize);
    copy.strings = src.strings.clone();
    for at in offset..end {
        let instr = src.read(at).map_err(|err| {
            build.report.ice(format!("cannot widen constructor: {err}"));
            Failed
        })?;
        copy.emit(instr);
    }
    let body_start = (0..copy.len())
        .find(|&at| matches!(copy.read(at), Ok(Instr::Pragma(Pragma::BodyStart))));
    let Some(body_start) = body_start else {
        build.report.ice("constructor blueprint without a body-start marker");
        return Err(Failed);
    };

    // registers 2..=1+nparams belong to declared parameters (self
    // included); everything above shifts up by the capture count
    let inc = captures.len() as u32;
    let above = 1 + nparams;
    copy.increase_all_lvid(inc, above, body_start + 1);

    // rebuild with the capture parameters spliced into the signature and
    // the member stores spliced in right after the body-start marker
    let mut out = Sequence::with_capacity(copy.len() as usize + 3 * captures.len());
    out.strings = copy.strings.clone();
    for at in 0..body_start {
        out.emit(copy.read(at).map_err(|_| Failed)?);
    }
    for (i, cap) in captures.iter().enumerate() {
        let name = out.intern(&cap.name);
        out.emit(Instr::Blueprint {
            kind: BlueprintKind::Param,
            name,
            lvid: 2 + nparams + i as u32,
        });
    }
    out.emit(Instr::Pragma(Pragma::BodyStart));
    for (i, cap) in captures.iter().enumerate() {
        let lvid = 2 + nparams + i as u32;
        if cap.cdef.has_atom() {
            out.emit(Instr::Ref { lvid });
        }
        out.emit(Instr::Fieldset {
            lvid,
            self_lvid: 2,
            index: cap.index,
        });
    }
    for at in body_start + 1..copy.len() {
        out.emit(copy.read(at).map_err(|_| Failed)?);
    }
    let total = out.len();
    out.patch(1, Instr::Pragma(Pragma::BlueprintSize { size: total }));

    // swap the widened body in and extend the declared parameter list
    let atom = build.atoms.get_mut(ctor).ok_or(Failed)?;
    atom.body = Some(AtomBody {
        sequence: Rc::new(out),
        offset: 0,
    });
    for cap in captures {
        let lvid = 2 + atom.parameters.len() as u32;
        atom.parameters.push(ParamDecl {
            name: cap.name.clone(),
            lvid,
            typename: String::new(),
        });
    }
    Ok(())
}
