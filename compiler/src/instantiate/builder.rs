//! The opcode-by-opcode body walker.
//!
//! One `SequenceBuilder` resolves one atom body for one concrete
//! signature: it type-checks every instruction against the per-frame
//! register table, resolves identifiers and overloads, lowers builtin
//! intrinsics, and emits the executable output sequence.

use std::collections::HashMap;
use std::rc::Rc;

use ir::{CType, Instr, Op, Pragma, Sequence};
use log::trace;

use crate::atoms::{AtomId, AtomKind, InstanceId};
use crate::intrinsics::{self, BuiltinArg, Lowering};
use crate::report::{CResult, Failed, Origin};
use crate::types::{Classdef, TypeCheck};

use super::closures;
use super::lifecycle;
use super::overload::{resolve_call, CallArg};
use super::{check_declared, instantiate_atom, resolve_typename, Build, InstantiateRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Alias {
    Local(u32),
    Field { self_lvid: u32, index: u32 },
}

/// Per-register state of the frame being built.
#[derive(Debug, Clone, Default)]
struct Local {
    cdef: Classdef,
    /// Unresolved overload set left by `identify`.
    candidates: Vec<AtomId>,
    /// What this register aliases, for assignment targets.
    alias: Option<Alias>,
    /// Receiver for a method call bound by `identify` (0 = none).
    bound_self: u32,
    /// Namespace binding (0 = none); not a value.
    namespace: AtomId,
    name: String,
    used: bool,
    synthetic: bool,
    /// Already registered for scope-exit release.
    tracked: bool,
}

struct ShortCircuit {
    label: u32,
    is_and: bool,
    nops: Vec<u32>,
}

pub struct SequenceBuilder<'b, 'a> {
    build: &'b mut Build<'a>,
    atomid: AtomId,
    instanceid: InstanceId,
    params: Vec<Classdef>,
    tmplparams: Vec<Classdef>,
    input: Option<Rc<Sequence>>,
    offset: u32,
    cursor: u32,
    out: Sequence,
    locals: Vec<Local>,
    names: HashMap<String, u32>,
    /// Registers owning a reference, released in reverse order when their
    /// scope closes. Index 0 is the function body itself.
    scopes: Vec<Vec<u32>>,
    pushed: Vec<CallArg>,
    tpushed: Vec<u32>,
    codegen_off: u32,
    short_circuit: Option<ShortCircuit>,
    stacksize_at: u32,
    next_lvid: u32,
    origin: Origin,
    declared_ret: Option<Classdef>,
    inferred_ret: Option<Classdef>,
}

impl<'b, 'a> SequenceBuilder<'b, 'a> {
    pub fn new(build: &'b mut Build<'a>, req: &InstantiateRequest, instanceid: InstanceId) -> Self {
        let input = build
            .atoms
            .get(req.atomid)
            .and_then(|a| a.body.as_ref())
            .map(|b| (Rc::clone(&b.sequence), b.offset));
        let (input, offset) = match input {
            Some((seq, offset)) => (Some(seq), offset),
            None => (None, 0),
        };
        Self {
            build,
            atomid: req.atomid,
            instanceid,
            params: req.params.clone(),
            tmplparams: req.tmplparams.clone(),
            input,
            offset,
            cursor: 0,
            out: Sequence::new(),
            locals: Vec::new(),
            names: HashMap::new(),
            scopes: Vec::new(),
            pushed: Vec::new(),
            tpushed: Vec::new(),
            codegen_off: 0,
            short_circuit: None,
            stacksize_at: 0,
            next_lvid: 0,
            origin: Origin::default(),
            declared_ret: None,
            inferred_ret: None,
        }
    }

    pub fn run(mut self) -> CResult<(Sequence, Classdef)> {
        let Some(input) = self.input.clone() else {
            let name = self.build.atoms.full_name(self.atomid);
            self.build
                .report
                .ice(format!("'{name}' has no body to instantiate"));
            return Err(Failed);
        };
        trace!(
            "walking body of atom:{}#{} at offset {}",
            self.atomid,
            self.instanceid,
            self.offset
        );
        self.read_header(&input)?;
        self.bind_signature()?;
        self.scopes.push(Vec::new());

        loop {
            if self.cursor >= input.len() {
                let name = self.build.atoms.full_name(self.atomid);
                self.build
                    .report
                    .ice(format!("body of '{name}' ran past the end of its sequence"));
                return Err(Failed);
            }
            let instr = input.read(self.cursor).map_err(|err| {
                self.build.report.ice(format!("malformed body: {err}"));
                Failed
            })?;
            // nested declarations (lambdas) are instantiated on demand
            if matches!(instr, Instr::Blueprint { .. }) {
                self.cursor = input.skip_blueprint(self.cursor).map_err(|err| {
                    self.build.report.ice(format!("malformed body: {err}"));
                    Failed
                })?;
                continue;
            }
            let done = self.step(&input, instr)?;
            self.cursor += 1;
            if done {
                break;
            }
        }

        self.finish()
    }

    /// Validate the blueprint header and position the cursor on the first
    /// body instruction.
    fn read_header(&mut self, input: &Sequence) -> CResult<()> {
        let at = self.offset;
        if !matches!(input.read(at), Ok(Instr::Blueprint { .. })) {
            self.build.report.ice(format!("no blueprint at offset {at}"));
            return Err(Failed);
        }
        let count = match input.read(at + 2) {
            Ok(Instr::Stacksize { count }) => count,
            _ => {
                self.build
                    .report
                    .ice(format!("blueprint at {at} lacks a stacksize header"));
                return Err(Failed);
            }
        };
        self.locals = vec![Local::default(); count.max(2) as usize];
        self.next_lvid = count.max(2);
        self.stacksize_at = self.out.emit(Instr::Stacksize { count });

        // the signature region is interpreted from the mapping metadata;
        // the walk starts right after the body-start marker
        let mut at = at + 3;
        loop {
            match input.read(at) {
                Ok(Instr::Pragma(Pragma::BodyStart)) => {
                    self.cursor = at + 1;
                    return Ok(());
                }
                Ok(Instr::End) | Err(_) => {
                    self.build
                        .report
                        .ice("blueprint without a body-start marker");
                    return Err(Failed);
                }
                Ok(_) => at += 1,
            }
        }
    }

    /// Bind concrete parameter types to their declared registers and
    /// check them against the declared annotations.
    fn bind_signature(&mut self) -> CResult<()> {
        let (decls, tdecls, ret_typename) = {
            let atom = self.build.atoms.get(self.atomid).ok_or(Failed)?;
            (
                atom.parameters.clone(),
                atom.tmplparams.clone(),
                atom.return_typename.clone(),
            )
        };
        for (decl, cdef) in decls.iter().zip(self.params.clone()) {
            if check_declared(self.build, self.atomid, &decl.typename, &cdef) == TypeCheck::None {
                let name = decl.name.clone();
                let typename = decl.typename.clone();
                return Err(self.error(format!(
                    "parameter '{name}': expected '{typename}', got '{cdef}'"
                )));
            }
            self.ensure_lvid(decl.lvid);
            let local = &mut self.locals[decl.lvid as usize];
            local.cdef = cdef;
            local.name = decl.name.clone();
            local.used = true;
            self.names.insert(decl.name.clone(), decl.lvid);
        }
        // template parameters become type bindings visible to the body
        if !tdecls.is_empty() {
            if tdecls.len() != self.tmplparams.len() {
                return Err(self.error(format!(
                    "expected {} template argument(s), got {}",
                    tdecls.len(),
                    self.tmplparams.len()
                )));
            }
            let bindings: Vec<(String, Classdef)> = tdecls
                .iter()
                .map(|d| d.name.clone())
                .zip(self.tmplparams.clone())
                .collect();
            self.build.atoms.get_mut(self.atomid).ok_or(Failed)?.tmpl_bindings = bindings;
        }
        if !ret_typename.is_empty() {
            match resolve_typename(self.build, self.atomid, &ret_typename) {
                Some(cdef) => self.declared_ret = Some(cdef),
                None => {
                    return Err(self.error(format!("unknown return type '{ret_typename}'")));
                }
            }
        }
        Ok(())
    }

    fn finish(mut self) -> CResult<(Sequence, Classdef)> {
        self.out.patch(
            self.stacksize_at,
            Instr::Stacksize {
                count: self.next_lvid,
            },
        );
        if self.build.warn_unused {
            for local in &self.locals {
                if !local.name.is_empty() && !local.used && !local.synthetic {
                    self.build
                        .report
                        .warning(format!("unused variable '{}'", local.name))
                        .origin(self.origin.clone());
                }
            }
        }
        // drop the per-instantiation template bindings
        if let Some(atom) = self.build.atoms.get_mut(self.atomid) {
            atom.tmpl_bindings.clear();
        }
        let rettype = match (self.declared_ret.take(), self.inferred_ret.take()) {
            (Some(declared), Some(inferred)) => {
                let check = inferred.compare(&declared, |a| self.build.atoms.boxed_kind(a));
                if check == TypeCheck::None {
                    self.build.report.error(format!(
                        "returned '{inferred}' does not match the declared '{declared}'"
                    ));
                    return Err(Failed);
                }
                declared
            }
            (Some(declared), None) => declared,
            (None, Some(inferred)) => inferred,
            (None, None) => Classdef::void(),
        };
        debug_assert!(self.out.is_executable());
        Ok((self.out, rettype))
    }

    // ---- helpers ---------------------------------------------------------

    fn error(&mut self, text: String) -> Failed {
        self.build.report.error(text).origin(self.origin.clone());
        Failed
    }

    fn ice(&mut self, text: String) -> Failed {
        self.build.report.ice(text).origin(self.origin.clone());
        Failed
    }

    fn ensure_lvid(&mut self, lvid: u32) {
        if lvid as usize >= self.locals.len() {
            self.locals.resize(lvid as usize + 1, Local::default());
        }
        if lvid >= self.next_lvid {
            self.next_lvid = lvid + 1;
        }
    }

    /// Allocate a fresh temporary register.
    fn temp(&mut self) -> u32 {
        let lvid = self.next_lvid;
        self.ensure_lvid(lvid);
        lvid
    }

    fn emit(&mut self, instr: Instr) -> Option<u32> {
        (self.codegen_off == 0).then(|| self.out.emit(instr))
    }

    fn local(&mut self, lvid: u32) -> &mut Local {
        self.ensure_lvid(lvid);
        &mut self.locals[lvid as usize]
    }

    fn cdef(&mut self, lvid: u32) -> Classdef {
        self.local(lvid).cdef.clone()
    }

    fn mark_used(&mut self, lvid: u32) {
        self.local(lvid).used = true;
    }

    fn is_object(cdef: &Classdef) -> bool {
        cdef.has_atom() && cdef.instance
    }

    /// Register an owning object reference for release when the current
    /// scope closes.
    fn track(&mut self, lvid: u32) {
        let local = self.local(lvid);
        if !local.tracked {
            local.tracked = true;
            if let Some(scope) = self.scopes.last_mut() {
                scope.push(lvid);
            }
        }
    }

    fn dtor_of(&mut self, class: AtomId) -> CResult<(AtomId, InstanceId)> {
        lifecycle::instantiate_class(self.build, class, &[])?;
        match self.build.atoms.get(class).and_then(|a| a.classinfo.dtor) {
            Some(slot) => Ok(slot),
            None => Err(self.ice(format!("class atom:{class} has no destructor"))),
        }
    }

    /// Emit releases for one scope's tracked registers, newest first.
    fn release(&mut self, tracked: &[u32]) -> CResult<()> {
        for &lvid in tracked.iter().rev() {
            let cdef = self.cdef(lvid);
            if Self::is_object(&cdef) {
                let (da, di) = self.dtor_of(cdef.atom)?;
                self.emit(Instr::Unref {
                    lvid,
                    atomid: da,
                    instanceid: di,
                });
            }
        }
        Ok(())
    }

    /// Releases for every open scope, innermost first (return paths).
    fn release_all(&mut self) -> CResult<()> {
        for tracked in self.scopes.clone().iter().rev() {
            self.release(tracked)?;
        }
        Ok(())
    }

    fn require_builtin(&mut self, lvid: u32, what: &str) -> CResult<CType> {
        let cdef = self.cdef(lvid);
        if cdef.is_builtin() {
            Ok(cdef.kind)
        } else {
            Err(self.error(format!("{what}: expected a builtin value, got '{cdef}'")))
        }
    }

    /// Settle a literal register onto a concrete builtin kind.
    fn adapt_literal(&mut self, lvid: u32, kind: CType) {
        let local = self.local(lvid);
        if local.cdef.literal {
            local.cdef.kind = kind;
            local.cdef.literal = false;
        }
    }

    /// Wrap a raw builtin value in a fresh instance of the class boxing
    /// its kind. The box owns one reference, released with the current
    /// scope like any other constructed object.
    fn box_value(&mut self, lvid: u32, class: AtomId, kind: CType) -> CResult<u32> {
        self.adapt_literal(lvid, kind);
        lifecycle::instantiate_class(self.build, class, &[])?;
        let boxed = self.temp();
        self.emit(Instr::Allocate {
            lvid: boxed,
            atomid: class,
        });
        self.local(boxed).cdef = Classdef::object(class);
        self.track(boxed);
        self.emit(Instr::Fieldset {
            lvid,
            self_lvid: boxed,
            index: 0,
        });
        Ok(boxed)
    }

    /// Read the raw value back out of a box; field 0 holds it.
    fn unbox_value(&mut self, lvid: u32, kind: CType) -> u32 {
        let raw = self.temp();
        self.emit(Instr::Fieldget {
            lvid: raw,
            self_lvid: lvid,
            index: 0,
        });
        self.local(raw).cdef = Classdef::builtin(kind);
        raw
    }

    /// Materialize the implicit conversions `compare` accepts between a
    /// value and the slot it flows into: box a raw builtin handed to a
    /// slot typed as the class boxing it, unbox in the other direction.
    /// Returns the register carrying the adapted value, unchanged when no
    /// conversion applies.
    fn adapt_to(&mut self, lvid: u32, target: &Classdef) -> CResult<u32> {
        let cdef = self.cdef(lvid);
        if Self::is_object(target) && !Self::is_object(&cdef) && (cdef.is_builtin() || cdef.literal)
        {
            if let Some(kind) = self.build.atoms.boxed_kind(target.atom) {
                if cdef.literal || cdef.kind == kind {
                    return self.box_value(lvid, target.atom, kind);
                }
            }
        } else if target.is_builtin() && Self::is_object(&cdef) {
            if self.build.atoms.boxed_kind(cdef.atom) == Some(target.kind) {
                return Ok(self.unbox_value(lvid, target.kind));
            }
        }
        Ok(lvid)
    }

    // ---- dispatch --------------------------------------------------------

    fn step(&mut self, input: &Rc<Sequence>, instr: Instr) -> CResult<bool> {
        match instr {
            Instr::Nop => {
                if let Some(offset) = self.emit(Instr::Nop) {
                    if let Some(sc) = &mut self.short_circuit {
                        if sc.nops.len() < 2 {
                            sc.nops.push(offset);
                        }
                    }
                }
            }
            Instr::StoreConstant { lvid, value } => {
                self.local(lvid).cdef = Classdef::literal_of(CType::U64);
                self.emit(Instr::StoreConstant { lvid, value });
            }
            Instr::StoreText { lvid, text } => {
                let owned = input.text(text).to_owned();
                self.local(lvid).cdef = Classdef::builtin(CType::Ptr);
                let sref = self.out.intern(&owned);
                self.emit(Instr::StoreText { lvid, text: sref });
            }
            Instr::Store { lvid, source } => {
                self.mark_used(source);
                let cdef = self.cdef(source);
                self.local(lvid).cdef = cdef;
                self.emit(Instr::Store { lvid, source });
            }
            Instr::Label { id } => {
                self.emit(Instr::Label { id });
            }
            Instr::Jmp { label } => {
                self.emit(Instr::Jmp { label });
            }
            Instr::Jz { lvid, label } => {
                self.mark_used(lvid);
                self.require_builtin(lvid, "conditional jump")?;
                self.emit(Instr::Jz { lvid, label });
            }
            Instr::Jnz { lvid, label } => {
                self.mark_used(lvid);
                self.require_builtin(lvid, "conditional jump")?;
                self.emit(Instr::Jnz { lvid, label });
            }
            Instr::Assert { lvid } => {
                self.mark_used(lvid);
                self.require_builtin(lvid, "assert")?;
                self.emit(Instr::Assert { lvid });
            }
            Instr::Ret { lvid } => self.ret(lvid)?,
            Instr::Allocate { lvid, atomid } => {
                lifecycle::instantiate_class(self.build, atomid, &[])?;
                self.local(lvid).cdef = Classdef::object(atomid);
                self.emit(Instr::Allocate { lvid, atomid });
                self.track(lvid);
            }
            Instr::Dispose {
                lvid,
                atomid,
                instanceid,
            } => {
                self.mark_used(lvid);
                self.emit(Instr::Dispose {
                    lvid,
                    atomid,
                    instanceid,
                });
            }
            Instr::Ref { lvid } => {
                self.mark_used(lvid);
                self.emit(Instr::Ref { lvid });
            }
            Instr::Unref {
                lvid,
                atomid,
                instanceid,
            } => {
                self.mark_used(lvid);
                // unresolved destructor: fill it in from the value's class
                let (atomid, instanceid) = if atomid == 0 {
                    let cdef = self.cdef(lvid);
                    if !Self::is_object(&cdef) {
                        return Err(self.error(format!("unref of non-object '{cdef}'")));
                    }
                    self.dtor_of(cdef.atom)?
                } else {
                    (atomid, instanceid)
                };
                self.emit(Instr::Unref {
                    lvid,
                    atomid,
                    instanceid,
                });
            }
            Instr::Fieldget {
                lvid,
                self_lvid,
                index,
            } => {
                self.mark_used(self_lvid);
                let base = self.cdef(self_lvid);
                if Self::is_object(&base) {
                    let field = self
                        .build
                        .atoms
                        .get(base.atom)
                        .and_then(|a| a.field_types.get(index as usize).cloned())
                        .unwrap_or_default();
                    self.local(lvid).cdef = field;
                }
                self.emit(Instr::Fieldget {
                    lvid,
                    self_lvid,
                    index,
                });
            }
            Instr::Fieldset {
                lvid,
                self_lvid,
                index,
            } => {
                self.mark_used(lvid);
                self.mark_used(self_lvid);
                self.emit(Instr::Fieldset {
                    lvid,
                    self_lvid,
                    index,
                });
            }
            Instr::Push { lvid, name } => {
                self.mark_used(lvid);
                let name = input.text(name).to_owned();
                let cdef = self.cdef(lvid);
                self.pushed.push(CallArg { lvid, name, cdef });
            }
            Instr::Tpush { lvid, .. } => {
                self.mark_used(lvid);
                self.tpushed.push(lvid);
            }
            Instr::Call {
                lvid,
                func,
                instanceid,
            } => {
                if instanceid == u32::MAX {
                    self.call_unresolved(lvid, func)?;
                } else {
                    self.call_resolved(lvid, func, instanceid)?;
                }
            }
            Instr::Intrinsic { lvid, id, name } => {
                if name != 0 {
                    let text = input.text(name).to_owned();
                    self.intrinsic_named(lvid, &text)?;
                } else {
                    self.intrinsic_by_id(lvid, id)?;
                }
            }
            Instr::Stacksize { .. } => {
                return Err(self.ice("stacksize outside a blueprint header".into()));
            }
            Instr::Identify {
                lvid,
                self_lvid,
                name,
            } => {
                let text = input.text(name).to_owned();
                self.identify(lvid, self_lvid, &text, false)?;
            }
            Instr::IdentifySet {
                lvid,
                self_lvid,
                name,
            } => {
                let text = input.text(name).to_owned();
                self.identify(lvid, self_lvid, &text, true)?;
            }
            Instr::Ensureresolved { lvid } => {
                let local = self.local(lvid);
                if local.candidates.len() > 1 {
                    let name = local.name.clone();
                    let candidates = local.candidates.clone();
                    let failed = self.error(format!("ambiguous reference '{name}'"));
                    for atomid in candidates {
                        let symbol = self.build.atoms.full_name(atomid);
                        if let Some(msg) = self.build.report.entries.last_mut() {
                            msg.hint(format!("could be '{symbol}'"));
                        }
                    }
                    return Err(failed);
                }
            }
            Instr::Commontype { lvid, previous } => {
                let a = self.cdef(lvid);
                let b = self.cdef(previous);
                if a.compare(&b, |at| self.build.atoms.boxed_kind(at)) == TypeCheck::None {
                    return Err(self.error(format!(
                        "incompatible branch types: '{a}' vs '{b}'"
                    )));
                }
            }
            Instr::Assign {
                lhs,
                rhs,
                dispose_lhs,
            } => self.assign(lhs, rhs, dispose_lhs)?,
            Instr::SelfPtr { lvid } => {
                let Some(&self_lvid) = self.names.get("self") else {
                    return Err(self.error("'self' is not available here".into()));
                };
                let cdef = self.cdef(self_lvid);
                self.local(lvid).cdef = cdef;
                self.local(lvid).alias = Some(Alias::Local(self_lvid));
                self.emit(Instr::Store {
                    lvid,
                    source: self_lvid,
                });
            }
            Instr::Follow {
                lvid,
                follower,
                symlink,
            } => {
                let cdef = self.cdef(follower);
                self.local(lvid).cdef = cdef;
                if symlink {
                    self.local(lvid).alias = Some(Alias::Local(follower));
                }
            }
            Instr::Classdefsizeof { lvid, atomid } => {
                let size = self.build.atoms.class_size(atomid);
                self.local(lvid).cdef = Classdef::literal_of(CType::U64);
                self.emit(Instr::StoreConstant { lvid, value: size });
            }
            Instr::Qualifiers {
                lvid,
                qualifier,
                on,
            } => {
                let local = self.local(lvid);
                match qualifier {
                    ir::QualifierKind::Ref => local.cdef.qualifiers.by_ref = on,
                    ir::QualifierKind::Const => local.cdef.qualifiers.constant = on,
                    ir::QualifierKind::Nullable => local.cdef.qualifiers.nullable = on,
                }
            }
            Instr::Debugfile { filename } => {
                self.origin.filename = input.text(filename).to_owned();
            }
            Instr::Debugpos { line, offset } => {
                self.origin.line = line;
                self.origin.offset = offset;
            }
            Instr::Namealias { lvid, name } => {
                let text = input.text(name).to_owned();
                self.local(lvid).name = text.clone();
                self.names.insert(text, lvid);
            }
            Instr::Comment { .. } => {}
            Instr::Scope => {
                self.scopes.push(Vec::new());
            }
            Instr::End => {
                if self.scopes.len() == 1 {
                    let tracked = self.scopes.pop().unwrap_or_default();
                    self.release(&tracked)?;
                    self.emit(Instr::Ret { lvid: 0 });
                    return Ok(true);
                }
                let tracked = self.scopes.pop().unwrap_or_default();
                self.release(&tracked)?;
            }
            Instr::Typeisobject { lvid } => {
                let cdef = self.cdef(lvid);
                let value = u64::from(Self::is_object(&cdef));
                self.local(lvid).cdef = Classdef::builtin(CType::Bool);
                self.emit(Instr::StoreConstant { lvid, value });
            }
            Instr::Pragma(pragma) => self.pragma(pragma)?,
            Instr::Blueprint { .. } => unreachable!("skipped by the walk loop"),
            other => self.binop(other)?,
        }
        Ok(false)
    }

    fn pragma(&mut self, pragma: Pragma) -> CResult<()> {
        match pragma {
            Pragma::Codegen { enabled } => {
                if enabled {
                    self.codegen_off = self.codegen_off.saturating_sub(1);
                } else {
                    self.codegen_off += 1;
                }
            }
            Pragma::ShortCircuit { label } => {
                self.short_circuit = Some(ShortCircuit {
                    label,
                    is_and: true,
                    nops: Vec::new(),
                });
            }
            Pragma::Synthetic { lvid } => {
                self.local(lvid).synthetic = true;
            }
            Pragma::BlueprintSize { .. }
            | Pragma::BodyStart
            | Pragma::Visibility { .. }
            | Pragma::BuiltinAlias { .. }
            | Pragma::Suggest { .. } => {}
        }
        Ok(())
    }

    /// Three-address arithmetic, comparison and bitwise forms share one
    /// validation path keyed on the opcode group.
    fn binop(&mut self, instr: Instr) -> CResult<()> {
        let op = instr.op();
        let ins = instr.encode();
        let (dest, lhs, rhs) = (ins.a, ins.b, ins.c);
        let group = binop_group(op)
            .ok_or_else(|| self.ice(format!("unhandled opcode '{op}' in body walk")))?;
        match group {
            BinGroup::Unary => {
                self.mark_used(lhs);
                let kind = self.require_builtin(lhs, "operand")?;
                self.local(dest).cdef = Classdef::builtin(kind);
            }
            BinGroup::Arith | BinGroup::Cmp | BinGroup::Bits => {
                self.mark_used(lhs);
                self.mark_used(rhs);
                // settle literals against the concrete side first
                let lk = self.cdef(lhs);
                let rk = self.cdef(rhs);
                if lk.literal && !rk.literal && rk.is_builtin() {
                    self.adapt_literal(lhs, rk.kind);
                } else if rk.literal && !lk.literal && lk.is_builtin() {
                    self.adapt_literal(rhs, lk.kind);
                }
                let lk = self.require_builtin(lhs, "left operand")?;
                let rk = self.require_builtin(rhs, "right operand")?;
                if lk != rk {
                    return Err(self.error(format!("operand type mismatch: {lk} vs {rk}")));
                }
                self.local(dest).cdef = Classdef::builtin(if group == BinGroup::Cmp {
                    CType::Bool
                } else {
                    lk
                });
            }
            BinGroup::Memory => {
                // raw memory forms carry their own operand conventions;
                // the destination register is visited first
                let mut scratch = instr;
                let mut operands = Vec::new();
                scratch.for_each_lvid(|r| operands.push(*r));
                for &operand in operands.iter().skip(1) {
                    self.mark_used(operand);
                }
                let dest_cdef = match op {
                    Op::Memalloc => Classdef::builtin(CType::Ptr),
                    Op::Memcmp | Op::Cstrlen => Classdef::builtin(CType::U64),
                    Op::Load => {
                        if let Instr::Load { ctype, .. } = instr {
                            Classdef::builtin(ctype)
                        } else {
                            Classdef::default()
                        }
                    }
                    _ => self.cdef(dest),
                };
                self.local(dest).cdef = dest_cdef;
            }
        }
        self.emit(instr);
        Ok(())
    }

    fn ret(&mut self, lvid: u32) -> CResult<()> {
        let mut lvid = lvid;
        if lvid != 0 {
            self.mark_used(lvid);
            let mut cdef = self.cdef(lvid);
            if !self.local(lvid).candidates.is_empty() && cdef.is_any() {
                return Err(self.error("cannot return an unresolved overload set".into()));
            }
            // returned values adopt the declared representation
            if let Some(declared) = self.declared_ret.clone() {
                let adapted = self.adapt_to(lvid, &declared)?;
                if adapted != lvid {
                    lvid = adapted;
                    cdef = self.cdef(lvid);
                }
            }
            // merge with previously inferred returns
            if let Some(previous) = &self.inferred_ret {
                let previous = previous.clone();
                if cdef.compare(&previous, |a| self.build.atoms.boxed_kind(a)) == TypeCheck::None {
                    return Err(self.error(format!(
                        "inconsistent return types: '{cdef}' vs '{previous}'"
                    )));
                }
            } else {
                self.inferred_ret = Some(cdef.clone());
            }
            // the returned reference escapes the frame
            if Self::is_object(&cdef) {
                self.emit(Instr::Ref { lvid });
            }
        } else if self.inferred_ret.is_none() {
            self.inferred_ret = Some(Classdef::void());
        }
        self.release_all()?;
        self.emit(Instr::Ret { lvid });
        Ok(())
    }

    // ---- identifier resolution -------------------------------------------

    fn identify(&mut self, lvid: u32, self_lvid: u32, name: &str, is_set: bool) -> CResult<()> {
        if self_lvid == 0 {
            // local variables shadow everything
            if let Some(&var) = self.names.get(name) {
                self.mark_used(var);
                let cdef = self.cdef(var);
                let local = self.local(lvid);
                local.cdef = cdef;
                local.alias = Some(Alias::Local(var));
                if !is_set {
                    self.emit(Instr::Store { lvid, source: var });
                }
                return Ok(());
            }
            // builtin type names
            if let Some(kind) = CType::from_builtin_name(name) {
                self.local(lvid).cdef = Classdef {
                    kind,
                    instance: false,
                    ..Classdef::default()
                };
                return Ok(());
            }
            // template bindings of the enclosing instantiation
            if let Some(cdef) = self.tmpl_binding(name) {
                let mut cdef = cdef;
                cdef.instance = false;
                self.local(lvid).cdef = cdef;
                return Ok(());
            }
            let found = self.build.atoms.lookup(self.atomid, name);
            return self.bind_candidates(lvid, name, found, is_set);
        }

        // scoped access through a register
        self.mark_used(self_lvid);
        let base = self.local(self_lvid).clone();
        if base.namespace != 0 {
            let found = self.build.atoms.find_children(base.namespace, name);
            return self.bind_candidates(lvid, name, found, is_set);
        }
        if !Self::is_object(&base.cdef) {
            return Err(self.error(format!(
                "member access '.{name}' on non-object '{}'",
                base.cdef
            )));
        }
        let class = base.cdef.atom;
        let found = self.build.atoms.find_children(class, name);
        if found.is_empty() {
            let class_name = self.build.atoms.full_name(class);
            let visible: Vec<String> = self
                .build
                .atoms
                .visible_names(class)
                .into_iter()
                .map(String::from)
                .collect();
            let suggestion =
                crate::suggest::nearest(name, visible.iter().map(String::as_str)).map(String::from);
            let failed = self.error(format!("no member '{name}' in '{class_name}'"));
            if let Some(better) = suggestion {
                if let Some(msg) = self.build.report.entries.last_mut() {
                    msg.suggest(format!("did you mean '{better}'?"));
                }
            }
            return Err(failed);
        }
        // a member variable resolves to a field access
        if found.len() == 1 {
            if let Some(member) = self.build.atoms.get(found[0]) {
                if member.is_member_var() {
                    let index = member.field_index;
                    let field = self
                        .build
                        .atoms
                        .get(class)
                        .and_then(|a| a.field_types.get(index as usize).cloned())
                        .unwrap_or_default();
                    let local = self.local(lvid);
                    local.cdef = field;
                    local.alias = Some(Alias::Field { self_lvid, index });
                    if !is_set {
                        self.emit(Instr::Fieldget {
                            lvid,
                            self_lvid,
                            index,
                        });
                    }
                    return Ok(());
                }
            }
        }
        // methods: remember the receiver for the upcoming call
        let local = self.local(lvid);
        local.candidates = found;
        local.bound_self = self_lvid;
        local.cdef = Classdef::default();
        local.name = name.to_owned();
        Ok(())
    }

    fn tmpl_binding(&self, name: &str) -> Option<Classdef> {
        let mut current = self.atomid;
        while current != 0 {
            let atom = self.build.atoms.get(current)?;
            if let Some((_, cdef)) = atom.tmpl_bindings.iter().find(|(n, _)| n == name) {
                return Some(cdef.clone());
            }
            current = atom.parent;
        }
        None
    }

    fn bind_candidates(
        &mut self,
        lvid: u32,
        name: &str,
        found: Vec<AtomId>,
        _is_set: bool,
    ) -> CResult<()> {
        if found.is_empty() {
            let visible: Vec<String> = self
                .build
                .atoms
                .visible_names(self.atomid)
                .into_iter()
                .map(String::from)
                .collect();
            let suggestion = crate::suggest::nearest(name, visible.iter().map(String::as_str))
                .map(String::from);
            let failed = self.error(format!("unknown identifier '{name}'"));
            if let Some(better) = suggestion {
                if let Some(msg) = self.build.report.entries.last_mut() {
                    msg.suggest(format!("did you mean '{better}'?"));
                }
            }
            return Err(failed);
        }
        if found.len() == 1 {
            let atomid = found[0];
            let kind = self.build.atoms.get(atomid).map(|a| a.kind);
            match kind {
                Some(AtomKind::Funcdef) => {
                    let local = self.local(lvid);
                    local.candidates = found;
                    local.cdef = Classdef::default();
                    local.name = name.to_owned();
                }
                Some(AtomKind::Class) => {
                    let local = self.local(lvid);
                    local.cdef = Classdef {
                        atom: atomid,
                        instance: false,
                        ..Classdef::default()
                    };
                    local.name = name.to_owned();
                }
                Some(AtomKind::Namespace) => {
                    let local = self.local(lvid);
                    local.namespace = atomid;
                    local.name = name.to_owned();
                }
                Some(AtomKind::Typealias) => {
                    let target = self
                        .build
                        .atoms
                        .get(atomid)
                        .map(|a| a.return_typename.clone())
                        .unwrap_or_default();
                    match resolve_typename(self.build, atomid, &target) {
                        Some(mut cdef) => {
                            cdef.instance = false;
                            self.local(lvid).cdef = cdef;
                        }
                        None => {
                            return Err(self.error(format!(
                                "type alias '{name}' does not resolve to a type"
                            )));
                        }
                    }
                }
                Some(AtomKind::Vardef) => {
                    // a member of the enclosing class, reachable via self
                    let Some(&self_lvid) = self.names.get("self") else {
                        return Err(self.error(format!(
                            "variable '{name}' is not reachable from here"
                        )));
                    };
                    return self.identify(lvid, self_lvid, name, _is_set);
                }
                _ => {
                    return Err(self.error(format!("'{name}' cannot be used as a value")));
                }
            }
            return Ok(());
        }
        // overload set; the call site will disambiguate
        let local = self.local(lvid);
        local.candidates = found;
        local.cdef = Classdef::default();
        local.name = name.to_owned();
        Ok(())
    }

    // ---- calls -----------------------------------------------------------

    fn call_unresolved(&mut self, lvid: u32, func: u32) -> CResult<()> {
        let args = core::mem::take(&mut self.pushed);
        let targs = core::mem::take(&mut self.tpushed);
        self.mark_used(func);
        let target = self.local(func).clone();

        if target.namespace != 0 {
            let name = self.build.atoms.full_name(target.namespace);
            return Err(self.error(format!("cannot call namespace '{name}'")));
        }
        // constructor call: the register holds a class, not a value
        if target.cdef.has_atom() && !target.cdef.instance {
            if self
                .build
                .atoms
                .get(target.cdef.atom)
                .is_some_and(|a| a.is_class())
            {
                return self.construct(lvid, target.cdef.atom, args, targs);
            }
        }
        if target.candidates.is_empty() {
            return Err(self.error(format!(
                "expression of type '{}' is not callable",
                target.cdef
            )));
        }
        if !targs.is_empty() {
            return Err(self.error("template arguments on a function call".into()));
        }

        let mut full = Vec::with_capacity(args.len() + 1);
        if target.bound_self != 0 {
            full.push(CallArg {
                lvid: target.bound_self,
                name: String::new(),
                cdef: self.cdef(target.bound_self),
            });
        }
        full.extend(args);

        let (chosen, ordered) = resolve_call(self.build, &target.candidates, &full)?;
        let ordered = self.adapt_call_args(chosen, ordered)?;
        let req = InstantiateRequest {
            atomid: chosen,
            params: ordered.iter().map(|a| a.cdef.clone()).collect(),
            tmplparams: Vec::new(),
        };
        let (iid, rettype) = instantiate_atom(self.build, &req)?;
        for arg in &ordered {
            self.emit(Instr::Push {
                lvid: arg.lvid,
                name: 0,
            });
        }
        self.emit(Instr::Call {
            lvid,
            func: chosen,
            instanceid: iid,
        });
        let is_object = Self::is_object(&rettype);
        self.local(lvid).cdef = rettype;
        if is_object {
            self.track(lvid);
        }
        Ok(())
    }

    fn call_resolved(&mut self, lvid: u32, atomid: AtomId, instanceid: InstanceId) -> CResult<()> {
        let args = core::mem::take(&mut self.pushed);
        for arg in &args {
            self.emit(Instr::Push {
                lvid: arg.lvid,
                name: 0,
            });
        }
        let rettype = self
            .build
            .atoms
            .get(atomid)
            .and_then(|a| a.instances.get(instanceid))
            .map(|e| e.rettype.clone())
            .unwrap_or_default();
        self.emit(Instr::Call {
            lvid,
            func: atomid,
            instanceid,
        });
        self.local(lvid).cdef = rettype;
        Ok(())
    }

    /// Box or unbox arguments whose declared parameter type differs in
    /// representation from what the call site pushed, so the callee sees
    /// exactly what its annotations promise.
    fn adapt_call_args(&mut self, callee: AtomId, mut args: Vec<CallArg>) -> CResult<Vec<CallArg>> {
        let decls: Vec<String> = self
            .build
            .atoms
            .get(callee)
            .map(|a| a.parameters.iter().map(|p| p.typename.clone()).collect())
            .unwrap_or_default();
        for (arg, typename) in args.iter_mut().zip(decls) {
            if typename.is_empty() {
                continue;
            }
            let Some(declared) = resolve_typename(self.build, callee, &typename) else {
                continue;
            };
            let adapted = self.adapt_to(arg.lvid, &declared)?;
            if adapted != arg.lvid {
                arg.lvid = adapted;
                arg.cdef = self.cdef(adapted);
            }
        }
        Ok(args)
    }

    /// Object construction: allocate, bind captures, run a constructor.
    fn construct(
        &mut self,
        lvid: u32,
        class: AtomId,
        args: Vec<CallArg>,
        targs: Vec<u32>,
    ) -> CResult<()> {
        // generics instantiate against a cloned subtree
        let is_generic = self.build.atoms.get(class).is_some_and(|a| a.is_generic());
        let class = if is_generic {
            let mut tcdefs = Vec::with_capacity(targs.len());
            for &tlvid in &targs {
                let mut cdef = self.cdef(tlvid);
                cdef.instance = true;
                tcdefs.push(cdef);
            }
            lifecycle::remap_generic(self.build, class, &tcdefs)?
        } else {
            if !targs.is_empty() {
                let name = self.build.atoms.full_name(class);
                return Err(self.error(format!("'{name}' takes no template arguments")));
            }
            class
        };

        // functor capture sets get their own clone so field types stay
        // independent per construction site
        let has_candidates = self
            .build
            .atoms
            .get(class)
            .map(|a| {
                a.children.iter().any(|&c| {
                    self.build
                        .atoms
                        .get(c)
                        .is_some_and(|m| m.is_member_var() && m.category.captured)
                })
            })
            .unwrap_or(false);
        let (class, captures) = if has_candidates {
            let class = lifecycle::clone_class(self.build, class)?;
            let captures = {
                let locals = &self.locals;
                closures::narrow_captures(self.build, class, &self.names, |outer| {
                    locals
                        .get(outer as usize)
                        .map(|l| l.cdef.clone())
                        .unwrap_or_default()
                })
            };
            closures::widen_ctor(self.build, class, &captures)?;
            (class, captures)
        } else {
            (class, Vec::new())
        };
        for cap in &captures {
            self.mark_used(cap.outer);
        }

        lifecycle::instantiate_class(self.build, class, &captures)?;
        self.emit(Instr::Allocate {
            lvid,
            atomid: class,
        });
        self.local(lvid).cdef = Classdef::object(class);
        self.track(lvid);

        let user_ctors: Vec<AtomId> = self
            .build
            .atoms
            .find_children(class, crate::config::NAME_NEW)
            .into_iter()
            .filter(|&id| {
                self.build
                    .atoms
                    .get(id)
                    .is_some_and(|a| a.is_funcdef() && a.body.is_some())
            })
            .collect();

        let ret = self.temp();
        if user_ctors.is_empty() {
            if !args.is_empty() {
                let name = self.build.atoms.full_name(class);
                return Err(self.error(format!(
                    "'{name}' has no constructor taking arguments"
                )));
            }
            let Some((ca, ci)) = self
                .build
                .atoms
                .get(class)
                .and_then(|a| a.classinfo.default_ctor)
            else {
                return Err(self.ice(format!("class atom:{class} has no default constructor")));
            };
            self.emit(Instr::Push { lvid, name: 0 });
            let capture_lvids: Vec<u32> = captures.iter().map(|c| c.outer).collect();
            for outer in capture_lvids {
                self.emit(Instr::Push {
                    lvid: outer,
                    name: 0,
                });
            }
            self.emit(Instr::Call {
                lvid: ret,
                func: ca,
                instanceid: ci,
            });
        } else {
            let mut full = Vec::with_capacity(args.len() + captures.len() + 1);
            full.push(CallArg {
                lvid,
                name: String::new(),
                cdef: Classdef::object(class),
            });
            full.extend(args);
            // captured values ride along as named arguments
            for cap in &captures {
                full.push(CallArg {
                    lvid: cap.outer,
                    name: cap.name.clone(),
                    cdef: cap.cdef.clone(),
                });
            }
            let (chosen, ordered) = resolve_call(self.build, &user_ctors, &full)?;
            let ordered = self.adapt_call_args(chosen, ordered)?;
            let req = InstantiateRequest {
                atomid: chosen,
                params: ordered.iter().map(|a| a.cdef.clone()).collect(),
                tmplparams: Vec::new(),
            };
            let (iid, _) = instantiate_atom(self.build, &req)?;
            for arg in &ordered {
                self.emit(Instr::Push {
                    lvid: arg.lvid,
                    name: 0,
                });
            }
            self.emit(Instr::Call {
                lvid: ret,
                func: chosen,
                instanceid: iid,
            });
        }
        Ok(())
    }

    // ---- intrinsics ------------------------------------------------------

    fn intrinsic_named(&mut self, lvid: u32, name: &str) -> CResult<()> {
        let args = core::mem::take(&mut self.pushed);

        // a pending short-circuit marker is consumed by the and/or it
        // belongs to; intrinsics evaluating the second operand in between
        // must leave it alone
        if name == "and" || name == "or" {
            if let Some(mut sc) = self.short_circuit.take() {
                sc.is_and = name == "and";
                return self.short_circuit_lowering(lvid, sc, &args);
            }
        }

        // object-level intrinsics bypass the unboxing builtin path
        match name {
            "ref" | "unref" => return self.refcount_intrinsic(lvid, name, &args),
            "sizeof" => return self.sizeof_intrinsic(lvid, &args),
            _ => {}
        }

        if let Some(builtin) = intrinsics::find_builtin(name) {
            return self.builtin_lowering(lvid, name, builtin, &args);
        }
        if let Some(proto) = self.build.intrinsics.find(name) {
            return self.user_intrinsic(lvid, &proto, &args);
        }
        let known: Vec<String> = (0..self.build.intrinsics.len())
            .filter_map(|i| self.build.intrinsics.get(i as u32).map(|p| p.name))
            .chain(intrinsics::BUILTINS.iter().map(|b| b.name.to_owned()))
            .collect();
        let suggestion =
            crate::suggest::nearest(name, known.iter().map(String::as_str)).map(String::from);
        let failed = self.error(format!("unknown intrinsic '{name}'"));
        if let Some(better) = suggestion {
            if let Some(msg) = self.build.report.entries.last_mut() {
                msg.suggest(format!("did you mean '{better}'?"));
            }
        }
        Err(failed)
    }

    fn refcount_intrinsic(&mut self, lvid: u32, name: &str, args: &[CallArg]) -> CResult<()> {
        if args.len() != 1 {
            return Err(self.error(format!("intrinsic '{name}' takes one operand")));
        }
        let operand = args[0].lvid;
        let cdef = self.cdef(operand);
        if !Self::is_object(&cdef) {
            return Err(self.error(format!("intrinsic '{name}': '{cdef}' is not an object")));
        }
        if name == "ref" {
            self.emit(Instr::Ref { lvid: operand });
        } else {
            let (da, di) = self.dtor_of(cdef.atom)?;
            self.emit(Instr::Unref {
                lvid: operand,
                atomid: da,
                instanceid: di,
            });
        }
        self.local(lvid).cdef = Classdef::void();
        Ok(())
    }

    fn sizeof_intrinsic(&mut self, lvid: u32, args: &[CallArg]) -> CResult<()> {
        if args.len() != 1 {
            return Err(self.error("intrinsic 'sizeof' takes one operand".into()));
        }
        let cdef = self.cdef(args[0].lvid);
        let size = if cdef.has_atom() {
            self.build.atoms.class_size(cdef.atom)
        } else if cdef.is_builtin() {
            cdef.kind.size_bytes()
        } else {
            return Err(self.error(format!("intrinsic 'sizeof': no size for '{cdef}'")));
        };
        self.emit(Instr::StoreConstant { lvid, value: size });
        self.local(lvid).cdef = Classdef::builtin(CType::U64);
        Ok(())
    }

    fn short_circuit_lowering(
        &mut self,
        lvid: u32,
        sc: ShortCircuit,
        args: &[CallArg],
    ) -> CResult<()> {
        if args.len() != 2 {
            return Err(self.ice("short-circuit form takes exactly two operands".into()));
        }
        let (a, b) = (args[0].lvid, args[1].lvid);
        for &operand in &[a, b] {
            let kind = self.require_builtin(operand, "boolean operand")?;
            if kind != CType::Bool {
                return Err(self.error(format!("expected a bool operand, got {kind}")));
            }
        }
        if self.codegen_off == 0 {
            if sc.nops.len() != 2 {
                return Err(self.ice("short-circuit marker without nop padding".into()));
            }
            self.out.patch(sc.nops[0], Instr::Store { lvid, source: a });
            let jump = if sc.is_and {
                Instr::Jz {
                    lvid,
                    label: sc.label,
                }
            } else {
                Instr::Jnz {
                    lvid,
                    label: sc.label,
                }
            };
            self.out.patch(sc.nops[1], jump);
            self.emit(Instr::Store { lvid, source: b });
        }
        self.local(lvid).cdef = Classdef::builtin(CType::Bool);
        Ok(())
    }

    fn builtin_lowering(
        &mut self,
        lvid: u32,
        name: &str,
        builtin: &'static intrinsics::BuiltinIntrinsic,
        args: &[CallArg],
    ) -> CResult<()> {
        if args.len() != builtin.argc {
            return Err(self.error(format!(
                "intrinsic '{name}' takes {} operand(s), got {}",
                builtin.argc,
                args.len()
            )));
        }
        // settle literal operands against the first concrete operand,
        // counting a boxed operand as its boxed kind; pointers never
        // absorb literals (sizes and patterns stay integer)
        let concrete = args.iter().find_map(|a| {
            if a.cdef.literal {
                return None;
            }
            let kind = if a.cdef.is_builtin() {
                Some(a.cdef.kind)
            } else {
                self.build.atoms.boxed_kind(a.cdef.atom)
            };
            kind.filter(|&k| k != CType::Ptr)
        });
        let mut lowered = Vec::with_capacity(args.len());
        for (i, arg) in args.iter().enumerate() {
            let cdef = self.cdef(arg.lvid);
            let operand = if cdef.is_builtin() || cdef.literal {
                if let Some(kind) = concrete {
                    self.adapt_literal(arg.lvid, kind);
                }
                let kind = self.cdef(arg.lvid).kind;
                let kind = if kind == CType::Any { CType::U64 } else { kind };
                self.local(arg.lvid).cdef.kind = kind;
                BuiltinArg {
                    lvid: arg.lvid,
                    kind,
                }
            } else if Self::is_object(&cdef) {
                // unbox: the raw value lives in field 0 of the box
                match self.build.atoms.boxed_kind(cdef.atom) {
                    Some(kind) => {
                        let tmp = self.temp();
                        self.emit(Instr::Fieldget {
                            lvid: tmp,
                            self_lvid: arg.lvid,
                            index: 0,
                        });
                        self.local(tmp).cdef = Classdef::builtin(kind);
                        BuiltinArg { lvid: tmp, kind }
                    }
                    None => {
                        return Err(self.error(format!(
                            "intrinsic '{name}': operand {} is '{cdef}', expected a builtin",
                            i + 1
                        )));
                    }
                }
            } else {
                return Err(self.error(format!(
                    "intrinsic '{name}': operand {} is '{cdef}', expected a builtin",
                    i + 1
                )));
            };
            lowered.push(operand);
        }
        if self.codegen_off == 0 {
            let spare = self.temp();
            let mut ctx = Lowering {
                out: &mut self.out,
                lvid,
                spare,
                args: &lowered,
            };
            match (builtin.lower)(&mut ctx) {
                Ok(kind) => {
                    self.local(lvid).cdef = if kind == CType::Void {
                        Classdef::void()
                    } else {
                        Classdef::builtin(kind)
                    };
                }
                Err(text) => {
                    return Err(self.error(format!("intrinsic '{name}': {text}")));
                }
            }
        } else {
            // type-check-only regions still need the result type
            let kind = lowered.first().map_or(CType::U64, |a| a.kind);
            self.local(lvid).cdef = Classdef::builtin(kind);
        }
        Ok(())
    }

    fn user_intrinsic(
        &mut self,
        lvid: u32,
        proto: &crate::intrinsics::IntrinsicPrototype,
        args: &[CallArg],
    ) -> CResult<()> {
        if args.len() != proto.params.len() {
            return Err(self.error(format!(
                "intrinsic '{}' takes {} argument(s), got {}",
                proto.name,
                proto.params.len(),
                args.len()
            )));
        }
        for (i, (arg, &expected)) in args.iter().zip(&proto.params).enumerate() {
            self.adapt_literal(arg.lvid, expected);
            let kind = self.require_builtin(arg.lvid, "intrinsic argument")?;
            if kind != expected {
                return Err(self.error(format!(
                    "intrinsic '{}': argument {} is {kind}, expected {expected}",
                    proto.name,
                    i + 1
                )));
            }
        }
        for arg in args {
            self.emit(Instr::Push {
                lvid: arg.lvid,
                name: 0,
            });
        }
        self.emit(Instr::Intrinsic {
            lvid,
            id: proto.id,
            name: 0,
        });
        self.local(lvid).cdef = if proto.rettype == CType::Void {
            Classdef::void()
        } else {
            Classdef::builtin(proto.rettype)
        };
        Ok(())
    }

    fn intrinsic_by_id(&mut self, lvid: u32, id: u32) -> CResult<()> {
        let Some(proto) = self.build.intrinsics.get(id) else {
            return Err(self.ice(format!("unknown intrinsic id {id}")));
        };
        let args = core::mem::take(&mut self.pushed);
        self.user_intrinsic(lvid, &proto, &args)
    }

    // ---- assignment ------------------------------------------------------

    /// Assignment strategy selection: raw register copy for builtins,
    /// acquire-then-release reference assignment for `ref` objects, deep
    /// copy for value-semantics objects. Acquire-before-release makes
    /// `a = a` safe.
    fn assign(&mut self, lhs: u32, rhs: u32, dispose_lhs: bool) -> CResult<()> {
        self.mark_used(rhs);
        let rhs_cdef = self.cdef(rhs);
        let lhs_local = self.local(lhs).clone();

        match lhs_local.alias {
            Some(Alias::Field { self_lvid, index }) => {
                self.assign_field(self_lvid, index, lhs, rhs, &rhs_cdef, dispose_lhs)
            }
            Some(Alias::Local(var)) => self.assign_local(var, lhs, rhs, &rhs_cdef, dispose_lhs),
            None => self.assign_local(lhs, lhs, rhs, &rhs_cdef, dispose_lhs),
        }
    }

    fn assign_local(
        &mut self,
        var: u32,
        expr: u32,
        rhs: u32,
        rhs_cdef: &Classdef,
        dispose_lhs: bool,
    ) -> CResult<()> {
        let target = self.cdef(var);
        if !target.is_any() {
            // adapt literals, then the types must agree
            if rhs_cdef.literal && target.is_builtin() {
                self.adapt_literal(rhs, target.kind);
            } else {
                let check = rhs_cdef.compare(&target, |a| self.build.atoms.boxed_kind(a));
                if check == TypeCheck::None {
                    return Err(self.error(format!(
                        "cannot assign '{rhs_cdef}' to '{target}'"
                    )));
                }
            }
        }
        let effective = if target.is_any() {
            rhs_cdef.clone()
        } else {
            target.clone()
        };
        // a compare that accepted boxing must actually box the value
        let rhs = self.adapt_to(rhs, &effective)?;

        if Self::is_object(&effective) {
            if effective.qualifiers.by_ref {
                // acquire first so self-assignment cannot free the value
                self.emit(Instr::Ref { lvid: rhs });
                if dispose_lhs {
                    let (da, di) = self.dtor_of(effective.atom)?;
                    self.emit(Instr::Unref {
                        lvid: var,
                        atomid: da,
                        instanceid: di,
                    });
                }
                self.emit(Instr::Store { lvid: var, source: rhs });
            } else {
                // value semantics: fresh storage, then the clone operator
                lifecycle::instantiate_class(self.build, effective.atom, &[])?;
                let Some((ka, ki)) = self
                    .build
                    .atoms
                    .get(effective.atom)
                    .and_then(|a| a.classinfo.clone)
                else {
                    return Err(self.ice(format!(
                        "class atom:{} has no clone operator",
                        effective.atom
                    )));
                };
                let fresh = self.temp();
                self.emit(Instr::Allocate {
                    lvid: fresh,
                    atomid: effective.atom,
                });
                self.local(fresh).cdef = effective.clone();
                self.emit(Instr::Push { lvid: fresh, name: 0 });
                self.emit(Instr::Push { lvid: rhs, name: 0 });
                let ignored = self.temp();
                self.emit(Instr::Call {
                    lvid: ignored,
                    func: ka,
                    instanceid: ki,
                });
                if dispose_lhs {
                    let (da, di) = self.dtor_of(effective.atom)?;
                    self.emit(Instr::Unref {
                        lvid: var,
                        atomid: da,
                        instanceid: di,
                    });
                }
                self.emit(Instr::Store {
                    lvid: var,
                    source: fresh,
                });
            }
            self.track(var);
        } else {
            self.emit(Instr::Store { lvid: var, source: rhs });
        }

        let final_cdef = if Self::is_object(&effective) {
            effective
        } else {
            self.cdef(rhs)
        };
        self.local(var).cdef = final_cdef.clone();
        if expr != var {
            self.local(expr).cdef = final_cdef;
        }
        Ok(())
    }

    fn assign_field(
        &mut self,
        self_lvid: u32,
        index: u32,
        expr: u32,
        rhs: u32,
        rhs_cdef: &Classdef,
        dispose_lhs: bool,
    ) -> CResult<()> {
        let target = self.cdef(expr);
        if !target.is_any() {
            if rhs_cdef.literal && target.is_builtin() {
                self.adapt_literal(rhs, target.kind);
            } else {
                let check = rhs_cdef.compare(&target, |a| self.build.atoms.boxed_kind(a));
                if check == TypeCheck::None {
                    return Err(self.error(format!(
                        "cannot assign '{rhs_cdef}' to member of type '{target}'"
                    )));
                }
            }
        }
        let effective = if target.is_any() {
            rhs_cdef.clone()
        } else {
            target
        };
        let rhs = self.adapt_to(rhs, &effective)?;
        if Self::is_object(&effective) {
            self.emit(Instr::Ref { lvid: rhs });
            if dispose_lhs {
                let (da, di) = self.dtor_of(effective.atom)?;
                let old = self.temp();
                self.emit(Instr::Fieldget {
                    lvid: old,
                    self_lvid,
                    index,
                });
                self.emit(Instr::Unref {
                    lvid: old,
                    atomid: da,
                    instanceid: di,
                });
            }
        }
        self.emit(Instr::Fieldset {
            lvid: rhs,
            self_lvid,
            index,
        });
        self.local(expr).cdef = effective;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinGroup {
    Arith,
    Cmp,
    Bits,
    Unary,
    Memory,
}

fn binop_group(op: Op) -> Option<BinGroup> {
    use Op::*;
    Some(match op {
        Add | Sub | Mul | Div | Imul | Idiv | Fadd | Fsub | Fmul | Fdiv => BinGroup::Arith,
        Eq | Neq | Lt | Lte | Gt | Gte | Ilt | Ilte | Igt | Igte | Flt | Flte | Fgt | Fgte => {
            BinGroup::Cmp
        }
        Band | Bor | Bxor | Lsl | Lsr => BinGroup::Bits,
        Negate | Bnot => BinGroup::Unary,
        Memalloc | Memfree | Memrealloc | Memfill | Memcopy | Memmove | Memcmp | Cstrlen
        | Load | StoreMem => BinGroup::Memory,
        _ => return None,
    })
}
