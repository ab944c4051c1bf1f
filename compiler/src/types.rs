//! Type descriptors attached to registers during instantiation.
//!
//! A [`Classdef`] is the type of one register: a builtin kind, a class
//! instance, or `any` (not yet pinned down) plus qualifiers and
//! unresolved constraints. Classdefs are value types here; the builder
//! copies them freely between its per-frame register tables.

use core::fmt;

use ir::CType;

use crate::atoms::AtomId;

/// Fully qualified register id: an atom plus a local register inside one
/// of its instantiations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Clid {
    pub atomid: AtomId,
    pub lvid: u32,
}

impl Clid {
    pub const fn new(atomid: AtomId, lvid: u32) -> Self {
        Self { atomid, lvid }
    }
}

impl fmt::Display for Clid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}:{}}}", self.atomid, self.lvid)
    }
}

/// Reference, constness and nullability bits.
///
/// Objects are by-reference by default; builtins ignore the ref bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Qualifiers {
    pub by_ref: bool,
    pub constant: bool,
    pub nullable: bool,
}

impl Default for Qualifiers {
    fn default() -> Self {
        Self {
            by_ref: true,
            constant: false,
            nullable: false,
        }
    }
}

/// One unresolved interface requirement: the type must expose a callable
/// member with this name and arity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceConstraint {
    pub name: String,
    pub argc: u32,
}

/// Deferred type-inference edges recorded before resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FollowConstraint {
    /// Must extend (be compatible with) the type at `clid`.
    Extends(Clid),
    /// Must match the n-th parameter of the callable at `clid`.
    PushedIndexed { clid: Clid, index: u32 },
    /// Must match the named parameter of the callable at `clid`.
    PushedNamed { clid: Clid, name: String },
}

/// Outcome of comparing two classdefs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeCheck {
    /// Incompatible.
    None,
    /// Compatible through an implicit conversion (boxing, `any`).
    Equal,
    /// Identical kind and atom.
    StrictEqual,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Classdef {
    /// Builtin kind; `Any` when the type is an object or undetermined.
    pub kind: CType,
    /// Class atom when the type is (or must be) an object; 0 otherwise.
    pub atom: AtomId,
    /// Whether this describes a value of the type rather than the type
    /// itself (a class identifier before a constructor call).
    pub instance: bool,
    /// Numeric literal whose concrete kind is still negotiable.
    pub literal: bool,
    pub qualifiers: Qualifiers,
    pub interface: Vec<InterfaceConstraint>,
    pub followup: Vec<FollowConstraint>,
}

impl Default for Classdef {
    fn default() -> Self {
        Self {
            kind: CType::Any,
            atom: 0,
            instance: false,
            literal: false,
            qualifiers: Qualifiers::default(),
            interface: Vec::new(),
            followup: Vec::new(),
        }
    }
}

impl Classdef {
    pub fn builtin(kind: CType) -> Self {
        Self {
            kind,
            instance: true,
            ..Self::default()
        }
    }

    pub fn object(atom: AtomId) -> Self {
        Self {
            atom,
            instance: true,
            ..Self::default()
        }
    }

    pub fn void() -> Self {
        Self::builtin(CType::Void)
    }

    pub fn literal_of(kind: CType) -> Self {
        Self {
            literal: true,
            ..Self::builtin(kind)
        }
    }

    pub fn is_void(&self) -> bool {
        self.kind == CType::Void
    }

    /// Undetermined: neither a builtin nor pinned to an atom.
    pub fn is_any(&self) -> bool {
        self.kind == CType::Any && self.atom == 0
    }

    pub fn is_builtin(&self) -> bool {
        !matches!(self.kind, CType::Any | CType::Void)
    }

    pub fn has_atom(&self) -> bool {
        self.atom != 0
    }

    /// An atom-backed classdef is never simultaneously builtin. The
    /// mutators keep this true; the check is for assertions at seams.
    pub fn is_coherent(&self) -> bool {
        !(self.has_atom() && self.is_builtin())
    }

    pub fn has_constraints(&self) -> bool {
        !self.interface.is_empty() || !self.followup.is_empty()
    }

    /// Pin this classdef to a builtin kind, dropping any atom binding.
    pub fn mutate_to_builtin(&mut self, kind: CType) {
        self.kind = kind;
        self.atom = 0;
        self.instance = true;
        self.literal = false;
    }

    /// Pin this classdef to an instance of a class atom.
    pub fn mutate_to_atom(&mut self, atom: AtomId) {
        self.kind = CType::Any;
        self.atom = atom;
        self.instance = true;
        self.literal = false;
    }

    pub fn mutate_to_void(&mut self) {
        self.kind = CType::Void;
        self.atom = 0;
        self.instance = false;
        self.literal = false;
    }

    /// Three-way comparison against a target type, used by overload
    /// resolution and assignment checking. `boxed_atom_of` maps a class
    /// atom to the builtin kind it boxes, when it boxes one.
    pub fn compare(&self, target: &Classdef, boxed_atom_of: impl Fn(AtomId) -> Option<CType>) -> TypeCheck {
        // an unconstrained target accepts anything
        if target.is_any() && !target.has_constraints() {
            return if self.is_any() {
                TypeCheck::StrictEqual
            } else {
                TypeCheck::Equal
            };
        }
        if self.kind == target.kind && self.atom == target.atom {
            return TypeCheck::StrictEqual;
        }
        // literals adapt to any numeric builtin or numeric box
        if self.literal {
            if target.is_builtin() && !matches!(target.kind, CType::Ptr) {
                return TypeCheck::Equal;
            }
            if target.has_atom() {
                if let Some(kind) = boxed_atom_of(target.atom) {
                    if !matches!(kind, CType::Ptr) {
                        return TypeCheck::Equal;
                    }
                }
            }
        }
        // builtin vs the class that boxes it, either direction
        if self.is_builtin() && boxed_atom_of(target.atom) == Some(self.kind) {
            return TypeCheck::Equal;
        }
        if target.is_builtin() && boxed_atom_of(self.atom) == Some(target.kind) {
            return TypeCheck::Equal;
        }
        TypeCheck::None
    }
}

impl fmt::Display for Classdef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_builtin() || self.is_void() {
            write!(f, "{}", self.kind)
        } else if self.has_atom() {
            write!(f, "class atom:{}", self.atom)
        } else {
            write!(f, "any")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_box(_: AtomId) -> Option<CType> {
        None
    }

    #[test]
    fn identical_builtins_are_strict_equal() {
        let a = Classdef::builtin(CType::I32);
        let b = Classdef::builtin(CType::I32);
        assert_eq!(a.compare(&b, no_box), TypeCheck::StrictEqual);
    }

    #[test]
    fn distinct_builtins_do_not_match() {
        let a = Classdef::builtin(CType::I32);
        let b = Classdef::builtin(CType::F64);
        assert_eq!(a.compare(&b, no_box), TypeCheck::None);
    }

    #[test]
    fn unconstrained_any_accepts_everything() {
        let any = Classdef::default();
        let b = Classdef::builtin(CType::U8);
        assert_eq!(b.compare(&any, no_box), TypeCheck::Equal);
        assert_eq!(any.compare(&any, no_box), TypeCheck::StrictEqual);
    }

    #[test]
    fn builtin_matches_its_box_both_ways() {
        let boxes = |atom: AtomId| (atom == 7).then_some(CType::I32);
        let raw = Classdef::builtin(CType::I32);
        let boxed = Classdef::object(7);
        assert_eq!(raw.compare(&boxed, boxes), TypeCheck::Equal);
        assert_eq!(boxed.compare(&raw, boxes), TypeCheck::Equal);
        let other = Classdef::builtin(CType::U8);
        assert_eq!(other.compare(&boxed, boxes), TypeCheck::None);
    }

    #[test]
    fn literal_adapts_to_numeric_targets() {
        let lit = Classdef::literal_of(CType::U64);
        let target = Classdef::builtin(CType::I16);
        assert_eq!(lit.compare(&target, no_box), TypeCheck::Equal);
        let ptr = Classdef::builtin(CType::Ptr);
        assert_eq!(lit.compare(&ptr, no_box), TypeCheck::None);
    }

    #[test]
    fn atom_and_builtin_binding_stay_exclusive() {
        let mut cdef = Classdef::object(3);
        assert!(cdef.is_coherent());
        cdef.mutate_to_builtin(CType::U32);
        assert!(cdef.is_coherent());
        assert!(!cdef.has_atom());
        cdef.mutate_to_atom(5);
        assert!(cdef.is_coherent());
        assert!(!cdef.is_builtin());
    }
}
