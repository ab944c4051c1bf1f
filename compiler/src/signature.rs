//! Instantiation cache keys.
//!
//! A signature captures everything that distinguishes one instantiation
//! of an atom from another: the resolved types of its parameters and
//! template parameters. Two calls producing the same signature share one
//! cache entry, one resolved sequence and one instance id.

use ir::CType;

use crate::atoms::AtomId;
use crate::types::Classdef;

/// One resolved parameter type, flattened for hashing. Constraint lists
/// never survive into a signature: a signature is only built from fully
/// resolved classdefs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SignatureParam {
    pub kind: CType,
    pub atom: AtomId,
    pub by_ref: bool,
    pub constant: bool,
}

impl SignatureParam {
    pub fn of(cdef: &Classdef) -> Self {
        debug_assert!(!cdef.has_constraints());
        Self {
            kind: cdef.kind,
            atom: cdef.atom,
            by_ref: cdef.qualifiers.by_ref,
            constant: cdef.qualifiers.constant,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Signature {
    pub parameters: Vec<SignatureParam>,
    pub tmplparams: Vec<SignatureParam>,
}

impl Signature {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_classdefs(params: &[Classdef], tmplparams: &[Classdef]) -> Self {
        Self {
            parameters: params.iter().map(SignatureParam::of).collect(),
            tmplparams: tmplparams.iter().map(SignatureParam::of).collect(),
        }
    }

    pub fn push_param(&mut self, cdef: &Classdef) {
        self.parameters.push(SignatureParam::of(cdef));
    }

    pub fn push_tmplparam(&mut self, cdef: &Classdef) {
        self.tmplparams.push(SignatureParam::of(cdef));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn equal_types_share_a_key() {
        let a = Signature::from_classdefs(&[Classdef::builtin(CType::I32)], &[]);
        let b = Signature::from_classdefs(&[Classdef::builtin(CType::I32)], &[]);
        let mut map = HashMap::new();
        map.insert(a, 1u32);
        assert_eq!(map.get(&b), Some(&1));
    }

    #[test]
    fn distinct_types_get_distinct_keys() {
        let a = Signature::from_classdefs(&[Classdef::builtin(CType::I32)], &[]);
        let b = Signature::from_classdefs(&[Classdef::builtin(CType::F64)], &[]);
        assert_ne!(a, b);
    }

    #[test]
    fn template_params_participate() {
        let a = Signature::from_classdefs(&[], &[Classdef::builtin(CType::I32)]);
        let b = Signature::from_classdefs(&[], &[Classdef::object(4)]);
        assert_ne!(a, b);
    }
}
