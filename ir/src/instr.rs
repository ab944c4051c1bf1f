use core::fmt;

use crate::op::{BlueprintKind, Op, PragmaKind, QualifierKind};
use crate::CType;

/// One encoded instruction word: opcode plus three operand lanes.
///
/// Exactly 16 bytes regardless of opcode; this is a wire-format invariant
/// for any serialization of sequences.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct Instruction {
    pub opcode: u32,
    pub a: u32,
    pub b: u32,
    pub c: u32,
}

const _: () = assert!(core::mem::size_of::<Instruction>() == 16);

impl Instruction {
    pub const fn new(opcode: Op, a: u32, b: u32, c: u32) -> Self {
        Self {
            opcode: opcode as u32,
            a,
            b,
            c,
        }
    }
}

/// Decoding failure: the stream is malformed.
///
/// This is always an internal error, never a user-facing diagnostic; the
/// compiler reports it as an ICE and the executor as a fault.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("invalid opcode word 0x{word:08x} at offset {offset}")]
    InvalidOpcode { word: u32, offset: u32 },
    #[error("invalid ctype tag {tag} in {op} at offset {offset}")]
    InvalidCType { op: Op, tag: u32, offset: u32 },
    #[error("invalid blueprint kind {kind} at offset {offset}")]
    InvalidBlueprintKind { kind: u32, offset: u32 },
    #[error("invalid qualifier tag {tag} at offset {offset}")]
    InvalidQualifier { tag: u32, offset: u32 },
    #[error("invalid pragma tag {tag} at offset {offset}")]
    InvalidPragma { tag: u32, offset: u32 },
    #[error("offset {offset} out of bounds (sequence size {size})")]
    OutOfBounds { offset: u32, size: u32 },
    #[error("blueprint at offset {offset} is not followed by a blueprintsize pragma")]
    MissingBlueprintSize { offset: u32 },
}

/// Sub-tagged payload of the `pragma` opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pragma {
    /// Toggle code generation (type-check-only regions when disabled).
    Codegen { enabled: bool },
    /// Instruction count of the blueprint body that precedes this pragma.
    /// Always the instruction immediately after a `blueprint`.
    BlueprintSize { size: u32 },
    Visibility { level: u32 },
    /// Marks the end of the signature region of a funcdef blueprint.
    BodyStart,
    /// Two `nop` words follow; the builder patches them into a conditional
    /// jump to `label` when lowering a short-circuiting `and`/`or`.
    ShortCircuit { label: u32 },
    /// The enclosing funcdef is an alias for the named builtin intrinsic.
    BuiltinAlias { name: u32 },
    /// Whether the enclosing declaration may be offered in
    /// "did you mean" suggestions.
    Suggest { enabled: bool },
    /// Marks the declaration owning `lvid` as compiler-generated
    /// (captured-variable candidates and synthesized members).
    Synthetic { lvid: u32 },
}

/// A fully decoded instruction.
///
/// The register-id fields (`lvid`, `lhs`, `rhs`, ...) index into the
/// current call frame's register window. `sref` fields index the owning
/// sequence's string table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instr {
    Nop,

    /// Put a 64-bit immediate into a register.
    StoreConstant { lvid: u32, value: u64 },
    /// Put a string-table reference into a register.
    StoreText { lvid: u32, text: u32 },
    /// Register-to-register copy.
    Store { lvid: u32, source: u32 },

    Add { lvid: u32, lhs: u32, rhs: u32 },
    Sub { lvid: u32, lhs: u32, rhs: u32 },
    Mul { lvid: u32, lhs: u32, rhs: u32 },
    Div { lvid: u32, lhs: u32, rhs: u32 },
    Imul { lvid: u32, lhs: u32, rhs: u32 },
    Idiv { lvid: u32, lhs: u32, rhs: u32 },
    Fadd { lvid: u32, lhs: u32, rhs: u32 },
    Fsub { lvid: u32, lhs: u32, rhs: u32 },
    Fmul { lvid: u32, lhs: u32, rhs: u32 },
    Fdiv { lvid: u32, lhs: u32, rhs: u32 },

    Eq { lvid: u32, lhs: u32, rhs: u32 },
    Neq { lvid: u32, lhs: u32, rhs: u32 },
    Lt { lvid: u32, lhs: u32, rhs: u32 },
    Lte { lvid: u32, lhs: u32, rhs: u32 },
    Gt { lvid: u32, lhs: u32, rhs: u32 },
    Gte { lvid: u32, lhs: u32, rhs: u32 },
    Ilt { lvid: u32, lhs: u32, rhs: u32 },
    Ilte { lvid: u32, lhs: u32, rhs: u32 },
    Igt { lvid: u32, lhs: u32, rhs: u32 },
    Igte { lvid: u32, lhs: u32, rhs: u32 },
    Flt { lvid: u32, lhs: u32, rhs: u32 },
    Flte { lvid: u32, lhs: u32, rhs: u32 },
    Fgt { lvid: u32, lhs: u32, rhs: u32 },
    Fgte { lvid: u32, lhs: u32, rhs: u32 },

    Band { lvid: u32, lhs: u32, rhs: u32 },
    Bor { lvid: u32, lhs: u32, rhs: u32 },
    Bxor { lvid: u32, lhs: u32, rhs: u32 },
    Lsl { lvid: u32, lhs: u32, rhs: u32 },
    Lsr { lvid: u32, lhs: u32, rhs: u32 },
    Negate { lvid: u32, operand: u32 },
    Bnot { lvid: u32, operand: u32 },

    /// Jump target. Label ids grow monotonically along the forward
    /// direction within one blueprint body.
    Label { id: u32 },
    Jmp { label: u32 },
    Jz { lvid: u32, label: u32 },
    Jnz { lvid: u32, label: u32 },
    Assert { lvid: u32 },
    Ret { lvid: u32 },

    Memalloc { lvid: u32, regsize: u32 },
    Memfree { lvid: u32, regsize: u32 },
    Memrealloc { lvid: u32, oldsize: u32, newsize: u32 },
    Memfill { lvid: u32, regsize: u32, pattern: u32 },
    Memcopy { lvid: u32, src: u32, regsize: u32 },
    Memmove { lvid: u32, src: u32, regsize: u32 },
    Memcmp { lvid: u32, src: u32, regsize: u32 },
    Cstrlen { lvid: u32, ptr: u32 },
    Load { lvid: u32, ptr: u32, ctype: CType },
    StoreMem { ptr: u32, lvid: u32, ctype: CType },

    /// Allocate one instance of a class; the refcount word starts at 1.
    Allocate { lvid: u32, atomid: u32 },
    /// Run the destructor and free, ignoring the refcount.
    Dispose { lvid: u32, atomid: u32, instanceid: u32 },
    Ref { lvid: u32 },
    /// Decrement; on zero, dispatch the destructor `{atomid, instanceid}`
    /// and free.
    Unref { lvid: u32, atomid: u32, instanceid: u32 },
    Fieldget { lvid: u32, self_lvid: u32, index: u32 },
    Fieldset { lvid: u32, self_lvid: u32, index: u32 },

    /// Queue one call argument. `name` is 0 for positional arguments.
    Push { lvid: u32, name: u32 },
    /// Queue one template (generic) argument. Compiler-only.
    Tpush { lvid: u32, name: u32 },
    /// `instanceid == u32::MAX` means unresolved: `func` is the register
    /// previously filled by `identify`. Otherwise `func` is an atom id and
    /// the call is fully resolved.
    Call { lvid: u32, func: u32, instanceid: u32 },
    /// `name != 0` means unresolved (a string ref); otherwise `id` indexes
    /// the registered intrinsic catalog.
    Intrinsic { lvid: u32, id: u32, name: u32 },
    /// Register window size of the enclosing body. Must be the second
    /// instruction of every blueprint body (right after the
    /// blueprintsize pragma).
    Stacksize { count: u32 },

    /// Resolve `name` in the scope of `self_lvid` (0 = lexical scope) and
    /// bind the outcome to `lvid`.
    Identify { lvid: u32, self_lvid: u32, name: u32 },
    /// Like `identify` but for the assignment side of a property.
    IdentifySet { lvid: u32, self_lvid: u32, name: u32 },
    Ensureresolved { lvid: u32 },
    Commontype { lvid: u32, previous: u32 },
    Assign { lhs: u32, rhs: u32, dispose_lhs: bool },
    SelfPtr { lvid: u32 },
    /// Type-inference edge: `lvid`'s classdef follows `follower`'s.
    Follow { lvid: u32, follower: u32, symlink: bool },
    /// Declaration header. `lvid` holds the declared local id for
    /// param/tmplparam/vardef kinds, the atom id once mapped otherwise.
    Blueprint { kind: BlueprintKind, name: u32, lvid: u32 },
    Classdefsizeof { lvid: u32, atomid: u32 },
    Qualifiers { lvid: u32, qualifier: QualifierKind, on: bool },
    Debugfile { filename: u32 },
    Debugpos { line: u32, offset: u32 },
    Namealias { lvid: u32, name: u32 },
    Comment { text: u32 },
    Scope,
    End,
    Typeisobject { lvid: u32 },
    Pragma(Pragma),
}

impl Instr {
    pub const fn op(&self) -> Op {
        match self {
            Instr::Nop => Op::Nop,
            Instr::StoreConstant { .. } => Op::StoreConstant,
            Instr::StoreText { .. } => Op::StoreText,
            Instr::Store { .. } => Op::Store,
            Instr::Add { .. } => Op::Add,
            Instr::Sub { .. } => Op::Sub,
            Instr::Mul { .. } => Op::Mul,
            Instr::Div { .. } => Op::Div,
            Instr::Imul { .. } => Op::Imul,
            Instr::Idiv { .. } => Op::Idiv,
            Instr::Fadd { .. } => Op::Fadd,
            Instr::Fsub { .. } => Op::Fsub,
            Instr::Fmul { .. } => Op::Fmul,
            Instr::Fdiv { .. } => Op::Fdiv,
            Instr::Eq { .. } => Op::Eq,
            Instr::Neq { .. } => Op::Neq,
            Instr::Lt { .. } => Op::Lt,
            Instr::Lte { .. } => Op::Lte,
            Instr::Gt { .. } => Op::Gt,
            Instr::Gte { .. } => Op::Gte,
            Instr::Ilt { .. } => Op::Ilt,
            Instr::Ilte { .. } => Op::Ilte,
            Instr::Igt { .. } => Op::Igt,
            Instr::Igte { .. } => Op::Igte,
            Instr::Flt { .. } => Op::Flt,
            Instr::Flte { .. } => Op::Flte,
            Instr::Fgt { .. } => Op::Fgt,
            Instr::Fgte { .. } => Op::Fgte,
            Instr::Band { .. } => Op::Band,
            Instr::Bor { .. } => Op::Bor,
            Instr::Bxor { .. } => Op::Bxor,
            Instr::Lsl { .. } => Op::Lsl,
            Instr::Lsr { .. } => Op::Lsr,
            Instr::Negate { .. } => Op::Negate,
            Instr::Bnot { .. } => Op::Bnot,
            Instr::Label { .. } => Op::Label,
            Instr::Jmp { .. } => Op::Jmp,
            Instr::Jz { .. } => Op::Jz,
            Instr::Jnz { .. } => Op::Jnz,
            Instr::Assert { .. } => Op::Assert,
            Instr::Ret { .. } => Op::Ret,
            Instr::Memalloc { .. } => Op::Memalloc,
            Instr::Memfree { .. } => Op::Memfree,
            Instr::Memrealloc { .. } => Op::Memrealloc,
            Instr::Memfill { .. } => Op::Memfill,
            Instr::Memcopy { .. } => Op::Memcopy,
            Instr::Memmove { .. } => Op::Memmove,
            Instr::Memcmp { .. } => Op::Memcmp,
            Instr::Cstrlen { .. } => Op::Cstrlen,
            Instr::Load { .. } => Op::Load,
            Instr::StoreMem { .. } => Op::StoreMem,
            Instr::Allocate { .. } => Op::Allocate,
            Instr::Dispose { .. } => Op::Dispose,
            Instr::Ref { .. } => Op::Ref,
            Instr::Unref { .. } => Op::Unref,
            Instr::Fieldget { .. } => Op::Fieldget,
            Instr::Fieldset { .. } => Op::Fieldset,
            Instr::Push { .. } => Op::Push,
            Instr::Tpush { .. } => Op::Tpush,
            Instr::Call { .. } => Op::Call,
            Instr::Intrinsic { .. } => Op::Intrinsic,
            Instr::Stacksize { .. } => Op::Stacksize,
            Instr::Identify { .. } => Op::Identify,
            Instr::IdentifySet { .. } => Op::IdentifySet,
            Instr::Ensureresolved { .. } => Op::Ensureresolved,
            Instr::Commontype { .. } => Op::Commontype,
            Instr::Assign { .. } => Op::Assign,
            Instr::SelfPtr { .. } => Op::SelfPtr,
            Instr::Follow { .. } => Op::Follow,
            Instr::Blueprint { .. } => Op::Blueprint,
            Instr::Classdefsizeof { .. } => Op::Classdefsizeof,
            Instr::Qualifiers { .. } => Op::Qualifiers,
            Instr::Debugfile { .. } => Op::Debugfile,
            Instr::Debugpos { .. } => Op::Debugpos,
            Instr::Namealias { .. } => Op::Namealias,
            Instr::Comment { .. } => Op::Comment,
            Instr::Scope => Op::Scope,
            Instr::End => Op::End,
            Instr::Typeisobject { .. } => Op::Typeisobject,
            Instr::Pragma(_) => Op::Pragma,
        }
    }

    pub fn encode(&self) -> Instruction {
        let op = self.op();
        match *self {
            Instr::Nop | Instr::Scope | Instr::End => Instruction::new(op, 0, 0, 0),
            Instr::StoreConstant { lvid, value } => {
                Instruction::new(op, lvid, value as u32, (value >> 32) as u32)
            }
            Instr::StoreText { lvid, text } => Instruction::new(op, lvid, text, 0),
            Instr::Store { lvid, source } => Instruction::new(op, lvid, source, 0),
            Instr::Add { lvid, lhs, rhs }
            | Instr::Sub { lvid, lhs, rhs }
            | Instr::Mul { lvid, lhs, rhs }
            | Instr::Div { lvid, lhs, rhs }
            | Instr::Imul { lvid, lhs, rhs }
            | Instr::Idiv { lvid, lhs, rhs }
            | Instr::Fadd { lvid, lhs, rhs }
            | Instr::Fsub { lvid, lhs, rhs }
            | Instr::Fmul { lvid, lhs, rhs }
            | Instr::Fdiv { lvid, lhs, rhs }
            | Instr::Eq { lvid, lhs, rhs }
            | Instr::Neq { lvid, lhs, rhs }
            | Instr::Lt { lvid, lhs, rhs }
            | Instr::Lte { lvid, lhs, rhs }
            | Instr::Gt { lvid, lhs, rhs }
            | Instr::Gte { lvid, lhs, rhs }
            | Instr::Ilt { lvid, lhs, rhs }
            | Instr::Ilte { lvid, lhs, rhs }
            | Instr::Igt { lvid, lhs, rhs }
            | Instr::Igte { lvid, lhs, rhs }
            | Instr::Flt { lvid, lhs, rhs }
            | Instr::Flte { lvid, lhs, rhs }
            | Instr::Fgt { lvid, lhs, rhs }
            | Instr::Fgte { lvid, lhs, rhs }
            | Instr::Band { lvid, lhs, rhs }
            | Instr::Bor { lvid, lhs, rhs }
            | Instr::Bxor { lvid, lhs, rhs }
            | Instr::Lsl { lvid, lhs, rhs }
            | Instr::Lsr { lvid, lhs, rhs } => Instruction::new(op, lvid, lhs, rhs),
            Instr::Negate { lvid, operand } | Instr::Bnot { lvid, operand } => {
                Instruction::new(op, lvid, operand, 0)
            }
            Instr::Label { id } => Instruction::new(op, id, 0, 0),
            Instr::Jmp { label } => Instruction::new(op, label, 0, 0),
            Instr::Jz { lvid, label } | Instr::Jnz { lvid, label } => {
                Instruction::new(op, lvid, label, 0)
            }
            Instr::Assert { lvid } => Instruction::new(op, lvid, 0, 0),
            Instr::Ret { lvid } => Instruction::new(op, lvid, 0, 0),
            Instr::Memalloc { lvid, regsize } | Instr::Memfree { lvid, regsize } => {
                Instruction::new(op, lvid, regsize, 0)
            }
            Instr::Memrealloc {
                lvid,
                oldsize,
                newsize,
            } => Instruction::new(op, lvid, oldsize, newsize),
            Instr::Memfill {
                lvid,
                regsize,
                pattern,
            } => Instruction::new(op, lvid, regsize, pattern),
            Instr::Memcopy { lvid, src, regsize }
            | Instr::Memmove { lvid, src, regsize }
            | Instr::Memcmp { lvid, src, regsize } => Instruction::new(op, lvid, src, regsize),
            Instr::Cstrlen { lvid, ptr } => Instruction::new(op, lvid, ptr, 0),
            Instr::Load { lvid, ptr, ctype } => Instruction::new(op, lvid, ptr, ctype as u32),
            Instr::StoreMem { ptr, lvid, ctype } => Instruction::new(op, ptr, lvid, ctype as u32),
            Instr::Allocate { lvid, atomid } => Instruction::new(op, lvid, atomid, 0),
            Instr::Dispose {
                lvid,
                atomid,
                instanceid,
            } => Instruction::new(op, lvid, atomid, instanceid),
            Instr::Ref { lvid } => Instruction::new(op, lvid, 0, 0),
            Instr::Unref {
                lvid,
                atomid,
                instanceid,
            } => Instruction::new(op, lvid, atomid, instanceid),
            Instr::Fieldget {
                lvid,
                self_lvid,
                index,
            }
            | Instr::Fieldset {
                lvid,
                self_lvid,
                index,
            } => Instruction::new(op, lvid, self_lvid, index),
            Instr::Push { lvid, name } | Instr::Tpush { lvid, name } => {
                Instruction::new(op, lvid, name, 0)
            }
            Instr::Call {
                lvid,
                func,
                instanceid,
            } => Instruction::new(op, lvid, func, instanceid),
            Instr::Intrinsic { lvid, id, name } => Instruction::new(op, lvid, id, name),
            Instr::Stacksize { count } => Instruction::new(op, count, 0, 0),
            Instr::Identify {
                lvid,
                self_lvid,
                name,
            }
            | Instr::IdentifySet {
                lvid,
                self_lvid,
                name,
            } => Instruction::new(op, lvid, self_lvid, name),
            Instr::Ensureresolved { lvid } => Instruction::new(op, lvid, 0, 0),
            Instr::Commontype { lvid, previous } => Instruction::new(op, lvid, previous, 0),
            Instr::Assign {
                lhs,
                rhs,
                dispose_lhs,
            } => Instruction::new(op, lhs, rhs, dispose_lhs as u32),
            Instr::SelfPtr { lvid } => Instruction::new(op, lvid, 0, 0),
            Instr::Follow {
                lvid,
                follower,
                symlink,
            } => Instruction::new(op, lvid, follower, symlink as u32),
            Instr::Blueprint { kind, name, lvid } => {
                Instruction::new(op, kind as u32, name, lvid)
            }
            Instr::Classdefsizeof { lvid, atomid } => Instruction::new(op, lvid, atomid, 0),
            Instr::Qualifiers {
                lvid,
                qualifier,
                on,
            } => Instruction::new(op, lvid, qualifier as u32, on as u32),
            Instr::Debugfile { filename } => Instruction::new(op, filename, 0, 0),
            Instr::Debugpos { line, offset } => Instruction::new(op, line, offset, 0),
            Instr::Namealias { lvid, name } => Instruction::new(op, lvid, name, 0),
            Instr::Comment { text } => Instruction::new(op, text, 0, 0),
            Instr::Typeisobject { lvid } => Instruction::new(op, lvid, 0, 0),
            Instr::Pragma(pragma) => {
                let (kind, b, c) = match pragma {
                    Pragma::Codegen { enabled } => (PragmaKind::Codegen, enabled as u32, 0),
                    Pragma::BlueprintSize { size } => (PragmaKind::BlueprintSize, size, 0),
                    Pragma::Visibility { level } => (PragmaKind::Visibility, level, 0),
                    Pragma::BodyStart => (PragmaKind::BodyStart, 0, 0),
                    Pragma::ShortCircuit { label } => (PragmaKind::ShortCircuit, label, 0),
                    Pragma::BuiltinAlias { name } => (PragmaKind::BuiltinAlias, name, 0),
                    Pragma::Suggest { enabled } => (PragmaKind::Suggest, enabled as u32, 0),
                    Pragma::Synthetic { lvid } => (PragmaKind::Synthetic, lvid, 0),
                };
                Instruction::new(op, kind as u32, b, c)
            }
        }
    }

    pub fn decode(ins: &Instruction, offset: u32) -> Result<Self, DecodeError> {
        let op = Op::try_from(ins.opcode).map_err(|word| DecodeError::InvalidOpcode {
            word,
            offset,
        })?;
        let (a, b, c) = (ins.a, ins.b, ins.c);
        Ok(match op {
            Op::Nop => Instr::Nop,
            Op::StoreConstant => Instr::StoreConstant {
                lvid: a,
                value: (b as u64) | ((c as u64) << 32),
            },
            Op::StoreText => Instr::StoreText { lvid: a, text: b },
            Op::Store => Instr::Store { lvid: a, source: b },
            Op::Add => Instr::Add { lvid: a, lhs: b, rhs: c },
            Op::Sub => Instr::Sub { lvid: a, lhs: b, rhs: c },
            Op::Mul => Instr::Mul { lvid: a, lhs: b, rhs: c },
            Op::Div => Instr::Div { lvid: a, lhs: b, rhs: c },
            Op::Imul => Instr::Imul { lvid: a, lhs: b, rhs: c },
            Op::Idiv => Instr::Idiv { lvid: a, lhs: b, rhs: c },
            Op::Fadd => Instr::Fadd { lvid: a, lhs: b, rhs: c },
            Op::Fsub => Instr::Fsub { lvid: a, lhs: b, rhs: c },
            Op::Fmul => Instr::Fmul { lvid: a, lhs: b, rhs: c },
            Op::Fdiv => Instr::Fdiv { lvid: a, lhs: b, rhs: c },
            Op::Eq => Instr::Eq { lvid: a, lhs: b, rhs: c },
            Op::Neq => Instr::Neq { lvid: a, lhs: b, rhs: c },
            Op::Lt => Instr::Lt { lvid: a, lhs: b, rhs: c },
            Op::Lte => Instr::Lte { lvid: a, lhs: b, rhs: c },
            Op::Gt => Instr::Gt { lvid: a, lhs: b, rhs: c },
            Op::Gte => Instr::Gte { lvid: a, lhs: b, rhs: c },
            Op::Ilt => Instr::Ilt { lvid: a, lhs: b, rhs: c },
            Op::Ilte => Instr::Ilte { lvid: a, lhs: b, rhs: c },
            Op::Igt => Instr::Igt { lvid: a, lhs: b, rhs: c },
            Op::Igte => Instr::Igte { lvid: a, lhs: b, rhs: c },
            Op::Flt => Instr::Flt { lvid: a, lhs: b, rhs: c },
            Op::Flte => Instr::Flte { lvid: a, lhs: b, rhs: c },
            Op::Fgt => Instr::Fgt { lvid: a, lhs: b, rhs: c },
            Op::Fgte => Instr::Fgte { lvid: a, lhs: b, rhs: c },
            Op::Band => Instr::Band { lvid: a, lhs: b, rhs: c },
            Op::Bor => Instr::Bor { lvid: a, lhs: b, rhs: c },
            Op::Bxor => Instr::Bxor { lvid: a, lhs: b, rhs: c },
            Op::Lsl => Instr::Lsl { lvid: a, lhs: b, rhs: c },
            Op::Lsr => Instr::Lsr { lvid: a, lhs: b, rhs: c },
            Op::Negate => Instr::Negate { lvid: a, operand: b },
            Op::Bnot => Instr::Bnot { lvid: a, operand: b },
            Op::Label => Instr::Label { id: a },
            Op::Jmp => Instr::Jmp { label: a },
            Op::Jz => Instr::Jz { lvid: a, label: b },
            Op::Jnz => Instr::Jnz { lvid: a, label: b },
            Op::Assert => Instr::Assert { lvid: a },
            Op::Ret => Instr::Ret { lvid: a },
            Op::Memalloc => Instr::Memalloc { lvid: a, regsize: b },
            Op::Memfree => Instr::Memfree { lvid: a, regsize: b },
            Op::Memrealloc => Instr::Memrealloc {
                lvid: a,
                oldsize: b,
                newsize: c,
            },
            Op::Memfill => Instr::Memfill {
                lvid: a,
                regsize: b,
                pattern: c,
            },
            Op::Memcopy => Instr::Memcopy { lvid: a, src: b, regsize: c },
            Op::Memmove => Instr::Memmove { lvid: a, src: b, regsize: c },
            Op::Memcmp => Instr::Memcmp { lvid: a, src: b, regsize: c },
            Op::Cstrlen => Instr::Cstrlen { lvid: a, ptr: b },
            Op::Load => Instr::Load {
                lvid: a,
                ptr: b,
                ctype: CType::try_from(c).map_err(|tag| DecodeError::InvalidCType {
                    op,
                    tag,
                    offset,
                })?,
            },
            Op::StoreMem => Instr::StoreMem {
                ptr: a,
                lvid: b,
                ctype: CType::try_from(c).map_err(|tag| DecodeError::InvalidCType {
                    op,
                    tag,
                    offset,
                })?,
            },
            Op::Allocate => Instr::Allocate { lvid: a, atomid: b },
            Op::Dispose => Instr::Dispose {
                lvid: a,
                atomid: b,
                instanceid: c,
            },
            Op::Ref => Instr::Ref { lvid: a },
            Op::Unref => Instr::Unref {
                lvid: a,
                atomid: b,
                instanceid: c,
            },
            Op::Fieldget => Instr::Fieldget {
                lvid: a,
                self_lvid: b,
                index: c,
            },
            Op::Fieldset => Instr::Fieldset {
                lvid: a,
                self_lvid: b,
                index: c,
            },
            Op::Push => Instr::Push { lvid: a, name: b },
            Op::Tpush => Instr::Tpush { lvid: a, name: b },
            Op::Call => Instr::Call {
                lvid: a,
                func: b,
                instanceid: c,
            },
            Op::Intrinsic => Instr::Intrinsic { lvid: a, id: b, name: c },
            Op::Stacksize => Instr::Stacksize { count: a },
            Op::Identify => Instr::Identify {
                lvid: a,
                self_lvid: b,
                name: c,
            },
            Op::IdentifySet => Instr::IdentifySet {
                lvid: a,
                self_lvid: b,
                name: c,
            },
            Op::Ensureresolved => Instr::Ensureresolved { lvid: a },
            Op::Commontype => Instr::Commontype { lvid: a, previous: b },
            Op::Assign => Instr::Assign {
                lhs: a,
                rhs: b,
                dispose_lhs: c != 0,
            },
            Op::SelfPtr => Instr::SelfPtr { lvid: a },
            Op::Follow => Instr::Follow {
                lvid: a,
                follower: b,
                symlink: c != 0,
            },
            Op::Blueprint => Instr::Blueprint {
                kind: BlueprintKind::try_from(a).map_err(|kind| {
                    DecodeError::InvalidBlueprintKind { kind, offset }
                })?,
                name: b,
                lvid: c,
            },
            Op::Classdefsizeof => Instr::Classdefsizeof { lvid: a, atomid: b },
            Op::Qualifiers => Instr::Qualifiers {
                lvid: a,
                qualifier: QualifierKind::try_from(b)
                    .map_err(|tag| DecodeError::InvalidQualifier { tag, offset })?,
                on: c != 0,
            },
            Op::Debugfile => Instr::Debugfile { filename: a },
            Op::Debugpos => Instr::Debugpos { line: a, offset: b },
            Op::Namealias => Instr::Namealias { lvid: a, name: b },
            Op::Comment => Instr::Comment { text: a },
            Op::Scope => Instr::Scope,
            Op::End => Instr::End,
            Op::Typeisobject => Instr::Typeisobject { lvid: a },
            Op::Pragma => {
                let kind = PragmaKind::try_from(a)
                    .map_err(|tag| DecodeError::InvalidPragma { tag, offset })?;
                Instr::Pragma(match kind {
                    PragmaKind::Codegen => Pragma::Codegen { enabled: b != 0 },
                    PragmaKind::BlueprintSize => Pragma::BlueprintSize { size: b },
                    PragmaKind::Visibility => Pragma::Visibility { level: b },
                    PragmaKind::BodyStart => Pragma::BodyStart,
                    PragmaKind::ShortCircuit => Pragma::ShortCircuit { label: b },
                    PragmaKind::BuiltinAlias => Pragma::BuiltinAlias { name: b },
                    PragmaKind::Suggest => Pragma::Suggest { enabled: b != 0 },
                    PragmaKind::Synthetic => Pragma::Synthetic { lvid: b },
                })
            }
        })
    }

    /// Visit every register-id operand of this instruction. Labels, atom
    /// ids, string refs, field indices and counts are not registers and
    /// are not visited.
    pub fn for_each_lvid(&mut self, mut f: impl FnMut(&mut u32)) {
        match self {
            Instr::Nop
            | Instr::Label { .. }
            | Instr::Jmp { .. }
            | Instr::Stacksize { .. }
            | Instr::Debugfile { .. }
            | Instr::Debugpos { .. }
            | Instr::Comment { .. }
            | Instr::Scope
            | Instr::End
            | Instr::Blueprint { .. } => {}
            Instr::StoreConstant { lvid, .. }
            | Instr::StoreText { lvid, .. }
            | Instr::Assert { lvid }
            | Instr::Ret { lvid }
            | Instr::Allocate { lvid, .. }
            | Instr::Dispose { lvid, .. }
            | Instr::Ref { lvid }
            | Instr::Unref { lvid, .. }
            | Instr::Push { lvid, .. }
            | Instr::Tpush { lvid, .. }
            | Instr::Intrinsic { lvid, .. }
            | Instr::Ensureresolved { lvid }
            | Instr::SelfPtr { lvid }
            | Instr::Classdefsizeof { lvid, .. }
            | Instr::Qualifiers { lvid, .. }
            | Instr::Namealias { lvid, .. }
            | Instr::Typeisobject { lvid }
            | Instr::Jz { lvid, .. }
            | Instr::Jnz { lvid, .. } => f(lvid),
            Instr::Store { lvid, source } => {
                f(lvid);
                f(source);
            }
            Instr::Add { lvid, lhs, rhs }
            | Instr::Sub { lvid, lhs, rhs }
            | Instr::Mul { lvid, lhs, rhs }
            | Instr::Div { lvid, lhs, rhs }
            | Instr::Imul { lvid, lhs, rhs }
            | Instr::Idiv { lvid, lhs, rhs }
            | Instr::Fadd { lvid, lhs, rhs }
            | Instr::Fsub { lvid, lhs, rhs }
            | Instr::Fmul { lvid, lhs, rhs }
            | Instr::Fdiv { lvid, lhs, rhs }
            | Instr::Eq { lvid, lhs, rhs }
            | Instr::Neq { lvid, lhs, rhs }
            | Instr::Lt { lvid, lhs, rhs }
            | Instr::Lte { lvid, lhs, rhs }
            | Instr::Gt { lvid, lhs, rhs }
            | Instr::Gte { lvid, lhs, rhs }
            | Instr::Ilt { lvid, lhs, rhs }
            | Instr::Ilte { lvid, lhs, rhs }
            | Instr::Igt { lvid, lhs, rhs }
            | Instr::Igte { lvid, lhs, rhs }
            | Instr::Flt { lvid, lhs, rhs }
            | Instr::Flte { lvid, lhs, rhs }
            | Instr::Fgt { lvid, lhs, rhs }
            | Instr::Fgte { lvid, lhs, rhs }
            | Instr::Band { lvid, lhs, rhs }
            | Instr::Bor { lvid, lhs, rhs }
            | Instr::Bxor { lvid, lhs, rhs }
            | Instr::Lsl { lvid, lhs, rhs }
            | Instr::Lsr { lvid, lhs, rhs } => {
                f(lvid);
                f(lhs);
                f(rhs);
            }
            Instr::Negate { lvid, operand } | Instr::Bnot { lvid, operand } => {
                f(lvid);
                f(operand);
            }
            Instr::Memalloc { lvid, regsize } | Instr::Memfree { lvid, regsize } => {
                f(lvid);
                f(regsize);
            }
            Instr::Memrealloc {
                lvid,
                oldsize,
                newsize,
            } => {
                f(lvid);
                f(oldsize);
                f(newsize);
            }
            Instr::Memfill {
                lvid,
                regsize,
                pattern,
            } => {
                f(lvid);
                f(regsize);
                f(pattern);
            }
            Instr::Memcopy { lvid, src, regsize }
            | Instr::Memmove { lvid, src, regsize }
            | Instr::Memcmp { lvid, src, regsize } => {
                f(lvid);
                f(src);
                f(regsize);
            }
            Instr::Cstrlen { lvid, ptr } => {
                f(lvid);
                f(ptr);
            }
            Instr::Load { lvid, ptr, .. } => {
                f(lvid);
                f(ptr);
            }
            Instr::StoreMem { ptr, lvid, .. } => {
                f(ptr);
                f(lvid);
            }
            Instr::Fieldget {
                lvid, self_lvid, ..
            }
            | Instr::Fieldset {
                lvid, self_lvid, ..
            } => {
                f(lvid);
                f(self_lvid);
            }
            Instr::Call {
                lvid,
                func,
                instanceid,
            } => {
                f(lvid);
                // `func` is only a register while the call is unresolved.
                if *instanceid == u32::MAX {
                    f(func);
                }
            }
            Instr::Identify {
                lvid, self_lvid, ..
            }
            | Instr::IdentifySet {
                lvid, self_lvid, ..
            } => {
                f(lvid);
                if *self_lvid != 0 {
                    f(self_lvid);
                }
            }
            Instr::Commontype { lvid, previous } => {
                f(lvid);
                f(previous);
            }
            Instr::Assign { lhs, rhs, .. } => {
                f(lhs);
                f(rhs);
            }
            Instr::Follow { lvid, follower, .. } => {
                f(lvid);
                f(follower);
            }
            Instr::Pragma(Pragma::Synthetic { lvid }) => f(lvid),
            Instr::Pragma(_) => {}
        }
    }
}

impl fmt::Display for Instr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Instr::Nop => write!(f, "nop"),
            Instr::StoreConstant { lvid, value } => {
                write!(f, "storeconstant r{lvid}, {value}")
            }
            Instr::StoreText { lvid, text } => write!(f, "storetext r{lvid}, s{text}"),
            Instr::Store { lvid, source } => write!(f, "store r{lvid}, r{source}"),
            Instr::Label { id } => write!(f, "label L{id}"),
            Instr::Jmp { label } => write!(f, "jmp L{label}"),
            Instr::Jz { lvid, label } => write!(f, "jz r{lvid}, L{label}"),
            Instr::Jnz { lvid, label } => write!(f, "jnz r{lvid}, L{label}"),
            Instr::Assert { lvid } => write!(f, "assert r{lvid}"),
            Instr::Ret { lvid } => write!(f, "ret r{lvid}"),
            Instr::Negate { lvid, operand } => write!(f, "negate r{lvid}, r{operand}"),
            Instr::Bnot { lvid, operand } => write!(f, "bnot r{lvid}, r{operand}"),
            Instr::Load { lvid, ptr, ctype } => {
                write!(f, "load.{ctype} r{lvid}, [r{ptr}]")
            }
            Instr::StoreMem { ptr, lvid, ctype } => {
                write!(f, "store.{ctype} [r{ptr}], r{lvid}")
            }
            Instr::Allocate { lvid, atomid } => write!(f, "allocate r{lvid}, atom:{atomid}"),
            Instr::Dispose {
                lvid,
                atomid,
                instanceid,
            } => write!(f, "dispose r{lvid}, atom:{atomid}#{instanceid}"),
            Instr::Ref { lvid } => write!(f, "ref r{lvid}"),
            Instr::Unref {
                lvid,
                atomid,
                instanceid,
            } => write!(f, "unref r{lvid}, atom:{atomid}#{instanceid}"),
            Instr::Fieldget {
                lvid,
                self_lvid,
                index,
            } => write!(f, "fieldget r{lvid}, r{self_lvid}.{index}"),
            Instr::Fieldset {
                lvid,
                self_lvid,
                index,
            } => write!(f, "fieldset r{self_lvid}.{index}, r{lvid}"),
            Instr::Push { lvid, name } if name != 0 => write!(f, "push r{lvid} (s{name})"),
            Instr::Push { lvid, .. } => write!(f, "push r{lvid}"),
            Instr::Tpush { lvid, name } if name != 0 => write!(f, "tpush r{lvid} (s{name})"),
            Instr::Tpush { lvid, .. } => write!(f, "tpush r{lvid}"),
            Instr::Call {
                lvid,
                func,
                instanceid,
            } => {
                if instanceid == u32::MAX {
                    write!(f, "call r{lvid}, r{func}")
                } else {
                    write!(f, "call r{lvid}, atom:{func}#{instanceid}")
                }
            }
            Instr::Intrinsic { lvid, id, name } => {
                if name != 0 {
                    write!(f, "intrinsic r{lvid}, s{name}")
                } else {
                    write!(f, "intrinsic r{lvid}, #{id}")
                }
            }
            Instr::Stacksize { count } => write!(f, "stacksize {count}"),
            Instr::Identify {
                lvid,
                self_lvid,
                name,
            } => write!(f, "identify r{lvid}, r{self_lvid}, s{name}"),
            Instr::IdentifySet {
                lvid,
                self_lvid,
                name,
            } => write!(f, "identifyset r{lvid}, r{self_lvid}, s{name}"),
            Instr::Ensureresolved { lvid } => write!(f, "ensureresolved r{lvid}"),
            Instr::Commontype { lvid, previous } => {
                write!(f, "commontype r{lvid}, r{previous}")
            }
            Instr::Assign {
                lhs,
                rhs,
                dispose_lhs,
            } => write!(f, "assign r{lhs}, r{rhs}, dispose:{dispose_lhs}"),
            Instr::SelfPtr { lvid } => write!(f, "self r{lvid}"),
            Instr::Follow {
                lvid,
                follower,
                symlink,
            } => write!(f, "follow r{lvid} <- r{follower}, symlink:{symlink}"),
            Instr::Blueprint { kind, name, lvid } => {
                write!(f, "blueprint {kind:?}, s{name}, {lvid}")
            }
            Instr::Classdefsizeof { lvid, atomid } => {
                write!(f, "classdefsizeof r{lvid}, atom:{atomid}")
            }
            Instr::Qualifiers {
                lvid,
                qualifier,
                on,
            } => write!(f, "qualifiers r{lvid}, {qualifier:?}={on}"),
            Instr::Debugfile { filename } => write!(f, "debugfile s{filename}"),
            Instr::Debugpos { line, offset } => write!(f, "debugpos {line}:{offset}"),
            Instr::Namealias { lvid, name } => write!(f, "namealias r{lvid}, s{name}"),
            Instr::Comment { text } => write!(f, "comment s{text}"),
            Instr::Scope => write!(f, "scope"),
            Instr::End => write!(f, "end"),
            Instr::Typeisobject { lvid } => write!(f, "typeisobject r{lvid}"),
            Instr::Pragma(pragma) => write!(f, "pragma {pragma:?}"),
            // remaining three-address forms share one textual shape
            other => {
                let ins = other.encode();
                let name = format!("{}", other.op()).to_lowercase();
                write!(f, "{} r{}, r{}, r{}", name, ins.a, ins.b, ins.c)
            }
        }
    }
}
