use core::fmt;

/// IR opcodes.
///
/// Every instruction occupies one fixed-width [`Instruction`] word
/// (4 x 32 bits); the opcode lives in the first 32-bit lane and the
/// remaining three lanes carry the operands.
///
/// Opcodes from [`Identify`](Op::Identify) onward are compiler-only: they
/// drive identifier resolution and type propagation during instantiation
/// and must never reach the executor.
///
/// [`Instruction`]: crate::Instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Op {
    Nop = 0,

    // constants and register moves
    StoreConstant,
    StoreText,
    Store,

    // arithmetic (unsigned, signed, floating)
    Add,
    Sub,
    Mul,
    Div,
    Imul,
    Idiv,
    Fadd,
    Fsub,
    Fmul,
    Fdiv,

    // comparisons (unsigned, signed, floating)
    Eq,
    Neq,
    Lt,
    Lte,
    Gt,
    Gte,
    Ilt,
    Ilte,
    Igt,
    Igte,
    Flt,
    Flte,
    Fgt,
    Fgte,

    // bitwise
    Band,
    Bor,
    Bxor,
    Lsl,
    Lsr,
    Negate,
    Bnot,

    // control flow
    Label,
    Jmp,
    Jz,
    Jnz,
    Assert,
    Ret,

    // raw memory
    Memalloc,
    Memfree,
    Memrealloc,
    Memfill,
    Memcopy,
    Memmove,
    Memcmp,
    Cstrlen,
    Load,
    StoreMem,

    // object lifecycle
    Allocate,
    Dispose,
    Ref,
    Unref,
    Fieldget,
    Fieldset,

    // calling convention
    Push,
    Tpush,
    Call,
    Intrinsic,
    Stacksize,

    // compiler-only from here on
    Identify,
    IdentifySet,
    Ensureresolved,
    Commontype,
    Assign,
    SelfPtr,
    Follow,
    Blueprint,
    Classdefsizeof,
    Qualifiers,
    Debugfile,
    Debugpos,
    Namealias,
    Comment,
    Scope,
    End,
    Typeisobject,
    Pragma,
}

impl Op {
    pub const COUNT: usize = Op::Pragma as usize + 1;

    /// Whether this opcode only makes sense before instantiation and must
    /// never appear in a resolved sequence handed to the executor.
    pub const fn is_compiler_only(self) -> bool {
        self as u8 >= Op::Identify as u8
    }

    /// Unchecked counterpart of the `TryFrom` conversion, for dispatch
    /// loops that have already validated the sequence.
    ///
    /// # Safety
    ///
    /// `word` must be a valid opcode (`word < Op::COUNT`).
    #[inline(always)]
    pub const unsafe fn from_u32_unchecked(word: u32) -> Self {
        debug_assert!(word < Self::COUNT as u32);
        // SAFETY: caller guarantees the range; Op is repr(u8), contiguous.
        core::mem::transmute::<u8, Op>(word as u8)
    }
}

impl TryFrom<u32> for Op {
    type Error = u32;

    fn try_from(word: u32) -> Result<Self, u32> {
        if word < Self::COUNT as u32 {
            // SAFETY: Op is repr(u8) with contiguous variants starting at 0.
            Ok(unsafe { core::mem::transmute::<u8, Op>(word as u8) })
        } else {
            Err(word)
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Declaration kind carried by a `blueprint` opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BlueprintKind {
    Namespace = 0,
    Class,
    Funcdef,
    Vardef,
    Typealias,
    Unit,
    Param,
    TmplParam,
}

impl BlueprintKind {
    pub const COUNT: usize = BlueprintKind::TmplParam as usize + 1;
}

impl TryFrom<u32> for BlueprintKind {
    type Error = u32;

    fn try_from(word: u32) -> Result<Self, u32> {
        if word < Self::COUNT as u32 {
            // SAFETY: repr(u8), contiguous from 0.
            Ok(unsafe { core::mem::transmute::<u8, BlueprintKind>(word as u8) })
        } else {
            Err(word)
        }
    }
}

/// Tri-state qualifier toggled by a `qualifiers` opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum QualifierKind {
    Ref = 0,
    Const,
    Nullable,
}

impl TryFrom<u32> for QualifierKind {
    type Error = u32;

    fn try_from(word: u32) -> Result<Self, u32> {
        if word <= QualifierKind::Nullable as u32 {
            // SAFETY: repr(u8), contiguous from 0.
            Ok(unsafe { core::mem::transmute::<u8, QualifierKind>(word as u8) })
        } else {
            Err(word)
        }
    }
}

/// Sub-tag of the `pragma` opcode.
///
/// Pragmas are compiler-facing metadata: codegen toggles, blueprint byte
/// sizes, visibility, body-start markers, short-circuit patch points and
/// synthetic-declaration flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PragmaKind {
    Codegen = 0,
    BlueprintSize,
    Visibility,
    BodyStart,
    ShortCircuit,
    BuiltinAlias,
    Suggest,
    Synthetic,
}

impl PragmaKind {
    pub const COUNT: usize = PragmaKind::Synthetic as usize + 1;
}

impl TryFrom<u32> for PragmaKind {
    type Error = u32;

    fn try_from(word: u32) -> Result<Self, u32> {
        if word < Self::COUNT as u32 {
            // SAFETY: repr(u8), contiguous from 0.
            Ok(unsafe { core::mem::transmute::<u8, PragmaKind>(word as u8) })
        } else {
            Err(word)
        }
    }
}
