use core::fmt;

/// Builtin machine types a register can hold.
///
/// `Any` is the placeholder for a not-yet-resolved or object-typed value;
/// it is the only kind that may carry an attached atom in the compiler's
/// type lattice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum CType {
    Void = 0,
    #[default]
    Any,
    Ptr,
    Bool,
    U8,
    U16,
    U32,
    U64,
    I8,
    I16,
    I32,
    I64,
    F32,
    F64,
}

impl CType {
    pub const COUNT: usize = CType::F64 as usize + 1;

    /// Width of one value of this type, in bytes. `Void` and `Any` have no
    /// machine representation and report 0.
    pub const fn size_bytes(self) -> u64 {
        match self {
            CType::Void | CType::Any => 0,
            CType::Bool | CType::U8 | CType::I8 => 1,
            CType::U16 | CType::I16 => 2,
            CType::U32 | CType::I32 | CType::F32 => 4,
            CType::Ptr | CType::U64 | CType::I64 | CType::F64 => 8,
        }
    }

    pub const fn is_signed(self) -> bool {
        matches!(self, CType::I8 | CType::I16 | CType::I32 | CType::I64)
    }

    pub const fn is_unsigned(self) -> bool {
        matches!(
            self,
            CType::Bool | CType::U8 | CType::U16 | CType::U32 | CType::U64
        )
    }

    pub const fn is_float(self) -> bool {
        matches!(self, CType::F32 | CType::F64)
    }

    pub const fn is_any(self) -> bool {
        matches!(self, CType::Any)
    }

    pub const fn is_void(self) -> bool {
        matches!(self, CType::Void)
    }

    /// The reserved source-level name of the raw builtin (`__i32`, ...).
    pub const fn builtin_name(self) -> &'static str {
        match self {
            CType::Void => "void",
            CType::Any => "any",
            CType::Ptr => "__pointer",
            CType::Bool => "__bool",
            CType::U8 => "__u8",
            CType::U16 => "__u16",
            CType::U32 => "__u32",
            CType::U64 => "__u64",
            CType::I8 => "__i8",
            CType::I16 => "__i16",
            CType::I32 => "__i32",
            CType::I64 => "__i64",
            CType::F32 => "__f32",
            CType::F64 => "__f64",
        }
    }

    /// Reverse of [`builtin_name`](Self::builtin_name).
    pub fn from_builtin_name(name: &str) -> Option<Self> {
        Some(match name {
            "void" => CType::Void,
            "any" => CType::Any,
            "__pointer" => CType::Ptr,
            "__bool" => CType::Bool,
            "__u8" => CType::U8,
            "__u16" => CType::U16,
            "__u32" => CType::U32,
            "__u64" => CType::U64,
            "__i8" => CType::I8,
            "__i16" => CType::I16,
            "__i32" => CType::I32,
            "__i64" => CType::I64,
            "__f32" => CType::F32,
            "__f64" => CType::F64,
            _ => return None,
        })
    }
}

impl TryFrom<u32> for CType {
    type Error = u32;

    fn try_from(word: u32) -> Result<Self, u32> {
        if word < Self::COUNT as u32 {
            // SAFETY: CType is repr(u8) with contiguous variants from 0.
            Ok(unsafe { core::mem::transmute::<u8, CType>(word as u8) })
        } else {
            Err(word)
        }
    }
}

impl fmt::Display for CType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.builtin_name())
    }
}

/// One untyped 64-bit register cell. Reinterpretation happens at the
/// opcode level: the same cell can be read as an unsigned, signed or
/// floating value depending on the instruction that consumes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct Register(u64);

impl Register {
    pub const ZERO: Register = Register(0);

    #[inline(always)]
    pub const fn from_u64(v: u64) -> Self {
        Register(v)
    }

    #[inline(always)]
    pub const fn from_i64(v: i64) -> Self {
        Register(v as u64)
    }

    #[inline(always)]
    pub fn from_f64(v: f64) -> Self {
        Register(v.to_bits())
    }

    #[inline(always)]
    pub const fn from_bool(v: bool) -> Self {
        Register(v as u64)
    }

    #[inline(always)]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[inline(always)]
    pub const fn as_i64(self) -> i64 {
        self.0 as i64
    }

    #[inline(always)]
    pub fn as_f64(self) -> f64 {
        f64::from_bits(self.0)
    }

    #[inline(always)]
    pub const fn as_bool(self) -> bool {
        self.0 != 0
    }
}
