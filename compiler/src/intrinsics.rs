//! Intrinsics.
//!
//! Two distinct families share the `intrinsic` opcode:
//!
//! * builtin intrinsics are compiler shorthands (arithmetic, comparisons,
//!   bit twiddling) lowered in place to dedicated opcodes; they never
//!   survive into a resolved sequence;
//! * user intrinsics are host functions registered in a catalog before
//!   compilation; the builder type-checks the call and rewrites the name
//!   reference into the catalog id, and the executor bridges to the
//!   callback at run time.

use std::collections::HashMap;

use ir::{CType, Instr, Register, Sequence};
use parking_lot::RwLock;

/// Operand handed to a builtin lowering: the register holding the raw
/// (unboxed) value and its builtin kind.
#[derive(Debug, Clone, Copy)]
pub struct BuiltinArg {
    pub lvid: u32,
    pub kind: CType,
}

/// Context for one builtin lowering: destination register, unboxed
/// operands, and the output being generated. `spare` is a scratch
/// register reserved by the builder for lowerings that need a constant.
pub struct Lowering<'a> {
    pub out: &'a mut Sequence,
    pub lvid: u32,
    pub spare: u32,
    pub args: &'a [BuiltinArg],
}

type LowerFn = fn(&mut Lowering) -> Result<CType, String>;

pub struct BuiltinIntrinsic {
    pub name: &'static str,
    pub argc: usize,
    pub lower: LowerFn,
}

fn same_kind(args: &[BuiltinArg]) -> Result<CType, String> {
    let kind = args[0].kind;
    for arg in &args[1..] {
        if arg.kind != kind {
            return Err(format!(
                "operand type mismatch: {} vs {}",
                kind, arg.kind
            ));
        }
    }
    Ok(kind)
}

fn numeric(kind: CType) -> Result<CType, String> {
    match kind {
        CType::Ptr | CType::Bool => Err(format!("expected a numeric operand, got {kind}")),
        kind => Ok(kind),
    }
}

macro_rules! lower_arith {
    ($name:ident, $unsigned:ident, $signed:ident, $float:ident) => {
        fn $name(ctx: &mut Lowering) -> Result<CType, String> {
            let kind = numeric(same_kind(ctx.args)?)?;
            let (lvid, lhs, rhs) = (ctx.lvid, ctx.args[0].lvid, ctx.args[1].lvid);
            let instr = if kind.is_float() {
                Instr::$float { lvid, lhs, rhs }
            } else if kind.is_signed() {
                Instr::$signed { lvid, lhs, rhs }
            } else {
                Instr::$unsigned { lvid, lhs, rhs }
            };
            ctx.out.emit(instr);
            Ok(kind)
        }
    };
}

macro_rules! lower_cmp {
    ($name:ident, $unsigned:ident, $signed:ident, $float:ident) => {
        fn $name(ctx: &mut Lowering) -> Result<CType, String> {
            let kind = same_kind(ctx.args)?;
            let (lvid, lhs, rhs) = (ctx.lvid, ctx.args[0].lvid, ctx.args[1].lvid);
            let instr = if kind.is_float() {
                Instr::$float { lvid, lhs, rhs }
            } else if kind.is_signed() {
                Instr::$signed { lvid, lhs, rhs }
            } else {
                Instr::$unsigned { lvid, lhs, rhs }
            };
            ctx.out.emit(instr);
            Ok(CType::Bool)
        }
    };
}

macro_rules! lower_bitwise {
    ($name:ident, $opcode:ident) => {
        fn $name(ctx: &mut Lowering) -> Result<CType, String> {
            let kind = same_kind(ctx.args)?;
            if kind.is_float() {
                return Err(format!("bitwise operation on {kind}"));
            }
            ctx.out.emit(Instr::$opcode {
                lvid: ctx.lvid,
                lhs: ctx.args[0].lvid,
                rhs: ctx.args[1].lvid,
            });
            Ok(kind)
        }
    };
}

lower_arith!(lower_add, Add, Add, Fadd);
lower_arith!(lower_sub, Sub, Sub, Fsub);
lower_arith!(lower_mul, Mul, Imul, Fmul);
lower_arith!(lower_div, Div, Idiv, Fdiv);
lower_cmp!(lower_eq, Eq, Eq, Eq);
lower_cmp!(lower_neq, Neq, Neq, Neq);
lower_cmp!(lower_lt, Lt, Ilt, Flt);
lower_cmp!(lower_lte, Lte, Ilte, Flte);
lower_cmp!(lower_gt, Gt, Igt, Fgt);
lower_cmp!(lower_gte, Gte, Igte, Fgte);
lower_bitwise!(lower_band, Band);
lower_bitwise!(lower_bor, Bor);
lower_bitwise!(lower_bxor, Bxor);
lower_bitwise!(lower_lsl, Lsl);
lower_bitwise!(lower_lsr, Lsr);

fn lower_not(ctx: &mut Lowering) -> Result<CType, String> {
    let kind = ctx.args[0].kind;
    if kind == CType::Bool {
        // logical form: bools are 0 or 1, flip the low bit only
        ctx.out.emit(Instr::StoreConstant { lvid: ctx.spare, value: 1 });
        ctx.out.emit(Instr::Bxor {
            lvid: ctx.lvid,
            lhs: ctx.args[0].lvid,
            rhs: ctx.spare,
        });
        return Ok(CType::Bool);
    }
    if kind.is_float() {
        return Err(format!("bitwise operation on {kind}"));
    }
    ctx.out.emit(Instr::Bnot {
        lvid: ctx.lvid,
        operand: ctx.args[0].lvid,
    });
    Ok(kind)
}

fn lower_negate(ctx: &mut Lowering) -> Result<CType, String> {
    let kind = numeric(ctx.args[0].kind)?;
    if kind.is_float() {
        // 0.0 and 0u64 share a bit pattern, subtract from zero
        ctx.out.emit(Instr::StoreConstant { lvid: ctx.spare, value: 0 });
        ctx.out.emit(Instr::Fsub {
            lvid: ctx.lvid,
            lhs: ctx.spare,
            rhs: ctx.args[0].lvid,
        });
    } else {
        ctx.out.emit(Instr::Negate {
            lvid: ctx.lvid,
            operand: ctx.args[0].lvid,
        });
    }
    Ok(kind)
}

fn lower_assert(ctx: &mut Lowering) -> Result<CType, String> {
    ctx.out.emit(Instr::Assert {
        lvid: ctx.args[0].lvid,
    });
    Ok(CType::Void)
}

fn want(arg: BuiltinArg, kind: CType, index: usize) -> Result<(), String> {
    if arg.kind == kind {
        Ok(())
    } else {
        Err(format!(
            "operand {} must be {kind}, got {}",
            index + 1,
            arg.kind
        ))
    }
}

fn want_integer(arg: BuiltinArg, index: usize) -> Result<(), String> {
    if arg.kind.is_float() || matches!(arg.kind, CType::Ptr) {
        Err(format!(
            "operand {} must be an integer, got {}",
            index + 1,
            arg.kind
        ))
    } else {
        Ok(())
    }
}

fn lower_memalloc(ctx: &mut Lowering) -> Result<CType, String> {
    want_integer(ctx.args[0], 0)?;
    ctx.out.emit(Instr::Memalloc {
        lvid: ctx.lvid,
        regsize: ctx.args[0].lvid,
    });
    Ok(CType::Ptr)
}

fn lower_memfree(ctx: &mut Lowering) -> Result<CType, String> {
    want(ctx.args[0], CType::Ptr, 0)?;
    want_integer(ctx.args[1], 1)?;
    ctx.out.emit(Instr::Memfree {
        lvid: ctx.args[0].lvid,
        regsize: ctx.args[1].lvid,
    });
    Ok(CType::Void)
}

fn lower_memfill(ctx: &mut Lowering) -> Result<CType, String> {
    want(ctx.args[0], CType::Ptr, 0)?;
    want_integer(ctx.args[1], 1)?;
    want_integer(ctx.args[2], 2)?;
    ctx.out.emit(Instr::Memfill {
        lvid: ctx.args[0].lvid,
        regsize: ctx.args[1].lvid,
        pattern: ctx.args[2].lvid,
    });
    Ok(CType::Void)
}

fn lower_memcopy(ctx: &mut Lowering) -> Result<CType, String> {
    want(ctx.args[0], CType::Ptr, 0)?;
    want(ctx.args[1], CType::Ptr, 1)?;
    want_integer(ctx.args[2], 2)?;
    ctx.out.emit(Instr::Memcopy {
        lvid: ctx.args[0].lvid,
        src: ctx.args[1].lvid,
        regsize: ctx.args[2].lvid,
    });
    Ok(CType::Void)
}

macro_rules! lower_load {
    ($name:ident, $kind:ident) => {
        fn $name(ctx: &mut Lowering) -> Result<CType, String> {
            want(ctx.args[0], CType::Ptr, 0)?;
            ctx.out.emit(Instr::Load {
                lvid: ctx.lvid,
                ptr: ctx.args[0].lvid,
                ctype: CType::$kind,
            });
            Ok(CType::$kind)
        }
    };
}

macro_rules! lower_store {
    ($name:ident, $kind:ident) => {
        fn $name(ctx: &mut Lowering) -> Result<CType, String> {
            want(ctx.args[0], CType::Ptr, 0)?;
            let tag = CType::$kind;
            if tag.is_float() {
                want(ctx.args[1], tag, 1)?;
            } else {
                // integer stores truncate; any integer kind is accepted
                want_integer(ctx.args[1], 1)?;
            }
            ctx.out.emit(Instr::StoreMem {
                ptr: ctx.args[0].lvid,
                lvid: ctx.args[1].lvid,
                ctype: tag,
            });
            Ok(CType::Void)
        }
    };
}

lower_load!(lower_load_u8, U8);
lower_load!(lower_load_u16, U16);
lower_load!(lower_load_u32, U32);
lower_load!(lower_load_u64, U64);
lower_load!(lower_load_f32, F32);
lower_load!(lower_load_f64, F64);
lower_store!(lower_store_u8, U8);
lower_store!(lower_store_u16, U16);
lower_store!(lower_store_u32, U32);
lower_store!(lower_store_u64, U64);
lower_store!(lower_store_f32, F32);
lower_store!(lower_store_f64, F64);

/// Builtin intrinsic table. Resolved by name; the order is only cosmetic.
/// `and` and `or` appear here for the non-short-circuiting (bitwise)
/// form; short-circuit lowering is driven by the preceding pragma and
/// handled directly by the builder.
pub const BUILTINS: &[BuiltinIntrinsic] = &[
    BuiltinIntrinsic { name: "add", argc: 2, lower: lower_add },
    BuiltinIntrinsic { name: "sub", argc: 2, lower: lower_sub },
    BuiltinIntrinsic { name: "mul", argc: 2, lower: lower_mul },
    BuiltinIntrinsic { name: "div", argc: 2, lower: lower_div },
    BuiltinIntrinsic { name: "eq", argc: 2, lower: lower_eq },
    BuiltinIntrinsic { name: "neq", argc: 2, lower: lower_neq },
    BuiltinIntrinsic { name: "lt", argc: 2, lower: lower_lt },
    BuiltinIntrinsic { name: "lte", argc: 2, lower: lower_lte },
    BuiltinIntrinsic { name: "gt", argc: 2, lower: lower_gt },
    BuiltinIntrinsic { name: "gte", argc: 2, lower: lower_gte },
    BuiltinIntrinsic { name: "and", argc: 2, lower: lower_band },
    BuiltinIntrinsic { name: "or", argc: 2, lower: lower_bor },
    BuiltinIntrinsic { name: "xor", argc: 2, lower: lower_bxor },
    BuiltinIntrinsic { name: "lsl", argc: 2, lower: lower_lsl },
    BuiltinIntrinsic { name: "lsr", argc: 2, lower: lower_lsr },
    BuiltinIntrinsic { name: "not", argc: 1, lower: lower_not },
    BuiltinIntrinsic { name: "negate", argc: 1, lower: lower_negate },
    BuiltinIntrinsic { name: "assert", argc: 1, lower: lower_assert },
    BuiltinIntrinsic { name: "memory.allocate", argc: 1, lower: lower_memalloc },
    BuiltinIntrinsic { name: "memory.dispose", argc: 2, lower: lower_memfree },
    BuiltinIntrinsic { name: "memory.fill", argc: 3, lower: lower_memfill },
    BuiltinIntrinsic { name: "memory.copy", argc: 3, lower: lower_memcopy },
    BuiltinIntrinsic { name: "load.u8", argc: 1, lower: lower_load_u8 },
    BuiltinIntrinsic { name: "load.u16", argc: 1, lower: lower_load_u16 },
    BuiltinIntrinsic { name: "load.u32", argc: 1, lower: lower_load_u32 },
    BuiltinIntrinsic { name: "load.u64", argc: 1, lower: lower_load_u64 },
    BuiltinIntrinsic { name: "load.f32", argc: 1, lower: lower_load_f32 },
    BuiltinIntrinsic { name: "load.f64", argc: 1, lower: lower_load_f64 },
    BuiltinIntrinsic { name: "store.u8", argc: 2, lower: lower_store_u8 },
    BuiltinIntrinsic { name: "store.u16", argc: 2, lower: lower_store_u16 },
    BuiltinIntrinsic { name: "store.u32", argc: 2, lower: lower_store_u32 },
    BuiltinIntrinsic { name: "store.u64", argc: 2, lower: lower_store_u64 },
    BuiltinIntrinsic { name: "store.f32", argc: 2, lower: lower_store_f32 },
    BuiltinIntrinsic { name: "store.f64", argc: 2, lower: lower_store_f64 },
];

pub fn find_builtin(name: &str) -> Option<&'static BuiltinIntrinsic> {
    BUILTINS.iter().find(|b| b.name == name)
}

/// Host callback invoked by the executor. Arguments arrive as raw
/// register words already narrowed to the declared parameter kinds.
pub type IntrinsicFn = fn(&[Register]) -> Register;

#[derive(Debug, Clone)]
pub struct IntrinsicPrototype {
    pub id: u32,
    pub name: String,
    pub params: Vec<CType>,
    pub rettype: CType,
    pub callback: IntrinsicFn,
}

#[derive(Default)]
struct CatalogInner {
    list: Vec<IntrinsicPrototype>,
    index: HashMap<String, u32>,
}

/// Registry of host intrinsics, shared between the compilation pass and
/// the executor. Registration happens up front; lookups afterwards are
/// read-mostly, hence the RwLock.
#[derive(Default)]
pub struct IntrinsicCatalog {
    inner: RwLock<CatalogInner>,
}

impl IntrinsicCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a host function. Re-registering a name replaces the
    /// callback but keeps the id stable.
    pub fn register(
        &self,
        name: &str,
        params: &[CType],
        rettype: CType,
        callback: IntrinsicFn,
    ) -> u32 {
        let mut inner = self.inner.write();
        if let Some(&id) = inner.index.get(name) {
            inner.list[id as usize] = IntrinsicPrototype {
                id,
                name: name.to_owned(),
                params: params.to_vec(),
                rettype,
                callback,
            };
            return id;
        }
        let id = inner.list.len() as u32;
        inner.list.push(IntrinsicPrototype {
            id,
            name: name.to_owned(),
            params: params.to_vec(),
            rettype,
            callback,
        });
        inner.index.insert(name.to_owned(), id);
        id
    }

    pub fn find(&self, name: &str) -> Option<IntrinsicPrototype> {
        let inner = self.inner.read();
        let id = *inner.index.get(name)?;
        inner.list.get(id as usize).cloned()
    }

    pub fn get(&self, id: u32) -> Option<IntrinsicPrototype> {
        self.inner.read().list.get(id as usize).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.read().list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_add_selects_by_kind() {
        let mut out = Sequence::new();
        let args = [
            BuiltinArg { lvid: 2, kind: CType::F64 },
            BuiltinArg { lvid: 3, kind: CType::F64 },
        ];
        let mut ctx = Lowering {
            out: &mut out,
            lvid: 1,
            spare: 6,
            args: &args,
        };
        let ret = (find_builtin("add").unwrap().lower)(&mut ctx).unwrap();
        assert_eq!(ret, CType::F64);
        assert_eq!(out.read(0), Ok(Instr::Fadd { lvid: 1, lhs: 2, rhs: 3 }));
    }

    #[test]
    fn builtin_div_distinguishes_signedness() {
        let mut out = Sequence::new();
        let args = [
            BuiltinArg { lvid: 2, kind: CType::I32 },
            BuiltinArg { lvid: 3, kind: CType::I32 },
        ];
        let mut ctx = Lowering {
            out: &mut out,
            lvid: 1,
            spare: 6,
            args: &args,
        };
        (find_builtin("div").unwrap().lower)(&mut ctx).unwrap();
        assert_eq!(out.read(0), Ok(Instr::Idiv { lvid: 1, lhs: 2, rhs: 3 }));
    }

    #[test]
    fn builtin_comparison_yields_bool() {
        let mut out = Sequence::new();
        let args = [
            BuiltinArg { lvid: 4, kind: CType::U8 },
            BuiltinArg { lvid: 5, kind: CType::U8 },
        ];
        let mut ctx = Lowering {
            out: &mut out,
            lvid: 1,
            spare: 6,
            args: &args,
        };
        let ret = (find_builtin("lt").unwrap().lower)(&mut ctx).unwrap();
        assert_eq!(ret, CType::Bool);
        assert_eq!(out.read(0), Ok(Instr::Lt { lvid: 1, lhs: 4, rhs: 5 }));
    }

    #[test]
    fn mismatched_operands_are_rejected() {
        let mut out = Sequence::new();
        let args = [
            BuiltinArg { lvid: 2, kind: CType::I32 },
            BuiltinArg { lvid: 3, kind: CType::F32 },
        ];
        let mut ctx = Lowering {
            out: &mut out,
            lvid: 1,
            spare: 6,
            args: &args,
        };
        assert!((find_builtin("add").unwrap().lower)(&mut ctx).is_err());
        assert!(out.is_empty());
    }

    #[test]
    fn logical_not_flips_the_low_bit_only() {
        let mut out = Sequence::new();
        let args = [BuiltinArg { lvid: 2, kind: CType::Bool }];
        let mut ctx = Lowering {
            out: &mut out,
            lvid: 1,
            spare: 6,
            args: &args,
        };
        let ret = (find_builtin("not").unwrap().lower)(&mut ctx).unwrap();
        assert_eq!(ret, CType::Bool);
        assert_eq!(out.read(0), Ok(Instr::StoreConstant { lvid: 6, value: 1 }));
        assert_eq!(out.read(1), Ok(Instr::Bxor { lvid: 1, lhs: 2, rhs: 6 }));
    }

    fn host_answer(_: &[Register]) -> Register {
        Register::from_u64(42)
    }

    #[test]
    fn catalog_registration_is_stable() {
        let catalog = IntrinsicCatalog::new();
        let id = catalog.register("answer", &[], CType::U64, host_answer);
        assert_eq!(catalog.find("answer").unwrap().id, id);
        // re-registration keeps the id
        let again = catalog.register("answer", &[], CType::U64, host_answer);
        assert_eq!(id, again);
        assert_eq!(catalog.len(), 1);
        assert!(catalog.find("missing").is_none());
    }
}
