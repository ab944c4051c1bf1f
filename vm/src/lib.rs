//! Register executor.
//!
//! Runs the resolved sequences a [`compiler::Program`] ends up with
//! after instantiation. Guest values live in untyped 64-bit registers;
//! typing was the compiler's job and the executor only re-interprets
//! cells the way each opcode dictates.

pub mod executor;
pub mod fault;
pub mod memcheck;
pub mod stack;

pub use executor::{execute, narrow, run, ThreadContext, MAX_FRAMES};
pub use fault::Fault;
pub use memcheck::{MemChecker, NoopChecker, TrackedChecker};
pub use stack::Stack;

#[cfg(test)]
mod tests {
    use super::*;
    use ir::{CType, Register};

    #[test]
    fn narrow_sign_extends_small_integers() {
        let v = narrow(Register::from_i64(i32::MIN as i64), CType::I32);
        assert_eq!(v.as_i64(), i32::MIN as i64);
        let v = narrow(Register::from_i64(-1), CType::I32);
        assert_eq!(v.as_i64(), -1);
        let v = narrow(Register::from_i64(-1), CType::I8);
        assert_eq!(v.as_i64(), -1);
    }

    #[test]
    fn narrow_masks_unsigned_kinds() {
        assert_eq!(narrow(Register::from_u64(0x1ff), CType::U8).as_u64(), 0xff);
        assert_eq!(
            narrow(Register::from_u64(u64::MAX), CType::U32).as_u64(),
            0xffff_ffff
        );
        assert_eq!(narrow(Register::from_u64(2), CType::Bool).as_u64(), 1);
        assert_eq!(narrow(Register::from_u64(7), CType::Void), Register::ZERO);
    }

    #[test]
    fn narrow_keeps_f64_and_rounds_f32() {
        let v = narrow(Register::from_f64(1.5), CType::F64);
        assert_eq!(v.as_f64(), 1.5);
        let v = narrow(Register::from_f64(1e40), CType::F32);
        assert!(v.as_f64().is_infinite());
    }
}
