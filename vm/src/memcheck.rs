//! Allocation tracking.
//!
//! Every allocation the executor performs, raw or object, goes through a
//! [`MemChecker`]. The tracked variant validates pointers and sizes on
//! every access and knows what is still live on exit; the noop variant
//! compiles down to nothing and is what release builds run with.

use std::collections::HashMap;

use crate::fault::Fault;

pub trait MemChecker {
    /// A block of `size` bytes at `ptr` is now live. `owner` is the class
    /// atom for object allocations, 0 for raw memory.
    fn hold(&mut self, ptr: u64, size: u64, owner: u32);

    /// The block at `ptr` is released with the given size.
    fn forget(&mut self, ptr: u64, size: u64) -> Result<(), Fault>;

    /// `size` bytes at `ptr` are about to be read or written.
    fn validate(&self, ptr: u64, size: u64) -> Result<(), Fault>;

    /// Number of blocks still live.
    fn leaked(&self) -> usize;
}

/// No bookkeeping at all.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopChecker;

impl MemChecker for NoopChecker {
    #[inline(always)]
    fn hold(&mut self, _ptr: u64, _size: u64, _owner: u32) {}

    #[inline(always)]
    fn forget(&mut self, _ptr: u64, _size: u64) -> Result<(), Fault> {
        Ok(())
    }

    #[inline(always)]
    fn validate(&self, _ptr: u64, _size: u64) -> Result<(), Fault> {
        Ok(())
    }

    #[inline(always)]
    fn leaked(&self) -> usize {
        0
    }
}

#[derive(Debug, Clone, Copy)]
struct Allocation {
    size: u64,
    #[allow(dead_code)]
    owner: u32,
}

/// Full bookkeeping: one entry per live block, keyed by base pointer.
#[derive(Debug, Default)]
pub struct TrackedChecker {
    live: HashMap<u64, Allocation>,
}

impl TrackedChecker {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MemChecker for TrackedChecker {
    fn hold(&mut self, ptr: u64, size: u64, owner: u32) {
        self.live.insert(ptr, Allocation { size, owner });
    }

    fn forget(&mut self, ptr: u64, size: u64) -> Result<(), Fault> {
        match self.live.remove(&ptr) {
            Some(block) if block.size == size => Ok(()),
            Some(block) => Err(Fault::SizeMismatch {
                ptr,
                expected: block.size,
                got: size,
            }),
            None => Err(Fault::UnknownPointer { ptr }),
        }
    }

    fn validate(&self, ptr: u64, size: u64) -> Result<(), Fault> {
        // exact base first, interior pointers need the scan
        if let Some(block) = self.live.get(&ptr) {
            if size <= block.size {
                return Ok(());
            }
            return Err(Fault::SizeMismatch {
                ptr,
                expected: block.size,
                got: size,
            });
        }
        for (&base, block) in &self.live {
            if ptr >= base && ptr.saturating_add(size) <= base + block.size {
                return Ok(());
            }
        }
        Err(Fault::UnknownPointer { ptr })
    }

    fn leaked(&self) -> usize {
        self.live.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracked_checker_follows_the_lifecycle() {
        let mut checker = TrackedChecker::new();
        checker.hold(0x1000, 16, 0);
        assert_eq!(checker.leaked(), 1);
        assert_eq!(checker.validate(0x1000, 16), Ok(()));
        // interior access within the block
        assert_eq!(checker.validate(0x1008, 8), Ok(()));
        assert_eq!(checker.forget(0x1000, 16), Ok(()));
        assert_eq!(checker.leaked(), 0);
    }

    #[test]
    fn unknown_pointer_is_a_fault() {
        let checker = TrackedChecker::new();
        assert_eq!(
            checker.validate(0x2000, 1),
            Err(Fault::UnknownPointer { ptr: 0x2000 })
        );
        let mut checker = checker;
        assert_eq!(
            checker.forget(0x2000, 8),
            Err(Fault::UnknownPointer { ptr: 0x2000 })
        );
    }

    #[test]
    fn size_mismatch_is_a_fault() {
        let mut checker = TrackedChecker::new();
        checker.hold(0x3000, 8, 0);
        assert_eq!(
            checker.forget(0x3000, 16),
            Err(Fault::SizeMismatch {
                ptr: 0x3000,
                expected: 8,
                got: 16
            })
        );
        checker.hold(0x3000, 8, 0);
        assert_eq!(
            checker.validate(0x3000, 9),
            Err(Fault::SizeMismatch {
                ptr: 0x3000,
                expected: 8,
                got: 9
            })
        );
    }

    #[test]
    fn noop_checker_accepts_everything() {
        let mut checker = NoopChecker;
        checker.hold(1, 1, 0);
        assert_eq!(checker.forget(99, 99), Ok(()));
        assert_eq!(checker.validate(0, u64::MAX), Ok(()));
        assert_eq!(checker.leaked(), 0);
    }
}
