//! Register stack.
//!
//! One contiguous growable array of 64-bit cells, carved into per-call
//! windows. A frame's registers are addressed relative to its base; the
//! checked accessors assert window bounds in debug builds, the unchecked
//! ones are for the dispatch loop once a sequence has been validated.

use ir::Register;

pub struct Stack {
    cells: Vec<Register>,
    frames: Vec<Frame>,
}

#[derive(Clone, Copy)]
struct Frame {
    base: usize,
    count: usize,
}

impl Default for Stack {
    fn default() -> Self {
        Self::new()
    }
}

impl Stack {
    pub fn new() -> Self {
        Self {
            cells: Vec::with_capacity(256),
            frames: Vec::new(),
        }
    }

    /// Open a window of `count` zeroed registers and return its base.
    pub fn push_frame(&mut self, count: u32) -> usize {
        let base = self.cells.len();
        self.cells.resize(base + count as usize, Register::ZERO);
        self.frames.push(Frame {
            base,
            count: count as usize,
        });
        base
    }

    /// Close the innermost window. Frames are strictly LIFO; the base
    /// handed back by `push_frame` is invalid afterwards.
    pub fn pop_frame(&mut self) {
        debug_assert!(!self.frames.is_empty(), "pop without matching push");
        if let Some(frame) = self.frames.pop() {
            debug_assert_eq!(frame.base + frame.count, self.cells.len());
            self.cells.truncate(frame.base);
        }
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    #[inline]
    pub fn get(&self, base: usize, lvid: u32) -> Register {
        debug_assert!(self.in_window(base, lvid));
        self.cells[base + lvid as usize]
    }

    #[inline]
    pub fn set(&mut self, base: usize, lvid: u32, value: Register) {
        debug_assert!(self.in_window(base, lvid));
        self.cells[base + lvid as usize] = value;
    }

    /// # Safety
    ///
    /// `base` must come from the live innermost `push_frame` and `lvid`
    /// must be within that frame's declared register count.
    #[inline(always)]
    pub unsafe fn get_unchecked(&self, base: usize, lvid: u32) -> Register {
        debug_assert!(self.in_window(base, lvid));
        *self.cells.get_unchecked(base + lvid as usize)
    }

    /// # Safety
    ///
    /// Same contract as [`get_unchecked`](Self::get_unchecked).
    #[inline(always)]
    pub unsafe fn set_unchecked(&mut self, base: usize, lvid: u32, value: Register) {
        debug_assert!(self.in_window(base, lvid));
        *self.cells.get_unchecked_mut(base + lvid as usize) = value;
    }

    fn in_window(&self, base: usize, lvid: u32) -> bool {
        self.frames
            .iter()
            .rev()
            .find(|f| f.base == base)
            .is_some_and(|f| (lvid as usize) < f.count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_are_windows() {
        let mut stack = Stack::new();
        let outer = stack.push_frame(4);
        stack.set(outer, 2, Register::from_u64(11));

        let inner = stack.push_frame(3);
        stack.set(inner, 2, Register::from_u64(99));
        assert_eq!(stack.get(inner, 2).as_u64(), 99);
        assert_eq!(stack.depth(), 2);
        stack.pop_frame();

        // the outer window is untouched by the inner frame
        assert_eq!(stack.get(outer, 2).as_u64(), 11);
        stack.pop_frame();
        assert_eq!(stack.depth(), 0);
    }

    #[test]
    fn new_frames_are_zeroed() {
        let mut stack = Stack::new();
        let base = stack.push_frame(2);
        stack.set(base, 1, Register::from_u64(7));
        stack.pop_frame();

        let base = stack.push_frame(2);
        assert_eq!(stack.get(base, 1), Register::ZERO);
    }
}
