//! The dispatch loop.
//!
//! Executes the resolved sequences produced by instantiation. One
//! [`ThreadContext`] owns the register stack and the allocation checker;
//! the compiled [`Program`] is shared and read-only at this point.
//!
//! Calling convention: the caller queues arguments with `push`, `call`
//! opens a fresh register window sized by the callee's `stacksize`
//! header, copies the arguments to registers 2.. and runs the body; the
//! operand of `ret` comes back in the caller's destination register.

use std::alloc::{alloc, dealloc, handle_alloc_error, realloc, Layout};
use std::collections::HashSet;
use std::ffi::CString;

use compiler::config;
use compiler::{AtomId, InstanceId, Program, Report};
use ir::{CType, Instr, Register, Sequence};
use log::{debug, error};

use crate::fault::Fault;
use crate::memcheck::{MemChecker, NoopChecker, TrackedChecker};
use crate::stack::Stack;

/// Hard cap on nested call frames.
pub const MAX_FRAMES: usize = 1024;

pub struct ThreadContext<'p, C: MemChecker> {
    program: &'p Program,
    stack: Stack,
    pub checker: C,
    /// Sequences already validated for register bounds and opcodes.
    verified: HashSet<(AtomId, InstanceId)>,
    /// Backing storage for `storetext` pointers, NUL-terminated.
    texts: Vec<CString>,
}

impl<'p, C: MemChecker> ThreadContext<'p, C> {
    pub fn new(program: &'p Program, checker: C) -> Self {
        Self {
            program,
            stack: Stack::new(),
            checker,
            verified: HashSet::new(),
            texts: Vec::new(),
        }
    }

    /// Run the program's instantiated entry point.
    pub fn run_entry(&mut self) -> Result<Register, Fault> {
        let (atomid, instanceid) = self.program.entry.ok_or(Fault::NotInstantiated {
            atomid: 0,
            instanceid: 0,
        })?;
        self.invoke(atomid, instanceid, &[])
    }

    /// Call one instantiation with already-evaluated arguments.
    pub fn invoke(
        &mut self,
        atomid: AtomId,
        instanceid: InstanceId,
        params: &[Register],
    ) -> Result<Register, Fault> {
        let seq = self
            .program
            .atoms
            .sequence(atomid, instanceid)
            .ok_or(Fault::NotInstantiated { atomid, instanceid })?;
        if self.stack.depth() >= MAX_FRAMES {
            return Err(Fault::StackOverflow);
        }
        let count = match seq.read(0)? {
            Instr::Stacksize { count } => count.max(config::LVID_FIRST_PARAM + params.len() as u32),
            other => {
                return Err(Fault::UnexpectedOpcode {
                    op: other.op(),
                    offset: 0,
                })
            }
        };
        self.verify(atomid, instanceid, &seq, count)?;

        let base = self.stack.push_frame(count);
        for (i, &param) in params.iter().enumerate() {
            // SAFETY: count covers LVID_FIRST_PARAM + params.len()
            unsafe {
                self.stack
                    .set_unchecked(base, config::LVID_FIRST_PARAM + i as u32, param);
            }
        }
        let outcome = self.dispatch(&seq, base);
        self.stack.pop_frame();
        outcome
    }

    /// One-time scan of a resolved sequence: every register operand must
    /// fit the declared window and no compiler-only opcode may remain.
    /// This is what lets the dispatch loop use the unchecked accessors.
    fn verify(
        &mut self,
        atomid: AtomId,
        instanceid: InstanceId,
        seq: &Sequence,
        count: u32,
    ) -> Result<(), Fault> {
        if self.verified.contains(&(atomid, instanceid)) {
            return Ok(());
        }
        for (offset, instr) in seq.iter_from(0) {
            if instr.op().is_compiler_only() {
                return Err(Fault::UnexpectedOpcode {
                    op: instr.op(),
                    offset,
                });
            }
            let mut instr = instr;
            let mut bad = None;
            instr.for_each_lvid(|&mut lvid| {
                if lvid >= count && bad.is_none() {
                    bad = Some(lvid);
                }
            });
            if let Some(lvid) = bad {
                return Err(Fault::RegisterOutOfRange {
                    lvid,
                    count,
                    offset,
                });
            }
        }
        debug!("verified atom:{atomid}#{instanceid}, {count} registers");
        self.verified.insert((atomid, instanceid));
        Ok(())
    }

    #[inline(always)]
    fn reg(&self, base: usize, lvid: u32) -> Register {
        // SAFETY: verify() proved every operand fits the window
        unsafe { self.stack.get_unchecked(base, lvid) }
    }

    #[inline(always)]
    fn put(&mut self, base: usize, lvid: u32, value: Register) {
        // SAFETY: same bound as reg()
        unsafe { self.stack.set_unchecked(base, lvid, value) }
    }

    fn jump(&self, seq: &Sequence, cursor: u32, label: u32) -> Result<u32, Fault> {
        seq.jump_to_label_forward(cursor, label)
            .or_else(|| seq.jump_to_label_backward(cursor, label))
            .ok_or(Fault::InvalidLabel {
                label,
                offset: cursor,
            })
    }

    fn dispatch(&mut self, seq: &Sequence, base: usize) -> Result<Register, Fault> {
        let mut pushed: Vec<Register> = Vec::new();
        // offset 0 is the stacksize header, consumed by invoke()
        let mut cursor = 1u32;
        loop {
            let instr = seq.read(cursor)?;
            match instr {
                Instr::Nop | Instr::Label { .. } => {}

                Instr::StoreConstant { lvid, value } => {
                    self.put(base, lvid, Register::from_u64(value));
                }
                Instr::StoreText { lvid, text } => {
                    let ptr = self.intern_text(seq.text(text));
                    self.put(base, lvid, Register::from_u64(ptr));
                }
                Instr::Store { lvid, source } => {
                    let value = self.reg(base, source);
                    self.put(base, lvid, value);
                }

                Instr::Add { lvid, lhs, rhs } => self.bin_u64(base, lvid, lhs, rhs, u64::wrapping_add),
                Instr::Sub { lvid, lhs, rhs } => self.bin_u64(base, lvid, lhs, rhs, u64::wrapping_sub),
                Instr::Mul { lvid, lhs, rhs } => self.bin_u64(base, lvid, lhs, rhs, u64::wrapping_mul),
                Instr::Imul { lvid, lhs, rhs } => self.bin_i64(base, lvid, lhs, rhs, i64::wrapping_mul),
                Instr::Div { lvid, lhs, rhs } => {
                    let d = self.reg(base, rhs).as_u64();
                    if d == 0 {
                        return Err(Fault::DivideByZero { offset: cursor });
                    }
                    let n = self.reg(base, lhs).as_u64();
                    self.put(base, lvid, Register::from_u64(n / d));
                }
                Instr::Idiv { lvid, lhs, rhs } => {
                    let d = self.reg(base, rhs).as_i64();
                    if d == 0 {
                        return Err(Fault::DivideByZero { offset: cursor });
                    }
                    let n = self.reg(base, lhs).as_i64();
                    self.put(base, lvid, Register::from_i64(n.wrapping_div(d)));
                }
                Instr::Fadd { lvid, lhs, rhs } => self.bin_f64(base, lvid, lhs, rhs, |a, b| a + b),
                Instr::Fsub { lvid, lhs, rhs } => self.bin_f64(base, lvid, lhs, rhs, |a, b| a - b),
                Instr::Fmul { lvid, lhs, rhs } => self.bin_f64(base, lvid, lhs, rhs, |a, b| a * b),
                Instr::Fdiv { lvid, lhs, rhs } => self.bin_f64(base, lvid, lhs, rhs, |a, b| a / b),

                Instr::Eq { lvid, lhs, rhs } => self.cmp_u64(base, lvid, lhs, rhs, |a, b| a == b),
                Instr::Neq { lvid, lhs, rhs } => self.cmp_u64(base, lvid, lhs, rhs, |a, b| a != b),
                Instr::Lt { lvid, lhs, rhs } => self.cmp_u64(base, lvid, lhs, rhs, |a, b| a < b),
                Instr::Lte { lvid, lhs, rhs } => self.cmp_u64(base, lvid, lhs, rhs, |a, b| a <= b),
                Instr::Gt { lvid, lhs, rhs } => self.cmp_u64(base, lvid, lhs, rhs, |a, b| a > b),
                Instr::Gte { lvid, lhs, rhs } => self.cmp_u64(base, lvid, lhs, rhs, |a, b| a >= b),
                Instr::Ilt { lvid, lhs, rhs } => self.cmp_i64(base, lvid, lhs, rhs, |a, b| a < b),
                Instr::Ilte { lvid, lhs, rhs } => self.cmp_i64(base, lvid, lhs, rhs, |a, b| a <= b),
                Instr::Igt { lvid, lhs, rhs } => self.cmp_i64(base, lvid, lhs, rhs, |a, b| a > b),
                Instr::Igte { lvid, lhs, rhs } => self.cmp_i64(base, lvid, lhs, rhs, |a, b| a >= b),
                Instr::Flt { lvid, lhs, rhs } => self.cmp_f64(base, lvid, lhs, rhs, |a, b| a < b),
                Instr::Flte { lvid, lhs, rhs } => self.cmp_f64(base, lvid, lhs, rhs, |a, b| a <= b),
                Instr::Fgt { lvid, lhs, rhs } => self.cmp_f64(base, lvid, lhs, rhs, |a, b| a > b),
                Instr::Fgte { lvid, lhs, rhs } => self.cmp_f64(base, lvid, lhs, rhs, |a, b| a >= b),

                Instr::Band { lvid, lhs, rhs } => self.bin_u64(base, lvid, lhs, rhs, |a, b| a & b),
                Instr::Bor { lvid, lhs, rhs } => self.bin_u64(base, lvid, lhs, rhs, |a, b| a | b),
                Instr::Bxor { lvid, lhs, rhs } => self.bin_u64(base, lvid, lhs, rhs, |a, b| a ^ b),
                Instr::Lsl { lvid, lhs, rhs } => {
                    self.bin_u64(base, lvid, lhs, rhs, |a, b| a << (b & 63))
                }
                Instr::Lsr { lvid, lhs, rhs } => {
                    self.bin_u64(base, lvid, lhs, rhs, |a, b| a >> (b & 63))
                }
                Instr::Negate { lvid, operand } => {
                    let v = self.reg(base, operand).as_i64();
                    self.put(base, lvid, Register::from_i64(v.wrapping_neg()));
                }
                Instr::Bnot { lvid, operand } => {
                    let v = self.reg(base, operand).as_u64();
                    self.put(base, lvid, Register::from_u64(!v));
                }

                Instr::Jmp { label } => {
                    cursor = self.jump(seq, cursor, label)?;
                    continue;
                }
                Instr::Jz { lvid, label } => {
                    if !self.reg(base, lvid).as_bool() {
                        cursor = self.jump(seq, cursor, label)?;
                        continue;
                    }
                }
                Instr::Jnz { lvid, label } => {
                    if self.reg(base, lvid).as_bool() {
                        cursor = self.jump(seq, cursor, label)?;
                        continue;
                    }
                }
                Instr::Assert { lvid } => {
                    if !self.reg(base, lvid).as_bool() {
                        return Err(Fault::AssertionFailed { offset: cursor });
                    }
                }
                Instr::Ret { lvid } => {
                    return Ok(if lvid == config::LVID_INVALID {
                        Register::ZERO
                    } else {
                        self.reg(base, lvid)
                    });
                }

                Instr::Memalloc { lvid, regsize } => {
                    let size = self.reg(base, regsize).as_u64();
                    let ptr = raw_alloc(size)?;
                    self.checker.hold(ptr, size, 0);
                    self.put(base, lvid, Register::from_u64(ptr));
                }
                Instr::Memfree { lvid, regsize } => {
                    let ptr = self.reg(base, lvid).as_u64();
                    let size = self.reg(base, regsize).as_u64();
                    self.checker.forget(ptr, size)?;
                    raw_free(ptr, size)?;
                }
                Instr::Memrealloc {
                    lvid,
                    oldsize,
                    newsize,
                } => {
                    let ptr = self.reg(base, lvid).as_u64();
                    let old = self.reg(base, oldsize).as_u64();
                    let new = self.reg(base, newsize).as_u64();
                    self.checker.forget(ptr, old)?;
                    let moved = raw_realloc(ptr, old, new)?;
                    self.checker.hold(moved, new, 0);
                    self.put(base, lvid, Register::from_u64(moved));
                }
                Instr::Memfill {
                    lvid,
                    regsize,
                    pattern,
                } => {
                    let ptr = self.reg(base, lvid).as_u64();
                    let size = self.reg(base, regsize).as_u64();
                    let byte = self.reg(base, pattern).as_u64() as u8;
                    self.checker.validate(ptr, size)?;
                    // SAFETY: the checker vouches for [ptr, ptr+size)
                    unsafe { std::ptr::write_bytes(ptr as *mut u8, byte, size as usize) };
                }
                Instr::Memcopy { lvid, src, regsize } => {
                    let dst = self.reg(base, lvid).as_u64();
                    let from = self.reg(base, src).as_u64();
                    let size = self.reg(base, regsize).as_u64();
                    self.checker.validate(dst, size)?;
                    self.checker.validate(from, size)?;
                    // SAFETY: both ranges validated; memcopy promises no overlap
                    unsafe {
                        std::ptr::copy_nonoverlapping(
                            from as *const u8,
                            dst as *mut u8,
                            size as usize,
                        )
                    };
                }
                Instr::Memmove { lvid, src, regsize } => {
                    let dst = self.reg(base, lvid).as_u64();
                    let from = self.reg(base, src).as_u64();
                    let size = self.reg(base, regsize).as_u64();
                    self.checker.validate(dst, size)?;
                    self.checker.validate(from, size)?;
                    // SAFETY: both ranges validated; copy handles overlap
                    unsafe { std::ptr::copy(from as *const u8, dst as *mut u8, size as usize) };
                }
                Instr::Memcmp { lvid, src, regsize } => {
                    let a = self.reg(base, lvid).as_u64();
                    let b = self.reg(base, src).as_u64();
                    let size = self.reg(base, regsize).as_u64();
                    self.checker.validate(a, size)?;
                    self.checker.validate(b, size)?;
                    // SAFETY: both ranges validated
                    let ordering = unsafe {
                        let a = std::slice::from_raw_parts(a as *const u8, size as usize);
                        let b = std::slice::from_raw_parts(b as *const u8, size as usize);
                        a.cmp(b)
                    };
                    self.put(base, lvid, Register::from_i64(ordering as i64));
                }
                Instr::Cstrlen { lvid, ptr } => {
                    let at = self.reg(base, ptr).as_u64();
                    if at == 0 {
                        return Err(Fault::UnknownPointer { ptr: 0 });
                    }
                    // SAFETY: text pointers are NUL-terminated by intern_text;
                    // raw pointers are the guest's own responsibility here
                    let len = unsafe {
                        let mut p = at as *const u8;
                        while *p != 0 {
                            p = p.add(1);
                        }
                        p as u64 - at
                    };
                    self.put(base, lvid, Register::from_u64(len));
                }
                Instr::Load { lvid, ptr, ctype } => {
                    let at = self.reg(base, ptr).as_u64();
                    self.checker.validate(at, ctype.size_bytes())?;
                    let value = load_mem(at, ctype);
                    self.put(base, lvid, value);
                }
                Instr::StoreMem { ptr, lvid, ctype } => {
                    let at = self.reg(base, ptr).as_u64();
                    self.checker.validate(at, ctype.size_bytes())?;
                    store_mem(at, ctype, self.reg(base, lvid));
                }

                Instr::Allocate { lvid, atomid } => {
                    let size = self.program.atoms.class_size(atomid);
                    let ptr = raw_alloc(size)?;
                    // SAFETY: freshly allocated, size >= the refcount word
                    unsafe {
                        std::ptr::write_bytes(ptr as *mut u8, 0, size as usize);
                        *(ptr as *mut u64) = 1;
                    }
                    self.checker.hold(ptr, size, atomid);
                    self.put(base, lvid, Register::from_u64(ptr));
                }
                Instr::Dispose {
                    lvid,
                    atomid,
                    instanceid,
                } => {
                    let ptr = self.reg(base, lvid).as_u64();
                    if ptr != 0 {
                        self.destroy(ptr, atomid, instanceid)?;
                    }
                }
                Instr::Ref { lvid } => {
                    let ptr = self.reg(base, lvid).as_u64();
                    if ptr != 0 {
                        self.checker.validate(ptr, config::EXTRA_OBJECT_SIZE)?;
                        // SAFETY: refcount word is the head of every object
                        unsafe { *(ptr as *mut u64) += 1 };
                    }
                }
                Instr::Unref {
                    lvid,
                    atomid,
                    instanceid,
                } => {
                    let ptr = self.reg(base, lvid).as_u64();
                    if ptr != 0 {
                        self.checker.validate(ptr, config::EXTRA_OBJECT_SIZE)?;
                        // SAFETY: refcount word is the head of every object
                        let remaining = unsafe {
                            let count = ptr as *mut u64;
                            *count -= 1;
                            *count
                        };
                        if remaining == 0 {
                            self.destroy(ptr, atomid, instanceid)?;
                        }
                    }
                }
                Instr::Fieldget {
                    lvid,
                    self_lvid,
                    index,
                } => {
                    let ptr = self.reg(base, self_lvid).as_u64();
                    let at = field_addr(ptr, index);
                    self.checker.validate(at, 8)?;
                    // SAFETY: the field slot is within the validated object
                    let value = unsafe { *(at as *const u64) };
                    self.put(base, lvid, Register::from_u64(value));
                }
                Instr::Fieldset {
                    lvid,
                    self_lvid,
                    index,
                } => {
                    let ptr = self.reg(base, self_lvid).as_u64();
                    let at = field_addr(ptr, index);
                    self.checker.validate(at, 8)?;
                    let value = self.reg(base, lvid).as_u64();
                    // SAFETY: the field slot is within the validated object
                    unsafe { *(at as *mut u64) = value };
                }

                Instr::Push { lvid, .. } => {
                    // named arguments were already ordered at compile time
                    pushed.push(self.reg(base, lvid));
                }
                Instr::Call {
                    lvid,
                    func,
                    instanceid,
                } => {
                    if instanceid == u32::MAX {
                        return Err(Fault::UnexpectedOpcode {
                            op: instr.op(),
                            offset: cursor,
                        });
                    }
                    let args = std::mem::take(&mut pushed);
                    let value = self.invoke(func, instanceid, &args)?;
                    self.put(base, lvid, value);
                }
                Instr::Intrinsic { lvid, id, name } => {
                    if name != 0 {
                        return Err(Fault::UnexpectedOpcode {
                            op: instr.op(),
                            offset: cursor,
                        });
                    }
                    let proto = self
                        .program
                        .intrinsics
                        .get(id)
                        .ok_or(Fault::UnknownIntrinsic { id })?;
                    let args = std::mem::take(&mut pushed);
                    let marshalled: Vec<Register> = proto
                        .params
                        .iter()
                        .enumerate()
                        .map(|(i, &kind)| narrow(args.get(i).copied().unwrap_or(Register::ZERO), kind))
                        .collect();
                    let value = (proto.callback)(&marshalled);
                    self.put(base, lvid, narrow(value, proto.rettype));
                }

                other => {
                    return Err(Fault::UnexpectedOpcode {
                        op: other.op(),
                        offset: cursor,
                    });
                }
            }
            cursor += 1;
        }
    }

    /// Run the destructor, then free the object including its header.
    fn destroy(&mut self, ptr: u64, atomid: AtomId, instanceid: InstanceId) -> Result<(), Fault> {
        let class = self
            .program
            .atoms
            .get(atomid)
            .map(|a| a.parent)
            .ok_or(Fault::InvalidDtor { atomid, instanceid })?;
        self.invoke(atomid, instanceid, &[Register::from_u64(ptr)])
            .map_err(|fault| match fault {
                Fault::NotInstantiated { .. } => Fault::InvalidDtor { atomid, instanceid },
                other => other,
            })?;
        let size = self.program.atoms.class_size(class);
        self.checker.forget(ptr, size)?;
        raw_free(ptr, size)
    }

    fn intern_text(&mut self, text: &str) -> u64 {
        // the guest sees a C string: truncate at an interior NUL instead
        // of dropping the whole payload
        let bytes = text.as_bytes();
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        let owned = CString::new(&bytes[..end]).unwrap_or_default();
        let ptr = owned.as_ptr() as u64;
        // kept alive for the rest of the run
        self.texts.push(owned);
        ptr
    }

    #[inline(always)]
    fn bin_u64(&mut self, base: usize, lvid: u32, lhs: u32, rhs: u32, f: fn(u64, u64) -> u64) {
        let a = self.reg(base, lhs).as_u64();
        let b = self.reg(base, rhs).as_u64();
        self.put(base, lvid, Register::from_u64(f(a, b)));
    }

    #[inline(always)]
    fn bin_i64(&mut self, base: usize, lvid: u32, lhs: u32, rhs: u32, f: fn(i64, i64) -> i64) {
        let a = self.reg(base, lhs).as_i64();
        let b = self.reg(base, rhs).as_i64();
        self.put(base, lvid, Register::from_i64(f(a, b)));
    }

    #[inline(always)]
    fn bin_f64(&mut self, base: usize, lvid: u32, lhs: u32, rhs: u32, f: fn(f64, f64) -> f64) {
        let a = self.reg(base, lhs).as_f64();
        let b = self.reg(base, rhs).as_f64();
        self.put(base, lvid, Register::from_f64(f(a, b)));
    }

    #[inline(always)]
    fn cmp_u64(&mut self, base: usize, lvid: u32, lhs: u32, rhs: u32, f: fn(u64, u64) -> bool) {
        let a = self.reg(base, lhs).as_u64();
        let b = self.reg(base, rhs).as_u64();
        self.put(base, lvid, Register::from_bool(f(a, b)));
    }

    #[inline(always)]
    fn cmp_i64(&mut self, base: usize, lvid: u32, lhs: u32, rhs: u32, f: fn(i64, i64) -> bool) {
        let a = self.reg(base, lhs).as_i64();
        let b = self.reg(base, rhs).as_i64();
        self.put(base, lvid, Register::from_bool(f(a, b)));
    }

    #[inline(always)]
    fn cmp_f64(&mut self, base: usize, lvid: u32, lhs: u32, rhs: u32, f: fn(f64, f64) -> bool) {
        let a = self.reg(base, lhs).as_f64();
        let b = self.reg(base, rhs).as_f64();
        self.put(base, lvid, Register::from_bool(f(a, b)));
    }
}

fn field_addr(ptr: u64, index: u32) -> u64 {
    ptr + config::EXTRA_OBJECT_SIZE + index as u64 * 8
}

fn layout_for(size: u64) -> Result<Layout, Fault> {
    Layout::from_size_align(size.max(1) as usize, 8)
        .map_err(|_| Fault::AllocationTooLarge { size })
}

fn raw_alloc(size: u64) -> Result<u64, Fault> {
    let layout = layout_for(size)?;
    // SAFETY: layout has non-zero size
    let ptr = unsafe { alloc(layout) };
    if ptr.is_null() {
        handle_alloc_error(layout);
    }
    Ok(ptr as u64)
}

fn raw_free(ptr: u64, size: u64) -> Result<(), Fault> {
    let layout = layout_for(size)?;
    // SAFETY: the checker already vouched that ptr owns `size` bytes
    unsafe { dealloc(ptr as *mut u8, layout) };
    Ok(())
}

fn raw_realloc(ptr: u64, oldsize: u64, newsize: u64) -> Result<u64, Fault> {
    let layout = layout_for(oldsize)?;
    let new_layout = layout_for(newsize)?;
    // SAFETY: ptr was allocated with `layout`
    let moved = unsafe { realloc(ptr as *mut u8, layout, new_layout.size()) };
    if moved.is_null() {
        handle_alloc_error(new_layout);
    }
    Ok(moved as u64)
}

fn load_mem(at: u64, ctype: CType) -> Register {
    // SAFETY (all arms): the caller validated [at, at+size) with the checker
    unsafe {
        match ctype {
            CType::U8 | CType::Bool => Register::from_u64((at as *const u8).read_unaligned() as u64),
            CType::U16 => Register::from_u64((at as *const u16).read_unaligned() as u64),
            CType::U32 => Register::from_u64((at as *const u32).read_unaligned() as u64),
            CType::I8 => Register::from_i64((at as *const i8).read_unaligned() as i64),
            CType::I16 => Register::from_i64((at as *const i16).read_unaligned() as i64),
            CType::I32 => Register::from_i64((at as *const i32).read_unaligned() as i64),
            CType::F32 => Register::from_f64((at as *const f32).read_unaligned() as f64),
            CType::F64 => Register::from_f64((at as *const f64).read_unaligned()),
            _ => Register::from_u64((at as *const u64).read_unaligned()),
        }
    }
}

fn store_mem(at: u64, ctype: CType, value: Register) {
    // SAFETY (all arms): the caller validated [at, at+size) with the checker
    unsafe {
        match ctype {
            CType::U8 | CType::Bool | CType::I8 => {
                (at as *mut u8).write_unaligned(value.as_u64() as u8)
            }
            CType::U16 | CType::I16 => (at as *mut u16).write_unaligned(value.as_u64() as u16),
            CType::U32 | CType::I32 => (at as *mut u32).write_unaligned(value.as_u64() as u32),
            CType::F32 => (at as *mut f32).write_unaligned(value.as_f64() as f32),
            CType::F64 => (at as *mut f64).write_unaligned(value.as_f64()),
            _ => (at as *mut u64).write_unaligned(value.as_u64()),
        }
    }
}

/// Clip a register to the declared kind, sign-extending back into the
/// 64-bit cell for signed integers. Floats travel as f64 bits.
pub fn narrow(value: Register, kind: CType) -> Register {
    match kind {
        CType::Void => Register::ZERO,
        CType::Bool => Register::from_bool(value.as_bool()),
        CType::U8 => Register::from_u64(value.as_u64() & 0xff),
        CType::U16 => Register::from_u64(value.as_u64() & 0xffff),
        CType::U32 => Register::from_u64(value.as_u64() & 0xffff_ffff),
        CType::I8 => Register::from_i64(value.as_u64() as u8 as i8 as i64),
        CType::I16 => Register::from_i64(value.as_u64() as u16 as i16 as i64),
        CType::I32 => Register::from_i64(value.as_u64() as u32 as i32 as i64),
        CType::F32 => Register::from_f64(value.as_f64() as f32 as f64),
        CType::Any | CType::Ptr | CType::U64 | CType::I64 | CType::F64 => value,
    }
}

/// Run the instantiated entry point and fold the outcome into an exit
/// code. Debug builds track every allocation, release builds do not.
pub fn execute(program: &Program) -> u64 {
    if program.entry.is_none() {
        return config::EXIT_BAD_ENTRYPOINT;
    }
    if program.entry_sequence().is_none() {
        return config::EXIT_NOT_INSTANTIATED;
    }
    if cfg!(debug_assertions) {
        execute_with(program, TrackedChecker::new())
    } else {
        execute_with(program, NoopChecker)
    }
}

fn execute_with<C: MemChecker>(program: &Program, checker: C) -> u64 {
    let mut context = ThreadContext::new(program, checker);
    match context.run_entry() {
        Ok(value) => {
            let leaks = context.checker.leaked();
            if leaks > 0 {
                error!("{leaks} allocation(s) still live on exit");
            }
            value.as_u64()
        }
        Err(fault) => {
            error!("fault: {fault}");
            config::EXIT_INTERNAL_FAULT
        }
    }
}

/// Instantiate `entry` and execute it, in one call.
pub fn run(program: &mut Program, report: &mut Report, entry: &str) -> u64 {
    if program.instantiate_entrypoint(report, entry).is_err() {
        return if program.has_entrypoint(entry) {
            config::EXIT_NOT_INSTANTIATED
        } else {
            config::EXIT_BAD_ENTRYPOINT
        };
    }
    execute(program)
}
