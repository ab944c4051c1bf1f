use core::fmt;

use crate::instr::{DecodeError, Instr, Pragma};
use crate::strings::StringRefs;
use crate::{Instruction, Op};

/// An append-only array of fixed-width instruction words plus the string
/// table referenced by its operands.
///
/// Raw sequences are produced by the front end and consumed (read-only)
/// by the instantiation pass; each successful instantiation owns a fresh
/// resolved sequence that is itself read-only once stored in the atom's
/// instance cache.
#[derive(Debug, Clone, Default)]
pub struct Sequence {
    ops: Vec<Instruction>,
    pub strings: StringRefs,
}

impl Sequence {
    pub fn new() -> Self {
        Self {
            ops: Vec::new(),
            strings: StringRefs::new(),
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            ops: Vec::with_capacity(capacity),
            strings: StringRefs::new(),
        }
    }

    pub fn len(&self) -> u32 {
        self.ops.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Append one instruction; returns its offset.
    pub fn emit(&mut self, instr: Instr) -> u32 {
        let offset = self.ops.len() as u32;
        self.ops.push(instr.encode());
        offset
    }

    pub fn emit_all(&mut self, instrs: &[Instr]) {
        for instr in instrs {
            self.emit(*instr);
        }
    }

    /// Rewrite the instruction at `offset` in place.
    ///
    /// Used to fix up placeholders: `stacksize` after the register count is
    /// final, and short-circuit `nop` padding.
    pub fn patch(&mut self, offset: u32, instr: Instr) {
        assert!(
            (offset as usize) < self.ops.len(),
            "patch offset {offset} out of bounds"
        );
        self.ops[offset as usize] = instr.encode();
    }

    pub fn at(&self, offset: u32) -> Option<&Instruction> {
        self.ops.get(offset as usize)
    }

    /// Decode the instruction at `offset`.
    pub fn read(&self, offset: u32) -> Result<Instr, DecodeError> {
        let ins = self.at(offset).ok_or(DecodeError::OutOfBounds {
            offset,
            size: self.len(),
        })?;
        Instr::decode(ins, offset)
    }

    /// Intern text into the owned string table.
    pub fn intern(&mut self, text: &str) -> u32 {
        self.strings.intern(text)
    }

    /// Resolve a string ref from the owned table.
    pub fn text(&self, sref: u32) -> &str {
        self.strings.get(sref)
    }

    /// Next sibling offset of the blueprint starting at `offset`, using the
    /// `blueprintsize` pragma that must immediately follow every
    /// `blueprint`. O(1); this is how an outer pass skips over declaration
    /// bodies it is not instantiating.
    pub fn skip_blueprint(&self, offset: u32) -> Result<u32, DecodeError> {
        debug_assert!(matches!(self.read(offset), Ok(Instr::Blueprint { .. })));
        match self.read(offset + 1)? {
            Instr::Pragma(Pragma::BlueprintSize { size }) if size >= 2 => Ok(offset + size),
            _ => Err(DecodeError::MissingBlueprintSize { offset }),
        }
    }

    /// Linear forward scan for `label`, starting after `from`. Nested
    /// blueprint bodies are skipped so a label in a sibling declaration is
    /// never matched.
    pub fn jump_to_label_forward(&self, from: u32, label: u32) -> Option<u32> {
        let mut offset = from + 1;
        while offset < self.len() {
            match self.read(offset).ok()? {
                Instr::Label { id } if id == label => return Some(offset),
                Instr::Blueprint { .. } => {
                    offset = self.skip_blueprint(offset).ok()?;
                }
                _ => offset += 1,
            }
        }
        None
    }

    /// Linear backward scan for `label`, starting before `from`.
    ///
    /// Backward jumps only occur inside one resolved body (loops), where no
    /// nested blueprints remain, so a plain reverse scan is sufficient.
    pub fn jump_to_label_backward(&self, from: u32, label: u32) -> Option<u32> {
        let mut offset = from;
        while offset > 0 {
            offset -= 1;
            if let Ok(Instr::Label { id }) = self.read(offset) {
                if id == label {
                    return Some(offset);
                }
            }
        }
        None
    }

    /// Rewrite every register id strictly greater than `above` by `inc`,
    /// walking from `from` to the end of the enclosing body (the `end`
    /// matching the body's own scope depth). Nested blueprint bodies are
    /// skipped verbatim: their register numbering is independent.
    ///
    /// Used when parameters are inserted after code generation has already
    /// assigned local indices (captured-variable widening).
    pub fn increase_all_lvid(&mut self, inc: u32, above: u32, from: u32) {
        let mut offset = from;
        let mut depth = 0u32;
        while offset < self.len() {
            let mut instr = match self.read(offset) {
                Ok(instr) => instr,
                Err(_) => return,
            };
            match instr {
                Instr::Blueprint { .. } => {
                    match self.skip_blueprint(offset) {
                        Ok(next) => offset = next,
                        Err(_) => return,
                    }
                    continue;
                }
                Instr::Scope => depth += 1,
                Instr::End => {
                    if depth == 0 {
                        return;
                    }
                    depth -= 1;
                }
                _ => {}
            }
            let mut changed = false;
            instr.for_each_lvid(|lvid| {
                if *lvid > above {
                    *lvid += inc;
                    changed = true;
                }
            });
            if changed {
                self.ops[offset as usize] = instr.encode();
            }
            offset += 1;
        }
    }

    /// Offsets and decoded instructions from `from` onward. Decoding stops
    /// at the first malformed word.
    pub fn iter_from(&self, from: u32) -> impl Iterator<Item = (u32, Instr)> + '_ {
        (from..self.len()).map_while(move |offset| Some((offset, self.read(offset).ok()?)))
    }

    /// Whether every instruction decodes and none is compiler-only.
    /// Resolved sequences handed to the executor must satisfy this.
    pub fn is_executable(&self) -> bool {
        let mut offset = 0;
        while offset < self.len() {
            match self.read(offset) {
                Ok(instr) if !instr.op().is_compiler_only() => offset += 1,
                _ => return false,
            }
        }
        true
    }
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (offset, instr) in self.iter_from(0) {
            writeln!(f, "{offset:>5}: {instr}")?;
        }
        Ok(())
    }
}
