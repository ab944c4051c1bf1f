//! Hard limits and reserved conventions shared by the mapping pass, the
//! instantiation engine and the executor.

/// Maximum number of declared function parameters.
pub const MAX_PARAMS: usize = 12;

/// Maximum number of pushed call arguments (positional + named).
pub const MAX_PUSHED_PARAMS: usize = 12;

/// Bytes prepended to every object allocation: one 64-bit refcount word.
/// Every size computation path (allocate, realloc, free, destructor
/// dispatch) must account for it consistently.
pub const EXTRA_OBJECT_SIZE: u64 = 8;

/// Register 0 is never valid.
pub const LVID_INVALID: u32 = 0;

/// Register 1 holds the return value by convention.
pub const LVID_RET: u32 = 1;

/// Parameters are copied into the callee window starting here.
pub const LVID_FIRST_PARAM: u32 = 2;

/// Instantiations may nest (calls discovered while walking a body); this
/// caps the builder's own call stack.
pub const MAX_INSTANTIATE_DEPTH: usize = 256;

/// Reserved member names for lifecycle operators.
pub const NAME_DISPOSE: &str = "^dispose";
pub const NAME_CLONE: &str = "^clone";
pub const NAME_DEFAULT_NEW: &str = "^default-new";
pub const NAME_NEW: &str = "^new";

/// Exit codes returned by `execute` for fault categories.
pub const EXIT_INTERNAL_FAULT: u64 = 120;
pub const EXIT_BAD_ENTRYPOINT: u64 = 121;
pub const EXIT_NOT_INSTANTIATED: u64 = 122;
