//! Architecture-dependent constants and byte-level thunk encoders.
//!
//! The relocator and chunk layout are shared between x86 and x86-64; what
//! differs is captured here: the decoder's bitness, whether an indirect
//! absolute jump/call is needed at all (it never is on x86, since a
//! relative near jump already reaches the entire 32-bit address space),
//! and the concrete byte sequences for each.

pub mod thunk;

use cfg_if::cfg_if;

/// Size of a relative near jump (`E9 xx xx xx xx`).
pub const SIZEOF_RELATIVE_JUMP: usize = 5;

/// Size of the indirect absolute jump instruction proper
/// (`FF 25 00 00 00 00`); the 8-byte literal pointer it dereferences is
/// accounted for separately in the chunk layout.
pub const SIZEOF_ABSOLUTE_JUMP: usize = 6;

/// The reach of a 32-bit-displacement near relative jump/call on x86-64;
/// also used as the maximum distance between a chunk and anything it must
/// address (the hook target, or any absolute address referenced by a
/// relocated instruction).
pub const RANGE_OF_RELATIVE_JUMP: u64 = 0x7FFF_FFFF;

/// Longest possible single x86/x86-64 instruction encoding.
pub const MAX_INSTRUCTION_LENGTH: usize = 15;

/// Upper bound on the number of original bytes consumed to make room for
/// a `SIZEOF_RELATIVE_JUMP`-byte patch: the last instruction considered
/// may be up to `MAX_INSTRUCTION_LENGTH` bytes, started one byte before
/// the patch boundary.
pub const MAX_CODE_SIZE: usize = MAX_INSTRUCTION_LENGTH + SIZEOF_RELATIVE_JUMP - 1;

/// `MAX_CODE_SIZE` plus room for the trailing back-jump.
pub const MAX_CODE_SIZE_WITH_BACKJUMP: usize = MAX_CODE_SIZE + SIZEOF_ABSOLUTE_JUMP;

cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        /// Decoder bitness, selected at compile time per §4.2.
        pub const BITNESS: u32 = 64;
        /// Whether range analysis and ±2 GiB region placement apply.
        pub const NEEDS_PROXIMITY_CHECK: bool = true;
    } else if #[cfg(target_arch = "x86")] {
        pub const BITNESS: u32 = 32;
        pub const NEEDS_PROXIMITY_CHECK: bool = false;
    } else {
        compile_error!("trampoline-engine only supports target_arch = \"x86\" or \"x86_64\"");
    }
}

/// Returns true if `displacement` fits inside a 32-bit-displacement near
/// relative jump/call, i.e. is within ±`RANGE_OF_RELATIVE_JUMP`.
pub fn is_within_range(displacement: i64) -> bool {
    let range = RANGE_OF_RELATIVE_JUMP as i64;
    (-range..=range).contains(&displacement)
}

/// Returns true if `candidate` lies within ±`RANGE_OF_RELATIVE_JUMP` of
/// both `lo` and `hi`.
pub fn in_proximity(candidate: u64, lo: u64, hi: u64) -> bool {
    if !NEEDS_PROXIMITY_CHECK {
        return true;
    }
    distance(candidate, lo) <= RANGE_OF_RELATIVE_JUMP && distance(candidate, hi) <= RANGE_OF_RELATIVE_JUMP
}

/// Absolute distance between two addresses, saturating rather than
/// wrapping (both addresses are canonical user-space pointers).
pub fn distance(a: u64, b: u64) -> u64 {
    if a > b {
        a - b
    } else {
        b - a
    }
}
