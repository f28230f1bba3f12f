//! Flags controlling which relative-instruction rewrite classes are allowed.

use bitflags::bitflags;

bitflags! {
    /// Bit-OR-able flags accepted by [`crate::engine::trampoline_create_ex`].
    ///
    /// Each flag unlocks a rewrite class for a particular family of relative
    /// instructions found in a hooked prologue. When a flag is not set and
    /// an instruction of that class is encountered, `init_chunk` fails with
    /// [`crate::error::Error::Failed`] rather than silently dropping the
    /// instruction.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct TrampolineFlags: u32 {
        /// Allow rewriting near-relative and RIP-relative-indirect `call`.
        const REWRITE_CALL = 1 << 0;
        /// Allow rewriting `jcxz` / `jecxz` / `jrcxz`.
        const REWRITE_JCXZ = 1 << 1;
        /// Allow rewriting `loop` / `loope` / `loopne`.
        const REWRITE_LOOP = 1 << 2;
    }
}

impl Default for TrampolineFlags {
    /// `trampoline_create` uses this: every rewrite class enabled.
    fn default() -> Self {
        TrampolineFlags::REWRITE_CALL | TrampolineFlags::REWRITE_JCXZ | TrampolineFlags::REWRITE_LOOP
    }
}
