//! Error types for the trampoline engine.

/// The result of a trampoline engine operation.
pub type Result<T> = std::result::Result<T, Error>;

/// The error taxonomy from the engine's error handling design.
///
/// Every public operation that can fail returns one of these kinds; there
/// are no retries and a failing `create` leaves the engine's state exactly
/// as it was before the call (see [`crate::engine`]).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A null pointer was passed in, or out, or `min_bytes_to_reloc == 0`.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// The engine was asked to do something it cannot do in its current
    /// state (e.g. the readable region at `target` is shorter than
    /// `min_bytes_to_reloc`, or the engine was not initialized).
    #[error("invalid operation: {0}")]
    InvalidOperation(&'static str),

    /// No region could be placed within ±2 GiB of the required range, or a
    /// relative operand could not be rewritten to reach its target from any
    /// reachable chunk address.
    #[error("no reachable placement within the relative-jump range")]
    OutOfRange,

    /// The decoder rejected the prologue bytes.
    #[error("failed to decode instruction at offset {offset}")]
    DecodeFailed {
        /// Byte offset into the prologue buffer at which decoding failed.
        offset: usize,
    },

    /// A host kernel call (query / commit / protect / release) failed.
    #[error("host memory operation failed: {0}")]
    BadSyscall(String),

    /// An instruction required a rewrite class that the caller disabled via
    /// [`crate::flags::TrampolineFlags`].
    #[error("instruction at offset {offset} requires a disabled rewrite ({rewrite})")]
    Failed {
        /// Byte offset into the prologue buffer of the offending instruction.
        offset: usize,
        /// Name of the rewrite class that would have been needed.
        rewrite: &'static str,
    },
}
