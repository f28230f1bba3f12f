//! The trampoline engine of an inline function-hooking library for x86 and
//! x86-64 machine code on a Windows host.
//!
//! Given a function to intercept and a callback to redirect execution to,
//! [`trampoline_create`] builds a *trampoline*: an executable buffer
//! holding a faithful relocated copy of the target's first bytes — enough
//! to make room for a branch instruction at the original entry — followed
//! by a jump back to the first untouched byte of the original. Patching
//! the original entry to redirect to the callback is an outer layer's job;
//! this crate only builds and manages the trampolines it jumps through.
//!
//! ## Architecture
//!
//! - [`decoder`] — the external instruction-decoding service, behind a
//!   trait so the concrete backend ([`iced-x86`](https://docs.rs/iced-x86))
//!   stays swappable.
//! - [`host`] — the external host virtual-memory service (page query,
//!   allocate, protect, release), behind a trait with a concrete Windows
//!   backend.
//! - [`chunk`] — the fixed-layout trampoline slot.
//! - [`region`] — a page-aligned host allocation subdivided into chunks.
//! - [`directory`] — the ordered collection of live regions, searched by
//!   proximity.
//! - [`alloc`] — placing a fresh region within ±2 GiB of a target range.
//! - [`relocator`] — range analysis and the instruction relocator that
//!   does the actual prologue rewriting.
//! - [`engine`] — the public operations and process-wide state.
//!
//! ## Example
//!
//! ```no_run
//! # #[cfg(windows)]
//! # fn run() -> Result<(), trampoline_engine::Error> {
//! use trampoline_engine::trampoline_create;
//!
//! # fn target_function() {}
//! # fn callback_function() {}
//! let target = target_function as usize as u64;
//! let callback = callback_function as usize as u64;
//!
//! let trampoline = trampoline_create(target, callback, 5)?;
//! let _ = trampoline.address_of_trampoline_code();
//! # Ok(())
//! # }
//! ```

pub mod alloc;
pub mod arch;
pub mod chunk;
pub mod decoder;
pub mod directory;
pub mod engine;
pub mod error;
pub mod flags;
pub mod host;
pub mod region;
pub mod relocator;

#[cfg(windows)]
pub use engine::{trampoline_create, trampoline_create_ex, trampoline_free};
pub use engine::Trampoline;
pub use error::{Error, Result};
pub use flags::TrampolineFlags;
