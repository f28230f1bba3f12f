//! Fixed-size byte encoders for the instructions the relocator and chunk
//! layout emit. Unlike the teacher's PIC thunk system, every encoder here
//! takes the already-known source and destination addresses directly: by
//! the time [`crate::relocator`] calls into this module, the chunk has a
//! concrete runtime address (it lives inside an already-allocated
//! region), so there is no need to defer code generation behind a
//! closure.

#[cfg(target_arch = "x86_64")]
pub mod x64;
#[cfg(target_arch = "x86")]
pub mod x86;

#[cfg(target_arch = "x86_64")]
pub use self::x64::*;
#[cfg(target_arch = "x86")]
pub use self::x86::*;
