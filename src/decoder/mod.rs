//! Decoder façade.
//!
//! The relocator (see [`crate::relocator`]) never talks to a concrete
//! disassembler. It is written entirely against this module's
//! [`Decoder`] trait and the [`Decoded`] record it returns, so the
//! decoding backend (currently [`iced`]) stays swappable, matching the
//! "external decoder service" collaborator the engine's design assumes.

mod iced;

pub use self::iced::IcedDecoder;

use crate::error::{Error, Result};

/// The coarse mnemonic classes the relocator needs to distinguish in order
/// to decide which rewrite strategy (if any) a relative instruction needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MnemonicClass {
    /// Not a relative control-flow instruction and not a return.
    Other,
    /// `call` (near-relative, or indirect through a RIP-relative operand).
    Call,
    /// Unconditional `jmp` (near-relative).
    Jmp,
    /// Conditional near/short branch (`Jcc`).
    Jcc,
    /// `jcxz` / `jecxz` / `jrcxz`.
    Jcxz,
    /// `loop` / `loope` / `loopne`.
    Loop,
    /// `ret` / `retn`.
    Return,
}

/// A decoded instruction, reduced to exactly the facts the relocator and
/// range analysis need.
#[derive(Debug, Clone)]
pub struct Decoded {
    /// Total encoded length in bytes.
    pub length: usize,
    /// Coarse mnemonic classification.
    pub class: MnemonicClass,
    /// Set when the instruction has at least one position-dependent
    /// operand (a relative branch displacement or a RIP-relative memory
    /// operand).
    pub is_relative: bool,
    /// Set when the instruction addresses memory via `[rip+disp32]`
    /// (`ModRM.mod == 0 && ModRM.rm == 5`).
    pub is_rip_relative_memory: bool,
    /// Raw relative displacement, valid when `is_relative` is set. For a
    /// RIP-relative memory operand this is the operand's displacement; for
    /// a relative branch this is the branch's signed immediate.
    pub displacement: i64,
    /// Number of trailing immediate-operand bytes that follow the
    /// displacement field in the encoding, if any (0 for most
    /// control-flow and RIP-relative instructions; nonzero for forms
    /// like `cmp dword [rip+x], imm32`).
    pub trailing_immediate_len: usize,
    /// Primary condition-code nibble for `Jcc`, extracted from the opcode
    /// (`0x74` ⟶ `4`, i.e. `jz`). Unused for other classes.
    pub condition_code: u8,
    /// The instruction's own bytes, exactly as read from the source.
    pub bytes: Vec<u8>,
}

impl Decoded {
    /// Returns the absolute target address of a relative instruction
    /// decoded with `runtime_address` as its address, per §4.2.
    ///
    /// * RIP-relative memory operand: `runtime_address + length + displacement`.
    /// * Relative branch: `runtime_address + length + displacement`.
    ///
    /// Both forms share the same arithmetic; the distinction only matters
    /// for 16-bit legacy masking, which this engine does not target (the
    /// host is always 32- or 64-bit protected mode).
    pub fn absolute_target(&self, runtime_address: u64) -> Result<u64> {
        if !self.is_relative {
            return Err(Error::InvalidOperation(
                "absolute_target called on a non-relative instruction",
            ));
        }
        Ok(runtime_address
            .wrapping_add(self.length as u64)
            .wrapping_add(self.displacement as u64))
    }
}

/// The decoder façade's contract: decode exactly one instruction starting
/// at `address`, reading at most `available` bytes from `buffer`.
pub trait Decoder {
    /// Decodes one instruction.
    ///
    /// `buffer` holds the bytes available for decoding (already bounded by
    /// [`crate::host::probe_readable`]); `runtime_address` is the
    /// address the first byte of `buffer` is assumed to execute at.
    fn decode_one(&self, buffer: &[u8], runtime_address: u64) -> Result<Decoded>;
}
