//! Concrete decoder façade backed by `iced-x86`.
//!
//! `iced-x86` is the decoder this engine is grounded on: a pure-Rust,
//! actively maintained x86/x86-64 decoder, chosen (elsewhere in the
//! corpus this design draws on, for the same inline-hook use case) over
//! an FFI-bound disassembler because it builds on stable Rust and needs
//! no vendored C sources.

use iced_x86::{Decoder as IcedDecoderImpl, DecoderOptions, Instruction, Mnemonic, OpKind};

use super::{Decoded, MnemonicClass};
use crate::arch::BITNESS;
use crate::error::{Error, Result};

/// Decodes x86/x86-64 instructions using `iced-x86`.
#[derive(Debug, Default, Clone, Copy)]
pub struct IcedDecoder;

impl super::Decoder for IcedDecoder {
    fn decode_one(&self, buffer: &[u8], runtime_address: u64) -> Result<Decoded> {
        let mut decoder =
            IcedDecoderImpl::with_ip(BITNESS, buffer, runtime_address, DecoderOptions::NONE);

        if !decoder.can_decode() {
            return Err(Error::DecodeFailed { offset: 0 });
        }

        let mut instruction = Instruction::default();
        decoder.decode_out(&mut instruction);

        if instruction.is_invalid() {
            return Err(Error::DecodeFailed { offset: 0 });
        }

        let length = instruction.len();
        let bytes = buffer[..length].to_vec();

        let is_rip_relative_memory = instruction.is_ip_rel_memory_operand();
        let is_relative_branch = (0..instruction.op_count()).any(|i| {
            matches!(
                instruction.op_kind(i),
                OpKind::NearBranch16 | OpKind::NearBranch32 | OpKind::NearBranch64
            )
        });

        let class = classify(&instruction);
        let is_relative = is_rip_relative_memory || is_relative_branch;

        let displacement = if is_rip_relative_memory {
            // `memory_displacement64` folds in `ip + length`, just like
            // `near_branch_target` below, so back out the raw displacement
            // the relocator expects.
            (instruction.memory_displacement64() as i64)
                .wrapping_sub(runtime_address as i64)
                .wrapping_sub(length as i64)
        } else if is_relative_branch {
            // `near_branch_target` already folds in ip + length, so back
            // out the raw displacement the relocator expects.
            (instruction.near_branch_target() as i64)
                .wrapping_sub(runtime_address as i64)
                .wrapping_sub(length as i64)
        } else {
            0
        };

        let trailing_immediate_len = if is_rip_relative_memory {
            trailing_immediate_bytes(&instruction)
        } else {
            0
        };

        let condition_code = primary_condition_nibble(&bytes);

        Ok(Decoded {
            length,
            class,
            is_relative,
            is_rip_relative_memory,
            displacement,
            trailing_immediate_len,
            condition_code,
            bytes,
        })
    }
}

/// Classifies an instruction into the coarse families the relocator needs.
fn classify(instruction: &Instruction) -> MnemonicClass {
    match instruction.mnemonic() {
        Mnemonic::Jcxz | Mnemonic::Jecxz | Mnemonic::Jrcxz => MnemonicClass::Jcxz,
        Mnemonic::Loop | Mnemonic::Loope | Mnemonic::Loopne => MnemonicClass::Loop,
        Mnemonic::Call => MnemonicClass::Call,
        Mnemonic::Jmp => MnemonicClass::Jmp,
        Mnemonic::Ret | Mnemonic::Retf => MnemonicClass::Return,
        _ if is_conditional_branch(instruction) => MnemonicClass::Jcc,
        _ => MnemonicClass::Other,
    }
}

fn is_conditional_branch(instruction: &Instruction) -> bool {
    matches!(
        instruction.flow_control(),
        iced_x86::FlowControl::ConditionalBranch
    ) && !matches!(
        instruction.mnemonic(),
        Mnemonic::Jcxz | Mnemonic::Jecxz | Mnemonic::Jrcxz | Mnemonic::Loop | Mnemonic::Loope | Mnemonic::Loopne
    )
}

/// Extracts the condition nibble from a `Jcc`'s primary opcode byte,
/// skipping any `0F` two-byte-opcode escape, per §4.7
/// (`0x74` ⟶ `jz` ⟶ condition `4`).
fn primary_condition_nibble(bytes: &[u8]) -> u8 {
    bytes
        .iter()
        .find(|op| **op != 0x0F)
        .map(|op| op & 0x0F)
        .unwrap_or(0)
}

/// Number of trailing immediate-operand bytes following a memory operand,
/// e.g. the `imm32` in `cmp dword ptr [rip+x], imm32`.
fn trailing_immediate_bytes(instruction: &Instruction) -> usize {
    (0..instruction.op_count())
        .map(|i| match instruction.op_kind(i) {
            OpKind::Immediate8 | OpKind::Immediate8to32 | OpKind::Immediate8to64 | OpKind::Immediate8_2nd => 1,
            OpKind::Immediate16 => 2,
            OpKind::Immediate32 | OpKind::Immediate32to64 => 4,
            OpKind::Immediate64 => 8,
            _ => 0,
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::Decoder;

    #[test]
    #[cfg(target_arch = "x86_64")]
    fn rip_relative_displacement_is_raw_not_absolute() {
        // mov rax, [rip+0x10]
        let bytes = [0x48u8, 0x8B, 0x05, 0x10, 0x00, 0x00, 0x00];
        let runtime_address = 0x1000u64;
        let decoded = IcedDecoder.decode_one(&bytes, runtime_address).unwrap();

        assert!(decoded.is_rip_relative_memory);
        assert_eq!(decoded.length, bytes.len());
        // The raw displacement, not `runtime_address + length + disp`.
        assert_eq!(decoded.displacement, 0x10);
        assert_eq!(
            decoded.absolute_target(runtime_address).unwrap(),
            runtime_address + bytes.len() as u64 + 0x10
        );
    }

    #[test]
    #[cfg(target_arch = "x86_64")]
    fn rip_relative_displacement_handles_negative_offsets() {
        // lea rax, [rip-0x8]
        let bytes = [0x48u8, 0x8D, 0x05, 0xF8, 0xFF, 0xFF, 0xFF];
        let runtime_address = 0x2000u64;
        let decoded = IcedDecoder.decode_one(&bytes, runtime_address).unwrap();

        assert_eq!(decoded.displacement, -8);
        assert_eq!(
            decoded.absolute_target(runtime_address).unwrap(),
            runtime_address + bytes.len() as u64 - 8
        );
    }
}
