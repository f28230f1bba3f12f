//! Range analysis (§4.3) and the instruction relocator (§4.7).

use crate::arch::{self, thunk};
use crate::chunk::TrampolineChunk;
use crate::decoder::{Decoded, Decoder, MnemonicClass};
use crate::error::{Error, Result};
use crate::flags::TrampolineFlags;

/// Result of [`prologue_range`]: the combined absolute-address range every
/// relative instruction in the candidate prologue touches.
#[derive(Debug, Clone, Copy)]
pub struct PrologueRange {
    pub lo: u64,
    pub hi: u64,
    pub any_relative: bool,
}

/// Decodes forward from offset 0 of `buffer`, computing the absolute
/// target of every relative instruction, until `offset >= min_bytes`.
/// `target` is the runtime address `buffer[0]` executes at.
///
/// On x86-32 this is never called: relative-jump reach covers the entire
/// address space, so region placement is unconstrained (§4.3).
pub fn prologue_range(decoder: &dyn Decoder, buffer: &[u8], target: u64, min_bytes: usize) -> Result<PrologueRange> {
    let mut offset = 0usize;
    let mut lo = target;
    let mut hi = target;
    let mut any_relative = false;

    while offset < min_bytes {
        let instruction_address = target + offset as u64;
        let decoded = decoder.decode_one(&buffer[offset..], instruction_address)?;

        if decoded.is_relative {
            let absolute = decoded.absolute_target(instruction_address)?;
            lo = lo.min(absolute);
            hi = hi.max(absolute);
            any_relative = true;
        }

        offset += decoded.length;
    }

    Ok(PrologueRange {
        lo: lo.min(target),
        hi: hi.max(target),
        any_relative,
    })
}

/// `init_chunk` (§4.7): relocates the prologue at `target` into `chunk`,
/// terminating with a back-jump to the first un-relocated byte.
///
/// Relocation normally stops once `bytes_read >= min_bytes`, but an
/// unconditional `jmp`/`ret` ends it immediately regardless of
/// `min_bytes` (per §8 scenario 2), unless that instruction is itself
/// fall-through code reachable from an earlier intra-prologue branch
/// whose destination still lies ahead of it.
///
/// `chunk` must already be writable (`EXECUTE_READWRITE`) and sit at its
/// final runtime address — every address computed here (the chunk's own
/// base, the `backjump_address`/`callback_address` field addresses) is
/// read directly off `chunk`.
pub fn init_chunk(
    chunk: &mut TrampolineChunk,
    decoder: &dyn Decoder,
    target: u64,
    callback: u64,
    min_bytes: usize,
    max_read: usize,
    flags: TrampolineFlags,
) -> Result<()> {
    chunk.is_used = true;

    #[cfg(target_arch = "x86_64")]
    {
        chunk.callback_address = callback;
        let callback_field = chunk.callback_field_address();
        let callback_jump_address = chunk.callback_jump_field_address();
        chunk.callback_jump = thunk::jmp_through_field(callback_jump_address, callback_field);
    }
    #[cfg(target_arch = "x86")]
    {
        let _ = callback;
    }

    let code_buffer_base = chunk.address_of_trampoline_code();
    let mut bytes_read = 0usize;
    let mut bytes_written = 0usize;

    // Furthest forward destination, within the prologue window, of any
    // relative branch decoded so far. An unconditional `jmp`/`ret` only
    // terminates relocation early when it is not itself reachable as
    // fall-through code from an earlier intra-prologue branch that still
    // targets a point ahead of it — mirrors the teacher's
    // `branch_address`/`is_instruction_in_branch` bookkeeping.
    let mut branch_target: Option<u64> = None;

    loop {
        if bytes_read >= max_read {
            return Err(Error::InvalidOperation("prologue exceeds readable region"));
        }

        assert!(
            bytes_written + arch::MAX_INSTRUCTION_LENGTH <= chunk.code_buffer.len(),
            "code buffer exhausted"
        );
        assert!(!chunk.translation_map.is_full(), "translation map exhausted");

        let original_address = target + bytes_read as u64;
        let remaining = max_read - bytes_read;

        // The original bytes live at `target`, which this process may or
        // may not have mapped for reading through `chunk`; the caller
        // hands us a view of them via `source` below instead.
        let source = read_source(target, bytes_read, remaining)?;
        let decoded = decoder.decode_one(&source, original_address)?;

        if decoded.is_relative
            && !decoded.is_rip_relative_memory
            && matches!(
                decoded.class,
                MnemonicClass::Jmp | MnemonicClass::Jcc | MnemonicClass::Jcxz | MnemonicClass::Loop
            )
        {
            let branch_destination = decoded.absolute_target(original_address)?;
            if branch_destination >= target && branch_destination < target + min_bytes as u64 {
                branch_target = Some(branch_target.map_or(branch_destination, |existing| existing.max(branch_destination)));
            }
        }

        let new_instruction_address = code_buffer_base + bytes_written as u64;
        let emitted: Vec<u8> = if !decoded.is_relative {
            decoded.bytes.clone()
        } else {
            emit_relocated(&decoded, original_address, new_instruction_address, chunk, flags)?
        };

        let destination = bytes_written;
        chunk.code_buffer[destination..destination + emitted.len()].copy_from_slice(&emitted);

        chunk
            .translation_map
            .push(bytes_read as u8, bytes_written as u8);

        let in_branch = branch_target.map_or(false, |target_addr| original_address < target_addr);
        let terminates_unconditionally = matches!(decoded.class, MnemonicClass::Jmp | MnemonicClass::Return);

        bytes_read += decoded.length;
        bytes_written += emitted.len();

        if terminates_unconditionally && !in_branch {
            break;
        }
        if bytes_read >= min_bytes {
            break;
        }
    }

    chunk.code_buffer_size = bytes_written;

    let backjump_instruction_address = code_buffer_base + bytes_written as u64;
    let backjump_field = chunk.backjump_field_address();
    let backjump_bytes = thunk::jmp_through_field(backjump_instruction_address, backjump_field);
    chunk.code_buffer[bytes_written..bytes_written + backjump_bytes.len()].copy_from_slice(&backjump_bytes);
    chunk.backjump_address = target + bytes_read as u64;

    for byte in chunk.code_buffer[bytes_written + backjump_bytes.len()..].iter_mut() {
        *byte = crate::chunk::TRAP_BYTE;
    }

    let original_len = bytes_read.min(chunk.original_code.len());
    let original = read_source(target, 0, original_len)?;
    chunk.original_code[..original_len].copy_from_slice(&original);
    chunk.original_code_size = bytes_read;

    Ok(())
}

/// Reads `len` bytes starting at `base + offset` directly from process
/// memory. The caller (engine) has already probed this range as readable
/// via [`crate::host::probe_readable`].
fn read_source(base: u64, offset: usize, len: usize) -> Result<Vec<u8>> {
    if len == 0 {
        return Ok(Vec::new());
    }
    let ptr = (base + offset as u64) as *const u8;
    // SAFETY: the caller has already probed `[base, base+max_read)` as
    // committed and readable before calling `init_chunk`.
    let slice = unsafe { std::slice::from_raw_parts(ptr, len) };
    Ok(slice.to_vec())
}

/// Emits the relocated form of a relative instruction at
/// `new_instruction_address`, dispatching by mnemonic class per §4.7.
fn emit_relocated(
    decoded: &Decoded,
    original_address: u64,
    new_instruction_address: u64,
    chunk: &mut TrampolineChunk,
    flags: TrampolineFlags,
) -> Result<Vec<u8>> {
    let absolute_target = decoded.absolute_target(original_address)?;

    // `call` is gated on `REWRITE_CALL` whether it is a near-relative call
    // or an indirect call through a RIP-relative memory operand — §4.7's
    // CALL bullet covers both forms, so the flag check must happen before
    // dispatching on `is_rip_relative_memory` below.
    if decoded.class == MnemonicClass::Call {
        if !flags.contains(TrampolineFlags::REWRITE_CALL) {
            return Err(Error::Failed {
                offset: 0,
                rewrite: "call",
            });
        }
        return if decoded.is_rip_relative_memory {
            emit_rip_relative(decoded, new_instruction_address, absolute_target)
        } else {
            emit_call(new_instruction_address, absolute_target, chunk)
        };
    }

    if decoded.is_rip_relative_memory {
        return emit_rip_relative(decoded, new_instruction_address, absolute_target);
    }

    match decoded.class {
        MnemonicClass::Call => unreachable!("call handled above"),
        MnemonicClass::Jcxz => {
            if !flags.contains(TrampolineFlags::REWRITE_JCXZ) {
                return Err(Error::Failed {
                    offset: 0,
                    rewrite: "jcxz",
                });
            }
            let opcode = decoded.bytes[0];
            Ok(thunk::branch_trampoline(opcode, new_instruction_address, absolute_target).to_vec())
        }
        MnemonicClass::Loop => {
            if !flags.contains(TrampolineFlags::REWRITE_LOOP) {
                return Err(Error::Failed {
                    offset: 0,
                    rewrite: "loop",
                });
            }
            let opcode = decoded.bytes[0];
            Ok(thunk::branch_trampoline(opcode, new_instruction_address, absolute_target).to_vec())
        }
        MnemonicClass::Jmp => emit_jmp(new_instruction_address, absolute_target, chunk),
        MnemonicClass::Jcc => emit_jcc(new_instruction_address, absolute_target, decoded.condition_code, chunk),
        MnemonicClass::Return | MnemonicClass::Other => {
            // A `ret`/`other` can be flagged relative only if the decoder
            // disagrees with its own classification; unreachable in
            // practice per §4.2's "any other relative form is an
            // unreachable decode error".
            Err(Error::DecodeFailed { offset: 0 })
        }
    }
}

fn emit_rip_relative(decoded: &Decoded, new_instruction_address: u64, absolute_target: u64) -> Result<Vec<u8>> {
    let instruction_len = decoded.length as u64;
    let displacement_len = 4u64;
    let trailing = decoded.trailing_immediate_len as u64;
    let next_ip = new_instruction_address + instruction_len;

    let new_displacement = absolute_target as i64 - next_ip as i64;
    if !arch::is_within_range(new_displacement) {
        return Err(Error::OutOfRange);
    }

    let mut bytes = decoded.bytes.clone();
    let displacement_offset = (instruction_len - trailing - displacement_len) as usize;
    bytes[displacement_offset..displacement_offset + 4].copy_from_slice(&(new_displacement as i32).to_le_bytes());
    Ok(bytes)
}

fn emit_call(new_instruction_address: u64, absolute_target: u64, chunk: &mut TrampolineChunk) -> Result<Vec<u8>> {
    let displacement = absolute_target as i64 - (new_instruction_address + 5) as i64;
    if arch::is_within_range(displacement) {
        return Ok(thunk::call_rel32(new_instruction_address, absolute_target).to_vec());
    }

    emit_call_absolute(absolute_target, chunk)
}

#[cfg(target_arch = "x86_64")]
fn emit_call_absolute(absolute_target: u64, _chunk: &mut TrampolineChunk) -> Result<Vec<u8>> {
    Ok(thunk::call_abs(absolute_target).to_vec())
}

#[cfg(target_arch = "x86")]
fn emit_call_absolute(_absolute_target: u64, _chunk: &mut TrampolineChunk) -> Result<Vec<u8>> {
    // On x86 a relative call always reaches; this path is unreachable.
    Err(Error::OutOfRange)
}

fn emit_jmp(new_instruction_address: u64, absolute_target: u64, chunk: &mut TrampolineChunk) -> Result<Vec<u8>> {
    let displacement = absolute_target as i64 - (new_instruction_address + 5) as i64;
    if arch::is_within_range(displacement) {
        return Ok(thunk::jmp_rel32(new_instruction_address, absolute_target).to_vec());
    }

    emit_jmp_absolute(absolute_target, chunk)
}

#[cfg(target_arch = "x86_64")]
fn emit_jmp_absolute(absolute_target: u64, _chunk: &mut TrampolineChunk) -> Result<Vec<u8>> {
    Ok(thunk::jmp_abs(absolute_target).to_vec())
}

#[cfg(target_arch = "x86")]
fn emit_jmp_absolute(_absolute_target: u64, _chunk: &mut TrampolineChunk) -> Result<Vec<u8>> {
    Err(Error::OutOfRange)
}

fn emit_jcc(
    new_instruction_address: u64,
    absolute_target: u64,
    condition: u8,
    chunk: &mut TrampolineChunk,
) -> Result<Vec<u8>> {
    let displacement = absolute_target as i64 - (new_instruction_address + 6) as i64;
    if arch::is_within_range(displacement) {
        return Ok(thunk::jcc_rel32(new_instruction_address, absolute_target, condition).to_vec());
    }

    emit_jcc_absolute(absolute_target, condition, chunk)
}

#[cfg(target_arch = "x86_64")]
fn emit_jcc_absolute(absolute_target: u64, condition: u8, _chunk: &mut TrampolineChunk) -> Result<Vec<u8>> {
    Ok(thunk::jcc_abs(absolute_target, condition).to_vec())
}

#[cfg(target_arch = "x86")]
fn emit_jcc_absolute(_absolute_target: u64, _condition: u8, _chunk: &mut TrampolineChunk) -> Result<Vec<u8>> {
    Err(Error::OutOfRange)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::IcedDecoder;

    #[test]
    fn prologue_range_with_no_relative_instructions() {
        // push rbp; mov rbp, rsp; sub rsp, 0x20
        let bytes = [0x55u8, 0x48, 0x89, 0xE5, 0x48, 0x83, 0xEC, 0x20];
        let decoder = IcedDecoder;
        let range = prologue_range(&decoder, &bytes, 0x1000, 5).unwrap();
        assert!(!range.any_relative);
        assert_eq!(range.lo, 0x1000);
        assert_eq!(range.hi, 0x1000);
    }

    #[test]
    fn prologue_range_follows_short_jmp() {
        // jmp +0x10
        let bytes = [0xEBu8, 0x10];
        let decoder = IcedDecoder;
        let range = prologue_range(&decoder, &bytes, 0x1000, 2).unwrap();
        assert!(range.any_relative);
        assert_eq!(range.hi, 0x1000 + 2 + 0x10);
    }

    // `init_chunk` reads the original bytes straight out of process memory
    // (see `read_source`), so these tests point `target` at a real, local
    // byte buffer rather than a mocked address.

    #[test]
    #[cfg(target_arch = "x86_64")]
    fn init_chunk_copies_simple_prologue_verbatim() {
        // push rbp; mov rbp, rsp; sub rsp, 0x20 — §8 scenario 1.
        let bytes = [0x55u8, 0x48, 0x89, 0xE5, 0x48, 0x83, 0xEC, 0x20];
        let target = bytes.as_ptr() as u64;
        let mut chunk = TrampolineChunk::default();

        init_chunk(&mut chunk, &IcedDecoder, target, 0xDEAD_BEEFu64, 5, bytes.len(), TrampolineFlags::default())
            .unwrap();

        assert_eq!(chunk.original_code_size, 8);
        assert_eq!(chunk.code_buffer_size, 8);
        assert_eq!(&chunk.code_buffer[..8], &bytes[..]);
        assert_eq!(chunk.backjump_address, target + 8);

        let items = chunk.translation_map.as_slice();
        assert_eq!(items.len(), 3);
        assert_eq!((items[0].offset_source, items[0].offset_destination), (0, 0));
        assert_eq!((items[1].offset_source, items[1].offset_destination), (1, 1));
        assert_eq!((items[2].offset_source, items[2].offset_destination), (4, 4));
    }

    #[test]
    #[cfg(target_arch = "x86_64")]
    fn init_chunk_terminates_early_after_unconditional_jmp() {
        // jmp +0x10, min_bytes_to_reloc = 5 — §8 scenario 2: relocation
        // must stop after the single jmp instead of continuing to read
        // past it to satisfy `min_bytes`.
        let mut bytes = vec![0xEBu8, 0x10];
        bytes.extend_from_slice(&[0xCCu8; 32]); // past-the-jump padding, never decoded
        let target = bytes.as_ptr() as u64;
        let mut chunk = TrampolineChunk::default();

        init_chunk(&mut chunk, &IcedDecoder, target, 0xDEAD_BEEFu64, 5, bytes.len(), TrampolineFlags::default())
            .unwrap();

        assert_eq!(chunk.original_code_size, 2);
        let items = chunk.translation_map.as_slice();
        assert_eq!(items.len(), 1);
        assert_eq!((items[0].offset_source, items[0].offset_destination), (0, 0));
        assert_eq!(chunk.backjump_address, target + 2);
    }

    #[test]
    #[cfg(target_arch = "x86_64")]
    fn init_chunk_terminates_early_after_ret() {
        // push rbp; ret — the `ret` ends relocation immediately even
        // though only 2 bytes have been read against a 5-byte minimum.
        let bytes = [0x55u8, 0xC3];
        let target = bytes.as_ptr() as u64;
        let mut chunk = TrampolineChunk::default();

        init_chunk(&mut chunk, &IcedDecoder, target, 0xDEAD_BEEFu64, 5, bytes.len(), TrampolineFlags::default())
            .unwrap();

        assert_eq!(chunk.original_code_size, 2);
        assert_eq!(chunk.translation_map.len(), 2);
    }

    #[test]
    #[cfg(target_arch = "x86_64")]
    fn init_chunk_rip_relative_call_respects_rewrite_call_flag() {
        // call qword ptr [rip+0x10], followed by padding long enough to
        // satisfy min_bytes without needing a second relative instruction.
        let mut bytes = vec![0xFFu8, 0x15, 0x10, 0x00, 0x00, 0x00];
        bytes.extend_from_slice(&[0x90u8; 16]);
        let target = bytes.as_ptr() as u64;
        let mut chunk = TrampolineChunk::default();

        let flags = TrampolineFlags::REWRITE_JCXZ | TrampolineFlags::REWRITE_LOOP;
        let result = init_chunk(&mut chunk, &IcedDecoder, target, 0xDEAD_BEEFu64, 5, bytes.len(), flags);

        assert!(matches!(result, Err(Error::Failed { rewrite: "call", .. })));
    }
}
