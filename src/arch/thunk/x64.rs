//! x86-64 byte encoders.

use std::mem;

/// `call [rip+2]; jmp +10; <8-byte address>` — an indirect absolute call
/// through a literal slot immediately following the instruction. Used when
/// a relocated `call` no longer reaches its target with a 32-bit relative
/// displacement.
#[repr(packed)]
struct CallAbs {
    // call [rip+2]
    opcode0: u8,
    opcode1: u8,
    disp32: u32,
    // jmp +8 (skip the embedded address)
    jmp_opcode: u8,
    jmp_disp8: u8,
    // the destination, read by the `call` above
    address: u64,
}

pub const SIZEOF_CALL_ABS: usize = mem::size_of::<CallAbs>();

pub fn call_abs(destination: u64) -> [u8; SIZEOF_CALL_ABS] {
    let code = CallAbs {
        opcode0: 0xFF,
        opcode1: 0x15,
        disp32: 2,
        jmp_opcode: 0xEB,
        jmp_disp8: 0x08,
        address: destination,
    };
    unsafe { mem::transmute(code) }
}

/// `jmp [rip+0]; <8-byte address>` — an indirect absolute jump through a
/// literal slot immediately following the instruction.
#[repr(packed)]
struct JumpAbs {
    opcode0: u8,
    opcode1: u8,
    disp32: u32,
    address: u64,
}

pub const SIZEOF_JUMP_ABS: usize = mem::size_of::<JumpAbs>();

pub fn jmp_abs(destination: u64) -> [u8; SIZEOF_JUMP_ABS] {
    let code = JumpAbs {
        opcode0: 0xFF,
        opcode1: 0x25,
        disp32: 0,
        address: destination,
    };
    unsafe { mem::transmute(code) }
}

/// `jcc +16; jmp [rip+0]; <8-byte address>` — a conditional branch
/// realised as an absolute jump for displacements a 32-bit `Jcc` cannot
/// reach.
#[repr(packed)]
struct JccAbs {
    opcode: u8,
    skip_opcode: u8,
    jmp_opcode0: u8,
    jmp_opcode1: u8,
    disp32: u32,
    address: u64,
}

pub const SIZEOF_JCC_ABS: usize = mem::size_of::<JccAbs>();

pub fn jcc_abs(destination: u64, condition: u8) -> [u8; SIZEOF_JCC_ABS] {
    let code = JccAbs {
        // Invert the condition: skip over the absolute jump if NOT taken.
        opcode: 0x71 ^ condition,
        skip_opcode: 0x0E,
        jmp_opcode0: 0xFF,
        jmp_opcode1: 0x25,
        disp32: 0,
        address: destination,
    };
    unsafe { mem::transmute(code) }
}

/// `E9 xx xx xx xx` — a near relative jump. `source` is the address of the
/// first byte of the emitted instruction.
pub fn jmp_rel32(source: u64, destination: u64) -> [u8; 5] {
    relative_branch(0xE9, source, destination)
}

/// `E8 xx xx xx xx` — a near relative call.
pub fn call_rel32(source: u64, destination: u64) -> [u8; 5] {
    relative_branch(0xE8, source, destination)
}

fn relative_branch(opcode: u8, source: u64, destination: u64) -> [u8; 5] {
    let displacement = displacement32(source, destination, 5);
    let mut bytes = [0u8; 5];
    bytes[0] = opcode;
    bytes[1..5].copy_from_slice(&displacement.to_le_bytes());
    bytes
}

/// `0F 8x xx xx xx xx` — a near conditional branch.
pub fn jcc_rel32(source: u64, destination: u64, condition: u8) -> [u8; 6] {
    let displacement = displacement32(source, destination, 6);
    let mut bytes = [0u8; 6];
    bytes[0] = 0x0F;
    bytes[1] = 0x80 | condition;
    bytes[2..6].copy_from_slice(&displacement.to_le_bytes());
    bytes
}

/// Three-instruction trampoline preserving `jcxz`/`loop`-family semantics
/// for a destination outside the relocated prologue:
/// `opcode +2; jmp +5 (EB 05); jmp rel32 destination`.
pub fn branch_trampoline(opcode: u8, source: u64, destination: u64) -> [u8; 9] {
    let mut bytes = [0u8; 9];
    bytes[0] = opcode;
    bytes[1] = 0x02;
    bytes[2] = 0xEB;
    bytes[3] = 0x05;
    let jmp = jmp_rel32(source + 4, destination);
    bytes[4..9].copy_from_slice(&jmp);
    bytes
}

/// Computes the displacement for a relative instruction of total length
/// `instruction_len` starting at `source`.
pub fn displacement32(source: u64, destination: u64, instruction_len: usize) -> i32 {
    let next_ip = source.wrapping_add(instruction_len as u64);
    let displacement = (destination as i64).wrapping_sub(next_ip as i64);
    assert!(crate::arch::is_within_range(displacement));
    displacement as i32
}

/// `FF 25 xx xx xx xx` — an indirect jump through the *named* pointer at
/// `field_address`, rather than a literal immediately following the
/// instruction. Used for the chunk's reserved `backjump_address` and
/// `callback_address` slots, whose storage outlives any single encode
/// call and is always within ±2 GiB of the chunk itself.
pub const SIZEOF_JUMP_THROUGH_FIELD: usize = 6;

pub fn jmp_through_field(source: u64, field_address: u64) -> [u8; SIZEOF_JUMP_THROUGH_FIELD] {
    let next_ip = source.wrapping_add(SIZEOF_JUMP_THROUGH_FIELD as u64);
    let disp32 = displacement32(source, field_address, SIZEOF_JUMP_THROUGH_FIELD);
    debug_assert_eq!(field_address as i64 - next_ip as i64, disp32 as i64);
    let mut bytes = [0u8; SIZEOF_JUMP_THROUGH_FIELD];
    bytes[0] = 0xFF;
    bytes[1] = 0x25;
    bytes[2..6].copy_from_slice(&disp32.to_le_bytes());
    bytes
}
