//! End-to-end exercise of the public `trampoline_create`/`trampoline_free`
//! surface against the real Windows host. Only meaningful on a Windows
//! target, where the engine can actually allocate executable memory.

#![cfg(windows)]

use trampoline_engine::{trampoline_create, trampoline_create_ex, trampoline_free, TrampolineFlags};

// `push rbp; mov rbp, rsp; sub rsp, 0x20; xor eax, eax; pop rbp; ret` — a
// small, self-contained function body with no external references, so
// hooking it can't corrupt anything this test depends on.
#[cfg(target_arch = "x86_64")]
#[naked]
unsafe extern "C" fn hookable() -> i32 {
    std::arch::naked_asm!(
        "push rbp",
        "mov rbp, rsp",
        "sub rsp, 0x20",
        "xor eax, eax",
        "mov rsp, rbp",
        "pop rbp",
        "ret",
    )
}

extern "C" fn callback() -> i32 {
    7
}

#[cfg(target_arch = "x86_64")]
#[test]
fn create_and_free_round_trip() {
    let target = hookable as usize as u64;
    let cb = callback as usize as u64;

    let trampoline = trampoline_create(target, cb, 5).expect("trampoline_create should succeed");
    assert_ne!(trampoline.address_of_trampoline_code(), 0);

    trampoline_free(trampoline).expect("trampoline_free should succeed");
}

#[cfg(target_arch = "x86_64")]
#[test]
fn create_ex_rejects_disabled_rewrite_for_jcxz_prologue() {
    // `jecxz +5` as the very first instruction, with `REWRITE_JCXZ`
    // disabled: per §8 scenario 4, the call must fail and leave no
    // trampoline behind.
    #[naked]
    unsafe extern "C" fn jecxz_prologue() {
        std::arch::naked_asm!("jecxz 5", "nop", "nop", "nop", "nop", "nop", "ret",)
    }

    let target = jecxz_prologue as usize as u64;
    let cb = callback as usize as u64;

    let flags = TrampolineFlags::REWRITE_CALL | TrampolineFlags::REWRITE_LOOP;
    let result = trampoline_create_ex(target, cb, 5, flags);
    assert!(result.is_err());
}
