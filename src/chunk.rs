//! Fixed-layout trampoline chunk and its translation map.
//!
//! A chunk is a slot inside a [region](crate::region) sized to hold exactly
//! one trampoline. Its address is fixed for the chunk's entire lifetime —
//! unlike the teacher's PIC thunks, nothing here is built before the chunk
//! has a concrete runtime address.

use crate::arch::{self, thunk};

/// Headroom added on top of [`arch::MAX_CODE_SIZE_WITH_BACKJUMP`] to absorb
/// growth when a short relocated instruction (e.g. a 2-byte `jmp rel8`) is
/// widened into a longer absolute-indirect thunk. Implementation-defined
/// per §9 ("chunk layout... implementation-defined so long as... the code
/// buffer can hold `MAX_CODE_SIZE_WITH_BACKJUMP + BONUS` bytes").
pub const BONUS: usize = 16;

/// Capacity of [`TrampolineChunk::code_buffer`].
pub const CODE_BUFFER_CAPACITY: usize = arch::MAX_CODE_SIZE_WITH_BACKJUMP + BONUS;

/// Headroom added to `SIZEOF_RELATIVE_JUMP` to size the translation map,
/// matching §3's `SIZEOF_RELATIVE_JUMP + REWRITE_BONUS` capacity note; sized
/// generously against `MAX_CODE_SIZE` so a prologue of single-byte
/// instructions can never overflow it.
pub const REWRITE_BONUS: usize = arch::MAX_CODE_SIZE;

/// Capacity of [`TranslationMap`].
pub const TRANSLATION_MAP_CAPACITY: usize = arch::SIZEOF_RELATIVE_JUMP + REWRITE_BONUS;

/// The trap opcode (`0xCC`, `int3`) every unused chunk byte is filled with.
pub const TRAP_BYTE: u8 = 0xCC;

/// One `(offset_source, offset_destination)` pair: the instruction at byte
/// `offset_source` of the original prologue begins at byte
/// `offset_destination` of the relocated [`TrampolineChunk::code_buffer`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TranslationItem {
    pub offset_source: u8,
    pub offset_destination: u8,
}

/// Ordered sequence of translation items, appended in instruction order.
#[derive(Debug, Clone, Copy)]
pub struct TranslationMap {
    items: [TranslationItem; TRANSLATION_MAP_CAPACITY],
    count: usize,
}

impl Default for TranslationMap {
    fn default() -> Self {
        TranslationMap {
            items: [TranslationItem::default(); TRANSLATION_MAP_CAPACITY],
            count: 0,
        }
    }
}

impl TranslationMap {
    pub fn is_full(&self) -> bool {
        self.count == TRANSLATION_MAP_CAPACITY
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn as_slice(&self) -> &[TranslationItem] {
        &self.items[..self.count]
    }

    /// Appends `(offset_source, offset_destination)`. Panics if full; the
    /// relocator asserts room before every append, so this is only ever a
    /// programming-error backstop.
    pub fn push(&mut self, offset_source: u8, offset_destination: u8) {
        assert!(!self.is_full(), "translation map capacity exceeded");
        self.items[self.count] = TranslationItem {
            offset_source,
            offset_destination,
        };
        self.count += 1;
    }

    fn clear(&mut self) {
        self.count = 0;
    }
}

/// A fixed-size slot carrying one relocated prologue.
///
/// The `backjump_address` (and, on x86-64, `callback_address`) fields are
/// literal pointer storage dereferenced by an indirect jump written into
/// `code_buffer` at encode time via [`thunk::jmp_through_field`] — the
/// jump's operand targets the field's own runtime address, not a copy
/// embedded in `code_buffer`.
#[derive(Debug)]
#[repr(C)]
pub struct TrampolineChunk {
    pub is_used: bool,

    #[cfg(target_arch = "x86_64")]
    pub callback_address: u64,
    #[cfg(target_arch = "x86_64")]
    pub callback_jump: [u8; thunk::SIZEOF_JUMP_THROUGH_FIELD],

    pub backjump_address: u64,

    pub code_buffer: [u8; CODE_BUFFER_CAPACITY],
    pub code_buffer_size: usize,

    pub translation_map: TranslationMap,

    pub original_code: [u8; arch::MAX_CODE_SIZE],
    pub original_code_size: usize,
}

impl Default for TrampolineChunk {
    fn default() -> Self {
        TrampolineChunk {
            is_used: false,
            #[cfg(target_arch = "x86_64")]
            callback_address: 0,
            #[cfg(target_arch = "x86_64")]
            callback_jump: [0u8; thunk::SIZEOF_JUMP_THROUGH_FIELD],
            backjump_address: 0,
            code_buffer: [TRAP_BYTE; CODE_BUFFER_CAPACITY],
            code_buffer_size: 0,
            translation_map: TranslationMap::default(),
            original_code: [0u8; arch::MAX_CODE_SIZE],
            original_code_size: 0,
        }
    }
}

impl TrampolineChunk {
    /// Address of `code_buffer[0]`, the entry point a caller jumps to.
    pub fn address_of_trampoline_code(&self) -> u64 {
        self.code_buffer.as_ptr() as u64
    }

    /// Runtime address of the `backjump_address` field itself — the
    /// operand of the indirect jump written at the end of `code_buffer`.
    pub fn backjump_field_address(&self) -> u64 {
        std::ptr::addr_of!(self.backjump_address) as u64
    }

    /// Runtime address of the `callback_address` field itself (x86-64
    /// only), dereferenced by `callback_jump`.
    #[cfg(target_arch = "x86_64")]
    pub fn callback_field_address(&self) -> u64 {
        std::ptr::addr_of!(self.callback_address) as u64
    }

    /// Runtime address of the `callback_jump` field itself — where the
    /// indirect jump instruction targeting `callback_address` is encoded.
    #[cfg(target_arch = "x86_64")]
    pub fn callback_jump_field_address(&self) -> u64 {
        std::ptr::addr_of!(self.callback_jump) as u64
    }

    /// Marks the chunk unused and overwrites it with trap bytes, per
    /// §4.8's `trampoline_free` and §4.9's `Free` chunk state.
    pub fn reset(&mut self) {
        self.is_used = false;
        #[cfg(target_arch = "x86_64")]
        {
            self.callback_address = 0;
            self.callback_jump = [TRAP_BYTE; thunk::SIZEOF_JUMP_THROUGH_FIELD];
        }
        self.backjump_address = 0;
        self.code_buffer = [TRAP_BYTE; CODE_BUFFER_CAPACITY];
        self.code_buffer_size = 0;
        self.translation_map.clear();
        self.original_code = [0u8; arch::MAX_CODE_SIZE];
        self.original_code_size = 0;
    }

    /// Bytes after `code_buffer_size + SIZEOF_ABSOLUTE_JUMP` (the back-jump
    /// instruction), expected to all be [`TRAP_BYTE`] — the §8 padding
    /// invariant.
    #[cfg(test)]
    pub fn trailing_padding(&self) -> &[u8] {
        let start = self.code_buffer_size + thunk::SIZEOF_JUMP_THROUGH_FIELD;
        &self.code_buffer[start..]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn translation_map_push_and_len() {
        let mut map = TranslationMap::default();
        assert!(map.is_empty());
        map.push(0, 0);
        map.push(4, 4);
        assert_eq!(map.len(), 2);
        assert_eq!(
            map.as_slice(),
            &[
                TranslationItem {
                    offset_source: 0,
                    offset_destination: 0
                },
                TranslationItem {
                    offset_source: 4,
                    offset_destination: 4
                },
            ]
        );
    }

    #[test]
    fn default_chunk_is_trap_filled_and_free() {
        let chunk = TrampolineChunk::default();
        assert!(!chunk.is_used);
        assert!(chunk.code_buffer.iter().all(|&b| b == TRAP_BYTE));
    }

    #[test]
    fn reset_clears_translation_map_and_flags() {
        let mut chunk = TrampolineChunk::default();
        chunk.is_used = true;
        chunk.translation_map.push(0, 0);
        chunk.code_buffer_size = 8;
        chunk.reset();
        assert!(!chunk.is_used);
        assert_eq!(chunk.translation_map.len(), 0);
        assert_eq!(chunk.code_buffer_size, 0);
        assert!(chunk.code_buffer.iter().all(|&b| b == TRAP_BYTE));
    }
}
