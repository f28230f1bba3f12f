//! Trampoline region: a page-aligned host allocation subdivided into
//! fixed-size chunks, with a header overlaid on the first chunk slot.

use std::mem;

use crate::chunk::TrampolineChunk;
use crate::error::{Error, Result};
use crate::host::{HostMemory, Protection};

/// Magic signature stamped into every live region's header.
pub const REGION_MAGIC: u32 = 0x5A52_4558; // "ZREX"

/// Overlaid onto the storage of chunk slot 0; never itself used as a
/// chunk. A static assertion elsewhere in this module enforces
/// `size_of::<RegionHeader>() <= size_of::<TrampolineChunk>()` per §3.
#[derive(Debug)]
#[repr(C)]
pub struct RegionHeader {
    pub signature: u32,
    pub number_of_unused_chunks: u32,
}

const _: () = assert!(mem::size_of::<RegionHeader>() <= mem::size_of::<TrampolineChunk>());

/// A page-aligned, executable host allocation viewed as `chunk_count`
/// fixed-size chunks. Chunk `0` is never used as a chunk; its storage is
/// overlaid by [`RegionHeader`].
pub struct TrampolineRegion {
    base: u64,
    granule_size: u64,
    chunk_count: usize,
}

impl TrampolineRegion {
    /// Wraps an already-allocated, already-initialised granule as a
    /// region. `base` must be allocation-granule aligned and exactly
    /// `granule_size` bytes of `EXECUTE_READWRITE` memory.
    pub fn new(base: u64, granule_size: u64) -> Self {
        let chunk_count = (granule_size as usize) / mem::size_of::<TrampolineChunk>();
        TrampolineRegion {
            base,
            granule_size,
            chunk_count,
        }
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn chunk_count(&self) -> usize {
        self.chunk_count
    }

    fn chunk_ptr(&self, index: usize) -> *mut TrampolineChunk {
        debug_assert!(index < self.chunk_count);
        (self.base as *mut TrampolineChunk).wrapping_add(index)
    }

    fn header_ptr(&self) -> *mut RegionHeader {
        self.base as *mut RegionHeader
    }

    /// Writes the region header for a freshly allocated, freshly
    /// `EXECUTE_READWRITE` granule: `signature = ZREX_MAGIC`,
    /// `number_of_unused_chunks = chunk_count - 1` (chunk 0 is the header,
    /// never a usable slot).
    ///
    /// # Safety
    /// `self.base` must point at `self.granule_size` writable bytes.
    pub unsafe fn init_header(&self) {
        let header = self.header_ptr();
        (*header).signature = REGION_MAGIC;
        (*header).number_of_unused_chunks = (self.chunk_count - 1) as u32;
    }

    /// # Safety
    /// The region must currently be mapped and readable.
    pub unsafe fn header(&self) -> &RegionHeader {
        &*self.header_ptr()
    }

    /// # Safety
    /// The region must currently be `EXECUTE_READWRITE`.
    pub unsafe fn header_mut(&self) -> &mut RegionHeader {
        &mut *self.header_ptr()
    }

    /// Borrows chunk `index` (`1..chunk_count`). Panics on `index == 0`,
    /// which is permanently the header overlay.
    ///
    /// # Safety
    /// The region must currently be mapped and readable.
    pub unsafe fn chunk(&self, index: usize) -> &TrampolineChunk {
        assert!(index != 0, "chunk 0 is the region header");
        &*self.chunk_ptr(index)
    }

    /// # Safety
    /// The region must currently be `EXECUTE_READWRITE`.
    pub unsafe fn chunk_mut(&self, index: usize) -> &mut TrampolineChunk {
        assert!(index != 0, "chunk 0 is the region header");
        &mut *self.chunk_ptr(index)
    }

    /// Iterates usable chunk indices `1..chunk_count`.
    pub fn usable_chunk_indices(&self) -> std::ops::Range<usize> {
        1..self.chunk_count
    }

    /// Linearly scans for the first unused chunk whose own base address
    /// lies within range of both `lo` and `hi`, per §4.4.
    ///
    /// # Safety
    /// The region must currently be mapped and readable.
    pub unsafe fn find_free_chunk_in_range(&self, lo: u64, hi: u64) -> Option<usize> {
        for index in self.usable_chunk_indices() {
            let chunk = self.chunk(index);
            if chunk.is_used {
                continue;
            }
            let chunk_base = self.chunk_ptr(index) as u64;
            if crate::arch::in_proximity(chunk_base, lo, hi) {
                return Some(index);
            }
        }
        None
    }

    /// Flips the first chunk's protection between `EXECUTE_READ` and
    /// `EXECUTE_READWRITE`, per §4.6. The implementation extends this to
    /// the whole chunk being mutated rather than just the first, since a
    /// single `VirtualProtect` call already covers the mutation's actual
    /// footprint.
    pub fn unprotect(&self, host: &dyn HostMemory, chunk_index: usize) -> Result<Protection> {
        host.protect(
            self.chunk_ptr(chunk_index) as u64,
            mem::size_of::<TrampolineChunk>() as u64,
            Protection::ExecuteReadWrite,
        )
    }

    pub fn protect(&self, host: &dyn HostMemory, chunk_index: usize) -> Result<Protection> {
        host.protect(
            self.chunk_ptr(chunk_index) as u64,
            mem::size_of::<TrampolineChunk>() as u64,
            Protection::ExecuteRead,
        )
    }

    /// Releases the region's underlying host allocation. Callers must
    /// ensure no live trampoline addresses reference chunks in this
    /// region before calling this.
    pub fn release(&self, host: &dyn HostMemory) -> Result<()> {
        host.release(self.base)
    }
}

/// Verifies `header.signature == ZREX_MAGIC`, per the §3 region invariant.
pub fn verify_signature(header: &RegionHeader) -> Result<()> {
    if header.signature != REGION_MAGIC {
        return Err(Error::InvalidOperation("region header signature mismatch"));
    }
    Ok(())
}
