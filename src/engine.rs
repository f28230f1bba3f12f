//! Public operations (§4.8) and the process-wide engine state (§5).

use parking_lot::Mutex;

use crate::arch;
use crate::chunk::TrampolineChunk;
use crate::decoder::{Decoder, IcedDecoder};
use crate::directory::{FindChunk, RegionDirectory};
use crate::error::{Error, Result};
use crate::flags::TrampolineFlags;
use crate::host::{probe_readable, HostMemory};
use crate::region::TrampolineRegion;
use crate::relocator;

/// A handle to a live trampoline, returned by [`trampoline_create`] and
/// [`trampoline_create_ex`]. Carries, at minimum, the address a caller may
/// jump to; exposes the region/chunk coordinates `trampoline_free` needs.
pub struct Trampoline {
    region_base: u64,
    chunk_index: usize,
    address_of_trampoline_code: u64,
}

impl Trampoline {
    /// The address a caller may jump to; executing it runs the relocated
    /// prologue and returns control to the original function's first
    /// un-relocated byte.
    pub fn address_of_trampoline_code(&self) -> u64 {
        self.address_of_trampoline_code
    }
}

/// Process-wide state: the region directory plus the layout parameters
/// every region in it shares, per §5.
struct TrampolineData {
    #[allow(dead_code)] // kept for parity with §5's state description; region sizing is derived from it at init time
    region_size: u64,
    chunks_per_region: usize,
    directory: RegionDirectory,
}

/// `trampoline_data`'s lazy-init/teardown lifecycle (§5, §9): `None` until
/// the first successful `create`; torn down again once a `free` empties
/// the directory.
static ENGINE: Mutex<Option<TrampolineData>> = Mutex::new(None);

#[cfg(windows)]
fn default_host() -> &'static dyn HostMemory {
    use crate::host::WindowsHost;
    static HOST: WindowsHost = WindowsHost;
    &HOST
}

/// `trampoline_create(target, callback, min_bytes_to_reloc)`: default
/// flags enable all rewrite classes.
#[cfg(windows)]
pub fn trampoline_create(target: u64, callback: u64, min_bytes_to_reloc: usize) -> Result<Trampoline> {
    trampoline_create_ex(target, callback, min_bytes_to_reloc, TrampolineFlags::default())
}

/// `trampoline_create_ex(target, callback, min_bytes_to_reloc, flags)`.
#[cfg(windows)]
pub fn trampoline_create_ex(
    target: u64,
    callback: u64,
    min_bytes_to_reloc: usize,
    flags: TrampolineFlags,
) -> Result<Trampoline> {
    create_ex_with(default_host(), &IcedDecoder, target, callback, min_bytes_to_reloc, flags)
}

/// `trampoline_free(trampoline)`.
#[cfg(windows)]
pub fn trampoline_free(trampoline: Trampoline) -> Result<()> {
    free_with(default_host(), trampoline)
}

/// Host- and decoder-parameterised core of `trampoline_create_ex`, kept
/// separate so it can run under test against a fake host.
pub fn create_ex_with(
    host: &dyn HostMemory,
    decoder: &dyn Decoder,
    target: u64,
    callback: u64,
    min_bytes_to_reloc: usize,
    flags: TrampolineFlags,
) -> Result<Trampoline> {
    if target == 0 || callback == 0 {
        return Err(Error::InvalidArgument("target and callback must be non-null"));
    }
    if min_bytes_to_reloc == 0 {
        return Err(Error::InvalidArgument("min_bytes_to_reloc must be >= 1"));
    }

    let readable = probe_readable(host, target, arch::MAX_CODE_SIZE as u64)?;
    if (readable as usize) < min_bytes_to_reloc {
        return Err(Error::InvalidOperation("readable region shorter than min_bytes_to_reloc"));
    }

    let prologue = unsafe { std::slice::from_raw_parts(target as *const u8, readable as usize) };
    let range = if arch::NEEDS_PROXIMITY_CHECK {
        relocator::prologue_range(decoder, prologue, target, min_bytes_to_reloc)?
    } else {
        relocator::PrologueRange {
            lo: target,
            hi: target,
            any_relative: false,
        }
    };

    let mut engine = ENGINE.lock();
    let data = engine.get_or_insert_with(|| TrampolineData {
        region_size: host.allocation_granularity(),
        chunks_per_region: (host.allocation_granularity() as usize) / std::mem::size_of::<TrampolineChunk>(),
        directory: RegionDirectory::new(),
    });

    let (region_base, chunk_index, freshly_allocated) =
        match unsafe { data.directory.find_chunk(range.lo, range.hi) } {
            FindChunk::Found { region, chunk_index } => (region.base(), chunk_index, false),
            FindChunk::NotFound => {
                let region = crate::alloc::allocate_region(host, range.lo, range.hi)?;
                let base = region.base();
                data.directory.insert(region);
                // The freshly allocated region is already RW from
                // `commit_and_reserve`; its first usable chunk is index 1.
                (base, 1, true)
            }
        };

    let result = (|| -> Result<u64> {
        let region = data
            .directory
            .regions()
            .iter()
            .find(|r| r.base() == region_base)
            .expect("region just inserted or located must be present");

        if !freshly_allocated {
            region.unprotect(host, chunk_index)?;
        }

        let init_result = {
            let chunk = unsafe { region.chunk_mut(chunk_index) };
            relocator::init_chunk(chunk, decoder, target, callback, min_bytes_to_reloc, readable as usize, flags)
        };

        if let Err(err) = init_result {
            if !freshly_allocated {
                let _ = region.protect(host, chunk_index);
            }
            return Err(err);
        }

        // Whether freshly committed (already EXECUTE_READWRITE) or an
        // existing chunk just unprotected above, return to the steady
        // EXECUTE_READ state now that the chunk is initialised.
        region.protect(host, chunk_index)?;

        let header = unsafe { region.header_mut() };
        header.number_of_unused_chunks -= 1;

        let chunk = unsafe { region.chunk(chunk_index) };
        Ok(chunk.address_of_trampoline_code())
    })();

    match result {
        Ok(address_of_trampoline_code) => {
            tracing::debug!(target, callback, address_of_trampoline_code, "trampoline created");
            Ok(Trampoline {
                region_base,
                chunk_index,
                address_of_trampoline_code,
            })
        }
        Err(err) => {
            tracing::warn!(target, ?err, "trampoline_create_ex failed, rolling back");
            if freshly_allocated {
                if let Some(region) = data.directory.remove(region_base) {
                    let _ = region.release(host);
                }
            }
            Err(err)
        }
    }
}

/// Host-parameterised core of `trampoline_free`.
pub fn free_with(host: &dyn HostMemory, trampoline: Trampoline) -> Result<()> {
    let mut engine = ENGINE.lock();
    let data = engine
        .as_mut()
        .ok_or(Error::InvalidOperation("engine not initialized"))?;

    let region_base = trampoline.region_base;
    let chunk_index = trampoline.chunk_index;

    let should_release = {
        let region = data
            .directory
            .regions()
            .iter()
            .find(|r| r.base() == region_base)
            .ok_or(Error::InvalidOperation("trampoline's region no longer tracked"))?;

        region.unprotect(host, chunk_index)?;
        unsafe { region.chunk_mut(chunk_index) }.reset();
        region.protect(host, chunk_index)?;

        let header = unsafe { region.header_mut() };
        header.number_of_unused_chunks += 1;
        header.number_of_unused_chunks as usize == data.chunks_per_region - 1
    };

    if should_release {
        if let Some(region) = data.directory.remove(region_base) {
            region.release(host)?;
        }
    }

    if data.directory.is_empty() {
        tracing::debug!("last region freed, tearing down engine state");
        *engine = None;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{MemoryDescriptor, Protection};
    use std::cell::RefCell;
    use std::collections::HashMap;

    /// A host backed by heap-allocated, page-sized buffers, used to drive
    /// the engine end-to-end without any real OS memory mapping.
    struct FakeHost {
        granule: u64,
        allocations: RefCell<HashMap<u64, Vec<u8>>>,
        next_base: RefCell<u64>,
    }

    impl FakeHost {
        fn new(granule: u64) -> Self {
            FakeHost {
                granule,
                allocations: RefCell::new(HashMap::new()),
                next_base: RefCell::new(0x1_0000_0000),
            }
        }
    }

    impl HostMemory for FakeHost {
        fn query(&self, address: u64) -> Result<MemoryDescriptor> {
            for (&base, buffer) in self.allocations.borrow().iter() {
                if address >= base && address < base + buffer.len() as u64 {
                    return Ok(MemoryDescriptor {
                        base_address: base,
                        region_size: buffer.len() as u64,
                        protection: Protection::ExecuteReadWrite,
                        is_committed: true,
                        is_free: false,
                    });
                }
            }
            Ok(MemoryDescriptor {
                base_address: address,
                region_size: self.granule,
                protection: Protection::NoAccess,
                is_committed: false,
                is_free: true,
            })
        }

        fn allocation_granularity(&self) -> u64 {
            self.granule
        }

        fn application_address_bounds(&self) -> (u64, u64) {
            (0x1000, 0x0000_7FFF_FFFF_0000)
        }

        fn commit_and_reserve(&self, address: u64, size: u64) -> Result<u64> {
            let base = if address == 0 {
                let mut next = self.next_base.borrow_mut();
                let chosen = *next;
                *next += size;
                chosen
            } else {
                address
            };
            self.allocations.borrow_mut().insert(base, vec![0u8; size as usize]);
            Ok(base)
        }

        fn release(&self, address: u64) -> Result<()> {
            self.allocations.borrow_mut().remove(&address);
            Ok(())
        }

        fn protect(&self, _address: u64, _size: u64, _protection: Protection) -> Result<Protection> {
            Ok(Protection::ExecuteReadWrite)
        }
    }

    // These tests exercise `create_ex_with`/`free_with` against a fake
    // host, independent of the process-wide `ENGINE` static so they can
    // run concurrently with anything else touching it.
    //
    // Exercising `create_ex_with` end-to-end requires a `target` that is
    // itself readable process memory (the relocator reads prologue bytes
    // directly via raw pointer), so these use a local function's address
    // as the hook target.
    #[allow(unused)]
    extern "C" fn sample_target() -> i32 {
        42
    }

    #[test]
    fn create_rejects_null_target() {
        let host = FakeHost::new(0x1000);
        let result = create_ex_with(&host, &IcedDecoder, 0, 1, 5, TrampolineFlags::default());
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn create_rejects_zero_min_bytes() {
        let host = FakeHost::new(0x1000);
        let target = sample_target as usize as u64;
        let result = create_ex_with(&host, &IcedDecoder, target, 1, 0, TrampolineFlags::default());
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }
}
