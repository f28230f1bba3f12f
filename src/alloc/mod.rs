//! Region allocation (§4.5): finding and committing a fresh, in-range
//! granule when no existing region can host a new chunk.

use crate::arch;
use crate::error::{Error, Result};
use crate::host::HostMemory;
use crate::region::TrampolineRegion;

/// Iteratively probes candidate base addresses above and below the
/// midpoint of `[lo, hi]`, each aligned to the host allocation granule,
/// until one can be committed as `EXECUTE_READWRITE` within range of both
/// bounds.
pub fn allocate_region(host: &dyn HostMemory, lo: u64, hi: u64) -> Result<TrampolineRegion> {
    let granule = host.allocation_granularity();
    let (min_address, max_address) = host.application_address_bounds();
    // Avoid overflowing on `lo + hi` for addresses near the top of the
    // address space.
    let midpoint = lo / 2 + hi / 2;

    let mut below = align_down(midpoint, granule);
    let mut above = align_up(midpoint, granule);
    let mut below_exhausted = false;
    let mut above_exhausted = false;

    tracing::debug!(lo, hi, midpoint, granule, "allocating region within range");

    while !below_exhausted || !above_exhausted {
        if !below_exhausted {
            if below < min_address || !arch::in_proximity(below, lo, hi) {
                below_exhausted = true;
            } else {
                match try_candidate(host, below, granule)? {
                    Some(region) => return Ok(region),
                    None => {
                        let descriptor = host.query(below)?;
                        below = align_down(below.saturating_sub(granule), granule);
                        let _ = descriptor;
                    }
                }
            }
        }

        if !above_exhausted {
            if above > max_address || !arch::in_proximity(above, lo, hi) {
                above_exhausted = true;
            } else {
                match try_candidate(host, above, granule)? {
                    Some(region) => return Ok(region),
                    None => {
                        let descriptor = host.query(above)?;
                        above = align_up(above.saturating_add(descriptor.region_size.max(granule)), granule);
                    }
                }
            }
        }
    }

    tracing::warn!(lo, hi, "no region placement found within ±2 GiB of range");
    Err(Error::OutOfRange)
}

/// Queries `candidate`; if free and at least one granule, commits it and
/// initialises the region header. Returns `None` (not an error) when the
/// candidate is unsuitable, so the caller can step past it.
fn try_candidate(host: &dyn HostMemory, candidate: u64, granule: u64) -> Result<Option<TrampolineRegion>> {
    let descriptor = host.query(candidate)?;

    if !descriptor.is_free || descriptor.region_size < granule {
        return Ok(None);
    }

    let base = host.commit_and_reserve(candidate, granule)?;
    tracing::debug!(base, granule, "committed new trampoline region");
    let region = TrampolineRegion::new(base, granule);
    unsafe {
        region.init_header();
    }
    Ok(Some(region))
}

fn align_down(address: u64, granule: u64) -> u64 {
    address - (address % granule)
}

fn align_up(address: u64, granule: u64) -> u64 {
    let remainder = address % granule;
    if remainder == 0 {
        address
    } else {
        address + (granule - remainder)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_helpers_round_to_granule() {
        assert_eq!(align_down(0x12345, 0x1000), 0x12000);
        assert_eq!(align_up(0x12345, 0x1000), 0x13000);
        assert_eq!(align_up(0x12000, 0x1000), 0x12000);
    }
}
