//! Region directory: an ordered collection of live region base addresses,
//! searched by proximity to a probe range (§4.4).

use crate::arch;
use crate::error::{Error, Result};
use crate::host::HostMemory;
use crate::region::TrampolineRegion;

/// Outcome of [`RegionDirectory::find_chunk`].
pub enum FindChunk<'a> {
    Found { region: &'a TrampolineRegion, chunk_index: usize },
    NotFound,
}

/// Ordered sequence of regions, sorted by base address, supporting binary
/// search. The "general-purpose dynamic vector/list container" is out of
/// scope per §1; a plain `Vec` kept sorted by insertion is this engine's
/// concrete choice (§9 allows "any ordered map... sorted vector, B-tree").
#[derive(Default)]
pub struct RegionDirectory {
    regions: Vec<TrampolineRegion>,
}

impl RegionDirectory {
    pub fn new() -> Self {
        RegionDirectory::default()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn regions(&self) -> &[TrampolineRegion] {
        &self.regions
    }

    /// Binary-searches for the region nearest the midpoint `(lo+hi)/2`;
    /// probes outward alternately (one step lower, one step higher),
    /// examining candidates until both directions are exhausted. A
    /// candidate is accepted if it has unused chunks and its base is in
    /// range of both `lo` and `hi`; within it, the first chunk whose own
    /// base also satisfies the same proximity condition is returned.
    ///
    /// # Safety
    /// Every region in the directory must currently be mapped and
    /// readable.
    pub unsafe fn find_chunk(&self, lo: u64, hi: u64) -> FindChunk<'_> {
        if self.regions.is_empty() {
            return FindChunk::NotFound;
        }

        let midpoint = lo / 2 + hi / 2;
        let anchor = self
            .regions
            .binary_search_by_key(&midpoint, |region| region.base())
            .unwrap_or_else(|insertion_point| insertion_point);

        let len = self.regions.len();
        let mut lower = anchor.min(len.saturating_sub(1)) as isize;
        let mut upper = lower + 1;
        let mut probe_lower = lower >= 0;
        let mut probe_upper = (upper as usize) < len;

        while probe_lower || probe_upper {
            if probe_lower {
                let region = &self.regions[lower as usize];
                if let Some(chunk_index) = self.consider(region, lo, hi) {
                    return FindChunk::Found { region, chunk_index };
                }
                if lower == 0 {
                    probe_lower = false;
                } else {
                    lower -= 1;
                }
            }

            if probe_upper {
                let region = &self.regions[upper as usize];
                if let Some(chunk_index) = self.consider(region, lo, hi) {
                    return FindChunk::Found { region, chunk_index };
                }
                upper += 1;
                if upper as usize >= len {
                    probe_upper = false;
                }
            }
        }

        FindChunk::NotFound
    }

    unsafe fn consider(&self, region: &TrampolineRegion, lo: u64, hi: u64) -> Option<usize> {
        if !arch::in_proximity(region.base(), lo, hi) {
            return None;
        }
        if region.header().number_of_unused_chunks == 0 {
            return None;
        }
        region.find_free_chunk_in_range(lo, hi)
    }

    /// Inserts a region, keeping the directory sorted by base address.
    pub fn insert(&mut self, region: TrampolineRegion) {
        let position = self
            .regions
            .binary_search_by_key(&region.base(), |r| r.base())
            .unwrap_or_else(|insertion_point| insertion_point);
        self.regions.insert(position, region);
    }

    /// Removes and returns the region based at `base`, if present.
    pub fn remove(&mut self, base: u64) -> Option<TrampolineRegion> {
        let position = self.regions.binary_search_by_key(&base, |r| r.base()).ok()?;
        Some(self.regions.remove(position))
    }

    /// Releases every region's host allocation and drops the directory,
    /// per §5's teardown on empty-after-free and §9's lazy-init lifecycle.
    pub fn release_all(&mut self, host: &dyn HostMemory) -> Result<()> {
        for region in self.regions.drain(..) {
            region.release(host)?;
        }
        Ok(())
    }
}

/// Verifies the directory's free-chunk bookkeeping for every live region,
/// per the §8 testable property.
pub fn verify_free_counts(directory: &RegionDirectory) -> Result<()> {
    for region in directory.regions() {
        let header = unsafe { region.header() };
        crate::region::verify_signature(header)?;

        let counted = region
            .usable_chunk_indices()
            .filter(|&index| !unsafe { region.chunk(index) }.is_used)
            .count() as u32;

        if counted != header.number_of_unused_chunks {
            return Err(Error::InvalidOperation("free-chunk count mismatch"));
        }
    }
    Ok(())
}
