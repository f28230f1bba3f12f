//! Host virtual-memory services — out of scope per §1 ("specified solely
//! via the contracts they provide to the core"), so this module is a thin
//! trait facing a concrete Windows backend in [`windows`](self::windows).

#[cfg(windows)]
mod windows;
#[cfg(windows)]
pub use self::windows::WindowsHost;

use crate::error::Result;

/// Coarse protection flags the engine needs from the host, independent of
/// any single platform's constant encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protection {
    /// Readable but not writable or executable.
    ReadOnly,
    /// Readable and writable, not executable.
    ReadWrite,
    /// Readable and executable, not writable — a chunk's steady state.
    ExecuteRead,
    /// Readable, writable and executable — a chunk mid-mutation.
    ExecuteReadWrite,
    /// No access at all.
    NoAccess,
    /// Anything else the host reports (guard pages, copy-on-write, etc.):
    /// never readable for the memory probe's purposes.
    Other,
}

impl Protection {
    /// Whether bytes under this protection are safe for [`probe_readable`]
    /// to count, per §4.1 ("accumulating region sizes that carry any
    /// read-bearing protection flag").
    pub fn is_readable(self) -> bool {
        matches!(
            self,
            Protection::ReadOnly | Protection::ReadWrite | Protection::ExecuteRead | Protection::ExecuteReadWrite
        )
    }
}

/// One host memory descriptor, as returned by a page/region query.
#[derive(Debug, Clone, Copy)]
pub struct MemoryDescriptor {
    pub base_address: u64,
    pub region_size: u64,
    pub protection: Protection,
    pub is_committed: bool,
    pub is_free: bool,
}

/// Host virtual-memory services consumed by the engine per §6: allocation
/// granule query, executable allocation at a specific base, release,
/// protection change, and descriptor query; plus the application address
/// bounds used to clamp region search in §4.5.
pub trait HostMemory {
    /// Queries the memory descriptor covering `address`.
    fn query(&self, address: u64) -> Result<MemoryDescriptor>;

    /// The host's allocation granularity (`dwAllocationGranularity`).
    fn allocation_granularity(&self) -> u64;

    /// `[lpMinimumApplicationAddress, lpMaximumApplicationAddress]`.
    fn application_address_bounds(&self) -> (u64, u64);

    /// Reserves and commits exactly `size` bytes at `address` with
    /// `EXECUTE_READWRITE` protection. `address` must already be aligned
    /// to [`HostMemory::allocation_granularity`].
    fn commit_and_reserve(&self, address: u64, size: u64) -> Result<u64>;

    /// Releases a region previously returned by `commit_and_reserve`.
    fn release(&self, address: u64) -> Result<()>;

    /// Changes the protection of `size` bytes starting at `address`,
    /// returning the previous protection.
    fn protect(&self, address: u64, size: u64, protection: Protection) -> Result<Protection>;
}

/// `probe_readable(address, limit) → size`, per §4.1: the greatest `k ≤
/// limit` such that `[address, address+k)` is known committed and
/// readable, accumulated by repeatedly querying successive descriptors and
/// stopping at the first non-readable or uncommitted one.
pub fn probe_readable(host: &dyn HostMemory, address: u64, limit: u64) -> Result<u64> {
    let mut probed: u64 = 0;
    let mut cursor = address;

    while probed < limit {
        let descriptor = host.query(cursor)?;

        if !descriptor.is_committed || !descriptor.protection.is_readable() {
            break;
        }

        // A descriptor's region may begin before `cursor` (we landed in
        // the middle of it); only the remainder from `cursor` onward is
        // available to this probe.
        let consumed_into_descriptor = cursor.saturating_sub(descriptor.base_address);
        let available = descriptor.region_size.saturating_sub(consumed_into_descriptor);
        if available == 0 {
            break;
        }

        probed = probed.saturating_add(available);
        cursor = descriptor.base_address.saturating_add(descriptor.region_size);
    }

    Ok(probed.min(limit))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::cell::RefCell;

    struct FakeHost {
        descriptors: RefCell<Vec<MemoryDescriptor>>,
    }

    impl HostMemory for FakeHost {
        fn query(&self, address: u64) -> Result<MemoryDescriptor> {
            self.descriptors
                .borrow()
                .iter()
                .find(|d| address >= d.base_address && address < d.base_address + d.region_size)
                .copied()
                .ok_or(Error::BadSyscall("no descriptor at address".into()))
        }

        fn allocation_granularity(&self) -> u64 {
            0x10000
        }

        fn application_address_bounds(&self) -> (u64, u64) {
            (0x10000, 0x7FFF_FFFF_0000)
        }

        fn commit_and_reserve(&self, _address: u64, _size: u64) -> Result<u64> {
            unimplemented!()
        }

        fn release(&self, _address: u64) -> Result<()> {
            unimplemented!()
        }

        fn protect(&self, _address: u64, _size: u64, _protection: Protection) -> Result<Protection> {
            unimplemented!()
        }
    }

    #[test]
    fn probe_stops_at_first_unreadable_descriptor() {
        let host = FakeHost {
            descriptors: RefCell::new(vec![
                MemoryDescriptor {
                    base_address: 0x1000,
                    region_size: 0x100,
                    protection: Protection::ExecuteRead,
                    is_committed: true,
                    is_free: false,
                },
                MemoryDescriptor {
                    base_address: 0x1100,
                    region_size: 0x100,
                    protection: Protection::NoAccess,
                    is_committed: true,
                    is_free: false,
                },
            ]),
        };

        let probed = probe_readable(&host, 0x1000, 0x1000).unwrap();
        assert_eq!(probed, 0x100);
    }

    #[test]
    fn probe_clamps_to_limit() {
        let host = FakeHost {
            descriptors: RefCell::new(vec![MemoryDescriptor {
                base_address: 0x1000,
                region_size: 0x1000,
                protection: Protection::ExecuteRead,
                is_committed: true,
                is_free: false,
            }]),
        };

        let probed = probe_readable(&host, 0x1000, 0x20).unwrap();
        assert_eq!(probed, 0x20);
    }

    #[test]
    fn probe_accounts_for_midway_start() {
        let host = FakeHost {
            descriptors: RefCell::new(vec![MemoryDescriptor {
                base_address: 0x1000,
                region_size: 0x100,
                protection: Protection::ExecuteRead,
                is_committed: true,
                is_free: false,
            }]),
        };

        // Starting 0x10 bytes into the descriptor should only yield the
        // remaining 0xF0 bytes, not the full 0x100.
        let probed = probe_readable(&host, 0x1010, 0x1000).unwrap();
        assert_eq!(probed, 0xF0);
    }
}
