//! Concrete [`HostMemory`](super::HostMemory) backed by the `windows`
//! crate, grounded in the same `Win32::System::Memory` bindings used
//! elsewhere in the corpus for near-target executable allocation.

use windows::Win32::Foundation::GetLastError;
use windows::Win32::System::Memory::{
    VirtualAlloc, VirtualFree, VirtualProtect, VirtualQuery, MEMORY_BASIC_INFORMATION, MEM_COMMIT, MEM_FREE,
    MEM_RELEASE, MEM_RESERVE, PAGE_EXECUTE_READ, PAGE_EXECUTE_READWRITE, PAGE_NOACCESS, PAGE_PROTECTION_FLAGS,
    PAGE_READONLY, PAGE_READWRITE,
};
use windows::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};

use super::{HostMemory, MemoryDescriptor, Protection};
use crate::error::{Error, Result};

/// Host virtual-memory services via raw Win32 calls.
#[derive(Debug, Default, Clone, Copy)]
pub struct WindowsHost;

impl HostMemory for WindowsHost {
    fn query(&self, address: u64) -> Result<MemoryDescriptor> {
        let mut info = MEMORY_BASIC_INFORMATION::default();
        let written = unsafe {
            VirtualQuery(
                Some(address as *const core::ffi::c_void),
                &mut info,
                std::mem::size_of::<MEMORY_BASIC_INFORMATION>(),
            )
        };

        if written == 0 {
            return Err(bad_syscall("VirtualQuery"));
        }

        let is_free = info.State == MEM_FREE;
        Ok(MemoryDescriptor {
            base_address: info.BaseAddress as u64,
            region_size: info.RegionSize as u64,
            protection: protection_from_win32(info.Protect),
            is_committed: info.State == MEM_COMMIT,
            is_free,
        })
    }

    fn allocation_granularity(&self) -> u64 {
        let mut info = SYSTEM_INFO::default();
        unsafe { GetSystemInfo(&mut info) };
        info.dwAllocationGranularity as u64
    }

    fn application_address_bounds(&self) -> (u64, u64) {
        let mut info = SYSTEM_INFO::default();
        unsafe { GetSystemInfo(&mut info) };
        (
            info.lpMinimumApplicationAddress as u64,
            info.lpMaximumApplicationAddress as u64,
        )
    }

    fn commit_and_reserve(&self, address: u64, size: u64) -> Result<u64> {
        let result = unsafe {
            VirtualAlloc(
                Some(address as *const core::ffi::c_void),
                size as usize,
                MEM_COMMIT | MEM_RESERVE,
                PAGE_EXECUTE_READWRITE,
            )
        };

        if result.is_null() {
            return Err(bad_syscall("VirtualAlloc"));
        }

        Ok(result as u64)
    }

    fn release(&self, address: u64) -> Result<()> {
        let ok = unsafe { VirtualFree(address as *mut core::ffi::c_void, 0, MEM_RELEASE) };
        if ok.is_err() {
            return Err(bad_syscall("VirtualFree"));
        }
        Ok(())
    }

    fn protect(&self, address: u64, size: u64, protection: Protection) -> Result<Protection> {
        let mut previous = PAGE_PROTECTION_FLAGS(0);
        let ok = unsafe {
            VirtualProtect(
                address as *const core::ffi::c_void,
                size as usize,
                protection_to_win32(protection),
                &mut previous,
            )
        };

        if ok.is_err() {
            return Err(bad_syscall("VirtualProtect"));
        }

        Ok(protection_from_win32(previous))
    }
}

fn bad_syscall(call: &'static str) -> Error {
    let code = unsafe { GetLastError() };
    tracing::error!(call, error_code = code.0, "host memory operation failed");
    Error::BadSyscall(format!("{call} failed with GetLastError={}", code.0))
}

fn protection_from_win32(flags: PAGE_PROTECTION_FLAGS) -> Protection {
    match flags {
        PAGE_NOACCESS => Protection::NoAccess,
        PAGE_READONLY => Protection::ReadOnly,
        PAGE_READWRITE => Protection::ReadWrite,
        PAGE_EXECUTE_READ => Protection::ExecuteRead,
        PAGE_EXECUTE_READWRITE => Protection::ExecuteReadWrite,
        _ => Protection::Other,
    }
}

fn protection_to_win32(protection: Protection) -> PAGE_PROTECTION_FLAGS {
    match protection {
        Protection::NoAccess => PAGE_NOACCESS,
        Protection::ReadOnly => PAGE_READONLY,
        Protection::ReadWrite => PAGE_READWRITE,
        Protection::ExecuteRead => PAGE_EXECUTE_READ,
        Protection::ExecuteReadWrite => PAGE_EXECUTE_READWRITE,
        Protection::Other => PAGE_NOACCESS,
    }
}
