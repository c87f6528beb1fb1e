//! Platform layer: address-space reservation, process setup, termination.
//!
//! Every routine here runs under [`ScopedInRtl`]: the syscalls may set
//! `errno`, and the program must never observe that.

#![allow(unsafe_code)]

pub mod maps;
pub mod output;

use std::ffi::c_void;
use std::ptr;

use crate::error::PlatformError;
use crate::in_rtl::{self, ScopedInRtl};

/// Exit status used for every fatal condition.
pub const FATAL_EXIT_STATUS: i32 = 1;

pub const PAGE_SIZE: usize = 4096;

#[cfg(target_os = "linux")]
const FIXED_NOREPLACE: libc::c_int = libc::MAP_FIXED_NOREPLACE;
// Without NOREPLACE the address is only a hint; the result is compared below.
#[cfg(not(target_os = "linux"))]
const FIXED_NOREPLACE: libc::c_int = 0;

/// Terminate the process immediately with `status`. No destructors, no
/// atexit handlers.
pub fn exit_with(status: i32) -> ! {
    // SAFETY: `_exit` has no preconditions.
    unsafe { libc::_exit(status) }
}

/// Fatal termination.
pub fn die() -> ! {
    exit_with(FATAL_EXIT_STATUS)
}

/// Give up the processor. Used only as backoff inside internal spin locks.
pub fn yield_processor() {
    let _in_rtl = ScopedInRtl::new();
    // SAFETY: `sched_yield` has no preconditions.
    unsafe {
        libc::sched_yield();
    }
}

/// Round `size` up to a whole number of pages.
#[must_use]
pub const fn round_up_to_page(size: usize) -> usize {
    (size + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

fn raw_mmap(addr: usize, size: usize, prot: libc::c_int, flags: libc::c_int) -> *mut c_void {
    // SAFETY: anonymous private mapping; the kernel validates every argument.
    unsafe { libc::mmap(addr as *mut c_void, size, prot, flags, -1, 0) }
}

/// Reserve `size` bytes of read/write memory wherever the kernel likes.
pub fn reserve(size: usize) -> Result<usize, PlatformError> {
    let _in_rtl = ScopedInRtl::new();
    let size = round_up_to_page(size);
    let p = raw_mmap(
        0,
        size,
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
    );
    if p == libc::MAP_FAILED {
        return Err(PlatformError::Reserve {
            addr: 0,
            size,
            errno: in_rtl::errno(),
        });
    }
    Ok(p as usize)
}

/// Reserve `[addr, addr+size)` exactly, with protection `prot`. Refuses to
/// replace anything that is already mapped there.
fn map_fixed(addr: usize, size: usize, prot: libc::c_int) -> Result<(), PlatformError> {
    let p = raw_mmap(
        addr,
        size,
        prot,
        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE | FIXED_NOREPLACE,
    );
    if p == libc::MAP_FAILED {
        return Err(PlatformError::Reserve {
            addr,
            size,
            errno: in_rtl::errno(),
        });
    }
    if p as usize != addr {
        // Kernel ignored the placement request; give the mapping back.
        // SAFETY: `p` is the mapping just created, `size` bytes long.
        unsafe { libc::munmap(p, size) };
        return Err(PlatformError::Reserve {
            addr,
            size,
            errno: libc::EEXIST,
        });
    }
    Ok(())
}

/// Reserve read/write memory at a fixed address.
pub fn reserve_fixed(addr: usize, size: usize) -> Result<(), PlatformError> {
    let _in_rtl = ScopedInRtl::new();
    map_fixed(addr, size, libc::PROT_READ | libc::PROT_WRITE)
}

/// Render `[beg, end)` permanently inaccessible.
pub fn protect_range(beg: usize, end: usize) -> Result<(), PlatformError> {
    let _in_rtl = ScopedInRtl::new();
    if beg >= end {
        return Ok(());
    }
    map_fixed(beg, end - beg, libc::PROT_NONE).map_err(|e| match e {
        PlatformError::Reserve { errno, .. } => PlatformError::Protect { beg, end, errno },
        other => other,
    })
}

/// Reserve `size` bytes of inaccessible address space at a kernel-chosen base.
pub fn reserve_inaccessible(size: usize) -> Result<usize, PlatformError> {
    let _in_rtl = ScopedInRtl::new();
    let size = round_up_to_page(size);
    let p = raw_mmap(
        0,
        size,
        libc::PROT_NONE,
        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
    );
    if p == libc::MAP_FAILED {
        return Err(PlatformError::Reserve {
            addr: 0,
            size,
            errno: in_rtl::errno(),
        });
    }
    Ok(p as usize)
}

/// Make `[beg, end)` of an existing reservation readable and writable.
pub fn make_accessible(beg: usize, end: usize) -> Result<(), PlatformError> {
    let _in_rtl = ScopedInRtl::new();
    // SAFETY: the caller owns the reservation covering `[beg, end)`.
    let rc = unsafe {
        libc::mprotect(
            beg as *mut c_void,
            end - beg,
            libc::PROT_READ | libc::PROT_WRITE,
        )
    };
    if rc != 0 {
        return Err(PlatformError::Protect {
            beg,
            end,
            errno: in_rtl::errno(),
        });
    }
    Ok(())
}

/// Return a reservation to the system.
pub fn release(addr: usize, size: usize) -> Result<(), PlatformError> {
    let _in_rtl = ScopedInRtl::new();
    // SAFETY: the caller owns `[addr, addr+size)` and holds no references
    // into it.
    let rc = unsafe { libc::munmap(addr as *mut c_void, size) };
    if rc != 0 {
        return Err(PlatformError::Release {
            addr,
            size,
            errno: in_rtl::errno(),
        });
    }
    Ok(())
}

/// Disable core dumps: a dump of a multi-terabyte reservation never finishes.
pub fn disable_core_dumps() {
    let _in_rtl = ScopedInRtl::new();
    let lim = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: `lim` is a valid rlimit; failure leaves the old limit, which is
    // harmless.
    unsafe {
        libc::setrlimit(libc::RLIMIT_CORE, ptr::addr_of!(lim));
    }
}

/// Process-level setup that must precede the fixed shadow reservation: core
/// dumps off, nothing already living in the ranges about to be reserved, and
/// the program image and heap inside the application window `app`.
pub fn initialize_platform(reserved: &[(usize, usize)], app: (usize, usize)) -> Result<(), PlatformError> {
    let _in_rtl = ScopedInRtl::new();
    disable_core_dumps();
    maps::check_layout(reserved, app)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_and_release_roundtrip() {
        let size = 16 * PAGE_SIZE;
        let addr = reserve(size).expect("reserve");
        assert_eq!(addr % PAGE_SIZE, 0);
        // Fresh anonymous memory reads as zero.
        let first = unsafe { *(addr as *const u64) };
        assert_eq!(first, 0);
        release(addr, size).expect("release");
    }

    #[test]
    fn fixed_reservation_refuses_occupied_range() {
        let size = 4 * PAGE_SIZE;
        let addr = reserve(size).expect("reserve");
        assert!(reserve_fixed(addr, size).is_err());
        release(addr, size).expect("release");
    }

    #[test]
    fn inaccessible_then_accessible() {
        let size = 8 * PAGE_SIZE;
        let base = reserve_inaccessible(size).expect("reserve");
        make_accessible(base + PAGE_SIZE, base + 2 * PAGE_SIZE).expect("mprotect");
        unsafe { *((base + PAGE_SIZE) as *mut u64) = 7 };
        assert_eq!(unsafe { *((base + PAGE_SIZE) as *const u64) }, 7);
        release(base, size).expect("release");
    }

    #[test]
    fn failed_platform_call_does_not_leak_errno() {
        in_rtl::set_errno(0);
        assert!(release(1, PAGE_SIZE).is_err());
        assert_eq!(in_rtl::errno(), 0);
    }

    #[test]
    fn page_rounding() {
        assert_eq!(round_up_to_page(1), PAGE_SIZE);
        assert_eq!(round_up_to_page(PAGE_SIZE), PAGE_SIZE);
        assert_eq!(round_up_to_page(PAGE_SIZE + 1), 2 * PAGE_SIZE);
    }
}
