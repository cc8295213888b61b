//! mmap-based guest data memory.
//!
//! The full 4 GiB guest address range is reserved `PROT_NONE` and only
//! the live data region (rounded up to the page size) is upgraded to
//! read/write. Translated code performs no bounds checks: a stray
//! access lands in the unmapped remainder and is caught by the fault
//! handler.

use std::io;
use std::ptr;

/// Reserved guest address range: the full 32-bit space.
pub const GUEST_SPACE_SIZE: usize = 1 << 32;

pub struct GuestSpace {
    base: *mut u8,
    data_size: usize,
}

// SAFETY: GuestSpace owns its mapping exclusively; concurrent guest
// access is the guest program's contract (LOCK/UNLOCK), not ours.
unsafe impl Send for GuestSpace {}
unsafe impl Sync for GuestSpace {}

impl GuestSpace {
    /// Reserve the address range and map `data_size` bytes live.
    pub fn new(data_size: usize) -> io::Result<Self> {
        // SAFETY: PROT_NONE reservation, no file backing.
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                GUEST_SPACE_SIZE,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        let base = base as *mut u8;

        let live = page_align_up(data_size as u64) as usize;
        if live > 0 {
            // SAFETY: fixed mapping inside our own reservation.
            let rw = unsafe {
                libc::mmap(
                    base as *mut libc::c_void,
                    live,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_PRIVATE
                        | libc::MAP_ANONYMOUS
                        | libc::MAP_FIXED,
                    -1,
                    0,
                )
            };
            if rw == libc::MAP_FAILED {
                let err = io::Error::last_os_error();
                unsafe {
                    libc::munmap(base as *mut libc::c_void, GUEST_SPACE_SIZE);
                }
                return Err(err);
            }
        }

        Ok(Self { base, data_size })
    }

    /// Base pointer handed to translated code.
    #[inline]
    pub fn base_ptr(&self) -> *mut u8 {
        self.base
    }

    /// Live data memory size in bytes.
    #[inline]
    pub fn data_size(&self) -> usize {
        self.data_size
    }

    /// Whether `[addr, addr+len)` lies within live data memory.
    #[inline]
    pub fn contains(&self, addr: u64, len: u64) -> bool {
        addr.checked_add(len)
            .is_some_and(|end| end <= self.data_size as u64)
    }

    /// Copy the initial data image to guest offset 0.
    pub fn load_initial(&self, data: &[u8]) {
        assert!(data.len() <= self.data_size, "initial data exceeds data size");
        // SAFETY: range checked against the live RW region.
        unsafe {
            ptr::copy_nonoverlapping(data.as_ptr(), self.base, data.len());
        }
    }

    /// Copy host bytes into guest memory.
    ///
    /// # Safety
    /// `[addr, addr+data.len())` must lie within live data memory
    /// (see [`Self::contains`]).
    pub unsafe fn write_bytes(&self, addr: u64, data: &[u8]) {
        ptr::copy_nonoverlapping(
            data.as_ptr(),
            self.base.add(addr as usize),
            data.len(),
        );
    }

    /// Copy guest memory into a host buffer.
    ///
    /// # Safety
    /// `[addr, addr+buf.len())` must lie within live data memory.
    pub unsafe fn read_bytes(&self, addr: u64, buf: &mut [u8]) {
        ptr::copy_nonoverlapping(
            self.base.add(addr as usize),
            buf.as_mut_ptr(),
            buf.len(),
        );
    }
}

impl Drop for GuestSpace {
    fn drop(&mut self) {
        if !self.base.is_null() {
            unsafe {
                libc::munmap(self.base as *mut libc::c_void, GUEST_SPACE_SIZE);
            }
        }
    }
}

pub fn page_size() -> usize {
    // SAFETY: sysconf is always safe to call.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 {
        4096
    } else {
        size as usize
    }
}

pub fn page_align_up(addr: u64) -> u64 {
    let ps = page_size() as u64;
    (addr + ps - 1) & !(ps - 1)
}
