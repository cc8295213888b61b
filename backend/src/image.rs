//! Executable translated-code image backed by mmap'd memory.
//!
//! The word stream is copied into a page-aligned RW mapping, switched
//! to RX, and the instruction cache is invalidated over the region.
//! W^X discipline throughout: the image is never writable and
//! executable at the same time. On Apple silicon the mapping is
//! created with `MAP_JIT` so the RW→RX transition is permitted.

use std::io;
use std::ptr;

/// ABI of the translated entry:
/// `fn(memory_base, register_array_base, entry_instruction_index)`.
pub type EntryFn = extern "C" fn(*mut u8, *mut u64, u64);

#[cfg(target_os = "linux")]
extern "C" {
    fn __clear_cache(start: *mut libc::c_void, end: *mut libc::c_void);
}

#[cfg(target_os = "macos")]
extern "C" {
    fn sys_icache_invalidate(start: *mut libc::c_void, len: libc::size_t);
}

/// An immutable executable mapping holding translated code.
pub struct ExecImage {
    ptr: *mut u8,
    map_size: usize,
    code_words: usize,
}

// SAFETY: ExecImage owns its mapping exclusively and it is immutable
// (RX) after construction.
unsafe impl Send for ExecImage {}
unsafe impl Sync for ExecImage {}

impl ExecImage {
    /// Seal a word stream into an executable mapping.
    pub fn new(words: &[u32]) -> io::Result<Self> {
        let code_size = std::mem::size_of_val(words);
        let page_size = page_size();
        let map_size = code_size.div_ceil(page_size).max(1) * page_size;

        #[cfg(target_os = "macos")]
        let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_JIT;
        #[cfg(not(target_os = "macos"))]
        let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;

        // SAFETY: anonymous mapping, no file backing.
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                map_size,
                libc::PROT_READ | libc::PROT_WRITE,
                flags,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        let ptr = ptr as *mut u8;

        // SAFETY: the mapping is at least code_size bytes and RW.
        unsafe {
            ptr::copy_nonoverlapping(words.as_ptr() as *const u8, ptr, code_size);
        }

        // SAFETY: transitioning our own mapping to RX.
        let rc = unsafe {
            libc::mprotect(
                ptr as *mut libc::c_void,
                map_size,
                libc::PROT_READ | libc::PROT_EXEC,
            )
        };
        if rc != 0 {
            let err = io::Error::last_os_error();
            unsafe {
                libc::munmap(ptr as *mut libc::c_void, map_size);
            }
            return Err(err);
        }

        invalidate_icache(ptr, code_size);

        Ok(Self {
            ptr,
            map_size,
            code_words: words.len(),
        })
    }

    /// Number of instruction words in the image.
    pub fn len(&self) -> usize {
        self.code_words
    }

    pub fn is_empty(&self) -> bool {
        self.code_words == 0
    }

    /// Read the sealed code back as words (the mapping stays RX).
    pub fn words(&self) -> &[u32] {
        // SAFETY: ptr..ptr+code_words*4 was written in new() and the
        // mapping is readable.
        unsafe { std::slice::from_raw_parts(self.ptr as *const u32, self.code_words) }
    }

    /// Entry function pointer with the translated ABI.
    pub fn entry_fn(&self) -> EntryFn {
        // SAFETY: the mapping is executable and starts with the
        // translated prologue.
        unsafe { std::mem::transmute::<*mut u8, EntryFn>(self.ptr) }
    }

    /// Run the translated code.
    ///
    /// # Safety
    /// `memory` and `registers` must be valid for the whole run;
    /// `entry` must be an entry offset produced by the translator for
    /// this image.
    pub unsafe fn invoke(&self, memory: *mut u8, registers: *mut u64, entry: u64) {
        (self.entry_fn())(memory, registers, entry);
    }
}

impl Drop for ExecImage {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            unsafe {
                libc::munmap(self.ptr as *mut libc::c_void, self.map_size);
            }
        }
    }
}

fn page_size() -> usize {
    // SAFETY: sysconf is always safe to call.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 {
        4096
    } else {
        size as usize
    }
}

#[cfg(target_os = "linux")]
fn invalidate_icache(ptr: *mut u8, len: usize) {
    // SAFETY: the range is a valid mapping owned by the caller.
    unsafe {
        __clear_cache(
            ptr as *mut libc::c_void,
            ptr.add(len) as *mut libc::c_void,
        );
    }
}

#[cfg(target_os = "macos")]
fn invalidate_icache(ptr: *mut u8, len: usize) {
    // SAFETY: the range is a valid mapping owned by the caller.
    unsafe {
        sys_icache_invalidate(ptr as *mut libc::c_void, len);
    }
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn invalidate_icache(_ptr: *mut u8, _len: usize) {
    compile_error!("instruction cache maintenance needs porting for this host OS");
}
