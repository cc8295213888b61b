//! Non-local exit primitive backing guest HLT.
//!
//! A guest thread installs a jump marker immediately before invoking
//! the translated entry; `terminate` (or a cooperative stop observed
//! in `thread_sleep`) jumps back to it regardless of the native call
//! depth. The jump only ever crosses translated frames and the
//! host-call C frame, neither of which has cleanup to run.

use std::cell::UnsafeCell;

/// Opaque, oversized `jmp_buf`. 512 bytes covers the glibc, musl and
/// Darwin layouts on both 64-bit architectures.
#[repr(C, align(16))]
pub struct JmpBuf([u64; 64]);

impl JmpBuf {
    pub const fn new() -> Self {
        Self([0; 64])
    }
}

impl Default for JmpBuf {
    fn default() -> Self {
        Self::new()
    }
}

extern "C" {
    /// Returns 0 when installing the marker and the `longjmp` value
    /// when re-entered. Must be called in a frame that is still live
    /// at jump time.
    pub fn setjmp(env: *mut JmpBuf) -> libc::c_int;
    pub fn longjmp(env: *mut JmpBuf, val: libc::c_int) -> !;
}

/// Per-thread halt marker.
pub struct HaltPoint {
    buf: UnsafeCell<JmpBuf>,
}

// SAFETY: the buffer is only ever touched by the owning guest thread
// (installed and jumped to on the same OS thread).
unsafe impl Send for HaltPoint {}
unsafe impl Sync for HaltPoint {}

impl HaltPoint {
    pub const fn new() -> Self {
        Self {
            buf: UnsafeCell::new(JmpBuf::new()),
        }
    }

    /// Raw buffer pointer for a direct `setjmp` call. The call site
    /// must keep its frame alive for as long as a jump can occur.
    pub fn buf(&self) -> *mut JmpBuf {
        self.buf.get()
    }

    /// Jump back to the marker.
    ///
    /// # Safety
    /// The marker must have been installed on this OS thread by a
    /// still-active frame.
    pub unsafe fn jump(&self) -> ! {
        longjmp(self.buf.get(), 1)
    }
}

impl Default for HaltPoint {
    fn default() -> Self {
        Self::new()
    }
}
