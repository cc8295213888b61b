//! Host interface vtable exposed to translated code.
//!
//! Fixed-layout record of the supervisor entry points. The
//! translator embeds these function pointers as immediates in the
//! host-call trampolines, so the record must outlive the translated
//! image and the signatures are part of the generated-code ABI.

#[repr(C)]
pub struct HostInterface {
    pub print_value: extern "C" fn(u64),
    pub read_value: extern "C" fn() -> u64,
    pub terminate: extern "C" fn(),
    pub thread_create: extern "C" fn(entry: u64) -> u64,
    pub thread_join: extern "C" fn(tid: u64),
    pub thread_sleep: extern "C" fn(ms: u64),
    pub thread_lock: extern "C" fn(lock_id: u64),
    pub thread_unlock: extern "C" fn(lock_id: u64),
    pub file_read: extern "C" fn(offset: u64, len: u64, guest_addr: u64) -> u64,
    pub file_write: extern "C" fn(offset: u64, len: u64, guest_addr: u64),
}
