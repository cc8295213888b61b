//! Host-call implementations behind the vtable.
//!
//! These are the C-ABI functions whose addresses the translator
//! embeds in host-call trampolines. They find their calling guest
//! thread through the registry, never through pointers baked into the
//! generated code.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use std::time::Duration;

use evm2_jit::HostInterface;
use log::{error, warn};

use crate::sandbox::EXIT_FATAL;
use crate::{lock, thread};

/// The vtable handed to the translator.
pub fn interface() -> HostInterface {
    HostInterface {
        print_value: host_print_value,
        read_value: host_read_value,
        terminate: host_terminate,
        thread_create: host_thread_create,
        thread_join: host_thread_join,
        thread_sleep: host_thread_sleep,
        thread_lock: host_thread_lock,
        thread_unlock: host_thread_unlock,
        file_read: host_file_read,
        file_write: host_file_write,
    }
}

// ---------------------------------------------------------------
// Console bridge
// ---------------------------------------------------------------

pub extern "C" fn host_print_value(value: u64) {
    println!(
        "[Thread {}] Value: {value} / {value:#x}",
        thread::current_id()
    );
}

pub extern "C" fn host_read_value() -> u64 {
    let mut line = String::new();
    match std::io::stdin().read_line(&mut line) {
        Ok(_) => line.trim().parse().unwrap_or_else(|_| {
            warn!("console read: not an unsigned integer: {:?}", line.trim());
            0
        }),
        Err(err) => {
            warn!("console read failed: {err}");
            0
        }
    }
}

// ---------------------------------------------------------------
// Threads and locks
// ---------------------------------------------------------------

pub extern "C" fn host_terminate() {
    match thread::current() {
        Some(thread) => thread.halt(),
        None => {
            error!("terminate outside a guest thread");
            std::process::exit(EXIT_FATAL);
        }
    }
}

pub extern "C" fn host_thread_create(entry: u64) -> u64 {
    let Some(current) = thread::current() else {
        error!("thread_create outside a guest thread");
        std::process::exit(EXIT_FATAL);
    };
    // The child inherits a copy of all 16 caller registers.
    let regs = current.registers_snapshot();
    match thread::GuestThread::spawn(
        current.memory().clone(),
        current.image().clone(),
        entry,
        regs,
    ) {
        Ok(child) => child.id(),
        Err(err) => {
            error!("cannot spawn guest thread: {err}");
            std::process::exit(EXIT_FATAL);
        }
    }
}

pub extern "C" fn host_thread_join(tid: u64) {
    // Absent ids are a no-op: the thread may have finished and
    // unregistered already.
    if let Some(target) = thread::get(tid) {
        target.join();
    }
}

pub extern "C" fn host_thread_sleep(ms: u64) {
    if let Some(current) = thread::current() {
        if current.should_stop() {
            current.halt();
        }
    }
    std::thread::sleep(Duration::from_millis(ms));
}

pub extern "C" fn host_thread_lock(lock_id: u64) {
    lock::lock(lock_id);
}

pub extern "C" fn host_thread_unlock(lock_id: u64) {
    lock::unlock(lock_id);
}

// ---------------------------------------------------------------
// File bridge
// ---------------------------------------------------------------

struct Payload {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

static PAYLOAD: OnceLock<Payload> = OnceLock::new();

/// Fix the payload file path once at startup.
pub fn set_payload_path(path: &Path) {
    let _ = PAYLOAD.set(Payload {
        path: path.to_path_buf(),
        file: Mutex::new(None),
    });
}

/// Run `op` against the lazily opened payload file.
fn with_payload<R>(op: impl FnOnce(&File) -> std::io::Result<R>) -> Option<R> {
    let Some(payload) = PAYLOAD.get() else {
        warn!("file access without a payload file");
        return None;
    };
    let mut guard = payload.file.lock().unwrap();
    if guard.is_none() {
        match OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&payload.path)
        {
            Ok(file) => *guard = Some(file),
            Err(err) => {
                error!("cannot open payload {}: {err}", payload.path.display());
                return None;
            }
        }
    }
    match op(guard.as_ref().expect("payload file is open")) {
        Ok(result) => Some(result),
        Err(err) => {
            error!("payload I/O failed: {err}");
            None
        }
    }
}

pub extern "C" fn host_file_read(offset: u64, len: u64, guest_addr: u64) -> u64 {
    let Some(current) = thread::current() else {
        return 0;
    };
    let memory = current.memory();
    if !memory.contains(guest_addr, len) {
        warn!("file read of {len} bytes at {guest_addr:#x} leaves data memory");
        return 0;
    }
    let mut buf = vec![0u8; len as usize];
    let n = with_payload(|file| file.read_at(&mut buf, offset)).unwrap_or(0);
    // SAFETY: range checked against live data memory above.
    unsafe { memory.write_bytes(guest_addr, &buf[..n]) };
    n as u64
}

pub extern "C" fn host_file_write(offset: u64, len: u64, guest_addr: u64) {
    let Some(current) = thread::current() else {
        return;
    };
    let memory = current.memory();
    if !memory.contains(guest_addr, len) {
        warn!("file write of {len} bytes at {guest_addr:#x} leaves data memory");
        return;
    }
    let mut buf = vec![0u8; len as usize];
    // SAFETY: range checked against live data memory above.
    unsafe { memory.read_bytes(guest_addr, &mut buf) };
    let _ = with_payload(|file| file.write_all_at(&buf, offset));
}
