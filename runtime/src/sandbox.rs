//! Fault containment: memory-fault signal handling and fork
//! isolation.
//!
//! The translator emits no bounds checks; a stray guest access hits
//! the `PROT_NONE` remainder of the reserved space and raises
//! SIGSEGV/SIGBUS. The process-wide handler writes a diagnostic with
//! async-signal-safe primitives and exits with a distinguished
//! status. The CLI runs the whole VM in a forked child so a runaway
//! program cannot take the invoking process down with it.

use std::io;
use std::sync::Once;

/// Natural guest exit.
pub const EXIT_OK: i32 = 0;
/// Hard watchdog timeout abort.
pub const EXIT_TIMEOUT: i32 = 1;
/// Load or translation failure, or an internal invariant violation.
pub const EXIT_FATAL: i32 = 2;
/// Memory sandbox violation.
pub const EXIT_FAULT: i32 = 3;

static FAULT_MSG: &[u8] = b"Caught SIGSEGV/SIGBUS exception\n";

type SigActionFn =
    extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void);

/// Install the process-wide SIGSEGV/SIGBUS handler (idempotent).
///
/// `SA_ONSTACK` so faults taken on an exhausted guest stack are still
/// reported; every guest thread registers an alternate signal stack
/// through [`install_thread_altstack`] before entering translated
/// code.
pub fn install_fault_handler() {
    static INSTALLED: Once = Once::new();
    INSTALLED.call_once(|| {
        // SAFETY: installing a handler with a zeroed sigaction and a
        // valid function pointer.
        unsafe {
            let mut sa: libc::sigaction = std::mem::zeroed();
            sa.sa_sigaction = handle_fault as SigActionFn as usize;
            sa.sa_flags = libc::SA_SIGINFO | libc::SA_ONSTACK;
            libc::sigemptyset(&mut sa.sa_mask);
            for sig in [libc::SIGSEGV, libc::SIGBUS] {
                if libc::sigaction(sig, &sa, std::ptr::null_mut()) != 0 {
                    log::error!(
                        "sigaction({sig}) failed: {}",
                        io::Error::last_os_error()
                    );
                }
            }
        }
    });
}

/// Give the calling thread an alternate signal stack, so the fault
/// handler can run even when the fault is a guest stack overflow.
///
/// The stack is leaked: it must stay valid for the thread's whole
/// lifetime, and guest threads live until process exit.
pub fn install_thread_altstack() {
    let size = libc::SIGSTKSZ;
    let stack = Box::leak(vec![0u8; size].into_boxed_slice());
    let ss = libc::stack_t {
        ss_sp: stack.as_mut_ptr() as *mut libc::c_void,
        ss_flags: 0,
        ss_size: size,
    };
    // SAFETY: the leaked buffer outlives the thread; sigaltstack only
    // affects the calling thread.
    if unsafe { libc::sigaltstack(&ss, std::ptr::null_mut()) } != 0 {
        log::warn!("sigaltstack failed: {}", io::Error::last_os_error());
    }
}

extern "C" fn handle_fault(
    _sig: libc::c_int,
    _info: *mut libc::siginfo_t,
    _ctx: *mut libc::c_void,
) {
    // Async-signal-safe only: raw write, immediate exit.
    unsafe {
        libc::write(
            libc::STDERR_FILENO,
            FAULT_MSG.as_ptr() as *const libc::c_void,
            FAULT_MSG.len(),
        );
        libc::_exit(EXIT_FAULT);
    }
}

/// Run `body` in a forked child and return its exit code.
///
/// Must be called before any threads exist. If the fork itself fails
/// the body runs in-process as a fallback.
pub fn run_isolated<F: FnOnce() -> i32>(body: F) -> i32 {
    // SAFETY: single-threaded at this point; the child only runs the
    // body and exits.
    match unsafe { libc::fork() } {
        -1 => {
            log::error!("fork failed: {}", io::Error::last_os_error());
            body()
        }
        0 => {
            let code = body();
            std::process::exit(code);
        }
        pid => wait_for_child(pid),
    }
}

fn wait_for_child(pid: libc::pid_t) -> i32 {
    let mut status = 0;
    loop {
        // SAFETY: waiting on our own child.
        let rc = unsafe { libc::waitpid(pid, &mut status, 0) };
        if rc == pid {
            break;
        }
        if rc == -1
            && io::Error::last_os_error().raw_os_error() != Some(libc::EINTR)
        {
            log::error!("waitpid failed: {}", io::Error::last_os_error());
            return EXIT_FATAL;
        }
    }
    if libc::WIFEXITED(status) {
        libc::WEXITSTATUS(status)
    } else if libc::WIFSIGNALED(status) {
        128 + libc::WTERMSIG(status)
    } else {
        EXIT_FATAL
    }
}
