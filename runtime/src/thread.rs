//! Guest thread records, registry and watchdogs.
//!
//! Every guest thread is an OS thread with a reduced stack. Thread
//! records are shared through a process-wide registry keyed by a
//! monotonically increasing 64-bit id; the id of the thread currently
//! executing guest code is per-OS-thread state. A record stays
//! registered from creation until its OS thread has finished running
//! guest code, so host calls can always find their caller.
//!
//! Timeouts are two-stage per thread: the soft timeout raises the
//! cooperative stop flag (observed by the guest at SLEEP); the hard
//! timeout aborts the whole process.

use std::cell::{Cell, UnsafeCell};
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Condvar, Mutex, OnceLock};
use std::time::Duration;

use evm2_backend::ExecImage;
use log::{debug, warn};

use crate::guest_space::GuestSpace;
use crate::halt::{setjmp, HaltPoint};
use crate::sandbox::EXIT_TIMEOUT;

/// Cooperative stop deadline.
pub const SOFT_TIMEOUT: Duration = Duration::from_millis(3000);
/// Process abort deadline (measured from thread start).
pub const HARD_TIMEOUT: Duration = Duration::from_millis(5000);
/// Requested guest stack size; the OS rounds up to its minimum.
pub const GUEST_STACK_SIZE: usize = 8 * 1024;

/// Number of architectural guest registers.
const NUM_REGS: usize = evm2_core::isa::NUM_REGS;

thread_local! {
    static CURRENT_ID: Cell<u64> = const { Cell::new(0) };
}

static REGISTRY: OnceLock<Mutex<HashMap<u64, Arc<GuestThread>>>> = OnceLock::new();
static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn registry() -> &'static Mutex<HashMap<u64, Arc<GuestThread>>> {
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Id of the guest thread running on this OS thread (0 outside one).
pub fn current_id() -> u64 {
    CURRENT_ID.with(|c| c.get())
}

/// Record of the guest thread running on this OS thread.
pub fn current() -> Option<Arc<GuestThread>> {
    get(current_id())
}

/// Look up a registered thread by id.
pub fn get(id: u64) -> Option<Arc<GuestThread>> {
    registry().lock().unwrap().get(&id).cloned()
}

fn register(thread: &Arc<GuestThread>) {
    debug!("register thread {}", thread.id);
    registry().lock().unwrap().insert(thread.id, thread.clone());
}

fn unregister(id: u64) {
    debug!("unregister thread {}", id);
    registry().lock().unwrap().remove(&id);
}

enum RunStatus {
    Completed,
    Halted,
}

/// One guest thread: registers, shared memory and image, halt marker,
/// stop flag, completion state and the OS join handle.
pub struct GuestThread {
    id: u64,
    regs: UnsafeCell<[u64; NUM_REGS]>,
    memory: Arc<GuestSpace>,
    image: Arc<ExecImage>,
    entry: u64,
    should_stop: AtomicBool,
    halt_point: HaltPoint,
    done: Mutex<bool>,
    done_cv: Condvar,
    handle: Mutex<Option<std::thread::JoinHandle<()>>>,
}

// SAFETY: `regs` and the halt marker are only touched by the owning
// OS thread (register cloning happens on the creating thread, which
// is the owner of the record being cloned, not of this one).
unsafe impl Send for GuestThread {}
unsafe impl Sync for GuestThread {}

impl GuestThread {
    /// Create, register and start a guest thread plus its watchdog.
    pub fn spawn(
        memory: Arc<GuestSpace>,
        image: Arc<ExecImage>,
        entry: u64,
        regs: [u64; NUM_REGS],
    ) -> io::Result<Arc<Self>> {
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        let thread = Arc::new(GuestThread {
            id,
            regs: UnsafeCell::new(regs),
            memory,
            image,
            entry,
            should_stop: AtomicBool::new(false),
            halt_point: HaltPoint::new(),
            done: Mutex::new(false),
            done_cv: Condvar::new(),
            handle: Mutex::new(None),
        });
        register(&thread);

        // The runner must not start before its record is complete, so
        // hand it the Arc through a channel after the handle is
        // stored.
        let (tx, rx) = mpsc::sync_channel::<Arc<GuestThread>>(1);
        let runner = std::thread::Builder::new()
            .name(format!("guest-{id}"))
            .stack_size(GUEST_STACK_SIZE)
            .spawn(move || {
                let thread = rx.recv().expect("guest thread handshake");
                CURRENT_ID.with(|c| c.set(thread.id));
                // A fault on the exhausted guest stack must still
                // reach the handler.
                crate::sandbox::install_thread_altstack();
                thread.run();
            });
        let handle = match runner {
            Ok(handle) => handle,
            Err(err) => {
                unregister(id);
                return Err(err);
            }
        };
        *thread.handle.lock().unwrap() = Some(handle);
        tx.send(thread.clone()).expect("guest thread handshake");

        spawn_watchdog(thread.clone());
        Ok(thread)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn memory(&self) -> &Arc<GuestSpace> {
        &self.memory
    }

    pub fn image(&self) -> &Arc<ExecImage> {
        &self.image
    }

    /// Copy of the register array. Meaningful only on the owning OS
    /// thread (used by CREATETHREAD to seed the child).
    pub fn registers_snapshot(&self) -> [u64; NUM_REGS] {
        // SAFETY: only the owning thread mutates the array, and this
        // is called by the owner.
        unsafe { *self.regs.get() }
    }

    pub fn should_stop(&self) -> bool {
        self.should_stop.load(Ordering::Relaxed)
    }

    pub fn request_stop(&self) {
        self.should_stop.store(true, Ordering::Relaxed);
    }

    /// Non-local return to the marker installed around the translated
    /// entry. Must run on the owning OS thread while guest code is on
    /// the stack.
    pub fn halt(&self) -> ! {
        // SAFETY: host calls only execute between marker installation
        // and return, on the owning thread.
        unsafe { self.halt_point.jump() }
    }

    /// Wait for the OS thread to finish. Unknown or already-joined
    /// threads are a no-op.
    pub fn join(&self) {
        let handle = self.handle.lock().unwrap().take();
        if let Some(handle) = handle {
            println!("[Thread {}] Joining...", self.id);
            let _ = handle.join();
            println!("[Thread {}] Join done...", self.id);
        }
    }

    fn run(self: &Arc<Self>) {
        println!("[Thread {}] Start...", self.id);
        let status = unsafe { self.invoke() };
        match status {
            RunStatus::Completed => {
                println!("[Thread {}] Completed normally", self.id)
            }
            RunStatus::Halted => {
                println!("[Thread {}] Halted via terminate", self.id)
            }
        }
        self.finish();
        unregister(self.id);
    }

    /// Install the halt marker and enter translated code. This frame
    /// stays alive for the whole guest run; `terminate` jumps back
    /// into it.
    #[inline(never)]
    unsafe fn invoke(&self) -> RunStatus {
        if setjmp(self.halt_point.buf()) == 0 {
            self.image.invoke(
                self.memory.base_ptr(),
                self.regs.get() as *mut u64,
                self.entry,
            );
            RunStatus::Completed
        } else {
            RunStatus::Halted
        }
    }

    fn finish(&self) {
        *self.done.lock().unwrap() = true;
        self.done_cv.notify_all();
    }

    /// Wait up to `timeout` for completion; returns the final state.
    fn wait_done(&self, timeout: Duration) -> bool {
        let done = self.done.lock().unwrap();
        let (done, _) = self
            .done_cv
            .wait_timeout_while(done, timeout, |d| !*d)
            .unwrap();
        *done
    }
}

fn spawn_watchdog(thread: Arc<GuestThread>) {
    let thread_id = thread.id;
    let spawned = std::thread::Builder::new()
        .name(format!("watchdog-{}", thread_id))
        .spawn(move || {
            if thread.wait_done(SOFT_TIMEOUT) {
                return;
            }
            println!("[Thread {}] Execution timeout", thread.id);
            thread.request_stop();
            if thread.wait_done(HARD_TIMEOUT - SOFT_TIMEOUT) {
                return;
            }
            eprintln!("[Thread {}] Not responding, terminating", thread.id);
            std::process::exit(EXIT_TIMEOUT);
        });
    if let Err(err) = spawned {
        warn!("cannot start watchdog for thread {}: {err}", thread_id);
    }
}
