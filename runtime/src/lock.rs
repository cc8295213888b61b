//! Process-wide lock registry for guest LOCK/UNLOCK.
//!
//! Guest lock and unlock arrive as separate host calls, so guards
//! cannot be used; mutexes are raw pthread mutexes with manual
//! lock/unlock. Lock IDs are chosen by the guest; mutexes are created
//! lazily on first LOCK and live until process exit.

use std::cell::UnsafeCell;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use log::{debug, warn};

/// A pthread mutex with manual lock/unlock.
pub struct RawMutex {
    inner: UnsafeCell<libc::pthread_mutex_t>,
}

// SAFETY: pthread mutexes are made for cross-thread use; the cell is
// only handed to pthread_mutex_lock/unlock.
unsafe impl Send for RawMutex {}
unsafe impl Sync for RawMutex {}

impl RawMutex {
    pub fn new() -> Self {
        Self {
            inner: UnsafeCell::new(libc::PTHREAD_MUTEX_INITIALIZER),
        }
    }

    pub fn lock(&self) {
        // SAFETY: statically initialized mutex, valid for the
        // lifetime of self.
        let rc = unsafe { libc::pthread_mutex_lock(self.inner.get()) };
        debug_assert_eq!(rc, 0);
    }

    pub fn unlock(&self) {
        // SAFETY: as above; unlocking a mutex the guest never locked
        // is the guest's contract violation, not ours.
        let rc = unsafe { libc::pthread_mutex_unlock(self.inner.get()) };
        debug_assert_eq!(rc, 0);
    }
}

impl Default for RawMutex {
    fn default() -> Self {
        Self::new()
    }
}

static LOCKS: OnceLock<Mutex<HashMap<u64, Arc<RawMutex>>>> = OnceLock::new();

fn locks() -> &'static Mutex<HashMap<u64, Arc<RawMutex>>> {
    LOCKS.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Lock `lock_id`, creating the mutex on first use. The registry lock
/// is released before blocking on the target mutex.
pub fn lock(lock_id: u64) {
    let mutex = locks()
        .lock()
        .unwrap()
        .entry(lock_id)
        .or_insert_with(|| Arc::new(RawMutex::new()))
        .clone();
    debug!("locking object {lock_id}");
    mutex.lock();
    debug!("locked object {lock_id}");
}

/// Unlock `lock_id`. Unlocking a never-locked id is a warned no-op.
pub fn unlock(lock_id: u64) {
    let mutex = locks().lock().unwrap().get(&lock_id).cloned();
    match mutex {
        Some(mutex) => {
            debug!("unlocking object {lock_id}");
            mutex.unlock();
        }
        None => warn!("unlock on non-existent lock {lock_id}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::thread;

    #[test]
    fn test_lock_unlock_roundtrip() {
        lock(1000);
        unlock(1000);
        lock(1000);
        unlock(1000);
    }

    #[test]
    fn test_unlock_unknown_is_noop() {
        unlock(424242);
    }

    #[test]
    fn test_distinct_ids_do_not_contend() {
        lock(2000);
        lock(2001);
        unlock(2001);
        unlock(2000);
    }

    #[test]
    fn test_mutual_exclusion() {
        static IN_SECTION: AtomicU32 = AtomicU32::new(0);
        const ID: u64 = 3000;

        let workers: Vec<_> = (0..4)
            .map(|_| {
                thread::spawn(|| {
                    for _ in 0..100 {
                        lock(ID);
                        let n = IN_SECTION.fetch_add(1, Ordering::SeqCst);
                        assert_eq!(n, 0, "two threads inside the section");
                        IN_SECTION.fetch_sub(1, Ordering::SeqCst);
                        unlock(ID);
                    }
                })
            })
            .collect();
        for w in workers {
            w.join().unwrap();
        }
    }
}
