//! Guards the predicate "code patching is allowed now": the active-thread
//! counter is zero *and* the caller holds the coordinator. Acquired at the
//! start of `team_begin`, `team_end`, and every primary-location exit;
//! released at their end. Workers' enter/exit paths never touch this lock.

use std::sync::Mutex;

#[derive(Default)]
pub struct DeletionCoordinator {
    active_thread_count: Mutex<u32>,
}

impl DeletionCoordinator {
    pub fn new() -> Self {
        Self {
            active_thread_count: Mutex::new(0),
        }
    }

    /// Runs `f` while holding the coordinator, with mutable access to the
    /// active-thread counter. This is the only way to read or mutate the
    /// counter, so "holding the coordinator" and "the closure is running"
    /// are the same thing.
    pub fn with_active_count<R>(&self, f: impl FnOnce(&mut u32) -> R) -> R {
        let mut count = self
            .active_thread_count
            .lock()
            .expect("deletion coordinator mutex poisoned");
        f(&mut count)
    }
}
