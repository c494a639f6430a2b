//! Worker-thread set
//!
//! The process-wide collection of live worker threads. Each worker removes
//! itself on exit; the supervisor blocks in [`ServerThreadSet::wait_all`]
//! until the set drains. This is the only structure shared across workers
//! and it is touched only at thread start and thread exit.

use lazy_static::lazy_static;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::thread::{self, JoinHandle, ThreadId};

lazy_static! {
    static ref SERVER_THREADS: ServerThreadSet = ServerThreadSet::new();
}

/// The process-wide thread set.
pub fn server_thread_set() -> &'static ServerThreadSet {
    &SERVER_THREADS
}

pub struct ServerThreadSet {
    threads: Mutex<HashMap<ThreadId, JoinHandle<()>>>,
    drained: Condvar,
}

impl ServerThreadSet {
    fn new() -> Self {
        Self {
            threads: Mutex::new(HashMap::new()),
            drained: Condvar::new(),
        }
    }

    /// Block until every worker has exited and removed itself.
    pub fn wait_all(&self) {
        let mut threads = self.threads.lock();
        while !threads.is_empty() {
            self.drained.wait(&mut threads);
        }
    }

    /// Number of live workers; for diagnostics.
    pub fn len(&self) -> usize {
        self.threads.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn remove_current(&self) {
        let mut threads = self.threads.lock();
        // Dropping the handle detaches the thread, which is about to die
        // anyway.
        threads.remove(&thread::current().id());
        if threads.is_empty() {
            self.drained.notify_all();
        }
    }
}

/// RAII guard that removes the running worker from the set on exit, even
/// when the worker body panics.
struct ThreadCleanup;

impl Drop for ThreadCleanup {
    fn drop(&mut self) {
        server_thread_set().remove_current();
    }
}

/// Spawn a worker and track it in the set. The set's lock is held across
/// spawn and insertion, and removal also takes it, so a worker that
/// finishes instantly still finds its entry to remove.
pub fn launch_server_thread<F>(body: F)
where
    F: FnOnce() + Send + 'static,
{
    let mut threads = SERVER_THREADS.threads.lock();
    let handle = thread::spawn(move || {
        let _cleanup = ThreadCleanup;
        body();
    });
    threads.insert(handle.thread().id(), handle);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    // One test so the global set is not shared across parallel test threads.
    #[test]
    fn test_launch_and_wait_all() {
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let counter = Arc::clone(&counter);
            launch_server_thread(move || {
                std::thread::sleep(Duration::from_millis(10));
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        server_thread_set().wait_all();
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert!(server_thread_set().is_empty());

        // A worker that finishes instantly still removes its entry.
        launch_server_thread(|| {});
        server_thread_set().wait_all();
        assert!(server_thread_set().is_empty());
    }
}
