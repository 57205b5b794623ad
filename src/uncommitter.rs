//! The per-NUMA background worker that returns idle cached memory to
//! the system.  Each tick asks the allocator how much to flush and how
//! long to sleep; the allocator owns all the policy (delay windows,
//! budgets, retained floor).
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::Weak;
use std::thread;
use std::time::Duration;

use log::debug;

use crate::address::M;
use crate::allocator::PageAllocator;

struct StopSignal {
    stopped: Mutex<bool>,
    wakeup: Condvar,
}

impl StopSignal {
    /// Waits for `timeout`; returns true when the worker should keep
    /// running.
    fn wait(&self, timeout: Duration) -> bool {
        let mut stopped = self.stopped.lock().unwrap();
        if *stopped {
            return false;
        }

        let (guard, _) = self.wakeup.wait_timeout(stopped, timeout).unwrap();
        stopped = guard;
        !*stopped
    }

    fn stop(&self) {
        let mut stopped = self.stopped.lock().unwrap();
        *stopped = true;
        self.wakeup.notify_all();
    }
}

pub(crate) struct Uncommitter {
    signal: Arc<StopSignal>,
    thread: Option<thread::JoinHandle<()>>,
}

impl Uncommitter {
    /// Spawns the worker for `numa_id`.  The thread keeps only a weak
    /// allocator reference so it can never keep the allocator alive.
    pub(crate) fn spawn(
        numa_id: u32,
        allocator: Weak<PageAllocator>,
        delay: Duration,
    ) -> Uncommitter {
        let signal = Arc::new(StopSignal {
            stopped: Mutex::new(false),
            wakeup: Condvar::new(),
        });
        let thread_signal = Arc::clone(&signal);

        let thread = thread::Builder::new()
            .name(format!("granary-uncommitter-{}", numa_id))
            .spawn(move || {
                // The tick adjusts the timeout in place; it carries
                // over so a running uncommit phase keeps its pacing.
                let mut timeout_seconds = delay.as_secs();

                while thread_signal.wait(Duration::from_secs(timeout_seconds.max(1))) {
                    let allocator = match allocator.upgrade() {
                        Some(allocator) => allocator,
                        None => break,
                    };

                    let uncommitted = allocator.uncommit_tick(numa_id, &mut timeout_seconds);
                    if uncommitted > 0 {
                        debug!("uncommitted {}M on node {}", uncommitted / M, numa_id);
                    }
                }
            })
            .expect("failed to spawn the uncommitter");

        Uncommitter {
            signal,
            thread: Some(thread),
        }
    }

    pub(crate) fn stop(&self) {
        self.signal.stop();
    }
}

impl Drop for Uncommitter {
    fn drop(&mut self) {
        self.signal.stop();

        // Join unless this thread is the worker itself (a worker
        // holding the last allocator reference would deadlock).
        if let Some(handle) = self.thread.take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}
