//! Event worker threads
//!
//! The vsync and hotplug paths each own a long-lived OS thread that spends
//! its life blocking in a kernel wait. [`Worker`] gives those threads one
//! shared lifecycle: spawn, run the routine in a loop, cooperatively suspend
//! on request, and join on exit. Suspension takes effect between routine
//! iterations; a routine blocked in the kernel finishes its current wait
//! first.

use std::thread::JoinHandle;

use anyhow::{Context, Result};
use log::warn;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Running,
    Suspended,
    Exiting,
}

struct Shared {
    phase: Mutex<Phase>,
    cond: Condvar,
}

/// Handle to a running worker thread.
pub struct Worker {
    name: String,
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    /// Spawns `routine`, which is invoked repeatedly until exit is requested.
    ///
    /// The routine should perform one blocking wait plus dispatch per call
    /// and return; the loop and lifecycle checks live here.
    pub fn spawn<F>(name: &str, mut routine: F) -> Result<Worker>
    where
        F: FnMut() + Send + 'static,
    {
        let shared = Arc::new(Shared {
            phase: Mutex::new(Phase::Running),
            cond: Condvar::new(),
        });
        let thread_shared = shared.clone();
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || loop {
                {
                    let mut phase = thread_shared.phase.lock();
                    while *phase == Phase::Suspended {
                        thread_shared.cond.wait(&mut phase);
                    }
                    if *phase == Phase::Exiting {
                        return;
                    }
                }
                routine();
            })
            .with_context(|| format!("failed to spawn worker thread '{}'", name))?;

        Ok(Worker {
            name: name.to_string(),
            shared,
            handle: Some(handle),
        })
    }

    /// Parks the worker after its current iteration completes.
    pub fn suspend(&self) {
        let mut phase = self.shared.phase.lock();
        if *phase == Phase::Running {
            *phase = Phase::Suspended;
        }
    }

    /// Wakes a suspended worker.
    pub fn resume(&self) {
        let mut phase = self.shared.phase.lock();
        if *phase == Phase::Suspended {
            *phase = Phase::Running;
            self.shared.cond.notify_one();
        }
    }

    pub fn is_suspended(&self) -> bool {
        *self.shared.phase.lock() == Phase::Suspended
    }

    /// Requests exit and joins the thread.
    pub fn exit(mut self) {
        self.request_exit();
        self.join();
    }

    fn request_exit(&self) {
        let mut phase = self.shared.phase.lock();
        *phase = Phase::Exiting;
        self.shared.cond.notify_one();
    }

    fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("worker thread '{}' panicked before join", self.name);
            }
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.request_exit();
            self.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[test]
    fn test_routine_runs_until_exit() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let worker = Worker::spawn("test-run", move || {
            c.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(1));
        })
        .unwrap();

        while count.load(Ordering::SeqCst) < 3 {
            std::thread::yield_now();
        }
        worker.exit();
        let frozen = count.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(count.load(Ordering::SeqCst), frozen);
    }

    #[test]
    fn test_suspend_resume_cycle() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let worker = Worker::spawn("test-suspend", move || {
            c.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(1));
        })
        .unwrap();

        while count.load(Ordering::SeqCst) == 0 {
            std::thread::yield_now();
        }
        worker.suspend();
        assert!(worker.is_suspended());
        // Let any in-flight iteration drain, then verify the counter froze.
        std::thread::sleep(Duration::from_millis(20));
        let frozen = count.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(count.load(Ordering::SeqCst), frozen);

        worker.resume();
        while count.load(Ordering::SeqCst) == frozen {
            std::thread::yield_now();
        }
        worker.exit();
    }

    #[test]
    fn test_drop_joins() {
        let worker = Worker::spawn("test-drop", || {
            std::thread::sleep(Duration::from_millis(1));
        })
        .unwrap();
        drop(worker);
    }
}
