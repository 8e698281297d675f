//! Fixed-size worker pool
//!
//! Workers dequeue submitted tasks FIFO and run them to completion; there
//! are no priorities and no mid-task cancellation. The internal queue is
//! unbounded, so `run_task` never blocks the driver. The pool joins its
//! threads on drop, after draining every task already submitted.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};
use tracing::error;

use cascade_types::Result;

type Task = Box<dyn FnOnce() + Send + 'static>;

struct PoolState {
    tasks: VecDeque<Task>,
    shutdown: bool,
}

struct PoolShared {
    state: Mutex<PoolState>,
    work: Condvar,
}

/// Fixed pool of worker threads executing submitted tasks.
pub struct TaskPool {
    shared: Arc<PoolShared>,
    workers: Vec<JoinHandle<()>>,
}

impl TaskPool {
    /// Spawn `size` worker threads (at least one).
    pub fn new(size: usize) -> Result<Self> {
        let shared = Arc::new(PoolShared {
            state: Mutex::new(PoolState {
                tasks: VecDeque::new(),
                shutdown: false,
            }),
            work: Condvar::new(),
        });

        let mut workers = Vec::with_capacity(size.max(1));
        for i in 0..size.max(1) {
            let shared = Arc::clone(&shared);
            let handle = std::thread::Builder::new()
                .name(format!("cascade-worker-{i}"))
                .spawn(move || worker_loop(shared))?;
            workers.push(handle);
        }

        Ok(Self { shared, workers })
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Submit a unit of work. Never blocks.
    pub fn run_task(&self, task: impl FnOnce() + Send + 'static) {
        let mut state = self.shared.state.lock();
        state.tasks.push_back(Box::new(task));
        drop(state);
        self.shared.work.notify_one();
    }
}

fn worker_loop(shared: Arc<PoolShared>) {
    let mut state = shared.state.lock();
    loop {
        if let Some(task) = state.tasks.pop_front() {
            drop(state);
            if catch_unwind(AssertUnwindSafe(task)).is_err() {
                error!("worker task panicked");
            }
            state = shared.state.lock();
            continue;
        }
        if state.shutdown {
            break;
        }
        shared.work.wait(&mut state);
    }
}

impl Drop for TaskPool {
    fn drop(&mut self) {
        self.shared.state.lock().shutdown = true;
        self.shared.work.notify_all();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    #[test]
    fn executes_all_tasks() {
        let pool = TaskPool::new(4).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..100 {
            let counter = Arc::clone(&counter);
            pool.run_task(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        drop(pool); // joins after draining
        assert_eq!(counter.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn zero_size_gets_one_worker() {
        let pool = TaskPool::new(0).unwrap();
        assert_eq!(pool.size(), 1);
    }

    #[test]
    fn survives_panicking_task() {
        let pool = TaskPool::new(1).unwrap();
        let done = Arc::new(AtomicUsize::new(0));
        pool.run_task(|| panic!("boom"));
        let flag = Arc::clone(&done);
        pool.run_task(move || {
            flag.store(1, Ordering::SeqCst);
        });
        drop(pool);
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }
}
