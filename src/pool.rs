//! Worker pool.

use log;
use std::collections::VecDeque;
use std::error::Error;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Condvar, Mutex};
use std::thread;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Worker pool error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    /// Task submitted after pool shutdown started.
    Stopped,
    /// The worker executing the task dropped its result channel.
    Disconnected,
}

impl Error for PoolError {}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolError::Stopped => write!(f, "task submitted to a stopped worker pool"),
            PoolError::Disconnected => write!(f, "worker dropped the task result"),
        }
    }
}

/// Completion handle for a submitted task.
pub struct TaskHandle<T> {
    result: mpsc::Receiver<T>,
}

impl<T> TaskHandle<T> {
    /// Blocks until the task has finished and returns its value.
    pub fn wait(self) -> Result<T, PoolError> {
        self.result.recv().map_err(|_| PoolError::Disconnected)
    }
}

struct PoolShared {
    queue: Mutex<VecDeque<Job>>,
    available: Condvar,
    stop: AtomicBool,
}

/// Fixed-size worker pool draining a shared FIFO task queue.
///
/// Tasks start in submission order; completion order is unspecified. Dropping
/// the pool signals shutdown, wakes every worker, runs all pending tasks to
/// completion and joins the worker threads. Only new submissions are rejected
/// after shutdown.
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns a pool of `size` worker threads.
    pub fn new(size: usize) -> Self {
        log::info!("starting worker pool (workers: {})", size);

        let shared = Arc::new(PoolShared {
            queue: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
            stop: AtomicBool::new(false),
        });

        let workers = (0..size)
            .map(|_| {
                let shared = Arc::clone(&shared);
                thread::spawn(move || Self::work(shared))
            })
            .collect();

        WorkerPool { shared, workers }
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Enqueues a task and returns a handle that yields its return value.
    pub fn submit<T, F>(&self, task: F) -> Result<TaskHandle<T>, PoolError>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (sender, receiver) = mpsc::sync_channel(1);
        let job: Job = Box::new(move || {
            // a submitter may drop its handle before completion, that is fine
            let _ = sender.send(task());
        });

        {
            let mut queue = self.shared.queue.lock().expect("task queue poisoned");
            if self.shared.stop.load(Ordering::SeqCst) {
                return Err(PoolError::Stopped);
            }
            queue.push_back(job);
        }
        self.shared.available.notify_one();

        Ok(TaskHandle { result: receiver })
    }

    fn work(shared: Arc<PoolShared>) {
        loop {
            let job = {
                let mut queue = shared.queue.lock().expect("task queue poisoned");
                loop {
                    if let Some(job) = queue.pop_front() {
                        break job;
                    }
                    // workers exit only once stopped and fully drained
                    if shared.stop.load(Ordering::SeqCst) {
                        return;
                    }
                    queue = shared.available.wait(queue).expect("task queue poisoned");
                }
            };

            // run outside the lock so other workers can dequeue meanwhile
            job();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        {
            // flip the flag under the queue lock so a worker between its
            // empty-queue check and its wait cannot miss the wakeup
            let _queue = self.shared.queue.lock().expect("task queue poisoned");
            self.shared.stop.store(true, Ordering::SeqCst);
        }
        self.shared.available.notify_all();

        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use super::{PoolError, WorkerPool};

    #[test]
    fn test_submit_returns_task_value() {
        let pool = WorkerPool::new(2);

        let handle = pool.submit(|| 40 + 2).unwrap();
        assert_eq!(handle.wait().unwrap(), 42);
    }

    #[test]
    fn test_all_tasks_complete() {
        let pool = WorkerPool::new(4);

        let handles: Vec<_> = (0..64).map(|i| pool.submit(move || i * 2).unwrap()).collect();

        let mut results: Vec<i32> = handles.into_iter().map(|h| h.wait().unwrap()).collect();
        results.sort_unstable();
        assert_eq!(results, (0..64).map(|i| i * 2).collect::<Vec<_>>());
    }

    #[test]
    fn test_pending_tasks_run_before_shutdown() {
        let counter = Arc::new(AtomicUsize::new(0));

        {
            let pool = WorkerPool::new(1);
            for _ in 0..16 {
                let counter = Arc::clone(&counter);
                pool.submit(move || {
                    std::thread::sleep(Duration::from_millis(1));
                    counter.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
            }
            // drop joins the single worker with most tasks still queued
        }

        assert_eq!(counter.load(Ordering::SeqCst), 16);
    }

    #[test]
    fn test_submit_after_stop_is_rejected() {
        let pool = WorkerPool::new(1);

        {
            let _queue = pool.shared.queue.lock().unwrap();
            pool.shared.stop.store(true, Ordering::SeqCst);
        }
        pool.shared.available.notify_all();

        let result = pool.submit(|| ()).map(|_| ());
        assert_eq!(result.unwrap_err(), PoolError::Stopped);
    }

    #[test]
    fn test_concurrent_submitters() {
        let pool = Arc::new(WorkerPool::new(4));

        let submitters: Vec<_> = (0..4)
            .map(|t| {
                let pool = Arc::clone(&pool);
                std::thread::spawn(move || {
                    let handles: Vec<_> = (0..32).map(|i| pool.submit(move || t * 100 + i).unwrap()).collect();
                    handles.into_iter().map(|h| h.wait().unwrap()).sum::<i32>()
                })
            })
            .collect();

        let total: i32 = submitters.into_iter().map(|s| s.join().unwrap()).sum();
        let expected: i32 = (0..4).map(|t| (0..32).map(|i| t * 100 + i).sum::<i32>()).sum();
        assert_eq!(total, expected);
    }
}
