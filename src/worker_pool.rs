//! Named, fixed-size job pools backed by `rayon` thread pools.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread;

use log::{debug, error};

pub fn panic_payload_to_string(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        return (*s).to_string();
    }
    if let Some(s) = payload.downcast_ref::<String>() {
        return s.clone();
    }
    "non-string panic payload".to_string()
}

#[derive(Debug, Default)]
struct Activity {
    closed: bool,
    running: usize,
}

/// Open/closed flag plus the count of jobs currently executing.
#[derive(Default)]
struct Gate {
    activity: Mutex<Activity>,
    idle: Condvar,
}

impl Gate {
    fn lock(&self) -> std::sync::MutexGuard<'_, Activity> {
        self.activity.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a starting job. False once the pool is closed.
    fn enter(&self) -> bool {
        let mut activity = self.lock();
        if activity.closed {
            return false;
        }
        activity.running += 1;
        true
    }

    fn leave(&self) {
        let mut activity = self.lock();
        activity.running = activity.running.saturating_sub(1);
        if activity.running == 0 {
            self.idle.notify_all();
        }
    }
}

pub struct WorkerPool {
    name: String,
    pool: rayon::ThreadPool,
    gate: Arc<Gate>,
}

impl WorkerPool {
    /// Builds a pool of `size` threads named `{name}-{index}` (at least one).
    pub fn new(name: &str, size: usize) -> std::io::Result<Self> {
        let size = size.max(1);
        let thread_prefix = name.to_string();
        let pool_name = name.to_string();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(size)
            .thread_name(move |index| format!("{thread_prefix}-{index}"))
            .panic_handler(move |payload| {
                error!(
                    "Job in pool '{}' panicked: {}",
                    pool_name,
                    panic_payload_to_string(payload.as_ref())
                );
            })
            .build()
            .map_err(std::io::Error::other)?;
        debug!("Started worker pool '{}' with {} threads", name, size);

        Ok(Self {
            name: name.to_string(),
            pool,
            gate: Arc::new(Gate::default()),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.gate.lock().closed
    }

    /// Queues a job. Returns false when the pool has been shut down.
    pub fn submit<F>(&self, job: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_closed() {
            debug!("Pool '{}' is shut down; dropping submitted job", self.name);
            return false;
        }
        let gate = Arc::clone(&self.gate);
        self.pool.spawn(move || {
            if !gate.enter() {
                return;
            }
            if let Err(payload) = catch_unwind(AssertUnwindSafe(job)) {
                error!(
                    "Job on thread '{}' panicked: {}",
                    thread::current().name().unwrap_or("unnamed"),
                    panic_payload_to_string(payload.as_ref())
                );
            }
            gate.leave();
        });
        true
    }

    /// Stops accepting work and waits for running jobs to finish. Queued
    /// jobs that have not started are skipped.
    pub fn shutdown(&self) {
        let mut activity = self.gate.lock();
        if activity.closed {
            return;
        }
        activity.closed = true;
        if self.pool.current_thread_index().is_some() {
            debug!("Pool '{}' closed from one of its own threads", self.name);
            return;
        }
        while activity.running > 0 {
            activity = self
                .gate
                .idle
                .wait(activity)
                .unwrap_or_else(PoisonError::into_inner);
        }
        debug!("Worker pool '{}' shut down", self.name);
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::WorkerPool;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{mpsc, Arc};
    use std::time::Duration;

    #[test]
    fn test_jobs_run_on_named_threads() {
        let pool = WorkerPool::new("test-pool", 2).expect("pool");
        let (tx, rx) = mpsc::channel();
        for _ in 0..4 {
            let tx = tx.clone();
            assert!(pool.submit(move || {
                let name = std::thread::current().name().map(str::to_string);
                let _ = tx.send(name);
            }));
        }
        for _ in 0..4 {
            let name = rx
                .recv_timeout(Duration::from_secs(5))
                .expect("job ran")
                .expect("named thread");
            assert!(name.starts_with("test-pool-"));
        }
        pool.shutdown();
    }

    #[test]
    fn test_panicking_job_does_not_kill_worker() {
        let pool = WorkerPool::new("panic-pool", 1).expect("pool");
        let counter = Arc::new(AtomicUsize::new(0));
        pool.submit(|| panic!("boom"));
        let (tx, rx) = mpsc::channel();
        let job_counter = Arc::clone(&counter);
        pool.submit(move || {
            job_counter.fetch_add(1, Ordering::SeqCst);
            let _ = tx.send(());
        });
        rx.recv_timeout(Duration::from_secs(5)).expect("second job ran");
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_submit_after_shutdown_is_dropped_and_shutdown_is_idempotent() {
        let pool = WorkerPool::new("closed-pool", 1).expect("pool");
        pool.shutdown();
        pool.shutdown();
        assert!(pool.is_closed());
        assert!(!pool.submit(|| {}));
    }

    #[test]
    fn test_shutdown_waits_for_running_job_and_skips_queued() {
        let pool = WorkerPool::new("queue-pool", 1).expect("pool");
        let ran = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicUsize::new(0));
        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let first_finished = Arc::clone(&finished);
        pool.submit(move || {
            let _ = started_tx.send(());
            let _ = release_rx.recv_timeout(Duration::from_secs(5));
            first_finished.fetch_add(1, Ordering::SeqCst);
        });
        started_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("first job started");
        for _ in 0..3 {
            let ran = Arc::clone(&ran);
            pool.submit(move || {
                ran.fetch_add(1, Ordering::SeqCst);
            });
        }
        let releaser = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            let _ = release_tx.send(());
        });
        pool.shutdown();
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        let _ = releaser.join();
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }
}
