//! Bounded job queue served by a fixed pool of worker threads.
//!
//! Jobs are handed to workers through a bounded crossbeam channel, so a
//! producer submitting faster than the pool drains blocks instead of
//! buffering without limit. Each worker handles one job at a time; a job
//! that blocks (for example waiting on a child process) stalls only its
//! own worker.

use anyhow::Result;
use crossbeam_channel::{bounded, Sender};
use std::mem;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, warn};

/// Handle to a running pool of workers processing jobs of type `J`.
pub struct WorkerPool<J: Send + 'static> {
    sender: Sender<J>,
    workers: Vec<JoinHandle<()>>,
}

impl<J: Send + 'static> WorkerPool<J> {
    /// Start `num_workers` threads, each calling `handler(worker_id, job)`.
    ///
    /// # Arguments
    ///
    /// * `num_workers` - Number of threads; also the maximum number of jobs in flight
    /// * `queue_size` - Submitted jobs not yet picked up before [`WorkerPool::submit`] blocks (at least 1)
    /// * `handler` - Called once per job on whichever worker receives it
    ///
    /// # Returns
    ///
    /// The running pool, or an error when `num_workers` is zero or a thread
    /// cannot be spawned.
    ///
    /// A panic inside `handler` ends that worker thread; jobs still queued
    /// are served by the remaining workers.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use shared::worker_pool::WorkerPool;
    /// use std::sync::atomic::{AtomicUsize, Ordering};
    /// use std::sync::Arc;
    ///
    /// let total = Arc::new(AtomicUsize::new(0));
    /// let sum = Arc::clone(&total);
    /// let pool = WorkerPool::new(2, 4, move |_worker, job: usize| {
    ///     sum.fetch_add(job, Ordering::SeqCst);
    /// })
    /// .unwrap();
    /// for job in 1..=4 {
    ///     pool.submit(job).unwrap();
    /// }
    /// pool.wait_for_completion();
    /// assert_eq!(total.load(Ordering::SeqCst), 10);
    /// ```
    pub fn new<F>(num_workers: usize, queue_size: usize, handler: F) -> Result<Self>
    where
        F: Fn(usize, J) + Send + Sync + 'static,
    {
        if num_workers == 0 {
            anyhow::bail!("Worker pool needs at least one worker");
        }

        let (sender, receiver) = bounded::<J>(queue_size.max(1));
        let handler = Arc::new(handler);

        let mut workers = Vec::with_capacity(num_workers);
        for worker_id in 0..num_workers {
            let receiver = receiver.clone();
            let handler = Arc::clone(&handler);

            let handle = std::thread::Builder::new()
                .name(format!("worker-{worker_id}"))
                .spawn(move || {
                    debug!("Worker {} started", worker_id);
                    while let Ok(job) = receiver.recv() {
                        handler(worker_id, job);
                    }
                    debug!("Worker {} shutting down", worker_id);
                })?;

            workers.push(handle);
        }

        Ok(Self { sender, workers })
    }

    /// Number of worker threads in the pool.
    pub fn width(&self) -> usize {
        self.workers.len()
    }

    /// Queue a job, blocking while the queue is full.
    pub fn submit(&self, job: J) -> Result<()> {
        self.sender
            .send(job)
            .map_err(|_| anyhow::anyhow!("Worker pool has shut down"))
    }

    /// Close the queue and join every worker once queued jobs are drained.
    pub fn wait_for_completion(mut self) {
        mem::drop(self.sender);

        for (worker_id, handle) in self.workers.drain(..).enumerate() {
            if let Err(e) = handle.join() {
                warn!("Worker {} panicked: {:?}", worker_id, e);
            }
        }

        debug!("All workers completed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    #[test]
    fn test_every_job_runs_once() {
        let (tx, rx) = unbounded();
        let pool = WorkerPool::new(4, 2, move |_, job: usize| {
            tx.send(job * 2).unwrap();
        })
        .unwrap();

        for job in 0..50 {
            pool.submit(job).unwrap();
        }
        pool.wait_for_completion();

        let results: HashSet<usize> = rx.try_iter().collect();
        assert_eq!(results.len(), 50);
        assert!(results.contains(&98));
    }

    #[test]
    fn test_concurrency_bounded_by_width() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (a, p) = (Arc::clone(&active), Arc::clone(&peak));

        let pool = WorkerPool::new(3, 8, move |_, _job: u32| {
            let now = a.fetch_add(1, Ordering::SeqCst) + 1;
            p.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(5));
            a.fetch_sub(1, Ordering::SeqCst);
        })
        .unwrap();
        assert_eq!(pool.width(), 3);

        for job in 0..30 {
            pool.submit(job).unwrap();
        }
        pool.wait_for_completion();

        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(active.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_panicking_job_does_not_stop_others() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        let pool = WorkerPool::new(2, 4, move |_, job: u32| {
            if job == 3 {
                panic!("job 3 failed");
            }
            s.lock().unwrap().push(job);
        })
        .unwrap();

        for job in 0..6 {
            pool.submit(job).unwrap();
        }
        pool.wait_for_completion();

        let mut seen = seen.lock().unwrap().clone();
        seen.sort();
        assert_eq!(seen, vec![0, 1, 2, 4, 5]);
    }

    #[test]
    fn test_zero_workers_rejected() {
        assert!(WorkerPool::new(0, 1, |_, _job: u8| {}).is_err());
    }
}
