//! Fixed pool of worker threads consuming closures from a FIFO.
//!
//! Submission enqueues one boxed unit of work and wakes exactly one sleeping
//! worker. The queue is unbounded; backpressure comes from the reactor's
//! connection cap and idle timeouts. Dropping the pool drains outstanding
//! work and joins every thread.

use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Sender};
use log::trace;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A bounded set of threads executing submitted closures in FIFO order.
#[derive(Debug)]
pub struct WorkerPool {
    jobs: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns `size` worker threads.
    pub fn new(size: usize) -> Self {
        let (tx, rx) = unbounded::<Job>();
        let mut workers = Vec::with_capacity(size);
        for i in 0..size {
            let rx = rx.clone();
            let handle = thread::Builder::new()
                .name(format!("hearth-worker-{i}"))
                .spawn(move || {
                    while let Ok(job) = rx.recv() {
                        job();
                    }
                    trace!("worker shutting down");
                })
                .expect("failed to spawn worker thread");
            workers.push(handle);
        }
        Self {
            jobs: Some(tx),
            workers,
        }
    }

    /// Enqueues one unit of work.
    pub fn submit<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if let Some(jobs) = &self.jobs {
            // send only fails once every worker has exited
            let _ = jobs.send(Box::new(job));
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.jobs.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}
