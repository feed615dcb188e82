use std::thread;

use crossbeam::channel::{self, Receiver, Sender};
use tracing::{debug, error};

use super::ThreadPool;
use crate::Result;

/// A thread pool built on a shared job queue.
///
/// The queue is a crossbeam MPMC [`channel`] used single-producer,
/// multiple-consumer: the pool itself is the producer and the worker
/// threads are the consumers.
///
/// If a job panics, the worker it ran on is replaced with a fresh
/// thread. Failures to respawn at the OS level are logged and swallowed,
/// so in the worst case the pool can shrink; spawning onto an empty pool
/// panics.
///
/// [`channel`]: https://docs.rs/crossbeam/latest/crossbeam/channel/index.html
pub struct SharedQueueThreadPool {
    /// the sending half of the job queue
    tx: Sender<Job>,
}

type Job = Box<dyn FnOnce() + Send + 'static>;

impl ThreadPool for SharedQueueThreadPool {
    fn new(threads: u32) -> Result<Self> {
        let (tx, rx) = channel::unbounded::<Job>();
        for _ in 0..threads {
            let worker = JobReceiver(rx.clone());
            thread::Builder::new().spawn(move || run_jobs(worker))?;
        }
        Ok(SharedQueueThreadPool { tx })
    }

    fn spawn<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.tx
            .send(Box::new(job))
            .expect("there are no threads in the pool");
    }
}

/// Receiving half held by each worker; its `Drop` impl is what respawns
/// a worker whose job panicked.
#[derive(Clone)]
struct JobReceiver(Receiver<Job>);

impl Drop for JobReceiver {
    fn drop(&mut self) {
        if thread::panicking() {
            debug!("worker panicked, replacing it");
            let worker = self.clone();
            if let Err(e) = thread::Builder::new().spawn(move || run_jobs(worker)) {
                error!("failed to respawn worker thread: {}", e);
            }
        }
    }
}

/// Worker loop: take a job off the queue, run it, repeat until the pool
/// (the sender) is dropped.
fn run_jobs(rx: JobReceiver) {
    loop {
        match rx.0.recv() {
            Ok(job) => job(),
            Err(_) => {
                debug!("worker exiting, thread pool was destroyed");
                break;
            }
        }
    }
}
