use std::thread;

use super::ThreadPool;
use crate::Result;

/// Not actually a pool: spawns a fresh OS thread for every job. Useful
/// as a baseline and in tests.
pub struct NaiveThreadPool;

impl ThreadPool for NaiveThreadPool {
    fn new(_threads: u32) -> Result<Self> {
        Ok(NaiveThreadPool)
    }

    fn spawn<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        thread::spawn(job);
    }
}
