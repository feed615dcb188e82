//! Thread pools for serving connections.
//!
//! Both servers in this crate are generic over [`ThreadPool`], so the
//! pooling strategy is a deployment choice rather than a code change.

use crate::error::Result;

/// A pool of threads that jobs can be spawned onto.
pub trait ThreadPool {
    /// Creates a pool holding `threads` threads.
    ///
    /// # Errors
    /// Returns an error if any thread fails to start; in that case no
    /// pool is created.
    fn new(threads: u32) -> Result<Self>
    where
        Self: Sized;

    /// Runs `job` on one of the pool's threads.
    fn spawn<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static;
}

mod naive;
mod rayon_pool;
mod shared_queue;

pub use self::naive::NaiveThreadPool;
pub use self::rayon_pool::RayonThreadPool;
pub use self::shared_queue::SharedQueueThreadPool;
