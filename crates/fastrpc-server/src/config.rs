//! Server configuration.

use std::time::Duration;

/// Default ceiling on a request body.
pub const DEFAULT_MAX_REQUEST_SIZE: usize = 1024 * 1024;

/// Default number of jobs allowed to wait for a free worker.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Tunables for the request pipeline.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Worker slots; 0 picks the number of available cores.
    pub threads: usize,
    /// Jobs allowed to queue behind busy workers; `None` for no limit.
    pub queue_capacity: Option<usize>,
    /// Largest accepted `CONTENT_LENGTH`.
    pub max_request_size: usize,
    /// Deadline for reading the body and running the method; `None` for no limit.
    pub request_timeout: Option<Duration>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            threads: 0,
            queue_capacity: Some(DEFAULT_QUEUE_CAPACITY),
            max_request_size: DEFAULT_MAX_REQUEST_SIZE,
            request_timeout: Some(DEFAULT_REQUEST_TIMEOUT),
        }
    }
}

impl ServerConfig {
    /// Worker count after resolving `threads == 0`.
    pub fn worker_threads(&self) -> usize {
        if self.threads > 0 {
            return self.threads;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }
}
