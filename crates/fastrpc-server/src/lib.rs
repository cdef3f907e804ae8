//! fastrpc server: the concurrent request pipeline.
//!
//! A single accept loop hands every connection to a bounded worker pool.
//! Each job reads one JSON-RPC request from its connection, validates the
//! envelope, dispatches it to a fresh service instance and writes back
//! exactly one response before finishing the connection.

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod job;
pub mod pool;
pub mod server;

pub use config::ServerConfig;
pub use dispatcher::Dispatcher;
pub use error::ServerError;
pub use job::{JobLimits, JobState, REJECT_TIMEOUT, RESPONSE_HEADERS, RequestJob};
pub use pool::{PoolJob, Saturated, WorkerPool};
pub use server::{MAX_PENDING_REJECTIONS, Server};
