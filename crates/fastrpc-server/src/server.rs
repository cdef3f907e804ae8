//! Accept loop: turns accepted connections into pooled request jobs.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use fastrpc_protocol::RpcError;
use fastrpc_services::ServiceFactory;
use fastrpc_transport::{Connection, FcgiListener, ListenAddress, Listener};
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::config::ServerConfig;
use crate::dispatcher::Dispatcher;
use crate::error::ServerError;
use crate::job::{JobLimits, RequestJob};
use crate::pool::{Saturated, WorkerPool};

/// Pause after a failed accept so a persistent error (e.g. EMFILE) does not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(10);

/// Saturated connections answered at once; further ones are closed unanswered.
pub const MAX_PENDING_REJECTIONS: usize = 64;

/// The request pipeline for one service type.
pub struct Server<F: ServiceFactory> {
    config: ServerConfig,
    dispatcher: Dispatcher<F>,
    pool: WorkerPool,
    rejections: Arc<Semaphore>,
}

impl<F: ServiceFactory> Server<F> {
    /// `factory` must be fully initialized; the worker pool is created here,
    /// after its metadata exists.
    pub fn new(config: ServerConfig, factory: F) -> Self {
        let dispatcher = Dispatcher::new(Arc::new(factory));
        let pool = WorkerPool::new(config.worker_threads(), config.queue_capacity);
        match config.queue_capacity {
            Some(queue) => info!("Worker pool: {} workers, queue of {queue}", pool.workers()),
            None => info!("Worker pool: {} workers, unbounded queue", pool.workers()),
        }
        Self {
            config,
            dispatcher,
            pool,
            rejections: Arc::new(Semaphore::new(MAX_PENDING_REJECTIONS)),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Bind a FastCGI listener advertising this server's capacity.
    pub fn bind(&self, address: &ListenAddress) -> Result<FcgiListener, ServerError> {
        let capacity = self.pool.workers() + self.config.queue_capacity.unwrap_or(0);
        FcgiListener::bind(address)
            .map(|listener| listener.with_max_conns(capacity))
            .map_err(|source| ServerError::Bind {
                address: address.clone(),
                source,
            })
    }

    /// Accept connections until `shutdown` resolves, then wait for in-flight jobs.
    ///
    /// Connections are accepted one at a time on the calling task; processing
    /// happens on the pool.
    pub async fn run<L: Listener>(&self, mut listener: L, shutdown: impl Future<Output = ()>) {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    info!("Shutdown requested; no longer accepting connections");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok(conn) => self.submit(conn),
                    Err(e) => {
                        warn!("Accept failed: {e}");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
            }
        }
        drop(listener);

        info!(
            "Waiting for {} running and {} queued jobs",
            self.pool.running(),
            self.pool.queued()
        );
        self.pool.shutdown().await;
        info!("All jobs finished");
    }

    /// Wrap `conn` in a job and hand it to the pool.
    ///
    /// A saturated pool answers "server overloaded" outside the worker slots,
    /// at most [`MAX_PENDING_REJECTIONS`] at a time.
    pub fn submit<C: Connection>(&self, conn: C) {
        let job = RequestJob::new(conn, self.dispatcher.clone(), self.limits());
        let Err(Saturated(job)) = self.pool.submit(job) else {
            return;
        };
        match Arc::clone(&self.rejections).try_acquire_owned() {
            Ok(permit) => {
                warn!(
                    "Worker pool saturated ({} running, {} queued); rejecting job {}",
                    self.pool.running(),
                    self.pool.queued(),
                    job.id()
                );
                self.pool.spawn_detached(async move {
                    job.reject(RpcError::server_error("server overloaded")).await;
                    drop(permit);
                });
            }
            Err(_) => {
                warn!(
                    "Worker pool saturated with {MAX_PENDING_REJECTIONS} rejections pending; closing job {}",
                    job.id()
                );
                self.pool.spawn_detached(job.close());
            }
        }
    }

    /// Rejections currently being answered.
    pub fn pending_rejections(&self) -> usize {
        MAX_PENDING_REJECTIONS - self.rejections.available_permits()
    }

    fn limits(&self) -> JobLimits {
        JobLimits {
            max_request_size: self.config.max_request_size,
            request_timeout: self.config.request_timeout,
        }
    }
}
