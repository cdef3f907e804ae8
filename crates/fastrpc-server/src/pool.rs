//! Bounded worker pool for request jobs.
//!
//! `workers` slots run jobs; admitted jobs beyond that wait in FIFO order
//! on the slot semaphore. Admission itself is capped at
//! `workers + queue_capacity`, so an overloaded server refuses new work
//! instead of queueing it without limit. `submit` never waits.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::Semaphore;
use tokio_util::task::TaskTracker;
use tracing::debug;

/// A unit of work that owns everything it touches.
pub trait PoolJob: Send + 'static {
    fn run(self) -> impl Future<Output = ()> + Send;
}

/// Returned by [`WorkerPool::submit`] when the queue is full; gives the job back.
pub struct Saturated<J>(pub J);

impl<J> Saturated<J> {
    pub fn into_inner(self) -> J {
        self.0
    }
}

impl<J> std::fmt::Debug for Saturated<J> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Saturated(..)")
    }
}

pub struct WorkerPool {
    workers: usize,
    slots: Arc<Semaphore>,
    admission: Option<Arc<Semaphore>>,
    tracker: TaskTracker,
    queued: Arc<AtomicUsize>,
    running: Arc<AtomicUsize>,
}

impl WorkerPool {
    /// `queue_capacity = None` admits without limit.
    pub fn new(workers: usize, queue_capacity: Option<usize>) -> Self {
        let workers = workers.max(1);
        Self {
            workers,
            slots: Arc::new(Semaphore::new(workers)),
            admission: queue_capacity.map(|queue| Arc::new(Semaphore::new(workers + queue))),
            tracker: TaskTracker::new(),
            queued: Arc::new(AtomicUsize::new(0)),
            running: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Start `job` on a free slot or queue it. Never blocks the caller.
    pub fn submit<J: PoolJob>(&self, job: J) -> Result<(), Saturated<J>> {
        let admitted = match &self.admission {
            Some(admission) => match Arc::clone(admission).try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => return Err(Saturated(job)),
            },
            None => None,
        };

        let slots = Arc::clone(&self.slots);
        let queued = Occupancy::enter(&self.queued);
        let running = Arc::clone(&self.running);

        self.tracker.spawn(async move {
            let _admitted = admitted;
            let Ok(_slot) = slots.acquire_owned().await else {
                debug!("Worker pool closed; dropping queued job");
                return;
            };
            drop(queued);
            let _running = Occupancy::enter(&running);
            job.run().await;
        });
        Ok(())
    }

    /// Run a future outside the worker slots (still awaited by `shutdown`).
    pub fn spawn_detached<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tracker.spawn(task);
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Jobs currently holding a slot.
    pub fn running(&self) -> usize {
        self.running.load(Ordering::Acquire)
    }

    /// Jobs admitted but waiting for a slot.
    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }

    /// Wait for every admitted job to complete. Call once the accept loop has stopped.
    pub async fn shutdown(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }
}

/// Counts a job in one pool phase for as long as it lives.
struct Occupancy(Arc<AtomicUsize>);

impl Occupancy {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(Arc::clone(counter))
    }
}

impl Drop for Occupancy {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}
