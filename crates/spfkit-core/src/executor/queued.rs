//! Lookups drained from a shared queue by a fixed worker pool

use super::machine::{self, Progress};
use super::SpfExecutor;
use crate::checker::{DnsLookupContinuation, EvalContext};
use crate::dns;
use crate::error::SpfError;
use crate::session::SpfSession;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// A suspended session waiting for a worker
struct Job {
    session: SpfSession,
    ctx: Arc<EvalContext>,
    continuation: DnsLookupContinuation,
    done: oneshot::Sender<SpfSession>,
}

type JobQueue = Arc<Mutex<mpsc::UnboundedReceiver<Job>>>;

/// Worker pool executor
///
/// Submitting a session waits for one of `max_outstanding` permits, so
/// producers slow down when the pool is saturated. Workers put follow-up
/// lookups back on the unbounded queue and never block on it.
pub struct QueuedExecutor {
    queue: mpsc::UnboundedSender<Job>,
    permits: Arc<Semaphore>,
    workers: Vec<JoinHandle<()>>,
}

impl QueuedExecutor {
    /// Spawn `workers` worker tasks on the current runtime
    pub fn start(workers: usize, max_outstanding: usize) -> Self {
        let (queue, receiver) = mpsc::unbounded_channel();
        let receiver: JobQueue = Arc::new(Mutex::new(receiver));
        let workers = workers.max(1);

        let handles = (0..workers)
            .map(|id| tokio::spawn(worker(id, receiver.clone(), queue.clone())))
            .collect();

        info!(
            "SPF lookup workers started (workers: {}, max outstanding: {})",
            workers, max_outstanding
        );

        Self {
            queue,
            permits: Arc::new(Semaphore::new(max_outstanding.max(1))),
            workers: handles,
        }
    }

    /// Sessions that can be submitted without waiting
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }
}

impl Drop for QueuedExecutor {
    fn drop(&mut self) {
        for handle in &self.workers {
            handle.abort();
        }
    }
}

async fn worker(id: usize, jobs: JobQueue, queue: mpsc::UnboundedSender<Job>) {
    loop {
        let job = jobs.lock().await.recv().await;
        let Some(Job {
            mut session,
            ctx,
            continuation,
            done,
        }) = job
        else {
            break;
        };

        debug!("Worker {} looking up {}", id, continuation.request);
        let response = dns::lookup(ctx.dns(), &continuation.request, ctx.timeout()).await;

        match machine::resume(&mut session, &ctx, continuation, response) {
            Progress::Done => {
                let _ = done.send(session);
            }
            Progress::Suspended(next) => {
                let job = Job {
                    session,
                    ctx,
                    continuation: next,
                    done,
                };
                if queue.send(job).is_err() {
                    warn!("Worker {} could not requeue a lookup", id);
                }
            }
        }
    }
    debug!("Worker {} stopped", id);
}

#[async_trait]
impl SpfExecutor for QueuedExecutor {
    async fn execute(
        &self,
        mut session: SpfSession,
        ctx: Arc<EvalContext>,
    ) -> Result<SpfSession, SpfError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| SpfError::temp("Executor is shut down"))?;

        let continuation = match machine::start(&mut session, &ctx) {
            Progress::Done => return Ok(session),
            Progress::Suspended(continuation) => continuation,
        };

        let (done, finished) = oneshot::channel();
        self.queue
            .send(Job {
                session,
                ctx,
                continuation,
                done,
            })
            .map_err(|_| SpfError::temp("Lookup queue is closed"))?;

        finished
            .await
            .map_err(|_| SpfError::temp("Lookup worker dropped the evaluation"))
    }
}
