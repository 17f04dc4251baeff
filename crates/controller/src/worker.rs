//! Worker pool draining the message queue.
//!
//! A configurable number of tasks pop from the shared queue and invoke the
//! registered handler synchronously. Handler errors pass through the error
//! handler rather than killing the worker.

use crate::metrics;
use crate::queue::{MsgQueue, QueuedMessage};
use futures::future::BoxFuture;
use std::sync::atomic::{AtomicBool, AtomicU64};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Handler invoked for every dequeued message. Runs on the worker task, so
/// it may await (storage retries, spawned sync) without parking a thread.
pub type MsgHandler<E> =
    Arc<dyn Fn(QueuedMessage) -> BoxFuture<'static, Result<(), E>> + Send + Sync>;

/// Invoked when the message handler fails.
pub type ErrorHandler<E> = Arc<dyn Fn(&QueuedMessage, &E) + Send + Sync>;

/// A pool of queue-consuming tasks.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `count` workers. The shared `height` and `instance_running`
    /// flag drive the queue's priorities and gating.
    pub fn spawn<E: std::fmt::Display + Send + 'static>(
        count: usize,
        queue: Arc<MsgQueue>,
        height: Arc<AtomicU64>,
        instance_running: Arc<AtomicBool>,
        handler: MsgHandler<E>,
        err_handler: ErrorHandler<E>,
        cancel: CancellationToken,
    ) -> WorkerPool {
        let count = count.max(1);
        let handles = (0..count)
            .map(|worker| {
                let queue = Arc::clone(&queue);
                let height = Arc::clone(&height);
                let instance_running = Arc::clone(&instance_running);
                let handler = Arc::clone(&handler);
                let err_handler = Arc::clone(&err_handler);
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    loop {
                        let msg = tokio::select! {
                            _ = cancel.cancelled() => break,
                            msg = queue.pop_wait(&height, &instance_running) => msg,
                        };
                        if let Err(err) = handler(msg.clone()).await {
                            err_handler(&msg, &err);
                        }
                        metrics::record_processed();
                    }
                    debug!(worker, "worker stopped");
                })
            })
            .collect();
        WorkerPool { handles }
    }

    /// Abort all workers. Used on `Close()` after cancellation.
    pub fn abort(&mut self) {
        for handle in self.handles.drain(..) {
            handle.abort();
        }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.abort();
    }
}
