//! Single-flight FIFO executor for deferred work.
//!
//! Screenshots can only be taken of the active tab of a window, so while many
//! tabs may be prepared concurrently, every capture goes through one
//! [`SequentialTaskRunner`]. Each submitted task is chained behind the previous
//! tail: it starts only after every earlier submission has finished, whatever
//! the earlier outcome was.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::oneshot;

type Chain = Shared<BoxFuture<'static, ()>>;

/// The task was dropped before it produced a value (it panicked).
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("sequential task was dropped before completing")]
pub struct TaskDropped;

/// Runs submitted futures one at a time, in submission order.
pub struct SequentialTaskRunner {
    tail: Mutex<Chain>,
    pending: Arc<AtomicUsize>,
}

impl SequentialTaskRunner {
    pub fn new() -> Self {
        Self {
            tail: Mutex::new(futures::future::ready(()).boxed().shared()),
            pending: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Queue `task` behind everything submitted so far.
    ///
    /// The position in the queue is taken when `submit` is called, not when
    /// the returned future is first polled. Only the submitter observes the
    /// task's output; a task returning an error does not affect later tasks.
    pub fn submit<F, T>(
        &self,
        task: F,
    ) -> impl Future<Output = Result<T, TaskDropped>> + Send + use<F, T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let pending = Arc::clone(&self.pending);
        pending.fetch_add(1, Ordering::SeqCst);

        let link = {
            let mut tail = self.tail.lock();
            let previous = tail.clone();
            let link = async move {
                previous.await;
                let output = task.await;
                pending.fetch_sub(1, Ordering::SeqCst);
                let _ = tx.send(output);
            }
            .boxed()
            .shared();
            *tail = link.clone();
            link
        };

        async move {
            link.await;
            rx.await.map_err(|_| TaskDropped)
        }
    }

    /// Number of submitted tasks that have not finished yet.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }
}

impl Default for SequentialTaskRunner {
    fn default() -> Self {
        Self::new()
    }
}
