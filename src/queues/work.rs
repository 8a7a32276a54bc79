//! The bounded pool that runs a worker's tasks.
//!
//! [`super::worker::Worker`] pops `(Lane, Task)` pairs from the shared
//! [`super::TaskQueue`] and hands each one to a [`WorkQueue`] whose work
//! function is `TaskRunner::run`. At most `concurrency` tasks run at once.
//! When all slots are busy, `submit_input` waits, so the worker stops popping
//! and leaves the rest of the backlog in the shared queue where other
//! workers can take it.
//!
//! Lane priority is decided by the shared queue before a task gets here.
//! Each submitted task gets a one-shot channel for its [`super::worker::TaskReport`].

use std::sync::Arc;

use futures::{
    SinkExt as _, StreamExt,
    channel::{mpsc, oneshot},
};

use crate::{
    async_utils::{BoxedFuture, JoinWorker},
    prelude::*,
};

/// Work items are processed by [`WorkItemProcessor`]s. They contain an input,
/// and a one-shot channel on which to return the result.
#[derive(Debug)]
pub struct WorkItem<Input, Output>
where
    Input: 'static,
    Output: 'static,
{
    /// The input to the work item.
    pub input: Input,

    /// The one-shot channel on which to return the result.
    pub tx: oneshot::Sender<Result<Output>>,
}

/// API shared by workers.
///
/// This is fairly bare bones; you'll probably want to use [`WorkQueue`] and
/// [`WorkQueueHandle`] in normal usage.
pub trait WorkItemProcessor {
    type Input: 'static;
    type Output: 'static;

    /// Process a work item. The result will be sent to `item.tx`.
    ///
    /// This should normally only block if our processing capacity has been
    /// maxed out.
    async fn submit_work_item(&self, item: WorkItem<Self::Input, Self::Output>) -> Result<()>;

    /// Process an input and return a channel that will receive the output.
    ///
    /// This should normally only block if our processing capacity has been
    /// maxed out.
    async fn submit_input(
        &self,
        input: Self::Input,
    ) -> Result<oneshot::Receiver<Result<Self::Output>>> {
        let (tx, rx) = oneshot::channel();
        let item = WorkItem { input, tx };
        self.submit_work_item(item).await?;
        Ok(rx)
    }

    /// Process an input and wait for the output.
    #[allow(dead_code)]
    async fn process_blocking(&self, input: Self::Input) -> Result<Self::Output> {
        let rx = self.submit_input(input).await?;
        rx.await.context("failed to receive work item result")?
    }
}

/// An async work function.
pub type WorkFn<Input, Output> =
    Arc<dyn Fn(Input) -> BoxedFuture<Result<Output>> + Send + Sync + 'static>;

/// A handle to a [`WorkQueue`].
///
/// This is basically just a wrapper around a [`mpsc::Sender`] that implements
/// [`WorkItemProcessor`]. It can be cloned cheaply and passed around.
pub struct WorkQueueHandle<Input, Output>
where
    Input: 'static,
    Output: 'static,
{
    /// Our sender.
    tx: mpsc::Sender<WorkItem<Input, Output>>,
}

// Override `Clone` so that `Input` and `Output` are not required to be `Clone`.
impl<Input, Output> Clone for WorkQueueHandle<Input, Output> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<Input, Output> WorkItemProcessor for WorkQueueHandle<Input, Output>
where
    Input: 'static,
    Output: 'static,
{
    type Input = Input;
    type Output = Output;

    async fn submit_work_item(&self, item: WorkItem<Self::Input, Self::Output>) -> Result<()> {
        // We need a mutable copy of `tx` to send the item, so we clone it here.
        let mut tx = self.tx.clone();
        tx.send(item).await.context("failed to send work item")?;
        Ok(())
    }
}

/// A [`WorkItemProcessor`] that maintains a queue of work items and processes
/// them in parallel.
///
/// We maintain backpressure by limiting the number of work items queued, and
/// the number currently being processed.
pub struct WorkQueue<Input, Output>
where
    Input: 'static,
    Output: 'static,
{
    /// Queue for submitting work items.
    tx: mpsc::Sender<WorkItem<Input, Output>>,
}

impl<Input, Output> WorkQueue<Input, Output>
where
    Input: Send + 'static,
    Output: Send + 'static,
{
    /// Create a new work queue with the given concurrency limit.
    ///
    /// Note that up to `concurrency_limit` work may be waiting at any one
    /// time, and another `concurrency_limit` work items may be in progress.
    /// The worker finishes once every handle and the queue itself have been
    /// dropped and the last item is done.
    pub fn new(
        concurrency_limit: usize,
        work_fn: WorkFn<Input, Output>,
    ) -> (Self, JoinWorker) {
        let (tx, rx) = mpsc::channel(concurrency_limit);
        let worker = tokio::spawn(async move {
            rx.for_each_concurrent(concurrency_limit, |item: WorkItem<Input, Output>| {
                let work_fn = work_fn.clone();
                async move {
                    let result = work_fn(item.input).await;
                    if let Err(_sent_value) = item.tx.send(result) {
                        debug!("failed to send work item result because receiver was dropped");
                    }
                }
            })
            .await;
            Ok(())
        });
        (Self { tx }, JoinWorker::from_handle(worker))
    }

    /// Get a handle for submitting items to the work queue.
    pub fn handle(&self) -> WorkQueueHandle<Input, Output> {
        WorkQueueHandle {
            tx: self.tx.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures::FutureExt as _;

    use super::*;

    #[tokio::test]
    async fn test_concurrency_is_limited() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let work_fn: WorkFn<u32, u32> = {
            let (running, peak) = (running.clone(), peak.clone());
            Arc::new(move |n| {
                let (running, peak) = (running.clone(), peak.clone());
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(n * 2)
                }
                .boxed()
            })
        };
        let (queue, worker) = WorkQueue::new(2, work_fn);
        let handle = queue.handle();
        let receivers = futures::future::try_join_all((0..8).map(|n| handle.submit_input(n)))
            .await
            .unwrap();
        let mut outputs = vec![];
        for rx in receivers {
            outputs.push(rx.await.unwrap().unwrap());
        }
        assert_eq!(outputs, (0..8).map(|n| n * 2).collect::<Vec<_>>());
        assert!(peak.load(Ordering::SeqCst) <= 2);

        drop(handle);
        drop(queue);
        worker.join().await.unwrap();
    }

    #[tokio::test]
    async fn test_errors_come_back_to_the_caller() {
        let work_fn: WorkFn<(), ()> = Arc::new(|()| async { Err(anyhow!("nope")) }.boxed());
        let (queue, _worker) = WorkQueue::new(1, work_fn);
        let err = queue.handle().process_blocking(()).await.unwrap_err();
        assert_eq!(err.to_string(), "nope");
    }
}
