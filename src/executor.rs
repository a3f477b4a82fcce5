//! Background execution.
//!
//! Two kinds of work run on an [`Executor`]: one-shot background work (the handshake) and
//! periodic items (socket drivers, pool eviction). Both are tokio tasks on the executor's
//! runtime handle and both hang off a root [`CancellationToken`], so [`Executor::terminate`]
//! stops everything that is still in flight.
use std::future::Future;

use futures::future::BoxFuture;
use tokio::{runtime::Handle, task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;

/// Work that runs repeatedly on an [`Executor`].
///
/// The executor sleeps until [`execution_time`](PeriodicItem::execution_time), runs
/// [`execute`](PeriodicItem::execute) and asks again. Removal only takes effect between two
/// executions: a running `execute` is never interrupted. Once the item is removed (or reports
/// [`is_finished`](PeriodicItem::is_finished)) [`finish`](PeriodicItem::finish) runs exactly once.
pub trait PeriodicItem: Send + 'static {
    /// When the next execution is due.
    fn execution_time(&self) -> Instant;

    fn execute(&mut self, now: Instant) -> BoxFuture<'_, ()>;

    /// Stops scheduling without an explicit removal.
    fn is_finished(&self) -> bool {
        false
    }

    /// Cleanup after the last execution.
    fn finish(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async {})
    }
}

/// Spawner for background work and periodic items.
#[derive(Clone, Debug)]
pub struct Executor {
    handle: Handle,
    root: CancellationToken,
}

impl Executor {
    pub fn new(handle: Handle) -> Self {
        Self {
            handle,
            root: CancellationToken::new(),
        }
    }

    /// Executor on the runtime of the calling task.
    ///
    /// # Panics
    /// Panics when called outside of a tokio runtime.
    pub fn current() -> Self {
        Self::new(Handle::current())
    }

    /// A fresh token that is cancelled together with the executor.
    pub fn cancel_token(&self) -> CancellationToken {
        self.root.child_token()
    }

    /// Runs `work` in the background. The task resolves to `None` if `cancel` (or the executor)
    /// is cancelled first.
    pub fn schedule_work<F>(&self, cancel: &CancellationToken, work: F) -> JoinHandle<Option<F::Output>>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let cancel = cancel.clone();
        let root = self.root.clone();

        self.handle.spawn(async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                _ = root.cancelled() => None,
                output = work => Some(output),
            }
        })
    }

    /// Starts running `item` until the returned handle is removed or dropped.
    pub fn add_periodic<P: PeriodicItem>(&self, item: P) -> PeriodicHandle {
        let token = self.cancel_token();
        let task = self.handle.spawn(run_periodic(item, token.clone()));

        PeriodicHandle {
            token,
            task: Some(task),
        }
    }

    /// Cancels all background work and periodic items, present and future.
    pub fn terminate(&self) {
        log::debug!("executor terminated");
        self.root.cancel();
    }

    pub fn is_terminated(&self) -> bool {
        self.root.is_cancelled()
    }
}

async fn run_periodic<P: PeriodicItem>(mut item: P, token: CancellationToken) {
    while !item.is_finished() {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = tokio::time::sleep_until(item.execution_time()) => {}
        }
        item.execute(Instant::now()).await;
    }

    item.finish().await;
}

/// Registration of a periodic item. Dropping it removes the item.
#[derive(Debug)]
pub struct PeriodicHandle {
    token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl PeriodicHandle {
    /// Unregisters the item. The returned task completes after its `finish` ran.
    pub fn remove(mut self) -> Option<JoinHandle<()>> {
        self.token.cancel();
        self.task.take()
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, JoinHandle::is_finished)
    }
}

impl Drop for PeriodicHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        time::Duration,
    };

    struct Counter {
        next: Instant,
        interval: Duration,
        limit: Option<usize>,
        executions: Arc<AtomicUsize>,
        finished: Arc<AtomicUsize>,
    }

    impl Counter {
        fn new(interval: Duration) -> (Self, Arc<AtomicUsize>, Arc<AtomicUsize>) {
            let executions = Arc::new(AtomicUsize::new(0));
            let finished = Arc::new(AtomicUsize::new(0));
            let counter = Counter {
                next: Instant::now(),
                interval,
                limit: None,
                executions: executions.clone(),
                finished: finished.clone(),
            };
            (counter, executions, finished)
        }
    }

    impl PeriodicItem for Counter {
        fn execution_time(&self) -> Instant {
            self.next
        }

        fn execute(&mut self, now: Instant) -> BoxFuture<'_, ()> {
            Box::pin(async move {
                self.executions.fetch_add(1, Ordering::SeqCst);
                self.next = now + self.interval;
            })
        }

        fn is_finished(&self) -> bool {
            self.limit
                .is_some_and(|limit| self.executions.load(Ordering::SeqCst) >= limit)
        }

        fn finish(&mut self) -> BoxFuture<'_, ()> {
            Box::pin(async move {
                self.finished.fetch_add(1, Ordering::SeqCst);
            })
        }
    }

    #[tokio::test]
    async fn test_periodic_runs_until_removed() {
        let executor = Executor::current();
        let (counter, executions, finished) = Counter::new(Duration::from_millis(10));

        let handle = executor.add_periodic(counter);
        tokio::time::sleep(Duration::from_millis(100)).await;

        let task = handle.remove().unwrap();
        task.await.unwrap();

        let count = executions.load(Ordering::SeqCst);
        assert!(count >= 2, "only {count} executions");
        assert_eq!(finished.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(executions.load(Ordering::SeqCst), count);
    }

    #[tokio::test]
    async fn test_periodic_stops_when_finished() {
        let executor = Executor::current();
        let (mut counter, executions, finished) = Counter::new(Duration::from_millis(1));
        counter.limit = Some(3);

        let handle = executor.add_periodic(counter);
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(handle.is_finished());
        assert_eq!(executions.load(Ordering::SeqCst), 3);
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_terminate_cancels_everything() {
        let executor = Executor::current();
        let (counter, _executions, finished) = Counter::new(Duration::from_millis(10));
        let periodic = executor.add_periodic(counter);

        let token = executor.cancel_token();
        let work = executor.schedule_work(&token, async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            42
        });

        executor.terminate();
        assert!(executor.is_terminated());
        assert!(token.is_cancelled());
        assert_eq!(work.await.unwrap(), None);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(periodic.is_finished());
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_schedule_work_completes() {
        let executor = Executor::current();
        let token = executor.cancel_token();
        let work = executor.schedule_work(&token, async { 7 });
        assert_eq!(work.await.unwrap(), Some(7));

        let token = executor.cancel_token();
        token.cancel();
        let work = executor.schedule_work(&token, async { 7 });
        assert_eq!(work.await.unwrap(), None);
    }
}
