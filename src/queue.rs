//! Bounded producer/consumer work queue
//!
//! A fixed pool of long-running worker tasks pulls items off a shared `mpsc`
//! channel and runs a consumer on each. One worker gives a serial executor
//! (total FIFO order); N workers give a bounded fan-out pool.
//!
//! Failures are isolated per item: a consumer error or panic is reported
//! to the queue's [`ErrorSink`] and the worker moves on to the next item.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::{join_all, BoxFuture};
use futures_util::FutureExt;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{SendTimeoutError, TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::QueueConfig;
use crate::error::{ErrorSink, QueueError, TransportError};

/// A boxed asynchronous unit of work
pub type Job = Box<dyn FnOnce() -> BoxFuture<'static, Result<(), TransportError>> + Send>;

/// Box an async closure as a [`Job`]
pub fn job<F, Fut>(f: F) -> Job
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), TransportError>> + Send + 'static,
{
    Box::new(move || f().boxed())
}

enum Tx<T> {
    Bounded(mpsc::Sender<T>),
    Unbounded(mpsc::UnboundedSender<T>),
}

impl<T> Clone for Tx<T> {
    fn clone(&self) -> Self {
        match self {
            Tx::Bounded(tx) => Tx::Bounded(tx.clone()),
            Tx::Unbounded(tx) => Tx::Unbounded(tx.clone()),
        }
    }
}

enum Rx<T> {
    Bounded(mpsc::Receiver<T>),
    Unbounded(mpsc::UnboundedReceiver<T>),
}

impl<T> Rx<T> {
    async fn recv(&mut self) -> Option<T> {
        match self {
            Rx::Bounded(rx) => rx.recv().await,
            Rx::Unbounded(rx) => rx.recv().await,
        }
    }
}

struct Shared<T> {
    name: &'static str,
    receiver: tokio::sync::Mutex<Rx<T>>,
    pending: AtomicUsize,
    abandoned: AtomicBool,
    errors: Arc<ErrorSink>,
}

/// Producer/consumer queue with a fixed worker pool
pub struct WorkQueue<T: Send + 'static> {
    shared: Arc<Shared<T>>,
    sender: RwLock<Option<Tx<T>>>,
    closed: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
    worker_count: usize,
    capacity: Option<usize>,
    shutdown_grace: Duration,
}

impl WorkQueue<Job> {
    /// A queue whose items are [`Job`]s, each run to completion by a worker
    pub fn jobs(
        name: &'static str,
        config: QueueConfig,
        errors: Arc<ErrorSink>,
    ) -> Result<Self, TransportError> {
        Self::new(name, config, errors, |job: Job| job())
    }
}

impl<T: Send + 'static> WorkQueue<T> {
    /// Create the queue and start its workers
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new<F, Fut>(
        name: &'static str,
        config: QueueConfig,
        errors: Arc<ErrorSink>,
        consumer: F,
    ) -> Result<Self, TransportError>
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), TransportError>> + Send + 'static,
    {
        config.validate()?;

        let (tx, rx) = match config.capacity {
            Some(capacity) => {
                let (tx, rx) = mpsc::channel(capacity);
                (Tx::Bounded(tx), Rx::Bounded(rx))
            }
            None => {
                let (tx, rx) = mpsc::unbounded_channel();
                (Tx::Unbounded(tx), Rx::Unbounded(rx))
            }
        };

        let shared = Arc::new(Shared {
            name,
            receiver: tokio::sync::Mutex::new(rx),
            pending: AtomicUsize::new(0),
            abandoned: AtomicBool::new(false),
            errors,
        });

        let consumer = Arc::new(consumer);
        let workers = (0..config.workers)
            .map(|n| {
                let shared = Arc::clone(&shared);
                let consumer = Arc::clone(&consumer);
                tokio::spawn(worker_loop(n, shared, consumer))
            })
            .collect();

        debug!(queue = name, workers = config.workers, capacity = ?config.capacity, "work queue started");

        Ok(Self {
            shared,
            sender: RwLock::new(Some(tx)),
            closed: CancellationToken::new(),
            workers: Mutex::new(workers),
            worker_count: config.workers,
            capacity: config.capacity,
            shutdown_grace: config.shutdown_grace,
        })
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// `None` when unbounded
    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    /// Items not yet picked up by a worker
    ///
    /// Counts both items sitting in the queue and producers still waiting in
    /// `add` for space, so it can exceed `capacity`.
    pub fn pending_count(&self) -> usize {
        self.shared.pending.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    fn tx(&self) -> Result<Tx<T>, QueueError> {
        self.sender.read().clone().ok_or(QueueError::Closed)
    }

    /// Enqueue an item, waiting for space when the queue is full
    pub async fn add(&self, item: T) -> Result<(), QueueError> {
        let tx = self.tx()?;
        self.shared.pending.fetch_add(1, Ordering::AcqRel);
        let result = match tx {
            Tx::Bounded(tx) => tokio::select! {
                sent = tx.send(item) => sent.map_err(|_| QueueError::Closed),
                _ = self.closed.cancelled() => Err(QueueError::Closed),
            },
            Tx::Unbounded(tx) => tx.send(item).map_err(|_| QueueError::Closed),
        };
        if result.is_err() {
            self.shared.pending.fetch_sub(1, Ordering::AcqRel);
        }
        result
    }

    /// Enqueue without waiting; reports `Full` instead of blocking
    pub fn try_add(&self, item: T) -> Result<(), QueueError> {
        let tx = self.tx()?;
        self.shared.pending.fetch_add(1, Ordering::AcqRel);
        let result = match tx {
            Tx::Bounded(tx) => tx.try_send(item).map_err(|e| match e {
                TrySendError::Full(_) => QueueError::Full,
                TrySendError::Closed(_) => QueueError::Closed,
            }),
            Tx::Unbounded(tx) => tx.send(item).map_err(|_| QueueError::Closed),
        };
        if result.is_err() {
            self.shared.pending.fetch_sub(1, Ordering::AcqRel);
        }
        result
    }

    /// Enqueue, waiting at most `timeout` for space
    pub async fn try_add_timeout(&self, item: T, timeout: Duration) -> Result<(), QueueError> {
        let tx = self.tx()?;
        self.shared.pending.fetch_add(1, Ordering::AcqRel);
        let result = match tx {
            Tx::Bounded(tx) => tokio::select! {
                sent = tx.send_timeout(item, timeout) => sent.map_err(|e| match e {
                    SendTimeoutError::Timeout(_) => QueueError::Timeout,
                    SendTimeoutError::Closed(_) => QueueError::Closed,
                }),
                _ = self.closed.cancelled() => Err(QueueError::Closed),
            },
            Tx::Unbounded(tx) => tx.send(item).map_err(|_| QueueError::Closed),
        };
        if result.is_err() {
            self.shared.pending.fetch_sub(1, Ordering::AcqRel);
        }
        result
    }

    /// Stop accepting items and give workers the configured grace period to drain
    pub async fn shutdown(&self) {
        self.shutdown_within(self.shutdown_grace).await;
    }

    /// Stop accepting items and give workers `grace` to drain
    ///
    /// Workers still busy after `grace` are left to finish their current
    /// item and then stop; whatever is still queued is dropped.
    pub async fn shutdown_within(&self, grace: Duration) {
        self.closed.cancel();
        self.sender.write().take();

        let handles = std::mem::take(&mut *self.workers.lock());
        if handles.is_empty() {
            return;
        }

        if tokio::time::timeout(grace, join_all(handles)).await.is_err() {
            self.shared.abandoned.store(true, Ordering::Release);
            warn!(
                queue = self.shared.name,
                pending = self.pending_count(),
                "workers did not drain within {:?}; abandoning",
                grace
            );
        } else {
            debug!(queue = self.shared.name, "work queue drained");
        }
    }
}

impl<T: Send + 'static> Drop for WorkQueue<T> {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

async fn worker_loop<T, F, Fut>(n: usize, shared: Arc<Shared<T>>, consumer: Arc<F>)
where
    T: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), TransportError>> + Send + 'static,
{
    loop {
        let item = {
            let mut rx = shared.receiver.lock().await;
            rx.recv().await
        };
        let Some(item) = item else {
            break;
        };
        shared.pending.fetch_sub(1, Ordering::AcqRel);

        if shared.abandoned.load(Ordering::Acquire) {
            break;
        }

        let outcome = AssertUnwindSafe(async { (*consumer)(item).await })
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => shared.errors.report(e),
            Err(panic) => shared
                .errors
                .report(TransportError::WorkerPanic(panic_message(panic.as_ref()))),
        }
    }
    debug!(queue = shared.name, worker = n, "worker stopped");
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::{Barrier, Notify};

    fn sink() -> Arc<ErrorSink> {
        Arc::new(ErrorSink::new())
    }

    #[tokio::test]
    async fn test_serial_queue_preserves_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let out = Arc::clone(&seen);
        let queue = WorkQueue::new("test", QueueConfig::serial(16), sink(), move |n: u32| {
            let out = Arc::clone(&out);
            async move {
                out.lock().push(n);
                Ok(())
            }
        })
        .unwrap();

        for n in 0..10 {
            queue.add(n).await.unwrap();
        }
        queue.shutdown_within(Duration::from_secs(1)).await;

        assert_eq!(*seen.lock(), (0..10).collect::<Vec<_>>());
        assert_eq!(queue.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_failures_do_not_stop_the_worker() {
        let errors = sink();
        let reported = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&reported);
        errors.set(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let done = Arc::new(AtomicUsize::new(0));
        let finished = Arc::clone(&done);
        let queue = WorkQueue::new("test", QueueConfig::default(), errors, move |n: u32| {
            let finished = Arc::clone(&finished);
            async move {
                match n {
                    1 => Err(TransportError::NotConnected),
                    2 => panic!("boom"),
                    _ => {
                        finished.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                }
            }
        })
        .unwrap();

        for n in 0..5 {
            queue.add(n).await.unwrap();
        }
        queue.shutdown_within(Duration::from_secs(1)).await;

        assert_eq!(reported.load(Ordering::SeqCst), 2);
        assert_eq!(done.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_try_add_reports_backpressure() {
        let started = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let (s, r) = (Arc::clone(&started), Arc::clone(&release));
        let queue = WorkQueue::new("test", QueueConfig::serial(1), sink(), move |_: u32| {
            let (s, r) = (Arc::clone(&s), Arc::clone(&r));
            async move {
                s.notify_one();
                r.notified().await;
                Ok(())
            }
        })
        .unwrap();

        queue.add(1).await.unwrap();
        started.notified().await;

        assert_eq!(queue.try_add(2), Ok(()));
        assert_eq!(queue.try_add(3), Err(QueueError::Full));
        assert_eq!(
            queue.try_add_timeout(4, Duration::from_millis(20)).await,
            Err(QueueError::Timeout)
        );
        assert_eq!(queue.pending_count(), 1);

        queue.shutdown_within(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_add_after_shutdown_is_rejected() {
        let queue = WorkQueue::jobs("test", QueueConfig::default(), sink()).unwrap();
        queue.shutdown().await;

        assert!(queue.is_closed());
        assert_eq!(queue.add(job(|| async { Ok(()) })).await.err(), Some(QueueError::Closed));
        assert_eq!(queue.try_add(job(|| async { Ok(()) })).err(), Some(QueueError::Closed));
    }

    #[tokio::test]
    async fn test_blocked_add_is_released_by_shutdown() {
        let release = Arc::new(Notify::new());
        let r = Arc::clone(&release);
        let queue = Arc::new(
            WorkQueue::new("test", QueueConfig::serial(1), sink(), move |_: u32| {
                let r = Arc::clone(&r);
                async move {
                    r.notified().await;
                    Ok(())
                }
            })
            .unwrap(),
        );

        queue.add(1).await.unwrap();
        // Wait for the worker to take item 1 so item 2 fills the queue.
        while queue.pending_count() > 0 {
            tokio::task::yield_now().await;
        }
        queue.add(2).await.unwrap();

        let blocked = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.add(3).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!blocked.is_finished());
        // Item 2 in the queue plus item 3 waiting for space.
        assert_eq!(queue.pending_count(), 2);

        queue.shutdown_within(Duration::from_millis(20)).await;
        assert_eq!(blocked.await.unwrap(), Err(QueueError::Closed));
    }

    #[tokio::test]
    async fn test_workers_run_in_parallel() {
        let barrier = Arc::new(Barrier::new(4));
        let done = Arc::new(AtomicUsize::new(0));
        let (b, d) = (Arc::clone(&barrier), Arc::clone(&done));
        let config = QueueConfig {
            workers: 4,
            capacity: Some(8),
            ..QueueConfig::default()
        };
        let queue = WorkQueue::new("test", config, sink(), move |_: u32| {
            let (b, d) = (Arc::clone(&b), Arc::clone(&d));
            async move {
                // Only completes if four items are in flight at once.
                b.wait().await;
                d.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .unwrap();
        assert_eq!(queue.worker_count(), 4);
        assert_eq!(queue.capacity(), Some(8));

        for n in 0..4 {
            queue.add(n).await.unwrap();
        }
        queue.shutdown_within(Duration::from_secs(2)).await;

        assert_eq!(done.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_shutdown_drains_queued_jobs() {
        let done = Arc::new(AtomicUsize::new(0));
        let queue = WorkQueue::jobs("test", QueueConfig::serial(64), sink()).unwrap();
        for _ in 0..20 {
            let done = Arc::clone(&done);
            queue
                .add(job(move || async move {
                    tokio::task::yield_now().await;
                    done.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }))
                .await
                .unwrap();
        }
        queue.shutdown_within(Duration::from_secs(1)).await;

        assert_eq!(done.load(Ordering::SeqCst), 20);
    }
}
