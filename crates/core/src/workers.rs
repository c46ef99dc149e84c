//! Bounded worker pool.
//!
//! A fixed number of worker tasks pull jobs from a shared queue. Admission is
//! bounded by a semaphore sized `workers + queue_limit`: a submission either
//! takes a slot immediately or fails with `PoolSaturated`, so the queue can
//! never grow without bound.
//!
//! Each job runs in its own spawned task, which keeps a panic or an error
//! confined to that job's [`TaskHandle`].

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError, mpsc, oneshot, watch};
use tokio::task::{AbortHandle, JoinError, JoinHandle};

use crate::Error;

/// Worker pool sizing and shutdown behaviour.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of tasks executing concurrently.
    pub workers: usize,
    /// Submissions allowed to wait while every worker is busy.
    pub queue_limit: usize,
    /// How long in-flight tasks may keep running once shutdown starts.
    pub shutdown_grace: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self { workers: 4, queue_limit: 64, shutdown_grace: Duration::from_secs(5) }
    }
}

/// Snapshot of pool activity.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct WorkerPoolStats {
    pub workers: usize,
    pub queue_limit: usize,
    pub queued: usize,
    pub running: usize,
    pub completed: u64,
    pub failed: u64,
    pub rejected: u64,
    pub cancelled: u64,
    pub accepting: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Completed,
    Failed,
    Cancelled,
}

type Finish = Pin<Box<dyn Future<Output = Outcome> + Send + 'static>>;

/// Type-erased unit of work held in the queue.
trait Job: Send {
    /// Spawn the task body. The returned future resolves once the result has been
    /// delivered to the handle.
    fn start(self: Box<Self>) -> (AbortHandle, Finish);

    /// Deliver a cancellation to the handle without running the task.
    fn cancel(self: Box<Self>, reason: &str);
}

struct TaskJob<F, T> {
    future: F,
    tx: oneshot::Sender<Result<T, Error>>,
}

impl<F, T> Job for TaskJob<F, T>
where
    F: Future<Output = Result<T, Error>> + Send + 'static,
    T: Send + 'static,
{
    fn start(self: Box<Self>) -> (AbortHandle, Finish) {
        let TaskJob { future, tx } = *self;
        let task = tokio::spawn(future);
        let abort = task.abort_handle();

        let finish = Box::pin(async move {
            let result = match task.await {
                Ok(result) => result,
                Err(err) if err.is_panic() => Err(Error::TaskFailed(panic_message(err))),
                Err(_) => Err(Error::Cancelled("task aborted after the shutdown grace period".into())),
            };
            let outcome = match &result {
                Ok(_) => Outcome::Completed,
                Err(Error::Cancelled(_)) => Outcome::Cancelled,
                Err(_) => Outcome::Failed,
            };
            let _ = tx.send(result);
            outcome
        });

        (abort, finish)
    }

    fn cancel(self: Box<Self>, reason: &str) {
        let _ = self.tx.send(Err(Error::Cancelled(reason.to_string())));
    }
}

fn panic_message(err: JoinError) -> String {
    let payload = err.into_panic();
    if let Some(msg) = payload.downcast_ref::<&str>() {
        format!("task panicked: {msg}")
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        format!("task panicked: {msg}")
    } else {
        "task panicked".to_string()
    }
}

struct Queued {
    id: u64,
    job: Box<dyn Job>,
    permit: OwnedSemaphorePermit,
}

struct Shared {
    queue: tokio::sync::Mutex<mpsc::UnboundedReceiver<Queued>>,
    slots: Arc<Semaphore>,
    in_flight: Mutex<HashMap<u64, AbortHandle>>,
    accepting: AtomicBool,
    queued: AtomicUsize,
    running: AtomicUsize,
    completed: AtomicU64,
    failed: AtomicU64,
    rejected: AtomicU64,
    cancelled: AtomicU64,
}

/// Handle to a submitted task's eventual result.
#[derive(Debug)]
pub struct TaskHandle<T> {
    id: u64,
    rx: oneshot::Receiver<Result<T, Error>>,
}

impl<T> TaskHandle<T> {
    /// Pool-unique task id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the task's result.
    ///
    /// A task that never ran because the pool went away resolves to `Cancelled`.
    pub async fn join(self) -> Result<T, Error> {
        self.rx
            .await
            .unwrap_or_else(|_| Err(Error::Cancelled("worker pool dropped before the task finished".into())))
    }

    /// Wait for the task's result for at most `timeout`.
    ///
    /// On timeout the task keeps running but its result is discarded.
    pub async fn join_timeout(self, timeout: Duration) -> Result<T, Error> {
        let id = self.id;
        tokio::time::timeout(timeout, self.join())
            .await
            .map_err(|_| Error::Timeout(format!("task {id} did not finish within {timeout:?}")))?
    }
}

/// Fixed-size pool of async workers with a bounded queue.
pub struct WorkerPool {
    shared: Arc<Shared>,
    sender: mpsc::UnboundedSender<Queued>,
    stop: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    next_id: AtomicU64,
    config: WorkerPoolConfig,
}

impl WorkerPool {
    /// Spawn the workers. Must be called inside a tokio runtime.
    pub fn new(config: WorkerPoolConfig) -> Self {
        let workers = config.workers.max(1);
        let (sender, receiver) = mpsc::unbounded_channel();
        let (stop, _) = watch::channel(false);

        let shared = Arc::new(Shared {
            queue: tokio::sync::Mutex::new(receiver),
            slots: Arc::new(Semaphore::new(workers + config.queue_limit)),
            in_flight: Mutex::new(HashMap::new()),
            accepting: AtomicBool::new(true),
            queued: AtomicUsize::new(0),
            running: AtomicUsize::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            cancelled: AtomicU64::new(0),
        });

        let handles = (0..workers)
            .map(|index| tokio::spawn(run_worker(index, shared.clone(), stop.subscribe())))
            .collect();

        tracing::debug!(workers, queue_limit = config.queue_limit, "worker pool started");

        Self { shared, sender, stop, handles: Mutex::new(handles), next_id: AtomicU64::new(1), config }
    }

    /// Maximum number of outstanding (running plus queued) tasks.
    pub fn capacity(&self) -> usize {
        self.config.workers.max(1) + self.config.queue_limit
    }

    /// Submit a task.
    ///
    /// # Errors
    ///
    /// - `PoolSaturated` if `workers + queue_limit` tasks are already outstanding
    /// - `PoolClosed` once shutdown has started
    pub fn submit<F, T>(&self, future: F) -> Result<TaskHandle<T>, Error>
    where
        F: Future<Output = Result<T, Error>> + Send + 'static,
        T: Send + 'static,
    {
        if !self.shared.accepting.load(Ordering::Acquire) {
            return Err(Error::PoolClosed);
        }

        let permit = match self.shared.slots.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::NoPermits) => {
                self.shared.rejected.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(capacity = self.capacity(), "worker pool saturated; rejecting task");
                return Err(Error::PoolSaturated { capacity: self.capacity() });
            }
            Err(TryAcquireError::Closed) => return Err(Error::PoolClosed),
        };

        let (tx, rx) = oneshot::channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let item = Queued { id, job: Box::new(TaskJob { future, tx }), permit };

        self.shared.queued.fetch_add(1, Ordering::AcqRel);
        if self.sender.send(item).is_err() {
            self.shared.queued.fetch_sub(1, Ordering::AcqRel);
            return Err(Error::PoolClosed);
        }

        Ok(TaskHandle { id, rx })
    }

    /// Stop accepting work, cancel queued tasks and give in-flight tasks the
    /// configured grace period before aborting them.
    pub async fn shutdown(&self) {
        self.shared.accepting.store(false, Ordering::Release);
        self.shared.slots.close();
        self.stop.send_replace(true);

        let mut cancelled = 0usize;
        {
            let mut queue = self.shared.queue.lock().await;
            queue.close();
            while let Ok(item) = queue.try_recv() {
                self.shared.queued.fetch_sub(1, Ordering::AcqRel);
                self.shared.cancelled.fetch_add(1, Ordering::Relaxed);
                item.job.cancel("worker pool shut down before the task started");
                cancelled += 1;
            }
        }

        let handles = std::mem::take(&mut *self.handles.lock().unwrap_or_else(|e| e.into_inner()));
        let deadline = tokio::time::Instant::now() + self.config.shutdown_grace;
        let mut pending = Vec::new();
        for mut handle in handles {
            if tokio::time::timeout_at(deadline, &mut handle).await.is_err() {
                pending.push(handle);
            }
        }

        if !pending.is_empty() {
            let in_flight = self.shared.in_flight.lock().unwrap_or_else(|e| e.into_inner());
            tracing::warn!(aborted = in_flight.len(), "shutdown grace period elapsed; aborting in-flight tasks");
            for abort in in_flight.values() {
                abort.abort();
            }
            drop(in_flight);
            for handle in pending {
                let _ = handle.await;
            }
        }

        tracing::debug!(cancelled, "worker pool shut down");
    }

    pub fn stats(&self) -> WorkerPoolStats {
        let shared = &self.shared;
        WorkerPoolStats {
            workers: self.config.workers.max(1),
            queue_limit: self.config.queue_limit,
            queued: shared.queued.load(Ordering::Acquire),
            running: shared.running.load(Ordering::Acquire),
            completed: shared.completed.load(Ordering::Relaxed),
            failed: shared.failed.load(Ordering::Relaxed),
            rejected: shared.rejected.load(Ordering::Relaxed),
            cancelled: shared.cancelled.load(Ordering::Relaxed),
            accepting: shared.accepting.load(Ordering::Acquire),
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Aborting the workers drops every queued and in-flight result sender,
        // which resolves the matching handles to `Cancelled`.
        self.shared.accepting.store(false, Ordering::Release);
        self.shared.slots.close();
        self.stop.send_replace(true);

        for handle in self.handles.get_mut().unwrap_or_else(|e| e.into_inner()).iter() {
            handle.abort();
        }
        for abort in self.shared.in_flight.lock().unwrap_or_else(|e| e.into_inner()).values() {
            abort.abort();
        }
    }
}

async fn run_worker(index: usize, shared: Arc<Shared>, mut stop: watch::Receiver<bool>) {
    loop {
        let next = tokio::select! {
            biased;
            _ = stop.wait_for(|stopped| *stopped) => None,
            item = async { shared.queue.lock().await.recv().await } => item,
        };
        let Some(item) = next else { break };

        shared.queued.fetch_sub(1, Ordering::AcqRel);
        shared.running.fetch_add(1, Ordering::AcqRel);

        let Queued { id, job, permit } = item;
        let (abort, finish) = job.start();
        shared.in_flight.lock().unwrap_or_else(|e| e.into_inner()).insert(id, abort);

        let outcome = finish.await;

        shared.in_flight.lock().unwrap_or_else(|e| e.into_inner()).remove(&id);
        shared.running.fetch_sub(1, Ordering::AcqRel);
        drop(permit);

        match outcome {
            Outcome::Completed => shared.completed.fetch_add(1, Ordering::Relaxed),
            Outcome::Failed => shared.failed.fetch_add(1, Ordering::Relaxed),
            Outcome::Cancelled => shared.cancelled.fetch_add(1, Ordering::Relaxed),
        };
    }

    tracing::debug!(worker = index, "worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(workers: usize, queue_limit: usize, grace_ms: u64) -> WorkerPool {
        WorkerPool::new(WorkerPoolConfig { workers, queue_limit, shutdown_grace: Duration::from_millis(grace_ms) })
    }

    #[tokio::test]
    async fn test_submit_and_join() {
        let pool = pool(2, 4, 1000);
        let handle = pool.submit(async { Ok::<_, Error>(21 * 2) }).unwrap();
        assert_eq!(handle.join().await.unwrap(), 42);

        let stats = pool.stats();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.running, 0);
    }

    #[tokio::test]
    async fn test_failures_are_isolated() {
        let pool = pool(2, 4, 1000);

        let failing = pool.submit(async { Err::<u32, _>(Error::ParseError("bad html".into())) }).unwrap();
        let panicking = pool
            .submit(async {
                if true {
                    panic!("boom");
                }
                Ok::<u32, Error>(0)
            })
            .unwrap();
        let fine = pool.submit(async { Ok::<_, Error>(7u32) }).unwrap();

        assert!(matches!(failing.join().await, Err(Error::ParseError(_))));
        match panicking.join().await {
            Err(Error::TaskFailed(msg)) => assert!(msg.contains("boom")),
            other => panic!("expected TaskFailed, got {other:?}"),
        }
        assert_eq!(fine.join().await.unwrap(), 7);

        let after = pool.submit(async { Ok::<_, Error>("still alive") }).unwrap();
        assert_eq!(after.join().await.unwrap(), "still alive");
        assert_eq!(pool.stats().failed, 2);
    }

    #[tokio::test]
    async fn test_saturated_pool_rejects_and_queued_tasks_complete() {
        let workers = 2;
        let queue_limit = 3;
        let pool = pool(workers, queue_limit, 1000);
        let gate = Arc::new(Semaphore::new(0));

        let mut handles = Vec::new();
        for i in 0..workers + queue_limit {
            let gate = gate.clone();
            let handle = pool
                .submit(async move {
                    let _open = gate.acquire().await.map_err(|_| Error::Cancelled("gate closed".into()))?;
                    Ok::<_, Error>(i)
                })
                .unwrap();
            handles.push(handle);
        }

        let overflow = pool.submit(async { Ok::<_, Error>(usize::MAX) });
        assert!(matches!(overflow, Err(Error::PoolSaturated { capacity: 5 })));
        assert_eq!(pool.stats().rejected, 1);

        gate.add_permits(workers + queue_limit);
        for (i, handle) in handles.into_iter().enumerate() {
            assert_eq!(handle.join().await.unwrap(), i);
        }
    }

    #[tokio::test]
    async fn test_shutdown_cancels_queued_and_aborts_stuck_tasks() {
        let pool = pool(1, 2, 50);
        let (started_tx, started_rx) = oneshot::channel();

        let stuck = pool
            .submit(async move {
                let _ = started_tx.send(());
                std::future::pending::<()>().await;
                Ok::<_, Error>(())
            })
            .unwrap();
        started_rx.await.unwrap();

        let queued_a = pool.submit(async { Ok::<_, Error>(()) }).unwrap();
        let queued_b = pool.submit(async { Ok::<_, Error>(()) }).unwrap();

        pool.shutdown().await;

        assert!(matches!(queued_a.join().await, Err(Error::Cancelled(_))));
        assert!(matches!(queued_b.join().await, Err(Error::Cancelled(_))));
        assert!(matches!(stuck.join().await, Err(Error::Cancelled(_))));
        assert!(matches!(pool.submit(async { Ok::<_, Error>(()) }), Err(Error::PoolClosed)));
        assert_eq!(pool.stats().cancelled, 3);
    }

    #[tokio::test]
    async fn test_shutdown_lets_in_flight_tasks_finish_within_grace() {
        let pool = pool(1, 1, 2000);
        let (started_tx, started_rx) = oneshot::channel();

        let slow = pool
            .submit(async move {
                let _ = started_tx.send(());
                tokio::time::sleep(Duration::from_millis(30)).await;
                Ok::<_, Error>("done")
            })
            .unwrap();
        started_rx.await.unwrap();

        pool.shutdown().await;
        assert_eq!(slow.join().await.unwrap(), "done");
    }

    #[tokio::test]
    async fn test_join_timeout() {
        let pool = pool(1, 1, 10);
        let handle = pool
            .submit(async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok::<_, Error>(())
            })
            .unwrap();

        let result = handle.join_timeout(Duration::from_millis(20)).await;
        assert!(matches!(result, Err(Error::Timeout(_))));
    }

    #[tokio::test]
    async fn test_dropping_pool_cancels_pending_handles() {
        let pool = pool(1, 4, 10);
        let (started_tx, started_rx) = oneshot::channel();
        let stuck = pool
            .submit(async move {
                let _ = started_tx.send(());
                std::future::pending::<()>().await;
                Ok::<_, Error>(())
            })
            .unwrap();
        started_rx.await.unwrap();
        let queued = pool.submit(async { Ok::<_, Error>(()) }).unwrap();

        drop(pool);

        let stuck = stuck.join_timeout(Duration::from_secs(1)).await;
        let queued = queued.join_timeout(Duration::from_secs(1)).await;
        assert!(matches!(stuck, Err(Error::Cancelled(_))), "got {stuck:?}");
        assert!(matches!(queued, Err(Error::Cancelled(_))), "got {queued:?}");
    }
}
