//! Request queue: bounded FIFO in front of the worker set.
//!
//! One dispatcher task, regardless of worker count. Idle workers live in a
//! channel of owned worker values; an assignment takes a worker out,
//! evaluates, and puts it back, so a worker can never run two evaluations
//! at once. The dispatcher pops the oldest pending task, then waits for a
//! worker, which makes dispatch order exactly submission order.
//!
//! A task counts as dispatched only once a worker is in hand; a ticket
//! dropped any time before that — still buffered, or popped and waiting
//! for a worker — is discarded without consuming worker time. After
//! dispatch the evaluation runs to completion and its result is dropped,
//! preserving engine protocol state.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use log::{debug, info};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::{EvalTask, Evaluation};
use crate::error::Error;

/// The evaluation side of a worker, as the dispatcher sees it.
///
/// `EngineWorker` is the production implementation; tests drive the queue
/// with scripted backends.
#[async_trait]
pub trait EvalBackend: Send {
    async fn evaluate(&mut self, task: &EvalTask) -> Result<Evaluation, Error>;
    async fn shutdown(&mut self);
    fn id(&self) -> usize;
}

/// Snapshot of queue counters.
#[derive(Debug, Clone, Serialize)]
pub struct QueueMetrics {
    pub enqueued_total: u64,
    pub completed_total: u64,
    pub failed_total: u64,
    pub current_depth: usize,
    pub max_observed_depth: usize,
    pub avg_wait_ms: u64,
}

#[derive(Debug, Default)]
struct MetricsInner {
    enqueued: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    depth: AtomicUsize,
    max_depth: AtomicUsize,
    total_wait_ms: AtomicU64,
    dispatched: AtomicU64,
}

impl MetricsInner {
    fn snapshot(&self) -> QueueMetrics {
        let dispatched = self.dispatched.load(Ordering::Relaxed);
        let total_wait = self.total_wait_ms.load(Ordering::Relaxed);
        QueueMetrics {
            enqueued_total: self.enqueued.load(Ordering::Relaxed),
            completed_total: self.completed.load(Ordering::Relaxed),
            failed_total: self.failed.load(Ordering::Relaxed),
            current_depth: self.depth.load(Ordering::Relaxed),
            max_observed_depth: self.max_depth.load(Ordering::Relaxed),
            avg_wait_ms: if dispatched == 0 { 0 } else { total_wait / dispatched },
        }
    }
}

struct QueuedTask {
    task: EvalTask,
    reply: oneshot::Sender<Result<Evaluation, Error>>,
    submitted: Instant,
}

/// Resolves to the evaluation result; drop it to abandon the task.
pub type EvalTicket = oneshot::Receiver<Result<Evaluation, Error>>;

/// Bounded FIFO queue plus its dispatcher task.
pub struct RequestQueue {
    task_tx: std::sync::Mutex<Option<mpsc::Sender<QueuedTask>>>,
    metrics: Arc<MetricsInner>,
    dispatcher: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl RequestQueue {
    /// Start the dispatcher over the given workers.
    pub fn start(workers: Vec<Box<dyn EvalBackend>>, capacity: usize) -> Self {
        let worker_count = workers.len();
        let (task_tx, task_rx) = mpsc::channel(capacity.max(1));
        let (idle_tx, idle_rx) = mpsc::channel(worker_count.max(1));
        for worker in workers {
            // Capacity equals the worker count, so this cannot fail.
            let _ = idle_tx.try_send(worker);
        }

        let metrics = Arc::new(MetricsInner::default());
        let dispatcher = tokio::spawn(dispatch_loop(
            task_rx,
            idle_rx,
            idle_tx,
            worker_count,
            Arc::clone(&metrics),
        ));

        Self {
            task_tx: std::sync::Mutex::new(Some(task_tx)),
            metrics,
            dispatcher: std::sync::Mutex::new(Some(dispatcher)),
        }
    }

    /// Enqueue a task. Fails fast with `Overloaded` when the queue is full.
    pub fn submit(&self, task: EvalTask) -> Result<EvalTicket, Error> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let queued = QueuedTask {
            task,
            reply: reply_tx,
            submitted: Instant::now(),
        };

        let guard = self.task_tx.lock().unwrap_or_else(|e| e.into_inner());
        let sender = guard.as_ref().ok_or(Error::EngineUnavailable)?;
        sender.try_send(queued).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => Error::Overloaded,
            mpsc::error::TrySendError::Closed(_) => Error::EngineUnavailable,
        })?;

        self.metrics.enqueued.fetch_add(1, Ordering::Relaxed);
        let depth = self.metrics.depth.fetch_add(1, Ordering::Relaxed) + 1;
        self.metrics.max_depth.fetch_max(depth, Ordering::Relaxed);
        Ok(reply_rx)
    }

    pub fn metrics(&self) -> QueueMetrics {
        self.metrics.snapshot()
    }

    /// Close the queue, wait for in-flight evaluations, shut workers down.
    /// Idempotent; later `submit` calls fail with `EngineUnavailable`.
    pub async fn shutdown(&self) {
        let sender = self.task_tx.lock().unwrap_or_else(|e| e.into_inner()).take();
        drop(sender);
        let dispatcher = self.dispatcher.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(dispatcher) = dispatcher {
            let _ = dispatcher.await;
        }
    }
}

async fn dispatch_loop(
    mut task_rx: mpsc::Receiver<QueuedTask>,
    mut idle_rx: mpsc::Receiver<Box<dyn EvalBackend>>,
    idle_tx: mpsc::Sender<Box<dyn EvalBackend>>,
    worker_count: usize,
    metrics: Arc<MetricsInner>,
) {
    while let Some(queued) = task_rx.recv().await {
        metrics.depth.fetch_sub(1, Ordering::Relaxed);

        if queued.reply.is_closed() {
            debug!("discarding abandoned task before dispatch");
            continue;
        }

        // FIFO: the task in hand waits here until a worker frees up.
        let Some(mut worker) = idle_rx.recv().await else {
            break;
        };

        // The submitter may have given up during that wait; a task is
        // only dispatched once a worker is in hand, so it can still be
        // discarded here without costing worker time.
        if queued.reply.is_closed() {
            debug!("discarding task abandoned while awaiting a worker");
            // Idle capacity equals the worker count, so this cannot fail.
            let _ = idle_tx.try_send(worker);
            continue;
        }

        let wait_ms = queued.submitted.elapsed().as_millis() as u64;
        metrics.total_wait_ms.fetch_add(wait_ms, Ordering::Relaxed);
        metrics.dispatched.fetch_add(1, Ordering::Relaxed);

        let idle_tx = idle_tx.clone();
        let metrics = Arc::clone(&metrics);
        tokio::spawn(async move {
            let result = worker.evaluate(&queued.task).await;
            match &result {
                Ok(_) => metrics.completed.fetch_add(1, Ordering::Relaxed),
                Err(_) => metrics.failed.fetch_add(1, Ordering::Relaxed),
            };
            // A closed reply means the submitter gave up after dispatch;
            // the evaluation already ran, its result is simply dropped.
            let _ = queued.reply.send(result);
            let _ = idle_tx.send(worker).await;
        });
    }

    // Queue closed: collect every worker back and shut it down.
    let mut collected = 0;
    while collected < worker_count {
        match idle_rx.recv().await {
            Some(mut worker) => {
                worker.shutdown().await;
                debug!("[worker-{}] returned and shut down", worker.id());
                collected += 1;
            }
            None => break,
        }
    }
    info!("request queue dispatcher stopped ({} workers down)", collected);
}
