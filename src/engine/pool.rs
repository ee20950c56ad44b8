//! Engine pool facade.
//!
//! Bundles worker spawning, the request queue, and the retry policy into
//! the one value callers hold. The tree builder sees only
//! [`Analyse::analyse_pv`]; transient failures (a timeout or a crashed
//! subprocess) are retried exactly once before the error escapes.

use std::sync::Arc;

use async_trait::async_trait;
use log::{info, warn};

use super::queue::{EvalBackend, RequestQueue};
use super::worker::{EngineWorker, WorkerStats};
use super::{Analyse, EvalTask, Evaluation, Health, QueueMetrics};
use crate::config::Config;
use crate::error::Error;

/// A fixed set of engine workers behind a FIFO queue.
pub struct EnginePool {
    queue: RequestQueue,
    stats: Vec<Arc<WorkerStats>>,
}

impl EnginePool {
    /// Spawn `pool_size` workers and start the dispatcher.
    ///
    /// Fails if the configuration is invalid or any engine refuses the
    /// initial handshake; a pool that starts is a pool whose engines all
    /// answered `readyok` once.
    pub async fn start(config: &Config) -> Result<Self, Error> {
        config.validate()?;

        let mut workers: Vec<Box<dyn EvalBackend>> = Vec::with_capacity(config.pool_size);
        let mut stats = Vec::with_capacity(config.pool_size);
        for id in 0..config.pool_size {
            let worker = EngineWorker::spawn(id, config.clone()).await?;
            stats.push(worker.stats());
            workers.push(Box::new(worker));
        }

        info!(
            "engine pool up: {} × '{}' (queue capacity {})",
            config.pool_size, config.engine_binary_path, config.queue_capacity
        );

        Ok(Self {
            queue: RequestQueue::start(workers, config.queue_capacity),
            stats,
        })
    }

    /// Per-worker health snapshots.
    pub fn health(&self) -> Vec<Health> {
        self.stats
            .iter()
            .enumerate()
            .map(|(id, stats)| stats.snapshot(id))
            .collect()
    }

    pub fn metrics(&self) -> QueueMetrics {
        self.queue.metrics()
    }

    /// Drain the queue and terminate every engine. Idempotent.
    pub async fn shutdown(&self) {
        self.queue.shutdown().await;
    }

    async fn submit_and_wait(&self, task: EvalTask) -> Result<Evaluation, Error> {
        let ticket = self.queue.submit(task)?;
        ticket
            .await
            .map_err(|_| Error::EngineCrashed("queue dropped the request".to_string()))?
    }
}

#[async_trait]
impl Analyse for EnginePool {
    async fn analyse_pv(&self, fen: &str, depth: u8, multipv: u8) -> Result<Evaluation, Error> {
        let task = EvalTask {
            fen: fen.to_string(),
            depth,
            multipv,
        };

        match self.submit_and_wait(task.clone()).await {
            Ok(evaluation) => Ok(evaluation),
            Err(error) if error.retryable() => {
                warn!("engine call failed ({}); retrying once", error);
                self.submit_and_wait(task).await
            }
            Err(error) => Err(error),
        }
    }
}
