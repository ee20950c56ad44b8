//! Engine worker: owns one UCI subprocess.
//!
//! A worker performs one evaluation at a time. On any transport failure
//! (subprocess death, unparseable terminal state, per-call timeout) it
//! kills and respawns the engine; the triggering call fails, later calls
//! see a fresh process. Health counters live behind atomics so the pool
//! can report on workers it no longer holds directly.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::time::timeout;

use super::queue::EvalBackend;
use super::uci::{
    go_command, is_readyok, is_uciok, isready_command, parse_bestmove, position_command,
    quit_command, setoption_command, uci_command, ucinewgame_command, MultiPvTable,
};
use super::{EvalTask, Evaluation};
use crate::config::Config;
use crate::error::Error;

/// Deadline for the `uci`/`isready` handshake after a spawn.
const HANDSHAKE_TIMEOUT_MS: u64 = 10_000;
/// How long an orderly `quit` may take before the process is killed.
const QUIT_TIMEOUT_MS: u64 = 1_000;

/// Point-in-time worker health, as reported by `EnginePool::health`.
#[derive(Debug, Clone, Serialize)]
pub struct Health {
    pub worker_id: usize,
    pub alive: bool,
    pub consecutive_failures: u32,
    pub total_requests: u64,
    pub last_error: Option<String>,
}

/// Shared counters updated by the worker, snapshotted by the pool.
#[derive(Debug, Default)]
pub struct WorkerStats {
    alive: AtomicBool,
    consecutive_failures: AtomicU32,
    total_requests: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl WorkerStats {
    pub fn snapshot(&self, worker_id: usize) -> Health {
        Health {
            worker_id,
            alive: self.alive.load(Ordering::Relaxed),
            consecutive_failures: self.consecutive_failures.load(Ordering::Relaxed),
            total_requests: self.total_requests.load(Ordering::Relaxed),
            last_error: self.last_error.lock().unwrap_or_else(|e| e.into_inner()).clone(),
        }
    }

    fn record_failure(&self, error: &Error) {
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
        *self.last_error.lock().unwrap_or_else(|e| e.into_inner()) = Some(error.to_string());
    }
}

struct EngineProcess {
    child: Child,
    stdin: ChildStdin,
    reader: Lines<BufReader<ChildStdout>>,
}

/// One UCI engine subprocess plus its protocol state.
pub struct EngineWorker {
    id: usize,
    config: Config,
    process: Option<EngineProcess>,
    current_multipv: u8,
    stats: Arc<WorkerStats>,
}

impl EngineWorker {
    /// Spawn the subprocess and complete the UCI handshake.
    pub async fn spawn(id: usize, config: Config) -> Result<Self, Error> {
        let mut worker = Self {
            id,
            config,
            process: None,
            current_multipv: 1,
            stats: Arc::new(WorkerStats::default()),
        };
        worker.respawn().await?;
        Ok(worker)
    }

    /// Handle to the shared health counters.
    pub fn stats(&self) -> Arc<WorkerStats> {
        Arc::clone(&self.stats)
    }

    pub fn health(&self) -> Health {
        self.stats.snapshot(self.id)
    }

    /// Run one evaluation under the depth-appropriate deadline.
    ///
    /// Transport failures and timeouts restart the engine before the error
    /// is returned. `IllegalPosition` leaves the engine running: the
    /// process is healthy, the caller queried a terminal position.
    pub async fn evaluate(&mut self, task: &EvalTask) -> Result<Evaluation, Error> {
        self.stats.total_requests.fetch_add(1, Ordering::Relaxed);
        self.ensure_alive().await?;

        let deadline = Duration::from_millis(self.config.call_timeout_ms(task.depth));
        let result = match timeout(deadline, self.run_search(task)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout),
        };

        match result {
            Ok(eval) => {
                self.stats.consecutive_failures.store(0, Ordering::Relaxed);
                Ok(eval)
            }
            Err(error @ Error::IllegalPosition(_)) => Err(error),
            Err(error) => {
                self.stats.record_failure(&error);
                warn!("[worker-{}] {}; restarting engine", self.id, error);
                self.kill().await;
                if let Err(respawn_error) = self.respawn().await {
                    warn!("[worker-{}] respawn failed: {}", self.id, respawn_error);
                }
                Err(error)
            }
        }
    }

    /// Orderly termination: `quit`, bounded wait, then kill. Idempotent.
    pub async fn shutdown(&mut self) {
        if let Some(mut process) = self.process.take() {
            let _ = process
                .stdin
                .write_all(format!("{}\n", quit_command()).as_bytes())
                .await;
            let _ = process.stdin.flush().await;
            if timeout(Duration::from_millis(QUIT_TIMEOUT_MS), process.child.wait())
                .await
                .is_err()
            {
                let _ = process.child.kill().await;
            }
            debug!("[worker-{}] engine shut down", self.id);
        }
        self.stats.alive.store(false, Ordering::Relaxed);
    }

    async fn ensure_alive(&mut self) -> Result<(), Error> {
        if self.process.is_none() {
            self.respawn().await?;
        }
        Ok(())
    }

    async fn respawn(&mut self) -> Result<(), Error> {
        let mut child = Command::new(&self.config.engine_binary_path)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Error::EngineCrashed(format!(
                    "failed to spawn '{}': {}",
                    self.config.engine_binary_path, e
                ))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::EngineCrashed("engine stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::EngineCrashed("engine stdout unavailable".to_string()))?;

        self.process = Some(EngineProcess {
            child,
            stdin,
            reader: BufReader::new(stdout).lines(),
        });
        self.current_multipv = 1;

        let deadline = Duration::from_millis(HANDSHAKE_TIMEOUT_MS);
        let handshake = timeout(deadline, self.handshake())
            .await
            .map_err(|_| Error::EngineCrashed("handshake timed out".to_string()))
            .and_then(|result| result);
        if let Err(error) = handshake {
            self.kill().await;
            return Err(error);
        }

        self.stats.alive.store(true, Ordering::Relaxed);
        info!(
            "[worker-{}] engine ready ({} threads, {} MB hash)",
            self.id, self.config.engine_threads, self.config.engine_hash_mb
        );
        Ok(())
    }

    async fn handshake(&mut self) -> Result<(), Error> {
        self.send(&uci_command()).await?;
        self.read_until(is_uciok).await?;
        let threads = self.config.engine_threads.to_string();
        let hash = self.config.engine_hash_mb.to_string();
        self.send(&setoption_command("Threads", &threads)).await?;
        self.send(&setoption_command("Hash", &hash)).await?;
        self.send(&setoption_command("MultiPV", "1")).await?;
        self.send(&ucinewgame_command()).await?;
        self.send(&isready_command()).await?;
        self.read_until(is_readyok).await
    }

    async fn run_search(&mut self, task: &EvalTask) -> Result<Evaluation, Error> {
        self.ensure_multipv(task.multipv).await?;
        self.send(&position_command(&task.fen)).await?;
        self.send(&go_command(task.depth)).await?;

        let mut table = MultiPvTable::new();
        loop {
            let line = self.read_line().await?;
            if let Some(best) = parse_bestmove(&line) {
                return match best {
                    None => Err(Error::IllegalPosition(format!(
                        "engine found no move in '{}'",
                        task.fen
                    ))),
                    Some(_) => table.finish(),
                };
            }
            table.ingest(&line);
        }
    }

    /// `setoption` round-trips cost an `isready`; skip when unchanged.
    async fn ensure_multipv(&mut self, multipv: u8) -> Result<(), Error> {
        if multipv == self.current_multipv {
            return Ok(());
        }
        let value = multipv.to_string();
        self.send(&setoption_command("MultiPV", &value)).await?;
        self.send(&isready_command()).await?;
        self.read_until(is_readyok).await?;
        self.current_multipv = multipv;
        Ok(())
    }

    async fn send(&mut self, command: &str) -> Result<(), Error> {
        let process = self
            .process
            .as_mut()
            .ok_or_else(|| Error::EngineCrashed("engine process is gone".to_string()))?;
        process
            .stdin
            .write_all(format!("{}\n", command).as_bytes())
            .await
            .map_err(|e| Error::EngineCrashed(format!("write failed: {}", e)))?;
        process
            .stdin
            .flush()
            .await
            .map_err(|e| Error::EngineCrashed(format!("flush failed: {}", e)))
    }

    async fn read_line(&mut self) -> Result<String, Error> {
        let process = self
            .process
            .as_mut()
            .ok_or_else(|| Error::EngineCrashed("engine process is gone".to_string()))?;
        match process.reader.next_line().await {
            Ok(Some(line)) => Ok(line),
            Ok(None) => Err(Error::EngineCrashed("engine closed stdout".to_string())),
            Err(e) => Err(Error::EngineCrashed(format!("read failed: {}", e))),
        }
    }

    async fn read_until(&mut self, acked: fn(&str) -> bool) -> Result<(), Error> {
        loop {
            if acked(self.read_line().await?.trim()) {
                return Ok(());
            }
        }
    }

    async fn kill(&mut self) {
        if let Some(mut process) = self.process.take() {
            let _ = process.child.kill().await;
        }
        self.stats.alive.store(false, Ordering::Relaxed);
    }
}

#[async_trait]
impl EvalBackend for EngineWorker {
    async fn evaluate(&mut self, task: &EvalTask) -> Result<Evaluation, Error> {
        EngineWorker::evaluate(self, task).await
    }

    async fn shutdown(&mut self) {
        EngineWorker::shutdown(self).await;
    }

    fn id(&self) -> usize {
        self.id
    }
}
