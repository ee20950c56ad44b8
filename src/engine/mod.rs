//! Engine pool: the only subsystem that performs I/O.
//!
//! # Architecture
//!
//! ```text
//! Analyse::analyse_pv(fen, depth, multipv)
//!     ↕ EnginePool (facade: retry-once, depth-based timeouts)
//! RequestQueue (bounded FIFO, single dispatcher, metrics)
//!     ↕ idle-worker channel
//! EngineWorker × N (one UCI subprocess each, restart on failure)
//!     ↕ stdin/stdout (uci.rs codec)
//! engine binary
//! ```
//!
//! Each worker owns exactly one subprocess and runs one evaluation at a
//! time; the dispatcher hands a worker out and gets it back when the
//! assignment completes, so concurrent use of a worker is impossible by
//! construction.

pub mod pool;
pub mod queue;
pub mod uci;
pub mod worker;

use async_trait::async_trait;

use crate::error::Error;

pub use pool::EnginePool;
pub use queue::{EvalBackend, QueueMetrics, RequestQueue};
pub use worker::{EngineWorker, Health};

/// One evaluation request against a worker.
#[derive(Debug, Clone)]
pub struct EvalTask {
    pub fen: String,
    pub depth: u8,
    pub multipv: u8,
}

/// A single ranked line from a multi-PV search.
#[derive(Debug, Clone)]
pub struct PvLine {
    /// Score in saturated centipawns from the side to move.
    pub score_cp: i32,
    /// First move of the line (UCI).
    pub first: String,
    /// The full line (UCI moves).
    pub pv: Vec<String>,
}

/// Result of one engine query at a fixed depth and multi-PV count.
#[derive(Debug, Clone)]
pub struct Evaluation {
    /// Best-line score in saturated centipawns, side-to-move perspective.
    pub score_cp: i32,
    /// Principal variation (UCI moves); non-empty unless terminal.
    pub pv: Vec<String>,
    /// Top-k lines in rank order (rank 1 first).
    pub multipv: Vec<PvLine>,
    /// Depth the engine actually reached.
    pub depth_used: u8,
}

impl Evaluation {
    pub fn best_move(&self) -> Option<&str> {
        self.pv.first().map(|s| s.as_str())
    }

    /// Line scores in rank order (descending from the side to move).
    pub fn multipv_scores(&self) -> Vec<i32> {
        self.multipv.iter().map(|line| line.score_cp).collect()
    }
}

/// The call-site-facing evaluation seam.
///
/// The tree builder sees only this trait; production code routes through
/// [`EnginePool`], tests through scripted in-memory backends.
#[async_trait]
pub trait Analyse: Send + Sync {
    /// Evaluate a position, blocking until a worker returns. All I/O
    /// failure handling (restart, retry-once) happens behind this call.
    async fn analyse_pv(&self, fen: &str, depth: u8, multipv: u8) -> Result<Evaluation, Error>;
}
