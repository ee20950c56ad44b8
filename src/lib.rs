//! Credfish: the confidence-tree core of a chess analysis service.
//!
//! Given a position (and optionally a candidate move), credfish drives a
//! pool of UCI engines to build a tree of annotated positions whose
//! confidence scores express how firmly the principal line holds its
//! evaluation. The single entry point is
//! [`coordinator::Coordinator::raise_confidence`].
//!
//! # Architecture
//!
//! ```text
//! Coordinator::raise_confidence()
//!     ↕ one request, straight-line control flow
//! tree::TreeBuilder            (spine + selective branch extension)
//!     ↕ Analyse::analyse_pv()  (the only suspension point)
//! engine::EnginePool           (facade: retry-once, depth timeouts)
//!     ↕ bounded FIFO queue     (single dispatcher, fair dispatch)
//! engine::EngineWorker × N     (one UCI subprocess each)
//!     ↕ stdin/stdout
//! Stockfish (or any UCI engine)
//! ```
//!
//! The engine pool is the only concurrent subsystem; tree construction is
//! sequential per request, so deterministic engine output yields a
//! deterministic tree.

pub mod config;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod position;
pub mod tree;

pub use config::Config;
pub use coordinator::{Coordinator, ExitReason, RaiseRequest, RaiseResponse};
pub use engine::{Analyse, EnginePool, Evaluation};
pub use error::Error;
