//! Request coordinator: the `raise_confidence` entry point.
//!
//! Validates inputs before any engine work, short-circuits terminal
//! positions into a single-node tree, drives the builder under the request
//! deadline, and emits one telemetry line per request.
//!
//! A terminal input position is answered, not rejected: a one-node tree
//! with overall confidence 0 (the side to move is mated) or 50 (drawn
//! terminal) and exit reason `terminal`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::info;
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::engine::Analyse;
use crate::error::Error;
use crate::position::{Position, PositionStatus};
use crate::tree::{
    color_for, line_confidence, overall_confidence, BuildConfig, BuildExit, CancelToken,
    NodeRecord, RequestContext, Tree, TreeBuilder,
};

/// One `raise_confidence` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaiseRequest {
    /// Position to analyze (standard FEN).
    pub fen: String,
    /// Optional SAN or UCI move to head the spine; absent means the
    /// engine's own PV is the spine.
    #[serde(rename = "move", default)]
    pub candidate: Option<String>,
    /// Confidence the spine must reach. Default 80.
    #[serde(default)]
    pub target: Option<u8>,
    /// Coloring threshold. Default: equal to `target`.
    #[serde(default)]
    pub baseline: Option<u8>,
}

/// Why the request finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    TargetReached,
    NoEligibleNodes,
    IterationBudget,
    Timeout,
    /// The input position itself had no legal moves.
    Terminal,
}

impl From<BuildExit> for ExitReason {
    fn from(exit: BuildExit) -> Self {
        match exit {
            BuildExit::TargetReached => ExitReason::TargetReached,
            BuildExit::NoEligibleNodes => ExitReason::NoEligibleNodes,
            BuildExit::IterationBudget => ExitReason::IterationBudget,
            BuildExit::Timeout => ExitReason::Timeout,
        }
    }
}

/// The materialized tree plus its aggregates.
#[derive(Debug, Serialize)]
pub struct RaiseResponse {
    pub overall_confidence: u8,
    pub line_confidence: u8,
    pub exit_reason: ExitReason,
    /// Construction order: spine first, then branches in extension order.
    pub nodes: Vec<NodeRecord>,
}

/// Entry point of the service core. Owns nothing but a handle to the
/// evaluation facade; every request gets a fresh builder.
pub struct Coordinator {
    engine: Arc<dyn Analyse>,
    config: Config,
    next_request: AtomicU64,
}

impl Coordinator {
    pub fn new(engine: Arc<dyn Analyse>, config: Config) -> Self {
        Self {
            engine,
            config,
            next_request: AtomicU64::new(1),
        }
    }

    /// Build a confidence tree for the request.
    pub async fn raise_confidence(&self, request: RaiseRequest) -> Result<RaiseResponse, Error> {
        self.raise_confidence_with(request, CancelToken::new()).await
    }

    /// As [`raise_confidence`](Self::raise_confidence), with an external
    /// cancellation token honored at iteration boundaries.
    pub async fn raise_confidence_with(
        &self,
        request: RaiseRequest,
        cancel: CancelToken,
    ) -> Result<RaiseResponse, Error> {
        let request_id = self.next_request.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();

        let (target, baseline) = validate_thresholds(&request)?;
        let position = Position::from_fen(&request.fen)?;

        if position.is_terminal() {
            let response = terminal_response(&position, baseline);
            info!(
                "[req-{}] terminal input: status={:?} overall={} elapsed_ms={}",
                request_id,
                position.status(),
                response.overall_confidence,
                started.elapsed().as_millis()
            );
            return Ok(response);
        }

        // Reject a bad candidate move before any engine work.
        if let Some(candidate) = &request.candidate {
            position.parse_move(candidate)?;
        }

        let ctx = RequestContext {
            deadline: Some(started + Duration::from_millis(self.config.request_timeout_ms)),
            cancel,
        };
        let build_config = BuildConfig::from_config(&self.config, target, baseline);
        let outcome = TreeBuilder::new(self.engine.as_ref(), build_config)
            .build(&position, request.candidate.as_deref(), &ctx)
            .await?;

        let response = RaiseResponse {
            overall_confidence: overall_confidence(&outcome.tree, target),
            line_confidence: line_confidence(&outcome.tree, target),
            exit_reason: outcome.exit.into(),
            nodes: outcome.tree.records(),
        };

        info!(
            "[req-{}] raise_confidence: exit={:?} overall={} iterations={} nodes={} engine_calls={} elapsed_ms={}",
            request_id,
            response.exit_reason,
            response.overall_confidence,
            outcome.iterations,
            response.nodes.len(),
            outcome.engine_calls,
            started.elapsed().as_millis()
        );
        Ok(response)
    }
}

fn validate_thresholds(request: &RaiseRequest) -> Result<(u8, u8), Error> {
    let target = request.target.unwrap_or(80);
    let baseline = request.baseline.unwrap_or(target);
    if target > 100 {
        return Err(Error::InvalidInput(format!(
            "target {} out of range 0-100",
            target
        )));
    }
    if baseline > 100 {
        return Err(Error::InvalidInput(format!(
            "baseline {} out of range 0-100",
            baseline
        )));
    }
    Ok((target, baseline))
}

/// Single-node tree for a position with no legal moves: 0 when the side
/// to move is mated, 50 for a drawn terminal.
fn terminal_response(position: &Position, baseline: u8) -> RaiseResponse {
    let value = match position.status() {
        PositionStatus::Checkmate => 0,
        _ => 50,
    };
    let mut tree = Tree::new(position.fen());
    let root_index = tree.root();
    let root = tree.node_mut(root_index);
    root.confidence = value;
    root.frozen = value;
    root.color = color_for(value, baseline);

    RaiseResponse {
        overall_confidence: value,
        line_confidence: value,
        exit_reason: ExitReason::Terminal,
        nodes: tree.records(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Evaluation, PvLine};
    use async_trait::async_trait;

    const STARTPOS: &str = "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1";

    /// Engine where everything scores zero: every move agrees at every
    /// depth, so all confidences are 100.
    struct QuietEngine;

    #[async_trait]
    impl Analyse for QuietEngine {
        async fn analyse_pv(
            &self,
            fen: &str,
            depth: u8,
            multipv: u8,
        ) -> Result<Evaluation, Error> {
            let position = Position::from_fen(fen)
                .map_err(|_| Error::EngineCrashed(format!("bad fen {}", fen)))?;
            let lines: Vec<PvLine> = position
                .legal_moves()
                .iter()
                .take(multipv as usize)
                .map(|&m| {
                    let uci = position.uci_of(m);
                    PvLine {
                        score_cp: 0,
                        first: uci.clone(),
                        pv: vec![uci],
                    }
                })
                .collect();
            if lines.is_empty() {
                return Err(Error::IllegalPosition(fen.to_string()));
            }
            Ok(Evaluation {
                score_cp: 0,
                pv: lines[0].pv.clone(),
                multipv: lines,
                depth_used: depth,
            })
        }
    }

    fn coordinator() -> Coordinator {
        Coordinator::new(Arc::new(QuietEngine), Config::default())
    }

    fn request(fen: &str) -> RaiseRequest {
        RaiseRequest {
            fen: fen.to_string(),
            candidate: None,
            target: None,
            baseline: None,
        }
    }

    #[tokio::test]
    async fn test_quiet_position_reaches_default_target() {
        let response = coordinator().raise_confidence(request(STARTPOS)).await.unwrap();
        assert_eq!(response.exit_reason, ExitReason::TargetReached);
        assert_eq!(response.overall_confidence, 100);
        assert_eq!(response.line_confidence, 100);
        assert!(response.nodes.len() >= 2);
        assert_eq!(response.nodes[0].id, "pv-0");
    }

    #[tokio::test]
    async fn test_invalid_fen_rejected() {
        let result = coordinator().raise_confidence(request("not a fen")).await;
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_out_of_range_target_rejected() {
        let mut bad = request(STARTPOS);
        bad.target = Some(150);
        let result = coordinator().raise_confidence(bad).await;
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_illegal_candidate_move_rejected() {
        let mut bad = request(STARTPOS);
        bad.candidate = Some("Qd5".to_string());
        let result = coordinator().raise_confidence(bad).await;
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_candidate_move_accepted_in_san_and_uci() {
        for candidate in ["e4", "e2e4"] {
            let mut req = request(STARTPOS);
            req.candidate = Some(candidate.to_string());
            let response = coordinator().raise_confidence(req).await.unwrap();
            assert_eq!(
                response.nodes[1].move_from_parent_san.as_deref(),
                Some("e4")
            );
        }
    }

    #[tokio::test]
    async fn test_checkmate_input_yields_terminal_zero() {
        // Fool's mate: the side to move is mated.
        let mated = "rnb1kbnr/pppp1ppp/8/4p3/6Pq/5P2/PPPPP2P/RNBQKBNR w KQkq - 1 3";
        let response = coordinator().raise_confidence(request(mated)).await.unwrap();
        assert_eq!(response.exit_reason, ExitReason::Terminal);
        assert_eq!(response.overall_confidence, 0);
        assert_eq!(response.nodes.len(), 1);
        assert!(response.nodes[0].parent_id.is_none());
    }

    #[tokio::test]
    async fn test_stalemate_input_yields_terminal_draw() {
        let stalemate = "k7/8/1Q6/8/8/8/8/2K5 b - - 0 1";
        let response = coordinator()
            .raise_confidence(request(stalemate))
            .await
            .unwrap();
        assert_eq!(response.exit_reason, ExitReason::Terminal);
        assert_eq!(response.overall_confidence, 50);
        assert_eq!(response.nodes.len(), 1);
    }

    #[test]
    fn test_request_deserializes_with_defaults() {
        let request: RaiseRequest =
            serde_json::from_str(&format!("{{\"fen\": \"{}\"}}", STARTPOS)).unwrap();
        assert_eq!(request.fen, STARTPOS);
        assert!(request.candidate.is_none());
        assert!(request.target.is_none());

        let request: RaiseRequest = serde_json::from_str(&format!(
            "{{\"fen\": \"{}\", \"move\": \"e4\", \"target\": 90}}",
            STARTPOS
        ))
        .unwrap();
        assert_eq!(request.candidate.as_deref(), Some("e4"));
        assert_eq!(request.target, Some(90));
    }
}
