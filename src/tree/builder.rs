//! The tree builder: spine construction plus the bounded extension loop.
//!
//! The loop runs until every spine weakness is resolved or escalated, or a
//! budget runs out:
//!
//! ```text
//! while min_line_confidence < target and iterations < max_iterations:
//!     victim = weakest eligible node (stable tie-break: creation order)
//!     extend(victim)      spawn sibling alternatives + short PV tails
//!     recolor(victim)     green: an alternative reaches the target
//!                         blue:  a strong alternative, unproven tail
//!                         red:   nothing yet; stays eligible
//! ```
//!
//! Every extension either closes the victim (green), parks it (blue), or
//! commits to trying again (red) with a widened multi-PV window, so
//! branching stays bounded. Engine calls go through a per-request cache
//! keyed on (fingerprint, depth, multipv); within one request a repeated
//! query costs nothing.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use log::{debug, warn};

use super::aggregate::min_line_confidence;
use super::confidence::{confidence, terminal_confidence, ConfidenceInputs};
use super::node::{Color, NodeIndex, Shape};
use super::tree::Tree;
use crate::config::Config;
use crate::engine::{Analyse, Evaluation};
use crate::error::Error;
use crate::position::Position;

/// Cooperative cancellation flag, checked between iterations. In-flight
/// engine calls are never interrupted; their results are discarded.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Deadline and cancellation for one request.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub deadline: Option<Instant>,
    pub cancel: CancelToken,
}

/// Tuning knobs for one build.
#[derive(Debug, Clone)]
pub struct BuildConfig {
    /// The confidence the spine must reach.
    pub target: u8,
    /// Coloring threshold for non-triangle nodes; display only.
    pub baseline: u8,
    pub deep_depth: u8,
    pub shallow_depth: u8,
    pub branching_k: u8,
    pub max_ply_from_root: u32,
    pub max_iterations: u32,
}

impl BuildConfig {
    pub fn from_config(config: &Config, target: u8, baseline: u8) -> Self {
        Self {
            target,
            baseline,
            deep_depth: config.deep_depth,
            shallow_depth: config.shallow_depth,
            branching_k: config.branching_k,
            max_ply_from_root: config.max_ply_from_root,
            max_iterations: config.max_iterations,
        }
    }
}

/// Why the build loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildExit {
    /// Every spine node meets the target (or is a satisfied triangle).
    TargetReached,
    /// No red circle within the ply budget and no extendable red triangle.
    NoEligibleNodes,
    /// The outer-loop safety bound was hit.
    IterationBudget,
    /// The request deadline expired; the partial tree is still valid.
    Timeout,
}

/// A finished build: the frozen tree plus its accounting.
#[derive(Debug)]
pub struct BuildOutcome {
    pub tree: Tree,
    pub exit: BuildExit,
    pub iterations: u32,
    pub engine_calls: u32,
}

type CacheKey = (String, u8, u8);

/// Builds one confidence tree. Single-threaded; suspends only inside
/// [`Analyse::analyse_pv`].
pub struct TreeBuilder<'a> {
    engine: &'a dyn Analyse,
    config: BuildConfig,
    cache: HashMap<CacheKey, Evaluation>,
    engine_calls: u32,
}

impl<'a> TreeBuilder<'a> {
    pub fn new(engine: &'a dyn Analyse, config: BuildConfig) -> Self {
        Self {
            engine,
            config,
            cache: HashMap::new(),
            engine_calls: 0,
        }
    }

    /// Build the tree for `root` (which must not be terminal), optionally
    /// forcing the spine to start with `candidate`.
    pub async fn build(
        mut self,
        root: &Position,
        candidate: Option<&str>,
        ctx: &RequestContext,
    ) -> Result<BuildOutcome, Error> {
        let mut tree = self.build_spine(root, candidate).await?;

        let mut iterations: u32 = 0;
        let mut consecutive_failures: u32 = 0;

        let exit = loop {
            if min_line_confidence(&tree, self.config.target) >= self.config.target {
                break BuildExit::TargetReached;
            }
            if iterations >= self.config.max_iterations {
                break BuildExit::IterationBudget;
            }
            if ctx.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            if ctx.deadline.map_or(false, |deadline| Instant::now() >= deadline) {
                break BuildExit::Timeout;
            }

            let Some(victim) = self.select_victim(&tree) else {
                break BuildExit::NoEligibleNodes;
            };
            iterations += 1;

            match self.extend(&mut tree, victim).await {
                Ok(()) => consecutive_failures = 0,
                Err(error @ (Error::InvalidInput(_) | Error::Cancelled)) => return Err(error),
                Err(error) => {
                    // The facade already retried once. The victim was
                    // morphed before the first engine call, so it sits as
                    // a red triangle and no progress is lost.
                    consecutive_failures += 1;
                    warn!(
                        "[{}] extension failed ({}); victim left red",
                        tree.node(victim).id,
                        error
                    );
                    if consecutive_failures >= 2 {
                        return Err(Error::EngineUnavailable);
                    }
                }
            }
        };

        debug!(
            "build done: exit={:?} iterations={} nodes={} engine_calls={}",
            exit,
            iterations,
            tree.len(),
            self.engine_calls
        );

        Ok(BuildOutcome {
            tree,
            exit,
            iterations,
            engine_calls: self.engine_calls,
        })
    }

    /// Construct the spine: the candidate move (if any) followed by the
    /// engine PV, walked up to its natural length or the ply budget.
    async fn build_spine(
        &mut self,
        root: &Position,
        candidate: Option<&str>,
    ) -> Result<Tree, Error> {
        let line = match candidate {
            Some(text) => {
                let chess_move = root.parse_move(text)?;
                let mut line = vec![root.uci_of(chess_move)];
                let after = root.apply(chess_move);
                if !after.is_terminal() {
                    line.extend(self.eval(after.fen(), self.config.deep_depth, 1).await?.pv);
                }
                line
            }
            None => self.eval(root.fen(), self.config.deep_depth, 1).await?.pv,
        };

        // Walk the line, validating each move. A bad engine move ends the
        // spine early rather than poisoning the tree.
        let mut steps: Vec<(Position, String, String)> = Vec::new();
        let mut current = root.clone();
        for uci in line {
            if current.is_terminal() {
                break;
            }
            if steps.len() as u32 >= self.config.max_ply_from_root {
                break;
            }
            let chess_move = match current.parse_move(&uci) {
                Ok(chess_move) => chess_move,
                Err(_) => {
                    warn!("discarding illegal PV move '{}' at {}", uci, current.fen());
                    break;
                }
            };
            let san = current.san_of(chess_move);
            let normalized = current.uci_of(chess_move);
            current = current.apply(chess_move);
            steps.push((current.clone(), san, normalized));
        }

        let mut tree = Tree::new(root.fen());
        let mut before = root.clone();
        for (after, san, uci) in steps {
            let node_confidence = self.move_confidence(&before, &after).await?;
            tree.push_spine(after.fen(), san, uci, node_confidence, self.config.baseline);
            before = after;
        }
        tree.seal_spine();
        Ok(tree)
    }

    /// Confidence of the move leading from `before` to `after`, all four
    /// formula inputs normalized to the mover's perspective. The score
    /// reported in `after` belongs to the opponent, hence the negations.
    async fn move_confidence(&mut self, before: &Position, after: &Position) -> Result<u8, Error> {
        if after.is_terminal() {
            return Ok(terminal_confidence(after.status()));
        }
        let deep_before = self.eval(before.fen(), self.config.deep_depth, 1).await?;
        let shallow_before = self.eval(before.fen(), self.config.shallow_depth, 1).await?;
        let deep_after = self.eval(after.fen(), self.config.deep_depth, 1).await?;
        let shallow_after = self.eval(after.fen(), self.config.shallow_depth, 1).await?;
        Ok(confidence(&ConfidenceInputs {
            s_deep: -deep_after.score_cp,
            s_shallow: -shallow_after.score_cp,
            pv_deep: deep_before.score_cp,
            pv_shallow: shallow_before.score_cp,
        }))
    }

    /// Weakest eligible node, tie-broken by creation order.
    ///
    /// Eligible: any node except the synthetic root and the final spine
    /// node, within the ply budget, that is either an unbranched node
    /// below the target or a red triangle with unexplored alternatives.
    fn select_victim(&self, tree: &Tree) -> Option<NodeIndex> {
        let last_spine = tree.last_spine();
        (0..tree.len())
            .filter(|&index| {
                let node = tree.node(index);
                if node.parent.is_none() || index == last_spine {
                    return false;
                }
                if node.ply >= self.config.max_ply_from_root {
                    return false;
                }
                if node.has_branches {
                    node.insufficient_confidence && !node.exhausted
                } else {
                    node.confidence < self.config.target
                }
            })
            .min_by_key(|&index| (tree.node(index).effective_confidence(), index))
    }

    /// Extend `victim`: spawn sibling alternatives (children of its
    /// parent) with one-ply PV tails, then recolor the triangle.
    async fn extend(&mut self, tree: &mut Tree, victim: NodeIndex) -> Result<(), Error> {
        // Morph before the first engine call: a failure below must leave
        // a red triangle, not an un-promoted circle.
        {
            let node = tree.node_mut(victim);
            if node.has_branches {
                node.extensions += 1;
            } else {
                node.has_branches = true;
                node.shape = Shape::Triangle;
                node.frozen = node.confidence;
                node.insufficient_confidence = true;
                node.color = Color::Red;
            }
        }

        let parent = tree
            .node(victim)
            .parent
            .ok_or_else(|| Error::InvalidInput("extension victim has no parent".to_string()))?;
        let parent_pos = Position::from_fen(&tree.node(parent).fen)?;
        let victim_move = tree.node(victim).move_uci.clone().unwrap_or_default();

        // Widen the multi-PV window on every re-extension so later rounds
        // surface alternatives the earlier ones did not. One extra line
        // covers the victim's own move, which the table usually contains.
        let rounds = tree.node(victim).extensions + 1;
        let want = (self.config.branching_k as u32 * rounds + 1).min(250) as u8;
        let deep_parent = self
            .eval(parent_pos.fen(), self.config.deep_depth, want)
            .await?;
        let shallow_parent = self
            .eval(parent_pos.fen(), self.config.shallow_depth, want)
            .await?;

        let known: HashSet<String> = tree.sibling_moves(parent).into_iter().collect();

        let mut spawned: u32 = 0;
        let mut leaf_confidences: Vec<u8> = Vec::new();
        let mut best_alt_confidence: Option<u8> = None;

        for line in &deep_parent.multipv {
            if spawned >= self.config.branching_k as u32 {
                break;
            }
            if line.first == victim_move {
                continue;
            }
            if known.contains(&line.first) {
                // Already spawned in an earlier round. Still the engine's
                // best alternative if ranked first.
                if best_alt_confidence.is_none() {
                    best_alt_confidence = self.sibling_confidence(tree, parent, &line.first);
                }
                continue;
            }

            let chess_move = match parent_pos.parse_move(&line.first) {
                Ok(chess_move) => chess_move,
                Err(_) => {
                    warn!(
                        "discarding illegal engine alternative '{}' at {}",
                        line.first,
                        parent_pos.fen()
                    );
                    continue;
                }
            };
            let san = parent_pos.san_of(chess_move);
            let uci = parent_pos.uci_of(chess_move);
            let alt_pos = parent_pos.apply(chess_move);

            let (alt_confidence, alt_evals) = if alt_pos.is_terminal() {
                (terminal_confidence(alt_pos.status()), None)
            } else {
                let deep_alt = self.eval(alt_pos.fen(), self.config.deep_depth, 1).await?;
                let shallow_alt = self
                    .eval(alt_pos.fen(), self.config.shallow_depth, 1)
                    .await?;
                let value = confidence(&ConfidenceInputs {
                    s_deep: -deep_alt.score_cp,
                    s_shallow: -shallow_alt.score_cp,
                    pv_deep: deep_parent.score_cp,
                    pv_shallow: shallow_parent.score_cp,
                });
                (value, Some((deep_alt, shallow_alt)))
            };

            let alt_index = tree.push_branch(
                parent,
                alt_pos.fen(),
                san,
                uci,
                alt_confidence,
                self.config.baseline,
                Shape::Circle,
            );
            spawned += 1;
            if best_alt_confidence.is_none() {
                best_alt_confidence = Some(alt_confidence);
            }

            // One-ply PV tail so the branch reads as a line. Its leaf is
            // what recoloring judges; without a tail the alternative node
            // is its own leaf.
            let mut leaf_confidence = alt_confidence;
            if let Some((deep_alt, shallow_alt)) = alt_evals {
                if tree.node(alt_index).ply < self.config.max_ply_from_root {
                    if let Some(tail_confidence) = self
                        .spawn_tail(tree, alt_index, &alt_pos, &deep_alt, &shallow_alt)
                        .await?
                    {
                        leaf_confidence = tail_confidence;
                    }
                }
            }
            leaf_confidences.push(leaf_confidence);
        }

        if spawned == 0 {
            // Every legal alternative is already on the board. The
            // triangle keeps its color but leaves the eligible set.
            tree.node_mut(victim).exhausted = true;
            debug!("[{}] no unexplored alternatives", tree.node(victim).id);
            return Ok(());
        }

        self.recolor(tree, victim, &leaf_confidences, best_alt_confidence);
        Ok(())
    }

    /// Append the alternative's first PV reply as a square leaf. Returns
    /// the leaf's confidence, or None when there is no usable tail.
    async fn spawn_tail(
        &mut self,
        tree: &mut Tree,
        alt_index: NodeIndex,
        alt_pos: &Position,
        deep_alt: &Evaluation,
        shallow_alt: &Evaluation,
    ) -> Result<Option<u8>, Error> {
        let Some(tail_uci) = deep_alt.pv.first() else {
            return Ok(None);
        };
        let chess_move = match alt_pos.parse_move(tail_uci) {
            Ok(chess_move) => chess_move,
            Err(_) => {
                warn!(
                    "discarding illegal tail move '{}' at {}",
                    tail_uci,
                    alt_pos.fen()
                );
                return Ok(None);
            }
        };
        let san = alt_pos.san_of(chess_move);
        let uci = alt_pos.uci_of(chess_move);
        let tail_pos = alt_pos.apply(chess_move);

        let tail_confidence = if tail_pos.is_terminal() {
            terminal_confidence(tail_pos.status())
        } else {
            let deep_tail = self.eval(tail_pos.fen(), self.config.deep_depth, 1).await?;
            let shallow_tail = self
                .eval(tail_pos.fen(), self.config.shallow_depth, 1)
                .await?;
            confidence(&ConfidenceInputs {
                s_deep: -deep_tail.score_cp,
                s_shallow: -shallow_tail.score_cp,
                pv_deep: deep_alt.score_cp,
                pv_shallow: shallow_alt.score_cp,
            })
        };

        tree.push_branch(
            alt_index,
            tail_pos.fen(),
            san,
            uci,
            tail_confidence,
            self.config.baseline,
            Shape::Square,
        );
        Ok(Some(tail_confidence))
    }

    /// The three-way verdict on a just-extended triangle.
    fn recolor(
        &self,
        tree: &mut Tree,
        victim: NodeIndex,
        leaf_confidences: &[u8],
        best_alt_confidence: Option<u8>,
    ) {
        let highest_leaf = leaf_confidences.iter().copied().max().unwrap_or(0);
        let node = tree.node_mut(victim);
        if highest_leaf >= self.config.target {
            node.color = Color::Green;
            node.insufficient_confidence = false;
        } else if best_alt_confidence.unwrap_or(0) >= self.config.target {
            node.color = Color::Blue;
            node.insufficient_confidence = false;
        } else {
            node.color = Color::Red;
            node.insufficient_confidence = true;
        }
    }

    /// Confidence of an already-spawned sibling identified by its move.
    fn sibling_confidence(&self, tree: &Tree, parent: NodeIndex, uci: &str) -> Option<u8> {
        tree.node(parent)
            .children
            .iter()
            .find(|&&child| tree.node(child).move_uci.as_deref() == Some(uci))
            .map(|&child| tree.node(child).confidence)
    }

    /// Engine query through the per-request cache.
    async fn eval(&mut self, fen: &str, depth: u8, multipv: u8) -> Result<Evaluation, Error> {
        let key = (fen.to_string(), depth, multipv);
        if let Some(hit) = self.cache.get(&key) {
            return Ok(hit.clone());
        }
        let evaluation = self.engine.analyse_pv(fen, depth, multipv).await?;
        self.engine_calls += 1;
        self.cache.insert(key, evaluation.clone());
        Ok(evaluation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::PvLine;
    use crate::tree::aggregate::overall_confidence;
    use crate::tree::node::NodeRecord;
    use async_trait::async_trait;
    use std::sync::Mutex;

    const STARTPOS: &str = "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1";
    const DEEP: u8 = 14;
    const SHALLOW: u8 = 6;

    /// Deterministic in-memory engine. Every position evaluates to a
    /// scripted (deep, shallow) score pair — default (0, 0) — and ranks
    /// moves in legal-move-generation order, with an optional PV override
    /// promoted to rank 1.
    struct ScriptedEngine {
        scores: HashMap<String, (i32, i32)>,
        pv: HashMap<String, Vec<String>>,
        calls: Mutex<u32>,
        fail_after: Option<u32>,
    }

    impl ScriptedEngine {
        fn new() -> Self {
            Self {
                scores: HashMap::new(),
                pv: HashMap::new(),
                calls: Mutex::new(0),
                fail_after: None,
            }
        }

        fn score(mut self, fen: &str, deep: i32, shallow: i32) -> Self {
            self.scores.insert(fen.to_string(), (deep, shallow));
            self
        }

        fn pv(mut self, fen: &str, line: &[&str]) -> Self {
            self.pv
                .insert(fen.to_string(), line.iter().map(|s| s.to_string()).collect());
            self
        }

        fn fail_after(mut self, calls: u32) -> Self {
            self.fail_after = Some(calls);
            self
        }
    }

    /// Legal moves in the order the scripted engine ranks them.
    fn ordered_moves(position: &Position, promoted: Option<&str>) -> Vec<String> {
        let mut moves: Vec<String> = position
            .legal_moves()
            .iter()
            .map(|&m| position.uci_of(m))
            .collect();
        if let Some(first) = promoted {
            moves.retain(|m| m != first);
            moves.insert(0, first.to_string());
        }
        moves
    }

    #[async_trait]
    impl Analyse for ScriptedEngine {
        async fn analyse_pv(
            &self,
            fen: &str,
            depth: u8,
            multipv: u8,
        ) -> Result<Evaluation, Error> {
            {
                let mut calls = self.calls.lock().unwrap();
                *calls += 1;
                if let Some(limit) = self.fail_after {
                    if *calls > limit {
                        return Err(Error::EngineCrashed("scripted failure".to_string()));
                    }
                }
            }

            let position = Position::from_fen(fen)
                .map_err(|_| Error::EngineCrashed(format!("unscripted fen {}", fen)))?;
            if position.is_terminal() {
                return Err(Error::IllegalPosition(fen.to_string()));
            }

            let (deep, shallow) = self.scores.get(fen).copied().unwrap_or((0, 0));
            let score_cp = if depth >= DEEP { deep } else { shallow };
            let override_pv = self.pv.get(fen);
            let ordered = ordered_moves(&position, override_pv.and_then(|l| l.first()).map(|s| s.as_str()));

            let lines: Vec<PvLine> = ordered
                .into_iter()
                .take(multipv as usize)
                .enumerate()
                .map(|(rank, first)| {
                    let pv = match override_pv {
                        Some(line) if rank == 0 => line.clone(),
                        _ => vec![first.clone()],
                    };
                    PvLine {
                        score_cp,
                        first,
                        pv,
                    }
                })
                .collect();

            Ok(Evaluation {
                score_cp: lines[0].score_cp,
                pv: lines[0].pv.clone(),
                multipv: lines,
                depth_used: depth,
            })
        }
    }

    fn config(target: u8, baseline: u8, branching_k: u8, max_iterations: u32) -> BuildConfig {
        BuildConfig {
            target,
            baseline,
            deep_depth: DEEP,
            shallow_depth: SHALLOW,
            branching_k,
            max_ply_from_root: 18,
            max_iterations,
        }
    }

    async fn run(
        engine: &ScriptedEngine,
        fen: &str,
        candidate: Option<&str>,
        config: BuildConfig,
    ) -> BuildOutcome {
        let root = Position::from_fen(fen).unwrap();
        TreeBuilder::new(engine, config)
            .build(&root, candidate, &RequestContext::default())
            .await
            .unwrap()
    }

    /// Structural invariants every returned tree must satisfy.
    fn check_invariants(records: &[NodeRecord], baseline: u8) {
        // Unique ids, exactly one root.
        let mut ids = HashSet::new();
        for record in records {
            assert!(ids.insert(record.id.clone()), "duplicate id {}", record.id);
        }
        let roots: Vec<_> = records.iter().filter(|r| r.parent_id.is_none()).collect();
        assert_eq!(roots.len(), 1, "exactly one root");
        assert!(roots[0].move_from_parent_san.is_none());

        let by_id: HashMap<&str, &NodeRecord> =
            records.iter().map(|r| (r.id.as_str(), r)).collect();

        for record in records {
            // FEN validity.
            let position = Position::from_fen(&record.position_fingerprint).unwrap();

            if let Some(parent_id) = &record.parent_id {
                let parent = by_id.get(parent_id.as_str()).expect("parent exists");
                // Ply increases by one along every edge.
                assert_eq!(record.ply_from_root, parent.ply_from_root + 1);
                // Applying the SAN to the parent reproduces the child FEN.
                let san = record.move_from_parent_san.as_ref().unwrap();
                let parent_pos = Position::from_fen(&parent.position_fingerprint).unwrap();
                let chess_move = parent_pos
                    .parse_move(san)
                    .unwrap_or_else(|_| panic!("{}: illegal SAN {}", record.id, san));
                assert_eq!(
                    parent_pos.apply(chess_move).fen(),
                    position.fen(),
                    "{}: SAN does not reproduce fingerprint",
                    record.id
                );
                // Child listed by its parent.
                assert!(parent.children_ids.contains(&record.id));
            }

            assert!(record.confidence_percent <= 100);
            assert!(record.confidence_frozen <= 100);

            // Color/shape coherence.
            assert_eq!(record.has_branches, record.shape == Shape::Triangle);
            if record.shape != Shape::Triangle {
                let expected = if record.confidence_percent >= baseline {
                    Color::Green
                } else {
                    Color::Red
                };
                assert_eq!(record.color, expected, "{}: baseline coloring", record.id);
            }
        }

        // The spine is a simple path with square endpoints.
        let spine: Vec<_> = records.iter().filter(|r| r.on_spine).collect();
        assert!(!spine.is_empty());
        assert_eq!(spine[0].shape, Shape::Square);
        assert_eq!(spine[spine.len() - 1].shape, Shape::Square);
        for (i, record) in spine.iter().enumerate() {
            assert_eq!(record.ply_from_root, i as u32);
            if i > 0 {
                assert_eq!(record.parent_id.as_deref(), Some(spine[i - 1].id.as_str()));
            }
            if i > 0 && i < spine.len() - 1 {
                assert_ne!(record.shape, Shape::Square, "interior spine square");
            }
        }
    }

    #[tokio::test]
    async fn test_quiet_line_reaches_target_without_extension() {
        let engine = ScriptedEngine::new().pv(STARTPOS, &["e2e4", "e7e5", "g1f3"]);
        let outcome = run(&engine, STARTPOS, None, config(70, 70, 3, 20)).await;

        assert_eq!(outcome.exit, BuildExit::TargetReached);
        assert_eq!(outcome.iterations, 0);
        assert_eq!(outcome.tree.len(), 4);
        assert_eq!(min_line_confidence(&outcome.tree, 70), 100);

        let records = outcome.tree.records();
        assert_eq!(records[0].id, "pv-0");
        assert_eq!(records[3].id, "pv-3");
        assert_eq!(records[1].move_from_parent_san.as_deref(), Some("e4"));
        assert!(records.iter().all(|r| r.on_spine));
        assert!(records.iter().all(|r| r.shape != Shape::Triangle));
        check_invariants(&records, 70);
    }

    #[tokio::test]
    async fn test_candidate_move_heads_the_spine() {
        let root = Position::from_fen(STARTPOS).unwrap();
        let p1 = root.apply_uci("d2d4").unwrap();
        let engine = ScriptedEngine::new().pv(p1.fen(), &["d7d5"]);
        let outcome = run(&engine, STARTPOS, Some("d4"), config(70, 70, 3, 20)).await;

        let records = outcome.tree.records();
        assert_eq!(records[1].move_from_parent_san.as_deref(), Some("d4"));
        assert_eq!(records[1].position_fingerprint, p1.fen());
        assert_eq!(records[2].move_from_parent_san.as_deref(), Some("d5"));
        check_invariants(&records, 70);
    }

    #[tokio::test]
    async fn test_mate_in_one_is_full_confidence() {
        let mate_fen = "6k1/5ppp/8/8/8/8/5PPP/R5K1 w - - 0 1";
        let engine = ScriptedEngine::new().pv(mate_fen, &["a1a8"]);
        let outcome = run(&engine, mate_fen, None, config(80, 80, 3, 20)).await;

        assert_eq!(outcome.exit, BuildExit::TargetReached);
        assert_eq!(outcome.tree.len(), 2);
        assert_eq!(overall_confidence(&outcome.tree, 80), 100);

        let records = outcome.tree.records();
        assert_eq!(records[1].move_from_parent_san.as_deref(), Some("Ra8#"));
        assert_eq!(records[1].confidence_percent, 100);
        assert!(records.iter().all(|r| r.shape != Shape::Triangle));
        check_invariants(&records, 80);
    }

    #[tokio::test]
    async fn test_red_circle_promotes_to_green_triangle() {
        let root = Position::from_fen(STARTPOS).unwrap();
        let p1 = root.apply_uci("e2e4").unwrap();
        // Deep/shallow disagreement after e4 makes pv-1 red (40); the
        // alternatives and their tails all agree, so the first extension
        // proves a satisfying alternative and the triangle turns green.
        let engine = ScriptedEngine::new()
            .pv(STARTPOS, &["e2e4", "e7e5"])
            .score(p1.fen(), 0, 60);
        let outcome = run(&engine, STARTPOS, None, config(70, 70, 2, 10)).await;

        assert_eq!(outcome.exit, BuildExit::NoEligibleNodes);
        assert_eq!(outcome.iterations, 1);

        let node1 = outcome.tree.node(1);
        assert_eq!(node1.shape, Shape::Triangle);
        assert_eq!(node1.color, Color::Green);
        assert_eq!(node1.frozen, 40);
        assert!(node1.has_branches);
        assert!(!node1.insufficient_confidence);

        // Two alternatives under the root, each with a one-ply tail.
        let root_children = &outcome.tree.node(0).children;
        assert_eq!(root_children.len(), 3);
        for &child in &root_children[1..] {
            let alt = outcome.tree.node(child);
            assert_ne!(alt.move_uci.as_deref(), Some("e2e4"));
            assert_eq!(alt.children.len(), 1);
            let tail = outcome.tree.node(alt.children[0]);
            assert_eq!(tail.shape, Shape::Square);
        }

        // pv-2 stays red and is never extended (final spine node).
        assert_eq!(overall_confidence(&outcome.tree, 70), 0);
        check_invariants(&outcome.tree.records(), 70);
    }

    #[tokio::test]
    async fn test_strong_alternative_with_weak_tail_turns_blue() {
        let root = Position::from_fen(STARTPOS).unwrap();
        let p1 = root.apply_uci("e2e4").unwrap();
        let mut engine = ScriptedEngine::new()
            .pv(STARTPOS, &["e2e4", "e7e5"])
            .score(p1.fen(), 0, 60);

        // Weaken every tail leaf: the alternatives themselves score full
        // confidence, but their one-ply continuations disagree across
        // depths and stay below the target.
        let ordered = ordered_moves(&root, Some("e2e4"));
        for alternative in &ordered[1..3] {
            let q = root.apply_uci(alternative).unwrap();
            let tail = ordered_moves(&q, None)[0].clone();
            let r = q.apply_uci(&tail).unwrap();
            engine = engine.score(r.fen(), 0, 50);
        }

        let outcome = run(&engine, STARTPOS, None, config(70, 70, 2, 1)).await;

        assert_eq!(outcome.exit, BuildExit::IterationBudget);
        let node1 = outcome.tree.node(1);
        assert_eq!(node1.color, Color::Blue);
        assert_eq!(node1.frozen, 40);
        assert!(!node1.insufficient_confidence);
        assert!(overall_confidence(&outcome.tree, 70) < 70);
        check_invariants(&outcome.tree.records(), 70);
    }

    #[tokio::test]
    async fn test_red_triangle_reextension_widens_the_window() {
        let root = Position::from_fen(STARTPOS).unwrap();
        let p1 = root.apply_uci("e2e4").unwrap();
        let mut engine = ScriptedEngine::new()
            .pv(STARTPOS, &["e2e4", "e7e5"])
            .score(p1.fen(), 0, 80);

        // Every alternative disagrees across depths: confidence 60, tails
        // 20. Nothing reaches the target, so the triangle stays red and
        // the second iteration re-extends it with a wider window.
        let ordered = ordered_moves(&root, Some("e2e4"));
        for alternative in &ordered[1..5] {
            let q = root.apply_uci(alternative).unwrap();
            engine = engine.score(q.fen(), 0, 40);
        }

        let outcome = run(&engine, STARTPOS, None, config(70, 70, 2, 2)).await;

        assert_eq!(outcome.exit, BuildExit::IterationBudget);
        let node1 = outcome.tree.node(1);
        assert_eq!(node1.color, Color::Red);
        assert!(node1.insufficient_confidence);
        assert_eq!(node1.extensions, 1);
        assert!(!node1.exhausted);

        // Four distinct alternatives spawned across the two rounds.
        let root_children = &outcome.tree.node(0).children;
        assert_eq!(root_children.len(), 5);
        let mut seen = HashSet::new();
        for &child in root_children.iter() {
            let uci = outcome.tree.node(child).move_uci.clone().unwrap();
            assert!(seen.insert(uci), "duplicate alternative");
        }
        check_invariants(&outcome.tree.records(), 70);
    }

    #[tokio::test]
    async fn test_exhausted_triangle_leaves_the_eligible_set() {
        // White has exactly two legal moves (Kh2, Kg2); one is the spine
        // move, so a single alternative exists and the second extension
        // round finds nothing new.
        let cramped = "k7/8/8/8/8/8/5p2/7K w - - 0 1";
        let root = Position::from_fen(cramped).unwrap();
        let p1 = root.apply_uci("h1h2").unwrap();
        let mut engine = ScriptedEngine::new().score(p1.fen(), 0, 100);

        let ordered = ordered_moves(&root, None);
        for alternative in ordered.iter().filter(|m| m.as_str() != "h1h2") {
            let q = root.apply_uci(alternative).unwrap();
            engine = engine.score(q.fen(), 0, 40);
        }

        let outcome = run(&engine, cramped, Some("h1h2"), config(70, 70, 3, 2)).await;

        assert_eq!(outcome.exit, BuildExit::IterationBudget);
        let node1 = outcome.tree.node(1);
        assert_eq!(node1.shape, Shape::Triangle);
        assert_eq!(node1.color, Color::Red);
        assert!(node1.exhausted);
        assert_eq!(node1.extensions, 1);
        // Spine child plus the single legal alternative.
        assert_eq!(outcome.tree.node(0).children.len(), 2);
        check_invariants(&outcome.tree.records(), 70);
    }

    #[tokio::test]
    async fn test_two_consecutive_failed_extensions_abort() {
        let root = Position::from_fen(STARTPOS).unwrap();
        let p1 = root.apply_uci("e2e4").unwrap();
        // The spine costs exactly six engine calls; everything after that
        // crashes, so both extension attempts fail.
        let engine = ScriptedEngine::new()
            .pv(STARTPOS, &["e2e4", "e7e5"])
            .score(p1.fen(), 0, 60)
            .fail_after(6);

        let root_pos = Position::from_fen(STARTPOS).unwrap();
        let result = TreeBuilder::new(&engine, config(70, 70, 2, 10))
            .build(&root_pos, None, &RequestContext::default())
            .await;

        assert!(matches!(result, Err(Error::EngineUnavailable)));
    }

    #[tokio::test]
    async fn test_cancellation_at_iteration_boundary() {
        let root = Position::from_fen(STARTPOS).unwrap();
        let p1 = root.apply_uci("e2e4").unwrap();
        let engine = ScriptedEngine::new()
            .pv(STARTPOS, &["e2e4", "e7e5"])
            .score(p1.fen(), 0, 60);

        let ctx = RequestContext::default();
        ctx.cancel.cancel();

        let result = TreeBuilder::new(&engine, config(70, 70, 2, 10))
            .build(&root, None, &ctx)
            .await;
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn test_expired_deadline_returns_partial_tree() {
        let root = Position::from_fen(STARTPOS).unwrap();
        let p1 = root.apply_uci("e2e4").unwrap();
        let engine = ScriptedEngine::new()
            .pv(STARTPOS, &["e2e4", "e7e5"])
            .score(p1.fen(), 0, 60);

        let ctx = RequestContext {
            deadline: Some(Instant::now()),
            cancel: CancelToken::new(),
        };
        let outcome = TreeBuilder::new(&engine, config(70, 70, 2, 10))
            .build(&root, None, &ctx)
            .await
            .unwrap();

        assert_eq!(outcome.exit, BuildExit::Timeout);
        assert_eq!(outcome.iterations, 0);
        // The spine alone, still a well-formed tree.
        assert_eq!(outcome.tree.len(), 3);
        check_invariants(&outcome.tree.records(), 70);
    }

    #[tokio::test]
    async fn test_engine_call_budget() {
        let root = Position::from_fen(STARTPOS).unwrap();
        let p1 = root.apply_uci("e2e4").unwrap();
        let mut engine = ScriptedEngine::new()
            .pv(STARTPOS, &["e2e4", "e7e5"])
            .score(p1.fen(), 0, 80);
        let ordered = ordered_moves(&root, Some("e2e4"));
        for alternative in &ordered[1..5] {
            let q = root.apply_uci(alternative).unwrap();
            engine = engine.score(q.fen(), 0, 40);
        }

        let branching_k = 2u32;
        let outcome = run(&engine, STARTPOS, None, config(70, 70, 2, 2)).await;

        let spine_length = outcome.tree.spine().len() as u32;
        let bound = 2 * spine_length + outcome.iterations * (2 + 4 * branching_k);
        assert!(
            outcome.engine_calls <= bound,
            "engine calls {} exceed bound {}",
            outcome.engine_calls,
            bound
        );
    }

    #[tokio::test]
    async fn test_deterministic_engine_gives_identical_trees() {
        let root = Position::from_fen(STARTPOS).unwrap();
        let p1 = root.apply_uci("e2e4").unwrap();
        let engine = ScriptedEngine::new()
            .pv(STARTPOS, &["e2e4", "e7e5"])
            .score(p1.fen(), 0, 60);

        let first = run(&engine, STARTPOS, None, config(70, 70, 2, 10)).await;
        let second = run(&engine, STARTPOS, None, config(70, 70, 2, 10)).await;
        assert_eq!(first.tree.records(), second.tree.records());
    }

    #[tokio::test]
    async fn test_baseline_changes_colors_only() {
        let root = Position::from_fen(STARTPOS).unwrap();
        let p1 = root.apply_uci("e2e4").unwrap();
        let mut engine = ScriptedEngine::new()
            .pv(STARTPOS, &["e2e4", "e7e5"])
            .score(p1.fen(), 0, 60);

        // Tail leaves land at 80: green under a 70 baseline, red under a
        // 100 baseline, while the extension verdict (target 70) is
        // unaffected.
        let ordered = ordered_moves(&root, Some("e2e4"));
        for alternative in &ordered[1..3] {
            let q = root.apply_uci(alternative).unwrap();
            let tail = ordered_moves(&q, None)[0].clone();
            let r = q.apply_uci(&tail).unwrap();
            engine = engine.score(r.fen(), 0, 20);
        }

        let lenient = run(&engine, STARTPOS, None, config(70, 70, 2, 10)).await;
        let strict = run(&engine, STARTPOS, None, config(70, 100, 2, 10)).await;

        let lenient_records = lenient.tree.records();
        let strict_records = strict.tree.records();
        assert_eq!(lenient_records.len(), strict_records.len());
        let mut recolored = 0;
        for (a, b) in lenient_records.iter().zip(strict_records.iter()) {
            assert_eq!(a.id, b.id);
            assert_eq!(a.position_fingerprint, b.position_fingerprint);
            assert_eq!(a.confidence_percent, b.confidence_percent);
            assert_eq!(a.shape, b.shape);
            if a.shape == Shape::Triangle {
                // Triangle colors come from the target verdict, not the
                // baseline.
                assert_eq!(a.color, b.color);
            } else if a.color != b.color {
                recolored += 1;
            }
        }
        assert!(recolored > 0, "baseline shift should recolor some nodes");
        check_invariants(&strict_records, 100);
    }

    #[tokio::test]
    async fn test_ply_budget_caps_the_spine() {
        let engine = ScriptedEngine::new().pv(STARTPOS, &["e2e4", "e7e5", "g1f3", "b8c6", "f1b5"]);
        let mut cfg = config(70, 70, 3, 20);
        cfg.max_ply_from_root = 2;
        let outcome = run(&engine, STARTPOS, None, cfg).await;

        assert_eq!(outcome.tree.spine().len(), 3);
        assert!(outcome.tree.nodes().iter().all(|n| n.ply <= 2));
        check_invariants(&outcome.tree.records(), 70);
    }
}
