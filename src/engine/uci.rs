//! UCI wire codec, built on `vampirc_uci`.
//!
//! Commands go out as serialized [`UciMessage`] values and engine output
//! comes back through [`parse_one`]; this module only adds what the wire
//! format does not carry: saturation of mate scores into the centipawn
//! domain, and assembly of per-rank `info` lines into one evaluation.
//!
//! Multi-PV parsing is the uniform path: a single-PV search is just a
//! multi-PV table with one line.

use std::collections::BTreeMap;

use vampirc_uci::{parse_one, UciFen, UciInfoAttribute, UciMessage, UciSearchControl};

use crate::error::Error;

/// Saturation bound for all centipawn arithmetic. Mate-in-n maps to this
/// constant (signed) before any score enters the confidence formula.
pub const MATE_CP: i32 = 10_000;

/// An engine score as reported on an `info` line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Score {
    Cp(i32),
    Mate(i32),
}

impl Score {
    /// Saturated centipawns in [-MATE_CP, MATE_CP].
    pub fn to_cp(self) -> i32 {
        match self {
            Score::Cp(cp) => cp.clamp(-MATE_CP, MATE_CP),
            Score::Mate(n) if n >= 0 => MATE_CP,
            Score::Mate(_) => -MATE_CP,
        }
    }

    pub fn is_mate(self) -> bool {
        matches!(self, Score::Mate(_))
    }
}

/// One parsed `info` line carrying a scored principal variation.
#[derive(Debug, Clone)]
pub struct InfoLine {
    pub depth: u8,
    pub multipv: u8,
    pub score: Score,
    pub pv: Vec<String>,
}

/// Extract the scored PV from an `info` line, if it carries one.
///
/// Lines without both a score and a pv (currmove reports, string infos)
/// and fail-high/fail-low bound reports are ignored.
pub fn parse_info(line: &str) -> Option<InfoLine> {
    let UciMessage::Info(attributes) = parse_one(line) else {
        return None;
    };

    let mut depth: Option<u8> = None;
    let mut multipv: u8 = 1;
    let mut score: Option<Score> = None;
    let mut pv: Vec<String> = Vec::new();

    for attribute in attributes {
        match attribute {
            UciInfoAttribute::Depth(d) => depth = Some(d),
            UciInfoAttribute::MultiPv(rank) => multipv = rank.min(u8::MAX as u16) as u8,
            UciInfoAttribute::Score {
                cp,
                mate,
                lower_bound,
                upper_bound,
            } => {
                if lower_bound.is_some() || upper_bound.is_some() {
                    // Transient fail-high/low report; wait for the exact
                    // score.
                    return None;
                }
                score = match (cp, mate) {
                    (_, Some(moves)) => Some(Score::Mate(moves as i32)),
                    (Some(cp), None) => Some(Score::Cp(cp)),
                    (None, None) => None,
                };
            }
            UciInfoAttribute::Pv(moves) => {
                pv = moves.iter().map(|m| m.to_string()).collect();
            }
            _ => {}
        }
    }

    match (depth, score) {
        (Some(depth), Some(score)) if !pv.is_empty() => Some(InfoLine {
            depth,
            multipv,
            score,
            pv,
        }),
        _ => None,
    }
}

/// Parse a `bestmove` line. Returns `None` for non-bestmove lines,
/// `Some(None)` for `bestmove (none)` (terminal position), and
/// `Some(Some(uci))` otherwise.
pub fn parse_bestmove(line: &str) -> Option<Option<String>> {
    match parse_one(line) {
        UciMessage::BestMove { best_move, .. } => Some(Some(best_move.to_string())),
        // `bestmove (none)` carries no legal move, which the UCI grammar
        // cannot represent; it surfaces as an unknown message.
        UciMessage::Unknown(..) if line.trim_start().starts_with("bestmove") => Some(None),
        _ => None,
    }
}

pub fn is_uciok(line: &str) -> bool {
    matches!(parse_one(line), UciMessage::UciOk)
}

pub fn is_readyok(line: &str) -> bool {
    matches!(parse_one(line), UciMessage::ReadyOk)
}

pub fn uci_command() -> String {
    UciMessage::Uci.to_string()
}

pub fn isready_command() -> String {
    UciMessage::IsReady.to_string()
}

pub fn ucinewgame_command() -> String {
    UciMessage::UciNewGame.to_string()
}

pub fn quit_command() -> String {
    UciMessage::Quit.to_string()
}

pub fn position_command(fen: &str) -> String {
    UciMessage::Position {
        startpos: false,
        fen: Some(UciFen::from(fen)),
        moves: Vec::new(),
    }
    .to_string()
}

pub fn go_command(depth: u8) -> String {
    UciMessage::Go {
        time_control: None,
        search_control: Some(UciSearchControl::depth(depth)),
    }
    .to_string()
}

pub fn setoption_command(name: &str, value: &str) -> String {
    UciMessage::SetOption {
        name: name.to_string(),
        value: Some(value.to_string()),
    }
    .to_string()
}

/// Accumulates `info` lines during one search and assembles the final
/// [`Evaluation`](super::Evaluation) when `bestmove` arrives.
///
/// Engines re-emit every multi-PV line at each completed depth, so
/// last-write-wins per rank leaves the table holding the deepest results.
#[derive(Debug, Default)]
pub struct MultiPvTable {
    lines: BTreeMap<u8, InfoLine>,
}

impl MultiPvTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ingest(&mut self, line: &str) {
        if let Some(info) = parse_info(line) {
            self.lines.insert(info.multipv, info);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Build the evaluation from the accumulated table.
    pub fn finish(self) -> Result<super::Evaluation, Error> {
        let depth_used = self.lines.values().map(|info| info.depth).max().unwrap_or(0);
        let multipv: Vec<super::PvLine> = self
            .lines
            .into_values()
            .map(|info| super::PvLine {
                score_cp: info.score.to_cp(),
                first: info.pv[0].clone(),
                pv: info.pv,
            })
            .collect();

        let best = multipv
            .first()
            .ok_or_else(|| Error::EngineCrashed("search produced no scored lines".to_string()))?;

        Ok(super::Evaluation {
            score_cp: best.score_cp,
            pv: best.pv.clone(),
            depth_used,
            multipv,
        })
    }
}
