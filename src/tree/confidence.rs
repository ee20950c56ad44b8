//! The confidence formula.
//!
//! Four engine numbers describe one played move, all in saturated
//! centipawns from the mover's point of view: the played move's score at
//! deep and shallow depth, and the engine-preferred move's score at deep
//! and shallow depth. Confidence penalizes the three disagreements —
//! shallow vs deep on the played move, shallow vs deep on the best move,
//! and shallow-best vs deep-played. A move only scores high when all
//! three gaps are small.

use crate::engine::uci::MATE_CP;
use crate::position::PositionStatus;

/// Inputs to the formula, mover's perspective.
#[derive(Debug, Clone, Copy)]
pub struct ConfidenceInputs {
    /// Played move at deep depth.
    pub s_deep: i32,
    /// Played move at shallow depth.
    pub s_shallow: i32,
    /// Engine-preferred move at deep depth.
    pub pv_deep: i32,
    /// Engine-preferred move at shallow depth.
    pub pv_shallow: i32,
}

/// `100 − |s_deep − s_shallow| − |pv_deep − pv_shallow| − |pv_shallow − s_deep|`,
/// clamped to [0, 100]. Inputs are saturated before the arithmetic, so
/// mate scores cannot overflow the differences.
pub fn confidence(inputs: &ConfidenceInputs) -> u8 {
    let s_deep = saturate(inputs.s_deep) as i64;
    let s_shallow = saturate(inputs.s_shallow) as i64;
    let pv_deep = saturate(inputs.pv_deep) as i64;
    let pv_shallow = saturate(inputs.pv_shallow) as i64;

    let raw = 100
        - (s_deep - s_shallow).abs()
        - (pv_deep - pv_shallow).abs()
        - (pv_shallow - s_deep).abs();
    raw.clamp(0, 100) as u8
}

/// Confidence of a move that lands in a terminal position, from the
/// perspective of the side that played it: delivering mate is certainty,
/// delivering stalemate is none. Explicit, not derived from the formula.
pub fn terminal_confidence(status: PositionStatus) -> u8 {
    match status {
        PositionStatus::Checkmate => 100,
        _ => 0,
    }
}

pub fn saturate(score_cp: i32) -> i32 {
    score_cp.clamp(-MATE_CP, MATE_CP)
}
