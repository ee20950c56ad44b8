//! Node model for the confidence tree.

use serde::Serialize;

/// Index into the tree's arena. Creation order doubles as the stable
/// tie-breaker for victim selection.
pub type NodeIndex = usize;

/// Display shape of a node.
///
/// Squares mark line endpoints (spine ends, branch-tail leaves), circles
/// mark interior nodes, and a triangle marks a node that has been extended
/// with sibling alternatives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Shape {
    Square,
    Circle,
    Triangle,
}

/// Display color of a node.
///
/// Non-triangles are green when their confidence meets the baseline, red
/// otherwise. Triangles carry the extension verdict: green (an alternative
/// already reaches the target), blue (a strong alternative exists but its
/// short tail has not proven it), red (nothing found yet).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Color {
    Green,
    Red,
    Blue,
}

/// A vertex of the confidence tree, linked by arena indices.
#[derive(Debug, Clone)]
pub struct Node {
    /// Stable string id: `pv-<i>` on the spine, `<parent-id>-b<j>` off it.
    pub id: String,
    pub parent: Option<NodeIndex>,
    /// Children in branching order (stable).
    pub children: Vec<NodeIndex>,
    /// FEN of the position this node represents.
    pub fen: String,
    /// SAN of the move that reaches this node (None only at the root).
    pub move_san: Option<String>,
    /// Same move in UCI, used to exclude already-spawned alternatives.
    pub move_uci: Option<String>,
    pub ply: u32,
    /// Current confidence in [0, 100].
    pub confidence: u8,
    /// Snapshot of `confidence` taken when the node became a triangle.
    pub frozen: u8,
    pub shape: Shape,
    pub color: Color,
    pub has_branches: bool,
    /// Only meaningful on triangles: true while no alternative has
    /// satisfied the target.
    pub insufficient_confidence: bool,
    pub on_spine: bool,
    /// How many times this node has been extended; widens the multi-PV
    /// window on re-extension.
    pub extensions: u32,
    /// No unexplored alternatives remain at this decision point.
    pub exhausted: bool,
}

impl Node {
    pub fn is_triangle(&self) -> bool {
        self.shape == Shape::Triangle
    }

    /// Ordering key for victim selection: triangles compare by their
    /// frozen snapshot, everything else by current confidence.
    pub fn effective_confidence(&self) -> u8 {
        if self.is_triangle() {
            self.frozen
        } else {
            self.confidence
        }
    }
}

/// The serialized, frozen form of a node, in the shape callers consume.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeRecord {
    pub id: String,
    pub parent_id: Option<String>,
    pub position_fingerprint: String,
    pub move_from_parent_san: Option<String>,
    pub ply_from_root: u32,
    pub confidence_percent: u8,
    pub confidence_frozen: u8,
    pub shape: Shape,
    pub color: Color,
    pub has_branches: bool,
    pub insufficient_confidence: bool,
    pub on_spine: bool,
    pub children_ids: Vec<String>,
}
