//! Arena-backed confidence tree.
//!
//! All nodes live in one growable vector; parent/child links are indices.
//! Records come out in creation order, which is spine order first, then
//! branches in extension order.

use super::node::{Color, Node, NodeIndex, NodeRecord, Shape};

#[derive(Debug)]
pub struct Tree {
    nodes: Vec<Node>,
    spine: Vec<NodeIndex>,
}

impl Tree {
    /// Create a tree holding only the synthetic root (`pv-0`): the input
    /// position itself, before any move. It carries full confidence —
    /// there is no move to doubt — and anchors first-move alternatives.
    pub fn new(root_fen: &str) -> Self {
        let root = Node {
            id: "pv-0".to_string(),
            parent: None,
            children: Vec::new(),
            fen: root_fen.to_string(),
            move_san: None,
            move_uci: None,
            ply: 0,
            confidence: 100,
            frozen: 100,
            shape: Shape::Square,
            color: Color::Green,
            has_branches: false,
            insufficient_confidence: false,
            on_spine: true,
            extensions: 0,
            exhausted: false,
        };
        Self {
            nodes: vec![root],
            spine: vec![0],
        }
    }

    pub fn root(&self) -> NodeIndex {
        0
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, index: NodeIndex) -> &Node {
        &self.nodes[index]
    }

    pub fn node_mut(&mut self, index: NodeIndex) -> &mut Node {
        &mut self.nodes[index]
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Spine node indices, root first.
    pub fn spine(&self) -> &[NodeIndex] {
        &self.spine
    }

    pub fn last_spine(&self) -> NodeIndex {
        *self.spine.last().unwrap_or(&0)
    }

    /// Append the next spine node (`pv-<i>`). Interior shape is circle;
    /// `seal_spine` squares the final node once the walk is done.
    pub fn push_spine(
        &mut self,
        fen: &str,
        move_san: String,
        move_uci: String,
        confidence: u8,
        baseline: u8,
    ) -> NodeIndex {
        let parent = self.last_spine();
        let index = self.nodes.len();
        let ply = self.nodes[parent].ply + 1;
        self.nodes.push(Node {
            id: format!("pv-{}", self.spine.len()),
            parent: Some(parent),
            children: Vec::new(),
            fen: fen.to_string(),
            move_san: Some(move_san),
            move_uci: Some(move_uci),
            ply,
            confidence,
            frozen: confidence,
            shape: Shape::Circle,
            color: color_for(confidence, baseline),
            has_branches: false,
            insufficient_confidence: false,
            on_spine: true,
            extensions: 0,
            exhausted: false,
        });
        self.nodes[parent].children.push(index);
        self.spine.push(index);
        index
    }

    /// Square the final spine node. The root is already square.
    pub fn seal_spine(&mut self) {
        let last = self.last_spine();
        self.nodes[last].shape = Shape::Square;
    }

    /// Add a branch node (an alternative or a tail node) under `parent`.
    pub fn push_branch(
        &mut self,
        parent: NodeIndex,
        fen: &str,
        move_san: String,
        move_uci: String,
        confidence: u8,
        baseline: u8,
        shape: Shape,
    ) -> NodeIndex {
        let index = self.nodes.len();
        let ply = self.nodes[parent].ply + 1;
        let id = format!("{}-b{}", self.nodes[parent].id, self.nodes[parent].children.len());
        self.nodes.push(Node {
            id,
            parent: Some(parent),
            children: Vec::new(),
            fen: fen.to_string(),
            move_san: Some(move_san),
            move_uci: Some(move_uci),
            ply,
            confidence,
            frozen: confidence,
            shape,
            color: color_for(confidence, baseline),
            has_branches: false,
            insufficient_confidence: false,
            on_spine: false,
            extensions: 0,
            exhausted: false,
        });
        self.nodes[parent].children.push(index);
        index
    }

    /// UCI moves already present among `parent`'s children. Used to keep
    /// re-extensions from spawning duplicate alternatives.
    pub fn sibling_moves(&self, parent: NodeIndex) -> Vec<String> {
        self.nodes[parent]
            .children
            .iter()
            .filter_map(|&child| self.nodes[child].move_uci.clone())
            .collect()
    }

    /// Freeze the tree into serializable records, creation order.
    pub fn records(&self) -> Vec<NodeRecord> {
        self.nodes
            .iter()
            .map(|node| NodeRecord {
                id: node.id.clone(),
                parent_id: node.parent.map(|p| self.nodes[p].id.clone()),
                position_fingerprint: node.fen.clone(),
                move_from_parent_san: node.move_san.clone(),
                ply_from_root: node.ply,
                confidence_percent: node.confidence,
                confidence_frozen: node.frozen,
                shape: node.shape,
                color: node.color,
                has_branches: node.has_branches,
                insufficient_confidence: node.insufficient_confidence,
                on_spine: node.on_spine,
                children_ids: node
                    .children
                    .iter()
                    .map(|&child| self.nodes[child].id.clone())
                    .collect(),
            })
            .collect()
    }
}

/// Baseline coloring for non-triangle nodes. Triangles are recolored by
/// the extension verdict instead.
pub fn color_for(confidence: u8, baseline: u8) -> Color {
    if confidence >= baseline {
        Color::Green
    } else {
        Color::Red
    }
}
