//! Aggregate confidence over a finished (or in-progress) tree.
//!
//! The spine alone decides the line's fate. A triangle that has turned
//! green or blue counts as satisfied (it contributes the target value);
//! a red triangle contributes the confidence it was frozen with; plain
//! nodes contribute their current confidence. Without the satisfied rule
//! a blue triangle with a low frozen value would hold the build loop
//! hostage forever.

use super::node::{Color, Node};
use super::tree::Tree;

/// Per-node contribution to the line minimum.
fn line_value(node: &Node, target: u8) -> u8 {
    if node.is_triangle() {
        match node.color {
            Color::Red => node.frozen,
            Color::Green | Color::Blue => target,
        }
    } else {
        node.confidence
    }
}

/// Minimum line value over the spine. The build loop runs until this
/// reaches the target (or a budget runs out).
pub fn min_line_confidence(tree: &Tree, target: u8) -> u8 {
    tree.spine()
        .iter()
        .map(|&index| line_value(tree.node(index), target))
        .min()
        .unwrap_or(0)
}

/// Overall confidence of the finished tree, clamped to [0, 100].
pub fn overall_confidence(tree: &Tree, target: u8) -> u8 {
    min_line_confidence(tree, target).min(100)
}

/// Per-line confidence. With a single declared line this is the overall
/// value.
pub fn line_confidence(tree: &Tree, target: u8) -> u8 {
    overall_confidence(tree, target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::node::Shape;

    const FEN: &str = "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1";

    fn spine_tree(confidences: &[u8]) -> Tree {
        let mut tree = Tree::new(FEN);
        for (i, &confidence) in confidences.iter().enumerate() {
            tree.push_spine(&format!("fen-{}", i), "m".to_string(), "m".to_string(), confidence, 80);
        }
        tree.seal_spine();
        tree
    }

    fn make_triangle(tree: &mut Tree, index: usize, frozen: u8, color: Color) {
        let node = tree.node_mut(index);
        node.shape = Shape::Triangle;
        node.has_branches = true;
        node.frozen = frozen;
        node.color = color;
        node.insufficient_confidence = color == Color::Red;
    }

    #[test]
    fn test_min_over_plain_spine() {
        let tree = spine_tree(&[90, 55, 85]);
        assert_eq!(min_line_confidence(&tree, 80), 55);
    }

    #[test]
    fn test_red_triangle_contributes_frozen() {
        let mut tree = spine_tree(&[90, 95, 85]);
        make_triangle(&mut tree, 2, 40, Color::Red);
        assert_eq!(min_line_confidence(&tree, 80), 40);
    }

    #[test]
    fn test_blue_and_green_triangles_count_as_satisfied() {
        let mut tree = spine_tree(&[90, 95, 85]);
        make_triangle(&mut tree, 2, 40, Color::Blue);
        assert_eq!(min_line_confidence(&tree, 80), 80);

        make_triangle(&mut tree, 2, 40, Color::Green);
        assert_eq!(min_line_confidence(&tree, 80), 80);
    }

    #[test]
    fn test_branch_nodes_do_not_count() {
        let mut tree = spine_tree(&[90, 95]);
        tree.push_branch(0, "fen-alt", "a".to_string(), "a".to_string(), 5, 80, Shape::Circle);
        assert_eq!(min_line_confidence(&tree, 80), 90);
    }

    #[test]
    fn test_root_alone_is_full_confidence() {
        let tree = Tree::new(FEN);
        assert_eq!(min_line_confidence(&tree, 80), 100);
    }
}
