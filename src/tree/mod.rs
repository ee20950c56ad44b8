//! The confidence tree: data model, formula, builder, and aggregates.
//!
//! A tree is built once per request and frozen on return. Nodes live in a
//! flat arena (`Vec<Node>`) and reference each other by index, which keeps
//! parent/child links cycle-free, iteration contiguous, and the victim
//! tie-breaker (creation order) stable.
//!
//! ```text
//! pv-0 ── pv-1 ── pv-2 ── pv-3          the spine (engine PV)
//!   │       △
//!   ├── pv-0-b1 ── pv-0-b1-b0           siblings of pv-1: what else
//!   └── pv-0-b2 ── pv-0-b2-b0           could have been played here?
//! ```
//!
//! Extending a node spawns *siblings* (children of its parent): a triangle
//! marks the decision point "was there a better alternative to this move",
//! and the alternatives each carry a short PV tail so the line stays
//! readable.

pub mod aggregate;
pub mod builder;
pub mod confidence;
pub mod node;
pub mod tree;

pub use aggregate::{line_confidence, min_line_confidence, overall_confidence};
pub use builder::{BuildConfig, BuildExit, BuildOutcome, CancelToken, RequestContext, TreeBuilder};
pub use confidence::{confidence, terminal_confidence, ConfidenceInputs};
pub use node::{Color, Node, NodeIndex, NodeRecord, Shape};
pub use tree::{color_for, Tree};
