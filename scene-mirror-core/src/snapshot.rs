//! Point-in-time, owned view of the mirrored tree.
//!
//! Each handle is expanded once per capture, at its first position in depth-first order.
//! Any later link to it (shared child or cycle) is emitted as a leaf with `repeated` set,
//! so the snapshot stays linear in the size of the store.

use crate::store::SceneStore;
use crate::types::{ChildSlot, Handle, IconHint, ItemKind, LoadState, SceneNode};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt::Write as _;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotNode {
    pub handle: Option<Handle>,
    pub name: String,
    pub type_tag: String,
    pub kind: ItemKind,
    pub icon: IconHint,
    pub state: LoadState,
    /// Label of the pin this node hangs off, when the parent is a node.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pin: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attributes: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub repeated: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<SnapshotNode>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeSnapshot {
    pub generation: u64,
    /// Committed nodes in the registry, each counted once.
    pub node_count: usize,
    pub roots: Vec<SnapshotNode>,
}

impl TreeSnapshot {
    /// Copy the store's current forest into an owned tree.
    pub fn capture(store: &SceneStore, generation: u64) -> Self {
        let mut expanded = HashSet::new();
        let roots = store
            .tree()
            .iter()
            .filter_map(|slot| Self::capture_slot(store, slot, None, &mut expanded))
            .collect();
        Self {
            generation,
            node_count: store.len(),
            roots,
        }
    }

    fn capture_slot(
        store: &SceneStore,
        slot: &ChildSlot,
        via: Option<String>,
        expanded: &mut HashSet<Handle>,
    ) -> Option<SnapshotNode> {
        match slot {
            ChildSlot::Unconnected { node } => Some(Self::leaf(node, via, false)),
            ChildSlot::Linked { handle: parent } => {
                let node = store.get(*parent)?;
                if !expanded.insert(*parent) {
                    return Some(Self::leaf(&node, via, true));
                }
                let mut captured = Self::leaf(&node, via, false);
                captured.children = node
                    .children
                    .iter()
                    .filter_map(|child| {
                        let label = match child {
                            ChildSlot::Unconnected { node } => {
                                node.pin.as_ref().map(|p| p.label.clone())
                            }
                            // The child's own pin link may point at another parent.
                            ChildSlot::Linked { handle } => store
                                .get(*handle)
                                .and_then(|c| c.pin)
                                .filter(|p| p.parent == *parent)
                                .map(|p| p.label),
                        };
                        Self::capture_slot(store, child, label, expanded)
                    })
                    .collect();
                Some(captured)
            }
        }
    }

    fn leaf(node: &SceneNode, via: Option<String>, repeated: bool) -> SnapshotNode {
        SnapshotNode {
            handle: node.handle,
            name: node.name.clone(),
            type_tag: node.type_tag.clone(),
            kind: node.kind,
            icon: node.icon,
            state: node.state,
            pin: via,
            attributes: node.attributes.clone(),
            repeated,
            children: Vec::new(),
        }
    }

    /// Every node in depth-first order with its depth (top level is 0).
    pub fn walk(&self) -> Vec<(usize, &SnapshotNode)> {
        fn visit<'s>(
            node: &'s SnapshotNode,
            depth: usize,
            out: &mut Vec<(usize, &'s SnapshotNode)>,
        ) {
            out.push((depth, node));
            for child in &node.children {
                visit(child, depth + 1, out);
            }
        }
        let mut out = Vec::new();
        for root in &self.roots {
            visit(root, 0, &mut out);
        }
        out
    }

    /// Indented text rendering, one node per line.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (depth, node) in self.walk() {
            let indent = "  ".repeat(depth);
            let label = match (&node.pin, node.kind) {
                (Some(pin), ItemKind::Unconnected) => format!("{pin}: (unconnected)"),
                (Some(pin), _) => format!("{pin} -> {}", node.name),
                (None, _) => node.name.clone(),
            };
            let marker = match node.state {
                LoadState::Error => " !",
                _ if node.repeated => " ↺",
                _ => "",
            };
            let _ = writeln!(out, "{indent}{label} [{}]{marker}", node.type_tag);
        }
        out
    }
}
