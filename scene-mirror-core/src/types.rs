use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

// ─── Scalar aliases ───────────────────────────────────────────

/// Opaque integer identity of a remote item (graph, node or pin target).
pub type Handle = u64;

// ─── Item classification ──────────────────────────────────────

/// What a remote item is, as far as tree structure is concerned.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    /// Owns an ordered list of child items.
    Graph,
    /// Exposes a fixed number of pins, each optionally connected to another item.
    Node,
    /// Placeholder for a pin with nothing connected. Never has a handle.
    Unconnected,
}

/// Load state of a mirrored node.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadState {
    /// Name and handle known, children not fetched yet.
    #[default]
    Skeleton,
    /// Children are being fetched.
    Loading,
    /// Children fetched (or the item has none).
    Loaded,
    /// Fetching the children failed; the subtree is absent.
    Error,
}

/// Display hint for consumers rendering the tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IconHint {
    Graph,
    Geometry,
    Material,
    Texture,
    Camera,
    Light,
    Render,
    Value,
    Pin,
    Generic,
}

impl IconHint {
    /// Derive an icon from the item kind and its remote type tag.
    pub fn for_item(kind: ItemKind, type_tag: &str) -> Self {
        if kind == ItemKind::Graph {
            return IconHint::Graph;
        }
        if kind == ItemKind::Unconnected {
            return IconHint::Pin;
        }

        let tag = type_tag.to_ascii_lowercase();
        if tag.contains("geometry") || tag.contains("mesh") {
            IconHint::Geometry
        } else if tag.contains("material") {
            IconHint::Material
        } else if tag.contains("texture") || tag.contains("image") {
            IconHint::Texture
        } else if tag.contains("camera") {
            IconHint::Camera
        } else if tag.contains("light") || tag.contains("emission") {
            IconHint::Light
        } else if tag.contains("render") || tag.contains("kernel") {
            IconHint::Render
        } else if tag.contains("float") || tag.contains("int") || tag.contains("bool") {
            IconHint::Value
        } else {
            IconHint::Generic
        }
    }
}

// ─── Tree structure ───────────────────────────────────────────

/// Relation from a node back to the pin currently referencing it.
///
/// This is a relation only; the parent does not own the target through it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinLink {
    pub parent: Handle,
    pub index: u32,
    pub label: String,
    /// Numeric pin id reported by the remote.
    pub id: i64,
}

/// One entry in a node's ordered child list.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "slot", rename_all = "snake_case")]
pub enum ChildSlot {
    /// Canonical node held by the store's map. Several parents may link the same handle.
    Linked { handle: Handle },
    /// Handle-less placeholder for an unconnected pin, owned by this parent only.
    Unconnected { node: Box<SceneNode> },
}

impl ChildSlot {
    pub fn linked(handle: Handle) -> Self {
        ChildSlot::Linked { handle }
    }

    pub fn handle(&self) -> Option<Handle> {
        match self {
            ChildSlot::Linked { handle } => Some(*handle),
            ChildSlot::Unconnected { .. } => None,
        }
    }
}

/// A mirrored remote item.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SceneNode {
    /// Absent only for unconnected-pin placeholders.
    pub handle: Option<Handle>,
    pub name: String,
    pub type_tag: String,
    pub kind: ItemKind,
    pub icon: IconHint,
    /// Depth in the mirrored tree; top-level items of the root are level 1.
    pub level: u32,
    pub children: Vec<ChildSlot>,
    pub pin: Option<PinLink>,
    pub state: LoadState,
    /// Attribute payload, fetched eagerly or on demand.
    pub attributes: Option<serde_json::Value>,
}

impl SceneNode {
    /// Skeleton node for a freshly materialized item.
    pub fn skeleton(
        handle: Handle,
        name: String,
        type_tag: String,
        kind: ItemKind,
        level: u32,
    ) -> Self {
        let icon = IconHint::for_item(kind, &type_tag);
        Self {
            handle: Some(handle),
            name,
            type_tag,
            kind,
            icon,
            level,
            children: Vec::new(),
            pin: None,
            state: LoadState::Skeleton,
            attributes: None,
        }
    }

    /// Placeholder child for a pin with nothing connected.
    pub fn unconnected(pin: PinLink, level: u32) -> Self {
        Self {
            handle: None,
            name: pin.label.clone(),
            type_tag: "unconnected".to_string(),
            kind: ItemKind::Unconnected,
            icon: IconHint::Pin,
            level,
            children: Vec::new(),
            pin: Some(pin),
            state: LoadState::Loaded,
            attributes: None,
        }
    }

    pub fn is_placeholder(&self) -> bool {
        self.handle.is_none()
    }

    /// Handles of linked children, in order.
    pub fn child_handles(&self) -> impl Iterator<Item = Handle> + '_ {
        self.children.iter().filter_map(ChildSlot::handle)
    }
}

// ─── Scheduler items ──────────────────────────────────────────

/// Priority tier of a queued load.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    Normal,
    Low,
}

/// What a queued load should fetch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchKind {
    Details,
    Children,
    Attributes,
}

/// A unit of deferred work.
#[derive(Clone, Debug)]
pub struct LoadItem {
    pub handle: Handle,
    pub priority: Priority,
    pub kind: FetchKind,
    /// When the handle first entered a queue. Kept when the item is promoted.
    pub enqueued_at: Instant,
}

impl LoadItem {
    pub fn new(handle: Handle, kind: FetchKind, priority: Priority) -> Self {
        Self {
            handle,
            priority,
            kind,
            enqueued_at: Instant::now(),
        }
    }

    /// Time spent queued so far.
    pub fn waited(&self) -> Duration {
        self.enqueued_at.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_icon_hint_from_type_tag() {
        assert_eq!(IconHint::for_item(ItemKind::Graph, "NT_GEO_MESH"), IconHint::Graph);
        assert_eq!(IconHint::for_item(ItemKind::Node, "NT_GEO_MESH"), IconHint::Geometry);
        assert_eq!(
            IconHint::for_item(ItemKind::Node, "NT_MAT_DIFFUSE"),
            IconHint::Generic
        );
        assert_eq!(
            IconHint::for_item(ItemKind::Node, "diffuse_material"),
            IconHint::Material
        );
        assert_eq!(IconHint::for_item(ItemKind::Unconnected, ""), IconHint::Pin);
    }

    #[test]
    fn test_child_handles_skip_placeholders() {
        let mut node = SceneNode::skeleton(1, "x".into(), "node".into(), ItemKind::Node, 1);
        let pin = PinLink {
            parent: 1,
            index: 1,
            label: "Roughness".into(),
            id: 42,
        };
        node.children.push(ChildSlot::linked(7));
        node.children.push(ChildSlot::Unconnected {
            node: Box::new(SceneNode::unconnected(pin, 2)),
        });

        assert_eq!(node.child_handles().collect::<Vec<_>>(), vec![7]);
        assert!(matches!(&node.children[1], ChildSlot::Unconnected { node } if node.is_placeholder()));
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::High < Priority::Normal);
        assert!(Priority::Normal < Priority::Low);
    }
}
