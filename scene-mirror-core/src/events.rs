use crate::types::{Handle, SceneNode};
use serde::{Deserialize, Serialize};

/// Coarse build phase reported alongside the percentage.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStage {
    /// Looking up the root item.
    Resolving,
    /// Materializing top-level items.
    Skeleton,
    /// Loading children below the top level.
    Children,
    Complete,
}

/// Events a build produces, in the fixed consumer vocabulary.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum SceneEvent {
    /// A node was committed. `level` is 0 for top-level items.
    NodeAdded { node: SceneNode, level: u32 },
    /// A parent's immediate children finished loading.
    ChildrenLoaded {
        parent: Handle,
        children: Vec<SceneNode>,
    },
    /// A volatile field changed, e.g. attributes arrived.
    NodeUpdated { node: SceneNode },
    BuildProgress {
        stage: BuildStage,
        percent: u8,
        message: String,
    },
    BuildComplete { node_count: usize, elapsed_ms: u64 },
    BuildCancelled {},
}

/// A [`SceneEvent`] tagged with the build generation that produced it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BuildEvent {
    pub generation: u64,
    #[serde(flatten)]
    pub event: SceneEvent,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_wire_names() {
        let event = BuildEvent {
            generation: 3,
            event: SceneEvent::BuildComplete {
                node_count: 4,
                elapsed_ms: 12,
            },
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "build-complete");
        assert_eq!(json["generation"], 3);
        assert_eq!(json["node_count"], 4);

        let cancelled = serde_json::to_value(SceneEvent::BuildCancelled {}).unwrap();
        assert_eq!(cancelled["event"], "build-cancelled");
    }
}
