//! Scene Mirror - incremental local mirror of a remote scene graph
//!
//! Builds a navigable tree of a scene that lives behind a remote service reachable only
//! through per-item calls. Items are fetched at most once per build even when shared by
//! several parents, remote calls in flight are bounded, and a newer build cleanly
//! supersedes an older one.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  Consumers: tree view, CLI, anything holding an event receiver  │
//! └─────────────────────────────────────────────────────────────────┘
//!                  │ build / cancel / promote          ▲ BuildEvent
//!                  ▼                                   │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        SceneMirror                              │
//! │   TraversalEngine (eager | staged)   ProgressReporter           │
//! │   LoadingScheduler                   CancellationToken          │
//! └─────────────────────────────────────────────────────────────────┘
//!                  │                                   │
//!                  ▼                                   ▼
//! ┌──────────────────────────────┐   ┌──────────────────────────────┐
//! │  SceneStore                  │   │  SceneApi                    │
//! │  handle -> node (reserve /   │   │  ConcurrencyLimiter permits  │
//! │  commit / release), forest   │   │  over a RemoteInvoker        │
//! └──────────────────────────────┘   └──────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use scene_mirror_core::{MemoryRemote, MirrorConfig, SceneFixture, SceneMirror};
//!
//! let fixture = SceneFixture::from_file("fixtures/demo_scene.yaml")?;
//! let config = MirrorConfig::from_file("config/mirror.yaml")?;
//!
//! let mirror = Arc::new(SceneMirror::new(Arc::new(MemoryRemote::new(fixture)), config));
//! let mut events = mirror.subscribe();
//! let summary = mirror.build().await?;
//! println!("{}", mirror.snapshot().render());
//! ```

pub mod cancel;
pub mod config;
pub mod error;
pub mod events;
pub mod limiter;
pub mod mirror;
pub mod progress;
pub mod remote;
pub mod remote_memory;
pub mod scheduler;
pub mod snapshot;
pub mod store;
pub mod traversal;
pub mod types;

// Re-export main types
pub use cancel::{CancellationToken, Generation};
pub use config::{MirrorConfig, Strategy};
pub use error::{ConfigError, MirrorError, RemoteError, Result};
pub use events::{BuildEvent, BuildStage, SceneEvent};
pub use limiter::ConcurrencyLimiter;
pub use mirror::{BuildSummary, SceneMirror};
pub use progress::ProgressReporter;
pub use remote::{RemoteInvoker, SceneApi};
pub use remote_memory::{FixtureItem, FixturePin, MemoryRemote, SceneFixture};
pub use scheduler::LoadingScheduler;
pub use snapshot::{SnapshotNode, TreeSnapshot};
pub use store::{Reservation, ReservationGuard, SceneStore};
pub use traversal::{TraversalEngine, TraversalOutcome};
pub use types::{
    ChildSlot, FetchKind, Handle, IconHint, ItemKind, LoadItem, LoadState, PinLink, Priority,
    SceneNode,
};
