//! Scene mirror CLI
//!
//! Builds a mirror of a scene fixture served by the in-memory remote and prints the
//! resulting tree.
//!
//! Usage:
//!   cargo run --bin scene-mirror -- --scene fixtures/demo_scene.yaml
//!   cargo run --bin scene-mirror -- --scene fixtures/demo_scene.yaml --strategy eager
//!   cargo run --bin scene-mirror -- --scene fixtures/demo_scene.yaml --latency-ms 20 --json
//!   cargo run --bin scene-mirror -- --scene fixtures/demo_scene.yaml --fail 42 --attributes

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use scene_mirror_core::{
    BuildEvent, Handle, MemoryRemote, MirrorConfig, SceneEvent, SceneFixture, SceneMirror,
    Strategy,
};

#[derive(Parser)]
#[command(name = "scene-mirror")]
#[command(about = "Mirror a remote scene graph and print the tree")]
struct Args {
    /// Scene fixture (YAML) served by the in-memory remote
    #[arg(short, long)]
    scene: String,

    /// Mirror configuration file (YAML)
    #[arg(short, long, env = "SCENE_MIRROR_CONFIG")]
    config: Option<String>,

    /// Traversal strategy (eager, staged)
    #[arg(long)]
    strategy: Option<String>,

    /// Maximum remote calls in flight
    #[arg(long)]
    concurrency: Option<usize>,

    /// Simulated latency per remote call
    #[arg(long, default_value = "0")]
    latency_ms: u64,

    /// Make every call touching this handle fail (repeatable)
    #[arg(long)]
    fail: Vec<Handle>,

    /// Load attributes for every node once the build completes
    #[arg(long)]
    attributes: bool,

    /// Print the snapshot and summary as JSON instead of an indented tree
    #[arg(long)]
    json: bool,
}

fn load_config(args: &Args) -> anyhow::Result<MirrorConfig> {
    let mut config = match &args.config {
        Some(path) => MirrorConfig::from_file(path)
            .with_context(|| format!("loading mirror config from {path}"))?,
        None => MirrorConfig::default(),
    };
    config.apply_env()?;

    if let Some(raw) = &args.strategy {
        config.strategy = raw.parse::<Strategy>()?;
    }
    if let Some(concurrency) = args.concurrency {
        config.concurrency = concurrency;
    }
    config.validate()?;
    Ok(config)
}

fn log_event(event: &BuildEvent) {
    let generation = event.generation;
    match &event.event {
        SceneEvent::NodeAdded { node, level } => {
            tracing::debug!(generation, handle = ?node.handle, name = %node.name, level, "node added")
        }
        SceneEvent::ChildrenLoaded { parent, children } => {
            tracing::debug!(generation, parent, count = children.len(), "children loaded")
        }
        SceneEvent::NodeUpdated { node } => {
            tracing::debug!(generation, handle = ?node.handle, state = ?node.state, "node updated")
        }
        SceneEvent::BuildProgress {
            stage,
            percent,
            message,
        } => tracing::info!(generation, ?stage, percent, "{message}"),
        SceneEvent::BuildComplete {
            node_count,
            elapsed_ms,
        } => tracing::info!(generation, node_count, elapsed_ms, "mirror ready"),
        SceneEvent::BuildCancelled {} => tracing::warn!(generation, "build cancelled"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr so the rendered tree on stdout stays clean.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "scene_mirror=info,scene_mirror_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;
    tracing::info!(
        strategy = ?config.strategy,
        concurrency = config.concurrency,
        lazy_attributes = config.lazy_attributes,
        "Configuration loaded"
    );

    let fixture = SceneFixture::from_file(&args.scene)
        .with_context(|| format!("loading scene fixture from {}", args.scene))?;
    tracing::info!(path = %args.scene, items = fixture.items.len(), "Scene loaded");

    let remote =
        Arc::new(MemoryRemote::new(fixture).with_latency(Duration::from_millis(args.latency_ms)));
    for handle in &args.fail {
        remote.fail_handle(*handle);
    }

    let mirror = Arc::new(SceneMirror::new(remote.clone(), config));
    let mut events = mirror.subscribe();
    let logger = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            log_event(&event);
        }
    });

    let summary = mirror.build().await.context("build failed")?;

    if args.attributes {
        let handles = mirror.store().handles();
        let updated = mirror.load_attributes(&handles).await?;
        tracing::info!(requested = handles.len(), updated, "attributes loaded");
    }

    tracing::info!(
        calls = remote.total_calls(),
        peak_in_flight = remote.peak_in_flight(),
        "remote usage"
    );

    let snapshot = mirror.snapshot();
    if args.json {
        let out = serde_json::json!({ "summary": summary, "tree": snapshot });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        print!("{}", snapshot.render());
        println!(
            "\n{} nodes, {} top-level, {} failed, {} ms",
            summary.node_count, summary.top_level, summary.failures, summary.elapsed_ms
        );
    }

    // The mirror holds the only sender; dropping it ends the logger.
    drop(mirror);
    let _ = logger.await;
    Ok(())
}
