//! Mirror configuration
//!
//! Loaded from YAML with per-field defaults, then optionally overridden from the
//! environment. Every field has a sensible default so an empty document is valid.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Environment override for [`MirrorConfig::concurrency`].
pub const ENV_CONCURRENCY: &str = "SCENE_MIRROR_CONCURRENCY";
/// Environment override for [`MirrorConfig::strategy`].
pub const ENV_STRATEGY: &str = "SCENE_MIRROR_STRATEGY";

/// How the traversal engine walks the remote graph.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Descend into every child before returning to the parent.
    Eager,
    /// Level-1 skeletons first, then children one level at a time.
    #[default]
    Staged,
}

impl FromStr for Strategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "eager" => Ok(Strategy::Eager),
            "staged" => Ok(Strategy::Staged),
            other => Err(ConfigError::Invalid(format!("unknown strategy `{other}`"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MirrorConfig {
    /// Maximum number of remote calls in flight at once.
    pub concurrency: usize,
    pub strategy: Strategy,
    /// Level-1 items whose children are loaded at high priority in staged mode.
    pub visible_batch_size: usize,
    /// Whether scroll notifications pause background loading.
    pub pause_on_scroll: bool,
    /// Fetch attribute payloads on demand instead of during materialization.
    pub lazy_attributes: bool,
    /// Yield to the runtime after this many processed items (0 disables).
    pub yield_every: usize,
    /// Depth ceiling; a safety net, not the cycle-breaker.
    pub max_depth: u32,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            concurrency: 8,
            strategy: Strategy::Staged,
            visible_batch_size: 32,
            pause_on_scroll: true,
            lazy_attributes: true,
            yield_every: 64,
            max_depth: 64,
        }
    }
}

impl MirrorConfig {
    /// Load configuration from a YAML file
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Load configuration from a YAML string
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let config: MirrorConfig = if content.trim().is_empty() {
            MirrorConfig::default()
        } else {
            serde_yaml::from_str(content)?
        };
        config.validate()?;
        Ok(config)
    }

    /// Apply `SCENE_MIRROR_*` overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(
            std::env::var(ENV_CONCURRENCY).ok().as_deref(),
            std::env::var(ENV_STRATEGY).ok().as_deref(),
        )
    }

    fn apply_overrides(
        &mut self,
        concurrency: Option<&str>,
        strategy: Option<&str>,
    ) -> Result<(), ConfigError> {
        if let Some(raw) = concurrency {
            self.concurrency = raw.trim().parse().map_err(|_| {
                ConfigError::Invalid(format!("{ENV_CONCURRENCY} is not a number: `{raw}`"))
            })?;
        }
        if let Some(raw) = strategy {
            self.strategy = raw.parse()?;
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency == 0 {
            return Err(ConfigError::Invalid("concurrency must be at least 1".into()));
        }
        if self.max_depth == 0 {
            return Err(ConfigError::Invalid("max_depth must be at least 1".into()));
        }
        if self.visible_batch_size == 0 {
            return Err(ConfigError::Invalid(
                "visible_batch_size must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
