use crate::types::Handle;
use thiserror::Error;

/// Failure of a single remote call.
#[derive(Debug, Clone, Error)]
pub enum RemoteError {
    #[error("transport: {0}")]
    Transport(String),

    #[error("{service}.{method}: response has no usable `{field}`")]
    MissingField {
        service: String,
        method: String,
        field: &'static str,
    },

    #[error("unknown handle {0}")]
    UnknownHandle(Handle),

    #[error("unsupported call {service}.{method}")]
    Unsupported { service: String, method: String },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("cannot parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Errors surfaced by the mirror.
///
/// `Fetch` is transient and handled where it occurs: the affected branch is dropped and
/// the build continues. `RootUnavailable` rejects the build. `Cancelled` is not a failure;
/// it unwinds a superseded build and is never logged as an error.
#[derive(Debug, Error)]
pub enum MirrorError {
    #[error("fetch failed for item {handle}: {source}")]
    Fetch {
        handle: Handle,
        #[source]
        source: RemoteError,
    },

    #[error("root item could not be resolved: {0}")]
    RootUnavailable(#[source] RemoteError),

    #[error("build cancelled")]
    Cancelled,

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl MirrorError {
    /// Adapter for `map_err`: tag a remote failure with the item it concerns.
    pub fn fetch(handle: Handle) -> impl FnOnce(RemoteError) -> Self {
        move |source| MirrorError::Fetch { handle, source }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, MirrorError::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, MirrorError>;
