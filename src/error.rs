//! Error types shared by the hub actors

use crate::config::ConfigError;
use crate::filter::script::ScriptError;

/// Result alias used across the library
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced by the actors and the operations they expose
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Candidate configuration was rejected
    #[error("invalid config: {0}")]
    Config(#[from] ConfigError),

    /// A filter script or one of its entry points could not be loaded
    #[error("filter {filter} failed to load: {source}")]
    Pipeline {
        filter: String,
        #[source]
        source: ScriptError,
    },

    /// The target actor was closed before (or while) the job ran
    #[error("actor {0} is closed")]
    ActorClosed(String),

    /// A job panicked; the actor recovered and keeps running
    #[error("task panicked on actor {actor}: {message}")]
    Panicked { actor: String, message: String },

    /// A session reply carried a value of an unexpected type
    #[error("unexpected reply type for session {0}")]
    ReplyType(u64),

    #[error("target not found: {0}")]
    TargetNotFound(String),

    #[error("filter not found, target:{target} filter:{filter}")]
    FilterNotFound { target: String, filter: String },

    #[error("sub filter not found, target:{target} filter:{filter} sub_filter:{sub_filter}")]
    SubFilterNotFound {
        target: String,
        filter: String,
        sub_filter: String,
    },

    #[error("no prepared pipelines to commit for target {0}")]
    NothingPrepared(String),

    #[error("a config reload is already in progress")]
    ReloadInProgress,

    #[error("no config has been staged for reload")]
    NothingStaged,

    /// Reading from an inbound stream failed
    #[error("transport error: {0}")]
    Transport(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}
