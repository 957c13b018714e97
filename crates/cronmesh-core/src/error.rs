//! Crate-level error composition for `cronmesh-core`.
//!
//! Each sub-module owns a small typed error; this enum stitches them
//! together via `#[from]` so `?` converts automatically at the boundaries
//! where a caller handles "anything the core can fail with".

use thiserror::Error;

use crate::config::ConfigError;
use crate::coordinator::CoordinatorError;
use crate::ids::IdError;
use crate::keyspace::CodecError;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CoreError {
    #[error("coordinator error: {0}")]
    Coordinator(#[from] CoordinatorError),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("id generation error: {0}")]
    Id(#[from] IdError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Catch-all wrapping an unexpected condition with a human message.
    #[error("{0}")]
    Internal(String),
}

pub type CoreResult<T> = Result<T, CoreError>;
