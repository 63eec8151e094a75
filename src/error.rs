use thiserror::Error;

use crate::config::ConfigError;
use crate::server::ProtoError;

/// Crate-level convenience error.
///
/// Not a "god error": it is a thin wrapper over capability errors.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Proto(#[from] ProtoError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
