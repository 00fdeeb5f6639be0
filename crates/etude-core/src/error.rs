use std::io;
use thiserror::Error;

/// Central error type for the etude engine.
///
/// Protocol problems (bad syntax, missing files) never reach this type; they are
/// turned into a response by the connection. Only startup and loop failures do.
#[derive(Debug, Error)]
pub enum EtudeError {
    /// Underlying I/O error from the OS or network.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// The configured listen address could not be parsed.
    #[error("invalid listen address `{0}`")]
    InvalidAddress(String),
    /// A worker thread could not be spawned.
    #[error("failed to spawn worker thread: {0}")]
    PoolSpawn(io::Error),
    /// Configuration rejected at startup.
    #[error("configuration error: {0}")]
    Config(String),
}

pub type EtudeResult<T> = Result<T, EtudeError>;
