//! Error types for uphaul-core.

use thiserror::Error;

/// Main error type for scheduler operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error from underlying system calls.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid or incomplete configuration.
    #[error("config error: {message}")]
    Config { message: String },

    /// Failure spawning or supervising the transfer engine.
    #[error("engine error: {message}")]
    Engine { message: String },

    /// Failure building the chunk plan.
    #[error("chunker error: {message}")]
    Chunker { message: String },

    /// Control-plane request failed in a way that must surface.
    #[error("control-plane error: {message}")]
    ControlPlane { message: String },

    /// Session-level abort declared by the loop.
    #[error("session aborted: {message}")]
    Session { message: String },
}

impl Error {
    /// Build a config error from anything displayable.
    pub fn config(message: impl std::fmt::Display) -> Self {
        Error::Config {
            message: message.to_string(),
        }
    }

    /// Build an engine error from anything displayable.
    pub fn engine(message: impl std::fmt::Display) -> Self {
        Error::Engine {
            message: message.to_string(),
        }
    }

    /// Returns true if this error must abort before any uploader work.
    ///
    /// Configuration errors are the only startup-fatal class; everything
    /// else is scoped to a stage or session.
    pub fn is_startup_fatal(&self) -> bool {
        matches!(self, Error::Config { .. })
    }
}

/// Convenience result type for scheduler operations.
pub type Result<T> = std::result::Result<T, Error>;
