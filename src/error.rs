//! Error types.
//!
//! Every fallible operation in the crate returns [`Result<T>`], an alias for
//! `std::result::Result<T, Error>`. Texture decode problems are deliberately absent
//! here: a texture that fails to decode falls back to a raw or placeholder image
//! instead of failing the load.

use std::path::PathBuf;

use thiserror::Error;

/// The crate error type.
#[derive(Error, Debug)]
pub enum Error {
    /// Reading or writing a file failed.
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        /// The file that was being accessed.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// A shader description or config file was not valid JSON.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The description contains no `image` pass, so there is nothing to present.
    #[error("shader description has no image pass")]
    MissingImagePass,

    /// A pass failed to compile. The previously loaded pass set stays active.
    #[error("failed to compile pass '{pass}':\n{message}")]
    ShaderCompile {
        /// Name of the pass that failed.
        pass: String,
        /// Compiler diagnostics.
        message: String,
    },

    /// Adapter, device, surface or submission failure reported by the backend.
    #[error("GPU error: {0}")]
    Gpu(String),

    /// The event loop or window could not be created.
    #[error("window error: {0}")]
    Window(String),

    /// An id was used after the resource it named had been destroyed.
    #[error("unknown {0} id")]
    UnknownResource(&'static str),
}

impl Error {
    /// Wraps an I/O error together with the path that produced it.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Alias for `Result<T, toyframe::Error>`.
pub type Result<T, E = Error> = std::result::Result<T, E>;
