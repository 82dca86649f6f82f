//! Error types for the treelet subsystem.

use thiserror::Error;

/// Errors surfaced by dumping, loading, and traversing treelet scenes.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid option combination; fatal at construction.
    #[error("configuration error: {0}")]
    Config(String),

    /// Malformed treelet file; the treelet is unusable.
    #[error("format error in treelet {treelet}: {what}")]
    Format { treelet: u32, what: String },

    /// Underlying file I/O failure; the scene fails to load.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A single node plus its mandatory inlined instances exceeds the
    /// treelet byte budget; fatal at dump time.
    #[error("budget error: node {node} needs {required} bytes, budget is {budget}")]
    Budget { node: u64, required: u64, budget: u64 },

    /// A post-partitioning invariant does not hold; fatal at dump time.
    #[error("integrity error: {0}")]
    Integrity(String),

    /// The caller tried to shade a placeholder material; indicates a
    /// scheduler bug upstream.
    #[error("placeholder material for treelet {treelet}, id {id} cannot be shaded")]
    PlaceholderShading { treelet: u32, id: u32 },
}

impl Error {
    /// Shorthand for a `Format` error.
    ///
    /// * `treelet` - The treelet being parsed.
    /// * `what`    - Description of the malformation.
    pub fn format<S: Into<String>>(treelet: u32, what: S) -> Self {
        Self::Format {
            treelet,
            what: what.into(),
        }
    }
}

/// Crate-wide result type.
pub type Result<T> = std::result::Result<T, Error>;
