//! Error types shared by the container and basement-node layers.

use thiserror::Error;

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Recoverable failures surfaced to the caller.
///
/// Contract violations (non-monotonic heaviside functions, serializing a
/// tree-form container that was never prepared) are bugs in the calling
/// layer and assert instead of returning one of these.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// An index argument outside the valid range. Detected before any
    /// mutation; the structure is unchanged.
    #[error("index {index} out of range for container of size {size}")]
    InvalidIndex { index: u32, size: u32 },

    /// A search found no qualifying element. For `find_zero`,
    /// `insert_index` is the position at which the probed value would be
    /// inserted to keep the container sorted.
    #[error("no matching element (insertion point {insert_index})")]
    NotFound { insert_index: u32 },

    /// Arena allocation failed. Allocation always precedes linkage
    /// changes, so the structure is never left partially mutated.
    #[error("arena allocation of {requested} bytes failed ({available} bytes free)")]
    OutOfMemory { requested: usize, available: usize },

    /// A serialized image declares an on-disk version this build cannot
    /// read.
    #[error("unsupported serialization version {0}")]
    UnsupportedVersion(u32),

    /// A serialized image is internally inconsistent.
    #[error("malformed basement node image: {0}")]
    Deserialize(String),
}
