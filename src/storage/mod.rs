//! Storage layer
//!
//! Provides pitched host/device buffers, the sorted sparse affinity matrix
//! built on them, and Parquet persistence.

pub mod pitched;
pub mod sparse;

#[cfg(feature = "storage")]
pub mod parquet;

pub use pitched::{alignment_unit, padded_width, BufferError, PitchedBuffer, ROW_ALIGNMENT_BYTES};
pub use sparse::{BuildOptions, Edge, SortOrder, SparseMatrix, SparseMatrixError};

#[cfg(feature = "storage")]
pub use self::parquet::RECORD_VERSION;
