//! trueno-affinity: pitched host/device buffers and sparse affinity matrices
//!
//! # Overview
//!
//! trueno-affinity builds a weighted affinity relation between indexed
//! entities, stores it as a sorted sparse matrix and mirrors it into device
//! memory so GPU graph kernels can index it directly.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use trueno_affinity::{BuildOptions, Edge, EmulatedDevice, SharedDevice, SparseMatrix};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let device: SharedDevice = Arc::new(EmulatedDevice::new());
//!
//! // Build row-sorted matrix, weights divided by 2
//! let edges = vec![Edge::new(0, 2, 4.0), Edge::new(1, 0, 2.0), Edge::new(0, 1, 6.0)];
//! let rows = SparseMatrix::new(device, edges, 3, BuildOptions::default().with_normalization(2.0))?;
//! assert_eq!(rows.entries_for(0).len(), 2);
//!
//! // Column-sorted copy (fresh device buffers)
//! let cols = rows.resorted()?;
//! assert_eq!(cols.entries_for(0).len(), 1);
//!
//! // Save to Parquet
//! rows.write_parquet("affinity").await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! - **Device**: backend trait with an emulated host backend and a wgpu backend
//! - **Storage**: `PitchedBuffer<T>` (padded 2D host/device buffer) and
//!   `SparseMatrix` (sorted entries + per-key start indices)
//! - **Persistence**: Parquet records (ZSTD), feature `storage`

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod device;
pub mod storage;

// GPU backend (optional)
#[cfg(feature = "gpu")]
pub mod gpu;

// Re-export core types
pub use device::{
    DeviceAllocation, DeviceBackend, DeviceError, DevicePtr, EmulatedDevice, EmulatedDeviceConfig,
    PitchedRegion, SharedDevice,
};
pub use storage::{
    BufferError, BuildOptions, Edge, PitchedBuffer, SortOrder, SparseMatrix, SparseMatrixError,
    ROW_ALIGNMENT_BYTES,
};

#[cfg(feature = "gpu")]
pub use gpu::{GpuDevice, GpuDeviceError, GpuMemoryLimits};

// Error type
pub use anyhow::{Error, Result};
