//! Device memory backends
//!
//! A [`DeviceBackend`] is the accelerator seam used by
//! [`PitchedBuffer`](crate::storage::PitchedBuffer): pitched 2D allocation,
//! strided copies in both directions and a full synchronization barrier.
//!
//! # Backends
//!
//! - [`EmulatedDevice`]: device memory simulated in host RAM (always available)
//! - `GpuDevice`: wgpu storage buffers (`gpu` feature)
//!
//! # Ownership
//!
//! Device memory is owned through [`DeviceAllocation`], which frees its
//! allocation on drop. Handles are never shared between buffers.

mod emulated;

pub use emulated::{EmulatedDevice, EmulatedDeviceConfig};

use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Device address (opaque, byte addressed)
///
/// Addresses handed out by a backend are only meaningful to that backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DevicePtr(pub u64);

impl DevicePtr {
    /// Address `bytes` past this one
    #[must_use]
    pub const fn offset(self, bytes: u64) -> Self {
        Self(self.0 + bytes)
    }
}

impl fmt::Display for DevicePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Device backend errors
#[derive(Debug, Error)]
pub enum DeviceError {
    /// Device memory exhausted
    #[error("Device out of memory: requested {requested} bytes, {available} available")]
    OutOfMemory {
        /// Requested allocation size in bytes
        requested: usize,
        /// Bytes still available on the device
        available: usize,
    },

    /// Allocation with a zero row size or height
    #[error("Cannot allocate zero-sized region ({row_bytes} bytes x {height} rows)")]
    ZeroSized {
        /// Requested row size in bytes
        row_bytes: usize,
        /// Requested number of rows
        height: usize,
    },

    /// Address not owned by this backend
    #[error("Invalid device pointer {0}")]
    InvalidPointer(DevicePtr),

    /// Copy would run past the end of a host or device region
    #[error("Copy out of bounds: {needed} bytes needed, {available} available")]
    OutOfBounds {
        /// Bytes touched by the copy
        needed: usize,
        /// Bytes available in the region
        available: usize,
    },

    /// Backend reported a transfer failure
    #[error("Transfer failed: {0}")]
    Transfer(String),

    /// Backend-internal failure
    #[error("Device backend error: {0}")]
    Backend(String),
}

/// Pitched allocation returned by [`DeviceBackend::allocate_pitched`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PitchedRegion {
    /// Address of the first row
    pub ptr: DevicePtr,
    /// Distance in bytes between consecutive rows (>= requested row size)
    pub pitch: usize,
}

/// Accelerator memory backend
///
/// All copy operations are synchronous: they return once the backend has
/// completed the transfer. Copies move `row_bytes` bytes for each of `height`
/// rows, each side advancing by its own pitch.
pub trait DeviceBackend: Send + Sync + fmt::Debug {
    /// Backend name (for diagnostics)
    fn name(&self) -> &str;

    /// Allocate `height` rows of at least `row_bytes` bytes each
    ///
    /// # Errors
    ///
    /// Returns error if the region is zero-sized or memory is exhausted
    fn allocate_pitched(&self, row_bytes: usize, height: usize)
        -> Result<PitchedRegion, DeviceError>;

    /// Free an allocation made by [`Self::allocate_pitched`]
    ///
    /// # Errors
    ///
    /// Returns error if `ptr` is not a live allocation of this backend
    fn free(&self, ptr: DevicePtr) -> Result<(), DeviceError>;

    /// Strided host → device copy
    ///
    /// # Errors
    ///
    /// Returns error if either region is too small or the backend fails
    fn copy_to_device(
        &self,
        dst: DevicePtr,
        dst_pitch: usize,
        src: &[u8],
        src_pitch: usize,
        row_bytes: usize,
        height: usize,
    ) -> Result<(), DeviceError>;

    /// Strided device → host copy
    ///
    /// # Errors
    ///
    /// Returns error if either region is too small or the backend fails
    fn copy_to_host(
        &self,
        dst: &mut [u8],
        dst_pitch: usize,
        src: DevicePtr,
        src_pitch: usize,
        row_bytes: usize,
        height: usize,
    ) -> Result<(), DeviceError>;

    /// Block until all outstanding device work has completed
    ///
    /// # Errors
    ///
    /// Returns error if the device is lost
    fn synchronize(&self) -> Result<(), DeviceError>;
}

/// Backend handle shared by every buffer allocated on it
pub type SharedDevice = Arc<dyn DeviceBackend>;

/// Owned device allocation
///
/// Frees the underlying memory when dropped. There is no `Clone`: copying a
/// buffer always allocates a fresh region.
#[derive(Debug)]
pub struct DeviceAllocation {
    region: PitchedRegion,
    row_bytes: usize,
    height: usize,
    backend: SharedDevice,
}

impl DeviceAllocation {
    /// Allocate a pitched region on `backend`
    ///
    /// # Errors
    ///
    /// Returns error if the backend cannot satisfy the request
    pub fn new(backend: &SharedDevice, row_bytes: usize, height: usize) -> Result<Self, DeviceError> {
        if row_bytes == 0 || height == 0 {
            return Err(DeviceError::ZeroSized { row_bytes, height });
        }

        let region = backend.allocate_pitched(row_bytes, height)?;
        debug!(
            backend = backend.name(),
            ptr = %region.ptr,
            pitch = region.pitch,
            row_bytes,
            height,
            "allocated pitched device region"
        );

        Ok(Self {
            region,
            row_bytes,
            height,
            backend: Arc::clone(backend),
        })
    }

    /// Address of the first row
    #[must_use]
    pub const fn ptr(&self) -> DevicePtr {
        self.region.ptr
    }

    /// Row pitch in bytes
    #[must_use]
    pub const fn pitch(&self) -> usize {
        self.region.pitch
    }

    /// Requested row size in bytes
    #[must_use]
    pub const fn row_bytes(&self) -> usize {
        self.row_bytes
    }

    /// Number of rows
    #[must_use]
    pub const fn height(&self) -> usize {
        self.height
    }
}

impl Drop for DeviceAllocation {
    fn drop(&mut self) {
        if let Err(e) = self.backend.free(self.region.ptr) {
            warn!(
                backend = self.backend.name(),
                ptr = %self.region.ptr,
                error = %e,
                "could not free device region"
            );
        }
    }
}

/// Round `value` up to the next multiple of `alignment` (`alignment` > 0)
pub(crate) const fn align_up(value: usize, alignment: usize) -> usize {
    value.div_ceil(alignment) * alignment
}

/// Number of bytes a strided region of `height` rows touches
pub(crate) const fn span(pitch: usize, row_bytes: usize, height: usize) -> usize {
    if height == 0 {
        0
    } else {
        (height - 1) * pitch + row_bytes
    }
}

/// Copy `height` rows of `row_bytes` between two strided byte regions
pub(crate) fn copy_rows(
    dst: &mut [u8],
    dst_pitch: usize,
    src: &[u8],
    src_pitch: usize,
    row_bytes: usize,
    height: usize,
) -> Result<(), DeviceError> {
    let src_needed = span(src_pitch, row_bytes, height);
    if src_needed > src.len() {
        return Err(DeviceError::OutOfBounds {
            needed: src_needed,
            available: src.len(),
        });
    }

    let dst_needed = span(dst_pitch, row_bytes, height);
    if dst_needed > dst.len() {
        return Err(DeviceError::OutOfBounds {
            needed: dst_needed,
            available: dst.len(),
        });
    }

    for row in 0..height {
        let s = row * src_pitch;
        let d = row * dst_pitch;
        dst[d..d + row_bytes].copy_from_slice(&src[s..s + row_bytes]);
    }

    Ok(())
}
