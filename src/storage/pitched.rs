//! Pitched 2D buffer mirrored between host and device
//!
//! # Layout
//!
//! ```text
//! width = 5 (f32), alignment unit = 8 elements (32 bytes)
//!
//! host (padded width 8, pitch 32 bytes):
//!   row 0: [a a a a a . . .]
//!   row 1: [b b b b b . . .]
//!
//! device (pitch chosen by the backend, e.g. 512 bytes):
//!   row 0: [a a a a a . . . . . . ... ]
//!   row 1: [b b b b b . . . . . . ... ]
//! ```
//!
//! Host and device strides differ, so every transfer is a strided 2D copy of
//! the logical region only. Contents are equal on both sides right after a
//! successful [`PitchedBuffer::upload`] or [`PitchedBuffer::download`]; nothing
//! tracks staleness after that.

use crate::device::{DeviceAllocation, DeviceError, DevicePtr, SharedDevice};
use bytemuck::Pod;
use std::fmt;
use std::mem::size_of;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Every host row starts on a multiple of this many bytes
pub const ROW_ALIGNMENT_BYTES: usize = 32;

/// Pitched buffer errors
#[derive(Debug, Error)]
pub enum BufferError {
    /// Operation needs device memory but the buffer is host-only
    #[error("Buffer is not resident on the device")]
    NotResident,

    /// Device allocation failed (buffer stays usable host-only)
    #[error("Device allocation failed: {0}")]
    Allocation(#[source] DeviceError),

    /// Host/device copy failed (destination content is unspecified)
    #[error("Device transfer failed: {0}")]
    Transfer(#[source] DeviceError),

    /// Source and destination have different logical dimensions
    #[error("Shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// (width, height) of the source
        expected: (usize, usize),
        /// (width, height) of the destination
        actual: (usize, usize),
    },
}

/// Number of elements a padded row width must be a multiple of
///
/// Chosen so that `unit * size_of::<T>()` is a multiple of
/// [`ROW_ALIGNMENT_BYTES`].
#[must_use]
pub const fn alignment_unit<T>() -> usize {
    let size = size_of::<T>();
    if size == 0 {
        return 1;
    }
    ROW_ALIGNMENT_BYTES / gcd(ROW_ALIGNMENT_BYTES, size)
}

/// Padded width for `width` elements of `T`
#[must_use]
pub const fn padded_width<T>(width: usize) -> usize {
    let unit = alignment_unit::<T>();
    width.div_ceil(unit) * unit
}

const fn gcd(mut a: usize, mut b: usize) -> usize {
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}

/// 2D buffer of `T` with a padded host copy and an optional device mirror
///
/// Dimensions are fixed at construction. Device memory is allocated lazily
/// (first [`upload`](Self::upload) or [`allocate_device`](Self::allocate_device))
/// and released by [`release`](Self::release) or on drop.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use trueno_affinity::{EmulatedDevice, PitchedBuffer, SharedDevice};
///
/// let device: SharedDevice = Arc::new(EmulatedDevice::new());
/// let data: Vec<i32> = (0..6).collect();
/// let buffer = PitchedBuffer::from_slice(device, 3, 2, &data);
///
/// assert_eq!(buffer.padded_width(), 8);
/// assert_eq!(buffer.host_at(2, 1), Some(&5));
/// assert_eq!(buffer.host_at(3, 1), None);
/// ```
pub struct PitchedBuffer<T: Pod> {
    width: usize,
    height: usize,
    padded_width: usize,

    /// Row-major, `padded_width * height` elements
    host: Vec<T>,
    host_pitch: usize,
    host_stride: usize,

    device: Option<DeviceAllocation>,
    backend: SharedDevice,
}

impl<T: Pod> PitchedBuffer<T> {
    /// Create zero-filled host-only buffer
    #[must_use]
    pub fn new(backend: SharedDevice, width: usize, height: usize) -> Self {
        Self::create(backend, width, height, false, None)
    }

    /// Create buffer from row-major data of exactly `width * height` elements
    #[must_use]
    pub fn from_slice(backend: SharedDevice, width: usize, height: usize, data: &[T]) -> Self {
        Self::create(backend, width, height, false, Some(data))
    }

    /// Create buffer, optionally allocating device memory and scattering
    /// `initial` into the padded layout
    ///
    /// `initial` is only used when it holds exactly `width * height`
    /// elements; otherwise the buffer stays zero-filled. A failed device
    /// allocation is reported and leaves the buffer host-only.
    #[must_use]
    pub fn create(
        backend: SharedDevice,
        width: usize,
        height: usize,
        allocate_device: bool,
        initial: Option<&[T]>,
    ) -> Self {
        let padded_width = padded_width::<T>(width);
        let host_pitch = padded_width * size_of::<T>();

        let mut buffer = Self {
            width,
            height,
            padded_width,
            host: vec![T::zeroed(); padded_width * height],
            host_pitch,
            host_stride: padded_width,
            device: None,
            backend,
        };

        match initial {
            Some(data) if data.len() == width * height => {
                for (y, row) in data.chunks_exact(width.max(1)).enumerate().take(height) {
                    let start = y * padded_width;
                    buffer.host[start..start + width].copy_from_slice(row);
                }
            }
            Some(data) => warn!(
                expected = width * height,
                actual = data.len(),
                "initial data size mismatch, buffer left zero-filled"
            ),
            None => {}
        }

        if allocate_device {
            // Reported inside; the buffer is still valid host-only
            let _ = buffer.allocate_device();
        }

        buffer
    }

    /// Rebuild a buffer from persisted parts (host-only)
    pub(crate) fn from_parts(
        backend: SharedDevice,
        width: usize,
        height: usize,
        padded_width: usize,
        host: Vec<T>,
    ) -> Option<Self> {
        let unit = alignment_unit::<T>();
        if padded_width < width || padded_width % unit != 0 || host.len() != padded_width * height
        {
            return None;
        }

        Some(Self {
            width,
            height,
            padded_width,
            host,
            host_pitch: padded_width * size_of::<T>(),
            host_stride: padded_width,
            device: None,
            backend,
        })
    }

    /// Host element at logical `(x, y)`
    #[must_use]
    pub fn host_at(&self, x: usize, y: usize) -> Option<&T> {
        self.host_index(x, y).map(|i| &self.host[i])
    }

    /// Mutable host element at logical `(x, y)`
    pub fn host_at_mut(&mut self, x: usize, y: usize) -> Option<&mut T> {
        self.host_index(x, y).map(move |i| &mut self.host[i])
    }

    /// Logical part of host row `y`
    #[must_use]
    pub fn host_row(&self, y: usize) -> Option<&[T]> {
        if y >= self.height {
            return None;
        }
        let start = y * self.host_stride;
        Some(&self.host[start..start + self.width])
    }

    /// Mutable logical part of host row `y`
    pub fn host_row_mut(&mut self, y: usize) -> Option<&mut [T]> {
        if y >= self.height {
            return None;
        }
        let start = y * self.host_stride;
        Some(&mut self.host[start..start + self.width])
    }

    /// Whole padded host buffer (row-major, `padded_width * height`)
    #[must_use]
    pub fn host_data(&self) -> &[T] {
        &self.host
    }

    /// Device address of logical element `(x, y)`
    ///
    /// `None` when out of bounds or when the buffer is not resident (the
    /// latter is also reported).
    #[must_use]
    pub fn device_at(&self, x: usize, y: usize) -> Option<DevicePtr> {
        let Some(alloc) = &self.device else {
            warn!("device_at(): buffer is not resident on the device");
            return None;
        };

        if x >= self.width || y >= self.height {
            return None;
        }

        let offset = y * alloc.pitch() + x * size_of::<T>();
        Some(alloc.ptr().offset(offset as u64))
    }

    /// Allocate device memory if not already resident
    ///
    /// # Errors
    ///
    /// Returns `BufferError::Allocation` if the buffer is empty or the device
    /// is out of memory; the buffer remains usable host-only.
    pub fn allocate_device(&mut self) -> Result<(), BufferError> {
        if self.device.is_some() {
            return Ok(());
        }

        match DeviceAllocation::new(&self.backend, self.row_bytes(), self.height) {
            Ok(alloc) => {
                self.device = Some(alloc);
                Ok(())
            }
            Err(e) => {
                warn!(
                    backend = self.backend.name(),
                    width = self.width,
                    height = self.height,
                    error = %e,
                    "device memory could not be allocated"
                );
                Err(BufferError::Allocation(e))
            }
        }
    }

    /// Copy the logical region host → device, allocating on first use
    ///
    /// Blocks until the copy has completed; a full device synchronization
    /// runs before and after the transfer.
    ///
    /// # Errors
    ///
    /// Returns error if allocation or the transfer fails. After a transfer
    /// failure the device content is unspecified until a successful retry.
    pub fn upload(&mut self) -> Result<(), BufferError> {
        self.allocate_device()?;
        let Some(alloc) = &self.device else {
            return Err(BufferError::NotResident);
        };

        let result = self.backend.synchronize().and_then(|()| {
            self.backend.copy_to_device(
                alloc.ptr(),
                alloc.pitch(),
                bytemuck::cast_slice(&self.host),
                self.host_pitch,
                self.row_bytes(),
                self.height,
            )
        });
        let result = result.and_then(|()| self.backend.synchronize());

        match result {
            Ok(()) => {
                debug!(
                    ptr = %alloc.ptr(),
                    bytes = self.row_bytes() * self.height,
                    "uploaded buffer"
                );
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "copying from host to device failed");
                Err(BufferError::Transfer(e))
            }
        }
    }

    /// Copy the logical region device → host
    ///
    /// # Errors
    ///
    /// Returns `BufferError::NotResident` if nothing is on the device, or
    /// `BufferError::Transfer` if the copy fails (host content is then
    /// unspecified).
    pub fn download(&mut self) -> Result<(), BufferError> {
        let Some(alloc) = &self.device else {
            warn!("download(): buffer is not resident on the device");
            return Err(BufferError::NotResident);
        };

        let row_bytes = self.width * size_of::<T>();
        let result = self.backend.synchronize().and_then(|()| {
            self.backend.copy_to_host(
                bytemuck::cast_slice_mut(&mut self.host),
                self.host_pitch,
                alloc.ptr(),
                alloc.pitch(),
                row_bytes,
                self.height,
            )
        });

        match result {
            Ok(()) => {
                debug!(ptr = %alloc.ptr(), bytes = row_bytes * self.height, "downloaded buffer");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "copying from device to host failed");
                Err(BufferError::Transfer(e))
            }
        }
    }

    /// Free device memory (no-op when not resident)
    pub fn release(&mut self) {
        self.device = None;
    }

    /// Fill every host element (padding included) with `value`
    ///
    /// # Errors
    ///
    /// Only fails when `upload` is set and the upload fails.
    pub fn set_value(&mut self, value: T, upload: bool) -> Result<(), BufferError> {
        self.host.fill(value);
        if upload {
            self.upload()?;
        }
        Ok(())
    }

    /// Copy logical host content into `dst` (host → host)
    ///
    /// Device memory of both buffers is left untouched unless `upload` is set,
    /// in which case `dst` is uploaded afterwards.
    ///
    /// # Errors
    ///
    /// Returns `BufferError::ShapeMismatch` if the logical dimensions differ
    /// (nothing is copied), or the upload error of `dst`.
    pub fn copy_into(&self, dst: &mut Self, upload: bool) -> Result<(), BufferError> {
        if (self.width, self.height) != (dst.width, dst.height) {
            return Err(BufferError::ShapeMismatch {
                expected: (self.width, self.height),
                actual: (dst.width, dst.height),
            });
        }

        for y in 0..self.height {
            let s = y * self.host_stride;
            let d = y * dst.host_stride;
            dst.host[d..d + self.width].copy_from_slice(&self.host[s..s + self.width]);
        }

        if upload {
            dst.upload()?;
        }
        Ok(())
    }

    /// Logical width (elements)
    #[must_use]
    pub const fn width(&self) -> usize {
        self.width
    }

    /// Logical height (rows)
    #[must_use]
    pub const fn height(&self) -> usize {
        self.height
    }

    /// Padded row width (elements)
    #[must_use]
    pub const fn padded_width(&self) -> usize {
        self.padded_width
    }

    /// Host row pitch (bytes)
    #[must_use]
    pub const fn host_pitch(&self) -> usize {
        self.host_pitch
    }

    /// Host row stride (elements)
    #[must_use]
    pub const fn host_stride(&self) -> usize {
        self.host_stride
    }

    /// Device row pitch in bytes (0 and a warning when not resident)
    #[must_use]
    pub fn device_pitch(&self) -> usize {
        match &self.device {
            Some(alloc) => alloc.pitch(),
            None => {
                warn!("device_pitch(): buffer is not resident on the device");
                0
            }
        }
    }

    /// Device row stride in elements (0 and a warning when not resident)
    #[must_use]
    pub fn device_stride(&self) -> usize {
        match (&self.device, size_of::<T>()) {
            (Some(_), 0) => 0,
            (Some(alloc), size) => alloc.pitch() / size,
            (None, _) => {
                warn!("device_stride(): buffer is not resident on the device");
                0
            }
        }
    }

    /// Device address of the first row, if resident
    #[must_use]
    pub fn device_ptr(&self) -> Option<DevicePtr> {
        self.device.as_ref().map(DeviceAllocation::ptr)
    }

    /// Whether device memory is allocated
    #[must_use]
    pub const fn is_on_device(&self) -> bool {
        self.device.is_some()
    }

    /// Size of the host region in bytes (`height * host_pitch`)
    #[must_use]
    pub const fn bytes(&self) -> usize {
        self.height * self.host_pitch
    }

    /// Backend this buffer allocates on
    #[must_use]
    pub const fn backend(&self) -> &SharedDevice {
        &self.backend
    }

    /// Bytes per logical row
    const fn row_bytes(&self) -> usize {
        self.width * size_of::<T>()
    }

    fn host_index(&self, x: usize, y: usize) -> Option<usize> {
        (x < self.width && y < self.height).then(|| y * self.host_stride + x)
    }
}

impl<T: Pod> Clone for PitchedBuffer<T> {
    /// Copies host content; a resident source gets a fresh device allocation
    fn clone(&self) -> Self {
        let mut copy = Self {
            width: self.width,
            height: self.height,
            padded_width: self.padded_width,
            host: self.host.clone(),
            host_pitch: self.host_pitch,
            host_stride: self.host_stride,
            device: None,
            backend: Arc::clone(&self.backend),
        };

        if self.is_on_device() {
            // Failure is reported by upload(); the copy stays host-only
            let _ = copy.upload();
        }

        copy
    }
}

impl<T: Pod> fmt::Debug for PitchedBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PitchedBuffer")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("padded_width", &self.padded_width)
            .field("host_pitch", &self.host_pitch)
            .field("device", &self.device_ptr())
            .field("backend", &self.backend.name())
            .finish()
    }
}
