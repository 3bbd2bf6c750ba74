//! GPU device initialization and pitched buffer backend
//!
//! Handles wgpu device creation and adapter selection, and implements
//! [`DeviceBackend`] on top of wgpu storage buffers. Rows are padded to
//! [`WGPU_PITCH_ALIGNMENT`] bytes, the alignment wgpu requires for row copies.

use super::GpuMemoryLimits;
use crate::device::{
    align_up, copy_rows, span, DeviceBackend, DeviceError, DevicePtr, PitchedRegion,
};
use std::collections::BTreeMap;
use std::sync::{mpsc, Arc, Mutex, MutexGuard};
use thiserror::Error;

/// Row pitch alignment of pitched GPU allocations (bytes)
pub const WGPU_PITCH_ALIGNMENT: usize = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT as usize;

/// Buffer copy granularity required by wgpu (bytes)
const COPY_ALIGNMENT: usize = wgpu::COPY_BUFFER_ALIGNMENT as usize;

/// First address handed out
const BASE_ADDRESS: u64 = 0x1_0000_0000;

/// GPU device initialization errors
#[derive(Debug, Error)]
pub enum GpuDeviceError {
    /// No compatible GPU adapter found
    #[error("No compatible GPU adapter found")]
    NoAdapter,

    /// Failed to request GPU device
    #[error("Failed to request GPU device: {0}")]
    DeviceRequest(String),
}

#[derive(Debug)]
struct GpuAllocation {
    buffer: Arc<wgpu::Buffer>,
    size: u64,
}

#[derive(Debug)]
struct GpuAllocations {
    buffers: BTreeMap<u64, GpuAllocation>,
    next_address: u64,
    used_bytes: u64,
}

/// GPU device wrapper
///
/// # Example
///
/// ```ignore
/// # use std::sync::Arc;
/// # use trueno_affinity::{PitchedBuffer, SharedDevice};
/// # use trueno_affinity::gpu::GpuDevice;
/// let device: SharedDevice = Arc::new(GpuDevice::new().await?);
/// let mut buffer = PitchedBuffer::<f32>::new(device, 1024, 1024);
/// buffer.set_value(1.0, true)?;
/// ```
#[derive(Debug)]
pub struct GpuDevice {
    device: wgpu::Device,
    queue: wgpu::Queue,
    adapter: wgpu::Adapter,
    limits: GpuMemoryLimits,
    allocations: Mutex<GpuAllocations>,
}

impl GpuDevice {
    /// Check if GPU is available without keeping a device
    ///
    /// This is useful for tests to skip gracefully when GPU is not available.
    pub async fn is_gpu_available() -> bool {
        Self::new().await.is_ok()
    }

    /// Initialize GPU device with default settings
    ///
    /// # Errors
    ///
    /// Returns `GpuDeviceError` if:
    /// - No compatible GPU adapter found
    /// - Device request fails
    pub async fn new() -> Result<Self, GpuDeviceError> {
        Self::new_with_backend(wgpu::Backends::all()).await
    }

    /// Initialize GPU device with specific backend
    ///
    /// # Errors
    ///
    /// Returns `GpuDeviceError` if device initialization fails
    pub async fn new_with_backend(backends: wgpu::Backends) -> Result<Self, GpuDeviceError> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends,
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .ok_or(GpuDeviceError::NoAdapter)?;

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("trueno-affinity GPU device"),
                    required_features: wgpu::Features::empty(),
                    required_limits: wgpu::Limits::default(),
                    memory_hints: wgpu::MemoryHints::default(),
                },
                None,
            )
            .await
            .map_err(|e| GpuDeviceError::DeviceRequest(e.to_string()))?;

        let limits = GpuMemoryLimits::from_limits(&device.limits());

        Ok(Self {
            device,
            queue,
            adapter,
            limits,
            allocations: Mutex::new(GpuAllocations {
                buffers: BTreeMap::new(),
                next_address: BASE_ADDRESS,
                used_bytes: 0,
            }),
        })
    }

    /// Get adapter info (GPU name, backend, etc.)
    #[must_use]
    pub fn info(&self) -> wgpu::AdapterInfo {
        self.adapter.get_info()
    }

    /// Memory limits used for allocation checks
    #[must_use]
    pub const fn memory_limits(&self) -> &GpuMemoryLimits {
        &self.limits
    }

    /// Resolve a device address to its storage buffer and byte offset
    ///
    /// Consumers bind the returned buffer in their compute pipelines.
    #[must_use]
    pub fn binding(&self, ptr: DevicePtr) -> Option<(Arc<wgpu::Buffer>, u64)> {
        self.resolve(ptr)
            .ok()
            .map(|(buffer, offset, _)| (buffer, offset))
    }

    /// Get device reference
    #[must_use]
    pub const fn device(&self) -> &wgpu::Device {
        &self.device
    }

    /// Get queue reference
    #[must_use]
    pub const fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    fn lock(&self) -> Result<MutexGuard<'_, GpuAllocations>, DeviceError> {
        self.allocations
            .lock()
            .map_err(|_| DeviceError::Backend("GPU allocation table poisoned".to_string()))
    }

    /// (buffer, offset into it, buffer size)
    fn resolve(&self, ptr: DevicePtr) -> Result<(Arc<wgpu::Buffer>, u64, u64), DeviceError> {
        let allocations = self.lock()?;
        let (&base, alloc) = allocations
            .buffers
            .range(..=ptr.0)
            .next_back()
            .ok_or(DeviceError::InvalidPointer(ptr))?;

        let offset = ptr.0 - base;
        if offset >= alloc.size {
            return Err(DeviceError::InvalidPointer(ptr));
        }

        Ok((Arc::clone(&alloc.buffer), offset, alloc.size))
    }

    /// Bytes a strided copy touches, rounded to the copy granularity
    fn copy_extent(
        ptr: DevicePtr,
        offset: u64,
        buffer_size: u64,
        pitch: usize,
        row_bytes: usize,
        height: usize,
    ) -> Result<usize, DeviceError> {
        if offset % COPY_ALIGNMENT as u64 != 0 {
            return Err(DeviceError::Transfer(format!(
                "device address {ptr} is not {COPY_ALIGNMENT}-byte aligned"
            )));
        }

        let extent = align_up(span(pitch, row_bytes, height), COPY_ALIGNMENT);
        let available = usize::try_from(buffer_size - offset)
            .map_err(|e| DeviceError::Backend(e.to_string()))?;
        if extent > available {
            return Err(DeviceError::OutOfBounds {
                needed: extent,
                available,
            });
        }

        Ok(extent)
    }
}

impl DeviceBackend for GpuDevice {
    fn name(&self) -> &str {
        "wgpu"
    }

    fn allocate_pitched(
        &self,
        row_bytes: usize,
        height: usize,
    ) -> Result<PitchedRegion, DeviceError> {
        if row_bytes == 0 || height == 0 {
            return Err(DeviceError::ZeroSized { row_bytes, height });
        }

        let pitch = align_up(row_bytes, WGPU_PITCH_ALIGNMENT);
        let size = pitch
            .checked_mul(height)
            .and_then(|size| u64::try_from(size).ok())
            .ok_or(DeviceError::OutOfMemory {
                requested: usize::MAX,
                available: 0,
            })?;

        let mut allocations = self.lock()?;
        if !self.limits.fits_buffer(size) || !self.limits.fits_in_vram(allocations.used_bytes, size)
        {
            return Err(DeviceError::OutOfMemory {
                requested: usize::try_from(size).unwrap_or(usize::MAX),
                available: usize::try_from(self.limits.available(allocations.used_bytes))
                    .unwrap_or(usize::MAX),
            });
        }

        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("pitched buffer"),
            size,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_DST
                | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });

        let base = allocations.next_address;
        allocations.next_address = base + align_up(size as usize, WGPU_PITCH_ALIGNMENT) as u64;
        allocations.used_bytes += size;
        allocations.buffers.insert(
            base,
            GpuAllocation {
                buffer: Arc::new(buffer),
                size,
            },
        );

        Ok(PitchedRegion {
            ptr: DevicePtr(base),
            pitch,
        })
    }

    fn free(&self, ptr: DevicePtr) -> Result<(), DeviceError> {
        let mut allocations = self.lock()?;
        let alloc = allocations
            .buffers
            .remove(&ptr.0)
            .ok_or(DeviceError::InvalidPointer(ptr))?;
        allocations.used_bytes -= alloc.size;
        alloc.buffer.destroy();
        Ok(())
    }

    fn copy_to_device(
        &self,
        dst: DevicePtr,
        dst_pitch: usize,
        src: &[u8],
        src_pitch: usize,
        row_bytes: usize,
        height: usize,
    ) -> Result<(), DeviceError> {
        let (buffer, offset, size) = self.resolve(dst)?;
        let extent = Self::copy_extent(dst, offset, size, dst_pitch, row_bytes, height)?;

        // Whole-row image in device layout; padding between rows is zeroed
        let mut image = vec![0u8; extent];
        copy_rows(&mut image, dst_pitch, src, src_pitch, row_bytes, height)?;

        self.queue.write_buffer(&buffer, offset, &image);
        self.queue.submit(std::iter::empty());
        let _ = self.device.poll(wgpu::Maintain::Wait);

        Ok(())
    }

    fn copy_to_host(
        &self,
        dst: &mut [u8],
        dst_pitch: usize,
        src: DevicePtr,
        src_pitch: usize,
        row_bytes: usize,
        height: usize,
    ) -> Result<(), DeviceError> {
        let (buffer, offset, size) = self.resolve(src)?;
        let extent = Self::copy_extent(src, offset, size, src_pitch, row_bytes, height)?;

        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("pitched download staging"),
            size: extent as u64,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor::default());
        encoder.copy_buffer_to_buffer(&buffer, offset, &staging, 0, extent as u64);
        self.queue.submit(Some(encoder.finish()));

        let slice = staging.slice(..);
        let (tx, rx) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });

        let _ = self.device.poll(wgpu::Maintain::Wait);
        rx.recv()
            .map_err(|e| DeviceError::Transfer(format!("map result not received: {e}")))?
            .map_err(|e| DeviceError::Transfer(format!("buffer mapping failed: {e}")))?;

        let copied = {
            let data = slice.get_mapped_range();
            copy_rows(dst, dst_pitch, &data, src_pitch, row_bytes, height)
        };
        staging.unmap();

        copied
    }

    fn synchronize(&self) -> Result<(), DeviceError> {
        let _ = self.device.poll(wgpu::Maintain::Wait);
        Ok(())
    }
}
