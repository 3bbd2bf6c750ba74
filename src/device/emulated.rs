//! Host-memory device emulation
//!
//! Behaves like a pitched CUDA allocator: every row is padded up to
//! `pitch_alignment` bytes and addresses come from a private address space.
//! Used when no GPU is present and throughout the test suite.

use super::{align_up, copy_rows, span, DeviceBackend, DeviceError, DevicePtr, PitchedRegion};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

/// First address handed out (keeps 0 free as an obviously invalid address)
const BASE_ADDRESS: u64 = 0x1000_0000;

/// Alignment of allocation base addresses
const ADDRESS_ALIGNMENT: usize = 256;

/// Emulated device settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmulatedDeviceConfig {
    /// Row pitch alignment in bytes (default 512, as `cudaMallocPitch`)
    pub pitch_alignment: usize,

    /// Total device memory in bytes (`None` = unlimited)
    pub capacity_bytes: Option<usize>,
}

impl Default for EmulatedDeviceConfig {
    fn default() -> Self {
        Self {
            pitch_alignment: 512,
            capacity_bytes: None,
        }
    }
}

#[derive(Debug, Default)]
struct EmulatedState {
    allocations: BTreeMap<u64, Vec<u8>>,
    next_address: u64,
    used_bytes: usize,
    synchronizations: u64,
    failing_transfers: usize,
}

/// Device backend living in host RAM
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use trueno_affinity::{EmulatedDevice, PitchedBuffer, SharedDevice};
///
/// let device: SharedDevice = Arc::new(EmulatedDevice::new());
/// let mut buffer = PitchedBuffer::<f32>::new(device, 5, 3);
/// buffer.set_value(1.5, true).unwrap();
/// assert!(buffer.is_on_device());
/// assert_eq!(buffer.device_pitch(), 512);
/// ```
#[derive(Debug)]
pub struct EmulatedDevice {
    config: EmulatedDeviceConfig,
    state: Mutex<EmulatedState>,
}

impl EmulatedDevice {
    /// Create emulated device with default settings
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(EmulatedDeviceConfig::default())
    }

    /// Create emulated device with explicit settings
    ///
    /// A zero `pitch_alignment` is treated as 1 (tightly packed rows).
    #[must_use]
    pub fn with_config(mut config: EmulatedDeviceConfig) -> Self {
        config.pitch_alignment = config.pitch_alignment.max(1);
        Self {
            config,
            state: Mutex::new(EmulatedState {
                next_address: BASE_ADDRESS,
                ..EmulatedState::default()
            }),
        }
    }

    /// Active settings
    #[must_use]
    pub const fn config(&self) -> &EmulatedDeviceConfig {
        &self.config
    }

    /// Bytes currently allocated
    #[must_use]
    pub fn allocated_bytes(&self) -> usize {
        self.lock().map_or(0, |state| state.used_bytes)
    }

    /// Number of live allocations
    #[must_use]
    pub fn allocation_count(&self) -> usize {
        self.lock().map_or(0, |state| state.allocations.len())
    }

    /// Number of synchronization barriers executed so far
    #[must_use]
    pub fn synchronization_count(&self) -> u64 {
        self.lock().map_or(0, |state| state.synchronizations)
    }

    /// Make the next `count` transfers fail (fault injection)
    pub fn fail_next_transfers(&self, count: usize) {
        if let Ok(mut state) = self.lock() {
            state.failing_transfers = count;
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, EmulatedState>, DeviceError> {
        self.state
            .lock()
            .map_err(|_| DeviceError::Backend("emulated device state poisoned".to_string()))
    }
}

impl Default for EmulatedDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl EmulatedState {
    /// Resolve `ptr` to (allocation base, offset into it)
    fn resolve(&self, ptr: DevicePtr) -> Result<(u64, usize), DeviceError> {
        let (&base, memory) = self
            .allocations
            .range(..=ptr.0)
            .next_back()
            .ok_or(DeviceError::InvalidPointer(ptr))?;

        let offset = usize::try_from(ptr.0 - base).map_err(|_| DeviceError::InvalidPointer(ptr))?;
        if offset >= memory.len() {
            return Err(DeviceError::InvalidPointer(ptr));
        }

        Ok((base, offset))
    }

    fn take_injected_failure(&mut self) -> Result<(), DeviceError> {
        if self.failing_transfers > 0 {
            self.failing_transfers -= 1;
            return Err(DeviceError::Transfer("injected transfer failure".to_string()));
        }
        Ok(())
    }
}

impl DeviceBackend for EmulatedDevice {
    fn name(&self) -> &str {
        "emulated"
    }

    fn allocate_pitched(
        &self,
        row_bytes: usize,
        height: usize,
    ) -> Result<PitchedRegion, DeviceError> {
        if row_bytes == 0 || height == 0 {
            return Err(DeviceError::ZeroSized { row_bytes, height });
        }

        let pitch = align_up(row_bytes, self.config.pitch_alignment);
        let size = pitch
            .checked_mul(height)
            .ok_or(DeviceError::OutOfMemory {
                requested: usize::MAX,
                available: 0,
            })?;

        let mut state = self.lock()?;
        if let Some(capacity) = self.config.capacity_bytes {
            let available = capacity.saturating_sub(state.used_bytes);
            if size > available {
                return Err(DeviceError::OutOfMemory {
                    requested: size,
                    available,
                });
            }
        }

        let base = state.next_address;
        let reserved = u64::try_from(align_up(size, ADDRESS_ALIGNMENT))
            .map_err(|e| DeviceError::Backend(e.to_string()))?;
        state.next_address = base + reserved;
        state.allocations.insert(base, vec![0; size]);
        state.used_bytes += size;

        Ok(PitchedRegion {
            ptr: DevicePtr(base),
            pitch,
        })
    }

    fn free(&self, ptr: DevicePtr) -> Result<(), DeviceError> {
        let mut state = self.lock()?;
        let memory = state
            .allocations
            .remove(&ptr.0)
            .ok_or(DeviceError::InvalidPointer(ptr))?;
        state.used_bytes -= memory.len();
        debug!(ptr = %ptr, bytes = memory.len(), "freed emulated region");
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
        let mut state = self.lock()?;
        state.take_injected_failure()?;

        let (base, offset) = state.resolve(dst)?;
        let memory = state
            .allocations
            .get_mut(&base)
            .ok_or(DeviceError::InvalidPointer(dst))?;

        copy_rows(&mut memory[offset..], dst_pitch, src, src_pitch, row_bytes, height)
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
        let mut state = self.lock()?;
        state.take_injected_failure()?;

        let (base, offset) = state.resolve(src)?;
        let memory = state
            .allocations
            .get(&base)
            .ok_or(DeviceError::InvalidPointer(src))?;

        let needed = span(src_pitch, row_bytes, height);
        if offset + needed > memory.len() {
            return Err(DeviceError::OutOfBounds {
                needed,
                available: memory.len() - offset,
            });
        }

        copy_rows(dst, dst_pitch, &memory[offset..], src_pitch, row_bytes, height)
    }

    fn synchronize(&self) -> Result<(), DeviceError> {
        self.lock()?.synchronizations += 1;
        Ok(())
    }
}
