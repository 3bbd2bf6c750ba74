//! GPU memory limits
//!
//! wgpu exposes no VRAM query, so limits are estimated from the adapter's
//! `max_buffer_size`. Pitched allocations are checked against them before a
//! buffer is created.

/// Share of the estimated VRAM handed out to pitched buffers
const USABLE_FRACTION: f64 = 0.7;

/// GPU memory limits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpuMemoryLimits {
    /// Estimated total VRAM (bytes)
    pub total_vram: u64,

    /// Memory budget for buffers (70% of total to leave headroom)
    pub usable_vram: u64,

    /// Largest single buffer the device accepts (bytes)
    pub max_buffer_size: u64,
}

impl GpuMemoryLimits {
    /// Derive limits from wgpu device limits
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    pub fn from_limits(limits: &wgpu::Limits) -> Self {
        // Most GPUs have max_buffer_size = VRAM size or similar
        let total_vram = limits.max_buffer_size;
        let usable_vram = (total_vram as f64 * USABLE_FRACTION) as u64;

        Self {
            total_vram,
            usable_vram,
            max_buffer_size: limits.max_buffer_size,
        }
    }

    /// Whether a single buffer of `size_bytes` can be created
    #[must_use]
    pub const fn fits_buffer(&self, size_bytes: u64) -> bool {
        size_bytes <= self.max_buffer_size
    }

    /// Whether `size_bytes` fits in the budget given `used_bytes` already allocated
    #[must_use]
    pub const fn fits_in_vram(&self, used_bytes: u64, size_bytes: u64) -> bool {
        match used_bytes.checked_add(size_bytes) {
            Some(total) => total <= self.usable_vram,
            None => false,
        }
    }

    /// Bytes left in the budget
    #[must_use]
    pub const fn available(&self, used_bytes: u64) -> u64 {
        self.usable_vram.saturating_sub(used_bytes)
    }
}
