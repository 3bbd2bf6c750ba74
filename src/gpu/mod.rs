//! GPU device backend
//!
//! Pitched buffers become wgpu storage buffers so compute pipelines can bind
//! the sparse matrix arrays directly.
//!
//! # Architecture
//!
//! - `device`: wgpu device initialization and the pitched buffer backend
//! - `memory`: allocation limits derived from the adapter
//!
//! # Feature Flag
//!
//! This module is only available with the `gpu` feature flag:
//! ```bash
//! cargo build --features gpu
//! ```

mod device;
mod memory;

pub use device::{GpuDevice, GpuDeviceError, WGPU_PITCH_ALIGNMENT};
pub use memory::GpuMemoryLimits;
