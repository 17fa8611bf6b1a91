//! wgpu implementation of [`KernelRuntime`](chanorm_accelerate_api::KernelRuntime).
//!
//! Programs are WGSL sources run through a small `-D` preprocessor. Buffer
//! arguments bind in argument order from binding 0, scalar arguments are
//! packed into a uniform at binding 14 and the dispatch offset sits at
//! binding 15.

pub mod bindings;
pub mod kernel;
pub mod preprocess;
pub mod runtime;
pub mod shaders;

pub use kernel::WgpuKernel;
pub use runtime::{WgpuEvent, WgpuRuntime, WgpuRuntimeOptions};
