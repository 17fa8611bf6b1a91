//! chanorm Accelerate: cached, shape-adapted and autotuned GPU dispatch of
//! channel-wise softmax.
//!
//! - A [`SoftmaxKernel`] compiles its program once per instance, rebinds
//!   kernel arguments only when the input shape changes and launches through
//!   a shared [`Tuner`] that picks the local work-group size empirically.
//! - Runtimes implement [`chanorm_accelerate_api::KernelRuntime`]: the
//!   in-process host runtime is always available, the wgpu runtime behind the
//!   `wgpu` feature.
//! - The `out-of-range-check` feature instruments kernels with output bounds
//!   checks.

pub mod backend;
pub mod binder;
pub mod config;
pub mod context;
pub mod geometry;
pub mod guard;
pub mod kernel_cache;
pub mod launcher;
pub mod metrics;
pub mod ops;
pub mod tuning;

pub use backend::inprocess::{InProcessRuntime, InProcessStats};
#[cfg(feature = "wgpu")]
pub use backend::wgpu::{WgpuRuntime, WgpuRuntimeOptions};
pub use binder::{ArgWriter, ArgumentBinder};
pub use chanorm_accelerate_api as api;
pub use context::{KernelFuture, LaunchMode, OpContext};
pub use geometry::LaunchGeometry;
pub use guard::{DefaultGuard, ExecutionGuard, NoopGuard, OutOfRangeCheck, OutOfRangeGuard};
pub use kernel_cache::{KernelCache, KernelSpec};
pub use launcher::TunedLauncher;
pub use metrics::{TuningCounters, TuningMetrics};
pub use ops::softmax::{SoftmaxKernel, SOFTMAX_KERNEL_NAME, SOFTMAX_PROGRAM};
pub use tuning::{LocalWorkSize, Tuner, TunerOptions, DEFAULT_LOCAL_WORK_SIZE};
