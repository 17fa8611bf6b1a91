use crate::binder::ArgumentBinder;
use crate::context::OpContext;
use crate::geometry::LaunchGeometry;
use crate::guard::{DefaultGuard, ExecutionGuard};
use crate::kernel_cache::{KernelCache, KernelSpec};
use crate::launcher::TunedLauncher;
use chanorm_accelerate_api::{AccelResult, GpuTensor, KernelElement, KernelRuntime};
use std::marker::PhantomData;

/// Program every runtime registers the softmax kernel under.
pub const SOFTMAX_PROGRAM: &str = "softmax_buffer";
/// Entry point name inside [`SOFTMAX_PROGRAM`].
pub const SOFTMAX_KERNEL_NAME: &str = "softmax";
const SOFTMAX_TUNING_NAME: &str = "softmax_kernel";

/// Channel-wise softmax over the innermost axis of a rank 2 `(N, C)` or
/// rank 4 `(N, H, W, C)` tensor, producing `T` elements.
///
/// The kernel is compiled on the first call and kept; arguments are rebound
/// whenever the input shape changes. An instance must not be shared
/// between threads while computing.
pub struct SoftmaxKernel<R: KernelRuntime, T: KernelElement, G: ExecutionGuard = DefaultGuard> {
    cache: KernelCache<R::Kernel>,
    binder: ArgumentBinder,
    guard: G,
    launcher: TunedLauncher,
    _element: PhantomData<T>,
}

impl<R: KernelRuntime, T: KernelElement, G: ExecutionGuard> Default for SoftmaxKernel<R, T, G> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: KernelRuntime, T: KernelElement, G: ExecutionGuard> SoftmaxKernel<R, T, G> {
    pub fn new() -> Self {
        Self {
            cache: KernelCache::new(),
            binder: ArgumentBinder::new(),
            guard: G::default(),
            launcher: TunedLauncher::new(SOFTMAX_TUNING_NAME),
            _element: PhantomData,
        }
    }

    pub fn compute(
        &mut self,
        ctx: &mut OpContext<'_, R>,
        logits: &GpuTensor,
        output: &GpuTensor,
    ) -> AccelResult<()> {
        let geometry = LaunchGeometry::derive(logits.shape())?;
        let dtype = T::DTYPE;
        let span = tracing::info_span!(
            "softmax",
            batch = geometry.batch,
            height = geometry.height,
            width = geometry.width,
            channels = geometry.channels,
            dtype = %dtype
        );
        let _enter = span.enter();

        let Self {
            cache,
            binder,
            guard,
            launcher,
            ..
        } = self;
        let runtime = ctx.runtime();
        let spec = KernelSpec {
            program: SOFTMAX_PROGRAM,
            name: SOFTMAX_KERNEL_NAME,
            input: logits.dtype,
            output: dtype,
        };
        let kernel = cache.ensure_built(runtime, &spec, |options| guard.configure(options))?;
        ctx.wait()?;
        guard.init(runtime)?;

        let output_size = output.size();
        binder.bind_if_shape_changed(kernel, logits.shape(), |args| {
            guard.set_args(args, output_size)?;
            args.push_global_size(geometry.global_work_size)?;
            args.push_buffer(logits.buffer)?;
            args.push_i32(geometry.height_arg())?;
            args.push_i32(geometry.channels_arg())?;
            args.push_i32(geometry.remain_channels)?;
            args.push_buffer(output.buffer)
        })?;

        launcher.launch(ctx, kernel, &geometry, guard.pending_check())
    }

    pub fn is_built(&self) -> bool {
        self.cache.is_built()
    }

    pub fn max_work_group_size(&self) -> Option<u32> {
        self.cache.max_work_group_size()
    }

    pub fn bound_shape(&self) -> Option<&[usize]> {
        self.binder.cached_shape()
    }

    pub fn rebind_count(&self) -> u64 {
        self.binder.rebind_count()
    }

    pub fn guard(&self) -> &G {
        &self.guard
    }
}
