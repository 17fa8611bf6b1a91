use crate::context::{KernelFuture, OpContext};
use crate::geometry::LaunchGeometry;
use crate::guard::OutOfRangeCheck;
use crate::tuning::{tuning_key, LocalWorkSize, DEFAULT_LOCAL_WORK_SIZE};
use chanorm_accelerate_api::{AccelResult, KernelRuntime};

/// Launches a kernel over a [`LaunchGeometry`] through the context's tuner.
#[derive(Debug, Clone, Copy)]
pub struct TunedLauncher {
    op_name: &'static str,
    seed: LocalWorkSize,
}

impl TunedLauncher {
    pub const fn new(op_name: &'static str) -> Self {
        Self {
            op_name,
            seed: DEFAULT_LOCAL_WORK_SIZE,
        }
    }

    pub fn seed(&self) -> LocalWorkSize {
        self.seed
    }

    pub fn tuning_key(&self, geometry: &LaunchGeometry) -> String {
        tuning_key(self.op_name, &geometry.extents())
    }

    /// Dispatch and either wait (blocking contexts) or park the completion
    /// handle in the context. Dispatch errors are returned as they are.
    pub fn launch<R: KernelRuntime>(
        &self,
        ctx: &mut OpContext<'_, R>,
        kernel: &R::Kernel,
        geometry: &LaunchGeometry,
        check: Option<OutOfRangeCheck>,
    ) -> AccelResult<()> {
        let key = self.tuning_key(geometry);
        let event = ctx.tuner().tune_or_run(
            ctx.runtime(),
            kernel,
            &key,
            geometry.global_work_size,
            self.seed,
        )?;
        ctx.complete(KernelFuture::new(event, check))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_uses_batch_height_width_channels() {
        let launcher = TunedLauncher::new("softmax_kernel");
        let rank2 = LaunchGeometry::derive(&[3, 10]).expect("geometry");
        assert_eq!(launcher.tuning_key(&rank2), "softmax_kernel_3_1_1_10");
        assert_eq!(launcher.seed(), LocalWorkSize::new(4, 4, 4, 0));
    }
}
