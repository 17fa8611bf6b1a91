use crate::binder::ArgWriter;
use chanorm_accelerate_api::{
    AccelError, AccelResult, BufferHandle, BuildOptions, Kernel, KernelRuntime,
};

/// Build option that makes programs bounds-check their output writes.
pub const OUT_OF_RANGE_CHECK: &str = "OUT_OF_RANGE_CHECK";

/// Instrumentation wrapped around a kernel launch.
///
/// An implementation contributes build options, a per-launch reset of its
/// device state, leading kernel arguments, and a check to run once the
/// dispatch has completed.
pub trait ExecutionGuard: Default {
    fn configure(&self, options: &mut BuildOptions);

    /// Called before every launch once the kernel exists.
    fn init<R: KernelRuntime>(&mut self, runtime: &R) -> AccelResult<()>;

    /// Push the guard's arguments; they precede the operator's own.
    fn set_args<K: Kernel>(&self, args: &mut ArgWriter<'_, K>, output_size: usize)
        -> AccelResult<()>;

    fn pending_check(&self) -> Option<OutOfRangeCheck>;
}

/// Production strategy: contributes nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopGuard;

impl ExecutionGuard for NoopGuard {
    fn configure(&self, _options: &mut BuildOptions) {}

    fn init<R: KernelRuntime>(&mut self, _runtime: &R) -> AccelResult<()> {
        Ok(())
    }

    fn set_args<K: Kernel>(
        &self,
        _args: &mut ArgWriter<'_, K>,
        _output_size: usize,
    ) -> AccelResult<()> {
        Ok(())
    }

    fn pending_check(&self) -> Option<OutOfRangeCheck> {
        None
    }
}

/// Debug strategy: the program raises a flag in a status buffer when it
/// would write at or past `output_size`.
#[derive(Debug, Default)]
pub struct OutOfRangeGuard {
    flag: Option<BufferHandle>,
}

impl OutOfRangeGuard {
    pub fn flag_buffer(&self) -> Option<BufferHandle> {
        self.flag
    }
}

impl ExecutionGuard for OutOfRangeGuard {
    fn configure(&self, options: &mut BuildOptions) {
        options.flag(OUT_OF_RANGE_CHECK);
    }

    fn init<R: KernelRuntime>(&mut self, runtime: &R) -> AccelResult<()> {
        let flag = match self.flag {
            Some(flag) => flag,
            None => {
                let flag = runtime.create_status_buffer()?;
                log::debug!("allocated out-of-range status buffer {}", flag.buffer_id);
                *self.flag.insert(flag)
            }
        };
        runtime.write_status(&flag, 0)
    }

    fn set_args<K: Kernel>(
        &self,
        args: &mut ArgWriter<'_, K>,
        output_size: usize,
    ) -> AccelResult<()> {
        let flag = self.flag.ok_or_else(|| {
            AccelError::dispatch("out-of-range guard used before initialization")
        })?;
        let size = u32::try_from(output_size).map_err(|_| {
            AccelError::unsupported(format!(
                "output size {output_size} exceeds the bounds-check range"
            ))
        })?;
        args.push_buffer(flag)?;
        args.push_u32(size)
    }

    fn pending_check(&self) -> Option<OutOfRangeCheck> {
        self.flag.map(|flag| OutOfRangeCheck { flag })
    }
}

/// Post-dispatch validation of an [`OutOfRangeGuard`] status buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutOfRangeCheck {
    flag: BufferHandle,
}

impl OutOfRangeCheck {
    pub fn validate<R: KernelRuntime>(&self, runtime: &R) -> AccelResult<()> {
        match runtime.read_status(&self.flag)? {
            0 => Ok(()),
            code => {
                log::warn!("kernel reported an out-of-range write (code {code})");
                Err(AccelError::OutOfRange { code })
            }
        }
    }
}

#[cfg(feature = "out-of-range-check")]
pub type DefaultGuard = OutOfRangeGuard;

#[cfg(not(feature = "out-of-range-check"))]
pub type DefaultGuard = NoopGuard;
