use chanorm_accelerate_api::{AccelResult, BufferHandle, Kernel, KernelArg};
use smallvec::SmallVec;

/// Sets consecutive kernel arguments starting from index 0.
pub struct ArgWriter<'k, K: Kernel> {
    kernel: &'k mut K,
    index: u32,
}

impl<'k, K: Kernel> ArgWriter<'k, K> {
    pub fn new(kernel: &'k mut K) -> Self {
        Self { kernel, index: 0 }
    }

    pub fn push(&mut self, arg: KernelArg) -> AccelResult<()> {
        self.kernel.set_arg(self.index, arg)?;
        self.index += 1;
        Ok(())
    }

    pub fn push_buffer(&mut self, buffer: BufferHandle) -> AccelResult<()> {
        self.push(KernelArg::Buffer(buffer))
    }

    pub fn push_i32(&mut self, value: i32) -> AccelResult<()> {
        self.push(KernelArg::I32(value))
    }

    pub fn push_u32(&mut self, value: u32) -> AccelResult<()> {
        self.push(KernelArg::U32(value))
    }

    pub fn push_global_size(&mut self, global: [u32; 3]) -> AccelResult<()> {
        for extent in global {
            self.push_u32(extent)?;
        }
        Ok(())
    }

    /// Index the next pushed argument lands at.
    pub fn next_index(&self) -> u32 {
        self.index
    }
}

/// Re-sets kernel arguments only when the input shape changes.
///
/// Buffers are bound along with the shape: passing different tensors of an
/// identical shape keeps the previously bound buffers.
#[derive(Debug, Default)]
pub struct ArgumentBinder {
    cached_shape: Option<SmallVec<[usize; 4]>>,
    rebinds: u64,
}

impl ArgumentBinder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn needs_rebind(&self, shape: &[usize]) -> bool {
        self.cached_shape.as_deref() != Some(shape)
    }

    /// Runs `bind` against a fresh [`ArgWriter`] if `shape` differs from the
    /// last bound shape. Returns whether a rebind happened. The cached shape
    /// is cleared before binding, so a failure partway through forces a full
    /// rebind on the next call whatever its shape.
    pub fn bind_if_shape_changed<K, F>(
        &mut self,
        kernel: &mut K,
        shape: &[usize],
        bind: F,
    ) -> AccelResult<bool>
    where
        K: Kernel,
        F: FnOnce(&mut ArgWriter<'_, K>) -> AccelResult<()>,
    {
        if !self.needs_rebind(shape) {
            return Ok(false);
        }
        log::debug!(
            "{}: binding arguments for shape {:?} (previous {:?})",
            kernel.symbol(),
            shape,
            self.cached_shape.as_deref()
        );
        self.cached_shape = None;
        let mut writer = ArgWriter::new(kernel);
        bind(&mut writer)?;
        self.cached_shape = Some(SmallVec::from_slice(shape));
        self.rebinds += 1;
        Ok(true)
    }

    pub fn cached_shape(&self) -> Option<&[usize]> {
        self.cached_shape.as_deref()
    }

    pub fn rebind_count(&self) -> u64 {
        self.rebinds
    }

    /// Forget the bound shape; the next call rebinds unconditionally.
    pub fn invalidate(&mut self) {
        self.cached_shape = None;
    }
}
