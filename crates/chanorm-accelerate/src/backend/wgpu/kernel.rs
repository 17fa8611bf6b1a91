use super::bindings::{collect_args, MAX_BUFFER_ARGS};
use chanorm_accelerate_api::{AccelError, AccelResult, BufferHandle, Kernel, KernelArg};
use smallvec::SmallVec;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

pub(crate) struct KernelLayout {
    pub buffer_count: usize,
    pub bind_group_layout: Arc<wgpu::BindGroupLayout>,
    pub pipeline_layout: Arc<wgpu::PipelineLayout>,
}

/// Device objects derived from the kernel source and its arguments.
#[derive(Default)]
pub(crate) struct KernelState {
    pub layout: Option<KernelLayout>,
    /// One pipeline per work-group size.
    pub pipelines: HashMap<[u32; 3], Arc<wgpu::ComputePipeline>>,
    pub bind_group: Option<Arc<wgpu::BindGroup>>,
    pub params: Option<Arc<wgpu::Buffer>>,
    pub dispatch_info: Option<Arc<wgpu::Buffer>>,
    pub params_dirty: bool,
}

/// A preprocessed WGSL program. Work-group size placeholders stay symbolic
/// until a dispatch picks a local size.
pub struct WgpuKernel {
    pub(crate) program: String,
    pub(crate) symbol: String,
    pub(crate) source: String,
    pub(crate) max_work_group_size: u32,
    args: SmallVec<[Option<KernelArg>; 12]>,
    pub(crate) state: Mutex<KernelState>,
}

impl WgpuKernel {
    pub(crate) fn new(program: &str, symbol: &str, source: String, max_work_group_size: u32) -> Self {
        Self {
            program: program.to_string(),
            symbol: symbol.to_string(),
            source,
            max_work_group_size,
            args: SmallVec::new(),
            state: Mutex::new(KernelState::default()),
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Processed source, with `LWS_X/Y/Z` still unresolved.
    pub fn source(&self) -> &str {
        &self.source
    }

    pub(crate) fn args(&self) -> AccelResult<Vec<KernelArg>> {
        collect_args(&self.args, &self.symbol)
    }

    pub(crate) fn buffer_args(args: &[KernelArg]) -> Vec<BufferHandle> {
        args.iter()
            .filter_map(|arg| match arg {
                KernelArg::Buffer(handle) => Some(*handle),
                _ => None,
            })
            .collect()
    }
}

impl Kernel for WgpuKernel {
    fn symbol(&self) -> &str {
        &self.symbol
    }

    fn set_arg(&mut self, index: u32, arg: KernelArg) -> AccelResult<()> {
        let slot = index as usize;
        if slot >= 64 {
            return Err(AccelError::dispatch(format!(
                "{}: argument index {index} out of range",
                self.symbol
            )));
        }
        if self.args.len() <= slot {
            self.args.resize(slot + 1, None);
        }
        let buffers_before = self.args.iter().flatten().filter(|a| matches!(a, KernelArg::Buffer(_))).count();
        self.args[slot] = Some(arg);
        let buffers_after = self.args.iter().flatten().filter(|a| matches!(a, KernelArg::Buffer(_))).count();
        if buffers_after > MAX_BUFFER_ARGS {
            return Err(AccelError::dispatch(format!(
                "{}: more than {MAX_BUFFER_ARGS} buffer arguments",
                self.symbol
            )));
        }

        let state = self
            .state
            .get_mut()
            .map_err(|_| AccelError::Runtime(anyhow::anyhow!("{}: kernel state poisoned", self.symbol)))?;
        state.bind_group = None;
        state.params_dirty = true;
        if buffers_before != buffers_after {
            state.layout = None;
            state.pipelines.clear();
        }
        Ok(())
    }
}
