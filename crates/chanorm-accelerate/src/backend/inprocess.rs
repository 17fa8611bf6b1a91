//! Host implementation of [`KernelRuntime`].
//!
//! Programs are plain Rust functions run over every invocation of the
//! launch grid, so launch geometry, argument layout and build options are
//! exercised exactly as on a device. Buffers hold `f32` values rounded to
//! their element type.

use crate::guard::OUT_OF_RANGE_CHECK;
use crate::ops::softmax::{SOFTMAX_KERNEL_NAME, SOFTMAX_PROGRAM};
use anyhow::anyhow;
use chanorm_accelerate_api::{
    next_device_id, AccelError, AccelResult, BufferHandle, BuildOptions, DataType, Dispatch,
    GpuTensor, Kernel, KernelArg, KernelRuntime,
};
use smallvec::SmallVec;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

const MAX_KERNEL_ARGS: u32 = 64;
const DEFAULT_MAX_WORK_GROUP_SIZE: u32 = 256;
const DEFAULT_MAX_WORK_GROUP_DIMS: [u32; 3] = [256, 256, 64];

pub type HostProgramFn = fn(&mut HostLaunch<'_>) -> AccelResult<()>;

/// A program the runtime can build kernels from.
#[derive(Clone, Copy)]
pub struct HostProgram {
    /// Entry point name; a `-D<entry>=<symbol>` option renames it.
    pub entry: &'static str,
    /// Defines that must name an element type (`f32` / `f16`).
    pub type_defines: &'static [&'static str],
    pub run: HostProgramFn,
}

/// Program whose kernels do nothing.
pub struct NoopProgram;

impl NoopProgram {
    pub const NAME: &'static str = "noop";
    pub const ENTRY: &'static str = "noop";

    pub fn program() -> HostProgram {
        HostProgram {
            entry: Self::ENTRY,
            type_defines: &[],
            run: noop,
        }
    }
}

fn noop(_launch: &mut HostLaunch<'_>) -> AccelResult<()> {
    Ok(())
}

#[derive(Debug, Clone)]
pub struct HostBuffer {
    pub dtype: DataType,
    pub data: Vec<f32>,
}

fn quantize(value: f32, dtype: DataType) -> f32 {
    match dtype {
        DataType::F32 => value,
        DataType::F16 => half::f16::from_f32(value).to_f32(),
    }
}

/// View of one dispatch handed to a [`HostProgram`].
pub struct HostLaunch<'a> {
    pub options: &'a BuildOptions,
    pub dispatch: Dispatch,
    args: &'a [Option<KernelArg>],
    buffers: &'a mut HashMap<u64, HostBuffer>,
    device_id: u32,
}

impl<'a> HostLaunch<'a> {
    pub fn arg(&self, index: usize) -> AccelResult<KernelArg> {
        self.args
            .get(index)
            .copied()
            .flatten()
            .ok_or_else(|| AccelError::dispatch(format!("kernel argument {index} is not set")))
    }

    pub fn buffer_arg(&self, index: usize) -> AccelResult<BufferHandle> {
        match self.arg(index)? {
            KernelArg::Buffer(handle) => Ok(handle),
            other => Err(mismatch(index, "buffer", other)),
        }
    }

    pub fn i32_arg(&self, index: usize) -> AccelResult<i32> {
        match self.arg(index)? {
            KernelArg::I32(value) => Ok(value),
            other => Err(mismatch(index, "i32", other)),
        }
    }

    pub fn u32_arg(&self, index: usize) -> AccelResult<u32> {
        match self.arg(index)? {
            KernelArg::U32(value) => Ok(value),
            other => Err(mismatch(index, "u32", other)),
        }
    }

    /// Element type named by a define, e.g. `OUT_DATA_TYPE`.
    pub fn type_define(&self, name: &str) -> AccelResult<DataType> {
        self.options
            .value(name)
            .and_then(DataType::from_program_tag)
            .ok_or_else(|| AccelError::dispatch(format!("{name} does not name an element type")))
    }

    pub fn read(&self, handle: BufferHandle) -> AccelResult<&[f32]> {
        Ok(&lookup(&*self.buffers, self.device_id, handle)?.data)
    }

    /// Store `value` rounded to `dtype`. Returns `false` when `index` lies
    /// past the end of the buffer.
    pub fn store(
        &mut self,
        handle: BufferHandle,
        index: usize,
        value: f32,
        dtype: DataType,
    ) -> AccelResult<bool> {
        let buffer = lookup_mut(&mut *self.buffers, self.device_id, handle)?;
        match buffer.data.get_mut(index) {
            Some(slot) => {
                *slot = quantize(value, dtype);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Every global id of the launch, offset included.
    pub fn invocations(&self) -> impl Iterator<Item = [u32; 3]> + 'static {
        let Dispatch { global, offset, .. } = self.dispatch;
        (0..global[2]).flat_map(move |z| {
            (0..global[1]).flat_map(move |y| {
                (0..global[0]).map(move |x| [x + offset[0], y + offset[1], z + offset[2]])
            })
        })
    }
}

fn mismatch(index: usize, expected: &str, found: KernelArg) -> AccelError {
    AccelError::dispatch(format!("kernel argument {index}: expected {expected}, found {found:?}"))
}

fn lookup<'m>(
    buffers: &'m HashMap<u64, HostBuffer>,
    device_id: u32,
    handle: BufferHandle,
) -> AccelResult<&'m HostBuffer> {
    if handle.device_id != device_id {
        return Err(foreign_buffer(handle, device_id));
    }
    buffers
        .get(&handle.buffer_id)
        .ok_or_else(|| AccelError::dispatch(format!("unknown buffer {}", handle.buffer_id)))
}

fn lookup_mut<'m>(
    buffers: &'m mut HashMap<u64, HostBuffer>,
    device_id: u32,
    handle: BufferHandle,
) -> AccelResult<&'m mut HostBuffer> {
    if handle.device_id != device_id {
        return Err(foreign_buffer(handle, device_id));
    }
    buffers
        .get_mut(&handle.buffer_id)
        .ok_or_else(|| AccelError::dispatch(format!("unknown buffer {}", handle.buffer_id)))
}

fn foreign_buffer(handle: BufferHandle, device_id: u32) -> AccelError {
    AccelError::dispatch(format!(
        "buffer {} belongs to device {}, not {}",
        handle.buffer_id, handle.device_id, device_id
    ))
}

/// Host side of the `softmax_buffer` program.
fn softmax_buffer(launch: &mut HostLaunch<'_>) -> AccelResult<()> {
    let mut next = 0usize;
    let bounds = if launch.options.is_defined(OUT_OF_RANGE_CHECK) {
        next = 2;
        Some((launch.buffer_arg(0)?, launch.u32_arg(1)? as usize))
    } else {
        None
    };
    let gws = [
        launch.u32_arg(next)?,
        launch.u32_arg(next + 1)?,
        launch.u32_arg(next + 2)?,
    ];
    let input = launch.buffer_arg(next + 3)?;
    let height = launch.i32_arg(next + 4)?.max(1) as usize;
    let channels = launch.i32_arg(next + 5)?.max(0) as usize;
    let remain = launch.i32_arg(next + 6)?.clamp(0, 3) as usize;
    let output = launch.buffer_arg(next + 7)?;
    let out_dtype = launch.type_define("OUT_DATA_TYPE")?;
    let width = gws[1] as usize;

    let logits = launch.read(input)?.to_vec();
    let mut out_of_range = false;
    for [block, w, hb] in launch.invocations() {
        if block >= gws[0] || w >= gws[1] || hb >= gws[2] {
            continue;
        }
        let (b, h) = (hb as usize / height, hb as usize % height);
        let row = ((b * height + h) * width + w as usize) * channels;
        let values = logits.get(row..row + channels).ok_or_else(|| {
            AccelError::dispatch(format!("row at {row} reads past the end of the input"))
        })?;
        let max = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let sum: f32 = values.iter().map(|v| (v - max).exp()).sum();

        let lanes = if block + 1 == gws[0] { 4 - remain } else { 4 };
        for lane in 0..lanes {
            let channel = block as usize * 4 + lane;
            let Some(value) = values.get(channel) else {
                continue;
            };
            let index = row + channel;
            if let Some((_, size)) = bounds {
                if index >= size {
                    out_of_range = true;
                    continue;
                }
            }
            let probability = (value - max).exp() / sum;
            if !launch.store(output, index, probability, out_dtype)? {
                return Err(AccelError::dispatch(format!(
                    "write at {index} past the end of the output buffer"
                )));
            }
        }
    }
    if let (true, Some((flag, _))) = (out_of_range, bounds) {
        launch.store(flag, 0, 1.0, DataType::F32)?;
    }
    Ok(())
}

fn softmax_program() -> HostProgram {
    HostProgram {
        entry: SOFTMAX_KERNEL_NAME,
        type_defines: &["IN_DATA_TYPE", "OUT_DATA_TYPE", "DATA_TYPE"],
        run: softmax_buffer,
    }
}

#[derive(Default)]
struct Counters {
    builds: AtomicU64,
    build_failures: AtomicU64,
    set_args: AtomicU64,
    dispatches: AtomicU64,
    waits: AtomicU64,
    status_buffers: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InProcessStats {
    pub builds: u64,
    pub build_failures: u64,
    pub set_args: u64,
    pub dispatches: u64,
    pub waits: u64,
    pub status_buffers: u64,
}

#[derive(Default)]
struct Faults {
    builds: u32,
    dispatches: u32,
}

#[derive(Clone, Copy)]
enum Fault {
    Build,
    Dispatch,
}

pub struct HostKernel {
    program: String,
    symbol: String,
    options: BuildOptions,
    run: HostProgramFn,
    args: SmallVec<[Option<KernelArg>; 12]>,
    counters: Arc<Counters>,
}

impl HostKernel {
    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn options(&self) -> &BuildOptions {
        &self.options
    }

    pub fn arg(&self, index: usize) -> Option<KernelArg> {
        self.args.get(index).copied().flatten()
    }
}

impl Kernel for HostKernel {
    fn symbol(&self) -> &str {
        &self.symbol
    }

    fn set_arg(&mut self, index: u32, arg: KernelArg) -> AccelResult<()> {
        if index >= MAX_KERNEL_ARGS {
            return Err(AccelError::dispatch(format!(
                "{}: argument index {index} out of range",
                self.symbol
            )));
        }
        let slot = index as usize;
        if self.args.len() <= slot {
            self.args.resize(slot + 1, None);
        }
        self.args[slot] = Some(arg);
        bump(&self.counters.set_args);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostEvent(u64);

pub struct InProcessRuntimeBuilder {
    max_work_group_size: u32,
    max_work_group_dims: [u32; 3],
    non_uniform: bool,
    dispatch_latency: Option<Duration>,
    device_tag: String,
}

impl Default for InProcessRuntimeBuilder {
    fn default() -> Self {
        Self {
            max_work_group_size: DEFAULT_MAX_WORK_GROUP_SIZE,
            max_work_group_dims: DEFAULT_MAX_WORK_GROUP_DIMS,
            non_uniform: false,
            dispatch_latency: None,
            device_tag: "inprocess-host".to_string(),
        }
    }
}

impl InProcessRuntimeBuilder {
    pub fn max_work_group_size(mut self, size: u32) -> Self {
        self.max_work_group_size = size.max(1);
        self
    }

    pub fn max_work_group_dims(mut self, dims: [u32; 3]) -> Self {
        self.max_work_group_dims = dims.map(|d| d.max(1));
        self
    }

    pub fn non_uniform_work_groups(mut self, enabled: bool) -> Self {
        self.non_uniform = enabled;
        self
    }

    /// Sleep this long in every dispatch.
    pub fn dispatch_latency(mut self, latency: Duration) -> Self {
        self.dispatch_latency = Some(latency);
        self
    }

    pub fn device_tag(mut self, tag: impl Into<String>) -> Self {
        self.device_tag = tag.into();
        self
    }

    pub fn build(self) -> InProcessRuntime {
        let mut programs = HashMap::new();
        programs.insert(SOFTMAX_PROGRAM.to_string(), softmax_program());
        InProcessRuntime {
            device_id: next_device_id(),
            next_buffer_id: AtomicU64::new(1),
            next_event: AtomicU64::new(1),
            buffers: Mutex::new(HashMap::new()),
            programs: Mutex::new(programs),
            limits: self,
            counters: Arc::new(Counters::default()),
            faults: Mutex::new(Faults::default()),
            dispatch_log: Mutex::new(Vec::new()),
            last_build_options: Mutex::new(None),
        }
    }
}

pub struct InProcessRuntime {
    device_id: u32,
    next_buffer_id: AtomicU64,
    next_event: AtomicU64,
    buffers: Mutex<HashMap<u64, HostBuffer>>,
    programs: Mutex<HashMap<String, HostProgram>>,
    limits: InProcessRuntimeBuilder,
    counters: Arc<Counters>,
    faults: Mutex<Faults>,
    dispatch_log: Mutex<Vec<Dispatch>>,
    last_build_options: Mutex<Option<BuildOptions>>,
}

impl Default for InProcessRuntime {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<'m, T>(mutex: &'m Mutex<T>, what: &str) -> AccelResult<MutexGuard<'m, T>> {
    mutex
        .lock()
        .map_err(|_| AccelError::Runtime(anyhow!("in-process runtime: {what} lock poisoned")))
}

impl InProcessRuntime {
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> InProcessRuntimeBuilder {
        InProcessRuntimeBuilder::default()
    }

    pub fn device_id(&self) -> u32 {
        self.device_id
    }

    pub fn max_work_group_size(&self) -> u32 {
        self.limits.max_work_group_size
    }

    pub fn register_program(&self, name: &str, program: HostProgram) {
        if let Ok(mut programs) = self.programs.lock() {
            programs.insert(name.to_string(), program);
        }
    }

    pub fn alloc_buffer(&self, len: usize, dtype: DataType) -> AccelResult<BufferHandle> {
        let buffer_id = self.next_buffer_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.buffers, "buffer")?.insert(
            buffer_id,
            HostBuffer {
                dtype,
                data: vec![0.0; len],
            },
        );
        Ok(BufferHandle {
            device_id: self.device_id,
            buffer_id,
        })
    }

    /// Zero-filled tensor.
    pub fn alloc(&self, shape: &[usize], dtype: DataType) -> AccelResult<GpuTensor> {
        let len = shape.iter().product();
        let buffer = self.alloc_buffer(len, dtype)?;
        Ok(GpuTensor::new(shape.to_vec(), dtype, buffer))
    }

    pub fn upload(&self, shape: &[usize], dtype: DataType, data: &[f32]) -> AccelResult<GpuTensor> {
        let expected: usize = shape.iter().product();
        if data.len() != expected {
            return Err(AccelError::Runtime(anyhow!(
                "upload: shape {shape:?} needs {expected} values, got {}",
                data.len()
            )));
        }
        let tensor = self.alloc(shape, dtype)?;
        let mut buffers = lock(&self.buffers, "buffer")?;
        let buffer = lookup_mut(&mut *buffers, self.device_id, tensor.buffer)?;
        for (slot, &value) in buffer.data.iter_mut().zip(data) {
            *slot = quantize(value, dtype);
        }
        drop(buffers);
        Ok(tensor)
    }

    pub fn download(&self, tensor: &GpuTensor) -> AccelResult<Vec<f32>> {
        self.read_buffer(tensor.buffer)
    }

    pub fn read_buffer(&self, handle: BufferHandle) -> AccelResult<Vec<f32>> {
        let buffers = lock(&self.buffers, "buffer")?;
        Ok(lookup(&*buffers, self.device_id, handle)?.data.clone())
    }

    pub fn stats(&self) -> InProcessStats {
        let c = &self.counters;
        InProcessStats {
            builds: c.builds.load(Ordering::Relaxed),
            build_failures: c.build_failures.load(Ordering::Relaxed),
            set_args: c.set_args.load(Ordering::Relaxed),
            dispatches: c.dispatches.load(Ordering::Relaxed),
            waits: c.waits.load(Ordering::Relaxed),
            status_buffers: c.status_buffers.load(Ordering::Relaxed),
        }
    }

    /// Every dispatch issued so far, in order.
    pub fn dispatch_log(&self) -> Vec<Dispatch> {
        self.dispatch_log
            .lock()
            .map(|log| log.clone())
            .unwrap_or_default()
    }

    pub fn last_build_options(&self) -> Option<BuildOptions> {
        self.last_build_options.lock().ok()?.clone()
    }

    pub fn fail_next_builds(&self, count: u32) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.builds = count;
        }
    }

    pub fn fail_next_dispatches(&self, count: u32) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.dispatches = count;
        }
    }

    fn take_fault(&self, fault: Fault) -> AccelResult<bool> {
        let mut faults = lock(&self.faults, "fault")?;
        let remaining = match fault {
            Fault::Build => &mut faults.builds,
            Fault::Dispatch => &mut faults.dispatches,
        };
        if *remaining > 0 {
            *remaining -= 1;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn check_local_size(&self, dispatch: &Dispatch) -> AccelResult<()> {
        let local = dispatch.local;
        let invocations: u64 = local.iter().map(|&d| d as u64).product();
        let dims = self.limits.max_work_group_dims;
        if invocations == 0
            || invocations > self.limits.max_work_group_size as u64
            || local.iter().zip(dims).any(|(&l, max)| l > max)
        {
            return Err(AccelError::dispatch(format!(
                "invalid work-group size {local:?} (max {} invocations, dims {dims:?})",
                self.limits.max_work_group_size
            )));
        }
        if !self.limits.non_uniform {
            for axis in 0..3 {
                if dispatch.global[axis] % local[axis] != 0 {
                    return Err(AccelError::dispatch(format!(
                        "global size {:?} is not a multiple of work-group size {local:?}",
                        dispatch.global
                    )));
                }
            }
        }
        Ok(())
    }
}

impl KernelRuntime for InProcessRuntime {
    type Kernel = HostKernel;
    type Event = HostEvent;

    fn device_tag(&self) -> String {
        self.limits.device_tag.clone()
    }

    fn build_kernel(
        &self,
        program: &str,
        symbol: &str,
        options: &BuildOptions,
    ) -> AccelResult<HostKernel> {
        *lock(&self.last_build_options, "build options")? = Some(options.clone());
        let result = self.compile(program, symbol, options);
        match &result {
            Ok(_) => bump(&self.counters.builds),
            Err(_) => bump(&self.counters.build_failures),
        }
        result
    }

    fn kernel_max_work_group_size(&self, _kernel: &HostKernel) -> u32 {
        self.limits.max_work_group_size
    }

    fn max_work_group_dims(&self) -> [u32; 3] {
        self.limits.max_work_group_dims
    }

    fn supports_non_uniform_work_groups(&self) -> bool {
        self.limits.non_uniform
    }

    fn dispatch(&self, kernel: &HostKernel, dispatch: &Dispatch) -> AccelResult<HostEvent> {
        if self.take_fault(Fault::Dispatch)? {
            return Err(AccelError::dispatch(format!("{}: injected dispatch failure", kernel.symbol)));
        }
        self.check_local_size(dispatch)?;
        lock(&self.dispatch_log, "dispatch log")?.push(*dispatch);
        if let Some(latency) = self.limits.dispatch_latency {
            std::thread::sleep(latency);
        }

        let mut buffers = lock(&self.buffers, "buffer")?;
        let mut launch = HostLaunch {
            options: &kernel.options,
            dispatch: *dispatch,
            args: &kernel.args[..],
            buffers: &mut *buffers,
            device_id: self.device_id,
        };
        (kernel.run)(&mut launch)?;
        bump(&self.counters.dispatches);
        Ok(HostEvent(self.next_event.fetch_add(1, Ordering::Relaxed)))
    }

    fn wait(&self, _event: HostEvent) -> AccelResult<()> {
        bump(&self.counters.waits);
        Ok(())
    }

    fn create_status_buffer(&self) -> AccelResult<BufferHandle> {
        let handle = self.alloc_buffer(1, DataType::F32)?;
        bump(&self.counters.status_buffers);
        Ok(handle)
    }

    fn write_status(&self, buffer: &BufferHandle, value: u32) -> AccelResult<()> {
        let mut buffers = lock(&self.buffers, "buffer")?;
        let status = lookup_mut(&mut *buffers, self.device_id, *buffer)?;
        match status.data.first_mut() {
            Some(word) => {
                *word = value as f32;
                Ok(())
            }
            None => Err(AccelError::dispatch("status buffer is empty")),
        }
    }

    fn read_status(&self, buffer: &BufferHandle) -> AccelResult<u32> {
        let buffers = lock(&self.buffers, "buffer")?;
        let status = lookup(&*buffers, self.device_id, *buffer)?;
        status
            .data
            .first()
            .map(|&word| word as u32)
            .ok_or_else(|| AccelError::dispatch("status buffer is empty"))
    }
}

impl InProcessRuntime {
    fn compile(&self, program: &str, symbol: &str, options: &BuildOptions) -> AccelResult<HostKernel> {
        if self.take_fault(Fault::Build)? {
            return Err(AccelError::build(program, symbol, "injected build failure"));
        }
        let source = lock(&self.programs, "program")?
            .get(program)
            .copied()
            .ok_or_else(|| AccelError::build(program, symbol, "program is not registered"))?;
        let exported = options.value(source.entry).unwrap_or(source.entry);
        if exported != symbol {
            return Err(AccelError::build(
                program,
                symbol,
                format!("program exports '{exported}'"),
            ));
        }
        for define in source.type_defines {
            if options.value(define).and_then(DataType::from_program_tag).is_none() {
                return Err(AccelError::build(
                    program,
                    symbol,
                    format!("{define} must name an element type"),
                ));
            }
        }
        Ok(HostKernel {
            program: program.to_string(),
            symbol: symbol.to_string(),
            options: options.clone(),
            run: source.run,
            args: SmallVec::new(),
            counters: Arc::clone(&self.counters),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn softmax_options(symbol: &str) -> BuildOptions {
        let mut options = BuildOptions::new();
        options.define(SOFTMAX_KERNEL_NAME, symbol);
        options.define("IN_DATA_TYPE", "f32");
        options.define("OUT_DATA_TYPE", "f32");
        options.define("DATA_TYPE", "f32");
        options
    }

    #[test]
    fn build_requires_the_exported_symbol() {
        let runtime = InProcessRuntime::new();
        let err = runtime
            .build_kernel(SOFTMAX_PROGRAM, "renamed", &softmax_options("softmax"))
            .err();
        assert!(matches!(err, Some(AccelError::Build { .. })));
        runtime
            .build_kernel(SOFTMAX_PROGRAM, "renamed", &softmax_options("renamed"))
            .expect("renamed entry point");
        assert_eq!(runtime.stats().build_failures, 1);
        assert_eq!(runtime.stats().builds, 1);
    }

    #[test]
    fn build_rejects_missing_type_defines() {
        let runtime = InProcessRuntime::new();
        let mut options = BuildOptions::new();
        options.define(SOFTMAX_KERNEL_NAME, "softmax");
        let err = runtime.build_kernel(SOFTMAX_PROGRAM, "softmax", &options).err();
        assert!(matches!(err, Some(AccelError::Build { .. })));
        let unknown = runtime.build_kernel("missing", "main", &BuildOptions::new()).err();
        assert!(matches!(unknown, Some(AccelError::Build { .. })));
    }

    #[test]
    fn half_uploads_are_rounded() {
        let runtime = InProcessRuntime::new();
        let tensor = runtime
            .upload(&[1, 2], DataType::F16, &[0.1, 1.0])
            .expect("upload");
        let data = runtime.download(&tensor).expect("download");
        assert_eq!(data[0], half::f16::from_f32(0.1).to_f32());
        assert_ne!(data[0], 0.1);
        assert_eq!(data[1], 1.0);
        assert!(runtime.upload(&[2, 2], DataType::F32, &[1.0]).is_err());
    }

    #[test]
    fn uniform_devices_reject_partial_groups() {
        let runtime = InProcessRuntime::new();
        runtime.register_program(NoopProgram::NAME, NoopProgram::program());
        let kernel = runtime
            .build_kernel(NoopProgram::NAME, NoopProgram::ENTRY, &BuildOptions::new())
            .expect("kernel");
        assert!(runtime.dispatch(&kernel, &Dispatch::new([6, 1, 1], [4, 1, 1])).is_err());
        assert!(runtime.dispatch(&kernel, &Dispatch::new([8, 1, 1], [4, 1, 1])).is_ok());
        assert!(runtime.dispatch(&kernel, &Dispatch::new([512, 1, 1], [512, 1, 1])).is_err());
    }

    #[test]
    fn foreign_buffers_are_rejected() {
        let a = InProcessRuntime::new();
        let b = InProcessRuntime::new();
        let tensor = a.alloc(&[1, 4], DataType::F32).expect("alloc");
        assert!(b.download(&tensor).is_err());
    }

    #[test]
    fn unset_arguments_fail_the_dispatch() {
        let runtime = InProcessRuntime::new();
        let kernel = runtime
            .build_kernel(SOFTMAX_PROGRAM, "softmax", &softmax_options("softmax"))
            .expect("kernel");
        let err = runtime.dispatch(&kernel, &Dispatch::new([4, 4, 4], [4, 4, 4])).err();
        assert!(matches!(err, Some(AccelError::Dispatch(_))));
    }
}
