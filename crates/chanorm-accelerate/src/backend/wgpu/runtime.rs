use super::bindings::{kernel_layout_entries, pack_scalars, DISPATCH_INFO_BINDING, PARAMS_BINDING};
use super::kernel::{KernelLayout, KernelState, WgpuKernel};
use super::preprocess::{preprocess, substitute_identifiers, Defines};
use super::shaders::builtin_program;
use crate::config;
use anyhow::{anyhow, Context, Result};
use chanorm_accelerate_api::{
    next_device_id, AccelError, AccelResult, BufferHandle, BuildOptions, DataType, Dispatch,
    GpuTensor, Kernel, KernelRuntime,
};
use futures::channel::oneshot;
use log::{error, info, warn};
use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use wgpu::util::DeviceExt;

const TYPE_DEFINES: [&str; 3] = ["IN_DATA_TYPE", "OUT_DATA_TYPE", "DATA_TYPE"];
const STATUS_BUFFER_BYTES: u64 = 16;

#[derive(Debug, Clone)]
pub struct WgpuRuntimeOptions {
    pub power_preference: wgpu::PowerPreference,
    pub force_fallback_adapter: bool,
}

impl Default for WgpuRuntimeOptions {
    fn default() -> Self {
        Self {
            power_preference: wgpu::PowerPreference::HighPerformance,
            force_fallback_adapter: false,
        }
    }
}

impl WgpuRuntimeOptions {
    /// `CHANORM_WGPU_POWER=low|high`, `CHANORM_WGPU_FORCE_FALLBACK=1`.
    pub fn from_env() -> Self {
        let mut options = Self::default();
        if let Some(power) = config::env_string(config::ENV_WGPU_POWER) {
            match power.to_ascii_lowercase().as_str() {
                "low" | "lowpower" | "low_power" => {
                    options.power_preference = wgpu::PowerPreference::LowPower
                }
                "high" | "highperformance" | "high_performance" => {
                    options.power_preference = wgpu::PowerPreference::HighPerformance
                }
                other => warn!("ignoring {}={other:?}", config::ENV_WGPU_POWER),
            }
        }
        if let Some(fallback) = config::env_flag(config::ENV_WGPU_FORCE_FALLBACK) {
            options.force_fallback_adapter = fallback;
        }
        options
    }
}

struct BufferEntry {
    buffer: Arc<wgpu::Buffer>,
    dtype: DataType,
    len: usize,
    size_bytes: u64,
}

pub struct WgpuEvent {
    index: wgpu::SubmissionIndex,
}

pub struct WgpuRuntime {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    adapter_info: wgpu::AdapterInfo,
    limits: wgpu::Limits,
    features: wgpu::Features,
    device_id: u32,
    next_buffer_id: AtomicU64,
    buffers: Mutex<HashMap<u64, BufferEntry>>,
    programs: Mutex<HashMap<String, Arc<str>>>,
}

fn lock<'m, T>(mutex: &'m Mutex<T>, what: &str) -> AccelResult<MutexGuard<'m, T>> {
    mutex
        .lock()
        .map_err(|_| AccelError::Runtime(anyhow!("wgpu runtime: {what} lock poisoned")))
}

fn install_device_error_handlers(device: &wgpu::Device) {
    device.on_uncaptured_error(Box::new(|error| {
        error!("wgpu uncaptured error: {:?}", error);
    }));
}

fn align4(bytes: u64) -> u64 {
    bytes.div_ceil(wgpu::COPY_BUFFER_ALIGNMENT) * wgpu::COPY_BUFFER_ALIGNMENT
}

impl WgpuRuntime {
    pub fn new(options: WgpuRuntimeOptions) -> Result<Self> {
        pollster::block_on(Self::new_async(options))
    }

    pub async fn new_async(options: WgpuRuntimeOptions) -> Result<Self> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: options.power_preference,
                force_fallback_adapter: options.force_fallback_adapter,
                compatible_surface: None,
            })
            .await
            .ok_or_else(|| anyhow!("wgpu: no compatible adapter found"))?;

        let adapter_info = adapter.get_info();
        let features = adapter.features() & wgpu::Features::SHADER_F16;
        let limits = adapter.limits();
        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("chanorm wgpu device"),
                    required_features: features,
                    required_limits: limits.clone(),
                },
                None,
            )
            .await
            .context("wgpu: request_device failed")?;
        install_device_error_handlers(&device);
        info!(
            "wgpu adapter: {} ({:?}, f16: {}, max invocations {})",
            adapter_info.name,
            adapter_info.backend,
            features.contains(wgpu::Features::SHADER_F16),
            limits.max_compute_invocations_per_workgroup
        );

        Ok(Self {
            device: Arc::new(device),
            queue: Arc::new(queue),
            adapter_info,
            limits,
            features,
            device_id: next_device_id(),
            next_buffer_id: AtomicU64::new(1),
            buffers: Mutex::new(HashMap::new()),
            programs: Mutex::new(HashMap::new()),
        })
    }

    pub fn adapter_info(&self) -> &wgpu::AdapterInfo {
        &self.adapter_info
    }

    pub fn supports_f16(&self) -> bool {
        self.features.contains(wgpu::Features::SHADER_F16)
    }

    /// Register (or override) the WGSL source of a program.
    pub fn register_program(&self, name: &str, source: &str) {
        if let Ok(mut programs) = self.programs.lock() {
            programs.insert(name.to_string(), Arc::from(source));
        }
    }

    fn program_source(&self, name: &str) -> AccelResult<Option<Arc<str>>> {
        if let Some(source) = lock(&self.programs, "program")?.get(name) {
            return Ok(Some(Arc::clone(source)));
        }
        Ok(builtin_program(name).map(Arc::from))
    }

    fn register_buffer(&self, buffer: wgpu::Buffer, dtype: DataType, len: usize) -> AccelResult<BufferHandle> {
        let buffer_id = self.next_buffer_id.fetch_add(1, Ordering::Relaxed);
        let size_bytes = buffer.size();
        lock(&self.buffers, "buffer")?.insert(
            buffer_id,
            BufferEntry {
                buffer: Arc::new(buffer),
                dtype,
                len,
                size_bytes,
            },
        );
        Ok(BufferHandle {
            device_id: self.device_id,
            buffer_id,
        })
    }

    fn buffer(&self, handle: &BufferHandle) -> AccelResult<Arc<wgpu::Buffer>> {
        self.with_entry(handle, |entry| Arc::clone(&entry.buffer))
    }

    fn with_entry<T>(&self, handle: &BufferHandle, f: impl FnOnce(&BufferEntry) -> T) -> AccelResult<T> {
        if handle.device_id != self.device_id {
            return Err(AccelError::dispatch(format!(
                "buffer {} belongs to device {}, not {}",
                handle.buffer_id, handle.device_id, self.device_id
            )));
        }
        let buffers = lock(&self.buffers, "buffer")?;
        buffers
            .get(&handle.buffer_id)
            .map(f)
            .ok_or_else(|| AccelError::dispatch(format!("unknown buffer {}", handle.buffer_id)))
    }

    fn create_storage(&self, label: &str, contents: &[u8]) -> wgpu::Buffer {
        let mut padded = contents.to_vec();
        padded.resize((align4(contents.len() as u64).max(STATUS_BUFFER_BYTES)) as usize, 0);
        self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some(label),
            contents: &padded,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_SRC
                | wgpu::BufferUsages::COPY_DST,
        })
    }

    /// Upload host `f32` values, stored as `dtype` on the device.
    pub fn upload_f32(&self, shape: &[usize], dtype: DataType, data: &[f32]) -> AccelResult<GpuTensor> {
        let expected: usize = shape.iter().product();
        if data.len() != expected {
            return Err(AccelError::Runtime(anyhow!(
                "upload: shape {shape:?} needs {expected} values, got {}",
                data.len()
            )));
        }
        let bytes: Vec<u8> = match dtype {
            DataType::F32 => bytemuck::cast_slice(data).to_vec(),
            DataType::F16 => {
                let halves: Vec<half::f16> = data.iter().map(|&v| half::f16::from_f32(v)).collect();
                bytemuck::cast_slice(&halves).to_vec()
            }
        };
        let buffer = self.create_storage("chanorm-tensor", &bytes);
        let handle = self.register_buffer(buffer, dtype, expected)?;
        Ok(GpuTensor::new(shape.to_vec(), dtype, handle))
    }

    /// Zero-filled tensor.
    pub fn alloc(&self, shape: &[usize], dtype: DataType) -> AccelResult<GpuTensor> {
        let len: usize = shape.iter().product();
        let buffer = self.create_storage("chanorm-tensor", &vec![0u8; len * dtype.size_in_bytes()]);
        let handle = self.register_buffer(buffer, dtype, len)?;
        Ok(GpuTensor::new(shape.to_vec(), dtype, handle))
    }

    pub fn download_f32(&self, tensor: &GpuTensor) -> AccelResult<Vec<f32>> {
        let (buffer, dtype, len, size_bytes) = self.with_entry(&tensor.buffer, |entry| {
            (Arc::clone(&entry.buffer), entry.dtype, entry.len, entry.size_bytes)
        })?;
        let wanted = align4((len * dtype.size_in_bytes()) as u64).min(size_bytes);
        let bytes = self.read_bytes(&buffer, wanted, "download")?;
        let values = match dtype {
            DataType::F32 => bytes
                .chunks_exact(4)
                .take(len)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
            DataType::F16 => bytes
                .chunks_exact(2)
                .take(len)
                .map(|c| half::f16::from_le_bytes([c[0], c[1]]).to_f32())
                .collect(),
        };
        Ok(values)
    }

    fn read_bytes(&self, source: &wgpu::Buffer, size: u64, context: &str) -> AccelResult<Vec<u8>> {
        let size = size.max(wgpu::COPY_BUFFER_ALIGNMENT);
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("chanorm-readback"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("chanorm-readback-encoder"),
            });
        encoder.copy_buffer_to_buffer(source, 0, &staging, 0, size);
        self.queue.submit(Some(encoder.finish()));
        Ok(self.map_readback_bytes(staging, size, context)?)
    }

    fn map_readback_bytes(&self, staging: wgpu::Buffer, size_bytes: u64, context: &str) -> Result<Vec<u8>> {
        let size_usize = usize::try_from(size_bytes)
            .map_err(|_| anyhow!("{context}: readback size overflow"))?;
        let slice = staging.slice(..);
        let (tx, rx) = oneshot::channel();
        slice.map_async(wgpu::MapMode::Read, move |res| {
            let _ = tx.send(res);
        });
        self.device.poll(wgpu::Maintain::Wait);
        let map_result = pollster::block_on(rx)
            .map_err(|_| anyhow!("{context}: map_async callback dropped"))?;
        map_result.map_err(|e: wgpu::BufferAsyncError| anyhow!(e))?;
        let data = slice.get_mapped_range();
        let mut out = vec![0u8; size_usize];
        out.copy_from_slice(&data);
        drop(data);
        staging.unmap();
        Ok(out)
    }

    fn validate<T>(&self, create: impl FnOnce() -> T) -> (T, Option<wgpu::Error>) {
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let value = create();
        let error = pollster::block_on(self.device.pop_error_scope());
        (value, error)
    }

    fn shader_module(&self, label: &str, wgsl: &str) -> wgpu::ShaderModule {
        self.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(label),
            source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(wgsl)),
        })
    }

    fn check_local_size(&self, local: [u32; 3]) -> AccelResult<()> {
        let limits = &self.limits;
        let max_dims = [
            limits.max_compute_workgroup_size_x,
            limits.max_compute_workgroup_size_y,
            limits.max_compute_workgroup_size_z,
        ];
        let invocations: u64 = local.iter().map(|&d| d as u64).product();
        if invocations > limits.max_compute_invocations_per_workgroup as u64
            || local.iter().zip(max_dims).any(|(&l, max)| l > max)
        {
            return Err(AccelError::dispatch(format!(
                "work-group size {local:?} exceeds device limits (max {} invocations, dims {max_dims:?})",
                limits.max_compute_invocations_per_workgroup
            )));
        }
        Ok(())
    }

    fn ensure_layout<'s>(&self, state: &'s mut KernelState, buffer_count: usize) -> &'s KernelLayout {
        if state.layout.as_ref().map(|l| l.buffer_count) != Some(buffer_count) {
            state.layout = None;
            state.pipelines.clear();
            state.bind_group = None;
        }
        state.layout.get_or_insert_with(|| {
            let entries = kernel_layout_entries(buffer_count);
            let bind_group_layout = self
                .device
                .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                    label: Some("chanorm-kernel-bgl"),
                    entries: &entries,
                });
            let pipeline_layout = self
                .device
                .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                    label: Some("chanorm-kernel-pl"),
                    bind_group_layouts: &[&bind_group_layout],
                    push_constant_ranges: &[],
                });
            KernelLayout {
                buffer_count,
                bind_group_layout: Arc::new(bind_group_layout),
                pipeline_layout: Arc::new(pipeline_layout),
            }
        })
    }

    fn ensure_pipeline(
        &self,
        kernel: &WgpuKernel,
        state: &mut KernelState,
        buffer_count: usize,
        local: [u32; 3],
    ) -> AccelResult<Arc<wgpu::ComputePipeline>> {
        let layout = Arc::clone(&self.ensure_layout(state, buffer_count).pipeline_layout);
        if let Some(pipeline) = state.pipelines.get(&local) {
            return Ok(Arc::clone(pipeline));
        }
        let [x, y, z] = local.map(|d| d.to_string());
        let wgsl = substitute_identifiers(
            &kernel.source,
            &[("LWS_X", x.as_str()), ("LWS_Y", y.as_str()), ("LWS_Z", z.as_str())],
        );
        let label = format!("{}-{}x{}x{}", kernel.symbol, local[0], local[1], local[2]);
        let (pipeline, error) = self.validate(|| {
            let module = self.shader_module(&label, &wgsl);
            self.device
                .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                    label: Some(&label),
                    layout: Some(&layout),
                    module: &module,
                    entry_point: &kernel.symbol,
                })
        });
        if let Some(error) = error {
            return Err(AccelError::dispatch(format!("{label}: pipeline creation failed: {error}")));
        }
        log::debug!("compiled pipeline {label}");
        let pipeline = Arc::new(pipeline);
        state.pipelines.insert(local, Arc::clone(&pipeline));
        Ok(pipeline)
    }

    fn ensure_bind_group(
        &self,
        kernel: &WgpuKernel,
        state: &mut KernelState,
        buffers: &[BufferHandle],
        scalars: &[u8],
    ) -> AccelResult<Arc<wgpu::BindGroup>> {
        if state.params_dirty || state.params.is_none() {
            let reuse = state.params.as_ref().filter(|p| p.size() == scalars.len() as u64);
            match reuse {
                Some(params) => self.queue.write_buffer(params, 0, scalars),
                None => {
                    let params = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                        label: Some("chanorm-kernel-params"),
                        contents: scalars,
                        usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
                    });
                    state.params = Some(Arc::new(params));
                    state.bind_group = None;
                }
            }
            state.params_dirty = false;
        }
        if state.dispatch_info.is_none() {
            let info = self.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("chanorm-dispatch-info"),
                size: 16,
                usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            });
            state.dispatch_info = Some(Arc::new(info));
            state.bind_group = None;
        }
        if let Some(bind_group) = &state.bind_group {
            return Ok(Arc::clone(bind_group));
        }

        let resolved = buffers
            .iter()
            .map(|handle| self.buffer(handle))
            .collect::<AccelResult<Vec<_>>>()?;
        let (Some(layout), Some(params), Some(info)) =
            (&state.layout, &state.params, &state.dispatch_info)
        else {
            return Err(AccelError::dispatch(format!(
                "{}: kernel resources missing",
                kernel.symbol
            )));
        };
        let mut entries: Vec<wgpu::BindGroupEntry<'_>> = resolved
            .iter()
            .enumerate()
            .map(|(binding, buffer)| wgpu::BindGroupEntry {
                binding: binding as u32,
                resource: buffer.as_entire_binding(),
            })
            .collect();
        entries.push(wgpu::BindGroupEntry {
            binding: PARAMS_BINDING,
            resource: params.as_entire_binding(),
        });
        entries.push(wgpu::BindGroupEntry {
            binding: DISPATCH_INFO_BINDING,
            resource: info.as_entire_binding(),
        });
        let (bind_group, error) = self.validate(|| {
            self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("chanorm-kernel-bind-group"),
                layout: &layout.bind_group_layout,
                entries: &entries,
            })
        });
        if let Some(error) = error {
            return Err(AccelError::dispatch(format!(
                "{}: invalid kernel arguments: {error}",
                kernel.symbol
            )));
        }
        let bind_group = Arc::new(bind_group);
        state.bind_group = Some(Arc::clone(&bind_group));
        Ok(bind_group)
    }
}

impl KernelRuntime for WgpuRuntime {
    type Kernel = WgpuKernel;
    type Event = WgpuEvent;

    fn device_tag(&self) -> String {
        format!(
            "{}-{:04x}-{:04x}-{:?}",
            self.adapter_info.name, self.adapter_info.vendor, self.adapter_info.device, self.adapter_info.backend
        )
    }

    fn build_kernel(&self, program: &str, symbol: &str, options: &BuildOptions) -> AccelResult<WgpuKernel> {
        let source = self
            .program_source(program)?
            .ok_or_else(|| AccelError::build(program, symbol, "program is not registered"))?;
        let mut defines = Defines::from_options(options);
        if TYPE_DEFINES.iter().any(|name| options.value(name) == Some("f16")) {
            if !self.supports_f16() {
                return Err(AccelError::build(program, symbol, "device lacks SHADER_F16"));
            }
            defines.insert("ENABLE_F16", None);
        }
        let text = preprocess(&source, &defines)
            .map_err(|err| AccelError::build(program, symbol, err.to_string()))?;
        if !text.contains(&format!("fn {symbol}(")) {
            return Err(AccelError::build(program, symbol, "no such entry point"));
        }

        let probe = substitute_identifiers(&text, &[("LWS_X", "1"), ("LWS_Y", "1"), ("LWS_Z", "1")]);
        let (_module, error) = self.validate(|| self.shader_module(program, &probe));
        if let Some(error) = error {
            return Err(AccelError::build(program, symbol, error.to_string()));
        }
        Ok(WgpuKernel::new(
            program,
            symbol,
            text,
            self.limits.max_compute_invocations_per_workgroup,
        ))
    }

    fn kernel_max_work_group_size(&self, kernel: &WgpuKernel) -> u32 {
        kernel.max_work_group_size
    }

    fn max_work_group_dims(&self) -> [u32; 3] {
        [
            self.limits.max_compute_workgroup_size_x,
            self.limits.max_compute_workgroup_size_y,
            self.limits.max_compute_workgroup_size_z,
        ]
    }

    fn dispatch(&self, kernel: &WgpuKernel, dispatch: &Dispatch) -> AccelResult<WgpuEvent> {
        let local = dispatch.local.map(|d| d.max(1));
        self.check_local_size(local)?;
        let groups = dispatch.workgroups();
        let max_groups = self.limits.max_compute_workgroups_per_dimension;
        if groups.iter().any(|&g| g > max_groups) {
            return Err(AccelError::dispatch(format!(
                "{}: {groups:?} workgroups exceed the per-axis limit {max_groups}",
                kernel.symbol()
            )));
        }

        let args = kernel.args()?;
        let buffers = WgpuKernel::buffer_args(&args);
        let scalars = pack_scalars(&args);

        let mut state = lock(&kernel.state, "kernel state")?;
        let pipeline = self.ensure_pipeline(kernel, &mut state, buffers.len(), local)?;
        let bind_group = self.ensure_bind_group(kernel, &mut state, &buffers, &scalars)?;
        if let Some(info) = &state.dispatch_info {
            let offset = [dispatch.offset[0], dispatch.offset[1], dispatch.offset[2], 0u32];
            self.queue.write_buffer(info, 0, bytemuck::cast_slice(&offset));
        }
        drop(state);

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("chanorm-dispatch-encoder"),
            });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("chanorm-dispatch-pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            if !dispatch.is_empty() {
                pass.dispatch_workgroups(groups[0], groups[1], groups[2]);
            }
        }
        let index = self.queue.submit(Some(encoder.finish()));
        Ok(WgpuEvent { index })
    }

    fn wait(&self, event: WgpuEvent) -> AccelResult<()> {
        let _ = self
            .device
            .poll(wgpu::Maintain::WaitForSubmissionIndex(event.index));
        Ok(())
    }

    fn create_status_buffer(&self) -> AccelResult<BufferHandle> {
        let buffer = self.create_storage("chanorm-status", &[0u8; STATUS_BUFFER_BYTES as usize]);
        self.register_buffer(buffer, DataType::F32, 1)
    }

    fn write_status(&self, buffer: &BufferHandle, value: u32) -> AccelResult<()> {
        let buffer = self.buffer(buffer)?;
        self.queue.write_buffer(&buffer, 0, bytemuck::bytes_of(&value));
        Ok(())
    }

    fn read_status(&self, buffer: &BufferHandle) -> AccelResult<u32> {
        let buffer = self.buffer(buffer)?;
        let bytes = self.read_bytes(&buffer, 4, "status readback")?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }
}
