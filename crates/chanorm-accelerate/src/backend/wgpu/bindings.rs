use chanorm_accelerate_api::{AccelError, AccelResult, KernelArg};
use wgpu::{BindGroupLayoutEntry, BindingType, BufferBindingType, ShaderStages};

/// Binding of the uniform holding packed scalar arguments.
pub const PARAMS_BINDING: u32 = 14;
/// Binding of the uniform holding the launch offset of split dispatches.
pub const DISPATCH_INFO_BINDING: u32 = 15;
/// Buffer arguments occupy bindings `0..MAX_BUFFER_ARGS`.
pub const MAX_BUFFER_ARGS: usize = PARAMS_BINDING as usize;

pub fn storage_read_write_entry(binding: u32) -> BindGroupLayoutEntry {
    BindGroupLayoutEntry {
        binding,
        visibility: ShaderStages::COMPUTE,
        ty: BindingType::Buffer {
            ty: BufferBindingType::Storage { read_only: false },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

pub fn uniform_entry(binding: u32) -> BindGroupLayoutEntry {
    BindGroupLayoutEntry {
        binding,
        visibility: ShaderStages::COMPUTE,
        ty: BindingType::Buffer {
            ty: BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

/// Layout of a kernel with `buffer_count` buffer arguments.
pub fn kernel_layout_entries(buffer_count: usize) -> Vec<BindGroupLayoutEntry> {
    let mut entries = Vec::with_capacity(buffer_count + 2);
    for binding in 0..buffer_count as u32 {
        entries.push(storage_read_write_entry(binding));
    }
    entries.push(uniform_entry(PARAMS_BINDING));
    entries.push(uniform_entry(DISPATCH_INFO_BINDING));
    entries
}

/// Scalar arguments in argument order as little-endian words, zero padded
/// to a multiple of 16 bytes.
pub fn pack_scalars(args: &[KernelArg]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(args.len() * 4 + 16);
    for arg in args {
        match arg {
            KernelArg::U32(value) => bytes.extend_from_slice(&value.to_le_bytes()),
            KernelArg::I32(value) => bytes.extend_from_slice(&value.to_le_bytes()),
            KernelArg::Buffer(_) => {}
        }
    }
    let padded = bytes.len().div_ceil(16).max(1) * 16;
    bytes.resize(padded, 0);
    bytes
}

/// Every argument slot up to the highest set one must be filled.
pub fn collect_args(slots: &[Option<KernelArg>], symbol: &str) -> AccelResult<Vec<KernelArg>> {
    slots
        .iter()
        .enumerate()
        .map(|(index, slot)| {
            slot.ok_or_else(|| {
                AccelError::dispatch(format!("{symbol}: kernel argument {index} is not set"))
            })
        })
        .collect()
}
