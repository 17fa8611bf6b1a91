//! Interfaces between the chanorm operator core and the runtimes that own a
//! compute device.
//!
//! A runtime compiles named programs into kernels, accepts positional kernel
//! arguments, and dispatches kernels over a 3-D grid. Tensors are plain
//! descriptors (shape, element type, buffer handle); their storage belongs to
//! the runtime that allocated them.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use thiserror::Error;

static NEXT_DEVICE_ID: AtomicU32 = AtomicU32::new(1);

/// Allocate a process-unique device id for a freshly created runtime.
pub fn next_device_id() -> u32 {
    NEXT_DEVICE_ID.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, Error)]
pub enum AccelError {
    /// Rank or extents the operator cannot map onto a launch grid.
    #[error("unsupported configuration: {0}")]
    Unsupported(String),
    #[error("failed to build kernel '{symbol}' from program '{program}': {message}")]
    Build {
        program: String,
        symbol: String,
        message: String,
    },
    #[error("kernel dispatch failed: {0}")]
    Dispatch(String),
    /// Raised by bounds-checking instrumentation after a dispatch that
    /// itself completed.
    #[error("kernel wrote outside its output buffer (error code {code})")]
    OutOfRange { code: u32 },
    #[error(transparent)]
    Runtime(#[from] anyhow::Error),
}

impl AccelError {
    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::Unsupported(message.into())
    }

    pub fn dispatch(message: impl Into<String>) -> Self {
        Self::Dispatch(message.into())
    }

    pub fn build(
        program: impl Into<String>,
        symbol: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Build {
            program: program.into(),
            symbol: symbol.into(),
            message: message.into(),
        }
    }
}

pub type AccelResult<T> = std::result::Result<T, AccelError>;

/// Element type of a device tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    F32,
    F16,
}

impl DataType {
    pub fn size_in_bytes(self) -> usize {
        match self {
            DataType::F32 => 4,
            DataType::F16 => 2,
        }
    }

    /// Type name understood by kernel programs (`-DIN_DATA_TYPE=f32`).
    pub fn program_tag(self) -> &'static str {
        match self {
            DataType::F32 => "f32",
            DataType::F16 => "f16",
        }
    }

    /// Type used for intermediate arithmetic. Half precision accumulates in
    /// single precision.
    pub fn compute_type(self) -> DataType {
        match self {
            DataType::F32 | DataType::F16 => DataType::F32,
        }
    }

    pub fn from_program_tag(tag: &str) -> Option<Self> {
        match tag.trim() {
            "f32" => Some(DataType::F32),
            "f16" => Some(DataType::F16),
            _ => None,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.program_tag())
    }
}

/// Host-side element types an operator can be instantiated for.
pub trait KernelElement: Copy + Send + Sync + 'static {
    const DTYPE: DataType;
}

impl KernelElement for f32 {
    const DTYPE: DataType = DataType::F32;
}

impl KernelElement for half::f16 {
    const DTYPE: DataType = DataType::F16;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BufferHandle {
    pub device_id: u32,
    pub buffer_id: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuTensor {
    pub shape: Vec<usize>,
    pub dtype: DataType,
    pub buffer: BufferHandle,
}

impl GpuTensor {
    pub fn new(shape: Vec<usize>, dtype: DataType, buffer: BufferHandle) -> Self {
        Self {
            shape,
            dtype,
            buffer,
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Number of elements.
    pub fn size(&self) -> usize {
        self.shape.iter().product()
    }
}

/// A positional kernel argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelArg {
    Buffer(BufferHandle),
    I32(i32),
    U32(u32),
}

/// Preprocessor-style build options (`-DNAME` / `-DNAME=VALUE`), kept sorted
/// so equal option sets always render identically.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct BuildOptions {
    options: BTreeSet<String>,
}

impl BuildOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn define(&mut self, name: &str, value: impl fmt::Display) {
        self.options.insert(format!("-D{name}={value}"));
    }

    pub fn flag(&mut self, name: &str) {
        self.options.insert(format!("-D{name}"));
    }

    pub fn insert_raw(&mut self, option: impl Into<String>) {
        self.options.insert(option.into());
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.options.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.options.len()
    }

    pub fn is_empty(&self) -> bool {
        self.options.is_empty()
    }

    /// `(name, value)` pairs for every `-D` option; other options are skipped.
    pub fn defines(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.options.iter().filter_map(|opt| {
            let body = opt.strip_prefix("-D")?;
            match body.split_once('=') {
                Some((name, value)) => Some((name, Some(value))),
                None => Some((body, None)),
            }
        })
    }

    pub fn is_defined(&self, name: &str) -> bool {
        self.defines().any(|(key, _)| key == name)
    }

    pub fn value(&self, name: &str) -> Option<&str> {
        self.defines()
            .find(|(key, _)| *key == name)
            .and_then(|(_, value)| value)
    }
}

impl fmt::Display for BuildOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for opt in &self.options {
            if !first {
                f.write_str(" ")?;
            }
            f.write_str(opt)?;
            first = false;
        }
        Ok(())
    }
}

/// One kernel launch: grid extent, work-group extent, and the grid offset
/// of this launch when a dispatch is split into chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dispatch {
    pub global: [u32; 3],
    pub local: [u32; 3],
    pub offset: [u32; 3],
}

impl Dispatch {
    pub fn new(global: [u32; 3], local: [u32; 3]) -> Self {
        Self {
            global,
            local,
            offset: [0; 3],
        }
    }

    pub fn with_offset(mut self, offset: [u32; 3]) -> Self {
        self.offset = offset;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.global.iter().any(|&g| g == 0)
    }

    /// Work-group counts per axis (`ceil(global / local)`).
    pub fn workgroups(&self) -> [u32; 3] {
        let mut groups = [0u32; 3];
        for axis in 0..3 {
            let local = self.local[axis].max(1);
            groups[axis] = self.global[axis].div_ceil(local);
        }
        groups
    }
}

/// A compiled kernel accepting positional arguments.
pub trait Kernel {
    fn symbol(&self) -> &str;
    fn set_arg(&mut self, index: u32, arg: KernelArg) -> AccelResult<()>;
}

/// A device runtime: compiles programs, dispatches kernels and reports
/// completion.
pub trait KernelRuntime {
    type Kernel: Kernel;
    type Event;

    /// Stable name of the device, used to key persisted tuning results.
    fn device_tag(&self) -> String;

    fn build_kernel(
        &self,
        program: &str,
        symbol: &str,
        options: &BuildOptions,
    ) -> AccelResult<Self::Kernel>;

    fn kernel_max_work_group_size(&self, kernel: &Self::Kernel) -> u32;

    /// Per-axis work-group limits of the device.
    fn max_work_group_dims(&self) -> [u32; 3];

    /// Whether the device accepts a grid that is not a multiple of the
    /// work-group size.
    fn supports_non_uniform_work_groups(&self) -> bool {
        false
    }

    fn dispatch(&self, kernel: &Self::Kernel, dispatch: &Dispatch) -> AccelResult<Self::Event>;

    /// Block until the work behind `event` has completed.
    fn wait(&self, event: Self::Event) -> AccelResult<()>;

    /// Allocate a one-word device buffer kernels can raise error codes in.
    fn create_status_buffer(&self) -> AccelResult<BufferHandle>;

    fn write_status(&self, buffer: &BufferHandle, value: u32) -> AccelResult<()>;

    /// Read back a status word. Waits for queued work touching the buffer.
    fn read_status(&self, buffer: &BufferHandle) -> AccelResult<u32>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_options_render_sorted_and_parse_defines() {
        let mut options = BuildOptions::new();
        options.define("OUT_DATA_TYPE", DataType::F16);
        options.define("IN_DATA_TYPE", DataType::F32);
        options.flag("OUT_OF_RANGE_CHECK");
        assert_eq!(
            options.to_string(),
            "-DIN_DATA_TYPE=f32 -DOUT_DATA_TYPE=f16 -DOUT_OF_RANGE_CHECK"
        );
        assert_eq!(options.value("OUT_DATA_TYPE"), Some("f16"));
        assert_eq!(options.value("OUT_OF_RANGE_CHECK"), None);
        assert!(options.is_defined("OUT_OF_RANGE_CHECK"));
        assert!(!options.is_defined("DATA_TYPE"));
    }

    #[test]
    fn raw_options_are_not_defines() {
        let mut options = BuildOptions::new();
        options.insert_raw("-cl-fast-relaxed-math");
        assert_eq!(options.len(), 1);
        assert_eq!(options.defines().count(), 0);
    }

    #[test]
    fn dispatch_workgroups_round_up() {
        let dispatch = Dispatch::new([10, 1, 6], [4, 4, 0]);
        assert_eq!(dispatch.workgroups(), [3, 1, 6]);
        assert!(!dispatch.is_empty());
        assert!(Dispatch::new([0, 1, 1], [1, 1, 1]).is_empty());
    }

    #[test]
    fn half_precision_computes_in_single() {
        assert_eq!(DataType::F16.compute_type(), DataType::F32);
        assert_eq!(<half::f16 as KernelElement>::DTYPE, DataType::F16);
        assert_eq!(DataType::from_program_tag("f16"), Some(DataType::F16));
    }
}
