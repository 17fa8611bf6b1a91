use chanorm_accelerate_api::{AccelResult, BuildOptions, DataType, Kernel, KernelRuntime};

/// Identity of the kernel an operator compiles.
#[derive(Debug, Clone, Copy)]
pub struct KernelSpec<'a> {
    pub program: &'a str,
    /// Logical entry point name inside the program.
    pub name: &'a str,
    pub input: DataType,
    pub output: DataType,
}

struct CachedKernel<K> {
    kernel: K,
    max_work_group_size: u32,
    input: DataType,
    output: DataType,
}

/// Holds at most one compiled kernel. Once built it is kept for the life of
/// the owner and never rebuilt.
pub struct KernelCache<K> {
    entry: Option<CachedKernel<K>>,
}

impl<K> Default for KernelCache<K> {
    fn default() -> Self {
        Self { entry: None }
    }
}

impl<K: Kernel> KernelCache<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_built(&self) -> bool {
        self.entry.is_some()
    }

    pub fn max_work_group_size(&self) -> Option<u32> {
        self.entry.as_ref().map(|entry| entry.max_work_group_size)
    }

    /// `(input, output)` types the cached kernel was specialized for.
    pub fn built_for(&self) -> Option<(DataType, DataType)> {
        self.entry.as_ref().map(|entry| (entry.input, entry.output))
    }

    /// Build the kernel on first use. `configure` adds operator specific
    /// options (guard instrumentation) before the type defines.
    pub fn ensure_built<R, F>(
        &mut self,
        runtime: &R,
        spec: &KernelSpec<'_>,
        configure: F,
    ) -> AccelResult<&mut K>
    where
        R: KernelRuntime<Kernel = K>,
        F: FnOnce(&mut BuildOptions),
    {
        let entry = match self.entry.take() {
            Some(entry) => entry,
            None => Self::build(runtime, spec, configure)?,
        };
        let entry = self.entry.insert(entry);
        if (entry.input, entry.output) != (spec.input, spec.output) {
            log::debug!(
                "{}: reusing kernel built for {}->{} for a {}->{} request",
                spec.name,
                entry.input,
                entry.output,
                spec.input,
                spec.output
            );
        }
        Ok(&mut entry.kernel)
    }

    fn build<R, F>(runtime: &R, spec: &KernelSpec<'_>, configure: F) -> AccelResult<CachedKernel<K>>
    where
        R: KernelRuntime<Kernel = K>,
        F: FnOnce(&mut BuildOptions),
    {
        let symbol = obfuscate_symbol(spec.name);
        let options = build_options(runtime, spec, &symbol, configure);
        log::debug!("{}: building {} with [{}]", spec.name, spec.program, options);
        let kernel = runtime
            .build_kernel(spec.program, &symbol, &options)
            .map_err(|err| {
                log::warn!("{}: kernel build failed: {err}", spec.name);
                err
            })?;
        let max_work_group_size = runtime.kernel_max_work_group_size(&kernel);
        log::info!(
            "{}: built '{}' from {} ({}->{}, max work-group size {})",
            spec.name,
            kernel.symbol(),
            spec.program,
            spec.input,
            spec.output,
            max_work_group_size
        );
        Ok(CachedKernel {
            kernel,
            max_work_group_size,
            input: spec.input,
            output: spec.output,
        })
    }
}

fn build_options<R, F>(runtime: &R, spec: &KernelSpec<'_>, symbol: &str, configure: F) -> BuildOptions
where
    R: KernelRuntime,
    F: FnOnce(&mut BuildOptions),
{
    let mut options = BuildOptions::new();
    configure(&mut options);
    if runtime.supports_non_uniform_work_groups() {
        options.flag("NON_UNIFORM_WORK_GROUP");
    }
    options.define(spec.name, symbol);
    options.define("IN_DATA_TYPE", spec.input.program_tag());
    options.define("OUT_DATA_TYPE", spec.output.program_tag());
    options.define("DATA_TYPE", spec.output.compute_type().program_tag());
    options
}

/// Symbol name a logical kernel name is compiled under.
#[cfg(feature = "obfuscate-symbols")]
pub fn obfuscate_symbol(name: &str) -> String {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let mut hasher = DefaultHasher::new();
    name.hash(&mut hasher);
    format!("k{:016x}", hasher.finish())
}

/// Symbol name a logical kernel name is compiled under.
#[cfg(not(feature = "obfuscate-symbols"))]
pub fn obfuscate_symbol(name: &str) -> String {
    name.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::inprocess::InProcessRuntime;
    use crate::ops::softmax::{SOFTMAX_KERNEL_NAME, SOFTMAX_PROGRAM};
    use chanorm_accelerate_api::AccelError;

    fn softmax_spec(input: DataType, output: DataType) -> KernelSpec<'static> {
        KernelSpec {
            program: SOFTMAX_PROGRAM,
            name: SOFTMAX_KERNEL_NAME,
            input,
            output,
        }
    }

    #[test]
    fn builds_once_and_keeps_the_first_kernel() {
        let runtime = InProcessRuntime::new();
        let mut cache = KernelCache::new();
        let spec = softmax_spec(DataType::F32, DataType::F32);
        cache.ensure_built(&runtime, &spec, |_| {}).expect("first build");
        cache.ensure_built(&runtime, &spec, |_| {}).expect("cache hit");
        let other = softmax_spec(DataType::F16, DataType::F16);
        cache.ensure_built(&runtime, &other, |_| {}).expect("mismatched types reuse");
        assert_eq!(runtime.stats().builds, 1);
        assert_eq!(cache.built_for(), Some((DataType::F32, DataType::F32)));
        assert_eq!(cache.max_work_group_size(), Some(runtime.max_work_group_size()));
    }

    #[test]
    fn options_carry_symbol_and_types() {
        let runtime = InProcessRuntime::new();
        let mut cache = KernelCache::new();
        let spec = softmax_spec(DataType::F16, DataType::F16);
        let kernel = cache
            .ensure_built(&runtime, &spec, |options| options.flag("EXTRA"))
            .expect("build");
        let options = runtime.last_build_options().expect("options recorded");
        assert_eq!(options.value(SOFTMAX_KERNEL_NAME), Some(kernel.symbol()));
        assert_eq!(options.value("IN_DATA_TYPE"), Some("f16"));
        assert_eq!(options.value("OUT_DATA_TYPE"), Some("f16"));
        assert_eq!(options.value("DATA_TYPE"), Some("f32"));
        assert!(options.is_defined("EXTRA"));
        assert!(!options.is_defined("NON_UNIFORM_WORK_GROUP"));
    }

    #[test]
    fn non_uniform_support_adds_a_flag() {
        let runtime = InProcessRuntime::builder().non_uniform_work_groups(true).build();
        let mut cache = KernelCache::new();
        cache
            .ensure_built(&runtime, &softmax_spec(DataType::F32, DataType::F32), |_| {})
            .expect("build");
        let options = runtime.last_build_options().expect("options recorded");
        assert!(options.is_defined("NON_UNIFORM_WORK_GROUP"));
    }

    #[test]
    fn failed_build_caches_nothing() {
        let runtime = InProcessRuntime::new();
        runtime.fail_next_builds(1);
        let mut cache = KernelCache::new();
        let spec = softmax_spec(DataType::F32, DataType::F32);
        let err = cache.ensure_built(&runtime, &spec, |_| {}).err();
        assert!(matches!(err, Some(AccelError::Build { .. })));
        assert!(!cache.is_built());
        cache.ensure_built(&runtime, &spec, |_| {}).expect("retry succeeds");
        assert!(cache.is_built());
        assert_eq!(runtime.stats().builds, 1);
        assert_eq!(runtime.stats().build_failures, 1);
    }

    #[cfg(not(feature = "obfuscate-symbols"))]
    #[test]
    fn symbols_are_plain_without_obfuscation() {
        assert_eq!(obfuscate_symbol("softmax"), "softmax");
    }

    #[cfg(feature = "obfuscate-symbols")]
    #[test]
    fn obfuscated_symbols_are_stable_identifiers() {
        let symbol = obfuscate_symbol("softmax");
        assert_eq!(symbol, obfuscate_symbol("softmax"));
        assert_ne!(symbol, "softmax");
        assert!(symbol.starts_with('k'));
        assert!(symbol.chars().all(|c| c.is_ascii_alphanumeric()));
    }
}
