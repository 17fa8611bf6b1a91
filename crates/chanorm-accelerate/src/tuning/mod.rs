//! Empirical selection of local work-group sizes.
//!
//! On the first launch of a tuning key the [`Tuner`] times every candidate
//! local size, keeps the fastest, and replays it for later launches with the
//! same key. Results can be persisted per device.

pub mod store;

use crate::config;
use crate::metrics::TuningMetrics;
use chanorm_accelerate_api::{AccelError, AccelResult, Dispatch, KernelRuntime};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use store::TuningStore;

/// `[x, y, z, split]`: work-group extent plus the number of z-chunks a
/// launch is issued in (0 and 1 both mean a single dispatch).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LocalWorkSize(pub [u32; 4]);

pub const DEFAULT_LOCAL_WORK_SIZE: LocalWorkSize = LocalWorkSize::new(4, 4, 4, 0);

impl LocalWorkSize {
    pub const fn new(x: u32, y: u32, z: u32, split: u32) -> Self {
        Self([x, y, z, split])
    }

    pub fn dims(&self) -> [u32; 3] {
        [self.0[0], self.0[1], self.0[2]]
    }

    pub fn split(&self) -> u32 {
        self.0[3]
    }

    pub fn invocations(&self) -> u64 {
        self.dims().iter().map(|&d| d as u64).product()
    }

    pub fn with_split(self, split: u32) -> Self {
        let [x, y, z] = self.dims();
        Self::new(x, y, z, split)
    }

    /// Clamp each axis into `[1, limit]` and halve the largest axis until
    /// the group fits `max_invocations`.
    pub fn sanitized(self, max_invocations: u32, limits: [u32; 3]) -> Self {
        let mut dims = self.dims();
        for axis in 0..3 {
            dims[axis] = dims[axis].clamp(1, limits[axis].max(1));
        }
        let max_invocations = max_invocations.max(1) as u64;
        while dims.iter().map(|&d| d as u64).product::<u64>() > max_invocations {
            let largest = (0..3).max_by_key(|&axis| dims[axis]).unwrap_or(0);
            dims[largest] = (dims[largest] / 2).max(1);
        }
        Self::new(dims[0], dims[1], dims[2], self.split())
    }
}

/// `"<op>_<d0>_<d1>_..."`
pub fn tuning_key(op: &str, extents: &[usize]) -> String {
    let mut key = op.to_string();
    for extent in extents {
        key.push('_');
        key.push_str(&extent.to_string());
    }
    key
}

/// Local sizes benchmarked for a grid, filtered to what the kernel and the
/// device accept. Falls back to the sanitized default when none survive.
pub fn candidate_local_sizes(kwg: u32, global: [u32; 3], limits: [u32; 3]) -> Vec<LocalWorkSize> {
    let [g0, g1, g2] = global;
    let raw = [
        [g0, g1, g2],
        [kwg / 16, 4, 4],
        [kwg / 32, 4, 8],
        [kwg / 32, 8, 4],
        [kwg / 64, 8, 8],
        [kwg / 64, 16, 4],
        [kwg / 128, 8, 16],
        [kwg / 128, 16, 8],
        [kwg / 128, 32, 4],
        [1, kwg / 32, 32],
        [1, kwg / 64, 64],
        [1, kwg / 128, 128],
        [4, kwg / 16, 4],
        [4, kwg / 28, 7],
        [4, kwg / 32, 8],
        [4, kwg / 56, 14],
        [1, kwg, 1],
    ];
    let mut candidates: Vec<LocalWorkSize> = Vec::with_capacity(raw.len());
    for [x, y, z] in raw {
        let invocations = x as u64 * y as u64 * z as u64;
        let fits = invocations > 0
            && invocations <= kwg as u64
            && x <= limits[0]
            && y <= limits[1]
            && z <= limits[2];
        let candidate = LocalWorkSize::new(x, y, z, 0);
        if fits && !candidates.contains(&candidate) {
            candidates.push(candidate);
        }
    }
    if candidates.is_empty() {
        candidates.push(DEFAULT_LOCAL_WORK_SIZE.sanitized(kwg, limits));
    }
    candidates
}

#[derive(Debug, Clone)]
pub struct TunerOptions {
    /// Benchmark unseen keys; otherwise launch with the seed.
    pub enabled: bool,
    /// Timed runs per candidate.
    pub trials: u32,
    /// Per-dispatch time budget; slower candidates are split along z.
    pub max_kernel_time: Option<Duration>,
    /// Base directory of persisted results; `None` keeps them in memory.
    pub persist_dir: Option<PathBuf>,
}

impl Default for TunerOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            trials: config::DEFAULT_TUNING_TRIALS,
            max_kernel_time: None,
            persist_dir: None,
        }
    }
}

impl TunerOptions {
    pub fn from_env() -> Self {
        let enabled = config::env_flag(config::ENV_TUNING).unwrap_or(true);
        let persist = config::env_flag(config::ENV_TUNING_PERSIST).unwrap_or(true);
        Self {
            enabled,
            trials: config::env_u32(config::ENV_TUNING_TRIALS)
                .unwrap_or(config::DEFAULT_TUNING_TRIALS),
            max_kernel_time: config::env_u32(config::ENV_MAX_KERNEL_TIME_MS)
                .map(|ms| Duration::from_millis(ms as u64)),
            persist_dir: if persist {
                config::tuning_base_dir()
            } else {
                None
            },
        }
    }
}

const TUNING_FAMILY: &str = "local_work_size";

/// Process-wide tuning engine for one device.
pub struct Tuner {
    options: TunerOptions,
    store: TuningStore<String, LocalWorkSize>,
    metrics: TuningMetrics,
}

impl Tuner {
    pub fn new(options: TunerOptions, device_tag: &str) -> Self {
        let store = match &options.persist_dir {
            Some(dir) => TuningStore::persistent(dir, TUNING_FAMILY, device_tag),
            None => TuningStore::in_memory(),
        };
        Self {
            options,
            store,
            metrics: TuningMetrics::new(),
        }
    }

    pub fn for_runtime<R: KernelRuntime>(runtime: &R, options: TunerOptions) -> Self {
        Self::new(options, &runtime.device_tag())
    }

    pub fn from_env<R: KernelRuntime>(runtime: &R) -> Self {
        Self::for_runtime(runtime, TunerOptions::from_env())
    }

    pub fn options(&self) -> &TunerOptions {
        &self.options
    }

    pub fn metrics(&self) -> &TuningMetrics {
        &self.metrics
    }

    pub fn lookup(&self, key: &str) -> AccelResult<Option<LocalWorkSize>> {
        self.store.get(&key.to_string())
    }

    /// Record a result without benchmarking.
    pub fn remember(&self, key: &str, local: LocalWorkSize) -> AccelResult<()> {
        self.store.insert(key.to_string(), local)
    }

    pub fn store(&self) -> &TuningStore<String, LocalWorkSize> {
        &self.store
    }

    /// Launch `kernel` over `global` with the local size stored for `key`,
    /// benchmarking candidates first if the key is new and tuning is
    /// enabled. Returns the event of the final dispatch.
    pub fn tune_or_run<R: KernelRuntime>(
        &self,
        runtime: &R,
        kernel: &R::Kernel,
        key: &str,
        global: [u32; 3],
        seed: LocalWorkSize,
    ) -> AccelResult<R::Event> {
        let kwg = runtime.kernel_max_work_group_size(kernel).max(1);
        let limits = runtime.max_work_group_dims();
        let uniform = !runtime.supports_non_uniform_work_groups();

        if global.iter().any(|&g| g == 0) {
            log::debug!("{key}: empty grid {global:?}, skipping tuning");
            return run(runtime, kernel, global, seed.sanitized(kwg, limits), uniform);
        }

        if let Some(stored) = self.lookup(key)? {
            self.metrics.inc_hit();
            let local = stored.sanitized(kwg, limits);
            if local != stored {
                log::warn!("{key}: stored local size {stored:?} exceeds device limits, using {local:?}");
            }
            return run(runtime, kernel, global, local, uniform);
        }

        if !self.options.enabled {
            self.metrics.inc_untuned();
            return run(runtime, kernel, global, seed.sanitized(kwg, limits), uniform);
        }

        self.metrics.inc_miss();
        let span = tracing::info_span!("tuning", key, kwg);
        let _enter = span.enter();
        let started = Instant::now();

        let mut best: Option<(LocalWorkSize, Duration)> = None;
        for candidate in candidate_local_sizes(kwg, global, limits) {
            let (local, elapsed) = self.benchmark(runtime, kernel, global, candidate, uniform)?;
            log::debug!("{key}: {local:?} took {elapsed:?}");
            if best.map_or(true, |(_, fastest)| elapsed < fastest) {
                best = Some((local, elapsed));
            }
        }
        let (local, elapsed) = best.unwrap_or((seed.sanitized(kwg, limits), Duration::ZERO));
        self.metrics
            .set_last_session_micros(started.elapsed().as_micros() as u64);
        log::info!("{key}: tuned local size {local:?} ({elapsed:?} per launch)");
        self.store.insert(key.to_string(), local)?;
        run(runtime, kernel, global, local, uniform)
    }

    fn benchmark<R: KernelRuntime>(
        &self,
        runtime: &R,
        kernel: &R::Kernel,
        global: [u32; 3],
        candidate: LocalWorkSize,
        uniform: bool,
    ) -> AccelResult<(LocalWorkSize, Duration)> {
        // warm-up
        runtime.wait(run(runtime, kernel, global, candidate, uniform)?)?;
        self.metrics.add_trial_runs(1);

        let mut local = candidate;
        let mut elapsed = self.time_runs(runtime, kernel, global, local, uniform)?;
        if let Some(limit) = self.options.max_kernel_time {
            if elapsed > limit && global[2] > 1 {
                local = candidate.with_split(split_count(elapsed, limit, global[2]));
                elapsed = self.time_runs(runtime, kernel, global, local, uniform)?;
            }
        }
        Ok((local, elapsed))
    }

    /// Mean wall time of one launch over the configured trials.
    fn time_runs<R: KernelRuntime>(
        &self,
        runtime: &R,
        kernel: &R::Kernel,
        global: [u32; 3],
        local: LocalWorkSize,
        uniform: bool,
    ) -> AccelResult<Duration> {
        let trials = self.options.trials.max(1);
        let mut total = Duration::ZERO;
        for _ in 0..trials {
            let started = Instant::now();
            runtime.wait(run(runtime, kernel, global, local, uniform)?)?;
            total += started.elapsed();
        }
        self.metrics.add_trial_runs(trials as u64);
        Ok(total / trials)
    }
}

/// z-chunks needed for one chunk to fit `limit`, at most one per z row.
fn split_count(elapsed: Duration, limit: Duration, depth: u32) -> u32 {
    let limit_nanos = limit.as_nanos().max(1);
    let chunks = elapsed.as_nanos() / limit_nanos + 1;
    u32::try_from(chunks).unwrap_or(u32::MAX).clamp(1, depth.max(1))
}

fn round_up(value: u32, multiple: u32) -> u32 {
    let multiple = multiple.max(1);
    value.div_ceil(multiple).saturating_mul(multiple)
}

/// Issue one launch (or its z-chunks) and return the last event.
fn run<R: KernelRuntime>(
    runtime: &R,
    kernel: &R::Kernel,
    global: [u32; 3],
    local: LocalWorkSize,
    uniform: bool,
) -> AccelResult<R::Event> {
    let dims = local.dims().map(|d| d.max(1));
    let fit = |extent: u32, axis: usize| {
        if uniform {
            round_up(extent, dims[axis])
        } else {
            extent
        }
    };
    let depth = global[2];
    let split = local.split().clamp(1, depth.max(1));
    if split <= 1 {
        let launch = Dispatch::new([fit(global[0], 0), fit(global[1], 1), fit(depth, 2)], dims);
        return runtime.dispatch(kernel, &launch);
    }

    let chunk = round_up(depth.div_ceil(split), dims[2]);
    let mut offset = 0u32;
    let mut last = None;
    while offset < depth {
        let extent = (depth - offset).min(chunk);
        let launch = Dispatch::new([fit(global[0], 0), fit(global[1], 1), fit(extent, 2)], dims)
            .with_offset([0, 0, offset]);
        last = Some(runtime.dispatch(kernel, &launch)?);
        offset = offset.saturating_add(chunk);
    }
    last.ok_or_else(|| AccelError::dispatch("split launch issued no dispatches"))
}
