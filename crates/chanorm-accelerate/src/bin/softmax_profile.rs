use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::time::Instant;

use anyhow::{anyhow, bail, Context, Result};
use chanorm_accelerate::api::{DataType, KernelElement};
use chanorm_accelerate::{
    LaunchGeometry, OpContext, SoftmaxKernel, Tuner, TunedLauncher, TuningCounters, WgpuRuntime,
    WgpuRuntimeOptions,
};
use log::info;
use serde::Serialize;

const DEFAULT_SHAPE: [usize; 4] = [8, 32, 32, 51];

#[derive(Serialize)]
struct ProfileReport {
    adapter: String,
    backend: String,
    shape: Vec<usize>,
    dtype: String,
    iterations: u32,
    tuning_key: String,
    local_work_size: Option<[u32; 4]>,
    first_call_ms: f64,
    mean_call_ms: f64,
    min_call_ms: f64,
    max_abs_error: f64,
    tuning: TuningCounters,
    tuning_session_ms: f64,
}

struct Args {
    shape: Vec<usize>,
    iterations: u32,
    dtype: DataType,
    output: PathBuf,
}

fn parse_args() -> Result<Args> {
    let args = std::env::args().skip(1).collect::<Vec<_>>();
    let value = |flag: &str| {
        args.iter()
            .position(|a| a == flag)
            .and_then(|pos| args.get(pos + 1))
            .cloned()
    };
    let shape = match value("--shape") {
        Some(raw) => raw
            .split(|c| c == 'x' || c == ',')
            .map(|dim| dim.trim().parse::<usize>())
            .collect::<Result<Vec<_>, _>>()
            .with_context(|| format!("invalid --shape {raw:?}"))?,
        None => DEFAULT_SHAPE.to_vec(),
    };
    let iterations = match value("--iters") {
        Some(raw) => raw.parse().with_context(|| format!("invalid --iters {raw:?}"))?,
        None => 20,
    };
    let dtype = match value("--dtype").as_deref() {
        None | Some("f32") => DataType::F32,
        Some("f16") => DataType::F16,
        Some(other) => bail!("unsupported --dtype {other:?} (expected f32 or f16)"),
    };
    let output = value("--output")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("softmax_profile.json"));
    Ok(Args {
        shape,
        iterations: iterations.max(1),
        dtype,
        output,
    })
}

fn cpu_softmax(data: &[f32], channels: usize) -> Vec<f64> {
    let mut out = Vec::with_capacity(data.len());
    for row in data.chunks(channels.max(1)) {
        let max = row.iter().fold(f64::NEG_INFINITY, |m, &v| m.max(v as f64));
        let sum: f64 = row.iter().map(|&v| (v as f64 - max).exp()).sum();
        out.extend(row.iter().map(|&v| (v as f64 - max).exp() / sum));
    }
    out
}

fn millis(elapsed: std::time::Duration) -> f64 {
    elapsed.as_secs_f64() * 1e3
}

fn profile<T: KernelElement>(runtime: &WgpuRuntime, args: &Args) -> Result<ProfileReport> {
    let geometry = LaunchGeometry::derive(&args.shape)?;
    let len: usize = args.shape.iter().product();
    let input: Vec<f32> = (0..len)
        .map(|i| ((i as u64).wrapping_mul(2654435761) % 1000) as f32 / 100.0 - 5.0)
        .collect();
    let x = runtime.upload_f32(&args.shape, args.dtype, &input)?;
    let y = runtime.alloc(&args.shape, T::DTYPE)?;

    let tuner = Tuner::from_env(runtime);
    let mut op: SoftmaxKernel<WgpuRuntime, T> = SoftmaxKernel::new();
    let mut ctx = OpContext::new(runtime, &tuner);

    let started = Instant::now();
    op.compute(&mut ctx, &x, &y)?;
    let first_call_ms = millis(started.elapsed());
    info!("first call (build + tuning): {first_call_ms:.3} ms");

    let mut total = 0.0;
    let mut min_call_ms = f64::INFINITY;
    for _ in 0..args.iterations {
        let started = Instant::now();
        op.compute(&mut ctx, &x, &y)?;
        let ms = millis(started.elapsed());
        total += ms;
        min_call_ms = min_call_ms.min(ms);
    }
    let mean_call_ms = total / args.iterations as f64;
    info!("steady state: mean {mean_call_ms:.3} ms, min {min_call_ms:.3} ms");

    let rounded = runtime.download_f32(&x)?;
    let reference = cpu_softmax(&rounded, geometry.channels);
    let got = runtime.download_f32(&y)?;
    let max_abs_error = got
        .iter()
        .zip(&reference)
        .map(|(&g, &r)| (g as f64 - r).abs())
        .fold(0.0, f64::max);

    let tuning_key = TunedLauncher::new("softmax_kernel").tuning_key(&geometry);
    let info = runtime.adapter_info();
    Ok(ProfileReport {
        adapter: info.name.clone(),
        backend: format!("{:?}", info.backend),
        shape: args.shape.clone(),
        dtype: T::DTYPE.to_string(),
        iterations: args.iterations,
        local_work_size: tuner.lookup(&tuning_key)?.map(|local| local.0),
        tuning_key,
        first_call_ms,
        mean_call_ms,
        min_call_ms,
        max_abs_error,
        tuning: tuner.metrics().counters(),
        tuning_session_ms: tuner.metrics().last_session_micros() as f64 / 1e3,
    })
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = parse_args()?;

    let runtime = WgpuRuntime::new(WgpuRuntimeOptions::from_env())?;
    let report = match args.dtype {
        DataType::F32 => profile::<f32>(&runtime, &args)?,
        DataType::F16 if runtime.supports_f16() => profile::<half::f16>(&runtime, &args)?,
        DataType::F16 => return Err(anyhow!("adapter does not support shader-f16")),
    };
    info!(
        "{} {:?}: local size {:?}, max abs error {:.3e}",
        report.dtype, report.shape, report.local_work_size, report.max_abs_error
    );

    let json = serde_json::to_string_pretty(&report)?;
    let mut file = File::create(&args.output)
        .with_context(|| format!("creating {}", args.output.display()))?;
    file.write_all(json.as_bytes())?;
    info!("wrote {}", args.output.display());
    Ok(())
}
