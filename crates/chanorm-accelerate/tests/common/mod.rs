#![allow(dead_code)]

use chanorm_accelerate::{Tuner, TunerOptions};
use chanorm_accelerate::api::KernelRuntime;

pub fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .is_test(true)
        .try_init();
}

/// Deterministic logits with repeated maxima and negative values.
pub fn logits(len: usize) -> Vec<f32> {
    (0..len)
        .map(|i| ((i * 37 % 17) as f32 - 8.0) * 0.37)
        .collect()
}

/// Row-wise softmax over the innermost `channels` values, in f64.
pub fn cpu_softmax(data: &[f32], channels: usize) -> Vec<f32> {
    let mut out = Vec::with_capacity(data.len());
    for row in data.chunks(channels) {
        let max = row.iter().fold(f64::NEG_INFINITY, |m, &v| m.max(v as f64));
        let sum: f64 = row.iter().map(|&v| (v as f64 - max).exp()).sum();
        out.extend(row.iter().map(|&v| ((v as f64 - max).exp() / sum) as f32));
    }
    out
}

pub fn assert_close(got: &[f32], want: &[f32], tol: f32) {
    assert_eq!(got.len(), want.len(), "length mismatch");
    for (i, (g, w)) in got.iter().zip(want).enumerate() {
        assert!(
            (g - w).abs() <= tol,
            "mismatch at {i}: got {g}, want {w} (tol {tol})"
        );
    }
}

/// Tuner that benchmarks with a single trial and keeps results in memory.
pub fn quick_tuner<R: KernelRuntime>(runtime: &R) -> Tuner {
    Tuner::for_runtime(
        runtime,
        TunerOptions {
            trials: 1,
            ..TunerOptions::default()
        },
    )
}

pub fn untuned<R: KernelRuntime>(runtime: &R) -> Tuner {
    Tuner::for_runtime(
        runtime,
        TunerOptions {
            enabled: false,
            ..TunerOptions::default()
        },
    )
}
