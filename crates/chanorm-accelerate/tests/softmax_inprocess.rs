mod common;

use chanorm_accelerate::api::{AccelError, DataType};
use chanorm_accelerate::{
    InProcessRuntime, NoopGuard, OpContext, OutOfRangeGuard, SoftmaxKernel, SOFTMAX_KERNEL_NAME,
};
use common::{assert_close, cpu_softmax, init_logging, logits, quick_tuner, untuned};

type Softmax<G = NoopGuard> = SoftmaxKernel<InProcessRuntime, f32, G>;

fn run_once(shape: &[usize]) -> (Vec<f32>, Vec<f32>) {
    let runtime = InProcessRuntime::new();
    let tuner = quick_tuner(&runtime);
    let len: usize = shape.iter().product();
    let input = logits(len);
    let x = runtime.upload(shape, DataType::F32, &input).expect("upload");
    let y = runtime
        .upload(shape, DataType::F32, &vec![f32::NAN; len])
        .expect("output");
    let mut op: Softmax = SoftmaxKernel::new();
    let mut ctx = OpContext::new(&runtime, &tuner);
    op.compute(&mut ctx, &x, &y).expect("compute");
    (input, runtime.download(&y).expect("download"))
}

#[test]
fn softmax_matches_reference_with_padding_lanes() {
    init_logging();
    // 5 channels: the second block has three padding lanes
    let (input, got) = run_once(&[2, 3, 4, 5]);
    assert_close(&got, &cpu_softmax(&input, 5), 1e-5);
    for row in got.chunks(5) {
        let sum: f32 = row.iter().sum();
        assert!((sum - 1.0).abs() < 1e-5, "row sums to {sum}");
    }
}

#[test]
fn rank2_input_matches_rank4_with_unit_spatial_extent() {
    let (input2, flat) = run_once(&[3, 10]);
    let (input4, spatial) = run_once(&[3, 1, 1, 10]);
    assert_eq!(input2, input4);
    assert_eq!(flat, spatial);
    assert_close(&flat, &cpu_softmax(&input2, 10), 1e-5);
}

#[test]
fn single_channel_rows_are_one() {
    let (_, got) = run_once(&[4, 1]);
    assert!(got.iter().all(|&v| v == 1.0));
}

#[test]
fn kernel_is_built_once_across_shapes() {
    let runtime = InProcessRuntime::new();
    let tuner = quick_tuner(&runtime);
    let mut op: Softmax = SoftmaxKernel::new();
    let mut ctx = OpContext::new(&runtime, &tuner);
    for shape in [&[2usize, 8][..], &[1, 2, 2, 3][..]] {
        let len = shape.iter().product();
        let x = runtime.upload(shape, DataType::F32, &logits(len)).expect("upload");
        let y = runtime.alloc(shape, DataType::F32).expect("alloc");
        op.compute(&mut ctx, &x, &y).expect("compute");
    }
    assert!(op.is_built());
    assert_eq!(runtime.stats().builds, 1);
    assert_eq!(op.max_work_group_size(), Some(runtime.max_work_group_size()));
    let options = runtime.last_build_options().expect("options");
    assert_eq!(options.value("IN_DATA_TYPE"), Some("f32"));
    assert!(options.value(SOFTMAX_KERNEL_NAME).is_some());
}

#[test]
fn arguments_rebind_only_when_shape_changes() {
    let runtime = InProcessRuntime::new();
    let tuner = untuned(&runtime);
    let mut op: Softmax = SoftmaxKernel::new();
    let mut ctx = OpContext::new(&runtime, &tuner);
    let a = [1usize, 2, 2, 4];
    let b = [2usize, 8];
    let tensors = |shape: &[usize]| {
        let len = shape.iter().product();
        (
            runtime.upload(shape, DataType::F32, &logits(len)).expect("upload"),
            runtime.alloc(shape, DataType::F32).expect("alloc"),
        )
    };
    let (xa, ya) = tensors(&a);
    let (xb, yb) = tensors(&b);

    op.compute(&mut ctx, &xa, &ya).expect("a");
    op.compute(&mut ctx, &xb, &yb).expect("b");
    op.compute(&mut ctx, &xa, &ya).expect("a again");
    assert_eq!(op.rebind_count(), 3);
    // gws x3, input, height, channels, remain, output
    assert_eq!(runtime.stats().set_args, 3 * 8);

    op.compute(&mut ctx, &xa, &ya).expect("repeat");
    assert_eq!(op.rebind_count(), 3);
    assert_eq!(runtime.stats().set_args, 3 * 8);
    assert_eq!(op.bound_shape(), Some(&a[..]));
}

#[test]
fn unsupported_ranks_fail_before_build_or_dispatch() {
    let runtime = InProcessRuntime::new();
    let tuner = quick_tuner(&runtime);
    let mut op: Softmax = SoftmaxKernel::new();
    let mut ctx = OpContext::new(&runtime, &tuner);
    for shape in [&[6usize][..], &[1, 2, 3][..], &[1, 1, 1, 1, 4][..]] {
        let len = shape.iter().product();
        let x = runtime.upload(shape, DataType::F32, &logits(len)).expect("upload");
        let y = runtime.alloc(shape, DataType::F32).expect("alloc");
        let err = op.compute(&mut ctx, &x, &y).err();
        assert!(matches!(err, Some(AccelError::Unsupported(_))), "{shape:?}: {err:?}");
    }
    let stats = runtime.stats();
    assert_eq!((stats.builds, stats.build_failures, stats.dispatches), (0, 0, 0));
    assert!(!op.is_built());
}

#[test]
fn failed_build_is_retried_on_the_next_call() {
    let runtime = InProcessRuntime::new();
    let tuner = quick_tuner(&runtime);
    let mut op: Softmax = SoftmaxKernel::new();
    let mut ctx = OpContext::new(&runtime, &tuner);
    let x = runtime.upload(&[1, 4], DataType::F32, &logits(4)).expect("upload");
    let y = runtime.alloc(&[1, 4], DataType::F32).expect("alloc");

    runtime.fail_next_builds(1);
    let err = op.compute(&mut ctx, &x, &y).err();
    assert!(matches!(err, Some(AccelError::Build { .. })));
    assert!(!op.is_built());
    assert_eq!(runtime.stats().dispatches, 0);

    op.compute(&mut ctx, &x, &y).expect("retry");
    assert!(op.is_built());
    assert_eq!(runtime.stats().builds, 1);
}

#[test]
fn dispatch_failures_propagate_without_retry() {
    let runtime = InProcessRuntime::new();
    let tuner = untuned(&runtime);
    let mut op: Softmax = SoftmaxKernel::new();
    let mut ctx = OpContext::new(&runtime, &tuner);
    let x = runtime.upload(&[2, 4], DataType::F32, &logits(8)).expect("upload");
    let y = runtime.alloc(&[2, 4], DataType::F32).expect("alloc");

    runtime.fail_next_dispatches(1);
    let err = op.compute(&mut ctx, &x, &y).err();
    assert!(matches!(err, Some(AccelError::Dispatch(_))));
    assert_eq!(runtime.stats().dispatches, 0);
    assert_eq!(runtime.dispatch_log().len(), 0);

    op.compute(&mut ctx, &x, &y).expect("next call");
    assert_eq!(runtime.stats().dispatches, 1);
    assert_close(&runtime.download(&y).expect("download"), &cpu_softmax(&logits(8), 4), 1e-5);
}

#[test]
fn deferred_context_returns_a_completion_handle() {
    let runtime = InProcessRuntime::new();
    let tuner = untuned(&runtime);
    let mut op: Softmax = SoftmaxKernel::new();
    let mut ctx = OpContext::deferred(&runtime, &tuner);
    let x = runtime.upload(&[3, 6], DataType::F32, &logits(18)).expect("upload");
    let y = runtime.alloc(&[3, 6], DataType::F32).expect("alloc");

    op.compute(&mut ctx, &x, &y).expect("submit");
    assert!(ctx.has_pending());
    assert_eq!(runtime.stats().waits, 0);
    let future = ctx.take_future().expect("future");
    future.wait(&runtime).expect("wait");
    assert_eq!(runtime.stats().waits, 1);
    assert!(!ctx.has_pending());
    assert_close(&runtime.download(&y).expect("download"), &cpu_softmax(&logits(18), 6), 1e-5);
}

#[test]
fn blocking_context_waits_for_completion() {
    let runtime = InProcessRuntime::new();
    let tuner = untuned(&runtime);
    let mut op: Softmax = SoftmaxKernel::new();
    let mut ctx = OpContext::new(&runtime, &tuner);
    let x = runtime.upload(&[1, 3], DataType::F32, &logits(3)).expect("upload");
    let y = runtime.alloc(&[1, 3], DataType::F32).expect("alloc");
    op.compute(&mut ctx, &x, &y).expect("compute");
    assert!(!ctx.has_pending());
    assert_eq!(runtime.stats().waits, 1);
}

#[test]
fn half_precision_output() {
    let runtime = InProcessRuntime::new();
    let tuner = quick_tuner(&runtime);
    let mut op: SoftmaxKernel<InProcessRuntime, half::f16, NoopGuard> = SoftmaxKernel::new();
    let mut ctx = OpContext::new(&runtime, &tuner);
    let shape = [2, 2, 2, 7];
    let input = logits(56);
    let x = runtime.upload(&shape, DataType::F16, &input).expect("upload");
    let y = runtime.alloc(&shape, DataType::F16).expect("alloc");
    op.compute(&mut ctx, &x, &y).expect("compute");

    let options = runtime.last_build_options().expect("options");
    assert_eq!(options.value("IN_DATA_TYPE"), Some("f16"));
    assert_eq!(options.value("OUT_DATA_TYPE"), Some("f16"));
    assert_eq!(options.value("DATA_TYPE"), Some("f32"));
    let rounded = runtime.download(&x).expect("rounded input");
    assert_close(&runtime.download(&y).expect("download"), &cpu_softmax(&rounded, 7), 1e-3);
}

#[test]
fn out_of_range_writes_are_reported_by_the_guard() {
    let runtime = InProcessRuntime::new();
    let tuner = untuned(&runtime);
    let mut op: Softmax<OutOfRangeGuard> = SoftmaxKernel::new();
    let mut ctx = OpContext::new(&runtime, &tuner);
    let x = runtime.upload(&[1, 8], DataType::F32, &logits(8)).expect("upload");
    let short = runtime.alloc(&[1, 4], DataType::F32).expect("alloc");

    let err = op.compute(&mut ctx, &x, &short).err();
    assert!(matches!(err, Some(AccelError::OutOfRange { code: 1 })), "{err:?}");
    assert!(runtime
        .last_build_options()
        .expect("options")
        .is_defined("OUT_OF_RANGE_CHECK"));
    // in-range lanes were still written
    let partial = runtime.download(&short).expect("download");
    assert_close(&partial, &cpu_softmax(&logits(8), 8)[..4], 1e-5);
}

#[test]
fn guarded_launch_with_valid_output_succeeds() {
    let runtime = InProcessRuntime::new();
    let tuner = quick_tuner(&runtime);
    let mut op: Softmax<OutOfRangeGuard> = SoftmaxKernel::new();
    let mut ctx = OpContext::new(&runtime, &tuner);
    let x = runtime.upload(&[2, 2, 1, 5], DataType::F32, &logits(20)).expect("upload");
    let y = runtime.alloc(&[2, 2, 1, 5], DataType::F32).expect("alloc");
    op.compute(&mut ctx, &x, &y).expect("compute");
    op.compute(&mut ctx, &x, &y).expect("again");
    assert_eq!(runtime.stats().status_buffers, 1);
    assert!(op.guard().flag_buffer().is_some());
    assert_close(&runtime.download(&y).expect("download"), &cpu_softmax(&logits(20), 5), 1e-5);
}

#[test]
fn deferred_guard_violations_surface_on_wait() {
    let runtime = InProcessRuntime::new();
    let tuner = untuned(&runtime);
    let mut op: Softmax<OutOfRangeGuard> = SoftmaxKernel::new();
    let mut ctx = OpContext::deferred(&runtime, &tuner);
    let x = runtime.upload(&[2, 4], DataType::F32, &logits(8)).expect("upload");
    let short = runtime.alloc(&[1, 4], DataType::F32).expect("alloc");
    op.compute(&mut ctx, &x, &short).expect("submission succeeds");
    assert!(matches!(ctx.wait(), Err(AccelError::OutOfRange { .. })));
}

#[test]
fn pending_violation_is_reported_by_the_next_deferred_launch() {
    let runtime = InProcessRuntime::new();
    let tuner = untuned(&runtime);
    let mut ctx = OpContext::deferred(&runtime, &tuner);
    let x = runtime.upload(&[1, 8], DataType::F32, &logits(8)).expect("upload");
    let short = runtime.alloc(&[1, 4], DataType::F32).expect("alloc");
    let y = runtime.alloc(&[1, 8], DataType::F32).expect("alloc");

    let mut first: Softmax<OutOfRangeGuard> = SoftmaxKernel::new();
    let mut second: Softmax<OutOfRangeGuard> = SoftmaxKernel::new();
    first.compute(&mut ctx, &x, &short).expect("submission succeeds");
    let err = second.compute(&mut ctx, &x, &y).err();
    assert!(matches!(err, Some(AccelError::OutOfRange { code: 1 })), "{err:?}");
    assert!(!ctx.has_pending());

    second.compute(&mut ctx, &x, &y).expect("valid launch");
    ctx.wait().expect("valid launch completes");
    assert_close(&runtime.download(&y).expect("download"), &cpu_softmax(&logits(8), 8), 1e-5);
}

#[test]
fn guard_flag_is_checked_before_it_is_reset() {
    let runtime = InProcessRuntime::new();
    let tuner = untuned(&runtime);
    let mut op: Softmax<OutOfRangeGuard> = SoftmaxKernel::new();
    let mut ctx = OpContext::deferred(&runtime, &tuner);
    let x = runtime.upload(&[2, 4], DataType::F32, &logits(8)).expect("upload");
    let short = runtime.alloc(&[1, 4], DataType::F32).expect("alloc");

    op.compute(&mut ctx, &x, &short).expect("submission succeeds");
    assert!(matches!(
        op.compute(&mut ctx, &x, &short),
        Err(AccelError::OutOfRange { .. })
    ));
    // the failed call never launched
    assert_eq!(runtime.stats().dispatches, 1);
}

#[test]
fn unguarded_short_output_is_a_dispatch_error() {
    let runtime = InProcessRuntime::new();
    let tuner = untuned(&runtime);
    let mut op: Softmax = SoftmaxKernel::new();
    let mut ctx = OpContext::new(&runtime, &tuner);
    let x = runtime.upload(&[1, 8], DataType::F32, &logits(8)).expect("upload");
    let short = runtime.alloc(&[1, 4], DataType::F32).expect("alloc");
    let err = op.compute(&mut ctx, &x, &short).err();
    assert!(matches!(err, Some(AccelError::Dispatch(_))));
}

#[test]
fn empty_channel_axis_is_a_no_op() {
    let runtime = InProcessRuntime::new();
    let tuner = quick_tuner(&runtime);
    let mut op: Softmax = SoftmaxKernel::new();
    let mut ctx = OpContext::new(&runtime, &tuner);
    let x = runtime.upload(&[3, 0], DataType::F32, &[]).expect("upload");
    let y = runtime.alloc(&[3, 0], DataType::F32).expect("alloc");
    op.compute(&mut ctx, &x, &y).expect("compute");
    assert_eq!(tuner.metrics().counters().misses, 0);
}
