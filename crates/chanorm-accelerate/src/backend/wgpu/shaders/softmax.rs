// Channel-wise softmax over NHWC data. One invocation owns a block of four
// channels of one pixel: it reduces the whole channel row, then writes its
// own lanes. Bounds-checked writes raise `oorc_status[0]` instead of storing.

pub const SOFTMAX_BUFFER_SHADER: &str = r#"#ifdef ENABLE_F16
enable f16;
#endif

struct Params {
#ifdef OUT_OF_RANGE_CHECK
  output_size: u32,
#endif
  gws0: u32,
  gws1: u32,
  gws2: u32,
  height: i32,
  channels: i32,
  remain_channels: i32,
};

struct DispatchInfo { offset: vec3<u32>, _pad: u32 };

#ifdef OUT_OF_RANGE_CHECK
@group(0) @binding(0) var<storage, read_write> oorc_status: array<atomic<u32>>;
@group(0) @binding(1) var<storage, read_write> logits: array<IN_DATA_TYPE>;
@group(0) @binding(2) var<storage, read_write> probs: array<OUT_DATA_TYPE>;
#else
@group(0) @binding(0) var<storage, read_write> logits: array<IN_DATA_TYPE>;
@group(0) @binding(1) var<storage, read_write> probs: array<OUT_DATA_TYPE>;
#endif
@group(0) @binding(14) var<uniform> params: Params;
@group(0) @binding(15) var<uniform> dispatch_info: DispatchInfo;

fn load(index: i32) -> DATA_TYPE {
  return DATA_TYPE(logits[index]);
}

fn store_output(index: i32, value: DATA_TYPE) {
#ifdef OUT_OF_RANGE_CHECK
  if (index < 0 || u32(index) >= params.output_size) {
    atomicStore(&oorc_status[0], 1u);
    return;
  }
#endif
  probs[index] = OUT_DATA_TYPE(value);
}

@compute @workgroup_size(LWS_X, LWS_Y, LWS_Z)
fn softmax(@builtin(global_invocation_id) gid: vec3<u32>) {
  let channel_block = gid.x + dispatch_info.offset.x;
  let w = gid.y + dispatch_info.offset.y;
  let hb = gid.z + dispatch_info.offset.z;
  if (channel_block >= params.gws0 || w >= params.gws1 || hb >= params.gws2) {
    return;
  }

  let channels = params.channels;
  let b = i32(hb) / params.height;
  let h = i32(hb) % params.height;
  let base = ((b * params.height + h) * i32(params.gws1) + i32(w)) * channels;

  var max_value = DATA_TYPE(-3.402823e38);
  for (var c = 0; c < channels; c = c + 1) {
    max_value = max(max_value, load(base + c));
  }
  var sum = DATA_TYPE(0.0);
  for (var c = 0; c < channels; c = c + 1) {
    sum = sum + exp(load(base + c) - max_value);
  }

  var lanes = 4;
  if (channel_block + 1u == params.gws0) {
    lanes = 4 - params.remain_channels;
  }
  let first = i32(channel_block) * 4;
  for (var lane = 0; lane < lanes; lane = lane + 1) {
    let c = first + lane;
    store_output(base + c, exp(load(base + c) - max_value) / sum);
  }
}
"#;
