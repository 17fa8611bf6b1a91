pub mod inprocess;
#[cfg(feature = "wgpu")]
pub mod wgpu;
