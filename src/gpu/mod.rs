//! Device abstraction the particle storage runs against.
//!
//! The storage talks to a [`DeviceInterface`] only. `WgpuDevice` is the real
//! backend; `HeadlessDevice` keeps everything in host memory for tests and
//! server-side runs.

mod headless;
mod interface;
mod wgpu_backend;

pub use headless::{DispatchRecord, HeadlessDevice};
pub use interface::{
    dispatch_group_count, BufferId, ComputeDispatch, ComputePipelineSpec, DeviceError,
    DeviceInterface, DeviceResult, FramebufferId, PipelineId, TextureId, UniformBinding,
    UniformSetId,
};
pub use wgpu_backend::WgpuDevice;
