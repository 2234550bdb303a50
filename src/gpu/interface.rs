//! Backend-neutral device interface.
//!
//! Covers exactly the device surface the particle storage needs: storage
//! buffers, compute pipelines with a small per-dispatch parameter block,
//! uniform sets resolved against a pipeline's bind group layouts, and depth
//! render targets for heightfield colliders. Handles are opaque ids; a
//! backend owns the id-to-resource mapping.

use crate::constants::WORKGROUP_SIZE;

macro_rules! device_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u64);
    };
}

device_id!(
    /// Storage or uniform buffer.
    BufferId
);
device_id!(
    /// Sampled or render-target texture.
    TextureId
);
device_id!(
    /// Render target wrapper around a texture.
    FramebufferId
);
device_id!(
    /// Compute pipeline.
    PipelineId
);
device_id!(
    /// Bound resource set for one bind group slot.
    UniformSetId
);

/// Device-level errors
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("buffer {id} is not allocated")]
    BufferNotFound { id: u64 },

    #[error("texture {id} is not allocated")]
    TextureNotFound { id: u64 },

    #[error("pipeline {id} is not allocated")]
    PipelineNotFound { id: u64 },

    #[error("uniform set {id} is not allocated")]
    UniformSetNotFound { id: u64 },

    #[error("shader '{label}' failed to compile: {message}")]
    ShaderCompilation { label: String, message: String },

    #[error("buffer access out of range: offset {offset} + len {len} > size {size}")]
    OutOfRange { offset: u64, len: u64, size: u64 },

    #[error("dispatch rejected: {reason}")]
    InvalidDispatch { reason: String },

    #[error("readback failed: {message}")]
    Readback { message: String },
}

pub type DeviceResult<T> = Result<T, DeviceError>;

/// One resource bound inside a uniform set.
#[derive(Debug, Clone, Copy)]
pub enum UniformBinding {
    StorageBuffer { binding: u32, buffer: BufferId },
    UniformBuffer { binding: u32, buffer: BufferId },
    /// Depth texture read with `textureLoad`, no sampler.
    DepthTexture { binding: u32, texture: TextureId },
}

/// Compute pipeline description.
#[derive(Debug, Clone)]
pub struct ComputePipelineSpec<'a> {
    pub label: &'a str,
    /// WGSL source.
    pub source: &'a str,
    pub entry_point: &'a str,
    /// Size in bytes of the per-dispatch parameter block, 0 for none.
    pub push_params_size: u32,
    /// Bind group index the parameter block occupies.
    pub push_params_group: u32,
}

/// One compute dispatch.
#[derive(Debug, Clone, Copy)]
pub struct ComputeDispatch<'a> {
    pub label: &'a str,
    pub pipeline: PipelineId,
    /// Each set binds at the group it was created for. The pipeline's
    /// push-params group is bound by the backend.
    pub uniform_sets: &'a [UniformSetId],
    /// Per-dispatch parameter block, must match the pipeline's declared size.
    pub push_params: &'a [u8],
    pub groups: [u32; 3],
}

/// Groups along x for `threads` items at the shared workgroup width.
pub fn dispatch_group_count(threads: u32) -> u32 {
    (threads + WORKGROUP_SIZE - 1) / WORKGROUP_SIZE
}

/// GPU device seam. `&mut self` throughout; the storage layer is
/// single-threaded cooperative and backends need no interior locking.
pub trait DeviceInterface {
    /// Backend name for diagnostics.
    fn backend_type(&self) -> &str;

    /// Create a storage buffer, zero-filled unless `data` is given.
    fn storage_buffer_create(
        &mut self,
        size: u64,
        data: Option<&[u8]>,
        label: &str,
    ) -> DeviceResult<BufferId>;

    fn buffer_update(&mut self, buffer: BufferId, offset: u64, data: &[u8]) -> DeviceResult<()>;

    /// Zero-fill a range of the buffer.
    fn buffer_clear(&mut self, buffer: BufferId, offset: u64, size: u64) -> DeviceResult<()>;

    /// Blocking full readback.
    fn buffer_get_data(&mut self, buffer: BufferId) -> DeviceResult<Vec<u8>>;

    /// Release a buffer. Freeing an unknown id is a no-op.
    fn buffer_free(&mut self, buffer: BufferId);

    fn compute_pipeline_create(&mut self, spec: &ComputePipelineSpec) -> DeviceResult<PipelineId>;

    /// Resolve bindings against `pipeline`'s layout for bind group `group`.
    fn uniform_set_create(
        &mut self,
        pipeline: PipelineId,
        group: u32,
        bindings: &[UniformBinding],
    ) -> DeviceResult<UniformSetId>;

    fn uniform_set_is_valid(&self, set: UniformSetId) -> bool;

    fn uniform_set_free(&mut self, set: UniformSetId);

    fn compute_dispatch(&mut self, dispatch: &ComputeDispatch) -> DeviceResult<()>;

    /// Depth render target for heightfield capture, sampleable.
    fn depth_texture_create(&mut self, width: u32, height: u32, label: &str)
        -> DeviceResult<TextureId>;

    fn texture_is_valid(&self, texture: TextureId) -> bool;

    fn texture_free(&mut self, texture: TextureId);

    fn framebuffer_create(&mut self, texture: TextureId, label: &str)
        -> DeviceResult<FramebufferId>;

    fn framebuffer_is_valid(&self, framebuffer: FramebufferId) -> bool;

    fn framebuffer_free(&mut self, framebuffer: FramebufferId);

    /// 1x1 depth texture bound wherever a heightfield slot has no capture.
    fn fallback_depth_texture(&mut self) -> DeviceResult<TextureId>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatch_group_count() {
        assert_eq!(dispatch_group_count(0), 0);
        assert_eq!(dispatch_group_count(1), 1);
        assert_eq!(dispatch_group_count(WORKGROUP_SIZE), 1);
        assert_eq!(dispatch_group_count(WORKGROUP_SIZE + 1), 2);
        assert_eq!(dispatch_group_count(1000), 16);
    }

    #[test]
    fn test_ids_are_distinct_types() {
        // Compile-time property; the assertion just keeps the test body real.
        let buffer = BufferId(1);
        let texture = TextureId(1);
        assert_eq!(buffer.0, texture.0);
    }
}
