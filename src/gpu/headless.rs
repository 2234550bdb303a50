//! Host-memory device backend.
//!
//! Buffers are plain byte vectors and dispatches are recorded instead of
//! executed, which is enough for server-side runs and for tests that assert
//! on upload contents and dispatch cadence.

use std::collections::HashMap;

use super::interface::{
    BufferId, ComputeDispatch, ComputePipelineSpec, DeviceError, DeviceInterface, DeviceResult,
    FramebufferId, PipelineId, TextureId, UniformBinding, UniformSetId,
};

/// One recorded dispatch.
#[derive(Debug, Clone)]
pub struct DispatchRecord {
    pub label: String,
    pub pipeline: PipelineId,
    pub groups: [u32; 3],
    pub push_params: Vec<u8>,
}

struct PipelineEntry {
    label: String,
    push_params_size: u32,
    push_params_group: u32,
}

struct UniformSetEntry {
    pipeline: PipelineId,
    group: u32,
    bindings: Vec<UniformBinding>,
}

/// CPU-resident [`DeviceInterface`] implementation.
pub struct HeadlessDevice {
    next_id: u64,
    buffers: HashMap<u64, Vec<u8>>,
    textures: HashMap<u64, (u32, u32)>,
    framebuffers: HashMap<u64, TextureId>,
    pipelines: HashMap<u64, PipelineEntry>,
    uniform_sets: HashMap<u64, UniformSetEntry>,
    fallback_texture: Option<TextureId>,
    dispatches: Vec<DispatchRecord>,
}

impl HeadlessDevice {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            buffers: HashMap::new(),
            textures: HashMap::new(),
            framebuffers: HashMap::new(),
            pipelines: HashMap::new(),
            uniform_sets: HashMap::new(),
            fallback_texture: None,
            dispatches: Vec::new(),
        }
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Recorded dispatches since the last [`Self::clear_dispatches`].
    pub fn dispatches(&self) -> &[DispatchRecord] {
        &self.dispatches
    }

    pub fn clear_dispatches(&mut self) {
        self.dispatches.clear();
    }

    /// Dispatches recorded through a pipeline whose label contains `needle`.
    pub fn dispatch_count_for(&self, needle: &str) -> usize {
        self.dispatches
            .iter()
            .filter(|record| record.label.contains(needle))
            .count()
    }

    pub fn live_buffer_count(&self) -> usize {
        self.buffers.len()
    }

    pub fn live_texture_count(&self) -> usize {
        self.textures.len()
    }

    pub fn texture_size(&self, texture: TextureId) -> Option<(u32, u32)> {
        self.textures.get(&texture.0).copied()
    }

    fn binding_alive(&self, binding: &UniformBinding) -> bool {
        match binding {
            UniformBinding::StorageBuffer { buffer, .. }
            | UniformBinding::UniformBuffer { buffer, .. } => self.buffers.contains_key(&buffer.0),
            UniformBinding::DepthTexture { texture, .. } => self.textures.contains_key(&texture.0),
        }
    }
}

impl Default for HeadlessDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceInterface for HeadlessDevice {
    fn backend_type(&self) -> &str {
        "headless"
    }

    fn storage_buffer_create(
        &mut self,
        size: u64,
        data: Option<&[u8]>,
        label: &str,
    ) -> DeviceResult<BufferId> {
        let mut contents = vec![0u8; size as usize];
        if let Some(data) = data {
            let len = data.len().min(contents.len());
            contents[..len].copy_from_slice(&data[..len]);
        }
        let id = self.next_id();
        self.buffers.insert(id, contents);
        log::trace!("[HeadlessDevice] buffer {} '{}' ({} bytes)", id, label, size);
        Ok(BufferId(id))
    }

    fn buffer_update(&mut self, buffer: BufferId, offset: u64, data: &[u8]) -> DeviceResult<()> {
        let contents = self
            .buffers
            .get_mut(&buffer.0)
            .ok_or(DeviceError::BufferNotFound { id: buffer.0 })?;
        let end = offset as usize + data.len();
        if end > contents.len() {
            return Err(DeviceError::OutOfRange {
                offset,
                len: data.len() as u64,
                size: contents.len() as u64,
            });
        }
        contents[offset as usize..end].copy_from_slice(data);
        Ok(())
    }

    fn buffer_clear(&mut self, buffer: BufferId, offset: u64, size: u64) -> DeviceResult<()> {
        let contents = self
            .buffers
            .get_mut(&buffer.0)
            .ok_or(DeviceError::BufferNotFound { id: buffer.0 })?;
        let end = (offset + size) as usize;
        if end > contents.len() {
            return Err(DeviceError::OutOfRange {
                offset,
                len: size,
                size: contents.len() as u64,
            });
        }
        contents[offset as usize..end].fill(0);
        Ok(())
    }

    fn buffer_get_data(&mut self, buffer: BufferId) -> DeviceResult<Vec<u8>> {
        self.buffers
            .get(&buffer.0)
            .cloned()
            .ok_or(DeviceError::BufferNotFound { id: buffer.0 })
    }

    fn buffer_free(&mut self, buffer: BufferId) {
        self.buffers.remove(&buffer.0);
    }

    fn compute_pipeline_create(&mut self, spec: &ComputePipelineSpec) -> DeviceResult<PipelineId> {
        if spec.source.trim().is_empty() {
            return Err(DeviceError::ShaderCompilation {
                label: spec.label.to_string(),
                message: "empty source".to_string(),
            });
        }
        let id = self.next_id();
        self.pipelines.insert(
            id,
            PipelineEntry {
                label: spec.label.to_string(),
                push_params_size: spec.push_params_size,
                push_params_group: spec.push_params_group,
            },
        );
        Ok(PipelineId(id))
    }

    fn uniform_set_create(
        &mut self,
        pipeline: PipelineId,
        group: u32,
        bindings: &[UniformBinding],
    ) -> DeviceResult<UniformSetId> {
        if !self.pipelines.contains_key(&pipeline.0) {
            return Err(DeviceError::PipelineNotFound { id: pipeline.0 });
        }
        for binding in bindings {
            if !self.binding_alive(binding) {
                return Err(DeviceError::InvalidDispatch {
                    reason: format!("binding references a dead resource: {:?}", binding),
                });
            }
        }
        let id = self.next_id();
        self.uniform_sets.insert(
            id,
            UniformSetEntry {
                pipeline,
                group,
                bindings: bindings.to_vec(),
            },
        );
        Ok(UniformSetId(id))
    }

    fn uniform_set_is_valid(&self, set: UniformSetId) -> bool {
        match self.uniform_sets.get(&set.0) {
            Some(entry) => {
                self.pipelines.contains_key(&entry.pipeline.0)
                    && entry.bindings.iter().all(|b| self.binding_alive(b))
            }
            None => false,
        }
    }

    fn uniform_set_free(&mut self, set: UniformSetId) {
        self.uniform_sets.remove(&set.0);
    }

    fn compute_dispatch(&mut self, dispatch: &ComputeDispatch) -> DeviceResult<()> {
        let pipeline = self
            .pipelines
            .get(&dispatch.pipeline.0)
            .ok_or(DeviceError::PipelineNotFound {
                id: dispatch.pipeline.0,
            })?;
        if dispatch.push_params.len() != pipeline.push_params_size as usize {
            return Err(DeviceError::InvalidDispatch {
                reason: format!(
                    "push params are {} bytes, pipeline '{}' declares {}",
                    dispatch.push_params.len(),
                    pipeline.label,
                    pipeline.push_params_size
                ),
            });
        }
        let mut bound_groups = vec![pipeline.push_params_group];
        for set in dispatch.uniform_sets {
            if !self.uniform_set_is_valid(*set) {
                return Err(DeviceError::UniformSetNotFound { id: set.0 });
            }
            let group = self.uniform_sets[&set.0].group;
            if bound_groups.contains(&group) {
                return Err(DeviceError::InvalidDispatch {
                    reason: format!("bind group {} bound twice", group),
                });
            }
            bound_groups.push(group);
        }
        self.dispatches.push(DispatchRecord {
            label: dispatch.label.to_string(),
            pipeline: dispatch.pipeline,
            groups: dispatch.groups,
            push_params: dispatch.push_params.to_vec(),
        });
        Ok(())
    }

    fn depth_texture_create(
        &mut self,
        width: u32,
        height: u32,
        _label: &str,
    ) -> DeviceResult<TextureId> {
        let id = self.next_id();
        self.textures.insert(id, (width, height));
        Ok(TextureId(id))
    }

    fn texture_is_valid(&self, texture: TextureId) -> bool {
        self.textures.contains_key(&texture.0)
    }

    fn texture_free(&mut self, texture: TextureId) {
        self.textures.remove(&texture.0);
        self.framebuffers.retain(|_, target| *target != texture);
        if self.fallback_texture == Some(texture) {
            self.fallback_texture = None;
        }
    }

    fn framebuffer_create(
        &mut self,
        texture: TextureId,
        _label: &str,
    ) -> DeviceResult<FramebufferId> {
        if !self.textures.contains_key(&texture.0) {
            return Err(DeviceError::TextureNotFound { id: texture.0 });
        }
        let id = self.next_id();
        self.framebuffers.insert(id, texture);
        Ok(FramebufferId(id))
    }

    fn framebuffer_is_valid(&self, framebuffer: FramebufferId) -> bool {
        self.framebuffers.contains_key(&framebuffer.0)
    }

    fn framebuffer_free(&mut self, framebuffer: FramebufferId) {
        self.framebuffers.remove(&framebuffer.0);
    }

    fn fallback_depth_texture(&mut self) -> DeviceResult<TextureId> {
        if let Some(texture) = self.fallback_texture {
            if self.textures.contains_key(&texture.0) {
                return Ok(texture);
            }
        }
        let texture = self.depth_texture_create(1, 1, "fallback_depth")?;
        self.fallback_texture = Some(texture);
        Ok(texture)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_roundtrip() {
        let mut device = HeadlessDevice::new();
        let buffer = device
            .storage_buffer_create(16, None, "test")
            .expect("create buffer");

        device
            .buffer_update(buffer, 4, &[1, 2, 3, 4])
            .expect("update");
        let data = device.buffer_get_data(buffer).expect("readback");
        assert_eq!(&data[4..8], &[1, 2, 3, 4]);
        assert_eq!(data[0], 0);

        device.buffer_clear(buffer, 0, 16).expect("clear");
        let data = device.buffer_get_data(buffer).expect("readback");
        assert!(data.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_update_out_of_range() {
        let mut device = HeadlessDevice::new();
        let buffer = device
            .storage_buffer_create(8, None, "small")
            .expect("create buffer");
        let result = device.buffer_update(buffer, 6, &[0u8; 4]);
        assert!(matches!(result, Err(DeviceError::OutOfRange { .. })));
    }

    #[test]
    fn test_dispatch_is_recorded_and_validated() {
        let mut device = HeadlessDevice::new();
        let pipeline = device
            .compute_pipeline_create(&ComputePipelineSpec {
                label: "simulate",
                source: "@compute fn main() {}",
                entry_point: "main",
                push_params_size: 8,
                push_params_group: 1,
            })
            .expect("create pipeline");

        // Wrong push size is rejected
        let bad = device.compute_dispatch(&ComputeDispatch {
            label: "simulate",
            pipeline,
            uniform_sets: &[],
            push_params: &[0u8; 4],
            groups: [1, 1, 1],
        });
        assert!(bad.is_err());

        device
            .compute_dispatch(&ComputeDispatch {
                label: "simulate",
                pipeline,
                uniform_sets: &[],
                push_params: &[0u8; 8],
                groups: [4, 1, 1],
            })
            .expect("dispatch");

        assert_eq!(device.dispatches().len(), 1);
        assert_eq!(device.dispatches()[0].groups, [4, 1, 1]);
        assert_eq!(device.dispatch_count_for("simulate"), 1);
    }

    #[test]
    fn test_uniform_set_invalidated_by_buffer_free() {
        let mut device = HeadlessDevice::new();
        let pipeline = device
            .compute_pipeline_create(&ComputePipelineSpec {
                label: "simulate",
                source: "@compute fn main() {}",
                entry_point: "main",
                push_params_size: 0,
                push_params_group: 0,
            })
            .expect("create pipeline");
        let buffer = device
            .storage_buffer_create(4, None, "data")
            .expect("create buffer");
        let set = device
            .uniform_set_create(
                pipeline,
                0,
                &[UniformBinding::StorageBuffer { binding: 0, buffer }],
            )
            .expect("create set");

        assert!(device.uniform_set_is_valid(set));
        device.buffer_free(buffer);
        assert!(!device.uniform_set_is_valid(set));
    }

    #[test]
    fn test_framebuffer_follows_texture() {
        let mut device = HeadlessDevice::new();
        let texture = device
            .depth_texture_create(256, 128, "heightfield")
            .expect("create texture");
        let framebuffer = device
            .framebuffer_create(texture, "heightfield_fb")
            .expect("create framebuffer");

        assert!(device.framebuffer_is_valid(framebuffer));
        device.texture_free(texture);
        assert!(!device.framebuffer_is_valid(framebuffer));
    }
}
