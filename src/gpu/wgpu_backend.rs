//! wgpu implementation of the device interface.
//!
//! Pipelines use shader-derived bind group layouts. The per-dispatch
//! parameter block lives in a small scratch uniform owned by the pipeline,
//! rewritten before each submit; writes and submits interleave in queue
//! order, so back-to-back dispatches each see their own block.

use std::collections::HashMap;
use std::sync::Arc;

use super::interface::{
    BufferId, ComputeDispatch, ComputePipelineSpec, DeviceError, DeviceInterface, DeviceResult,
    FramebufferId, PipelineId, TextureId, UniformBinding, UniformSetId,
};

struct BufferEntry {
    buffer: wgpu::Buffer,
    size: u64,
}

struct TextureEntry {
    _texture: wgpu::Texture,
    view: wgpu::TextureView,
    size: (u32, u32),
}

struct PipelineEntry {
    pipeline: wgpu::ComputePipeline,
    label: String,
    push_params_size: u32,
    push_params_group: u32,
    /// Scratch uniform + bind group for the parameter block, when declared.
    push_scratch: Option<(wgpu::Buffer, wgpu::BindGroup)>,
}

struct UniformSetEntry {
    bind_group: wgpu::BindGroup,
    group: u32,
    bindings: Vec<UniformBinding>,
}

/// [`DeviceInterface`] over a wgpu device and queue.
pub struct WgpuDevice {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    next_id: u64,
    buffers: HashMap<u64, BufferEntry>,
    textures: HashMap<u64, TextureEntry>,
    framebuffers: HashMap<u64, TextureId>,
    pipelines: HashMap<u64, PipelineEntry>,
    uniform_sets: HashMap<u64, UniformSetEntry>,
    fallback_texture: Option<TextureId>,
}

impl WgpuDevice {
    pub fn new(device: Arc<wgpu::Device>, queue: Arc<wgpu::Queue>) -> Self {
        Self {
            device,
            queue,
            next_id: 1,
            buffers: HashMap::new(),
            textures: HashMap::new(),
            framebuffers: HashMap::new(),
            pipelines: HashMap::new(),
            uniform_sets: HashMap::new(),
            fallback_texture: None,
        }
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn buffer(&self, id: BufferId) -> DeviceResult<&BufferEntry> {
        self.buffers
            .get(&id.0)
            .ok_or(DeviceError::BufferNotFound { id: id.0 })
    }

    fn binding_alive(&self, binding: &UniformBinding) -> bool {
        match binding {
            UniformBinding::StorageBuffer { buffer, .. }
            | UniformBinding::UniformBuffer { buffer, .. } => self.buffers.contains_key(&buffer.0),
            UniformBinding::DepthTexture { texture, .. } => self.textures.contains_key(&texture.0),
        }
    }
}

impl DeviceInterface for WgpuDevice {
    fn backend_type(&self) -> &str {
        "wgpu"
    }

    fn storage_buffer_create(
        &mut self,
        size: u64,
        data: Option<&[u8]>,
        label: &str,
    ) -> DeviceResult<BufferId> {
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_DST
                | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        if let Some(data) = data {
            self.queue.write_buffer(&buffer, 0, data);
        }
        let id = self.next_id();
        log::debug!(
            "[WgpuDevice] storage buffer {} '{}' ({} bytes)",
            id,
            label,
            size
        );
        self.buffers.insert(id, BufferEntry { buffer, size });
        Ok(BufferId(id))
    }

    fn buffer_update(&mut self, buffer: BufferId, offset: u64, data: &[u8]) -> DeviceResult<()> {
        let entry = self.buffer(buffer)?;
        if offset + data.len() as u64 > entry.size {
            return Err(DeviceError::OutOfRange {
                offset,
                len: data.len() as u64,
                size: entry.size,
            });
        }
        self.queue.write_buffer(&entry.buffer, offset, data);
        Ok(())
    }

    fn buffer_clear(&mut self, buffer: BufferId, offset: u64, size: u64) -> DeviceResult<()> {
        let entry = self.buffer(buffer)?;
        if offset + size > entry.size {
            return Err(DeviceError::OutOfRange {
                offset,
                len: size,
                size: entry.size,
            });
        }
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("particles buffer clear"),
            });
        encoder.clear_buffer(&entry.buffer, offset, Some(size));
        self.queue.submit(std::iter::once(encoder.finish()));
        Ok(())
    }

    fn buffer_get_data(&mut self, buffer: BufferId) -> DeviceResult<Vec<u8>> {
        let entry = self.buffer(buffer)?;

        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("particles readback staging"),
            size: entry.size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("particles readback"),
            });
        encoder.copy_buffer_to_buffer(&entry.buffer, 0, &staging, 0, entry.size);
        self.queue.submit(std::iter::once(encoder.finish()));

        let slice = staging.slice(..);
        let (sender, receiver) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        self.device.poll(wgpu::Maintain::Wait);

        receiver
            .recv()
            .map_err(|_| DeviceError::Readback {
                message: "mapping callback dropped".to_string(),
            })?
            .map_err(|e| DeviceError::Readback {
                message: format!("{:?}", e),
            })?;

        let mapped = slice.get_mapped_range();
        let data = mapped.to_vec();
        drop(mapped);
        staging.unmap();
        Ok(data)
    }

    fn buffer_free(&mut self, buffer: BufferId) {
        if self.buffers.remove(&buffer.0).is_none() {
            log::debug!("[WgpuDevice] freeing unknown buffer {}", buffer.0);
        }
    }

    fn compute_pipeline_create(&mut self, spec: &ComputePipelineSpec) -> DeviceResult<PipelineId> {
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);

        let module = self
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(spec.label),
                source: wgpu::ShaderSource::Wgsl(spec.source.into()),
            });
        let pipeline = self
            .device
            .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(spec.label),
                layout: None,
                module: &module,
                entry_point: spec.entry_point,
            });

        if let Some(error) = pollster::block_on(self.device.pop_error_scope()) {
            log::error!(
                "[WgpuDevice] pipeline '{}' failed validation: {}",
                spec.label,
                error
            );
            return Err(DeviceError::ShaderCompilation {
                label: spec.label.to_string(),
                message: error.to_string(),
            });
        }

        let push_scratch = if spec.push_params_size > 0 {
            let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(&format!("{} push params", spec.label)),
                size: spec.push_params_size as u64,
                usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            });
            let layout = pipeline.get_bind_group_layout(spec.push_params_group);
            let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some(&format!("{} push params", spec.label)),
                layout: &layout,
                entries: &[wgpu::BindGroupEntry {
                    binding: 0,
                    resource: buffer.as_entire_binding(),
                }],
            });
            Some((buffer, bind_group))
        } else {
            None
        };

        let id = self.next_id();
        self.pipelines.insert(
            id,
            PipelineEntry {
                pipeline,
                label: spec.label.to_string(),
                push_params_size: spec.push_params_size,
                push_params_group: spec.push_params_group,
                push_scratch,
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
        let layout = {
            let entry = self
                .pipelines
                .get(&pipeline.0)
                .ok_or(DeviceError::PipelineNotFound { id: pipeline.0 })?;
            entry.pipeline.get_bind_group_layout(group)
        };

        let mut entries = Vec::with_capacity(bindings.len());
        for binding in bindings {
            match binding {
                UniformBinding::StorageBuffer { binding, buffer }
                | UniformBinding::UniformBuffer { binding, buffer } => {
                    let entry = self.buffer(*buffer)?;
                    entries.push(wgpu::BindGroupEntry {
                        binding: *binding,
                        resource: entry.buffer.as_entire_binding(),
                    });
                }
                UniformBinding::DepthTexture { binding, texture } => {
                    let entry = self
                        .textures
                        .get(&texture.0)
                        .ok_or(DeviceError::TextureNotFound { id: texture.0 })?;
                    entries.push(wgpu::BindGroupEntry {
                        binding: *binding,
                        resource: wgpu::BindingResource::TextureView(&entry.view),
                    });
                }
            }
        }

        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("particles uniform set"),
            layout: &layout,
            entries: &entries,
        });

        let id = self.next_id();
        self.uniform_sets.insert(
            id,
            UniformSetEntry {
                bind_group,
                group,
                bindings: bindings.to_vec(),
            },
        );
        Ok(UniformSetId(id))
    }

    fn uniform_set_is_valid(&self, set: UniformSetId) -> bool {
        match self.uniform_sets.get(&set.0) {
            Some(entry) => entry.bindings.iter().all(|b| self.binding_alive(b)),
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

        let mut sets = Vec::with_capacity(dispatch.uniform_sets.len());
        for set in dispatch.uniform_sets {
            let entry = self
                .uniform_sets
                .get(&set.0)
                .ok_or(DeviceError::UniformSetNotFound { id: set.0 })?;
            for binding in &entry.bindings {
                if !self.binding_alive(binding) {
                    return Err(DeviceError::InvalidDispatch {
                        reason: format!("uniform set {} references a dead resource", set.0),
                    });
                }
            }
            sets.push(entry);
        }

        if let Some((buffer, _)) = &pipeline.push_scratch {
            self.queue.write_buffer(buffer, 0, dispatch.push_params);
        }

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some(dispatch.label),
            });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(dispatch.label),
                timestamp_writes: None,
            });
            pass.set_pipeline(&pipeline.pipeline);
            for entry in &sets {
                pass.set_bind_group(entry.group, &entry.bind_group, &[]);
            }
            if let Some((_, bind_group)) = &pipeline.push_scratch {
                pass.set_bind_group(pipeline.push_params_group, bind_group, &[]);
            }
            pass.dispatch_workgroups(dispatch.groups[0], dispatch.groups[1], dispatch.groups[2]);
        }
        self.queue.submit(std::iter::once(encoder.finish()));
        Ok(())
    }

    fn depth_texture_create(
        &mut self,
        width: u32,
        height: u32,
        label: &str,
    ) -> DeviceResult<TextureId> {
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some(label),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Depth32Float,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::TEXTURE_BINDING,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());

        let id = self.next_id();
        log::debug!(
            "[WgpuDevice] depth texture {} '{}' ({}x{})",
            id,
            label,
            width,
            height
        );
        self.textures.insert(
            id,
            TextureEntry {
                _texture: texture,
                view,
                size: (width, height),
            },
        );
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
        label: &str,
    ) -> DeviceResult<FramebufferId> {
        let entry = self
            .textures
            .get(&texture.0)
            .ok_or(DeviceError::TextureNotFound { id: texture.0 })?;
        log::debug!(
            "[WgpuDevice] framebuffer '{}' over texture {} ({}x{})",
            label,
            texture.0,
            entry.size.0,
            entry.size.1
        );
        let id = self.next_id();
        self.framebuffers.insert(id, texture);
        Ok(FramebufferId(id))
    }

    fn framebuffer_is_valid(&self, framebuffer: FramebufferId) -> bool {
        match self.framebuffers.get(&framebuffer.0) {
            Some(texture) => self.textures.contains_key(&texture.0),
            None => false,
        }
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
        let texture = self.depth_texture_create(1, 1, "particles fallback depth")?;
        self.fallback_texture = Some(texture);
        Ok(texture)
    }
}
