//! Process materials.
//!
//! A process material is an opaque reference systems bind; the storage only
//! cares about its shape: which pipeline steps particles, how many userdata
//! channels the particle buffer must carry, and what the kernel consumes. A
//! material whose shader fails to compile stays registered but invalid, and
//! systems bound to it simulate nothing.

use std::collections::HashMap;

use crate::gpu::{ComputePipelineSpec, DeviceInterface, PipelineId};

/// Opaque process material reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MaterialId(pub u64);

/// Which kernel a material runs.
#[derive(Debug, Clone)]
pub enum ProcessShader {
    /// The storage's built-in simulation kernel.
    Builtin,
    /// Caller-supplied WGSL with the same binding interface as the built-in
    /// kernel.
    Custom { source: String, entry_point: String },
}

/// What the material's kernel consumes each step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShaderCapabilities {
    /// Gather attractors and colliders into the frame params.
    pub uses_collision: bool,
    /// Wants wall-clock time in the frame params.
    pub uses_time: bool,
}

impl Default for ShaderCapabilities {
    fn default() -> Self {
        Self {
            uses_collision: true,
            uses_time: true,
        }
    }
}

/// Registration request.
#[derive(Debug, Clone)]
pub struct ProcessMaterialSpec {
    pub label: String,
    pub shader: ProcessShader,
    /// Extra 16-byte channels per particle, up to the shared cap.
    pub userdata_count: u32,
    pub capabilities: ShaderCapabilities,
}

impl ProcessMaterialSpec {
    pub fn builtin(label: &str) -> Self {
        Self {
            label: label.to_string(),
            shader: ProcessShader::Builtin,
            userdata_count: 0,
            capabilities: ShaderCapabilities::default(),
        }
    }
}

/// Shape summary handed to the storage when a system binds the material.
#[derive(Debug, Clone, Copy)]
pub struct MaterialBinding {
    pub userdata_count: u32,
    pub uses_collision: bool,
    pub valid: bool,
    /// `None` while invalid; dispatching is skipped then.
    pub pipeline: Option<PipelineId>,
}

struct MaterialEntry {
    label: String,
    userdata_count: u32,
    capabilities: ShaderCapabilities,
    valid: bool,
    pipeline: Option<PipelineId>,
    /// Custom pipelines are freed with the material; the built-in one is
    /// shared and stays.
    owns_pipeline: bool,
}

/// Registry of process materials.
pub struct MaterialLibrary {
    next_id: u64,
    materials: HashMap<u64, MaterialEntry>,
}

impl MaterialLibrary {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            materials: HashMap::new(),
        }
    }

    /// Register a material, compiling its kernel when custom. Compile
    /// failure yields a registered-but-invalid material, not an error.
    pub fn register<D: DeviceInterface>(
        &mut self,
        device: &mut D,
        builtin_pipeline: PipelineId,
        push_params_size: u32,
        spec: &ProcessMaterialSpec,
    ) -> MaterialId {
        let (pipeline, valid, owns_pipeline) = match &spec.shader {
            ProcessShader::Builtin => (Some(builtin_pipeline), true, false),
            ProcessShader::Custom {
                source,
                entry_point,
            } => match device.compute_pipeline_create(&ComputePipelineSpec {
                label: &spec.label,
                source,
                entry_point,
                push_params_size,
                push_params_group: 1,
            }) {
                Ok(pipeline) => (Some(pipeline), true, true),
                Err(err) => {
                    log::error!(
                        "[MaterialLibrary] material '{}' kernel rejected: {}",
                        spec.label,
                        err
                    );
                    (None, false, false)
                }
            },
        };

        let id = self.next_id;
        self.next_id += 1;
        self.materials.insert(
            id,
            MaterialEntry {
                label: spec.label.clone(),
                userdata_count: spec.userdata_count,
                capabilities: spec.capabilities,
                valid,
                pipeline,
                owns_pipeline,
            },
        );
        log::debug!(
            "[MaterialLibrary] registered '{}' as material {} (valid: {})",
            spec.label,
            id,
            valid
        );
        MaterialId(id)
    }

    pub fn binding(&self, id: MaterialId) -> Option<MaterialBinding> {
        self.materials.get(&id.0).map(|entry| MaterialBinding {
            userdata_count: entry.userdata_count,
            uses_collision: entry.capabilities.uses_collision,
            valid: entry.valid,
            pipeline: if entry.valid { entry.pipeline } else { None },
        })
    }

    pub fn is_registered(&self, id: MaterialId) -> bool {
        self.materials.contains_key(&id.0)
    }

    pub fn label(&self, id: MaterialId) -> Option<&str> {
        self.materials.get(&id.0).map(|entry| entry.label.as_str())
    }

    pub fn free<D: DeviceInterface>(&mut self, device: &mut D, id: MaterialId) -> bool {
        match self.materials.remove(&id.0) {
            Some(entry) => {
                if entry.owns_pipeline {
                    if let Some(_pipeline) = entry.pipeline {
                        // Pipelines have no device-side free in the interface;
                        // backends drop them with the device. Nothing to do.
                    }
                }
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.materials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.materials.is_empty()
    }
}

impl Default for MaterialLibrary {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::HeadlessDevice;

    fn builtin_pipeline(device: &mut HeadlessDevice) -> PipelineId {
        device
            .compute_pipeline_create(&ComputePipelineSpec {
                label: "particles_simulate",
                source: "@compute fn main() {}",
                entry_point: "main",
                push_params_size: 48,
                push_params_group: 1,
            })
            .expect("builtin pipeline")
    }

    #[test]
    fn test_builtin_material_shares_pipeline() {
        let mut device = HeadlessDevice::new();
        let builtin = builtin_pipeline(&mut device);
        let mut library = MaterialLibrary::new();

        let id = library.register(
            &mut device,
            builtin,
            48,
            &ProcessMaterialSpec::builtin("default"),
        );
        let binding = library.binding(id).expect("registered");
        assert!(binding.valid);
        assert_eq!(binding.pipeline, Some(builtin));
        assert_eq!(binding.userdata_count, 0);
    }

    #[test]
    fn test_bad_custom_shader_is_invalid_not_fatal() {
        let mut device = HeadlessDevice::new();
        let builtin = builtin_pipeline(&mut device);
        let mut library = MaterialLibrary::new();

        let id = library.register(
            &mut device,
            builtin,
            48,
            &ProcessMaterialSpec {
                label: "broken".to_string(),
                shader: ProcessShader::Custom {
                    source: String::new(),
                    entry_point: "main".to_string(),
                },
                userdata_count: 2,
                capabilities: ShaderCapabilities::default(),
            },
        );

        let binding = library.binding(id).expect("registered");
        assert!(!binding.valid);
        assert!(binding.pipeline.is_none());
        // Shape information survives for buffer sizing decisions
        assert_eq!(binding.userdata_count, 2);
    }

    #[test]
    fn test_unknown_material_has_no_binding() {
        let library = MaterialLibrary::new();
        assert!(library.binding(MaterialId(99)).is_none());
    }
}
