//! GPU particle simulation storage.
//!
//! [`storage::ParticleStorage`] owns every system, collision definition and
//! collision instance by generational handle and drives the per-frame
//! simulate and copy dispatches through a [`crate::gpu::DeviceInterface`].

pub mod collision;
pub mod frame_params;
pub mod material;
pub mod particle;
pub mod storage;
pub mod system;

pub use collision::{
    heightfield_size, CollisionInstance, CollisionType, HeightfieldResolution, ParticleCollision,
};
pub use frame_params::{Attractor, AttractorKind, Collider, ColliderKind, FrameParams};
pub use material::{
    MaterialBinding, MaterialId, MaterialLibrary, ProcessMaterialSpec, ProcessShader,
    ShaderCapabilities,
};
pub use particle::{
    emission_buffer_bytes, emission_flags, particle_flags, particle_stride_bytes, EmissionBuffer,
    EmissionBufferHeader, EmissionRecord, ParticleGpuData,
};
pub use storage::ParticleStorage;
pub use system::{DrawOrder, MeshId, ParticleMode, ParticleSystem, TransformAlign};
