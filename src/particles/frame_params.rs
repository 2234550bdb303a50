//! Per-step frame parameter block uploaded before every simulate dispatch.
//!
//! Layout is shared with `shaders/compute/particles_simulate.wgsl`; the
//! size asserts at the bottom hold both sides together. With trails enabled
//! the frame params buffer holds one block per trail step, downsampled from
//! the frame history ring.

use bytemuck::{Pod, Zeroable};
use glam::Mat4;
use static_assertions::const_assert_eq;

use crate::constants::influencer_limits::{MAX_ATTRACTORS, MAX_COLLIDERS};

/// Attractor shape selector, mirrored in the simulate kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum AttractorKind {
    Sphere = 0,
    Box = 1,
    VectorField = 2,
}

/// Collider shape selector, mirrored in the simulate kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ColliderKind {
    Sphere = 0,
    Box = 1,
    Sdf3d = 2,
    Heightfield = 3,
    Sdf2d = 4,
}

/// One attractor slot in the frame parameter block.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct Attractor {
    /// Inverse-ish transform: world to attractor space, column major.
    pub transform: [f32; 16],
    /// Half extents, or radius in x for spheres.
    pub extents: [f32; 3],
    /// [`AttractorKind`] as u32.
    pub kind: u32,
    /// Vector field 3D texture slot.
    pub texture_index: u32,
    pub strength: f32,
    pub attenuation: f32,
    /// 0 pulls toward the center, 1 pushes along the attractor's -Z.
    pub directionality: f32,
}

/// One collider slot in the frame parameter block.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct Collider {
    /// World to collider space, column major.
    pub transform: [f32; 16],
    /// Half extents, or radius in x for spheres.
    pub extents: [f32; 3],
    /// [`ColliderKind`] as u32.
    pub kind: u32,
    /// Heightfield or SDF texture slot.
    pub texture_index: u32,
    /// Mean basis scale, applied to radii.
    pub scale: f32,
    pub pad: [u32; 2],
}

/// Everything one simulation step reads besides the particle buffer itself.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct FrameParams {
    /// Nonzero while the system emits.
    pub emitting: u32,
    /// Phase after this step, in [0, 1).
    pub system_phase: f32,
    /// Phase before this step.
    pub prev_system_phase: f32,
    /// Completed phase wraps since the last clear.
    pub cycle: u32,

    pub explosiveness: f32,
    pub randomness: f32,
    /// Wall-clock seconds, wrapped.
    pub time: f32,
    /// Step delta, speed scale applied.
    pub delta: f32,

    /// Monotonic step counter.
    pub frame: u32,
    pub pad0: u32,
    pub pad1: u32,
    pub pad2: u32,

    /// Redrawn on every clear.
    pub random_seed: u32,
    pub attractor_count: u32,
    pub collider_count: u32,
    /// Particle radius the colliders see.
    pub particle_size: f32,

    /// Column major; identity when the system simulates in local space.
    pub emission_transform: [f32; 16],

    pub attractors: [Attractor; MAX_ATTRACTORS],
    pub colliders: [Collider; MAX_COLLIDERS],
}

impl Default for FrameParams {
    fn default() -> Self {
        let mut params = Self::zeroed();
        params.emission_transform = Mat4::IDENTITY.to_cols_array();
        params
    }
}

impl FrameParams {
    pub fn set_emission_transform(&mut self, transform: &Mat4) {
        self.emission_transform = transform.to_cols_array();
    }
}

const_assert_eq!(std::mem::size_of::<Attractor>(), 96);
const_assert_eq!(std::mem::size_of::<Collider>(), 96);
const_assert_eq!(
    std::mem::size_of::<FrameParams>(),
    128 + 96 * (MAX_ATTRACTORS + MAX_COLLIDERS)
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_has_identity_emission_transform() {
        let params = FrameParams::default();
        assert_eq!(params.emission_transform, Mat4::IDENTITY.to_cols_array());
        assert_eq!(params.attractor_count, 0);
        assert_eq!(params.collider_count, 0);
    }

    #[test]
    fn test_block_is_tightly_packed() {
        // 128-byte header, then the two influencer tables.
        assert_eq!(std::mem::size_of::<FrameParams>(), 6272);
        assert_eq!(std::mem::align_of::<FrameParams>(), 4);
    }
}
