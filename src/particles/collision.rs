//! Collision and attractor field definitions plus their placed instances.
//!
//! Definitions describe reusable shapes; instances place a definition in the
//! world with a transform and an active flag. The two live in separate
//! handle spaces and an instance may outlive its definition, which the
//! per-step gather reports and skips.

use glam::{Mat4, Vec3};
use serde::{Deserialize, Serialize};

use crate::aabb::Aabb;
use crate::arena::Handle;
use crate::dependency::DependencyTracker;
use crate::gpu::{FramebufferId, TextureId};
use crate::particles::frame_params::{AttractorKind, ColliderKind};

/// Shape and role of a collision definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CollisionType {
    SphereAttract,
    BoxAttract,
    VectorFieldAttract,
    SphereCollide,
    BoxCollide,
    SdfCollide,
    HeightfieldCollide,
}

impl CollisionType {
    pub fn is_attractor(&self) -> bool {
        matches!(
            self,
            CollisionType::SphereAttract
                | CollisionType::BoxAttract
                | CollisionType::VectorFieldAttract
        )
    }

    /// Attractor table slot kind, `None` for colliders.
    pub fn attractor_kind(&self) -> Option<AttractorKind> {
        match self {
            CollisionType::SphereAttract => Some(AttractorKind::Sphere),
            CollisionType::BoxAttract => Some(AttractorKind::Box),
            CollisionType::VectorFieldAttract => Some(AttractorKind::VectorField),
            _ => None,
        }
    }

    /// Collider table slot kind, `None` for attractors.
    pub fn collider_kind(&self) -> Option<ColliderKind> {
        match self {
            CollisionType::SphereCollide => Some(ColliderKind::Sphere),
            CollisionType::BoxCollide => Some(ColliderKind::Box),
            CollisionType::SdfCollide => Some(ColliderKind::Sdf3d),
            CollisionType::HeightfieldCollide => Some(ColliderKind::Heightfield),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            CollisionType::SphereAttract => "sphere_attract",
            CollisionType::BoxAttract => "box_attract",
            CollisionType::VectorFieldAttract => "vector_field_attract",
            CollisionType::SphereCollide => "sphere_collide",
            CollisionType::BoxCollide => "box_collide",
            CollisionType::SdfCollide => "sdf_collide",
            CollisionType::HeightfieldCollide => "heightfield_collide",
        }
    }
}

/// Capture resolution of a heightfield collider's longest horizontal axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum HeightfieldResolution {
    R256,
    R512,
    #[default]
    R1024,
    R2048,
    R4096,
    R8192,
}

impl HeightfieldResolution {
    pub fn pixels(&self) -> u32 {
        match self {
            HeightfieldResolution::R256 => 256,
            HeightfieldResolution::R512 => 512,
            HeightfieldResolution::R1024 => 1024,
            HeightfieldResolution::R2048 => 2048,
            HeightfieldResolution::R4096 => 4096,
            HeightfieldResolution::R8192 => 8192,
        }
    }
}

/// Depth target size for a heightfield with the given extents: configured
/// resolution on the longer of x/z, the other axis scaled by aspect.
pub fn heightfield_size(extents: Vec3, resolution: HeightfieldResolution) -> (u32, u32) {
    let pixels = resolution.pixels();
    if extents.x > extents.z {
        let height = ((extents.z / extents.x * pixels as f32) as u32).max(1);
        (pixels, height)
    } else {
        let width = ((extents.x / extents.z * pixels as f32) as u32).max(1);
        (width, pixels)
    }
}

/// Reusable collision or attractor shape.
pub struct ParticleCollision {
    pub collision_type: CollisionType,
    /// Carried for the scene layer's visibility culling; the per-step
    /// gather does not consult it.
    pub cull_mask: u32,
    pub radius: f32,
    pub extents: Vec3,
    pub attractor_strength: f32,
    pub attractor_attenuation: f32,
    pub attractor_directionality: f32,
    /// 3D vector field or SDF texture supplied by the caller.
    pub field_texture: Option<TextureId>,
    pub heightfield_texture: Option<TextureId>,
    pub heightfield_framebuffer: Option<FramebufferId>,
    pub heightfield_size: (u32, u32),
    pub heightfield_resolution: HeightfieldResolution,
    pub dependency: DependencyTracker,
}

impl ParticleCollision {
    pub fn new() -> Self {
        Self {
            collision_type: CollisionType::SphereAttract,
            cull_mask: 0xFFFF_FFFF,
            radius: 1.0,
            extents: Vec3::ONE,
            attractor_strength: 1.0,
            attractor_attenuation: 1.0,
            attractor_directionality: 0.0,
            field_texture: None,
            heightfield_texture: None,
            heightfield_framebuffer: None,
            heightfield_size: (0, 0),
            heightfield_resolution: HeightfieldResolution::default(),
            dependency: DependencyTracker::new(),
        }
    }

    pub fn is_heightfield(&self) -> bool {
        self.collision_type == CollisionType::HeightfieldCollide
    }

    /// Local-space bounds: radius cube for spheres, extents box otherwise.
    pub fn aabb(&self) -> Aabb {
        match self.collision_type {
            CollisionType::SphereAttract | CollisionType::SphereCollide => {
                Aabb::from_center_half_extents(Vec3::ZERO, Vec3::splat(self.radius))
            }
            _ => Aabb::from_center_half_extents(Vec3::ZERO, self.extents),
        }
    }
}

impl Default for ParticleCollision {
    fn default() -> Self {
        Self::new()
    }
}

/// A collision definition placed in the world.
pub struct CollisionInstance {
    pub collision: Handle<ParticleCollision>,
    pub transform: Mat4,
    /// Inactive instances are ignored by the gather; the scene layer flips
    /// this with visibility.
    pub active: bool,
}

impl CollisionInstance {
    pub fn new(collision: Handle<ParticleCollision>) -> Self {
        Self {
            collision,
            transform: Mat4::IDENTITY,
            active: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aabb_by_shape() {
        let mut def = ParticleCollision::new();
        def.collision_type = CollisionType::SphereCollide;
        def.radius = 2.0;
        assert_eq!(def.aabb().size(), Vec3::splat(4.0));

        def.collision_type = CollisionType::BoxCollide;
        def.extents = Vec3::new(1.0, 2.0, 3.0);
        assert_eq!(def.aabb().size(), Vec3::new(2.0, 4.0, 6.0));
    }

    #[test]
    fn test_heightfield_size_follows_aspect() {
        // Wide field: full resolution on x, z scaled down
        let size = heightfield_size(Vec3::new(10.0, 1.0, 5.0), HeightfieldResolution::R1024);
        assert_eq!(size, (1024, 512));

        // Deep field: full resolution on z
        let size = heightfield_size(Vec3::new(5.0, 1.0, 10.0), HeightfieldResolution::R256);
        assert_eq!(size, (128, 256));

        // Degenerate extents still give at least one texel
        let size = heightfield_size(Vec3::new(10.0, 1.0, 0.0), HeightfieldResolution::R256);
        assert_eq!(size, (256, 1));
    }

    #[test]
    fn test_kind_mapping_is_exclusive() {
        for ty in [
            CollisionType::SphereAttract,
            CollisionType::BoxAttract,
            CollisionType::VectorFieldAttract,
            CollisionType::SphereCollide,
            CollisionType::BoxCollide,
            CollisionType::SdfCollide,
            CollisionType::HeightfieldCollide,
        ] {
            assert_ne!(ty.attractor_kind().is_some(), ty.collider_kind().is_some());
            assert_eq!(ty.is_attractor(), ty.attractor_kind().is_some());
        }
    }
}
