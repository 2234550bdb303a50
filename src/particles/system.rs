//! Per-emitter state owned by the particles registry.

use glam::{Mat4, Vec3, Vec4};
use serde::{Deserialize, Serialize};

use crate::aabb::Aabb;
use crate::arena::Handle;
use crate::constants::{
    simulation::DEFAULT_FIXED_FPS, DEFAULT_COLLISION_BASE_SIZE, INSTANCE_BASE_FLOATS,
    INSTANCE_XFORM_ROWS_2D, INSTANCE_XFORM_ROWS_3D,
};
use crate::dependency::DependencyTracker;
use crate::gpu::{BufferId, PipelineId, TextureId, UniformSetId};
use crate::particles::collision::CollisionInstance;
use crate::particles::frame_params::FrameParams;
use crate::particles::material::MaterialId;
use crate::particles::particle::EmissionBuffer;

/// Simulation space of a system. Picked at initialization, fixed for the
/// handle's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParticleMode {
    Mode2D,
    Mode3D,
}

/// Instance ordering the copy pass writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DrawOrder {
    #[default]
    Index,
    Lifetime,
    ReverseLifetime,
    ViewDepth,
}

/// Per-instance transform alignment applied by the copy pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TransformAlign {
    #[default]
    Disabled,
    ZBillboard,
    YToVelocity,
    ZBillboardYToVelocity,
}

/// Opaque mesh reference carried for the scene layer; one per draw pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MeshId(pub u64);

/// Full state of one particle system.
///
/// Configuration setters live on the storage so reallocation and change
/// notification stay in one place; this struct is data plus a few derived
/// sizing helpers.
pub struct ParticleSystem {
    pub mode: ParticleMode,

    // Emission configuration
    pub emitting: bool,
    pub one_shot: bool,
    pub amount: u32,
    /// Seconds a particle lives. Never zero.
    pub lifetime: f64,
    pub pre_process_time: f64,
    pub explosiveness: f32,
    pub randomness: f32,
    pub speed_scale: f64,
    pub use_local_coords: bool,
    pub fixed_fps: u32,
    /// Feeds the copy pass remainder term, not the stepping loop.
    pub interpolate: bool,
    /// Kernel-side partial first step for mid-step spawns.
    pub fractional_delta: bool,
    pub collision_base_size: f32,

    // Presentation configuration
    pub custom_aabb: Aabb,
    pub draw_order: DrawOrder,
    pub transform_align: TransformAlign,
    pub draw_passes: Vec<Option<MeshId>>,
    /// Sort direction for view-depth ordering.
    pub view_axis: Vec3,
    pub align_up: Vec3,

    pub process_material: Option<MaterialId>,
    pub sub_emitter: Option<Handle<ParticleSystem>>,

    // Runtime clock
    pub inactive: bool,
    pub inactive_time: f64,
    pub phase: f64,
    pub prev_phase: f64,
    pub cycle_number: u32,
    pub frame_counter: u32,
    pub random_seed: u32,
    pub frame_remainder: f64,
    /// Next processed step wipes the particle buffer.
    pub clear: bool,
    pub restart_request: bool,
    /// Set by a parent system; keeps sub-emission running one extra step.
    pub force_sub_emit: bool,
    pub emission_transform: Mat4,

    // Manual emission
    pub emission_buffer: Option<EmissionBuffer>,
    pub emission_storage_buffer: Option<BufferId>,

    // GPU resources, lazily created on the first processed step
    pub particle_buffer: Option<BufferId>,
    pub frame_params_buffer: Option<BufferId>,
    pub instance_buffer: Option<BufferId>,
    pub sort_buffer: Option<BufferId>,
    pub trail_bind_pose_buffer: Option<BufferId>,
    /// Userdata channels the live buffers were sized for.
    pub userdata_count: u32,
    pub simulate_base_set: Option<UniformSetId>,
    pub collision_textures_set: Option<UniformSetId>,
    pub copy_base_set: Option<UniformSetId>,
    /// Heightfield bound into the collision set, to detect rebinds.
    pub bound_heightfield: Option<TextureId>,
    /// Resources the simulate base set was built against; any change
    /// forces a rebind.
    pub bound_simulate_pipeline: Option<PipelineId>,
    pub bound_emission_buffer: Option<BufferId>,
    pub bound_sub_emission_buffer: Option<BufferId>,

    // Trails
    pub trails_enabled: bool,
    pub trail_lifetime: f64,
    pub trail_bind_poses: Vec<Mat4>,
    pub trail_bind_poses_dirty: bool,
    /// Per-step history ring, slot 0 is the current step.
    pub frame_history: Vec<FrameParams>,
    /// Downsampled blocks uploaded to the frame params buffer.
    pub trail_params: Vec<FrameParams>,

    // Collision
    pub collisions: Vec<Handle<CollisionInstance>>,
    pub sdf_collision_enabled: bool,
    pub sdf_collision_transform: Mat4,
    pub sdf_collision_to_screen: Vec4,
    pub sdf_collision_texture: Option<TextureId>,

    pub in_worklist: bool,
    pub dirty: bool,
    pub dependency: DependencyTracker,
}

impl ParticleSystem {
    pub fn new(mode: ParticleMode) -> Self {
        Self {
            mode,
            emitting: false,
            one_shot: false,
            amount: 0,
            lifetime: 1.0,
            pre_process_time: 0.0,
            explosiveness: 0.0,
            randomness: 0.0,
            speed_scale: 1.0,
            use_local_coords: true,
            fixed_fps: DEFAULT_FIXED_FPS,
            interpolate: true,
            fractional_delta: false,
            collision_base_size: DEFAULT_COLLISION_BASE_SIZE,
            custom_aabb: Aabb::new(Vec3::splat(-4.0), Vec3::splat(4.0)),
            draw_order: DrawOrder::default(),
            transform_align: TransformAlign::default(),
            draw_passes: Vec::new(),
            view_axis: Vec3::NEG_Z,
            align_up: Vec3::Y,
            process_material: None,
            sub_emitter: None,
            inactive: true,
            inactive_time: 0.0,
            phase: 0.0,
            prev_phase: 0.0,
            cycle_number: 0,
            frame_counter: 0,
            random_seed: 0,
            frame_remainder: 0.0,
            clear: true,
            restart_request: false,
            force_sub_emit: false,
            emission_transform: Mat4::IDENTITY,
            emission_buffer: None,
            emission_storage_buffer: None,
            particle_buffer: None,
            frame_params_buffer: None,
            instance_buffer: None,
            sort_buffer: None,
            trail_bind_pose_buffer: None,
            userdata_count: 0,
            simulate_base_set: None,
            collision_textures_set: None,
            copy_base_set: None,
            bound_heightfield: None,
            bound_simulate_pipeline: None,
            bound_emission_buffer: None,
            bound_sub_emission_buffer: None,
            trails_enabled: false,
            trail_lifetime: 0.3,
            trail_bind_poses: Vec::new(),
            trail_bind_poses_dirty: false,
            frame_history: Vec::new(),
            trail_params: Vec::new(),
            collisions: Vec::new(),
            sdf_collision_enabled: false,
            sdf_collision_transform: Mat4::IDENTITY,
            sdf_collision_to_screen: Vec4::ZERO,
            sdf_collision_texture: None,
            in_worklist: false,
            dirty: false,
            dependency: DependencyTracker::new(),
        }
    }

    /// True when trails actually multiply the particle count.
    pub fn uses_trails(&self) -> bool {
        self.trails_enabled && self.trail_bind_poses.len() > 1
    }

    /// Slots each logical particle occupies in the particle buffer.
    pub fn trail_divisor(&self) -> u32 {
        if self.uses_trails() {
            self.trail_bind_poses.len() as u32
        } else {
            1
        }
    }

    /// Allocated particle slots, trails included.
    pub fn total_amount(&self) -> u32 {
        self.amount * self.trail_divisor()
    }

    /// Transform rows the copy pass writes per instance.
    pub fn xform_rows(&self) -> u32 {
        match self.mode {
            ParticleMode::Mode2D => INSTANCE_XFORM_ROWS_2D,
            ParticleMode::Mode3D => INSTANCE_XFORM_ROWS_3D,
        }
    }

    /// Floats per instance slot.
    pub fn instance_stride_floats(&self) -> u32 {
        INSTANCE_BASE_FLOATS + self.xform_rows() * 4
    }

    /// Steps the frame history ring holds for the current trail setup.
    pub fn history_size(&self) -> u32 {
        if self.uses_trails() {
            ((self.trail_lifetime * self.fixed_fps as f64) as u32).max(1)
        } else {
            1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let system = ParticleSystem::new(ParticleMode::Mode3D);
        assert!(!system.emitting);
        assert!(system.inactive);
        assert!(system.clear);
        assert_eq!(system.amount, 0);
        assert_eq!(system.lifetime, 1.0);
        assert_eq!(system.fixed_fps, DEFAULT_FIXED_FPS);
        assert_eq!(system.custom_aabb.size(), Vec3::splat(8.0));
    }

    #[test]
    fn test_trail_divisor_requires_multiple_poses() {
        let mut system = ParticleSystem::new(ParticleMode::Mode3D);
        system.amount = 10;
        assert_eq!(system.trail_divisor(), 1);

        system.trails_enabled = true;
        system.trail_bind_poses = vec![Mat4::IDENTITY];
        assert_eq!(system.trail_divisor(), 1);

        system.trail_bind_poses = vec![Mat4::IDENTITY; 4];
        assert_eq!(system.trail_divisor(), 4);
        assert_eq!(system.total_amount(), 40);
    }

    #[test]
    fn test_history_size_tracks_fixed_fps() {
        let mut system = ParticleSystem::new(ParticleMode::Mode3D);
        system.trails_enabled = true;
        system.trail_bind_poses = vec![Mat4::IDENTITY; 2];
        system.trail_lifetime = 0.5;
        system.fixed_fps = 30;
        assert_eq!(system.history_size(), 15);

        system.fixed_fps = 0;
        assert_eq!(system.history_size(), 1);

        // Without trails the ring stays at one step.
        system.trails_enabled = false;
        system.fixed_fps = 30;
        assert_eq!(system.history_size(), 1);
    }

    #[test]
    fn test_instance_stride_by_mode() {
        let flat = ParticleSystem::new(ParticleMode::Mode2D);
        let spatial = ParticleSystem::new(ParticleMode::Mode3D);
        assert_eq!(flat.instance_stride_floats(), 12);
        assert_eq!(spatial.instance_stride_floats(), 16);
    }
}
