//! The particle storage manager.
//!
//! Owns every particle system, collision definition and collision instance
//! by handle, drives the pending-update worklist, and issues the simulate
//! and copy dispatches through the injected device. Scene-level particle
//! nodes consume this API; they never touch the device directly.
//!
//! The manager is single-threaded cooperative: the frame loop calls
//! [`ParticleStorage::update_particles`] at most once per frame, and every
//! mutation happens on that same thread. Simulation dispatches are
//! submitted asynchronously and consumed by later render stages behind the
//! device's queue ordering.

use std::mem;

use bytemuck::{bytes_of, cast_slice, Pod, Zeroable};
use glam::{Mat4, Vec3, Vec4};
use static_assertions::const_assert_eq;

use crate::aabb::Aabb;
use crate::arena::{Handle, HandleArena};
use crate::constants::{
    influencer_limits::{MAX_3D_TEXTURES, MAX_ATTRACTORS, MAX_COLLIDERS},
    simulation::{
        FALLBACK_FRAME_TIME, INACTIVE_LIFETIME_FACTOR, MAX_FRAME_DELTA, MIN_FRAME_DELTA,
        TIME_WRAP_SECONDS,
    },
    MAX_USERDATAS, SORT_BUFFER_FLOATS,
};
use crate::dependency::{ChangeKind, SubscriptionId};
use crate::error::{ParticlesError, ParticlesResult};
use crate::gpu::{
    dispatch_group_count, BufferId, ComputeDispatch, ComputePipelineSpec, DeviceInterface,
    PipelineId, TextureId, UniformBinding, UniformSetId,
};
use crate::particles::collision::{
    heightfield_size, CollisionInstance, CollisionType, HeightfieldResolution, ParticleCollision,
};
use crate::particles::frame_params::{ColliderKind, FrameParams};
use crate::particles::material::{MaterialId, MaterialLibrary, ProcessMaterialSpec};
use crate::particles::particle::{
    emission_buffer_bytes, particle_flags, particle_stride_bytes, EmissionBuffer,
    EmissionBufferHeader, EmissionRecord,
};
use crate::particles::system::{
    DrawOrder, MeshId, ParticleMode, ParticleSystem, TransformAlign,
};

const SIMULATE_SOURCE: &str = include_str!("../shaders/compute/particles_simulate.wgsl");
const COPY_SOURCE: &str = include_str!("../shaders/compute/particles_copy.wgsl");

/// Per-dispatch parameter block of the simulate kernel.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Pod, Zeroable)]
struct SimulatePushConstants {
    lifetime: f32,
    clear: u32,
    total_particles: u32,
    trail_size: u32,

    use_fractional_delta: u32,
    sub_emitter_mode: u32,
    can_emit: u32,
    trail_pass: u32,

    userdata_count: u32,
    pad0: u32,
    pad1: u32,
    pad2: u32,
}

/// Per-dispatch parameter block of the copy kernel.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
struct CopyPushConstants {
    sort_direction: [f32; 3],
    total_particles: u32,

    trail_size: u32,
    trail_total: u32,
    frame_delta: f32,
    frame_remainder: f32,

    align_up: [f32; 3],
    align_mode: u32,

    order_by_lifetime: u32,
    lifetime_split: u32,
    lifetime_reverse: u32,
    copy_mode_2d: u32,

    inv_emission_transform: [f32; 16],

    copy_mode: u32,
    userdata_count: u32,
    pad0: u32,
    pad1: u32,
}

const_assert_eq!(mem::size_of::<SimulatePushConstants>(), 48);
const_assert_eq!(mem::size_of::<CopyPushConstants>(), 144);

/// Instance-fill variants of the copy kernel.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CopyMode {
    FillInstances = 0,
    FillSortBuffer = 1,
    FillInstancesIndexed = 2,
}

/// Handle-indexed ownership of particle systems and collision objects plus
/// the simulation step driver.
pub struct ParticleStorage<D: DeviceInterface> {
    device: D,
    particles: HandleArena<ParticleSystem>,
    collisions: HandleArena<ParticleCollision>,
    collision_instances: HandleArena<CollisionInstance>,
    materials: MaterialLibrary,
    worklist: Vec<Handle<ParticleSystem>>,
    pending_heightfield_updates: Vec<Handle<ParticleCollision>>,

    simulate_pipeline: PipelineId,
    copy_pipeline: PipelineId,
    default_material: MaterialId,

    /// Header-only emission buffer bound wherever a system has no real one.
    empty_emission_buffer: BufferId,
    dummy_sort_buffer: BufferId,
    dummy_pose_buffer: BufferId,

    /// Wall-clock accumulator fed to the kernels, wrapped.
    time: f64,
}

impl<D: DeviceInterface> ParticleStorage<D> {
    /// Build the storage over an injected device. Compiles both built-in
    /// kernels; a rejected kernel aborts construction.
    pub fn new(mut device: D) -> ParticlesResult<Self> {
        let simulate_pipeline = device.compute_pipeline_create(&ComputePipelineSpec {
            label: "particles_simulate",
            source: SIMULATE_SOURCE,
            entry_point: "main",
            push_params_size: mem::size_of::<SimulatePushConstants>() as u32,
            push_params_group: 1,
        })?;
        let copy_pipeline = device.compute_pipeline_create(&ComputePipelineSpec {
            label: "particles_copy",
            source: COPY_SOURCE,
            entry_point: "main",
            push_params_size: mem::size_of::<CopyPushConstants>() as u32,
            push_params_group: 1,
        })?;

        let empty_header = EmissionBufferHeader::default();
        let empty_emission_buffer = device.storage_buffer_create(
            mem::size_of::<EmissionBufferHeader>() as u64,
            Some(bytes_of(&empty_header)),
            "particles empty emission",
        )?;
        let dummy_sort_buffer =
            device.storage_buffer_create(16, None, "particles dummy sort")?;
        let dummy_pose_buffer = device.storage_buffer_create(
            64,
            Some(cast_slice(&[Mat4::IDENTITY])),
            "particles dummy pose",
        )?;

        let mut materials = MaterialLibrary::new();
        let default_material = materials.register(
            &mut device,
            simulate_pipeline,
            mem::size_of::<SimulatePushConstants>() as u32,
            &ProcessMaterialSpec::builtin("particles_default"),
        );

        log::info!(
            "[ParticleStorage] ready on {} backend",
            device.backend_type()
        );
        Ok(Self {
            device,
            particles: HandleArena::new(),
            collisions: HandleArena::new(),
            collision_instances: HandleArena::new(),
            materials,
            worklist: Vec::new(),
            pending_heightfield_updates: Vec::new(),
            simulate_pipeline,
            copy_pipeline,
            default_material,
            empty_emission_buffer,
            dummy_sort_buffer,
            dummy_pose_buffer,
            time: 0.0,
        })
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    pub fn materials_mut(&mut self) -> &mut MaterialLibrary {
        &mut self.materials
    }

    /// Register a process material against the built-in simulate interface.
    pub fn register_process_material(&mut self, spec: &ProcessMaterialSpec) -> MaterialId {
        self.materials.register(
            &mut self.device,
            self.simulate_pipeline,
            mem::size_of::<SimulatePushConstants>() as u32,
            spec,
        )
    }

    /* Lookup helpers. Misses are recoverable: logged, then reported. */

    fn system(&self, handle: Handle<ParticleSystem>) -> ParticlesResult<&ParticleSystem> {
        self.particles.get(handle).ok_or_else(|| {
            log::error!("[ParticleStorage] unknown particles handle {:?}", handle);
            ParticlesError::InvalidParticles {
                index: handle.index(),
                generation: handle.generation(),
            }
        })
    }

    fn system_mut(
        &mut self,
        handle: Handle<ParticleSystem>,
    ) -> ParticlesResult<&mut ParticleSystem> {
        self.particles.get_mut(handle).ok_or_else(|| {
            log::error!("[ParticleStorage] unknown particles handle {:?}", handle);
            ParticlesError::InvalidParticles {
                index: handle.index(),
                generation: handle.generation(),
            }
        })
    }

    fn collision(
        &self,
        handle: Handle<ParticleCollision>,
    ) -> ParticlesResult<&ParticleCollision> {
        self.collisions.get(handle).ok_or_else(|| {
            log::error!("[ParticleStorage] unknown collision handle {:?}", handle);
            ParticlesError::InvalidCollision {
                index: handle.index(),
                generation: handle.generation(),
            }
        })
    }

    fn collision_mut(
        &mut self,
        handle: Handle<ParticleCollision>,
    ) -> ParticlesResult<&mut ParticleCollision> {
        self.collisions.get_mut(handle).ok_or_else(|| {
            log::error!("[ParticleStorage] unknown collision handle {:?}", handle);
            ParticlesError::InvalidCollision {
                index: handle.index(),
                generation: handle.generation(),
            }
        })
    }

    fn collision_instance_mut(
        &mut self,
        handle: Handle<CollisionInstance>,
    ) -> ParticlesResult<&mut CollisionInstance> {
        self.collision_instances.get_mut(handle).ok_or_else(|| {
            log::error!(
                "[ParticleStorage] unknown collision instance handle {:?}",
                handle
            );
            ParticlesError::InvalidCollisionInstance {
                index: handle.index(),
                generation: handle.generation(),
            }
        })
    }

    /* Particle system lifecycle. */

    /// Reserve a handle. The slot holds no state until
    /// [`Self::particles_initialize`] runs.
    pub fn particles_allocate(&mut self) -> Handle<ParticleSystem> {
        self.particles.allocate()
    }

    /// Fill a reserved handle with default-constructed state.
    pub fn particles_initialize(
        &mut self,
        handle: Handle<ParticleSystem>,
    ) -> ParticlesResult<()> {
        if self
            .particles
            .initialize(handle, ParticleSystem::new(ParticleMode::Mode3D))
        {
            Ok(())
        } else if self.particles.contains(handle) {
            log::error!(
                "[ParticleStorage] particles handle {:?} initialized twice",
                handle
            );
            Err(ParticlesError::NotInitialized {
                index: handle.index(),
            })
        } else {
            Err(ParticlesError::InvalidParticles {
                index: handle.index(),
                generation: handle.generation(),
            })
        }
    }

    /// Release every device resource and invalidate the handle.
    pub fn particles_free(&mut self, handle: Handle<ParticleSystem>) -> ParticlesResult<()> {
        if !self.particles.contains(handle) {
            return Err(ParticlesError::InvalidParticles {
                index: handle.index(),
                generation: handle.generation(),
            });
        }
        {
            // Reserved-but-uninitialized slots have nothing to release.
            let this = &mut *self;
            if let Some(system) = this.particles.get_mut(handle) {
                Self::free_system_resources(&mut this.device, system);
                system.dependency.notify_deleted();
            }
        }
        self.worklist.retain(|entry| *entry != handle);
        self.particles.free(handle);
        Ok(())
    }

    /// Free the GPU side of a system; buffers come back lazily on the next
    /// processed step.
    fn free_system_resources(device: &mut D, system: &mut ParticleSystem) {
        for set in [
            system.simulate_base_set.take(),
            system.collision_textures_set.take(),
            system.copy_base_set.take(),
        ]
        .into_iter()
        .flatten()
        {
            device.uniform_set_free(set);
        }
        for buffer in [
            system.particle_buffer.take(),
            system.frame_params_buffer.take(),
            system.instance_buffer.take(),
            system.sort_buffer.take(),
            system.trail_bind_pose_buffer.take(),
            system.emission_storage_buffer.take(),
        ]
        .into_iter()
        .flatten()
        {
            device.buffer_free(buffer);
        }
        system.bound_heightfield = None;
        system.bound_simulate_pipeline = None;
        system.bound_emission_buffer = None;
        system.bound_sub_emission_buffer = None;
        system.frame_history.clear();
        system.trail_params.clear();
        system.clear = true;
    }

    /* Configuration. Reallocation is deferred to the next processed step. */

    pub fn particles_set_mode(
        &mut self,
        handle: Handle<ParticleSystem>,
        mode: ParticleMode,
    ) -> ParticlesResult<()> {
        let this = &mut *self;
        let system = this.particles.get_mut(handle).ok_or({
            ParticlesError::InvalidParticles {
                index: handle.index(),
                generation: handle.generation(),
            }
        })?;
        if system.mode == mode {
            return Ok(());
        }
        Self::free_system_resources(&mut this.device, system);
        system.mode = mode;
        system.dependency.notify(ChangeKind::Buffers);
        Ok(())
    }

    pub fn particles_set_emitting(
        &mut self,
        handle: Handle<ParticleSystem>,
        emitting: bool,
    ) -> ParticlesResult<()> {
        let system = self.system_mut(handle)?;
        system.emitting = emitting;
        if emitting {
            system.inactive = false;
            system.inactive_time = 0.0;
            self.particles_request_process(handle)?;
        }
        Ok(())
    }

    pub fn particles_get_emitting(&self, handle: Handle<ParticleSystem>) -> ParticlesResult<bool> {
        Ok(self.system(handle)?.emitting)
    }

    pub fn particles_set_amount(
        &mut self,
        handle: Handle<ParticleSystem>,
        amount: u32,
    ) -> ParticlesResult<()> {
        let this = &mut *self;
        let system = this.particles.get_mut(handle).ok_or({
            ParticlesError::InvalidParticles {
                index: handle.index(),
                generation: handle.generation(),
            }
        })?;
        if system.amount == amount {
            return Ok(());
        }
        Self::free_system_resources(&mut this.device, system);
        // Capacity follows amount; pending manual emissions are discarded
        // with the buffer.
        system.emission_buffer = None;
        system.amount = amount;
        system.dirty = true;
        system.dependency.notify(ChangeKind::Buffers);
        Ok(())
    }

    pub fn particles_set_lifetime(
        &mut self,
        handle: Handle<ParticleSystem>,
        lifetime: f64,
    ) -> ParticlesResult<()> {
        if lifetime <= 0.0 {
            return Err(ParticlesError::InvalidParameter {
                name: "lifetime",
                reason: format!("must be positive, got {lifetime}"),
            });
        }
        self.system_mut(handle)?.lifetime = lifetime;
        Ok(())
    }

    pub fn particles_set_one_shot(
        &mut self,
        handle: Handle<ParticleSystem>,
        one_shot: bool,
    ) -> ParticlesResult<()> {
        self.system_mut(handle)?.one_shot = one_shot;
        Ok(())
    }

    pub fn particles_set_pre_process_time(
        &mut self,
        handle: Handle<ParticleSystem>,
        time: f64,
    ) -> ParticlesResult<()> {
        self.system_mut(handle)?.pre_process_time = time.max(0.0);
        Ok(())
    }

    pub fn particles_set_explosiveness_ratio(
        &mut self,
        handle: Handle<ParticleSystem>,
        ratio: f32,
    ) -> ParticlesResult<()> {
        self.system_mut(handle)?.explosiveness = ratio.clamp(0.0, 1.0);
        Ok(())
    }

    pub fn particles_set_randomness_ratio(
        &mut self,
        handle: Handle<ParticleSystem>,
        ratio: f32,
    ) -> ParticlesResult<()> {
        self.system_mut(handle)?.randomness = ratio.clamp(0.0, 1.0);
        Ok(())
    }

    pub fn particles_set_custom_aabb(
        &mut self,
        handle: Handle<ParticleSystem>,
        aabb: Aabb,
    ) -> ParticlesResult<()> {
        let system = self.system_mut(handle)?;
        system.custom_aabb = aabb;
        system.dependency.notify(ChangeKind::Bounds);
        Ok(())
    }

    pub fn particles_set_speed_scale(
        &mut self,
        handle: Handle<ParticleSystem>,
        scale: f64,
    ) -> ParticlesResult<()> {
        self.system_mut(handle)?.speed_scale = scale.max(0.0);
        Ok(())
    }

    pub fn particles_set_use_local_coordinates(
        &mut self,
        handle: Handle<ParticleSystem>,
        enable: bool,
    ) -> ParticlesResult<()> {
        self.system_mut(handle)?.use_local_coords = enable;
        Ok(())
    }

    pub fn particles_set_fixed_fps(
        &mut self,
        handle: Handle<ParticleSystem>,
        fps: u32,
    ) -> ParticlesResult<()> {
        self.system_mut(handle)?.fixed_fps = fps;
        Ok(())
    }

    pub fn particles_set_interpolate(
        &mut self,
        handle: Handle<ParticleSystem>,
        enable: bool,
    ) -> ParticlesResult<()> {
        self.system_mut(handle)?.interpolate = enable;
        Ok(())
    }

    pub fn particles_set_fractional_delta(
        &mut self,
        handle: Handle<ParticleSystem>,
        enable: bool,
    ) -> ParticlesResult<()> {
        self.system_mut(handle)?.fractional_delta = enable;
        Ok(())
    }

    pub fn particles_set_collision_base_size(
        &mut self,
        handle: Handle<ParticleSystem>,
        size: f32,
    ) -> ParticlesResult<()> {
        self.system_mut(handle)?.collision_base_size = size.max(0.0);
        Ok(())
    }

    pub fn particles_set_transform_align(
        &mut self,
        handle: Handle<ParticleSystem>,
        align: TransformAlign,
    ) -> ParticlesResult<()> {
        let this = &mut *self;
        let system = this.particles.get_mut(handle).ok_or({
            ParticlesError::InvalidParticles {
                index: handle.index(),
                generation: handle.generation(),
            }
        })?;
        if system.transform_align == align {
            return Ok(());
        }
        Self::free_system_resources(&mut this.device, system);
        system.transform_align = align;
        system.dirty = true;
        system.dependency.notify(ChangeKind::Buffers);
        Ok(())
    }

    /// Enable or disable trails. `lifetime` is the time span the trail
    /// covers, not a segment count.
    pub fn particles_set_trails(
        &mut self,
        handle: Handle<ParticleSystem>,
        enable: bool,
        lifetime: f64,
    ) -> ParticlesResult<()> {
        let this = &mut *self;
        let system = this.particles.get_mut(handle).ok_or({
            ParticlesError::InvalidParticles {
                index: handle.index(),
                generation: handle.generation(),
            }
        })?;
        let lifetime = lifetime.clamp(0.01, 4.0);
        if system.trails_enabled == enable && system.trail_lifetime == lifetime {
            return Ok(());
        }
        Self::free_system_resources(&mut this.device, system);
        system.trails_enabled = enable;
        system.trail_lifetime = lifetime;
        system.dirty = true;
        system.dependency.notify(ChangeKind::Buffers);
        Ok(())
    }

    pub fn particles_set_trail_bind_poses(
        &mut self,
        handle: Handle<ParticleSystem>,
        poses: Vec<Mat4>,
    ) -> ParticlesResult<()> {
        let this = &mut *self;
        let system = this.particles.get_mut(handle).ok_or({
            ParticlesError::InvalidParticles {
                index: handle.index(),
                generation: handle.generation(),
            }
        })?;
        if system.trail_bind_poses.len() != poses.len() {
            Self::free_system_resources(&mut this.device, system);
            system.dirty = true;
        }
        system.trail_bind_poses = poses;
        system.trail_bind_poses_dirty = true;
        system.dependency.notify(ChangeKind::Buffers);
        Ok(())
    }

    /// Bind a process material. Shape mismatches (userdata count) against
    /// the live buffers resolve by reallocation on the next processed step.
    pub fn particles_set_process_material(
        &mut self,
        handle: Handle<ParticleSystem>,
        material: Option<MaterialId>,
    ) -> ParticlesResult<()> {
        if let Some(id) = material {
            if !self.materials.is_registered(id) {
                return Err(ParticlesError::MaterialNotFound { id: id.0 });
            }
        }
        self.system_mut(handle)?.process_material = material;
        Ok(())
    }

    pub fn particles_get_process_material(
        &self,
        handle: Handle<ParticleSystem>,
    ) -> ParticlesResult<Option<MaterialId>> {
        Ok(self.system(handle)?.process_material)
    }

    /// Route died-particle spawns into another system. Passing `None`
    /// detaches. A system cannot sub-emit into itself.
    pub fn particles_set_subemitter(
        &mut self,
        handle: Handle<ParticleSystem>,
        sub_emitter: Option<Handle<ParticleSystem>>,
    ) -> ParticlesResult<()> {
        if sub_emitter == Some(handle) {
            return Err(ParticlesError::InvalidParameter {
                name: "sub_emitter",
                reason: "a system cannot be its own sub-emitter".to_string(),
            });
        }
        if let Some(sub) = sub_emitter {
            if !self.particles.contains(sub) {
                return Err(ParticlesError::InvalidParticles {
                    index: sub.index(),
                    generation: sub.generation(),
                });
            }
        }
        let system = self.system_mut(handle)?;
        system.sub_emitter = sub_emitter;
        // The base set binds the child's emission buffer; rebind next step.
        system.bound_sub_emission_buffer = None;
        Ok(())
    }

    /// Reset the simulation clock. Takes effect at the start of the next
    /// processed step: phase back to 0, full buffer wipe, fresh seed.
    pub fn particles_restart(&mut self, handle: Handle<ParticleSystem>) -> ParticlesResult<()> {
        {
            let system = self.system_mut(handle)?;
            system.restart_request = true;
            system.inactive = false;
            system.inactive_time = 0.0;
        }
        self.particles_request_process(handle)
    }

    /// Queue one manual emission. Best effort: a full queue drops the
    /// record silently.
    pub fn particles_emit(
        &mut self,
        handle: Handle<ParticleSystem>,
        transform: &Mat4,
        velocity: Vec3,
        color: Vec4,
        custom: Vec4,
        emit_flags: u32,
    ) -> ParticlesResult<()> {
        {
            let system = self.system_mut(handle)?;
            if system.amount == 0 {
                return Ok(());
            }
            let amount = system.amount;
            let buffer = system
                .emission_buffer
                .get_or_insert_with(|| EmissionBuffer::new(amount));
            buffer.push(EmissionRecord::new(transform, velocity, color, custom, emit_flags));
            system.inactive = false;
            system.inactive_time = 0.0;
        }
        self.particles_request_process(handle)
    }

    /// Enqueue for the next [`Self::update_particles`] pass. Idempotent.
    pub fn particles_request_process(
        &mut self,
        handle: Handle<ParticleSystem>,
    ) -> ParticlesResult<()> {
        let system = self.system_mut(handle)?;
        if !system.in_worklist {
            system.in_worklist = true;
            self.worklist.push(handle);
        }
        Ok(())
    }

    pub fn particles_set_emission_transform(
        &mut self,
        handle: Handle<ParticleSystem>,
        transform: Mat4,
    ) -> ParticlesResult<()> {
        self.system_mut(handle)?.emission_transform = transform;
        Ok(())
    }

    /// Optimization hint for the scene layer; never blocks processing.
    pub fn particles_is_inactive(&self, handle: Handle<ParticleSystem>) -> ParticlesResult<bool> {
        Ok(self.system(handle)?.inactive)
    }

    pub fn particles_mode(&self, handle: Handle<ParticleSystem>) -> ParticlesResult<ParticleMode> {
        Ok(self.system(handle)?.mode)
    }

    /// Allocated particle slots and the trail divisor they include.
    pub fn particles_amount(&self, handle: Handle<ParticleSystem>) -> ParticlesResult<(u32, u32)> {
        let system = self.system(handle)?;
        Ok((system.total_amount(), system.trail_divisor()))
    }

    pub fn particles_has_collision(&self, handle: Handle<ParticleSystem>) -> ParticlesResult<bool> {
        let system = self.system(handle)?;
        Ok(!system.collisions.is_empty() || system.sdf_collision_enabled)
    }

    pub fn particles_uses_local_coordinates(
        &self,
        handle: Handle<ParticleSystem>,
    ) -> ParticlesResult<bool> {
        Ok(self.system(handle)?.use_local_coords)
    }

    /* Presentation state carried for the scene layer. */

    pub fn particles_set_draw_order(
        &mut self,
        handle: Handle<ParticleSystem>,
        order: DrawOrder,
    ) -> ParticlesResult<()> {
        self.system_mut(handle)?.draw_order = order;
        Ok(())
    }

    pub fn particles_set_view_axis(
        &mut self,
        handle: Handle<ParticleSystem>,
        axis: Vec3,
        up: Vec3,
    ) -> ParticlesResult<()> {
        let system = self.system_mut(handle)?;
        system.view_axis = axis.normalize_or_zero();
        system.align_up = up.normalize_or_zero();
        Ok(())
    }

    pub fn particles_set_draw_passes(
        &mut self,
        handle: Handle<ParticleSystem>,
        count: usize,
    ) -> ParticlesResult<()> {
        self.system_mut(handle)?.draw_passes.resize(count, None);
        Ok(())
    }

    pub fn particles_set_draw_pass_mesh(
        &mut self,
        handle: Handle<ParticleSystem>,
        pass: usize,
        mesh: Option<MeshId>,
    ) -> ParticlesResult<()> {
        let system = self.system_mut(handle)?;
        let slot = system.draw_passes.get_mut(pass).ok_or_else(|| {
            ParticlesError::InvalidParameter {
                name: "pass",
                reason: format!("pass {pass} out of range"),
            }
        })?;
        *slot = mesh;
        Ok(())
    }

    pub fn particles_get_draw_passes(
        &self,
        handle: Handle<ParticleSystem>,
    ) -> ParticlesResult<usize> {
        Ok(self.system(handle)?.draw_passes.len())
    }

    pub fn particles_get_draw_pass_mesh(
        &self,
        handle: Handle<ParticleSystem>,
        pass: usize,
    ) -> ParticlesResult<Option<MeshId>> {
        let system = self.system(handle)?;
        system
            .draw_passes
            .get(pass)
            .copied()
            .ok_or_else(|| ParticlesError::InvalidParameter {
                name: "pass",
                reason: format!("pass {pass} out of range"),
            })
    }

    /// Custom expand bounds, trails included.
    pub fn particles_get_aabb(&self, handle: Handle<ParticleSystem>) -> ParticlesResult<Aabb> {
        let system = self.system(handle)?;
        let mut aabb = system.custom_aabb;
        for pose in &system.trail_bind_poses {
            aabb = aabb.merge(&system.custom_aabb.transformed(pose));
        }
        Ok(aabb)
    }

    /// Bounds of the live particles, read back from the device. Blocking;
    /// editor and debug paths only.
    pub fn particles_get_current_aabb(
        &mut self,
        handle: Handle<ParticleSystem>,
    ) -> ParticlesResult<Aabb> {
        let this = &mut *self;
        let system = this.particles.get(handle).ok_or({
            ParticlesError::InvalidParticles {
                index: handle.index(),
                generation: handle.generation(),
            }
        })?;
        let Some(buffer) = system.particle_buffer else {
            return Ok(Aabb::ZERO);
        };
        let data = this.device.buffer_get_data(buffer)?;
        let stride = particle_stride_bytes(system.userdata_count) as usize;

        let mut aabb: Option<Aabb> = None;
        for record in data.chunks_exact(stride) {
            // Flags sit after the transform and velocity; the translation
            // is the transform's fourth column.
            let flags = u32::from_le_bytes([record[76], record[77], record[78], record[79]]);
            if flags & particle_flags::ACTIVE == 0 {
                continue;
            }
            let position = Vec3::new(
                f32::from_le_bytes([record[48], record[49], record[50], record[51]]),
                f32::from_le_bytes([record[52], record[53], record[54], record[55]]),
                f32::from_le_bytes([record[56], record[57], record[58], record[59]]),
            );
            match aabb.as_mut() {
                Some(acc) => acc.expand_to(position),
                None => aabb = Some(Aabb::new(position, position)),
            }
        }
        let mut aabb = aabb.unwrap_or(Aabb::ZERO);
        if system.collision_base_size > 0.0 {
            aabb = aabb.grow(system.collision_base_size);
        }
        Ok(aabb)
    }

    /// Instance transform buffer id for the render layer.
    pub fn particles_instance_buffer(
        &self,
        handle: Handle<ParticleSystem>,
    ) -> ParticlesResult<Option<BufferId>> {
        Ok(self.system(handle)?.instance_buffer)
    }

    /// Frame parameter buffer id for the render layer.
    pub fn particles_frame_params_buffer(
        &self,
        handle: Handle<ParticleSystem>,
    ) -> ParticlesResult<Option<BufferId>> {
        Ok(self.system(handle)?.frame_params_buffer)
    }

    /// Sort buffer id, present only for view-depth ordering. The radix
    /// sort between the fill and consume passes runs outside this crate.
    pub fn particles_sort_buffer(
        &self,
        handle: Handle<ParticleSystem>,
    ) -> ParticlesResult<Option<BufferId>> {
        Ok(self.system(handle)?.sort_buffer)
    }

    pub fn particles_subscribe<F>(
        &mut self,
        handle: Handle<ParticleSystem>,
        callback: F,
    ) -> ParticlesResult<SubscriptionId>
    where
        F: FnMut(ChangeKind) + 'static,
    {
        Ok(self.system_mut(handle)?.dependency.subscribe(callback))
    }

    /* Collision references on a system. */

    /// Add a collision instance reference. Idempotent on set membership.
    pub fn particles_add_collision(
        &mut self,
        handle: Handle<ParticleSystem>,
        instance: Handle<CollisionInstance>,
    ) -> ParticlesResult<()> {
        let system = self.system_mut(handle)?;
        if !system.collisions.contains(&instance) {
            system.collisions.push(instance);
        }
        Ok(())
    }

    /// Remove a collision instance reference. Removing a non-member is a
    /// no-op.
    pub fn particles_remove_collision(
        &mut self,
        handle: Handle<ParticleSystem>,
        instance: Handle<CollisionInstance>,
    ) -> ParticlesResult<()> {
        self.system_mut(handle)?
            .collisions
            .retain(|entry| *entry != instance);
        Ok(())
    }

    /// Canvas SDF collision state pushed in by the 2D renderer.
    pub fn particles_set_canvas_sdf_collision(
        &mut self,
        handle: Handle<ParticleSystem>,
        enable: bool,
        transform: Mat4,
        to_screen: Vec4,
        texture: Option<TextureId>,
    ) -> ParticlesResult<()> {
        let system = self.system_mut(handle)?;
        system.sdf_collision_enabled = enable;
        system.sdf_collision_transform = transform;
        system.sdf_collision_to_screen = to_screen;
        system.sdf_collision_texture = texture;
        Ok(())
    }

    /* Collision definitions. */

    pub fn particles_collision_allocate(&mut self) -> Handle<ParticleCollision> {
        self.collisions.allocate()
    }

    pub fn particles_collision_initialize(
        &mut self,
        handle: Handle<ParticleCollision>,
    ) -> ParticlesResult<()> {
        if self.collisions.initialize(handle, ParticleCollision::new()) {
            Ok(())
        } else {
            Err(ParticlesError::InvalidCollision {
                index: handle.index(),
                generation: handle.generation(),
            })
        }
    }

    pub fn particles_collision_free(
        &mut self,
        handle: Handle<ParticleCollision>,
    ) -> ParticlesResult<()> {
        if !self.collisions.contains(handle) {
            return Err(ParticlesError::InvalidCollision {
                index: handle.index(),
                generation: handle.generation(),
            });
        }
        {
            let this = &mut *self;
            if let Some(collision) = this.collisions.get_mut(handle) {
                Self::free_heightfield_target(&mut this.device, collision);
                collision.dependency.notify_deleted();
            }
        }
        self.pending_heightfield_updates.retain(|entry| *entry != handle);
        self.collisions.free(handle);
        Ok(())
    }

    fn free_heightfield_target(device: &mut D, collision: &mut ParticleCollision) {
        if let Some(framebuffer) = collision.heightfield_framebuffer.take() {
            device.framebuffer_free(framebuffer);
        }
        if let Some(texture) = collision.heightfield_texture.take() {
            device.texture_free(texture);
        }
        collision.heightfield_size = (0, 0);
    }

    pub fn particles_collision_set_collision_type(
        &mut self,
        handle: Handle<ParticleCollision>,
        collision_type: CollisionType,
    ) -> ParticlesResult<()> {
        let this = &mut *self;
        let collision = this.collisions.get_mut(handle).ok_or({
            ParticlesError::InvalidCollision {
                index: handle.index(),
                generation: handle.generation(),
            }
        })?;
        if collision.collision_type == collision_type {
            return Ok(());
        }
        Self::free_heightfield_target(&mut this.device, collision);
        collision.collision_type = collision_type;
        collision.dependency.notify(ChangeKind::Bounds);
        Ok(())
    }

    pub fn particles_collision_set_cull_mask(
        &mut self,
        handle: Handle<ParticleCollision>,
        mask: u32,
    ) -> ParticlesResult<()> {
        self.collision_mut(handle)?.cull_mask = mask;
        Ok(())
    }

    pub fn particles_collision_set_sphere_radius(
        &mut self,
        handle: Handle<ParticleCollision>,
        radius: f32,
    ) -> ParticlesResult<()> {
        let collision = self.collision_mut(handle)?;
        collision.radius = radius.max(0.0);
        collision.dependency.notify(ChangeKind::Bounds);
        Ok(())
    }

    pub fn particles_collision_set_box_extents(
        &mut self,
        handle: Handle<ParticleCollision>,
        extents: Vec3,
    ) -> ParticlesResult<()> {
        let this = &mut *self;
        let collision = this.collisions.get_mut(handle).ok_or({
            ParticlesError::InvalidCollision {
                index: handle.index(),
                generation: handle.generation(),
            }
        })?;
        collision.extents = extents.abs();
        if collision.is_heightfield() {
            // Aspect feeds the depth target size; recreate on demand.
            Self::free_heightfield_target(&mut this.device, collision);
        }
        collision.dependency.notify(ChangeKind::Bounds);
        Ok(())
    }

    pub fn particles_collision_set_attractor_strength(
        &mut self,
        handle: Handle<ParticleCollision>,
        strength: f32,
    ) -> ParticlesResult<()> {
        self.collision_mut(handle)?.attractor_strength = strength;
        Ok(())
    }

    pub fn particles_collision_set_attractor_directionality(
        &mut self,
        handle: Handle<ParticleCollision>,
        directionality: f32,
    ) -> ParticlesResult<()> {
        self.collision_mut(handle)?.attractor_directionality = directionality.clamp(0.0, 1.0);
        Ok(())
    }

    pub fn particles_collision_set_attractor_attenuation(
        &mut self,
        handle: Handle<ParticleCollision>,
        attenuation: f32,
    ) -> ParticlesResult<()> {
        self.collision_mut(handle)?.attractor_attenuation = attenuation.max(0.0);
        Ok(())
    }

    pub fn particles_collision_set_field_texture(
        &mut self,
        handle: Handle<ParticleCollision>,
        texture: Option<TextureId>,
    ) -> ParticlesResult<()> {
        self.collision_mut(handle)?.field_texture = texture;
        Ok(())
    }

    pub fn particles_collision_set_height_field_resolution(
        &mut self,
        handle: Handle<ParticleCollision>,
        resolution: HeightfieldResolution,
    ) -> ParticlesResult<()> {
        let this = &mut *self;
        let collision = this.collisions.get_mut(handle).ok_or({
            ParticlesError::InvalidCollision {
                index: handle.index(),
                generation: handle.generation(),
            }
        })?;
        if collision.heightfield_resolution == resolution {
            return Ok(());
        }
        collision.heightfield_resolution = resolution;
        Self::free_heightfield_target(&mut this.device, collision);
        Ok(())
    }

    /// Request a heightfield recapture. Caller-driven: capture is expensive,
    /// so the render layer drains the request list when it sees fit rather
    /// than re-rendering every frame. Idempotent per pending pass.
    pub fn particles_collision_height_field_update(
        &mut self,
        handle: Handle<ParticleCollision>,
    ) -> ParticlesResult<()> {
        let collision = self.collision(handle)?;
        if !collision.is_heightfield() {
            return Err(ParticlesError::CollisionTypeMismatch {
                required: "heightfield_collide",
                actual: collision.collision_type.name(),
            });
        }
        if !self.pending_heightfield_updates.contains(&handle) {
            self.pending_heightfield_updates.push(handle);
        }
        Ok(())
    }

    /// Drain the pending heightfield recapture requests.
    pub fn take_heightfield_updates(&mut self) -> Vec<Handle<ParticleCollision>> {
        mem::take(&mut self.pending_heightfield_updates)
    }

    /// Depth render target for a heightfield collider, lazily created and
    /// sized by resolution and extents aspect.
    pub fn particles_collision_get_heightfield_framebuffer(
        &mut self,
        handle: Handle<ParticleCollision>,
    ) -> ParticlesResult<crate::gpu::FramebufferId> {
        let this = &mut *self;
        let collision = this.collisions.get_mut(handle).ok_or({
            ParticlesError::InvalidCollision {
                index: handle.index(),
                generation: handle.generation(),
            }
        })?;
        if !collision.is_heightfield() {
            return Err(ParticlesError::CollisionTypeMismatch {
                required: "heightfield_collide",
                actual: collision.collision_type.name(),
            });
        }
        if let Some(framebuffer) = collision.heightfield_framebuffer {
            if this.device.framebuffer_is_valid(framebuffer) {
                return Ok(framebuffer);
            }
        }
        let (width, height) =
            heightfield_size(collision.extents, collision.heightfield_resolution);
        let texture = this
            .device
            .depth_texture_create(width, height, "particles heightfield")?;
        let framebuffer = this
            .device
            .framebuffer_create(texture, "particles heightfield fb")?;
        collision.heightfield_texture = Some(texture);
        collision.heightfield_framebuffer = Some(framebuffer);
        collision.heightfield_size = (width, height);
        log::debug!(
            "[ParticleStorage] heightfield target {:?} sized {}x{}",
            handle,
            width,
            height
        );
        Ok(framebuffer)
    }

    pub fn particles_collision_get_aabb(
        &self,
        handle: Handle<ParticleCollision>,
    ) -> ParticlesResult<Aabb> {
        Ok(self.collision(handle)?.aabb())
    }

    pub fn particles_collision_get_extents(
        &self,
        handle: Handle<ParticleCollision>,
    ) -> ParticlesResult<Vec3> {
        Ok(self.collision(handle)?.extents)
    }

    pub fn particles_collision_is_heightfield(
        &self,
        handle: Handle<ParticleCollision>,
    ) -> ParticlesResult<bool> {
        Ok(self.collision(handle)?.is_heightfield())
    }

    pub fn collision_subscribe<F>(
        &mut self,
        handle: Handle<ParticleCollision>,
        callback: F,
    ) -> ParticlesResult<SubscriptionId>
    where
        F: FnMut(ChangeKind) + 'static,
    {
        Ok(self.collision_mut(handle)?.dependency.subscribe(callback))
    }

    /* Collision instances. */

    pub fn particles_collision_instance_create(
        &mut self,
        collision: Handle<ParticleCollision>,
    ) -> ParticlesResult<Handle<CollisionInstance>> {
        if !self.collisions.contains(collision) {
            return Err(ParticlesError::InvalidCollision {
                index: collision.index(),
                generation: collision.generation(),
            });
        }
        Ok(self.collision_instances.insert(CollisionInstance::new(collision)))
    }

    pub fn particles_collision_instance_free(
        &mut self,
        handle: Handle<CollisionInstance>,
    ) -> ParticlesResult<()> {
        if self.collision_instances.free(handle).is_none() {
            return Err(ParticlesError::InvalidCollisionInstance {
                index: handle.index(),
                generation: handle.generation(),
            });
        }
        Ok(())
    }

    pub fn particles_collision_instance_set_transform(
        &mut self,
        handle: Handle<CollisionInstance>,
        transform: Mat4,
    ) -> ParticlesResult<()> {
        self.collision_instance_mut(handle)?.transform = transform;
        Ok(())
    }

    pub fn particles_collision_instance_set_active(
        &mut self,
        handle: Handle<CollisionInstance>,
        active: bool,
    ) -> ParticlesResult<()> {
        self.collision_instance_mut(handle)?.active = active;
        Ok(())
    }

    /* Simulation step driver. */

    /// Drive every enqueued system forward by `delta` seconds of render
    /// time. Call at most once per frame; dispatches are submitted, not
    /// waited on.
    pub fn update_particles(&mut self, delta: f64) {
        self.time = (self.time + delta) % TIME_WRAP_SECONDS;
        let queue = mem::take(&mut self.worklist);
        for handle in queue {
            if let Err(err) = self.process_one(handle, delta) {
                log::error!(
                    "[ParticleStorage] processing {:?} failed: {}",
                    handle,
                    err
                );
            }
        }
    }

    fn process_one(
        &mut self,
        handle: Handle<ParticleSystem>,
        delta: f64,
    ) -> ParticlesResult<()> {
        let (clear, pre_process_time, fixed_fps, frame_remainder) = {
            let Some(system) = self.particles.get_mut(handle) else {
                // Freed while enqueued; nothing left to do.
                return Ok(());
            };
            system.in_worklist = false;

            let pending_emission = system
                .emission_buffer
                .as_ref()
                .map_or(false, |buffer| !buffer.is_empty());
            if system.emitting || pending_emission {
                system.inactive = false;
                system.inactive_time = 0.0;
            } else {
                system.inactive_time += system.speed_scale * delta;
                if system.inactive_time > system.lifetime * INACTIVE_LIFETIME_FACTOR {
                    system.inactive = true;
                    return Ok(());
                }
            }
            if system.amount == 0 {
                return Ok(());
            }
            (
                system.clear || system.restart_request,
                system.pre_process_time,
                system.fixed_fps,
                system.frame_remainder,
            )
        };

        let frame_time = if fixed_fps > 0 {
            1.0 / fixed_fps as f64
        } else {
            FALLBACK_FRAME_TIME
        };

        if clear && pre_process_time > 0.0 {
            let mut todo = pre_process_time;
            while todo >= 0.0 {
                self.step_system(handle, frame_time)?;
                todo -= frame_time;
            }
        }

        let mut updated = false;
        let step_delta;
        if fixed_fps > 0 {
            let ldelta = delta.clamp(MIN_FRAME_DELTA, MAX_FRAME_DELTA);
            let mut todo = frame_remainder + ldelta;
            // A pending clear forces at least one step so the wipe lands.
            while todo >= frame_time
                || self.particles.get(handle).map_or(false, |s| s.clear)
            {
                updated |= self.step_system(handle, frame_time)?;
                todo -= frame_time;
            }
            if let Some(system) = self.particles.get_mut(handle) {
                system.frame_remainder = todo;
            }
            step_delta = frame_time;
        } else {
            updated = self.step_system(handle, delta)?;
            step_delta = delta;
        }

        if updated {
            self.copy_pass(handle, step_delta)?;
        }

        // Self re-enqueue keeps live systems ticking without external
        // bookkeeping.
        if let Some(system) = self.particles.get_mut(handle) {
            let pending_emission = system
                .emission_buffer
                .as_ref()
                .map_or(false, |buffer| !buffer.is_empty());
            if system.emitting || pending_emission || system.clear {
                if !system.in_worklist {
                    system.in_worklist = true;
                    self.worklist.push(handle);
                }
            }
        }
        Ok(())
    }

    /// One simulation step: advance the phase clock, assemble frame
    /// parameters, drain pending emissions, and dispatch the simulate
    /// kernel. Returns false when the dispatch was skipped.
    fn step_system(&mut self, handle: Handle<ParticleSystem>, dt: f64) -> ParticlesResult<bool> {
        self.update_buffers(handle)?;

        // Advance the clock.
        let time = self.time;
        let mut params = {
            let system = self.system_mut(handle)?;
            if system.restart_request {
                system.phase = 0.0;
                system.prev_phase = 0.0;
                system.clear = true;
                system.restart_request = false;
            }
            system.frame_counter = system.frame_counter.wrapping_add(1);

            let new_phase =
                (system.phase + (dt / system.lifetime) * system.speed_scale).rem_euclid(1.0);
            if system.clear {
                system.cycle_number = 0;
                system.random_seed = rand::random::<u32>();
            } else if new_phase < system.phase {
                system.cycle_number += 1;
                if system.one_shot {
                    system.emitting = false;
                }
            }
            system.prev_phase = system.phase;
            system.phase = new_phase;

            let mut params = FrameParams::default();
            params.emitting = system.emitting as u32;
            params.system_phase = system.phase as f32;
            params.prev_system_phase = system.prev_phase as f32;
            params.cycle = system.cycle_number;
            params.explosiveness = system.explosiveness;
            params.randomness = system.randomness;
            params.time = time as f32;
            params.delta = (dt * system.speed_scale) as f32;
            params.frame = system.frame_counter;
            params.random_seed = system.random_seed;
            params.particle_size = system.collision_base_size;
            if !system.use_local_coords {
                params.set_emission_transform(&system.emission_transform);
            }
            params
        };

        // Influencer gather and heightfield selection.
        let desired_heightfield = {
            let this = &mut *self;
            let system = this.particles.get(handle).ok_or({
                ParticlesError::InvalidParticles {
                    index: handle.index(),
                    generation: handle.generation(),
                }
            })?;
            gather_influencers(
                &mut params,
                system,
                &this.collisions,
                &this.collision_instances,
            )
        };

        // Sub-emitter wiring: reset the child's free-slot header and keep
        // it alive for the spawned records.
        let sub_handle = self.system(handle)?.sub_emitter;
        let mut can_emit = false;
        let mut sub_emission_buffer = self.empty_emission_buffer;
        if let Some(sub) = sub_handle {
            if self.particles.contains(sub) {
                self.ensure_emission_storage(sub)?;
                let this = &mut *self;
                if let Some(child) = this.particles.get_mut(sub) {
                    if child.emitting {
                        // A self-emitting child cannot also take sub-emitted
                        // records; stop and wipe it.
                        child.emitting = false;
                        child.clear = true;
                    }
                    child.inactive = false;
                    child.inactive_time = 0.0;
                    child.force_sub_emit = true;
                    if let Some(buffer) = child.emission_storage_buffer {
                        let header = EmissionBufferHeader {
                            particle_count: 0,
                            particle_max: child.amount as i32,
                            ..Default::default()
                        };
                        this.device.buffer_update(buffer, 0, bytes_of(&header))?;
                        sub_emission_buffer = buffer;
                        can_emit = true;
                    }
                }
                self.particles_request_process(sub)?;
            } else {
                log::error!(
                    "[ParticleStorage] sub-emitter {:?} of {:?} is gone",
                    sub,
                    handle
                );
            }
        }

        // Drain pending manual emissions, exactly once per step.
        self.ensure_emission_storage(handle)?;
        let mut drained_emission = None;
        {
            let this = &mut *self;
            let system = this.particles.get_mut(handle).ok_or({
                ParticlesError::InvalidParticles {
                    index: handle.index(),
                    generation: handle.generation(),
                }
            })?;
            if let (Some(buffer), Some(storage)) = (
                system.emission_buffer.as_mut(),
                system.emission_storage_buffer,
            ) {
                if !buffer.is_empty() {
                    let header = EmissionBufferHeader {
                        particle_count: buffer.len() as i32,
                        particle_max: buffer.capacity() as i32,
                        ..Default::default()
                    };
                    let mut bytes = bytes_of(&header).to_vec();
                    bytes.extend_from_slice(cast_slice(buffer.records()));
                    this.device.buffer_update(storage, 0, &bytes)?;
                    buffer.clear();
                    drained_emission = Some(storage);
                }
            }
        }

        // Frame history and upload.
        {
            let this = &mut *self;
            let system = this.particles.get_mut(handle).ok_or({
                ParticlesError::InvalidParticles {
                    index: handle.index(),
                    generation: handle.generation(),
                }
            })?;
            if system.uses_trails() {
                let history_size = system.history_size() as usize;
                system
                    .frame_history
                    .resize(history_size, FrameParams::default());
                for i in (1..history_size).rev() {
                    system.frame_history[i] = system.frame_history[i - 1];
                }
                system.frame_history[0] = params;

                // Downsample the ring to one block per bind pose.
                let pose_count = system.trail_bind_poses.len();
                system
                    .trail_params
                    .resize(pose_count, FrameParams::default());
                let span = history_size.saturating_sub(1);
                let slots = pose_count.saturating_sub(1).max(1);
                for i in 0..pose_count {
                    let index = i * span / slots;
                    system.trail_params[i] = system.frame_history[index];
                }
            } else {
                system.trail_params.clear();
                system.trail_params.push(params);
            }
            if let Some(buffer) = system.frame_params_buffer {
                this.device
                    .buffer_update(buffer, 0, cast_slice(&system.trail_params))?;
            }
        }

        // Resolve the material; an invalid one skips dispatch without
        // touching the already-advanced clocks.
        let (pipeline, userdata_count) = {
            let system = self.system(handle)?;
            let material = system.process_material.unwrap_or(self.default_material);
            match self.materials.binding(material) {
                Some(binding) if binding.valid => match binding.pipeline {
                    Some(pipeline) => (pipeline, binding.userdata_count.min(MAX_USERDATAS)),
                    None => {
                        log::debug!(
                            "[ParticleStorage] material {} has no pipeline, skipping dispatch",
                            material.0
                        );
                        self.system_mut(handle)?.clear = false;
                        return Ok(false);
                    }
                },
                Some(_) => {
                    log::debug!(
                        "[ParticleStorage] material {} is invalid, skipping dispatch",
                        material.0
                    );
                    self.system_mut(handle)?.clear = false;
                    return Ok(false);
                }
                None => {
                    log::error!(
                        "[ParticleStorage] material {} vanished, skipping dispatch",
                        material.0
                    );
                    self.system_mut(handle)?.clear = false;
                    return Ok(false);
                }
            }
        };

        let (base_set, collision_set) =
            self.ensure_simulate_sets(handle, pipeline, sub_emission_buffer, desired_heightfield)?;

        // Push constants and dispatch.
        let (mut push, amount, trails) = {
            let system = self.system_mut(handle)?;
            let pending_records = system
                .emission_buffer
                .as_ref()
                .map_or(false, |b| !b.is_empty())
                || drained_emission.is_some();
            let push = SimulatePushConstants {
                lifetime: system.lifetime as f32,
                clear: system.clear as u32,
                total_particles: system.amount,
                trail_size: system.trail_divisor(),
                use_fractional_delta: system.fractional_delta as u32,
                sub_emitter_mode: (!system.emitting
                    && (pending_records || system.force_sub_emit))
                    as u32,
                can_emit: can_emit as u32,
                trail_pass: 0,
                userdata_count,
                ..Default::default()
            };
            system.force_sub_emit = false;
            system.clear = false;
            (push, system.amount, system.uses_trails())
        };

        let sets = [base_set, collision_set];
        if trails {
            // One thread per logical particle; each shifts its own trail
            // slots serially so no slot is read while another writes it.
            push.trail_pass = 1;
            self.device.compute_dispatch(&ComputeDispatch {
                label: "particles_trail_shift",
                pipeline,
                uniform_sets: &sets,
                push_params: bytes_of(&push),
                groups: [dispatch_group_count(amount), 1, 1],
            })?;
            push.trail_pass = 0;
        }
        self.device.compute_dispatch(&ComputeDispatch {
            label: "particles_simulate",
            pipeline,
            uniform_sets: &sets,
            push_params: bytes_of(&push),
            groups: [dispatch_group_count(amount), 1, 1],
        })?;

        // The upload above was consumed by this dispatch; zero the count so
        // a later step cannot replay the same records.
        if let Some(storage) = drained_emission {
            self.device
                .buffer_update(storage, 0, &0i32.to_le_bytes())?;
        }
        Ok(true)
    }

    /// Lazily create any missing device buffer. Also resolves a userdata
    /// shape mismatch against the bound material by reallocating.
    fn update_buffers(&mut self, handle: Handle<ParticleSystem>) -> ParticlesResult<()> {
        let this = &mut *self;
        let system = this.particles.get_mut(handle).ok_or({
            ParticlesError::InvalidParticles {
                index: handle.index(),
                generation: handle.generation(),
            }
        })?;
        if system.amount == 0 {
            return Ok(());
        }

        let material = system.process_material.unwrap_or(this.default_material);
        let desired_userdata = this
            .materials
            .binding(material)
            .map(|binding| binding.userdata_count.min(MAX_USERDATAS))
            .unwrap_or(0);
        if system.particle_buffer.is_some() && system.userdata_count != desired_userdata {
            log::debug!(
                "[ParticleStorage] {:?} userdata {} -> {}, reallocating",
                handle,
                system.userdata_count,
                desired_userdata
            );
            Self::free_system_resources(&mut this.device, system);
        }

        let total = system.total_amount() as u64;
        if system.particle_buffer.is_none() {
            system.userdata_count = desired_userdata;
            let size = total * particle_stride_bytes(desired_userdata);
            system.particle_buffer = Some(this.device.storage_buffer_create(
                size,
                None,
                "particles state",
            )?);
            system.clear = true;
        }
        if system.frame_params_buffer.is_none() {
            let size = system.trail_divisor() as u64 * mem::size_of::<FrameParams>() as u64;
            system.frame_params_buffer = Some(this.device.storage_buffer_create(
                size,
                None,
                "particles frame params",
            )?);
        }
        if system.instance_buffer.is_none() {
            let size = total * system.instance_stride_floats() as u64 * 4;
            system.instance_buffer = Some(this.device.storage_buffer_create(
                size,
                None,
                "particles instances",
            )?);
        }
        if system.draw_order == DrawOrder::ViewDepth && system.sort_buffer.is_none() {
            let size = total * SORT_BUFFER_FLOATS as u64 * 4;
            system.sort_buffer = Some(this.device.storage_buffer_create(
                size,
                None,
                "particles sort",
            )?);
            // The copy set binds the sort buffer; rebind.
            if let Some(set) = system.copy_base_set.take() {
                this.device.uniform_set_free(set);
            }
        }
        if !system.trail_bind_poses.is_empty() && system.trail_bind_pose_buffer.is_none() {
            let size = system.trail_bind_poses.len() as u64 * 64;
            system.trail_bind_pose_buffer = Some(this.device.storage_buffer_create(
                size,
                None,
                "particles trail poses",
            )?);
            system.trail_bind_poses_dirty = true;
            if let Some(set) = system.copy_base_set.take() {
                this.device.uniform_set_free(set);
            }
        }
        system.dirty = false;
        Ok(())
    }

    /// Give `handle` a host emission queue and its GPU twin, sized by the
    /// current amount.
    fn ensure_emission_storage(&mut self, handle: Handle<ParticleSystem>) -> ParticlesResult<()> {
        let this = &mut *self;
        let system = this.particles.get_mut(handle).ok_or({
            ParticlesError::InvalidParticles {
                index: handle.index(),
                generation: handle.generation(),
            }
        })?;
        if system.amount == 0 {
            return Ok(());
        }
        let amount = system.amount;
        if system.emission_buffer.is_none() {
            system.emission_buffer = Some(EmissionBuffer::new(amount));
        }
        if system.emission_storage_buffer.is_none() {
            let header = EmissionBufferHeader {
                particle_count: 0,
                particle_max: amount as i32,
                ..Default::default()
            };
            let buffer = this.device.storage_buffer_create(
                emission_buffer_bytes(amount),
                Some(bytes_of(&header)),
                "particles emission",
            )?;
            system.emission_storage_buffer = Some(buffer);
        }
        Ok(())
    }

    /// Create or reuse the two simulate bind sets, rebinding when any
    /// referenced resource changed since the last step.
    fn ensure_simulate_sets(
        &mut self,
        handle: Handle<ParticleSystem>,
        pipeline: PipelineId,
        sub_emission_buffer: BufferId,
        heightfield: Option<TextureId>,
    ) -> ParticlesResult<(UniformSetId, UniformSetId)> {
        let depth_texture = match heightfield {
            Some(texture) if self.device.texture_is_valid(texture) => texture,
            _ => self.device.fallback_depth_texture()?,
        };

        let this = &mut *self;
        let system = this.particles.get_mut(handle).ok_or({
            ParticlesError::InvalidParticles {
                index: handle.index(),
                generation: handle.generation(),
            }
        })?;
        let frame_params = system.frame_params_buffer.ok_or({
            ParticlesError::NotInitialized {
                index: handle.index(),
            }
        })?;
        let particle_buffer = system.particle_buffer.ok_or({
            ParticlesError::NotInitialized {
                index: handle.index(),
            }
        })?;
        let own_emission = system
            .emission_storage_buffer
            .unwrap_or(this.empty_emission_buffer);

        let base_stale = system.simulate_base_set.map_or(true, |set| {
            !this.device.uniform_set_is_valid(set)
                || system.bound_simulate_pipeline != Some(pipeline)
                || system.bound_emission_buffer != Some(own_emission)
                || system.bound_sub_emission_buffer != Some(sub_emission_buffer)
        });
        if base_stale {
            if let Some(set) = system.simulate_base_set.take() {
                this.device.uniform_set_free(set);
            }
            let set = this.device.uniform_set_create(
                pipeline,
                0,
                &[
                    UniformBinding::StorageBuffer {
                        binding: 0,
                        buffer: frame_params,
                    },
                    UniformBinding::StorageBuffer {
                        binding: 1,
                        buffer: particle_buffer,
                    },
                    UniformBinding::StorageBuffer {
                        binding: 2,
                        buffer: own_emission,
                    },
                    UniformBinding::StorageBuffer {
                        binding: 3,
                        buffer: sub_emission_buffer,
                    },
                ],
            )?;
            system.simulate_base_set = Some(set);
            system.bound_simulate_pipeline = Some(pipeline);
            system.bound_emission_buffer = Some(own_emission);
            system.bound_sub_emission_buffer = Some(sub_emission_buffer);
        }

        let collision_stale = system.collision_textures_set.map_or(true, |set| {
            !this.device.uniform_set_is_valid(set)
                || system.bound_heightfield != Some(depth_texture)
        });
        if collision_stale {
            if let Some(set) = system.collision_textures_set.take() {
                this.device.uniform_set_free(set);
            }
            let set = this.device.uniform_set_create(
                pipeline,
                2,
                &[UniformBinding::DepthTexture {
                    binding: 0,
                    texture: depth_texture,
                }],
            )?;
            system.collision_textures_set = Some(set);
            system.bound_heightfield = Some(depth_texture);
        }

        let base = system.simulate_base_set.ok_or({
            ParticlesError::NotInitialized {
                index: handle.index(),
            }
        })?;
        let collision = system.collision_textures_set.ok_or({
            ParticlesError::NotInitialized {
                index: handle.index(),
            }
        })?;
        Ok((base, collision))
    }

    /// Fill the instance transform buffer (and sort keys for view-depth
    /// ordering) from the stepped particle state.
    fn copy_pass(&mut self, handle: Handle<ParticleSystem>, step_delta: f64) -> ParticlesResult<()> {
        // Upload dirty trail bind poses first; the copy kernel reads them.
        {
            let this = &mut *self;
            let system = this.particles.get_mut(handle).ok_or({
                ParticlesError::InvalidParticles {
                    index: handle.index(),
                    generation: handle.generation(),
                }
            })?;
            if system.trail_bind_poses_dirty {
                if let Some(buffer) = system.trail_bind_pose_buffer {
                    this.device
                        .buffer_update(buffer, 0, cast_slice(&system.trail_bind_poses))?;
                }
                system.trail_bind_poses_dirty = false;
            }
        }

        let copy_set = self.ensure_copy_set(handle)?;
        let (mut push, total, view_depth) = {
            let system = self.system(handle)?;
            let order_by_lifetime = matches!(
                system.draw_order,
                DrawOrder::Lifetime | DrawOrder::ReverseLifetime
            );
            let lifetime_split = ((system.amount as f64 * system.phase) as u32)
                .min(system.amount.saturating_sub(1));
            let inv_emission = if system.use_local_coords {
                Mat4::IDENTITY
            } else {
                system.emission_transform.inverse()
            };
            let push = CopyPushConstants {
                sort_direction: system.view_axis.to_array(),
                total_particles: system.amount,
                trail_size: system.trail_divisor(),
                trail_total: system.total_amount(),
                frame_delta: if system.interpolate {
                    (step_delta * system.speed_scale) as f32
                } else {
                    0.0
                },
                frame_remainder: if system.interpolate {
                    system.frame_remainder as f32
                } else {
                    0.0
                },
                align_up: system.align_up.to_array(),
                align_mode: system.transform_align as u32,
                order_by_lifetime: order_by_lifetime as u32,
                lifetime_split,
                lifetime_reverse: (system.draw_order == DrawOrder::ReverseLifetime) as u32,
                copy_mode_2d: (system.mode == ParticleMode::Mode2D) as u32,
                inv_emission_transform: inv_emission.to_cols_array(),
                copy_mode: CopyMode::FillInstances as u32,
                userdata_count: system.userdata_count,
                pad0: 0,
                pad1: 0,
            };
            (
                push,
                system.total_amount(),
                system.draw_order == DrawOrder::ViewDepth,
            )
        };

        let sets = [copy_set];
        let groups = [dispatch_group_count(total), 1, 1];
        if view_depth {
            push.copy_mode = CopyMode::FillSortBuffer as u32;
            self.device.compute_dispatch(&ComputeDispatch {
                label: "particles_copy_sort",
                pipeline: self.copy_pipeline,
                uniform_sets: &sets,
                push_params: bytes_of(&push),
                groups,
            })?;
            // The external radix sort runs on the sort buffer between
            // these two dispatches; the indexed fill consumes its order.
            push.copy_mode = CopyMode::FillInstancesIndexed as u32;
            self.device.compute_dispatch(&ComputeDispatch {
                label: "particles_copy_indexed",
                pipeline: self.copy_pipeline,
                uniform_sets: &sets,
                push_params: bytes_of(&push),
                groups,
            })?;
        } else {
            self.device.compute_dispatch(&ComputeDispatch {
                label: "particles_copy_instances",
                pipeline: self.copy_pipeline,
                uniform_sets: &sets,
                push_params: bytes_of(&push),
                groups,
            })?;
        }
        Ok(())
    }

    fn ensure_copy_set(&mut self, handle: Handle<ParticleSystem>) -> ParticlesResult<UniformSetId> {
        let this = &mut *self;
        let system = this.particles.get_mut(handle).ok_or({
            ParticlesError::InvalidParticles {
                index: handle.index(),
                generation: handle.generation(),
            }
        })?;
        if let Some(set) = system.copy_base_set {
            if this.device.uniform_set_is_valid(set) {
                return Ok(set);
            }
            this.device.uniform_set_free(set);
            system.copy_base_set = None;
        }
        let particle_buffer = system.particle_buffer.ok_or({
            ParticlesError::NotInitialized {
                index: handle.index(),
            }
        })?;
        let instance_buffer = system.instance_buffer.ok_or({
            ParticlesError::NotInitialized {
                index: handle.index(),
            }
        })?;
        let frame_params = system.frame_params_buffer.ok_or({
            ParticlesError::NotInitialized {
                index: handle.index(),
            }
        })?;
        let sort_buffer = system.sort_buffer.unwrap_or(this.dummy_sort_buffer);
        let pose_buffer = system
            .trail_bind_pose_buffer
            .unwrap_or(this.dummy_pose_buffer);
        let set = this.device.uniform_set_create(
            this.copy_pipeline,
            0,
            &[
                UniformBinding::StorageBuffer {
                    binding: 0,
                    buffer: particle_buffer,
                },
                UniformBinding::StorageBuffer {
                    binding: 1,
                    buffer: instance_buffer,
                },
                UniformBinding::StorageBuffer {
                    binding: 2,
                    buffer: frame_params,
                },
                UniformBinding::StorageBuffer {
                    binding: 3,
                    buffer: sort_buffer,
                },
                UniformBinding::StorageBuffer {
                    binding: 4,
                    buffer: pose_buffer,
                },
            ],
        )?;
        system.copy_base_set = Some(set);
        Ok(set)
    }
}

/// Fill the attractor and collider tables from the system's referenced
/// collision instances, in registration order, truncated at the fixed
/// maxima. Returns the heightfield depth texture to bind, if any.
fn gather_influencers(
    params: &mut FrameParams,
    system: &ParticleSystem,
    collisions: &HandleArena<ParticleCollision>,
    instances: &HandleArena<CollisionInstance>,
) -> Option<TextureId> {
    let mut heightfield = None;
    let mut textures_used = 0u32;
    let inv_emission = if system.use_local_coords {
        Some(system.emission_transform.inverse())
    } else {
        None
    };

    for handle in &system.collisions {
        let Some(instance) = instances.get(*handle) else {
            log::error!(
                "[ParticleStorage] collision instance {:?} was freed while still referenced",
                handle
            );
            continue;
        };
        if !instance.active {
            continue;
        }
        let Some(definition) = collisions.get(instance.collision) else {
            log::error!(
                "[ParticleStorage] collision definition {:?} was freed while instance {:?} still places it",
                instance.collision,
                handle
            );
            continue;
        };

        let mut to_collider = instance.transform;
        if let Some(inv) = inv_emission {
            to_collider = inv * to_collider;
        }
        let x = to_collider.x_axis.truncate();
        let y = to_collider.y_axis.truncate();
        let z = to_collider.z_axis.truncate();
        let scale = (x.length() + y.length() + z.length()) / 3.0;
        let orthonormal = Mat4::from_cols(
            x.normalize_or_zero().extend(0.0),
            y.normalize_or_zero().extend(0.0),
            z.normalize_or_zero().extend(0.0),
            to_collider.w_axis,
        );
        let world_to_collider = orthonormal.inverse();

        if let Some(kind) = definition.collision_type.attractor_kind() {
            let index = params.attractor_count as usize;
            if index >= MAX_ATTRACTORS {
                continue;
            }
            let texture_index = if definition.collision_type == CollisionType::VectorFieldAttract {
                if definition.field_texture.is_none() || textures_used >= MAX_3D_TEXTURES as u32 {
                    continue;
                }
                let slot = textures_used;
                textures_used += 1;
                slot
            } else {
                0
            };
            let attractor = &mut params.attractors[index];
            attractor.transform = world_to_collider.to_cols_array();
            attractor.extents = match definition.collision_type {
                CollisionType::SphereAttract => [definition.radius * scale, 0.0, 0.0],
                _ => (definition.extents * scale).to_array(),
            };
            attractor.kind = kind as u32;
            attractor.texture_index = texture_index;
            attractor.strength = definition.attractor_strength;
            attractor.attenuation = definition.attractor_attenuation;
            attractor.directionality = definition.attractor_directionality;
            params.attractor_count += 1;
        } else if let Some(kind) = definition.collision_type.collider_kind() {
            let index = params.collider_count as usize;
            if index >= MAX_COLLIDERS {
                continue;
            }
            let texture_index = match definition.collision_type {
                CollisionType::SdfCollide => {
                    if definition.field_texture.is_none()
                        || textures_used >= MAX_3D_TEXTURES as u32
                    {
                        continue;
                    }
                    let slot = textures_used;
                    textures_used += 1;
                    slot
                }
                CollisionType::HeightfieldCollide => {
                    if heightfield.is_none() {
                        heightfield = definition.heightfield_texture;
                    }
                    0
                }
                _ => 0,
            };
            let collider = &mut params.colliders[index];
            collider.transform = world_to_collider.to_cols_array();
            collider.extents = match definition.collision_type {
                CollisionType::SphereCollide => [definition.radius, 0.0, 0.0],
                _ => definition.extents.to_array(),
            };
            collider.kind = kind as u32;
            collider.texture_index = texture_index;
            collider.scale = scale;
            params.collider_count += 1;
        }
    }

    // The 2D renderer's canvas SDF rides in as one more collider slot.
    if system.sdf_collision_enabled && (params.collider_count as usize) < MAX_COLLIDERS {
        let index = params.collider_count as usize;
        let collider = &mut params.colliders[index];
        collider.transform = system.sdf_collision_transform.to_cols_array();
        collider.extents = [
            system.sdf_collision_to_screen.z,
            system.sdf_collision_to_screen.w,
            0.0,
        ];
        collider.kind = ColliderKind::Sdf2d as u32;
        collider.texture_index = 0;
        collider.scale = 1.0;
        params.collider_count += 1;
    }
    heightfield
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::HeadlessDevice;
    use crate::particles::material::{ProcessShader, ShaderCapabilities};

    fn storage() -> ParticleStorage<HeadlessDevice> {
        let _ = env_logger::builder().is_test(true).try_init();
        ParticleStorage::new(HeadlessDevice::new()).expect("storage")
    }

    fn emitter(storage: &mut ParticleStorage<HeadlessDevice>, amount: u32) -> Handle<ParticleSystem> {
        let handle = storage.particles_allocate();
        storage.particles_initialize(handle).expect("initialize");
        storage.particles_set_amount(handle, amount).expect("amount");
        handle
    }

    #[test]
    fn test_two_phase_construction_and_stale_handles() {
        let mut storage = storage();
        let handle = storage.particles_allocate();
        // Reserved but uninitialized: mutators miss.
        assert!(storage.particles_set_amount(handle, 8).is_err());

        storage.particles_initialize(handle).expect("initialize");
        storage.particles_set_amount(handle, 8).expect("amount");

        storage.particles_free(handle).expect("free");
        assert!(matches!(
            storage.particles_get_emitting(handle),
            Err(ParticlesError::InvalidParticles { .. })
        ));
        assert!(storage.particles_free(handle).is_err());
    }

    #[test]
    fn test_fixed_fps_cadence() {
        let mut storage = storage();
        let handle = emitter(&mut storage, 100);
        storage.particles_set_lifetime(handle, 2.0).expect("lifetime");
        storage.particles_set_fixed_fps(handle, 30).expect("fps");
        storage.particles_set_emitting(handle, true).expect("emitting");

        storage.device_mut().clear_dispatches();
        for _ in 0..60 {
            storage.update_particles(1.0 / 60.0);
        }
        // One clear-forced step plus the fixed-rate steps; the frame
        // remainder carries so two render frames fund one simulation step.
        assert_eq!(storage.device().dispatch_count_for("particles_simulate"), 30);
    }

    #[test]
    fn test_restart_resets_phase_and_forces_clear() {
        let mut storage = storage();
        let handle = emitter(&mut storage, 16);
        storage.particles_set_emitting(handle, true).expect("emitting");
        for _ in 0..25 {
            storage.update_particles(1.0 / 30.0);
        }
        let phase_before = storage.system(handle).expect("system").phase;
        assert!(phase_before > 0.0);

        storage.particles_restart(handle).expect("restart");
        {
            let system = storage.system(handle).expect("system");
            assert!(system.restart_request);
            assert!(!system.inactive);
        }
        storage.update_particles(1.0 / 30.0);
        let system = storage.system(handle).expect("system");
        assert!(!system.restart_request);
        assert_eq!(system.cycle_number, 0);
        // Phase restarted from zero and advanced by the processed steps
        // only.
        assert!(system.phase < phase_before);
    }

    #[test]
    fn test_emission_drained_exactly_once() {
        let mut storage = storage();
        let handle = emitter(&mut storage, 8);
        storage
            .particles_emit(
                handle,
                &Mat4::IDENTITY,
                Vec3::new(0.0, 1.0, 0.0),
                Vec4::ONE,
                Vec4::ZERO,
                crate::particles::particle::emission_flags::POSITION,
            )
            .expect("emit");
        storage
            .particles_emit(
                handle,
                &Mat4::IDENTITY,
                Vec3::ZERO,
                Vec4::ONE,
                Vec4::ZERO,
                crate::particles::particle::emission_flags::POSITION,
            )
            .expect("emit");

        storage.update_particles(1.0 / 30.0);
        let (buffer, host_len) = {
            let system = storage.system(handle).expect("system");
            (
                system.emission_storage_buffer.expect("storage buffer"),
                system.emission_buffer.as_ref().map(|b| b.len()),
            )
        };
        // Host queue drained, GPU count zeroed after the consuming step.
        assert_eq!(host_len, Some(0));
        let data = storage.device_mut().buffer_get_data(buffer).expect("readback");
        let count = i32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        assert_eq!(count, 0);

        storage.update_particles(1.0 / 30.0);
        let data = storage.device_mut().buffer_get_data(buffer).expect("readback");
        let count = i32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        assert_eq!(count, 0);
    }

    #[test]
    fn test_emission_capacity_change_discards_pending() {
        let mut storage = storage();
        let handle = emitter(&mut storage, 4);
        storage
            .particles_emit(
                handle,
                &Mat4::IDENTITY,
                Vec3::ZERO,
                Vec4::ONE,
                Vec4::ZERO,
                0,
            )
            .expect("emit");
        storage.particles_set_amount(handle, 8).expect("amount");
        let system = storage.system(handle).expect("system");
        assert!(system.emission_buffer.is_none());
    }

    #[test]
    fn test_collision_set_membership_is_idempotent() {
        let mut storage = storage();
        let handle = emitter(&mut storage, 8);

        let definition = storage.particles_collision_allocate();
        storage
            .particles_collision_initialize(definition)
            .expect("initialize");
        let instance = storage
            .particles_collision_instance_create(definition)
            .expect("instance");

        storage.particles_add_collision(handle, instance).expect("add");
        storage.particles_add_collision(handle, instance).expect("add again");
        assert_eq!(storage.system(handle).expect("system").collisions.len(), 1);
        assert!(storage.particles_has_collision(handle).expect("query"));

        storage
            .particles_remove_collision(handle, instance)
            .expect("remove");
        // Removing a non-member is a no-op.
        storage
            .particles_remove_collision(handle, instance)
            .expect("remove again");
        assert_eq!(storage.system(handle).expect("system").collisions.len(), 0);
        assert!(!storage.particles_has_collision(handle).expect("query"));
    }

    #[test]
    fn test_influencers_truncated_first_registered_kept() {
        let mut storage = storage();
        let handle = emitter(&mut storage, 8);

        for i in 0..(MAX_ATTRACTORS + 3) {
            let definition = storage.particles_collision_allocate();
            storage
                .particles_collision_initialize(definition)
                .expect("initialize");
            storage
                .particles_collision_set_sphere_radius(definition, 1.0 + i as f32)
                .expect("radius");
            let instance = storage
                .particles_collision_instance_create(definition)
                .expect("instance");
            storage
                .particles_collision_instance_set_active(instance, true)
                .expect("active");
            storage.particles_add_collision(handle, instance).expect("add");
        }

        storage.particles_request_process(handle).expect("request");
        storage.update_particles(1.0 / 30.0);

        let buffer = storage
            .particles_frame_params_buffer(handle)
            .expect("query")
            .expect("buffer");
        let data = storage.device_mut().buffer_get_data(buffer).expect("readback");
        let params: FrameParams =
            bytemuck::pod_read_unaligned(&data[..mem::size_of::<FrameParams>()]);
        assert_eq!(params.attractor_count, MAX_ATTRACTORS as u32);
        // First registered first included: slot 0 carries radius 1.0.
        assert_eq!(params.attractors[0].extents[0], 1.0);
        assert_eq!(
            params.attractors[MAX_ATTRACTORS - 1].extents[0],
            MAX_ATTRACTORS as f32
        );
    }

    #[test]
    fn test_inactive_gather_skips_and_dangling_reported() {
        let mut storage = storage();
        let handle = emitter(&mut storage, 8);

        let definition = storage.particles_collision_allocate();
        storage
            .particles_collision_initialize(definition)
            .expect("initialize");
        let inactive_instance = storage
            .particles_collision_instance_create(definition)
            .expect("instance");
        let freed_instance = storage
            .particles_collision_instance_create(definition)
            .expect("instance");
        storage
            .particles_collision_instance_set_active(freed_instance, true)
            .expect("active");

        storage
            .particles_add_collision(handle, inactive_instance)
            .expect("add");
        storage
            .particles_add_collision(handle, freed_instance)
            .expect("add");
        // Freeing a referenced instance is a caller error, reported by the
        // gather rather than guarded.
        storage
            .particles_collision_instance_free(freed_instance)
            .expect("free");

        storage.particles_request_process(handle).expect("request");
        storage.update_particles(1.0 / 30.0);

        let buffer = storage
            .particles_frame_params_buffer(handle)
            .expect("query")
            .expect("buffer");
        let data = storage.device_mut().buffer_get_data(buffer).expect("readback");
        let params: FrameParams =
            bytemuck::pod_read_unaligned(&data[..mem::size_of::<FrameParams>()]);
        assert_eq!(params.attractor_count, 0);
        assert_eq!(params.collider_count, 0);
    }

    #[test]
    fn test_inactivity_promotion_and_reactivation() {
        let mut storage = storage();
        let handle = emitter(&mut storage, 8);
        storage.particles_set_lifetime(handle, 1.0).expect("lifetime");

        storage.particles_set_emitting(handle, true).expect("emitting");
        storage.update_particles(1.0 / 30.0);
        assert!(!storage.particles_is_inactive(handle).expect("query"));

        // Stopped but not yet past lifetime * 1.2 of quiet time.
        storage.particles_set_emitting(handle, false).expect("emitting");
        storage.particles_request_process(handle).expect("request");
        storage.update_particles(1.0);
        assert!(!storage.particles_is_inactive(handle).expect("query"));

        storage.particles_request_process(handle).expect("request");
        storage.update_particles(1.0);
        assert!(storage.particles_is_inactive(handle).expect("query"));

        storage
            .particles_emit(handle, &Mat4::IDENTITY, Vec3::ZERO, Vec4::ONE, Vec4::ZERO, 0)
            .expect("emit");
        assert!(!storage.particles_is_inactive(handle).expect("query"));
    }

    #[test]
    fn test_trail_divisor_sizes_particle_buffer() {
        let mut storage = storage();
        let handle = emitter(&mut storage, 10);
        storage.particles_set_trails(handle, true, 0.3).expect("trails");
        storage
            .particles_set_trail_bind_poses(handle, vec![Mat4::IDENTITY; 4])
            .expect("poses");

        assert_eq!(storage.particles_amount(handle).expect("amount"), (40, 4));

        storage.particles_request_process(handle).expect("request");
        storage.update_particles(1.0 / 30.0);

        let system = storage.system(handle).expect("system");
        let buffer = system.particle_buffer.expect("buffer");
        let data = storage.device_mut().buffer_get_data(buffer).expect("readback");
        assert_eq!(data.len() as u64, 40 * particle_stride_bytes(0));
        // Frame params hold one block per bind pose.
        let params_buffer = storage
            .particles_frame_params_buffer(handle)
            .expect("query")
            .expect("buffer");
        let data = storage
            .device_mut()
            .buffer_get_data(params_buffer)
            .expect("readback");
        assert_eq!(data.len(), 4 * mem::size_of::<FrameParams>());
    }

    #[test]
    fn test_invalid_material_skips_dispatch_without_crash() {
        let mut storage = storage();
        let handle = emitter(&mut storage, 8);

        let broken = storage.register_process_material(&ProcessMaterialSpec {
            label: "broken".to_string(),
            shader: ProcessShader::Custom {
                source: String::new(),
                entry_point: "main".to_string(),
            },
            userdata_count: 0,
            capabilities: ShaderCapabilities::default(),
        });
        storage
            .particles_set_process_material(handle, Some(broken))
            .expect("bind");

        storage.device_mut().clear_dispatches();
        storage.particles_set_emitting(handle, true).expect("emitting");
        storage.update_particles(1.0 / 30.0);
        assert_eq!(storage.device().dispatch_count_for("particles_simulate"), 0);
        assert_eq!(storage.device().dispatch_count_for("particles_copy"), 0);
    }

    #[test]
    fn test_userdata_mismatch_reallocates_next_tick() {
        let mut storage = storage();
        let handle = emitter(&mut storage, 8);
        storage.particles_set_emitting(handle, true).expect("emitting");
        storage.update_particles(1.0 / 30.0);

        let before = {
            let system = storage.system(handle).expect("system");
            let buffer = system.particle_buffer.expect("buffer");
            storage
                .device_mut()
                .buffer_get_data(buffer)
                .expect("readback")
                .len()
        };
        assert_eq!(before as u64, 8 * particle_stride_bytes(0));

        let custom = storage.register_process_material(&ProcessMaterialSpec {
            label: "userdata".to_string(),
            shader: ProcessShader::Custom {
                source: "@compute fn main() {}".to_string(),
                entry_point: "main".to_string(),
            },
            userdata_count: 2,
            capabilities: ShaderCapabilities::default(),
        });
        storage
            .particles_set_process_material(handle, Some(custom))
            .expect("bind");
        storage.update_particles(1.0 / 30.0);

        let system = storage.system(handle).expect("system");
        assert_eq!(system.userdata_count, 2);
        let buffer = system.particle_buffer.expect("buffer");
        let after = storage
            .device_mut()
            .buffer_get_data(buffer)
            .expect("readback")
            .len();
        assert_eq!(after as u64, 8 * particle_stride_bytes(2));
    }

    #[test]
    fn test_heightfield_target_lazy_and_aspect_sized() {
        let mut storage = storage();
        let definition = storage.particles_collision_allocate();
        storage
            .particles_collision_initialize(definition)
            .expect("initialize");
        storage
            .particles_collision_set_collision_type(definition, CollisionType::HeightfieldCollide)
            .expect("type");
        storage
            .particles_collision_set_box_extents(definition, Vec3::new(10.0, 1.0, 5.0))
            .expect("extents");
        storage
            .particles_collision_set_height_field_resolution(
                definition,
                HeightfieldResolution::R1024,
            )
            .expect("resolution");

        let framebuffer = storage
            .particles_collision_get_heightfield_framebuffer(definition)
            .expect("framebuffer");
        let texture = storage
            .collision(definition)
            .expect("definition")
            .heightfield_texture
            .expect("texture");
        assert_eq!(
            storage.device().texture_size(texture),
            Some((1024, 512))
        );
        // Second query reuses the target.
        let again = storage
            .particles_collision_get_heightfield_framebuffer(definition)
            .expect("framebuffer");
        assert_eq!(framebuffer, again);

        storage
            .particles_collision_height_field_update(definition)
            .expect("update");
        storage
            .particles_collision_height_field_update(definition)
            .expect("update again");
        assert_eq!(storage.take_heightfield_updates(), vec![definition]);
        assert!(storage.take_heightfield_updates().is_empty());
    }

    #[test]
    fn test_free_releases_all_device_buffers() {
        let mut storage = storage();
        let baseline = storage.device().live_buffer_count();

        let handle = emitter(&mut storage, 16);
        storage.particles_set_draw_order(handle, DrawOrder::ViewDepth).expect("order");
        storage
            .particles_emit(handle, &Mat4::IDENTITY, Vec3::ZERO, Vec4::ONE, Vec4::ZERO, 0)
            .expect("emit");
        storage.particles_set_emitting(handle, true).expect("emitting");
        storage.update_particles(1.0 / 30.0);
        assert!(storage.device().live_buffer_count() > baseline);

        storage.particles_free(handle).expect("free");
        assert_eq!(storage.device().live_buffer_count(), baseline);
    }

    #[test]
    fn test_view_depth_orders_sort_then_indexed_fill() {
        let mut storage = storage();
        let handle = emitter(&mut storage, 16);
        storage
            .particles_set_draw_order(handle, DrawOrder::ViewDepth)
            .expect("order");
        storage.particles_set_emitting(handle, true).expect("emitting");

        storage.device_mut().clear_dispatches();
        storage.update_particles(1.0 / 30.0);
        let labels: Vec<&str> = storage
            .device()
            .dispatches()
            .iter()
            .map(|record| record.label.as_str())
            .collect();
        assert_eq!(
            labels,
            vec![
                "particles_simulate",
                "particles_copy_sort",
                "particles_copy_indexed"
            ]
        );
    }

    #[test]
    fn test_sub_emitter_is_stopped_and_armed() {
        let mut storage = storage();
        let parent = emitter(&mut storage, 8);
        let child = emitter(&mut storage, 4);
        storage.particles_set_emitting(child, true).expect("emitting");
        storage
            .particles_set_subemitter(parent, Some(child))
            .expect("wire");
        assert!(storage
            .particles_set_subemitter(parent, Some(parent))
            .is_err());

        storage.particles_set_emitting(parent, true).expect("emitting");
        storage.update_particles(1.0 / 30.0);

        let system = storage.system(child).expect("child");
        assert!(!system.emitting);
        assert!(!system.inactive);
        assert!(system.emission_storage_buffer.is_some());
        // The child got enqueued by the parent's step and processed in the
        // same pass or the next one; either way it now owns buffers.
        storage.update_particles(1.0 / 30.0);
        assert!(storage.system(child).expect("child").particle_buffer.is_some());
    }

    #[test]
    fn test_one_shot_stops_on_phase_wrap() {
        let mut storage = storage();
        let handle = emitter(&mut storage, 8);
        storage.particles_set_lifetime(handle, 0.1).expect("lifetime");
        storage.particles_set_one_shot(handle, true).expect("one shot");
        storage.particles_set_fixed_fps(handle, 60).expect("fps");
        storage.particles_set_emitting(handle, true).expect("emitting");

        for _ in 0..30 {
            storage.update_particles(1.0 / 60.0);
        }
        assert!(!storage.particles_get_emitting(handle).expect("query"));
    }
}
