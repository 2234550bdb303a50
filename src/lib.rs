//! GPU particle simulation storage.
//!
//! Handle-based registry for particle systems, collision fields and their
//! placed instances, plus the fixed-timestep driver that turns render-frame
//! deltas into simulate and copy dispatches. Rendering is out of scope: the
//! crate fills instance transform buffers and hands their ids to whatever
//! render layer sits above it.
//!
//! The GPU sits behind the [`gpu::DeviceInterface`] seam with two backends:
//! [`gpu::WgpuDevice`] for real hardware and [`gpu::HeadlessDevice`] for
//! servers and tests.
//!
//! ```no_run
//! use ember_particles::gpu::HeadlessDevice;
//! use ember_particles::particles::ParticleStorage;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut storage = ParticleStorage::new(HeadlessDevice::new())?;
//! let emitter = storage.particles_allocate();
//! storage.particles_initialize(emitter)?;
//! storage.particles_set_amount(emitter, 1024)?;
//! storage.particles_set_emitting(emitter, true)?;
//!
//! // Once per render frame.
//! storage.update_particles(1.0 / 60.0);
//! # Ok(())
//! # }
//! ```

pub mod aabb;
pub mod arena;
pub mod constants;
pub mod dependency;
pub mod error;
pub mod gpu;
pub mod particles;

pub use aabb::Aabb;
pub use arena::{Handle, HandleArena};
pub use dependency::{ChangeKind, DependencyTracker, SubscriptionId};
pub use error::{ParticlesError, ParticlesResult};
pub use particles::{
    CollisionType, DrawOrder, HeightfieldResolution, MaterialId, ParticleMode, ParticleStorage,
    TransformAlign,
};
