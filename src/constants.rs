//! Shared limits and defaults for the particle storage layer.
//!
//! GPU-facing values here must stay in sync with the structs in
//! `particles::frame_params` and the WGSL kernels under `shaders/compute/`.

/// Hard caps baked into the frame parameter block and the kernels.
pub mod influencer_limits {
    /// Attractor slots per system per step.
    pub const MAX_ATTRACTORS: usize = 32;
    /// Collider slots per system per step.
    pub const MAX_COLLIDERS: usize = 32;
    /// Vector field 3D texture slots per step.
    pub const MAX_3D_TEXTURES: usize = 7;
}

/// Per-particle userdata channels a process material may request.
pub const MAX_USERDATAS: u32 = 6;

/// Simulation cadence defaults and clamps.
pub mod simulation {
    /// Default fixed simulation rate for new systems.
    pub const DEFAULT_FIXED_FPS: u32 = 30;
    /// Fallback step length for pre-processing when fixed FPS is off.
    pub const FALLBACK_FRAME_TIME: f64 = 1.0 / 30.0;
    /// Render deltas above this stall the stepping loop, clamp them.
    pub const MAX_FRAME_DELTA: f64 = 0.1;
    /// Floor for degenerate (zero or negative) render deltas.
    pub const MIN_FRAME_DELTA: f64 = 0.001;
    /// A system idles out after this many lifetimes without emitting.
    pub const INACTIVE_LIFETIME_FACTOR: f64 = 1.2;
    /// Wall-clock accumulator wraps at one hour to keep shader floats sane.
    pub const TIME_WRAP_SECONDS: f64 = 3600.0;
}

/// Thread group width of both compute kernels.
pub const WORKGROUP_SIZE: u32 = 64;

/// Floats per instance slot shared by every transform format.
pub const INSTANCE_BASE_FLOATS: u32 = 4;

/// Transform rows written per instance in 2D mode.
pub const INSTANCE_XFORM_ROWS_2D: u32 = 2;
/// Transform rows written per instance in 3D mode.
pub const INSTANCE_XFORM_ROWS_3D: u32 = 3;

/// Floats per slot in the view-depth sort buffer.
pub const SORT_BUFFER_FLOATS: u32 = 4;

/// Default collision radius a process material sees for particles.
pub const DEFAULT_COLLISION_BASE_SIZE: f32 = 0.01;
