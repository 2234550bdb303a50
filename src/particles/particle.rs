//! Particle and emission record layouts plus the host-side emission queue.

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3, Vec4};
use static_assertions::const_assert_eq;

/// Per-particle state as the kernels see it. Systems whose material requests
/// userdata channels append `userdata_count * 16` bytes after each record;
/// the kernels index the buffer with the resulting stride.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct ParticleGpuData {
    /// Column major world or local transform.
    pub xform: [f32; 16],
    pub velocity: [f32; 3],
    /// Bitfield, see [`particle_flags`].
    pub active: u32,
    pub color: [f32; 4],
    /// Free channels for the process material; w carries lifetime phase.
    pub custom: [f32; 4],
}

/// Flags in [`ParticleGpuData::active`], shared with the kernels.
pub mod particle_flags {
    pub const ACTIVE: u32 = 1 << 0;
    pub const STARTED: u32 = 1 << 1;
    pub const TRAILED: u32 = 1 << 2;
}

/// One queued manual emission.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct EmissionRecord {
    /// Column major transform, position and rotation-scale.
    pub xform: [f32; 16],
    pub velocity: [f32; 3],
    /// Which fields the kernel should take, see [`emission_flags`].
    pub flags: u32,
    pub color: [f32; 4],
    pub custom: [f32; 4],
}

/// Field-present flags in [`EmissionRecord::flags`].
pub mod emission_flags {
    pub const POSITION: u32 = 1 << 0;
    pub const ROTATION_SCALE: u32 = 1 << 1;
    pub const VELOCITY: u32 = 1 << 2;
    pub const COLOR: u32 = 1 << 3;
    pub const CUSTOM: u32 = 1 << 4;
}

impl EmissionRecord {
    pub fn new(
        transform: &Mat4,
        velocity: Vec3,
        color: Vec4,
        custom: Vec4,
        flags: u32,
    ) -> Self {
        Self {
            xform: transform.to_cols_array(),
            velocity: velocity.to_array(),
            flags,
            color: color.to_array(),
            custom: custom.to_array(),
        }
    }
}

/// Header of the GPU emission buffer; records follow it.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Pod, Zeroable)]
pub struct EmissionBufferHeader {
    /// Pending records, consumed by the kernel. Doubles as the free-slot
    /// cursor when a parent drives this system as a sub-emitter.
    pub particle_count: i32,
    pub particle_max: i32,
    pub pad1: u32,
    pub pad2: u32,
}

/// Bytes one particle occupies for a given userdata channel count.
pub fn particle_stride_bytes(userdata_count: u32) -> u64 {
    (std::mem::size_of::<ParticleGpuData>() as u32 + userdata_count * 16) as u64
}

/// Bytes the GPU emission buffer occupies for `capacity` records.
pub fn emission_buffer_bytes(capacity: u32) -> u64 {
    std::mem::size_of::<EmissionBufferHeader>() as u64
        + std::mem::size_of::<EmissionRecord>() as u64 * capacity as u64
}

/// Host-side bounded emission queue.
///
/// Filled by `particles_emit`, drained once per simulation step. Records
/// past capacity are dropped without reporting; manual emission is best
/// effort.
pub struct EmissionBuffer {
    records: Vec<EmissionRecord>,
    capacity: u32,
}

impl EmissionBuffer {
    pub fn new(capacity: u32) -> Self {
        Self {
            records: Vec::with_capacity(capacity as usize),
            capacity,
        }
    }

    /// Queue a record. Returns false when the queue is full and the record
    /// was dropped.
    pub fn push(&mut self, record: EmissionRecord) -> bool {
        if self.records.len() < self.capacity as usize {
            self.records.push(record);
            true
        } else {
            false
        }
    }

    pub fn len(&self) -> u32 {
        self.records.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn records(&self) -> &[EmissionRecord] {
        &self.records
    }

    /// Reset after upload; capacity is kept.
    pub fn clear(&mut self) {
        self.records.clear();
    }
}

const_assert_eq!(std::mem::size_of::<ParticleGpuData>(), 112);
const_assert_eq!(std::mem::size_of::<EmissionRecord>(), 112);
const_assert_eq!(std::mem::size_of::<EmissionBufferHeader>(), 16);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stride_grows_with_userdata() {
        assert_eq!(particle_stride_bytes(0), 112);
        assert_eq!(particle_stride_bytes(1), 128);
        assert_eq!(particle_stride_bytes(6), 208);
    }

    #[test]
    fn test_emission_buffer_drops_overflow() {
        let mut buffer = EmissionBuffer::new(2);
        let record = EmissionRecord::new(
            &Mat4::IDENTITY,
            Vec3::ZERO,
            Vec4::ONE,
            Vec4::ZERO,
            emission_flags::POSITION,
        );

        assert!(buffer.push(record));
        assert!(buffer.push(record));
        assert!(!buffer.push(record));
        assert_eq!(buffer.len(), 2);

        buffer.clear();
        assert!(buffer.is_empty());
        assert_eq!(buffer.capacity(), 2);
        assert!(buffer.push(record));
    }
}
