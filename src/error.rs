//! Error handling for the particle storage layer.
//!
//! Every fallible operation returns [`ParticlesResult`]; handle lookups that
//! miss are recoverable errors, never panics.

use crate::gpu::DeviceError;

/// Particle storage errors
#[derive(Debug, thiserror::Error)]
pub enum ParticlesError {
    #[error("invalid particles handle: slot {index} generation {generation}")]
    InvalidParticles { index: u32, generation: u32 },

    #[error("invalid particles collision handle: slot {index} generation {generation}")]
    InvalidCollision { index: u32, generation: u32 },

    #[error("invalid collision instance handle: slot {index} generation {generation}")]
    InvalidCollisionInstance { index: u32, generation: u32 },

    #[error("handle allocated but never initialized: slot {index}")]
    NotInitialized { index: u32 },

    #[error("operation requires collision type {required} but shape is {actual}")]
    CollisionTypeMismatch {
        required: &'static str,
        actual: &'static str,
    },

    #[error("invalid parameter {name}: {reason}")]
    InvalidParameter { name: &'static str, reason: String },

    #[error("process material {id} is not registered")]
    MaterialNotFound { id: u64 },

    #[error(transparent)]
    Device(#[from] DeviceError),
}

/// Type alias for results in the particle storage layer
pub type ParticlesResult<T> = Result<T, ParticlesError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ParticlesError::InvalidParticles {
            index: 3,
            generation: 7,
        };
        assert_eq!(
            err.to_string(),
            "invalid particles handle: slot 3 generation 7"
        );
    }
}
