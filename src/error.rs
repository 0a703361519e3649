//! Crate-wide error type.
//!
//! Only precondition violations (see spec §7) become [`ForgeError`].
//! Recoverable conditions — arena overflow, UBO reallocation — are in-band
//! return values or a logged-and-continued fallback, never something a
//! caller is forced to `?` through.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, ForgeError>;

/// Fatal precondition violations. A host embedding this crate decides
/// whether to propagate, log-and-continue, or abort on one of these.
#[derive(Debug, Error)]
pub enum ForgeError {
    #[error("invalid {kind} handle")]
    InvalidHandle { kind: &'static str },

    #[error("use of {kind} after it was destroyed")]
    UseAfterDestroy { kind: &'static str },

    #[error("renderable AABB is empty but the renderable is neither culled nor shadow-exempt")]
    AabbEmpty,

    #[error("static geometry may not enable skinning or morphing")]
    StaticGeometryCannotSkin,

    #[error("instance count {requested} exceeds buffer capacity {capacity} or MAX_INSTANCES {max}")]
    InstanceCountExceeded {
        requested: u32,
        capacity: u32,
        max: u32,
    },

    #[error("material requires a feature level the active backend does not support")]
    UnsupportedFeatureLevel,

    #[error("vertex skinning weights sum to zero or less")]
    WeightsSumToZero,

    #[error("buffer allocator: {0}")]
    Allocator(&'static str),

    #[error("backend driver error: {0}")]
    Driver(String),
}
