//! proxyzero-hw: device boundary for presence verification.
//!
//! Provides exclusive V4L2 camera leases and one-shot GeoClue2 position
//! fixes.

pub mod camera;
pub mod frame;
pub mod lease;
pub mod location;

pub use camera::{Camera, CameraBackend, CameraDevice, CameraError, Facing, Resolution, V4lBackend};
pub use frame::Frame;
pub use lease::{CameraHandle, CameraManager, LeaseSnapshot, LeaseStats};
pub use location::{Coordinates, FixRequest, GeoClue, PositionError, PositionSource};
