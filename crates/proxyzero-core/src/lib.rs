//! proxyzero-core: presence verification pipeline.
//!
//! A session scans the class code with the rear camera, confirms the device
//! is inside the class geofence, then matches the user's face with the front
//! camera and records attendance. [`VerificationService`] is the entry point.

pub mod api;
pub mod controller;
pub mod decoder;
pub mod error;
pub mod face;
pub mod location;
pub mod scanner;
pub mod service;
pub mod types;

pub use api::{ApiError, ApiReply, HttpApi, VerificationApi};
pub use controller::{Pipeline, PipelineConfig, SessionIo, VerificationController};
pub use decoder::{CodeDecoder, QrDecoder};
pub use error::{ErrorClass, VerifyError};
pub use face::FaceCaptureSubmitter;
pub use location::LocationVerifier;
pub use scanner::{CodeScanner, ScanFeed, ScannerError};
pub use service::VerificationService;
pub use types::{
    CapturedFrame, Outcome, ScanResult, SessionEvent, SessionSnapshot, Stage, UserAction,
    VerificationSession,
};
