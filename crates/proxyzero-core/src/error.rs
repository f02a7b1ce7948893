//! Verification error taxonomy.

use proxyzero_hw::{CameraError, PositionError};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// How the pipeline reacts to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Camera or location access denied. Terminal; the user must be told.
    Permission,
    /// Hardware unavailable or timed out. Terminal for this attempt.
    Device,
    /// Wrong code, outside the geofence, face not matched. Inline.
    Mismatch,
    /// The side effect already happened. Terminal, never retried.
    Conflict,
    /// Remote endpoint unreachable or failing. User-initiated retry only.
    Service,
    /// Session bookkeeping: expiry or a concurrent session.
    Session,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VerifyError {
    #[error("Could not access camera. Please grant permission.")]
    PermissionDenied,
    #[error("camera unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("Failed to start QR scanner: {0}")]
    ScannerInit(String),
    #[error("Wrong QR Code. You scanned {scanned}, but this class is {expected}.")]
    WrongCode { scanned: String, expected: String },
    #[error("Please allow location access to mark attendance.")]
    LocationPermissionDenied,
    #[error("Could not get your location: {0}")]
    LocationUnavailable(String),
    #[error("{0}")]
    OutsideGeofence(String),
    #[error("location check unavailable: {0}")]
    GeofenceServiceUnavailable(String),
    #[error("{0}")]
    FaceMismatch(String),
    #[error("face verification unavailable: {0}")]
    FaceServiceUnavailable(String),
    #[error("{0}")]
    AlreadyMarked(String),
    #[error("could not mark attendance: {0}")]
    AttendanceService(String),
    #[error("no response within {0:?}")]
    Expired(Duration),
    #[error("a verification session is already in progress")]
    SessionInProgress,
}

impl VerifyError {
    pub fn class(&self) -> ErrorClass {
        match self {
            VerifyError::PermissionDenied | VerifyError::LocationPermissionDenied => {
                ErrorClass::Permission
            }
            VerifyError::DeviceUnavailable(_)
            | VerifyError::ScannerInit(_)
            | VerifyError::LocationUnavailable(_) => ErrorClass::Device,
            VerifyError::WrongCode { .. }
            | VerifyError::OutsideGeofence(_)
            | VerifyError::FaceMismatch(_) => ErrorClass::Mismatch,
            VerifyError::AlreadyMarked(_) => ErrorClass::Conflict,
            VerifyError::GeofenceServiceUnavailable(_)
            | VerifyError::FaceServiceUnavailable(_)
            | VerifyError::AttendanceService(_) => ErrorClass::Service,
            VerifyError::Expired(_) | VerifyError::SessionInProgress => ErrorClass::Session,
        }
    }

    /// Whether the user may try the same stage again.
    pub fn is_recoverable(&self) -> bool {
        matches!(self.class(), ErrorClass::Mismatch | ErrorClass::Service)
    }
}

impl From<CameraError> for VerifyError {
    fn from(err: CameraError) -> Self {
        if err.is_permission() {
            VerifyError::PermissionDenied
        } else {
            VerifyError::DeviceUnavailable(err.to_string())
        }
    }
}

impl From<PositionError> for VerifyError {
    fn from(err: PositionError) -> Self {
        match err {
            PositionError::PermissionDenied => VerifyError::LocationPermissionDenied,
            other => VerifyError::LocationUnavailable(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrong_code_message_names_both_codes() {
        let err = VerifyError::WrongCode {
            scanned: "CS-101".into(),
            expected: "CS-306".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("CS-101"));
        assert!(msg.contains("CS-306"));
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_camera_permission_is_terminal() {
        let err = VerifyError::from(CameraError::PermissionDenied("/dev/video0".into()));
        assert_eq!(err, VerifyError::PermissionDenied);
        assert_eq!(err.class(), ErrorClass::Permission);
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_camera_busy_is_device_error() {
        let err = VerifyError::from(CameraError::DeviceBusy);
        assert_eq!(err.class(), ErrorClass::Device);
    }

    #[test]
    fn test_location_timeout_is_unavailable() {
        let err = VerifyError::from(PositionError::Timeout(Duration::from_secs(10)));
        assert!(matches!(err, VerifyError::LocationUnavailable(_)));
        assert_eq!(err.class(), ErrorClass::Device);
    }

    #[test]
    fn test_already_marked_is_conflict() {
        let err = VerifyError::AlreadyMarked("Attendance already marked".into());
        assert_eq!(err.class(), ErrorClass::Conflict);
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_service_errors_are_recoverable() {
        assert!(VerifyError::FaceServiceUnavailable("502".into()).is_recoverable());
        assert!(VerifyError::AttendanceService("500".into()).is_recoverable());
        assert!(VerifyError::GeofenceServiceUnavailable("timeout".into()).is_recoverable());
    }
}
