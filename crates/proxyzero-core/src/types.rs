use crate::error::VerifyError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// Pipeline state. The first three are stages; the rest are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Scanning,
    LocatingAndChecking,
    Capturing,
    Succeeded,
    Cancelled,
    Failed,
}

impl Stage {
    /// Stable lowercase name used on the bus and in logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Scanning => "scanning",
            Stage::LocatingAndChecking => "locating_and_checking",
            Stage::Capturing => "capturing",
            Stage::Succeeded => "succeeded",
            Stage::Cancelled => "cancelled",
            Stage::Failed => "failed",
        }
    }

    /// Status line shown to the user while in this state.
    pub fn status(self) -> &'static str {
        match self {
            Stage::Scanning => "Scan the QR code in class...",
            Stage::LocatingAndChecking => "Verifying your location...",
            Stage::Capturing => "Position your face in the oval.",
            Stage::Succeeded => "Attendance marked.",
            Stage::Cancelled => "Verification cancelled.",
            Stage::Failed => "Verification failed.",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One attempt to verify one user against one class code.
#[derive(Debug, Clone)]
pub struct VerificationSession {
    pub id: Uuid,
    class_code: String,
    user_id: String,
    pub stage: Stage,
    pub last_error: Option<VerifyError>,
    pub started_at: DateTime<Utc>,
}

impl VerificationSession {
    pub fn new(class_code: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            class_code: class_code.into(),
            user_id: user_id.into(),
            stage: Stage::Scanning,
            last_error: None,
            started_at: Utc::now(),
        }
    }

    pub fn class_code(&self) -> &str {
        &self.class_code
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id,
            class_code: self.class_code.clone(),
            user_id: self.user_id.clone(),
            stage: self.stage,
            status: self.stage.status(),
            last_error: self.last_error.as_ref().map(ToString::to_string),
            started_at: self.started_at,
        }
    }
}

/// Read-only copy of a session, published for status queries.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub id: Uuid,
    pub class_code: String,
    pub user_id: String,
    pub stage: Stage,
    pub status: &'static str,
    pub last_error: Option<String>,
    pub started_at: DateTime<Utc>,
}

/// A code decoded from one camera frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanResult {
    pub text: String,
    pub decoded_at: DateTime<Utc>,
}

impl ScanResult {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            decoded_at: Utc::now(),
        }
    }
}

/// A JPEG still destined for exactly one face-match submission.
///
/// Not `Clone`: submitting consumes it.
pub struct CapturedFrame {
    jpeg: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub sequence: u32,
    pub captured_at: DateTime<Utc>,
}

impl CapturedFrame {
    pub fn new(jpeg: Vec<u8>, width: u32, height: u32, sequence: u32) -> Self {
        Self {
            jpeg,
            width,
            height,
            sequence,
            captured_at: Utc::now(),
        }
    }

    pub fn jpeg(&self) -> &[u8] {
        &self.jpeg
    }

    pub fn into_jpeg(self) -> Vec<u8> {
        self.jpeg
    }
}

impl std::fmt::Debug for CapturedFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapturedFrame")
            .field("bytes", &self.jpeg.len())
            .field("width", &self.width)
            .field("height", &self.height)
            .field("sequence", &self.sequence)
            .finish()
    }
}

/// How a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Succeeded { message: String },
    Cancelled,
    Failed(VerifyError),
}

impl Outcome {
    pub fn stage(&self) -> Stage {
        match self {
            Outcome::Succeeded { .. } => Stage::Succeeded,
            Outcome::Cancelled => Stage::Cancelled,
            Outcome::Failed(_) => Stage::Failed,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Succeeded { .. })
    }

    /// Human-readable summary for the collaborator.
    pub fn message(&self) -> String {
        match self {
            Outcome::Succeeded { message } => message.clone(),
            Outcome::Cancelled => Stage::Cancelled.status().to_string(),
            Outcome::Failed(err) => err.to_string(),
        }
    }
}

/// Progress notifications for whoever renders the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    StageEntered { stage: Stage, status: &'static str },
    /// Non-terminal error shown inline; the stage carries on.
    Feedback { error: VerifyError },
    /// A recoverable stage failed and waits for `Retry` or `Decline`.
    RetryOffered { error: VerifyError },
    /// Emitted exactly once per session.
    Finished(Outcome),
}

/// Input from the person being verified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserAction {
    /// Take the face photo.
    Capture,
    /// Run a failed recoverable stage again.
    Retry,
    /// Give up on a failed recoverable stage.
    Decline,
}
