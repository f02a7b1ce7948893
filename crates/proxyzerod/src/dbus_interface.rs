use proxyzero_core::{HttpApi, SessionEvent, VerificationService, VerifyError};
use proxyzero_hw::GeoClue;
use std::sync::Arc;
use tokio::sync::mpsc;
use zbus::interface;
use zbus::object_server::SignalEmitter;

pub const BUS_NAME: &str = "io.proxyzero.Attendance1";
pub const OBJECT_PATH: &str = "/io/proxyzero/Attendance1";

pub type DaemonService = VerificationService<GeoClue, HttpApi>;

/// D-Bus interface for the attendance daemon.
///
/// Bus name: io.proxyzero.Attendance1
/// Object path: /io/proxyzero/Attendance1
pub struct AttendanceInterface {
    service: Arc<DaemonService>,
}

impl AttendanceInterface {
    pub fn new(service: Arc<DaemonService>) -> Self {
        Self { service }
    }
}

#[interface(name = "io.proxyzero.Attendance1")]
impl AttendanceInterface {
    /// Run one verification session. Returns once it ends: `(true, message)`
    /// on success, `(false, reason)` on failure or cancellation.
    async fn start_verification(
        &self,
        #[zbus(signal_emitter)] emitter: SignalEmitter<'_>,
        class_code: &str,
        user_id: &str,
    ) -> zbus::fdo::Result<(bool, String)> {
        if class_code.trim().is_empty() || user_id.trim().is_empty() {
            return Err(zbus::fdo::Error::InvalidArgs(
                "class code and user id are required".into(),
            ));
        }
        tracing::info!(class_code, user_id, "verification requested");

        let (tx, mut rx) = mpsc::unbounded_channel();
        let signals = emitter.to_owned();
        let forwarder = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let Err(e) = forward(&signals, &event).await {
                    tracing::warn!(error = %e, "failed to emit session signal");
                }
            }
        });

        let result = self.service.start_verification(class_code, user_id, tx).await;
        // The sender is gone once the session ends; flush remaining signals
        // before replying.
        if let Err(e) = forwarder.await {
            tracing::warn!(error = %e, "signal forwarder failed");
        }

        match result {
            Ok(outcome) => Ok((outcome.is_success(), outcome.message())),
            Err(VerifyError::SessionInProgress) => Err(zbus::fdo::Error::LimitsExceeded(
                VerifyError::SessionInProgress.to_string(),
            )),
            Err(e) => Err(zbus::fdo::Error::Failed(e.to_string())),
        }
    }

    /// Cancel the running session. Returns whether one was running.
    async fn cancel_verification(&self) -> bool {
        self.service.cancel_verification()
    }

    /// Take the face photo.
    async fn capture(&self) -> bool {
        self.service.capture()
    }

    /// Re-run the stage that offered a retry.
    async fn retry(&self) -> bool {
        self.service.retry()
    }

    /// Decline a retry offer.
    async fn decline(&self) -> bool {
        self.service.decline()
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let cameras = self.service.camera_stats();
        let session = self
            .service
            .snapshot()
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "active": self.service.is_active(),
            "session": session,
            "camera": {
                "acquired": cameras.acquired,
                "released": cameras.released,
                "outstanding": cameras.outstanding,
                "peak_outstanding": cameras.peak_outstanding,
            },
        })
        .to_string())
    }

    #[zbus(signal)]
    async fn stage_changed(
        emitter: &SignalEmitter<'_>,
        stage: &str,
        status: &str,
    ) -> zbus::Result<()>;

    #[zbus(signal)]
    async fn feedback(emitter: &SignalEmitter<'_>, message: &str) -> zbus::Result<()>;

    #[zbus(signal)]
    async fn retry_offered(emitter: &SignalEmitter<'_>, message: &str) -> zbus::Result<()>;

    #[zbus(signal)]
    async fn finished(
        emitter: &SignalEmitter<'_>,
        success: bool,
        message: &str,
    ) -> zbus::Result<()>;
}

async fn forward(emitter: &SignalEmitter<'_>, event: &SessionEvent) -> zbus::Result<()> {
    match event {
        SessionEvent::StageEntered { stage, status } => {
            AttendanceInterface::stage_changed(emitter, stage.as_str(), status).await
        }
        SessionEvent::Feedback { error } => {
            AttendanceInterface::feedback(emitter, &error.to_string()).await
        }
        SessionEvent::RetryOffered { error } => {
            AttendanceInterface::retry_offered(emitter, &error.to_string()).await
        }
        SessionEvent::Finished(outcome) => {
            let stage = outcome.stage();
            AttendanceInterface::stage_changed(emitter, stage.as_str(), stage.status()).await?;
            AttendanceInterface::finished(emitter, outcome.is_success(), &outcome.message()).await
        }
    }
}
