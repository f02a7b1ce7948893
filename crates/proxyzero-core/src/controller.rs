//! The verification state machine.
//!
//! One controller drives one session through scan → locate → capture and
//! owns every hardware lease the session takes. It runs in the caller's
//! task; cancellation and user input arrive over channels and are observed
//! at every suspension point.

use crate::api::VerificationApi;
use crate::decoder::CodeDecoder;
use crate::error::VerifyError;
use crate::face::FaceCaptureSubmitter;
use crate::location::LocationVerifier;
use crate::scanner::CodeScanner;
use crate::types::{Outcome, SessionEvent, SessionSnapshot, Stage, UserAction, VerificationSession};
use proxyzero_hw::{CameraHandle, CameraManager, Facing, PositionSource};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// Tunables for one pipeline.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Delay between scanned frames.
    pub scan_interval: Duration,
    /// Hard limit on acquiring a position fix.
    pub location_timeout: Duration,
    /// How long to wait for the user to take the face photo.
    pub action_timeout: Duration,
    /// How long a retry offer stays open. The session keeps its stage and
    /// reports the failure as `last_error` until the user answers.
    pub retry_timeout: Duration,
    /// Face submissions allowed per session.
    pub max_face_attempts: u32,
    /// Take the first photo as soon as the front camera is ready instead of
    /// waiting for [`UserAction::Capture`]. Later attempts always wait.
    pub auto_capture: bool,
    /// Frames grabbed per capture while looking for one that is not dark.
    pub capture_frames: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_millis(100),
            location_timeout: Duration::from_secs(10),
            action_timeout: Duration::from_secs(120),
            retry_timeout: Duration::from_secs(30),
            max_face_attempts: 3,
            auto_capture: false,
            capture_frames: 5,
        }
    }
}

/// The stage components shared by every session of a service.
pub struct Pipeline<P, A> {
    decoder: Arc<dyn CodeDecoder>,
    locator: LocationVerifier<P, A>,
    face: FaceCaptureSubmitter<A>,
    config: PipelineConfig,
}

impl<P: PositionSource, A: VerificationApi> Pipeline<P, A> {
    pub fn new(
        decoder: Arc<dyn CodeDecoder>,
        positions: Arc<P>,
        api: Arc<A>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            decoder,
            locator: LocationVerifier::new(positions, Arc::clone(&api), config.location_timeout),
            face: FaceCaptureSubmitter::new(api, config.capture_frames),
            config,
        }
    }
}

/// Channels connecting a running controller to the outside.
pub struct SessionIo {
    pub actions: mpsc::Receiver<UserAction>,
    pub cancel: watch::Receiver<bool>,
    pub events: mpsc::UnboundedSender<SessionEvent>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Scan,
    Locate,
    Capture,
}

impl Phase {
    fn stage(self) -> Stage {
        match self {
            Phase::Scan => Stage::Scanning,
            Phase::Locate => Stage::LocatingAndChecking,
            Phase::Capture => Stage::Capturing,
        }
    }
}

enum Step {
    Next(Phase),
    Done(Outcome),
}

pub struct VerificationController<'a, P, A> {
    pipeline: &'a Pipeline<P, A>,
    cameras: &'a mut CameraManager,
    scanner: CodeScanner,
    session: VerificationSession,
    io: SessionIo,
    status: &'a watch::Sender<Option<SessionSnapshot>>,
    face_attempts: u32,
    last_wrong_code: Option<String>,
}

impl<'a, P: PositionSource, A: VerificationApi> VerificationController<'a, P, A> {
    pub fn new(
        pipeline: &'a Pipeline<P, A>,
        cameras: &'a mut CameraManager,
        session: VerificationSession,
        io: SessionIo,
        status: &'a watch::Sender<Option<SessionSnapshot>>,
    ) -> Self {
        let scanner = CodeScanner::new(
            Arc::clone(&pipeline.decoder),
            pipeline.config.scan_interval,
        );
        Self {
            pipeline,
            cameras,
            scanner,
            session,
            io,
            status,
            face_attempts: 0,
            last_wrong_code: None,
        }
    }

    /// Drive the session to a terminal state.
    ///
    /// All hardware is released before the outcome is reported, and the
    /// `Finished` event is sent exactly once.
    pub async fn run(mut self) -> Outcome {
        tracing::info!(
            session = %self.session.id,
            class_code = self.session.class_code(),
            user_id = self.session.user_id(),
            "verification started"
        );
        let outcome = self.drive().await;
        self.release_hardware().await;
        self.finish(outcome)
    }

    async fn drive(&mut self) -> Outcome {
        let mut phase = Phase::Scan;
        loop {
            self.enter(phase.stage());
            let step = match phase {
                Phase::Scan => self.scan().await,
                Phase::Locate => self.locate().await,
                Phase::Capture => self.capture().await,
            };
            match step {
                Step::Next(next) => phase = next,
                Step::Done(outcome) => return outcome,
            }
        }
    }

    async fn scan(&mut self) -> Step {
        let handle = match self.acquire(Facing::Rear).await {
            Ok(handle) => handle,
            Err(outcome) => return Step::Done(outcome),
        };
        let mut feed = match self.scanner.start(handle).await {
            Ok(feed) => feed,
            Err((handle, e)) => {
                self.cameras.release(&handle).await;
                return Step::Done(Outcome::Failed(VerifyError::ScannerInit(e.to_string())));
            }
        };

        let step = loop {
            let next = tokio::select! {
                biased;
                _ = cancelled(&mut self.io.cancel) => break Step::Done(Outcome::Cancelled),
                next = feed.next() => next,
            };
            match next {
                Some(Ok(scan)) if scan.text == self.session.class_code() => {
                    tracing::info!(code = %scan.text, "class code matched");
                    break Step::Next(Phase::Locate);
                }
                Some(Ok(scan)) => self.wrong_code(scan.text),
                Some(Err(e)) => break Step::Done(Outcome::Failed(e.into())),
                None => {
                    break Step::Done(Outcome::Failed(VerifyError::ScannerInit(
                        "scanner exited unexpectedly".into(),
                    )))
                }
            }
        };

        drop(feed);
        self.release_hardware().await;
        step
    }

    fn wrong_code(&mut self, scanned: String) {
        if self.last_wrong_code.as_deref() == Some(scanned.as_str()) {
            return;
        }
        tracing::warn!(scanned = %scanned, expected = self.session.class_code(), "wrong class code");
        let error = VerifyError::WrongCode {
            scanned: scanned.clone(),
            expected: self.session.class_code().to_string(),
        };
        self.last_wrong_code = Some(scanned);
        self.feedback(error);
    }

    async fn locate(&mut self) -> Step {
        if self.cameras.has_active() {
            tracing::warn!("camera still open entering location check; releasing");
            self.release_hardware().await;
        }

        let result = tokio::select! {
            biased;
            _ = cancelled(&mut self.io.cancel) => return Step::Done(Outcome::Cancelled),
            result = self.pipeline.locator.verify(self.session.class_code()) => result,
        };
        match result {
            Ok(message) => {
                tracing::info!(%message, "location verified");
                Step::Next(Phase::Capture)
            }
            Err(error) if error.is_recoverable() => self.offer_retry(error, Phase::Locate).await,
            Err(error) => Step::Done(Outcome::Failed(error)),
        }
    }

    /// Report a recoverable failure and let the user pick what happens next.
    async fn offer_retry(&mut self, error: VerifyError, phase: Phase) -> Step {
        self.drain_actions();
        self.session.last_error = Some(error.clone());
        self.publish();
        self.emit(SessionEvent::RetryOffered {
            error: error.clone(),
        });

        let wait = self.pipeline.config.retry_timeout;
        let answer = tokio::select! {
            biased;
            _ = cancelled(&mut self.io.cancel) => return Step::Done(Outcome::Cancelled),
            answer = tokio::time::timeout(
                wait,
                next_action(&mut self.io.actions, &[UserAction::Retry, UserAction::Decline]),
            ) => answer,
        };
        match answer {
            Ok(UserAction::Retry) => {
                tracing::info!(stage = %phase.stage(), "user retrying");
                Step::Next(phase)
            }
            Ok(_) => {
                tracing::info!(stage = %phase.stage(), "user declined retry");
                Step::Done(Outcome::Failed(error))
            }
            Err(_) => {
                tracing::warn!(?wait, "no answer to retry offer");
                Step::Done(Outcome::Failed(error))
            }
        }
    }

    async fn capture(&mut self) -> Step {
        let handle = match self.acquire(Facing::Front).await {
            Ok(handle) => handle,
            Err(outcome) => return Step::Done(outcome),
        };

        // Auto-capture covers the first photo only. After a failed submit the
        // user has to ask again, so no remote call repeats without input.
        if !self.pipeline.config.auto_capture || self.face_attempts > 0 {
            let wait = self.pipeline.config.action_timeout;
            let answer = tokio::select! {
                biased;
                _ = cancelled(&mut self.io.cancel) => return Step::Done(Outcome::Cancelled),
                answer = tokio::time::timeout(
                    wait,
                    next_action(&mut self.io.actions, &[UserAction::Capture]),
                ) => answer,
            };
            if answer.is_err() {
                tracing::warn!(?wait, "no capture requested");
                return Step::Done(Outcome::Failed(VerifyError::Expired(wait)));
            }
        }

        let frame = tokio::select! {
            biased;
            _ = cancelled(&mut self.io.cancel) => return Step::Done(Outcome::Cancelled),
            frame = self.pipeline.face.capture(&handle) => frame,
        };
        self.cameras.release(&handle).await;
        let frame = match frame {
            Ok(frame) => frame,
            Err(error) => return Step::Done(Outcome::Failed(error)),
        };

        self.face_attempts += 1;
        let attempt = self.face_attempts;
        let result = tokio::select! {
            biased;
            _ = cancelled(&mut self.io.cancel) => return Step::Done(Outcome::Cancelled),
            result = self.pipeline.face.submit(
                frame,
                self.session.user_id(),
                self.session.class_code(),
            ) => result,
        };

        match result {
            Ok(message) => Step::Done(Outcome::Succeeded { message }),
            Err(error) if error.is_recoverable() => {
                let max = self.pipeline.config.max_face_attempts;
                if attempt >= max {
                    tracing::warn!(attempt, max, error = %error, "face attempts exhausted");
                    Step::Done(Outcome::Failed(error))
                } else {
                    tracing::warn!(attempt, max, error = %error, "face attempt failed");
                    self.feedback(error);
                    Step::Next(Phase::Capture)
                }
            }
            Err(error) => Step::Done(Outcome::Failed(error)),
        }
    }

    /// Open a camera, giving up early on cancellation.
    async fn acquire(&mut self, facing: Facing) -> Result<CameraHandle, Outcome> {
        let result = tokio::select! {
            biased;
            _ = cancelled(&mut self.io.cancel) => return Err(Outcome::Cancelled),
            result = self.cameras.acquire(facing) => result,
        };
        result.map_err(|e| {
            tracing::warn!(%facing, error = %e, "camera acquisition failed");
            Outcome::Failed(e.into())
        })
    }

    /// Stop the scanner and close every camera lease. Idempotent.
    async fn release_hardware(&mut self) {
        if let Some(handle) = self.scanner.stop().await {
            self.cameras.release(&handle).await;
        }
        self.cameras.release_active().await;
    }

    fn enter(&mut self, stage: Stage) {
        self.drain_actions();
        self.session.stage = stage;
        tracing::info!(session = %self.session.id, %stage, "stage entered");
        self.publish();
        self.emit(SessionEvent::StageEntered {
            stage,
            status: stage.status(),
        });
    }

    fn feedback(&mut self, error: VerifyError) {
        self.session.last_error = Some(error.clone());
        self.publish();
        self.emit(SessionEvent::Feedback { error });
    }

    fn finish(mut self, outcome: Outcome) -> Outcome {
        self.session.stage = outcome.stage();
        if let Outcome::Failed(error) = &outcome {
            self.session.last_error = Some(error.clone());
        }
        match &outcome {
            Outcome::Failed(error) => tracing::warn!(
                session = %self.session.id,
                class = ?error.class(),
                error = %error,
                "verification failed"
            ),
            other => tracing::info!(session = %self.session.id, stage = %other.stage(), "verification finished"),
        }
        self.publish();
        self.emit(SessionEvent::Finished(outcome.clone()));
        outcome
    }

    fn drain_actions(&mut self) {
        while let Ok(action) = self.io.actions.try_recv() {
            tracing::debug!(?action, "discarding stale action");
        }
    }

    fn publish(&self) {
        self.status.send_replace(Some(self.session.snapshot()));
    }

    fn emit(&self, event: SessionEvent) {
        // The listener may have gone away; the session carries on regardless.
        let _ = self.io.events.send(event);
    }
}

/// Resolves once the cancel flag is set. Never resolves if the sender is
/// gone without having cancelled.
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    if cancel.wait_for(|flag| *flag).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Next action in `wanted`, skipping anything else. Never resolves once the
/// action channel is closed.
async fn next_action(actions: &mut mpsc::Receiver<UserAction>, wanted: &[UserAction]) -> UserAction {
    while let Some(action) = actions.recv().await {
        if wanted.contains(&action) {
            return action;
        }
        tracing::debug!(?action, "ignoring action not expected here");
    }
    std::future::pending().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cancelled_sees_flag_set_before_waiting() {
        let (tx, mut rx) = watch::channel(false);
        tx.send_replace(true);
        tokio::time::timeout(Duration::from_secs(1), cancelled(&mut rx))
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_pends_after_sender_drop() {
        let (tx, mut rx) = watch::channel(false);
        drop(tx);
        let res = tokio::time::timeout(Duration::from_secs(5), cancelled(&mut rx)).await;
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn test_next_action_skips_unwanted() {
        let (tx, mut rx) = mpsc::channel(4);
        tx.send(UserAction::Capture).await.unwrap();
        tx.send(UserAction::Decline).await.unwrap();
        let action = next_action(&mut rx, &[UserAction::Retry, UserAction::Decline]).await;
        assert_eq!(action, UserAction::Decline);
    }

    #[test]
    fn test_default_config() {
        let config = PipelineConfig::default();
        assert_eq!(config.max_face_attempts, 3);
        assert_eq!(config.action_timeout, Duration::from_secs(120));
        assert!(config.retry_timeout < config.action_timeout);
        assert!(!config.auto_capture);
    }
}
