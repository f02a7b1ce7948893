//! Single-session entry points over a shared pipeline.

use crate::api::VerificationApi;
use crate::controller::{Pipeline, SessionIo, VerificationController};
use crate::error::VerifyError;
use crate::types::{Outcome, SessionEvent, SessionSnapshot, UserAction, VerificationSession};
use proxyzero_hw::{CameraManager, LeaseSnapshot, LeaseStats, PositionSource};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

/// User actions buffered between the bus and the controller.
const ACTION_CAPACITY: usize = 8;

struct ActiveSession {
    id: Uuid,
    cancel: watch::Sender<bool>,
    actions: mpsc::Sender<UserAction>,
}

/// Runs at most one verification session at a time.
///
/// Camera ownership doubles as the session gate: whoever holds the camera
/// manager is the running session.
pub struct VerificationService<P, A> {
    pipeline: Pipeline<P, A>,
    cameras: tokio::sync::Mutex<CameraManager>,
    lease_stats: Arc<LeaseStats>,
    active: Mutex<Option<ActiveSession>>,
    status: watch::Sender<Option<SessionSnapshot>>,
}

impl<P: PositionSource, A: VerificationApi> VerificationService<P, A> {
    pub fn new(pipeline: Pipeline<P, A>, cameras: CameraManager) -> Self {
        let lease_stats = cameras.stats();
        let (status, _) = watch::channel(None);
        Self {
            pipeline,
            cameras: tokio::sync::Mutex::new(cameras),
            lease_stats,
            active: Mutex::new(None),
            status,
        }
    }

    /// Run one session for `user_id` in the class identified by `class_code`.
    ///
    /// Resolves when the session reaches a terminal state. Progress is sent
    /// on `events`. Fails with [`VerifyError::SessionInProgress`] if another
    /// session is running; every other failure is reported as
    /// [`Outcome::Failed`].
    pub async fn start_verification(
        &self,
        class_code: &str,
        user_id: &str,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Result<Outcome, VerifyError> {
        let mut cameras = self.cameras.try_lock().map_err(|_| {
            tracing::warn!(class_code, user_id, "rejecting concurrent verification");
            VerifyError::SessionInProgress
        })?;

        let session = VerificationSession::new(class_code, user_id);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (action_tx, action_rx) = mpsc::channel(ACTION_CAPACITY);
        let _active = ActiveGuard::install(
            &self.active,
            ActiveSession {
                id: session.id,
                cancel: cancel_tx,
                actions: action_tx,
            },
        );

        let io = SessionIo {
            actions: action_rx,
            cancel: cancel_rx,
            events,
        };
        let controller =
            VerificationController::new(&self.pipeline, &mut *cameras, session, io, &self.status);
        Ok(controller.run().await)
    }

    /// Cancel the running session. Returns whether one was running.
    ///
    /// Safe to call any number of times.
    pub fn cancel_verification(&self) -> bool {
        match lock(&self.active).as_ref() {
            Some(active) => {
                tracing::info!(session = %active.id, "cancel requested");
                active.cancel.send_replace(true);
                true
            }
            None => false,
        }
    }

    /// Take the face photo. Returns whether a session accepted the action.
    pub fn capture(&self) -> bool {
        self.act(UserAction::Capture)
    }

    /// Re-run the stage waiting on a retry offer.
    pub fn retry(&self) -> bool {
        self.act(UserAction::Retry)
    }

    /// Give up on the stage waiting on a retry offer.
    pub fn decline(&self) -> bool {
        self.act(UserAction::Decline)
    }

    fn act(&self, action: UserAction) -> bool {
        let guard = lock(&self.active);
        let Some(active) = guard.as_ref() else {
            return false;
        };
        match active.actions.try_send(action) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(session = %active.id, ?action, error = %e, "action dropped");
                false
            }
        }
    }

    pub fn is_active(&self) -> bool {
        lock(&self.active).is_some()
    }

    /// The running session, or the last one to finish.
    pub fn snapshot(&self) -> Option<SessionSnapshot> {
        self.status.borrow().clone()
    }

    pub fn camera_stats(&self) -> LeaseSnapshot {
        self.lease_stats.snapshot()
    }
}

/// Clears the active-session slot however the session future ends.
struct ActiveGuard<'a> {
    slot: &'a Mutex<Option<ActiveSession>>,
}

impl<'a> ActiveGuard<'a> {
    fn install(slot: &'a Mutex<Option<ActiveSession>>, session: ActiveSession) -> Self {
        *lock(slot) = Some(session);
        Self { slot }
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        lock(self.slot).take();
    }
}

fn lock(slot: &Mutex<Option<ActiveSession>>) -> MutexGuard<'_, Option<ActiveSession>> {
    slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
