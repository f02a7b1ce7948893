//! End-to-end sessions against fake hardware and fake endpoints.

use proxyzero_core::{
    ApiError, ApiReply, CodeDecoder, Outcome, Pipeline, PipelineConfig, SessionEvent, Stage,
    VerificationApi, VerificationService, VerifyError,
};
use proxyzero_hw::{
    CameraBackend, CameraDevice, CameraError, CameraManager, Coordinates, Facing, FixRequest,
    Frame, LeaseStats, PositionError, PositionSource, Resolution,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

const WAIT: Duration = Duration::from_secs(5);

// --- fakes -----------------------------------------------------------------

struct TestDevice {
    counter: Arc<AtomicU32>,
    broken: bool,
}

impl CameraDevice for TestDevice {
    fn grab(&mut self) -> Result<Frame, CameraError> {
        if self.broken {
            return Err(CameraError::CaptureFailed("sensor disconnected".into()));
        }
        // Every frame differs so submitted images can be told apart.
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let level = 40 + (n % 200) as u8;
        Ok(Frame::from_gray(vec![level; 16 * 16], 16, 16, n))
    }
}

#[derive(Default)]
struct TestBackend {
    counter: Arc<AtomicU32>,
    deny: bool,
    broken: bool,
    opened: Mutex<Vec<Facing>>,
}

impl CameraBackend for TestBackend {
    fn open(
        &self,
        facing: Facing,
        _resolution: Resolution,
    ) -> Result<Box<dyn CameraDevice>, CameraError> {
        if self.deny {
            return Err(CameraError::PermissionDenied("/dev/video0".into()));
        }
        self.opened.lock().unwrap().push(facing);
        Ok(Box::new(TestDevice {
            counter: Arc::clone(&self.counter),
            broken: self.broken,
        }))
    }
}

/// Yields the scripted codes one per frame, then nothing.
struct ScriptDecoder {
    codes: Mutex<VecDeque<String>>,
}

impl ScriptDecoder {
    fn new(codes: &[&str]) -> Self {
        Self {
            codes: Mutex::new(codes.iter().map(|c| c.to_string()).collect()),
        }
    }
}

impl CodeDecoder for ScriptDecoder {
    fn decode(&self, _frame: &Frame) -> Vec<String> {
        self.codes.lock().unwrap().pop_front().into_iter().collect()
    }
}

struct TestPosition {
    cameras: Arc<LeaseStats>,
    hang: bool,
    deny: bool,
    calls: AtomicUsize,
    saw_open_camera: AtomicBool,
}

impl PositionSource for TestPosition {
    async fn current_position(&self, request: FixRequest) -> Result<Coordinates, PositionError> {
        assert!(request.high_accuracy);
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.cameras.snapshot().outstanding > 0 {
            self.saw_open_camera.store(true, Ordering::SeqCst);
        }
        if self.deny {
            return Err(PositionError::PermissionDenied);
        }
        if self.hang {
            std::future::pending::<()>().await;
        }
        Ok(Coordinates {
            lat: 28.545,
            lon: 77.192,
        })
    }
}

#[derive(Default)]
struct TestApi {
    location: Mutex<VecDeque<ApiReply>>,
    face: Mutex<VecDeque<ApiReply>>,
    commit: Mutex<VecDeque<ApiReply>>,
    log: Mutex<Vec<&'static str>>,
    face_images: Mutex<Vec<String>>,
    commit_delay: Duration,
    commit_started: Notify,
    commits_done: AtomicUsize,
}

impl TestApi {
    fn calls(&self, name: &str) -> usize {
        self.log.lock().unwrap().iter().filter(|c| **c == name).count()
    }
}

fn replies(items: Vec<ApiReply>) -> Mutex<VecDeque<ApiReply>> {
    Mutex::new(items.into())
}

fn next_reply(queue: &Mutex<VecDeque<ApiReply>>) -> ApiReply {
    queue
        .lock()
        .unwrap()
        .pop_front()
        .unwrap_or_else(|| ApiReply::ok("ok"))
}

impl VerificationApi for TestApi {
    async fn verify_location(
        &self,
        _class_code: &str,
        _coords: Coordinates,
    ) -> Result<ApiReply, ApiError> {
        self.log.lock().unwrap().push("location");
        Ok(next_reply(&self.location))
    }

    async fn verify_face(&self, image: &str, _user_id: &str) -> Result<ApiReply, ApiError> {
        self.log.lock().unwrap().push("face");
        self.face_images.lock().unwrap().push(image.to_string());
        Ok(next_reply(&self.face))
    }

    async fn mark_attendance(
        &self,
        _class_code: &str,
        _user_id: &str,
    ) -> Result<ApiReply, ApiError> {
        self.log.lock().unwrap().push("commit");
        self.commit_started.notify_one();
        if !self.commit_delay.is_zero() {
            tokio::time::sleep(self.commit_delay).await;
        }
        self.commits_done.fetch_add(1, Ordering::SeqCst);
        Ok(next_reply(&self.commit))
    }
}

// --- harness ---------------------------------------------------------------

type Service = VerificationService<TestPosition, TestApi>;

struct Harness {
    service: Arc<Service>,
    api: Arc<TestApi>,
    positions: Arc<TestPosition>,
    backend: Arc<TestBackend>,
    stats: Arc<LeaseStats>,
}

fn config() -> PipelineConfig {
    PipelineConfig {
        scan_interval: Duration::from_millis(5),
        location_timeout: Duration::from_secs(2),
        action_timeout: WAIT,
        retry_timeout: WAIT,
        max_face_attempts: 3,
        auto_capture: true,
        capture_frames: 3,
    }
}

struct Setup {
    codes: Vec<&'static str>,
    api: TestApi,
    config: PipelineConfig,
    backend: TestBackend,
    hang_location: bool,
    deny_location: bool,
}

impl Default for Setup {
    fn default() -> Self {
        Self {
            codes: vec!["CS-306"],
            api: TestApi::default(),
            config: config(),
            backend: TestBackend::default(),
            hang_location: false,
            deny_location: false,
        }
    }
}

fn harness(setup: Setup) -> Harness {
    let backend = Arc::new(setup.backend);
    let cameras = CameraManager::new(
        Arc::clone(&backend) as Arc<dyn CameraBackend>,
        Resolution::default(),
    );
    let stats = cameras.stats();
    let positions = Arc::new(TestPosition {
        cameras: Arc::clone(&stats),
        hang: setup.hang_location,
        deny: setup.deny_location,
        calls: AtomicUsize::new(0),
        saw_open_camera: AtomicBool::new(false),
    });
    let api = Arc::new(setup.api);
    let pipeline = Pipeline::new(
        Arc::new(ScriptDecoder::new(&setup.codes)),
        Arc::clone(&positions),
        Arc::clone(&api),
        setup.config,
    );
    Harness {
        service: Arc::new(VerificationService::new(pipeline, cameras)),
        api,
        positions,
        backend,
        stats,
    }
}

struct Run {
    events: mpsc::UnboundedReceiver<SessionEvent>,
    task: JoinHandle<Result<Outcome, VerifyError>>,
    seen: Vec<SessionEvent>,
}

impl Harness {
    fn start(&self, class_code: &str, user_id: &str) -> Run {
        let (tx, events) = mpsc::unbounded_channel();
        let service = Arc::clone(&self.service);
        let class_code = class_code.to_string();
        let user_id = user_id.to_string();
        let task =
            tokio::spawn(async move { service.start_verification(&class_code, &user_id, tx).await });
        Run {
            events,
            task,
            seen: Vec::new(),
        }
    }

    fn assert_released(&self) {
        let stats = self.stats.snapshot();
        assert_eq!(stats.outstanding, 0, "camera left open: {stats:?}");
        assert!(stats.peak_outstanding <= 1, "two cameras open at once: {stats:?}");
        assert_eq!(stats.acquired, stats.released);
    }
}

impl Run {
    /// Consume events until one matches `pred`.
    async fn until(&mut self, pred: impl Fn(&SessionEvent) -> bool) {
        loop {
            let event = tokio::time::timeout(WAIT, self.events.recv())
                .await
                .expect("timed out waiting for event")
                .expect("event stream ended early");
            let hit = pred(&event);
            self.seen.push(event);
            if hit {
                return;
            }
        }
    }

    async fn outcome(mut self) -> (Outcome, Vec<SessionEvent>) {
        let outcome = tokio::time::timeout(WAIT, self.task)
            .await
            .expect("session did not finish")
            .expect("session task panicked")
            .expect("session rejected");
        while let Some(event) = self.events.recv().await {
            self.seen.push(event);
        }
        (outcome, self.seen)
    }
}

fn entered(stage: Stage) -> impl Fn(&SessionEvent) -> bool {
    move |event| matches!(event, SessionEvent::StageEntered { stage: s, .. } if *s == stage)
}

fn retry_offered(event: &SessionEvent) -> bool {
    matches!(event, SessionEvent::RetryOffered { .. })
}

fn feedback(event: &SessionEvent) -> bool {
    matches!(event, SessionEvent::Feedback { .. })
}

fn stages(events: &[SessionEvent]) -> Vec<Stage> {
    events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::StageEntered { stage, .. } => Some(*stage),
            _ => None,
        })
        .collect()
}

fn finished_count(events: &[SessionEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, SessionEvent::Finished(_)))
        .count()
}

// --- scenarios -------------------------------------------------------------

#[tokio::test]
async fn test_matching_code_runs_full_pipeline() {
    let h = harness(Setup {
        api: TestApi {
            commit: replies(vec![ApiReply::ok("Attendance marked for CS-306")]),
            ..Default::default()
        },
        ..Default::default()
    });

    let (outcome, events) = h.start("CS-306", "101").outcome().await;
    assert_eq!(
        outcome,
        Outcome::Succeeded {
            message: "Attendance marked for CS-306".into()
        }
    );
    assert_eq!(
        stages(&events),
        vec![Stage::Scanning, Stage::LocatingAndChecking, Stage::Capturing]
    );
    assert_eq!(finished_count(&events), 1);
    assert_eq!(*h.api.log.lock().unwrap(), vec!["location", "face", "commit"]);
    assert_eq!(
        *h.backend.opened.lock().unwrap(),
        vec![Facing::Rear, Facing::Front]
    );
    h.assert_released();

    let snapshot = h.service.snapshot().unwrap();
    assert_eq!(snapshot.stage, Stage::Succeeded);
    assert!(!h.service.is_active());
}

#[tokio::test]
async fn test_wrong_code_keeps_scanning_and_reports_once() {
    let h = harness(Setup {
        codes: vec!["CS-101", "CS-101", "CS-101", "CS-306"],
        ..Default::default()
    });

    let mut run = h.start("CS-306", "101");
    run.until(entered(Stage::LocatingAndChecking)).await;

    let feedback: Vec<_> = run
        .seen
        .iter()
        .filter_map(|e| match e {
            SessionEvent::Feedback { error } => Some(error.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(
        feedback,
        vec![VerifyError::WrongCode {
            scanned: "CS-101".into(),
            expected: "CS-306".into(),
        }]
    );
    assert_eq!(
        feedback[0].to_string(),
        "Wrong QR Code. You scanned CS-101, but this class is CS-306."
    );

    let (outcome, _) = run.outcome().await;
    assert!(outcome.is_success());
}

#[tokio::test]
async fn test_geofence_rejection_declined_fails() {
    let h = harness(Setup {
        api: TestApi {
            location: replies(vec![ApiReply::rejected(403, "Too far from classroom")]),
            ..Default::default()
        },
        ..Default::default()
    });

    let mut run = h.start("CS-306", "101");
    run.until(retry_offered).await;
    assert!(h.service.decline());

    let (outcome, events) = run.outcome().await;
    assert_eq!(
        outcome,
        Outcome::Failed(VerifyError::OutsideGeofence("Too far from classroom".into()))
    );
    assert_eq!(finished_count(&events), 1);
    assert!(!events
        .iter()
        .any(|e| matches!(e, SessionEvent::Finished(Outcome::Succeeded { .. }))));
    assert_eq!(h.api.calls("face"), 0);
    h.assert_released();
}

#[tokio::test]
async fn test_geofence_offer_expires_without_answer() {
    let h = harness(Setup {
        api: TestApi {
            location: replies(vec![ApiReply::rejected(403, "Too far from classroom")]),
            ..Default::default()
        },
        config: PipelineConfig {
            retry_timeout: Duration::from_millis(100),
            ..config()
        },
        ..Default::default()
    });

    let (outcome, _) = h.start("CS-306", "101").outcome().await;
    assert_eq!(
        outcome,
        Outcome::Failed(VerifyError::OutsideGeofence("Too far from classroom".into()))
    );
}

#[tokio::test]
async fn test_open_retry_offer_reports_failure_in_snapshot() {
    let h = harness(Setup {
        api: TestApi {
            location: replies(vec![ApiReply::rejected(403, "Too far from classroom")]),
            ..Default::default()
        },
        ..Default::default()
    });

    let mut run = h.start("CS-306", "101");
    run.until(retry_offered).await;
    let snapshot = h.service.snapshot().unwrap();
    assert_eq!(snapshot.stage, Stage::LocatingAndChecking);
    assert_eq!(snapshot.last_error.as_deref(), Some("Too far from classroom"));
    assert!(h.service.is_active());

    assert!(h.service.decline());
    let (outcome, _) = run.outcome().await;
    assert!(!outcome.is_success());
    assert_eq!(h.service.snapshot().unwrap().stage, Stage::Failed);
}

#[tokio::test]
async fn test_location_permission_denied_fails_without_offer() {
    let h = harness(Setup {
        deny_location: true,
        ..Default::default()
    });

    let (outcome, events) = h.start("CS-306", "101").outcome().await;
    assert_eq!(outcome, Outcome::Failed(VerifyError::LocationPermissionDenied));
    assert!(!events.iter().any(retry_offered));
    assert_eq!(h.api.calls("location"), 0);
    assert_eq!(h.api.calls("face"), 0);
    h.assert_released();
}

#[tokio::test]
async fn test_location_timeout_fails_without_offer() {
    let h = harness(Setup {
        hang_location: true,
        config: PipelineConfig {
            location_timeout: Duration::from_millis(100),
            ..config()
        },
        ..Default::default()
    });

    let (outcome, events) = h.start("CS-306", "101").outcome().await;
    assert!(
        matches!(outcome, Outcome::Failed(VerifyError::LocationUnavailable(_))),
        "unexpected outcome: {outcome:?}"
    );
    assert!(!events.iter().any(retry_offered));
    assert_eq!(
        stages(&events),
        vec![Stage::Scanning, Stage::LocatingAndChecking]
    );
    assert_eq!(h.api.calls("location"), 0);
    h.assert_released();
}

#[tokio::test]
async fn test_geofence_retry_rechecks_location() {
    let h = harness(Setup {
        api: TestApi {
            location: replies(vec![
                ApiReply::rejected(503, "Service Unavailable"),
                ApiReply::ok("Location verified"),
            ]),
            ..Default::default()
        },
        ..Default::default()
    });

    let mut run = h.start("CS-306", "101");
    run.until(retry_offered).await;
    assert!(h.service.retry());

    let (outcome, events) = run.outcome().await;
    assert!(outcome.is_success());
    assert_eq!(h.positions.calls.load(Ordering::SeqCst), 2);
    assert_eq!(
        stages(&events),
        vec![
            Stage::Scanning,
            Stage::LocatingAndChecking,
            Stage::LocatingAndChecking,
            Stage::Capturing
        ]
    );
}

#[tokio::test]
async fn test_location_never_requested_with_camera_open() {
    let h = harness(Setup::default());
    let (outcome, _) = h.start("CS-306", "101").outcome().await;
    assert!(outcome.is_success());
    assert_eq!(h.positions.calls.load(Ordering::SeqCst), 1);
    assert!(!h.positions.saw_open_camera.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_face_mismatch_then_match_commits_once_with_second_frame() {
    let h = harness(Setup {
        api: TestApi {
            face: replies(vec![
                ApiReply::rejected(401, "Face does not match"),
                ApiReply::ok("Face verified"),
            ]),
            ..Default::default()
        },
        config: PipelineConfig {
            auto_capture: false,
            ..config()
        },
        ..Default::default()
    });

    let mut run = h.start("CS-306", "101");
    run.until(entered(Stage::Capturing)).await;
    assert!(h.service.capture());
    run.until(feedback).await;
    run.until(entered(Stage::Capturing)).await;
    assert!(h.service.capture());

    let (outcome, events) = run.outcome().await;
    assert!(outcome.is_success());
    assert_eq!(finished_count(&events), 1);
    assert_eq!(
        *h.api.log.lock().unwrap(),
        vec!["location", "face", "face", "commit"]
    );
    let images = h.api.face_images.lock().unwrap();
    assert_eq!(images.len(), 2);
    assert_ne!(images[0], images[1]);
    h.assert_released();
}

#[tokio::test]
async fn test_face_attempts_exhausted() {
    let h = harness(Setup {
        api: TestApi {
            face: replies(vec![
                ApiReply::rejected(401, "Face does not match"),
                ApiReply::rejected(401, "Face does not match"),
            ]),
            ..Default::default()
        },
        config: PipelineConfig {
            max_face_attempts: 2,
            ..config()
        },
        ..Default::default()
    });

    let mut run = h.start("CS-306", "101");
    run.until(feedback).await;
    run.until(entered(Stage::Capturing)).await;
    assert!(h.service.capture());

    let (outcome, _) = run.outcome().await;
    assert_eq!(
        outcome,
        Outcome::Failed(VerifyError::FaceMismatch("Face does not match".into()))
    );
    assert_eq!(h.api.calls("face"), 2);
    assert_eq!(h.api.calls("commit"), 0);
    h.assert_released();
}

#[tokio::test]
async fn test_auto_capture_never_resubmits_without_user() {
    let h = harness(Setup {
        api: TestApi {
            commit: replies(vec![
                ApiReply::rejected(500, "db down"),
                ApiReply::ok("Attendance marked"),
            ]),
            ..Default::default()
        },
        ..Default::default()
    });

    let mut run = h.start("CS-306", "101");
    run.until(feedback).await;
    run.until(entered(Stage::Capturing)).await;

    // Nothing is sent again until the user asks for another photo.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(h.api.calls("face"), 1);
    assert_eq!(h.api.calls("commit"), 1);
    assert!(h.service.is_active());

    assert!(h.service.capture());
    let (outcome, events) = run.outcome().await;
    assert_eq!(
        outcome,
        Outcome::Succeeded {
            message: "Attendance marked".into()
        }
    );
    assert_eq!(finished_count(&events), 1);
    assert_eq!(h.api.calls("commit"), 2);
    h.assert_released();
}

#[tokio::test]
async fn test_auto_capture_expires_after_failed_commit() {
    let h = harness(Setup {
        api: TestApi {
            commit: replies(vec![ApiReply::rejected(500, "db down")]),
            ..Default::default()
        },
        config: PipelineConfig {
            action_timeout: Duration::from_millis(100),
            ..config()
        },
        ..Default::default()
    });

    let (outcome, _) = h.start("CS-306", "101").outcome().await;
    assert_eq!(
        outcome,
        Outcome::Failed(VerifyError::Expired(Duration::from_millis(100)))
    );
    assert_eq!(h.api.calls("commit"), 1);
    h.assert_released();
}

#[tokio::test]
async fn test_commit_service_error_returns_to_capture() {
    let h = harness(Setup {
        api: TestApi {
            commit: replies(vec![ApiReply::rejected(503, "Service Unavailable")]),
            ..Default::default()
        },
        config: PipelineConfig {
            auto_capture: false,
            ..config()
        },
        ..Default::default()
    });

    let mut run = h.start("CS-306", "101");
    run.until(entered(Stage::Capturing)).await;
    assert!(h.service.capture());
    run.until(feedback).await;
    match run.seen.last() {
        Some(SessionEvent::Feedback { error }) => {
            assert_eq!(
                *error,
                VerifyError::AttendanceService("Service Unavailable".into())
            );
        }
        other => panic!("expected feedback, got {other:?}"),
    }
    run.until(entered(Stage::Capturing)).await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.api.calls("commit"), 1);
    let snapshot = h.service.snapshot().unwrap();
    assert_eq!(snapshot.stage, Stage::Capturing);

    assert!(h.service.capture());
    let (outcome, _) = run.outcome().await;
    assert!(outcome.is_success());
    assert_eq!(h.api.calls("face"), 2);
    assert_eq!(h.api.calls("commit"), 2);
    h.assert_released();
}

#[tokio::test]
async fn test_already_marked_is_terminal() {
    let h = harness(Setup {
        api: TestApi {
            commit: replies(vec![ApiReply::rejected(409, "Attendance already marked")]),
            ..Default::default()
        },
        ..Default::default()
    });

    let (outcome, _) = h.start("CS-306", "101").outcome().await;
    assert_eq!(
        outcome,
        Outcome::Failed(VerifyError::AlreadyMarked("Attendance already marked".into()))
    );
    assert_eq!(h.api.calls("face"), 1);
    assert_eq!(h.api.calls("commit"), 1);
}

#[tokio::test]
async fn test_capture_expires_without_user() {
    let h = harness(Setup {
        config: PipelineConfig {
            auto_capture: false,
            action_timeout: Duration::from_millis(100),
            ..config()
        },
        ..Default::default()
    });

    let (outcome, _) = h.start("CS-306", "101").outcome().await;
    assert_eq!(
        outcome,
        Outcome::Failed(VerifyError::Expired(Duration::from_millis(100)))
    );
    assert_eq!(h.api.calls("face"), 0);
    h.assert_released();
}

#[tokio::test]
async fn test_camera_permission_denied() {
    let h = harness(Setup {
        backend: TestBackend {
            deny: true,
            ..Default::default()
        },
        ..Default::default()
    });

    let (outcome, events) = h.start("CS-306", "101").outcome().await;
    assert_eq!(outcome, Outcome::Failed(VerifyError::PermissionDenied));
    assert_eq!(stages(&events), vec![Stage::Scanning]);
    assert_eq!(h.positions.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_camera_failure_while_scanning() {
    let h = harness(Setup {
        backend: TestBackend {
            broken: true,
            ..Default::default()
        },
        ..Default::default()
    });

    let (outcome, events) = h.start("CS-306", "101").outcome().await;
    assert_eq!(
        outcome,
        Outcome::Failed(VerifyError::DeviceUnavailable(
            "capture failed: sensor disconnected".into()
        ))
    );
    assert_eq!(stages(&events), vec![Stage::Scanning]);
    assert_eq!(h.positions.calls.load(Ordering::SeqCst), 0);
    let stats = h.stats.snapshot();
    assert_eq!(stats.acquired, 1);
    h.assert_released();
}

#[tokio::test]
async fn test_scanner_start_failure_releases_camera() {
    let h = harness(Setup {
        config: PipelineConfig {
            scan_interval: Duration::ZERO,
            ..config()
        },
        ..Default::default()
    });

    let (outcome, _) = h.start("CS-306", "101").outcome().await;
    assert!(
        matches!(outcome, Outcome::Failed(VerifyError::ScannerInit(_))),
        "unexpected outcome: {outcome:?}"
    );
    assert_eq!(*h.backend.opened.lock().unwrap(), vec![Facing::Rear]);
    let stats = h.stats.snapshot();
    assert_eq!(stats.acquired, 1);
    h.assert_released();
}

// --- cancellation ----------------------------------------------------------

#[tokio::test]
async fn test_cancel_while_scanning() {
    let h = harness(Setup {
        codes: vec![],
        ..Default::default()
    });

    let mut run = h.start("CS-306", "101");
    run.until(entered(Stage::Scanning)).await;
    // Let the scanner take a few frames.
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(h.service.cancel_verification());

    let (outcome, events) = run.outcome().await;
    assert_eq!(outcome, Outcome::Cancelled);
    assert_eq!(finished_count(&events), 1);
    assert_eq!(h.positions.calls.load(Ordering::SeqCst), 0);
    h.assert_released();
}

#[tokio::test]
async fn test_cancel_while_locating() {
    let h = harness(Setup {
        hang_location: true,
        ..Default::default()
    });

    let mut run = h.start("CS-306", "101");
    run.until(entered(Stage::LocatingAndChecking)).await;
    assert!(h.service.cancel_verification());

    let (outcome, _) = run.outcome().await;
    assert_eq!(outcome, Outcome::Cancelled);
    assert_eq!(h.api.calls("location"), 0);
    h.assert_released();
}

#[tokio::test]
async fn test_cancel_while_waiting_for_capture() {
    let h = harness(Setup {
        config: PipelineConfig {
            auto_capture: false,
            ..config()
        },
        ..Default::default()
    });

    let mut run = h.start("CS-306", "101");
    run.until(entered(Stage::Capturing)).await;
    assert!(h.service.cancel_verification());

    let (outcome, _) = run.outcome().await;
    assert_eq!(outcome, Outcome::Cancelled);
    assert_eq!(h.api.calls("face"), 0);
    h.assert_released();
}

#[tokio::test]
async fn test_cancel_during_commit_discards_late_reply() {
    let h = harness(Setup {
        api: TestApi {
            commit_delay: Duration::from_millis(200),
            ..Default::default()
        },
        ..Default::default()
    });

    let run = h.start("CS-306", "101");
    tokio::time::timeout(WAIT, h.api.commit_started.notified())
        .await
        .expect("commit never dispatched");
    assert!(h.service.cancel_verification());

    let (outcome, events) = run.outcome().await;
    assert_eq!(outcome, Outcome::Cancelled);
    assert_eq!(finished_count(&events), 1);

    // The commit already on the wire still completes.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(h.api.commits_done.load(Ordering::SeqCst), 1);
    h.assert_released();
}

#[tokio::test]
async fn test_double_cancel_is_single_cancel() {
    let h = harness(Setup {
        codes: vec![],
        ..Default::default()
    });

    let mut run = h.start("CS-306", "101");
    run.until(entered(Stage::Scanning)).await;
    h.service.cancel_verification();
    h.service.cancel_verification();

    let (outcome, events) = run.outcome().await;
    assert_eq!(outcome, Outcome::Cancelled);
    assert_eq!(finished_count(&events), 1);
    assert!(!h.service.cancel_verification());
    h.assert_released();
}

#[tokio::test]
async fn test_second_session_rejected_while_running() {
    let h = harness(Setup {
        codes: vec![],
        ..Default::default()
    });

    let mut first = h.start("CS-306", "101");
    first.until(entered(Stage::Scanning)).await;

    let (tx, _rx) = mpsc::unbounded_channel();
    let err = h
        .service
        .start_verification("CS-306", "102", tx)
        .await
        .unwrap_err();
    assert_eq!(err, VerifyError::SessionInProgress);

    h.service.cancel_verification();
    let (outcome, _) = first.outcome().await;
    assert_eq!(outcome, Outcome::Cancelled);
}

#[tokio::test]
async fn test_actions_without_session_are_refused() {
    let h = harness(Setup::default());
    assert!(!h.service.capture());
    assert!(!h.service.retry());
    assert!(!h.service.decline());
    assert!(!h.service.cancel_verification());
    assert!(h.service.snapshot().is_none());
}
