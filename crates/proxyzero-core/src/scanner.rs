//! Continuous code scanning on a camera lease.
//!
//! [`CodeScanner::start`] moves the camera handle into a background task
//! that grabs frames at a fixed rate and forwards every decoded code on a
//! [`ScanFeed`]. [`CodeScanner::stop`] ends the task, waits for it to exit
//! and hands the camera back.

use crate::decoder::CodeDecoder;
use crate::types::ScanResult;
use proxyzero_hw::{CameraError, CameraHandle};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Decodes buffered between the scan task and the consumer.
const FEED_CAPACITY: usize = 16;

#[derive(Error, Debug)]
pub enum ScannerError {
    #[error("camera handle is not live")]
    HandleReleased,
    #[error("scan interval must be non-zero")]
    InvalidInterval,
}

/// Subscription to a running scan. Yields until the scanner stops or the
/// camera fails.
pub struct ScanFeed {
    rx: mpsc::Receiver<Result<ScanResult, CameraError>>,
}

impl ScanFeed {
    pub async fn next(&mut self) -> Option<Result<ScanResult, CameraError>> {
        self.rx.recv().await
    }
}

struct ScanTask {
    stop: oneshot::Sender<()>,
    join: JoinHandle<CameraHandle>,
}

pub struct CodeScanner {
    decoder: Arc<dyn CodeDecoder>,
    interval: Duration,
    running: Option<ScanTask>,
}

impl CodeScanner {
    pub fn new(decoder: Arc<dyn CodeDecoder>, interval: Duration) -> Self {
        Self {
            decoder,
            interval,
            running: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Start decoding frames from `handle`. A running scan is stopped first.
    ///
    /// On failure the handle is returned alongside the error so the caller
    /// can release it.
    pub async fn start(
        &mut self,
        handle: CameraHandle,
    ) -> Result<ScanFeed, (CameraHandle, ScannerError)> {
        if let Some(previous) = self.stop().await {
            tracing::debug!(lease = previous.id(), "restarting scanner");
        }
        if self.interval.is_zero() {
            return Err((handle, ScannerError::InvalidInterval));
        }
        if !handle.is_live() {
            return Err((handle, ScannerError::HandleReleased));
        }

        let (tx, rx) = mpsc::channel(FEED_CAPACITY);
        let (stop_tx, stop_rx) = oneshot::channel();
        let decoder = Arc::clone(&self.decoder);
        let interval = self.interval;
        tracing::info!(lease = handle.id(), ?interval, "scanner started");

        let join = tokio::spawn(scan_loop(handle, decoder, interval, tx, stop_rx));
        self.running = Some(ScanTask {
            stop: stop_tx,
            join,
        });
        Ok(ScanFeed { rx })
    }

    /// Halt decoding and wait for the scan task to exit. Idempotent.
    pub async fn stop(&mut self) -> Option<CameraHandle> {
        let task = self.running.take()?;
        let _ = task.stop.send(());
        match task.join.await {
            Ok(handle) => {
                tracing::info!(lease = handle.id(), "scanner stopped");
                Some(handle)
            }
            Err(e) => {
                tracing::warn!(error = %e, "scan task did not exit cleanly");
                None
            }
        }
    }
}

async fn scan_loop(
    handle: CameraHandle,
    decoder: Arc<dyn CodeDecoder>,
    interval: Duration,
    tx: mpsc::Sender<Result<ScanResult, CameraError>>,
    mut stop: oneshot::Receiver<()>,
) -> CameraHandle {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    'scan: loop {
        tokio::select! {
            biased;
            _ = &mut stop => break,
            _ = ticker.tick() => {}
        }

        let frame = match handle.capture().await {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(lease = handle.id(), error = %e, "scan capture failed");
                let _ = tx.try_send(Err(e));
                break;
            }
        };
        if frame.is_dark {
            tracing::trace!(seq = frame.sequence, "skipping dark frame");
            continue;
        }

        let decoder = Arc::clone(&decoder);
        let codes = match tokio::task::spawn_blocking(move || decoder.decode(&frame)).await {
            Ok(codes) => codes,
            Err(e) => {
                tracing::warn!(error = %e, "decode task failed");
                continue;
            }
        };

        for text in codes {
            tracing::debug!(code = %text, "decoded code");
            match tx.try_send(Ok(ScanResult::new(text))) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::trace!("scan feed full, dropping decode");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => break 'scan,
            }
        }
    }

    handle
}
