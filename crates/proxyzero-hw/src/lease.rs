//! Exclusive camera leases.
//!
//! [`CameraManager`] owns the single camera slot. Every open device is
//! wrapped in a [`CameraHandle`]; acquiring a new one closes the previous
//! device first, so front and rear streams never coexist.

use crate::camera::{CameraBackend, CameraDevice, CameraError, Facing, Resolution};
use crate::frame::Frame;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Counters for lease instrumentation.
#[derive(Debug, Default)]
pub struct LeaseStats {
    acquired: AtomicU64,
    released: AtomicU64,
    outstanding: AtomicUsize,
    peak_outstanding: AtomicUsize,
}

/// Point-in-time copy of [`LeaseStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LeaseSnapshot {
    pub acquired: u64,
    pub released: u64,
    pub outstanding: usize,
    pub peak_outstanding: usize,
}

impl LeaseStats {
    fn record_open(&self) {
        self.acquired.fetch_add(1, Ordering::SeqCst);
        let now = self.outstanding.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_outstanding.fetch_max(now, Ordering::SeqCst);
    }

    fn record_close(&self) {
        self.released.fetch_add(1, Ordering::SeqCst);
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> LeaseSnapshot {
        LeaseSnapshot {
            acquired: self.acquired.load(Ordering::SeqCst),
            released: self.released.load(Ordering::SeqCst),
            outstanding: self.outstanding.load(Ordering::SeqCst),
            peak_outstanding: self.peak_outstanding.load(Ordering::SeqCst),
        }
    }
}

struct Lease {
    id: u64,
    facing: Facing,
    resolution: Resolution,
    device: Mutex<Option<Box<dyn CameraDevice>>>,
}

impl Lease {
    fn slot(&self) -> MutexGuard<'_, Option<Box<dyn CameraDevice>>> {
        // A panic inside a driver call leaves the slot usable; the device is
        // either still there or already gone.
        self.device.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Exclusive lease on an open camera.
///
/// Not `Clone`: whoever holds it is the only party capturing from the
/// device. The manager keeps a back-reference so it can force the device
/// closed on cancellation or re-acquisition.
pub struct CameraHandle {
    lease: Arc<Lease>,
}

impl CameraHandle {
    pub fn id(&self) -> u64 {
        self.lease.id
    }

    pub fn facing(&self) -> Facing {
        self.lease.facing
    }

    pub fn resolution(&self) -> Resolution {
        self.lease.resolution
    }

    /// Whether the underlying device is still open.
    pub fn is_live(&self) -> bool {
        self.lease.slot().is_some()
    }

    /// Grab one frame. Fails with [`CameraError::Released`] once the lease
    /// has been released.
    pub async fn capture(&self) -> Result<Frame, CameraError> {
        let lease = Arc::clone(&self.lease);
        tokio::task::spawn_blocking(move || {
            let mut slot = lease.slot();
            match slot.as_mut() {
                Some(device) => device.grab(),
                None => Err(CameraError::Released),
            }
        })
        .await
        .map_err(|e| CameraError::CaptureFailed(format!("capture task failed: {e}")))?
    }
}

impl std::fmt::Debug for CameraHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CameraHandle")
            .field("id", &self.lease.id)
            .field("facing", &self.lease.facing)
            .finish()
    }
}

/// Single-owner camera slot.
pub struct CameraManager {
    backend: Arc<dyn CameraBackend>,
    resolution: Resolution,
    active: Option<Arc<Lease>>,
    next_id: u64,
    stats: Arc<LeaseStats>,
}

impl CameraManager {
    pub fn new(backend: Arc<dyn CameraBackend>, resolution: Resolution) -> Self {
        Self {
            backend,
            resolution,
            active: None,
            next_id: 1,
            stats: Arc::new(LeaseStats::default()),
        }
    }

    /// Shared counters, readable while the manager is in use.
    pub fn stats(&self) -> Arc<LeaseStats> {
        Arc::clone(&self.stats)
    }

    /// Whether a lease is currently open.
    pub fn has_active(&self) -> bool {
        self.active.as_ref().is_some_and(|lease| lease.slot().is_some())
    }

    /// Open the camera facing `facing`.
    ///
    /// Any outstanding lease is closed first. The returned handle is live:
    /// the device is streaming-capable and the indicator is on.
    pub async fn acquire(&mut self, facing: Facing) -> Result<CameraHandle, CameraError> {
        self.release_active().await;

        let backend = Arc::clone(&self.backend);
        let resolution = self.resolution;
        let device = tokio::task::spawn_blocking(move || backend.open(facing, resolution))
            .await
            .map_err(|e| CameraError::CaptureFailed(format!("open task failed: {e}")))??;

        let lease = Arc::new(Lease {
            id: self.next_id,
            facing,
            resolution,
            device: Mutex::new(Some(device)),
        });
        self.next_id += 1;
        self.stats.record_open();
        self.active = Some(Arc::clone(&lease));

        tracing::info!(lease = lease.id, %facing, "camera lease acquired");
        Ok(CameraHandle { lease })
    }

    /// Close the device behind `handle`. No-op if already released.
    pub async fn release(&mut self, handle: &CameraHandle) {
        if self
            .active
            .as_ref()
            .is_some_and(|lease| lease.id == handle.lease.id)
        {
            self.active = None;
        }
        self.close(Arc::clone(&handle.lease)).await;
    }

    /// Close whatever lease is open. No-op when nothing is.
    pub async fn release_active(&mut self) {
        if let Some(lease) = self.active.take() {
            self.close(lease).await;
        }
    }

    async fn close(&self, lease: Arc<Lease>) {
        let id = lease.id;
        let facing = lease.facing;
        // Dropping the device may block on the driver, and waits for any
        // in-flight capture holding the slot.
        let closed = tokio::task::spawn_blocking(move || {
            let device = lease.slot().take();
            device.is_some()
        })
        .await
        .unwrap_or_else(|e| {
            tracing::warn!(lease = id, error = %e, "camera close task failed");
            false
        });
        if closed {
            self.stats.record_close();
            tracing::info!(lease = id, %facing, "camera lease released");
        }
    }
}
