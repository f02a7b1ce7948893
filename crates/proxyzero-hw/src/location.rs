//! One-shot device position fixes.
//!
//! [`GeoClue`] talks to the GeoClue2 service on the system bus. A fix starts
//! a fresh client, waits for its first `LocationUpdated` signal and stops the
//! client again, so no cached position is ever reused.

use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use zbus::zvariant::OwnedObjectPath;

/// GeoClue2 accuracy levels (`GClueAccuracyLevel`).
const ACCURACY_CITY: u32 = 4;
const ACCURACY_EXACT: u32 = 8;

/// Part of a fix's timeout held back for stopping the GeoClue client, so a
/// caller enforcing the same timeout does not drop the fix mid-cleanup.
const STOP_BUDGET: Duration = Duration::from_millis(500);

/// A latitude/longitude pair in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub lat: f64,
    pub lon: f64,
}

/// Parameters of a single position request.
#[derive(Debug, Clone, Copy)]
pub struct FixRequest {
    pub high_accuracy: bool,
    pub timeout: Duration,
}

impl Default for FixRequest {
    fn default() -> Self {
        Self {
            high_accuracy: true,
            timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PositionError {
    #[error("location access denied")]
    PermissionDenied,
    #[error("location unavailable: {0}")]
    Unavailable(String),
    #[error("no location fix within {0:?}")]
    Timeout(Duration),
}

/// Source of one-shot position fixes.
pub trait PositionSource: Send + Sync + 'static {
    fn current_position(
        &self,
        request: FixRequest,
    ) -> impl Future<Output = Result<Coordinates, PositionError>> + Send;
}

#[zbus::proxy(
    interface = "org.freedesktop.GeoClue2.Manager",
    default_service = "org.freedesktop.GeoClue2",
    default_path = "/org/freedesktop/GeoClue2/Manager"
)]
trait Manager {
    async fn get_client(&self) -> zbus::Result<OwnedObjectPath>;
}

#[zbus::proxy(
    interface = "org.freedesktop.GeoClue2.Client",
    default_service = "org.freedesktop.GeoClue2"
)]
trait Client {
    async fn start(&self) -> zbus::Result<()>;
    async fn stop(&self) -> zbus::Result<()>;

    #[zbus(property)]
    fn set_desktop_id(&self, id: &str) -> zbus::Result<()>;

    #[zbus(property)]
    fn set_requested_accuracy_level(&self, level: u32) -> zbus::Result<()>;

    #[zbus(signal)]
    async fn location_updated(
        &self,
        previous: OwnedObjectPath,
        current: OwnedObjectPath,
    ) -> zbus::Result<()>;
}

#[zbus::proxy(
    interface = "org.freedesktop.GeoClue2.Location",
    default_service = "org.freedesktop.GeoClue2"
)]
trait Location {
    #[zbus(property)]
    fn latitude(&self) -> zbus::Result<f64>;

    #[zbus(property)]
    fn longitude(&self) -> zbus::Result<f64>;
}

/// GeoClue2-backed position source.
#[derive(Debug, Clone)]
pub struct GeoClue {
    desktop_id: String,
}

impl GeoClue {
    /// `desktop_id` must match a desktop file GeoClue's agent authorizes.
    pub fn new(desktop_id: impl Into<String>) -> Self {
        Self {
            desktop_id: desktop_id.into(),
        }
    }

    async fn fix(&self, request: FixRequest) -> Result<Coordinates, PositionError> {
        let deadline = signal_deadline(tokio::time::Instant::now(), request.timeout);
        let conn = zbus::Connection::system().await.map_err(classify)?;
        let manager = ManagerProxy::new(&conn).await.map_err(classify)?;
        let client_path = manager.get_client().await.map_err(classify)?;
        let client = ClientProxy::builder(&conn)
            .path(client_path)
            .map_err(classify)?
            .build()
            .await
            .map_err(classify)?;

        client
            .set_desktop_id(&self.desktop_id)
            .await
            .map_err(classify)?;
        let level = if request.high_accuracy {
            ACCURACY_EXACT
        } else {
            ACCURACY_CITY
        };
        client
            .set_requested_accuracy_level(level)
            .await
            .map_err(classify)?;

        let mut updates = client.receive_location_updated().await.map_err(classify)?;
        client.start().await.map_err(classify)?;
        tracing::debug!(desktop_id = %self.desktop_id, level, "geoclue client started");

        let result = match tokio::time::timeout_at(deadline, updates.next()).await {
            Err(_) => Err(PositionError::Timeout(request.timeout)),
            Ok(None) => Err(PositionError::Unavailable(
                "geoclue signal stream ended".into(),
            )),
            Ok(Some(signal)) => read_location(&conn, &signal).await,
        };

        if let Err(e) = client.stop().await {
            tracing::warn!(error = %e, "failed to stop geoclue client");
        }
        result
    }
}

/// When to stop waiting for `LocationUpdated`. Setup counts against the
/// timeout, and [`STOP_BUDGET`] is left over for stopping the client.
fn signal_deadline(
    started: tokio::time::Instant,
    timeout: Duration,
) -> tokio::time::Instant {
    let budget = if timeout > STOP_BUDGET * 2 {
        timeout - STOP_BUDGET
    } else {
        timeout / 2
    };
    started + budget
}

async fn read_location(
    conn: &zbus::Connection,
    signal: &LocationUpdated,
) -> Result<Coordinates, PositionError> {
    let args = signal.args().map_err(classify)?;
    let location = LocationProxy::builder(conn)
        .path(args.current().clone())
        .map_err(classify)?
        .build()
        .await
        .map_err(classify)?;
    Ok(Coordinates {
        lat: location.latitude().await.map_err(classify)?,
        lon: location.longitude().await.map_err(classify)?,
    })
}

impl PositionSource for GeoClue {
    async fn current_position(&self, request: FixRequest) -> Result<Coordinates, PositionError> {
        let coords = self.fix(request).await?;
        tracing::info!(lat = coords.lat, lon = coords.lon, "position fix acquired");
        Ok(coords)
    }
}

/// Map a D-Bus failure to a position error. GeoClue's agent answers with
/// `AccessDenied` when the user has not authorized location access.
fn classify(err: zbus::Error) -> PositionError {
    let denied = match &err {
        zbus::Error::MethodError(name, _, _) => name.as_str().ends_with("AccessDenied"),
        zbus::Error::FDO(fdo) => matches!(**fdo, zbus::fdo::Error::AccessDenied(_)),
        _ => false,
    };
    if denied {
        PositionError::PermissionDenied
    } else {
        PositionError::Unavailable(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access_denied_maps_to_permission() {
        let err = zbus::Error::FDO(Box::new(zbus::fdo::Error::AccessDenied(
            "geoclue agent refused".into(),
        )));
        assert_eq!(classify(err), PositionError::PermissionDenied);
    }

    #[test]
    fn test_other_errors_are_unavailable() {
        let err = zbus::Error::FDO(Box::new(zbus::fdo::Error::ServiceUnknown(
            "org.freedesktop.GeoClue2".into(),
        )));
        assert!(matches!(classify(err), PositionError::Unavailable(_)));
    }

    #[test]
    fn test_signal_wait_leaves_room_to_stop_client() {
        let start = tokio::time::Instant::now();
        let deadline = signal_deadline(start, Duration::from_secs(10));
        assert_eq!(deadline - start, Duration::from_millis(9500));
        assert!(deadline < start + Duration::from_secs(10));
    }

    #[test]
    fn test_short_timeout_splits_budget() {
        let start = tokio::time::Instant::now();
        let deadline = signal_deadline(start, Duration::from_millis(600));
        assert_eq!(deadline - start, Duration::from_millis(300));
    }

    #[test]
    fn test_default_request_is_high_accuracy() {
        let request = FixRequest::default();
        assert!(request.high_accuracy);
        assert_eq!(request.timeout, Duration::from_secs(10));
    }
}
