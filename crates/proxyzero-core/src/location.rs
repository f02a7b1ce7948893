//! Geofence check: one position fix, one `verify-location` call.

use crate::api::VerificationApi;
use crate::error::VerifyError;
use proxyzero_hw::{Coordinates, FixRequest, PositionError, PositionSource};
use std::sync::Arc;
use std::time::Duration;

pub struct LocationVerifier<P, A> {
    positions: Arc<P>,
    api: Arc<A>,
    timeout: Duration,
}

impl<P: PositionSource, A: VerificationApi> LocationVerifier<P, A> {
    pub fn new(positions: Arc<P>, api: Arc<A>, timeout: Duration) -> Self {
        Self {
            positions,
            api,
            timeout,
        }
    }

    /// Confirm the device is inside the class geofence.
    ///
    /// No retries. Once the check is on the wire it runs to completion even
    /// if this future is dropped; its reply is then discarded.
    pub async fn verify(&self, class_code: &str) -> Result<String, VerifyError> {
        let coords = self.fix().await?;

        let api = Arc::clone(&self.api);
        let code = class_code.to_string();
        let reply = tokio::spawn(async move { api.verify_location(&code, coords).await })
            .await
            .map_err(|e| VerifyError::GeofenceServiceUnavailable(e.to_string()))?
            .map_err(|e| VerifyError::GeofenceServiceUnavailable(e.to_string()))?;

        if reply.success {
            tracing::info!(class_code, "location confirmed inside geofence");
            Ok(reply.message)
        } else if reply.is_server_error() {
            Err(VerifyError::GeofenceServiceUnavailable(reply.message))
        } else {
            tracing::warn!(class_code, message = %reply.message, "location outside geofence");
            Err(VerifyError::OutsideGeofence(reply.message))
        }
    }

    async fn fix(&self) -> Result<Coordinates, VerifyError> {
        let request = FixRequest {
            high_accuracy: true,
            timeout: self.timeout,
        };
        match tokio::time::timeout(self.timeout, self.positions.current_position(request)).await {
            Ok(Ok(coords)) => Ok(coords),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(PositionError::Timeout(self.timeout).into()),
        }
    }
}
