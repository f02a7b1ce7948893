use anyhow::{Context, Result};
use proxyzero_core::{HttpApi, Pipeline, QrDecoder, VerificationService};
use proxyzero_hw::{CameraManager, GeoClue, V4lBackend};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;

use config::Config;
use dbus_interface::{AttendanceInterface, BUS_NAME, OBJECT_PATH};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("proxyzerod starting");

    let config = Config::load().context("failed to load configuration")?;
    tracing::info!(
        api_url = %config.api_url,
        face_api_url = %config.face_api_url,
        rear = %config.rear_device,
        front = %config.front_device,
        width = config.width,
        height = config.height,
        auto_capture = config.auto_capture,
        "configuration loaded"
    );

    let backend = Arc::new(V4lBackend::new(
        config.rear_device.clone(),
        config.front_device.clone(),
    ));
    let cameras = CameraManager::new(backend, config.resolution());
    let api = HttpApi::with_timeout(
        config.api_url.clone(),
        config.face_api_url.clone(),
        config.request_timeout(),
    )
    .context("failed to build HTTP client")?;
    let positions = GeoClue::new(config.geoclue_desktop_id.clone());
    let pipeline = Pipeline::new(
        Arc::new(QrDecoder),
        Arc::new(positions),
        Arc::new(api),
        config.pipeline(),
    );
    let service = Arc::new(VerificationService::new(pipeline, cameras));

    let _conn = zbus::connection::Builder::session()?
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, AttendanceInterface::new(Arc::clone(&service)))?
        .build()
        .await
        .context("failed to register on the session bus")?;

    tracing::info!(bus_name = BUS_NAME, path = OBJECT_PATH, "proxyzerod ready");

    tokio::signal::ctrl_c().await?;
    if service.cancel_verification() {
        tracing::info!("cancelled running session");
    }
    tracing::info!("proxyzerod shutting down");

    Ok(())
}
