//! V4L2 camera capture via the `v4l` crate.
//!
//! [`CameraBackend`] is the seam the lease manager opens devices through;
//! [`V4lBackend`] maps a facing direction to a `/dev/videoN` node.

use crate::frame::{self, Frame};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::Path;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("camera access denied: {0}")]
    PermissionDenied(String),
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("device busy")]
    DeviceBusy,
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("streaming not supported")]
    StreamingNotSupported,
    #[error("camera handle already released")]
    Released,
}

impl CameraError {
    /// Whether the failure is the user withholding camera access.
    pub fn is_permission(&self) -> bool {
        matches!(self, CameraError::PermissionDenied(_))
    }
}

/// Which way the camera faces. Rear scans codes, front captures faces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Facing {
    Rear,
    Front,
}

impl std::fmt::Display for Facing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Facing::Rear => f.write_str("rear"),
            Facing::Front => f.write_str("front"),
        }
    }
}

/// Requested capture size. Drivers may negotiate something else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Default for Resolution {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
        }
    }
}

/// An open camera stream that yields grayscale frames. Blocking.
pub trait CameraDevice: Send {
    fn grab(&mut self) -> Result<Frame, CameraError>;
}

/// Opens camera devices. Blocking; callers run it on the blocking pool.
pub trait CameraBackend: Send + Sync {
    fn open(
        &self,
        facing: Facing,
        resolution: Resolution,
    ) -> Result<Box<dyn CameraDevice>, CameraError>;
}

/// Info about a discovered V4L2 device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// Negotiated pixel format for the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2 packed (2 bytes/pixel, extract Y channel).
    Yuyv,
    /// 8-bit grayscale.
    Grey,
    /// 16-bit little-endian grayscale.
    Y16,
}

/// V4L2 camera device handle. Closing happens on drop.
pub struct Camera {
    device: Device,
    pub width: u32,
    pub height: u32,
    pub device_path: String,
    pub fourcc: FourCC,
    pixel_format: PixelFormat,
}

impl Camera {
    /// Open a V4L2 camera device by path (e.g., "/dev/video0").
    pub fn open(device_path: &str, resolution: Resolution) -> Result<Self, CameraError> {
        if !Path::new(device_path).exists() {
            return Err(CameraError::DeviceNotFound(device_path.to_string()));
        }

        let device = Device::with_path(device_path).map_err(|e| open_error(device_path, e))?;

        let caps = device.query_caps().map_err(|e| {
            CameraError::CaptureFailed(format!("failed to query capabilities: {e}"))
        })?;

        tracing::info!(
            device = device_path,
            driver = %caps.driver,
            card = %caps.card,
            "opened camera"
        );

        if !caps
            .capabilities
            .contains(v4l::capability::Flags::VIDEO_CAPTURE)
        {
            return Err(CameraError::StreamingNotSupported);
        }

        let mut fmt = device.format().map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to get format: {e}"))
        })?;

        fmt.fourcc = FourCC::new(b"YUYV");
        fmt.width = resolution.width;
        fmt.height = resolution.height;

        let negotiated = device.set_format(&fmt).map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to set format: {e}"))
        })?;

        let fourcc = negotiated.fourcc;
        let pixel_format = if fourcc == FourCC::new(b"GREY") {
            PixelFormat::Grey
        } else if fourcc == FourCC::new(b"YUYV") {
            PixelFormat::Yuyv
        } else if fourcc == FourCC::new(b"Y16 ") || fourcc == FourCC::new(b"Y16\0") {
            PixelFormat::Y16
        } else {
            return Err(CameraError::FormatNegotiationFailed(format!(
                "unsupported pixel format: {fourcc:?} (need YUYV, GREY, or Y16)"
            )));
        };

        tracing::info!(
            width = negotiated.width,
            height = negotiated.height,
            fourcc = ?fourcc,
            "negotiated format"
        );

        Ok(Self {
            device,
            width: negotiated.width,
            height: negotiated.height,
            device_path: device_path.to_string(),
            fourcc,
            pixel_format,
        })
    }

    /// Capture a single frame, converting to grayscale if needed.
    pub fn capture_frame(&self) -> Result<Frame, CameraError> {
        let mut stream =
            MmapStream::with_buffers(&self.device, BufType::VideoCapture, 4).map_err(|e| {
                CameraError::CaptureFailed(format!("failed to create mmap stream: {e}"))
            })?;

        let (buf, meta) = stream
            .next()
            .map_err(|e| CameraError::CaptureFailed(format!("failed to dequeue buffer: {e}")))?;

        let gray = self.buf_to_grayscale(buf)?;
        Ok(Frame::from_gray(gray, self.width, self.height, meta.sequence))
    }

    fn buf_to_grayscale(&self, buf: &[u8]) -> Result<Vec<u8>, CameraError> {
        let pixels = (self.width * self.height) as usize;

        match self.pixel_format {
            PixelFormat::Grey => {
                if buf.len() < pixels {
                    return Err(CameraError::CaptureFailed(format!(
                        "GREY buffer too short: expected {pixels}, got {}",
                        buf.len()
                    )));
                }
                Ok(buf[..pixels].to_vec())
            }
            PixelFormat::Y16 => frame::y16_to_grayscale(buf, self.width, self.height)
                .map_err(|e| CameraError::CaptureFailed(format!("Y16 conversion failed: {e}"))),
            PixelFormat::Yuyv => frame::yuyv_to_grayscale(buf, self.width, self.height)
                .map_err(|e| CameraError::CaptureFailed(format!("YUYV conversion failed: {e}"))),
        }
    }

    /// List available V4L2 video capture devices.
    pub fn list_devices() -> Vec<DeviceInfo> {
        let mut devices = Vec::new();

        for i in 0..16 {
            let path = format!("/dev/video{i}");
            if !Path::new(&path).exists() {
                continue;
            }
            let Ok(dev) = Device::with_path(&path) else {
                continue;
            };
            let Ok(caps) = dev.query_caps() else {
                continue;
            };
            if !caps
                .capabilities
                .contains(v4l::capability::Flags::VIDEO_CAPTURE)
            {
                continue;
            }
            devices.push(DeviceInfo {
                path,
                name: caps.card.clone(),
                driver: caps.driver.clone(),
                bus: caps.bus.clone(),
            });
        }

        devices
    }
}

impl CameraDevice for Camera {
    fn grab(&mut self) -> Result<Frame, CameraError> {
        self.capture_frame()
    }
}

impl Drop for Camera {
    fn drop(&mut self) {
        tracing::info!(device = %self.device_path, "closed camera");
    }
}

fn open_error(device_path: &str, e: io::Error) -> CameraError {
    match e.kind() {
        io::ErrorKind::PermissionDenied => CameraError::PermissionDenied(device_path.to_string()),
        _ if e.to_string().contains("busy") || e.to_string().contains("EBUSY") => {
            CameraError::DeviceBusy
        }
        _ => CameraError::DeviceNotFound(format!("{device_path}: {e}")),
    }
}

/// V4L2 backend: one device node per facing direction.
#[derive(Debug, Clone)]
pub struct V4lBackend {
    rear_device: String,
    front_device: String,
}

impl V4lBackend {
    pub fn new(rear_device: impl Into<String>, front_device: impl Into<String>) -> Self {
        Self {
            rear_device: rear_device.into(),
            front_device: front_device.into(),
        }
    }

    /// Device node used for the given facing.
    pub fn device_for(&self, facing: Facing) -> &str {
        match facing {
            Facing::Rear => &self.rear_device,
            Facing::Front => &self.front_device,
        }
    }
}

impl CameraBackend for V4lBackend {
    fn open(
        &self,
        facing: Facing,
        resolution: Resolution,
    ) -> Result<Box<dyn CameraDevice>, CameraError> {
        let camera = Camera::open(self.device_for(facing), resolution)?;
        Ok(Box::new(camera))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_missing_device() {
        let result = Camera::open("/dev/proxyzero-does-not-exist", Resolution::default());
        assert!(matches!(result, Err(CameraError::DeviceNotFound(_))));
    }

    #[test]
    fn test_permission_error_mapping() {
        let err = open_error(
            "/dev/video0",
            io::Error::from(io::ErrorKind::PermissionDenied),
        );
        assert!(err.is_permission());

        let err = open_error("/dev/video0", io::Error::from_raw_os_error(16));
        assert!(matches!(err, CameraError::DeviceBusy));
    }

    #[test]
    fn test_backend_maps_facing() {
        let backend = V4lBackend::new("/dev/video0", "/dev/video2");
        assert_eq!(backend.device_for(Facing::Rear), "/dev/video0");
        assert_eq!(backend.device_for(Facing::Front), "/dev/video2");
    }

    #[test]
    fn test_facing_display() {
        assert_eq!(Facing::Front.to_string(), "front");
        assert_eq!(Facing::Rear.to_string(), "rear");
    }
}
