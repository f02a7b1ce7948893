//! Face capture and the two-step face-match → attendance commit.

use crate::api::{ApiReply, VerificationApi};
use crate::error::VerifyError;
use crate::types::CapturedFrame;
use base64::Engine;
use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;
use proxyzero_hw::{CameraHandle, Frame};
use std::sync::Arc;

const JPEG_QUALITY: u8 = 90;

pub struct FaceCaptureSubmitter<A> {
    api: Arc<A>,
    max_frames: usize,
}

impl<A: VerificationApi> FaceCaptureSubmitter<A> {
    /// `max_frames` bounds how many frames are grabbed looking for one that
    /// is not dark.
    pub fn new(api: Arc<A>, max_frames: usize) -> Self {
        Self {
            api,
            max_frames: max_frames.max(1),
        }
    }

    /// Grab a still from the front camera and JPEG-encode it.
    ///
    /// Dark frames (lens covered, exposure still settling) are skipped; if
    /// every attempt is dark the brightest one is used.
    pub async fn capture(&self, handle: &CameraHandle) -> Result<CapturedFrame, VerifyError> {
        let mut best: Option<Frame> = None;
        for attempt in 0..self.max_frames {
            let frame = handle.capture().await?;
            if !frame.is_dark {
                best = Some(frame);
                break;
            }
            tracing::debug!(attempt, seq = frame.sequence, "skipping dark frame");
            if best
                .as_ref()
                .map_or(true, |b| frame.avg_brightness() > b.avg_brightness())
            {
                best = Some(frame);
            }
        }
        let frame = best.ok_or_else(|| VerifyError::DeviceUnavailable("no frame captured".into()))?;

        let captured = tokio::task::spawn_blocking(move || encode_jpeg(&frame))
            .await
            .map_err(|e| VerifyError::DeviceUnavailable(format!("encode task failed: {e}")))??;
        tracing::info!(
            bytes = captured.jpeg().len(),
            width = captured.width,
            height = captured.height,
            "face frame captured"
        );
        Ok(captured)
    }

    /// Face-match `frame` against `user_id`, then record attendance.
    ///
    /// The frame is consumed whatever the result. The two calls are not
    /// atomic: a failed commit discards the face match and the caller has
    /// to capture again. Each call, once dispatched, runs to completion even
    /// if this future is dropped; the commit is never dispatched after that.
    pub async fn submit(
        &self,
        frame: CapturedFrame,
        user_id: &str,
        class_code: &str,
    ) -> Result<String, VerifyError> {
        let image = data_url(frame);

        let api = Arc::clone(&self.api);
        let user = user_id.to_string();
        let face = tokio::spawn(async move { api.verify_face(&image, &user).await })
            .await
            .map_err(|e| VerifyError::FaceServiceUnavailable(e.to_string()))?
            .map_err(|e| VerifyError::FaceServiceUnavailable(e.to_string()))?;
        classify_face(face)?;
        tracing::info!(user_id, "face matched");

        let api = Arc::clone(&self.api);
        let code = class_code.to_string();
        let user = user_id.to_string();
        let commit = tokio::spawn(async move { api.mark_attendance(&code, &user).await })
            .await
            .map_err(|e| VerifyError::AttendanceService(e.to_string()))?
            .map_err(|e| VerifyError::AttendanceService(e.to_string()))?;
        let message = classify_commit(commit)?;
        tracing::info!(user_id, class_code, "attendance marked");
        Ok(message)
    }
}

fn encode_jpeg(frame: &Frame) -> Result<CapturedFrame, VerifyError> {
    let mut jpeg = Vec::new();
    JpegEncoder::new_with_quality(&mut jpeg, JPEG_QUALITY)
        .encode(&frame.data, frame.width, frame.height, ExtendedColorType::L8)
        .map_err(|e| VerifyError::DeviceUnavailable(format!("JPEG encoding failed: {e}")))?;
    Ok(CapturedFrame::new(
        jpeg,
        frame.width,
        frame.height,
        frame.sequence,
    ))
}

fn data_url(frame: CapturedFrame) -> String {
    let encoded = base64::engine::general_purpose::STANDARD.encode(frame.into_jpeg());
    format!("data:image/jpeg;base64,{encoded}")
}

fn classify_face(reply: ApiReply) -> Result<(), VerifyError> {
    if reply.success {
        Ok(())
    } else if reply.is_server_error() {
        Err(VerifyError::FaceServiceUnavailable(reply.message))
    } else {
        Err(VerifyError::FaceMismatch(reply.message))
    }
}

fn classify_commit(reply: ApiReply) -> Result<String, VerifyError> {
    if reply.success {
        Ok(reply.message)
    } else if reply.status == 409 || reply.message.to_ascii_lowercase().contains("already") {
        Err(VerifyError::AlreadyMarked(reply.message))
    } else {
        Err(VerifyError::AttendanceService(reply.message))
    }
}
