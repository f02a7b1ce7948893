//! Remote verification endpoints.
//!
//! Two backends: the attendance server answers `verify-location` and
//! `mark-attendance`, the face server answers `verify-face`. Every endpoint
//! replies `{success?, message}`; classifying a reply into a pipeline error
//! is left to the stage that made the call.

use proxyzero_hw::Coordinates;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

/// Default timeout for a single request.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default connection timeout.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    #[error("endpoint unreachable: {0}")]
    Unreachable(String),
    #[error("request failed: {0}")]
    RequestFailed(String),
}

/// A decoded endpoint reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiReply {
    pub status: u16,
    pub success: bool,
    pub message: String,
}

impl ApiReply {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            status: 200,
            success: true,
            message: message.into(),
        }
    }

    pub fn rejected(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            success: false,
            message: message.into(),
        }
    }

    pub fn is_server_error(&self) -> bool {
        self.status >= 500
    }
}

/// The three remote calls the pipeline makes.
pub trait VerificationApi: Send + Sync + 'static {
    fn verify_location(
        &self,
        class_code: &str,
        coords: Coordinates,
    ) -> impl Future<Output = Result<ApiReply, ApiError>> + Send;

    /// `image` is a `data:image/jpeg;base64,...` URL.
    fn verify_face(
        &self,
        image: &str,
        user_id: &str,
    ) -> impl Future<Output = Result<ApiReply, ApiError>> + Send;

    fn mark_attendance(
        &self,
        class_code: &str,
        user_id: &str,
    ) -> impl Future<Output = Result<ApiReply, ApiError>> + Send;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LocationRequest<'a> {
    class_code: &'a str,
    coords: Coordinates,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FaceRequest<'a> {
    image: &'a str,
    user_id: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AttendanceRequest<'a> {
    class_code: &'a str,
    user_id: &'a str,
}

/// Raw JSON reply body.
#[derive(Debug, Deserialize)]
struct ReplyBody {
    #[serde(default)]
    success: Option<bool>,
    #[serde(default)]
    message: Option<String>,
}

/// HTTP client for both backends.
#[derive(Clone)]
pub struct HttpApi {
    http: reqwest::Client,
    api_url: String,
    face_api_url: String,
}

impl HttpApi {
    /// `api_url` serves location and attendance, `face_api_url` serves face matching.
    pub fn new(
        api_url: impl Into<String>,
        face_api_url: impl Into<String>,
    ) -> Result<Self, ApiError> {
        Self::with_timeout(api_url, face_api_url, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(
        api_url: impl Into<String>,
        face_api_url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(DEFAULT_CONNECT_TIMEOUT)
            .build()
            .map_err(|e| ApiError::RequestFailed(format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            http,
            api_url: api_url.into(),
            face_api_url: face_api_url.into(),
        })
    }

    async fn post<T: Serialize + ?Sized>(
        &self,
        base: &str,
        endpoint: &str,
        body: &T,
    ) -> Result<ApiReply, ApiError> {
        let url = endpoint_url(base, endpoint);
        let response = self
            .http
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ApiError::Unreachable(format!("request timed out: {e}"))
                } else if e.is_connect() {
                    ApiError::Unreachable(format!("connection failed: {e}"))
                } else {
                    ApiError::RequestFailed(e.to_string())
                }
            })?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ApiError::RequestFailed(format!("failed to read body: {e}")))?;
        let reply = parse_reply(status.as_u16(), status.is_success(), &text, || {
            status
                .canonical_reason()
                .unwrap_or("unexpected response")
                .to_string()
        });

        tracing::debug!(
            url = %url,
            status = reply.status,
            success = reply.success,
            "endpoint replied"
        );
        Ok(reply)
    }
}

impl VerificationApi for HttpApi {
    async fn verify_location(
        &self,
        class_code: &str,
        coords: Coordinates,
    ) -> Result<ApiReply, ApiError> {
        let body = LocationRequest { class_code, coords };
        self.post(&self.api_url, "verify-location", &body).await
    }

    async fn verify_face(&self, image: &str, user_id: &str) -> Result<ApiReply, ApiError> {
        let body = FaceRequest { image, user_id };
        self.post(&self.face_api_url, "verify-face", &body).await
    }

    async fn mark_attendance(
        &self,
        class_code: &str,
        user_id: &str,
    ) -> Result<ApiReply, ApiError> {
        let body = AttendanceRequest {
            class_code,
            user_id,
        };
        self.post(&self.api_url, "mark-attendance", &body).await
    }
}

fn endpoint_url(base: &str, endpoint: &str) -> String {
    format!("{}/api/{endpoint}", base.trim_end_matches('/'))
}

/// A reply succeeds when the status is 2xx and the body does not say
/// `success: false`. Bodies that are not JSON fall back to `fallback()`.
fn parse_reply(
    status: u16,
    status_ok: bool,
    text: &str,
    fallback: impl FnOnce() -> String,
) -> ApiReply {
    let body: Option<ReplyBody> = serde_json::from_str(text).ok();
    let (success, message) = match body {
        Some(body) => (body.success, body.message),
        None => (None, None),
    };
    ApiReply {
        status,
        success: status_ok && success != Some(false),
        message: message.unwrap_or_else(fallback),
    }
}
