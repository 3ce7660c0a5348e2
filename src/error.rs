use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

/// Stable, machine-readable error kinds surfaced over the HTTP API and in logs.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("invalid recipient: {0}")]
    InvalidRecipient(String),
    #[error("required schema missing: {0}")]
    SchemaMissing(String),
    #[error("session backend unreachable: {0}")]
    SessionUnavailable(String),
    #[error("protocol client is not connected")]
    NotConnected,
    #[error("no paired device")]
    NotAuthenticated,
    #[error("not found")]
    NotFound,
    #[error("message carries no media")]
    NoMedia,
    #[error("media decrypt failed: {0}")]
    DecryptFailed(String),
    #[error("media upload failed: {0}")]
    UploadFailed(String),
    #[error("send failed: {0}")]
    SendFailed(String),
    #[error("file too large")]
    TooLarge,
    #[error("voice conversion unavailable: ffmpeg not on PATH")]
    VoiceConversionUnavailable,
    #[error("operation timed out")]
    Timeout,
    #[error("local I/O failed: {0}")]
    IOFailed(String),
    #[error("library error: {0}")]
    LibraryError(String),
}

pub type BridgeResult<T> = Result<T, BridgeError>;

impl BridgeError {
    /// The stable string surfaced as `error` in HTTP JSON bodies and in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            BridgeError::InvalidRequest(_) => "InvalidRequest",
            BridgeError::InvalidRecipient(_) => "InvalidRecipient",
            BridgeError::SchemaMissing(_) => "SchemaMissing",
            BridgeError::SessionUnavailable(_) => "SessionUnavailable",
            BridgeError::NotConnected => "NotConnected",
            BridgeError::NotAuthenticated => "NotAuthenticated",
            BridgeError::NotFound => "NotFound",
            BridgeError::NoMedia => "NoMedia",
            BridgeError::DecryptFailed(_) => "DecryptFailed",
            BridgeError::UploadFailed(_) => "UploadFailed",
            BridgeError::SendFailed(_) => "SendFailed",
            BridgeError::TooLarge => "TooLarge",
            BridgeError::VoiceConversionUnavailable => "VoiceConversionUnavailable",
            BridgeError::Timeout => "Timeout",
            BridgeError::IOFailed(_) => "IOFailed",
            BridgeError::LibraryError(_) => "LibraryError",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            BridgeError::InvalidRequest(_)
            | BridgeError::InvalidRecipient(_)
            | BridgeError::TooLarge => StatusCode::BAD_REQUEST,
            BridgeError::NotFound | BridgeError::NoMedia => StatusCode::NOT_FOUND,
            BridgeError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    success: bool,
    error: &'static str,
    detail: String,
}

impl IntoResponse for BridgeError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ErrorBody {
            success: false,
            error: self.kind(),
            detail: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}
