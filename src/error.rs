//! Error taxonomy for the gateway core.
//!
//! `ScanError` is recovered locally by the orchestrator (per-frequency, logged and skipped) and
//! never crosses the HTTP boundary; only `ChannelNotFound`, `NoTunerAvailable`, and a pre-header
//! `TunerError` are translated into a response. Other locally-scoped conditions (a stalled
//! session, a broken pipe, a malformed capture section) never reach a `Result` at all: the
//! watchdog and pipe plumbing record them as plain teardown reasons or scrollback lines, and the
//! section parser just skips what it can't decode, so they have no corresponding variant here.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("unknown channel: {0}")]
    ChannelNotFound(String),

    #[error("no tuner available")]
    NoTunerAvailable,

    #[error("tuner failed to start: {0}")]
    TunerError(String),

    #[error("scan error: {0}")]
    ScanError(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Sql(#[from] rusqlite::Error),
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = match &self {
            GatewayError::ChannelNotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::NoTunerAvailable => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::TunerError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
