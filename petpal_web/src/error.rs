use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use petpal::{ActuationError, ScheduleError};

use crate::page;

/// Unified error type for HTTP responses.
///
/// The control page is a plain HTML form, so errors come back as a short
/// HTML page with a link home rather than JSON.
#[derive(Debug)]
pub struct AppError(pub anyhow::Error);

impl AppError {
    pub fn status(&self) -> StatusCode {
        if let Some(e) = self.0.downcast_ref::<ScheduleError>() {
            return match e {
                ScheduleError::InvalidFeedingTime(_) => StatusCode::BAD_REQUEST,
            };
        }
        if let Some(e) = self.0.downcast_ref::<ActuationError>() {
            return match e {
                ActuationError::Busy | ActuationError::AlreadyActivated => StatusCode::CONFLICT,
                ActuationError::ShutDown => StatusCode::SERVICE_UNAVAILABLE,
            };
        }
        StatusCode::INTERNAL_SERVER_ERROR
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self.0, "request failed");
        } else {
            tracing::warn!(error = %self.0, %status, "request rejected");
        }
        (status, Html(page::render_error(status, &self.0.to_string()))).into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}
