//! Response envelope and error mapping for the public API.

use crate::latest::LatestError;
use crate::query::{PollError, SubmitError};
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use serde::Serialize;
use tracing::{error, warn};

/// Every response body: `code` 0 on success, otherwise the HTTP status.
#[derive(Debug, Serialize)]
pub struct Envelope<T: Serialize> {
    pub code: u16,
    pub message: String,
    pub data: Option<T>,
}

impl<T: Serialize> Envelope<T> {
    pub fn ok(message: &str, data: T) -> Json<Self> {
        Json(Self {
            code: 0,
            message: message.to_owned(),
            data: Some(data),
        })
    }
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
    /// Sent as `Retry-After` on retryable failures.
    pub retry_after_secs: Option<u64>,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            retry_after_secs: None,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self {
            retry_after_secs: Some(1),
            ..Self::new(StatusCode::SERVICE_UNAVAILABLE, message)
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Envelope::<()> {
            code: self.status.as_u16(),
            message: self.message,
            data: None,
        };
        let mut response = (self.status, Json(body)).into_response();
        if let Some(secs) = self.retry_after_secs {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}

impl From<SubmitError> for ApiError {
    fn from(e: SubmitError) -> Self {
        match e {
            SubmitError::InvalidKeyword => ApiError::bad_request(e.to_string()),
            e if e.is_retryable() => {
                warn!(error = %e, "query submission failed, client may retry");
                ApiError::unavailable(e.to_string())
            }
            e => {
                error!(error = %e, "query submission failed");
                ApiError::internal("query submission failed")
            }
        }
    }
}

impl From<PollError> for ApiError {
    fn from(e: PollError) -> Self {
        match e {
            PollError::InvalidRequestId => ApiError::bad_request(e.to_string()),
            PollError::Store(store) if store.is_connectivity() => {
                warn!(error = %store, "poll failed, client may retry");
                ApiError::unavailable(store.to_string())
            }
            PollError::Store(store) => {
                error!(error = %store, "poll failed");
                ApiError::internal("poll failed")
            }
        }
    }
}

impl From<LatestError> for ApiError {
    fn from(e: LatestError) -> Self {
        match e {
            LatestError::InvalidSource => ApiError::bad_request(e.to_string()),
            e if e.is_not_found() => ApiError::not_found(e.to_string()),
            LatestError::Store(store) if store.is_connectivity() => {
                ApiError::unavailable(store.to_string())
            }
            e => {
                error!(error = %e, "latest feed read failed");
                ApiError::internal("failed to read latest data")
            }
        }
    }
}
