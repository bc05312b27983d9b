//! HTTP error envelope.
//!
//! Deep layers return kinded [`pennant_core::Error`]s; this module maps them
//! to status codes and the `{error, message}` JSON body every 4xx/5xx
//! carries. The mapping is the whole error taxonomy in one place: validation
//! is never retried, 401 and 403 are never conflated, upstream failures are
//! 5xx.
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

/// An error ready to leave the process.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    message: &'a str,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        ApiError {
            status,
            code,
            message: message.into(),
        }
    }

    pub fn unauthorized() -> Self {
        ApiError::new(
            StatusCode::UNAUTHORIZED,
            "unauthorized",
            "token is missing, invalid, or expired",
        )
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        ApiError::new(StatusCode::FORBIDDEN, "forbidden", message)
    }

    pub fn not_found(what: &str) -> Self {
        ApiError::new(StatusCode::NOT_FOUND, "not_found", format!("{what} not found"))
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        ApiError::new(StatusCode::BAD_REQUEST, "bad_request", message)
    }
}

impl From<pennant_core::Error> for ApiError {
    fn from(err: pennant_core::Error) -> Self {
        use pennant_core::Error;
        match &err {
            Error::Validation(message) => {
                ApiError::new(StatusCode::BAD_REQUEST, "validation_failed", message.clone())
            }
            Error::NotFound(what) => ApiError::not_found(what),
            Error::Conflict(message) => {
                ApiError::new(StatusCode::CONFLICT, "conflict", message.clone())
            }
            Error::Unauthorized => ApiError::unauthorized(),
            Error::Forbidden => ApiError::forbidden("token is not allowed to do this"),
            Error::Unavailable(_) | Error::Io(_) => {
                log::error!(target: "pennant_edge", error:display = err; "upstream unavailable");
                ApiError::new(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "upstream_unavailable",
                    "a backing service is unavailable",
                )
            }
            Error::Timeout => ApiError::new(
                StatusCode::GATEWAY_TIMEOUT,
                "timeout",
                "the operation did not complete in time",
            ),
            Error::Evaluation(_) | Error::Internal(_) => {
                log::error!(target: "pennant_edge", error:display = err; "internal error");
                ApiError::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal",
                    "internal error",
                )
            }
            _ => {
                log::error!(target: "pennant_edge", error:display = err; "internal error");
                ApiError::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal",
                    "internal error",
                )
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorBody {
                error: self.code,
                message: &self.message,
            }),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unauthorized_and_forbidden_stay_distinct() {
        assert_eq!(
            ApiError::from(pennant_core::Error::Unauthorized).status,
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ApiError::from(pennant_core::Error::Forbidden).status,
            StatusCode::FORBIDDEN
        );
    }

    #[test]
    fn kinds_map_to_expected_codes() {
        let cases = [
            (
                pennant_core::Error::Validation("x".into()),
                StatusCode::BAD_REQUEST,
            ),
            (pennant_core::Error::NotFound("flag"), StatusCode::NOT_FOUND),
            (
                pennant_core::Error::Conflict("x".into()),
                StatusCode::CONFLICT,
            ),
            (
                pennant_core::Error::Unavailable("cache".into()),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (pennant_core::Error::Timeout, StatusCode::GATEWAY_TIMEOUT),
            (
                pennant_core::Error::Internal("x".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status, status);
        }
    }
}
