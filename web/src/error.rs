use std::error::Error as StdError;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use log::*;

use sse::error::{Error as SseError, ErrorKind};

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    Sse(SseError),
    /// The caller did not present valid cluster credentials.
    Unauthorized,
}

impl StdError for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> core::result::Result<(), std::fmt::Error> {
        match self {
            Error::Sse(err) => write!(fmt, "{err}"),
            Error::Unauthorized => write!(fmt, "Unauthorized"),
        }
    }
}

// List of possible StatusCode variants https://docs.rs/http/latest/http/status/struct.StatusCode.html
impl IntoResponse for Error {
    fn into_response(self) -> Response {
        match self {
            Error::Unauthorized => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED").into_response(),
            Error::Sse(err) => match err.error_kind {
                ErrorKind::InvalidTarget => {
                    warn!("Rejected request: {err}");
                    (StatusCode::BAD_REQUEST, "BAD REQUEST").into_response()
                }
                ErrorKind::ClosedRegistry => {
                    (StatusCode::SERVICE_UNAVAILABLE, "SERVICE UNAVAILABLE").into_response()
                }
                _ => {
                    error!("Request failed: {err}");
                    (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL SERVER ERROR").into_response()
                }
            },
        }
    }
}

impl<E> From<E> for Error
where
    E: Into<SseError>,
{
    fn from(err: E) -> Self {
        Self::Sse(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sse::error::{closed_error, invalid_target};

    #[test]
    fn error_kinds_map_to_status_codes() {
        let cases = [
            (Error::from(invalid_target("bad method")), StatusCode::BAD_REQUEST),
            (Error::from(closed_error("shut down")), StatusCode::SERVICE_UNAVAILABLE),
            (Error::Unauthorized, StatusCode::UNAUTHORIZED),
            (
                Error::from(SseError::new(ErrorKind::TransportWrite, "gone")),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (error, status) in cases {
            assert_eq!(error.into_response().status(), status);
        }
    }

    #[test]
    fn serde_errors_convert_through_the_core_error() {
        let parse = serde_json::from_str::<u8>("x").unwrap_err();
        let error = Error::from(parse);
        assert!(matches!(error, Error::Sse(ref e) if e.error_kind == ErrorKind::Serialization));
    }
}
