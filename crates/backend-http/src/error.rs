use axum::{
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use backend_common::error::BackendError;

pub struct ApiError(pub BackendError);

impl From<BackendError> for ApiError {
    fn from(value: BackendError) -> Self {
        Self(value)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0 {
            BackendError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            BackendError::InternalError(_) | BackendError::Io(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        (
            status,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            format!("{}: {}", self.0.error_code(), self.0),
        )
            .into_response()
    }
}
