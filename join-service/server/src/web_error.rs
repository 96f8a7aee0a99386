use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};

/// Error of the plain HTTP endpoints. Join sessions answer with opaque
/// messages instead.
pub struct AppError(anyhow::Error);

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        log::error!("Health check failed: {:?}", self.0);
        (StatusCode::SERVICE_UNAVAILABLE, "not ready").into_response()
    }
}
