use axum::{
    http::{StatusCode, header},
    response::IntoResponse,
};

pub const HEALTHY_BODY: &str = "Backend is healthy";

pub async fn health() -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        HEALTHY_BODY,
    )
}
