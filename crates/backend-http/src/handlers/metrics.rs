use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{HeaderValue, StatusCode, header},
    response::Response,
};
use backend_metrics::PROMETHEUS_CONTENT_TYPE;
use tracing::error;

use crate::{error::ApiError, router::AppState};

pub async fn prometheus_metrics(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    state.process_metrics.refresh();
    let payload = state.registry.render_prometheus().map_err(|err| {
        error!(error = %err, "failed to render metrics");
        ApiError(err)
    })?;

    let mut response = Response::new(Body::from(payload));
    *response.status_mut() = StatusCode::OK;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(PROMETHEUS_CONTENT_TYPE),
    );

    Ok(response)
}
