use std::{
    pin::Pin,
    sync::Arc,
    task::{Context, Poll, ready},
};

use axum::{
    body::Body,
    extract::{MatchedPath, Request, State},
    http::{Method, StatusCode},
    middleware::Next,
    response::Response,
};
use backend_metrics::{HttpMetrics, RequestTimer};
use http_body::{Frame, SizeHint};
use pin_project_lite::pin_project;
use tracing::debug;

use crate::router::AppState;

/// `status_code` label for requests that ended before the response body was
/// fully handed to the connection, e.g. because the client went away.
pub const ABORTED_STATUS_LABEL: &str = "aborted";

pub const UNKNOWN_LABEL: &str = "unknown";

/// Times every request and records it into `http_request_duration_seconds`.
///
/// Must be installed with `Router::layer` after all routes and the fallback
/// are added, so it sees the matched route and also covers unmatched paths.
/// The observation is made once the response body reaches end of stream;
/// the response itself is passed through untouched.
pub async fn track_request_duration(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let sends_body = *request.method() != Method::HEAD;
    let method = method_label(&request);
    let route = route_label(&request);
    let mut in_flight = InFlightRequest::start(Arc::clone(&state.http_metrics), method, route);

    let response = next.run(request).await;
    let status = response.status();
    in_flight.responded(status);

    let (parts, body) = response.into_parts();
    if !sends_body || !status_allows_body(status) || http_body::Body::is_end_stream(&body) {
        in_flight.finish();
        return Response::from_parts(parts, body);
    }

    Response::from_parts(parts, Body::new(InstrumentedBody::new(body, in_flight)))
}

fn status_allows_body(status: StatusCode) -> bool {
    !(status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED)
}

fn method_label(request: &Request) -> String {
    let method = request.method().as_str();
    if method.is_empty() {
        UNKNOWN_LABEL.to_string()
    } else {
        method.to_string()
    }
}

// Matched route pattern first, raw path second.
fn route_label(request: &Request) -> String {
    if let Some(matched) = request.extensions().get::<MatchedPath>() {
        return matched.as_str().to_string();
    }

    let path = request.uri().path();
    if path.is_empty() {
        UNKNOWN_LABEL.to_string()
    } else {
        path.to_string()
    }
}

struct InFlightRequest {
    metrics: Arc<HttpMetrics>,
    timer: Option<RequestTimer>,
    method: String,
    route: String,
    status_code: Option<StatusCode>,
}

impl InFlightRequest {
    fn start(metrics: Arc<HttpMetrics>, method: String, route: String) -> Self {
        let timer = Some(metrics.start_timer());
        Self {
            metrics,
            timer,
            method,
            route,
            status_code: None,
        }
    }

    fn responded(&mut self, status_code: StatusCode) {
        self.status_code = Some(status_code);
    }

    fn finish(mut self) {
        let status_code = self.status_code;
        match status_code {
            Some(status_code) => self.record(status_code.as_str()),
            None => self.record(ABORTED_STATUS_LABEL),
        }
    }

    fn record(&mut self, status_code: &str) {
        let Some(timer) = self.timer.take() else {
            return;
        };

        let elapsed = timer.stop();
        self.metrics
            .record_request(&self.method, &self.route, status_code, elapsed);
        debug!(
            method = %self.method,
            route = %self.route,
            status_code,
            elapsed_seconds = elapsed.as_secs_f64(),
            "recorded request duration"
        );
    }
}

impl Drop for InFlightRequest {
    fn drop(&mut self) {
        self.record(ABORTED_STATUS_LABEL);
    }
}

pin_project! {
    /// Response body that completes its request's observation when the last
    /// frame is handed out. Dropping it earlier records the request as aborted.
    struct InstrumentedBody<B> {
        #[pin]
        inner: B,
        in_flight: Option<InFlightRequest>,
    }
}

impl<B> InstrumentedBody<B> {
    fn new(inner: B, in_flight: InFlightRequest) -> Self {
        Self {
            inner,
            in_flight: Some(in_flight),
        }
    }
}

impl<B> http_body::Body for InstrumentedBody<B>
where
    B: http_body::Body,
{
    type Data = B::Data;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.project();
        let mut inner = this.inner;
        let frame = ready!(inner.as_mut().poll_frame(cx));

        // hyper stops polling once `is_end_stream` holds, so the last data
        // frame may be the final poll this body sees.
        let finished = match &frame {
            None => true,
            Some(Ok(_)) => inner.is_end_stream(),
            Some(Err(_)) => false,
        };
        if finished && let Some(in_flight) = this.in_flight.take() {
            in_flight.finish();
        }

        Poll::Ready(frame)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}
