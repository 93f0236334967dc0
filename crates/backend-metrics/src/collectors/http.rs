use std::{sync::Arc, time::Duration};

use backend_common::error::Result;

use crate::{
    clock::{Clock, RequestTimer},
    registry::{HistogramMetric, MetricsRegistry},
};

pub const HTTP_REQUEST_DURATION_SECONDS: &str = "http_request_duration_seconds";

pub const HTTP_REQUEST_DURATION_BUCKETS: [f64; 7] = [0.1, 0.3, 0.5, 1.0, 1.5, 2.0, 5.0];

pub struct HttpMetrics {
    clock: Arc<dyn Clock>,
    request_duration_seconds: Arc<HistogramMetric>,
}

impl HttpMetrics {
    pub fn register(registry: &MetricsRegistry, clock: Arc<dyn Clock>) -> Result<Self> {
        let request_duration_seconds = registry.register_histogram(
            HTTP_REQUEST_DURATION_SECONDS,
            "Duration of HTTP requests in seconds",
            &["method", "route", "status_code"],
            &HTTP_REQUEST_DURATION_BUCKETS,
        )?;

        Ok(Self {
            clock,
            request_duration_seconds,
        })
    }

    pub fn start_timer(&self) -> RequestTimer {
        RequestTimer::start(Arc::clone(&self.clock))
    }

    pub fn record_request(&self, method: &str, route: &str, status_code: &str, duration: Duration) {
        self.request_duration_seconds
            .observe(&[method, route, status_code], duration.as_secs_f64());
    }

    pub fn request_duration_seconds(&self) -> &HistogramMetric {
        &self.request_duration_seconds
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use crate::{clock::ManualClock, registry::MetricsRegistry};

    use super::HttpMetrics;

    #[test]
    fn records_timer_duration_under_request_labels() {
        let registry = MetricsRegistry::new();
        let clock = Arc::new(ManualClock::new());
        let metrics = HttpMetrics::register(&registry, clock.clone()).unwrap();

        let timer = metrics.start_timer();
        clock.advance(Duration::from_millis(400));
        metrics.record_request("GET", "/health", "200", timer.stop());

        let snapshot = metrics
            .request_duration_seconds()
            .snapshot(&["GET", "/health", "200"])
            .unwrap();
        assert_eq!(snapshot.count, 1);
        assert!((snapshot.sum - 0.4).abs() < 1e-9);
        assert_eq!(snapshot.buckets[1], (0.3, 0));
        assert_eq!(snapshot.buckets[2], (0.5, 1));
    }

    #[test]
    fn histogram_uses_fixed_buckets() {
        let registry = MetricsRegistry::new();
        let metrics = HttpMetrics::register(&registry, Arc::new(ManualClock::new())).unwrap();
        assert_eq!(
            metrics.request_duration_seconds().buckets(),
            &[0.1, 0.3, 0.5, 1.0, 1.5, 2.0, 5.0]
        );
    }
}
