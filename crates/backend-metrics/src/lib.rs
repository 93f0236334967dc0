//! Metric registry, Prometheus text rendering and the request collectors
//! used by the HTTP layer.

pub mod clock;
pub mod collectors;
pub mod registry;
pub mod types;

pub use clock::{Clock, ManualClock, RequestTimer, SystemClock};
pub use collectors::{http::HttpMetrics, process::ProcessMetrics};
pub use registry::{CounterMetric, GaugeMetric, HistogramMetric, MetricsRegistry};
pub use types::{HistogramSnapshot, MetricDescriptor, MetricType, MetricValue};

/// Media type of the Prometheus text exposition format, version 0.0.4.
pub const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";
