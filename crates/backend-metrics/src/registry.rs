use std::{
    collections::HashMap,
    fmt::Write,
    sync::{
        Arc, Mutex, RwLock,
        atomic::{AtomicI64, AtomicU64, Ordering},
    },
};

use backend_common::error::{BackendError, Result};
use tracing::debug;

use crate::types::{
    CollectedMetric, HistogramSnapshot, MetricDescriptor, MetricSample, MetricType, MetricValue,
};

type LabelValues = Vec<String>;

trait RegisteredMetric: Send + Sync {
    fn descriptor(&self) -> MetricDescriptor;
    fn collect(&self) -> Result<Vec<MetricSample>>;
}

/// Owns every metric definition of the process. Built once at startup and
/// shared behind an `Arc` with whatever records into or renders it.
pub struct MetricsRegistry {
    metrics: RwLock<HashMap<String, Arc<dyn RegisteredMetric>>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            metrics: RwLock::new(HashMap::new()),
        }
    }

    pub fn register_counter(
        &self,
        name: &str,
        help: &str,
        variable_labels: &[&str],
    ) -> Result<Arc<CounterMetric>> {
        let metric = Arc::new(CounterMetric::new(name, help, variable_labels));
        self.register(metric.clone())?;
        Ok(metric)
    }

    pub fn register_gauge(
        &self,
        name: &str,
        help: &str,
        variable_labels: &[&str],
    ) -> Result<Arc<GaugeMetric>> {
        let metric = Arc::new(GaugeMetric::new(name, help, variable_labels));
        self.register(metric.clone())?;
        Ok(metric)
    }

    pub fn register_histogram(
        &self,
        name: &str,
        help: &str,
        variable_labels: &[&str],
        buckets: &[f64],
    ) -> Result<Arc<HistogramMetric>> {
        let metric = Arc::new(HistogramMetric::new(name, help, variable_labels, buckets));
        self.register(metric.clone())?;
        Ok(metric)
    }

    pub fn collect_all(&self) -> Result<Vec<CollectedMetric>> {
        let metrics = self.metrics.read().map_err(|_| poisoned("metrics registry"))?;

        let mut collected = metrics
            .values()
            .map(|metric| {
                Ok(CollectedMetric {
                    descriptor: metric.descriptor(),
                    samples: metric.collect()?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        collected.sort_by(|left, right| left.descriptor.name.cmp(&right.descriptor.name));
        Ok(collected)
    }

    /// Serializes every registered metric in the Prometheus text format.
    pub fn render_prometheus(&self) -> Result<String> {
        let metrics = self.collect_all()?;
        let mut output = String::new();

        for metric in metrics {
            let name = &metric.descriptor.name;
            writeln!(output, "# HELP {name} {}", escape_help(&metric.descriptor.help))?;
            writeln!(
                output,
                "# TYPE {name} {}",
                metric.descriptor.metric_type.as_prometheus_type()
            )?;

            for sample in metric.samples {
                match sample.value {
                    MetricValue::Counter(value) | MetricValue::Gauge(value) => {
                        write_sample_line(&mut output, name, &sample.labels, value)?;
                    }
                    MetricValue::Histogram(snapshot) => {
                        let bucket_name = format!("{name}_bucket");
                        for (bound, cumulative) in snapshot.buckets {
                            let mut labels = sample.labels.clone();
                            labels.push(("le".to_string(), format_bucket_bound(bound)));
                            write_sample_line(
                                &mut output,
                                &bucket_name,
                                &labels,
                                cumulative as f64,
                            )?;
                        }
                        write_sample_line(
                            &mut output,
                            &format!("{name}_sum"),
                            &sample.labels,
                            snapshot.sum,
                        )?;
                        write_sample_line(
                            &mut output,
                            &format!("{name}_count"),
                            &sample.labels,
                            snapshot.count as f64,
                        )?;
                    }
                }
            }
        }

        Ok(output)
    }

    fn register<M: RegisteredMetric + 'static>(&self, metric: Arc<M>) -> Result<()> {
        let descriptor = metric.descriptor();
        let name = descriptor.name.clone();
        let mut metrics = self.metrics.write().map_err(|_| poisoned("metrics registry"))?;

        if metrics.contains_key(&name) {
            return Err(BackendError::InvalidArgument(format!(
                "metric already registered: {name}"
            )));
        }

        debug!(
            metric = %name,
            kind = descriptor.metric_type.as_prometheus_type(),
            "registered metric"
        );
        metrics.insert(name, metric);
        Ok(())
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Monotonic counter. Values are `f64` bits in an `AtomicU64` so fractional
/// totals such as CPU seconds can be accumulated.
pub struct CounterMetric {
    descriptor: MetricDescriptor,
    series: RwLock<HashMap<LabelValues, Arc<AtomicU64>>>,
}

impl CounterMetric {
    fn new(name: &str, help: &str, variable_labels: &[&str]) -> Self {
        Self {
            descriptor: descriptor(name, help, MetricType::Counter, variable_labels),
            series: RwLock::new(HashMap::new()),
        }
    }

    /// Adds `value` to the series. Negative and non-finite increments are
    /// ignored.
    pub fn inc(&self, labels: &[&str], value: f64) {
        if !value.is_finite() || value < 0.0 {
            return;
        }

        let series = self.get_or_create_series(labels);
        let _ = series.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
            Some((f64::from_bits(bits) + value).to_bits())
        });
    }

    pub fn inc_one(&self, labels: &[&str]) {
        self.inc(labels, 1.0);
    }

    pub fn get(&self, labels: &[&str]) -> Option<f64> {
        let label_values = normalize_labels(&self.descriptor, labels);
        let guard = self.series.read().ok()?;
        guard
            .get(&label_values)
            .map(|value| f64::from_bits(value.load(Ordering::Relaxed)))
    }

    fn get_or_create_series(&self, labels: &[&str]) -> Arc<AtomicU64> {
        let label_values = normalize_labels(&self.descriptor, labels);
        if let Ok(guard) = self.series.read()
            && let Some(existing) = guard.get(&label_values)
        {
            return existing.clone();
        }

        match self.series.write() {
            Ok(mut guard) => guard
                .entry(label_values)
                .or_insert_with(|| Arc::new(AtomicU64::new(0.0_f64.to_bits())))
                .clone(),
            Err(_) => Arc::new(AtomicU64::new(0.0_f64.to_bits())),
        }
    }
}

impl RegisteredMetric for CounterMetric {
    fn descriptor(&self) -> MetricDescriptor {
        self.descriptor.clone()
    }

    fn collect(&self) -> Result<Vec<MetricSample>> {
        let series = self.series.read().map_err(|_| poisoned(&self.descriptor.name))?;

        let mut entries = series.iter().collect::<Vec<_>>();
        entries.sort_by(|left, right| left.0.cmp(right.0));

        Ok(entries
            .into_iter()
            .map(|(label_values, value)| MetricSample {
                labels: materialize_labels(&self.descriptor, label_values),
                value: MetricValue::Counter(f64::from_bits(value.load(Ordering::Relaxed))),
            })
            .collect())
    }
}

pub struct GaugeMetric {
    descriptor: MetricDescriptor,
    series: RwLock<HashMap<LabelValues, Arc<AtomicI64>>>,
}

impl GaugeMetric {
    fn new(name: &str, help: &str, variable_labels: &[&str]) -> Self {
        Self {
            descriptor: descriptor(name, help, MetricType::Gauge, variable_labels),
            series: RwLock::new(HashMap::new()),
        }
    }

    pub fn set(&self, labels: &[&str], value: i64) {
        let series = self.get_or_create_series(labels);
        series.store(value, Ordering::Relaxed);
    }

    pub fn get(&self, labels: &[&str]) -> Option<i64> {
        let label_values = normalize_labels(&self.descriptor, labels);
        let guard = self.series.read().ok()?;
        guard.get(&label_values).map(|value| value.load(Ordering::Relaxed))
    }

    fn get_or_create_series(&self, labels: &[&str]) -> Arc<AtomicI64> {
        let label_values = normalize_labels(&self.descriptor, labels);
        if let Ok(guard) = self.series.read()
            && let Some(existing) = guard.get(&label_values)
        {
            return existing.clone();
        }

        match self.series.write() {
            Ok(mut guard) => guard
                .entry(label_values)
                .or_insert_with(|| Arc::new(AtomicI64::new(0)))
                .clone(),
            Err(_) => Arc::new(AtomicI64::new(0)),
        }
    }
}

impl RegisteredMetric for GaugeMetric {
    fn descriptor(&self) -> MetricDescriptor {
        self.descriptor.clone()
    }

    fn collect(&self) -> Result<Vec<MetricSample>> {
        let series = self.series.read().map_err(|_| poisoned(&self.descriptor.name))?;

        let mut samples = series
            .iter()
            .map(|(label_values, value)| {
                (
                    label_values,
                    MetricValue::Gauge(value.load(Ordering::Relaxed) as f64),
                )
            })
            .collect::<Vec<_>>();
        samples.sort_by(|left, right| left.0.cmp(right.0));

        Ok(samples
            .into_iter()
            .map(|(label_values, value)| MetricSample {
                labels: materialize_labels(&self.descriptor, label_values),
                value,
            })
            .collect())
    }
}

pub struct HistogramMetric {
    descriptor: MetricDescriptor,
    buckets: Vec<f64>,
    series: RwLock<HashMap<LabelValues, Arc<HistogramSeries>>>,
}

// One lock per series so bucket, count and sum move together.
struct HistogramSeries {
    state: Mutex<HistogramState>,
}

struct HistogramState {
    bucket_counts: Vec<u64>,
    count: u64,
    sum: f64,
}

impl HistogramSeries {
    fn new(bucket_len: usize) -> Self {
        Self {
            state: Mutex::new(HistogramState {
                bucket_counts: vec![0; bucket_len + 1],
                count: 0,
                sum: 0.0,
            }),
        }
    }
}

impl HistogramMetric {
    fn new(name: &str, help: &str, variable_labels: &[&str], buckets: &[f64]) -> Self {
        let mut sorted_buckets = buckets
            .iter()
            .copied()
            .filter(|bound| bound.is_finite())
            .collect::<Vec<_>>();
        sorted_buckets.sort_by(|left, right| left.total_cmp(right));
        sorted_buckets.dedup();

        Self {
            descriptor: descriptor(name, help, MetricType::Histogram, variable_labels),
            buckets: sorted_buckets,
            series: RwLock::new(HashMap::new()),
        }
    }

    pub fn buckets(&self) -> &[f64] {
        &self.buckets
    }

    pub fn observe(&self, labels: &[&str], value: f64) {
        let series = self.get_or_create_series(labels);

        let bucket_index = self
            .buckets
            .iter()
            .position(|bucket| value <= *bucket)
            .unwrap_or(self.buckets.len());

        let mut state = match series.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(bucket) = state.bucket_counts.get_mut(bucket_index) {
            *bucket += 1;
        }
        state.count += 1;
        state.sum += value;
    }

    /// Returns the current state of one label combination, or `None` if it
    /// has never been observed.
    pub fn snapshot(&self, labels: &[&str]) -> Option<HistogramSnapshot> {
        let label_values = normalize_labels(&self.descriptor, labels);
        let series = self.series.read().ok()?.get(&label_values)?.clone();
        self.snapshot_series(&series).ok()
    }

    fn snapshot_series(&self, series: &HistogramSeries) -> Result<HistogramSnapshot> {
        let state = series.state.lock().map_err(|_| poisoned(&self.descriptor.name))?;

        let mut cumulative = 0_u64;
        let buckets = self
            .buckets
            .iter()
            .copied()
            .chain(std::iter::once(f64::INFINITY))
            .zip(state.bucket_counts.iter())
            .map(|(bound, count)| {
                cumulative = cumulative.saturating_add(*count);
                (bound, cumulative)
            })
            .collect();

        Ok(HistogramSnapshot {
            buckets,
            count: state.count,
            sum: state.sum,
        })
    }

    fn get_or_create_series(&self, labels: &[&str]) -> Arc<HistogramSeries> {
        let label_values = normalize_labels(&self.descriptor, labels);
        if let Ok(guard) = self.series.read()
            && let Some(existing) = guard.get(&label_values)
        {
            return existing.clone();
        }

        match self.series.write() {
            Ok(mut guard) => guard
                .entry(label_values)
                .or_insert_with(|| Arc::new(HistogramSeries::new(self.buckets.len())))
                .clone(),
            Err(_) => Arc::new(HistogramSeries::new(self.buckets.len())),
        }
    }
}

impl RegisteredMetric for HistogramMetric {
    fn descriptor(&self) -> MetricDescriptor {
        self.descriptor.clone()
    }

    fn collect(&self) -> Result<Vec<MetricSample>> {
        let series = self.series.read().map_err(|_| poisoned(&self.descriptor.name))?;

        let mut entries = series.iter().collect::<Vec<_>>();
        entries.sort_by(|left, right| left.0.cmp(right.0));

        entries
            .into_iter()
            .map(|(label_values, entry)| {
                Ok(MetricSample {
                    labels: materialize_labels(&self.descriptor, label_values),
                    value: MetricValue::Histogram(self.snapshot_series(entry)?),
                })
            })
            .collect()
    }
}

fn descriptor(
    name: &str,
    help: &str,
    metric_type: MetricType,
    variable_labels: &[&str],
) -> MetricDescriptor {
    MetricDescriptor {
        name: name.to_string(),
        help: help.to_string(),
        metric_type,
        variable_labels: variable_labels.iter().map(|label| (*label).to_string()).collect(),
    }
}

fn poisoned(what: &str) -> BackendError {
    BackendError::InternalError(format!("lock poisoned: {what}"))
}

fn normalize_labels(descriptor: &MetricDescriptor, labels: &[&str]) -> LabelValues {
    let expected = descriptor.variable_labels.len();
    (0..expected)
        .map(|index| labels.get(index).copied().unwrap_or_default().to_string())
        .collect()
}

fn materialize_labels(descriptor: &MetricDescriptor, values: &[String]) -> Vec<(String, String)> {
    descriptor
        .variable_labels
        .iter()
        .zip(values.iter())
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

fn write_sample_line(
    output: &mut String,
    name: &str,
    labels: &[(String, String)],
    value: f64,
) -> Result<()> {
    output.push_str(name);

    if !labels.is_empty() {
        output.push('{');
        for (index, (key, value)) in labels.iter().enumerate() {
            if index > 0 {
                output.push(',');
            }
            write!(output, "{key}=\"{}\"", escape_label_value(value))?;
        }
        output.push('}');
    }

    writeln!(output, " {}", format_metric_value(value))?;
    Ok(())
}

fn format_metric_value(value: f64) -> String {
    if value.is_nan() {
        "NaN".to_string()
    } else if value == f64::INFINITY {
        "+Inf".to_string()
    } else if value == f64::NEG_INFINITY {
        "-Inf".to_string()
    } else if value.fract() == 0.0 {
        format!("{value:.0}")
    } else {
        value.to_string()
    }
}

fn format_bucket_bound(value: f64) -> String {
    if value.is_infinite() {
        "+Inf".to_string()
    } else {
        value.to_string()
    }
}

fn escape_help(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\n', "\\n")
}

fn escape_label_value(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('\n', "\\n")
        .replace('"', "\\\"")
}
