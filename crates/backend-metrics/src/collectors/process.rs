use std::{
    sync::{Arc, Mutex},
    time::{Instant, SystemTime, UNIX_EPOCH},
};

use backend_common::error::Result;

use crate::registry::{CounterMetric, GaugeMetric, MetricsRegistry};

// `/proc/<pid>/stat` reports CPU time in USER_HZ ticks, fixed at 100 by the
// kernel ABI.
const CLOCK_TICKS_PER_SECOND: f64 = 100.0;

/// Default process and runtime metrics, registered under a name prefix so
/// they cannot collide with application metrics.
pub struct ProcessMetrics {
    start_time: Instant,
    cpu_user_seconds_total: Arc<CounterMetric>,
    cpu_system_seconds_total: Arc<CounterMetric>,
    cpu_seconds_total: Arc<CounterMetric>,
    last_cpu_times: Mutex<CpuTimes>,
    start_time_seconds: Arc<GaugeMetric>,
    uptime_seconds: Arc<GaugeMetric>,
    resident_memory_bytes: Arc<GaugeMetric>,
    virtual_memory_bytes: Arc<GaugeMetric>,
    open_fds: Arc<GaugeMetric>,
    max_fds: Arc<GaugeMetric>,
    threads: Arc<GaugeMetric>,
    runtime_workers: Arc<GaugeMetric>,
    runtime_alive_tasks: Arc<GaugeMetric>,
}

impl ProcessMetrics {
    pub fn register(registry: &MetricsRegistry, prefix: &str) -> Result<Self> {
        let gauge = |name: &str, help: &str| {
            registry.register_gauge(&format!("{prefix}{name}"), help, &[])
        };

        let start_time_seconds = gauge(
            "process_start_time_seconds",
            "Start time of the process since unix epoch in seconds.",
        )?;
        let version_info = registry.register_gauge(
            &format!("{prefix}version_info"),
            "Version of the running service.",
            &["version"],
        )?;

        let counter = |name: &str, help: &str| {
            registry.register_counter(&format!("{prefix}{name}"), help, &[])
        };

        let metrics = Self {
            start_time: Instant::now(),
            cpu_user_seconds_total: counter(
                "process_cpu_user_seconds_total",
                "Total user CPU time spent in seconds.",
            )?,
            cpu_system_seconds_total: counter(
                "process_cpu_system_seconds_total",
                "Total system CPU time spent in seconds.",
            )?,
            cpu_seconds_total: counter(
                "process_cpu_seconds_total",
                "Total user and system CPU time spent in seconds.",
            )?,
            last_cpu_times: Mutex::new(CpuTimes::default()),
            start_time_seconds,
            uptime_seconds: gauge("uptime_seconds", "Process uptime in seconds.")?,
            resident_memory_bytes: gauge(
                "process_resident_memory_bytes",
                "Resident memory size in bytes.",
            )?,
            virtual_memory_bytes: gauge(
                "process_virtual_memory_bytes",
                "Virtual memory size in bytes.",
            )?,
            open_fds: gauge("process_open_fds", "Number of open file descriptors.")?,
            max_fds: gauge(
                "process_max_fds",
                "Maximum number of open file descriptors.",
            )?,
            threads: gauge("process_threads", "Number of OS threads in the process.")?,
            runtime_workers: gauge(
                "runtime_workers",
                "Number of worker threads used by the async runtime.",
            )?,
            runtime_alive_tasks: gauge(
                "runtime_alive_tasks",
                "Number of tasks currently alive in the async runtime.",
            )?,
        };

        let started_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|since| since.as_secs())
            .unwrap_or_default();
        metrics
            .start_time_seconds
            .set(&[], saturating_i64_from_u64(started_at));
        version_info.set(&[env!("CARGO_PKG_VERSION")], 1);
        metrics.refresh();

        Ok(metrics)
    }

    /// Re-reads every value. Values that cannot be read on this platform
    /// keep their previous state.
    pub fn refresh(&self) {
        self.uptime_seconds
            .set(&[], saturating_i64_from_u64(self.start_time.elapsed().as_secs()));

        if let Some(times) = read_proc_file("stat").and_then(|stat| parse_cpu_times(&stat)) {
            self.advance_cpu_counters(times);
        }

        if let Some(status) = read_proc_file("status") {
            if let Some(kb) = parse_status_field(&status, "VmRSS:") {
                self.resident_memory_bytes
                    .set(&[], saturating_i64_from_u64(kb.saturating_mul(1024)));
            }
            if let Some(kb) = parse_status_field(&status, "VmSize:") {
                self.virtual_memory_bytes
                    .set(&[], saturating_i64_from_u64(kb.saturating_mul(1024)));
            }
            if let Some(threads) = parse_status_field(&status, "Threads:") {
                self.threads.set(&[], saturating_i64_from_u64(threads));
            }
        }

        if let Some(open) = count_open_fds() {
            self.open_fds.set(&[], saturating_i64_from_u64(open));
        }

        if let Some(limit) =
            read_proc_file("limits").and_then(|limits| parse_max_open_files(&limits))
        {
            self.max_fds.set(&[], saturating_i64_from_u64(limit));
        }

        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let runtime = handle.metrics();
            self.runtime_workers.set(&[], runtime.num_workers() as i64);
            self.runtime_alive_tasks
                .set(&[], runtime.num_alive_tasks() as i64);
        }
    }

    // Counters only move forward, so each refresh adds the delta since the
    // previous reading.
    fn advance_cpu_counters(&self, current: CpuTimes) {
        let mut last = match self.last_cpu_times.lock() {
            Ok(last) => last,
            Err(poisoned) => poisoned.into_inner(),
        };

        let (Some(user), Some(system)) = (
            current.user_ticks.checked_sub(last.user_ticks),
            current.system_ticks.checked_sub(last.system_ticks),
        ) else {
            return;
        };

        self.cpu_user_seconds_total.inc(&[], ticks_to_seconds(user));
        self.cpu_system_seconds_total
            .inc(&[], ticks_to_seconds(system));
        self.cpu_seconds_total
            .inc(&[], ticks_to_seconds(user.saturating_add(system)));
        *last = current;
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct CpuTimes {
    user_ticks: u64,
    system_ticks: u64,
}

fn ticks_to_seconds(ticks: u64) -> f64 {
    ticks as f64 / CLOCK_TICKS_PER_SECOND
}

fn saturating_i64_from_u64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[cfg(target_os = "linux")]
fn read_proc_file(name: &str) -> Option<String> {
    std::fs::read_to_string(format!("/proc/self/{name}")).ok()
}

#[cfg(not(target_os = "linux"))]
fn read_proc_file(_name: &str) -> Option<String> {
    None
}

#[cfg(target_os = "linux")]
fn count_open_fds() -> Option<u64> {
    let entries = std::fs::read_dir("/proc/self/fd").ok()?;
    Some(entries.filter_map(|entry| entry.ok()).count() as u64)
}

#[cfg(not(target_os = "linux"))]
fn count_open_fds() -> Option<u64> {
    None
}

fn parse_status_field(status: &str, field: &str) -> Option<u64> {
    status
        .lines()
        .find_map(|line| line.strip_prefix(field))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|value| value.parse::<u64>().ok())
}

// Fields after the parenthesised command name start at field 3 (state);
// utime and stime are fields 14 and 15.
fn parse_cpu_times(stat: &str) -> Option<CpuTimes> {
    let (_, rest) = stat.rsplit_once(')')?;
    let mut fields = rest.split_whitespace().skip(11);
    let user_ticks = fields.next()?.parse::<u64>().ok()?;
    let system_ticks = fields.next()?.parse::<u64>().ok()?;
    Some(CpuTimes {
        user_ticks,
        system_ticks,
    })
}

// "Max open files  <soft>  <hard>  files"; the soft limit is what the process hits.
fn parse_max_open_files(limits: &str) -> Option<u64> {
    limits
        .lines()
        .find_map(|line| line.strip_prefix("Max open files"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|value| value.parse::<u64>().ok())
}
