use std::{
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that only moves when told to. Used to make request durations
/// deterministic.
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut offset = match self.offset.lock() {
            Ok(offset) => offset,
            Err(poisoned) => poisoned.into_inner(),
        };
        *offset += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        let offset = match self.offset.lock() {
            Ok(offset) => *offset,
            Err(poisoned) => *poisoned.into_inner(),
        };
        self.origin + offset
    }
}

/// Start instant of a single request. `stop` takes the timer by value so a
/// timer yields exactly one duration.
pub struct RequestTimer {
    clock: Arc<dyn Clock>,
    started_at: Instant,
}

impl RequestTimer {
    pub fn start(clock: Arc<dyn Clock>) -> Self {
        let started_at = clock.now();
        Self { clock, started_at }
    }

    pub fn stop(self) -> Duration {
        self.clock.now().saturating_duration_since(self.started_at)
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use super::{Clock, ManualClock, RequestTimer, SystemClock};

    #[test]
    fn manual_clock_only_moves_on_advance() {
        let clock = ManualClock::new();
        let before = clock.now();
        assert_eq!(clock.now(), before);

        clock.advance(Duration::from_millis(250));
        assert_eq!(clock.now() - before, Duration::from_millis(250));
    }

    #[test]
    fn timer_measures_elapsed_clock_time() {
        let clock = Arc::new(ManualClock::new());
        let timer = RequestTimer::start(clock.clone());
        clock.advance(Duration::from_secs(2));
        assert_eq!(timer.stop(), Duration::from_secs(2));
    }

    #[test]
    fn system_clock_timer_is_non_negative() {
        let timer = RequestTimer::start(Arc::new(SystemClock));
        assert!(timer.stop() >= Duration::ZERO);
    }
}
