//! Per-record timed events and the rolling aggregate kept by the monitor

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Timing and size of one record's processing.
///
/// The stop time is computed lazily: until [`stop`](TimedEvent::stop) is called,
/// [`duration`](TimedEvent::duration) measures up to "now".
#[derive(Debug, Clone)]
pub struct TimedEvent {
    start: Instant,
    stopped: Option<Duration>,
    bytes: u64,
    error: bool,
}

impl TimedEvent {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
            stopped: None,
            bytes: 0,
            error: false,
        }
    }

    /// Stop the clock. Later calls return the first computed duration.
    pub fn stop(&mut self) -> Duration {
        *self.stopped.get_or_insert_with(|| self.start.elapsed())
    }

    pub fn duration(&self) -> Duration {
        self.stopped.unwrap_or_else(|| self.start.elapsed())
    }

    /// Duration in whole milliseconds, never zero so averages stay defined.
    pub fn millis(&self) -> u64 {
        (self.duration().as_millis() as u64).max(1)
    }

    pub fn add_bytes(&mut self, n: u64) {
        self.bytes += n;
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn set_error(&mut self, error: bool) {
        self.error = error;
    }

    pub fn is_error(&self) -> bool {
        self.error
    }
}

/// Point-in-time copy of the aggregate counters
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TimerSnapshot {
    pub events: u64,
    pub errors: u64,
    pub bytes: u64,
    pub millis: u64,
    pub elapsed: Duration,
}

impl TimerSnapshot {
    pub fn events_per_second(&self) -> f64 {
        rate(self.events, self.elapsed)
    }

    pub fn bytes_per_second(&self) -> f64 {
        rate(self.bytes, self.elapsed)
    }

    /// Mean processing time per event in milliseconds
    pub fn mean_millis(&self) -> f64 {
        if self.events == 0 {
            0.0
        } else {
            self.millis as f64 / self.events as f64
        }
    }
}

fn rate(n: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 { n as f64 / secs } else { 0.0 }
}

/// Rolling aggregate of all reported events.
///
/// Individual events are folded into counters and dropped, so memory stays
/// constant however many records pass through.
#[derive(Debug)]
pub struct Timer {
    start: Instant,
    stopped: Mutex<Option<Duration>>,
    events: AtomicU64,
    errors: AtomicU64,
    bytes: AtomicU64,
    millis: AtomicU64,
}

impl Timer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            stopped: Mutex::new(None),
            events: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
            millis: AtomicU64::new(0),
        }
    }

    pub fn add(&self, event: &TimedEvent) {
        self.events.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(event.bytes(), Ordering::Relaxed);
        self.millis.fetch_add(event.millis(), Ordering::Relaxed);
        if event.is_error() {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn stop(&self) -> Duration {
        let mut stopped = self.stopped.lock().expect("timer lock poisoned");
        *stopped.get_or_insert_with(|| self.start.elapsed())
    }

    pub fn elapsed(&self) -> Duration {
        let stopped = self.stopped.lock().expect("timer lock poisoned");
        stopped.unwrap_or_else(|| self.start.elapsed())
    }

    pub fn events(&self) -> u64 {
        self.events.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> TimerSnapshot {
        TimerSnapshot {
            events: self.events(),
            errors: self.errors(),
            bytes: self.bytes(),
            millis: self.millis.load(Ordering::Relaxed),
            elapsed: self.elapsed(),
        }
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}
