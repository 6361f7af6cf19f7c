//! Progress aggregation, throttling, and pipeline halt
//!
//! The monitor is a cheap cloneable handle. Workers call [`Monitor::report`]
//! after each record, which folds the event into the aggregate timer and, when
//! a target rate is configured, sleeps the calling worker until observed
//! throughput falls back to the target. A dedicated thread wakes every tick
//! to poll the interrupt flag and write progress lines.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use indicatif::{HumanBytes, ProgressBar};

use crate::config::ThrottleTarget;
use crate::error::LoadError;
use crate::input::ZipContainer;
use crate::pool::PoolHandle;
use crate::progress::fmt_num;
use crate::resource::{ResourceClaim, ResourceTable, SharedResource};
use crate::timer::{TimedEvent, Timer, TimerSnapshot};

/// How often the control thread polls for interrupts
const TICK: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    Created,
    Running,
    Halted,
    Completed,
}

/// Settings fixed for the lifetime of a monitor
#[derive(Debug, Clone)]
pub struct MonitorSettings {
    /// Minimum time between progress lines
    pub interval: Duration,
    pub throttle: Option<ThrottleTarget>,
    /// Run limit restored once a start-id scan finds its record
    pub full_pool_limit: usize,
    /// Raised by signal handlers
    pub interrupt: &'static AtomicBool,
}

/// Final counters and terminal state
#[derive(Debug, Clone)]
pub struct MonitorReport {
    pub state: MonitorState,
    pub totals: TimerSnapshot,
    pub skipped: u64,
    /// Set when the run halted
    pub cause: Option<String>,
    pub interrupted: bool,
}

impl MonitorReport {
    pub fn is_halted(&self) -> bool {
        self.state == MonitorState::Halted
    }
}

enum Control {
    Stop,
}

struct Lifecycle {
    state: MonitorState,
    cause: Option<String>,
    interrupted: bool,
}

/// Rate window start; moved forward by [`Monitor::reset_throttle`]
struct Baseline {
    start: Instant,
    events: u64,
    bytes: u64,
}

struct Shared {
    settings: MonitorSettings,
    timer: Timer,
    skipped: AtomicU64,
    lifecycle: Mutex<Lifecycle>,
    /// Wakes halt-aware sleepers
    wake: Condvar,
    baseline: Mutex<Baseline>,
    pool: Mutex<Option<PoolHandle>>,
    resources: Arc<ResourceTable<ZipContainer>>,
    status: ProgressBar,
    control: Mutex<Option<Sender<Control>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Shared {
    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().expect("monitor lock poisoned")
    }
}

#[derive(Clone)]
pub struct Monitor {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Monitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Monitor")
            .field("state", &self.state())
            .field("events", &self.shared.timer.events())
            .finish_non_exhaustive()
    }
}

impl Monitor {
    /// Create the monitor and spawn its control thread.
    ///
    /// `status` is the spinner line updated each interval; pass a hidden bar
    /// to get plain log lines instead.
    pub fn start(settings: MonitorSettings, status: ProgressBar) -> Result<Self, LoadError> {
        let (tx, rx) = mpsc::channel();
        let shared = Arc::new(Shared {
            settings,
            timer: Timer::new(),
            skipped: AtomicU64::new(0),
            lifecycle: Mutex::new(Lifecycle {
                state: MonitorState::Created,
                cause: None,
                interrupted: false,
            }),
            wake: Condvar::new(),
            baseline: Mutex::new(Baseline {
                start: Instant::now(),
                events: 0,
                bytes: 0,
            }),
            pool: Mutex::new(None),
            resources: Arc::new(ResourceTable::new()),
            status,
            control: Mutex::new(Some(tx)),
            thread: Mutex::new(None),
        });
        let monitor = Self { shared };

        monitor.shared.lifecycle().state = MonitorState::Running;
        let runner = monitor.clone();
        let handle = std::thread::Builder::new()
            .name("docline-monitor".to_string())
            .spawn(move || runner.control_loop(rx))?;
        *monitor.shared.thread.lock().expect("monitor lock poisoned") = Some(handle);
        Ok(monitor)
    }

    fn control_loop(&self, rx: mpsc::Receiver<Control>) {
        let interval = self.shared.settings.interval;
        let mut last_tick = Instant::now();
        let mut watermark = (0u64, 0u64);
        loop {
            match rx.recv_timeout(TICK) {
                Ok(Control::Stop) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {}
            }
            if self.shared.settings.interrupt.load(Ordering::Relaxed) {
                self.halt_with("interrupt signal received".to_string(), true);
            }
            if self.state() != MonitorState::Running {
                break;
            }
            if last_tick.elapsed() < interval {
                continue;
            }
            last_tick = Instant::now();
            let current = (self.shared.timer.events(), self.skipped());
            if current != watermark {
                watermark = current;
                self.progress_line();
            }
        }
        log::debug!("monitor thread exiting");
    }

    fn progress_line(&self) {
        let snap = self.shared.timer.snapshot();
        let line = format!(
            "{} records ({:.0}/s, {}/s), {} skipped, {} errors",
            fmt_num(snap.events),
            snap.events_per_second(),
            HumanBytes(snap.bytes_per_second() as u64),
            fmt_num(self.skipped()),
            fmt_num(snap.errors),
        );
        if self.shared.status.is_hidden() {
            log::info!("{line}");
        } else {
            self.shared.status.set_message(line);
        }
    }

    /// Fold one record's event into the aggregate and throttle the caller.
    ///
    /// Skipped records count toward progress but never sleep.
    pub fn report(&self, event: &TimedEvent, skipped: bool) {
        self.shared.timer.add(event);
        if skipped {
            self.shared.skipped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        if let Some(delay) = self.throttle_delay() {
            self.sleep(delay);
        }
    }

    /// Time the caller must wait for observed throughput to match the target.
    fn throttle_delay(&self) -> Option<Duration> {
        let target = self.shared.settings.throttle?;
        let baseline = self.shared.baseline.lock().expect("monitor lock poisoned");
        let (done, rate) = match target {
            ThrottleTarget::EventsPerSecond(rate) => {
                (self.shared.timer.events().saturating_sub(baseline.events), rate)
            }
            ThrottleTarget::BytesPerSecond(rate) => {
                (self.shared.timer.bytes().saturating_sub(baseline.bytes), rate)
            }
        };
        let expected = Duration::from_secs_f64(done as f64 / rate);
        expected
            .checked_sub(baseline.start.elapsed())
            .filter(|d| !d.is_zero())
    }

    /// Restart the throttle's rate window from now.
    pub fn reset_throttle(&self) {
        let mut baseline = self.shared.baseline.lock().expect("monitor lock poisoned");
        *baseline = Baseline {
            start: Instant::now(),
            events: self.shared.timer.events(),
            bytes: self.shared.timer.bytes(),
        };
        log::debug!("throttle window reset");
    }

    /// Sleep unless halted. Returns `false` if the sleep was cut short by a halt.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let mut lifecycle = self.shared.lifecycle();
        while lifecycle.state != MonitorState::Halted {
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            lifecycle = self
                .shared
                .wake
                .wait_timeout(lifecycle, deadline - now)
                .expect("monitor lock poisoned")
                .0;
        }
        false
    }

    /// Stop the whole pipeline because of `cause`. The first cause wins.
    pub fn halt(&self, cause: &LoadError) {
        let interrupted = matches!(cause, LoadError::Interrupted);
        self.halt_with(cause.to_string(), interrupted);
    }

    fn halt_with(&self, cause: String, interrupted: bool) {
        {
            let mut lifecycle = self.shared.lifecycle();
            if matches!(
                lifecycle.state,
                MonitorState::Halted | MonitorState::Completed
            ) {
                return;
            }
            log::error!("Halting: {cause}");
            lifecycle.state = MonitorState::Halted;
            lifecycle.cause = Some(cause);
            lifecycle.interrupted = interrupted;
        }
        self.shared.wake.notify_all();
        if let Some(pool) = self.shared.pool.lock().expect("monitor lock poisoned").as_ref() {
            let dropped = pool.cancel();
            if dropped > 0 {
                log::warn!("Discarded {dropped} queued tasks");
            }
        }
    }

    pub fn is_halted(&self) -> bool {
        self.state() == MonitorState::Halted
    }

    pub fn state(&self) -> MonitorState {
        self.shared.lifecycle().state
    }

    /// Register the current pass's pool so a halt can cancel it.
    pub fn attach_pool(&self, pool: PoolHandle) {
        let mut slot = self.shared.pool.lock().expect("monitor lock poisoned");
        if self.is_halted() {
            pool.cancel();
        }
        *slot = Some(pool);
    }

    pub fn detach_pool(&self) {
        self.shared.pool.lock().expect("monitor lock poisoned").take();
    }

    /// Let every worker run again after a single-threaded scan.
    pub fn reset_pool_limit(&self) {
        if let Some(pool) = self.shared.pool.lock().expect("monitor lock poisoned").as_ref() {
            log::info!(
                "Resuming with {} threads",
                self.shared.settings.full_pool_limit
            );
            pool.set_limit(self.shared.settings.full_pool_limit);
        }
    }

    /// Open a named container once, or return the one already open.
    pub fn open_resource(
        &self,
        name: &str,
        open: impl FnOnce() -> std::io::Result<ZipContainer>,
    ) -> Result<Arc<SharedResource<ZipContainer>>, LoadError> {
        self.shared.resources.insert(name, open)
    }

    /// Take one claim on an open container.
    pub fn claim_resource(&self, name: &str) -> Result<ResourceClaim<ZipContainer>, LoadError> {
        self.shared.resources.claim(name)
    }

    /// Release one claim by name, closing the container on the last one.
    pub fn release_resource(&self, name: &str) -> Result<usize, LoadError> {
        self.shared.resources.release(name)
    }

    pub fn open_resources(&self) -> usize {
        self.shared.resources.len()
    }

    pub fn skipped(&self) -> u64 {
        self.shared.skipped.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> TimerSnapshot {
        self.shared.timer.snapshot()
    }

    /// Stop the control thread and return the final counters.
    ///
    /// A monitor that was not halted completes here. Later calls return the
    /// same terminal state.
    pub fn finish(&self) -> MonitorReport {
        {
            let mut lifecycle = self.shared.lifecycle();
            if lifecycle.state != MonitorState::Halted {
                lifecycle.state = MonitorState::Completed;
            }
        }
        self.shared.wake.notify_all();
        self.detach_pool();

        if let Some(tx) = self.shared.control.lock().expect("monitor lock poisoned").take() {
            let _ = tx.send(Control::Stop);
        }
        let handle = self.shared.thread.lock().expect("monitor lock poisoned").take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                log::error!("monitor thread panicked");
            }
        }
        self.shared.timer.stop();
        self.shared.status.finish_and_clear();

        let lifecycle = self.shared.lifecycle();
        let report = MonitorReport {
            state: lifecycle.state,
            totals: self.shared.timer.snapshot(),
            skipped: self.skipped(),
            cause: lifecycle.cause.clone(),
            interrupted: lifecycle.interrupted,
        };
        drop(lifecycle);
        if self.shared.resources.len() > 0 {
            log::warn!(
                "{} archives still open at shutdown",
                self.shared.resources.len()
            );
        }
        report
    }
}
