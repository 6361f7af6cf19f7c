//! Control thread: monitor, worker pool and enumerator wired into one run

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use indicatif::{HumanBytes, ProgressBar};

use crate::config::LoaderConfig;
use crate::enumerate::{EnumStats, InputEnumerator};
use crate::error::LoadError;
use crate::loader::{Loader, LoaderContext};
use crate::monitor::{Monitor, MonitorReport, MonitorSettings};
use crate::pool::WorkerPool;
use crate::progress::{ProgressContext, fmt_duration, fmt_num};
use crate::shutdown::interrupt_flag;
use crate::sink::Sink;

/// Poll interval while draining a pass
const DRAIN_POLL: Duration = Duration::from_millis(250);

/// Outcome of a completed run
#[derive(Debug, Clone, Default)]
pub struct Summary {
    /// Input units queued across all passes
    pub units: u64,
    /// Names rejected by the input pattern
    pub excluded: u64,
    pub passes: u64,
    /// Records seen, including skipped and failed ones
    pub events: u64,
    pub inserted: u64,
    pub skipped: u64,
    pub errors: u64,
    pub bytes: u64,
    pub elapsed: Duration,
}

impl Summary {
    fn new(report: &MonitorReport, stats: EnumStats, passes: u64) -> Self {
        let totals = &report.totals;
        Self {
            units: stats.submitted,
            excluded: stats.excluded,
            passes,
            events: totals.events,
            inserted: totals
                .events
                .saturating_sub(report.skipped)
                .saturating_sub(totals.errors),
            skipped: report.skipped,
            errors: totals.errors,
            bytes: totals.bytes,
            elapsed: totals.elapsed,
        }
    }

    fn log(&self) {
        log::info!("=== Load Summary ===");
        log::info!(
            "Units: {} queued ({} excluded) in {} pass(es)",
            fmt_num(self.units),
            fmt_num(self.excluded),
            self.passes
        );
        log::info!(
            "Records: {} inserted, {} skipped, {} errors",
            fmt_num(self.inserted),
            fmt_num(self.skipped),
            fmt_num(self.errors)
        );
        log::info!("Bytes: {}", HumanBytes(self.bytes));
        log::info!("Time: {}", fmt_duration(self.elapsed));
        let secs = self.elapsed.as_secs_f64();
        if self.events > 0 && secs > 0.0 {
            log::info!("Throughput: {:.0} records/sec", self.events as f64 / secs);
        }
    }
}

/// One ingestion run over the configured inputs.
///
/// ```ignore
/// let sink: Arc<dyn Sink> = Arc::new(MemorySink::new());
/// let summary = Pipeline::new(config, sink).run()?;
/// ```
pub struct Pipeline {
    config: LoaderConfig,
    sink: Arc<dyn Sink>,
    status: ProgressBar,
    interrupt: &'static AtomicBool,
}

impl Pipeline {
    pub fn new(config: LoaderConfig, sink: Arc<dyn Sink>) -> Self {
        Self {
            config,
            sink,
            status: ProgressBar::hidden(),
            interrupt: interrupt_flag(),
        }
    }

    /// Show progress on the context's status line instead of log lines.
    pub fn progress(mut self, progress: &ProgressContext) -> Self {
        self.status = progress.status_line("load");
        self
    }

    /// Use a flag other than the process-wide one.
    pub fn interrupt_flag(mut self, flag: &'static AtomicBool) -> Self {
        self.interrupt = flag;
        self
    }

    /// Load everything, looping when configured, and close the sink.
    ///
    /// A halted run returns its cause: [`LoadError::Interrupted`] after a
    /// signal, the enumeration error if enumeration failed, otherwise
    /// [`LoadError::Halted`].
    pub fn run(mut self) -> Result<Summary, LoadError> {
        self.config.validate()?;
        let config = &self.config;
        log::info!(
            "Loading {} input(s) with {} threads (queue {})",
            config.inputs.len(),
            config.threads,
            config.queue_capacity
        );
        let monitor = Monitor::start(
            MonitorSettings {
                interval: config.monitor_interval(),
                throttle: config.throttle(),
                full_pool_limit: config.threads,
                interrupt: self.interrupt,
            },
            self.status.clone(),
        )?;

        let outcome = self.passes(&monitor);
        if let Err(e) = &outcome {
            monitor.halt(e);
        }
        let report = monitor.finish();
        let closed = self.sink.close();

        if report.interrupted {
            log::warn!("Interrupted after {} records", fmt_num(report.totals.events));
            return Err(LoadError::Interrupted);
        }
        let (stats, passes) = outcome?;
        if report.is_halted() {
            let cause = report.cause.unwrap_or_default();
            log::error!("=== Load Halted ===");
            log::error!("Cause: {cause}");
            log::error!(
                "Records before halt: {} ({} errors)",
                fmt_num(report.totals.events),
                fmt_num(report.totals.errors)
            );
            return Err(LoadError::Halted(cause));
        }
        closed?;

        let summary = Summary::new(&report, stats, passes);
        summary.log();
        Ok(summary)
    }

    /// Enumerate and drain once, or until halted when looping.
    fn passes(&self, monitor: &Monitor) -> Result<(EnumStats, u64), LoadError> {
        let config = &self.config;
        let ctx = Arc::new(LoaderContext::new(config, self.sink.clone(), monitor.clone())?);
        let mut enumerator = InputEnumerator::new(config, monitor.clone())?;
        let mut totals = EnumStats::default();
        let mut passes = 0;

        loop {
            passes += 1;
            let limit = if ctx.skip.is_scanning() {
                config.initial_pool_limit()
            } else {
                config.threads
            };
            let pool = WorkerPool::new(config.threads, config.queue_capacity, limit)?;
            monitor.attach_pool(pool.handle());

            let result = enumerator.run(&config.inputs, &mut |unit| {
                let loader = Loader::new(ctx.clone(), unit);
                pool.submit(move || loader.run())?;
                Ok(())
            });
            self.drain(&pool, monitor);
            monitor.detach_pool();

            let stats = match result {
                Ok(stats) => stats,
                // Rejections after a halt are expected; the halt cause is reported instead
                Err(_) if monitor.is_halted() => break,
                Err(e) => return Err(e),
            };
            totals.submitted += stats.submitted;
            totals.excluded += stats.excluded;
            log::debug!(
                "pass {passes}: {} units, {} excluded",
                stats.submitted,
                stats.excluded
            );

            if !config.loop_forever || monitor.is_halted() {
                break;
            }
            if !monitor.sleep(config.loop_interval()) {
                break;
            }
        }
        Ok((totals, passes))
    }

    /// Let queued work finish. After a halt, wait at most the shutdown timeout.
    fn drain(&self, pool: &WorkerPool, monitor: &Monitor) {
        pool.shutdown();
        while !pool.await_termination(DRAIN_POLL) {
            if monitor.is_halted() {
                let timeout = self.config.shutdown_timeout();
                if !pool.await_termination(timeout) {
                    log::warn!(
                        "{} tasks still running after {}, abandoning them",
                        pool.in_flight(),
                        fmt_duration(timeout)
                    );
                }
                return;
            }
        }
    }
}

/// Run a pipeline with hidden progress and the process-wide interrupt flag.
pub fn run(config: LoaderConfig, sink: Arc<dyn Sink>) -> Result<Summary, LoadError> {
    Pipeline::new(config, sink).run()
}
