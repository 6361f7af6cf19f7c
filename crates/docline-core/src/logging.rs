//! `log` backend setup: env_logger, bridged through indicatif on a terminal

use indicatif::MultiProgress;
use log::Log;

/// Padded label and, when `color` is set, the ANSI colour around it.
fn level_style(level: log::Level, color: bool) -> (&'static str, &'static str, &'static str) {
    let (ansi, label) = match level {
        log::Level::Error => ("\x1b[31m", "ERROR"),
        log::Level::Warn => ("\x1b[33m", "WARN "),
        log::Level::Info => ("\x1b[32m", "INFO "),
        log::Level::Debug => ("\x1b[36m", "DEBUG"),
        log::Level::Trace => ("\x1b[35m", "TRACE"),
    };
    if color {
        (ansi, label, "\x1b[0m")
    } else {
        ("", label, "")
    }
}

/// Worker thread name, shown on debug lines to tell loaders apart
fn thread_tag(level: log::Level) -> String {
    if level < log::Level::Debug {
        return String::new();
    }
    match std::thread::current().name() {
        Some(name) => format!("({name}) "),
        None => String::new(),
    }
}

/// Writes log lines above the monitor's status line.
pub struct IndicatifLogger {
    filter: env_logger::Logger,
    multi: MultiProgress,
}

impl IndicatifLogger {
    pub fn new(filter: env_logger::Logger, multi: MultiProgress) -> Self {
        Self { filter, multi }
    }
}

impl Log for IndicatifLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        self.filter.enabled(metadata)
    }

    fn log(&self, record: &log::Record) {
        if !self.filter.matches(record) {
            return;
        }
        let (pre, label, post) = level_style(record.level(), true);
        let line = format!(
            "[{pre}{label}{post}] {}{}",
            thread_tag(record.level()),
            record.args()
        );
        self.multi.suspend(|| eprintln!("{line}"));
    }

    fn flush(&self) {
        self.filter.flush();
    }
}

fn builder(quiet: bool, debug: bool) -> env_logger::Builder {
    let default_level = match (debug, quiet) {
        (true, _) => "debug",
        (false, true) => "warn",
        (false, false) => "info",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
}

/// Install the global logger. `RUST_LOG` overrides the level flags.
///
/// Pass the progress context's `MultiProgress` on a terminal. Calling this
/// twice is a no-op.
pub fn init_logging(quiet: bool, debug: bool, multi: Option<&MultiProgress>) {
    use std::io::Write;

    match multi {
        Some(multi) => {
            let filter = builder(quiet, debug).build();
            let max_level = filter.filter();
            if log::set_boxed_logger(Box::new(IndicatifLogger::new(filter, multi.clone())))
                .is_ok()
            {
                log::set_max_level(max_level);
            }
        }
        None => {
            // Plain lines for log collectors
            let _ = builder(quiet, debug)
                .format(|buf, record| {
                    let (_, label, _) = level_style(record.level(), false);
                    writeln!(buf, "[{label}] {}{}", thread_tag(record.level()), record.args())
                })
                .try_init();
        }
    }
}
