//! docline - bulk loader for record-oriented document collections
//!
//! Splits XML feeds, text and binary files (plain, gzip or zip) into records
//! and writes each one to a destination under a key derived from its id.

use std::process::ExitCode;
use std::sync::atomic::Ordering;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use comfy_table::{Cell, Color, Table, modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL};

use docline_core::{LoadError, LoaderConfig, ProgressContext, init_logging, interrupt_flag};

mod cmd;
mod config;

use config::Config;

#[derive(Parser)]
#[command(name = "docline")]
#[command(about = "Bulk loader for record-oriented document collections")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    /// Only log warnings and errors
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Config file path (default: ./docline.toml or ~/.config/docline/config.toml)
    #[arg(short, long, global = true)]
    config: Option<std::path::PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Load inputs into the configured sink
    Load(cmd::load::LoadArgs),
    /// Show current configuration
    Config,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let progress = ProgressContext::new();
    let multi = progress.is_tty().then(|| progress.multi());
    init_logging(cli.quiet, cli.debug, multi);

    match run(cli, &progress) {
        Ok(code) => code,
        Err(e) => {
            log::error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli, progress: &ProgressContext) -> Result<ExitCode> {
    let config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::load()?,
    };

    match cli.command {
        Command::Load(args) => {
            setup_signal_handler()?;
            match cmd::load::run(args, &config, progress)? {
                Ok(_) => Ok(ExitCode::SUCCESS),
                Err(LoadError::Interrupted) => {
                    log::warn!("Interrupted");
                    Ok(ExitCode::from(130))
                }
                Err(e) => {
                    log::error!("Load failed: {e}");
                    Ok(ExitCode::FAILURE)
                }
            }
        }
        Command::Config => {
            print_config(&config);
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// First signal: raise the interrupt flag so the run halts cleanly.
/// Second signal: exit at once.
fn setup_signal_handler() -> Result<()> {
    for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        // SAFETY: AtomicBool::swap and process::exit are async-signal-safe
        let registered = unsafe {
            signal_hook::low_level::register(signal, || {
                if interrupt_flag().swap(true, Ordering::Relaxed) {
                    std::process::exit(130);
                }
            })
        };
        registered.with_context(|| format!("Failed to register handler for signal {signal}"))?;
    }
    Ok(())
}

fn print_config(config: &Config) {
    let c: &LoaderConfig = &config.loader;
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(vec![
            Cell::new("Setting").fg(Color::Cyan),
            Cell::new("Value").fg(Color::Cyan),
        ]);

    let or_unset = |v: Option<&str>| v.unwrap_or("-").to_string();
    let flag = |b: bool| if b { "yes" } else { "no" }.to_string();
    let rate = |v: Option<f64>| v.map_or("-".to_string(), |r| format!("{r}/s"));

    let source = config
        .source
        .as_ref()
        .map_or("defaults".to_string(), |p| p.display().to_string());
    let inputs = c
        .inputs
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ");
    let rows = [
        ("Config file", source),
        ("Inputs", if inputs.is_empty() { "-".into() } else { inputs }),
        ("Input pattern", c.input_pattern.clone()),
        (
            "Threads",
            format!("{} (queue {})", c.threads, c.queue_capacity),
        ),
        ("Content format", format!("{:?}", c.content_format).to_lowercase()),
        (
            "Record",
            match (&c.record_name, &c.record_namespace) {
                (Some(name), Some(ns)) => format!("{{{ns}}}{name}"),
                (Some(name), None) => name.clone(),
                (None, _) => "whole document".into(),
            },
        ),
        ("Id", c.id_name.clone()),
        ("URI prefix", c.uri_prefix.clone()),
        ("URI suffix", c.uri_suffix.clone()),
        ("Strip prefix", or_unset(c.strip_prefix.as_deref())),
        ("Collections", c.collections.join(", ")),
        ("Start id", or_unset(c.start_id.as_deref())),
        ("Skip existing", flag(c.skip_existing)),
        ("Error on existing", flag(c.error_existing)),
        ("Throttle (records)", rate(c.throttle_events_per_second)),
        ("Throttle (bytes)", rate(c.throttle_bytes_per_second)),
        ("Fatal errors", flag(c.fatal_errors)),
        ("Loop forever", flag(c.loop_forever)),
        ("Delete input", flag(c.delete_input)),
        (
            "Malformed input",
            format!("{:?}", c.malformed_input).to_lowercase(),
        ),
        (
            "Sink",
            format!("{} ({})", c.sink.kind.as_str(), c.sink.path.display()),
        ),
    ];
    for (name, value) in rows {
        table.add_row(vec![name.to_string(), value]);
    }

    eprintln!("\n{table}");
}
