//! Load subcommand - split inputs into records and write them to a sink

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, ValueEnum};
use comfy_table::{Cell, Color, Table, modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL};

use docline_core::{
    ContentFormat, LoadError, LoaderConfig, MalformedAction, Pipeline, ProgressContext, Sink,
    SinkKind, Summary, fmt_num, open_sink,
};
use docline_core::progress::fmt_duration;

use crate::config::Config;

#[derive(Args, Debug)]
pub struct LoadArgs {
    /// Files, directories, zip archives, or - for stdin (default: from config)
    pub inputs: Vec<PathBuf>,

    /// Case-insensitive glob for file and archive entry names
    #[arg(short, long)]
    pub pattern: Option<String>,

    /// Number of worker threads
    #[arg(short, long)]
    pub threads: Option<usize>,

    /// Queued units before submission blocks
    #[arg(long)]
    pub queue: Option<usize>,

    /// Content format of each input unit
    #[arg(long, value_enum)]
    pub format: Option<FormatArg>,

    /// Local name of the record element (default: whole document)
    #[arg(short, long)]
    pub record: Option<String>,

    /// Namespace URI of the record element
    #[arg(long, requires = "record")]
    pub namespace: Option<String>,

    /// Id source: element name, @attribute, #AUTO or #FILENAME
    #[arg(long)]
    pub id: Option<String>,

    #[arg(long)]
    pub uri_prefix: Option<String>,

    #[arg(long)]
    pub uri_suffix: Option<String>,

    /// Removed from the front of each id
    #[arg(long)]
    pub strip_prefix: Option<String>,

    /// Percent-escape key path segments
    #[arg(long)]
    pub escape_uris: bool,

    /// Insert the input file name between prefix and id
    #[arg(long)]
    pub filename_path: bool,

    /// Collection to tag every record with (repeatable)
    #[arg(long = "collection")]
    pub collections: Vec<String>,

    /// Also tag records with their input file name
    #[arg(long)]
    pub filename_collection: bool,

    /// Stream records to the sink instead of buffering them
    #[arg(long)]
    pub streaming: bool,

    /// Skip records until this id is seen
    #[arg(long)]
    pub start_id: Option<String>,

    /// Scan for the start id with every thread
    #[arg(long, requires = "start_id")]
    pub start_id_multithreaded: bool,

    /// Skip records whose key already exists
    #[arg(long)]
    pub skip_existing: bool,

    /// Stop checking for existing keys after the first miss
    #[arg(long)]
    pub skip_existing_until_first_miss: bool,

    /// Halt if a key already exists
    #[arg(long, conflicts_with = "skip_existing")]
    pub error_existing: bool,

    /// Target records per second
    #[arg(long, conflicts_with = "throttle_bytes")]
    pub throttle_events: Option<f64>,

    /// Target bytes per second
    #[arg(long)]
    pub throttle_bytes: Option<f64>,

    /// Skip bad records instead of halting
    #[arg(long)]
    pub no_fatal: bool,

    /// Re-scan the inputs until interrupted
    #[arg(long)]
    pub loop_forever: bool,

    /// Seconds between passes when looping
    #[arg(long)]
    pub loop_interval: Option<u64>,

    /// Delete inputs that loaded without errors
    #[arg(long)]
    pub delete_input: bool,

    /// Handling of bytes that are not valid UTF-8
    #[arg(long, value_enum)]
    pub malformed: Option<MalformedArg>,

    /// Destination backend
    #[arg(long, value_enum)]
    pub sink: Option<SinkArg>,

    /// Root directory for the directory sink
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

#[derive(Clone, Copy, ValueEnum, Debug)]
pub enum FormatArg {
    Xml,
    Text,
    Binary,
}

impl From<FormatArg> for ContentFormat {
    fn from(f: FormatArg) -> Self {
        match f {
            FormatArg::Xml => ContentFormat::Xml,
            FormatArg::Text => ContentFormat::Text,
            FormatArg::Binary => ContentFormat::Binary,
        }
    }
}

#[derive(Clone, Copy, ValueEnum, Debug)]
pub enum MalformedArg {
    Report,
    Replace,
    Ignore,
}

impl From<MalformedArg> for MalformedAction {
    fn from(m: MalformedArg) -> Self {
        match m {
            MalformedArg::Report => MalformedAction::Report,
            MalformedArg::Replace => MalformedAction::Replace,
            MalformedArg::Ignore => MalformedAction::Ignore,
        }
    }
}

#[derive(Clone, Copy, ValueEnum, Debug)]
pub enum SinkArg {
    Directory,
    Null,
}

impl From<SinkArg> for SinkKind {
    fn from(s: SinkArg) -> Self {
        match s {
            SinkArg::Directory => SinkKind::Directory,
            SinkArg::Null => SinkKind::Null,
        }
    }
}

impl LoadArgs {
    /// Apply command line overrides on top of file values.
    pub fn apply(self, config: &mut LoaderConfig) {
        if !self.inputs.is_empty() {
            config.inputs = self.inputs;
        }
        if let Some(pattern) = self.pattern {
            config.input_pattern = pattern;
        }
        if let Some(threads) = self.threads {
            config.threads = threads;
        }
        if let Some(queue) = self.queue {
            config.queue_capacity = queue;
        }
        if let Some(format) = self.format {
            config.content_format = format.into();
        }
        if self.record.is_some() {
            config.record_name = self.record;
            config.record_namespace = self.namespace;
        }
        if let Some(id) = self.id {
            config.id_name = id;
        }
        if let Some(prefix) = self.uri_prefix {
            config.uri_prefix = prefix;
        }
        if let Some(suffix) = self.uri_suffix {
            config.uri_suffix = suffix;
        }
        if self.strip_prefix.is_some() {
            config.strip_prefix = self.strip_prefix;
        }
        config.escape_uris |= self.escape_uris;
        config.use_filename_path |= self.filename_path;
        config.collections.extend(self.collections);
        config.use_filename_collection |= self.filename_collection;
        config.streaming |= self.streaming;
        if self.start_id.is_some() {
            config.start_id = self.start_id;
        }
        config.start_id_multithreaded |= self.start_id_multithreaded;
        config.skip_existing |= self.skip_existing;
        config.skip_existing_until_first_miss |= self.skip_existing_until_first_miss;
        config.error_existing |= self.error_existing;
        if self.throttle_events.is_some() {
            config.throttle_events_per_second = self.throttle_events;
            config.throttle_bytes_per_second = None;
        }
        if self.throttle_bytes.is_some() {
            config.throttle_bytes_per_second = self.throttle_bytes;
            config.throttle_events_per_second = None;
        }
        if self.no_fatal {
            config.fatal_errors = false;
        }
        config.loop_forever |= self.loop_forever;
        if let Some(secs) = self.loop_interval {
            config.loop_interval_secs = secs;
        }
        config.delete_input |= self.delete_input;
        if let Some(malformed) = self.malformed {
            config.malformed_input = malformed.into();
        }
        if let Some(sink) = self.sink {
            config.sink.kind = sink.into();
        }
        if let Some(output) = self.output {
            config.sink.path = output;
        }
    }
}

/// Run the load and print the summary table.
///
/// Load failures are returned as [`LoadError`] so the caller can pick the
/// exit status.
pub fn run(
    args: LoadArgs,
    config: &Config,
    progress: &ProgressContext,
) -> Result<std::result::Result<Summary, LoadError>> {
    let mut loader = config.loader.clone();
    args.apply(&mut loader);

    let sink: Arc<dyn Sink> = Arc::from(open_sink(&loader.sink).with_context(|| {
        format!(
            "Failed to open {} sink at {}",
            loader.sink.kind.as_str(),
            loader.sink.path.display()
        )
    })?);

    let result = Pipeline::new(loader, sink).progress(progress).run();
    if let Ok(summary) = &result {
        print_summary(summary, progress);
    }
    Ok(result)
}

fn print_summary(summary: &Summary, progress: &ProgressContext) {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(vec![
            Cell::new("Units").fg(Color::Cyan),
            Cell::new("Inserted").fg(Color::Cyan),
            Cell::new("Skipped").fg(Color::Cyan),
            Cell::new("Errors").fg(Color::Cyan),
            Cell::new("Bytes").fg(Color::Cyan),
            Cell::new("Time").fg(Color::Cyan),
        ]);
    let errors = Cell::new(fmt_num(summary.errors));
    table.add_row(vec![
        Cell::new(fmt_num(summary.units)),
        Cell::new(fmt_num(summary.inserted)),
        Cell::new(fmt_num(summary.skipped)),
        if summary.errors > 0 {
            errors.fg(Color::Red)
        } else {
            errors
        },
        Cell::new(indicatif::HumanBytes(summary.bytes).to_string()),
        Cell::new(fmt_duration(summary.elapsed)),
    ]);
    progress.println(format!("\n{table}"));
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Wrapper {
        #[command(flatten)]
        args: LoadArgs,
    }

    fn parse(argv: &[&str]) -> LoadArgs {
        Wrapper::try_parse_from(std::iter::once("load").chain(argv.iter().copied()))
            .unwrap()
            .args
    }

    #[test]
    fn overrides_replace_file_values() {
        let mut config = LoaderConfig {
            inputs: vec![PathBuf::from("from-file")],
            threads: 8,
            throttle_bytes_per_second: Some(1e6),
            ..Default::default()
        };
        parse(&[
            "in.xml",
            "-t",
            "2",
            "--record",
            "entry",
            "--id",
            "@id",
            "--throttle-events",
            "50",
            "--no-fatal",
            "--collection",
            "a",
            "--collection",
            "b",
        ])
        .apply(&mut config);

        assert_eq!(config.inputs, [PathBuf::from("in.xml")]);
        assert_eq!(config.threads, 2);
        assert_eq!(config.record_name.as_deref(), Some("entry"));
        assert_eq!(config.id_name, "@id");
        assert_eq!(config.throttle_events_per_second, Some(50.0));
        assert_eq!(config.throttle_bytes_per_second, None);
        assert!(!config.fatal_errors);
        assert_eq!(config.collections, ["a", "b"]);
    }

    #[test]
    fn no_flags_keep_file_values() {
        let mut config = LoaderConfig {
            inputs: vec![PathBuf::from("from-file")],
            skip_existing: true,
            ..Default::default()
        };
        parse(&[]).apply(&mut config);
        assert_eq!(config.inputs, [PathBuf::from("from-file")]);
        assert!(config.skip_existing);
        assert!(config.fatal_errors);
    }

    #[test]
    fn conflicting_existing_flags_rejected() {
        let argv = ["load", "--skip-existing", "--error-existing"];
        assert!(Wrapper::try_parse_from(argv).is_err());
    }

    #[test]
    fn namespace_requires_record() {
        assert!(Wrapper::try_parse_from(["load", "--namespace", "urn:x"]).is_err());
    }

    #[test]
    fn sink_and_format_values() {
        let mut config = LoaderConfig::default();
        parse(&["--sink", "null", "--format", "binary", "--malformed", "replace"])
            .apply(&mut config);
        assert_eq!(config.sink.kind, SinkKind::Null);
        assert_eq!(config.content_format, ContentFormat::Binary);
        assert_eq!(config.malformed_input, MalformedAction::Replace);
    }
}
