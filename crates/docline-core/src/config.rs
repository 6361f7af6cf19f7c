//! Loader configuration values
//!
//! Parsing the file format is the caller's business; this module only holds
//! the values, their defaults, and the cross-field validation.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::error::LoadError;
use crate::sink::SinkKind;

/// Where one record starts and ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BoundaryRule {
    /// Each element with this local name (and namespace, when given) is a record
    Element {
        name: String,
        namespace: Option<String>,
    },
    /// The document root element is the single record
    WholeDocument,
}

impl BoundaryRule {
    /// `true` if an element with this local name and resolved namespace starts a record.
    pub fn matches(&self, local: &str, namespace: Option<&str>) -> bool {
        match self {
            Self::Element {
                name,
                namespace: want,
            } => name == local && want.as_deref().is_none_or(|ns| Some(ns) == namespace),
            Self::WholeDocument => true,
        }
    }
}

/// How a record's identifier is found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdMode {
    /// Text of the first descendant element with this local name
    Element(String),
    /// Value of this attribute on the record root
    Attribute(String),
    /// Pipeline-wide sequence number
    Auto,
    /// The input unit's file name
    Filename,
}

impl IdMode {
    /// Resolve from a key: `#AUTO`, `#FILENAME`, `@attr`, or an element name.
    pub fn from_key(key: &str) -> Result<Self, LoadError> {
        let key = key.trim();
        match key {
            "" => Err(LoadError::Config("empty id name".into())),
            "#AUTO" => Ok(Self::Auto),
            "#FILENAME" => Ok(Self::Filename),
            _ => match key.strip_prefix('@') {
                Some("") => Err(LoadError::Config("empty id attribute name".into())),
                Some(attr) => Ok(Self::Attribute(attr.to_string())),
                None => Ok(Self::Element(key.to_string())),
            },
        }
    }
}

/// How input content is turned into records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentFormat {
    /// Markup split into records at the boundary rule
    #[default]
    Xml,
    /// Whole unit as one text record
    Text,
    /// Whole unit as one opaque record
    Binary,
}

/// What to do with bytes that are invalid in the input encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MalformedAction {
    /// Fail the record
    #[default]
    Report,
    /// Substitute U+FFFD
    Replace,
    /// Drop the offending bytes
    Ignore,
}

/// Target throughput. Events win when both rates are configured.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ThrottleTarget {
    EventsPerSecond(f64),
    BytesPerSecond(f64),
}

/// Destination selection
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    pub kind: SinkKind,
    /// Root directory for the directory sink
    pub path: PathBuf,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            kind: SinkKind::Directory,
            path: PathBuf::from("./loaded"),
        }
    }
}

/// Runtime configuration for the ingestion pipeline.
///
/// Immutable once the pipeline starts; the few fields workers change at run
/// time (start id, skip-existing) are copied into [`SkipState`](crate::skip::SkipState).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// Files, directories, archives, or `-` for stdin
    pub inputs: Vec<PathBuf>,
    /// Case-insensitive glob applied to file and archive-entry names
    pub input_pattern: String,

    pub threads: usize,
    pub queue_capacity: usize,

    pub content_format: ContentFormat,
    /// Local name of the record element; unset means whole document
    pub record_name: Option<String>,
    pub record_namespace: Option<String>,
    /// `#AUTO`, `#FILENAME`, `@attr`, or an element name
    pub id_name: String,

    pub uri_prefix: String,
    pub uri_suffix: String,
    /// Removed from the front of every identifier
    pub strip_prefix: Option<String>,
    pub escape_uris: bool,
    pub normalize_paths: bool,
    /// Put the unit's file name between prefix and identifier
    pub use_filename_path: bool,

    pub collections: Vec<String>,
    pub use_filename_collection: bool,

    /// Hand records to the sink as streams instead of buffers
    pub streaming: bool,

    pub start_id: Option<String>,
    pub start_id_multithreaded: bool,
    pub skip_existing: bool,
    pub skip_existing_until_first_miss: bool,
    pub error_existing: bool,

    pub throttle_events_per_second: Option<f64>,
    pub throttle_bytes_per_second: Option<f64>,

    pub fatal_errors: bool,
    pub loop_forever: bool,
    pub loop_interval_secs: u64,
    pub delete_input: bool,

    pub malformed_input: MalformedAction,
    /// Written in place of malformed entity references in non-fatal mode
    pub entity_replacement: String,

    pub monitor_interval_secs: u64,
    pub shutdown_timeout_secs: u64,

    pub sink: SinkConfig,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self {
            inputs: Vec::new(),
            input_pattern: "*.xml".to_string(),
            threads: cpus.min(8),
            queue_capacity: 1000,
            content_format: ContentFormat::Xml,
            record_name: None,
            record_namespace: None,
            id_name: "#AUTO".to_string(),
            uri_prefix: String::new(),
            uri_suffix: String::new(),
            strip_prefix: None,
            escape_uris: false,
            normalize_paths: true,
            use_filename_path: false,
            collections: Vec::new(),
            use_filename_collection: false,
            streaming: false,
            start_id: None,
            start_id_multithreaded: false,
            skip_existing: false,
            skip_existing_until_first_miss: false,
            error_existing: false,
            throttle_events_per_second: None,
            throttle_bytes_per_second: None,
            fatal_errors: true,
            loop_forever: false,
            loop_interval_secs: 5,
            delete_input: false,
            malformed_input: MalformedAction::Report,
            entity_replacement: String::new(),
            monitor_interval_secs: 5,
            shutdown_timeout_secs: 30,
            sink: SinkConfig::default(),
        }
    }
}

impl LoaderConfig {
    /// Check cross-field constraints and normalise implied flags.
    pub fn validate(&mut self) -> Result<(), LoadError> {
        if self.inputs.is_empty() {
            return Err(LoadError::Config("no inputs given".into()));
        }
        if self.threads == 0 {
            return Err(LoadError::Config("threads must be at least 1".into()));
        }
        if self.queue_capacity == 0 {
            return Err(LoadError::Config("queue capacity must be at least 1".into()));
        }
        glob::Pattern::new(&self.input_pattern).map_err(|e| {
            LoadError::Config(format!("bad input pattern {:?}: {e}", self.input_pattern))
        })?;
        if self.record_namespace.is_some() && self.record_name.is_none() {
            return Err(LoadError::Config(
                "record namespace given without record name".into(),
            ));
        }
        IdMode::from_key(&self.id_name)?;
        for rate in [
            self.throttle_events_per_second,
            self.throttle_bytes_per_second,
        ]
        .into_iter()
        .flatten()
        {
            if !(rate.is_finite() && rate > 0.0) {
                return Err(LoadError::Config(format!("bad throttle rate {rate}")));
            }
        }
        if self.throttle_events_per_second.is_some() && self.throttle_bytes_per_second.is_some()
        {
            log::warn!("both throttle rates set; using events per second");
        }
        if self.skip_existing_until_first_miss && !self.skip_existing {
            log::debug!("skip-existing-until-first-miss implies skip-existing");
            self.skip_existing = true;
        }
        if self.content_format != ContentFormat::Xml && self.record_name.is_some() {
            log::warn!(
                "record name ignored for {:?} content",
                self.content_format
            );
        }
        if self.start_id.as_deref().is_some_and(str::is_empty) {
            self.start_id = None;
        }
        Ok(())
    }

    pub fn boundary(&self) -> BoundaryRule {
        match &self.record_name {
            Some(name) => BoundaryRule::Element {
                name: name.clone(),
                namespace: self.record_namespace.clone().filter(|ns| !ns.is_empty()),
            },
            None => BoundaryRule::WholeDocument,
        }
    }

    pub fn id_mode(&self) -> Result<IdMode, LoadError> {
        IdMode::from_key(&self.id_name)
    }

    pub fn throttle(&self) -> Option<ThrottleTarget> {
        self.throttle_events_per_second
            .map(ThrottleTarget::EventsPerSecond)
            .or(self.throttle_bytes_per_second.map(ThrottleTarget::BytesPerSecond))
    }

    /// Run limit for the first pool: a single-threaded start-id scan uses one slot.
    pub fn initial_pool_limit(&self) -> usize {
        if self.start_id.is_some() && !self.start_id_multithreaded {
            1
        } else {
            self.threads
        }
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_secs.max(1))
    }

    pub fn loop_interval(&self) -> Duration {
        Duration::from_secs(self.loop_interval_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}
