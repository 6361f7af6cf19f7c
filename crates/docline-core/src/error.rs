//! Error type shared by the extractor, loaders and pipeline control

use crate::pool::PoolError;
use crate::sink::SinkError;

/// Error from loading records out of one input unit.
///
/// Variants are grouped by how far they propagate: token-level problems can be
/// repaired in place, record-level problems abandon one record, and the rest
/// cannot be localised and stop the unit or the whole run.
#[derive(Debug)]
pub enum LoadError {
    /// Missing or contradictory settings
    Config(String),
    /// Local I/O failure (opening inputs, reading archives)
    Io(std::io::Error),
    /// Token reader failure
    Xml { position: u64, message: String },
    /// Record boundaries or identifiers are unusable
    Structure(String),
    /// Malformed entity reference inside text
    Entity(String),
    /// Malformed attribute, usually quoting
    Attribute(String),
    /// Bytes that are not valid in the input encoding
    Malformed(String),
    /// Destination collaborator failure
    Sink(SinkError),
    /// Destination key already exists and error-on-existing is set
    Exists(String),
    /// Reference count misuse on a shared container
    Resource(String),
    /// Worker pool refused a task (shut down or cancelled)
    Rejected,
    /// Interrupt signal received
    Interrupted,
    /// Pipeline halted by a fatal error elsewhere
    Halted(String),
    /// A loader task panicked
    Panicked(String),
}

impl std::fmt::Display for LoadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "configuration: {msg}"),
            Self::Io(e) => write!(f, "IO: {e}"),
            Self::Xml { position, message } => {
                write!(f, "XML error at byte {position}: {message}")
            }
            Self::Structure(msg) => write!(f, "record structure: {msg}"),
            Self::Entity(msg) => write!(f, "entity reference: {msg}"),
            Self::Attribute(msg) => write!(f, "attribute: {msg}"),
            Self::Malformed(msg) => write!(f, "malformed input: {msg}"),
            Self::Sink(e) => write!(f, "sink: {e}"),
            Self::Exists(key) => write!(f, "document already exists: {key}"),
            Self::Resource(msg) => write!(f, "shared resource: {msg}"),
            Self::Rejected => write!(f, "worker pool rejected task"),
            Self::Interrupted => write!(f, "interrupted"),
            Self::Halted(cause) => write!(f, "halted: {cause}"),
            Self::Panicked(msg) => write!(f, "loader panicked: {msg}"),
        }
    }
}

impl std::error::Error for LoadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Sink(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for LoadError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<SinkError> for LoadError {
    fn from(e: SinkError) -> Self {
        Self::Sink(e)
    }
}

impl From<PoolError> for LoadError {
    fn from(e: PoolError) -> Self {
        match e {
            PoolError::Rejected => Self::Rejected,
            PoolError::Build(msg) => Self::Io(std::io::Error::other(msg)),
        }
    }
}

impl LoadError {
    /// Token-level problem that can be repaired in place when not in fatal mode.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Entity(_) | Self::Attribute(_))
    }

    /// Problem confined to a single record; the unit may continue with the next one.
    pub fn is_record_level(&self) -> bool {
        self.is_recoverable()
            || matches!(
                self,
                Self::Structure(_) | Self::Malformed(_) | Self::Sink(_)
            )
    }

    /// Always halts the pipeline, regardless of the fatal-errors setting.
    pub fn is_always_fatal(&self) -> bool {
        matches!(
            self,
            Self::Config(_)
                | Self::Exists(_)
                | Self::Resource(_)
                | Self::Interrupted
                | Self::Halted(_)
                | Self::Panicked(_)
        ) || matches!(self, Self::Io(e) if e.kind() == std::io::ErrorKind::StorageFull)
    }
}
