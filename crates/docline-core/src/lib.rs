//! Docline Core - streaming bulk loader for record-oriented documents
//!
//! Splits large markup containers (plain, gzip or zip archives) into
//! self-contained records and writes each one to a pluggable [`Sink`] under a
//! key derived from its identifier. Units are loaded in parallel on a bounded
//! worker pool; a monitor thread aggregates progress, throttles workers and
//! halts the run on fatal errors.

pub mod config;
pub mod enumerate;
pub mod error;
pub mod extract;
pub mod input;
pub mod loader;
pub mod logging;
pub mod monitor;
pub mod pipeline;
pub mod pool;
pub mod progress;
pub mod resource;
pub mod shutdown;
pub mod sink;
pub mod skip;
pub mod timer;
pub mod uri;

// Re-exports for convenience
pub use config::{BoundaryRule, ContentFormat, IdMode, LoaderConfig, MalformedAction, SinkConfig};
pub use error::LoadError;
pub use extract::{ExtractOptions, RecordExtractor, RecordHead};
pub use input::InputUnit;
pub use loader::{Loader, LoaderContext, UnitOutcome};
pub use logging::{IndicatifLogger, init_logging};
pub use monitor::{Monitor, MonitorReport, MonitorState};
pub use pipeline::{Pipeline, Summary, run};
pub use pool::{PoolError, WorkerPool};
pub use progress::{ProgressContext, fmt_num};
pub use shutdown::interrupt_flag;
pub use sink::{
    Content, DirectorySink, MemorySink, NullSink, RecordMeta, Sink, SinkError, SinkKind,
    cleanup_tmp_files, open_sink,
};
