//! Record destinations: directory tree, null, and in-memory sinks

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use rustc_hash::FxHashMap;
use serde::Deserialize;

use crate::config::SinkConfig;

/// Error from a sink collaborator
#[derive(Debug)]
pub enum SinkError {
    Io(io::Error),
    /// Key cannot be mapped to a destination
    InvalidKey(String),
    /// Insert after close
    Closed,
}

impl std::fmt::Display for SinkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "IO: {e}"),
            Self::InvalidKey(key) => write!(f, "invalid key {key:?}"),
            Self::Closed => write!(f, "sink is closed"),
        }
    }
}

impl std::error::Error for SinkError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for SinkError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

/// Record payload: buffered bytes or a pull stream read to the end by the sink.
pub enum Content<'a> {
    Bytes(&'a [u8]),
    Stream(&'a mut dyn Read),
}

impl Content<'_> {
    /// Copy the payload into `out`, returning the byte count.
    pub fn write_to(self, out: &mut impl Write) -> io::Result<u64> {
        match self {
            Self::Bytes(bytes) => {
                out.write_all(bytes)?;
                Ok(bytes.len() as u64)
            }
            Self::Stream(reader) => io::copy(reader, out),
        }
    }
}

/// Destination key plus document metadata
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordMeta {
    pub key: String,
    pub collections: Vec<String>,
}

/// Durable destination for records.
///
/// Implementations are shared by all workers and must tolerate concurrent
/// calls for distinct keys.
pub trait Sink: Send + Sync {
    fn exists(&self, key: &str) -> Result<bool, SinkError>;

    /// Store one record, returning the number of content bytes written.
    fn insert(&self, meta: &RecordMeta, content: Content<'_>) -> Result<u64, SinkError>;

    fn close(&self) -> Result<(), SinkError>;
}

/// Sink backends selectable from configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    #[default]
    Directory,
    Null,
}

impl SinkKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Directory => "directory",
            Self::Null => "null",
        }
    }
}

impl std::str::FromStr for SinkKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "directory" | "dir" => Ok(Self::Directory),
            "null" | "none" => Ok(Self::Null),
            other => Err(format!("unknown sink kind {other:?}")),
        }
    }
}

/// Build the configured sink.
pub fn open_sink(config: &SinkConfig) -> Result<Box<dyn Sink>, SinkError> {
    match config.kind {
        SinkKind::Directory => Ok(Box::new(DirectorySink::open(&config.path)?)),
        SinkKind::Null => Ok(Box::new(NullSink::default())),
    }
}

/// Writes each record to `<root>/<key>`.
///
/// Files are written to `<name>.tmp` and renamed into place, so a key that
/// exists always holds a complete record.
#[derive(Debug)]
pub struct DirectorySink {
    root: PathBuf,
    closed: AtomicBool,
}

impl DirectorySink {
    /// Create the root if needed and remove tmp files left by an earlier run.
    pub fn open(root: &Path) -> Result<Self, SinkError> {
        fs::create_dir_all(root)?;
        let removed = cleanup_tmp_files(root)?;
        if removed > 0 {
            log::warn!("Removed {removed} stale tmp files under {}", root.display());
        }
        Ok(Self {
            root: root.to_path_buf(),
            closed: AtomicBool::new(false),
        })
    }

    /// Map a key to a path below the root, rejecting keys that would escape it.
    pub fn path_for(&self, key: &str) -> Result<PathBuf, SinkError> {
        let relative = Path::new(key.trim_start_matches('/'));
        let mut path = self.root.clone();
        let mut parts = 0;
        for component in relative.components() {
            match component {
                Component::Normal(part) => {
                    path.push(part);
                    parts += 1;
                }
                Component::CurDir => {}
                _ => return Err(SinkError::InvalidKey(key.to_string())),
            }
        }
        if parts == 0 || key.ends_with('/') {
            return Err(SinkError::InvalidKey(key.to_string()));
        }
        Ok(path)
    }
}

impl Sink for DirectorySink {
    fn exists(&self, key: &str) -> Result<bool, SinkError> {
        Ok(self.path_for(key)?.is_file())
    }

    fn insert(&self, meta: &RecordMeta, content: Content<'_>) -> Result<u64, SinkError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SinkError::Closed);
        }
        let final_path = self.path_for(&meta.key)?;
        if let Some(parent) = final_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut tmp_name = final_path.as_os_str().to_owned();
        tmp_name.push(".tmp");
        let tmp_path = PathBuf::from(tmp_name);

        let written = (|| {
            let mut file = io::BufWriter::new(File::create(&tmp_path)?);
            let n = content.write_to(&mut file)?;
            file.flush()?;
            Ok::<_, io::Error>(n)
        })();
        match written {
            Ok(n) => {
                fs::rename(&tmp_path, &final_path)?;
                Ok(n)
            }
            Err(e) => {
                let _ = fs::remove_file(&tmp_path);
                Err(e.into())
            }
        }
    }

    fn close(&self) -> Result<(), SinkError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

/// Remove stale `.tmp` files anywhere below `root`.
pub fn cleanup_tmp_files(root: &Path) -> io::Result<usize> {
    let mut removed = 0;
    for entry in walkdir::WalkDir::new(root) {
        let entry = entry.map_err(io::Error::other)?;
        let path = entry.path();
        if entry.file_type().is_file() && path.extension().is_some_and(|ext| ext == "tmp") {
            log::debug!("Removing stale tmp file: {}", path.display());
            fs::remove_file(path)?;
            removed += 1;
        }
    }
    Ok(removed)
}

/// Drains content and keeps nothing. Useful for measuring read throughput.
#[derive(Debug, Default)]
pub struct NullSink {
    bytes: AtomicU64,
}

impl NullSink {
    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }
}

impl Sink for NullSink {
    fn exists(&self, _key: &str) -> Result<bool, SinkError> {
        Ok(false)
    }

    fn insert(&self, _meta: &RecordMeta, content: Content<'_>) -> Result<u64, SinkError> {
        let n = content.write_to(&mut io::sink())?;
        self.bytes.fetch_add(n, Ordering::Relaxed);
        Ok(n)
    }

    fn close(&self) -> Result<(), SinkError> {
        Ok(())
    }
}

/// One record held by [`MemorySink`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRecord {
    pub content: Vec<u8>,
    pub collections: Vec<String>,
}

/// In-memory map from key to record.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<FxHashMap<String, StoredRecord>>,
    inserts: AtomicU64,
    closed: AtomicBool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sink that already holds empty records under `keys`.
    pub fn with_keys<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let sink = Self::new();
        {
            let mut records = sink.records.lock().expect("memory sink poisoned");
            for key in keys {
                records.insert(
                    key.into(),
                    StoredRecord {
                        content: Vec::new(),
                        collections: Vec::new(),
                    },
                );
            }
        }
        sink
    }

    pub fn get(&self, key: &str) -> Option<StoredRecord> {
        self.records
            .lock()
            .expect("memory sink poisoned")
            .get(key)
            .cloned()
    }

    /// Stored keys in sorted order
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = self
            .records
            .lock()
            .expect("memory sink poisoned")
            .keys()
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.records.lock().expect("memory sink poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of successful inserts since creation
    pub fn inserts(&self) -> u64 {
        self.inserts.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Sink for MemorySink {
    fn exists(&self, key: &str) -> Result<bool, SinkError> {
        Ok(self
            .records
            .lock()
            .expect("memory sink poisoned")
            .contains_key(key))
    }

    fn insert(&self, meta: &RecordMeta, content: Content<'_>) -> Result<u64, SinkError> {
        if self.is_closed() {
            return Err(SinkError::Closed);
        }
        let mut bytes = Vec::new();
        let n = content.write_to(&mut bytes)?;
        self.records.lock().expect("memory sink poisoned").insert(
            meta.key.clone(),
            StoredRecord {
                content: bytes,
                collections: meta.collections.clone(),
            },
        );
        self.inserts.fetch_add(1, Ordering::Relaxed);
        Ok(n)
    }

    fn close(&self) -> Result<(), SinkError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn meta(key: &str) -> RecordMeta {
        RecordMeta {
            key: key.to_string(),
            collections: Vec::new(),
        }
    }

    #[test]
    fn directory_sink_writes_nested_keys() {
        let dir = TempDir::new().unwrap();
        let sink = DirectorySink::open(dir.path()).unwrap();
        assert!(!sink.exists("a/b/1.xml").unwrap());

        let n = sink
            .insert(&meta("/a/b/1.xml"), Content::Bytes(b"<r/>"))
            .unwrap();
        assert_eq!(n, 4);
        assert!(sink.exists("a/b/1.xml").unwrap());
        assert_eq!(
            std::fs::read(dir.path().join("a/b/1.xml")).unwrap(),
            b"<r/>"
        );
        assert!(!dir.path().join("a/b/1.xml.tmp").exists());
    }

    #[test]
    fn directory_sink_streams() {
        let dir = TempDir::new().unwrap();
        let sink = DirectorySink::open(dir.path()).unwrap();
        let mut reader: &[u8] = b"streamed body";
        let n = sink.insert(&meta("s"), Content::Stream(&mut reader)).unwrap();
        assert_eq!(n, 13);
        assert_eq!(std::fs::read(dir.path().join("s")).unwrap(), b"streamed body");
    }

    #[test]
    fn directory_sink_rejects_escaping_keys() {
        let dir = TempDir::new().unwrap();
        let sink = DirectorySink::open(dir.path()).unwrap();
        for key in ["../x", "a/../../x", "", "/", "a/"] {
            assert!(
                matches!(sink.path_for(key), Err(SinkError::InvalidKey(_))),
                "{key:?} accepted"
            );
        }
        assert!(sink.path_for("./a/b").is_ok());
    }

    #[test]
    fn directory_sink_removes_stale_tmp() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("nested")).unwrap();
        std::fs::write(dir.path().join("nested/x.tmp"), b"stale").unwrap();
        std::fs::write(dir.path().join("keep.xml"), b"keep").unwrap();

        DirectorySink::open(dir.path()).unwrap();
        assert!(!dir.path().join("nested/x.tmp").exists());
        assert!(dir.path().join("keep.xml").exists());
    }

    #[test]
    fn closed_sinks_reject_inserts() {
        let dir = TempDir::new().unwrap();
        let sink = DirectorySink::open(dir.path()).unwrap();
        sink.close().unwrap();
        assert!(matches!(
            sink.insert(&meta("a"), Content::Bytes(b"x")),
            Err(SinkError::Closed)
        ));

        let memory = MemorySink::new();
        memory.close().unwrap();
        assert!(memory.insert(&meta("a"), Content::Bytes(b"x")).is_err());
    }

    #[test]
    fn memory_sink_prepopulated() {
        let sink = MemorySink::with_keys(["a", "b"]);
        assert!(sink.exists("a").unwrap());
        assert!(!sink.exists("c").unwrap());
        sink.insert(
            &RecordMeta {
                key: "c".into(),
                collections: vec!["batch".into()],
            },
            Content::Bytes(b"<c/>"),
        )
        .unwrap();
        assert_eq!(sink.keys(), vec!["a", "b", "c"]);
        assert_eq!(sink.inserts(), 1);
        assert_eq!(sink.get("c").unwrap().collections, vec!["batch"]);
    }

    #[test]
    fn null_sink_counts_bytes() {
        let sink = NullSink::default();
        let mut reader: &[u8] = b"12345";
        sink.insert(&meta("k"), Content::Stream(&mut reader)).unwrap();
        assert_eq!(sink.bytes(), 5);
        assert!(!sink.exists("k").unwrap());
    }

    #[test]
    fn sink_kind_keys() {
        assert_eq!("Directory".parse::<SinkKind>().unwrap(), SinkKind::Directory);
        assert_eq!("null".parse::<SinkKind>().unwrap(), SinkKind::Null);
        assert!("ftp".parse::<SinkKind>().is_err());
    }
}
