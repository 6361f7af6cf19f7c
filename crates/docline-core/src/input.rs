//! Input units: one file, archive entry, or stream scanned for records

use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, Cursor, Read};
use std::path::{Path, PathBuf};

use flate2::read::MultiGzDecoder;

use crate::error::LoadError;
use crate::resource::{Closeable, ResourceClaim, SharedResource};

/// Buffered reader handed to a loader
pub type UnitReader = Box<dyn BufRead + Send>;

const READ_BUFFER: usize = 256 * 1024;

/// An opened zip archive shared by the tasks loading its entries.
///
/// Closing drops the archive handle and, when configured, deletes the archive
/// if every entry loaded cleanly.
pub struct ZipContainer {
    path: PathBuf,
    archive: Option<zip::ZipArchive<File>>,
    delete_on_close: bool,
    failed: bool,
}

impl ZipContainer {
    pub fn open(path: &Path, delete_on_close: bool) -> io::Result<Self> {
        let file = File::open(path)?;
        let archive = zip::ZipArchive::new(file).map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{}: {e}", path.display()),
            )
        })?;
        log::debug!("{}: {} entries", path.display(), archive.len());
        Ok(Self {
            path: path.to_path_buf(),
            archive: Some(archive),
            delete_on_close,
            failed: false,
        })
    }

    fn archive(&mut self) -> io::Result<&mut zip::ZipArchive<File>> {
        self.archive
            .as_mut()
            .ok_or_else(|| io::Error::other(format!("{} is closed", self.path.display())))
    }

    /// Names of file entries in archive order
    pub fn entry_names(&mut self) -> io::Result<Vec<String>> {
        let archive = self.archive()?;
        let mut names = Vec::with_capacity(archive.len());
        for i in 0..archive.len() {
            let entry = archive.by_index(i).map_err(io::Error::other)?;
            if !entry.is_dir() {
                names.push(entry.name().to_string());
            }
        }
        Ok(names)
    }

    /// Decompress one entry into memory.
    pub fn read_entry(&mut self, name: &str) -> io::Result<Vec<u8>> {
        let mut entry = self.archive()?.by_name(name).map_err(io::Error::other)?;
        let mut bytes = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut bytes)?;
        Ok(bytes)
    }

    /// Keep the archive on disk even if deletion was requested.
    pub fn mark_failed(&mut self) {
        self.failed = true;
    }
}

/// Keep an archive on disk when it closes.
pub fn keep_archive(archive: &SharedResource<ZipContainer>) -> Result<(), LoadError> {
    archive.with(|zip| {
        zip.mark_failed();
        Ok(())
    })
}

impl Closeable for ZipContainer {
    fn close(&mut self) -> io::Result<()> {
        self.archive = None;
        if self.delete_on_close && !self.failed {
            log::info!("Deleting {}", self.path.display());
            fs::remove_file(&self.path)?;
        }
        Ok(())
    }
}

enum Source {
    /// Opened on first read to cap concurrently open descriptors
    File { path: PathBuf, gzip: bool },
    ZipEntry {
        claim: ResourceClaim<ZipContainer>,
        entry: String,
    },
    Stdin,
    Bytes(Vec<u8>),
    /// Released by `finish`
    Spent,
}

/// One container to scan, owned by exactly one loader task.
pub struct InputUnit {
    name: String,
    basename: Option<String>,
    source: Source,
}

impl std::fmt::Debug for InputUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InputUnit")
            .field("name", &self.name)
            .field("basename", &self.basename)
            .finish_non_exhaustive()
    }
}

/// `true` if the name ends in `.gz`, ignoring case.
pub fn is_gzip(name: &str) -> bool {
    name.len() >= 3 && name[name.len() - 3..].eq_ignore_ascii_case(".gz")
}

/// Final path segment with any `.gz` suffix removed.
pub fn basename(name: &str) -> &str {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    if is_gzip(base) {
        &base[..base.len() - 3]
    } else {
        base
    }
}

impl InputUnit {
    /// Plain or gzip-compressed file, opened lazily.
    pub fn file(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = path.display().to_string();
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| name.clone());
        Self {
            basename: Some(basename(&file_name).to_string()),
            source: Source::File {
                gzip: is_gzip(&file_name),
                path,
            },
            name,
        }
    }

    /// Entry of a shared archive; the claim is released when the unit finishes.
    pub fn zip_entry(claim: ResourceClaim<ZipContainer>, entry: impl Into<String>) -> Self {
        let entry = entry.into();
        Self {
            name: format!("{}!{entry}", claim.resource().name()),
            basename: Some(basename(&entry).to_string()),
            source: Source::ZipEntry { claim, entry },
        }
    }

    pub fn stdin() -> Self {
        Self {
            name: "-".to_string(),
            basename: None,
            source: Source::Stdin,
        }
    }

    pub fn bytes(name: impl Into<String>, data: Vec<u8>) -> Self {
        let name = name.into();
        Self {
            basename: Some(basename(&name).to_string()),
            name,
            source: Source::Bytes(data),
        }
    }

    /// Display name: path, `archive!entry`, or `-`
    pub fn name(&self) -> &str {
        &self.name
    }

    /// File name used for ids, key paths and collections
    pub fn basename(&self) -> Option<&str> {
        self.basename.as_deref()
    }

    /// Open the content for reading. Archive entries are decompressed into
    /// memory under the archive lock.
    pub fn open(&mut self) -> Result<UnitReader, LoadError> {
        match &mut self.source {
            Source::File { path, gzip } => {
                let file = File::open(&*path)?;
                if *gzip {
                    Ok(Box::new(BufReader::with_capacity(
                        READ_BUFFER,
                        MultiGzDecoder::new(file),
                    )))
                } else {
                    Ok(Box::new(BufReader::with_capacity(READ_BUFFER, file)))
                }
            }
            Source::ZipEntry { claim, entry } => {
                let bytes = claim.resource().with(|zip| zip.read_entry(entry))?;
                Ok(Box::new(Cursor::new(bytes)))
            }
            Source::Stdin => Ok(Box::new(BufReader::with_capacity(READ_BUFFER, io::stdin()))),
            Source::Bytes(data) => Ok(Box::new(Cursor::new(std::mem::take(data)))),
            Source::Spent => Err(LoadError::Resource(format!(
                "{}: open after finish",
                self.name
            ))),
        }
    }

    /// Release the unit's resources after loading.
    ///
    /// A clean file is deleted when `delete_input` is set; an unclean archive
    /// entry keeps its archive from being deleted.
    pub fn finish(mut self, clean: bool, delete_input: bool) -> Result<(), LoadError> {
        match std::mem::replace(&mut self.source, Source::Spent) {
            Source::File { path, .. } => {
                if clean && delete_input {
                    log::debug!("Deleting {}", path.display());
                    fs::remove_file(&path)?;
                }
                Ok(())
            }
            Source::ZipEntry { claim, .. } => {
                if !clean {
                    keep_archive(claim.resource())?;
                }
                claim.release()?;
                Ok(())
            }
            Source::Stdin | Source::Bytes(_) | Source::Spent => Ok(()),
        }
    }
}

/// A unit dropped without `finish` never loaded, e.g. a queued task discarded
/// by a halt. Its archive must survive.
impl Drop for InputUnit {
    fn drop(&mut self) {
        if let Source::ZipEntry { claim, .. } = &self.source {
            log::debug!("{}: dropped before loading, keeping archive", self.name);
            if let Err(e) = keep_archive(claim.resource()) {
                log::error!("{}: {e}", self.name);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn read_all(unit: &mut InputUnit) -> String {
        let mut s = String::new();
        unit.open().unwrap().read_to_string(&mut s).unwrap();
        s
    }

    #[test]
    fn basenames() {
        assert_eq!(basename("dir/a.xml"), "a.xml");
        assert_eq!(basename(r"dir\b.XML.GZ"), "b.XML");
        assert_eq!(basename("c.xml"), "c.xml");
        assert!(is_gzip("x.Gz"));
        assert!(!is_gzip("gz"));
    }

    #[test]
    fn plain_file_opened_lazily_and_deleted() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.xml");
        let mut unit = InputUnit::file(&path);
        // Nothing is opened until read
        std::fs::write(&path, "<a/>").unwrap();
        assert_eq!(unit.basename(), Some("a.xml"));
        assert_eq!(read_all(&mut unit), "<a/>");
        unit.finish(true, true).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn unclean_file_kept() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.xml");
        std::fs::write(&path, "<a/>").unwrap();
        InputUnit::file(&path).finish(false, true).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn gzip_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("b.xml.gz");
        let mut gz = flate2::write::GzEncoder::new(
            File::create(&path).unwrap(),
            flate2::Compression::default(),
        );
        gz.write_all(b"<b>zipped</b>").unwrap();
        gz.finish().unwrap();

        let mut unit = InputUnit::file(&path);
        assert_eq!(unit.basename(), Some("b.xml"));
        assert_eq!(read_all(&mut unit), "<b>zipped</b>");
    }

    #[test]
    fn bytes_unit() {
        let mut unit = InputUnit::bytes("mem/c.xml", b"<c/>".to_vec());
        assert_eq!(unit.basename(), Some("c.xml"));
        assert_eq!(read_all(&mut unit), "<c/>");
    }

    #[test]
    fn missing_file_is_io_error() {
        let mut unit = InputUnit::file("/nonexistent/docline/x.xml");
        assert!(matches!(unit.open(), Err(LoadError::Io(_))));
    }
}
