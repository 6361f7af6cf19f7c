//! Input enumeration: expand paths into input units and hand them to the pool

use std::path::{Path, PathBuf};

use glob::{MatchOptions, Pattern};
use walkdir::WalkDir;

use crate::config::LoaderConfig;
use crate::error::LoadError;
use crate::input::{InputUnit, ZipContainer, basename, keep_archive};
use crate::monitor::Monitor;
use crate::resource::SharedResource;

const MATCH: MatchOptions = MatchOptions {
    case_sensitive: false,
    require_literal_separator: false,
    require_literal_leading_dot: false,
};

/// Counts from one enumeration pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnumStats {
    pub submitted: u64,
    /// Names rejected by the input pattern
    pub excluded: u64,
}

fn is_zip(name: &str) -> bool {
    name.len() >= 4 && name[name.len() - 4..].eq_ignore_ascii_case(".zip")
}

/// Walks the configured inputs in a stable order.
///
/// Archives are registered with the monitor's resource table. The enumerator
/// holds one claim on an archive while queuing its entries and each queued
/// entry holds another, so the archive cannot close before the last entry
/// has been loaded.
pub struct InputEnumerator {
    pattern: Pattern,
    delete_input: bool,
    monitor: Monitor,
    stats: EnumStats,
}

impl InputEnumerator {
    pub fn new(config: &LoaderConfig, monitor: Monitor) -> Result<Self, LoadError> {
        let pattern = Pattern::new(&config.input_pattern).map_err(|e| {
            LoadError::Config(format!("bad input pattern {:?}: {e}", config.input_pattern))
        })?;
        Ok(Self {
            pattern,
            delete_input: config.delete_input,
            monitor,
            stats: EnumStats::default(),
        })
    }

    /// `true` if the name (without any `.gz` suffix) matches the input pattern.
    pub fn accepts(&self, name: &str) -> bool {
        self.pattern.matches_with(basename(name), MATCH)
    }

    /// Enumerate every input, calling `submit` once per unit.
    ///
    /// Stops early, without error, once the monitor halts.
    pub fn run(
        &mut self,
        inputs: &[PathBuf],
        submit: &mut dyn FnMut(InputUnit) -> Result<(), LoadError>,
    ) -> Result<EnumStats, LoadError> {
        self.stats = EnumStats::default();
        for input in inputs {
            if self.monitor.is_halted() {
                break;
            }
            if input.as_os_str() == "-" {
                self.submit(InputUnit::stdin(), submit)?;
            } else if input.is_dir() {
                self.directory(input, submit)?;
            } else if input.is_file() {
                // Named on the command line: taken regardless of the pattern
                self.file(input, submit)?;
            } else {
                return Err(LoadError::Config(format!(
                    "input not found: {}",
                    input.display()
                )));
            }
        }
        log::debug!(
            "enumerated {} units, {} excluded",
            self.stats.submitted,
            self.stats.excluded
        );
        Ok(self.stats)
    }

    fn directory(
        &mut self,
        dir: &Path,
        submit: &mut dyn FnMut(InputUnit) -> Result<(), LoadError>,
    ) -> Result<(), LoadError> {
        for entry in WalkDir::new(dir).sort_by_file_name() {
            if self.monitor.is_halted() {
                break;
            }
            let entry = entry.map_err(|e| LoadError::Io(e.into()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy();
            if name.ends_with(".tmp") {
                continue;
            }
            if !is_zip(&name) && !self.accepts(&name) {
                self.exclude(&entry.path().display().to_string());
                continue;
            }
            self.file(entry.path(), submit)?;
        }
        Ok(())
    }

    fn file(
        &mut self,
        path: &Path,
        submit: &mut dyn FnMut(InputUnit) -> Result<(), LoadError>,
    ) -> Result<(), LoadError> {
        let name = path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default();
        if is_zip(&name) {
            self.archive(path, submit)
        } else {
            self.submit(InputUnit::file(path), submit)
        }
    }

    fn archive(
        &mut self,
        path: &Path,
        submit: &mut dyn FnMut(InputUnit) -> Result<(), LoadError>,
    ) -> Result<(), LoadError> {
        let name = path.display().to_string();
        let delete = self.delete_input;
        let archive = self
            .monitor
            .open_resource(&name, || ZipContainer::open(path, delete))?;
        let enumeration = self.monitor.claim_resource(&name)?;
        let result = self.entries(&name, &archive, submit);
        if !matches!(result, Ok(true)) {
            log::debug!("{name}: enumeration cut short, keeping archive");
            keep_archive(&archive)?;
        }
        enumeration.release()?;
        result.map(|_| ())
    }

    /// Submit one unit per accepted entry. `false` if a halt stopped it early.
    fn entries(
        &mut self,
        name: &str,
        archive: &SharedResource<ZipContainer>,
        submit: &mut dyn FnMut(InputUnit) -> Result<(), LoadError>,
    ) -> Result<bool, LoadError> {
        let entries = archive.with(|zip| zip.entry_names())?;
        log::info!("{name}: {} entries", entries.len());

        for entry in entries {
            if self.monitor.is_halted() {
                return Ok(false);
            }
            if is_zip(&entry) {
                log::warn!("{name}: skipping nested archive {entry}");
                self.stats.excluded += 1;
                continue;
            }
            if !self.accepts(&entry) {
                self.exclude(&format!("{name}!{entry}"));
                continue;
            }
            let claim = self.monitor.claim_resource(name)?;
            self.submit(InputUnit::zip_entry(claim, entry), submit)?;
        }
        Ok(true)
    }

    fn exclude(&mut self, name: &str) {
        log::info!("skipping {name}");
        self.stats.excluded += 1;
    }

    fn submit(
        &mut self,
        unit: InputUnit,
        submit: &mut dyn FnMut(InputUnit) -> Result<(), LoadError>,
    ) -> Result<(), LoadError> {
        log::debug!("queuing {}", unit.name());
        submit(unit)?;
        self.stats.submitted += 1;
        Ok(())
    }
}
