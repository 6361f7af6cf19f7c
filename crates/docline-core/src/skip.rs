//! Run-wide skip state shared by all loaders
//!
//! The start id and the skip-existing flag are the only settings that change
//! while workers run. Each transition happens exactly once, and only the
//! worker that performs it is told so.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::config::LoaderConfig;

/// Result of checking a record id against the start id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartIdCheck {
    /// No start id is active
    Inactive,
    /// Still scanning; skip this record
    Skip,
    /// This record is the start id; scanning is over
    Matched,
}

#[derive(Debug)]
pub struct SkipState {
    start_id: Mutex<Option<String>>,
    /// Fast path once the start id has been cleared
    scanning: AtomicBool,
    skip_existing: AtomicBool,
    error_existing: bool,
    until_first_miss: bool,
}

impl SkipState {
    pub fn new(
        start_id: Option<String>,
        skip_existing: bool,
        error_existing: bool,
        until_first_miss: bool,
    ) -> Self {
        Self {
            scanning: AtomicBool::new(start_id.is_some()),
            start_id: Mutex::new(start_id),
            skip_existing: AtomicBool::new(skip_existing),
            error_existing,
            until_first_miss,
        }
    }

    pub fn from_config(config: &LoaderConfig) -> Self {
        Self::new(
            config.start_id.clone(),
            config.skip_existing,
            config.error_existing,
            config.skip_existing_until_first_miss,
        )
    }

    /// Compare `id` with the start id, clearing it on a match.
    pub fn check_start_id(&self, id: &str) -> StartIdCheck {
        if !self.scanning.load(Ordering::Acquire) {
            return StartIdCheck::Inactive;
        }
        let mut start_id = self.start_id.lock().expect("skip state poisoned");
        match start_id.as_deref() {
            None => StartIdCheck::Inactive,
            Some(start) if start == id => {
                *start_id = None;
                self.scanning.store(false, Ordering::Release);
                StartIdCheck::Matched
            }
            Some(_) => StartIdCheck::Skip,
        }
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning.load(Ordering::Acquire)
    }

    /// Whether the sink must be asked if the key exists.
    pub fn should_check_existing(&self) -> bool {
        self.error_existing || self.skip_existing.load(Ordering::Acquire)
    }

    pub fn skip_existing(&self) -> bool {
        self.skip_existing.load(Ordering::Acquire)
    }

    pub fn error_existing(&self) -> bool {
        self.error_existing
    }

    /// Note a key that was not in the sink.
    ///
    /// With until-first-miss set, the first miss turns skip-existing off.
    /// Returns `true` only for the caller that made that change.
    pub fn record_miss(&self) -> bool {
        self.until_first_miss
            && self
                .skip_existing
                .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
    }
}
