//! File-upload tracking.
//!
//! A SEND carrying a `file-name` header marks its payload as a file report.
//! The engine notifies a [`FileTracker`] and moves on; nothing the tracker does
//! can affect the protocol.

#![allow(clippy::disallowed_types, reason = "Synchronous in-memory operations only")]

use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::clock::{Clock, SystemClock};

/// Sink for "user U referenced file F at destination D" events.
pub trait FileTracker: Send + Sync {
    /// Record one upload. Fire-and-forget.
    fn track_file(&self, username: &str, file_name: &str, destination: &str);
}

/// One tracked upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    /// Authenticated sender
    pub username: String,
    /// Value of the `file-name` header
    pub file_name: String,
    /// Channel the SEND targeted
    pub destination: String,
    /// When the SEND was processed
    pub uploaded_at_secs: u64,
}

/// In-memory [`FileTracker`] that keeps every record and logs it.
pub struct FileTrackingLog {
    records: Mutex<Vec<FileRecord>>,
    clock: Box<dyn Clock>,
}

impl Default for FileTrackingLog {
    fn default() -> Self {
        Self::new()
    }
}

impl FileTrackingLog {
    /// Empty log stamped with the system clock.
    pub fn new() -> Self {
        Self::with_clock(SystemClock)
    }

    /// Empty log stamped with `clock`.
    pub fn with_clock(clock: impl Clock) -> Self {
        Self { records: Mutex::new(Vec::new()), clock: Box::new(clock) }
    }

    /// All records, oldest first.
    pub fn records(&self) -> Vec<FileRecord> {
        self.lock().clone()
    }

    /// Records uploaded by `username`, oldest first.
    pub fn files_for_user(&self, username: &str) -> Vec<FileRecord> {
        self.lock().iter().filter(|record| record.username == username).cloned().collect()
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether nothing has been tracked yet.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<FileRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl FileTracker for FileTrackingLog {
    fn track_file(&self, username: &str, file_name: &str, destination: &str) {
        tracing::info!(username, file_name, destination, "tracked file upload");

        let record = FileRecord {
            username: username.to_owned(),
            file_name: file_name.to_owned(),
            destination: destination.to_owned(),
            uploaded_at_secs: self.clock.wall_clock_secs(),
        };
        self.lock().push(record);
    }
}
