//! Append-only payload archive.
//!
//! Entries are written once, in closure order, with a single timestamp shared
//! by every entry so that identical inputs produce identical archives.

use std::io::{Cursor, Write};

use chrono::{DateTime, Datelike, Timelike, Utc};
use indexmap::IndexSet;
use log::trace;
use zip::{ZipWriter, write::SimpleFileOptions};

use crate::{
    error::{BuildError, Result},
    module_name::ModuleName,
    types::Compression,
};

/// Zip timestamps cannot represent anything earlier.
pub const MIN_ARCHIVE_YEAR: i32 = 1980;

pub struct ArchiveWriter {
    target: ModuleName,
    zip: ZipWriter<Cursor<Vec<u8>>>,
    options: SimpleFileOptions,
    entries: IndexSet<String>,
}

impl std::fmt::Debug for ArchiveWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveWriter")
            .field("target", &self.target)
            .field("entries", &self.entries)
            .finish_non_exhaustive()
    }
}

impl ArchiveWriter {
    /// `target` is only used to attribute errors.
    pub fn new(
        target: &ModuleName,
        compression: Compression,
        timestamp: DateTime<Utc>,
    ) -> Result<Self> {
        let modified = zip_datetime(target, timestamp)?;
        let options = SimpleFileOptions::default()
            .compression_method(compression.method())
            .last_modified_time(modified);
        Ok(Self {
            target: target.clone(),
            zip: ZipWriter::new(Cursor::new(Vec::new())),
            options,
            entries: IndexSet::new(),
        })
    }

    pub fn contains(&self, path: &str) -> bool {
        self.entries.contains(path)
    }

    /// Entry paths in write order.
    pub fn entries(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Add one entry. Writing the same path twice is a logic error in the
    /// caller and is rejected rather than producing a duplicate zip entry.
    pub fn add(&mut self, path: &str, contents: &[u8]) -> Result<()> {
        if !self.entries.insert(path.to_owned()) {
            return Err(BuildError::archive(
                &self.target,
                std::io::Error::new(
                    std::io::ErrorKind::AlreadyExists,
                    format!("duplicate archive entry {path}"),
                )
                .into(),
            ));
        }
        trace!("Writing archive entry {path} ({} bytes)", contents.len());
        self.zip
            .start_file(path, self.options)
            .map_err(|e| BuildError::archive(&self.target, e))?;
        self.zip
            .write_all(contents)
            .map_err(|e| BuildError::archive(&self.target, e.into()))?;
        Ok(())
    }

    pub fn finish(self) -> Result<Vec<u8>> {
        let cursor = self
            .zip
            .finish()
            .map_err(|e| BuildError::archive(&self.target, e))?;
        Ok(cursor.into_inner())
    }
}

fn zip_datetime(target: &ModuleName, timestamp: DateTime<Utc>) -> Result<zip::DateTime> {
    let invalid = || BuildError::InvalidTimestamp {
        target: target.dotted(),
        timestamp: timestamp.to_rfc3339(),
    };
    if timestamp.year() < MIN_ARCHIVE_YEAR {
        return Err(invalid());
    }
    let year = u16::try_from(timestamp.year()).map_err(|_| invalid())?;
    zip::DateTime::from_date_and_time(
        year,
        timestamp.month() as u8,
        timestamp.day() as u8,
        timestamp.hour() as u8,
        timestamp.minute() as u8,
        timestamp.second() as u8,
    )
    .map_err(|_| invalid())
}
