//! Input/output tree mirroring
//!
//! Directory trees and jar/zip archives are both seen as a flat list of
//! entries addressed by a `/`-separated relative path. [`mirror`] walks an
//! [`EntrySource`], passes each selected entry through a rewrite callback and
//! writes the result to an [`EntrySink`] at the same relative path.

pub mod archive;
pub mod dir;

use crate::error::EntryError;
use std::collections::BTreeSet;
use tracing::{debug, warn};

pub use archive::{ArchiveSink, ArchiveSource};
pub use dir::{DirSink, DirSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    DirectoryFile,
    ArchiveMember,
}

/// How an archive member is stored; directory files are always `Stored`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    Stored,
    Deflated,
}

/// Everything about an entry except its bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryHeader {
    pub relative_path: String,
    pub kind: EntryKind,
    /// Directory entries carry no payload and are never rewritten
    pub is_dir: bool,
    pub compression: Compression,
}

/// One file or archive member handed to the rewrite callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputEntry {
    pub relative_path: String,
    pub kind: EntryKind,
    pub payload: Vec<u8>,
}

pub trait EntrySource {
    /// All entries of the tree, directories included
    fn headers(&mut self) -> Result<Vec<EntryHeader>, EntryError>;

    fn read(&mut self, header: &EntryHeader) -> Result<Vec<u8>, EntryError>;
}

pub trait EntrySink {
    fn write(&mut self, header: &EntryHeader, bytes: &[u8]) -> Result<(), EntryError>;

    fn create_dir(&mut self, header: &EntryHeader) -> Result<(), EntryError>;

    /// Write the input entry unchanged without going through its payload
    ///
    /// Used for entries whose payload cannot be read. Sinks that have no
    /// access to the input cannot do this.
    fn copy_verbatim(&mut self, header: &EntryHeader) -> Result<(), EntryError> {
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            format!("cannot copy {} verbatim", header.relative_path),
        )
        .into())
    }

    /// Flush and close the output; nothing may be written afterwards
    fn finish(&mut self) -> Result<(), EntryError>;
}

/// Which entries a mirror pass processes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum EntrySelector {
    #[default]
    All,
    /// Only these relative paths; directory entries are always processed
    Only(BTreeSet<String>),
}

impl EntrySelector {
    pub fn selects(&self, header: &EntryHeader) -> bool {
        match self {
            EntrySelector::All => true,
            EntrySelector::Only(paths) => header.is_dir || paths.contains(&header.relative_path),
        }
    }
}

/// An entry that could not be read or written
#[derive(Debug)]
pub struct EntryFailure {
    pub relative_path: String,
    pub error: EntryError,
    /// The entry still reached the output, copied unchanged
    pub copied: bool,
}

#[derive(Debug, Default)]
pub struct MirrorReport {
    /// Files written, verbatim copies included
    pub written: usize,
    pub failures: Vec<EntryFailure>,
}

impl MirrorReport {
    /// True if every entry selected for the pass reached the output
    pub fn is_complete(&self) -> bool {
        self.failures.iter().all(|f| f.copied)
    }
}

/// Mirror `source` into `sink`, rewriting each selected file with `rewrite`
///
/// Failures are per entry: a file that cannot be read or written is recorded
/// in the report and the walk goes on. A file whose payload cannot be read is
/// handed to [`EntrySink::copy_verbatim`]. Only listing the source or
/// finishing the sink can fail the whole pass.
pub fn mirror<F>(
    source: &mut dyn EntrySource,
    sink: &mut dyn EntrySink,
    selector: &EntrySelector,
    mut rewrite: F,
) -> Result<MirrorReport, EntryError>
where
    F: FnMut(InputEntry) -> Vec<u8>,
{
    let mut report = MirrorReport::default();

    for header in source.headers()? {
        if !selector.selects(&header) {
            continue;
        }

        if header.is_dir {
            if let Err(error) = sink.create_dir(&header) {
                warn!(path = %header.relative_path, %error, "cannot create directory");
                report.failures.push(EntryFailure {
                    relative_path: header.relative_path,
                    error,
                    copied: false,
                });
            }
            continue;
        }

        let payload = match source.read(&header) {
            Ok(payload) => payload,
            Err(error) => {
                let copied = match sink.copy_verbatim(&header) {
                    Ok(()) => {
                        warn!(path = %header.relative_path, %error, "cannot read entry, copied it unchanged");
                        report.written += 1;
                        true
                    }
                    Err(copy_error) => {
                        warn!(path = %header.relative_path, %error, %copy_error, "cannot read entry");
                        false
                    }
                };
                report.failures.push(EntryFailure {
                    relative_path: header.relative_path,
                    error: EntryError::Read(Box::new(error)),
                    copied,
                });
                continue;
            }
        };

        let bytes = rewrite(InputEntry {
            relative_path: header.relative_path.clone(),
            kind: header.kind,
            payload,
        });

        match sink.write(&header, &bytes) {
            Ok(()) => {
                debug!(path = %header.relative_path, bytes = bytes.len(), "entry written");
                report.written += 1;
            }
            Err(error) => {
                warn!(path = %header.relative_path, %error, "cannot write entry");
                report.failures.push(EntryFailure {
                    relative_path: header.relative_path,
                    error,
                    copied: false,
                });
            }
        }
    }

    sink.finish()?;
    Ok(report)
}

/// Join a `/`-separated relative path onto `root`
pub(crate) fn native_path(root: &std::path::Path, relative_path: &str) -> std::path::PathBuf {
    relative_path
        .split('/')
        .filter(|part| !matches!(*part, "" | "." | ".."))
        .fold(root.to_path_buf(), |path, part| path.join(part))
}
