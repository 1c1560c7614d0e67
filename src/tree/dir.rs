//! Directory-backed trees

use super::{native_path, Compression, EntryHeader, EntryKind, EntrySink, EntrySource};
use crate::error::EntryError;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;
use walkdir::WalkDir;

/// Recursive listing of a directory, sorted by path
#[derive(Debug, Clone)]
pub struct DirSource {
    root: PathBuf,
}

impl DirSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl EntrySource for DirSource {
    /// Symbolic links are followed and listed under their own path
    ///
    /// A broken link or a link cycle is listed as a file, so reading it fails
    /// and the failure is recorded for that entry alone.
    fn headers(&mut self) -> Result<Vec<EntryHeader>, EntryError> {
        let mut headers = Vec::new();
        for entry in WalkDir::new(&self.root)
            .follow_links(true)
            .min_depth(1)
            .sort_by_file_name()
        {
            let (path, is_dir) = match entry {
                Ok(entry) => {
                    let is_dir = entry.file_type().is_dir();
                    if !is_dir && !entry.file_type().is_file() {
                        continue;
                    }
                    (entry.into_path(), is_dir)
                }
                Err(error) => match error.path().filter(|p| *p != self.root.as_path()) {
                    Some(path) => {
                        warn!(path = %path.display(), %error, "cannot follow directory entry");
                        (path.to_path_buf(), false)
                    }
                    None => return Err(error.into()),
                },
            };
            let mut relative_path = relative_path(path.strip_prefix(&self.root).unwrap_or(&path));
            if is_dir {
                relative_path.push('/');
            }
            headers.push(EntryHeader {
                relative_path,
                kind: EntryKind::DirectoryFile,
                is_dir,
                compression: Compression::Stored,
            });
        }
        Ok(headers)
    }

    fn read(&mut self, header: &EntryHeader) -> Result<Vec<u8>, EntryError> {
        Ok(fs::read(native_path(&self.root, &header.relative_path))?)
    }
}

/// Writes entries under an output directory
#[derive(Debug, Clone)]
pub struct DirSink {
    root: PathBuf,
}

impl DirSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Delete a previously mirrored file and any parent directories left empty
    ///
    /// Deleting a file that is already gone is not an error.
    pub fn remove(&self, relative_path: &str) -> Result<(), EntryError> {
        let path = native_path(&self.root, relative_path);
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let mut dir = path.parent();
        while let Some(current) = dir {
            if current == self.root || !current.starts_with(&self.root) {
                break;
            }
            // Fails once the directory is not empty, which ends the pruning
            if fs::remove_dir(current).is_err() {
                break;
            }
            dir = current.parent();
        }
        Ok(())
    }
}

impl EntrySink for DirSink {
    fn write(&mut self, header: &EntryHeader, bytes: &[u8]) -> Result<(), EntryError> {
        let path = native_path(&self.root, &header.relative_path);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, bytes)?;
        Ok(())
    }

    fn create_dir(&mut self, header: &EntryHeader) -> Result<(), EntryError> {
        fs::create_dir_all(native_path(&self.root, &header.relative_path))?;
        Ok(())
    }

    fn finish(&mut self) -> Result<(), EntryError> {
        Ok(())
    }
}

/// `/`-joined form of a relative filesystem path
fn relative_path(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}
