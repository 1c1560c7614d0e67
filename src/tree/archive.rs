//! Jar/zip-backed trees
//!
//! The sink writes to a temporary file next to the destination and renames it
//! into place on `finish`, so an output archive is replaced as a whole. Given
//! the input archive, it can also copy members that cannot be decompressed as
//! raw compressed data.

use super::{Compression, EntryHeader, EntryKind, EntrySink, EntrySource};
use crate::error::EntryError;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use zip::write::SimpleFileOptions;
use zip::result::ZipError;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

pub struct ArchiveSource {
    archive: ZipArchive<File>,
}

impl ArchiveSource {
    pub fn open(path: &Path) -> Result<Self, EntryError> {
        let file = File::open(path)?;
        Ok(Self {
            archive: ZipArchive::new(file)?,
        })
    }
}

impl EntrySource for ArchiveSource {
    fn headers(&mut self) -> Result<Vec<EntryHeader>, EntryError> {
        let mut headers = Vec::with_capacity(self.archive.len());
        for index in 0..self.archive.len() {
            let member = self.archive.by_index_raw(index)?;
            let compression = match member.compression() {
                CompressionMethod::Stored => Compression::Stored,
                _ => Compression::Deflated,
            };
            headers.push(EntryHeader {
                relative_path: member.name().to_string(),
                kind: EntryKind::ArchiveMember,
                is_dir: member.is_dir(),
                compression,
            });
        }
        Ok(headers)
    }

    fn read(&mut self, header: &EntryHeader) -> Result<Vec<u8>, EntryError> {
        let mut member = self.archive.by_name(&header.relative_path)?;
        let mut bytes = Vec::with_capacity(member.size() as usize);
        member.read_to_end(&mut bytes)?;
        Ok(bytes)
    }
}

pub struct ArchiveSink {
    destination: PathBuf,
    partial: PathBuf,
    writer: Option<ZipWriter<File>>,
    origin: Option<ZipArchive<File>>,
}

impl ArchiveSink {
    pub fn create(destination: &Path) -> Result<Self, EntryError> {
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut partial = destination.as_os_str().to_owned();
        partial.push(".partial");
        let partial = PathBuf::from(partial);
        let file = File::create(&partial)?;
        Ok(Self {
            destination: destination.to_path_buf(),
            partial,
            writer: Some(ZipWriter::new(file)),
            origin: None,
        })
    }

    /// Open `input` as the source of verbatim member copies
    pub fn copying_from(mut self, input: &Path) -> Result<Self, EntryError> {
        self.origin = Some(ZipArchive::new(File::open(input)?)?);
        Ok(self)
    }

    fn writer(&mut self) -> Result<&mut ZipWriter<File>, EntryError> {
        self.writer
            .as_mut()
            .ok_or_else(|| std::io::Error::other("archive already finished").into())
    }
}

impl EntrySink for ArchiveSink {
    fn write(&mut self, header: &EntryHeader, bytes: &[u8]) -> Result<(), EntryError> {
        let method = match header.compression {
            Compression::Stored => CompressionMethod::Stored,
            Compression::Deflated => CompressionMethod::Deflated,
        };
        let options = SimpleFileOptions::default().compression_method(method);
        let writer = self.writer()?;
        writer.start_file(header.relative_path.as_str(), options)?;
        writer.write_all(bytes)?;
        Ok(())
    }

    fn create_dir(&mut self, header: &EntryHeader) -> Result<(), EntryError> {
        self.writer()?
            .add_directory(header.relative_path.as_str(), SimpleFileOptions::default())?;
        Ok(())
    }

    fn copy_verbatim(&mut self, header: &EntryHeader) -> Result<(), EntryError> {
        let (Some(origin), Some(writer)) = (self.origin.as_mut(), self.writer.as_mut()) else {
            return Err(std::io::Error::other("no input archive to copy from").into());
        };
        let index = origin
            .index_for_name(&header.relative_path)
            .ok_or(ZipError::FileNotFound)?;
        writer.raw_copy_file(origin.by_index_raw(index)?)?;
        Ok(())
    }

    fn finish(&mut self) -> Result<(), EntryError> {
        let Some(writer) = self.writer.take() else {
            return Ok(());
        };
        let committed = commit(writer, &self.partial, &self.destination);
        if committed.is_err() {
            let _ = fs::remove_file(&self.partial);
        }
        committed
    }
}

fn commit(writer: ZipWriter<File>, partial: &Path, destination: &Path) -> Result<(), EntryError> {
    let file = writer.finish()?;
    file.sync_all()?;
    drop(file);
    fs::rename(partial, destination)?;
    Ok(())
}

impl Drop for ArchiveSink {
    fn drop(&mut self) {
        // An unfinished sink leaves no half-written archive behind
        if self.writer.take().is_some() {
            let _ = fs::remove_file(&self.partial);
        }
    }
}
