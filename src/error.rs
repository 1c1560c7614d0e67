//! Error taxonomy for a tracing run
//!
//! `ConfigError` is fatal and stops the run before any output is written.
//! `UnitError` and `EntryError` are per entry: the entry falls back to a
//! verbatim copy and the failure is recorded in the summary.

use crate::classfile::{DecodeError, EncodeError};
use crate::instrument::InstrumentError;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Whitelist file not found: {}", .0.display())]
    MissingWhitelist(PathBuf),

    #[error("Failed to read config file {}: {source}", .path.display())]
    ReadConfig {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Invalid config file {}: {source}", .path.display())]
    ParseConfig {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Input not found: {}", .0.display())]
    MissingInput(PathBuf),

    #[error("Unsupported input {}: expected a directory or a .jar/.zip archive", .0.display())]
    UnsupportedInput(PathBuf),

    #[error("Output directory {} overlaps input {}", .output.display(), .input.display())]
    OutputOverlapsInput { output: PathBuf, input: PathBuf },

    #[error("State file {} lies inside input {}", .state.display(), .input.display())]
    StateInsideInput { state: PathBuf, input: PathBuf },

    #[error("Cannot prepare output directory {}: {source}", .path.display())]
    OutputRoot {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Rewriting one class failed
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UnitError {
    #[error("decode failed: {0}")]
    Decode(#[from] DecodeError),

    #[error("instrumentation failed: {0}")]
    Instrument(#[from] InstrumentError),

    #[error("encode failed: {0}")]
    Encode(#[from] EncodeError),
}

/// Processing one tree entry failed
#[derive(Error, Debug)]
pub enum EntryError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("directory walk failed: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("read failed: {0}")]
    Read(Box<EntryError>),
}
