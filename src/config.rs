//! Run configuration loaded from `method-tracer.toml`
//!
//! # Example
//!
//! ```toml
//! enabled = true
//! output_dir = "build/trace_result"
//! whitelist_file = "trace-whitelist.json"
//! support_incremental = true
//! package_list = ["com.example.app"]
//! ```
//!
//! The camelCase spellings used by Gradle extensions (`outputDir`,
//! `whitelistFile`, `supportIncremental`, `packageList`) are accepted too.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};

/// Appended to the build directory when no output directory is configured
pub const DEFAULT_OUTPUT_SUFFIX: &str = "trace_result";

/// File name of the incremental snapshot inside the output root
pub const STATE_FILE_NAME: &str = ".trace-state.json";

/// Archive extensions accepted as input trees
pub const ARCHIVE_EXTENSIONS: [&str; 2] = ["jar", "zip"];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TraceConfiguration {
    /// Master switch; a disabled run writes nothing
    pub enabled: bool,

    /// Root of all mirrored output trees
    #[serde(alias = "outputDir")]
    pub output_dir: Option<PathBuf>,

    /// JSON array of class name substrings to leave untouched
    #[serde(alias = "whitelistFile")]
    pub whitelist_file: Option<PathBuf>,

    #[serde(alias = "supportIncremental")]
    pub support_incremental: bool,

    /// Only classes whose path contains one of these are rewritten
    #[serde(alias = "packageList")]
    pub package_list: Vec<String>,

    #[serde(alias = "buildDir")]
    pub build_dir: PathBuf,

    /// Defaults to `<output root>/.trace-state.json`
    #[serde(alias = "stateFile")]
    pub state_file: Option<PathBuf>,
}

impl Default for TraceConfiguration {
    fn default() -> Self {
        Self {
            enabled: true,
            output_dir: None,
            whitelist_file: None,
            support_incremental: false,
            package_list: Vec::new(),
            build_dir: PathBuf::from("build"),
            state_file: None,
        }
    }
}

impl TraceConfiguration {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadConfig {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content).map_err(|source| ConfigError::ParseConfig {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml_str(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    pub fn output_root(&self) -> PathBuf {
        self.output_dir
            .clone()
            .unwrap_or_else(|| self.build_dir.join(DEFAULT_OUTPUT_SUFFIX))
    }

    pub fn state_path(&self) -> PathBuf {
        self.state_file
            .clone()
            .unwrap_or_else(|| self.output_root().join(STATE_FILE_NAME))
    }

    /// Check every input tree and make sure the output root lies outside all of them
    pub fn validate(&self, inputs: &[PathBuf]) -> Result<(), ConfigError> {
        let output = absolute(&self.output_root());
        let state = absolute(&self.state_path());

        for input in inputs {
            if !input.exists() {
                return Err(ConfigError::MissingInput(input.clone()));
            }
            if !input.is_dir() && !is_archive(input) {
                return Err(ConfigError::UnsupportedInput(input.clone()));
            }

            let input_abs = absolute(input);
            if output.starts_with(&input_abs) || input_abs.starts_with(&output) {
                return Err(ConfigError::OutputOverlapsInput {
                    output: self.output_root(),
                    input: input.clone(),
                });
            }
            if state.starts_with(&input_abs) {
                return Err(ConfigError::StateInsideInput {
                    state: self.state_path(),
                    input: input.clone(),
                });
            }
        }
        Ok(())
    }
}

/// True for files ending in `.jar` or `.zip` (case-insensitive)
pub fn is_archive(path: &Path) -> bool {
    path.is_file()
        && path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ARCHIVE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
}

/// Lexically absolute form of `path` (no symlink resolution, `..` folded)
pub(crate) fn absolute(path: &Path) -> PathBuf {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };

    let mut normalized = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    normalized
}
