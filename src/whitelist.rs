//! Whitelist of class name substrings exempt from instrumentation
//!
//! The whitelist file is a JSON array of strings, e.g.
//! `["BuildConfig", "R.class", "R$"]`.

use crate::error::ConfigError;
use serde::Serialize;
use serde_json::Value;
use std::path::Path;
use tracing::{debug, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WhitelistSet {
    entries: Vec<String>,
}

impl WhitelistSet {
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            entries: entries.into_iter().map(Into::into).collect(),
        }
    }

    /// Load from an optional source; no source means an empty whitelist
    pub fn load(source: Option<&Path>) -> Result<Self, ConfigError> {
        match source {
            Some(path) => Self::from_file(path),
            None => Ok(Self::default()),
        }
    }

    /// Load a JSON array of strings
    ///
    /// A missing file is a configuration error. A file that exists but cannot
    /// be read or parsed yields an empty whitelist with a warning.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::MissingWhitelist(path.to_path_buf()));
        }

        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot read whitelist, using none");
                return Ok(Self::default());
            }
        };

        let whitelist = Self::from_json(&text).unwrap_or_else(|reason| {
            warn!(path = %path.display(), %reason, "invalid whitelist, using none");
            Self::default()
        });
        debug!(path = %path.display(), entries = whitelist.len(), "whitelist loaded");
        Ok(whitelist)
    }

    /// Parse whitelist JSON, skipping elements that are not strings
    pub fn from_json(text: &str) -> Result<Self, String> {
        let value: Value = serde_json::from_str(text).map_err(|e| e.to_string())?;
        let Value::Array(items) = value else {
            return Err("expected a JSON array of strings".to_string());
        };

        let mut entries = Vec::with_capacity(items.len());
        for item in items {
            match item {
                Value::String(s) => entries.push(s),
                other => warn!(element = %other, "ignoring non-string whitelist element"),
            }
        }
        Ok(Self { entries })
    }

    /// True if `name` contains any entry (case-sensitive)
    pub fn matches(&self, name: &str) -> bool {
        self.entries.iter().any(|entry| name.contains(entry.as_str()))
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
