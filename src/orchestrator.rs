//! Tracing run driver
//!
//! The orchestrator owns the unit filter and the instrumentation counter and
//! walks every input tree:
//!
//! 1. A full build clears the output root; an incremental build removes the
//!    outputs of trees that left the build and diffs the rest.
//! 2. Each tree is mirrored to `<output root>/<stem>_<hash><ext>`.
//! 3. Every mirrored entry goes through [`Orchestrator::rewrite`]: eligible
//!    classes are decoded, instrumented and re-encoded, everything else (and
//!    any class that fails) is copied byte-for-byte.

use crate::classfile;
use crate::config::{self, TraceConfiguration};
use crate::error::{ConfigError, EntryError, UnitError};
use crate::filter::UnitFilter;
use crate::incremental::{self, BuildState, ChangeStatus, TreeSnapshot, TreeState};
use crate::instrument::{self, InstrumentationCounter, Outcome};
use crate::summary::{BuildMode, FailureKind, FailureRecord, Summary, TreeSummary};
use crate::tree::{self, ArchiveSink, ArchiveSource, DirSink, DirSource, EntrySelector, InputEntry};
use crate::whitelist::WhitelistSet;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Hex characters of the input path digest used in output names
const OUTPUT_HASH_LEN: usize = 16;

/// Result of rewriting one class
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitRewrite {
    Rewritten { bytes: Vec<u8>, methods: usize },
    /// Interface or abstract class; the original bytes stand
    Skipped,
    /// No method has a code body; the original bytes stand
    NoMethods,
}

/// Decode, instrument and re-encode one class
pub fn rewrite_unit(bytes: &[u8], counter: &InstrumentationCounter) -> Result<UnitRewrite, UnitError> {
    let mut class = classfile::decode(bytes)?;
    match instrument::instrument(&mut class, counter)? {
        Outcome::SkippedUnit => Ok(UnitRewrite::Skipped),
        Outcome::Instrumented { methods: 0 } => Ok(UnitRewrite::NoMethods),
        Outcome::Instrumented { methods } => Ok(UnitRewrite::Rewritten {
            bytes: classfile::encode(&class)?,
            methods,
        }),
    }
}

/// Key of an input tree in the build state
pub fn tree_key(input: &Path) -> String {
    config::absolute(input).to_string_lossy().into_owned()
}

/// Unique output location of `input` under `output_root`
///
/// `classes` becomes `classes_<hash>`, `lib.jar` becomes `lib_<hash>.jar`,
/// where `<hash>` is the first 16 hex digits of the SHA-256 of the absolute
/// input path.
pub fn output_location(output_root: &Path, input: &Path) -> PathBuf {
    let absolute = config::absolute(input);
    let digest = hex::encode(Sha256::digest(absolute.to_string_lossy().as_bytes()));
    let hash = &digest[..OUTPUT_HASH_LEN];

    let name = if config::is_archive(input) {
        let stem = absolute
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let ext = absolute
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();
        format!("{stem}_{hash}{ext}")
    } else {
        let stem = absolute
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "tree".to_string());
        format!("{stem}_{hash}")
    };
    output_root.join(name)
}

pub struct Orchestrator {
    config: TraceConfiguration,
    filter: UnitFilter,
    previous: Option<BuildState>,
    counter: InstrumentationCounter,
}

impl Orchestrator {
    pub fn new(
        config: TraceConfiguration,
        whitelist: WhitelistSet,
        previous: Option<BuildState>,
    ) -> Self {
        let filter = UnitFilter::new(whitelist, &config.package_list);
        Self {
            config,
            filter,
            previous,
            counter: InstrumentationCounter::new(),
        }
    }

    /// Load the whitelist and, for incremental builds, the previous state
    ///
    /// A missing or unusable state file is not an error; the run falls back to
    /// a full build.
    pub fn from_config(config: TraceConfiguration) -> Result<Self, ConfigError> {
        if !config.enabled {
            return Ok(Self::new(config, WhitelistSet::default(), None));
        }
        let whitelist = WhitelistSet::load(config.whitelist_file.as_deref())?;
        debug!(entries = whitelist.len(), "whitelist loaded");

        let previous = if config.support_incremental {
            load_previous(&config.state_path())
        } else {
            None
        };
        Ok(Self::new(config, whitelist, previous))
    }

    pub fn config(&self) -> &TraceConfiguration {
        &self.config
    }

    pub fn counter(&self) -> &InstrumentationCounter {
        &self.counter
    }

    /// Mirror every input tree into the output root
    pub fn run(&self, inputs: &[PathBuf]) -> Result<Summary, ConfigError> {
        if !self.config.enabled {
            info!("method tracing disabled");
            return Ok(Summary::disabled());
        }
        self.config.validate(inputs)?;

        let started = Instant::now();
        let counted_before = self.counter.get();
        let output_root = self.config.output_root();

        let previous = match (&self.previous, self.config.support_incremental) {
            (Some(previous), true) => Some(previous),
            (None, true) => {
                warn!("no usable build state, running a full build");
                None
            }
            _ => None,
        };
        let mode = if previous.is_some() {
            BuildMode::Incremental
        } else {
            BuildMode::Full
        };
        info!(
            inputs = inputs.len(),
            output = %output_root.display(),
            ?mode,
            "starting method tracing"
        );

        let mut summary = Summary {
            enabled: true,
            ..Default::default()
        };
        match previous {
            None => reset_output_root(&output_root)?,
            Some(previous) => {
                fs::create_dir_all(&output_root).map_err(|source| ConfigError::OutputRoot {
                    path: output_root.clone(),
                    source,
                })?;
                remove_stale_trees(previous, inputs, &output_root, &mut summary);
            }
        }

        let mut state = BuildState::default();
        for input in inputs {
            let key = tree_key(input);
            let output = output_location(&output_root, input);
            let previous_tree = previous
                .and_then(|p| p.tree(&key))
                .filter(|t| t.output == output);

            let mut tree = TreeSummary::new(key.clone(), output.display().to_string(), mode);
            let snapshot = if config::is_archive(input) {
                self.mirror_archive(input, &output, previous_tree, &mut tree, &mut summary.failures)
            } else {
                self.mirror_directory(input, &output, previous_tree, &mut tree, &mut summary.failures)
            };
            info!(
                tree = %key,
                rewritten = tree.rewritten,
                copied = tree.copied,
                unchanged = tree.unchanged,
                removed = tree.removed,
                "tree mirrored"
            );
            if let Some(snapshot) = snapshot {
                state.trees.insert(key, TreeState { output, snapshot });
            }
            summary.push_tree(tree);
        }

        summary.methods_instrumented = self.counter.get() - counted_before;
        summary.elapsed = started.elapsed();
        summary.state = Some(state);
        info!(
            entries = summary.entries_seen,
            methods = summary.methods_instrumented,
            failures = summary.failed(),
            elapsed_ms = summary.elapsed.as_millis() as u64,
            "method tracing finished"
        );
        Ok(summary)
    }

    fn mirror_directory(
        &self,
        input: &Path,
        output: &Path,
        previous: Option<&TreeState>,
        tree: &mut TreeSummary,
        failures: &mut Vec<FailureRecord>,
    ) -> Option<TreeSnapshot> {
        let mut snapshot = match TreeSnapshot::of_directory(input) {
            Ok(snapshot) => snapshot,
            Err(error) => {
                warn!(tree = %tree.input, %error, "cannot scan input directory");
                failures.push(io_failure(&tree.input, "", &error));
                return None;
            }
        };
        tree.entries = snapshot.len();

        let selector = match previous {
            Some(previous) => {
                let records = incremental::compute_change_set(&previous.snapshot, &snapshot);
                let sink = DirSink::new(output);
                for record in records.iter().filter(|r| r.status == ChangeStatus::Removed) {
                    match sink.remove(&record.relative_path) {
                        Ok(()) => {
                            debug!(path = %record.relative_path, "removed output entry");
                            tree.removed += 1;
                        }
                        Err(error) => {
                            warn!(path = %record.relative_path, %error, "cannot remove output entry");
                            failures.push(io_failure(&tree.input, &record.relative_path, &error));
                        }
                    }
                }
                tree.unchanged = incremental::count(&records, ChangeStatus::Unchanged);
                incremental::rewrite_selector(&records)
            }
            None => {
                if output.exists() {
                    if let Err(error) = fs::remove_dir_all(output) {
                        warn!(output = %output.display(), %error, "cannot clear stale output");
                    }
                }
                EntrySelector::All
            }
        };

        let mut source = DirSource::new(input);
        let mut sink = DirSink::new(output);
        let report = tree::mirror(&mut source, &mut sink, &selector, |entry| {
            self.rewrite(entry, &self.counter, tree, failures)
        });

        match report {
            Ok(report) => {
                for failure in report.failures {
                    // Not mirrored, so the next incremental run must retry it
                    snapshot.entries.remove(&failure.relative_path);
                    failures.push(io_failure(&tree.input, &failure.relative_path, &failure.error));
                }
                Some(snapshot)
            }
            Err(error) => {
                warn!(tree = %tree.input, %error, "cannot mirror directory");
                failures.push(io_failure(&tree.input, "", &error));
                None
            }
        }
    }

    /// Archives are rewritten as a whole
    ///
    /// A member that cannot be decompressed is copied as raw compressed data.
    /// Only an archive that cannot be opened, or a member that cannot be
    /// copied at all, makes the whole archive fall back to a verbatim copy.
    /// Methods are counted once the rewritten archive is committed.
    fn mirror_archive(
        &self,
        input: &Path,
        output: &Path,
        previous: Option<&TreeState>,
        tree: &mut TreeSummary,
        failures: &mut Vec<FailureRecord>,
    ) -> Option<TreeSnapshot> {
        let snapshot = match TreeSnapshot::of_archive(input) {
            Ok(snapshot) => snapshot,
            Err(error) => {
                warn!(tree = %tree.input, %error, "cannot fingerprint archive");
                failures.push(io_failure(&tree.input, "", &error));
                return None;
            }
        };

        if let Some(previous) = previous {
            if previous.snapshot == snapshot && output.is_file() {
                debug!(tree = %tree.input, "archive unchanged");
                tree.entries = 1;
                tree.unchanged = 1;
                return Some(snapshot);
            }
        }

        let counter = InstrumentationCounter::new();
        let result = ArchiveSource::open(input).and_then(|mut source| {
            let mut sink = ArchiveSink::create(output)?.copying_from(input)?;
            tree::mirror(&mut source, &mut sink, &EntrySelector::All, |entry| {
                self.rewrite(entry, &counter, tree, failures)
            })
        });

        let error = match result {
            Ok(report) if report.is_complete() => {
                for failure in &report.failures {
                    tree.copied += 1;
                    failures.push(FailureRecord {
                        message: format!("{}; copied unchanged", failure.error),
                        ..io_failure(&tree.input, &failure.relative_path, &failure.error)
                    });
                }
                self.counter.add(counter.get());
                tree.entries = report.written;
                return Some(snapshot);
            }
            Ok(report) => {
                for failure in report.failures.iter().filter(|f| !f.copied) {
                    failures.push(io_failure(&tree.input, &failure.relative_path, &failure.error));
                }
                format!(
                    "{} entries could not be mirrored",
                    report.failures.iter().filter(|f| !f.copied).count()
                )
            }
            Err(error) => error.to_string(),
        };

        warn!(tree = %tree.input, %error, "copying archive unchanged");
        tree.entries = 1;
        tree.rewritten = 0;
        tree.skipped_units = 0;
        tree.copied = 1;
        failures.push(FailureRecord {
            tree: tree.input.clone(),
            path: String::new(),
            kind: FailureKind::Io,
            message: format!("archive copied unchanged: {error}"),
        });

        match copy_file(input, output) {
            Ok(()) => Some(snapshot),
            Err(error) => {
                warn!(tree = %tree.input, %error, "cannot copy archive");
                failures.push(io_failure(&tree.input, "", &error));
                None
            }
        }
    }

    /// Bytes to write for one mirrored entry
    fn rewrite(
        &self,
        entry: InputEntry,
        counter: &InstrumentationCounter,
        tree: &mut TreeSummary,
        failures: &mut Vec<FailureRecord>,
    ) -> Vec<u8> {
        if !self.filter.eligible(&entry.relative_path) {
            tree.copied += 1;
            return entry.payload;
        }

        match rewrite_unit(&entry.payload, counter) {
            Ok(UnitRewrite::Rewritten { bytes, methods }) => {
                debug!(path = %entry.relative_path, methods, "unit instrumented");
                tree.rewritten += 1;
                bytes
            }
            Ok(UnitRewrite::Skipped) => {
                debug!(path = %entry.relative_path, "interface or abstract unit skipped");
                tree.copied += 1;
                tree.skipped_units += 1;
                entry.payload
            }
            Ok(UnitRewrite::NoMethods) => {
                tree.copied += 1;
                entry.payload
            }
            Err(error) => {
                warn!(path = %entry.relative_path, %error, "cannot rewrite unit, copying it unchanged");
                failures.push(FailureRecord {
                    tree: tree.input.clone(),
                    path: entry.relative_path,
                    kind: FailureKind::Unit,
                    message: error.to_string(),
                });
                tree.copied += 1;
                entry.payload
            }
        }
    }
}

fn load_previous(path: &Path) -> Option<BuildState> {
    if !path.exists() {
        info!(state = %path.display(), "no previous build state");
        return None;
    }
    match BuildState::load(path) {
        Ok(state) => {
            debug!(state = %path.display(), trees = state.trees.len(), "previous build state loaded");
            Some(state)
        }
        Err(error) => {
            warn!(state = %path.display(), error = %format!("{error:#}"), "ignoring build state");
            None
        }
    }
}

fn reset_output_root(output_root: &Path) -> Result<(), ConfigError> {
    let to_config_error = |source| ConfigError::OutputRoot {
        path: output_root.to_path_buf(),
        source,
    };
    if output_root.exists() {
        debug!(output = %output_root.display(), "clearing previous output");
        fs::remove_dir_all(output_root).map_err(to_config_error)?;
    }
    fs::create_dir_all(output_root).map_err(to_config_error)
}

/// Delete the outputs of trees recorded in `previous` that are no longer inputs
fn remove_stale_trees(
    previous: &BuildState,
    inputs: &[PathBuf],
    output_root: &Path,
    summary: &mut Summary,
) {
    let current: BTreeSet<String> = inputs.iter().map(|input| tree_key(input)).collect();
    let root = config::absolute(output_root);

    for (key, stale) in previous.trees.iter().filter(|(key, _)| !current.contains(*key)) {
        // Never delete anything outside the output root
        if !config::absolute(&stale.output).starts_with(&root) {
            warn!(tree = %key, output = %stale.output.display(), "stale output outside output root, leaving it");
            continue;
        }

        let removed = if stale.output.is_dir() {
            fs::remove_dir_all(&stale.output)
        } else {
            fs::remove_file(&stale.output)
        };
        match removed {
            Ok(()) => {}
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
            Err(error) => {
                warn!(tree = %key, %error, "cannot remove stale output");
                summary.failures.push(io_failure(key, "", &error));
                continue;
            }
        }
        info!(tree = %key, "input tree left the build, output removed");
        summary.stale_trees_removed += 1;
        summary.entries_removed += stale.snapshot.len();
    }
}

/// Copy through a partial file so a failed copy leaves no truncated output
fn copy_file(from: &Path, to: &Path) -> Result<(), EntryError> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut partial = to.as_os_str().to_owned();
    partial.push(".partial");
    let partial = PathBuf::from(partial);
    if let Err(error) = fs::copy(from, &partial) {
        let _ = fs::remove_file(&partial);
        return Err(error.into());
    }
    fs::rename(&partial, to)?;
    Ok(())
}

fn io_failure(tree: &str, path: &str, error: &impl std::fmt::Display) -> FailureRecord {
    FailureRecord {
        tree: tree.to_string(),
        path: path.to_string(),
        kind: FailureKind::Io,
        message: error.to_string(),
    }
}
