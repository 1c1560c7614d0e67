//! Run summary: per-tree counts, failures and timing
//!
//! Printed as a table on stderr (the default) or as JSON on stdout with
//! `--format json`.

use crate::incremental::BuildState;
use serde::Serialize;
use std::time::Duration;

/// How a tree was processed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildMode {
    Full,
    Incremental,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureKind {
    /// Decode, instrumentation or encode failure; the entry was copied verbatim
    Unit,
    /// Read/write failure on the entry or its tree
    Io,
}

/// One entry that could not be processed normally
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureRecord {
    pub tree: String,
    pub path: String,
    pub kind: FailureKind,
    pub message: String,
}

/// Counts for one input tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TreeSummary {
    pub input: String,
    pub output: String,
    pub mode: BuildMode,
    /// Entries present in the input (an archive skipped as unchanged counts once)
    pub entries: usize,
    /// Classes written with probes
    pub rewritten: usize,
    /// Entries written byte-for-byte
    pub copied: usize,
    /// Interface and abstract classes among `copied`
    pub skipped_units: usize,
    pub unchanged: usize,
    pub removed: usize,
}

impl TreeSummary {
    pub fn new(input: String, output: String, mode: BuildMode) -> Self {
        Self {
            input,
            output,
            mode,
            entries: 0,
            rewritten: 0,
            copied: 0,
            skipped_units: 0,
            unchanged: 0,
            removed: 0,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Summary {
    pub enabled: bool,
    pub trees: Vec<TreeSummary>,
    pub entries_seen: usize,
    pub entries_rewritten: usize,
    pub entries_copied: usize,
    pub entries_unchanged: usize,
    pub entries_removed: usize,
    /// Outputs of input trees that are no longer part of the build
    pub stale_trees_removed: usize,
    pub methods_instrumented: u64,
    #[serde(rename = "elapsed_ms", serialize_with = "serialize_millis")]
    pub elapsed: Duration,
    pub failures: Vec<FailureRecord>,
    /// Snapshot for the next incremental run; persisted by the caller
    #[serde(skip)]
    pub state: Option<BuildState>,
}

fn serialize_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64() * 1000.0)
}

impl Summary {
    /// Result of a run with tracing switched off
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn push_tree(&mut self, tree: TreeSummary) {
        self.entries_seen += tree.entries;
        self.entries_rewritten += tree.rewritten;
        self.entries_copied += tree.copied;
        self.entries_unchanged += tree.unchanged;
        self.entries_removed += tree.removed;
        self.trees.push(tree);
    }

    pub fn failed(&self) -> usize {
        self.failures.len()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Print a strace-style table to stderr
    pub fn print_text(&self) {
        if !self.enabled {
            eprintln!("Method tracing disabled; nothing written.");
            return;
        }

        eprintln!("  entries  rewritten     copied  unchanged    removed mode         tree");
        eprintln!("--------- ---------- ---------- ---------- ---------- ----------- ----------------");
        for tree in &self.trees {
            let mode = match tree.mode {
                BuildMode::Full => "full",
                BuildMode::Incremental => "incremental",
            };
            eprintln!(
                "{:>9} {:>10} {:>10} {:>10} {:>10} {:<11} {}",
                tree.entries, tree.rewritten, tree.copied, tree.unchanged, tree.removed, mode, tree.input
            );
        }
        eprintln!("--------- ---------- ---------- ---------- ---------- ----------- ----------------");
        eprintln!(
            "{:>9} {:>10} {:>10} {:>10} {:>10} {:<11} total",
            self.entries_seen,
            self.entries_rewritten,
            self.entries_copied,
            self.entries_unchanged,
            self.entries_removed,
            ""
        );
        eprintln!();
        eprintln!("Methods instrumented: {}", self.methods_instrumented);
        if self.stale_trees_removed > 0 {
            eprintln!("Stale output trees removed: {}", self.stale_trees_removed);
        }
        eprintln!("Elapsed: {:.3} ms", self.elapsed.as_secs_f64() * 1000.0);

        if !self.failures.is_empty() {
            eprintln!();
            eprintln!("Failed entries ({}), copied unchanged:", self.failures.len());
            for failure in &self.failures {
                eprintln!("  {}: {}: {}", failure.tree, failure.path, failure.message);
            }
        }
    }
}
