//! CLI argument parsing for method-tracer

use crate::config::TraceConfiguration;
use clap::{Parser, ValueEnum};
use std::path::PathBuf;

/// Output format for the run summary
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable table on stderr (default)
    Text,
    /// JSON on stdout for machine parsing
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "method-tracer")]
#[command(version)]
#[command(
    about = "Inject method timing probes into compiled JVM classes and jars",
    long_about = None
)]
pub struct Cli {
    /// Input class directories or .jar/.zip archives
    #[arg(value_name = "INPUT", required = true)]
    pub inputs: Vec<PathBuf>,

    /// TOML configuration file; flags below override its values
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Root directory for the mirrored output trees
    #[arg(short = 'o', long = "output-dir", value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    /// JSON array of class name substrings to leave untouched
    #[arg(short = 'w', long = "whitelist", value_name = "FILE")]
    pub whitelist: Option<PathBuf>,

    /// Only rewrite what changed since the previous run
    #[arg(short = 'i', long = "incremental")]
    pub incremental: bool,

    /// Restrict rewriting to these packages (repeatable, e.g. -p com.example)
    #[arg(short = 'p', long = "package", value_name = "PACKAGE")]
    pub packages: Vec<String>,

    /// Build directory; the default output root is <DIR>/trace_result
    #[arg(long = "build-dir", value_name = "DIR")]
    pub build_dir: Option<PathBuf>,

    /// Where the incremental build state is kept
    #[arg(long = "state-file", value_name = "FILE")]
    pub state_file: Option<PathBuf>,

    /// Turn tracing off; nothing is written
    #[arg(long = "disable")]
    pub disable: bool,

    /// Summary format (text or json)
    #[arg(long = "format", value_enum, default_value = "text")]
    pub format: OutputFormat,

    /// Enable trace-level logging
    #[arg(long = "debug")]
    pub debug: bool,
}

impl Cli {
    /// Overlay the flags given on the command line onto `config`
    pub fn apply(&self, config: &mut TraceConfiguration) {
        if self.disable {
            config.enabled = false;
        }
        if let Some(dir) = &self.output_dir {
            config.output_dir = Some(dir.clone());
        }
        if let Some(whitelist) = &self.whitelist {
            config.whitelist_file = Some(whitelist.clone());
        }
        if self.incremental {
            config.support_incremental = true;
        }
        if !self.packages.is_empty() {
            config.package_list = self.packages.clone();
        }
        if let Some(dir) = &self.build_dir {
            config.build_dir = dir.clone();
        }
        if let Some(state) = &self.state_file {
            config.state_file = Some(state.clone());
        }
    }
}
