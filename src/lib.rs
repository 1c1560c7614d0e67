//! method-tracer - build-time method timing instrumentation for JVM bytecode
//!
//! This library mirrors class directories and jar/zip archives into an output
//! root, injecting an entry timestamp and an exit timing record into every
//! concrete method of each eligible class. Whitelisted and out-of-scope
//! entries are copied byte-for-byte, and incremental builds only touch what
//! changed since the previous run.

pub mod classfile;
pub mod cli;
pub mod config;
pub mod error;
pub mod filter;
pub mod incremental;
pub mod instrument;
pub mod orchestrator;
pub mod summary;
pub mod tree;
pub mod whitelist;
