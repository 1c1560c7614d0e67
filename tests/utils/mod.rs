//! Shared helpers for integration tests: class fixtures and tree builders
#![allow(dead_code)]

use method_tracer::classfile;
pub use method_tracer::classfile::fixtures::ClassAssembler;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::Path;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

/// A concrete class with a constructor and one static method
pub fn simple_class(internal_name: &str) -> Vec<u8> {
    let mut class = ClassAssembler::new(internal_name);
    class.default_constructor();
    class.static_identity("identity");
    class.finish()
}

/// Timing record strings found in a class's constant pool
pub fn probe_records(bytes: &[u8]) -> Vec<String> {
    let class = classfile::decode(bytes).unwrap();
    let pool = &class.constant_pool;
    (1..pool.len() as u16)
        .filter_map(|index| pool.utf8(index).ok())
        .filter(|s| s.contains(", name["))
        .collect()
}

pub fn is_instrumented(bytes: &[u8]) -> bool {
    !probe_records(bytes).is_empty()
}

pub fn write_file(root: &Path, relative: &str, bytes: &[u8]) {
    let path = root.join(relative);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, bytes).unwrap();
}

/// Write a jar of deflated members; names ending in `/` become directory entries
pub fn write_jar(path: &Path, entries: &[(&str, &[u8])]) {
    let members: Vec<_> = entries
        .iter()
        .map(|(name, bytes)| (*name, *bytes, CompressionMethod::Deflated))
        .collect();
    write_jar_with(path, &members);
}

pub fn write_jar_with(path: &Path, entries: &[(&str, &[u8], CompressionMethod)]) {
    let mut zip = ZipWriter::new(File::create(path).unwrap());
    for (name, bytes, method) in entries {
        if name.ends_with('/') {
            zip.add_directory(*name, SimpleFileOptions::default()).unwrap();
        } else {
            let options = SimpleFileOptions::default().compression_method(*method);
            zip.start_file(*name, options).unwrap();
            zip.write_all(bytes).unwrap();
        }
    }
    zip.finish().unwrap();
}

/// Patch the local and central headers of member `name` in place
///
/// `local` receives the local file header starting at its signature,
/// `central` the central directory header.
fn patch_member(
    jar: &Path,
    name: &str,
    local: impl Fn(&mut [u8]),
    central: impl Fn(&mut [u8]),
) {
    let mut bytes = fs::read(jar).unwrap();
    let le16 = |b: &[u8], at: usize| u16::from_le_bytes([b[at], b[at + 1]]) as usize;
    let mut pos = 0;
    while pos + 46 < bytes.len() {
        let (name_len_at, name_at, is_local) = match &bytes[pos..pos + 4] {
            b"PK\x03\x04" => (pos + 26, pos + 30, true),
            b"PK\x01\x02" => (pos + 28, pos + 46, false),
            _ => {
                pos += 1;
                continue;
            }
        };
        let len = le16(&bytes, name_len_at);
        if bytes.get(name_at..name_at + len) == Some(name.as_bytes()) {
            if is_local {
                local(&mut bytes[pos..]);
            } else {
                central(&mut bytes[pos..]);
            }
        }
        pos += 4;
    }
    fs::write(jar, bytes).unwrap();
}

/// Mark member `name` as bzip2-compressed, a method this build cannot read
pub fn mark_bzip2(jar: &Path, name: &str) {
    let bzip2 = 12u16.to_le_bytes();
    patch_member(
        jar,
        name,
        |header| header[8..10].copy_from_slice(&bzip2),
        |header| header[10..12].copy_from_slice(&bzip2),
    );
}

/// Break the local header signature of member `name`, so it can be neither
/// read nor copied
pub fn corrupt_local_header(jar: &Path, name: &str) {
    patch_member(jar, name, |header| header[3] = 0x05, |_| {});
}

/// Raw, still compressed bytes of member `name`
pub fn raw_member(jar: &Path, name: &str) -> Vec<u8> {
    let mut archive = ZipArchive::new(File::open(jar).unwrap()).unwrap();
    let index = archive.index_for_name(name).unwrap();
    let mut bytes = Vec::new();
    archive.by_index_raw(index).unwrap().read_to_end(&mut bytes).unwrap();
    bytes
}

/// Member name to contents, directories mapped to empty payloads
pub fn read_jar(path: &Path) -> BTreeMap<String, Vec<u8>> {
    let mut archive = ZipArchive::new(File::open(path).unwrap()).unwrap();
    let mut members = BTreeMap::new();
    for index in 0..archive.len() {
        let mut member = archive.by_index(index).unwrap();
        let mut bytes = Vec::new();
        member.read_to_end(&mut bytes).unwrap();
        members.insert(member.name().to_string(), bytes);
    }
    members
}

/// Relative path to contents of every file below `root`
pub fn read_tree(root: &Path) -> BTreeMap<String, Vec<u8>> {
    walkdir::WalkDir::new(root)
        .min_depth(1)
        .into_iter()
        .map(|entry| entry.unwrap())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| {
            let relative = entry
                .path()
                .strip_prefix(root)
                .unwrap()
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/");
            (relative, fs::read(entry.path()).unwrap())
        })
        .collect()
}
