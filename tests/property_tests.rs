//! Property-based tests for the unit filter, the decoder and tree mirroring

mod utils;

use method_tracer::config::TraceConfiguration;
use method_tracer::filter::{eligible, UnitFilter};
use method_tracer::orchestrator::{output_location, Orchestrator};
use method_tracer::whitelist::WhitelistSet;
use proptest::prelude::*;
use std::collections::BTreeMap;
use tempfile::TempDir;
use utils::*;

fn segment() -> impl Strategy<Value = String> {
    "[a-zA-Z][a-zA-Z0-9_]{0,7}"
}

fn relative_path() -> impl Strategy<Value = String> {
    (
        prop::collection::vec(segment(), 0..3),
        segment(),
        prop::sample::select(vec![".class", ".txt", ".xml", ""]),
    )
        .prop_map(|(dirs, name, ext)| {
            let mut parts = dirs;
            parts.push(format!("{name}{ext}"));
            parts.join("/")
        })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn prop_whitelisted_names_are_never_eligible(
        prefix in "[a-z/]{0,10}",
        entry in "[A-Za-z]{1,8}",
        suffix in "[a-z]{0,5}",
    ) {
        let name = format!("{prefix}{entry}{suffix}.class");
        let whitelist = WhitelistSet::new([entry]);
        prop_assert!(!eligible(&name, &whitelist, &[]));
    }

    #[test]
    fn prop_non_class_entries_are_never_eligible(name in "[a-zA-Z/]{1,20}\\.(txt|xml|MF|png)") {
        prop_assert!(!eligible(&name, &WhitelistSet::default(), &[]));
        prop_assert!(!UnitFilter::all().eligible(&name));
    }

    #[test]
    fn prop_untracked_packages_are_never_eligible(class in "[a-z]{1,6}/[A-Z][a-z]{0,6}") {
        let name = format!("{class}.class");
        let tracked = vec!["zzz.qqq".to_string()];
        prop_assert!(!UnitFilter::new(WhitelistSet::default(), &tracked).eligible(&name));
        prop_assert!(UnitFilter::all().eligible(&name));
    }

    #[test]
    fn prop_decoder_never_panics(bytes in prop::collection::vec(any::<u8>(), 0..256)) {
        let _ = method_tracer::classfile::decode(&bytes);
    }

    #[test]
    fn prop_decoder_survives_truncation(cut in 0usize..200) {
        let class = simple_class("app/Truncated");
        let cut = cut.min(class.len() - 1);
        prop_assert!(method_tracer::classfile::decode(&class[..cut]).is_err());
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_tree_shape_is_preserved(
        files in prop::collection::btree_map(relative_path(), prop::collection::vec(any::<u8>(), 0..64), 1..12),
        with_classes in any::<bool>(),
    ) {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("input");
        std::fs::create_dir_all(&input).unwrap();

        // A file and a directory cannot share a path
        let mut written: BTreeMap<String, Vec<u8>> = BTreeMap::new();
        for (path, bytes) in &files {
            let clashes = written.keys().any(|existing| {
                existing.starts_with(&format!("{path}/")) || path.starts_with(&format!("{existing}/"))
            });
            if clashes {
                continue;
            }
            let bytes = if with_classes && path.ends_with(".class") {
                simple_class("gen/Unit")
            } else {
                bytes.clone()
            };
            write_file(&input, path, &bytes);
            written.insert(path.clone(), bytes);
        }

        let config = TraceConfiguration {
            output_dir: Some(dir.path().join("out")),
            ..Default::default()
        };
        let summary = Orchestrator::new(config, WhitelistSet::default(), None)
            .run(&[input.clone()])
            .unwrap();
        let output = read_tree(&output_location(&dir.path().join("out"), &input));

        prop_assert_eq!(
            output.keys().collect::<Vec<_>>(),
            written.keys().collect::<Vec<_>>()
        );
        for (path, bytes) in &written {
            if !path.ends_with(".class") {
                prop_assert_eq!(&output[path], bytes);
            } else if !with_classes {
                // Random bytes never decode; they are copied unchanged
                prop_assert_eq!(&output[path], bytes);
            }
        }
        prop_assert_eq!(summary.entries_seen, written.len());
    }
}
