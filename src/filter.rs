//! Eligibility filter for `.class` entries
//!
//! A unit is rewritten only if:
//! - its name ends with `.class`
//! - it matches no whitelist entry
//! - no packages are tracked, or its name contains one of the tracked packages

use crate::whitelist::WhitelistSet;

/// File suffix of compiled classes
pub const UNIT_SUFFIX: &str = ".class";

/// Decide whether the entry named `qualified_name` should be decoded and rewritten
pub fn eligible(qualified_name: &str, whitelist: &WhitelistSet, tracked_packages: &[String]) -> bool {
    qualified_name.ends_with(UNIT_SUFFIX)
        && !whitelist.matches(qualified_name)
        && (tracked_packages.is_empty()
            || tracked_packages
                .iter()
                .any(|package| qualified_name.contains(package.as_str())))
}

/// Whitelist and package scope bundled into one gate
#[derive(Debug, Clone, Default)]
pub struct UnitFilter {
    whitelist: WhitelistSet,
    /// Tracked packages in both dotted and slash form
    tracked: Vec<String>,
}

impl UnitFilter {
    /// Filter that admits every `.class` entry
    pub fn all() -> Self {
        Self::default()
    }

    /// Packages may be written `com.example` or `com/example`; entry paths use
    /// the slash form so both are kept
    pub fn new(whitelist: WhitelistSet, tracked_packages: &[String]) -> Self {
        let mut tracked = Vec::with_capacity(tracked_packages.len() * 2);
        for package in tracked_packages.iter().map(|p| p.trim()).filter(|p| !p.is_empty()) {
            let slashed = package.replace('.', "/");
            if slashed != package {
                tracked.push(slashed);
            }
            tracked.push(package.to_string());
        }
        Self { whitelist, tracked }
    }

    pub fn eligible(&self, qualified_name: &str) -> bool {
        eligible(qualified_name, &self.whitelist, &self.tracked)
    }
}
