//! Wheel filename tags
//!
//! Parses `name-version(-build)?-pytag-abitag-plattag.whl` and answers the one
//! question the resolver cares about: can this file be installed on CPython
//! `3.m` for a given Linux architecture?

use crate::system::Architecture;

/// Compressed tag sets of one wheel filename
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WheelTags {
    /// Interpreter tags (`cp312`, `py3`, ...)
    pub python: Vec<String>,
    /// ABI tags (`cp312`, `abi3`, `none`)
    pub abi: Vec<String>,
    /// Platform tags (`manylinux_2_28_x86_64`, `any`, ...)
    pub platform: Vec<String>,
}

/// Why a wheel is installable
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WheelMatch {
    /// Built for exactly this interpreter minor
    Exact,
    /// Pure distribution with no interpreter or platform binding
    Universal,
    /// Bound to the architecture but to no interpreter
    ArchitectureOnly,
    /// Stable ABI wheel whose minimum minor is at or below the candidate
    StableAbi {
        /// Minimum supported minor
        min_minor: u32,
    },
}

impl WheelTags {
    /// Parse a wheel filename. Returns `None` for anything that is not a
    /// well-formed wheel (sdists, checksums, installers).
    pub fn parse(filename: &str) -> Option<Self> {
        let stem = filename.strip_suffix(".whl")?;
        let parts: Vec<&str> = stem.split('-').collect();
        if parts.len() != 5 && parts.len() != 6 {
            return None;
        }

        let split = |s: &str| -> Vec<String> { s.split('.').map(|t| t.to_lowercase()).collect() };
        let n = parts.len();
        let tags = WheelTags {
            python: split(parts[n - 3]),
            abi: split(parts[n - 2]),
            platform: split(parts[n - 1]),
        };

        if tags.python.iter().any(|t| t.is_empty()) || tags.platform.iter().any(|t| t.is_empty()) {
            return None;
        }
        Some(tags)
    }

    fn is_stable_abi(&self) -> bool {
        self.abi.iter().any(|a| a == "abi3")
    }

    fn is_pure_platform(&self) -> bool {
        self.platform.iter().any(|p| p == "any")
    }

    /// Any Linux platform tag for `arch`
    pub fn targets_linux(&self, arch: Architecture) -> bool {
        self.platform.iter().any(|p| is_linux_platform_for(p, arch))
    }

    fn platform_ok(&self, arch: Architecture) -> bool {
        self.is_pure_platform() || self.targets_linux(arch)
    }

    /// Interpreter minors this wheel was explicitly built for (CPython 3 only,
    /// stable-ABI wheels excluded)
    pub fn interpreter_minors(&self) -> Vec<u32> {
        if self.is_stable_abi() {
            return Vec::new();
        }
        self.python.iter().filter_map(|t| python_tag_minor(t)).collect()
    }

    /// Check installability on CPython `3.minor` for `arch`
    pub fn supports(&self, minor: u32, arch: Architecture) -> Option<WheelMatch> {
        if !self.platform_ok(arch) {
            return None;
        }

        let generic_python = self.python.iter().all(|t| is_generic_python_tag(t));

        if self.is_stable_abi() {
            let min_minor = self
                .python
                .iter()
                .filter_map(|t| python_tag_minor(t))
                .min()?;
            return (min_minor <= minor).then_some(WheelMatch::StableAbi { min_minor });
        }

        if self.interpreter_minors().contains(&minor) {
            return Some(WheelMatch::Exact);
        }

        if generic_python && self.abi.iter().all(|a| a == "none") {
            if self.is_pure_platform() {
                return Some(WheelMatch::Universal);
            }
            return Some(WheelMatch::ArchitectureOnly);
        }

        None
    }
}

/// Minor of a `cp3M` / `py3M` tag
fn python_tag_minor(tag: &str) -> Option<u32> {
    let digits = tag
        .strip_prefix("cp3")
        .or_else(|| tag.strip_prefix("py3"))?;
    if digits.is_empty() {
        return None;
    }
    digits.parse().ok()
}

/// `py3`, `py2`, `py2.py3` components: interpreter-agnostic
fn is_generic_python_tag(tag: &str) -> bool {
    matches!(tag, "py2" | "py3" | "py")
}

/// `manylinux_2_17_x86_64`, `musllinux_1_2_aarch64`, `linux_x86_64`, ...
fn is_linux_platform_for(tag: &str, arch: Architecture) -> bool {
    let linux = tag.starts_with("manylinux") || tag.starts_with("musllinux") || tag.starts_with("linux_");
    linux
        && arch
            .aliases()
            .iter()
            .any(|alias| tag.ends_with(&format!("_{}", alias)))
}

/// Highest explicit interpreter minor among `filenames` for `arch`
pub fn highest_minor<'a>(filenames: impl IntoIterator<Item = &'a str>, arch: Architecture) -> Option<u32> {
    filenames
        .into_iter()
        .filter_map(WheelTags::parse)
        .filter(|tags| tags.targets_linux(arch))
        .flat_map(|tags| tags.interpreter_minors())
        .max()
}

/// First file among `filenames` installable on `3.minor` for `arch`
pub fn find_compatible<'a>(
    filenames: &'a [String],
    minor: u32,
    arch: Architecture,
) -> Option<(&'a str, WheelMatch)> {
    filenames.iter().find_map(|name| {
        WheelTags::parse(name)
            .and_then(|tags| tags.supports(minor, arch))
            .map(|m| (name.as_str(), m))
    })
}
