//! Initial interpreter candidate discovery
//!
//! An ordered list of strategies; the first one that produces a candidate at
//! or above the floor wins. Verification against dependencies happens later.

use super::registry::{ReleaseFiles, ReleaseSource, SourceMetadata};
use super::wheel::highest_minor;
use super::PythonVersion;
use crate::system::Architecture;
use regex::Regex;

/// Inputs shared by every strategy
pub struct DiscoveryContext<'a> {
    /// Target distribution name
    pub package: &'a str,
    /// Pinned target version
    pub version: &'a str,
    /// Target architecture
    pub arch: Architecture,
    /// Caller-supplied interpreter version
    pub explicit: Option<PythonVersion>,
    /// Target release as reported by the registry, fetched once per run
    pub target: Option<&'a ReleaseFiles>,
    /// Release source
    pub releases: &'a dyn ReleaseSource,
    /// Source tree access
    pub source: &'a dyn SourceMetadata,
    /// `owner/name` of the package's source repository
    pub repository: &'a str,
    /// Lowest supported interpreter
    pub floor: PythonVersion,
    /// Absolute fallback
    pub default: PythonVersion,
}

/// One discovery step
pub type Strategy = fn(&DiscoveryContext<'_>) -> Option<PythonVersion>;

/// Strategies in the order they are consulted
pub const STRATEGIES: &[(&str, Strategy)] = &[
    ("explicit", explicit),
    ("registry wheels", registry_wheels),
    ("release assets", release_assets),
    ("source metadata", source_metadata),
    ("default", fallback),
];

/// Run the chain and return the first acceptable candidate
pub fn discover(ctx: &DiscoveryContext<'_>) -> PythonVersion {
    for (name, strategy) in STRATEGIES {
        let Some(candidate) = strategy(ctx) else {
            tracing::info!("Discovery [{}]: no candidate", name);
            continue;
        };

        if *name != "explicit" && candidate < ctx.floor {
            tracing::warn!(
                "Discovery [{}]: {} is below the floor {}, ignoring",
                name,
                candidate,
                ctx.floor
            );
            continue;
        }

        tracing::info!("Discovery [{}]: candidate {}", name, candidate);
        return candidate;
    }

    ctx.default
}

fn explicit(ctx: &DiscoveryContext<'_>) -> Option<PythonVersion> {
    ctx.explicit
}

fn registry_wheels(ctx: &DiscoveryContext<'_>) -> Option<PythonVersion> {
    let target = ctx.target?;
    highest_minor(target.filenames.iter().map(String::as_str), ctx.arch).map(PythonVersion::cpython3)
}

fn release_assets(ctx: &DiscoveryContext<'_>) -> Option<PythonVersion> {
    for tag in release_tags(ctx.version) {
        let Some(assets) = ctx.releases.assets(ctx.repository, &tag) else {
            tracing::debug!("Release {} not found in {}", tag, ctx.repository);
            continue;
        };
        if assets.is_empty() {
            continue;
        }
        tracing::debug!("{} release {} has {} asset(s)", ctx.package, tag, assets.len());
        return highest_minor(assets.iter().map(|a| a.name.as_str()), ctx.arch)
            .map(PythonVersion::cpython3);
    }
    None
}

fn source_metadata(ctx: &DiscoveryContext<'_>) -> Option<PythonVersion> {
    if let Some(spec) = ctx.target.and_then(|t| t.requires_python.as_deref()) {
        if let Some(candidate) = candidate_from_requires_python(spec) {
            return Some(candidate);
        }
    }

    let tag = format!("v{}", ctx.version);
    let pyproject = ctx.source.fetch(ctx.repository, &tag, "pyproject.toml")?;
    let spec = pyproject_requires_python(&pyproject)?;
    tracing::debug!("pyproject.toml at {} declares requires-python {}", tag, spec);
    candidate_from_requires_python(&spec)
}

fn fallback(ctx: &DiscoveryContext<'_>) -> Option<PythonVersion> {
    Some(ctx.default)
}

/// Release tags for `version`: the version itself, then `.postN` re-releases
/// of its base version
pub fn release_tags(version: &str) -> Vec<String> {
    let base = version.split('+').next().unwrap_or(version);
    let base = match base.find(".post") {
        Some(idx) => &base[..idx],
        None => base,
    };

    let mut tags = vec![format!("v{}", version)];
    for n in 1..=3 {
        let tag = format!("v{}.post{}", base, n);
        if !tags.contains(&tag) {
            tags.push(tag);
        }
    }
    tags
}

/// Highest minor allowed by the upper bound of a `requires-python` spec:
/// `<3.M` gives `3.(M-1)`, `<=3.M` gives `3.M`. `None` without an upper bound.
pub fn candidate_from_requires_python(spec: &str) -> Option<PythonVersion> {
    let re = Regex::new(r"(<=?)\s*3\.(\d+)(?:\.(\d+))?").ok()?;

    re.captures_iter(spec)
        .filter_map(|caps| {
            let minor: u32 = caps.get(2)?.as_str().parse().ok()?;
            let patch: u32 = caps.get(3).and_then(|p| p.as_str().parse().ok()).unwrap_or(0);
            match caps.get(1)?.as_str() {
                "<=" => Some(minor),
                _ if patch > 0 => Some(minor),
                _ => minor.checked_sub(1),
            }
        })
        .min()
        .map(PythonVersion::cpython3)
}

/// `requires-python` value from `pyproject.toml` text
pub fn pyproject_requires_python(content: &str) -> Option<String> {
    let re = Regex::new(r#"(?m)^\s*requires-python\s*=\s*["']([^"']+)["']"#).ok()?;
    re.captures(content)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_string())
}
