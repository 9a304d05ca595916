//! Interpreter resolver
//!
//! Finds the highest CPython 3 minor (at or above a floor) for which a
//! pinned package and every exactly-pinned runtime dependency publish an
//! installable wheel for the target architecture.
//!
//! # Example
//!
//! ```
//! use servetune::resolver::{InMemoryRegistry, InterpreterResolver, ResolveRequest, ResolverOptions};
//! use servetune::system::Architecture;
//!
//! let registry = InMemoryRegistry::new()
//!     .with_release("pkg", "1.0.0", ["pkg-1.0.0-cp311-cp311-manylinux_2_28_x86_64.whl"])
//!     .with_requires_dist("pkg", "1.0.0", Vec::<String>::new());
//! let resolver = InterpreterResolver::new(&registry, &registry, &registry, ResolverOptions::default());
//!
//! let version = resolver
//!     .resolve(&ResolveRequest::new("pkg", "1.0.0", Architecture::X86_64))
//!     .unwrap();
//! assert_eq!(version.to_string(), "3.11");
//! ```

pub mod discovery;
pub mod marker;
pub mod registry;
pub mod wheel;

pub use marker::{Marker, MarkerEnv, Requirement, RequirementsFile};
pub use registry::{
    GithubClient, HttpSettings, InMemoryRegistry, PackageIndex, PypiClient, ReleaseAsset, ReleaseFiles,
    ReleaseSource, SourceMetadata,
};
pub use wheel::{WheelMatch, WheelTags};

use crate::error::{IoResultExt, Result, ServeTuneError};
use crate::system::Architecture;
use discovery::DiscoveryContext;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// A CPython `MAJOR.MINOR` version
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct PythonVersion {
    /// Always 3
    pub major: u32,
    /// Minor release
    pub minor: u32,
}

impl PythonVersion {
    /// `3.minor`
    pub const fn cpython3(minor: u32) -> Self {
        Self { major: 3, minor }
    }
}

impl fmt::Display for PythonVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl FromStr for PythonVersion {
    type Err = ServeTuneError;

    /// Accepts `3.12` and `3.12.4`; only CPython 3 is supported
    fn from_str(s: &str) -> Result<Self> {
        let invalid = || ServeTuneError::InvalidVersion(s.to_string());
        let mut parts = s.trim().split('.');
        let major: u32 = parts.next().and_then(|p| p.parse().ok()).ok_or_else(invalid)?;
        let minor: u32 = parts.next().and_then(|p| p.parse().ok()).ok_or_else(invalid)?;
        if major != 3 || parts.count() > 1 {
            return Err(invalid());
        }
        Ok(Self::cpython3(minor))
    }
}

/// Resolver configuration
#[derive(Debug, Clone)]
pub struct ResolverOptions {
    /// Lowest interpreter considered
    pub floor: PythonVersion,
    /// Candidate when discovery finds nothing
    pub default: PythonVersion,
    /// `owner/name` of the package's source repository
    pub repository: String,
    /// Requirement files read from the source tree when the registry has no
    /// dependency metadata
    pub requirement_files: Vec<String>,
}

impl Default for ResolverOptions {
    fn default() -> Self {
        Self {
            floor: PythonVersion::cpython3(9),
            default: PythonVersion::cpython3(12),
            repository: "vllm-project/vllm".to_string(),
            requirement_files: vec!["requirements/cpu.txt".to_string()],
        }
    }
}

/// What to resolve
#[derive(Debug, Clone)]
pub struct ResolveRequest {
    /// Target distribution
    pub package: String,
    /// Pinned target version
    pub version: String,
    /// Target architecture
    pub arch: Architecture,
    /// Caller-supplied interpreter, skipping discovery
    pub explicit: Option<PythonVersion>,
}

impl ResolveRequest {
    /// Resolve `package==version` for `arch`
    pub fn new(package: impl Into<String>, version: impl Into<String>, arch: Architecture) -> Self {
        Self {
            package: package.into(),
            version: version.into(),
            arch,
            explicit: None,
        }
    }

    /// Use `version` as the initial candidate
    pub fn with_python(mut self, version: PythonVersion) -> Self {
        self.explicit = Some(version);
        self
    }
}

/// Why a requirement failed at one interpreter version
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Blocker {
    /// `name==version`
    pub requirement: String,
    /// Human-readable reason
    pub reason: String,
}

/// Every attempted interpreter version and what blocked it
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolutionFailure {
    /// Target package
    pub package: String,
    /// Pinned target version
    pub version: String,
    /// Target architecture
    pub arch: Architecture,
    /// Attempts from highest to lowest
    pub attempts: Vec<(PythonVersion, Vec<Blocker>)>,
}

impl fmt::Display for ResolutionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "No Python version satisfies {}=={} on {}",
            self.package, self.version, self.arch
        )?;
        for (python, blockers) in &self.attempts {
            write!(f, "\n  {}:", python)?;
            for blocker in blockers {
                write!(f, "\n    {}: {}", blocker.requirement, blocker.reason)?;
            }
        }
        Ok(())
    }
}

/// Pinned dependency checked during verification
#[derive(Debug, Clone)]
struct PinnedDependency {
    requirement: Requirement,
    version: String,
}

/// Per-run state: wheel lists fetched once and reused for every candidate
struct Session<'r> {
    index: &'r dyn PackageIndex,
    files: HashMap<(String, String), Option<Vec<String>>>,
}

impl<'r> Session<'r> {
    fn filenames(&mut self, name: &str, version: &str) -> Option<&[String]> {
        let index = self.index;
        self.files
            .entry((name.to_string(), version.to_string()))
            .or_insert_with(|| {
                let files = index.release(name, version).map(|r| r.filenames);
                match &files {
                    Some(f) => tracing::debug!("{}=={}: {} file(s)", name, version, f.len()),
                    None => tracing::debug!("{}=={}: no registry data", name, version),
                }
                files
            })
            .as_deref()
    }
}

/// Resolves the interpreter version for a pinned package
pub struct InterpreterResolver<'a> {
    index: &'a dyn PackageIndex,
    releases: &'a dyn ReleaseSource,
    source: &'a dyn SourceMetadata,
    options: ResolverOptions,
}

impl<'a> InterpreterResolver<'a> {
    /// Create a resolver over the given registry, release source and source tree
    pub fn new(
        index: &'a dyn PackageIndex,
        releases: &'a dyn ReleaseSource,
        source: &'a dyn SourceMetadata,
        options: ResolverOptions,
    ) -> Self {
        Self {
            index,
            releases,
            source,
            options,
        }
    }

    /// Run discovery, then verify candidates from highest to the floor
    pub fn resolve(&self, request: &ResolveRequest) -> Result<PythonVersion> {
        tracing::info!(
            "Resolving Python for {}=={} on {}",
            request.package,
            request.version,
            request.arch
        );

        let target = self.index.release(&request.package, &request.version);
        if target.is_none() {
            tracing::info!("{}=={} not found in registry", request.package, request.version);
        }

        let candidate = discovery::discover(&DiscoveryContext {
            package: &request.package,
            version: &request.version,
            arch: request.arch,
            explicit: request.explicit,
            target: target.as_ref(),
            releases: self.releases,
            source: self.source,
            repository: &self.options.repository,
            floor: self.options.floor,
            default: self.options.default,
        });

        let dependencies = self.dependencies(request, target.as_ref());
        tracing::info!("Verifying {} pinned dependencies", dependencies.len());

        let target_wheels: Option<Vec<String>> = target
            .as_ref()
            .map(|t| {
                t.filenames
                    .iter()
                    .filter(|f| WheelTags::parse(f).is_some())
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .filter(|wheels| !wheels.is_empty());

        let mut session = Session {
            index: self.index,
            files: HashMap::new(),
        };
        let lowest = self.options.floor.minor.min(candidate.minor);
        let mut attempts = Vec::new();

        for minor in (lowest..=candidate.minor).rev() {
            let python = PythonVersion::cpython3(minor);
            let env = MarkerEnv {
                arch: request.arch,
                python_minor: Some(minor),
            };
            let mut blockers = Vec::new();

            if let Some(wheels) = &target_wheels {
                if wheel::find_compatible(wheels, minor, request.arch).is_none() {
                    blockers.push(Blocker {
                        requirement: format!("{}=={}", request.package, request.version),
                        reason: format!("no wheel for cp3{} on {}", minor, request.arch),
                    });
                }
            }

            for dep in dependencies.iter().filter(|d| d.requirement.applies(&env)) {
                let pin = format!("{}=={}", dep.requirement.name, dep.version);
                match session.filenames(&dep.requirement.name, &dep.version) {
                    None => blockers.push(Blocker {
                        requirement: pin,
                        reason: "no distribution data".to_string(),
                    }),
                    Some(files) => match wheel::find_compatible(files, minor, request.arch) {
                        Some((file, how)) => {
                            tracing::debug!("{} ok at {} via {} ({:?})", pin, python, file, how)
                        }
                        None => blockers.push(Blocker {
                            requirement: pin,
                            reason: format!("no wheel for cp3{} on {}", minor, request.arch),
                        }),
                    },
                }
            }

            if blockers.is_empty() {
                tracing::info!("Python {} satisfies all requirements", python);
                return Ok(python);
            }

            tracing::info!(
                "Python {} blocked by {}",
                python,
                blockers
                    .iter()
                    .map(|b| b.requirement.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
            attempts.push((python, blockers));
        }

        Err(ResolutionFailure {
            package: request.package.clone(),
            version: request.version.clone(),
            arch: request.arch,
            attempts,
        }
        .into())
    }

    /// Exactly-pinned runtime dependencies, extras excluded. Architecture
    /// markers are kept and evaluated per candidate.
    fn dependencies(&self, request: &ResolveRequest, target: Option<&ReleaseFiles>) -> Vec<PinnedDependency> {
        let requirements: Vec<Requirement> = match target.and_then(|t| t.requires_dist.as_ref()) {
            Some(requires) => requires
                .iter()
                .filter_map(|line| {
                    Requirement::parse(line)
                        .map_err(|e| tracing::warn!("Skipping dependency: {}", e))
                        .ok()
                })
                .collect(),
            None => self.requirement_files(&request.version),
        };

        let arch_env = MarkerEnv {
            arch: request.arch,
            python_minor: None,
        };

        requirements
            .into_iter()
            .filter(|req| {
                if req.extras_only {
                    return false;
                }
                let applies = req.applies(&arch_env);
                if !applies {
                    tracing::debug!("{} excluded on {}", req.name, request.arch);
                }
                applies
            })
            .filter_map(|req| {
                let version = req.pinned.clone()?;
                Some(PinnedDependency {
                    requirement: req,
                    version,
                })
            })
            .collect()
    }

    /// Requirements from the source tree at `v{version}`, following `-r`
    /// includes once each
    fn requirement_files(&self, version: &str) -> Vec<Requirement> {
        let tag = format!("v{}", version);
        let mut pending: Vec<String> = self.options.requirement_files.clone();
        let mut seen = HashSet::new();
        let mut requirements = Vec::new();

        while let Some(path) = pending.pop() {
            if !seen.insert(path.clone()) {
                continue;
            }
            let Some(content) = self.source.fetch(&self.options.repository, &tag, &path) else {
                tracing::warn!("Requirement file {} unavailable at {}", path, tag);
                continue;
            };

            let file = RequirementsFile::parse(&content);
            let dir = Path::new(&path).parent().unwrap_or_else(|| Path::new(""));
            pending.extend(
                file.includes
                    .iter()
                    .map(|include| dir.join(include).to_string_lossy().into_owned()),
            );
            requirements.extend(file.requirements);
        }

        requirements
    }
}

/// Replace `path` with `contents` via a sibling temp file and rename
pub fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(parent).with_path(parent)?;

    let file_name = path
        .file_name()
        .ok_or_else(|| ServeTuneError::config(format!("'{}' is not a file path", path.display())))?;
    let tmp = parent.join(format!(
        ".{}.{}.tmp",
        file_name.to_string_lossy(),
        std::process::id()
    ));

    std::fs::write(&tmp, contents).with_path(&tmp)?;
    if let Err(e) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(ServeTuneError::io(path, e));
    }
    Ok(())
}

/// Installed version of `package` according to `python -m pip show`
pub fn installed_version(python: &str, package: &str) -> Result<String> {
    let output = std::process::Command::new(python)
        .args(["-m", "pip", "show", package])
        .output()
        .map_err(|e| ServeTuneError::launch(python, e.to_string()))?;

    if !output.status.success() {
        return Err(ServeTuneError::launch(
            python,
            format!("pip show {} exited with {}", package, output.status),
        ));
    }

    parse_pip_show(&String::from_utf8_lossy(&output.stdout))
        .ok_or_else(|| ServeTuneError::config(format!("pip show {} reported no version", package)))
}

fn parse_pip_show(output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        line.strip_prefix("Version:")
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const X86: Architecture = Architecture::X86_64;

    fn resolve(registry: &InMemoryRegistry, request: &ResolveRequest) -> Result<PythonVersion> {
        InterpreterResolver::new(registry, registry, registry, ResolverOptions::default()).resolve(request)
    }

    fn wheels(name: &str, version: &str, minors: &[u32], plat: &str) -> Vec<String> {
        minors
            .iter()
            .map(|m| format!("{}-{}-cp3{m}-cp3{m}-{}.whl", name, version, plat, m = m))
            .collect()
    }

    #[test]
    fn test_python_version_parse() {
        assert_eq!("3.12".parse::<PythonVersion>().unwrap(), PythonVersion::cpython3(12));
        assert_eq!("3.11.9".parse::<PythonVersion>().unwrap(), PythonVersion::cpython3(11));
        assert!("2.7".parse::<PythonVersion>().is_err());
        assert!("3".parse::<PythonVersion>().is_err());
        assert!("3.x".parse::<PythonVersion>().is_err());
        assert_eq!(PythonVersion::cpython3(13).to_string(), "3.13");
        assert!(PythonVersion::cpython3(9) < PythonVersion::cpython3(10));
    }

    #[test]
    fn test_intersection_of_target_and_dependency() {
        let registry = InMemoryRegistry::new()
            .with_release("pkg", "1.0.0", wheels("pkg", "1.0.0", &[10, 11], "manylinux_2_28_x86_64"))
            .with_requires_dist("pkg", "1.0.0", ["dep==2.0"])
            .with_release("dep", "2.0", wheels("dep", "2.0", &[9, 10], "manylinux_2_28_x86_64"));

        let version = resolve(&registry, &ResolveRequest::new("pkg", "1.0.0", X86)).unwrap();
        assert_eq!(version, PythonVersion::cpython3(10));
    }

    #[test]
    fn test_end_to_end_single_dependency() {
        let registry = InMemoryRegistry::new()
            .with_release("pkg", "1.0.0", wheels("pkg", "1.0.0", &[11, 12, 13], "manylinux_2_28_x86_64"))
            .with_requires_dist("pkg", "1.0.0", ["depA==2.0", "numpy>=1.26", "pytest==8.0; extra == 'test'"])
            .with_release("depA", "2.0", wheels("depA", "2.0", &[11], "manylinux_2_28_x86_64"));

        let version = resolve(&registry, &ResolveRequest::new("pkg", "1.0.0", X86)).unwrap();
        assert_eq!(version.to_string(), "3.11");
    }

    #[test]
    fn test_universal_dependency_never_blocks() {
        let registry = InMemoryRegistry::new()
            .with_release("pkg", "1.0.0", wheels("pkg", "1.0.0", &[13], "manylinux_2_28_aarch64"))
            .with_requires_dist("pkg", "1.0.0", ["fastapi==0.115.0"])
            .with_release("fastapi", "0.115.0", ["fastapi-0.115.0-py3-none-any.whl"]);

        let request = ResolveRequest::new("pkg", "1.0.0", Architecture::Aarch64);
        assert_eq!(resolve(&registry, &request).unwrap(), PythonVersion::cpython3(13));
    }

    #[test]
    fn test_stable_abi_dependency_floor() {
        let registry = InMemoryRegistry::new()
            .with_release("pkg", "1.0.0", ["pkg-1.0.0.tar.gz"])
            .with_requires_dist("pkg", "1.0.0", ["crypto==43.0"])
            .with_release("crypto", "43.0", ["crypto-43.0-cp39-abi3-manylinux_2_28_x86_64.whl"]);

        for minor in [9, 10, 11, 12] {
            let request = ResolveRequest::new("pkg", "1.0.0", X86).with_python(PythonVersion::cpython3(minor));
            assert_eq!(resolve(&registry, &request).unwrap(), PythonVersion::cpython3(minor));
        }

        let request = ResolveRequest::new("pkg", "1.0.0", X86).with_python(PythonVersion::cpython3(8));
        assert!(resolve(&registry, &request).is_err());
    }

    #[test]
    fn test_no_registry_uses_source_metadata() {
        let registry = InMemoryRegistry::new().with_file(
            "vllm-project/vllm",
            "v1.0.0",
            "pyproject.toml",
            "[project]\nrequires-python = \"<3.13\"\n",
        );

        let version = resolve(&registry, &ResolveRequest::new("pkg", "1.0.0", X86)).unwrap();
        assert_eq!(version.to_string(), "3.12");
    }

    #[test]
    fn test_requirement_files_with_includes() {
        let registry = InMemoryRegistry::new()
            .with_file(
                "vllm-project/vllm",
                "v1.0.0",
                "requirements/cpu.txt",
                "-r common.txt\ntorch==2.8.0+cpu; platform_machine == 'x86_64'\ntorch==2.8.0; platform_machine == 'aarch64'\n",
            )
            .with_file(
                "vllm-project/vllm",
                "v1.0.0",
                "requirements/common.txt",
                "-r cpu.txt\nregex\nlib==1.0 ; python_version < '3.12'\n",
            )
            .with_release("torch", "2.8.0+cpu", wheels("torch", "2.8.0+cpu", &[10, 11, 12], "manylinux_2_28_x86_64"))
            .with_release("lib", "1.0", wheels("lib", "1.0", &[9, 10], "manylinux_2_28_x86_64"));

        // torch blocks 3.13; at 3.12 lib drops out through its marker
        let request = ResolveRequest::new("pkg", "1.0.0", X86).with_python(PythonVersion::cpython3(13));
        assert_eq!(resolve(&registry, &request).unwrap(), PythonVersion::cpython3(12));
    }

    #[test]
    fn test_failure_lists_blockers() {
        let registry = InMemoryRegistry::new()
            .with_release("pkg", "1.0.0", wheels("pkg", "1.0.0", &[11], "manylinux_2_28_x86_64"))
            .with_requires_dist("pkg", "1.0.0", ["depA==2.0", "ghost==0.1"])
            .with_release("depA", "2.0", wheels("depA", "2.0", &[12], "manylinux_2_28_x86_64"));

        let err = resolve(&registry, &ResolveRequest::new("pkg", "1.0.0", X86)).unwrap_err();
        let ServeTuneError::Resolution(failure) = err else {
            panic!("expected resolution failure");
        };

        assert_eq!(failure.attempts.len(), 3);
        assert_eq!(failure.attempts[0].0, PythonVersion::cpython3(11));
        assert_eq!(failure.attempts[2].0, PythonVersion::cpython3(9));

        let first: Vec<_> = failure.attempts[0].1.iter().map(|b| b.requirement.as_str()).collect();
        assert_eq!(first, vec!["depa==2.0", "ghost==0.1"]);
        let last: Vec<_> = failure.attempts[2].1.iter().map(|b| b.requirement.as_str()).collect();
        assert_eq!(last, vec!["pkg==1.0.0", "depa==2.0", "ghost==0.1"]);

        let text = failure.to_string();
        assert!(text.contains("3.10:"));
        assert!(text.contains("no distribution data"));
    }

    #[test]
    fn test_architecture_marker_excludes_dependency() {
        let registry = InMemoryRegistry::new()
            .with_release("pkg", "1.0.0", wheels("pkg", "1.0.0", &[12], "manylinux_2_28_aarch64"))
            .with_requires_dist("pkg", "1.0.0", ["intel-openmp==2024.2.1; platform_machine == 'x86_64'"]);

        let request = ResolveRequest::new("pkg", "1.0.0", Architecture::Aarch64);
        assert_eq!(resolve(&registry, &request).unwrap(), PythonVersion::cpython3(12));
    }

    #[test]
    fn test_write_atomic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("python_version.txt");

        write_atomic(&path, "3.12").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "3.12");

        write_atomic(&path, "3.11").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "3.11");

        let leftovers: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_parse_pip_show() {
        let output = "Name: vllm-cpu\nVersion: 0.10.1.post1\nSummary: x\n";
        assert_eq!(parse_pip_show(output).as_deref(), Some("0.10.1.post1"));
        assert_eq!(parse_pip_show("Name: x\n"), None);
    }
}
