//! Host resource detection
//!
//! Builds the [`HardwareProfile`] the runtime tuner works from. Every probe
//! has a fallback, so collection never fails.

use super::cpu_features::FeatureSet;
use super::numa::NumaTopology;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use sysinfo::System;

/// Memory assumed when the host reports none
pub const DEFAULT_MEMORY_GIB: u64 = 8;

const GIB: u64 = 1024 * 1024 * 1024;

/// CPU architecture families the tuner distinguishes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Architecture {
    /// 64-bit x86 (also known as amd64)
    X86_64,
    /// 64-bit ARM (also known as arm64)
    Aarch64,
    /// Anything else
    Other,
}

impl Architecture {
    /// Architecture of the running binary
    pub fn current() -> Self {
        std::env::consts::ARCH.parse().unwrap_or(Architecture::Other)
    }

    /// Canonical name as used in wheel platform tags
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::X86_64 => "x86_64",
            Self::Aarch64 => "aarch64",
            Self::Other => "other",
        }
    }

    /// Names this architecture goes by in platform tags and markers
    pub fn aliases(&self) -> &'static [&'static str] {
        match self {
            Self::X86_64 => &["x86_64", "amd64", "x64"],
            Self::Aarch64 => &["aarch64", "arm64", "armv8"],
            Self::Other => &[],
        }
    }

    /// Does `name` denote this architecture (aliases included)?
    pub fn matches(&self, name: &str) -> bool {
        let name = name.trim().to_lowercase();
        self.aliases().iter().any(|alias| *alias == name)
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Architecture {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        [Self::X86_64, Self::Aarch64]
            .into_iter()
            .find(|arch| arch.matches(s))
            .ok_or_else(|| format!("unrecognised architecture '{}'", s.trim()))
    }
}

/// Snapshot of the hardware the server is about to run on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HardwareProfile {
    /// Distinct physical cores across all sockets
    pub physical_cores: usize,
    /// Logical CPUs (hardware threads)
    pub logical_cores: usize,
    /// Currently available memory in GiB
    pub available_memory_gib: u64,
    /// Total memory in GiB
    pub total_memory_gib: u64,
    /// NUMA nodes
    pub numa_nodes: usize,
    /// Whether NUMA policy syscalls work in this sandbox
    pub numa_accessible: bool,
    /// Detected instruction-set extensions
    pub features: FeatureSet,
    /// CPU architecture
    pub architecture: Architecture,
    /// CPU model string
    pub cpu_model: String,
}

impl HardwareProfile {
    /// Probe the running host
    pub fn collect() -> Self {
        let mut sys = System::new();
        sys.refresh_memory();
        sys.refresh_cpu_all();

        let logical_cores = num_cpus::get().max(1);
        let physical_cores = std::fs::read_to_string("/proc/cpuinfo")
            .ok()
            .and_then(|content| count_physical_cores(&content))
            .unwrap_or_else(|| {
                tracing::debug!("CPU topology unavailable, using num_cpus physical count");
                num_cpus::get_physical()
            });
        let physical_cores = if physical_cores == 0 { logical_cores } else { physical_cores };

        let (available_memory_gib, total_memory_gib) =
            memory_gib(sys.available_memory(), sys.total_memory());

        let numa = NumaTopology::detect();

        let cpu_model = sys
            .cpus()
            .first()
            .map(|c| c.brand().trim().to_string())
            .filter(|b| !b.is_empty())
            .unwrap_or_else(|| "Unknown".to_string());

        let profile = HardwareProfile {
            physical_cores,
            logical_cores,
            available_memory_gib,
            total_memory_gib,
            numa_nodes: numa.node_count(),
            numa_accessible: numa.accessible,
            features: FeatureSet::detect(),
            architecture: Architecture::current(),
            cpu_model,
        };

        tracing::debug!(?profile, "Hardware profile collected");
        profile
    }

    /// Print hardware summary to stderr
    pub fn print_summary(&self) {
        eprintln!("=== Hardware ===");
        eprintln!("  CPU:            {}", self.cpu_model);
        eprintln!("  Architecture:   {}", self.architecture);
        eprintln!("  Cores:          {} physical / {} logical", self.physical_cores, self.logical_cores);
        eprintln!(
            "  Memory:         {} available / {} total",
            humansize::format_size(self.available_memory_gib * GIB, humansize::BINARY),
            humansize::format_size(self.total_memory_gib * GIB, humansize::BINARY)
        );
        eprintln!(
            "  NUMA:           {} node(s), policy {}",
            self.numa_nodes,
            if self.numa_accessible { "accessible" } else { "blocked" }
        );
        eprintln!("  ISA features:   {}", self.features);
    }
}

/// Count distinct (physical id, core id) pairs in `/proc/cpuinfo`.
///
/// Returns `None` when the file carries no topology fields (arm64 kernels
/// and most virtual machines omit them).
pub fn count_physical_cores(content: &str) -> Option<usize> {
    let mut cores = HashSet::new();
    let mut socket: Option<&str> = None;
    let mut core: Option<&str> = None;

    for line in content.lines().chain(std::iter::once("")) {
        if line.trim().is_empty() {
            if let Some(core_id) = core.take() {
                cores.insert((socket.take().unwrap_or("0"), core_id));
            }
            socket = None;
            continue;
        }
        if let Some((key, value)) = line.split_once(':') {
            match key.trim() {
                "physical id" => socket = Some(value.trim()),
                "core id" => core = Some(value.trim()),
                _ => {}
            }
        }
    }

    (!cores.is_empty()).then_some(cores.len())
}

/// Convert byte counts into whole GiB with the documented fallbacks:
/// available falls back to total, total falls back to the default.
pub fn memory_gib(available_bytes: u64, total_bytes: u64) -> (u64, u64) {
    let total = match total_bytes / GIB {
        0 => {
            tracing::debug!("Total memory unreadable, assuming {} GiB", DEFAULT_MEMORY_GIB);
            DEFAULT_MEMORY_GIB
        }
        gib => gib,
    };
    let available = match available_bytes / GIB {
        0 => total,
        gib => gib,
    };
    (available.max(1), total.max(1))
}
