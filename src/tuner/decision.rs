//! Runtime tuning decision
//!
//! Turns a [`HardwareProfile`] plus user overrides into the environment the
//! inference server starts with. Each key resolves independently:
//! user override, else computed default, else fallback. Overrides are taken
//! verbatim and never clamped.

use super::overrides::Overrides;
use crate::system::{Architecture, Compatibility, FeatureSet, HardwareProfile, HardwareVariant};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Lower bound of the computed KV-cache budget (GiB)
pub const KV_CACHE_MIN_GIB: u64 = 1;
/// Upper bound of the computed KV-cache budget (GiB)
pub const KV_CACHE_MAX_GIB: u64 = 64;

/// Environment variable naming the build variant of the installed server
pub const BUILD_VARIANT_ENV: &str = "VLLM_CPU_VARIANT";

/// Optimized allocator locations, probed in order
const ALLOCATOR_PATHS_X86_64: &[&str] = &[
    "/usr/lib/x86_64-linux-gnu/libtcmalloc_minimal.so.4",
    "/usr/lib/x86_64-linux-gnu/libtcmalloc.so.4",
];
const ALLOCATOR_PATHS_AARCH64: &[&str] = &[
    "/usr/lib/aarch64-linux-gnu/libtcmalloc_minimal.so.4",
    "/usr/lib/aarch64-linux-gnu/libtcmalloc.so.4",
];

/// Keys of a tuning decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TuningKey {
    /// KV-cache memory budget in GiB
    KvCacheSpace,
    /// Cores withheld from the compute thread pool
    ReservedCores,
    /// OpenMP thread binding mode
    ThreadBinding,
    /// Small-batch (AMX) kernel toggle
    SmallBatchKernel,
    /// Allocator library preloaded into the server
    AllocatorPreload,
    /// Best-matching hardware variant label
    RecommendedVariant,
}

impl TuningKey {
    /// All keys in resolution order
    pub const ALL: [TuningKey; 6] = [
        TuningKey::KvCacheSpace,
        TuningKey::ReservedCores,
        TuningKey::ThreadBinding,
        TuningKey::SmallBatchKernel,
        TuningKey::AllocatorPreload,
        TuningKey::RecommendedVariant,
    ];

    /// Environment variable the key is exported as (and overridden by)
    pub fn env_name(&self) -> &'static str {
        match self {
            Self::KvCacheSpace => "VLLM_CPU_KVCACHE_SPACE",
            Self::ReservedCores => "VLLM_CPU_NUM_OF_RESERVED_CPU",
            Self::ThreadBinding => "VLLM_CPU_OMP_THREADS_BIND",
            Self::SmallBatchKernel => "VLLM_CPU_SGL_KERNEL",
            Self::AllocatorPreload => "LD_PRELOAD",
            Self::RecommendedVariant => "VLLM_CPU_RECOMMENDED_VARIANT",
        }
    }

    /// Human description for logs
    pub fn description(&self) -> &'static str {
        match self {
            Self::KvCacheSpace => "KV cache (GiB)",
            Self::ReservedCores => "Reserved cores",
            Self::ThreadBinding => "Thread binding",
            Self::SmallBatchKernel => "Small-batch kernel",
            Self::AllocatorPreload => "Allocator preload",
            Self::RecommendedVariant => "Recommended variant",
        }
    }
}

/// Where a resolved value came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    /// Set by the user
    User,
    /// Computed from the hardware profile
    Computed,
    /// Nothing applicable was found; the key stays unset
    Unset,
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::User => "user-configured",
            Self::Computed => "auto",
            Self::Unset => "not set",
        })
    }
}

/// One resolved configuration entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Setting {
    /// Which key
    pub key: TuningKey,
    /// Resolved value, `None` when left unset
    pub value: Option<String>,
    /// Origin of the value
    pub provenance: Provenance,
}

/// KV-cache budget: a quarter of available memory, restricted to one NUMA
/// node's share on multi-node hosts, clamped to `[1, 64]` GiB.
pub fn kv_cache_budget_gib(available_memory_gib: u64, numa_nodes: usize) -> u64 {
    let per_node = if numa_nodes > 1 {
        available_memory_gib / numa_nodes as u64
    } else {
        available_memory_gib
    };
    (per_node / 4).clamp(KV_CACHE_MIN_GIB, KV_CACHE_MAX_GIB)
}

/// Cores reserved for request handling, stepped by physical core count
pub fn reserved_cores(physical_cores: usize) -> usize {
    match physical_cores {
        n if n > 32 => 4,
        n if n > 16 => 2,
        _ => 1,
    }
}

/// Thread binding mode. NUMA-aware binding needs the policy syscalls, which
/// sandboxed aarch64 hosts refuse.
pub fn thread_binding(arch: Architecture, numa_accessible: bool) -> &'static str {
    if arch == Architecture::Aarch64 && !numa_accessible {
        "nobind"
    } else {
        "auto"
    }
}

/// Small-batch kernels require AMX on x86_64, detected directly or implied
/// by the installed build.
pub fn small_batch_kernel(
    arch: Architecture,
    features: &FeatureSet,
    build_variant: Option<HardwareVariant>,
) -> bool {
    arch == Architecture::X86_64
        && (features.has_amx() || build_variant.map(|v| v.has_amx()).unwrap_or(false))
}

/// First allocator library present for `arch`, according to `exists`
pub fn allocator_preload(arch: Architecture, exists: impl Fn(&Path) -> bool) -> Option<PathBuf> {
    let candidates = match arch {
        Architecture::X86_64 => ALLOCATOR_PATHS_X86_64,
        Architecture::Aarch64 => ALLOCATOR_PATHS_AARCH64,
        Architecture::Other => &[],
    };
    candidates.iter().map(PathBuf::from).find(|p| exists(p))
}

/// Computes a [`TuningDecision`] from hardware and overrides
pub struct Tuner<'a> {
    profile: &'a HardwareProfile,
    overrides: &'a Overrides,
    allocator_probe: Box<dyn Fn(&Path) -> bool + 'a>,
}

impl<'a> Tuner<'a> {
    /// Create a tuner probing the real filesystem for the allocator
    pub fn new(profile: &'a HardwareProfile, overrides: &'a Overrides) -> Self {
        Self {
            profile,
            overrides,
            allocator_probe: Box::new(|path: &Path| path.exists()),
        }
    }

    /// Replace the allocator presence check
    pub fn with_allocator_probe(mut self, probe: impl Fn(&Path) -> bool + 'a) -> Self {
        self.allocator_probe = Box::new(probe);
        self
    }

    /// Build variant of the installed server, from the environment label
    pub fn build_variant(&self) -> Option<HardwareVariant> {
        let label = self.overrides.get(BUILD_VARIANT_ENV)?;
        match label.parse() {
            Ok(variant) => Some(variant),
            Err(e) => {
                tracing::warn!("Ignoring {}: {}", BUILD_VARIANT_ENV, e);
                None
            }
        }
    }

    /// Resolve every key
    pub fn resolve(&self) -> TuningDecision {
        let build_variant = self.build_variant();
        let recommended =
            HardwareVariant::recommend(self.profile.architecture, &self.profile.features);

        let settings = TuningKey::ALL
            .iter()
            .map(|key| self.resolve_key(*key, build_variant, recommended))
            .collect();

        TuningDecision {
            settings,
            recommended,
            build_variant,
        }
    }

    fn resolve_key(
        &self,
        key: TuningKey,
        build_variant: Option<HardwareVariant>,
        recommended: HardwareVariant,
    ) -> Setting {
        if let Some(value) = self.overrides.get(key.env_name()) {
            return Setting {
                key,
                value: Some(value.to_string()),
                provenance: Provenance::User,
            };
        }

        let p = self.profile;
        let computed = match key {
            TuningKey::KvCacheSpace => {
                Some(kv_cache_budget_gib(p.available_memory_gib, p.numa_nodes).to_string())
            }
            TuningKey::ReservedCores => Some(reserved_cores(p.physical_cores).to_string()),
            TuningKey::ThreadBinding => {
                Some(thread_binding(p.architecture, p.numa_accessible).to_string())
            }
            TuningKey::SmallBatchKernel => {
                let enabled = small_batch_kernel(p.architecture, &p.features, build_variant);
                Some(if enabled { "1" } else { "0" }.to_string())
            }
            TuningKey::AllocatorPreload => {
                allocator_preload(p.architecture, |path| (self.allocator_probe)(path))
                    .map(|path| path.display().to_string())
            }
            TuningKey::RecommendedVariant => Some(recommended.label().to_string()),
        };

        Setting {
            key,
            provenance: if computed.is_some() {
                Provenance::Computed
            } else {
                Provenance::Unset
            },
            value: computed,
        }
    }
}

/// Fully resolved runtime configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TuningDecision {
    /// One entry per [`TuningKey`], in resolution order
    pub settings: Vec<Setting>,
    /// Variant recommended for the detected hardware
    pub recommended: HardwareVariant,
    /// Variant the installed server was built for, if known
    pub build_variant: Option<HardwareVariant>,
}

impl TuningDecision {
    /// Entry for `key`
    pub fn get(&self, key: TuningKey) -> Option<&Setting> {
        self.settings.iter().find(|s| s.key == key)
    }

    /// Resolved value for `key`
    pub fn value(&self, key: TuningKey) -> Option<&str> {
        self.get(key).and_then(|s| s.value.as_deref())
    }

    /// Environment variables to export (unset keys omitted)
    pub fn env_pairs(&self) -> Vec<(&'static str, String)> {
        self.settings
            .iter()
            .filter_map(|s| s.value.clone().map(|v| (s.key.env_name(), v)))
            .collect()
    }

    /// Shell `export` lines
    pub fn to_exports(&self) -> String {
        self.env_pairs()
            .into_iter()
            .map(|(name, value)| format!("export {}={}\n", name, shell_quote(&value)))
            .collect()
    }

    /// Log each resolved key with its provenance
    pub fn log(&self) {
        for setting in &self.settings {
            match &setting.value {
                Some(value) => tracing::info!(
                    "{:<20} {}={} ({})",
                    setting.key.description(),
                    setting.key.env_name(),
                    value,
                    setting.provenance
                ),
                None => tracing::info!(
                    "{:<20} {} not set",
                    setting.key.description(),
                    setting.key.env_name()
                ),
            }
        }
    }

    /// Advisory comparison between installed build and hardware.
    ///
    /// Uses the resolved recommendation, so an overridden label is honoured
    /// when it parses; otherwise the computed tier is used.
    pub fn advisory(&self) -> Option<Advisory> {
        let running = self.build_variant?;
        let recommended = self
            .value(TuningKey::RecommendedVariant)
            .and_then(|label| label.parse().ok())
            .unwrap_or(self.recommended);

        Some(Advisory {
            running,
            recommended,
            compatibility: HardwareVariant::compatibility(running, recommended),
        })
    }
}

/// Outcome of comparing the installed build against detected hardware
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Advisory {
    /// Variant of the installed build
    pub running: HardwareVariant,
    /// Variant the hardware supports best
    pub recommended: HardwareVariant,
    /// Comparison result
    pub compatibility: Compatibility,
}

impl Advisory {
    /// Emit the advisory to the log. Never blocks startup.
    pub fn log(&self) {
        match self.compatibility {
            Compatibility::Optimal => {
                tracing::info!("Build variant {} is optimal for this CPU", self.running)
            }
            Compatibility::Suboptimal => tracing::warn!(
                "Build variant {} is suboptimal: this CPU supports {} ({})",
                self.running,
                self.recommended,
                self.recommended.package_name()
            ),
            Compatibility::Incompatible => tracing::warn!(
                "Build variant {} may crash: this CPU lacks features it assumes; use {} ({})",
                self.running,
                self.recommended,
                self.recommended.package_name()
            ),
        }
    }
}

/// Quote a value for POSIX shell
pub fn shell_quote(value: &str) -> String {
    let safe = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=+,@%".contains(c));
    if safe {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', "'\\''"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::IsaFeature;
    use proptest::prelude::*;

    fn profile(arch: Architecture) -> HardwareProfile {
        HardwareProfile {
            physical_cores: 8,
            logical_cores: 16,
            available_memory_gib: 32,
            total_memory_gib: 64,
            numa_nodes: 1,
            numa_accessible: true,
            features: FeatureSet::new(),
            architecture: arch,
            cpu_model: "Test CPU".to_string(),
        }
    }

    fn no_allocator(_: &Path) -> bool {
        false
    }

    #[test]
    fn test_kv_cache_examples() {
        assert_eq!(kv_cache_budget_gib(256, 2), 32);
        assert_eq!(kv_cache_budget_gib(32, 1), 8);
        assert_eq!(kv_cache_budget_gib(3, 1), 1);
        assert_eq!(kv_cache_budget_gib(1024, 1), 64);
        assert_eq!(kv_cache_budget_gib(1024, 8), 32);
    }

    #[test]
    fn test_reserved_core_thresholds() {
        assert_eq!(reserved_cores(8), 1);
        assert_eq!(reserved_cores(16), 1);
        assert_eq!(reserved_cores(17), 2);
        assert_eq!(reserved_cores(32), 2);
        assert_eq!(reserved_cores(33), 4);
    }

    #[test]
    fn test_thread_binding() {
        assert_eq!(thread_binding(Architecture::Aarch64, false), "nobind");
        assert_eq!(thread_binding(Architecture::Aarch64, true), "auto");
        assert_eq!(thread_binding(Architecture::X86_64, false), "auto");
    }

    #[test]
    fn test_small_batch_kernel() {
        let amx: FeatureSet = [IsaFeature::AmxBf16].into_iter().collect();
        assert!(small_batch_kernel(Architecture::X86_64, &amx, None));
        assert!(!small_batch_kernel(Architecture::Aarch64, &amx, None));
        assert!(!small_batch_kernel(Architecture::X86_64, &FeatureSet::new(), None));
        assert!(small_batch_kernel(
            Architecture::X86_64,
            &FeatureSet::new(),
            Some(HardwareVariant::AmxBf16)
        ));
        assert!(!small_batch_kernel(
            Architecture::X86_64,
            &FeatureSet::new(),
            Some(HardwareVariant::Avx512Bf16)
        ));
    }

    #[test]
    fn test_allocator_probe() {
        let found = allocator_preload(Architecture::X86_64, |p| p.ends_with("libtcmalloc.so.4"));
        assert_eq!(
            found,
            Some(PathBuf::from("/usr/lib/x86_64-linux-gnu/libtcmalloc.so.4"))
        );
        assert_eq!(allocator_preload(Architecture::Other, |_| true), None);
        assert_eq!(allocator_preload(Architecture::Aarch64, no_allocator), None);
    }

    #[test]
    fn test_resolve_defaults() {
        let hw = profile(Architecture::X86_64);
        let overrides = Overrides::default();
        let decision = Tuner::new(&hw, &overrides)
            .with_allocator_probe(no_allocator)
            .resolve();

        assert_eq!(decision.value(TuningKey::KvCacheSpace), Some("8"));
        assert_eq!(decision.value(TuningKey::ReservedCores), Some("1"));
        assert_eq!(decision.value(TuningKey::ThreadBinding), Some("auto"));
        assert_eq!(decision.value(TuningKey::SmallBatchKernel), Some("0"));
        assert_eq!(decision.value(TuningKey::AllocatorPreload), None);
        assert_eq!(decision.value(TuningKey::RecommendedVariant), Some("baseline"));
        assert_eq!(
            decision.get(TuningKey::AllocatorPreload).unwrap().provenance,
            Provenance::Unset
        );
        assert!(decision.advisory().is_none());
    }

    #[test]
    fn test_overrides_win_verbatim() {
        let hw = profile(Architecture::Aarch64);
        let pairs: Vec<(&str, &str)> = vec![
            ("VLLM_CPU_KVCACHE_SPACE", "500"),
            ("VLLM_CPU_NUM_OF_RESERVED_CPU", "0"),
            ("VLLM_CPU_OMP_THREADS_BIND", "0-31|32-63"),
            ("VLLM_CPU_SGL_KERNEL", "yes please"),
            ("LD_PRELOAD", "/opt/jemalloc.so"),
            ("VLLM_CPU_RECOMMENDED_VARIANT", "custom"),
        ];
        let overrides = Overrides::from_pairs(pairs.clone());
        let decision = Tuner::new(&hw, &overrides)
            .with_allocator_probe(|_| true)
            .resolve();

        for (name, value) in pairs {
            let setting = decision
                .settings
                .iter()
                .find(|s| s.key.env_name() == name)
                .unwrap();
            assert_eq!(setting.value.as_deref(), Some(value));
            assert_eq!(setting.provenance, Provenance::User);
        }
    }

    #[test]
    fn test_advisory_levels() {
        let mut hw = profile(Architecture::X86_64);
        hw.features = [IsaFeature::Avx512, IsaFeature::Avx512Vnni].into_iter().collect();

        let check = |label: &str| {
            let overrides = Overrides::from_pairs([(BUILD_VARIANT_ENV, label)]);
            let decision = Tuner::new(&hw, &overrides)
                .with_allocator_probe(no_allocator)
                .resolve();
            decision.advisory().unwrap().compatibility
        };

        assert_eq!(check("avx512vnni"), Compatibility::Optimal);
        assert_eq!(check("noavx512"), Compatibility::Suboptimal);
        assert_eq!(check("amxbf16"), Compatibility::Incompatible);
    }

    #[test]
    fn test_build_variant_enables_small_batch_kernel() {
        let hw = profile(Architecture::X86_64);
        let overrides = Overrides::from_pairs([(BUILD_VARIANT_ENV, "vllm-cpu-amxbf16")]);
        let decision = Tuner::new(&hw, &overrides)
            .with_allocator_probe(no_allocator)
            .resolve();
        assert_eq!(decision.value(TuningKey::SmallBatchKernel), Some("1"));
        assert_eq!(decision.build_variant, Some(HardwareVariant::AmxBf16));
    }

    #[test]
    fn test_unknown_build_variant_ignored() {
        let hw = profile(Architecture::X86_64);
        let overrides = Overrides::from_pairs([(BUILD_VARIANT_ENV, "turbo")]);
        let decision = Tuner::new(&hw, &overrides)
            .with_allocator_probe(no_allocator)
            .resolve();
        assert!(decision.advisory().is_none());
    }

    #[test]
    fn test_exports() {
        let hw = profile(Architecture::X86_64);
        let overrides = Overrides::from_pairs([("VLLM_CPU_OMP_THREADS_BIND", "0-3|4-7")]);
        let decision = Tuner::new(&hw, &overrides)
            .with_allocator_probe(|_| true)
            .resolve();
        let exports = decision.to_exports();
        assert!(exports.contains("export VLLM_CPU_KVCACHE_SPACE=8\n"));
        assert!(exports.contains("export VLLM_CPU_OMP_THREADS_BIND='0-3|4-7'\n"));
        assert!(exports.contains("export LD_PRELOAD=/usr/lib/x86_64-linux-gnu/libtcmalloc_minimal.so.4\n"));
        assert!(exports.contains("export VLLM_CPU_RECOMMENDED_VARIANT=baseline\n"));
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("auto"), "auto");
        assert_eq!(shell_quote(""), "''");
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
        assert_eq!(shell_quote("a b"), "'a b'");
    }

    proptest! {
        #[test]
        fn prop_kv_cache_single_node(mem in 1u64..=10_000) {
            prop_assert_eq!(kv_cache_budget_gib(mem, 1), (mem / 4).clamp(1, 64));
        }

        #[test]
        fn prop_kv_cache_multi_node(mem in 1u64..=10_000, nodes in 2usize..=16) {
            let expected = (mem / nodes as u64 / 4).clamp(1, 64);
            prop_assert_eq!(kv_cache_budget_gib(mem, nodes), expected);
        }

        #[test]
        fn prop_reserved_cores_monotonic(cores in 1usize..=1024) {
            let here = reserved_cores(cores);
            prop_assert!([1, 2, 4].contains(&here));
            prop_assert!(reserved_cores(cores + 1) >= here);
        }

        #[test]
        fn prop_kv_cache_override_verbatim(value in "[0-9a-zA-Z.]{1,12}") {
            let hw = profile(Architecture::X86_64);
            let overrides = Overrides::from_pairs([("VLLM_CPU_KVCACHE_SPACE", value.clone())]);
            let decision = Tuner::new(&hw, &overrides).with_allocator_probe(no_allocator).resolve();
            prop_assert_eq!(decision.value(TuningKey::KvCacheSpace), Some(value.as_str()));
        }
    }
}
