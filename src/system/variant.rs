//! Hardware variant tiers
//!
//! Each server build targets one instruction-set tier. The tiers are strictly
//! ordered: a binary compiled for tier N uses every extension of tiers 0..=N.

use super::cpu_features::{FeatureSet, IsaFeature};
use super::resources::Architecture;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Instruction-set tier of a server build
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum HardwareVariant {
    /// No AVX-512 (any x86_64 or aarch64 CPU)
    Baseline,
    /// AVX-512 (Skylake-X and newer)
    Avx512,
    /// AVX-512 + VNNI (Cascade Lake and newer)
    Avx512Vnni,
    /// AVX-512 + VNNI + BF16 (Cooper Lake and newer)
    Avx512Bf16,
    /// AVX-512 + VNNI + BF16 + AMX (Sapphire Rapids and newer)
    AmxBf16,
}

impl HardwareVariant {
    /// All variants, lowest tier first
    pub const ALL: [HardwareVariant; 5] = [
        HardwareVariant::Baseline,
        HardwareVariant::Avx512,
        HardwareVariant::Avx512Vnni,
        HardwareVariant::Avx512Bf16,
        HardwareVariant::AmxBf16,
    ];

    /// Pick the highest tier the hardware fully supports.
    ///
    /// aarch64 and unknown architectures always map to the baseline. On x86_64
    /// any AMX capability selects the top tier outright: every AMX part also
    /// implements the AVX-512 extensions below it.
    pub fn recommend(arch: Architecture, features: &FeatureSet) -> Self {
        if arch != Architecture::X86_64 {
            return HardwareVariant::Baseline;
        }
        if features.has_amx() {
            return HardwareVariant::AmxBf16;
        }

        Self::ALL
            .iter()
            .rev()
            .copied()
            .find(|variant| {
                variant
                    .required_features()
                    .iter()
                    .all(|feature| features.contains(*feature))
            })
            .unwrap_or(HardwareVariant::Baseline)
    }

    /// Cumulative features this tier requires
    pub fn required_features(&self) -> &'static [IsaFeature] {
        match self {
            Self::Baseline => &[],
            Self::Avx512 => &[IsaFeature::Avx512],
            Self::Avx512Vnni => &[IsaFeature::Avx512, IsaFeature::Avx512Vnni],
            Self::Avx512Bf16 => &[
                IsaFeature::Avx512,
                IsaFeature::Avx512Vnni,
                IsaFeature::Avx512Bf16,
            ],
            Self::AmxBf16 => &[
                IsaFeature::Avx512,
                IsaFeature::Avx512Vnni,
                IsaFeature::Avx512Bf16,
                IsaFeature::AmxBf16,
            ],
        }
    }

    /// Canonical label
    pub fn label(&self) -> &'static str {
        match self {
            Self::Baseline => "baseline",
            Self::Avx512 => "avx512",
            Self::Avx512Vnni => "avx512+vnni",
            Self::Avx512Bf16 => "avx512+vnni+bf16",
            Self::AmxBf16 => "avx512+vnni+bf16+amx",
        }
    }

    /// Published package name for this build
    pub fn package_name(&self) -> &'static str {
        match self {
            Self::Baseline => "vllm-cpu",
            Self::Avx512 => "vllm-cpu-avx512",
            Self::Avx512Vnni => "vllm-cpu-avx512vnni",
            Self::Avx512Bf16 => "vllm-cpu-avx512bf16",
            Self::AmxBf16 => "vllm-cpu-amxbf16",
        }
    }

    /// Short human description
    pub fn description(&self) -> &'static str {
        match self {
            Self::Baseline => "Base package (no AVX512, supports ARM64 & x86_64)",
            Self::Avx512 => "AVX512 optimized (Intel Skylake-X and newer)",
            Self::Avx512Vnni => "AVX512 + VNNI (Intel Cascade Lake and newer)",
            Self::Avx512Bf16 => "AVX512 + VNNI + BF16 (Intel Cooper Lake and newer)",
            Self::AmxBf16 => "AVX512 + VNNI + BF16 + AMX (Intel Sapphire Rapids and newer)",
        }
    }

    /// Does this build use AMX kernels?
    pub fn has_amx(&self) -> bool {
        *self == HardwareVariant::AmxBf16
    }

    /// Build-time environment for compiling this variant
    pub fn build_flags(&self) -> Vec<(&'static str, &'static str)> {
        let mut flags = vec![("VLLM_TARGET_DEVICE", "cpu")];
        if *self == HardwareVariant::Baseline {
            flags.push(("VLLM_CPU_DISABLE_AVX512", "1"));
            return flags;
        }
        flags.push(("VLLM_CPU_DISABLE_AVX512", "0"));
        if *self >= HardwareVariant::Avx512Vnni {
            flags.push(("VLLM_CPU_AVX512VNNI", "1"));
        }
        if *self >= HardwareVariant::Avx512Bf16 {
            flags.push(("VLLM_CPU_AVX512BF16", "1"));
        }
        if *self >= HardwareVariant::AmxBf16 {
            flags.push(("VLLM_CPU_AMXBF16", "1"));
        }
        flags
    }

    /// Compare the running build against the recommended tier
    pub fn compatibility(running: HardwareVariant, recommended: HardwareVariant) -> Compatibility {
        match running.cmp(&recommended) {
            Ordering::Equal => Compatibility::Optimal,
            Ordering::Less => Compatibility::Suboptimal,
            Ordering::Greater => Compatibility::Incompatible,
        }
    }
}

impl fmt::Display for HardwareVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for HardwareVariant {
    type Err = String;

    /// Accepts canonical labels, package names and the short build names
    /// used in image tags (`noavx512`, `avx512vnni`, `amxbf16`, ...).
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let normalized: String = s
            .trim()
            .to_lowercase()
            .trim_start_matches("vllm-cpu")
            .trim_start_matches(['-', '_'])
            .chars()
            .filter(|c| !matches!(c, '+' | '-' | '_'))
            .collect();

        match normalized.as_str() {
            "" | "baseline" | "base" | "noavx512" => Ok(Self::Baseline),
            "avx512" => Ok(Self::Avx512),
            "avx512vnni" => Ok(Self::Avx512Vnni),
            "avx512bf16" | "avx512vnnibf16" => Ok(Self::Avx512Bf16),
            "amxbf16" | "amx" | "avx512vnnibf16amx" => Ok(Self::AmxBf16),
            _ => Err(format!("unknown hardware variant '{}'", s)),
        }
    }
}

/// Advisory outcome of comparing the running build with the hardware
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Compatibility {
    /// Build matches the hardware tier
    Optimal,
    /// Hardware supports a higher tier than the build uses
    Suboptimal,
    /// Build assumes features the hardware lacks
    Incompatible,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn features(list: &[IsaFeature]) -> FeatureSet {
        list.iter().copied().collect()
    }

    #[test]
    fn test_recommend_tiers() {
        let x86 = Architecture::X86_64;
        assert_eq!(HardwareVariant::recommend(x86, &FeatureSet::new()), HardwareVariant::Baseline);
        assert_eq!(
            HardwareVariant::recommend(x86, &features(&[IsaFeature::Avx512])),
            HardwareVariant::Avx512
        );
        assert_eq!(
            HardwareVariant::recommend(x86, &features(&[IsaFeature::Avx512, IsaFeature::Avx512Vnni])),
            HardwareVariant::Avx512Vnni
        );
        assert_eq!(
            HardwareVariant::recommend(
                x86,
                &features(&[IsaFeature::Avx512, IsaFeature::Avx512Vnni, IsaFeature::Avx512Bf16])
            ),
            HardwareVariant::Avx512Bf16
        );
    }

    #[test]
    fn test_gaps_do_not_skip_tiers() {
        // BF16 without VNNI only qualifies for plain AVX512
        let set = features(&[IsaFeature::Avx512, IsaFeature::Avx512Bf16]);
        assert_eq!(HardwareVariant::recommend(Architecture::X86_64, &set), HardwareVariant::Avx512);

        // VNNI without AVX512F qualifies for nothing
        let set = features(&[IsaFeature::Avx512Vnni]);
        assert_eq!(HardwareVariant::recommend(Architecture::X86_64, &set), HardwareVariant::Baseline);
    }

    #[test]
    fn test_amx_alone_selects_top_tier() {
        let set = features(&[IsaFeature::AmxBf16]);
        assert_eq!(HardwareVariant::recommend(Architecture::X86_64, &set), HardwareVariant::AmxBf16);
        let set = features(&[IsaFeature::AmxInt8]);
        assert_eq!(HardwareVariant::recommend(Architecture::X86_64, &set), HardwareVariant::AmxBf16);
    }

    #[test]
    fn test_aarch64_always_baseline() {
        let all: FeatureSet = IsaFeature::ALL.into_iter().collect();
        assert_eq!(HardwareVariant::recommend(Architecture::Aarch64, &all), HardwareVariant::Baseline);
        assert_eq!(HardwareVariant::recommend(Architecture::Other, &all), HardwareVariant::Baseline);
    }

    #[test]
    fn test_parse_labels() {
        assert_eq!("baseline".parse::<HardwareVariant>().unwrap(), HardwareVariant::Baseline);
        assert_eq!("noavx512".parse::<HardwareVariant>().unwrap(), HardwareVariant::Baseline);
        assert_eq!("vllm-cpu".parse::<HardwareVariant>().unwrap(), HardwareVariant::Baseline);
        assert_eq!("vllm-cpu-avx512vnni".parse::<HardwareVariant>().unwrap(), HardwareVariant::Avx512Vnni);
        assert_eq!("avx512+vnni+bf16".parse::<HardwareVariant>().unwrap(), HardwareVariant::Avx512Bf16);
        assert_eq!("AMXBF16".parse::<HardwareVariant>().unwrap(), HardwareVariant::AmxBf16);
        assert!("sse4".parse::<HardwareVariant>().is_err());
    }

    #[test]
    fn test_labels_round_trip() {
        for variant in HardwareVariant::ALL {
            assert_eq!(variant.label().parse::<HardwareVariant>().unwrap(), variant);
            assert_eq!(variant.package_name().parse::<HardwareVariant>().unwrap(), variant);
        }
    }

    #[test]
    fn test_compatibility() {
        use HardwareVariant::*;
        assert_eq!(HardwareVariant::compatibility(Avx512, Avx512), Compatibility::Optimal);
        assert_eq!(HardwareVariant::compatibility(Baseline, AmxBf16), Compatibility::Suboptimal);
        assert_eq!(HardwareVariant::compatibility(AmxBf16, Avx512Vnni), Compatibility::Incompatible);
    }

    #[test]
    fn test_build_flags() {
        let base = HardwareVariant::Baseline.build_flags();
        assert!(base.contains(&("VLLM_CPU_DISABLE_AVX512", "1")));
        assert_eq!(base.len(), 2);

        let amx = HardwareVariant::AmxBf16.build_flags();
        assert!(amx.contains(&("VLLM_CPU_DISABLE_AVX512", "0")));
        assert!(amx.contains(&("VLLM_CPU_AVX512VNNI", "1")));
        assert!(amx.contains(&("VLLM_CPU_AVX512BF16", "1")));
        assert!(amx.contains(&("VLLM_CPU_AMXBF16", "1")));

        let vnni = HardwareVariant::Avx512Vnni.build_flags();
        assert!(!vnni.iter().any(|(k, _)| *k == "VLLM_CPU_AVX512BF16"));
    }
}
