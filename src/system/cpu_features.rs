//! Instruction-set feature detection
//!
//! Reads the CPU capability flags the kernel exports and reduces them to the
//! small set of extensions that decide which server build runs best.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Instruction-set extensions relevant to CPU inference kernels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IsaFeature {
    /// AVX-512 Foundation
    Avx512,
    /// AVX-512 Vector Neural Network Instructions
    Avx512Vnni,
    /// AVX-512 BFloat16
    Avx512Bf16,
    /// Advanced Matrix Extensions, BFloat16 tiles
    AmxBf16,
    /// Advanced Matrix Extensions, INT8 tiles
    AmxInt8,
}

impl IsaFeature {
    /// All features in tier order
    pub const ALL: [IsaFeature; 5] = [
        IsaFeature::Avx512,
        IsaFeature::Avx512Vnni,
        IsaFeature::Avx512Bf16,
        IsaFeature::AmxBf16,
        IsaFeature::AmxInt8,
    ];

    /// Kernel flag spellings that indicate this feature
    fn cpuinfo_flags(&self) -> &'static [&'static str] {
        match self {
            Self::Avx512 => &["avx512f"],
            Self::Avx512Vnni => &["avx512_vnni", "avx512vnni"],
            Self::Avx512Bf16 => &["avx512_bf16", "avx512bf16"],
            Self::AmxBf16 => &["amx_bf16"],
            Self::AmxInt8 => &["amx_int8"],
        }
    }

    /// Display name
    pub fn name(&self) -> &'static str {
        match self {
            Self::Avx512 => "AVX512",
            Self::Avx512Vnni => "AVX512_VNNI",
            Self::Avx512Bf16 => "AVX512_BF16",
            Self::AmxBf16 => "AMX_BF16",
            Self::AmxInt8 => "AMX_INT8",
        }
    }
}

impl fmt::Display for IsaFeature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Set of detected instruction-set features
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSet(BTreeSet<IsaFeature>);

impl FeatureSet {
    /// Empty feature set
    pub fn new() -> Self {
        Self::default()
    }

    /// Does the set contain `feature`?
    pub fn contains(&self, feature: IsaFeature) -> bool {
        self.0.contains(&feature)
    }

    /// Does the set contain any AMX capability?
    pub fn has_amx(&self) -> bool {
        self.contains(IsaFeature::AmxBf16) || self.contains(IsaFeature::AmxInt8)
    }

    /// Add a feature
    pub fn insert(&mut self, feature: IsaFeature) {
        self.0.insert(feature);
    }

    /// Is the set empty?
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate features in tier order
    pub fn iter(&self) -> impl Iterator<Item = IsaFeature> + '_ {
        self.0.iter().copied()
    }

    /// Parse the contents of `/proc/cpuinfo`.
    ///
    /// x86 kernels publish a `flags` line per processor, arm64 kernels a
    /// `Features` line. Only the first such line is consulted since every
    /// core of a socket reports the same capabilities.
    pub fn from_cpuinfo(content: &str) -> Self {
        let flags: BTreeSet<&str> = content
            .lines()
            .find_map(|line| {
                let (key, value) = line.split_once(':')?;
                let key = key.trim();
                (key == "flags" || key == "Features").then_some(value)
            })
            .map(|value| value.split_whitespace().collect())
            .unwrap_or_default();

        Self::from_flags(flags)
    }

    /// Build a set from individual kernel flag names
    pub fn from_flags<'a>(flags: impl IntoIterator<Item = &'a str>) -> Self {
        let flags: BTreeSet<String> = flags.into_iter().map(|f| f.to_lowercase()).collect();
        let mut set = FeatureSet::new();
        for feature in IsaFeature::ALL {
            if feature.cpuinfo_flags().iter().any(|f| flags.contains(*f)) {
                set.insert(feature);
            }
        }
        set
    }

    /// Detect features of the running host, empty if unreadable
    pub fn detect() -> Self {
        Self::probe().unwrap_or_else(FeatureSet::new)
    }

    /// Like [`FeatureSet::detect`], but `None` when the host publishes no
    /// flag information at all
    pub fn probe() -> Option<Self> {
        match std::fs::read_to_string("/proc/cpuinfo") {
            Ok(content) if has_flag_line(&content) => Some(Self::from_cpuinfo(&content)),
            Ok(_) => {
                tracing::debug!("/proc/cpuinfo has no flags line");
                None
            }
            Err(e) => {
                tracing::debug!("Could not read /proc/cpuinfo: {}", e);
                None
            }
        }
    }
}

fn has_flag_line(content: &str) -> bool {
    content.lines().any(|line| {
        line.split_once(':')
            .map(|(key, _)| matches!(key.trim(), "flags" | "Features"))
            .unwrap_or(false)
    })
}

impl FromIterator<IsaFeature> for FeatureSet {
    fn from_iter<I: IntoIterator<Item = IsaFeature>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl fmt::Display for FeatureSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("none");
        }
        let names: Vec<&str> = self.iter().map(|feature| feature.name()).collect();
        f.write_str(&names.join(" "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAPPHIRE_RAPIDS: &str = "processor\t: 0\n\
        vendor_id\t: GenuineIntel\n\
        flags\t\t: fpu vme sse sse2 avx2 avx512f avx512dq avx512_vnni avx512_bf16 amx_bf16 amx_tile amx_int8\n\
        \n\
        processor\t: 1\n\
        flags\t\t: fpu vme sse sse2 avx2 avx512f\n";

    #[test]
    fn test_parse_x86_flags() {
        let set = FeatureSet::from_cpuinfo(SAPPHIRE_RAPIDS);
        for feature in IsaFeature::ALL {
            assert!(set.contains(feature), "missing {}", feature);
        }
        assert!(set.has_amx());
    }

    #[test]
    fn test_parse_arm_features() {
        let content = "processor\t: 0\nBogoMIPS\t: 50.00\nFeatures\t: fp asimd evtstrm aes pmull sha1 sha2 crc32\n";
        assert!(FeatureSet::from_cpuinfo(content).is_empty());
    }

    #[test]
    fn test_flag_line_presence() {
        assert!(has_flag_line(SAPPHIRE_RAPIDS));
        assert!(has_flag_line("Features\t: fp asimd\n"));
        assert!(!has_flag_line("processor\t: 0\nmodel name\t: QEMU\n"));
    }

    #[test]
    fn test_alternate_spellings() {
        let set = FeatureSet::from_flags(["AVX512F", "avx512vnni", "avx512bf16"]);
        assert!(set.contains(IsaFeature::Avx512));
        assert!(set.contains(IsaFeature::Avx512Vnni));
        assert!(set.contains(IsaFeature::Avx512Bf16));
        assert!(!set.has_amx());
    }

    #[test]
    fn test_missing_flags_line() {
        assert!(FeatureSet::from_cpuinfo("").is_empty());
        assert!(FeatureSet::from_cpuinfo("model name : Foo\n").is_empty());
    }

    #[test]
    fn test_display() {
        let set: FeatureSet = [IsaFeature::AmxBf16, IsaFeature::Avx512].into_iter().collect();
        assert_eq!(set.to_string(), "AVX512 AMX_BF16");
        assert_eq!(FeatureSet::new().to_string(), "none");
    }
}
