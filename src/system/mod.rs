//! Hardware introspection
//!
//! Detects CPU topology, memory, NUMA layout and instruction-set features,
//! and maps them onto the ordered set of server build variants.

mod resources;
pub mod cpu_features;
pub mod numa;
pub mod variant;

pub use cpu_features::{FeatureSet, IsaFeature};
pub use numa::{NumaNode, NumaTopology};
pub use resources::*;
pub use variant::{Compatibility, HardwareVariant};
