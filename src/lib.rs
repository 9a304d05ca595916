//! # ServeTune - Hardware-Aware Runtime Tuning for CPU Inference Servers
//!
//! ServeTune covers the two decisions a CPU vLLM container has to make that
//! depend on the machine rather than on the model:
//!
//! - **Runtime tuning** at container start: size the KV cache, reserve
//!   cores, pick thread binding, toggle the small-batch kernel, preload an
//!   allocator and recommend the best build variant for the detected
//!   instruction set. Every value can be overridden with its environment
//!   variable.
//! - **Interpreter resolution** at image build: find the highest Python
//!   minor for which a pinned package and all of its pinned dependencies
//!   publish installable wheels for the target architecture.
//!
//! ## Runtime Tuning
//!
//! ```no_run
//! use servetune::system::HardwareProfile;
//! use servetune::tuner::{Overrides, Tuner};
//!
//! let profile = HardwareProfile::collect();
//! let overrides = Overrides::from_env();
//! let decision = Tuner::new(&profile, &overrides).resolve();
//!
//! print!("{}", decision.to_exports());
//! if let Some(advisory) = decision.advisory() {
//!     advisory.log();
//! }
//! ```
//!
//! ## Interpreter Resolution
//!
//! ```no_run
//! use servetune::resolver::{
//!     GithubClient, HttpSettings, InterpreterResolver, PypiClient, ResolveRequest, ResolverOptions,
//! };
//! use servetune::system::Architecture;
//!
//! let http = HttpSettings::default();
//! let pypi = PypiClient::new("https://pypi.org/pypi", &http);
//! let github = GithubClient::new("https://api.github.com", "https://raw.githubusercontent.com", &http);
//! let resolver = InterpreterResolver::new(&pypi, &github, &github, ResolverOptions::default());
//!
//! let python = resolver
//!     .resolve(&ResolveRequest::new("vllm", "0.10.1", Architecture::current()))
//!     .unwrap();
//! println!("{}", python);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod resolver;
pub mod system;
pub mod tuner;

// Re-export commonly used types
pub use error::{Result, ServeTuneError};
pub use resolver::{InterpreterResolver, PythonVersion, ResolutionFailure};
pub use system::{Architecture, HardwareProfile, HardwareVariant};
pub use tuner::{Overrides, Tuner, TuningDecision};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prelude module for convenient imports
pub mod prelude {
    //! Convenient re-exports for common usage
    //!
    //! ```no_run
    //! use servetune::prelude::*;
    //! ```

    pub use crate::error::{Result, ServeTuneError};
    pub use crate::resolver::{
        write_atomic, InMemoryRegistry, InterpreterResolver, PythonVersion, ResolveRequest, ResolverOptions,
    };
    pub use crate::system::{Architecture, FeatureSet, HardwareProfile, HardwareVariant, IsaFeature};
    pub use crate::tuner::{LaunchConfig, LaunchPlan, Overrides, Tuner, TuningDecision, TuningKey};
}
