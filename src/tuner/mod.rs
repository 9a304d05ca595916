//! Runtime tuner
//!
//! Resolves the server's runtime environment from detected hardware and user
//! overrides, then launches the server with it.

mod decision;
mod launch;
mod overrides;

pub use decision::*;
pub use launch::{LaunchConfig, LaunchPlan};
pub use overrides::Overrides;
