//! Configuration module for ServeTune
//!
//! CLI arguments and resolver settings. Runtime tuning overrides live with the
//! tuner, see [`crate::tuner::Overrides`].

mod settings;

pub use settings::*;
