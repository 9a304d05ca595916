//! User-supplied overrides
//!
//! Captured once from the environment before any default is computed, so
//! resolution order can never change what a later key sees.

use std::collections::BTreeMap;
use std::ffi::OsString;

/// Immutable snapshot of user overrides keyed by environment variable name
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Overrides(BTreeMap<String, String>);

impl Overrides {
    /// Capture the current process environment. Variables whose name or
    /// value is not valid UTF-8 are skipped.
    pub fn from_env() -> Self {
        Self::from_os_pairs(std::env::vars_os())
    }

    fn from_os_pairs<I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (OsString, OsString)>,
    {
        Self::from_pairs(pairs.into_iter().filter_map(|(key, value)| {
            match (key.to_str(), value.to_str()) {
                (Some(k), Some(v)) => Some((k.to_string(), v.to_string())),
                _ => {
                    tracing::debug!("Skipping non UTF-8 environment entry {:?}", key);
                    None
                }
            }
        }))
    }

    /// Build from explicit pairs. Empty values count as unset.
    pub fn from_pairs<K, V, I>(pairs: I) -> Self
    where
        K: Into<String>,
        V: Into<String>,
        I: IntoIterator<Item = (K, V)>,
    {
        Self(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .filter(|(_, v)| !v.trim().is_empty())
                .collect(),
        )
    }

    /// Value for `name`, if the user set a non-empty one
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }
}
