//! Server process launch
//!
//! Builds the server command line from launch parameters and hands the
//! resolved tuning environment to it, replacing the current process.

use super::decision::{shell_quote, TuningDecision};
use super::overrides::Overrides;
use crate::error::{Result, ServeTuneError};

/// Server launch parameters, each overridable by the same-named variable
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchConfig {
    /// Server executable (`VLLM_SERVER_BIN`)
    pub program: String,
    /// Model to serve (`VLLM_MODEL`)
    pub model: Option<String>,
    /// Bind address (`VLLM_HOST`)
    pub host: String,
    /// Listen port (`VLLM_PORT`)
    pub port: String,
    /// Weight dtype (`VLLM_DTYPE`)
    pub dtype: String,
    /// Context length cap (`VLLM_MAX_MODEL_LEN`)
    pub max_model_len: Option<String>,
    /// Additional arguments (`VLLM_EXTRA_ARGS`, whitespace separated)
    pub extra_args: Vec<String>,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            program: "vllm".to_string(),
            model: None,
            host: "0.0.0.0".to_string(),
            port: "8000".to_string(),
            dtype: "auto".to_string(),
            max_model_len: None,
            extra_args: Vec::new(),
        }
    }
}

impl LaunchConfig {
    /// Apply overrides on top of the defaults
    pub fn from_overrides(overrides: &Overrides) -> Self {
        let defaults = Self::default();
        let pick = |name: &str, default: String| {
            overrides.get(name).map(str::to_string).unwrap_or(default)
        };

        Self {
            program: pick("VLLM_SERVER_BIN", defaults.program),
            model: overrides.get("VLLM_MODEL").map(str::to_string),
            host: pick("VLLM_HOST", defaults.host),
            port: pick("VLLM_PORT", defaults.port),
            dtype: pick("VLLM_DTYPE", defaults.dtype),
            max_model_len: overrides.get("VLLM_MAX_MODEL_LEN").map(str::to_string),
            extra_args: overrides
                .get("VLLM_EXTRA_ARGS")
                .map(|s| s.split_whitespace().map(str::to_string).collect())
                .unwrap_or_default(),
        }
    }

    /// Build the launch plan. A non-empty `explicit` command is used as-is.
    pub fn plan(&self, decision: &TuningDecision, explicit: &[String]) -> Result<LaunchPlan> {
        let (program, args) = match explicit.split_first() {
            Some((program, args)) => (program.clone(), args.to_vec()),
            None => {
                let model = self.model.as_ref().ok_or_else(|| {
                    ServeTuneError::config("VLLM_MODEL is not set and no command was given")
                })?;

                let mut args = vec![
                    "serve".to_string(),
                    model.clone(),
                    "--host".to_string(),
                    self.host.clone(),
                    "--port".to_string(),
                    self.port.clone(),
                    "--dtype".to_string(),
                    self.dtype.clone(),
                ];
                if let Some(len) = &self.max_model_len {
                    args.push("--max-model-len".to_string());
                    args.push(len.clone());
                }
                args.extend(self.extra_args.iter().cloned());
                (self.program.clone(), args)
            }
        };

        Ok(LaunchPlan {
            program,
            args,
            env: decision
                .env_pairs()
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        })
    }
}

/// Fully determined process invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchPlan {
    /// Executable
    pub program: String,
    /// Arguments
    pub args: Vec<String>,
    /// Environment added on top of the inherited one
    pub env: Vec<(String, String)>,
}

impl LaunchPlan {
    /// Render as a shell command line
    pub fn command_line(&self) -> String {
        std::iter::once(&self.program)
            .chain(self.args.iter())
            .map(|s| shell_quote(s))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Replace the current process with the server.
    ///
    /// Only returns if `exec` itself failed.
    #[cfg(unix)]
    pub fn exec(self) -> ServeTuneError {
        use std::os::unix::process::CommandExt;

        tracing::info!("Launching: {}", self.command_line());
        let err = std::process::Command::new(&self.program)
            .args(&self.args)
            .envs(self.env.iter().map(|(k, v)| (k, v)))
            .exec();
        ServeTuneError::launch(self.program, err.to_string())
    }

    /// Run the server as a child and mirror its exit status
    #[cfg(not(unix))]
    pub fn exec(self) -> ServeTuneError {
        tracing::info!("Launching: {}", self.command_line());
        match std::process::Command::new(&self.program)
            .args(&self.args)
            .envs(self.env.iter().map(|(k, v)| (k, v)))
            .status()
        {
            Ok(status) => std::process::exit(status.code().unwrap_or(1)),
            Err(e) => ServeTuneError::launch(self.program, e.to_string()),
        }
    }
}
