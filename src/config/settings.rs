//! Configuration settings for ServeTune
//!
//! Defines the CLI, its subcommands and the resolver settings, each of which
//! can also be supplied through the environment.

use crate::resolver::{HttpSettings, PythonVersion, ResolverOptions};
use crate::system::{Architecture, HardwareVariant};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;

/// ServeTune - hardware-aware runtime tuning for CPU vLLM containers
#[derive(Parser, Debug, Clone)]
#[command(name = "servetune")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Hardware-aware runtime tuning and interpreter resolution for CPU vLLM images")]
#[command(long_about = r#"
ServeTune sizes a CPU inference server's runtime environment from the host it
starts on, and picks the Python version a pinned vLLM release can be installed
with at image build time.

Every tuning value can be overridden with the environment variable of the same
name; an override is passed through unchanged.

Examples:
  servetune tune                                  # Print export lines
  servetune launch                                # Tune and exec `vllm serve $VLLM_MODEL`
  servetune launch -- python3 -m my_server        # Tune and exec a custom command
  servetune detect                                # CPU feature report
  servetune resolve-python --package vllm --version 0.10.1 --output /tmp/python_version.txt
"#)]
pub struct CliArgs {
    /// Verbose output (can be repeated: -v, -vv)
    #[arg(short = 'v', long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only log warnings and errors
    #[arg(short = 'q', long, global = true)]
    pub quiet: bool,

    /// Log line format (logs always go to stderr)
    #[arg(long, value_enum, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Subcommands
    #[command(subcommand)]
    pub command: Commands,
}

impl CliArgs {
    /// Default tracing directive for the verbosity flags
    pub fn log_level(&self) -> &'static str {
        if self.quiet {
            return "warn";
        }
        match self.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    }
}

/// Available subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Detect hardware and print the tuned runtime environment
    #[command(name = "tune")]
    Tune {
        /// Output format
        #[arg(short, long, value_enum, default_value = "env")]
        format: OutputFormat,
    },

    /// Tune, then replace this process with the inference server
    #[command(name = "launch")]
    Launch {
        /// Print the command and environment instead of executing
        #[arg(short = 'n', long)]
        dry_run: bool,

        /// Server command to run instead of `$VLLM_SERVER_BIN serve $VLLM_MODEL ...`
        #[arg(last = true, value_name = "CMD")]
        command: Vec<String>,
    },

    /// Report CPU instruction-set support and the matching build variant
    #[command(name = "detect")]
    Detect,

    /// Resolve the highest Python version a pinned package installs on
    #[command(name = "resolve-python")]
    ResolvePython {
        /// Target package name
        #[arg(long, value_name = "NAME")]
        package: String,

        /// Pinned package version
        #[arg(long, value_name = "VERSION")]
        version: String,

        /// Target architecture (defaults to the running one)
        #[arg(long, value_name = "ARCH")]
        arch: Option<Architecture>,

        /// Skip discovery and start verification at this version
        #[arg(long, value_name = "X.Y")]
        python_version: Option<PythonVersion>,

        /// Also write the version to this file
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,

        #[command(flatten)]
        settings: ResolverSettings,
    },

    /// Record the installed package version to a file
    #[command(name = "record-version")]
    RecordVersion {
        /// Package name
        #[arg(long, value_name = "NAME")]
        package: String,

        /// Version to record (queried from pip when omitted)
        #[arg(long, value_name = "VERSION")]
        version: Option<String>,

        /// Output file
        #[arg(short, long, value_name = "PATH")]
        output: PathBuf,

        /// Interpreter used for `pip show`
        #[arg(long, default_value = "python3", value_name = "BIN")]
        python: String,
    },

    /// Print build-time environment flags for a hardware variant
    #[command(name = "build-flags")]
    BuildFlags {
        /// Variant label or package name (e.g. avx512bf16, vllm-cpu-amxbf16)
        variant: HardwareVariant,
    },
}

/// Where the resolver looks for release data
#[derive(Args, Debug, Clone)]
pub struct ResolverSettings {
    /// Package registry JSON API
    #[arg(long, env = "SERVETUNE_PYPI_URL", default_value = "https://pypi.org/pypi")]
    pub pypi_url: String,

    /// Source repository (`owner/name`) for releases and metadata
    #[arg(long, env = "SERVETUNE_RELEASE_REPO", default_value = "vllm-project/vllm")]
    pub release_repo: String,

    /// Release source API
    #[arg(long, env = "SERVETUNE_GITHUB_API", default_value = "https://api.github.com")]
    pub github_api: String,

    /// Raw file host for source metadata
    #[arg(long, env = "SERVETUNE_RAW_URL", default_value = "https://raw.githubusercontent.com")]
    pub raw_url: String,

    /// Token for the release source API
    #[arg(long, env = "GITHUB_TOKEN", hide_env_values = true)]
    pub github_token: Option<String>,

    /// Per-request timeout in seconds
    #[arg(long, env = "SERVETUNE_HTTP_TIMEOUT", default_value = "10", value_name = "SECS")]
    pub http_timeout: u64,

    /// Lowest Python version considered
    #[arg(long, env = "SERVETUNE_PYTHON_FLOOR", default_value = "3.9", value_name = "X.Y")]
    pub python_floor: PythonVersion,

    /// Fallback when no candidate can be discovered
    #[arg(long, env = "SERVETUNE_DEFAULT_PYTHON", default_value = "3.12", value_name = "X.Y")]
    pub default_python: PythonVersion,

    /// Requirement files in the source tree, used when the registry lists no dependencies
    #[arg(
        long,
        env = "SERVETUNE_REQUIREMENTS",
        default_value = "requirements/cpu.txt",
        value_delimiter = ','
    )]
    pub requirements: Vec<String>,
}

impl ResolverSettings {
    /// Resolver options derived from these settings
    pub fn options(&self) -> ResolverOptions {
        ResolverOptions {
            floor: self.python_floor,
            default: self.default_python,
            repository: self.release_repo.clone(),
            requirement_files: self
                .requirements
                .iter()
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .collect(),
        }
    }

    /// HTTP settings; the connect timeout is capped at 5 seconds
    pub fn http(&self) -> HttpSettings {
        let timeout = Duration::from_secs(self.http_timeout.max(1));
        HttpSettings {
            timeout,
            connect_timeout: timeout.min(Duration::from_secs(5)),
            token: self.github_token.clone().filter(|t| !t.is_empty()),
        }
    }
}

/// Output format for the tuning decision
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    /// Shell `export` lines
    #[default]
    Env,
    /// JSON document
    Json,
    /// Human-readable table
    Text,
}

/// Log line format
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Plain text
    #[default]
    Text,
    /// One JSON object per line
    Json,
}
