//! ServeTune CLI - Runtime Tuning for CPU Inference Containers
//!
//! Logs go to stderr; stdout carries only each command's result, so callers
//! can capture it with `$(servetune ...)`.

use anyhow::Context;
use clap::Parser;
use console::style;
use serde::Serialize;
use servetune::config::{CliArgs, Commands, LogFormat, OutputFormat, ResolverSettings};
use servetune::error::ServeTuneError;
use servetune::resolver::{
    installed_version, write_atomic, GithubClient, InterpreterResolver, PypiClient, PythonVersion, ResolveRequest,
};
use servetune::system::{Architecture, FeatureSet, HardwareProfile, HardwareVariant, IsaFeature, NumaTopology};
use servetune::tuner::{shell_quote, LaunchConfig, Overrides, Tuner, TuningDecision};
use std::path::Path;
use tracing_subscriber::EnvFilter;

fn main() {
    // Parse CLI arguments
    let args = CliArgs::parse();

    // Initialize logging
    init_logging(&args);

    match run(args) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            std::process::exit(1);
        }
    }
}

fn init_logging(args: &CliArgs) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(args.log_level()));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match args.log_format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

fn run(args: CliArgs) -> anyhow::Result<i32> {
    match args.command {
        Commands::Tune { format } => cmd_tune(format),
        Commands::Launch { dry_run, command } => cmd_launch(dry_run, &command),
        Commands::Detect => Ok(cmd_detect()),
        Commands::ResolvePython {
            package,
            version,
            arch,
            python_version,
            output,
            settings,
        } => cmd_resolve_python(&package, &version, arch, python_version, output.as_deref(), &settings),
        Commands::RecordVersion {
            package,
            version,
            output,
            python,
        } => cmd_record_version(&package, version, &output, &python),
        Commands::BuildFlags { variant } => cmd_build_flags(variant),
    }
}

/// Hardware snapshot, the decision made from it and the captured overrides
fn tune() -> (HardwareProfile, Overrides, TuningDecision) {
    let profile = HardwareProfile::collect();
    let overrides = Overrides::from_env();
    let decision = Tuner::new(&profile, &overrides).resolve();

    profile.print_summary();
    decision.log();
    match decision.advisory() {
        Some(advisory) => advisory.log(),
        None => tracing::debug!("Build variant unknown, skipping compatibility check"),
    }

    (profile, overrides, decision)
}

#[derive(Serialize)]
struct TuneReport<'a> {
    hardware: &'a HardwareProfile,
    decision: &'a TuningDecision,
}

fn cmd_tune(format: OutputFormat) -> anyhow::Result<i32> {
    let (profile, _, decision) = tune();

    match format {
        OutputFormat::Env => print!("{}", decision.to_exports()),
        OutputFormat::Json => {
            let report = TuneReport {
                hardware: &profile,
                decision: &decision,
            };
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        OutputFormat::Text => {
            for setting in &decision.settings {
                println!(
                    "{:<22} {:<30} {:<24} {}",
                    setting.key.description(),
                    setting.key.env_name(),
                    setting.value.as_deref().unwrap_or("-"),
                    setting.provenance
                );
            }
        }
    }

    Ok(0)
}

fn cmd_launch(dry_run: bool, command: &[String]) -> anyhow::Result<i32> {
    let (_, overrides, decision) = tune();
    let plan = LaunchConfig::from_overrides(&overrides).plan(&decision, command)?;

    if dry_run {
        for (name, value) in &plan.env {
            println!("export {}={}", name, shell_quote(value));
        }
        println!("{}", plan.command_line());
        return Ok(0);
    }

    Err(plan.exec().into())
}

fn cmd_detect() -> i32 {
    let profile = HardwareProfile::collect();
    let readable = FeatureSet::probe().is_some();
    let recommended = HardwareVariant::recommend(profile.architecture, &profile.features);
    let rule = "=".repeat(70);
    let thin = "-".repeat(70);

    println!("{}", rule);
    println!("{}", style("vLLM CPU Variant Detector").bold());
    println!("{}", rule);
    println!();
    println!("System:       {}", std::env::consts::OS);
    println!("Architecture: {}", profile.architecture);
    println!("CPU Model:    {}", profile.cpu_model);
    println!();
    NumaTopology::detect().print_summary();
    println!();

    println!("Detected CPU Features:");
    println!("{}", thin);
    if readable {
        for feature in IsaFeature::ALL {
            if profile.features.contains(feature) {
                println!("  {} {:<20} Supported", style("✓").green(), feature);
            } else {
                println!("  {} {:<20} Not Supported", style("✗").red(), feature);
            }
        }
    } else {
        println!("  (No features detected)");
    }
    println!();

    println!("Recommended Package:");
    println!("{}", thin);
    println!("  {} ({})", style(recommended.package_name()).cyan().bold(), recommended);
    println!();
    println!("Installation Command:");
    println!("{}", thin);
    println!("  pip install {}", recommended.package_name());
    println!();

    println!("All Available Packages:");
    println!("{}", thin);
    for variant in HardwareVariant::ALL {
        let marker = if variant == recommended { "->" } else { "  " };
        println!("  {} {:<25} - {}", marker, variant.package_name(), variant.description());
    }
    println!();
    println!("{}", rule);

    if !readable && profile.architecture == Architecture::X86_64 {
        tracing::warn!(
            "Could not read CPU features reliably, defaulting to {}",
            HardwareVariant::Baseline.package_name()
        );
        return 1;
    }
    0
}

fn cmd_resolve_python(
    package: &str,
    version: &str,
    arch: Option<Architecture>,
    python_version: Option<PythonVersion>,
    output: Option<&Path>,
    settings: &ResolverSettings,
) -> anyhow::Result<i32> {
    let arch = arch.unwrap_or_else(Architecture::current);
    if arch == Architecture::Other {
        return Err(ServeTuneError::UnsupportedArchitecture(std::env::consts::ARCH.to_string()).into());
    }

    let http = settings.http();
    let pypi = PypiClient::new(settings.pypi_url.as_str(), &http);
    let github = GithubClient::new(settings.github_api.as_str(), settings.raw_url.as_str(), &http);
    let resolver = InterpreterResolver::new(&pypi, &github, &github, settings.options());

    let mut request = ResolveRequest::new(package, version, arch);
    if let Some(python) = python_version {
        request = request.with_python(python);
    }

    let python = resolver.resolve(&request)?;

    if let Some(path) = output {
        write_atomic(path, &python.to_string())
            .with_context(|| format!("writing resolved version to {}", path.display()))?;
        tracing::info!("Wrote {} to {}", python, path.display());
    }

    println!("{}", python);
    Ok(0)
}

fn cmd_record_version(
    package: &str,
    version: Option<String>,
    output: &Path,
    python: &str,
) -> anyhow::Result<i32> {
    let version = match version {
        Some(v) => v.trim().to_string(),
        None => installed_version(python, package)
            .with_context(|| format!("querying installed version of {}", package))?,
    };

    write_atomic(output, &version).with_context(|| format!("writing version to {}", output.display()))?;
    tracing::info!("Recorded {}=={} in {}", package, version, output.display());

    println!("{}", version);
    Ok(0)
}

fn cmd_build_flags(variant: HardwareVariant) -> anyhow::Result<i32> {
    tracing::info!("Build flags for {} ({})", variant, variant.package_name());
    for (name, value) in variant.build_flags() {
        println!("export {}={}", name, shell_quote(value));
    }
    Ok(0)
}
