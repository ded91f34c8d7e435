//! vmscaled: runs one elastic capacity test.
//!
//! Provisions the fleet, drives the load test, scales the web services
//! from the reported throughput, and tears everything down. Ctrl-C stops
//! the run at the next step boundary; teardown still runs.
//!
//! # Usage
//!
//! ```text
//! vmscaled run --config vmscale.toml
//! vmscaled run --config vmscale.toml --log-format json
//! vmscaled check --config vmscale.toml
//! ```
//!
//! Exit status: 0 on success, 1 when the run failed or left resources
//! behind, 2 when the configuration is unusable.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use vmscale_autoscale::ScalingPolicy;
use vmscale_controller::{ControllerError, ElasticController, RunReport};
use vmscale_core::{RetryPolicy, ScaleConfig, StopFlag};
use vmscale_provider::{CapacityProvider, CloudHandles, SandboxCloud};

const DEFAULT_FILTER: &str = "info,vmscaled=debug,vmscale=debug";

const EXIT_CONFIG: u8 = 2;

#[derive(Parser)]
#[command(name = "vmscaled", about = "Elastic capacity controller for load tests")]
struct Cli {
    /// Log output format.
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Provision, test, scale and tear down.
    Run {
        /// Path to vmscale.toml.
        #[arg(long, short)]
        config: PathBuf,

        /// Cloud control plane to drive.
        #[arg(long, value_enum, default_value_t = Cloud::Sandbox)]
        cloud: Cloud,
    },
    /// Validate a configuration file and print the effective policy.
    Check {
        /// Path to vmscale.toml.
        #[arg(long, short)]
        config: PathBuf,

        /// Print the parsed configuration as JSON.
        #[arg(long)]
        json: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Cloud {
    /// In-memory cloud; addresses come from the `[sandbox]` section.
    Sandbox,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let code = match cli.command {
        Command::Run { config, cloud } => run(&config, cloud).await,
        Command::Check { config, json } => check(&config, json),
    };
    ExitCode::from(code)
}

fn init_tracing(format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// Read and validate the configuration file.
fn load_config(path: &Path) -> anyhow::Result<ScaleConfig> {
    let config = ScaleConfig::from_file(path)
        .map_err(|e| anyhow::anyhow!("reading {}: {e}", path.display()))?;
    config.validate()?;
    Ok(config)
}

fn build_provider(config: &ScaleConfig, cloud: Cloud) -> CapacityProvider {
    let handles = match cloud {
        Cloud::Sandbox => CloudHandles::from_provider(Arc::new(SandboxCloud::new(&config.sandbox))),
    };
    let timing = &config.timing;
    CapacityProvider::new(handles, timing.provider_timeout())
        .with_poll_interval(timing.poll_interval())
        .with_retry(RetryPolicy::bounded(timing.retry_delay(), 30))
}

async fn run(path: &Path, cloud: Cloud) -> u8 {
    let config = match load_config(path) {
        Ok(config) => config,
        Err(e) => {
            error!(path = %path.display(), error = %e, "invalid configuration");
            return EXIT_CONFIG;
        }
    };
    info!(path = %path.display(), mode = ?config.mode, ?cloud, "vmscaled starting");

    let provider = build_provider(&config, cloud);
    let (stop_tx, stop) = StopFlag::new();
    let controller = match ElasticController::new(config, provider, stop) {
        Ok(controller) => controller,
        Err(e @ ControllerError::Config(_)) => {
            error!(error = %e, "invalid configuration");
            return EXIT_CONFIG;
        }
        Err(e) => {
            error!(error = %e, "controller setup failed");
            return 1;
        }
    };

    // Stop cooperatively on Ctrl-C.
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping after the current step");
            let _ = stop_tx.send(true);
        }
    });

    let report = controller.run().await;
    print_report(&report);
    report.exit_code()
}

fn print_report(report: &RunReport) {
    if let Some(summary) = &report.summary {
        println!("test {} finished", summary.test_id);
        if let Some(rps) = summary.final_rps {
            println!("  final rps:     {rps:.2}");
        }
        println!("  added:         {}", summary.instances_added);
        println!("  removed:       {}", summary.instances_removed);
        println!("  peak fleet:    {}", summary.peak_fleet);
        println!("  log:           {}", summary.log_path.display());
    }
    if let Some(e) = &report.error {
        println!("run did not complete: {e}");
    }
    if !report.teardown.is_clean() {
        println!("resources not confirmed deleted:");
        for leftover in &report.teardown.leftovers {
            println!("  {} {} ({})", leftover.kind, leftover.id, leftover.error);
        }
    }
}

fn check(path: &Path, json: bool) -> u8 {
    let config = match load_config(path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}: {e}", path.display());
            return EXIT_CONFIG;
        }
    };

    if json {
        match serde_json::to_string_pretty(&config) {
            Ok(text) => println!("{text}"),
            Err(e) => {
                eprintln!("rendering configuration failed: {e}");
                return 1;
            }
        }
        return 0;
    }

    let policy = ScalingPolicy::from_config(&config);
    println!("{}: ok", path.display());
    println!("  mode:              {:?}", config.mode);
    println!("  rps target:        {}", policy.rps_target);
    println!(
        "  fleet:             {}..={} (initial {})",
        policy.min_size, policy.max_size, config.scaling.initial_size
    );
    println!("  steps:             +{} / -{}", policy.scale_out_step, policy.scale_in_step);
    println!(
        "  cooldowns:         out {:?}, in {:?}",
        policy.scale_out_cooldown, policy.scale_in_cooldown
    );
    println!(
        "  evaluation:        out {} period(s), in {} period(s)",
        policy.scale_out_evaluation_periods, policy.scale_in_evaluation_periods
    );
    println!("  scale-in trigger:  {:?}", policy.scale_in_trigger);
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
load_generator_ami = "ami-lg"
web_service_ami = "ami-ws"
instance_type = "m5.large"
"#;

    fn write(content: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vmscale.toml");
        std::fs::write(&path, content).unwrap();
        (dir, path)
    }

    #[test]
    fn parse_run_command() {
        let cli = Cli::try_parse_from(["vmscaled", "run", "--config", "vmscale.toml"]).unwrap();
        assert_eq!(cli.log_format, LogFormat::Text);
        match cli.command {
            Command::Run { config, cloud } => {
                assert_eq!(config, PathBuf::from("vmscale.toml"));
                assert_eq!(cloud, Cloud::Sandbox);
            }
            Command::Check { .. } => panic!("expected run"),
        }
    }

    #[test]
    fn parse_global_log_format() {
        let cli = Cli::try_parse_from(["vmscaled", "check", "-c", "x.toml", "--log-format", "json"])
            .unwrap();
        assert_eq!(cli.log_format, LogFormat::Json);
    }

    #[test]
    fn run_requires_config() {
        assert!(Cli::try_parse_from(["vmscaled", "run"]).is_err());
    }

    #[test]
    fn check_accepts_valid_config() {
        let (_dir, path) = write(CONFIG);
        assert_eq!(check(&path, false), 0);
        assert_eq!(check(&path, true), 0);
    }

    #[test]
    fn check_rejects_invalid_config() {
        let (_dir, path) = write(&format!("{CONFIG}\n[scaling]\nmin_size = 7\n"));
        assert_eq!(check(&path, false), EXIT_CONFIG);
        assert_eq!(check(Path::new("/nonexistent/vmscale.toml"), false), EXIT_CONFIG);
    }

    #[tokio::test]
    async fn run_with_bad_config_exits_with_config_code() {
        let (_dir, path) = write("instance_type = 3");
        assert_eq!(run(&path, Cloud::Sandbox).await, EXIT_CONFIG);
    }
}
