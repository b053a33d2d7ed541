//! otactl - firmware update operator CLI
//!
//! Drives the staged update pipeline against a directory-backed flash
//! emulator: provision a device, stage images, apply them and run the
//! boot-time recovery check.

#![deny(static_mut_refs)]
#![deny(unused_must_use)]
#![deny(clippy::unwrap_used)]

mod commands;
mod error;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::commands::Device;

/// Default emulated slot capacity
const DEFAULT_SLOT_SIZE: u64 = 4 * 1024 * 1024;

#[derive(Parser)]
#[command(name = "otactl")]
#[command(about = "Stage, apply and recover firmware updates")]
#[command(version)]
#[command(long_about = "
otactl stages firmware and asset images into the recovery directory, commits
them to the inactive slot of an emulated A/B flash device and runs the
boot-time recovery check.

Use --json for machine-readable output suitable for scripting.
")]
struct Cli {
    /// Output in JSON format for machine parsing
    #[arg(long, global = true)]
    json: bool,

    /// Verbose logging
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Configuration file (created with defaults if missing)
    #[arg(long, global = true, env = "OTACTL_CONFIG", default_value = "otactl.json")]
    config: PathBuf,

    /// Emulated flash device directory
    #[arg(long, global = true, env = "OTACTL_DEVICE", default_value = "device")]
    device_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create an emulated device running the given image
    Provision {
        /// Initial firmware image
        image: PathBuf,

        /// Capacity of each firmware slot in bytes
        #[arg(long, default_value_t = DEFAULT_SLOT_SIZE)]
        slot_size: u64,
    },

    /// Apply a staged update the way the device does at boot
    Recover,

    /// Download an image into staging
    Download {
        /// Source URL (http or https)
        url: String,

        /// Image is an asset (web UI) image rather than firmware
        #[arg(long)]
        asset: bool,

        /// Skip TLS certificate verification
        #[arg(long)]
        insecure: bool,

        /// Flash immediately once staged
        #[arg(long)]
        apply: bool,
    },

    /// Stage an image from a local file
    Upload {
        /// Image file
        file: PathBuf,

        /// Image is an asset (web UI) image rather than firmware
        #[arg(long)]
        asset: bool,

        /// Flash immediately once staged
        #[arg(long)]
        apply: bool,
    },

    /// Flash the staged image now
    Apply {
        /// Flash the staged asset image instead of firmware
        #[arg(long)]
        asset: bool,
    },

    /// Show slots and staging contents
    Status,

    /// Delete all staged files
    Clean,

    /// Write a manifest for a firmware image copied into staging by hand
    Prepare {
        /// Version the staged firmware carries
        #[arg(long = "version")]
        target_version: String,

        /// Apply even if this version is already running
        #[arg(long)]
        force: bool,
    },

    /// Write a default configuration file
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("otactl={log_level},ota_pipeline={log_level}").into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    match execute_command(&cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let code = error::exit_code(&e);
            if cli.json {
                output::print_error_json(&e, code);
            } else {
                output::print_error_human(&e);
            }
            ExitCode::from(code)
        }
    }
}

async fn execute_command(cli: &Cli) -> Result<()> {
    match &cli.command {
        Commands::Provision { image, slot_size } => {
            commands::provision(&cli.device_dir, image, *slot_size, cli.json).await
        }
        Commands::InitConfig { force } => {
            commands::init_config(&cli.config, *force, cli.json).await
        }
        Commands::Recover => commands::recover(&open_device(cli).await?, cli.json).await,
        Commands::Download {
            url,
            asset,
            insecure,
            apply,
        } => {
            let device = open_device(cli).await?;
            commands::download(&device, url, *asset, *insecure, *apply, cli.json).await
        }
        Commands::Upload { file, asset, apply } => {
            let device = open_device(cli).await?;
            commands::upload(&device, file, *asset, *apply, cli.json).await
        }
        Commands::Apply { asset } => {
            commands::apply(&open_device(cli).await?, *asset, cli.json).await
        }
        Commands::Status => commands::status(&open_device(cli).await?, cli.json).await,
        Commands::Clean => commands::clean(&open_device(cli).await?, cli.json).await,
        Commands::Prepare {
            target_version,
            force,
        } => {
            let device = open_device(cli).await?;
            commands::prepare(&device, target_version, *force, cli.json).await
        }
    }
}

async fn open_device(cli: &Cli) -> Result<Device> {
    Device::open(&cli.config, &cli.device_dir).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    #[test]
    fn parse_defaults() -> TestResult {
        let cli = Cli::try_parse_from(["otactl", "status"])?;
        assert!(!cli.json);
        assert_eq!(cli.verbose, 0);
        assert_eq!(cli.config, PathBuf::from("otactl.json"));
        assert_eq!(cli.device_dir, PathBuf::from("device"));
        assert!(matches!(cli.command, Commands::Status));
        Ok(())
    }

    #[test]
    fn parse_global_flags_after_subcommand() -> TestResult {
        let cli = Cli::try_parse_from([
            "otactl",
            "recover",
            "--json",
            "-vv",
            "--device-dir",
            "/tmp/dev",
        ])?;
        assert!(cli.json);
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.device_dir, PathBuf::from("/tmp/dev"));
        assert!(matches!(cli.command, Commands::Recover));
        Ok(())
    }

    #[test]
    fn parse_download_flags() -> TestResult {
        let cli = Cli::try_parse_from([
            "otactl",
            "download",
            "https://updates.example.com/www.bin",
            "--asset",
            "--insecure",
        ])?;
        assert!(matches!(
            cli.command,
            Commands::Download {
                ref url,
                asset: true,
                insecure: true,
                apply: false,
            } if url == "https://updates.example.com/www.bin"
        ));
        Ok(())
    }

    #[test]
    fn parse_prepare_requires_version() -> TestResult {
        assert!(Cli::try_parse_from(["otactl", "prepare"]).is_err_and(|e| {
            e.kind() == clap::error::ErrorKind::MissingRequiredArgument
        }));

        let cli = Cli::try_parse_from(["otactl", "prepare", "--version", "1.3.0", "--force"])?;
        assert!(matches!(
            cli.command,
            Commands::Prepare { ref target_version, force: true } if target_version == "1.3.0"
        ));
        Ok(())
    }

    #[test]
    fn parse_provision_slot_size() -> TestResult {
        let cli = Cli::try_parse_from(["otactl", "provision", "fw.bin"])?;
        assert!(matches!(
            cli.command,
            Commands::Provision { slot_size: DEFAULT_SLOT_SIZE, .. }
        ));
        Ok(())
    }

    #[test]
    fn parse_rejects_unknown_subcommand() {
        assert!(Cli::try_parse_from(["otactl", "flash-everything"]).is_err_and(|e| {
            e.kind() == clap::error::ErrorKind::InvalidSubcommand
        }));
    }

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
