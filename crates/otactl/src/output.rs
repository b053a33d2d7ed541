//! Output formatting for CLI responses

use anyhow::Error;
use colored::*;
use ota_pipeline::{
    AcquisitionReport, Applied, AssetFlash, AssetRecovery, CommitReport, Manifest,
    RecoveryOutcome, SlotInfo, SlotState, StagingStatus,
};
use serde::Serialize;
use serde_json::json;

fn print_json(value: &serde_json::Value) {
    match serde_json::to_string_pretty(value) {
        Ok(s) => println!("{}", s),
        Err(e) => eprintln!("Failed to format output as JSON: {}", e),
    }
}

fn print_success_json<T: Serialize>(key: &str, value: &T) {
    print_json(&json!({
        "success": true,
        key: value,
    }));
}

/// Print error in JSON format
pub fn print_error_json(error: &Error, exit_code: u8) {
    print_json(&json!({
        "success": false,
        "error": {
            "message": error.to_string(),
            "exit_code": exit_code,
        }
    }));
}

/// Print error in human-readable format
pub fn print_error_human(error: &Error) {
    eprintln!("{} {}", "Error:".red().bold(), error);

    let mut source = error.source();
    while let Some(err) = source {
        eprintln!("  {} {}", "Caused by:".yellow(), err);
        source = err.source();
    }
}

/// Print a plain success message
pub fn print_success(message: &str, json: bool) {
    if json {
        print_json(&json!({ "success": true, "message": message }));
    } else {
        println!("{} {}", "✓".green(), message);
    }
}

/// Print the result of a boot-time recovery check
pub fn print_recovery(outcome: &RecoveryOutcome, json: bool) {
    if json {
        print_success_json("recovery", outcome);
        return;
    }

    match outcome {
        RecoveryOutcome::NothingStaged => println!("{}", "No staged update".dimmed()),
        RecoveryOutcome::UpToDate { version } => {
            println!("{} v{} already running", "✓".green(), version.bold());
        }
        RecoveryOutcome::Applied(summary) => {
            println!("{}", "Recovery applied".green().bold());
            print_commit(&summary.firmware);
            match &summary.asset {
                AssetRecovery::NotStaged => {}
                AssetRecovery::Done(asset) => print_asset(asset),
                AssetRecovery::Failed(reason) => {
                    println!("  {} {}", "Asset:".yellow(), reason);
                }
            }
            if summary.cleaned {
                println!("  Staged files removed");
            }
        }
    }
}

/// Print a staged download or upload
pub fn print_acquisition(report: &AcquisitionReport, json: bool) {
    if json {
        print_success_json("report", report);
        return;
    }

    println!(
        "{} Staged {} ({} bytes)",
        "✓".green(),
        report.kind.to_string().bold(),
        report.bytes
    );
    if let Some(version) = &report.version {
        println!("  Version: {}", version);
    }
    if let Some(manifest) = &report.manifest {
        println!(
            "  Manifest: v{}{}",
            manifest.target_version,
            if manifest.force { " (forced)" } else { "" }
        );
    }
    match &report.applied {
        Some(Applied::Firmware(commit)) => print_commit(commit),
        Some(Applied::Asset(asset)) => print_asset(asset),
        None => {}
    }
}

/// Print a firmware commit
pub fn print_commit_report(report: &CommitReport, json: bool) {
    if json {
        print_success_json("commit", report);
    } else {
        print_commit(report);
    }
}

/// Print an asset flash
pub fn print_asset_report(report: &AssetFlash, json: bool) {
    if json {
        print_success_json("asset", report);
    } else {
        print_asset(report);
    }
}

/// Print a freshly written manifest
pub fn print_manifest(manifest: &Manifest, json: bool) {
    if json {
        print_success_json("manifest", manifest);
        return;
    }

    println!("{} Manifest written", "✓".green());
    print_manifest_fields(manifest);
}

/// Print staging and slot status
pub fn print_status(staging: &StagingStatus, slots: &[SlotInfo], json: bool) {
    if json {
        print_json(&json!({
            "success": true,
            "staging": staging,
            "slots": slots,
        }));
        return;
    }

    println!("{}", "Slots:".bold());
    for info in slots {
        let marker = if info.running {
            "●".green()
        } else {
            "○".dimmed()
        };
        let state = match &info.state {
            SlotState::Empty => "empty".dimmed().to_string(),
            SlotState::Writing => "writing".yellow().to_string(),
            SlotState::Finalized { size, .. } => format!("{} bytes", size),
        };
        println!(
            "  {} {} v{} [{}]{}",
            marker,
            info.slot,
            info.version.as_deref().unwrap_or("?"),
            state,
            if info.boot { " (boot)" } else { "" }
        );
    }

    println!("{} {}", "Staging:".bold(), staging.dir.display());
    print_staged_file("Firmware", staging.has_firmware, staging.firmware_size);
    if let Some(version) = &staging.firmware_version {
        println!("    Version: {}", version);
    }
    print_staged_file("Asset", staging.has_asset, staging.asset_size);
    match &staging.manifest {
        Some(manifest) => {
            println!("  Manifest:");
            print_manifest_fields(manifest);
        }
        None if staging.has_manifest => println!("  Manifest: {}", "unreadable".red()),
        None => println!("  Manifest: {}", "none".dimmed()),
    }
}

fn print_staged_file(label: &str, present: bool, size: Option<u64>) {
    match (present, size) {
        (true, Some(size)) => println!("  {}: {} bytes", label, size),
        (true, None) => println!("  {}: present", label),
        (false, _) => println!("  {}: {}", label, "none".dimmed()),
    }
}

fn print_manifest_fields(manifest: &Manifest) {
    println!("    Version: {}", manifest.target_version);
    println!("    Force: {}", manifest.force);
    println!("    Delete after apply: {}", manifest.delete_after_apply);
    if let Some(sha) = &manifest.firmware_sha256 {
        println!("    Firmware SHA-256: {}", sha.dimmed());
    }
    if let Some(sha) = &manifest.asset_sha256 {
        println!("    Asset SHA-256: {}", sha.dimmed());
    }
    if let Some(at) = manifest.staged_at {
        println!("    Staged: {}", at.format("%Y-%m-%d %H:%M:%S UTC"));
    }
}

fn print_commit(report: &CommitReport) {
    println!(
        "  Firmware v{} written to slot {} ({} bytes), was running {}",
        report.version.bold(),
        report.boot_slot,
        report.bytes_written,
        report.previous_slot
    );
}

fn print_asset(report: &AssetFlash) {
    match report {
        AssetFlash::Flashed { bytes_written } => {
            println!("  Asset region written ({} bytes)", bytes_written);
        }
        AssetFlash::SkippedNoRegion => {
            println!("  {}", "No asset region on this device, skipped".yellow());
        }
    }
}
