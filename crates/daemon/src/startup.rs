//! Startup checks
//!
//! Preflight checks run before the orchestrator accepts work:
//! - the transcoder runs `<binary> <version_arg>` successfully
//! - the output directory, when configured, exists or can be created

use crate::config::{Config, TranscoderConfig};
use std::process::Command;
use thiserror::Error;
use tracing::info;

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("Transcoder not available: {0}")]
    TranscoderUnavailable(String),

    #[error("Output directory unusable: {0}")]
    OutputDir(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// First non-empty line of a version banner, trimmed
pub fn version_banner(output: &str) -> Option<&str> {
    output.lines().map(str::trim).find(|line| !line.is_empty())
}

/// Check the transcoder by running `<binary> <version_arg>`
///
/// Returns the first line of its version banner (empty when it prints none).
pub fn check_transcoder_available(cfg: &TranscoderConfig) -> Result<String, StartupError> {
    let output = Command::new(&cfg.binary)
        .arg(&cfg.version_arg)
        .output()
        .map_err(|e| {
            StartupError::TranscoderUnavailable(format!(
                "{} {} failed; is it installed and in PATH? Error: {}",
                cfg.binary, cfg.version_arg, e
            ))
        })?;

    if !output.status.success() {
        return Err(StartupError::TranscoderUnavailable(format!(
            "{} {} exited with {}",
            cfg.binary, cfg.version_arg, output.status
        )));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(version_banner(&stdout).unwrap_or_default().to_string())
}

/// Make sure the configured output directory exists
pub fn check_output_dir(cfg: &TranscoderConfig) -> Result<(), StartupError> {
    let Some(dir) = &cfg.output_dir else {
        return Ok(());
    };

    std::fs::create_dir_all(dir)?;
    if !dir.is_dir() {
        return Err(StartupError::OutputDir(format!(
            "{} is not a directory",
            dir.display()
        )));
    }
    Ok(())
}

/// Run all startup checks in order
pub fn run_startup_checks(cfg: &Config) -> Result<(), StartupError> {
    let banner = check_transcoder_available(&cfg.transcoder)?;
    info!(binary = %cfg.transcoder.binary, version = %banner, "Transcoder available");
    check_output_dir(&cfg.transcoder)?;
    Ok(())
}
