//! Transcoder invocation
//!
//! Builds the external transcoder command from the configured argument
//! template and turns its `-progress` key/value output into a percentage.

use crate::config::TranscoderConfig;
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use thiserror::Error;
use tokio::process::Command;

/// Template element that expands to the profile's argument list
const PROFILE_ARGS_PLACEHOLDER: &str = "{profile_args}";
const INPUT_PLACEHOLDER: &str = "{input}";
const OUTPUT_PLACEHOLDER: &str = "{output}";

/// Error type for transcoder runs
#[derive(Debug, Error)]
pub enum TranscodeError {
    /// The transcoder could not be started
    #[error("Failed to spawn transcoder: {0}")]
    Spawn(#[from] std::io::Error),

    /// The transcoder exited with non-zero status
    #[error("Transcoder failed with exit code: {0}")]
    Failed(i32),

    /// The transcoder was terminated by a signal
    #[error("Transcoder was terminated by signal")]
    Terminated,
}

impl TranscodeError {
    /// Classify a non-successful exit status
    pub fn from_status(status: ExitStatus) -> Self {
        match status.code() {
            Some(code) => TranscodeError::Failed(code),
            None => TranscodeError::Terminated,
        }
    }
}

/// One file to transcode under a chosen profile
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueItem {
    /// Source media file
    pub source_path: PathBuf,
    /// Destination file written by the transcoder
    pub output_path: PathBuf,
    /// Profile name, informational
    pub profile: String,
    /// Arguments substituted for `{profile_args}`
    #[serde(default)]
    pub profile_args: Vec<String>,
    /// Source duration; progress stays at 0 until completion when unknown
    #[serde(default)]
    pub duration_secs: Option<f64>,
}

impl QueueItem {
    pub fn new(
        source_path: impl Into<PathBuf>,
        output_path: impl Into<PathBuf>,
        profile: impl Into<String>,
    ) -> Self {
        Self {
            source_path: source_path.into(),
            output_path: output_path.into(),
            profile: profile.into(),
            profile_args: Vec::new(),
            duration_secs: None,
        }
    }

    /// Item whose output path is derived from the transcoder configuration
    ///
    /// The output lands in `output_dir` (or next to the source) as
    /// `<stem>.<profile>.<extension>`.
    pub fn for_source(source: impl Into<PathBuf>, profile: &str, config: &TranscoderConfig) -> Self {
        let source = source.into();
        let output = derive_output_path(&source, profile, config);
        Self::new(source, output, profile)
    }

    pub fn with_profile_args(mut self, args: Vec<String>) -> Self {
        self.profile_args = args;
        self
    }

    pub fn with_duration(mut self, duration_secs: f64) -> Self {
        self.duration_secs = Some(duration_secs);
        self
    }
}

fn derive_output_path(source: &Path, profile: &str, config: &TranscoderConfig) -> PathBuf {
    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    let file_name = format!("{}.{}.{}", stem, profile, config.output_extension);

    match (&config.output_dir, source.parent()) {
        (Some(dir), _) => dir.join(file_name),
        (None, Some(parent)) => parent.join(file_name),
        (None, None) => PathBuf::from(file_name),
    }
}

/// Expand the argument template for one item
///
/// A template element equal to `{profile_args}` is replaced by the profile's
/// arguments; `{input}` and `{output}` are substituted wherever they appear.
pub fn expand_args(template: &[String], item: &QueueItem) -> Vec<OsString> {
    let mut args = Vec::with_capacity(template.len() + item.profile_args.len());

    for arg in template {
        match arg.as_str() {
            PROFILE_ARGS_PLACEHOLDER => args.extend(item.profile_args.iter().map(OsString::from)),
            INPUT_PLACEHOLDER => args.push(item.source_path.clone().into_os_string()),
            OUTPUT_PLACEHOLDER => args.push(item.output_path.clone().into_os_string()),
            other => {
                let expanded = other
                    .replace(INPUT_PLACEHOLDER, &item.source_path.to_string_lossy())
                    .replace(OUTPUT_PLACEHOLDER, &item.output_path.to_string_lossy());
                args.push(OsString::from(expanded));
            }
        }
    }

    args
}

/// Build the transcoder command for an item
///
/// The child gets a null stdin, a piped stdout carrying progress, a null
/// stderr, its own process group so signals reach helper processes, and is
/// killed if its handle is dropped.
pub fn build_transcode_command(config: &TranscoderConfig, item: &QueueItem) -> Command {
    let mut cmd = Command::new(&config.binary);
    cmd.args(expand_args(&config.args, item))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    #[cfg(unix)]
    cmd.process_group(0);

    cmd
}

/// Tracks percent complete from `-progress` output
///
/// Reported progress never decreases.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    duration_us: Option<f64>,
    percent: f32,
}

impl ProgressTracker {
    pub fn new(duration_secs: Option<f64>) -> Self {
        Self {
            duration_us: duration_secs
                .filter(|d| d.is_finite() && *d > 0.0)
                .map(|d| d * 1_000_000.0),
            percent: 0.0,
        }
    }

    pub fn percent(&self) -> f32 {
        self.percent
    }

    /// Feed one output line; returns the new percent when it advanced
    pub fn observe(&mut self, line: &str) -> Option<f32> {
        let (key, value) = line.trim().split_once('=')?;

        let candidate = match key.trim() {
            // Both keys carry microseconds
            "out_time_us" | "out_time_ms" => {
                let duration = self.duration_us?;
                let elapsed = value.trim().parse::<f64>().ok().filter(|v| *v >= 0.0)?;
                ((elapsed / duration) * 100.0).min(100.0) as f32
            }
            "progress" if value.trim() == "end" => 100.0,
            _ => return None,
        };

        self.advance_to(candidate)
    }

    /// Raise progress to `percent` if higher; returns the new value when it moved
    pub fn advance_to(&mut self, percent: f32) -> Option<f32> {
        if percent > self.percent {
            self.percent = percent.min(100.0);
            Some(self.percent)
        } else {
            None
        }
    }
}
