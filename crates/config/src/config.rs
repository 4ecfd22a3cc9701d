//! Core configuration structures and loading logic

use crate::schedule::ScheduleConfig;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Valid nice levels on Unix hosts
pub const NICE_RANGE: std::ops::RangeInclusive<i32> = -20..=19;

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Parsed values failed validation
    Invalid(ValidationError),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
            ConfigError::Invalid(e) => write!(f, "Invalid configuration: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<ValidationError> for ConfigError {
    fn from(e: ValidationError) -> Self {
        ConfigError::Invalid(e)
    }
}

/// A settings value that is out of its accepted domain
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    /// Percentage threshold outside [0, 100]
    ThresholdOutOfRange { field: &'static str, value: f32 },
    /// Nice level outside the platform range
    NiceLevelOutOfRange(i32),
    /// Time not in `HH:MM` form
    InvalidTime { field: &'static str, value: String },
    /// Weekday index outside 0-6
    InvalidWeekday(u8),
    /// Schedule enabled with no days selected
    EmptyDaySet,
    /// Timezone identifier could not be resolved
    UnknownTimezone(String),
    /// Concurrency limit of zero
    ZeroConcurrency,
    /// Interval that must be positive is zero
    ZeroInterval(&'static str),
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::ThresholdOutOfRange { field, value } => {
                write!(f, "{} must be within 0-100, got {}", field, value)
            }
            ValidationError::NiceLevelOutOfRange(level) => write!(
                f,
                "nice_level must be within {}..={}, got {}",
                NICE_RANGE.start(),
                NICE_RANGE.end(),
                level
            ),
            ValidationError::InvalidTime { field, value } => {
                write!(f, "{} must be HH:MM, got '{}'", field, value)
            }
            ValidationError::InvalidWeekday(day) => {
                write!(f, "weekday index must be within 0-6, got {}", day)
            }
            ValidationError::EmptyDaySet => {
                write!(f, "days_of_week must not be empty while the schedule is enabled")
            }
            ValidationError::UnknownTimezone(tz) => write!(f, "unknown timezone '{}'", tz),
            ValidationError::ZeroConcurrency => write!(f, "max_concurrent_jobs must be at least 1"),
            ValidationError::ZeroInterval(field) => write!(f, "{} must be greater than zero", field),
        }
    }
}

impl std::error::Error for ValidationError {}

/// Host resource limits used to throttle running jobs
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ThresholdConfig {
    /// Overall CPU percent above which jobs are paused
    #[serde(default = "default_cpu_threshold")]
    pub cpu_threshold: f32,
    /// Memory percent above which jobs are paused
    #[serde(default = "default_memory_threshold")]
    pub memory_threshold: f32,
    /// GPU utilization percent above which jobs are paused
    #[serde(default = "default_gpu_threshold")]
    pub gpu_threshold: f32,
    /// Scheduling priority applied to the transcoder at start
    #[serde(default = "default_nice_level")]
    pub nice_level: i32,
    /// Master switch for threshold-driven pause/resume
    #[serde(default = "default_enable_throttling")]
    pub enable_throttling: bool,
}

fn default_cpu_threshold() -> f32 {
    80.0
}

fn default_memory_threshold() -> f32 {
    85.0
}

fn default_gpu_threshold() -> f32 {
    90.0
}

fn default_nice_level() -> i32 {
    10
}

fn default_enable_throttling() -> bool {
    true
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            cpu_threshold: default_cpu_threshold(),
            memory_threshold: default_memory_threshold(),
            gpu_threshold: default_gpu_threshold(),
            nice_level: default_nice_level(),
            enable_throttling: default_enable_throttling(),
        }
    }
}

impl ThresholdConfig {
    /// Check percentages lie in [0, 100] and the nice level is platform-valid
    pub fn validate(&self) -> Result<(), ValidationError> {
        for (field, value) in [
            ("cpu_threshold", self.cpu_threshold),
            ("memory_threshold", self.memory_threshold),
            ("gpu_threshold", self.gpu_threshold),
        ] {
            if !(0.0..=100.0).contains(&value) {
                return Err(ValidationError::ThresholdOutOfRange { field, value });
            }
        }
        if !NICE_RANGE.contains(&self.nice_level) {
            return Err(ValidationError::NiceLevelOutOfRange(self.nice_level));
        }
        Ok(())
    }
}

/// Encoder pool configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PoolConfig {
    /// Maximum number of jobs in starting/processing/paused at once
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: u32,
    /// Directory for persisted job records (in-memory store if None)
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
}

fn default_max_concurrent_jobs() -> u32 {
    1
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: default_max_concurrent_jobs(),
            state_dir: None,
        }
    }
}

/// Polling intervals and timeouts
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimingConfig {
    /// Per-job monitor loop interval
    #[serde(default = "default_monitor_interval_secs")]
    pub monitor_interval_secs: u64,
    /// Scheduler tick interval
    #[serde(default = "default_schedule_tick_secs")]
    pub schedule_tick_secs: u64,
    /// Pool admission tick interval
    #[serde(default = "default_admission_interval_secs")]
    pub admission_interval_secs: u64,
    /// Grace period between terminate and forced kill
    #[serde(default = "default_cancel_grace_secs")]
    pub cancel_grace_secs: u64,
    /// Upper bound on a single host sample
    #[serde(default = "default_sample_timeout_ms")]
    pub sample_timeout_ms: u64,
    /// Minimum time between throttle flips (0 disables hysteresis)
    #[serde(default)]
    pub min_dwell_secs: u64,
}

fn default_monitor_interval_secs() -> u64 {
    5
}

fn default_schedule_tick_secs() -> u64 {
    60
}

fn default_admission_interval_secs() -> u64 {
    2
}

fn default_cancel_grace_secs() -> u64 {
    10
}

fn default_sample_timeout_ms() -> u64 {
    2000
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            monitor_interval_secs: default_monitor_interval_secs(),
            schedule_tick_secs: default_schedule_tick_secs(),
            admission_interval_secs: default_admission_interval_secs(),
            cancel_grace_secs: default_cancel_grace_secs(),
            sample_timeout_ms: default_sample_timeout_ms(),
            min_dwell_secs: 0,
        }
    }
}

impl TimingConfig {
    fn validate(&self) -> Result<(), ValidationError> {
        for (field, value) in [
            ("monitor_interval_secs", self.monitor_interval_secs),
            ("schedule_tick_secs", self.schedule_tick_secs),
            ("admission_interval_secs", self.admission_interval_secs),
            ("cancel_grace_secs", self.cancel_grace_secs),
            ("sample_timeout_ms", self.sample_timeout_ms),
        ] {
            if value == 0 {
                return Err(ValidationError::ZeroInterval(field));
            }
        }
        Ok(())
    }
}

/// External transcoder invocation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TranscoderConfig {
    /// Transcoder executable (name on PATH or absolute path)
    #[serde(default = "default_binary")]
    pub binary: String,
    /// Argument template; `{input}`, `{output}` are substituted and a bare
    /// `{profile_args}` element expands to the profile's arguments
    #[serde(default = "default_args")]
    pub args: Vec<String>,
    /// Argument used by the startup availability check
    #[serde(default = "default_version_arg")]
    pub version_arg: String,
    /// Output directory (next to the source if None)
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
    /// Output container extension
    #[serde(default = "default_output_extension")]
    pub output_extension: String,
}

fn default_binary() -> String {
    "ffmpeg".to_string()
}

fn default_args() -> Vec<String> {
    [
        "-hide_banner",
        "-nostdin",
        "-nostats",
        "-y",
        "-progress",
        "pipe:1",
        "-i",
        "{input}",
        "{profile_args}",
        "{output}",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_version_arg() -> String {
    "-version".to_string()
}

fn default_output_extension() -> String {
    "mkv".to_string()
}

impl Default for TranscoderConfig {
    fn default() -> Self {
        Self {
            binary: default_binary(),
            args: default_args(),
            version_arg: default_version_arg(),
            output_dir: None,
            output_extension: default_output_extension(),
        }
    }
}

/// Read-only status endpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusConfig {
    #[serde(default = "default_status_enabled")]
    pub enabled: bool,
    #[serde(default = "default_status_bind")]
    pub bind: String,
}

fn default_status_enabled() -> bool {
    true
}

fn default_status_bind() -> String {
    "127.0.0.1:7878".to_string()
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            enabled: default_status_enabled(),
            bind: default_status_bind(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub resources: ThresholdConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub transcoder: TranscoderConfig,
    #[serde(default)]
    pub status: StatusConfig,
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the config.toml file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - ORCH_CPU_THRESHOLD -> resources.cpu_threshold
    /// - ORCH_MEMORY_THRESHOLD -> resources.memory_threshold
    /// - ORCH_GPU_THRESHOLD -> resources.gpu_threshold
    /// - ORCH_NICE_LEVEL -> resources.nice_level
    /// - ORCH_ENABLE_THROTTLING -> resources.enable_throttling
    /// - ORCH_MAX_CONCURRENT_JOBS -> pool.max_concurrent_jobs
    /// - ORCH_TRANSCODER_BINARY -> transcoder.binary
    pub fn apply_env_overrides(&mut self) {
        if let Some(v) = env_parse::<f32>("ORCH_CPU_THRESHOLD") {
            self.resources.cpu_threshold = v;
        }
        if let Some(v) = env_parse::<f32>("ORCH_MEMORY_THRESHOLD") {
            self.resources.memory_threshold = v;
        }
        if let Some(v) = env_parse::<f32>("ORCH_GPU_THRESHOLD") {
            self.resources.gpu_threshold = v;
        }
        if let Some(v) = env_parse::<i32>("ORCH_NICE_LEVEL") {
            self.resources.nice_level = v;
        }

        if let Ok(val) = env::var("ORCH_ENABLE_THROTTLING") {
            // Accept "true", "1", "yes" as true; "false", "0", "no" as false
            match val.to_lowercase().as_str() {
                "true" | "1" | "yes" => self.resources.enable_throttling = true,
                "false" | "0" | "no" => self.resources.enable_throttling = false,
                _ => {} // Invalid value, keep existing
            }
        }

        if let Some(v) = env_parse::<u32>("ORCH_MAX_CONCURRENT_JOBS") {
            self.pool.max_concurrent_jobs = v;
        }

        if let Ok(val) = env::var("ORCH_TRANSCODER_BINARY") {
            if !val.trim().is_empty() {
                self.transcoder.binary = val;
            }
        }
    }

    /// Validate every section
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.resources.validate()?;
        self.schedule.validate()?;
        if self.pool.max_concurrent_jobs == 0 {
            return Err(ValidationError::ZeroConcurrency);
        }
        self.timing.validate()
    }

    /// Load configuration from file, apply environment overrides and validate
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|val| val.trim().parse::<T>().ok())
}
