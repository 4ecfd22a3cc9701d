//! Resource monitor
//!
//! Samples host CPU, memory, GPU and disk I/O counters, and per-process usage
//! of the transcoder. GPU presence is probed once when the monitor is built.

use serde::{Deserialize, Serialize};
use std::process::Command;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use sysinfo::{
    Pid, ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, System,
    MINIMUM_CPU_UPDATE_INTERVAL,
};
use thiserror::Error;
use tracing::{debug, info};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;
const SECTOR_BYTES: u64 = 512;

/// Error type for sampling operations
#[derive(Debug, Error)]
pub enum SampleError {
    /// The sampled PID has exited; the owning job has most likely finished
    #[error("Process {0} not found")]
    ProcessNotFound(u32),

    /// A counter source could not be read
    #[error("Resource counters unavailable: {0}")]
    Unavailable(String),

    /// Sampling did not finish within the bound
    #[error("Sampling timed out after {0:?}")]
    Timeout(Duration),
}

/// Host memory usage
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MemoryMetrics {
    pub total_mb: u64,
    pub available_mb: u64,
    pub used_mb: u64,
    pub percent: f32,
}

/// GPU usage, reported only when a compatible GPU was detected at startup
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GpuMetrics {
    pub utilization_percent: f32,
    pub memory_used_mb: f64,
    pub temperature_c: Option<f32>,
    pub power_draw_w: Option<f32>,
}

/// Disk activity since the previous snapshot
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiskIoDelta {
    pub read_bytes: u64,
    pub write_bytes: u64,
    pub read_ops: u64,
    pub write_ops: u64,
}

/// Point-in-time view of host resource usage
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ResourceSnapshot {
    pub timestamp_unix_ms: i64,
    pub cpu_percent: f32,
    pub per_core_percent: Vec<f32>,
    pub memory: MemoryMetrics,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu: Option<GpuMetrics>,
    pub disk_io: DiskIoDelta,
}

/// Resource usage of a single process
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct ProcessUsage {
    pub cpu_percent: f32,
    pub memory_mb: f64,
}

/// Source of host and process samples
///
/// Implementations may block; async callers go through [`sample_with_timeout`].
pub trait ResourceSampler: Send + Sync {
    /// Sample the whole host
    fn sample(&self) -> Result<ResourceSnapshot, SampleError>;

    /// Sample a single process
    fn sample_process(&self, pid: u32) -> Result<ProcessUsage, SampleError>;
}

/// Shared handle to a sampler
pub type SharedSampler = Arc<dyn ResourceSampler>;

/// Take a host sample on the blocking pool, bounded by `timeout`
pub async fn sample_with_timeout(
    sampler: SharedSampler,
    timeout: Duration,
) -> Result<ResourceSnapshot, SampleError> {
    bounded(timeout, move || sampler.sample()).await
}

/// Take a process sample on the blocking pool, bounded by `timeout`
pub async fn sample_process_with_timeout(
    sampler: SharedSampler,
    pid: u32,
    timeout: Duration,
) -> Result<ProcessUsage, SampleError> {
    bounded(timeout, move || sampler.sample_process(pid)).await
}

async fn bounded<T, F>(timeout: Duration, f: F) -> Result<T, SampleError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, SampleError> + Send + 'static,
{
    match tokio::time::timeout(timeout, tokio::task::spawn_blocking(f)).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_err)) => Err(SampleError::Unavailable(format!(
            "sampling task failed: {}",
            join_err
        ))),
        Err(_) => Err(SampleError::Timeout(timeout)),
    }
}

/// Cumulative disk counters as read from the kernel
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiskCounters {
    pub read_bytes: u64,
    pub write_bytes: u64,
    pub read_ops: u64,
    pub write_ops: u64,
}

impl DiskCounters {
    /// Difference to an earlier reading; counter resets saturate at zero
    pub fn delta_since(&self, previous: &DiskCounters) -> DiskIoDelta {
        DiskIoDelta {
            read_bytes: self.read_bytes.saturating_sub(previous.read_bytes),
            write_bytes: self.write_bytes.saturating_sub(previous.write_bytes),
            read_ops: self.read_ops.saturating_sub(previous.read_ops),
            write_ops: self.write_ops.saturating_sub(previous.write_ops),
        }
    }
}

/// Host CPU usage as of one counter refresh
#[derive(Debug, Clone)]
struct CpuReading {
    taken: Instant,
    global: f32,
    per_core: Vec<f32>,
}

impl CpuReading {
    /// Too recent to refresh again; sysinfo needs a minimum window between refreshes
    fn is_fresh(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.taken) < MINIMUM_CPU_UPDATE_INTERVAL
    }
}

/// Production sampler backed by sysinfo, `/proc/diskstats` and `nvidia-smi`
///
/// Job ticks, admission checks and status requests share one monitor. CPU
/// counters are refreshed at most once per `MINIMUM_CPU_UPDATE_INTERVAL`;
/// callers in between get the last reading.
pub struct SystemMonitor {
    system: Mutex<System>,
    last_cpu: Mutex<Option<CpuReading>>,
    previous_disk: Mutex<Option<DiskCounters>>,
    gpu_detected: bool,
}

impl SystemMonitor {
    /// Build a monitor, probing for a GPU once
    pub fn new() -> Self {
        let gpu_detected = detect_gpu();
        info!(gpu_detected, "Resource monitor initialised");
        Self::with_gpu_detection(gpu_detected)
    }

    /// Build a monitor with a known GPU detection result
    pub fn with_gpu_detection(gpu_detected: bool) -> Self {
        let mut system = System::new();
        // Prime CPU counters so the first sample has a baseline
        system.refresh_cpu_usage();
        system.refresh_memory();

        Self {
            system: Mutex::new(system),
            last_cpu: Mutex::new(None),
            previous_disk: Mutex::new(None),
            gpu_detected,
        }
    }

    /// Whether a compatible GPU was found at construction
    pub fn gpu_detected(&self) -> bool {
        self.gpu_detected
    }

    fn cpu_reading(&self, system: &mut System, now: Instant) -> CpuReading {
        let mut last = self.last_cpu.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(reading) = last.as_ref().filter(|r| r.is_fresh(now)) {
            return reading.clone();
        }

        system.refresh_cpu_usage();
        let reading = CpuReading {
            taken: now,
            global: system.global_cpu_usage(),
            per_core: system.cpus().iter().map(|c| c.cpu_usage()).collect(),
        };
        *last = Some(reading.clone());
        reading
    }

    fn disk_delta(&self) -> DiskIoDelta {
        let current = read_disk_counters();
        let mut previous = self
            .previous_disk
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let delta = match (current, previous.as_ref()) {
            (Some(cur), Some(prev)) => cur.delta_since(prev),
            _ => DiskIoDelta::default(),
        };
        if current.is_some() {
            *previous = current;
        }
        delta
    }
}

impl Default for SystemMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceSampler for SystemMonitor {
    fn sample(&self) -> Result<ResourceSnapshot, SampleError> {
        let (cpu_percent, per_core_percent, memory) = {
            let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);
            let cpu = self.cpu_reading(&mut system, Instant::now());
            system.refresh_memory();

            let total = system.total_memory();
            if total == 0 {
                return Err(SampleError::Unavailable(
                    "memory counters report zero total".to_string(),
                ));
            }
            let used = system.used_memory();
            let memory = MemoryMetrics {
                total_mb: bytes_to_mb(total) as u64,
                available_mb: bytes_to_mb(system.available_memory()) as u64,
                used_mb: bytes_to_mb(used) as u64,
                percent: (used as f64 / total as f64 * 100.0) as f32,
            };
            (cpu.global, cpu.per_core, memory)
        };

        let gpu = if self.gpu_detected {
            match query_gpu() {
                Ok(gpu) => Some(gpu),
                Err(e) => {
                    debug!(error = %e, "GPU query failed, omitting GPU from sample");
                    None
                }
            }
        } else {
            None
        };

        Ok(ResourceSnapshot {
            timestamp_unix_ms: chrono::Utc::now().timestamp_millis(),
            cpu_percent,
            per_core_percent,
            memory,
            gpu,
            disk_io: self.disk_delta(),
        })
    }

    fn sample_process(&self, pid: u32) -> Result<ProcessUsage, SampleError> {
        let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);
        let sys_pid = Pid::from_u32(pid);
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[sys_pid]),
            ProcessRefreshKind::new().with_cpu().with_memory(),
        );

        match system.process(sys_pid) {
            Some(process) if process.status() != ProcessStatus::Zombie => Ok(ProcessUsage {
                cpu_percent: process.cpu_usage(),
                memory_mb: bytes_to_mb(process.memory()),
            }),
            _ => Err(SampleError::ProcessNotFound(pid)),
        }
    }
}

fn bytes_to_mb(bytes: u64) -> f64 {
    bytes as f64 / BYTES_PER_MB
}

/// Probe for an NVIDIA GPU via `nvidia-smi`
pub fn detect_gpu() -> bool {
    Command::new("nvidia-smi")
        .args(["--query-gpu=name", "--format=csv,noheader"])
        .output()
        .map(|o| o.status.success() && !String::from_utf8_lossy(&o.stdout).trim().is_empty())
        .unwrap_or(false)
}

fn query_gpu() -> Result<GpuMetrics, SampleError> {
    let output = Command::new("nvidia-smi")
        .args([
            "--query-gpu=utilization.gpu,memory.used,temperature.gpu,power.draw",
            "--format=csv,noheader,nounits",
        ])
        .output()
        .map_err(|e| SampleError::Unavailable(format!("nvidia-smi: {}", e)))?;

    if !output.status.success() {
        return Err(SampleError::Unavailable(format!(
            "nvidia-smi exited with status {}",
            output.status
        )));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    parse_nvidia_smi_gpu(&stdout)
        .ok_or_else(|| SampleError::Unavailable("unparseable nvidia-smi output".to_string()))
}

/// Parse `utilization.gpu, memory.used, temperature.gpu, power.draw` rows
///
/// With several GPUs the busiest one is reported. `[N/A]` temperature or
/// power readings become `None`.
pub fn parse_nvidia_smi_gpu(output: &str) -> Option<GpuMetrics> {
    output
        .lines()
        .filter_map(|line| {
            let mut fields = line.split(',').map(str::trim);
            let utilization_percent = fields.next()?.parse::<f32>().ok()?;
            let memory_used_mb = fields.next()?.parse::<f64>().ok()?;
            let temperature_c = fields.next().and_then(|v| v.parse::<f32>().ok());
            let power_draw_w = fields.next().and_then(|v| v.parse::<f32>().ok());
            Some(GpuMetrics {
                utilization_percent,
                memory_used_mb,
                temperature_c,
                power_draw_w,
            })
        })
        .max_by(|a, b| a.utilization_percent.total_cmp(&b.utilization_percent))
}

/// Sum `/proc/diskstats` counters over the devices accepted by `include`
pub fn parse_diskstats(content: &str, include: impl Fn(&str) -> bool) -> DiskCounters {
    let mut counters = DiskCounters::default();
    for line in content.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 10 || !include(fields[2]) {
            continue;
        }
        let field = |i: usize| fields[i].parse::<u64>().unwrap_or(0);
        counters.read_ops += field(3);
        counters.read_bytes += field(5) * SECTOR_BYTES;
        counters.write_ops += field(7);
        counters.write_bytes += field(9) * SECTOR_BYTES;
    }
    counters
}

#[cfg(target_os = "linux")]
fn read_disk_counters() -> Option<DiskCounters> {
    let content = std::fs::read_to_string("/proc/diskstats").ok()?;
    Some(parse_diskstats(&content, |name| {
        !name.starts_with("loop")
            && !name.starts_with("ram")
            && !name.starts_with("zram")
            && std::path::Path::new("/sys/block").join(name).exists()
    }))
}

#[cfg(not(target_os = "linux"))]
fn read_disk_counters() -> Option<DiskCounters> {
    None
}
